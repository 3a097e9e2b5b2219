use std::{
    collections::HashMap,
    fs::{self, File},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, RwLock,
    },
};

use dicom::{
    dictionary_std::tags,
    object::{FileDicomObject, InMemDicomObject, Tag},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::{PersistenceError, PhiError},
    hashdate::{format_anon_patient_id, format_anon_uid},
};

/// Snapshot file name inside the project's private directory.
pub const STORE_FILENAME: &str = "AnonymizerModel.json";

const MODEL_VERSION: u32 = 2;

/// One series of one study, counted by distinct SOP instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub series_uid: String,
    pub description: String,
    pub modality: String,
    pub instance_count: u32,
}

/// One study of one patient, carrying the original (PHI) identifiers and
/// the pseudonyms minted for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub study_uid: String,
    pub study_date: String,
    pub anon_date_delta: i64,
    pub accession_number: String,
    pub anon_accession_number: Option<String>,
    pub description: String,
    /// AE title + host, or the filesystem path the instance came from.
    pub source: String,
    /// Instance count promised by the external mover; 0 until set.
    #[serde(default)]
    pub target_instance_count: u32,
    pub series: Vec<Series>,
}

impl Study {
    pub fn stored_instance_count(&self) -> u32 {
        self.series.iter().map(|s| s.instance_count).sum()
    }
}

/// The protected health information retained for one patient, keyed in the
/// store by the anonymized patient ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub patient_id: String,
    pub patient_name: String,
    pub sex: Option<String>,
    pub dob: Option<String>,
    pub ethnic_group: Option<String>,
    pub studies: Vec<Study>,
}

/// Aggregate entity counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub patients: u64,
    pub studies: u64,
    pub series: u64,
    pub instances: u64,
    pub quarantined: u64,
}

/// Flat per-study projection used by the PHI CSV export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhiIndexRow {
    pub anon_patient_id: String,
    pub anon_patient_name: String,
    pub phi_patient_name: String,
    pub phi_patient_id: String,
    pub date_offset: i64,
    pub phi_study_date: String,
    pub anon_accession: String,
    pub phi_accession: String,
    pub anon_study_uid: String,
    pub phi_study_uid: String,
    pub num_series: usize,
    pub num_instances: u32,
}

/// The identifying attributes one instance contributes to the store.
#[derive(Debug, Clone, Default)]
pub struct InstanceAttrs {
    pub patient_id: String,
    pub patient_name: String,
    pub patient_sex: Option<String>,
    pub patient_birth_date: Option<String>,
    pub ethnic_group: Option<String>,
    pub study_uid: String,
    pub study_date: String,
    pub accession_number: String,
    pub study_description: String,
    pub series_uid: String,
    pub series_description: String,
    pub modality: String,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
}

impl InstanceAttrs {
    pub fn from_object(obj: &FileDicomObject<InMemDicomObject>) -> Self {
        let text = |tag: Tag| -> String {
            obj.element(tag)
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };
        let optional = |tag: Tag| -> Option<String> {
            let value = text(tag);
            (!value.is_empty()).then_some(value)
        };
        InstanceAttrs {
            patient_id: text(tags::PATIENT_ID),
            patient_name: text(tags::PATIENT_NAME),
            patient_sex: optional(tags::PATIENT_SEX),
            patient_birth_date: optional(tags::PATIENT_BIRTH_DATE),
            ethnic_group: optional(tags::ETHNIC_GROUP),
            study_uid: text(tags::STUDY_INSTANCE_UID),
            study_date: text(tags::STUDY_DATE),
            accession_number: text(tags::ACCESSION_NUMBER),
            study_description: text(tags::STUDY_DESCRIPTION),
            series_uid: text(tags::SERIES_INSTANCE_UID),
            series_description: text(tags::SERIES_DESCRIPTION),
            modality: text(tags::MODALITY),
            sop_class_uid: text(tags::SOP_CLASS_UID),
            sop_instance_uid: text(tags::SOP_INSTANCE_UID),
        }
    }

    /// Attribute names required before an instance may be accepted.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.sop_class_uid.is_empty() {
            missing.push("SOPClassUID");
        }
        if self.sop_instance_uid.is_empty() {
            missing.push("SOPInstanceUID");
        }
        if self.study_uid.is_empty() {
            missing.push("StudyInstanceUID");
        }
        if self.series_uid.is_empty() {
            missing.push("SeriesInstanceUID");
        }
        missing
    }
}

/// Result of a successful PHI capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    pub phi_patient_id: String,
    pub anon_patient_id: String,
    pub anon_accession: Option<String>,
    /// The SOP instance was seen before; nothing was mutated.
    pub already_stored: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreState {
    version: u32,
    site_id: String,
    uid_root: String,
    /// PHI PatientID -> anonymized patient ID ("" maps to the default).
    patient_id_lookup: HashMap<String, String>,
    /// Anonymized patient ID -> retained PHI.
    phi_lookup: HashMap<String, Patient>,
    /// Real UID -> anonymized UID, unique in both directions.
    uid_lookup: HashMap<String, String>,
    /// PHI accession number -> anonymized accession ordinal (as string).
    acc_no_lookup: HashMap<String, String>,
    // Allocation sequences are monotonic for the life of the store;
    // removal leaves gaps, ordinals are never reused.
    patient_seq: u64,
    uid_seq: u64,
    acc_seq: u64,
    patients: u64,
    studies: u64,
    series: u64,
    instances: u64,
    quarantined: u64,
}

impl StoreState {
    fn new(site_id: &str, uid_root: &str) -> Self {
        let default_anon_pt_id = format_anon_patient_id(site_id, 0);
        let mut patient_id_lookup = HashMap::new();
        patient_id_lookup.insert(String::new(), default_anon_pt_id.clone());
        let mut phi_lookup = HashMap::new();
        phi_lookup.insert(default_anon_pt_id, Patient::default());
        StoreState {
            version: MODEL_VERSION,
            site_id: site_id.to_string(),
            uid_root: uid_root.to_string(),
            patient_id_lookup,
            phi_lookup,
            uid_lookup: HashMap::new(),
            acc_no_lookup: HashMap::new(),
            patient_seq: 1,
            uid_seq: 0,
            acc_seq: 0,
            patients: 0,
            studies: 0,
            series: 0,
            instances: 0,
            quarantined: 0,
        }
    }

    fn alloc_uid(&mut self, phi_uid: &str) -> String {
        if let Some(existing) = self.uid_lookup.get(phi_uid) {
            return existing.clone();
        }
        self.uid_seq += 1;
        let anon_uid = format_anon_uid(&self.uid_root, &self.site_id, self.uid_seq);
        self.uid_lookup.insert(phi_uid.to_string(), anon_uid.clone());
        anon_uid
    }

    fn alloc_accession(&mut self, phi_acc: &str) -> String {
        if let Some(existing) = self.acc_no_lookup.get(phi_acc) {
            return existing.clone();
        }
        self.acc_seq += 1;
        let anon_acc = self.acc_seq.to_string();
        self.acc_no_lookup.insert(phi_acc.to_string(), anon_acc.clone());
        anon_acc
    }
}

/// Durable, thread-safe bidirectional mapping between real identifiers and
/// the pseudonyms minted for them, plus the retained PHI entity tree.
///
/// All mutating operations serialize on one writer lock; pseudonym ordinals
/// are therefore always distinct under concurrent capture.
#[derive(Debug)]
pub struct PhiStore {
    path: PathBuf,
    default_anon_pt_id: String,
    state: RwLock<StoreState>,
    dirty: AtomicBool,
    save_lock: Mutex<()>,
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".bak");
    path.with_file_name(name)
}

fn read_state(path: &Path) -> Result<StoreState, PersistenceError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(file)?)
}

impl PhiStore {
    /// Load the snapshot at `path`, falling back to its `.bak` companion,
    /// or start a fresh store when neither exists. Older snapshot versions
    /// are migrated in place and stamped with the current version.
    pub fn load_or_create(
        path: PathBuf,
        site_id: &str,
        uid_root: &str,
    ) -> Result<Self, PersistenceError> {
        let backup = backup_path(&path);
        let mut needs_save = false;
        let mut state = if path.exists() || backup.exists() {
            match read_state(&path) {
                Ok(state) => {
                    info!("PHI store loaded from {}", path.display());
                    state
                }
                Err(primary_err) => {
                    warn!(
                        "PHI store snapshot {} unreadable ({}), trying backup",
                        path.display(),
                        primary_err
                    );
                    let state = read_state(&backup)?;
                    warn!("PHI store recovered from backup {}", backup.display());
                    state
                }
            }
        } else {
            info!("Initializing new PHI store at {}", path.display());
            needs_save = true;
            StoreState::new(site_id, uid_root)
        };

        if state.version != MODEL_VERSION {
            info!(
                "PHI store version {} != {}, migrating",
                state.version, MODEL_VERSION
            );
            state.version = MODEL_VERSION;
            needs_save = true;
        }
        if state.site_id != site_id || state.uid_root != uid_root {
            warn!(
                "Project settings changed since the store was created \
                 (site_id {} / uid_root {}); keeping the stored values",
                state.site_id, state.uid_root
            );
        }

        let default_anon_pt_id = format_anon_patient_id(&state.site_id, 0);
        Ok(PhiStore {
            path,
            default_anon_pt_id,
            state: RwLock::new(state),
            dirty: AtomicBool::new(needs_save),
            save_lock: Mutex::new(()),
        })
    }

    pub fn default_anon_patient_id(&self) -> &str {
        &self.default_anon_pt_id
    }

    /// True once any mutation has happened since the last save.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clear and return the dirty flag; autosave calls this before saving.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Record the PHI of one instance: ensure the Patient, Study and Series
    /// exist, bump the instance count, and mint anonymized UIDs for the
    /// newly seen identifiers. Idempotent for a repeated SOPInstanceUID.
    pub fn capture_phi(
        &self,
        source: &str,
        attrs: &InstanceAttrs,
        date_delta: i64,
    ) -> Result<CaptureOutcome, PhiError> {
        let mut missing = Vec::new();
        if attrs.study_uid.is_empty() {
            missing.push("StudyInstanceUID");
        }
        if attrs.series_uid.is_empty() {
            missing.push("SeriesInstanceUID");
        }
        if attrs.sop_instance_uid.is_empty() {
            missing.push("SOPInstanceUID");
        }
        if !missing.is_empty() {
            return Err(PhiError::MissingRequired(missing));
        }

        let mut state = self.state.write().expect("PHI store lock poisoned");
        let phi_ptid = attrs.patient_id.trim().to_string();

        if state.uid_lookup.contains_key(&attrs.sop_instance_uid) {
            // Repeated instance: report prior state, mutate nothing.
            let anon_patient_id = state
                .patient_id_lookup
                .get(&phi_ptid)
                .cloned()
                .unwrap_or_else(|| self.default_anon_pt_id.clone());
            let anon_accession = state.acc_no_lookup.get(&attrs.accession_number).cloned();
            return Ok(CaptureOutcome {
                phi_patient_id: phi_ptid,
                anon_patient_id,
                anon_accession,
                already_stored: true,
            });
        }

        let new_study = !state.uid_lookup.contains_key(&attrs.study_uid);
        let anon_patient_id;
        let anon_accession;

        if new_study {
            anon_patient_id = match state.patient_id_lookup.get(&phi_ptid).cloned() {
                Some(anon) => {
                    if !state.phi_lookup.contains_key(&anon) {
                        return Err(PhiError::Inconsistent(format!(
                            "anon patient {anon} missing from phi lookup"
                        )));
                    }
                    anon
                }
                None => {
                    let anon = format_anon_patient_id(&state.site_id, state.patient_seq);
                    state.patient_seq += 1;
                    state.patient_id_lookup.insert(phi_ptid.clone(), anon.clone());
                    state.phi_lookup.insert(
                        anon.clone(),
                        Patient {
                            patient_id: phi_ptid.clone(),
                            patient_name: attrs.patient_name.clone(),
                            sex: attrs.patient_sex.clone(),
                            dob: attrs.patient_birth_date.clone(),
                            ethnic_group: attrs.ethnic_group.clone(),
                            studies: Vec::new(),
                        },
                    );
                    state.patients += 1;
                    anon
                }
            };

            anon_accession = if attrs.accession_number.is_empty() {
                None
            } else {
                Some(state.alloc_accession(&attrs.accession_number))
            };

            let study = Study {
                study_uid: attrs.study_uid.clone(),
                study_date: attrs.study_date.clone(),
                anon_date_delta: date_delta,
                accession_number: attrs.accession_number.clone(),
                anon_accession_number: anon_accession.clone(),
                description: attrs.study_description.clone(),
                source: source.to_string(),
                target_instance_count: 0,
                series: vec![Series {
                    series_uid: attrs.series_uid.clone(),
                    description: attrs.series_description.clone(),
                    modality: attrs.modality.clone(),
                    instance_count: 1,
                }],
            };
            let patient = state
                .phi_lookup
                .get_mut(&anon_patient_id)
                .expect("patient just ensured");
            patient.studies.push(study);

            state.alloc_uid(&attrs.study_uid);
            state.alloc_uid(&attrs.series_uid);
            state.alloc_uid(&attrs.sop_instance_uid);
            state.studies += 1;
            state.series += 1;
            state.instances += 1;
        } else {
            // Existing study: the patient and study rows must already be
            // present; anything else is a structural inconsistency.
            anon_patient_id = state
                .patient_id_lookup
                .get(&phi_ptid)
                .cloned()
                .ok_or_else(|| {
                    PhiError::Inconsistent(format!(
                        "patient of known study {} not found",
                        attrs.study_uid
                    ))
                })?;
            anon_accession = state.acc_no_lookup.get(&attrs.accession_number).cloned();

            let mut new_series = false;
            {
                let patient = state.phi_lookup.get_mut(&anon_patient_id).ok_or_else(|| {
                    PhiError::Inconsistent(format!(
                        "anon patient {anon_patient_id} missing from phi lookup"
                    ))
                })?;
                let study = patient
                    .studies
                    .iter_mut()
                    .find(|s| s.study_uid == attrs.study_uid)
                    .ok_or_else(|| {
                        PhiError::Inconsistent(format!(
                            "known study {} missing from patient record",
                            attrs.study_uid
                        ))
                    })?;
                match study
                    .series
                    .iter_mut()
                    .find(|s| s.series_uid == attrs.series_uid)
                {
                    Some(series) => series.instance_count += 1,
                    None => {
                        study.series.push(Series {
                            series_uid: attrs.series_uid.clone(),
                            description: attrs.series_description.clone(),
                            modality: attrs.modality.clone(),
                            instance_count: 1,
                        });
                        new_series = true;
                    }
                }
            }
            if new_series {
                state.alloc_uid(&attrs.series_uid);
                state.series += 1;
            }
            state.alloc_uid(&attrs.sop_instance_uid);
            state.instances += 1;
        }

        drop(state);
        self.mark_dirty();
        Ok(CaptureOutcome {
            phi_patient_id: phi_ptid,
            anon_patient_id,
            anon_accession,
            already_stored: false,
        })
    }

    /// The sole idempotency anchor: has this SOP instance been recorded?
    pub fn instance_received(&self, sop_instance_uid: &str) -> bool {
        let state = self.state.read().expect("PHI store lock poisoned");
        state.uid_lookup.contains_key(sop_instance_uid)
    }

    pub fn get_anon_uid(&self, phi_uid: &str) -> Option<String> {
        let state = self.state.read().expect("PHI store lock poisoned");
        state.uid_lookup.get(phi_uid).cloned()
    }

    pub fn set_anon_uid(&self, phi_uid: &str, anon_uid: &str) {
        let mut state = self.state.write().expect("PHI store lock poisoned");
        state
            .uid_lookup
            .insert(phi_uid.to_string(), anon_uid.to_string());
        drop(state);
        self.mark_dirty();
    }

    /// Look up or mint the anonymized UID for a real UID, in one writer
    /// critical section.
    pub fn alloc_anon_uid(&self, phi_uid: &str) -> String {
        let mut state = self.state.write().expect("PHI store lock poisoned");
        let anon_uid = state.alloc_uid(phi_uid);
        drop(state);
        self.mark_dirty();
        anon_uid
    }

    /// The ordinal the next minted UID would take.
    pub fn next_anon_uid(&self) -> u64 {
        let state = self.state.read().expect("PHI store lock poisoned");
        state.uid_seq + 1
    }

    pub fn remove_uid(&self, phi_uid: &str) {
        let mut state = self.state.write().expect("PHI store lock poisoned");
        if state.uid_lookup.remove(phi_uid).is_some() {
            drop(state);
            self.mark_dirty();
        }
    }

    pub fn uid_count(&self) -> usize {
        let state = self.state.read().expect("PHI store lock poisoned");
        state.uid_lookup.len()
    }

    pub fn get_anon_patient_id(&self, phi_patient_id: &str) -> Option<String> {
        let state = self.state.read().expect("PHI store lock poisoned");
        state.patient_id_lookup.get(phi_patient_id).cloned()
    }

    pub fn set_anon_patient_id(&self, phi_patient_id: &str, anon_patient_id: &str) {
        let mut state = self.state.write().expect("PHI store lock poisoned");
        state
            .patient_id_lookup
            .insert(phi_patient_id.to_string(), anon_patient_id.to_string());
        drop(state);
        self.mark_dirty();
    }

    pub fn get_anon_accession(&self, phi_acc: &str) -> Option<String> {
        let state = self.state.read().expect("PHI store lock poisoned");
        state.acc_no_lookup.get(phi_acc).cloned()
    }

    /// Look up or mint the anonymized accession ordinal for a real
    /// accession number.
    pub fn alloc_anon_accession(&self, phi_acc: &str) -> String {
        let mut state = self.state.write().expect("PHI store lock poisoned");
        let anon_acc = state.alloc_accession(phi_acc);
        drop(state);
        self.mark_dirty();
        anon_acc
    }

    /// Eagerly-loaded PHI of one patient, for export and review.
    pub fn get_phi(&self, anon_patient_id: &str) -> Option<Patient> {
        let state = self.state.read().expect("PHI store lock poisoned");
        state.phi_lookup.get(anon_patient_id).cloned()
    }

    /// Delete a study (by its anonymized study UID) and all its series;
    /// the patient goes with it when no studies remain.
    pub fn remove_phi(&self, anon_patient_id: &str, anon_study_uid: &str) -> bool {
        let mut state = self.state.write().expect("PHI store lock poisoned");

        let phi_study_uid = match state
            .uid_lookup
            .iter()
            .find(|(_, anon)| anon.as_str() == anon_study_uid)
            .map(|(phi, _)| phi.clone())
        {
            Some(uid) => uid,
            None => {
                warn!("anon study UID {anon_study_uid} not found in UID map");
                return false;
            }
        };

        let Some(patient) = state.phi_lookup.get_mut(anon_patient_id) else {
            warn!("anon patient {anon_patient_id} not found");
            return false;
        };
        let Some(index) = patient
            .studies
            .iter()
            .position(|s| s.study_uid == phi_study_uid)
        else {
            warn!("study {phi_study_uid} not recorded for patient {anon_patient_id}");
            return false;
        };

        let study = patient.studies.remove(index);
        let emptied = patient.studies.is_empty();
        state.studies -= 1;
        state.series -= study.series.len() as u64;
        state.instances -= u64::from(study.stored_instance_count());

        if emptied && anon_patient_id != self.default_anon_pt_id {
            if let Some(patient) = state.phi_lookup.remove(anon_patient_id) {
                state.patient_id_lookup.remove(&patient.patient_id);
                state.patients -= 1;
            }
        }

        drop(state);
        self.mark_dirty();
        true
    }

    pub fn get_totals(&self) -> Totals {
        let state = self.state.read().expect("PHI store lock poisoned");
        Totals {
            patients: state.patients,
            studies: state.studies,
            series: state.series,
            instances: state.instances,
            quarantined: state.quarantined,
        }
    }

    /// Quarantine events only ever accumulate.
    pub fn increment_quarantined(&self) {
        let mut state = self.state.write().expect("PHI store lock poisoned");
        state.quarantined += 1;
        drop(state);
        self.mark_dirty();
    }

    /// Instances stored so far for a study, by PHI identifiers.
    pub fn stored_instance_count(&self, phi_patient_id: &str, study_uid: &str) -> u32 {
        let state = self.state.read().expect("PHI store lock poisoned");
        state
            .patient_id_lookup
            .get(phi_patient_id.trim())
            .and_then(|anon| state.phi_lookup.get(anon))
            .and_then(|patient| patient.studies.iter().find(|s| s.study_uid == study_uid))
            .map(|study| study.stored_instance_count())
            .unwrap_or(0)
    }

    /// Difference between an external mover's promised count and what has
    /// been stored; records the target on the study for later
    /// `study_imported` checks.
    pub fn pending_instance_count(
        &self,
        phi_patient_id: &str,
        study_uid: &str,
        target_count: u32,
    ) -> u32 {
        let mut state = self.state.write().expect("PHI store lock poisoned");
        let Some(anon) = state.patient_id_lookup.get(phi_patient_id.trim()).cloned() else {
            return target_count;
        };
        let Some(study) = state
            .phi_lookup
            .get_mut(&anon)
            .and_then(|patient| patient.studies.iter_mut().find(|s| s.study_uid == study_uid))
        else {
            return target_count;
        };
        study.target_instance_count = target_count;
        let stored = study.stored_instance_count();
        drop(state);
        self.mark_dirty();
        target_count.saturating_sub(stored)
    }

    /// True once a study has received at least its promised instance count.
    pub fn study_imported(&self, phi_patient_id: &str, study_uid: &str) -> bool {
        let state = self.state.read().expect("PHI store lock poisoned");
        state
            .patient_id_lookup
            .get(phi_patient_id.trim())
            .and_then(|anon| state.phi_lookup.get(anon))
            .and_then(|patient| patient.studies.iter().find(|s| s.study_uid == study_uid))
            .map(|study| {
                study.target_instance_count > 0
                    && study.stored_instance_count() >= study.target_instance_count
            })
            .unwrap_or(false)
    }

    /// Flat per-study projection for the PHI CSV export, ordered by
    /// anonymized patient then anonymized study UID.
    pub fn phi_index(&self) -> Vec<PhiIndexRow> {
        let state = self.state.read().expect("PHI store lock poisoned");
        let mut rows: Vec<PhiIndexRow> = Vec::new();
        for (anon_patient_id, patient) in &state.phi_lookup {
            for study in &patient.studies {
                rows.push(PhiIndexRow {
                    anon_patient_id: anon_patient_id.clone(),
                    anon_patient_name: anon_patient_id.clone(),
                    phi_patient_name: patient.patient_name.clone(),
                    phi_patient_id: patient.patient_id.clone(),
                    date_offset: study.anon_date_delta,
                    phi_study_date: study.study_date.clone(),
                    anon_accession: study.anon_accession_number.clone().unwrap_or_default(),
                    phi_accession: study.accession_number.clone(),
                    anon_study_uid: state
                        .uid_lookup
                        .get(&study.study_uid)
                        .cloned()
                        .unwrap_or_default(),
                    phi_study_uid: study.study_uid.clone(),
                    num_series: study.series.len(),
                    num_instances: study.stored_instance_count(),
                });
            }
        }
        rows.sort_by(|a, b| {
            (&a.anon_patient_id, &a.anon_study_uid).cmp(&(&b.anon_patient_id, &b.anon_study_uid))
        });
        rows
    }

    /// Persist a snapshot: write to a temp file, fsync, rotate the current
    /// snapshot to `.bak`, then move the temp file into place. A crash at
    /// any point leaves a loadable snapshot on disk.
    pub fn save(&self) -> Result<(), PersistenceError> {
        let _guard = self.save_lock.lock().expect("save lock poisoned");
        let tmp = self.path.with_file_name(format!("{STORE_FILENAME}.tmp"));
        {
            let state = self.state.read().expect("PHI store lock poisoned");
            let file = File::create(&tmp)?;
            serde_json::to_writer(&file, &*state)?;
            file.sync_all()?;
        }
        if self.path.exists() {
            fs::rename(&self.path, backup_path(&self.path))?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!("PHI store saved to {}", self.path.display());
        Ok(())
    }
}
