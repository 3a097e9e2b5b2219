use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use dicom::{
    core::{
        header::Header,
        value::{DataSetSequence, PrimitiveValue},
        DataElement, VR,
    },
    dicom_value,
    dictionary_std::tags,
    object::{
        open_file, FileDicomObject, FileMetaTable, FileMetaTableBuilder, InMemDicomObject,
        ReadError, Tag,
    },
};
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::{
    config::ProjectConfig,
    create_target_dir, element_trimmed,
    error::RejectionKind,
    hashdate::hash_date,
    normalized_tag,
    quarantine::{Quarantine, QuarantineKind},
    script::TagKeep,
    store::{CaptureOutcome, InstanceAttrs, PhiStore},
    vr_corrected_value,
};

/// DeidentificationMethod (0012,0063) stamped into every output.
pub const DEIDENTIFICATION_METHOD: &str = "RSNA DICOM ANONYMIZER";

/// Reservation name of the project-owned private block in group 0x0013.
pub const PRIVATE_BLOCK_NAME: &str = "RSNA";

/// DeidentificationMethodCodeSequence (0012,0064) items.
const DEIDENTIFICATION_METHODS: [(&str, &str); 3] = [
    ("113100", "Basic Application Confidentiality Profile"),
    (
        "113107",
        "Retain Longitudinal Temporal Information Modified Dates Option",
    ),
    ("113108", "Retain Patient Characteristics Option"),
];

/// Applies the rule script to one dataset at a time: captures PHI, scrubs
/// the element tree, stamps the de-identification audit trail and writes
/// the anonymized twin to the image store. Rejected items are routed to
/// quarantine; failures never escape a call.
pub struct Transformer {
    config: Arc<ProjectConfig>,
    tag_keep: Arc<TagKeep>,
    store: Arc<PhiStore>,
    quarantine: Quarantine,
    first_digit: Regex,
}

impl Transformer {
    pub fn new(config: Arc<ProjectConfig>, tag_keep: Arc<TagKeep>, store: Arc<PhiStore>) -> Self {
        let quarantine = Quarantine::new(config.quarantine_dir());
        Transformer {
            config,
            tag_keep,
            store,
            quarantine,
            first_digit: Regex::new(r"\d").expect("valid digit pattern"),
        }
    }

    pub fn store(&self) -> &Arc<PhiStore> {
        &self.store
    }

    /// Synchronous single-file entry: read, validate, de-duplicate, then
    /// anonymize. File-level rejects are copied (never moved) into the
    /// matching quarantine subtree.
    pub fn process_file(&self, path: &Path) -> Result<(), RejectionKind> {
        let obj = match open_file(path) {
            Ok(obj) => obj,
            Err(e) => {
                let kind = classify_read_error(&e);
                warn!("Can't read {}: {}", path.display(), e);
                if let Some(qkind) = QuarantineKind::from_rejection(kind) {
                    self.reject_file(qkind, path);
                }
                return Err(kind);
            }
        };
        let attrs = InstanceAttrs::from_object(&obj);
        if let Err(kind) = self.classify(&attrs) {
            match QuarantineKind::from_rejection(kind) {
                Some(qkind) => {
                    if let Err(e) = self.quarantine.copy_file_with_ids(qkind, path, &attrs) {
                        error!("Critical: can't copy file to quarantine: {e:#}");
                    }
                    self.store.increment_quarantined();
                }
                None => info!(
                    "Instance already stored: {}/{}/{}",
                    attrs.patient_id, attrs.study_uid, attrs.sop_instance_uid
                ),
            }
            return Err(kind);
        }
        self.anonymize(&path.display().to_string(), obj).map(|_| ())
    }

    /// Asynchronous-entry counterpart for datasets received in memory.
    /// Rejects are written verbatim into quarantine since there is no
    /// source file to copy.
    pub fn process_dataset(
        &self,
        source: &str,
        obj: FileDicomObject<InMemDicomObject>,
    ) -> Result<(), RejectionKind> {
        let attrs = InstanceAttrs::from_object(&obj);
        if let Err(kind) = self.classify(&attrs) {
            match QuarantineKind::from_rejection(kind) {
                Some(qkind) => self.reject_object(qkind, &obj),
                None => info!(
                    "Instance already stored: {}/{}/{}",
                    attrs.patient_id, attrs.study_uid, attrs.sop_instance_uid
                ),
            }
            return Err(kind);
        }
        self.anonymize(source, obj).map(|_| ())
    }

    /// Transform one validated dataset into its de-identified twin.
    /// Returns the path of the stored output.
    pub fn anonymize(
        &self,
        source: &str,
        obj: FileDicomObject<InMemDicomObject>,
    ) -> Result<PathBuf, RejectionKind> {
        let attrs = InstanceAttrs::from_object(&obj);
        let transfer_syntax = obj.meta().transfer_syntax().trim_end_matches('\0').to_string();
        let original_meta = obj.meta().clone();
        let mut ds = obj.into_inner();

        let phi_patient_id = attrs.patient_id.trim().to_string();
        let (date_delta, _) = hash_date(&attrs.study_date, &phi_patient_id);

        let capture = match self.store.capture_phi(source, &attrs, date_delta) {
            Ok(capture) => capture,
            Err(e) => {
                warn!("PHI capture failed for {source}: {e}");
                self.reject_inner(QuarantineKind::CapturePhiError, ds, &original_meta);
                return Err(RejectionKind::CapturePhiError);
            }
        };

        remove_private_groups(&mut ds);
        self.walk(&mut ds, &phi_patient_id, &capture);
        self.stamp_deidentification(&mut ds, &capture.anon_patient_id);

        // Output path is a function of the anonymized identifiers.
        let anon_sop = element_trimmed(&ds, tags::SOP_INSTANCE_UID);
        let out_dir = self
            .config
            .images_dir()
            .join(&capture.anon_patient_id)
            .join(element_trimmed(&ds, tags::STUDY_INSTANCE_UID))
            .join(element_trimmed(&ds, tags::SERIES_INSTANCE_UID));

        let meta = FileMetaTableBuilder::new()
            .transfer_syntax(transfer_syntax.as_str())
            .media_storage_sop_class_uid(attrs.sop_class_uid.as_str())
            .media_storage_sop_instance_uid(anon_sop.as_str())
            .build();
        let meta = match meta {
            Ok(meta) => meta,
            Err(e) => {
                error!("Can't build output meta for {source}: {e}");
                return self.storage_failure(&attrs, ds, &original_meta);
            }
        };
        if let Err(e) = create_target_dir(&out_dir) {
            error!("Can't create {}: {e:#}", out_dir.display());
            return self.storage_failure(&attrs, ds, &original_meta);
        }

        let out_path = out_dir.join(format!("{anon_sop}.dcm"));
        let anonymized = ds.with_exact_meta(meta);
        if let Err(e) = anonymized.write_to_file(&out_path) {
            error!("Can't write {}: {e}", out_path.display());
            self.store.remove_uid(&attrs.sop_instance_uid);
            self.reject_object(QuarantineKind::StorageError, &anonymized);
            return Err(RejectionKind::StorageError);
        }
        debug!("ANON STORE: {source} => {}", out_path.display());
        Ok(out_path)
    }

    /// Roll back the UID minted for this instance (other PHI for the
    /// patient is retained) and quarantine the dataset as a storage error.
    fn storage_failure(
        &self,
        attrs: &InstanceAttrs,
        ds: InMemDicomObject,
        original_meta: &FileMetaTable,
    ) -> Result<PathBuf, RejectionKind> {
        self.store.remove_uid(&attrs.sop_instance_uid);
        self.reject_inner(QuarantineKind::StorageError, ds, original_meta);
        Err(RejectionKind::StorageError)
    }

    /// Validation ladder shared by both entry points.
    fn classify(&self, attrs: &InstanceAttrs) -> Result<(), RejectionKind> {
        let missing = attrs.missing_required();
        if !missing.is_empty() {
            warn!("Dataset missing required attributes: {missing:?}");
            return Err(RejectionKind::MissingAttributes);
        }
        if self.store.instance_received(&attrs.sop_instance_uid) {
            return Err(RejectionKind::AlreadyStored);
        }
        if !self.config.accepts_storage_class(&attrs.sop_class_uid) {
            warn!("Storage class {} not accepted", attrs.sop_class_uid);
            return Err(RejectionKind::InvalidStorageClass);
        }
        Ok(())
    }

    /// Depth-first walk over every element, recursing into sequence items.
    /// Tags absent from the keep table are deleted; kept tags get their
    /// operation applied.
    fn walk(&self, ds: &mut InMemDicomObject, phi_patient_id: &str, capture: &CaptureOutcome) {
        let headers: Vec<(Tag, VR)> = (&*ds).into_iter().map(|e| (e.tag(), e.vr())).collect();
        for (tag, vr) in headers {
            let key = normalized_tag(tag);
            match self.tag_keep.get(&key) {
                None => {
                    ds.remove_element(tag);
                }
                Some(op) => {
                    if vr == VR::SQ {
                        self.walk_sequence(ds, tag, phi_patient_id, capture);
                    } else {
                        self.apply_operation(ds, tag, vr, op, phi_patient_id, capture);
                    }
                }
            }
        }
    }

    fn walk_sequence(
        &self,
        ds: &mut InMemDicomObject,
        tag: Tag,
        phi_patient_id: &str,
        capture: &CaptureOutcome,
    ) {
        let items: Vec<InMemDicomObject> = ds
            .element(tag)
            .ok()
            .and_then(|e| e.items().map(|items| items.to_vec()))
            .unwrap_or_default();
        let mut rebuilt = Vec::with_capacity(items.len());
        for mut item in items {
            self.walk(&mut item, phi_patient_id, capture);
            rebuilt.push(item);
        }
        ds.put(DataElement::new(tag, VR::SQ, DataSetSequence::from(rebuilt)));
    }

    fn apply_operation(
        &self,
        ds: &mut InMemDicomObject,
        tag: Tag,
        vr: VR,
        op: &str,
        phi_patient_id: &str,
        capture: &CaptureOutcome,
    ) {
        if op.is_empty() {
            return;
        }
        if op.contains("@empty") {
            ds.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
        } else if op.contains("uid") {
            let value = element_trimmed(ds, tag);
            if value.is_empty() {
                return;
            }
            let anon_uid = self.store.alloc_anon_uid(&value);
            ds.put(DataElement::new(tag, vr, vr_corrected_value(vr, &anon_uid)));
        } else if op.contains("ptid") {
            ds.put(DataElement::new(
                tag,
                vr,
                vr_corrected_value(vr, &capture.anon_patient_id),
            ));
        } else if op.contains("acc") {
            let value = element_trimmed(ds, tag);
            if value.is_empty() {
                return;
            }
            let anon_acc = self.store.alloc_anon_accession(&value);
            ds.put(DataElement::new(tag, vr, vr_corrected_value(vr, &anon_acc)));
        } else if op.contains("@hashdate") {
            let value = element_trimmed(ds, tag);
            let (_, anon_date) = hash_date(&value, phi_patient_id);
            ds.put(DataElement::new(tag, vr, vr_corrected_value(vr, &anon_date)));
        } else if op.contains("@round") {
            let value = element_trimmed(ds, tag);
            if value.is_empty() {
                return;
            }
            let Some(width) = self.round_width(op) else {
                warn!("Invalid round operation {op:?}, keeping value unchanged");
                return;
            };
            match round_age(&value, width) {
                Some(rounded) => {
                    ds.put(DataElement::new(tag, vr, vr_corrected_value(vr, &rounded)));
                }
                None => warn!("Invalid age string {value:?}, keeping value unchanged"),
            }
        } else {
            debug!("Unrecognized operation {op:?} for tag {tag}, keeping value");
        }
    }

    /// First decimal digit of the operand, e.g. `@round(age,5)` yields 5.
    fn round_width(&self, op: &str) -> Option<u32> {
        let operand = op.replace("@round", "");
        self.first_digit
            .find(&operand)
            .and_then(|m| m.as_str().parse().ok())
            .filter(|w| *w > 0)
    }

    /// Mandatory post-walk elements: the de-identification audit trail,
    /// the project private block and the forced pseudonymous identity.
    fn stamp_deidentification(&self, ds: &mut InMemDicomObject, anon_patient_id: &str) {
        ds.put(DataElement::new(
            tags::PATIENT_IDENTITY_REMOVED,
            VR::CS,
            dicom_value!(Strs, ["YES".to_string()]),
        ));
        ds.put(DataElement::new(
            tags::DEIDENTIFICATION_METHOD,
            VR::LO,
            dicom_value!(Strs, [DEIDENTIFICATION_METHOD.to_string()]),
        ));
        let items: Vec<InMemDicomObject> = DEIDENTIFICATION_METHODS
            .iter()
            .map(|(code, meaning)| {
                InMemDicomObject::from_element_iter([
                    DataElement::new(
                        tags::CODE_VALUE,
                        VR::SH,
                        dicom_value!(Strs, [code.to_string()]),
                    ),
                    DataElement::new(
                        tags::CODING_SCHEME_DESIGNATOR,
                        VR::SH,
                        dicom_value!(Strs, ["DCM".to_string()]),
                    ),
                    DataElement::new(
                        tags::CODE_MEANING,
                        VR::LO,
                        dicom_value!(Strs, [meaning.to_string()]),
                    ),
                ])
            })
            .collect();
        ds.put(DataElement::new(
            tags::DEIDENTIFICATION_METHOD_CODE_SEQUENCE,
            VR::SQ,
            DataSetSequence::from(items),
        ));

        ds.put(DataElement::new(
            Tag(0x0013, 0x0010),
            VR::LO,
            dicom_value!(Strs, [PRIVATE_BLOCK_NAME.to_string()]),
        ));
        ds.put(DataElement::new(
            Tag(0x0013, 0x1001),
            VR::SH,
            dicom_value!(Strs, [self.config.site_id.clone()]),
        ));
        ds.put(DataElement::new(
            Tag(0x0013, 0x1002),
            VR::SH,
            dicom_value!(Strs, [self.config.trial_name.clone()]),
        ));
        ds.put(DataElement::new(
            Tag(0x0013, 0x1003),
            VR::SH,
            dicom_value!(Strs, [self.config.project_name.clone()]),
        ));

        ds.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Strs, [anon_patient_id.to_string()]),
        ));
        ds.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            dicom_value!(Strs, [anon_patient_id.to_string()]),
        ));
    }

    fn reject_inner(&self, kind: QuarantineKind, ds: InMemDicomObject, meta: &FileMetaTable) {
        let obj = ds.with_exact_meta(meta.clone());
        self.reject_object(kind, &obj);
    }

    fn reject_object(&self, kind: QuarantineKind, obj: &FileDicomObject<InMemDicomObject>) {
        if let Err(e) = self.quarantine.write_dataset(kind, obj) {
            error!("Critical: can't write incoming dataset to quarantine: {e:#}");
        }
        self.store.increment_quarantined();
    }

    fn reject_file(&self, kind: QuarantineKind, path: &Path) {
        if let Err(e) = self.quarantine.copy_file(kind, path) {
            error!("Critical: can't copy file to quarantine: {e:#}");
        }
        self.store.increment_quarantined();
    }
}

/// Strip every private-group element (odd group number) from the root
/// dataset. Private tags nested in sequence items fall to the walk, which
/// removes any tag absent from the keep table.
fn remove_private_groups(ds: &mut InMemDicomObject) {
    let private: Vec<Tag> = (&*ds)
        .into_iter()
        .map(|e| e.tag())
        .filter(|tag| tag.group() % 2 == 1)
        .collect();
    for tag in private {
        ds.remove_element(tag);
    }
}

fn classify_read_error(error: &ReadError) -> RejectionKind {
    match error {
        ReadError::ParseMetaDataSet { .. } | ReadError::ReadPreambleBytes { .. } => {
            RejectionKind::InvalidDicom
        }
        _ => RejectionKind::DicomReadError,
    }
}

/// Round the numeric part of a DICOM age string to the nearest multiple of
/// `width`, re-attach the unit letters, and left-pad a zero when the whole
/// formatted string has odd length.
fn round_age(age: &str, width: u32) -> Option<String> {
    let age = age.trim();
    if age.is_empty() {
        return Some(String::new());
    }
    let digits: String = age.chars().filter(char::is_ascii_digit).collect();
    let units: String = age.chars().filter(char::is_ascii_alphabetic).collect();
    let value: f64 = digits.parse().ok()?;
    let rounded = (value / f64::from(width)).round() as u64 * u64::from(width);
    let mut result = format!("{rounded}{units}");
    if result.len() % 2 != 0 {
        result.insert(0, '0');
    }
    Some(result)
}
