//! End-to-end scenarios through the public engine API: synchronous file
//! ingest, the background pipeline, quarantine routing and PHI export.

use std::{fs, path::Path, path::PathBuf};

use dcmveil_rs::{Anonymizer, IngestItem, ProjectConfig, RejectionKind};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::{
    open_file, FileDicomObject, FileMetaTableBuilder, InMemDicomObject, Tag,
};
use walkdir::WalkDir;

const CT_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const MR_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";

const TEST_SCRIPT: &str = r#"<script>
  <e en="T" t="00080016" n="SOPClassUID"/>
  <e en="T" t="00080018" n="SOPInstanceUID">@hashuid(@UIDROOT,this)</e>
  <e en="T" t="00080020" n="StudyDate">@hashdate(this,PatientID)</e>
  <e en="T" t="00080050" n="AccessionNumber">@acc</e>
  <e en="T" t="00080060" n="Modality"/>
  <e en="T" t="00100010" n="PatientName">@ptid</e>
  <e en="T" t="00100020" n="PatientID">@ptid</e>
  <e en="T" t="00101010" n="PatientAge">@round(age,5)</e>
  <e en="T" t="0020000D" n="StudyInstanceUID">@hashuid(@UIDROOT,this)</e>
  <e en="T" t="0020000E" n="SeriesInstanceUID">@hashuid(@UIDROOT,this)</e>
</script>"#;

struct Fixture {
    _dir: tempfile::TempDir,
    config: ProjectConfig,
    source_dir: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let script_path = dir.path().join("script.xml");
        fs::write(&script_path, TEST_SCRIPT).expect("write script");
        let source_dir = dir.path().join("incoming");
        fs::create_dir_all(&source_dir).expect("source dir");
        let config = ProjectConfig {
            site_id: "999001".to_string(),
            uid_root: "9.9.9".to_string(),
            project_name: "TRIAL".to_string(),
            trial_name: String::new(),
            storage_dir: dir.path().join("storage"),
            script_path,
            accepted_storage_classes: vec![CT_STORAGE.to_string()],
            worker_count: 2,
            autosave_interval_secs: 30,
        };
        Fixture {
            _dir: dir,
            config,
            source_dir,
        }
    }

    fn engine(&self) -> Anonymizer {
        Anonymizer::new(self.config.clone()).expect("engine")
    }
}

struct TestInstance {
    patient_id: &'static str,
    patient_name: &'static str,
    study_date: &'static str,
    accession: &'static str,
    study_uid: &'static str,
    series_uid: &'static str,
    sop_uid: &'static str,
    sop_class: &'static str,
}

impl Default for TestInstance {
    fn default() -> Self {
        TestInstance {
            patient_id: "PHI-PATIENT-001",
            patient_name: "DOE^JANE^PHI",
            study_date: "20220101",
            accession: "ACCPHI123",
            study_uid: "1.2.999.1",
            series_uid: "1.2.999.1.1",
            sop_uid: "1.2.999.1.1.1",
            sop_class: CT_STORAGE,
        }
    }
}

fn str_element(tag: Tag, vr: VR, value: &str) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, vr, dicom_value!(Strs, [value.to_string()]))
}

fn build_object(instance: &TestInstance) -> FileDicomObject<InMemDicomObject> {
    let mut elements = vec![
        str_element(tags::SOP_INSTANCE_UID, VR::UI, instance.sop_uid),
        str_element(tags::STUDY_DATE, VR::DA, instance.study_date),
        str_element(tags::ACCESSION_NUMBER, VR::SH, instance.accession),
        str_element(tags::MODALITY, VR::CS, "CT"),
        str_element(tags::PATIENT_NAME, VR::PN, instance.patient_name),
        str_element(tags::PATIENT_ID, VR::LO, instance.patient_id),
        str_element(tags::PATIENT_AGE, VR::AS, "037Y"),
        str_element(tags::STUDY_INSTANCE_UID, VR::UI, instance.study_uid),
        str_element(tags::SERIES_INSTANCE_UID, VR::UI, instance.series_uid),
    ];
    if !instance.sop_class.is_empty() {
        elements.push(str_element(tags::SOP_CLASS_UID, VR::UI, instance.sop_class));
    }
    InMemDicomObject::from_element_iter(elements)
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax("1.2.840.10008.1.2.1")
                .media_storage_sop_class_uid(CT_STORAGE)
                .media_storage_sop_instance_uid(instance.sop_uid),
        )
        .expect("file meta")
}

fn write_instance(fixture: &Fixture, name: &str, instance: &TestInstance) -> PathBuf {
    let path = fixture.source_dir.join(name);
    build_object(instance).write_to_file(&path).expect("write instance");
    path
}

fn element_text(obj: &FileDicomObject<InMemDicomObject>, tag: Tag) -> String {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn stored_outputs(images_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(images_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

#[test]
fn blank_patient_id_maps_to_reserved_default() {
    let fixture = Fixture::new();
    let engine = fixture.engine();
    let instance = TestInstance {
        patient_id: "",
        study_uid: "1.2.3.A",
        series_uid: "1.2.3.A.1",
        sop_uid: "1.2.3.A.1.1",
        ..TestInstance::default()
    };
    let path = write_instance(&fixture, "blank.dcm", &instance);
    engine.anonymize_file(&path).expect("anonymize");

    let outputs = stored_outputs(&fixture.config.images_dir());
    assert_eq!(outputs.len(), 1);
    let output = open_file(&outputs[0]).expect("readable output");
    assert_eq!(element_text(&output, tags::PATIENT_ID), "999001-000000");
    assert_eq!(element_text(&output, tags::PATIENT_NAME), "999001-000000");
    // blank PatientID forces the epoch sentinel date
    assert_eq!(element_text(&output, tags::STUDY_DATE), "20000101");
    // study, series and instance mappings were minted
    assert_eq!(engine.store().uid_count(), 3);
    for phi_uid in ["1.2.3.A", "1.2.3.A.1", "1.2.3.A.1.1"] {
        let anon = engine.store().get_anon_uid(phi_uid).expect("mapped");
        assert!(anon.starts_with("9.9.9.999001."));
    }
    engine.stop();
}

#[test]
fn same_patient_keeps_one_pseudonym_across_studies() {
    let fixture = Fixture::new();
    let engine = fixture.engine();
    let first = TestInstance {
        patient_id: "P1",
        study_uid: "S1",
        series_uid: "S1.1",
        sop_uid: "S1.1.1",
        accession: "ACC-S1",
        ..TestInstance::default()
    };
    let second = TestInstance {
        patient_id: "P1",
        study_uid: "S2",
        series_uid: "S2.1",
        sop_uid: "S2.1.1",
        accession: "ACC-S2",
        ..TestInstance::default()
    };
    engine
        .anonymize_file(&write_instance(&fixture, "a.dcm", &first))
        .expect("first");
    engine
        .anonymize_file(&write_instance(&fixture, "b.dcm", &second))
        .expect("second");

    let totals = engine.totals();
    assert_eq!(totals.patients, 1);
    assert_eq!(totals.studies, 2);

    let outputs = stored_outputs(&fixture.config.images_dir());
    assert_eq!(outputs.len(), 2);
    let objects: Vec<_> = outputs
        .iter()
        .map(|p| open_file(p).expect("readable output"))
        .collect();
    assert_eq!(
        element_text(&objects[0], tags::PATIENT_ID),
        element_text(&objects[1], tags::PATIENT_ID)
    );
    assert_ne!(
        element_text(&objects[0], tags::STUDY_INSTANCE_UID),
        element_text(&objects[1], tags::STUDY_INSTANCE_UID)
    );

    // both studies carry the same deterministic date offset
    let digest = md5::compute("P1".as_bytes());
    let expected_delta = (u128::from_be_bytes(digest.0) % 3652) as i64;
    let rows = engine.phi_index();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.date_offset, expected_delta);
        assert_eq!(row.anon_patient_id, "999001-000001");
    }
    engine.stop();
}

#[test]
fn reingesting_an_instance_is_a_no_op() {
    let fixture = Fixture::new();
    let engine = fixture.engine();
    let instance = TestInstance::default();
    let path = write_instance(&fixture, "dup.dcm", &instance);

    engine.anonymize_file(&path).expect("first ingest");
    let err = engine.anonymize_file(&path).unwrap_err();
    assert_eq!(err, RejectionKind::AlreadyStored);

    assert_eq!(engine.totals().instances, 1);
    assert_eq!(engine.totals().quarantined, 0);
    assert_eq!(stored_outputs(&fixture.config.images_dir()).len(), 1);
    engine.stop();
}

#[test]
fn missing_sop_class_is_quarantined_without_phi_capture() {
    let fixture = Fixture::new();
    let engine = fixture.engine();
    let instance = TestInstance {
        sop_class: "",
        ..TestInstance::default()
    };
    let path = write_instance(&fixture, "incomplete.dcm", &instance);

    let err = engine.anonymize_file(&path).unwrap_err();
    assert_eq!(err, RejectionKind::MissingAttributes);

    // the quarantined copy mirrors the storage layout with the original
    // identifiers
    let quarantined = fixture
        .config
        .quarantine_dir()
        .join("Missing_Attributes")
        .join("PHI-PATIENT-001")
        .join("1.2.999.1")
        .join("1.2.999.1.1")
        .join("1.2.999.1.1.1.dcm");
    assert!(quarantined.exists());
    assert!(path.exists(), "quarantine copies, never moves");
    let totals = engine.totals();
    assert_eq!(totals.quarantined, 1);
    assert_eq!(totals.patients, 0);
    assert_eq!(totals.instances, 0);
    assert!(stored_outputs(&fixture.config.images_dir()).is_empty());
    engine.stop();
}

#[test]
fn unaccepted_storage_class_is_quarantined() {
    let fixture = Fixture::new();
    let engine = fixture.engine();
    let instance = TestInstance {
        sop_class: MR_STORAGE,
        ..TestInstance::default()
    };
    let path = write_instance(&fixture, "mr.dcm", &instance);

    let err = engine.anonymize_file(&path).unwrap_err();
    assert_eq!(err, RejectionKind::InvalidStorageClass);
    assert!(fixture
        .config
        .quarantine_dir()
        .join("Invalid_Storage_Class")
        .join("PHI-PATIENT-001")
        .join("1.2.999.1")
        .join("1.2.999.1.1")
        .join("1.2.999.1.1.1.dcm")
        .exists());
    assert_eq!(engine.totals().instances, 0);
    engine.stop();
}

#[test]
fn output_never_contains_the_original_identifiers() {
    let fixture = Fixture::new();
    let engine = fixture.engine();
    let instance = TestInstance::default();
    let path = write_instance(&fixture, "phi.dcm", &instance);
    engine.anonymize_file(&path).expect("anonymize");

    let outputs = stored_outputs(&fixture.config.images_dir());
    assert_eq!(outputs.len(), 1);
    let raw = fs::read(&outputs[0]).expect("read output bytes");
    for phi in [
        instance.patient_id,
        instance.patient_name,
        instance.accession,
        instance.study_uid,
        instance.series_uid,
        instance.sop_uid,
    ] {
        assert!(
            !contains_subsequence(&raw, phi.as_bytes()),
            "output still contains {phi:?}"
        );
    }
    // output path itself is built from anonymized identifiers only
    let path_str = outputs[0].to_string_lossy();
    assert!(!path_str.contains(instance.patient_id));
    assert!(!path_str.contains(instance.study_uid));
    engine.stop();
}

#[test]
fn pipeline_processes_enqueued_items_before_stop() {
    let fixture = Fixture::new();
    let engine = fixture.engine();

    let dataset_spec = TestInstance {
        study_uid: "Q1",
        series_uid: "Q1.1",
        sop_uid: "Q1.1.1",
        ..TestInstance::default()
    };
    let file_spec = TestInstance {
        study_uid: "Q2",
        series_uid: "Q2.1",
        sop_uid: "Q2.1.1",
        ..TestInstance::default()
    };
    let file_path = write_instance(&fixture, "queued.dcm", &file_spec);

    engine.enqueue(
        "SCP@127.0.0.1",
        IngestItem::Dataset(Box::new(build_object(&dataset_spec))),
    );
    engine.enqueue("importer", IngestItem::File(file_path));
    // stop drains the queue and performs the final save
    engine.stop();

    assert_eq!(engine.totals().instances, 2);
    assert_eq!(stored_outputs(&fixture.config.images_dir()).len(), 2);
    assert!(fixture
        .config
        .private_dir()
        .join("AnonymizerModel.json")
        .exists());
}

#[test]
fn age_is_rounded_in_the_stored_output() {
    let fixture = Fixture::new();
    let engine = fixture.engine();
    let path = write_instance(&fixture, "age.dcm", &TestInstance::default());
    engine.anonymize_file(&path).expect("anonymize");

    let outputs = stored_outputs(&fixture.config.images_dir());
    let output = open_file(&outputs[0]).expect("readable output");
    assert_eq!(element_text(&output, tags::PATIENT_AGE), "035Y");
    engine.stop();
}

#[test]
fn remove_phi_forgets_the_study_and_patient() {
    let fixture = Fixture::new();
    let engine = fixture.engine();
    let path = write_instance(&fixture, "removable.dcm", &TestInstance::default());
    engine.anonymize_file(&path).expect("anonymize");

    let row = engine.phi_index().remove(0);
    assert!(engine.remove_phi(&row.anon_patient_id, &row.anon_study_uid));
    assert_eq!(engine.totals().patients, 0);
    assert_eq!(engine.totals().studies, 0);
    assert!(engine.phi_index().is_empty());
    engine.stop();
}

fn contains_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}
