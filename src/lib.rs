/*!
DICOM de-identification engine: rule-driven element transformation backed by
a durable PHI pseudonym store, a multi-worker ingest pipeline and a
quarantine tree for rejected instances.
*/

use std::{
    fs::create_dir_all,
    path::{Path, PathBuf},
};

use anyhow::Result;
use dicom::{
    core::{chrono::NaiveDate, value::DicomDate, PrimitiveValue, VR},
    dicom_value,
    object::{InMemDicomObject, Tag},
};

pub mod anonymizer;
pub mod config;
pub mod error;
pub mod hashdate;
pub mod pipeline;
pub mod quarantine;
pub mod script;
pub mod store;
pub mod transform;

pub use anonymizer::Anonymizer;
pub use config::ProjectConfig;
pub use error::{PersistenceError, PhiError, RejectionKind, ScriptError};
pub use pipeline::IngestItem;
pub use store::{InstanceAttrs, PhiIndexRow, PhiStore, Totals};

/// Normalized script form of a DICOM tag: 8 uppercase hex digits, GGGGEEEE.
pub fn normalized_tag(tag: Tag) -> String {
    format!("{:04X}{:04X}", tag.group(), tag.element())
}

/// String value of an element, trimmed of DICOM padding.
/// Missing elements and non-string values read as empty.
pub fn element_trimmed(ds: &InMemDicomObject, tag: Tag) -> String {
    ds.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// Build a primitive value for the given VR from a plain string.
/// Date values are converted to a proper DicomDate when they parse,
/// otherwise they are written back as text.
pub fn vr_corrected_value(vr: VR, value: &str) -> PrimitiveValue {
    match vr {
        VR::DA => match NaiveDate::parse_from_str(value, "%Y%m%d")
            .ok()
            .and_then(|d| DicomDate::try_from(&d).ok())
        {
            Some(date) => dicom_value!(Date, date),
            None => dicom_value!(Strs, [value.to_string()]),
        },
        VR::ST | VR::LT | VR::UT | VR::UR => {
            dicom_value!(Str, value.to_string())
        }
        _ => dicom_value!(Strs, [value.to_string()]),
    }
}

/// Create the target directory recursively if it does not exist.
pub fn create_target_dir(dir_path: &Path) -> Result<()> {
    if !dir_path.exists() {
        create_dir_all(dir_path)?;
    }
    Ok(())
}

/// Append `~` to the file name until the path no longer collides.
pub fn unique_path(full_path: PathBuf) -> PathBuf {
    if full_path.exists() {
        let mut name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push('~');
        unique_path(full_path.with_file_name(name))
    } else {
        full_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_tag_is_uppercase_hex() {
        assert_eq!(normalized_tag(Tag(0x0010, 0x0020)), "00100020");
        assert_eq!(normalized_tag(Tag(0x0008, 0x103E)), "0008103E");
    }

    #[test]
    fn vr_corrected_value_parses_valid_dates() {
        let value = vr_corrected_value(VR::DA, "20220101");
        assert!(matches!(value, PrimitiveValue::Date(_)));
    }

    #[test]
    fn vr_corrected_value_keeps_invalid_dates_as_text() {
        let value = vr_corrected_value(VR::DA, "not-a-date");
        assert_eq!(value.to_str(), "not-a-date");
    }

    #[test]
    fn unique_path_appends_suffix_on_collision() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("instance.dcm");
        std::fs::write(&path, b"x").expect("write");
        let next = unique_path(path.clone());
        assert_eq!(next, dir.path().join("instance.dcm~"));
    }
}
