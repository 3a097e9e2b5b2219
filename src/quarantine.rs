use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use dicom::{
    dictionary_std::tags,
    object::{FileDicomObject, InMemDicomObject},
};
use tracing::error;

use crate::{create_target_dir, error::RejectionKind, store::InstanceAttrs, unique_path};

/// Closed set of reject categories; each owns a subtree of the quarantine
/// directory. The directory names are part of the on-disk contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineKind {
    InvalidDicom,
    DicomReadError,
    MissingAttributes,
    InvalidStorageClass,
    CapturePhiError,
    StorageError,
}

impl QuarantineKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            QuarantineKind::InvalidDicom => "Invalid_DICOM",
            QuarantineKind::DicomReadError => "DICOM_Read_Error",
            QuarantineKind::MissingAttributes => "Missing_Attributes",
            QuarantineKind::InvalidStorageClass => "Invalid_Storage_Class",
            QuarantineKind::CapturePhiError => "Capture_PHI_Error",
            QuarantineKind::StorageError => "Storage_Error",
        }
    }

    /// The quarantine category of a rejection, if it has one
    /// (`AlreadyStored` is a skip, not a reject).
    pub fn from_rejection(kind: RejectionKind) -> Option<QuarantineKind> {
        match kind {
            RejectionKind::InvalidDicom => Some(QuarantineKind::InvalidDicom),
            RejectionKind::DicomReadError => Some(QuarantineKind::DicomReadError),
            RejectionKind::MissingAttributes => Some(QuarantineKind::MissingAttributes),
            RejectionKind::InvalidStorageClass => Some(QuarantineKind::InvalidStorageClass),
            RejectionKind::CapturePhiError => Some(QuarantineKind::CapturePhiError),
            RejectionKind::StorageError => Some(QuarantineKind::StorageError),
            RejectionKind::AlreadyStored => None,
        }
    }
}

/// Routes rejected items into per-category quarantine subtrees. Rejects are
/// preserved verbatim with their original identifiers so incidents can be
/// traced back to the source.
#[derive(Debug, Clone)]
pub struct Quarantine {
    root: PathBuf,
}

impl Quarantine {
    pub fn new(root: PathBuf) -> Self {
        Quarantine { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy (never move) a source file into the kind's subtree, suffixing
    /// the name on collision. Used when the file could not be parsed, so
    /// no identifiers are available to mirror the storage layout.
    pub fn copy_file(&self, kind: QuarantineKind, source: &Path) -> Result<PathBuf> {
        let dir = self.root.join(kind.dir_name());
        self.copy_into(source, dir, None)
    }

    /// Copy a parseable-but-rejected source file into the kind's subtree,
    /// mirroring the storage layout with the file's original identifiers
    /// to preserve forensic linkage.
    pub fn copy_file_with_ids(
        &self,
        kind: QuarantineKind,
        source: &Path,
        attrs: &InstanceAttrs,
    ) -> Result<PathBuf> {
        let or_unknown = |value: &str| -> String {
            if value.is_empty() {
                "UNKNOWN".to_string()
            } else {
                value.to_string()
            }
        };
        let dir = self
            .root
            .join(kind.dir_name())
            .join(or_unknown(&attrs.patient_id))
            .join(or_unknown(&attrs.study_uid))
            .join(or_unknown(&attrs.series_uid));
        let file_name = (!attrs.sop_instance_uid.is_empty())
            .then(|| format!("{}.dcm", attrs.sop_instance_uid));
        self.copy_into(source, dir, file_name)
    }

    fn copy_into(
        &self,
        source: &Path,
        dir: PathBuf,
        file_name: Option<String>,
    ) -> Result<PathBuf> {
        create_target_dir(&dir)?;
        let file_name = file_name.unwrap_or_else(|| {
            source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed".to_string())
        });
        let dest = unique_path(dir.join(file_name));
        error!("QUARANTINE {} => {}", source.display(), dest.display());
        fs::copy(source, &dest)
            .with_context(|| format!("can't copy {} to quarantine", source.display()))?;
        Ok(dest)
    }

    /// Write an in-memory dataset verbatim (no anonymization) into the
    /// kind's subtree, mirroring the storage layout with the dataset's
    /// current identifiers.
    pub fn write_dataset(
        &self,
        kind: QuarantineKind,
        obj: &FileDicomObject<InMemDicomObject>,
    ) -> Result<PathBuf> {
        let id = |tag| -> String {
            let value = obj
                .element(tag)
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|v| v.trim().to_string())
                .unwrap_or_default();
            if value.is_empty() {
                "UNKNOWN".to_string()
            } else {
                value
            }
        };
        let dir = self
            .root
            .join(kind.dir_name())
            .join(id(tags::PATIENT_ID))
            .join(id(tags::STUDY_INSTANCE_UID))
            .join(id(tags::SERIES_INSTANCE_UID));
        create_target_dir(&dir)?;
        let dest = unique_path(dir.join(format!("{}.dcm", id(tags::SOP_INSTANCE_UID))));
        error!("QUARANTINE dataset => {}", dest.display());
        obj.write_to_file(&dest)
            .with_context(|| format!("can't write quarantined dataset {}", dest.display()))?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_directory_names_are_contractual() {
        assert_eq!(QuarantineKind::InvalidDicom.dir_name(), "Invalid_DICOM");
        assert_eq!(QuarantineKind::DicomReadError.dir_name(), "DICOM_Read_Error");
        assert_eq!(
            QuarantineKind::MissingAttributes.dir_name(),
            "Missing_Attributes"
        );
        assert_eq!(
            QuarantineKind::InvalidStorageClass.dir_name(),
            "Invalid_Storage_Class"
        );
        assert_eq!(
            QuarantineKind::CapturePhiError.dir_name(),
            "Capture_PHI_Error"
        );
        assert_eq!(QuarantineKind::StorageError.dir_name(), "Storage_Error");
    }

    #[test]
    fn already_stored_is_never_quarantined() {
        assert!(QuarantineKind::from_rejection(RejectionKind::AlreadyStored).is_none());
        assert_eq!(
            QuarantineKind::from_rejection(RejectionKind::InvalidDicom),
            Some(QuarantineKind::InvalidDicom)
        );
    }

    #[test]
    fn copy_file_preserves_the_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("bogus.txt");
        fs::write(&source, b"not dicom").expect("write");
        let quarantine = Quarantine::new(dir.path().join("quarantine"));

        let dest = quarantine
            .copy_file(QuarantineKind::InvalidDicom, &source)
            .expect("copy");
        assert!(source.exists(), "quarantine must copy, not move");
        assert!(dest.starts_with(dir.path().join("quarantine").join("Invalid_DICOM")));
        assert_eq!(fs::read(&dest).expect("read"), b"not dicom");

        // a second reject of the same name lands beside it
        let dest2 = quarantine
            .copy_file(QuarantineKind::InvalidDicom, &source)
            .expect("copy again");
        assert_ne!(dest, dest2);
    }
}
