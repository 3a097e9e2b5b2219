use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

/// On-disk layout under `storage_dir`.
pub const PRIVATE_DIR: &str = "private";
pub const PUBLIC_DIR: &str = "public";
pub const QUARANTINE_DIR: &str = "quarantine";
pub const PHI_EXPORT_DIR: &str = "phi_export";

const DEFAULT_CONFIG: &str = r#"# dcmveil project configuration
# site_id and uid_root scope every pseudonym and minted UID for the project;
# never change them once instances have been stored.
site_id = "999001"
uid_root = "1.2.826.0.1.3680043.10.474"
project_name = "MY_PROJECT"
trial_name = ""
storage_dir = "./dcmveil-storage"
script_path = "./anonymizer-script.xml"

# SOP Class UIDs accepted for ingest; everything else is quarantined
# under Invalid_Storage_Class.
accepted_storage_classes = [
    "1.2.840.10008.5.1.4.1.1.1",    # Computed Radiography
    "1.2.840.10008.5.1.4.1.1.1.1",  # Digital X-Ray (presentation)
    "1.2.840.10008.5.1.4.1.1.2",    # CT
    "1.2.840.10008.5.1.4.1.1.2.1",  # Enhanced CT
    "1.2.840.10008.5.1.4.1.1.4",    # MR
    "1.2.840.10008.5.1.4.1.1.4.1",  # Enhanced MR
    "1.2.840.10008.5.1.4.1.1.6.1",  # Ultrasound
    "1.2.840.10008.5.1.4.1.1.7",    # Secondary Capture
    "1.2.840.10008.5.1.4.1.1.12.1", # X-Ray Angiographic
    "1.2.840.10008.5.1.4.1.1.20",   # Nuclear Medicine
    "1.2.840.10008.5.1.4.1.1.128",  # PET
]

worker_count = 2
autosave_interval_secs = 30
"#;

const DEFAULT_SCRIPT: &str = include_str!("../assets/default-anonymizer-script.xml");

/// Read-only project settings. Captured once at engine construction;
/// `site_id` and `uid_root` are immutable for the life of a project.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub site_id: String,
    pub uid_root: String,
    pub project_name: String,
    #[serde(default)]
    pub trial_name: String,
    pub storage_dir: PathBuf,
    pub script_path: PathBuf,
    #[serde(default)]
    pub accepted_storage_classes: Vec<String>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_autosave_interval_secs")]
    pub autosave_interval_secs: u64,
}

fn default_worker_count() -> usize {
    2
}

fn default_autosave_interval_secs() -> u64 {
    30
}

impl ProjectConfig {
    /// Load the TOML config at `path`, creating a default config file and a
    /// default anonymizer script when either is missing.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(v) => {
                info!("Reading project config from {}", path.display());
                v
            }
            Err(_) => {
                warn!(
                    "Config file not found, creating a default config at {}",
                    path.display()
                );
                let mut file = File::create(path)
                    .with_context(|| format!("can't create config file {}", path.display()))?;
                write!(file, "{}", DEFAULT_CONFIG)?;
                DEFAULT_CONFIG.to_string()
            }
        };
        let config: ProjectConfig = toml::from_str(&raw)
            .with_context(|| format!("invalid project config {}", path.display()))?;
        config.ensure_default_script()?;
        Ok(config)
    }

    /// Write the bundled default anonymizer script if none exists yet.
    pub fn ensure_default_script(&self) -> Result<()> {
        if !self.script_path.exists() {
            warn!(
                "Anonymizer script not found, writing default script to {}",
                self.script_path.display()
            );
            if let Some(parent) = self.script_path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let mut file = File::create(&self.script_path).with_context(|| {
                format!("can't create script file {}", self.script_path.display())
            })?;
            write!(file, "{}", DEFAULT_SCRIPT)?;
        }
        Ok(())
    }

    pub fn private_dir(&self) -> PathBuf {
        self.storage_dir.join(PRIVATE_DIR)
    }

    /// Where anonymized instances are written.
    pub fn images_dir(&self) -> PathBuf {
        self.storage_dir.join(PUBLIC_DIR)
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.private_dir().join(QUARANTINE_DIR)
    }

    pub fn phi_export_dir(&self) -> PathBuf {
        self.private_dir().join(PHI_EXPORT_DIR)
    }

    pub fn accepts_storage_class(&self, sop_class_uid: &str) -> bool {
        self.accepted_storage_classes
            .iter()
            .any(|uid| uid == sop_class_uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips() {
        let config: ProjectConfig = toml::from_str(DEFAULT_CONFIG).expect("default config parses");
        assert_eq!(config.site_id, "999001");
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.autosave_interval_secs, 30);
        assert!(config.accepts_storage_class("1.2.840.10008.5.1.4.1.1.2"));
        assert!(!config.accepts_storage_class("1.2.840.10008.5.1.4.1.1.104.1"));
    }

    #[test]
    fn load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("dcmveil.toml");
        std::fs::write(
            &config_path,
            format!(
                r#"
site_id = "123456"
uid_root = "1.2.3"
project_name = "TRIAL"
storage_dir = "{0}/storage"
script_path = "{0}/script.xml"
accepted_storage_classes = ["1.2.840.10008.5.1.4.1.1.2"]
"#,
                dir.path().display()
            ),
        )
        .expect("write config");

        let config = ProjectConfig::load_or_create(&config_path).expect("load");
        assert_eq!(config.site_id, "123456");
        // defaults applied for omitted fields
        assert_eq!(config.worker_count, 2);
        // default script materialized
        assert!(config.script_path.exists());
        assert_eq!(
            config.quarantine_dir(),
            config.storage_dir.join("private").join("quarantine")
        );
    }
}
