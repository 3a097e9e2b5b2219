use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    config::ProjectConfig,
    create_target_dir,
    error::RejectionKind,
    pipeline::{Autosave, IngestItem, IngestPipeline},
    script,
    store::{PhiIndexRow, PhiStore, Totals, STORE_FILENAME},
    transform::Transformer,
};

/// The de-identification engine. Owns the PHI store, the rule script, the
/// worker pool and the autosave loop; all operations are methods on this
/// value and no process-wide state exists.
pub struct Anonymizer {
    store: Arc<PhiStore>,
    transformer: Arc<Transformer>,
    pipeline: IngestPipeline,
    autosave: Autosave,
}

impl Anonymizer {
    /// Build the engine for a project: load (or create) the PHI store under
    /// `<storage_dir>/private/`, parse the rule script, and spawn the
    /// worker pool and autosave loop. Fails fast on a missing or malformed
    /// script and on an unrecoverable store snapshot.
    pub fn new(config: ProjectConfig) -> Result<Self> {
        create_target_dir(&config.private_dir())?;
        create_target_dir(&config.images_dir())?;
        create_target_dir(&config.quarantine_dir())?;

        let tag_keep = script::load_script(&config.script_path)?;
        let store = PhiStore::load_or_create(
            config.private_dir().join(STORE_FILENAME),
            &config.site_id,
            &config.uid_root,
        )
        .context("can't load PHI store snapshot")?;

        let store = Arc::new(store);
        let config = Arc::new(config);
        let transformer = Arc::new(Transformer::new(
            Arc::clone(&config),
            Arc::new(tag_keep),
            Arc::clone(&store),
        ));
        let pipeline = IngestPipeline::start(Arc::clone(&transformer), config.worker_count);
        let autosave = Autosave::start(
            Arc::clone(&store),
            Duration::from_secs(config.autosave_interval_secs.max(1)),
        );
        info!(
            "Anonymizer initialised for project {} (site {})",
            config.project_name, config.site_id
        );
        Ok(Anonymizer {
            store,
            transformer,
            pipeline,
            autosave,
        })
    }

    /// Synchronously read, validate and anonymize one file. Used by the
    /// directory importer; rejects are quarantined before returning.
    pub fn anonymize_file(&self, path: &Path) -> Result<(), RejectionKind> {
        self.transformer.process_file(path)
    }

    /// Queue one item for a background worker. Used by storage endpoint
    /// handlers and the remote mover.
    pub fn enqueue(&self, source: &str, item: IngestItem) {
        self.pipeline.enqueue(source, item);
    }

    /// Graceful shutdown: drain and join the workers, then stop autosave,
    /// which performs a final save.
    pub fn stop(&self) {
        self.pipeline.stop();
        self.autosave.stop();
    }

    /// Direct access to the PHI store for export and review tooling.
    pub fn store(&self) -> &PhiStore {
        &self.store
    }

    /// Flat per-study projection for the PHI CSV export.
    pub fn phi_index(&self) -> Vec<PhiIndexRow> {
        self.store.phi_index()
    }

    /// Remove one study (and its patient, when none remain) by anonymized
    /// identifiers.
    pub fn remove_phi(&self, anon_patient_id: &str, anon_study_uid: &str) -> bool {
        self.store.remove_phi(anon_patient_id, anon_study_uid)
    }

    pub fn totals(&self) -> Totals {
        self.store.get_totals()
    }

    /// Remaining instances an external mover still owes a study; records
    /// the promised count.
    pub fn pending_instance_count(
        &self,
        phi_patient_id: &str,
        study_uid: &str,
        target_count: u32,
    ) -> u32 {
        self.store
            .pending_instance_count(phi_patient_id, study_uid, target_count)
    }

    /// True once a study has received everything the mover promised.
    pub fn study_imported(&self, phi_patient_id: &str, study_uid: &str) -> bool {
        self.store.study_imported(phi_patient_id, study_uid)
    }
}
