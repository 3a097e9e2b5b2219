use std::{
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Result;
use dcmveil_rs::{Anonymizer, ProjectConfig, RejectionKind};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Recursively index the source tree and push every file through the
/// synchronous anonymization path. Non-DICOM and otherwise rejected files
/// end up in the project quarantine; duplicates are skipped.
pub fn dicom_import(source: PathBuf, config_path: PathBuf) -> Result<()> {
    let config = ProjectConfig::load_or_create(&config_path)?;
    info!(
        "Importing data >> SOURCE: {} | STORAGE: {}",
        source.display(),
        config.storage_dir.display()
    );
    let anonymizer = Anonymizer::new(config)?;

    info!("Indexing files from: {}", source.display());
    let all_files: Vec<_> = WalkDir::new(&source)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .par_bridge()
        .filter(|entry| entry.file_type().is_file())
        .collect();
    let total_len: u64 = all_files.len() as u64;
    info!("Total files found: {} | Starting import", total_len);
    let pb = ProgressBar::new(total_len);
    pb.set_style(ProgressStyle::with_template(
        "{spinner:.green} {percent}% [{elapsed_precise}] [{wide_bar:.cyan/blue}] ({pos}/{len}, ETA {eta})",
    )?);

    let stored = AtomicU64::new(0);
    let duplicates = AtomicU64::new(0);
    let rejected = AtomicU64::new(0);

    all_files.par_iter().for_each(|working_path| {
        match anonymizer.anonymize_file(working_path.path()) {
            Ok(()) => {
                stored.fetch_add(1, Ordering::Relaxed);
            }
            Err(RejectionKind::AlreadyStored) => {
                duplicates.fetch_add(1, Ordering::Relaxed);
                debug!("Already stored: {}", working_path.path().display());
            }
            Err(kind) => {
                rejected.fetch_add(1, Ordering::Relaxed);
                debug!("Rejected {}: {}", working_path.path().display(), kind);
            }
        }
        pb.inc(1);
    });
    pb.finish();
    anonymizer.stop();

    info!("Total files: {}", total_len);
    info!("Stored: {}", stored.load(Ordering::Relaxed));
    info!("Skipped duplicates: {}", duplicates.load(Ordering::Relaxed));
    info!("Quarantined: {}", rejected.load(Ordering::Relaxed));
    let totals = anonymizer.totals();
    info!(
        "PHI store >> patients: {} | studies: {} | series: {} | instances: {} | quarantined: {}",
        totals.patients, totals.studies, totals.series, totals.instances, totals.quarantined
    );
    info!("DICOM import complete!");
    Ok(())
}
