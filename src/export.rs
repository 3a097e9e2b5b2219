use std::{fs::File, io::Write, path::PathBuf};

use anyhow::Result;
use dcmveil_rs::{create_target_dir, Anonymizer, ProjectConfig};
use tracing::info;

const PHI_INDEX_HEADER: &str = "ANON-PatientID,ANON-PatientName,PHI-PatientName,PHI-PatientID,\
DateOffset,PHI-StudyDate,ANON-Accession,PHI-Accession,ANON-StudyUID,PHI-StudyUID,#Series,#Instances";

/// Write the PHI index CSV into `<private>/phi_export/`. The file links
/// pseudonyms back to the original identifiers and must never leave the
/// private tree.
pub fn export_phi_index(config_path: PathBuf) -> Result<()> {
    let config = ProjectConfig::load_or_create(&config_path)?;
    let anonymizer = Anonymizer::new(config.clone())?;
    let rows = anonymizer.phi_index();
    anonymizer.stop();

    create_target_dir(&config.phi_export_dir())?;
    let out_path = config.phi_export_dir().join("phi_index.csv");
    let mut file = File::create(&out_path)?;
    writeln!(file, "{}", PHI_INDEX_HEADER)?;
    for row in &rows {
        let fields = [
            csv_field(&row.anon_patient_id),
            csv_field(&row.anon_patient_name),
            csv_field(&row.phi_patient_name),
            csv_field(&row.phi_patient_id),
            row.date_offset.to_string(),
            csv_field(&row.phi_study_date),
            csv_field(&row.anon_accession),
            csv_field(&row.phi_accession),
            csv_field(&row.anon_study_uid),
            csv_field(&row.phi_study_uid),
            row.num_series.to_string(),
            row.num_instances.to_string(),
        ];
        writeln!(file, "{}", fields.join(","))?;
    }
    info!(
        "PHI index with {} rows written to {}",
        rows.len(),
        out_path.display()
    );
    Ok(())
}

pub fn print_totals(config_path: PathBuf) -> Result<()> {
    let config = ProjectConfig::load_or_create(&config_path)?;
    let anonymizer = Anonymizer::new(config)?;
    let totals = anonymizer.totals();
    anonymizer.stop();
    info!(
        "PHI store >> patients: {} | studies: {} | series: {} | instances: {} | quarantined: {}",
        totals.patients, totals.studies, totals.series, totals.instances, totals.quarantined
    );
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
