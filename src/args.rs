use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(
    version,
    about = "DCMVeil >> DICOM de-identification engine for clinical research"
)]
pub struct ArgsParser {
    #[clap(subcommand)]
    pub action_type: EntityType,
    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum EntityType {
    /// Recursively anonymize every DICOM file under the given source path
    Import(ImportCommand),
    /// Export the PHI index as CSV into the project's phi_export directory
    Index(IndexCommand),
    /// Print patient/study/series/instance/quarantine totals
    Totals(TotalsCommand),
}

#[derive(Debug, Args)]
pub struct ImportCommand {
    /// Project config file, created with defaults when missing
    #[clap(short, long, default_value = "dcmveil.toml")]
    pub config: PathBuf,
    /// Source data path, all files will be recursively indexed
    pub source: PathBuf,
}

#[derive(Debug, Args)]
pub struct IndexCommand {
    /// Project config file, created with defaults when missing
    #[clap(short, long, default_value = "dcmveil.toml")]
    pub config: PathBuf,
}

#[derive(Debug, Args)]
pub struct TotalsCommand {
    /// Project config file, created with defaults when missing
    #[clap(short, long, default_value = "dcmveil.toml")]
    pub config: PathBuf,
}
