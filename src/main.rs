/*!
The main entry point into dcmveil.
*/

mod args;
mod export;
mod import;

use crate::args::EntityType;
use anyhow::Result;
use args::ArgsParser;
use clap::Parser;
use export::{export_phi_index, print_totals};
use import::dicom_import;
use tracing::{error, Level};

fn app() -> Result<()> {
    let args = ArgsParser::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .without_time()
            .with_max_level(if args.verbose {
                Level::DEBUG
            } else {
                Level::INFO
            })
            .finish(),
    )?;
    match args.action_type {
        EntityType::Import(import_command) => {
            dicom_import(import_command.source, import_command.config)?
        }
        EntityType::Index(index_command) => export_phi_index(index_command.config)?,
        EntityType::Totals(totals_command) => print_totals(totals_command.config)?,
    }
    Ok(())
}

fn main() {
    app().unwrap_or_else(|e| error!("Unexpected error: {e:#}"))
}
