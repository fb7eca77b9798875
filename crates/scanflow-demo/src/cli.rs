use std::path::PathBuf;

use clap::Parser;
use scanflow::{RuntimeConfig, StateDocument};

use crate::app::{Session, run_script, script};
use crate::error::Result;
use crate::logging::{init_logging, parse_level};
use crate::model::SimulatedBackend;

#[derive(Debug, Parser)]
#[command(
    name = "scanflow-demo",
    about = "Play back a scripted scanner session through the Scanflow engine",
    version
)]
pub struct Cli {
    /// Runtime configuration (TOML).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// JSON file holding persisted settings; read at start, written at exit.
    #[arg(long = "state-file")]
    pub state_file: Option<PathBuf>,

    /// Log level for the Scanflow crates when `RUST_LOG` is unset.
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Stop after this many ticks.
    #[arg(long)]
    pub ticks: Option<usize>,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    init_logging(parse_level(&cli.log_level)?)?;
    run(&cli, |frame| println!("{frame}"))
}

/// Run the demo described by `cli`, handing each rendered frame to `emit`.
pub fn run(cli: &Cli, emit: impl FnMut(&str)) -> Result<()> {
    let config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    let session = Session::new(&config, SimulatedBackend::default());

    if let Some(path) = &cli.state_file {
        let document = StateDocument::read_json_file(path)?;
        let restored = session.load_state(&document)?;
        tracing::info!(message = "session.restored", entries = restored, path = %path.display());
    }

    let mut steps = script();
    if let Some(ticks) = cli.ticks {
        steps.truncate(ticks);
    }
    run_script(&session, &steps, emit)?;

    if let Some(path) = &cli.state_file {
        session.save_state()?.write_json_file(path)?;
        tracing::info!(message = "session.saved", path = %path.display());
    }
    Ok(())
}
