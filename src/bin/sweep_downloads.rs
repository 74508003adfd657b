#![forbid(unsafe_code)]

//! One-shot retention sweep over the downloads directory, meant for cron or
//! a systemd timer when the server's own periodic sweep is disabled.

use anyhow::{Context, Result, anyhow, bail};
use savetube::{
    config::{self, RuntimeOverrides, StoreBackend},
    retention::{RetentionStore, SweepReport, SystemClock},
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct SweepArgs {
    config: PathBuf,
    downloads_dir: Option<PathBuf>,
    store: Option<StoreBackend>,
}

impl SweepArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    #[cfg(test)]
    fn from_slice(values: &[&str]) -> Result<Self> {
        Self::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = PathBuf::from(config::DEFAULT_CONFIG_PATH);
        let mut downloads_dir = None;
        let mut store = None;
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag.to_owned(), Some(value.to_owned())),
                _ => (arg.clone(), None),
            };
            let mut value = || {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| anyhow!("{flag} requires a value"))
            };

            match flag.as_str() {
                "--config" => config = PathBuf::from(value()?),
                "--downloads-dir" => downloads_dir = Some(PathBuf::from(value()?)),
                "--store" => {
                    let raw = value()?;
                    let backend = StoreBackend::parse(&raw)
                        .ok_or_else(|| anyhow!("--store must be `json` or `sqlite`, got `{raw}`"))?;
                    store = Some(backend);
                }
                _ => bail!("unknown argument: {arg}"),
            }
        }

        Ok(Self {
            config,
            downloads_dir,
            store,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = SweepArgs::parse()?;
    let report = run(args)?;
    if report.failed > 0 {
        warn!(failed = report.failed, "some artifacts could not be deleted; they will be retried");
    }
    Ok(())
}

fn run(args: SweepArgs) -> Result<SweepReport> {
    let overrides = RuntimeOverrides {
        downloads_dir: args.downloads_dir,
        store_backend: args.store,
        ..RuntimeOverrides::default()
    };
    let runtime = config::load_runtime_config_from(&args.config, overrides)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    if !runtime.downloads_dir.is_dir() {
        info!(dir = %runtime.downloads_dir.display(), "downloads directory does not exist; nothing to sweep");
        return Ok(SweepReport::default());
    }

    let storage = runtime
        .store_backend
        .open(&runtime.downloads_dir)
        .context("opening artifact records")?;
    let store = RetentionStore::new(storage, Arc::new(SystemClock), &runtime.downloads_dir);

    let report = store.sweep();
    if report.aborted {
        bail!(
            "artifact records in {} are unreadable; sweep skipped",
            runtime.downloads_dir.display()
        );
    }
    info!(%report, dir = %runtime.downloads_dir.display(), "sweep finished");
    Ok(report)
}
