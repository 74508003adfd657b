use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::storage::{JsonFileStorage, RecordStorage, SqliteStorage, StorageError};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/savetube-env";
pub const DEFAULT_DOWNLOADS_DIR: &str = "downloads";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60 * 60;

/// Which [`crate::storage::RecordStorage`] backend keeps artifact records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Json,
    Sqlite,
}

impl StoreBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" | "file" => Some(Self::Json),
            "sqlite" | "db" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Opens the record store that lives inside `downloads_dir`.
    pub fn open(self, downloads_dir: &Path) -> Result<Arc<dyn RecordStorage>, StorageError> {
        let storage: Arc<dyn RecordStorage> = match self {
            Self::Json => Arc::new(JsonFileStorage::in_dir(downloads_dir)),
            Self::Sqlite => Arc::new(SqliteStorage::in_dir(downloads_dir)?),
        };
        Ok(storage)
    }
}

/// Raw values from the `KEY="value"` config file. Everything is optional.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub downloads_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub store_backend: Option<StoreBackend>,
    pub sweep_interval_secs: Option<u64>,
    pub sweep_on_request: Option<bool>,
    pub delete_after_serve: Option<bool>,
}

/// Command-line values, which take precedence over everything else.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub downloads_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub store_backend: Option<StoreBackend>,
}

/// Fully resolved settings used by the binaries.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub downloads_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub store_backend: StoreBackend,
    /// `None` disables the periodic sweep task.
    pub sweep_interval: Option<Duration>,
    pub sweep_on_request: bool,
    pub delete_after_serve: bool,
}

pub fn read_env_file(path: &Path) -> Result<Option<HashMap<String, String>>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    Ok(Some(parse_env_lines(&content)))
}

fn parse_env_lines(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            vars.insert(key.trim().to_string(), value.to_string());
        }
    }
    vars
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    match read_env_file(path)? {
        Some(vars) => env_config_from_vars(&vars, &path.display().to_string()).map(Some),
        None => Ok(None),
    }
}

/// Interprets known keys from `vars`; `source` names the origin in errors.
fn env_config_from_vars(vars: &HashMap<String, String>, source: &str) -> Result<EnvConfig> {
    let mut cfg = EnvConfig::default();
    for (key, value) in vars {
        let value = value.as_str();
        match key.as_str() {
            "DOWNLOADS_DIR" if !value.is_empty() => cfg.downloads_dir = Some(PathBuf::from(value)),
            "SAVETUBE_HOST" if !value.is_empty() => cfg.host = Some(value.to_string()),
            "SAVETUBE_PORT" => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("Parsing SAVETUBE_PORT from {source}"))?;
                cfg.port = Some(port);
            }
            "YTDLP_PATH" if !value.is_empty() => cfg.ytdlp_path = Some(PathBuf::from(value)),
            "FFMPEG_PATH" if !value.is_empty() => cfg.ffmpeg_path = Some(PathBuf::from(value)),
            "RETENTION_STORE" => {
                let backend = StoreBackend::parse(value).ok_or_else(|| {
                    anyhow!("RETENTION_STORE in {source} must be `json` or `sqlite`, got `{value}`")
                })?;
                cfg.store_backend = Some(backend);
            }
            "SWEEP_INTERVAL_SECS" => {
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("Parsing SWEEP_INTERVAL_SECS from {source}"))?;
                cfg.sweep_interval_secs = Some(secs);
            }
            "SWEEP_ON_REQUEST" => cfg.sweep_on_request = Some(parse_bool(key, value, source)?),
            "DELETE_AFTER_SERVE" => cfg.delete_after_serve = Some(parse_bool(key, value, source)?),
            _ => {}
        }
    }
    Ok(cfg)
}

fn parse_bool(key: &str, value: &str, source: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{key} in {source} must be a boolean, got `{other}`"),
    }
}

/// Layers `file` under the process environment, then `overrides` on top.
pub fn resolve_runtime_config(
    file: Option<EnvConfig>,
    process_env: &HashMap<String, String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let file = file.unwrap_or_default();
    let env = env_config_from_vars(process_env, "the environment")?;

    let sweep_secs = env
        .sweep_interval_secs
        .or(file.sweep_interval_secs)
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);

    Ok(RuntimeConfig {
        downloads_dir: overrides
            .downloads_dir
            .or(env.downloads_dir)
            .or(file.downloads_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOADS_DIR)),
        host: overrides
            .host
            .or(env.host)
            .or(file.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: overrides
            .port
            .or(env.port)
            .or(file.port)
            .unwrap_or(DEFAULT_PORT),
        ytdlp_path: env.ytdlp_path.or(file.ytdlp_path),
        ffmpeg_path: env.ffmpeg_path.or(file.ffmpeg_path),
        store_backend: overrides
            .store_backend
            .or(env.store_backend)
            .or(file.store_backend)
            .unwrap_or_default(),
        sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
        sweep_on_request: env
            .sweep_on_request
            .or(file.sweep_on_request)
            .unwrap_or(true),
        delete_after_serve: env
            .delete_after_serve
            .or(file.delete_after_serve)
            .unwrap_or(false),
    })
}

/// Reads the config file at `path` (if present) plus the real environment.
pub fn load_runtime_config_from(
    path: impl AsRef<Path>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let file = read_env_config(path.as_ref())?;
    let process_env: HashMap<String, String> = std::env::vars()
        .filter(|(key, _)| {
            matches!(
                key.as_str(),
                "DOWNLOADS_DIR"
                    | "SAVETUBE_HOST"
                    | "SAVETUBE_PORT"
                    | "RETENTION_STORE"
                    | "SWEEP_INTERVAL_SECS"
                    | "SWEEP_ON_REQUEST"
                    | "DELETE_AFTER_SERVE"
                    | "YTDLP_PATH"
                    | "FFMPEG_PATH"
            )
        })
        .collect();
    resolve_runtime_config(file, &process_env, overrides)
}
