use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use cbf_core::ControllerConfig;
use tracing::{info, warn};

use crate::validation::{self, ConfigWarnings};

/// Variable naming a TOML or JSON configuration file.
pub const CONFIG_PATH_VAR: &str = "CBF_CONFIG_PATH";
/// Variable carrying the whole configuration as inline JSON.
pub const CONFIG_JSON_VAR: &str = "CBF_CONFIG_JSON";

const DEFAULT_CANDIDATES: &[&str] = &[
    "cbf.toml",
    "cbf.json",
    "config/cbf.toml",
    "config/cbf.json",
];

/// Where the loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl ConfigSource {
    pub fn describe(&self) -> String {
        match self {
            ConfigSource::Default => "built-in defaults".to_string(),
            ConfigSource::EnvPath(path) => {
                format!("{CONFIG_PATH_VAR}={}", path.display())
            }
            ConfigSource::EnvInline => CONFIG_JSON_VAR.to_string(),
            ConfigSource::File(path) => path.display().to_string(),
        }
    }
}

/// A guard-railed configuration and its provenance.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub config: ControllerConfig,
    pub source: ConfigSource,
    pub warnings: ConfigWarnings,
}

impl ControllerSettings {
    /// Resolve configuration from the process environment.
    ///
    /// Evaluation order:
    /// 1) `$CBF_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$CBF_CONFIG_JSON` (inline JSON),
    /// 3) the first of `cbf.toml`, `cbf.json`, `config/cbf.toml`,
    ///    `config/cbf.json` under the working directory,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<Self> {
        let root = env::current_dir()
            .context("failed to resolve the working directory")?;
        Self::load_from_env_in(&root)
    }

    /// [`load_from_env`](Self::load_from_env) with default candidates
    /// resolved under `root` instead of the working directory.
    pub fn load_from_env_in(root: &Path) -> anyhow::Result<Self> {
        let (config, source) = resolve(root)?;
        Self::from_config(config, source)
    }

    /// Load an explicit file, bypassing the environment.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let config = load_from_file(path)?;
        Self::from_config(config, ConfigSource::File(path.to_path_buf()))
    }

    /// Run the guard rails over an already-parsed configuration.
    pub fn from_config(
        config: ControllerConfig,
        source: ConfigSource,
    ) -> anyhow::Result<Self> {
        let warnings =
            validation::apply_guard_rails(&config).with_context(|| {
                format!("configuration from {} rejected", source.describe())
            })?;
        for warning in warnings.iter() {
            warn!(field = warning.field, "{}", warning.message);
        }
        info!(
            source = %source.describe(),
            fsps = config.inventory.fsps.len(),
            receptors = config.inventory.receptors.len(),
            "configuration loaded"
        );
        Ok(Self {
            config,
            source,
            warnings,
        })
    }
}

fn resolve(root: &Path) -> anyhow::Result<(ControllerConfig, ConfigSource)> {
    if let Ok(path_str) = env::var(CONFIG_PATH_VAR)
        && !path_str.trim().is_empty()
    {
        let path = PathBuf::from(path_str);
        let config = load_from_file(&path)?;
        return Ok((config, ConfigSource::EnvPath(path)));
    }

    if let Ok(raw) = env::var(CONFIG_JSON_VAR)
        && !raw.trim().is_empty()
    {
        let parsed = parse_json(&raw)
            .with_context(|| format!("failed to parse {CONFIG_JSON_VAR}"))?;
        return Ok((parsed, ConfigSource::EnvInline));
    }

    if let Some(path) = find_default_file(root) {
        let config = load_from_file(&path)?;
        return Ok((config, ConfigSource::File(path)));
    }

    Ok((ControllerConfig::default(), ConfigSource::Default))
}

/// Read a configuration file, choosing the format by extension.
pub fn load_from_file(path: &Path) -> anyhow::Result<ControllerConfig> {
    let contents = fs::read_to_string(path).with_context(|| {
        format!("failed to read controller config from {}", path.display())
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents).with_context(|| {
            format!("invalid controller config {}", path.display())
        }),
        Some("toml") => toml::from_str(&contents).map_err(|err| {
            anyhow!("invalid controller config {}: {}", path.display(), err)
        }),
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

/// Parse without a format hint: TOML first, then JSON.
pub fn parse_from_str(
    contents: &str,
    origin: &str,
) -> anyhow::Result<ControllerConfig> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| {
            anyhow!(
                "failed to parse controller config {}: toml error: {}; json error: {}",
                origin,
                toml_err,
                json_err
            )
        })
    })
}

pub fn parse_json(raw: &str) -> anyhow::Result<ControllerConfig> {
    serde_json::from_str(raw)
        .map_err(|err| anyhow!("invalid controller config json: {err}"))
}

fn find_default_file(root: &Path) -> Option<PathBuf> {
    DEFAULT_CANDIDATES
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|path| path.exists())
}
