/// `load_config` module: loads a static YAML config and injects secrets from the environment.
///
/// This is the only place where untrusted YAML is parsed and mapped to the
/// typed settings the CLI needs to construct its clients and the engine's
/// [`SyncSettings`].
///
/// # Responsibilities
/// - Parse the `source`, `storage` and `sync` sections into typed structs
/// - Inject `AZURE_DEVOPS_PAT` and `BLOB_SAS_TOKEN` from the environment
/// - Reject empty or missing values with a message naming the key
///
/// # Errors
/// All errors use `anyhow::Error` and are surfaced at the CLI boundary.
use anyhow::{anyhow, Result};
use course_sync_core::config::SyncSettings;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub const PAT_ENV: &str = "AZURE_DEVOPS_PAT";
pub const SAS_ENV: &str = "BLOB_SAS_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSection {
    pub organization_url: String,
    pub project: String,
    pub repository: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub database_path: PathBuf,
    pub blob_endpoint: String,
    pub container: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSection {
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

/// Secrets read from the environment, never from the YAML file.
#[derive(Clone)]
pub struct Secrets {
    pub azure_devops_pat: String,
    pub blob_sas_token: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("azure_devops_pat", &"<redacted>")
            .field("blob_sas_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub source: SourceSection,
    pub storage: StorageSection,
    pub sync: SyncSettings,
    pub secrets: Secrets,
}

fn require_env(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        Ok(_) => {
            error!(key, "Environment variable is empty");
            Err(anyhow!("environment variable {key} is empty"))
        }
        Err(e) => {
            error!(error = ?e, key, "Environment variable missing");
            Err(anyhow!("environment variable {key} must be set"))
        }
    }
}

fn require_field(key: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        error!(key, "Config value is empty");
        return Err(anyhow!("config value {key} must not be empty"));
    }
    Ok(())
}

/// Loads only the YAML file, without secrets. Used by commands that never
/// talk to the remote services.
pub fn load_static_config<P: AsRef<Path>>(
    path: P,
) -> Result<(SourceSection, StorageSection, SyncSettings)> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    #[derive(Debug, Deserialize)]
    struct RawConfig {
        source: SourceSection,
        storage: StorageSection,
        #[serde(default)]
        sync: Option<SyncSection>,
    }

    let raw: RawConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    require_field("source.organization_url", &raw.source.organization_url)?;
    require_field("source.project", &raw.source.project)?;
    require_field("source.repository", &raw.source.repository)?;
    require_field("source.branch", &raw.source.branch)?;
    require_field("storage.blob_endpoint", &raw.storage.blob_endpoint)?;
    require_field("storage.container", &raw.storage.container)?;

    let mut settings = SyncSettings::new(&raw.storage.blob_endpoint, &raw.storage.container);
    if let Some(max) = raw.sync.and_then(|s| s.max_concurrency) {
        if max == 0 {
            error!("sync.max_concurrency must be at least 1");
            return Err(anyhow!("config value sync.max_concurrency must be at least 1"));
        }
        settings.max_concurrency = max;
    }
    settings.trace_loaded();

    Ok((raw.source, raw.storage, settings))
}

/// Loads a static YAML config file and injects required secrets from the environment.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let (source, storage, sync) = load_static_config(path)?;

    dotenvy::dotenv().ok();
    let secrets = Secrets {
        azure_devops_pat: require_env(PAT_ENV)?,
        blob_sas_token: require_env(SAS_ENV)?,
    };
    info!(
        organization_url = %source.organization_url,
        repository = %source.repository,
        branch = %source.branch,
        "Configuration loaded with secrets from environment"
    );

    Ok(CliConfig {
        source,
        storage,
        sync,
        secrets,
    })
}
