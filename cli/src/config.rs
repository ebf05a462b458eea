use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use resticwrap_backends::secret::{CA_CERT_DATA, GOOGLE_SERVICE_ACCOUNT_JSON_KEY, RESTIC_PASSWORD};
use resticwrap_backends::{BackendDescriptor, ConfigResolver, Provider, Secret};
use resticwrap_core::{Error, IoNiceSettings, NiceSettings};
use resticwrap_engine::SetupOptions;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Contents of the `resticwrap` TOML configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub scratch_dir: Option<PathBuf>,
    pub enable_cache: bool,
    /// Overall budget in seconds for everything one invocation runs
    pub timeout_secs: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub nice: Option<NiceSettings>,
    pub ionice: Option<IoNiceSettings>,
    #[serde(rename = "backend")]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub repository: String,
    pub provider: Provider,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub azure_storage_account: String,
    #[serde(default)]
    pub insecure_tls: bool,
    #[serde(default)]
    pub max_connections: u32,
    pub password: Option<String>,
    pub password_file: Option<PathBuf>,
    /// Storage credentials keyed by the variable they are exported as
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
    pub ca_cert_file: Option<PathBuf>,
    pub service_account_file: Option<PathBuf>,
}

pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "resticwrap").map(|dirs| dirs.config_dir().join("config.toml"))
}

pub fn load_config(path: &Path) -> Result<CliConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: CliConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;

    if config.backends.is_empty() {
        return Err(anyhow!("No backends defined in {}", path.display()));
    }
    Ok(config)
}

impl CliConfig {
    pub fn setup_options(&self) -> SetupOptions {
        let defaults = SetupOptions::default();
        SetupOptions {
            enable_cache: self.enable_cache,
            scratch_dir: self.scratch_dir.clone().unwrap_or(defaults.scratch_dir),
            nice: self.nice.clone(),
            ionice: self.ionice.clone(),
            timeout: self.timeout_secs.map(Duration::from_secs),
            backends: self
                .backends
                .iter()
                .map(|backend| {
                    BackendDescriptor::new(backend.repository.clone())
                        .with_resolver(Arc::new(FileResolver::new(backend.clone())))
                })
                .collect(),
        }
    }

    /// The repository to operate on: the requested one, or the only configured one.
    pub fn repository(&self, requested: Option<&str>) -> Result<String> {
        if let Some(repository) = requested {
            return Ok(repository.to_string());
        }
        match self.backends.as_slice() {
            [only] => Ok(only.repository.clone()),
            _ => Err(anyhow!(
                "Repository required (--repo or RESTICWRAP_REPO) when several backends are configured"
            )),
        }
    }
}

/// Fills a descriptor from one `[[backend]]` table, reading secrets from disk.
pub struct FileResolver {
    config: BackendConfig,
}

impl FileResolver {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    async fn password(&self) -> resticwrap_core::Result<Option<String>> {
        if let Some(password) = &self.config.password {
            return Ok(Some(password.clone()));
        }
        match &self.config.password_file {
            Some(path) => {
                let contents = tokio::fs::read_to_string(path).await?;
                Ok(Some(contents.trim_end().to_string()))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ConfigResolver for FileResolver {
    async fn resolve(&self, backend: &mut BackendDescriptor) -> resticwrap_core::Result<()> {
        let config = &self.config;
        backend.provider = Some(config.provider);
        backend.bucket = config.bucket.clone();
        backend.endpoint = config.endpoint.clone();
        backend.region = config.region.clone();
        backend.prefix = config.prefix.clone();
        backend.directory = config.directory.clone();
        backend.azure_storage_account = config.azure_storage_account.clone();
        backend.insecure_tls = config.insecure_tls;
        backend.max_connections = config.max_connections;

        let mut encryption = Secret::new(format!("{}-encryption", config.repository));
        if let Some(password) = self.password().await? {
            encryption = encryption.with(RESTIC_PASSWORD, password);
        }
        backend.encryption_secret = Some(encryption);

        let mut storage = Secret::new(format!("{}-storage", config.repository));
        for (key, value) in &config.credentials {
            storage = storage.with(key.clone(), value.clone());
        }
        if let Some(path) = &config.ca_cert_file {
            storage = storage.with(CA_CERT_DATA, tokio::fs::read(path).await?);
        }
        if let Some(path) = &config.service_account_file {
            if config.provider != Provider::Gcs {
                return Err(Error::Config(format!(
                    "service_account_file is only valid for gcs backends, {} uses {}",
                    config.repository, config.provider
                )));
            }
            storage = storage.with(GOOGLE_SERVICE_ACCOUNT_JSON_KEY, tokio::fs::read(path).await?);
        }
        backend.storage_secret = Some(storage);
        Ok(())
    }
}
