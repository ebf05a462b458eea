use crate::secret::Secret;
use async_trait::async_trait;
use resticwrap_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Local,
    S3,
    Azure,
    Gcs,
    B2,
}

impl Provider {
    /// The `--option` value limiting concurrent connections, where the provider has one.
    pub fn max_connections_option(self, connections: u32) -> Option<String> {
        match self {
            Provider::Gcs => Some(format!("gs.connections={connections}")),
            Provider::Azure => Some(format!("azure.connections={connections}")),
            Provider::B2 => Some(format!("b2.connections={connections}")),
            Provider::Local | Provider::S3 => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Local => "local",
            Provider::S3 => "s3",
            Provider::Azure => "azure",
            Provider::Gcs => "gcs",
            Provider::B2 => "b2",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Provider::Local),
            "s3" => Ok(Provider::S3),
            "azure" => Ok(Provider::Azure),
            "gcs" | "gs" => Ok(Provider::Gcs),
            "b2" => Ok(Provider::B2),
            other => Err(Error::Config(format!("unsupported storage provider: {other}"))),
        }
    }
}

/// Fills in a descriptor's storage location and secrets before setup.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    async fn resolve(&self, backend: &mut BackendDescriptor) -> Result<()>;
}

/// Adapts a plain closure into a [`ConfigResolver`].
pub struct FnResolver<F>(pub F);

#[async_trait]
impl<F> ConfigResolver for FnResolver<F>
where
    F: Fn(&mut BackendDescriptor) -> Result<()> + Send + Sync,
{
    async fn resolve(&self, backend: &mut BackendDescriptor) -> Result<()> {
        (self.0)(backend)
    }
}

/// One configured storage destination.
///
/// `Default` is the zero descriptor handed out for unknown repositories: no
/// provider, no flags, no environment.
#[derive(Clone, Default)]
pub struct BackendDescriptor {
    pub repository: String,
    pub provider: Option<Provider>,
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub prefix: String,
    pub directory: String,
    pub insecure_tls: bool,
    pub max_connections: u32,
    pub azure_storage_account: String,
    pub storage_secret: Option<Secret>,
    pub encryption_secret: Option<Secret>,
    pub envs: BTreeMap<String, String>,
    pub ca_cert_file: Option<PathBuf>,
    pub error: Option<String>,
    pub resolver: Option<Arc<dyn ConfigResolver>>,
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("repository", &self.repository)
            .field("provider", &self.provider)
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .field("directory", &self.directory)
            .field("insecure_tls", &self.insecure_tls)
            .field("max_connections", &self.max_connections)
            .field("env_keys", &self.envs.keys().collect::<Vec<_>>())
            .field("ca_cert_file", &self.ca_cert_file)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl BackendDescriptor {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            ..Default::default()
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConfigResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn append_ca_cert_flag(&self, args: &mut Vec<String>) {
        if let Some(path) = &self.ca_cert_file {
            args.push("--cacert".to_string());
            args.push(path.display().to_string());
        }
    }

    pub fn append_insecure_tls_flag(&self, args: &mut Vec<String>) {
        if self.insecure_tls {
            args.push("--insecure-tls".to_string());
        }
    }

    pub fn append_max_connections_flag(&self, args: &mut Vec<String>) {
        if self.max_connections == 0 {
            return;
        }
        if let Some(option) = self
            .provider
            .and_then(|p| p.max_connections_option(self.max_connections))
        {
            args.push("--option".to_string());
            args.push(option);
        }
    }

    /// CA certificate, then TLS verification, then connection limit.
    pub fn append_backend_flags(&self, args: &mut Vec<String>) {
        self.append_ca_cert_flag(args);
        self.append_insecure_tls_flag(args);
        self.append_max_connections_flag(args);
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        match self.provider {
            Some(Provider::Local) => Some(Path::new(&self.bucket).join(&self.directory)),
            _ => None,
        }
    }

    /// Creates the repository directory for local backends. No-op otherwise.
    pub async fn create_local_dir(&self) -> Result<()> {
        if let Some(path) = self.local_path() {
            tokio::fs::create_dir_all(&path).await?;
        }
        Ok(())
    }

    pub(crate) fn record_error(&mut self, err: &Error) {
        self.error = Some(match self.error.take() {
            Some(previous) => format!("[{previous}, {err}]"),
            None => err.to_string(),
        });
    }
}
