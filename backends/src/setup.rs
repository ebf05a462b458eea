use crate::backend::{BackendDescriptor, Provider};
use crate::secret::{self, Secret};
use resticwrap_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory under the scratch dir holding the tool's local cache.
pub const RESTIC_CACHE_DIR: &str = "restic-cache";

/// Runs the descriptor's resolver and derives its environment.
///
/// On failure the error is also folded into the descriptor's `error` field so the
/// registry keeps a record of which backends could not be prepared.
pub async fn prepare_backend(backend: &mut BackendDescriptor, scratch_dir: &Path) -> Result<()> {
    match setup_envs(backend, scratch_dir).await {
        Ok(()) => Ok(()),
        Err(err) => {
            backend.record_error(&err);
            Err(err)
        }
    }
}

async fn setup_envs(backend: &mut BackendDescriptor, scratch_dir: &Path) -> Result<()> {
    let resolver = backend.resolver.clone().ok_or_else(|| {
        Error::Config(format!(
            "config resolver is not set for backend {}",
            backend.repository
        ))
    })?;
    resolver
        .resolve(backend)
        .await
        .map_err(|e| e.context("failed to resolve storage config"))?;

    let repository = backend.repository.clone();
    let secret_error = |e: Error| e.context(format!("failed to set secret for backend {repository}"));

    let mut envs = std::mem::take(&mut backend.envs);
    set_env_from_secret(&mut envs, backend.encryption_secret.as_ref(), secret::RESTIC_PASSWORD, true)
        .map_err(secret_error)?;

    let tmp_dir = create_tmp_dir(scratch_dir, &backend.repository)
        .await
        .map_err(|e| e.context("failed to create tmp dir"))?;
    envs.insert(secret::TMPDIR.to_string(), tmp_dir.display().to_string());

    if let Some(data) = backend
        .storage_secret
        .as_ref()
        .and_then(|s| s.get(secret::CA_CERT_DATA))
    {
        let path = write_secret_file(&tmp_dir, "ca.crt", data)
            .await
            .map_err(|e| e.context(format!("failed to write secret for backend {}", backend.repository)))?;
        backend.ca_cert_file = Some(path);
    }

    let storage = backend.storage_secret.as_ref();
    let provider = backend.provider.ok_or_else(|| {
        Error::Config(format!("storage provider is not set for backend {}", backend.repository))
    })?;
    match provider {
        Provider::Local => {
            envs.insert(
                secret::RESTIC_REPOSITORY.to_string(),
                format!("{}/{}", backend.bucket, backend.directory),
            );
        }
        Provider::S3 => {
            let path = join_segments(&[&backend.bucket, &backend.prefix, &backend.directory]);
            envs.insert(
                secret::RESTIC_REPOSITORY.to_string(),
                format!("s3:{}/{}", backend.endpoint, path),
            );
            set_env_from_secret(&mut envs, storage, secret::AWS_ACCESS_KEY_ID, false).map_err(secret_error)?;
            set_env_from_secret(&mut envs, storage, secret::AWS_SECRET_ACCESS_KEY, false).map_err(secret_error)?;
            if !backend.region.is_empty() {
                envs.insert(secret::AWS_DEFAULT_REGION.to_string(), backend.region.clone());
            }
        }
        Provider::Azure => {
            let path = join_segments(&[&backend.prefix, &backend.directory]);
            envs.insert(
                secret::RESTIC_REPOSITORY.to_string(),
                format!("azure:{}:/{}", backend.bucket, path),
            );
            if backend.azure_storage_account.is_empty() {
                return Err(Error::Config("missing storage account for Azure storage".to_string()));
            }
            envs.insert(
                secret::AZURE_ACCOUNT_NAME.to_string(),
                backend.azure_storage_account.clone(),
            );
            set_env_from_secret(&mut envs, storage, secret::AZURE_ACCOUNT_KEY, false).map_err(secret_error)?;
        }
        Provider::Gcs => {
            let path = join_segments(&[&backend.prefix, &backend.directory]);
            envs.insert(
                secret::RESTIC_REPOSITORY.to_string(),
                format!("gs:{}:/{}", backend.bucket, path),
            );
            if let Some(data) = storage.and_then(|s| s.get(secret::GOOGLE_SERVICE_ACCOUNT_JSON_KEY)) {
                let path = write_secret_file(&tmp_dir, secret::GOOGLE_SERVICE_ACCOUNT_JSON_KEY, data).await?;
                envs.insert(
                    secret::GOOGLE_APPLICATION_CREDENTIALS.to_string(),
                    path.display().to_string(),
                );
            }
            set_env_from_secret(&mut envs, storage, secret::GOOGLE_PROJECT_ID, false).map_err(secret_error)?;
        }
        Provider::B2 => {
            let path = join_segments(&[&backend.prefix, &backend.directory]);
            envs.insert(
                secret::RESTIC_REPOSITORY.to_string(),
                format!("b2:{}:{}", backend.bucket, path),
            );
            set_env_from_secret(&mut envs, storage, secret::B2_ACCOUNT_ID, false).map_err(secret_error)?;
            set_env_from_secret(&mut envs, storage, secret::B2_ACCOUNT_KEY, false).map_err(secret_error)?;
        }
    }

    debug!(
        repository = %backend.repository,
        provider = %provider,
        env_keys = ?envs.keys().collect::<Vec<_>>(),
        "backend environment resolved"
    );
    backend.envs = envs;
    Ok(())
}

fn set_env_from_secret(
    envs: &mut BTreeMap<String, String>,
    secret: Option<&Secret>,
    key: &str,
    required: bool,
) -> Result<()> {
    let Some(secret) = secret else {
        if required {
            return Err(Error::Config("storage secret is required".to_string()));
        }
        return Ok(());
    };
    match secret.get(key) {
        Some(value) => {
            envs.insert(key.to_string(), String::from_utf8_lossy(value).into_owned());
            Ok(())
        }
        None if required => Err(Error::Config(format!(
            "{} storage secret missing {key} key",
            secret.name
        ))),
        None => Ok(()),
    }
}

async fn create_tmp_dir(scratch_dir: &Path, repository: &str) -> Result<PathBuf> {
    let base = Path::new(repository)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repository".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let dir = scratch_dir.join(format!("{base}-tmp-{}", &suffix[..8]));
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

async fn write_secret_file(dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf> {
    let path = dir.join(name);
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(&path).await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, data).await?;
    Ok(path)
}

/// Joins path segments with `/`, skipping empty ones.
fn join_segments(segments: &[&str]) -> String {
    segments
        .iter()
        .flat_map(|s| s.split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
