use crate::options::KeyOptions;
use crate::wrapper::ResticWrapper;
use resticwrap_core::output::extract_keys;
use resticwrap_core::{KeyInfo, Result};
use tracing::info;

impl ResticWrapper {
    pub async fn add_key(&self, repository: &str, options: &KeyOptions) -> Result<()> {
        info!(repository, user = %options.user, host = %options.host, "adding new key to restic repository");
        self.run(vec![self.add_key_command(repository, options)]).await?;
        Ok(())
    }

    pub async fn list_keys(&self, repository: &str) -> Result<Vec<KeyInfo>> {
        info!(repository, "listing restic keys");
        let out = self.run(vec![self.list_keys_command(repository)]).await?;
        extract_keys(&out)
    }

    /// Changes the password of the key currently in use.
    pub async fn update_key(&self, repository: &str, options: &KeyOptions) -> Result<()> {
        info!(repository, "updating restic key");
        self.run(vec![self.update_key_command(repository, options)]).await?;
        Ok(())
    }

    pub async fn remove_key(&self, repository: &str, options: &KeyOptions) -> Result<()> {
        info!(repository, id = %options.id, "removing restic key");
        self.run(vec![self.remove_key_command(repository, options)]).await?;
        Ok(())
    }
}
