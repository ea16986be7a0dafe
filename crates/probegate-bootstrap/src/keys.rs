//! Probe keypair management via `ssh-keygen`

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

use crate::error::BootstrapError;

/// The probe's SSH identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: PathBuf,
    /// OpenSSH public key line (`ssh-ed25519 AAAA... comment`)
    pub public_key: String,
}

#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Return the existing keypair, generating one on first use
    async fn ensure_keypair(&self) -> Result<KeyPair, BootstrapError>;
}

/// Generates an ed25519 key with the system `ssh-keygen`
#[derive(Debug, Clone)]
pub struct SshKeygenProvider {
    private_key: PathBuf,
    comment: String,
    program: PathBuf,
}

impl SshKeygenProvider {
    pub fn new(private_key: impl Into<PathBuf>, comment: impl Into<String>) -> Self {
        Self {
            private_key: private_key.into(),
            comment: comment.into(),
            program: PathBuf::from("ssh-keygen"),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn public_key_path(&self) -> PathBuf {
        public_key_path(&self.private_key)
    }

    async fn generate(&self) -> Result<(), BootstrapError> {
        if let Some(parent) = self.private_key.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                BootstrapError::Fatal(format!("Failed to create key directory {}: {}", parent.display(), e))
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = tokio::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).await;
            }
        }

        info!(path = %self.private_key.display(), "Generating new ed25519 key pair");
        let output = Command::new(&self.program)
            .arg("-q")
            .args(["-t", "ed25519", "-N", "", "-C", &self.comment, "-f"])
            .arg(&self.private_key)
            .output()
            .await
            .map_err(|e| BootstrapError::Fatal(format!("Failed to run ssh-keygen: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BootstrapError::Fatal(format!("ssh-keygen failed: {}", stderr.trim())));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.private_key, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| BootstrapError::Fatal(format!("Failed to set key permissions: {}", e)))?;
        }

        Ok(())
    }
}

/// `id_ed25519` -> `id_ed25519.pub`
fn public_key_path(private_key: &Path) -> PathBuf {
    let mut path = private_key.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

#[async_trait]
impl KeyProvider for SshKeygenProvider {
    async fn ensure_keypair(&self) -> Result<KeyPair, BootstrapError> {
        let public_path = self.public_key_path();

        if self.private_key.exists() && public_path.exists() {
            info!(path = %self.private_key.display(), "Using existing SSH key");
        } else {
            self.generate().await?;
        }

        let public_key = tokio::fs::read_to_string(&public_path)
            .await
            .map_err(|e| BootstrapError::Fatal(format!("Failed to read {}: {}", public_path.display(), e)))?
            .trim()
            .to_string();

        if public_key.is_empty() {
            return Err(BootstrapError::Fatal(format!("{} is empty", public_path.display())));
        }

        Ok(KeyPair {
            private_key: self.private_key.clone(),
            public_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_public_key_path() {
        assert_eq!(
            public_key_path(Path::new("/root/.ssh/id_ed25519")),
            PathBuf::from("/root/.ssh/id_ed25519.pub")
        );
    }

    #[tokio::test]
    async fn test_existing_keypair_is_reused() {
        let temp = TempDir::new().unwrap();
        let private = temp.path().join("id_ed25519");
        std::fs::write(&private, "PRIVATE").unwrap();
        std::fs::write(temp.path().join("id_ed25519.pub"), "ssh-ed25519 AAAAexisting probe\n").unwrap();

        // A missing ssh-keygen proves nothing is regenerated
        let provider = SshKeygenProvider::new(&private, "probe").with_program("/nonexistent/ssh-keygen");
        let keypair = provider.ensure_keypair().await.unwrap();
        assert_eq!(keypair.public_key, "ssh-ed25519 AAAAexisting probe");
        assert_eq!(keypair.private_key, private);
    }

    #[tokio::test]
    async fn test_missing_ssh_keygen_is_fatal() {
        let temp = TempDir::new().unwrap();
        let provider = SshKeygenProvider::new(temp.path().join("id_ed25519"), "probe")
            .with_program("/nonexistent/ssh-keygen");
        let err = provider.ensure_keypair().await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
