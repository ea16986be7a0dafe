//! Proxy-side credentials: the `authorized_keys` file of the tunnel account
//!
//! Every probe gets one restricted line that only allows a remote forward on
//! its own port. Lines are keyed by the device name in the comment field.
//! Rewrites go through a temp file and a rename so sshd never reads a
//! half-written file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::CredentialError;

const KEY_OPTIONS: &str = "command=\"/bin/false\",no-pty,no-X11-forwarding,no-agent-forwarding";

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Install or replace the key for `name`; `false` if already identical
    async fn install(&self, name: &str, port: u16, public_key: &str) -> Result<bool, CredentialError>;

    /// Remove the key for `name`; `false` if there was none
    async fn revoke(&self, name: &str) -> Result<bool, CredentialError>;

    async fn is_installed(&self, name: &str) -> Result<bool, CredentialError>;
}

/// Build the restricted `authorized_keys` line for one probe
pub fn authorized_key_line(public_key: &str, port: u16, name: &str) -> Result<String, CredentialError> {
    let mut parts = public_key.split_whitespace();
    let (key_type, key_data) = match (parts.next(), parts.next()) {
        (Some(t), Some(d)) => (t, d),
        _ => {
            return Err(CredentialError::MalformedKey(
                "expected '<type> <base64>'".to_string(),
            ))
        }
    };

    let known_type = key_type.starts_with("ssh-")
        || key_type.starts_with("ecdsa-")
        || key_type.starts_with("sk-");
    if !known_type {
        return Err(CredentialError::MalformedKey(format!("unsupported key type '{}'", key_type)));
    }

    let valid_data = key_data
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='));
    if !valid_data {
        return Err(CredentialError::MalformedKey("key data is not base64".to_string()));
    }

    Ok(format!(
        "{},permitlisten=\"localhost:{}\" {} {} {}",
        KEY_OPTIONS, port, key_type, key_data, name
    ))
}

fn line_name(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    trimmed.split_whitespace().last()
}

/// An `authorized_keys` file on the proxy host
#[derive(Debug)]
pub struct AuthorizedKeysFile {
    path: PathBuf,
    // Serialises read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl AuthorizedKeysFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_lines(&self) -> Result<Vec<String>, CredentialError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_lines(&self, lines: &[String]) -> Result<(), CredentialError> {
        let mut contents = lines.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".probegate.tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&tmp, contents).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for AuthorizedKeysFile {
    async fn install(&self, name: &str, port: u16, public_key: &str) -> Result<bool, CredentialError> {
        let line = authorized_key_line(public_key, port, name)?;
        let _guard = self.lock.lock().await;

        let mut lines = self.read_lines().await?;
        if lines.iter().any(|l| l.trim() == line) {
            debug!(name, "Key already installed");
            return Ok(false);
        }

        lines.retain(|l| line_name(l) != Some(name));
        lines.push(line);
        self.write_lines(&lines).await?;

        info!(name, port, path = %self.path.display(), "Installed probe key");
        Ok(true)
    }

    async fn revoke(&self, name: &str) -> Result<bool, CredentialError> {
        let _guard = self.lock.lock().await;

        let lines = self.read_lines().await?;
        let before = lines.len();
        let kept: Vec<String> = lines.into_iter().filter(|l| line_name(l) != Some(name)).collect();

        if kept.len() == before {
            debug!(name, "No key to revoke");
            return Ok(false);
        }

        self.write_lines(&kept).await?;
        info!(name, path = %self.path.display(), "Revoked probe key");
        Ok(true)
    }

    async fn is_installed(&self, name: &str) -> Result<bool, CredentialError> {
        let lines = self.read_lines().await?;
        Ok(lines.iter().any(|l| line_name(l) == Some(name)))
    }
}
