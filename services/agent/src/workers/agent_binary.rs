//! AgentBinary attribute: stage a new build of this agent.
//!
//! `Value` is the target version, `Args[0]` the download URL and `Args[1]`
//! the expected SHA-256 (hex). The verified binary is written next to the
//! running executable as `<exe>.<version>.staged`; swapping it in is up to
//! the service manager.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tether_state::{ActualStatus, Attempt, DesiredAttribute, Microcontroller};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Version of the running agent.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct AgentBinaryMicrocontroller {
    client: reqwest::Client,
    running_version: String,
    /// Current executable; resolved on first use when unset.
    exe: Option<PathBuf>,
}

impl AgentBinaryMicrocontroller {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            running_version: AGENT_VERSION.to_string(),
            exe: None,
        }
    }

    /// Pretend to be `version` running from `exe`.
    pub fn for_executable(version: impl Into<String>, exe: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            running_version: version.into(),
            exe: Some(exe.into()),
        }
    }

    fn exe(&mut self) -> Result<&Path> {
        let exe = match self.exe.take() {
            Some(exe) => exe,
            None => std::env::current_exe().context("failed to resolve current executable")?,
        };
        Ok(self.exe.insert(exe).as_path())
    }

    async fn stage(
        &mut self,
        cancel: &CancellationToken,
        version: &str,
        url: &str,
        sha256: &str,
    ) -> Result<PathBuf> {
        let exe = self.exe()?.to_path_buf();
        let file_name = exe
            .file_name()
            .ok_or_else(|| anyhow!("executable path {} has no file name", exe.display()))?
            .to_string_lossy()
            .into_owned();
        let staged = exe.with_file_name(format!("{file_name}.{version}.staged"));

        if let Ok(existing) = tokio::fs::read(&staged).await {
            if digest_matches(&existing, sha256) {
                debug!(path = %staged.display(), "Binary already staged");
                return Ok(staged);
            }
        }

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => bail!("download of {url} cancelled"),
            body = self.download(url) => body?,
        };

        if !digest_matches(&body, sha256) {
            bail!(
                "checksum mismatch for {url}: expected {sha256}, got {}",
                hex::encode(Sha256::digest(&body))
            );
        }

        let tmp = staged.with_file_name(format!("{file_name}.{version}.staged.tmp"));
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o755))
                .await
                .with_context(|| format!("failed to mark {} executable", tmp.display()))?;
        }
        tokio::fs::rename(&tmp, &staged)
            .await
            .with_context(|| format!("failed to move binary into {}", staged.display()))?;

        Ok(staged)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to download {url}"))?
            .error_for_status()
            .with_context(|| format!("failed to download {url}"))?;

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

impl Default for AgentBinaryMicrocontroller {
    fn default() -> Self {
        Self::new()
    }
}

/// A version must be usable as part of a file name next to the executable.
fn check_version(version: &str) -> Result<()> {
    if version.is_empty()
        || version == "."
        || version == ".."
        || version.contains('\0')
        || version.chars().any(std::path::is_separator)
    {
        bail!("agent binary version {version:?} is not a plain file name component");
    }
    Ok(())
}

fn digest_matches(bytes: &[u8], expected_hex: &str) -> bool {
    hex::encode(Sha256::digest(bytes)).eq_ignore_ascii_case(expected_hex.trim())
}

#[async_trait]
impl Microcontroller for AgentBinaryMicrocontroller {
    async fn achieve(&mut self, cancel: &CancellationToken, desired: &DesiredAttribute) -> Attempt {
        let version = desired.value.trim();
        if version == self.running_version {
            return Attempt::finished(format!("running {version}"));
        }

        if let Err(e) = check_version(version) {
            return Attempt::failed(ActualStatus::Undefined, "", e);
        }

        let (url, sha256) = match desired.args.as_slice() {
            [url, sha256, ..] => (url.as_str(), sha256.as_str()),
            _ => {
                return Attempt::failed(
                    ActualStatus::Undefined,
                    "",
                    anyhow!("agent binary attribute needs Args [url, sha256]"),
                )
            }
        };

        match self.stage(cancel, version, url, sha256).await {
            Ok(staged) => {
                info!(version = %version, path = %staged.display(), "Agent binary staged");
                Attempt::finished(staged.display().to_string())
            }
            Err(e) => {
                warn!(version = %version, error = %e, "Failed to stage agent binary");
                Attempt::failed(ActualStatus::Pending, "", e)
            }
        }
    }
}
