//! Provisioning and invocation of the external wharf patch tool.
//!
//! `.pwr` payloads are opaque binary transforms applied by the `butler`
//! binary. The tool is fetched once into `tools/` when absent, marked
//! executable on Unix, and invoked as
//! `butler apply --staging-dir=<staging> <patch> <game_dir>`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::download::{extract_zip, DownloadService, DownloadTask};
use crate::error::{Error, Result};
use crate::progress::{CancelToken, ProgressSink};

/// Diagnostics from the child are capped at this size.
const OUTPUT_BUFFER_LIMIT: u64 = 10 * 1024 * 1024;

const CANCEL_POLL: Duration = Duration::from_millis(200);

fn tool_binary_name() -> &'static str {
    if cfg!(windows) {
        "butler.exe"
    } else {
        "butler"
    }
}

/// Locates, provisions and runs the patch tool.
pub struct PatchTool {
    tools_dir: PathBuf,
    download_url: Option<String>,
    resolved: OnceCell<PathBuf>,
}

impl PatchTool {
    pub fn new(tools_dir: PathBuf, download_url: Option<String>) -> Self {
        Self {
            tools_dir,
            download_url,
            resolved: OnceCell::new(),
        }
    }

    /// Resolve the tool binary, downloading and extracting it on first use.
    pub async fn ensure(
        &self,
        downloads: &DownloadService,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<PathBuf> {
        self.resolved
            .get_or_try_init(|| self.provision(downloads, cancel, sink))
            .await
            .cloned()
    }

    async fn provision(
        &self,
        downloads: &DownloadService,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<PathBuf> {
        let binary = self.tools_dir.join(tool_binary_name());
        if tokio::fs::metadata(&binary).await.is_ok() {
            return Ok(binary);
        }

        let url = self.download_url.as_deref().ok_or_else(|| {
            Error::ConfigCorrupt("patch tool missing and no download URL configured".into())
        })?;

        log::info!("patch tool absent, provisioning from {url}");
        tokio::fs::create_dir_all(&self.tools_dir).await?;

        let archive = self.tools_dir.join("butler-download.zip");
        let task = DownloadTask::new(url, &archive);
        downloads.download_file(&task, cancel, sink).await?;
        extract_zip(&archive, &self.tools_dir).await?;
        let _ = tokio::fs::remove_file(&archive).await;

        if tokio::fs::metadata(&binary).await.is_err() {
            return Err(Error::ConfigCorrupt(format!(
                "patch tool archive did not contain {}",
                tool_binary_name()
            )));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&binary).await?.permissions();
            perms.set_mode(perms.mode() | 0o755);
            tokio::fs::set_permissions(&binary, perms).await?;
        }

        log::info!("patch tool installed at {}", binary.display());
        Ok(binary)
    }

    /// Run `apply` and wait for exit. Cancellation terminates the child and
    /// waits for it to die; a non-zero exit surfaces stderr.
    pub async fn apply(
        &self,
        binary: &Path,
        patch_file: &Path,
        game_dir: &Path,
        staging_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<()> {
        tokio::fs::create_dir_all(staging_dir).await?;

        log::debug!(
            "invoking patch tool: {} apply --staging-dir={} {} {}",
            binary.display(),
            staging_dir.display(),
            patch_file.display(),
            game_dir.display()
        );

        let mut child = Command::new(binary)
            .arg("apply")
            .arg(format!("--staging-dir={}", staging_dir.display()))
            .arg(patch_file)
            .arg(game_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_task = tokio::spawn(drain_capped(stdout));
        let stderr_task = tokio::spawn(drain_capped(stderr));

        let status = loop {
            if cancel.is_cancelled() {
                log::warn!("patch tool cancelled, terminating child");
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Err(Error::Cancelled);
            }
            match tokio::time::timeout(CANCEL_POLL, child.wait()).await {
                Ok(status) => break status?,
                Err(_) => continue,
            }
        };

        let stdout_buf = stdout_task.await.unwrap_or_default();
        let stderr_buf = stderr_task.await.unwrap_or_default();
        if !stdout_buf.is_empty() {
            log::debug!("patch tool stdout: {}", String::from_utf8_lossy(&stdout_buf));
        }

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            let stderr_text = String::from_utf8_lossy(&stderr_buf).trim().to_string();
            log::error!("patch tool failed ({code}): {stderr_text}");
            return Err(Error::PatchApplyFailed {
                code,
                stderr: stderr_text,
            });
        }
        Ok(())
    }
}

async fn drain_capped<R>(reader: Option<R>) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Vec::new();
    };
    let mut buf = Vec::new();
    let mut limited = reader.take(OUTPUT_BUFFER_LIMIT);
    let _ = limited.read_to_end(&mut buf).await;
    buf
}
