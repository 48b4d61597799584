use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use log::info;
use tokio::process::Command;

const PLASMA_SERVICE: &str = "org.kde.plasmashell";
const PLASMA_OBJECT: &str = "/PlasmaShell";
const PLASMA_INTERFACE: &str = "org.kde.PlasmaShell";

#[derive(Debug, thiserror::Error)]
pub(crate) enum ApplyError {
    #[error("resolve image path {}", .path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("run {}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}", format_failure(.status, .stdout, .stderr))]
    Failed {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
}

/// Paints a local image file as the wallpaper of one monitor.
pub(crate) trait DesktopApplier {
    async fn apply(&self, image: &Path, monitor: u32) -> Result<(), ApplyError>;
}

/// Sets the wallpaper through `org.kde.PlasmaShell.setWallpaper` on the
/// session bus, using `busctl` to make the call.
pub(crate) struct PlasmaApplier {
    busctl_bin: PathBuf,
    plugin: String,
}

impl PlasmaApplier {
    pub(crate) fn new(busctl_bin: PathBuf, plugin: String) -> Self {
        PlasmaApplier { busctl_bin, plugin }
    }
}

impl DesktopApplier for PlasmaApplier {
    async fn apply(&self, image: &Path, monitor: u32) -> Result<(), ApplyError> {
        let absolute = tokio::fs::canonicalize(image)
            .await
            .map_err(|source| ApplyError::Path {
                path: image.to_path_buf(),
                source,
            })?;
        let args = set_wallpaper_args(&self.plugin, &absolute, monitor);
        let output = Command::new(&self.busctl_bin)
            .args(&args)
            .output()
            .await
            .map_err(|source| ApplyError::Spawn {
                program: self.busctl_bin.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ApplyError::Failed {
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        info!("wallpaper on monitor {} set to {}", monitor, absolute.display());
        Ok(())
    }
}

/// `busctl` arguments for `setWallpaper(s plugin, a{sv} config, u screen)`.
pub(crate) fn set_wallpaper_args(plugin: &str, image: &Path, monitor: u32) -> Vec<String> {
    vec![
        "--user".to_string(),
        "call".to_string(),
        PLASMA_SERVICE.to_string(),
        PLASMA_OBJECT.to_string(),
        PLASMA_INTERFACE.to_string(),
        "setWallpaper".to_string(),
        "sa{sv}u".to_string(),
        plugin.to_string(),
        "1".to_string(),
        "Image".to_string(),
        "s".to_string(),
        image.to_string_lossy().to_string(),
        monitor.to_string(),
    ]
}

fn format_failure(status: &ExitStatus, stdout: &str, stderr: &str) -> String {
    let mut message = format!("setWallpaper failed ({}).", status);
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    if !stdout.is_empty() {
        message.push_str("\nstdout:\n");
        message.push_str(stdout);
    }
    if !stderr.is_empty() {
        message.push_str("\nstderr:\n");
        message.push_str(stderr);
    }
    message
}
