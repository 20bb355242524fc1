//! Line-discipline configuration through the platform `stty` utility.
//!
//! Baud rate, parity, flow control and raw mode are never set through termios
//! directly; the device path is handed to `stty` as a subprocess, exactly as an
//! operator would at a shell. Applying settings is best effort: some platforms
//! report permission errors to regular users even when the change took effect,
//! so failures are logged and otherwise ignored.

use crate::error::{LabError, LabResult};
use tokio::process::Command;
use tracing::{debug, warn};

const STTY: &str = "stty";

#[cfg(target_os = "linux")]
const DEVICE_FLAG: &str = "-F";
#[cfg(not(target_os = "linux"))]
const DEVICE_FLAG: &str = "-f";

/// Query the current settings of `path` in `stty -g` form.
///
/// The returned tokens can be passed back to [`apply`] to restore the
/// configuration verbatim.
pub(crate) async fn query(path: &str) -> LabResult<Vec<String>> {
    let output = Command::new(STTY)
        .arg(DEVICE_FLAG)
        .arg(path)
        .arg("-g")
        .output()
        .await
        .map_err(|e| LabError::Query {
            path: path.to_string(),
            message: format!("failed to run {}: {}", STTY, e),
        })?;

    if !output.status.success() {
        return Err(LabError::Query {
            path: path.to_string(),
            message: format!(
                "{} exited with {}: {}",
                STTY,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .map(str::to_owned)
        .collect())
}

/// Apply `settings` to `path`. Errors are logged, never returned.
pub(crate) async fn apply<S: AsRef<str>>(path: &str, settings: &[S]) {
    if settings.is_empty() {
        return;
    }

    let args: Vec<&str> = settings.iter().map(AsRef::as_ref).collect();
    let result = Command::new(STTY)
        .arg(DEVICE_FLAG)
        .arg(path)
        .args(&args)
        .output()
        .await;

    match result {
        Ok(output) if output.status.success() => {
            debug!(device = path, settings = ?args, "Applied line settings");
        }
        Ok(output) => {
            // Legacy behavior: keep going, the open that follows is authoritative.
            warn!(
                device = path,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "stty reported an error applying line settings"
            );
        }
        Err(e) => {
            warn!(device = path, error = %e, "Failed to run stty");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_query_missing_device_fails() {
        let result = query("/nonexistent/labctl-test-device").await;
        assert!(matches!(result, Err(LabError::Query { .. })));
    }

    #[tokio::test]
    async fn test_apply_empty_settings_is_noop() {
        let empty: [&str; 0] = [];
        apply("/nonexistent/labctl-test-device", &empty).await;
    }

    #[tokio::test]
    async fn test_apply_failure_is_not_fatal() {
        apply("/nonexistent/labctl-test-device", &["9600", "raw"]).await;
    }
}
