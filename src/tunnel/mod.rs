//! IAP tunnel helper process management.
//!
//! The tunnel is started by shelling out to the cloud SDK: a one-shot helper
//! script combines account activation and the tunnel command, gets launched
//! as a subprocess, and is watched for startup errors. Ownership of the
//! running process sits behind [`TunnelProcess`] so termination can differ
//! per platform: POSIX signals the whole process group, other platforms
//! refuse with an explicit error at launch time.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use tempfile::TempPath;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::IapSettings;

#[cfg(unix)]
mod posix;

/// First port probed when no fixed local port is configured.
const PORT_RANGE_START: u16 = 8000;
/// Last port probed when no fixed local port is configured.
const PORT_RANGE_END: u16 = 9000;

/// Errors raised while managing the tunnel helper.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TunnelError {
    /// Raised when no local port could be allocated for the tunnel.
    #[error("no free local port for the tunnel: {message}")]
    Port {
        /// Underlying bind failure.
        message: String,
    },
    /// Raised when the helper script cannot be written.
    #[error("failed to prepare tunnel helper script: {message}")]
    Script {
        /// Underlying write failure.
        message: String,
    },
    /// Startup failure worth retrying: the backend side of the tunnel often
    /// needs a minute before permissions settle.
    #[error("tunnel start: {message}")]
    Retryable {
        /// Stderr line reported by the helper.
        message: String,
    },
    /// Startup failure that retrying will not fix.
    #[error("tunnel launch failed: {message}")]
    Launch {
        /// Stderr line or spawn failure reported by the helper.
        message: String,
    },
    /// Raised when stopping the helper fails.
    #[error("failed to stop tunnel: {message}")]
    Stop {
        /// Underlying signal or kill failure.
        message: String,
    },
    /// Raised on platforms without tunnel process control.
    #[error("IAP tunnels are not supported on {os}")]
    Unsupported {
        /// Operating system name.
        os: String,
    },
}

/// A launched tunnel helper whose lifetime the build owns.
pub trait TunnelProcess: Send {
    /// Stops the helper and everything it spawned.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Stop`] when the process cannot be signalled.
    fn stop(&mut self) -> Result<(), TunnelError>;
}

/// Future returned by [`TunnelLauncher::launch`].
pub type LaunchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Box<dyn TunnelProcess>, TunnelError>> + Send + 'a>>;

/// Starts tunnel helper processes. One implementation per platform,
/// selected when the step list is assembled.
pub trait TunnelLauncher: Send + Sync {
    /// Launches `script` and watches it for `launch_wait` before declaring
    /// the tunnel up.
    fn launch<'a>(&'a self, script: &'a Utf8Path, launch_wait: Duration) -> LaunchFuture<'a>;
}

/// Launcher for the platform this binary runs on.
#[must_use]
pub fn native_launcher() -> Box<dyn TunnelLauncher> {
    #[cfg(unix)]
    {
        Box::new(posix::PosixLauncher)
    }
    #[cfg(not(unix))]
    {
        Box::new(UnsupportedLauncher)
    }
}

/// Launcher that refuses to start tunnels on platforms without process
/// group control.
pub struct UnsupportedLauncher;

impl TunnelLauncher for UnsupportedLauncher {
    fn launch<'a>(&'a self, _script: &'a Utf8Path, _launch_wait: Duration) -> LaunchFuture<'a> {
        Box::pin(async {
            Err(TunnelError::Unsupported {
                os: std::env::consts::OS.to_owned(),
            })
        })
    }
}

/// Picks the local port the tunnel will listen on.
///
/// A configured port is verified by binding it once; otherwise the
/// 8000-9000 range is scanned for the first free port.
///
/// # Errors
///
/// Returns [`TunnelError::Port`] when no port can be bound.
pub async fn pick_local_port(requested: Option<u16>) -> Result<u16, TunnelError> {
    if let Some(port) = requested {
        return match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(_listener) => Ok(port),
            Err(err) => Err(TunnelError::Port {
                message: format!("configured port {port} is not available: {err}"),
            }),
        };
    }

    for port in PORT_RANGE_START..=PORT_RANGE_END {
        if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
            return Ok(port);
        }
    }
    Err(TunnelError::Port {
        message: format!("no free port between {PORT_RANGE_START} and {PORT_RANGE_END}"),
    })
}

/// Writes the one-shot helper script combining `gcloud` account activation
/// and the tunnel command. The file is removed when the returned handle
/// drops.
///
/// # Errors
///
/// Returns [`TunnelError::Script`] when the file cannot be created.
pub fn write_launch_script(
    iap: &IapSettings,
    account_file: Option<&str>,
    args: &[String],
) -> Result<(TempPath, Utf8PathBuf), TunnelError> {
    let mut contents = String::new();
    if !iap.hashbang.is_empty() {
        contents.push_str(&format!("#!{}\n", iap.hashbang));
    }
    if let Some(key_file) = account_file.filter(|path| !path.is_empty()) {
        contents.push_str(&format!(
            "gcloud auth activate-service-account --key-file={}\n",
            escape(key_file.into())
        ));
    }
    let mut command = vec![String::from("gcloud")];
    command.extend(args.iter().cloned());
    contents.push_str(&command.join(" "));
    contents.push('\n');

    let mut file = tempfile::Builder::new()
        .prefix("kiln-tunnel")
        .suffix(&iap.ext)
        .tempfile()
        .map_err(|err| TunnelError::Script {
            message: err.to_string(),
        })?;
    {
        use std::io::Write as _;
        file.as_file_mut()
            .write_all(contents.as_bytes())
            .map_err(|err| TunnelError::Script {
                message: err.to_string(),
            })?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let perms = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(file.path(), perms).map_err(|err| TunnelError::Script {
            message: err.to_string(),
        })?;
    }

    let path = Utf8PathBuf::from_path_buf(file.path().to_path_buf()).map_err(|non_utf8| {
        TunnelError::Script {
            message: format!("helper script path is not UTF-8: {}", non_utf8.display()),
        }
    })?;
    Ok((file.into_temp_path(), path))
}

/// Classifies one stderr line from the helper during the launch watch.
///
/// Codes 4033 (permissions still settling) and 4003 (transient backend
/// connect failure) are worth retrying; any other reported error is final.
#[must_use]
pub(crate) fn classify_stderr_line(line: &str) -> Option<TunnelError> {
    if !line.contains("ERROR") {
        return None;
    }
    if line.contains("4033") || line.contains("4003") {
        Some(TunnelError::Retryable {
            message: line.trim().to_owned(),
        })
    } else {
        Some(TunnelError::Launch {
            message: line.trim().to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iap_settings() -> IapSettings {
        IapSettings {
            enabled: true,
            local_port: None,
            hashbang: String::from("/bin/sh"),
            ext: String::from(".sh"),
            launch_wait: 30,
        }
    }

    #[tokio::test]
    async fn scans_for_a_free_port() {
        let port = pick_local_port(None)
            .await
            .unwrap_or_else(|err| panic!("no port: {err}"));
        assert!((PORT_RANGE_START..=PORT_RANGE_END).contains(&port));
    }

    #[tokio::test]
    async fn verifies_a_requested_port() {
        let probe = TcpListener::bind(("127.0.0.1", 0))
            .await
            .unwrap_or_else(|err| panic!("bind: {err}"));
        let taken = probe
            .local_addr()
            .unwrap_or_else(|err| panic!("addr: {err}"))
            .port();
        let result = pick_local_port(Some(taken)).await;
        assert!(matches!(result, Err(TunnelError::Port { .. })));
    }

    #[test]
    fn script_contains_auth_and_tunnel_command() {
        let (_guard, path) = write_launch_script(
            &iap_settings(),
            Some("/tmp/key file.json"),
            &[
                String::from("compute"),
                String::from("start-iap-tunnel"),
                String::from("kiln-abc"),
            ],
        )
        .unwrap_or_else(|err| panic!("script: {err}"));

        let contents =
            std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("read: {err}"));
        assert!(contents.starts_with("#!/bin/sh\n"), "contents: {contents}");
        assert!(
            contents.contains("gcloud auth activate-service-account --key-file='/tmp/key file.json'"),
            "contents: {contents}"
        );
        assert!(
            contents.contains("gcloud compute start-iap-tunnel kiln-abc"),
            "contents: {contents}"
        );
        assert!(path.as_str().ends_with(".sh"), "path: {path}");
    }

    #[test]
    fn script_file_is_removed_on_drop() {
        let (guard, path) = write_launch_script(&iap_settings(), None, &[String::from("version")])
            .unwrap_or_else(|err| panic!("script: {err}"));
        assert!(path.as_std_path().exists());
        drop(guard);
        assert!(!path.as_std_path().exists());
    }

    #[test]
    fn stderr_classification_matches_the_sdk_codes() {
        assert!(classify_stderr_line("all good").is_none());
        assert!(matches!(
            classify_stderr_line("ERROR: (gcloud) 4033: not authorized"),
            Some(TunnelError::Retryable { .. })
        ));
        assert!(matches!(
            classify_stderr_line("ERROR: (gcloud) 4003: failed to connect to backend"),
            Some(TunnelError::Retryable { .. })
        ));
        assert!(matches!(
            classify_stderr_line("ERROR: (gcloud) invalid flag"),
            Some(TunnelError::Launch { .. })
        ));
    }
}
