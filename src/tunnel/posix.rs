//! POSIX tunnel process control.
//!
//! The helper script is spawned as the leader of its own process group so a
//! single negative-pid signal takes down `gcloud` and anything it forked.

use std::process::Stdio;
use std::time::Duration;

use camino::Utf8Path;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::process::{Child, Command};

use super::{LaunchFuture, TunnelError, TunnelLauncher, TunnelProcess, classify_stderr_line};

/// Launches tunnel helpers on POSIX systems.
pub struct PosixLauncher;

impl TunnelLauncher for PosixLauncher {
    fn launch<'a>(&'a self, script: &'a Utf8Path, launch_wait: Duration) -> LaunchFuture<'a> {
        Box::pin(async move {
            let mut command = std::process::Command::new(script.as_str());
            {
                use std::os::unix::process::CommandExt as _;
                command.process_group(0);
            }
            let mut child = Command::from(command)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|err| TunnelError::Launch {
                    message: format!("failed to spawn tunnel helper: {err}"),
                })?;

            if let Err(err) = watch_startup(&mut child, launch_wait).await {
                let mut process = PosixProcess { child };
                process.stop().ok();
                return Err(err);
            }

            tracing::debug!("no error detected after tunnel launch, continuing");
            Ok(Box::new(PosixProcess { child }) as Box<dyn TunnelProcess>)
        })
    }
}

/// Watches the helper's stderr for the launch window, failing fast when the
/// SDK reports an error. The SDK prints no positive acknowledgment outside a
/// TTY, so surviving the window silently counts as success.
async fn watch_startup(child: &mut Child, launch_wait: Duration) -> Result<(), TunnelError> {
    let Some(stderr) = child.stderr.take() else {
        return Ok(());
    };
    let mut lines = BufReader::new(stderr).lines();
    let deadline = tokio::time::Instant::now() + launch_wait;

    loop {
        let next = tokio::time::timeout_at(deadline, lines.next_line()).await;
        match next {
            // Launch window elapsed without a reported error.
            Err(_elapsed) => return Ok(()),
            // Stderr closed; the helper either daemonised or died. A dead
            // helper shows up as a connect failure later, so accept it.
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(line))) => {
                tracing::debug!(stderr = %line, "tunnel helper output");
                if let Some(err) = classify_stderr_line(&line) {
                    return Err(err);
                }
            }
            Ok(Err(err)) => {
                return Err(TunnelError::Launch {
                    message: format!("error reading tunnel helper stderr: {err}"),
                });
            }
        }
    }
}

/// Running tunnel helper owned by the build.
pub struct PosixProcess {
    child: Child,
}

impl TunnelProcess for PosixProcess {
    fn stop(&mut self) -> Result<(), TunnelError> {
        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };
        let raw_pid = i32::try_from(pid).map_err(|err| TunnelError::Stop {
            message: format!("pid {pid} out of range: {err}"),
        })?;

        // Signal the whole process group; fall back to killing the direct
        // child when the group signal is refused.
        let group = Pid::from_raw(-raw_pid);
        if let Err(err) = kill(group, Signal::SIGTERM) {
            tracing::debug!(%err, "process group signal failed, killing child directly");
            self.child.start_kill().map_err(|kill_err| TunnelError::Stop {
                message: kill_err.to_string(),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn launch_surfaces_fatal_stderr_errors() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let script = dir.path().join("fail.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'ERROR: bad flag' >&2\nsleep 5\n")
            .unwrap_or_else(|err| panic!("write: {err}"));
        {
            use std::os::unix::fs::PermissionsExt as _;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o700))
                .unwrap_or_else(|err| panic!("chmod: {err}"));
        }
        let path = Utf8Path::from_path(&script).unwrap_or_else(|| panic!("non-utf8 tempdir"));

        let result = PosixLauncher
            .launch(path, Duration::from_secs(5))
            .await
            .err();
        assert!(
            matches!(result, Some(TunnelError::Launch { ref message }) if message.contains("bad flag")),
            "unexpected result: {result:?}"
        );
    }

    #[tokio::test]
    async fn quiet_helper_survives_the_watch_window() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let script = dir.path().join("quiet.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n")
            .unwrap_or_else(|err| panic!("write: {err}"));
        {
            use std::os::unix::fs::PermissionsExt as _;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o700))
                .unwrap_or_else(|err| panic!("chmod: {err}"));
        }
        let path = Utf8Path::from_path(&script).unwrap_or_else(|| panic!("non-utf8 tempdir"));

        let mut process = PosixLauncher
            .launch(path, Duration::from_millis(100))
            .await
            .unwrap_or_else(|err| panic!("launch: {err}"));
        process.stop().unwrap_or_else(|err| panic!("stop: {err}"));
    }
}
