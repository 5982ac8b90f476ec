//! IAP tunnel startup.

use std::time::Duration;

use tempfile::TempPath;

use super::{CleanupFuture, Step, StepAction, StepFuture};
use crate::context::{BuildContext, BuildError};
use crate::tunnel::{self, TunnelError, TunnelLauncher, TunnelProcess};

/// Maximum launch attempts before the tunnel is declared unreachable.
const MAX_LAUNCH_TRIES: u32 = 11;
/// Backoff after the first failed attempt; doubles per retry.
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(200);
/// Backoff ceiling between attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Routes the communicator through an IAP tunnel.
///
/// Allocates a local port, writes a one-shot helper script combining
/// account activation and the tunnel command, launches it with retries for
/// the transient permission-settling errors the SDK is known to emit, and
/// rewrites the communicator port to the tunnel's local end. The helper
/// script file lives exactly as long as this step.
pub struct StartTunnel {
    launcher: Box<dyn TunnelLauncher>,
    process: Option<Box<dyn TunnelProcess>>,
    script: Option<TempPath>,
}

impl StartTunnel {
    /// Creates the step around a platform launcher, chosen at assembly
    /// time.
    #[must_use]
    pub fn new(launcher: Box<dyn TunnelLauncher>) -> Self {
        Self {
            launcher,
            process: None,
            script: None,
        }
    }
}

impl Step for StartTunnel {
    fn name(&self) -> &'static str {
        "start-tunnel"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a> {
        Box::pin(async move {
            let Some(instance) = ctx.instance_name.clone() else {
                return ctx.fail(BuildError::MissingState {
                    what: "instance name for tunnel",
                });
            };

            ctx.ui.say("Starting IAP tunnel...");
            let iap = ctx.config.iap();
            let local_port = match tunnel::pick_local_port(iap.local_port).await {
                Ok(port) => port,
                Err(err) => return ctx.fail(BuildError::Tunnel(err)),
            };

            let args = vec![
                String::from("compute"),
                String::from("start-iap-tunnel"),
                instance,
                ctx.comm.port.to_string(),
                format!("--local-host-port=localhost:{local_port}"),
                String::from("--zone"),
                ctx.config.zone.clone(),
                String::from("--project"),
                ctx.config.project_id.clone(),
            ];
            let account_file = ctx.config.account_file.clone();
            let written = tunnel::write_launch_script(&iap, account_file.as_deref(), &args);
            let (guard, script_path) = match written {
                Ok(script) => script,
                Err(err) => return ctx.fail(BuildError::Tunnel(err)),
            };
            self.script = Some(guard);

            let launch_wait = Duration::from_secs(iap.launch_wait);
            let mut delay = INITIAL_RETRY_DELAY;
            let mut attempt = 0_u32;
            let process = loop {
                attempt += 1;
                if ctx.cancel.is_cancelled() {
                    return ctx.fail(BuildError::Cancelled);
                }
                match self.launcher.launch(&script_path, launch_wait).await {
                    Ok(process) => break process,
                    Err(TunnelError::Retryable { message }) if attempt < MAX_LAUNCH_TRIES => {
                        tracing::debug!(attempt, %message, "retrying tunnel launch");
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2).min(MAX_RETRY_DELAY);
                    }
                    Err(err) => return ctx.fail(BuildError::Tunnel(err)),
                }
            };

            self.process = Some(process);
            ctx.ui.message(&format!(
                "Tunnel is up; communicator rerouted to localhost:{local_port}"
            ));
            ctx.comm.host = Some(String::from("localhost"));
            ctx.comm.port = local_port;
            StepAction::Continue
        })
    }

    fn cleanup<'a>(&'a mut self, ctx: &'a mut BuildContext) -> CleanupFuture<'a> {
        Box::pin(async move {
            if let Some(mut process) = self.process.take() {
                ctx.ui.say("Stopping IAP tunnel...");
                if let Err(err) = process.stop() {
                    ctx.ui.error(&format!("Error stopping tunnel: {err}"));
                }
            }
            self.script = None;
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use camino::Utf8Path;

    use super::*;
    use crate::test_support::{MockBackend, build_context};
    use crate::tunnel::LaunchFuture;

    /// Launcher double that fails a fixed number of times, then succeeds.
    struct FlakyLauncher {
        failures_left: AtomicU32,
        retryable: bool,
        launches: Arc<AtomicU32>,
    }

    struct NoopProcess {
        stopped: Arc<AtomicU32>,
    }

    impl TunnelProcess for NoopProcess {
        fn stop(&mut self) -> Result<(), TunnelError> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl TunnelLauncher for FlakyLauncher {
        fn launch<'a>(&'a self, _script: &'a Utf8Path, _wait: Duration) -> LaunchFuture<'a> {
            Box::pin(async move {
                self.launches.fetch_add(1, Ordering::SeqCst);
                if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                    if self.retryable {
                        Err(TunnelError::Retryable {
                            message: String::from("4033: not authorized"),
                        })
                    } else {
                        Err(TunnelError::Launch {
                            message: String::from("invalid flag"),
                        })
                    }
                } else {
                    Ok(Box::new(NoopProcess {
                        stopped: Arc::new(AtomicU32::new(0)),
                    }) as Box<dyn TunnelProcess>)
                }
            })
        }
    }

    fn tunnel_context() -> BuildContext {
        let mut ctx = build_context(MockBackend::default());
        ctx.instance_name = Some(String::from("kiln-test-instance"));
        ctx.config.use_iap = true;
        ctx
    }

    #[tokio::test]
    async fn retries_transient_failures_and_rewrites_the_port() {
        let launches = Arc::new(AtomicU32::new(0));
        let mut step = StartTunnel::new(Box::new(FlakyLauncher {
            failures_left: AtomicU32::new(2),
            retryable: true,
            launches: Arc::clone(&launches),
        }));
        let mut ctx = tunnel_context();
        let original_port = ctx.comm.port;

        let action = step.run(&mut ctx).await;
        assert_eq!(action, StepAction::Continue);
        assert_eq!(launches.load(Ordering::SeqCst), 3);
        assert_ne!(ctx.comm.port, original_port);
        assert_eq!(ctx.comm.host.as_deref(), Some("localhost"));
    }

    #[tokio::test]
    async fn fatal_launch_errors_do_not_retry() {
        let launches = Arc::new(AtomicU32::new(0));
        let mut step = StartTunnel::new(Box::new(FlakyLauncher {
            failures_left: AtomicU32::new(5),
            retryable: false,
            launches: Arc::clone(&launches),
        }));
        let mut ctx = tunnel_context();

        let action = step.run(&mut ctx).await;
        assert_eq!(action, StepAction::Halt);
        assert_eq!(launches.load(Ordering::SeqCst), 1);
        assert!(matches!(
            ctx.error,
            Some(BuildError::Tunnel(TunnelError::Launch { .. }))
        ));
    }

    #[tokio::test]
    async fn cleanup_stops_the_owned_process() {
        let stopped = Arc::new(AtomicU32::new(0));
        let mut step = StartTunnel::new(Box::new(UnusedLauncher));
        step.process = Some(Box::new(NoopProcess {
            stopped: Arc::clone(&stopped),
        }));
        let mut ctx = tunnel_context();

        step.cleanup(&mut ctx).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(step.process.is_none());
    }

    struct UnusedLauncher;

    impl TunnelLauncher for UnusedLauncher {
        fn launch<'a>(&'a self, _script: &'a Utf8Path, _wait: Duration) -> LaunchFuture<'a> {
            Box::pin(async { panic!("launcher must not be used") })
        }
    }
}
