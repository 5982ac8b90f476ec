//! Instance readiness and address resolution.

use super::{Step, StepAction, StepFuture};
use crate::context::{BuildContext, BuildError};

/// Instance status that means the machine is up.
const STATUS_RUNNING: &str = "RUNNING";

/// Waits for the instance to reach `RUNNING`, then resolves the address the
/// communicator should use (external NAT IP, or the internal IP when the
/// build asked for it).
#[derive(Clone, Copy, Debug, Default)]
pub struct InstanceInfo;

impl Step for InstanceInfo {
    fn name(&self) -> &'static str {
        "instance-info"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a> {
        Box::pin(async move {
            let Some(name) = ctx.instance_name.clone() else {
                return ctx.fail(BuildError::MissingState {
                    what: "instance name for readiness wait",
                });
            };
            let zone = ctx.config.zone.clone();

            ctx.ui.say("Waiting for the instance to become running...");
            let wait = ctx.backend.wait_for_instance(STATUS_RUNNING, &zone, &name);
            if let Err(err) = wait
                .await_within(ctx.state_timeout, "instance to become running")
                .await
            {
                return ctx.fail(BuildError::Backend(err));
            }

            let lookup = if ctx.config.use_internal_ip {
                ctx.backend.get_internal_ip(&zone, &name).await
            } else {
                ctx.backend.get_nat_ip(&zone, &name).await
            };
            let ip = match lookup {
                Ok(Some(ip)) if !ip.is_empty() => ip,
                Ok(_) => return ctx.fail(BuildError::NoInstanceAddress { name }),
                Err(err) => return ctx.fail(BuildError::Backend(err)),
            };

            ctx.ui.message(&format!("Instance IP: {ip}"));
            ctx.comm.host = Some(ip.clone());
            ctx.instance_ip = Some(ip);
            StepAction::Continue
        })
    }
}
