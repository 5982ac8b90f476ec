//! Startup-script metadata protocol.
//!
//! A script running inside the guest reports progress through a well-known
//! metadata key that the pipeline polls from outside. When wrapping is
//! enabled the operator's script is stored under a secondary key, a wrapper
//! that maintains the status key becomes the real startup script, and the
//! status key is seeded with the not-done sentinel.

/// Metadata key the guest agent executes on boot.
pub const SCRIPT_KEY: &str = "startup-script";
/// Metadata key holding the operator's original script when wrapping is on.
pub const WRAPPED_SCRIPT_KEY: &str = "kiln-wrapped-startup-script";
/// Metadata key the wrapper updates as the script progresses.
pub const STATUS_KEY: &str = "kiln-startup-script-status";
/// Metadata key forcing OS Login on for the instance.
pub const ENABLE_OS_LOGIN_KEY: &str = "enable-oslogin";

/// Status value meaning the script has not finished yet.
pub const STATUS_NOT_DONE: &str = "notdone";
/// Status value meaning the script finished successfully.
pub const STATUS_DONE: &str = "done";
/// Status value meaning the script failed.
pub const STATUS_ERROR: &str = "error";

/// Wrapper installed as the instance's startup script on Linux guests.
///
/// It pulls the operator's script back out of metadata, runs it, and writes
/// the resulting status where the pipeline can poll it.
pub const LINUX_WRAPPER: &str = r#"#!/bin/bash
# Runs the wrapped startup script stored in instance metadata and publishes
# its status for the builder polling from outside the guest.

MD="http://metadata.google.internal/computeMetadata/v1/instance"
INSTANCE=$(curl -s -H "Metadata-Flavor: Google" "${MD}/name")
ZONE=$(curl -s -H "Metadata-Flavor: Google" "${MD}/zone" | awk -F/ '{print $NF}')

SetStatus() {
  gcloud compute instances add-metadata "${INSTANCE}" \
    --metadata "kiln-startup-script-status=$1" --zone "${ZONE}" --no-user-output-enabled
}

SCRIPT=$(mktemp)
curl -s -H "Metadata-Flavor: Google" "${MD}/attributes/kiln-wrapped-startup-script" > "${SCRIPT}"
chmod +x "${SCRIPT}"

"${SCRIPT}"
RC=$?

if [ ${RC} -ne 0 ]; then
  SetStatus error
else
  SetStatus done
fi

exit ${RC}
"#;

/// Placeholder startup script for Windows guests, where wrapping is not
/// supported; the status key is seeded done instead.
pub const WINDOWS_WRAPPER: &str = "";
