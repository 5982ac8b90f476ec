//! Windows password reset protocol.
//!
//! The builder publishes RSA public key material under the `windows-keys`
//! metadata entry; the in-guest agent generates a password, encrypts it
//! against that key, and writes a JSON response line to serial port 4. The
//! worker polls that port, matches responses by modulus, and decrypts the
//! password in-process.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::GceBackend;
use super::instance::fetch_instance;
use super::types::{Operation, WireMetadata, WireMetadataItem};
use crate::backend::{BackendError, Pending, WindowsKeyRequest};

/// Metadata key the agent watches for published keys.
const WINDOWS_KEYS_METADATA_KEY: &str = "windows-keys";
/// Serial port the agent writes password responses to.
const PASSWORD_SERIAL_PORT: u8 = 4;
/// How long the worker waits for the agent to answer.
const PASSWORD_WAIT: Duration = Duration::from_secs(180);
/// Spacing between serial port polls.
const PASSWORD_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishedKey<'a> {
    user_name: &'a str,
    modulus: &'a str,
    exponent: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    expire_on: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasswordResponse {
    #[serde(default)]
    modulus: String,
    #[serde(default)]
    encrypted_password: String,
}

/// Extracts candidate responses from raw serial output. Non-JSON lines are
/// normal console noise and are skipped.
fn parse_password_responses(contents: &str) -> Vec<PasswordResponse> {
    contents
        .lines()
        .filter_map(|line| serde_json::from_str::<PasswordResponse>(line.trim()).ok())
        .filter(|response| !response.modulus.is_empty())
        .collect()
}

/// Publishes the key material and returns a handle that resolves to the
/// decrypted plaintext password.
pub(super) async fn reset_windows_password(
    backend: &GceBackend,
    zone: &str,
    name: &str,
    request: WindowsKeyRequest,
) -> Result<Pending<String>, BackendError> {
    let instance = fetch_instance(backend, zone, name).await?;

    let published = PublishedKey {
        user_name: &request.username,
        modulus: request.key.modulus(),
        exponent: request.key.exponent(),
        email: request.email.as_deref(),
        expire_on: request.expires_on.to_rfc3339(),
    };
    let value = serde_json::to_string(&published).map_err(|err| BackendError::Provider {
        message: format!("failed to encode windows key metadata: {err}"),
    })?;

    let mut items: Vec<WireMetadataItem> = instance
        .metadata
        .items
        .into_iter()
        .filter(|item| item.key != WINDOWS_KEYS_METADATA_KEY)
        .collect();
    items.push(WireMetadataItem {
        key: WINDOWS_KEYS_METADATA_KEY.to_owned(),
        value: Some(value),
    });
    let body = WireMetadata {
        fingerprint: instance.metadata.fingerprint,
        items,
    };

    let operation: Operation = backend
        .post_json(
            &backend.project_url(&format!("zones/{zone}/instances/{name}/setMetadata")),
            &body,
        )
        .await?;

    let worker = backend.clone();
    let zone_owned = zone.to_owned();
    let name_owned = name.to_owned();
    Ok(Pending::spawn(async move {
        worker
            .wait_zone_operation(&zone_owned, &operation.name)
            .await?;
        await_password(&worker, &zone_owned, &name_owned, &request).await
    }))
}

/// Polls serial port 4 until a response matching our modulus appears, then
/// decrypts it.
async fn await_password(
    backend: &GceBackend,
    zone: &str,
    name: &str,
    request: &WindowsKeyRequest,
) -> Result<String, BackendError> {
    let deadline = tokio::time::Instant::now() + PASSWORD_WAIT;

    while tokio::time::Instant::now() < deadline {
        if let Ok(contents) =
            super::instance::serial_output(backend, zone, name, PASSWORD_SERIAL_PORT).await
        {
            for response in parse_password_responses(&contents) {
                if response.modulus == request.key.modulus() {
                    return request
                        .key
                        .decrypt_password(&response.encrypted_password)
                        .map_err(|err| BackendError::Provider {
                            message: err.to_string(),
                        });
                }
            }
        }
        tokio::time::sleep(PASSWORD_POLL_INTERVAL).await;
    }

    Err(BackendError::Provider {
        message: String::from("could not retrieve the windows password before the agent deadline"),
    })
}
