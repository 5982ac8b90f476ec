//! OS Login profile key management.

use serde::Serialize;

use super::GceBackend;
use super::types::WireImportResponse;
use crate::backend::{BackendError, OsLoginProfile};

#[derive(Serialize)]
struct ImportKeyRequest<'a> {
    key: &'a str,
}

/// Imports a public key into `account`'s login profile and resolves the
/// primary POSIX username.
pub(super) async fn import_key(
    backend: &GceBackend,
    account: &str,
    public_key: &str,
) -> Result<OsLoginProfile, BackendError> {
    let url = format!(
        "{}/users/{account}:importSshPublicKey",
        backend.oslogin_base
    );
    let response: WireImportResponse = backend
        .post_json(&url, &ImportKeyRequest { key: public_key })
        .await?;

    let accounts = &response.login_profile.posix_accounts;
    let username = accounts
        .iter()
        .find(|posix| posix.primary)
        .or_else(|| accounts.first())
        .map(|posix| posix.username.clone())
        .filter(|username| !username.is_empty())
        .ok_or_else(|| BackendError::Provider {
            message: format!("login profile for {account} has no POSIX account"),
        })?;

    Ok(OsLoginProfile {
        posix_username: username,
    })
}

/// Deletes a previously imported key by fingerprint.
pub(super) async fn delete_key(
    backend: &GceBackend,
    account: &str,
    fingerprint: &str,
) -> Result<(), BackendError> {
    let url = format!(
        "{}/users/{account}/sshPublicKeys/{fingerprint}",
        backend.oslogin_base
    );
    // The delete returns an empty body on success.
    let _: serde_json::Value = backend.delete_json(&url).await.or_else(|err| match err {
        BackendError::Provider { ref message } if message.contains("failed to decode") => {
            Ok(serde_json::Value::Null)
        }
        other => Err(other),
    })?;
    Ok(())
}
