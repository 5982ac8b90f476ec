//! Wire types for the compute REST API.
//!
//! Only the fields the builder actually reads or writes are modelled;
//! everything else in the provider's responses is ignored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Long-running operation resource returned by mutating calls.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Operation {
    pub(crate) name: String,
    pub(crate) status: String,
    #[serde(default)]
    pub(crate) error: Option<OperationErrors>,
}

/// Error container attached to a finished operation.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct OperationErrors {
    #[serde(default)]
    pub(crate) errors: Vec<OperationErrorEntry>,
}

/// One error reported by an operation.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct OperationErrorEntry {
    #[serde(default)]
    pub(crate) message: String,
}

impl OperationErrors {
    /// Joins every reported message into one diagnostic string.
    pub(crate) fn joined(&self) -> String {
        let messages: Vec<&str> = self
            .errors
            .iter()
            .map(|entry| entry.message.as_str())
            .filter(|message| !message.is_empty())
            .collect();
        if messages.is_empty() {
            String::from("operation failed without a reported message")
        } else {
            messages.join("; ")
        }
    }
}

/// Image resource as the API reports it.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireImage {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) self_link: String,
    #[serde(default)]
    pub(crate) disk_size_gb: Option<serde_json::Value>,
    #[serde(default)]
    pub(crate) licenses: Vec<String>,
}

impl WireImage {
    /// Converts the wire form into the builder's image type.
    pub(crate) fn into_image(self, project: &str) -> crate::backend::Image {
        // The API serialises 64-bit sizes as JSON strings.
        let size_gb = match self.disk_size_gb {
            Some(serde_json::Value::String(text)) => text.parse().unwrap_or_default(),
            Some(serde_json::Value::Number(number)) => number.as_i64().unwrap_or_default(),
            _ => 0,
        };
        crate::backend::Image {
            name: self.name,
            project: project.to_owned(),
            self_link: self.self_link,
            size_gb,
            licenses: self.licenses,
        }
    }
}

/// Zone resource; only the region link matters here.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct WireZone {
    #[serde(default)]
    pub(crate) region: String,
}

/// Static address resource.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct WireAddress {
    pub(crate) address: String,
}

/// Instance resource, trimmed to the fields the builder polls.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireInstance {
    #[serde(default)]
    pub(crate) status: String,
    #[serde(default)]
    pub(crate) network_interfaces: Vec<WireNetworkInterface>,
    #[serde(default)]
    pub(crate) metadata: WireMetadata,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireNetworkInterface {
    #[serde(default)]
    pub(crate) network_i_p: Option<String>,
    #[serde(default)]
    pub(crate) access_configs: Vec<WireAccessConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireAccessConfig {
    #[serde(default)]
    pub(crate) nat_i_p: Option<String>,
}

/// Instance metadata in the API's item-list form.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub(crate) struct WireMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) fingerprint: Option<String>,
    #[serde(default)]
    pub(crate) items: Vec<WireMetadataItem>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct WireMetadataItem {
    pub(crate) key: String,
    #[serde(default)]
    pub(crate) value: Option<String>,
}

impl WireMetadata {
    /// Builds the item-list form from a flat map.
    pub(crate) fn from_map(map: &HashMap<String, String>) -> Self {
        let mut items: Vec<WireMetadataItem> = map
            .iter()
            .map(|(key, value)| WireMetadataItem {
                key: key.clone(),
                value: Some(value.clone()),
            })
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        Self {
            fingerprint: None,
            items,
        }
    }

    /// Looks up one metadata value by key.
    pub(crate) fn value_of(&self, key: &str) -> Option<String> {
        self.items
            .iter()
            .find(|item| item.key == key)
            .and_then(|item| item.value.clone())
    }
}

/// Serial console output resource.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct WireSerialOutput {
    #[serde(default)]
    pub(crate) contents: String,
}

/// OS Login profile, trimmed to POSIX account resolution.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireLoginProfile {
    #[serde(default)]
    pub(crate) posix_accounts: Vec<WirePosixAccount>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct WirePosixAccount {
    #[serde(default)]
    pub(crate) primary: bool,
    #[serde(default)]
    pub(crate) username: String,
}

/// Response wrapper for the OS Login import call.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireImportResponse {
    #[serde(default)]
    pub(crate) login_profile: WireLoginProfile,
}

/// Error envelope on non-success responses.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct WireErrorEnvelope {
    pub(crate) error: WireErrorBody,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct WireErrorBody {
    #[serde(default)]
    pub(crate) message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_errors_join_messages() {
        let errors = OperationErrors {
            errors: vec![
                OperationErrorEntry {
                    message: String::from("quota exceeded"),
                },
                OperationErrorEntry {
                    message: String::from("try another zone"),
                },
            ],
        };
        assert_eq!(errors.joined(), "quota exceeded; try another zone");
    }

    #[test]
    fn empty_operation_errors_still_produce_a_message() {
        assert!(!OperationErrors::default().joined().is_empty());
    }

    #[test]
    fn wire_image_parses_string_sizes() {
        let wire: WireImage = serde_json::from_value(serde_json::json!({
            "name": "debian-12",
            "selfLink": "https://example/images/debian-12",
            "diskSizeGb": "25",
            "licenses": ["projects/debian-cloud/global/licenses/debian-12"],
        }))
        .unwrap_or_else(|err| panic!("parse: {err}"));
        let image = wire.into_image("debian-cloud");
        assert_eq!(image.size_gb, 25);
        assert_eq!(image.project, "debian-cloud");
    }

    #[test]
    fn metadata_round_trips_values() {
        let mut map = HashMap::new();
        map.insert(String::from("startup-script"), String::from("echo hi"));
        let metadata = WireMetadata::from_map(&map);
        assert_eq!(
            metadata.value_of("startup-script"),
            Some(String::from("echo hi"))
        );
        assert_eq!(metadata.value_of("missing"), None);
    }

    #[test]
    fn instance_json_field_names_match_the_api() {
        let wire: WireInstance = serde_json::from_value(serde_json::json!({
            "status": "RUNNING",
            "networkInterfaces": [{
                "networkIP": "10.0.0.2",
                "accessConfigs": [{"natIP": "203.0.113.9"}],
            }],
        }))
        .unwrap_or_else(|err| panic!("parse: {err}"));
        assert_eq!(wire.status, "RUNNING");
        let nic = wire
            .network_interfaces
            .first()
            .unwrap_or_else(|| panic!("nic missing"));
        assert_eq!(nic.network_i_p.as_deref(), Some("10.0.0.2"));
        let ac = nic
            .access_configs
            .first()
            .unwrap_or_else(|| panic!("access config missing"));
        assert_eq!(ac.nat_i_p.as_deref(), Some("203.0.113.9"));
    }
}
