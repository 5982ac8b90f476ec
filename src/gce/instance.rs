//! Instance lifecycle calls.

use serde::Serialize;

use super::GceBackend;
use super::types::{Operation, WireAddress, WireInstance, WireMetadata, WireSerialOutput, WireZone};
use crate::backend::{BackendError, InstanceSpec, Pending};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertInstance {
    name: String,
    description: String,
    machine_type: String,
    disks: Vec<AttachedDisk>,
    metadata: WireMetadata,
    network_interfaces: Vec<NetworkInterface>,
    scheduling: Scheduling,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    service_accounts: Vec<ServiceAccount>,
    tags: Tags,
    #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
    labels: std::collections::HashMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachedDisk {
    #[serde(rename = "type")]
    kind: String,
    mode: String,
    boot: bool,
    auto_delete: bool,
    device_name: String,
    initialize_params: DiskInitializeParams,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiskInitializeParams {
    disk_name: String,
    source_image: String,
    disk_size_gb: i64,
    disk_type: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(skip_serializing_if = "String::is_empty")]
    network: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    subnetwork: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    access_configs: Vec<AccessConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessConfig {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    nat_i_p: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Scheduling {
    on_host_maintenance: String,
    preemptible: bool,
}

#[derive(Serialize)]
struct ServiceAccount {
    email: String,
    scopes: Vec<String>,
}

#[derive(Serialize)]
struct Tags {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    items: Vec<String>,
}

/// Expands a network reference into a resource URL unless it already is
/// one.
fn network_url(project: &str, network: &str) -> String {
    if network.contains('/') {
        network.to_owned()
    } else {
        format!("projects/{project}/global/networks/{network}")
    }
}

/// Expands a subnetwork reference into a resource URL unless it already is
/// one.
fn subnetwork_url(project: &str, region: &str, subnetwork: &str) -> String {
    if subnetwork.contains('/') {
        subnetwork.to_owned()
    } else {
        format!("projects/{project}/regions/{region}/subnetworks/{subnetwork}")
    }
}

/// Submits the instance creation request.
///
/// Zone and static-address lookups run before the insert; their failures
/// are immediate errors. The returned handle tracks the insert operation.
pub(super) async fn run_instance(
    backend: &GceBackend,
    spec: InstanceSpec,
) -> Result<Pending<()>, BackendError> {
    spec.validate()?;

    let zone: WireZone = backend
        .get_json(&backend.project_url(&format!("zones/{}", spec.zone)))
        .await?;
    let region = zone
        .region
        .rsplit_once('/')
        .map_or(zone.region.as_str(), |(_prefix, name)| name)
        .to_owned();

    let access_configs = if spec.omit_external_ip {
        Vec::new()
    } else {
        let nat_ip = match spec.static_address.as_deref() {
            Some(address_name) => {
                let address: WireAddress = backend
                    .get_json(&backend.project_url(&format!(
                        "regions/{region}/addresses/{address_name}"
                    )))
                    .await?;
                Some(address.address)
            }
            None => None,
        };
        vec![AccessConfig {
            name: String::from("External NAT"),
            kind: String::from("ONE_TO_ONE_NAT"),
            nat_i_p: nat_ip,
        }]
    };

    let service_accounts = if spec.disable_default_service_account
        && spec.service_account_email.is_none()
    {
        Vec::new()
    } else {
        let email = spec
            .service_account_email
            .clone()
            .unwrap_or_else(|| String::from("default"));
        vec![ServiceAccount {
            email,
            scopes: spec.scopes.clone(),
        }]
    };

    let body = InsertInstance {
        name: spec.name.clone(),
        description: String::from("Build instance created by kiln"),
        machine_type: format!("zones/{}/machineTypes/{}", spec.zone, spec.machine_type),
        disks: vec![AttachedDisk {
            kind: String::from("PERSISTENT"),
            mode: String::from("READ_WRITE"),
            boot: true,
            // The disk must outlive the instance so it can be imaged.
            auto_delete: false,
            device_name: spec.disk_name.clone(),
            initialize_params: DiskInitializeParams {
                disk_name: spec.disk_name.clone(),
                source_image: spec.image.self_link.clone(),
                disk_size_gb: spec.disk_size_gb,
                disk_type: format!("zones/{}/diskTypes/{}", spec.zone, spec.disk_type),
            },
        }],
        metadata: WireMetadata::from_map(&spec.metadata),
        network_interfaces: vec![NetworkInterface {
            network: if spec.network.is_empty() {
                String::new()
            } else {
                network_url(&spec.network_project, &spec.network)
            },
            subnetwork: if spec.subnetwork.is_empty() {
                String::new()
            } else {
                subnetwork_url(&spec.network_project, &region, &spec.subnetwork)
            },
            access_configs,
        }],
        scheduling: Scheduling {
            on_host_maintenance: spec.on_host_maintenance.clone(),
            preemptible: spec.preemptible,
        },
        service_accounts,
        tags: Tags {
            items: spec.tags.clone(),
        },
        labels: spec.labels.clone(),
    };

    let operation: Operation = backend
        .post_json(
            &backend.project_url(&format!("zones/{}/instances", spec.zone)),
            &body,
        )
        .await?;

    let worker = backend.clone();
    let zone_name = spec.zone;
    Ok(Pending::spawn(async move {
        worker.wait_zone_operation(&zone_name, &operation.name).await
    }))
}

/// Polls the instance until its status equals `target`.
pub(super) async fn wait_for_status(
    backend: &GceBackend,
    target: &str,
    zone: &str,
    name: &str,
) -> Result<(), BackendError> {
    loop {
        let instance = fetch_instance(backend, zone, name).await?;
        if instance.status == target {
            return Ok(());
        }
        tracing::debug!(status = %instance.status, %target, "instance not in target state yet");
        tokio::time::sleep(backend.poll_interval).await;
    }
}

/// Fetches the instance resource the pollers and lookups read from.
pub(super) async fn fetch_instance(
    backend: &GceBackend,
    zone: &str,
    name: &str,
) -> Result<WireInstance, BackendError> {
    backend
        .get_json(&backend.project_url(&format!("zones/{zone}/instances/{name}")))
        .await
}

/// Returns the first external NAT address, if the instance has one.
pub(super) async fn nat_ip(
    backend: &GceBackend,
    zone: &str,
    name: &str,
) -> Result<Option<String>, BackendError> {
    let instance = fetch_instance(backend, zone, name).await?;
    Ok(instance
        .network_interfaces
        .iter()
        .flat_map(|nic| nic.access_configs.iter())
        .find_map(|config| config.nat_i_p.clone().filter(|ip| !ip.is_empty())))
}

/// Returns the first internal address, if the instance has one.
pub(super) async fn internal_ip(
    backend: &GceBackend,
    zone: &str,
    name: &str,
) -> Result<Option<String>, BackendError> {
    let instance = fetch_instance(backend, zone, name).await?;
    Ok(instance
        .network_interfaces
        .iter()
        .find_map(|nic| nic.network_i_p.clone().filter(|ip| !ip.is_empty())))
}

/// Reads one metadata value; an absent key is `None`, not an error.
pub(super) async fn metadata_value(
    backend: &GceBackend,
    zone: &str,
    name: &str,
    key: &str,
) -> Result<Option<String>, BackendError> {
    let instance = fetch_instance(backend, zone, name).await?;
    Ok(instance.metadata.value_of(key))
}

/// Fetches serial console output from the given port.
pub(super) async fn serial_output(
    backend: &GceBackend,
    zone: &str,
    name: &str,
    port: u8,
) -> Result<String, BackendError> {
    let output: WireSerialOutput = backend
        .get_json(&backend.project_url(&format!(
            "zones/{zone}/instances/{name}/serialPort?port={port}"
        )))
        .await?;
    Ok(output.contents)
}
