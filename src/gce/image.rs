//! Image lookup, capture, and deletion.

use serde::Serialize;

use super::GceBackend;
use super::types::{Operation, WireImage};
use crate::backend::{BackendError, Image, ImageSpec};

/// Projects hosting the provider's public base images, tried in order when
/// a source image carries no project of its own.
const PUBLIC_IMAGE_PROJECTS: [&str; 15] = [
    "centos-cloud",
    "cos-cloud",
    "coreos-cloud",
    "debian-cloud",
    "rhel-cloud",
    "rhel-sap-cloud",
    "suse-cloud",
    "suse-sap-cloud",
    "ubuntu-os-cloud",
    "windows-cloud",
    "windows-sql-cloud",
    "gce-uefi-images",
    "gce-nvme",
    "google-containers",
    "opensuse-cloud",
];

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertImage {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    family: Option<String>,
    #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
    labels: std::collections::HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    licenses: Vec<String>,
    source_disk: String,
    source_type: String,
}

/// Looks up an image in one specific project, by name or by family.
pub(super) async fn get_image_from_project(
    backend: &GceBackend,
    project: &str,
    name: &str,
    from_family: bool,
) -> Result<Image, BackendError> {
    let suffix = if from_family {
        format!("global/images/family/{name}")
    } else {
        format!("global/images/{name}")
    };
    let url = format!("{}/projects/{project}/{suffix}", backend.compute_base);
    let wire: WireImage = backend.get_json(&url).await.map_err(|err| {
        BackendError::ImageNotFound {
            name: name.to_owned(),
            detail: format!("project {project}: {err}"),
        }
    })?;
    if wire.self_link.is_empty() {
        return Err(BackendError::ImageNotFound {
            name: name.to_owned(),
            detail: format!("project {project} returned an image without a self link"),
        });
    }
    Ok(wire.into_image(project))
}

/// Looks up an image across the backend's project and the well-known
/// public projects, first hit wins.
pub(super) async fn get_image(
    backend: &GceBackend,
    name: &str,
    from_family: bool,
) -> Result<Image, BackendError> {
    let mut details = Vec::new();
    let own_project = backend.project.clone();
    let mut projects = vec![own_project.as_str()];
    projects.extend(PUBLIC_IMAGE_PROJECTS);

    for project in projects {
        match get_image_from_project(backend, project, name, from_family).await {
            Ok(image) => return Ok(image),
            Err(err) => details.push(err.to_string()),
        }
    }
    Err(BackendError::ImageNotFound {
        name: name.to_owned(),
        detail: details.join("; "),
    })
}

/// Captures `spec.source_disk` as a new image and returns it.
pub(super) async fn create_image(
    backend: &GceBackend,
    spec: ImageSpec,
) -> Result<Image, BackendError> {
    let body = InsertImage {
        name: spec.name.clone(),
        description: spec.description.clone(),
        family: spec.family.clone().filter(|family| !family.is_empty()),
        labels: spec.labels.clone(),
        licenses: spec.licenses.clone(),
        source_disk: backend.project_url(&format!(
            "zones/{}/disks/{}",
            spec.zone, spec.source_disk
        )),
        source_type: String::from("RAW"),
    };

    let operation: Operation = backend
        .post_json(&backend.project_url("global/images"), &body)
        .await?;
    backend.wait_global_operation(&operation.name).await?;
    get_image_from_project(backend, &backend.project, &spec.name, false).await
}

/// Deletes an image owned by the backend's project.
pub(super) async fn delete_image(backend: &GceBackend, name: &str) -> Result<(), BackendError> {
    let operation: Operation = backend
        .delete_json(&backend.project_url(&format!("global/images/{name}")))
        .await?;
    backend.wait_global_operation(&operation.name).await
}
