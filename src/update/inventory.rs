//! Container inventory consumed from the host runtime

use serde::{Deserialize, Serialize};

use crate::update::registry::Platform;

/// One running container as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImage {
    pub container_id: String,
    /// Image reference the container was started from
    pub image: String,
    /// Repo digest of the running image, when the runtime knows it
    #[serde(default)]
    pub image_digest: Option<String>,
    /// Local image id (config digest) of the running image
    #[serde(default)]
    pub image_id: Option<String>,
    /// Architecture the image was pulled for (`amd64`, `x86_64`, ...)
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
}

impl ContainerImage {
    pub fn new(container_id: &str, image: &str, image_digest: Option<&str>) -> Self {
        Self {
            container_id: container_id.to_string(),
            image: image.to_string(),
            image_digest: image_digest.map(str::to_string),
            image_id: None,
            architecture: None,
            os: None,
        }
    }

    pub fn with_image_id(mut self, image_id: &str) -> Self {
        self.image_id = Some(image_id.to_string());
        self
    }

    pub fn with_platform(mut self, architecture: &str, os: &str) -> Self {
        self.architecture = Some(architecture.to_string());
        self.os = Some(os.to_string());
        self
    }

    /// Platform to resolve the image for, host defaults filling gaps
    pub fn platform(&self) -> Platform {
        Platform::new(self.architecture.as_deref(), self.os.as_deref())
    }
}

/// What an inventory sync changed, by container id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub image_changed: Vec<String>,
}

impl InventoryChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.image_changed.is_empty()
    }
}
