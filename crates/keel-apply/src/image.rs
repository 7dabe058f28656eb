//! Local image store.
//!
//! Images are unpacked directories under `<data_dir>/images/`. Fetching an
//! image that is not there yet is delegated to an operator-configured
//! command; building and pushing images is someone else's job.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use keel_common::settings::Settings;
use keel_common::{Error, Result};
use keel_runtime::metadata::{ImageMetadata, METADATA_FILE};
use keel_runtime::registry::{self, RegistryConfig};

use crate::collaborators::ImagePuller;

/// [`ImagePuller`] over a local directory per image.
#[derive(Clone, Debug)]
pub struct LocalImageStore {
    root: PathBuf,
    pull_command: Option<String>,
}

impl LocalImageStore {
    /// Store under the settings' data directory.
    pub fn new(settings: &Settings) -> Self {
        Self {
            root: settings.data_dir.join("images"),
            pull_command: settings.image_pull_command.clone(),
        }
    }

    /// Directory holding an unpacked image.
    pub fn image_dir(&self, image: &str) -> PathBuf {
        self.root.join(sanitize(image))
    }
}

/// Image reference as a single path component.
pub fn sanitize(image: &str) -> String {
    image
        .chars()
        .map(|c| match c {
            '/' | ':' | '@' => '_',
            c => c,
        })
        .collect()
}

#[async_trait]
impl ImagePuller for LocalImageStore {
    async fn pull_if_not_exist(&self, image: &str) -> Result<()> {
        let dir = self.image_dir(image);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            debug!(image, dir = %dir.display(), "image already present");
            return Ok(());
        }

        let Some(template) = &self.pull_command else {
            return Err(Error::validation(format!(
                "image {image} is not present in {} and no imagePullCommand is configured",
                self.root.display()
            )));
        };
        let command = template
            .replace("{image}", image)
            .replace("{dest}", &dir.to_string_lossy());
        info!(image, "pulling image");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .await
            .map_err(|e| Error::io(format!("spawn image pull for {image}"), e))?;
        if !output.status.success() {
            return Err(Error::internal_with_context(
                "image pull",
                format!(
                    "{command}: exit {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(Error::internal_with_context(
                "image pull",
                format!("{command} succeeded but {} does not exist", dir.display()),
            ));
        }
        Ok(())
    }

    async fn metadata(&self, image: &str) -> Result<Option<ImageMetadata>> {
        let path = self.image_dir(image).join(METADATA_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(ImageMetadata::from_json(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!("read {}", path.display()), e)),
        }
    }

    async fn registry(&self, image: &str) -> Result<RegistryConfig> {
        let path = self.image_dir(image).join(registry::CONFIG_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => RegistryConfig::from_yaml(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryConfig::default()),
            Err(e) => Err(Error::io(format!("read {}", path.display()), e)),
        }
    }
}
