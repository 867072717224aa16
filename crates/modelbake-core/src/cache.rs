//! Image cache: existence, reuse lookup and compatibility labels.
//!
//! There is no index of its own. The image store is the cache, keyed by
//! image name; a failed local-only start is the miss signal.

use std::sync::Arc;

use modelbake_session::{ContainerRuntime, ContainerSession, ImageLabels, StartOptions};
use tracing::{debug, warn};

use crate::descriptor::{ModelDescriptor, TargetImage};
use crate::error::{ProvisionError, ProvisionResult};
use crate::obs;

/// Label recording the base image a build started from.
pub const LABEL_BASE_IMAGE: &str = "modelbake.base-image";
/// Label recording the descriptor digest.
pub const LABEL_DESCRIPTOR_DIGEST: &str = "modelbake.descriptor-digest";
/// Label recording the registered model name.
pub const LABEL_MODEL_NAME: &str = "modelbake.model-name";
/// Label recording the build id.
pub const LABEL_BUILD_ID: &str = "modelbake.build-id";

/// Labels written when committing `descriptor` as `target`.
pub fn build_labels(descriptor: &ModelDescriptor, target: &TargetImage, build_id: &str) -> ImageLabels {
    let mut labels = ImageLabels::new();
    labels.insert(LABEL_BASE_IMAGE.to_string(), target.compatible_base.clone());
    labels.insert(LABEL_DESCRIPTOR_DIGEST.to_string(), descriptor.digest());
    labels.insert(LABEL_MODEL_NAME.to_string(), descriptor.model_name().to_string());
    labels.insert(LABEL_BUILD_ID.to_string(), build_id.to_string());
    labels
}

/// Outcome of a reuse lookup.
pub enum CacheLookup {
    /// The image exists; a serving session was started from it.
    Hit(Box<dyn ContainerSession>),
    /// The image does not exist.
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

impl std::fmt::Debug for CacheLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheLookup::Hit(session) => f.debug_tuple("Hit").field(&session.id()).finish(),
            CacheLookup::Miss => f.write_str("Miss"),
        }
    }
}

/// Lookup-by-name over the runtime's image store.
#[derive(Clone)]
pub struct ImageCache {
    runtime: Arc<dyn ContainerRuntime>,
    enforce_compatibility: bool,
}

impl ImageCache {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, enforce_compatibility: bool) -> Self {
        Self {
            runtime,
            enforce_compatibility,
        }
    }

    /// Whether an image named `name` is present.
    pub async fn exists(&self, name: &str) -> ProvisionResult<bool> {
        self.runtime
            .image_exists(name)
            .await
            .map_err(|e| ProvisionError::from_session("image_inspect", e))
    }

    /// Start a session from the target image without pulling.
    ///
    /// `ImagePull` from the runtime becomes `Miss`; any other start failure
    /// is returned. A hit is checked for compatibility before it is handed
    /// out, and the session is stopped if the check fails.
    pub async fn lookup(&self, target: &TargetImage) -> ProvisionResult<CacheLookup> {
        let mut session = match self
            .runtime
            .start(&target.name, &StartOptions::local_only())
            .await
        {
            Ok(session) => session,
            Err(e) if e.is_image_missing() => {
                debug!(image = %target.name, error = %e, "Target image not in store");
                return Ok(CacheLookup::Miss);
            }
            Err(e) => return Err(ProvisionError::from_session("reuse_check", e)),
        };

        if let Err(e) = self.verify_compatible(target).await {
            if let Err(stop_err) = session.stop().await {
                obs::emit_session_stop_error(session.id(), &stop_err);
            }
            return Err(e);
        }
        Ok(CacheLookup::Hit(session))
    }

    /// Check the base-image label of the target against `compatible_base`.
    ///
    /// Images without the label were built out-of-band and are accepted
    /// with a warning. No-op when enforcement is disabled.
    pub async fn verify_compatible(&self, target: &TargetImage) -> ProvisionResult<()> {
        if !self.enforce_compatibility {
            return Ok(());
        }

        let labels = self
            .runtime
            .image_labels(&target.name)
            .await
            .map_err(|e| ProvisionError::from_session("compat_check", e))?;

        match labels.get(LABEL_BASE_IMAGE) {
            Some(found) if found == &target.compatible_base => Ok(()),
            Some(found) => Err(ProvisionError::IncompatibleImage {
                image: target.name.clone(),
                expected: target.compatible_base.clone(),
                found: found.clone(),
            }),
            None => {
                warn!(
                    image = %target.name,
                    expected = %target.compatible_base,
                    "Image has no base-image label, assuming compatible"
                );
                Ok(())
            }
        }
    }
}
