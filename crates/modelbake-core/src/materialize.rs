//! Reuse-or-build: the entry point callers use to get a serving container.

use std::sync::Arc;
use std::time::Instant;

use modelbake_session::{ContainerRuntime, ContainerSession};
use serde::Serialize;
use tracing::{info, Instrument};

use crate::cache::{CacheLookup, ImageCache};
use crate::config::BakeConfig;
use crate::descriptor::{ModelDescriptor, TargetImage};
use crate::error::{ProvisionError, ProvisionResult};
use crate::lock::ImageLocks;
use crate::obs;
use crate::provisioner::{ProvisionReport, Provisioner};

/// How the target image was obtained.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "report", rename_all = "snake_case")]
pub enum MaterializeOutcome {
    /// The image already existed.
    Reused,
    /// The image was built by this call.
    Built(ProvisionReport),
}

impl MaterializeOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            MaterializeOutcome::Reused => "reused",
            MaterializeOutcome::Built(_) => "built",
        }
    }

    pub fn report(&self) -> Option<&ProvisionReport> {
        match self {
            MaterializeOutcome::Reused => None,
            MaterializeOutcome::Built(report) => Some(report),
        }
    }
}

/// A started serving session from the target image.
///
/// The caller owns the session and must stop it.
pub struct Materialized {
    pub outcome: MaterializeOutcome,
    pub session: Box<dyn ContainerSession>,
}

impl Materialized {
    pub fn was_built(&self) -> bool {
        matches!(self.outcome, MaterializeOutcome::Built(_))
    }

    /// Base URL of the serving endpoint.
    pub fn endpoint(&self) -> Option<&str> {
        self.session.published_endpoint()
    }
}

impl std::fmt::Debug for Materialized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materialized")
            .field("outcome", &self.outcome.name())
            .field("session", &self.session.id())
            .finish()
    }
}

/// Single-flight reuse-or-build over one runtime.
///
/// Concurrent calls for the same target image inside this process are
/// serialized; the cache is re-checked after the lock is taken, so only
/// the first caller builds.
pub struct Materializer {
    runtime: Arc<dyn ContainerRuntime>,
    cache: ImageCache,
    provisioner: Provisioner,
    locks: ImageLocks,
}

impl Materializer {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: BakeConfig) -> Self {
        let cache = ImageCache::new(runtime.clone(), config.enforce_compatibility);
        Self {
            runtime,
            cache,
            provisioner: Provisioner::new(config),
            locks: ImageLocks::new(),
        }
    }

    /// Return a started session from `target.name`, building the image
    /// first if it does not exist.
    pub async fn materialize(
        &self,
        descriptor: &ModelDescriptor,
        target: &TargetImage,
    ) -> ProvisionResult<Materialized> {
        let start = Instant::now();
        let result = self
            .materialize_locked(descriptor, target)
            .instrument(obs::provision_span(&target.name))
            .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(materialized) => obs::emit_provision_finished(
                &target.name,
                materialized.outcome.name(),
                duration_ms,
                true,
            ),
            Err(_) => obs::emit_provision_finished(&target.name, "failed", duration_ms, false),
        }
        result
    }

    async fn materialize_locked(
        &self,
        descriptor: &ModelDescriptor,
        target: &TargetImage,
    ) -> ProvisionResult<Materialized> {
        obs::emit_provision_started(&target.name, &target.compatible_base, &descriptor.digest());

        let _guard = self.locks.acquire(&target.name).await;

        if let CacheLookup::Hit(session) = self.cache.lookup(target).await? {
            obs::emit_cache_hit(&target.name, session.id());
            return Ok(Materialized {
                outcome: MaterializeOutcome::Reused,
                session,
            });
        }
        obs::emit_cache_miss(&target.name);

        let report = self
            .provisioner
            .provision(self.runtime.as_ref(), descriptor, target)
            .await?;
        info!(
            image = %target.name,
            build_id = %report.build_id,
            duration_ms = report.duration_ms,
            "Image built, starting serving session"
        );

        match self.cache.lookup(target).await? {
            CacheLookup::Hit(session) => Ok(Materialized {
                outcome: MaterializeOutcome::Built(report),
                session,
            }),
            CacheLookup::Miss => Err(ProvisionError::ImagePull {
                image: target.name.clone(),
                message: "image missing right after commit".to_string(),
            }),
        }
    }
}
