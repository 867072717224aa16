//! modelbake-core: cached, idempotent serving-image provisioning
//!
//! Given a model descriptor and a target image name, either reuse the
//! image if it exists or build it: start the base serving image, install
//! the hub client, download weights, write the model definition, register
//! the model and commit the container as the target image.
//!
//! ## Key Components
//!
//! - `ModelDescriptor` / `TargetImage`: what to bake and where
//! - `ImageCache`: existence, reuse lookup, compatibility labels
//! - `Provisioner`: the sequential, non-retrying build pipeline
//! - `Materializer`: single-flight reuse-or-build returning a serving session

pub mod cache;
pub mod config;
pub mod descriptor;
mod error;
pub mod lock;
pub mod materialize;
pub mod obs;
pub mod provisioner;
pub mod step;
pub mod telemetry;

pub use cache::{CacheLookup, ImageCache};
pub use config::{BakeConfig, CleanupPolicy, DEFAULT_BASE_IMAGE};
pub use descriptor::{DescriptorBuilder, ModelDescriptor, TargetImage};
pub use error::{ProvisionError, ProvisionResult};
pub use materialize::{MaterializeOutcome, Materialized, Materializer};
pub use provisioner::{ProvisionReport, ProvisionState, Provisioner};
pub use step::{build_plan, BuildStep, StepKind, StepResult};

/// Crate version, reported by `modelbake --version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
