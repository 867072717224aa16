//! modelbake-session: container sessions and image store access
//!
//! This crate is the container layer for modelbake. It starts serving
//! containers, runs commands inside them, snapshots them into images and
//! answers "does this image exist" for the cache.
//!
//! ## Key Components
//!
//! - `ContainerRuntime`: start sessions, query the image store
//! - `ContainerSession`: exec / commit / stop on a running container
//! - `DockerRuntime`: backend driving the `docker` CLI
//! - `fakes::FakeRuntime`: in-memory backend with failure injection

pub mod docker;
mod error;
pub mod fakes;
pub mod session;

pub use docker::{is_missing_image, DockerConfig, DockerRuntime, DockerSession, DEFAULT_SERVING_PORT};
pub use error::SessionError;
pub use session::{
    ContainerRuntime, ContainerSession, ExecOutput, ExecRequest, ImageLabels, PullPolicy,
    SessionResult, SessionState, StartOptions,
};
