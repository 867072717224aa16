//! Structured observability hooks for the provisioning lifecycle.
//!
//! This module provides:
//! - An image-scoped tracing span for `tracing::Instrument`
//! - Emission functions for lifecycle events: start, cache decision, step
//!   results, commit and finish
//!
//! Events are emitted at `info!` level (failures at `warn!`). Filter with
//! `RUST_LOG`; JSON output is selected by `telemetry::init_tracing`.

use tracing::{info, warn};

use crate::provisioner::ProvisionState;

/// Span for one materialization of `image`.
pub fn provision_span(image: &str) -> tracing::Span {
    tracing::info_span!("modelbake.provision", image = %image)
}

/// Emit event: materialization requested.
pub fn emit_provision_started(image: &str, base_image: &str, descriptor_digest: &str) {
    info!(
        event = "provision.started",
        image = %image,
        base_image = %base_image,
        descriptor_digest = %descriptor_digest,
    );
}

/// Emit event: the target image exists and was started.
pub fn emit_cache_hit(image: &str, session_id: &str) {
    info!(event = "cache.hit", image = %image, session_id = %session_id);
}

/// Emit event: the target image is absent; a build follows.
pub fn emit_cache_miss(image: &str) {
    info!(event = "cache.miss", image = %image);
}

/// Emit event: a build step ran to completion (any exit code).
pub fn emit_step_finished(image: &str, step: &str, exit_code: i32, duration_ms: u64) {
    info!(
        event = "step.finished",
        image = %image,
        step = %step,
        exit_code = exit_code,
        duration_ms = duration_ms,
    );
}

/// Emit event: a build step failed.
pub fn emit_step_failed(image: &str, step: &str, error: &dyn std::fmt::Display) {
    warn!(event = "step.failed", image = %image, step = %step, error = %error);
}

/// Emit event: the build aborted while in `failed_in`.
pub fn emit_provision_failed(image: &str, failed_in: ProvisionState, error: &dyn std::fmt::Display) {
    warn!(
        event = "provision.failed",
        image = %image,
        failed_in = %failed_in,
        error = %error,
    );
}

/// Emit event: the build session was committed as the target image.
pub fn emit_image_committed(image: &str, build_id: &str, descriptor_digest: &str) {
    info!(
        event = "image.committed",
        image = %image,
        build_id = %build_id,
        descriptor_digest = %descriptor_digest,
    );
}

/// Emit event: materialization finished.
pub fn emit_provision_finished(image: &str, outcome: &str, duration_ms: u64, success: bool) {
    info!(
        event = "provision.finished",
        image = %image,
        outcome = %outcome,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: stopping a session failed (warning level).
pub fn emit_session_stop_error(session_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "session.stop_error", session_id = %session_id, error = %error);
}
