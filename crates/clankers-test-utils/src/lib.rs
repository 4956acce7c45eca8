//! Shared test fixtures and utilities for Clankers crates.
//!
//! Provides linear-quadratic test systems with known closed-form solutions, a
//! point-foot system driven by the planned foot phases, recording policy
//! transports, and deterministic RNG setup.

pub mod rng;
pub mod systems;
pub mod transport;

// ---------------------------------------------------------------------------
// Re-exports for convenience
// ---------------------------------------------------------------------------

pub use rng::{deterministic_state, seeded_rng};
pub use systems::{LinearSystem, PointFootModel, default_hips, scalar_care, scalar_dare, schedule_for};
pub use transport::{PublishLog, PublishRecord, RecordingTransport};
