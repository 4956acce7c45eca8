// clankers-core: Modes, observations, targets, config and errors for the Clankers MPC stack.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    BackwardPassKind, DdpSettings, GaitSettings, LineSearchSettings, MpcSettings, MpcStackConfig,
    RegularizationSettings, StanceSettings, SwingProfile,
};
pub use error::{ConfigError, MpcError, SolverError, TimelineError, ValidationError};
pub use types::{ContactFlags, LEG_NAMES, Mode, NUM_LEGS, Observation, TargetTrajectory};
