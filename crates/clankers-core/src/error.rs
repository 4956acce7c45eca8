use thiserror::Error;

/// Top-level error type for the MPC stack.
#[derive(Debug, Error)]
pub enum MpcError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Timeline error: {0}")]
    Timeline(#[from] TimelineError),

    #[error("Solver error: {0}")]
    Solver(#[from] SolverError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Contract violations on the mode timeline and gait scheduler.
///
/// Copy + plain data so the scheduler can return them from hot paths.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum TimelineError {
    #[error("Phase index {index} is out of bounds for a timeline with {len} phases")]
    PhaseIndexOutOfBounds { index: usize, len: usize },

    #[error("Gait template has {modes} modes but {switching_times} switching times (expected modes + 1)")]
    TemplateSizeMismatch { modes: usize, switching_times: usize },

    #[error("Gait template switching times must be strictly increasing")]
    NonIncreasingTemplate,

    #[error("Tiling start time {start} is not greater than the last event time {last_event}")]
    NonMonotonicStart { start: f64, last_event: f64 },

    #[error("Event times must be strictly increasing (violated at index {index})")]
    TimesNotIncreasing { index: usize },

    #[error("Timeline has {modes} modes for {times} event times (expected times + 1)")]
    ModeCountMismatch { modes: usize, times: usize },

    #[error("Timeline time {0} is not finite")]
    NonFiniteTime(f64),
}

/// Errors raised by the DDP solver before it can produce a policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    #[error("Partition boundary {boundary} is not aligned with a mode switch")]
    PartitionMisaligned { boundary: f64 },

    #[error("Invalid partition: {0}")]
    InvalidPartition(String),

    #[error("Dimension mismatch for {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Empty horizon: final time {final_time} must exceed initial time {init_time}")]
    EmptyHorizon { init_time: f64, final_time: f64 },

    #[error("Initial rollout diverged: NaN or Inf detected in state")]
    Diverged,

    #[error("Failed to build worker pool: {0}")]
    WorkerPool(String),
}

/// Validation errors for trajectories and observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Trajectory length mismatch: {times} times, {states} states, {inputs} inputs")]
    TrajectoryLengthMismatch {
        times: usize,
        states: usize,
        inputs: usize,
    },

    #[error("Trajectory is empty")]
    EmptyTrajectory,

    #[error("Trajectory times must be non-decreasing (violated at index {index})")]
    TimesNotSorted { index: usize },

    #[error("State dimension mismatch: expected {expected}, got {got}")]
    StateDimMismatch { expected: usize, got: usize },

    #[error("Input dimension mismatch: expected {expected}, got {got}")]
    InputDimMismatch { expected: usize, got: usize },

    #[error("Invalid mode bits: {0}")]
    InvalidMode(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpc_error_from_timeline_error() {
        let err = TimelineError::PhaseIndexOutOfBounds { index: 7, len: 3 };
        let mpc_err: MpcError = err.into();
        assert!(matches!(mpc_err, MpcError::Timeline(_)));
        assert!(mpc_err.to_string().contains("Phase index 7"));
    }

    #[test]
    fn mpc_error_from_solver_error() {
        let err = SolverError::PartitionMisaligned { boundary: 0.25 };
        let mpc_err: MpcError = err.into();
        assert!(matches!(mpc_err, MpcError::Solver(_)));
        assert!(mpc_err.to_string().contains("0.25"));
    }

    #[test]
    fn config_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let config_err: ConfigError = io_err.into();
        assert!(matches!(config_err, ConfigError::Io(_)));
    }

    #[test]
    fn timeline_error_display_messages() {
        assert_eq!(
            TimelineError::TemplateSizeMismatch {
                modes: 2,
                switching_times: 2
            }
            .to_string(),
            "Gait template has 2 modes but 2 switching times (expected modes + 1)"
        );
        assert_eq!(
            TimelineError::NonMonotonicStart {
                start: 0.5,
                last_event: 1.0
            }
            .to_string(),
            "Tiling start time 0.5 is not greater than the last event time 1"
        );
        assert_eq!(
            TimelineError::ModeCountMismatch { modes: 2, times: 3 }.to_string(),
            "Timeline has 2 modes for 3 event times (expected times + 1)"
        );
    }

    #[test]
    fn validation_error_is_copy() {
        let err = ValidationError::EmptyTrajectory;
        let err2 = err;
        assert_eq!(err, err2);
    }

    #[test]
    fn solver_error_display_messages() {
        assert_eq!(
            SolverError::DimensionMismatch {
                what: "initial state",
                expected: 6,
                got: 3
            }
            .to_string(),
            "Dimension mismatch for initial state: expected 6, got 3"
        );
        assert_eq!(
            SolverError::EmptyHorizon {
                init_time: 1.0,
                final_time: 1.0
            }
            .to_string(),
            "Empty horizon: final time 1 must exceed initial time 1"
        );
    }
}
