use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Serde default functions
// ---------------------------------------------------------------------------

const fn default_max_iterations() -> usize {
    15
}
const fn default_min_relative_cost() -> f64 {
    1e-3
}
const fn default_constraint_tolerance() -> f64 {
    1e-3
}
const fn default_num_threads() -> usize {
    2
}
const fn default_time_step() -> f64 {
    0.015
}
const fn default_min_step_length() -> f64 {
    0.05
}
const fn default_contraction_rate() -> f64 {
    0.5
}
const fn default_armijo_coefficient() -> f64 {
    1e-4
}
const fn default_regularization_initial() -> f64 {
    1e-6
}
const fn default_regularization_min() -> f64 {
    1e-9
}
const fn default_regularization_max() -> f64 {
    1e6
}
const fn default_regularization_factor() -> f64 {
    10.0
}
const fn default_continuous_steps() -> usize {
    8
}
const fn default_time_horizon() -> f64 {
    1.0
}
const fn default_num_partitions() -> usize {
    2
}
const fn default_phase_transition_stance_time() -> f64 {
    0.4
}
const fn default_swing_height() -> f64 {
    0.1
}
const fn default_apex_velocity_factor() -> f64 {
    3.0
}
const fn default_sdf_start_end_margin() -> f64 {
    -0.02
}
const fn default_liftoff_velocity() -> f64 {
    0.0
}
const fn default_touchdown_velocity() -> f64 {
    0.0
}
const fn default_cp_gain() -> f64 {
    0.5
}
const fn default_max_reach() -> f64 {
    0.3
}
const fn default_nominal_phase_duration() -> f64 {
    0.3
}
const fn default_gravity() -> f64 {
    9.81
}

fn require_positive(field: &str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be > 0, got {value}")))
    }
}

// ---------------------------------------------------------------------------
// DdpSettings
// ---------------------------------------------------------------------------

/// Backtracking line search applied by the forward pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineSearchSettings {
    /// Smallest step length tried before the iteration is declared rejected.
    #[serde(default = "default_min_step_length")]
    pub min_step_length: f64,

    /// Factor applied to the step length after each rejected trial, in (0, 1).
    #[serde(default = "default_contraction_rate")]
    pub contraction_rate: f64,

    /// Fraction of the predicted cost reduction that must be realized to accept a step.
    #[serde(default = "default_armijo_coefficient")]
    pub armijo_coefficient: f64,
}

impl Default for LineSearchSettings {
    fn default() -> Self {
        Self {
            min_step_length: default_min_step_length(),
            contraction_rate: default_contraction_rate(),
            armijo_coefficient: default_armijo_coefficient(),
        }
    }
}

/// Levenberg-Marquardt style regularization of the input Hessian.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegularizationSettings {
    #[serde(default = "default_regularization_initial")]
    pub initial: f64,

    #[serde(default = "default_regularization_min")]
    pub min: f64,

    #[serde(default = "default_regularization_max")]
    pub max: f64,

    /// Multiplier used to grow (on rejection) or shrink (on acceptance) the regularization.
    #[serde(default = "default_regularization_factor")]
    pub factor: f64,
}

impl Default for RegularizationSettings {
    fn default() -> Self {
        Self {
            initial: default_regularization_initial(),
            min: default_regularization_min(),
            max: default_regularization_max(),
            factor: default_regularization_factor(),
        }
    }
}

/// Formulation of the Riccati backward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackwardPassKind {
    /// Discrete-time recursion on the Euler-discretized model.
    #[default]
    Discrete,
    /// Riccati ODE integrated per mode segment in rescaled time.
    Continuous,
}

/// DDP/ILQR solver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdpSettings {
    /// Maximum number of backward/forward iterations per solve.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Relative cost improvement below which the solve is considered converged.
    #[serde(default = "default_min_relative_cost")]
    pub min_relative_cost: f64,

    /// Maximum equality-constraint violation accepted at convergence.
    #[serde(default = "default_constraint_tolerance")]
    pub constraint_tolerance: f64,

    /// Size of the worker pool used for per-node work.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,

    /// Maximum discretization step between nodes (seconds).
    #[serde(default = "default_time_step")]
    pub time_step: f64,

    #[serde(default)]
    pub backward_pass: BackwardPassKind,

    /// Fixed RK4 steps per node interval for the continuous backward pass.
    #[serde(default = "default_continuous_steps")]
    pub continuous_steps: usize,

    #[serde(default)]
    pub line_search: LineSearchSettings,

    #[serde(default)]
    pub regularization: RegularizationSettings,
}

impl Default for DdpSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            min_relative_cost: default_min_relative_cost(),
            constraint_tolerance: default_constraint_tolerance(),
            num_threads: default_num_threads(),
            time_step: default_time_step(),
            backward_pass: BackwardPassKind::default(),
            continuous_steps: default_continuous_steps(),
            line_search: LineSearchSettings::default(),
            regularization: RegularizationSettings::default(),
        }
    }
}

impl DdpSettings {
    /// Validate settings. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::invalid("max_iterations", "must be >= 1"));
        }
        if self.num_threads == 0 {
            return Err(ConfigError::invalid("num_threads", "must be >= 1"));
        }
        if self.continuous_steps == 0 {
            return Err(ConfigError::invalid("continuous_steps", "must be >= 1"));
        }
        require_positive("time_step", self.time_step)?;
        require_positive("min_relative_cost", self.min_relative_cost)?;
        require_positive("constraint_tolerance", self.constraint_tolerance)?;

        let ls = &self.line_search;
        if !(ls.contraction_rate > 0.0 && ls.contraction_rate < 1.0) {
            return Err(ConfigError::invalid(
                "line_search.contraction_rate",
                "must lie in (0, 1)",
            ));
        }
        if !(ls.min_step_length > 0.0 && ls.min_step_length <= 1.0) {
            return Err(ConfigError::invalid(
                "line_search.min_step_length",
                "must lie in (0, 1]",
            ));
        }
        if !(0.0..1.0).contains(&ls.armijo_coefficient) {
            return Err(ConfigError::invalid(
                "line_search.armijo_coefficient",
                "must lie in [0, 1)",
            ));
        }

        let reg = &self.regularization;
        let ordered = 0.0 <= reg.min && reg.min <= reg.initial && reg.initial <= reg.max;
        if !(ordered && reg.max.is_finite()) {
            return Err(ConfigError::invalid(
                "regularization",
                "requires finite 0 <= min <= initial <= max",
            ));
        }
        if !(reg.factor > 1.0 && reg.factor.is_finite()) {
            return Err(ConfigError::invalid("regularization.factor", "must be finite and > 1"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MpcSettings
// ---------------------------------------------------------------------------

/// Receding-horizon settings for the real-time wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpcSettings {
    /// Optimization horizon length in seconds.
    #[serde(default = "default_time_horizon")]
    pub time_horizon: f64,

    /// Number of backward-pass partitions (snapped to mode switches).
    #[serde(default = "default_num_partitions")]
    pub num_partitions: usize,

    /// If set, the publisher re-sends the current policy with `updated = false`
    /// whenever no new solve arrives within this many milliseconds.
    #[serde(default)]
    pub publish_heartbeat_ms: Option<u64>,
}

impl Default for MpcSettings {
    fn default() -> Self {
        Self {
            time_horizon: default_time_horizon(),
            num_partitions: default_num_partitions(),
            publish_heartbeat_ms: None,
        }
    }
}

impl MpcSettings {
    /// Validate settings. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("time_horizon", self.time_horizon)?;
        if self.num_partitions == 0 {
            return Err(ConfigError::invalid("num_partitions", "must be >= 1"));
        }
        if self.publish_heartbeat_ms == Some(0) {
            return Err(ConfigError::invalid("publish_heartbeat_ms", "must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gait, swing and stance settings
// ---------------------------------------------------------------------------

/// Gait scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaitSettings {
    /// Duration of the stance phase inserted between an old and a new gait (seconds).
    /// Skipped when the timeline already ends in stance.
    #[serde(default = "default_phase_transition_stance_time")]
    pub phase_transition_stance_time: f64,
}

impl Default for GaitSettings {
    fn default() -> Self {
        Self {
            phase_transition_stance_time: default_phase_transition_stance_time(),
        }
    }
}

/// Shape of a planned swing trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwingProfile {
    /// Desired swing height above the interpolated terrain (meters).
    #[serde(default = "default_swing_height")]
    pub swing_height: f64,

    /// Horizontal apex velocity is `apex_velocity_factor * swing distance / swing duration`.
    #[serde(default = "default_apex_velocity_factor")]
    pub apex_velocity_factor: f64,

    /// Desired signed-distance clearance at mid-swing.
    #[serde(default)]
    pub sdf_midswing_margin: f64,

    /// Desired signed-distance clearance at liftoff and touchdown. A slightly
    /// negative value tolerates some ground penetration.
    #[serde(default = "default_sdf_start_end_margin")]
    pub sdf_start_end_margin: f64,

    /// Vertical velocity along the terrain normal at liftoff (m/s).
    #[serde(default = "default_liftoff_velocity")]
    pub liftoff_velocity: f64,

    /// Vertical velocity along the terrain normal at touchdown (m/s, negative is downward).
    #[serde(default = "default_touchdown_velocity")]
    pub touchdown_velocity: f64,
}

impl Default for SwingProfile {
    fn default() -> Self {
        Self {
            swing_height: default_swing_height(),
            apex_velocity_factor: default_apex_velocity_factor(),
            sdf_midswing_margin: 0.0,
            sdf_start_end_margin: default_sdf_start_end_margin(),
            liftoff_velocity: default_liftoff_velocity(),
            touchdown_velocity: default_touchdown_velocity(),
        }
    }
}

impl SwingProfile {
    /// Validate settings. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.swing_height < 0.0 {
            return Err(ConfigError::invalid("swing_height", "must be >= 0"));
        }
        if self.apex_velocity_factor < 0.0 {
            return Err(ConfigError::invalid("apex_velocity_factor", "must be >= 0"));
        }
        Ok(())
    }
}

/// Stance phase and foothold planning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StanceSettings {
    /// Position feedback gain of the normal-direction foot constraint.
    /// Zero turns the constraint into a pure velocity constraint.
    #[serde(default)]
    pub position_gain: f64,

    /// Margin by which the convex support region is shrunk (meters).
    #[serde(default)]
    pub terrain_margin: f64,

    /// Capture-point gain used by the foothold heuristic.
    #[serde(default = "default_cp_gain")]
    pub cp_gain: f64,

    /// Maximum horizontal distance between hip and planned foothold (meters).
    #[serde(default = "default_max_reach")]
    pub max_reach: f64,

    /// Duration assumed for phases that are open-ended on the timeline (seconds).
    #[serde(default = "default_nominal_phase_duration")]
    pub nominal_phase_duration: f64,

    /// Gravitational acceleration used by the capture-point gain (m/s^2).
    #[serde(default = "default_gravity")]
    pub gravity: f64,
}

impl Default for StanceSettings {
    fn default() -> Self {
        Self {
            position_gain: 0.0,
            terrain_margin: 0.0,
            cp_gain: default_cp_gain(),
            max_reach: default_max_reach(),
            nominal_phase_duration: default_nominal_phase_duration(),
            gravity: default_gravity(),
        }
    }
}

impl StanceSettings {
    /// Validate settings. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.position_gain < 0.0 {
            return Err(ConfigError::invalid("position_gain", "must be >= 0"));
        }
        if self.terrain_margin < 0.0 {
            return Err(ConfigError::invalid("terrain_margin", "must be >= 0"));
        }
        require_positive("max_reach", self.max_reach)?;
        require_positive("nominal_phase_duration", self.nominal_phase_duration)?;
        require_positive("gravity", self.gravity)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MpcStackConfig
// ---------------------------------------------------------------------------

/// Complete configuration of the MPC stack, loadable from a single TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MpcStackConfig {
    #[serde(default)]
    pub ddp: DdpSettings,

    #[serde(default)]
    pub mpc: MpcSettings,

    #[serde(default)]
    pub gait: GaitSettings,

    #[serde(default)]
    pub swing: SwingProfile,

    #[serde(default)]
    pub stance: StanceSettings,
}

impl MpcStackConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ddp.validate()?;
        self.mpc.validate()?;
        self.swing.validate()?;
        self.stance.validate()?;
        if self.gait.phase_transition_stance_time < 0.0 {
            return Err(ConfigError::invalid(
                "gait.phase_transition_stance_time",
                "must be >= 0",
            ));
        }
        Ok(())
    }

    /// Parse from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        MpcStackConfig::default().validate().unwrap();
    }

    #[test]
    fn swing_profile_defaults_match_reference_shape() {
        let profile = SwingProfile::default();
        assert!((profile.swing_height - 0.1).abs() < 1e-12);
        assert!((profile.apex_velocity_factor - 3.0).abs() < 1e-12);
        assert!(profile.sdf_start_end_margin < 0.0);
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = MpcStackConfig::from_toml_str("").unwrap();
        assert_eq!(config, MpcStackConfig::default());
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = MpcStackConfig::from_toml_str(
            r"
            [ddp]
            max_iterations = 3
            num_threads = 4

            [ddp.line_search]
            contraction_rate = 0.7

            [mpc]
            time_horizon = 0.8
            publish_heartbeat_ms = 50

            [swing]
            swing_height = 0.15
            ",
        )
        .unwrap();
        assert_eq!(config.ddp.max_iterations, 3);
        assert_eq!(config.ddp.num_threads, 4);
        assert!((config.ddp.line_search.contraction_rate - 0.7).abs() < 1e-12);
        assert!((config.ddp.line_search.min_step_length - 0.05).abs() < 1e-12);
        assert_eq!(config.mpc.publish_heartbeat_ms, Some(50));
        assert!((config.swing.swing_height - 0.15).abs() < 1e-12);
        assert!((config.gait.phase_transition_stance_time - 0.4).abs() < 1e-12);
    }

    #[test]
    fn backward_pass_kind_parses_snake_case() {
        let config = MpcStackConfig::from_toml_str(
            r#"
            [ddp]
            backward_pass = "continuous"
            continuous_steps = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.ddp.backward_pass, BackwardPassKind::Continuous);
        assert_eq!(config.ddp.continuous_steps, 4);
        assert_eq!(DdpSettings::default().backward_pass, BackwardPassKind::Discrete);
    }

    #[test]
    fn invalid_contraction_rate_rejected() {
        let mut ddp = DdpSettings::default();
        ddp.line_search.contraction_rate = 1.0;
        let err = ddp.validate().unwrap_err();
        assert!(err.to_string().contains("contraction_rate"));
    }

    #[test]
    fn invalid_regularization_order_rejected() {
        let mut ddp = DdpSettings::default();
        ddp.regularization.min = 1.0;
        ddp.regularization.initial = 0.1;
        assert!(ddp.validate().is_err());
    }

    #[test]
    fn non_finite_regularization_rejected() {
        for field in ["factor", "max", "min", "initial"] {
            let toml = format!("[ddp.regularization]\n{field} = nan\n");
            let err = MpcStackConfig::from_toml_str(&toml).unwrap_err();
            assert!(err.to_string().contains("regularization"), "{field}: {err}");
        }
        let mut ddp = DdpSettings::default();
        ddp.regularization.max = f64::INFINITY;
        assert!(ddp.validate().is_err());
        ddp.regularization.max = 1e6;
        ddp.regularization.factor = f64::INFINITY;
        assert!(ddp.validate().is_err());
    }

    #[test]
    fn non_finite_line_search_rejected() {
        let err = MpcStackConfig::from_toml_str("[ddp.line_search]\narmijo_coefficient = nan\n").unwrap_err();
        assert!(err.to_string().contains("armijo_coefficient"));
        let mut ddp = DdpSettings::default();
        ddp.line_search.min_step_length = f64::NAN;
        assert!(ddp.validate().is_err());
    }

    #[test]
    fn zero_partitions_rejected() {
        let mpc = MpcSettings {
            num_partitions: 0,
            ..MpcSettings::default()
        };
        assert!(mpc.validate().is_err());
    }

    #[test]
    fn negative_position_gain_rejected() {
        let stance = StanceSettings {
            position_gain: -1.0,
            ..StanceSettings::default()
        };
        assert!(stance.validate().is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[mpc]\nnum_partitions = 4").unwrap();
        let config = MpcStackConfig::from_file(file.path()).unwrap();
        assert_eq!(config.mpc.num_partitions, 4);
    }

    #[test]
    fn from_file_missing_is_io_error() {
        let err = MpcStackConfig::from_file("/nonexistent/mpc.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = MpcStackConfig::from_toml_str("[ddp\nmax_iterations = ").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }
}
