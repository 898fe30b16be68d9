//! Controller configuration.
//!
//! The configuration file keeps the JSON layout used by the ground station
//! since the first flights:
//!
//! ```json
//! {
//!   "thrust":    {"kP": 0.05, "kD": 0.04, "kI": 0.0005, "C": 0.5},
//!   "pitchroll": {"kP": 0.5,  "kD": 0.4},
//!   "yaw":       {"kP": 2.0,  "kD": 0.1},
//!   "m": 0.027,
//!   "g": 9.81,
//!   "waypoint_margin": 0.1,
//!   "coordinates": {"x": [0.0], "y": [0.0], "z": [1.0], "yaw": [0.0], "relative": true}
//! }
//! ```
//!
//! Output limits, the integral clamp and the safety envelope are optional
//! and fall back to their defaults. Unknown keys (such as an unused `kI` on
//! the PD channels) are ignored.
//!
//! A [`ConfigHandle`] holds the live snapshot. The control loop clones the
//! snapshot once at the top of every tick, so a reload through
//! [`ConfigHandle::replace`] or the background [`ConfigReloader`] never lands
//! in the middle of a computation.

mod reload;

pub use reload::{ConfigReloader, ReloadOutcome};

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::safety::SafetyEnvelope;
use crate::waypoints::WaypointPlan;

/// Thrust value representing full scale on the actuator interface (2^16).
pub const THRUST_FULL_SCALE: f64 = 65536.0;

/// Errors raised while loading or validating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON or does not match the expected layout.
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The file parsed but contains values the controller cannot fly with.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Closed numeric range `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
}

impl Bounds {
    /// Create a range from its endpoints.
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Create the range `[-limit, limit]`.
    pub const fn symmetric(limit: f64) -> Self {
        Self {
            min: -limit,
            max: limit,
        }
    }

    /// Clamp a value into the range.
    ///
    /// NaN passes through untouched so callers can still detect it.
    pub fn clamp(&self, value: f64) -> f64 {
        if value < self.min {
            self.min
        } else if value > self.max {
            self.max
        } else {
            value
        }
    }

    /// True when `min <= value <= max`.
    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }

    fn is_ordered(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

/// Gains for the height (thrust) channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThrustGains {
    /// Proportional gain on height error
    #[serde(rename = "kP")]
    pub kp: f64,
    /// Derivative gain on vertical velocity
    #[serde(rename = "kD")]
    pub kd: f64,
    /// Integral gain on accumulated height error
    #[serde(rename = "kI")]
    pub ki: f64,
    /// Force-to-command conversion constant
    #[serde(rename = "C")]
    pub c: f64,
}

/// Gains for a proportional-derivative channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PdGains {
    /// Proportional gain
    #[serde(rename = "kP")]
    pub kp: f64,
    /// Derivative gain
    #[serde(rename = "kD")]
    pub kd: f64,
}

/// Per-channel output ranges applied after the control law.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputLimits {
    /// Thrust range in device units, within [0, 65535]
    pub thrust: Bounds,
    /// Roll command range in degrees
    pub roll: Bounds,
    /// Pitch command range in degrees
    pub pitch: Bounds,
    /// Yaw-rate command range in degrees per second
    pub yaw_rate: Bounds,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            thrust: Bounds::new(0.0, 0.8 * THRUST_FULL_SCALE - 1.0),
            roll: Bounds::symmetric(30.0),
            pitch: Bounds::symmetric(30.0),
            yaw_rate: Bounds::symmetric(200.0),
        }
    }
}

fn default_integral_limit() -> Bounds {
    Bounds::symmetric(200.0)
}

/// Complete controller configuration snapshot.
///
/// Immutable once published through a [`ConfigHandle`]; a reload replaces
/// the whole snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Height channel gains
    pub thrust: ThrustGains,
    /// Lateral (pitch/roll) channel gains
    #[serde(rename = "pitchroll")]
    pub lateral: PdGains,
    /// Yaw channel gains
    pub yaw: PdGains,
    /// Vehicle mass in kg
    #[serde(rename = "m")]
    pub mass: f64,
    /// Gravitational acceleration in m/s^2
    #[serde(rename = "g")]
    pub gravity: f64,
    /// Output clamp ranges
    #[serde(default)]
    pub limits: OutputLimits,
    /// Clamp range for the accumulated height error
    #[serde(default = "default_integral_limit")]
    pub integral_limit: Bounds,
    /// Operating envelope for the position sanity check
    #[serde(default)]
    pub envelope: SafetyEnvelope,
    /// Error magnitude below which a waypoint counts as reached (m)
    pub waypoint_margin: f64,
    /// Waypoint plan flown by the sequencer
    #[serde(default, rename = "coordinates")]
    pub waypoints: WaypointPlan,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            thrust: ThrustGains {
                kp: 0.05,
                kd: 0.04,
                ki: 0.0005,
                c: 0.5,
            },
            lateral: PdGains { kp: 0.5, kd: 0.4 },
            yaw: PdGains { kp: 2.0, kd: 0.1 },
            mass: 0.027,
            gravity: 9.81,
            limits: OutputLimits::default(),
            integral_limit: default_integral_limit(),
            envelope: SafetyEnvelope::default(),
            waypoint_margin: 0.1,
            waypoints: WaypointPlan::default(),
        }
    }
}

impl ControllerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse and validate a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Weight of the vehicle (m * g) in newtons.
    pub fn weight(&self) -> f64 {
        self.mass * self.gravity
    }

    /// Check that every value is usable by the control law.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scalars = [
            ("thrust.kP", self.thrust.kp),
            ("thrust.kD", self.thrust.kd),
            ("thrust.kI", self.thrust.ki),
            ("thrust.C", self.thrust.c),
            ("pitchroll.kP", self.lateral.kp),
            ("pitchroll.kD", self.lateral.kd),
            ("yaw.kP", self.yaw.kp),
            ("yaw.kD", self.yaw.kd),
            ("m", self.mass),
            ("g", self.gravity),
            ("waypoint_margin", self.waypoint_margin),
        ];
        if let Some((name, value)) = scalars.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ConfigError::Invalid(format!("{name} is not finite ({value})")));
        }

        if self.mass <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "mass must be positive, got {}",
                self.mass
            )));
        }
        if self.waypoint_margin <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "waypoint_margin must be positive, got {}",
                self.waypoint_margin
            )));
        }

        let ranges = [
            ("limits.thrust", self.limits.thrust),
            ("limits.roll", self.limits.roll),
            ("limits.pitch", self.limits.pitch),
            ("limits.yaw_rate", self.limits.yaw_rate),
            ("integral_limit", self.integral_limit),
        ];
        for (name, range) in ranges {
            if !range.is_ordered() {
                return Err(ConfigError::Invalid(format!(
                    "{name} must satisfy min <= max, got [{}, {}]",
                    range.min, range.max
                )));
            }
        }
        if self.limits.thrust.min < 0.0 || self.limits.thrust.max > f64::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "limits.thrust must lie within [0, 65535], got [{}, {}]",
                self.limits.thrust.min, self.limits.thrust.max
            )));
        }

        self.envelope
            .validate()
            .map_err(|msg| ConfigError::Invalid(format!("envelope: {msg}")))?;

        Ok(())
    }
}

pub(crate) fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Shared, atomically swappable configuration snapshot.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<ControllerConfig>>>,
    source: Option<PathBuf>,
    /// Modification time of `source` when it was loaded
    loaded_modified: Option<SystemTime>,
}

impl ConfigHandle {
    /// Publish an initial snapshot.
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            source: None,
            loaded_modified: None,
        }
    }

    /// Load the initial snapshot from a file and remember its path.
    ///
    /// The modification time is read before the file, so an edit racing the
    /// load is seen as a change by a [`ConfigReloader`] started afterwards.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let loaded_modified = modified_time(path);
        let config = ControllerConfig::load(path)?;
        Ok(Self {
            source: Some(path.to_path_buf()),
            loaded_modified,
            ..Self::new(config)
        })
    }

    /// Modification time of the source file as of the initial load.
    pub fn loaded_modified(&self) -> Option<SystemTime> {
        self.loaded_modified
    }

    /// Path the snapshot was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// The current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<ControllerConfig> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Validate and publish a new snapshot.
    pub fn replace(&self, config: ControllerConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        match self.current.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY_CONFIG: &str = r#"{
        "thrust": {"kP": 0.06, "kD": 0.05, "kI": 0.001, "C": 0.45},
        "pitchroll": {"kP": 0.4, "kD": 0.3, "kI": 0.0},
        "yaw": {"kP": 1.5, "kD": 0.2, "kI": 0.0},
        "m": 0.03,
        "g": 9.81,
        "waypoint_margin": 0.15,
        "coordinates": {
            "x": [0.0, 1.0],
            "y": [0.0, 0.5],
            "z": [1.0, 1.2],
            "yaw": [0.0, 90.0],
            "relative": true
        }
    }"#;

    #[test]
    fn test_parse_legacy_layout() {
        let config = ControllerConfig::from_json(LEGACY_CONFIG).unwrap();

        assert_eq!(config.thrust.kp, 0.06);
        assert_eq!(config.thrust.c, 0.45);
        assert_eq!(config.lateral.kd, 0.3);
        assert_eq!(config.yaw.kp, 1.5);
        assert_eq!(config.mass, 0.03);
        assert_eq!(config.waypoint_margin, 0.15);
        assert_eq!(config.waypoints.len(), 2);
        assert!(config.waypoints.relative);

        // Optional sections fall back to defaults
        assert_eq!(config.limits, OutputLimits::default());
        assert_eq!(config.integral_limit, Bounds::symmetric(200.0));
        assert_eq!(config.envelope, SafetyEnvelope::default());
    }

    #[test]
    fn test_missing_coordinates_is_empty_plan() {
        let json = r#"{
            "thrust": {"kP": 0.06, "kD": 0.05, "kI": 0.001, "C": 0.45},
            "pitchroll": {"kP": 0.4, "kD": 0.3},
            "yaw": {"kP": 1.5, "kD": 0.2},
            "m": 0.03, "g": 9.81, "waypoint_margin": 0.15
        }"#;
        let config = ControllerConfig::from_json(json).unwrap();
        assert!(config.waypoints.is_empty());
    }

    #[test]
    fn test_mismatched_coordinate_columns_rejected() {
        let json = LEGACY_CONFIG.replace("\"z\": [1.0, 1.2]", "\"z\": [1.0]");
        let result = ControllerConfig::from_json(&json);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_default_config_is_valid() {
        ControllerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_inverted_limits_rejected() {
        let mut config = ControllerConfig::default();
        config.limits.roll = Bounds::new(10.0, -10.0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_thrust_limit_above_device_range_rejected() {
        let mut config = ControllerConfig::default();
        config.limits.thrust = Bounds::new(0.0, 70000.0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_non_finite_gain_rejected() {
        let mut config = ControllerConfig::default();
        config.yaw.kd = f64::NAN;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("yaw.kD"));
    }

    #[test]
    fn test_non_positive_margin_rejected() {
        let mut config = ControllerConfig::default();
        config.waypoint_margin = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = ControllerConfig::from_json(LEGACY_CONFIG).unwrap();
        config.save(&path).unwrap();
        let loaded = ControllerConfig::load(&path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_handle_replace_swaps_snapshot() {
        let handle = ConfigHandle::new(ControllerConfig::default());
        let before = handle.snapshot();

        let mut updated = ControllerConfig::default();
        updated.lateral.kp = 0.9;
        handle.replace(updated).unwrap();

        // Old snapshot is untouched, new readers see the update
        assert_eq!(before.lateral.kp, 0.5);
        assert_eq!(handle.snapshot().lateral.kp, 0.9);
    }

    #[test]
    fn test_from_file_records_modified_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        ControllerConfig::default().save(&path).unwrap();
        let mtime = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        let handle = ConfigHandle::from_file(&path).unwrap();
        assert_eq!(handle.loaded_modified(), Some(mtime));
        assert_eq!(handle.source(), Some(path.as_path()));
        assert_eq!(ConfigHandle::new(ControllerConfig::default()).loaded_modified(), None);
    }

    #[test]
    fn test_handle_replace_rejects_invalid() {
        let handle = ConfigHandle::new(ControllerConfig::default());
        let mut bad = ControllerConfig::default();
        bad.mass = -1.0;

        assert!(handle.replace(bad).is_err());
        assert_eq!(handle.snapshot().mass, 0.027);
    }

    #[test]
    fn test_bounds_clamp_passes_nan() {
        let bounds = Bounds::symmetric(1.0);
        assert_eq!(bounds.clamp(2.0), 1.0);
        assert_eq!(bounds.clamp(-2.0), -1.0);
        assert_eq!(bounds.clamp(0.5), 0.5);
        assert!(bounds.clamp(f64::NAN).is_nan());
    }
}
