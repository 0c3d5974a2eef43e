//! Tuning parameters for the estimation filters.
//!
//! All defaults come from the values the filters were tuned with on the robot. Every
//! struct is `serde`-serializable, and anything implementing [`ConfigFile`] can be written
//! to and read back from JSON, YAML or TOML files (the format is picked from the file
//! extension).
//!
//! ```toml
//! [self_ball]
//! kappa = 1.0
//! ball_decay_rate = 0.985
//! frame_rate = 30.0
//! outlier_threshold = 15.0
//!
//! [orientation]
//! gravity = 981.0
//! ```

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::FilterError;

/// Parameters of the four-state orientation filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrientationConfig {
    /// Sigma point spread parameter.
    pub kappa: f64,
    /// Nominal gravity magnitude, cm/s².
    pub gravity: f64,
    /// Initial standard deviation of the pitch and roll angles, rad.
    pub initial_angle_sd: f64,
    /// Initial standard deviation of the gyro offsets, rad/s.
    pub initial_gyro_offset_sd: f64,
    /// Additive process noise variance on the angles per time update.
    pub angle_process_noise: f64,
    /// Additive process noise variance on the gyro offsets per time update.
    pub gyro_offset_process_noise: f64,
    /// Accelerometer noise standard deviation when the measured acceleration
    /// magnitude equals gravity, cm/s². Any deviation from gravity is added to it.
    pub accel_noise_sd: f64,
}

impl Default for OrientationConfig {
    fn default() -> Self {
        OrientationConfig {
            kappa: 1.0,
            gravity: 981.0,
            initial_angle_sd: 0.5,
            initial_gyro_offset_sd: 0.1,
            angle_process_noise: 1e-3,
            gyro_offset_process_noise: 1e-5,
            accel_noise_sd: 25.0,
        }
    }
}

/// Coefficients of the odometry-proportional process noise.
///
/// `xy` is the contribution of |Δx| to the y standard deviation, `yx` the contribution
/// of |Δy| to x, `xt`/`yt` the contribution of |Δx|/|Δy| to heading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdometryNoise {
    pub xx: f64,
    pub xy: f64,
    pub yy: f64,
    pub yx: f64,
    pub tt: f64,
    pub xt: f64,
    pub yt: f64,
}

impl Default for OdometryNoise {
    fn default() -> Self {
        OdometryNoise {
            xx: 0.01,
            xy: 0.0,
            yy: 0.01,
            yx: 0.0,
            tt: 0.01,
            xt: 0.0003,
            yt: 0.0003,
        }
    }
}

/// Error model of the vision system's ball sightings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BallNoise {
    /// Bearing variance, rad².
    pub bearing_variance: f64,
    /// Range variance independent of distance, cm².
    pub range_offset: f64,
    /// Range variance per squared centimetre of distance.
    pub range_relative: f64,
}

impl Default for BallNoise {
    fn default() -> Self {
        BallNoise {
            bearing_variance: 0.0001,
            range_offset: 25.0,      // (5cm)^2
            range_relative: 0.0025, // 5% of range
        }
    }
}

/// Parameters of the seven-state self-and-ball filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfBallConfig {
    /// Sigma point spread parameter. Must be positive.
    pub kappa: f64,
    /// Fraction of ball velocity kept per frame (rolling friction).
    pub ball_decay_rate: f64,
    /// Frame rate the decay rate refers to, Hz.
    pub frame_rate: f64,
    /// Squared Mahalanobis innovation above which a measurement is rejected.
    pub outlier_threshold: f64,
    /// Maximum distance of a sigma point heading from the mean heading, rad.
    pub sigma_heading_limit: f64,
    /// Initial standard deviations (x, y, θ, ball x, ball y, ball vx, ball vy).
    pub initial_sd: [f64; 7],
    /// Baseline process noise standard deviations applied every time update.
    pub process_noise_sd: [f64; 7],
    /// Extra standard deviations added by a reset.
    pub reset_noise_sd: [f64; 7],
    pub odometry_noise: OdometryNoise,
    pub ball_noise: BallNoise,
}

impl Default for SelfBallConfig {
    fn default() -> Self {
        SelfBallConfig {
            kappa: 1.0,
            ball_decay_rate: 0.985, // speed halves every ~1.5 s
            frame_rate: 30.0,
            outlier_threshold: 15.0,
            sigma_heading_limit: 2.5,
            initial_sd: [150.0, 100.0, 2.0, 150.0, 100.0, 10.0, 10.0],
            process_noise_sd: [0.1, 0.1, 0.001, 20.0, 20.0, 5.6569, 5.6569],
            reset_noise_sd: [150.0, 100.0, 2.0, 20.0, 20.0, 0.0, 0.0],
            odometry_noise: OdometryNoise::default(),
            ball_noise: BallNoise::default(),
        }
    }
}

/// `Ok` when `value` is a positive number; NaN is rejected.
pub(crate) fn require_positive(name: &str, value: f64) -> Result<(), FilterError> {
    if value.is_nan() || value <= 0.0 {
        return Err(FilterError::InvalidConfig(format!(
            "{name} must be positive, got {value}"
        )));
    }
    Ok(())
}

impl SelfBallConfig {
    /// Reject parameter combinations the filter cannot run with.
    pub fn validate(&self) -> Result<(), FilterError> {
        require_positive("kappa", self.kappa)?;
        require_positive("frame_rate", self.frame_rate)?;
        require_positive("ball_decay_rate", self.ball_decay_rate)?;
        if self.ball_decay_rate > 1.0 {
            return Err(FilterError::InvalidConfig(format!(
                "ball_decay_rate must lie in (0, 1], got {}",
                self.ball_decay_rate
            )));
        }
        require_positive("outlier_threshold", self.outlier_threshold)?;
        require_positive("sigma_heading_limit", self.sigma_heading_limit)
    }
}

impl OrientationConfig {
    pub fn validate(&self) -> Result<(), FilterError> {
        require_positive("kappa", self.kappa)?;
        require_positive("gravity", self.gravity)
    }
}

/// Configuration of the whole estimation core.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    #[serde(default)]
    pub orientation: OrientationConfig,
    #[serde(default)]
    pub self_ball: SelfBallConfig,
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), FilterError> {
        self.orientation.validate()?;
        self.self_ball.validate()
    }
}

/// On-disk encodings understood by [`ConfigFile`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Pick the format from a file extension (`.json`, `.yaml`/`.yml` or `.toml`, any case).
    pub fn from_path(path: &Path) -> io::Result<ConfigFormat> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase());
        match ext.as_deref() {
            Some("json") => Ok(ConfigFormat::Json),
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported config file extension {:?}", other),
            )),
        }
    }
}

/// File persistence for any serde configuration struct.
pub trait ConfigFile: Serialize + DeserializeOwned {
    /// Encode as text in the given format. JSON is pretty-printed.
    fn to_string_as(&self, format: ConfigFormat) -> io::Result<String> {
        match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(io::Error::other),
            ConfigFormat::Yaml => serde_yaml::to_string(self).map_err(io::Error::other),
            ConfigFormat::Toml => toml::to_string(self).map_err(io::Error::other),
        }
    }
    /// Decode from text in the given format.
    fn from_str_as(text: &str, format: ConfigFormat) -> io::Result<Self> {
        match format {
            ConfigFormat::Json => serde_json::from_str(text).map_err(io::Error::other),
            ConfigFormat::Yaml => serde_yaml::from_str(text).map_err(io::Error::other),
            ConfigFormat::Toml => toml::from_str(text).map_err(io::Error::other),
        }
    }
    /// Write to `path`, choosing the format from its extension.
    fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        let text = self.to_string_as(ConfigFormat::from_path(path)?)?;
        File::create(path)?.write_all(text.as_bytes())
    }
    /// Read from `path`, choosing the format from its extension.
    fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let mut text = String::new();
        File::open(path)?.read_to_string(&mut text)?;
        Self::from_str_as(&text, format)
    }
}

impl ConfigFile for EstimatorConfig {}
impl ConfigFile for OrientationConfig {}
impl ConfigFile for SelfBallConfig {}
