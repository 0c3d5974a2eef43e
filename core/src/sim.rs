//! Synthetic data generation for closed-loop filter testing.
//!
//! This module provides:
//! - [`FieldScenario`]: a robot walking a curved path on the field while a ball rolls around it,
//!   producing noisy odometry, landmark sightings and ball sightings together with the ground truth
//! - [`TiltScenario`]: a standing robot swaying in pitch and roll, producing noisy and biased
//!   gyroscope rates and accelerometer readings for the orientation filter
//!
//! Both are driven by a seeded [`StdRng`], so a given configuration always produces the same data.
//! The motion models match the ones the filters assume (mid-heading odometry, per-frame ball
//! decay), so with noise switched off the filters should track the truth exactly.

use std::f64::consts::PI;

use nalgebra::{Vector2, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigFile, require_positive};
use crate::error::FilterError;
use crate::measurements::LandmarkMeasurement;
use crate::wrap_to_pi;

/// Goal posts and the two side beacons, cm.
pub const DEFAULT_LANDMARKS: [(f64, f64); 6] = [
    (-300.0, 70.0),
    (-300.0, -70.0),
    (300.0, 70.0),
    (300.0, -70.0),
    (0.0, 200.0),
    (0.0, -200.0),
];

/// Configuration of a [`FieldScenario`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldScenarioConfig {
    pub seed: u64,
    /// Control cycle, ms.
    pub dt_ms: f64,
    /// Walking speed, cm/s.
    pub forward_speed: f64,
    /// Turn rate, rad/s.
    pub turn_rate: f64,
    /// Initial robot pose (x, y, heading).
    pub start_pose: [f64; 3],
    /// Initial ball position and velocity (x, y, vx, vy).
    pub start_ball: [f64; 4],
    /// Ball velocity kept per frame.
    pub ball_decay_rate: f64,
    pub frame_rate: f64,
    /// Standard deviation of the odometry error per cycle (x, y, heading).
    pub odometry_noise_sd: [f64; 3],
    /// Range error standard deviation independent of distance, cm.
    pub range_noise_offset_sd: f64,
    /// Range error standard deviation as a fraction of the range.
    pub range_noise_relative_sd: f64,
    /// Bearing error standard deviation, rad.
    pub bearing_noise_sd: f64,
    /// Horizontal field of view of the camera, rad.
    pub field_of_view: f64,
    /// Objects further away than this are not seen, cm.
    pub max_range: f64,
    pub landmarks: Vec<(f64, f64)>,
}

impl Default for FieldScenarioConfig {
    fn default() -> Self {
        FieldScenarioConfig {
            seed: 42,
            dt_ms: 1000.0 / 30.0,
            forward_speed: 15.0,
            turn_rate: 0.15,
            start_pose: [-100.0, 0.0, 0.0],
            start_ball: [100.0, 50.0, -20.0, 10.0],
            ball_decay_rate: 0.985,
            frame_rate: 30.0,
            odometry_noise_sd: [0.2, 0.2, 0.003],
            range_noise_offset_sd: 5.0,
            range_noise_relative_sd: 0.05,
            bearing_noise_sd: 0.01,
            field_of_view: 2.0 * PI,
            max_range: 600.0,
            landmarks: DEFAULT_LANDMARKS.to_vec(),
        }
    }
}

impl ConfigFile for FieldScenarioConfig {}

/// True robot and ball state, in the order of the self-and-ball filter state.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub ball_x: f64,
    pub ball_y: f64,
    pub ball_vx: f64,
    pub ball_vy: f64,
}

/// A noisy range and bearing sighting.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    pub range: f64,
    pub bearing: f64,
}

/// A sighting of a landmark at a known position.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSighting {
    pub x: f64,
    pub y: f64,
    pub sighting: Sighting,
}

impl LandmarkSighting {
    /// Measurement for the self-and-ball filter with the noise model the sighting was drawn from.
    pub fn to_measurement(&self, config: &FieldScenarioConfig) -> LandmarkMeasurement {
        LandmarkMeasurement {
            range: self.sighting.range,
            bearing: self.sighting.bearing,
            x: self.x,
            y: self.y,
            range_noise_offset: config.range_noise_offset_sd.powi(2),
            range_noise_relative: config.range_noise_relative_sd.powi(2),
            bearing_noise: config.bearing_noise_sd.powi(2),
        }
    }
}

/// Everything the robot experiences in one control cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioStep {
    pub time_ms: f64,
    pub truth: GroundTruth,
    /// Noisy odometry delta (x, y, heading) in the robot frame since the previous step.
    pub odometry: [f64; 3],
    pub landmarks: Vec<LandmarkSighting>,
    pub ball: Option<Sighting>,
}

/// Deterministic walking-robot scenario.
pub struct FieldScenario {
    config: FieldScenarioConfig,
    rng: StdRng,
    odometry_noise: [Normal<f64>; 3],
    unit_noise: Normal<f64>,
    truth: GroundTruth,
    time_ms: f64,
}

fn normal(mean: f64, sd: f64) -> Result<Normal<f64>, FilterError> {
    Normal::new(mean, sd).map_err(|e| FilterError::InvalidConfig(format!("noise sd {sd}: {e}")))
}

impl FieldScenario {
    pub fn new(config: FieldScenarioConfig) -> Result<FieldScenario, FilterError> {
        require_positive("dt_ms", config.dt_ms)?;
        let odometry_noise = [
            normal(0.0, config.odometry_noise_sd[0])?,
            normal(0.0, config.odometry_noise_sd[1])?,
            normal(0.0, config.odometry_noise_sd[2])?,
        ];
        let [x, y, theta] = config.start_pose;
        let [ball_x, ball_y, ball_vx, ball_vy] = config.start_ball;
        Ok(FieldScenario {
            rng: StdRng::seed_from_u64(config.seed),
            odometry_noise,
            unit_noise: normal(0.0, 1.0)?,
            truth: GroundTruth {
                x,
                y,
                theta: wrap_to_pi(theta),
                ball_x,
                ball_y,
                ball_vx,
                ball_vy,
            },
            time_ms: 0.0,
            config,
        })
    }

    pub fn config(&self) -> &FieldScenarioConfig {
        &self.config
    }

    pub fn truth(&self) -> &GroundTruth {
        &self.truth
    }

    /// Advance one control cycle.
    pub fn step(&mut self) -> ScenarioStep {
        let dt = self.config.dt_ms / 1000.0;
        let dx = self.config.forward_speed * dt;
        let dtheta = self.config.turn_rate * dt;

        let mid = self.truth.theta + 0.5 * dtheta;
        self.truth.x += dx * mid.cos();
        self.truth.y += dx * mid.sin();
        self.truth.theta = wrap_to_pi(self.truth.theta + dtheta);

        let decay = self.config.ball_decay_rate.powf(dt * self.config.frame_rate);
        self.truth.ball_x += self.truth.ball_vx * dt;
        self.truth.ball_y += self.truth.ball_vy * dt;
        self.truth.ball_vx *= decay;
        self.truth.ball_vy *= decay;
        self.time_ms += self.config.dt_ms;

        let odometry = [
            dx + self.odometry_noise[0].sample(&mut self.rng),
            self.odometry_noise[1].sample(&mut self.rng),
            dtheta + self.odometry_noise[2].sample(&mut self.rng),
        ];

        let mut landmarks = Vec::new();
        for i in 0..self.config.landmarks.len() {
            let (x, y) = self.config.landmarks[i];
            if let Some(sighting) = self.sight(x, y) {
                landmarks.push(LandmarkSighting { x, y, sighting });
            }
        }
        let ball = self.sight(self.truth.ball_x, self.truth.ball_y);

        ScenarioStep {
            time_ms: self.time_ms,
            truth: self.truth,
            odometry,
            landmarks,
            ball,
        }
    }

    /// Generate `steps` consecutive cycles.
    pub fn run(&mut self, steps: usize) -> Vec<ScenarioStep> {
        (0..steps).map(|_| self.step()).collect()
    }

    fn sight(&mut self, x: f64, y: f64) -> Option<Sighting> {
        let dx = x - self.truth.x;
        let dy = y - self.truth.y;
        let range = dx.hypot(dy);
        let bearing = wrap_to_pi(dy.atan2(dx) - self.truth.theta);
        if range > self.config.max_range || bearing.abs() > 0.5 * self.config.field_of_view {
            return None;
        }
        let range_sd = (self.config.range_noise_offset_sd.powi(2)
            + (self.config.range_noise_relative_sd * range).powi(2))
        .sqrt();
        let noisy_range = range + range_sd * self.unit_noise.sample(&mut self.rng);
        let noisy_bearing =
            bearing + self.config.bearing_noise_sd * self.unit_noise.sample(&mut self.rng);
        Some(Sighting {
            range: noisy_range.max(0.0),
            bearing: wrap_to_pi(noisy_bearing),
        })
    }
}

/// Configuration of a [`TiltScenario`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiltScenarioConfig {
    pub seed: u64,
    pub dt_ms: f64,
    pub gravity: f64,
    /// Sway amplitude in pitch and roll, rad.
    pub amplitude: [f64; 2],
    /// Sway period, s.
    pub period: f64,
    /// Constant gyroscope bias (roll, pitch), rad/s.
    pub gyro_bias: [f64; 2],
    pub gyro_noise_sd: f64,
    /// Accelerometer noise, cm/s².
    pub accel_noise_sd: f64,
}

impl Default for TiltScenarioConfig {
    fn default() -> Self {
        TiltScenarioConfig {
            seed: 7,
            dt_ms: 10.0,
            gravity: 981.0,
            amplitude: [0.1, 0.05],
            period: 2.0,
            gyro_bias: [0.01, -0.02],
            gyro_noise_sd: 0.002,
            accel_noise_sd: 10.0,
        }
    }
}

impl ConfigFile for TiltScenarioConfig {}

/// One inertial sample with its ground truth.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImuSample {
    pub time_ms: f64,
    /// Gyroscope (roll rate, pitch rate), rad/s.
    pub gyro: Vector2<f64>,
    /// Accelerometer, cm/s².
    pub accel: Vector3<f64>,
    pub pitch: f64,
    pub roll: f64,
}

/// A standing robot swaying sinusoidally in pitch and roll.
///
/// The sway starts at its extreme, so the first sample is taken with the body momentarily at
/// rest and the gyroscope reads its bias only.
pub struct TiltScenario {
    config: TiltScenarioConfig,
    rng: StdRng,
    gyro_noise: Normal<f64>,
    accel_noise: Normal<f64>,
    time_ms: f64,
}

impl TiltScenario {
    pub fn new(config: TiltScenarioConfig) -> Result<TiltScenario, FilterError> {
        require_positive("period", config.period)?;
        require_positive("dt_ms", config.dt_ms)?;
        Ok(TiltScenario {
            rng: StdRng::seed_from_u64(config.seed),
            gyro_noise: normal(0.0, config.gyro_noise_sd)?,
            accel_noise: normal(0.0, config.accel_noise_sd)?,
            time_ms: 0.0,
            config,
        })
    }

    /// Sample at the current time, then advance by one cycle.
    pub fn sample(&mut self) -> ImuSample {
        let t = self.time_ms / 1000.0;
        let w = 2.0 * PI / self.config.period;
        let [pitch_amp, roll_amp] = self.config.amplitude;
        let (sin_wt, cos_wt) = (w * t).sin_cos();
        let pitch = pitch_amp * cos_wt;
        let roll = roll_amp * cos_wt;
        let pitch_rate = -pitch_amp * w * sin_wt;
        let roll_rate = -roll_amp * w * sin_wt;

        let g = self.config.gravity;
        let gyro = Vector2::new(
            roll_rate + self.config.gyro_bias[0] + self.gyro_noise.sample(&mut self.rng),
            pitch_rate + self.config.gyro_bias[1] + self.gyro_noise.sample(&mut self.rng),
        );
        let accel = Vector3::new(
            g * pitch.sin() + self.accel_noise.sample(&mut self.rng),
            -g * roll.sin() + self.accel_noise.sample(&mut self.rng),
            -g * pitch.cos() * roll.cos() + self.accel_noise.sample(&mut self.rng),
        );
        let sample = ImuSample {
            time_ms: self.time_ms,
            gyro,
            accel,
            pitch,
            roll,
        };
        self.time_ms += self.config.dt_ms;
        sample
    }
}
