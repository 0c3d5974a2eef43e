//! Pitch and roll estimation from gyroscope and accelerometer readings
//!
//! A four-state small-angle estimator built on the generic [`UnscentedKalmanFilter`]. The state is
//!
//! | index | state               | units |
//! |-------|---------------------|-------|
//! | 0     | pitch angle         | rad   |
//! | 1     | pitch gyro offset   | rad/s |
//! | 2     | roll angle          | rad   |
//! | 3     | roll gyro offset    | rad/s |
//!
//! The gyroscope drives the prediction: each angle integrates its bias-corrected rate,
//!
//! $$
//! \theta_{k+1} = \theta_k + (\omega - b_k)\,\Delta t, \qquad b_{k+1} = b_k
//! $$
//!
//! and the accelerometer corrects it through its view of gravity
//!
//! $$
//! a = \begin{bmatrix} g \sin\theta_p \\\\ -g \sin\theta_r \\\\ -g \cos\theta_p \cos\theta_r \end{bmatrix}
//! $$
//!
//! The accelerometer is trusted less while the robot accelerates: the measurement noise standard
//! deviation grows with the difference between the measured acceleration magnitude and gravity.

use std::fmt::{self, Display};

use log::{debug, trace};
use nalgebra::{DMatrix, DVector, Vector2, Vector3};

use crate::config::OrientationConfig;
use crate::error::FilterError;
use crate::ukf::UnscentedKalmanFilter;
use crate::wrap_to_pi;

/// Indices of the orientation filter state vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OrientationState {
    PitchAngle = 0,
    PitchGyroOffset = 1,
    RollAngle = 2,
    RollGyroOffset = 3,
}

impl OrientationState {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Two-axis orientation filter.
///
/// Gyroscope rates are given as a [`Vector2`] holding `(roll rate, pitch rate)` in rad/s, and
/// accelerations as a [`Vector3`] in the robot's body frame in cm/s².
#[derive(Clone, Debug)]
pub struct OrientationFilter {
    ukf: UnscentedKalmanFilter,
    config: OrientationConfig,
    time_of_last_update: f64,
    initialised: bool,
}

impl OrientationFilter {
    pub fn new(config: OrientationConfig) -> Result<OrientationFilter, FilterError> {
        config.validate()?;
        Ok(OrientationFilter {
            ukf: UnscentedKalmanFilter::new(OrientationState::COUNT, config.kappa),
            config,
            time_of_last_update: 0.0,
            initialised: false,
        })
    }

    /// Seed the filter assuming the robot is standing still.
    ///
    /// The gyro offsets are taken to be the current rate readings and the angles come from the
    /// direction of gravity in the accelerometer reading. Non-finite readings are rejected and
    /// leave the filter as it was.
    pub fn initialise(
        &mut self,
        timestamp_ms: f64,
        gyro: &Vector2<f64>,
        accel: &Vector3<f64>,
    ) -> Result<(), FilterError> {
        if !timestamp_ms.is_finite()
            || !gyro.iter().all(|v| v.is_finite())
            || !accel.iter().all(|v| v.is_finite())
        {
            return Err(FilterError::NumericalFailure(
                "non-finite inertial sample at initialisation".to_string(),
            ));
        }
        let pitch = accel[0].atan2(-accel[2]);
        let roll = (-accel[1]).atan2(-accel[2]);
        let mean = DVector::from_vec(vec![pitch, gyro[1], roll, gyro[0]]);
        let angle_var = self.config.initial_angle_sd.powi(2);
        let offset_var = self.config.initial_gyro_offset_sd.powi(2);
        let covariance = DMatrix::from_diagonal(&DVector::from_vec(vec![
            angle_var, offset_var, angle_var, offset_var,
        ]));
        let mut ukf = UnscentedKalmanFilter::new(OrientationState::COUNT, self.config.kappa);
        ukf.set_state(mean, covariance)?;
        self.ukf = ukf;
        self.time_of_last_update = timestamp_ms;
        self.initialised = true;
        debug!(
            "orientation filter initialised at {} ms: pitch {:.4}, roll {:.4}",
            timestamp_ms, pitch, roll
        );
        Ok(())
    }

    /// Propagate the state to `timestamp_ms` with the latest gyroscope rates.
    pub fn time_update(&mut self, gyro: &Vector2<f64>, timestamp_ms: f64) -> Result<(), FilterError> {
        if !self.initialised {
            return Err(FilterError::NotInitialised);
        }
        if timestamp_ms < self.time_of_last_update {
            return Err(FilterError::NonMonotonicTimestamp {
                previous: self.time_of_last_update,
                current: timestamp_ms,
            });
        }
        let dt = (timestamp_ms - self.time_of_last_update) / 1000.0;

        let mut a = DMatrix::<f64>::identity(4, 4);
        a[(0, 1)] = -dt;
        a[(2, 3)] = -dt;
        let mut b = DMatrix::<f64>::zeros(4, 2);
        b[(0, 0)] = dt;
        b[(2, 1)] = dt;
        let u = DVector::from_vec(vec![gyro[1], gyro[0]]);
        let control = &b * &u;

        let sigmas = self.ukf.generate_sigma_points()?;
        let mut propagated = &a * &sigmas;
        for mut column in propagated.column_iter_mut() {
            column += &control;
        }
        let q = DMatrix::from_diagonal(&DVector::from_vec(vec![
            self.config.angle_process_noise,
            self.config.gyro_offset_process_noise,
            self.config.angle_process_noise,
            self.config.gyro_offset_process_noise,
        ]));
        self.ukf.time_update(&propagated, &q)?;
        self.wrap_angles();
        self.time_of_last_update = timestamp_ms;
        Ok(())
    }

    /// Correct pitch and roll with an accelerometer reading.
    ///
    /// `kinematics` is an orientation `(pitch, roll)` derived from the joint angles. It is
    /// accepted for interface compatibility but not fused.
    pub fn measurement_update(
        &mut self,
        accel: &Vector3<f64>,
        kinematics: Option<&Vector2<f64>>,
    ) -> Result<(), FilterError> {
        if !self.initialised {
            return Err(FilterError::NotInitialised);
        }
        if let Some(k) = kinematics {
            trace!("kinematic orientation ({:.4}, {:.4}) not fused", k[0], k[1]);
        }
        let g = self.config.gravity;
        let sigmas = self.ukf.generate_sigma_points()?;
        let mut predicted = DMatrix::<f64>::zeros(3, sigmas.ncols());
        for (i, sigma) in sigmas.column_iter().enumerate() {
            let pitch = sigma[OrientationState::PitchAngle.index()];
            let roll = sigma[OrientationState::RollAngle.index()];
            predicted[(0, i)] = g * pitch.sin();
            predicted[(1, i)] = -g * roll.sin();
            predicted[(2, i)] = -g * pitch.cos() * roll.cos();
        }
        let accel_sd = self.config.accel_noise_sd + (accel.norm() - g).abs();
        let r = DMatrix::from_diagonal_element(3, 3, accel_sd * accel_sd);
        let observation = DVector::from_column_slice(accel.as_slice());
        trace!(
            "accelerometer update: |a| = {:.1}, noise sd {:.1}",
            accel.norm(),
            accel_sd
        );
        self.ukf
            .measurement_update(&observation, &r, &predicted, &sigmas)?;
        self.wrap_angles();
        Ok(())
    }

    fn wrap_angles(&mut self) {
        let mean = self.ukf.mean_mut();
        for state in [OrientationState::PitchAngle, OrientationState::RollAngle] {
            mean[state.index()] = wrap_to_pi(mean[state.index()]);
        }
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }
    pub fn time_of_last_update(&self) -> f64 {
        self.time_of_last_update
    }
    pub fn state(&self, state: OrientationState) -> f64 {
        self.ukf.state(state.index())
    }
    pub fn sd(&self, state: OrientationState) -> f64 {
        self.ukf.sd(state.index())
    }
    pub fn pitch(&self) -> f64 {
        self.state(OrientationState::PitchAngle)
    }
    pub fn roll(&self) -> f64 {
        self.state(OrientationState::RollAngle)
    }
    pub fn pitch_gyro_offset(&self) -> f64 {
        self.state(OrientationState::PitchGyroOffset)
    }
    pub fn roll_gyro_offset(&self) -> f64 {
        self.state(OrientationState::RollGyroOffset)
    }
    pub fn mean(&self) -> &DVector<f64> {
        self.ukf.mean()
    }
    pub fn covariance(&self) -> &DMatrix<f64> {
        self.ukf.covariance()
    }
}

impl Display for OrientationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pitch {:.4} ({:.4}) roll {:.4} ({:.4}) offsets {:.5}, {:.5}",
            self.pitch(),
            self.sd(OrientationState::PitchAngle),
            self.roll(),
            self.sd(OrientationState::RollAngle),
            self.pitch_gyro_offset(),
            self.roll_gyro_offset()
        )
    }
}
