//! Square-root Unscented Kalman Filter for the robot pose and the ball
//!
//! The seven-state filter jointly tracks the robot on the field and the ball:
//!
//! | index | state          | units |
//! |-------|----------------|-------|
//! | 0     | self x         | cm    |
//! | 1     | self y         | cm    |
//! | 2     | self heading   | rad   |
//! | 3     | ball x         | cm    |
//! | 4     | ball y         | cm    |
//! | 5     | ball x velocity| cm/s  |
//! | 6     | ball y velocity| cm/s  |
//!
//! The covariance is never formed during filtering. The filter carries a square-root factor $S$
//! with $P = S S^T$ and every update produces the new factor by re-triangularising an augmented
//! matrix of covariance contributions (see [`crate::linalg::triangular_square_root`]). This keeps
//! the covariance symmetric and positive semi-definite by construction over long runs.
//!
//! # Sigma points
//!
//! $$
//! \mathcal{X}_0 = \hat{x}, \qquad \mathcal{X}_i = \hat{x} + \sqrt{N + \kappa}\, S_i, \qquad
//! \mathcal{X}_{N+i} = \hat{x} - \sqrt{N + \kappa}\, S_i
//! $$
//!
//! with weights $w_0 = \kappa / (N + \kappa)$ and $w_i = 1 / (2(N + \kappa))$. Except for
//! heading-free observations, the heading of every sigma point is clamped to within a fixed distance
//! of the mean heading so that no point lands on the far side of the $\pm\pi$ discontinuity.
//!
//! # Measurement update
//!
//! With the weighted deviations $M_x = \sqrt{w_i}(\mathcal{X}_i - \hat{x})$ and
//! $M_y = \sqrt{w_i}(\mathcal{Y}_i - \bar{y})$:
//!
//! $$
//! \begin{aligned}
//! P_{yy} &= M_y M_y^T + S_R S_R^T, \qquad P_{xy} = M_x M_y^T, \qquad K = P_{xy} P_{yy}^{-1} \\\\
//! d^2 &= \nu^T P_{yy}^{-1} \nu \quad (\text{rejected if } d^2 > \text{threshold}) \\\\
//! S &\leftarrow \operatorname{tria}\left([\, M_x - K M_y \mid K S_R \,]\right), \qquad
//! \hat{x} \leftarrow \hat{x} + K \nu
//! \end{aligned}
//! $$
use std::fmt::{self, Display};
use std::io::{self, Read, Write};

use log::{debug, trace, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::config::SelfBallConfig;
use crate::error::{FilterError, UpdateOutcome};
use crate::hypothesis::Hypothesis;
use crate::linalg::{all_finite, combine_square_roots, horzcat, triangular_square_root};
use crate::measurements::{
    AngleBetweenMeasurement, BallMeasurement, LandmarkMeasurement, LinearPairMeasurement,
    ObservationModel, SharedBall,
};
use crate::wrap_to_pi;

/// Diagonal floor added to the measurement noise when computing the alpha likelihood factor.
const ALPHA_NOISE_FLOOR: f64 = 1e-6;

/// Indices of the self-and-ball state vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelfBallState {
    SelfX = 0,
    SelfY = 1,
    SelfTheta = 2,
    BallX = 3,
    BallY = 4,
    BallXVelocity = 5,
    BallYVelocity = 6,
}

impl SelfBallState {
    pub const COUNT: usize = 7;
    pub const ALL: [SelfBallState; 7] = [
        SelfBallState::SelfX,
        SelfBallState::SelfY,
        SelfBallState::SelfTheta,
        SelfBallState::BallX,
        SelfBallState::BallY,
        SelfBallState::BallXVelocity,
        SelfBallState::BallYVelocity,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Serializable image of a filter: activity flag, weight, mean and square-root covariance.
///
/// Matrices are stored column-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterSnapshot {
    pub is_active: bool,
    pub alpha: f64,
    pub mean: Vec<f64>,
    pub sqrt_covariance: Vec<f64>,
}

/// Seven-state square-root UKF over robot pose and ball.
#[derive(Clone, Debug)]
pub struct SelfBallFilter {
    mean: DVector<f64>,
    sqrt_covariance: DMatrix<f64>,
    config: SelfBallConfig,
    hypothesis: Hypothesis,
    sqrt_weights: DVector<f64>,
    spread: f64,
}

impl SelfBallFilter {
    /// New filter at the field origin with the configured initial uncertainty.
    pub fn new(config: SelfBallConfig) -> Result<SelfBallFilter, FilterError> {
        Self::with_mean(DVector::zeros(SelfBallState::COUNT), config)
    }

    /// New filter at `mean` with the configured initial uncertainty.
    pub fn with_mean(
        mean: DVector<f64>,
        config: SelfBallConfig,
    ) -> Result<SelfBallFilter, FilterError> {
        let sqrt_covariance =
            DMatrix::from_diagonal(&DVector::from_column_slice(&config.initial_sd));
        Self::with_state(mean, sqrt_covariance, config)
    }

    /// New filter from an explicit mean and square-root covariance.
    pub fn with_state(
        mean: DVector<f64>,
        sqrt_covariance: DMatrix<f64>,
        config: SelfBallConfig,
    ) -> Result<SelfBallFilter, FilterError> {
        config.validate()?;
        check_state(&mean, &sqrt_covariance)?;
        let n = SelfBallState::COUNT as f64;
        let mut sqrt_weights = DVector::from_element(
            2 * SelfBallState::COUNT + 1,
            (1.0 / (2.0 * (n + config.kappa))).sqrt(),
        );
        sqrt_weights[0] = (config.kappa / (n + config.kappa)).sqrt();
        let spread = (n + config.kappa).sqrt();
        let mut filter = SelfBallFilter {
            mean,
            sqrt_covariance,
            config,
            hypothesis: Hypothesis::new(),
            sqrt_weights,
            spread,
        };
        filter.wrap_heading();
        Ok(filter)
    }

    pub fn config(&self) -> &SelfBallConfig {
        &self.config
    }

    /// The 15 sigma points of the current state, one per column.
    ///
    /// With `clamp_heading` every heading is limited to the mean heading plus or minus the
    /// configured sigma heading limit.
    pub fn sigma_points(&self, clamp_heading: bool) -> DMatrix<f64> {
        let n = SelfBallState::COUNT;
        let theta = SelfBallState::SelfTheta.index();
        let heading = self.mean[theta];
        let limit = self.config.sigma_heading_limit;
        let mut points = DMatrix::<f64>::zeros(n, 2 * n + 1);
        points.column_mut(0).copy_from(&self.mean);
        for i in 0..n {
            let offset = self.spread * self.sqrt_covariance.column(i);
            points.column_mut(i + 1).copy_from(&(&self.mean + &offset));
            points.column_mut(n + i + 1).copy_from(&(&self.mean - &offset));
        }
        if clamp_heading {
            for mut column in points.column_iter_mut() {
                column[theta] = column[theta].max(heading - limit).min(heading + limit);
            }
        }
        points
    }

    /// Predict the state `dt_ms` milliseconds ahead using the walk engine's odometry.
    ///
    /// The odometry delta `(odom_x, odom_y, odom_theta)` is expressed in the robot frame and is
    /// applied about the heading halfway through the turn. The ball rolls on with its velocity,
    /// which decays by the configured rate once per frame. A negative time step is rejected.
    pub fn time_update(
        &mut self,
        odom_x: f64,
        odom_y: f64,
        odom_theta: f64,
        dt_ms: f64,
    ) -> Result<(), FilterError> {
        if dt_ms < 0.0 {
            return Err(FilterError::NegativeTimeStep(dt_ms));
        }
        use SelfBallState::*;
        let dt = dt_ms / 1000.0;
        let decay = self.config.ball_decay_rate.powf(dt * self.config.frame_rate);

        let mut mean = self.mean.clone();
        mean[BallX.index()] += mean[BallXVelocity.index()] * dt;
        mean[BallY.index()] += mean[BallYVelocity.index()] * dt;
        mean[BallXVelocity.index()] *= decay;
        mean[BallYVelocity.index()] *= decay;

        let mid_heading = mean[SelfTheta.index()] + 0.5 * odom_theta;
        let (sin_m, cos_m) = mid_heading.sin_cos();
        mean[SelfX.index()] += odom_x * cos_m - odom_y * sin_m;
        mean[SelfY.index()] += odom_x * sin_m + odom_y * cos_m;
        mean[SelfTheta.index()] = wrap_to_pi(mean[SelfTheta.index()] + odom_theta);

        let mut transition = DMatrix::<f64>::identity(SelfBallState::COUNT, SelfBallState::COUNT);
        transition[(BallX.index(), BallXVelocity.index())] = dt;
        transition[(BallY.index(), BallYVelocity.index())] = dt;
        transition[(BallXVelocity.index(), BallXVelocity.index())] = decay;
        transition[(BallYVelocity.index(), BallYVelocity.index())] = decay;

        // Motion-dependent noise scales the pose block of the propagated factor.
        let odometry = &self.config.odometry_noise;
        let (ax, ay, at) = (odom_x.abs(), odom_y.abs(), odom_theta.abs());
        transition[(SelfX.index(), SelfX.index())] += odometry.xx * ax;
        transition[(SelfX.index(), SelfY.index())] += odometry.yx * ay;
        transition[(SelfY.index(), SelfY.index())] += odometry.yy * ay;
        transition[(SelfY.index(), SelfX.index())] += odometry.xy * ax;
        transition[(SelfTheta.index(), SelfTheta.index())] += odometry.tt * at;
        transition[(SelfTheta.index(), SelfX.index())] += odometry.xt * ax;
        transition[(SelfTheta.index(), SelfY.index())] += odometry.yt * ay;

        let process_noise =
            DMatrix::from_diagonal(&DVector::from_column_slice(&self.config.process_noise_sd));
        let sqrt_covariance =
            combine_square_roots(&(&transition * &self.sqrt_covariance), &process_noise);
        trace!(
            "time update: odometry ({:.2}, {:.2}, {:.4}) over {} ms",
            odom_x, odom_y, odom_theta, dt_ms
        );
        self.commit(mean, sqrt_covariance)
    }

    /// Inflate the uncertainty after a possible unmodelled jump of the robot (e.g. it was picked
    /// up and put down).
    pub fn reset(&mut self) {
        let reset_noise =
            DMatrix::from_diagonal(&DVector::from_column_slice(&self.config.reset_noise_sd));
        self.sqrt_covariance = combine_square_roots(&self.sqrt_covariance, &reset_noise);
        debug!("hypothesis {} reset", self.hypothesis.id());
    }

    /// Unscented measurement update with an arbitrary observation model.
    ///
    /// Returns [`UpdateOutcome::Outlier`] and leaves mean and covariance untouched when the
    /// squared Mahalanobis innovation exceeds the outlier threshold. Models that update alpha do
    /// so before the outlier test, from the raw innovation.
    pub fn measurement_update<M: ObservationModel + ?Sized>(
        &mut self,
        model: &M,
    ) -> Result<UpdateOutcome, FilterError> {
        let m = model.dimension();
        let num_points = 2 * SelfBallState::COUNT + 1;
        let sigmas = self.sigma_points(model.clamps_heading());

        let mut predicted = DMatrix::<f64>::zeros(m, num_points);
        for (i, sigma) in sigmas.column_iter().enumerate() {
            let y = model.predict(&sigma.into_owned());
            if y.len() != m {
                return Err(FilterError::DimensionMismatch {
                    expected: m,
                    found: y.len(),
                });
            }
            predicted.set_column(i, &y);
        }
        let weights = self.sqrt_weights.component_mul(&self.sqrt_weights);
        let y_bar = &predicted * &weights;

        let mut mx = DMatrix::<f64>::zeros(SelfBallState::COUNT, num_points);
        let mut my = DMatrix::<f64>::zeros(m, num_points);
        for i in 0..num_points {
            let w = self.sqrt_weights[i];
            mx.set_column(i, &(w * (sigmas.column(i) - &self.mean)));
            my.set_column(i, &(w * model.innovation(&predicted.column(i).into_owned(), &y_bar)));
        }

        let noise_sqrt = model.noise_sqrt();
        if noise_sqrt.shape() != (m, m) {
            return Err(FilterError::DimensionMismatch {
                expected: m,
                found: noise_sqrt.nrows(),
            });
        }
        let noise = &noise_sqrt * noise_sqrt.transpose();
        let pyy = &my * my.transpose() + &noise;
        let pxy = &mx * my.transpose();
        let pyy_inv = pyy
            .try_inverse()
            .ok_or(FilterError::SingularInnovation)?;

        let innovation = model.innovation(&model.observation(), &y_bar);
        let mahalanobis_sq = innovation.dot(&(&pyy_inv * &innovation));
        trace!(
            "measurement innovation {:?}, mahalanobis² {:.3}",
            innovation.as_slice(),
            mahalanobis_sq
        );

        let likelihood = if model.updates_alpha() {
            let floored = noise + DMatrix::<f64>::identity(m, m) * ALPHA_NOISE_FLOOR;
            match floored.try_inverse() {
                Some(noise_inv) => Some(1.0 / (1.0 + innovation.dot(&(&noise_inv * &innovation)))),
                None => {
                    warn!("measurement noise not invertible; alpha left unchanged");
                    None
                }
            }
        } else {
            None
        };

        if !mahalanobis_sq.is_finite() || likelihood.is_some_and(|l| !l.is_finite()) {
            warn!("non-finite innovation in measurement update");
            return Err(FilterError::NumericalFailure(
                "non-finite innovation".to_string(),
            ));
        }
        if let Some(factor) = likelihood {
            self.hypothesis.multiply_alpha(factor);
        }
        if mahalanobis_sq > self.config.outlier_threshold {
            debug!(
                "hypothesis {}: outlier rejected (mahalanobis² {:.2})",
                self.hypothesis.id(),
                mahalanobis_sq
            );
            return Ok(UpdateOutcome::Outlier { mahalanobis_sq });
        }

        let gain = &pxy * &pyy_inv;
        let sqrt_covariance =
            triangular_square_root(&horzcat(&(&mx - &gain * &my), &(&gain * &noise_sqrt)));
        let mean = &self.mean + &gain * &innovation;
        self.commit(mean, sqrt_covariance)?;
        Ok(UpdateOutcome::Accepted { mahalanobis_sq })
    }

    /// Update with a range and bearing to the ball, using the configured ball noise.
    pub fn ball_update(&mut self, range: f64, bearing: f64) -> Result<UpdateOutcome, FilterError> {
        let measurement = BallMeasurement::new(range, bearing, self.config.ball_noise.clone());
        self.measurement_update(&measurement)
    }

    /// Update with a range and bearing to a field object at a known position.
    pub fn field_object_update(
        &mut self,
        measurement: &LandmarkMeasurement,
    ) -> Result<UpdateOutcome, FilterError> {
        self.measurement_update(measurement)
    }

    /// Update with the angle between two known field points.
    pub fn angle_between_update(
        &mut self,
        measurement: &AngleBetweenMeasurement,
    ) -> Result<UpdateOutcome, FilterError> {
        self.measurement_update(measurement)
    }

    /// Linear update for an observation of two state components.
    ///
    /// No sigma points are needed: the rows of the square-root factor for the two observed
    /// states give the predicted observation covariance directly.
    pub fn linear2_update(
        &mut self,
        measurement: &LinearPairMeasurement,
    ) -> Result<UpdateOutcome, FilterError> {
        let i1 = measurement.index1.index();
        let i2 = measurement.index2.index();
        let mut cs = DMatrix::<f64>::zeros(2, SelfBallState::COUNT);
        cs.set_row(0, &self.sqrt_covariance.row(i1));
        cs.set_row(1, &self.sqrt_covariance.row(i2));

        let noise_sqrt = measurement.noise_sqrt();
        let pyy = &cs * cs.transpose() + &noise_sqrt * noise_sqrt.transpose();
        let pxy = &self.sqrt_covariance * cs.transpose();
        let pyy_inv = pyy
            .try_inverse()
            .ok_or(FilterError::SingularInnovation)?;

        let predicted = DVector::from_vec(vec![self.mean[i1], self.mean[i2]]);
        let innovation = measurement.observation() - predicted;
        let mahalanobis_sq = innovation.dot(&(&pyy_inv * &innovation));
        if !mahalanobis_sq.is_finite() {
            return Err(FilterError::NumericalFailure(
                "non-finite innovation".to_string(),
            ));
        }
        if mahalanobis_sq > self.config.outlier_threshold {
            debug!(
                "hypothesis {}: linear update rejected (mahalanobis² {:.2})",
                self.hypothesis.id(),
                mahalanobis_sq
            );
            return Ok(UpdateOutcome::Outlier { mahalanobis_sq });
        }

        let gain = &pxy * &pyy_inv;
        let sqrt_covariance = combine_square_roots(
            &(&self.sqrt_covariance - &gain * &cs),
            &(&gain * &noise_sqrt),
        );
        let mean = &self.mean + &gain * &innovation;
        self.commit(mean, sqrt_covariance)?;
        Ok(UpdateOutcome::Accepted { mahalanobis_sq })
    }

    /// Fuse a teammate's ball broadcast.
    pub fn shared_ball_update(&mut self, shared: &SharedBall) -> Result<UpdateOutcome, FilterError> {
        self.linear2_update(&shared.to_linear_pair())
    }

    /// This filter's ball estimate in broadcast form.
    ///
    /// The square root is upper triangular, as [`SharedBall`] expects.
    pub fn shared_ball(&self) -> SharedBall {
        // Triangularising the rows in reverse order and reversing back yields an upper factor.
        let mut rows = DMatrix::<f64>::zeros(2, SelfBallState::COUNT);
        rows.set_row(0, &self.sqrt_covariance.row(SelfBallState::BallY.index()));
        rows.set_row(1, &self.sqrt_covariance.row(SelfBallState::BallX.index()));
        let lower = triangular_square_root(&rows);
        SharedBall {
            x: self.state(SelfBallState::BallX),
            y: self.state(SelfBallState::BallY),
            sr_xx: lower[(1, 1)],
            sr_xy: lower[(1, 0)],
            sr_yy: lower[(0, 0)],
        }
    }

    /// Pull a state component back inside `[min, max]`.
    ///
    /// The correction is spread over the correlated states along the covariance column of the
    /// clipped state, so the rest of the estimate stays consistent with it. The square-root
    /// covariance is not modified. Returns whether clipping occurred.
    pub fn clip_state(&mut self, state: SelfBallState, min: f64, max: f64) -> bool {
        let index = state.index();
        let mut clipped = false;
        for (bound, upper) in [(max, true), (min, false)] {
            let value = self.mean[index];
            let outside = if upper { value > bound } else { value < bound };
            if !outside {
                continue;
            }
            let row = self.sqrt_covariance.row(index).transpose();
            let variance = row.dot(&row);
            if variance > 0.0 {
                let scale = (value - bound) / variance;
                self.mean -= scale * (&self.sqrt_covariance * &row);
            }
            self.mean[index] = bound;
            clipped = true;
        }
        if clipped {
            debug!(
                "hypothesis {}: clipped {:?} into [{}, {}]",
                self.hypothesis.id(),
                state,
                min,
                max
            );
        }
        self.wrap_heading();
        clipped
    }

    fn commit(
        &mut self,
        mean: DVector<f64>,
        sqrt_covariance: DMatrix<f64>,
    ) -> Result<(), FilterError> {
        if mean.iter().any(|v| !v.is_finite()) || !all_finite(&sqrt_covariance) {
            warn!(
                "hypothesis {}: update produced a non-finite state; keeping the prior",
                self.hypothesis.id()
            );
            return Err(FilterError::NumericalFailure(
                "update produced a non-finite state".to_string(),
            ));
        }
        self.mean = mean;
        self.sqrt_covariance = sqrt_covariance;
        self.wrap_heading();
        Ok(())
    }

    fn wrap_heading(&mut self) {
        let theta = SelfBallState::SelfTheta.index();
        self.mean[theta] = wrap_to_pi(self.mean[theta]);
    }

    pub fn state(&self, state: SelfBallState) -> f64 {
        self.mean[state.index()]
    }
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }
    pub fn sqrt_covariance(&self) -> &DMatrix<f64> {
        &self.sqrt_covariance
    }
    /// Full covariance `S Sᵀ`.
    pub fn covariance(&self) -> DMatrix<f64> {
        &self.sqrt_covariance * self.sqrt_covariance.transpose()
    }
    pub fn variance(&self, state: SelfBallState) -> f64 {
        let row = self.sqrt_covariance.row(state.index());
        row.dot(&row)
    }
    pub fn sd(&self, state: SelfBallState) -> f64 {
        self.variance(state).sqrt()
    }
    /// Distance from the robot to a field point, cm.
    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        let dx = self.state(SelfBallState::SelfX) - x;
        let dy = self.state(SelfBallState::SelfY) - y;
        dx.hypot(dy)
    }
    /// Bearing from the robot's heading to a field point, rad.
    ///
    /// A point on top of the robot is treated as lying just to its left.
    pub fn bearing_to(&self, x: f64, y: f64) -> f64 {
        let dx = x - self.state(SelfBallState::SelfX);
        let mut dy = y - self.state(SelfBallState::SelfY);
        if dx == 0.0 && dy == 0.0 {
            dy = 0.0001;
        }
        wrap_to_pi(dy.atan2(dx) - self.state(SelfBallState::SelfTheta))
    }

    pub fn hypothesis(&self) -> &Hypothesis {
        &self.hypothesis
    }
    pub fn id(&self) -> u64 {
        self.hypothesis.id()
    }
    pub fn parent_id(&self) -> Option<u64> {
        self.hypothesis.parent_id()
    }
    pub fn alpha(&self) -> f64 {
        self.hypothesis.alpha()
    }
    pub fn set_alpha(&mut self, alpha: f64) {
        self.hypothesis.set_alpha(alpha);
    }
    pub fn is_active(&self) -> bool {
        self.hypothesis.is_active()
    }
    pub fn set_active(&mut self, active: bool) {
        self.hypothesis.set_active(active);
    }
    pub fn to_be_activated(&self) -> bool {
        self.hypothesis.to_be_activated()
    }
    pub fn set_to_be_activated(&mut self, pending: bool) {
        self.hypothesis.set_to_be_activated(pending);
    }

    /// Give this filter a fresh id and record `parent` as its origin.
    ///
    /// The state is not copied; see [`SelfBallFilter::branch`] for a full clone.
    pub fn spawn_from_model(&mut self, parent: &SelfBallFilter) -> u64 {
        let id = self.hypothesis.spawn_from(&parent.hypothesis);
        debug!("hypothesis {} spawned from {}", id, parent.id());
        id
    }

    /// Independent copy of this filter under a new id, with this filter as its parent.
    pub fn branch(&self) -> SelfBallFilter {
        let mut child = self.clone();
        child.spawn_from_model(self);
        child
    }

    /// One or two line description of the hypothesis and its estimates.
    pub fn summary(&self, brief: bool) -> String {
        use SelfBallState::*;
        let mut text = format!(
            "Model {} alpha: {:.4} position: ({:.1}, {:.1}, {:.3}) ball: ({:.1}, {:.1})\n",
            self.id(),
            self.alpha(),
            self.state(SelfX),
            self.state(SelfY),
            self.state(SelfTheta),
            self.state(BallX),
            self.state(BallY)
        );
        if !brief {
            text.push_str(&format!(
                "sd position: ({:.1}, {:.1}, {:.3}) ball: ({:.1}, {:.1})\n",
                self.sd(SelfX),
                self.sd(SelfY),
                self.sd(SelfTheta),
                self.sd(BallX),
                self.sd(BallY)
            ));
        }
        text
    }

    pub fn snapshot(&self) -> FilterSnapshot {
        FilterSnapshot {
            is_active: self.is_active(),
            alpha: self.alpha(),
            mean: self.mean.as_slice().to_vec(),
            sqrt_covariance: self.sqrt_covariance.as_slice().to_vec(),
        }
    }

    /// Overwrite activity flag, weight and state from a snapshot. Identity is kept.
    pub fn restore(&mut self, snapshot: &FilterSnapshot) -> Result<(), FilterError> {
        let n = SelfBallState::COUNT;
        if snapshot.mean.len() != n {
            return Err(FilterError::DimensionMismatch {
                expected: n,
                found: snapshot.mean.len(),
            });
        }
        if snapshot.sqrt_covariance.len() != n * n {
            return Err(FilterError::DimensionMismatch {
                expected: n * n,
                found: snapshot.sqrt_covariance.len(),
            });
        }
        let mean = DVector::from_column_slice(&snapshot.mean);
        let sqrt_covariance = DMatrix::from_column_slice(n, n, &snapshot.sqrt_covariance);
        check_state(&mean, &sqrt_covariance)?;
        self.mean = mean;
        self.sqrt_covariance = sqrt_covariance;
        self.hypothesis.set_active(snapshot.is_active);
        self.hypothesis.set_alpha(snapshot.alpha);
        Ok(())
    }

    /// Write the filter in its compact binary form (little endian).
    ///
    /// Layout: active flag (one byte); if active, alpha (f64), then the mean and the square-root
    /// covariance, each as rows (u64), columns (u64) and column-major f64 data.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&[u8::from(self.is_active())])?;
        if self.is_active() {
            writer.write_all(&self.alpha().to_le_bytes())?;
            write_matrix(writer, self.mean.nrows(), 1, self.mean.as_slice())?;
            write_matrix(
                writer,
                self.sqrt_covariance.nrows(),
                self.sqrt_covariance.ncols(),
                self.sqrt_covariance.as_slice(),
            )?;
        }
        Ok(())
    }

    /// Read a filter written by [`SelfBallFilter::write_to`]. The state of an inactive record is
    /// left as it was.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<()> {
        let mut flag = [0u8; 1];
        reader.read_exact(&mut flag)?;
        let active = flag[0] != 0;
        if active {
            let alpha = read_f64(reader)?;
            let n = SelfBallState::COUNT;
            let mean = DVector::from_vec(read_matrix(reader, n, 1)?);
            let sqrt_covariance = DMatrix::from_vec(n, n, read_matrix(reader, n, n)?);
            self.mean = mean;
            self.sqrt_covariance = sqrt_covariance;
            self.hypothesis.set_alpha(alpha);
        }
        self.hypothesis.set_active(active);
        Ok(())
    }
}

impl Display for SelfBallFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary(false))
    }
}

fn check_state(mean: &DVector<f64>, sqrt_covariance: &DMatrix<f64>) -> Result<(), FilterError> {
    let n = SelfBallState::COUNT;
    if mean.len() != n {
        return Err(FilterError::DimensionMismatch {
            expected: n,
            found: mean.len(),
        });
    }
    if sqrt_covariance.shape() != (n, n) {
        return Err(FilterError::DimensionMismatch {
            expected: n,
            found: sqrt_covariance.nrows().max(sqrt_covariance.ncols()),
        });
    }
    if mean.iter().any(|v| !v.is_finite()) || !all_finite(sqrt_covariance) {
        return Err(FilterError::NumericalFailure(
            "non-finite initial state".to_string(),
        ));
    }
    Ok(())
}

fn write_matrix<W: Write>(writer: &mut W, rows: usize, cols: usize, data: &[f64]) -> io::Result<()> {
    writer.write_all(&(rows as u64).to_le_bytes())?;
    writer.write_all(&(cols as u64).to_le_bytes())?;
    for value in data {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64<R: Read>(reader: &mut R) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_matrix<R: Read>(reader: &mut R, rows: usize, cols: usize) -> io::Result<Vec<f64>> {
    let found = (read_u64(reader)?, read_u64(reader)?);
    if found != (rows as u64, cols as u64) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "expected a {}x{} matrix, found {}x{}",
                rows, cols, found.0, found.1
            ),
        ));
    }
    (0..rows * cols).map(|_| read_f64(reader)).collect()
}
