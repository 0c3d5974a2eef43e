//! Sigma-point state estimation for humanoid soccer robots
//!
//! This crate is the estimation core of a soccer-playing humanoid. It fuses noisy, asynchronous
//! proprioceptive and visual measurements into continuously updated estimates of
//!
//! - the robot's body orientation (pitch and roll, together with the gyroscope biases), and
//! - the robot's field pose together with the ball's position and velocity.
//!
//! It does not talk to hardware, run vision, or decide what the robot does with the estimates. Odometry
//! deltas, inertial samples, range/bearing sightings and teammates' shared-ball broadcasts are handed
//! in by the caller; mean states, standard deviations, hypothesis weights and compact summaries are
//! handed back out.
//!
//! Primarily built off of [`nalgebra`](https://crates.io/crates/nalgebra), which provides the linear
//! algebra (Cholesky, QR and symmetric eigen decompositions) for the filters.
//!
//! ## Crate overview
//!
//! - [ukf]: A generic Unscented Kalman Filter engine with a full covariance matrix. Sigma point
//!   generation, weighting, and additive-noise time/measurement update primitives.
//! - [orientation]: A four-state pitch/roll estimator built on [ukf], fusing gyroscope rates
//!   (prediction) with the accelerometer's view of gravity (correction).
//! - [self_ball]: A seven-state square-root UKF tracking the robot pose and the ball. Covariance is
//!   carried as a square-root factor and every update is an orthogonal re-triangularisation.
//! - [measurements]: Observation models (ball, landmark, angle between landmarks, linear pairs and the
//!   teammate shared ball) consumed by [self_ball].
//! - [hypothesis]: Identity, lineage and likelihood weight of competing self-and-ball filters, for an
//!   external multi-model manager.
//! - [config]: Tuning constants, loadable from JSON, YAML or TOML.
//! - [linalg]: Matrix square roots, SPD solves and QR-based square-root combination.
//! - [sim]: A deterministic synthetic field scenario used to exercise the filters end to end.
//!
//! ## Units and conventions
//!
//! Field coordinates are in centimetres with the origin at the centre of the field, headings and
//! bearings are in radians measured counter-clockwise and wrapped into $(-\pi, \pi]$, velocities are in
//! cm/s, accelerations in cm/s², and time stamps and time steps are in milliseconds.
//!
//! ## Sigma points
//!
//! Both filters approximate a Gaussian $\mathcal{N}(\mu, P)$ with $2N + 1$ deterministic points
//!
//! $$
//! \mathcal{X}_0 = \mu, \qquad \mathcal{X}_i = \mu + \sqrt{N + \kappa}\, s_i, \qquad \mathcal{X}_{N+i} = \mu - \sqrt{N + \kappa}\, s_i
//! $$
//!
//! where $s_i$ is the $i$-th column of a square root $S$ with $S S^T = P$, weighted with
//! $w_0 = \kappa / (N + \kappa)$ and $w_i = 1 / (2 (N + \kappa))$. The weighted sample mean and
//! covariance of the points reproduce $\mu$ and $P$ exactly.
pub mod config;
pub mod error;
pub mod hypothesis;
pub mod linalg;
pub mod measurements;
pub mod orientation;
pub mod self_ball;
pub mod sim;
pub mod ukf;

pub use error::{FilterError, UpdateOutcome};

use std::f64::consts::PI;

/// Wrap an angle into the half-open range $(-\pi, \pi]$ radians
///
/// # Arguments
/// * `angle` - The angle to be wrapped, in radians.
/// # Returns
/// * The equivalent angle in $(-\pi, \pi]$.
pub fn wrap_to_pi(angle: f64) -> f64 {
    let mut wrapped = angle % (2.0 * PI);
    if wrapped > PI {
        wrapped -= 2.0 * PI;
    } else if wrapped <= -PI {
        wrapped += 2.0 * PI;
    }
    wrapped
}
