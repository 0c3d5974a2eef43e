//! Observation models for the self-and-ball filter
//!
//! Every sighting the vision system reports is described by a type implementing
//! [`ObservationModel`]: the observation vector, the square root of its noise covariance, and the
//! observation each state sigma point predicts. [`crate::self_ball::SelfBallFilter`] runs the
//! unscented update, the outlier gate and the square-root covariance correction once, generically,
//! for all of them.
//!
//! Range/bearing sightings are converted to Cartesian coordinates in the robot's own frame
//! (x forward, y left). Their noise is specified in polar form and mapped through the polar
//! Jacobian, so that the 2×2 noise square root is
//!
//! $$
//! S_R = \begin{bmatrix} \cos b & -r \sin b \\\\ \sin b & r \cos b \end{bmatrix}
//!       \begin{bmatrix} \sqrt{R_r} & 0 \\\\ 0 & \sqrt{R_b} \end{bmatrix},
//! \qquad R_r = R_{offset} + R_{relative}\, r^2
//! $$
//!
//! Observations that are linear in two state components (a teammate's ball broadcast) are
//! described by [`LinearPairMeasurement`] and take a cheaper path that needs no sigma points.
use std::fmt::{self, Display};

use nalgebra::{DMatrix, DVector};

use crate::config::BallNoise;
use crate::self_ball::SelfBallState;
use crate::wrap_to_pi;

/// A measurement predictable from a full self-and-ball state vector.
pub trait ObservationModel {
    /// Length of the observation vector.
    fn dimension(&self) -> usize;
    /// The observation itself.
    fn observation(&self) -> DVector<f64>;
    /// Square root `S_R` of the measurement noise covariance, `R = S_R S_Rᵀ`.
    fn noise_sqrt(&self) -> DMatrix<f64>;
    /// Observation predicted by one state sigma point.
    fn predict(&self, state: &DVector<f64>) -> DVector<f64>;
    /// Innovation `observed − predicted`.
    fn innovation(&self, observed: &DVector<f64>, predicted: &DVector<f64>) -> DVector<f64> {
        observed - predicted
    }
    /// Whether sigma point headings should be kept close to the mean heading.
    fn clamps_heading(&self) -> bool {
        true
    }
    /// Whether the update scales the hypothesis weight by the measurement likelihood.
    fn updates_alpha(&self) -> bool {
        false
    }
}

/// Noise square root of a Cartesian point converted from a polar sighting.
///
/// `range_variance` is in cm², `bearing_variance` in rad².
pub fn polar_noise_sqrt(
    range: f64,
    bearing: f64,
    range_variance: f64,
    bearing_variance: f64,
) -> DMatrix<f64> {
    let (sin_b, cos_b) = bearing.sin_cos();
    let sr = range_variance.sqrt();
    let sb = bearing_variance.sqrt();
    DMatrix::from_row_slice(
        2,
        2,
        &[
            cos_b * sr,
            -sin_b * range * sb,
            sin_b * sr,
            cos_b * range * sb,
        ],
    )
}

/// Position of a field point in the frame of the robot described by `state`.
fn relative_position(state: &DVector<f64>, x: f64, y: f64) -> DVector<f64> {
    let dx = x - state[SelfBallState::SelfX.index()];
    let dy = y - state[SelfBallState::SelfY.index()];
    let (sin_t, cos_t) = state[SelfBallState::SelfTheta.index()].sin_cos();
    DVector::from_vec(vec![dx * cos_t + dy * sin_t, -dx * sin_t + dy * cos_t])
}

fn polar_to_cartesian(range: f64, bearing: f64) -> DVector<f64> {
    DVector::from_vec(vec![range * bearing.cos(), range * bearing.sin()])
}

/// Range and bearing to the ball as seen by this robot.
#[derive(Clone, Debug, PartialEq)]
pub struct BallMeasurement {
    /// Distance to the ball, cm.
    pub range: f64,
    /// Bearing to the ball relative to the robot heading, rad.
    pub bearing: f64,
    pub noise: BallNoise,
}

impl BallMeasurement {
    pub fn new(range: f64, bearing: f64, noise: BallNoise) -> BallMeasurement {
        BallMeasurement {
            range,
            bearing,
            noise,
        }
    }
}

impl Display for BallMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BallMeasurement(range: {:.1}, bearing: {:.4})",
            self.range, self.bearing
        )
    }
}

impl ObservationModel for BallMeasurement {
    fn dimension(&self) -> usize {
        2
    }
    fn observation(&self) -> DVector<f64> {
        polar_to_cartesian(self.range, self.bearing)
    }
    fn noise_sqrt(&self) -> DMatrix<f64> {
        let range_variance =
            self.noise.range_offset + self.noise.range_relative * self.range * self.range;
        polar_noise_sqrt(
            self.range,
            self.bearing,
            range_variance,
            self.noise.bearing_variance,
        )
    }
    fn predict(&self, state: &DVector<f64>) -> DVector<f64> {
        relative_position(
            state,
            state[SelfBallState::BallX.index()],
            state[SelfBallState::BallY.index()],
        )
    }
}

/// Range and bearing to a stationary field object at a known position.
#[derive(Clone, Debug, PartialEq)]
pub struct LandmarkMeasurement {
    /// Distance to the object, cm.
    pub range: f64,
    /// Bearing to the object relative to the robot heading, rad.
    pub bearing: f64,
    /// Field position of the object, cm.
    pub x: f64,
    pub y: f64,
    /// Range variance independent of distance, cm².
    pub range_noise_offset: f64,
    /// Range variance per squared centimetre of distance.
    pub range_noise_relative: f64,
    /// Bearing variance, rad².
    pub bearing_noise: f64,
}

impl Display for LandmarkMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LandmarkMeasurement(range: {:.1}, bearing: {:.4}, at ({:.1}, {:.1}))",
            self.range, self.bearing, self.x, self.y
        )
    }
}

impl ObservationModel for LandmarkMeasurement {
    fn dimension(&self) -> usize {
        2
    }
    fn observation(&self) -> DVector<f64> {
        polar_to_cartesian(self.range, self.bearing)
    }
    fn noise_sqrt(&self) -> DMatrix<f64> {
        let range_variance =
            self.range_noise_offset + self.range_noise_relative * self.range * self.range;
        polar_noise_sqrt(self.range, self.bearing, range_variance, self.bearing_noise)
    }
    fn predict(&self, state: &DVector<f64>) -> DVector<f64> {
        relative_position(state, self.x, self.y)
    }
    fn updates_alpha(&self) -> bool {
        true
    }
}

/// Angle between two known field points as seen from the robot.
///
/// The observed angle is `bearing(point 1) − bearing(point 2)`, which does not depend on the
/// robot's heading.
///
/// The predicted angle is averaged over the sigma points without unwrapping. When the robot is
/// nearly on the line between the two points the predictions straddle ±π and their mean is
/// pulled toward 0, so callers should skip this update for angles close to π.
#[derive(Clone, Debug, PartialEq)]
pub struct AngleBetweenMeasurement {
    /// Observed angle, rad.
    pub angle: f64,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    /// Standard deviation of the observed angle, rad.
    pub sd: f64,
}

impl Display for AngleBetweenMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AngleBetweenMeasurement(angle: {:.4}, ({:.1}, {:.1}) to ({:.1}, {:.1}))",
            self.angle, self.x1, self.y1, self.x2, self.y2
        )
    }
}

impl ObservationModel for AngleBetweenMeasurement {
    fn dimension(&self) -> usize {
        1
    }
    fn observation(&self) -> DVector<f64> {
        DVector::from_element(1, self.angle)
    }
    fn noise_sqrt(&self) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, self.sd)
    }
    fn predict(&self, state: &DVector<f64>) -> DVector<f64> {
        let x = state[SelfBallState::SelfX.index()];
        let y = state[SelfBallState::SelfY.index()];
        let to_first = (self.y1 - y).atan2(self.x1 - x);
        let to_second = (self.y2 - y).atan2(self.x2 - x);
        DVector::from_element(1, wrap_to_pi(to_first - to_second))
    }
    fn innovation(&self, observed: &DVector<f64>, predicted: &DVector<f64>) -> DVector<f64> {
        DVector::from_element(1, wrap_to_pi(observed[0] - predicted[0]))
    }
    fn clamps_heading(&self) -> bool {
        false
    }
    fn updates_alpha(&self) -> bool {
        true
    }
}

/// Direct observation of two state components.
///
/// The noise square root is upper triangular, `[[sr11, sr12], [0, sr22]]`.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearPairMeasurement {
    pub y1: f64,
    pub y2: f64,
    pub sr11: f64,
    pub sr12: f64,
    pub sr22: f64,
    pub index1: SelfBallState,
    pub index2: SelfBallState,
}

impl LinearPairMeasurement {
    pub fn observation(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.y1, self.y2])
    }
    pub fn noise_sqrt(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[self.sr11, self.sr12, 0.0, self.sr22])
    }
}

/// A robot's ball estimate as broadcast to its teammates.
///
/// `(sr_xx, sr_xy, sr_yy)` are the entries of an upper-triangular square root of the ball
/// position covariance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SharedBall {
    pub x: f64,
    pub y: f64,
    pub sr_xx: f64,
    pub sr_xy: f64,
    pub sr_yy: f64,
}

impl SharedBall {
    /// The broadcast as a direct observation of the receiver's ball position.
    pub fn to_linear_pair(&self) -> LinearPairMeasurement {
        LinearPairMeasurement {
            y1: self.x,
            y2: self.y,
            sr11: self.sr_xx,
            sr12: self.sr_xy,
            sr22: self.sr_yy,
            index1: SelfBallState::BallX,
            index2: SelfBallState::BallY,
        }
    }
    /// Ball position covariance implied by the square root.
    pub fn covariance(&self) -> DMatrix<f64> {
        let sr = self.to_linear_pair().noise_sqrt();
        &sr * sr.transpose()
    }
}

impl Display for SharedBall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SharedBall(x: {:.1}, y: {:.1}, sr: [{:.3}, {:.3}; 0, {:.3}])",
            self.x, self.y, self.sr_xx, self.sr_xy, self.sr_yy
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn state(x: f64, y: f64, theta: f64, bx: f64, by: f64) -> DVector<f64> {
        DVector::from_vec(vec![x, y, theta, bx, by, 0.0, 0.0])
    }

    #[test]
    fn polar_noise_reproduces_polar_covariance() {
        // Along the x axis the Cartesian covariance is diag(Rr, r² Rb).
        let s = polar_noise_sqrt(200.0, 0.0, 25.0, 0.0001);
        let r = &s * s.transpose();
        assert_approx_eq!(r[(0, 0)], 25.0, 1e-12);
        assert_approx_eq!(r[(1, 1)], 200.0 * 200.0 * 0.0001, 1e-12);
        assert_approx_eq!(r[(0, 1)], 0.0, 1e-12);
        // Rotated by 90 degrees the two swap.
        let s = polar_noise_sqrt(200.0, FRAC_PI_2, 25.0, 0.0001);
        let r = &s * s.transpose();
        assert_approx_eq!(r[(0, 0)], 4.0, 1e-9);
        assert_approx_eq!(r[(1, 1)], 25.0, 1e-9);
    }

    #[test]
    fn ball_prediction_in_robot_frame() {
        let m = BallMeasurement::new(100.0, 0.0, BallNoise::default());
        // Robot at (50, 0) facing +y, ball at (50, 100): straight ahead.
        let y = m.predict(&state(50.0, 0.0, FRAC_PI_2, 50.0, 100.0));
        assert_approx_eq!(y[0], 100.0, 1e-9);
        assert_approx_eq!(y[1], 0.0, 1e-9);
        assert_approx_eq!(m.observation()[0], 100.0, 1e-12);
        assert_eq!(m.dimension(), 2);
        assert!(!m.updates_alpha());
    }

    #[test]
    fn ball_noise_grows_with_range() {
        let near = BallMeasurement::new(50.0, 0.3, BallNoise::default()).noise_sqrt();
        let far = BallMeasurement::new(500.0, 0.3, BallNoise::default()).noise_sqrt();
        let near_r = &near * near.transpose();
        let far_r = &far * far.transpose();
        assert!(far_r.trace() > near_r.trace());
    }

    #[test]
    fn landmark_prediction() {
        let m = LandmarkMeasurement {
            range: 100.0,
            bearing: 0.0,
            x: 100.0,
            y: 0.0,
            range_noise_offset: 25.0,
            range_noise_relative: 0.0025,
            bearing_noise: 0.0001,
        };
        let y = m.predict(&state(0.0, 0.0, 0.0, 0.0, 0.0));
        let innovation = m.innovation(&m.observation(), &y);
        assert_approx_eq!(innovation.norm(), 0.0, 1e-12);
        // Robot facing backwards sees the landmark behind it.
        let y = m.predict(&state(0.0, 0.0, PI, 0.0, 0.0));
        assert_approx_eq!(y[0], -100.0, 1e-9);
        assert!(m.updates_alpha());
        assert!(m.clamps_heading());
    }

    #[test]
    fn angle_between_is_heading_free_and_wrapped() {
        let m = AngleBetweenMeasurement {
            angle: 0.0,
            x1: 100.0,
            y1: 100.0,
            x2: 100.0,
            y2: -100.0,
            sd: 0.05,
        };
        let a = m.predict(&state(0.0, 0.0, 0.0, 0.0, 0.0));
        let b = m.predict(&state(0.0, 0.0, 2.0, 0.0, 0.0));
        assert_approx_eq!(a[0], FRAC_PI_2, 1e-12);
        assert_approx_eq!(a[0], b[0], 1e-12);
        assert!(!m.clamps_heading());

        let observed = DVector::from_element(1, PI - 0.1);
        let predicted = DVector::from_element(1, -PI + 0.1);
        assert_approx_eq!(m.innovation(&observed, &predicted)[0], -0.2, 1e-12);
    }

    #[test]
    fn angle_between_collinear_predictions_straddle_pi() {
        let m = AngleBetweenMeasurement {
            angle: PI,
            x1: 100.0,
            y1: 0.0,
            x2: -100.0,
            y2: 0.0,
            sd: 0.01,
        };
        let above = m.predict(&state(0.0, 0.5, 0.0, 0.0, 0.0))[0];
        let below = m.predict(&state(0.0, -0.5, 0.0, 0.0, 0.0))[0];
        assert_approx_eq!(above, PI - 0.01, 1e-4);
        assert_approx_eq!(below, -PI + 0.01, 1e-4);
        // A plain average of the two lands near 0, not near π.
        assert_approx_eq!(0.5 * (above + below), 0.0, 1e-9);
    }

    #[test]
    fn shared_ball_covariance() {
        let shared = SharedBall {
            x: 10.0,
            y: 20.0,
            sr_xx: 3.0,
            sr_xy: 1.0,
            sr_yy: 2.0,
        };
        let p = shared.covariance();
        assert_approx_eq!(p[(0, 0)], 10.0, 1e-12);
        assert_approx_eq!(p[(0, 1)], 2.0, 1e-12);
        assert_approx_eq!(p[(1, 1)], 4.0, 1e-12);
        let pair = shared.to_linear_pair();
        assert_eq!(pair.index1, SelfBallState::BallX);
        assert_eq!(pair.index2, SelfBallState::BallY);
        assert_eq!(pair.observation(), DVector::from_vec(vec![10.0, 20.0]));
    }
}
