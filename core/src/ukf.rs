//! Generic Unscented Kalman Filter engine
//!
//! A reusable UKF core with a full covariance matrix and additive noise. It knows nothing
//! about the system it estimates: callers generate sigma points, push them through their
//! own process or observation functions, and hand the results back to
//! [`UnscentedKalmanFilter::time_update`] and [`UnscentedKalmanFilter::measurement_update`].
//!
//! # Weights
//!
//! Only the κ-parameterised weighting is supported:
//!
//! $$
//! w_0 = \frac{\kappa}{N + \kappa}, \qquad w_i = \frac{1 - w_0}{2N}, \quad i = 1 \ldots 2N
//! $$
//!
//! The same weights are used for means and covariances (no α/β scaled scheme).
//!
//! # Sigma points
//!
//! With $L$ a lower-triangular square root of $\frac{N}{1 - w_0} P$:
//!
//! $$
//! \mathcal{X}_0 = \mu, \qquad \mathcal{X}_i = \mu + L_i, \qquad \mathcal{X}_{N + i} = \mu - L_i
//! $$
//!
//! # Measurement update
//!
//! $$
//! \begin{aligned}
//! P_{yy} &= R + \sum_i w_i (\mathcal{Y}_i - \bar{y})(\mathcal{Y}_i - \bar{y})^T \\\\
//! P_{xy} &= \sum_i w_i (\mathcal{X}_i - \mu)(\mathcal{Y}_i - \bar{y})^T \\\\
//! K &= P_{xy} P_{yy}^{-1} \\\\
//! \mu &\leftarrow \mu + K (y - \bar{y}) \\\\
//! P &\leftarrow P - K P_{yy} K^T
//! \end{aligned}
//! $$

use std::fmt::{self, Debug, Display};

use log::warn;
use nalgebra::{DMatrix, DVector};

use crate::error::FilterError;
use crate::linalg::{all_finite, matrix_square_root, robust_spd_solve, symmetrize};

/// Unscented Kalman Filter with a full covariance matrix.
#[derive(Clone)]
pub struct UnscentedKalmanFilter {
    mean_state: DVector<f64>,
    covariance: DMatrix<f64>,
    kappa: f64,
    state_size: usize,
    weights: DVector<f64>,
}
impl Debug for UnscentedKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UKF")
            .field("mean_state", &self.mean_state)
            .field("covariance", &self.covariance)
            .field("kappa", &self.kappa)
            .field("state_size", &self.state_size)
            .finish()
    }
}
impl Display for UnscentedKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnscentedKalmanFilter")
            .field("mean_state", &self.mean_state)
            .field("covariance", &self.covariance)
            .field("kappa", &self.kappa)
            .finish()
    }
}
impl UnscentedKalmanFilter {
    /// New filter of dimension `state_size` with zero mean and zero covariance.
    pub fn new(state_size: usize, kappa: f64) -> UnscentedKalmanFilter {
        let weights = Self::sigma_weights(state_size, kappa);
        UnscentedKalmanFilter {
            mean_state: DVector::zeros(state_size),
            covariance: DMatrix::zeros(state_size, state_size),
            kappa,
            state_size,
            weights,
        }
    }
    /// New filter from a prior mean and covariance.
    pub fn with_state(
        mean: DVector<f64>,
        covariance: DMatrix<f64>,
        kappa: f64,
    ) -> Result<UnscentedKalmanFilter, FilterError> {
        let mut ukf = UnscentedKalmanFilter::new(mean.len(), kappa);
        ukf.set_state(mean, covariance)?;
        Ok(ukf)
    }
    fn sigma_weights(state_size: usize, kappa: f64) -> DVector<f64> {
        let n = state_size as f64;
        let mean_weight = kappa / (n + kappa);
        let outer_weight = (1.0 - mean_weight) / (2.0 * n);
        let mut weights = DVector::from_element(2 * state_size + 1, outer_weight);
        weights[0] = mean_weight;
        weights
    }
    pub fn state_size(&self) -> usize {
        self.state_size
    }
    pub fn num_sigma_points(&self) -> usize {
        2 * self.state_size + 1
    }
    pub fn kappa(&self) -> f64 {
        self.kappa
    }
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean_state
    }
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }
    /// Mean of a single state.
    pub fn state(&self, index: usize) -> f64 {
        self.mean_state[index]
    }
    pub fn variance(&self, index: usize) -> f64 {
        self.covariance[(index, index)]
    }
    /// Standard deviation of a single state.
    pub fn sd(&self, index: usize) -> f64 {
        self.variance(index).max(0.0).sqrt()
    }
    pub fn set_mean(&mut self, mean: DVector<f64>) -> Result<(), FilterError> {
        if mean.len() != self.state_size {
            return Err(FilterError::DimensionMismatch {
                expected: self.state_size,
                found: mean.len(),
            });
        }
        self.mean_state = mean;
        Ok(())
    }
    pub fn set_covariance(&mut self, covariance: DMatrix<f64>) -> Result<(), FilterError> {
        if covariance.shape() != (self.state_size, self.state_size) {
            return Err(FilterError::DimensionMismatch {
                expected: self.state_size,
                found: covariance.nrows().max(covariance.ncols()),
            });
        }
        self.covariance = covariance;
        Ok(())
    }
    pub fn set_state(
        &mut self,
        mean: DVector<f64>,
        covariance: DMatrix<f64>,
    ) -> Result<(), FilterError> {
        self.set_mean(mean)?;
        self.set_covariance(covariance)
    }
    /// Mutable access for filters built on top of the engine (angle wrapping etc).
    pub(crate) fn mean_mut(&mut self) -> &mut DVector<f64> {
        &mut self.mean_state
    }
    /// Generate the 2N+1 sigma points of the current mean and covariance, one per column.
    ///
    /// The covariance must be positive semi-definite. Small violations are absorbed by the
    /// robust square root in [`crate::linalg`]; a non-finite covariance is an error.
    pub fn generate_sigma_points(&self) -> Result<DMatrix<f64>, FilterError> {
        if !all_finite(&self.covariance) || self.mean_state.iter().any(|v| !v.is_finite()) {
            return Err(FilterError::NumericalFailure(
                "non-finite mean or covariance".to_string(),
            ));
        }
        let n = self.state_size;
        let scale = n as f64 / (1.0 - self.weights[0]);
        let sqrt_p = matrix_square_root(&(scale * &self.covariance));
        let mut pts = DMatrix::<f64>::zeros(n, 2 * n + 1);
        pts.column_mut(0).copy_from(&self.mean_state);
        for i in 0..n {
            pts.column_mut(i + 1)
                .copy_from(&(&self.mean_state + sqrt_p.column(i)));
            pts.column_mut(i + 1 + n)
                .copy_from(&(&self.mean_state - sqrt_p.column(i)));
        }
        Ok(pts)
    }
    fn check_sigma_count(&self, sigma_points: &DMatrix<f64>) -> Result<(), FilterError> {
        if sigma_points.ncols() != self.num_sigma_points() {
            return Err(FilterError::DimensionMismatch {
                expected: self.num_sigma_points(),
                found: sigma_points.ncols(),
            });
        }
        Ok(())
    }
    /// Weighted mean of a set of sigma points (state or observation space).
    pub fn mean_from_sigmas(&self, sigma_points: &DMatrix<f64>) -> Result<DVector<f64>, FilterError> {
        self.check_sigma_count(sigma_points)?;
        Ok(sigma_points * &self.weights)
    }
    /// Weighted outer-product scatter of a set of sigma points about `mean`.
    pub fn covariance_from_sigmas(
        &self,
        sigma_points: &DMatrix<f64>,
        mean: &DVector<f64>,
    ) -> Result<DMatrix<f64>, FilterError> {
        self.check_sigma_count(sigma_points)?;
        let dim = sigma_points.nrows();
        let mut covariance = DMatrix::<f64>::zeros(dim, dim);
        for (i, sigma_point) in sigma_points.column_iter().enumerate() {
            let diff = sigma_point - mean;
            covariance += self.weights[i] * &diff * diff.transpose();
        }
        Ok(covariance)
    }
    /// Recompute mean and covariance from sigma points that have already been pushed through
    /// the process model, adding the (additive) process noise.
    pub fn time_update(
        &mut self,
        propagated_sigmas: &DMatrix<f64>,
        process_noise: &DMatrix<f64>,
    ) -> Result<(), FilterError> {
        if propagated_sigmas.nrows() != self.state_size {
            return Err(FilterError::DimensionMismatch {
                expected: self.state_size,
                found: propagated_sigmas.nrows(),
            });
        }
        let mean = self.mean_from_sigmas(propagated_sigmas)?;
        let covariance =
            symmetrize(&(self.covariance_from_sigmas(propagated_sigmas, &mean)? + process_noise));
        self.commit(mean, covariance)
    }
    /// Correct the state with an observation.
    ///
    /// `predicted_observation_sigmas` holds the observation predicted for each column of
    /// `state_sigmas`, which must be the sigma points the predictions were made from.
    pub fn measurement_update(
        &mut self,
        observation: &DVector<f64>,
        measurement_noise: &DMatrix<f64>,
        predicted_observation_sigmas: &DMatrix<f64>,
        state_sigmas: &DMatrix<f64>,
    ) -> Result<(), FilterError> {
        let m = observation.len();
        if predicted_observation_sigmas.nrows() != m {
            return Err(FilterError::DimensionMismatch {
                expected: m,
                found: predicted_observation_sigmas.nrows(),
            });
        }
        self.check_sigma_count(state_sigmas)?;
        let predicted_observation = self.mean_from_sigmas(predicted_observation_sigmas)?;
        let mut pyy = measurement_noise.clone();
        let mut pxy = DMatrix::<f64>::zeros(self.state_size, m);
        for i in 0..self.num_sigma_points() {
            let dy = predicted_observation_sigmas.column(i) - &predicted_observation;
            let dx = state_sigmas.column(i) - &self.mean_state;
            pyy += self.weights[i] * &dy * dy.transpose();
            pxy += self.weights[i] * dx * dy.transpose();
        }
        // K = Pxy Pyy⁻¹  ⇔  Pyy Kᵀ = Pxyᵀ
        let kt = robust_spd_solve(&pyy, &pxy.transpose()).ok_or(FilterError::SingularInnovation)?;
        let k = kt.transpose();
        let mean = &self.mean_state + &k * (observation - predicted_observation);
        let covariance = symmetrize(&(&self.covariance - &k * &pyy * k.transpose()));
        self.commit(mean, covariance)
    }
    fn commit(&mut self, mean: DVector<f64>, covariance: DMatrix<f64>) -> Result<(), FilterError> {
        if mean.iter().any(|v| !v.is_finite()) || !all_finite(&covariance) {
            warn!("UKF update produced a non-finite state; keeping the prior");
            return Err(FilterError::NumericalFailure(
                "update produced a non-finite state".to_string(),
            ));
        }
        self.mean_state = mean;
        self.covariance = covariance;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn test_filter() -> UnscentedKalmanFilter {
        let mean = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let a = DMatrix::from_row_slice(3, 3, &[2.0, 0.0, 0.0, 0.5, 1.0, 0.0, -0.3, 0.2, 0.7]);
        let covariance = &a * a.transpose();
        UnscentedKalmanFilter::with_state(mean, covariance, 1.0).unwrap()
    }

    #[test]
    fn weights_sum_to_one() {
        for (n, kappa) in [(1, 1.0), (4, 1.0), (7, 2.0), (3, 0.5)] {
            let ukf = UnscentedKalmanFilter::new(n, kappa);
            assert_eq!(ukf.weights().len(), 2 * n + 1);
            assert_approx_eq!(ukf.weights().sum(), 1.0, 1e-12);
            assert_approx_eq!(ukf.weights()[0], kappa / (n as f64 + kappa), 1e-12);
        }
    }

    #[test]
    fn sigma_points_reproduce_moments() {
        let ukf = test_filter();
        let sigmas = ukf.generate_sigma_points().unwrap();
        assert_eq!(sigmas.shape(), (3, 7));
        let mean = ukf.mean_from_sigmas(&sigmas).unwrap();
        let covariance = ukf.covariance_from_sigmas(&sigmas, &mean).unwrap();
        for i in 0..3 {
            assert_approx_eq!(mean[i], ukf.mean()[i], 1e-12);
            for j in 0..3 {
                assert_approx_eq!(covariance[(i, j)], ukf.covariance()[(i, j)], 1e-9);
            }
        }
    }

    #[test]
    fn sigma_points_are_symmetric_about_mean() {
        let ukf = test_filter();
        let sigmas = ukf.generate_sigma_points().unwrap();
        for i in 1..=3 {
            let plus = sigmas.column(i) - ukf.mean();
            let minus = sigmas.column(i + 3) - ukf.mean();
            assert_approx_eq!((plus + minus).norm(), 0.0, 1e-12);
        }
    }

    #[test]
    fn non_finite_covariance_is_rejected() {
        let mut ukf = test_filter();
        let mut covariance = ukf.covariance().clone();
        covariance[(1, 1)] = f64::NAN;
        ukf.set_covariance(covariance).unwrap();
        assert!(matches!(
            ukf.generate_sigma_points(),
            Err(FilterError::NumericalFailure(_))
        ));
    }

    #[test]
    fn identity_time_update_adds_process_noise() {
        let mut ukf = test_filter();
        let prior = ukf.covariance().clone();
        let sigmas = ukf.generate_sigma_points().unwrap();
        let q = DMatrix::from_diagonal_element(3, 3, 0.1);
        ukf.time_update(&sigmas, &q).unwrap();
        assert_approx_eq!(ukf.state(0), 1.0, 1e-12);
        for i in 0..3 {
            assert_approx_eq!(ukf.variance(i), prior[(i, i)] + 0.1, 1e-9);
        }
    }

    #[test]
    fn time_update_dimension_mismatch() {
        let mut ukf = test_filter();
        let wrong = DMatrix::<f64>::zeros(3, 5);
        let q = DMatrix::<f64>::zeros(3, 3);
        assert_eq!(
            ukf.time_update(&wrong, &q),
            Err(FilterError::DimensionMismatch {
                expected: 7,
                found: 5
            })
        );
    }

    #[test]
    fn linear_measurement_matches_kalman_filter() {
        // Observing the first state directly must reproduce the closed form Kalman update.
        let mut ukf = test_filter();
        let p = ukf.covariance().clone();
        let r = 0.5;
        let sigmas = ukf.generate_sigma_points().unwrap();
        let predicted = sigmas.rows(0, 1).into_owned();
        let y = DVector::from_vec(vec![2.0]);
        ukf.measurement_update(&y, &DMatrix::from_element(1, 1, r), &predicted, &sigmas)
            .unwrap();
        let s = p[(0, 0)] + r;
        for i in 0..3 {
            let k = p[(i, 0)] / s;
            let expected = [1.0, -2.0, 0.5][i] + k * (2.0 - 1.0);
            assert_approx_eq!(ukf.state(i), expected, 1e-9);
        }
        assert_approx_eq!(ukf.variance(0), p[(0, 0)] - p[(0, 0)] * p[(0, 0)] / s, 1e-9);
    }

    #[test]
    fn singular_innovation_is_an_error() {
        let mut ukf = UnscentedKalmanFilter::new(2, 1.0);
        // Zero covariance: every sigma point sits on the mean and Pyy reduces to R.
        let sigmas = ukf.generate_sigma_points().unwrap();
        let predicted = DMatrix::<f64>::zeros(2, 5);
        let y = DVector::from_vec(vec![1.0, 1.0]);
        let r = DMatrix::from_row_slice(2, 2, &[-1.0, 0.0, 0.0, 0.0]);
        let before = ukf.mean().clone();
        let result = ukf.measurement_update(&y, &r, &predicted, &sigmas);
        assert_eq!(result, Err(FilterError::SingularInnovation));
        assert_eq!(ukf.mean(), &before);
    }

    #[test]
    fn debug_display() {
        let ukf = test_filter();
        assert!(format!("{:?}", ukf).contains("UKF"));
        assert!(format!("{}", ukf).contains("UnscentedKalmanFilter"));
    }
}
