//! Closed-loop integration tests on synthetic field data
//!
//! These tests drive the filters with the deterministic scenarios from `robostate::sim` and compare
//! the estimates against the ground truth the scenarios generated.
//!
//! ## Error Metrics
//!
//! - **Position error**: Euclidean distance between estimated and true robot position (cm)
//! - **Heading error**: wrapped difference between estimated and true heading (rad)
//! - **Ball error**: Euclidean distance between estimated and true ball position (cm)
//! - **Tilt error**: difference between estimated and true pitch/roll (rad)
//!
//! The bounds in the assertions are not design goals; they are loose regression checks derived
//! from running the filters on the seeded scenarios, meant to catch a filter that diverges or stops
//! using its measurements.
use nalgebra::{DMatrix, DVector};

use robostate::config::{OrientationConfig, SelfBallConfig};
use robostate::orientation::OrientationFilter;
use robostate::self_ball::{SelfBallFilter, SelfBallState};
use robostate::sim::{
    FieldScenario, FieldScenarioConfig, GroundTruth, ScenarioStep, TiltScenario,
    TiltScenarioConfig,
};
use robostate::{FilterError, UpdateOutcome, wrap_to_pi};

/// Initial standard deviations when the filter is started near the true pose.
const LOCAL_INITIAL_SD: [f64; 7] = [20.0, 20.0, 0.2, 30.0, 30.0, 10.0, 10.0];

const SCENARIO_STEPS: usize = 600;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Error statistics for a run
#[derive(Debug, Clone, Default)]
struct ErrorStats {
    mean_position_error: f64,
    max_position_error: f64,
    rms_heading_error: f64,
    mean_ball_error: f64,
    outliers: usize,
    updates: usize,
}

fn position_error(filter: &SelfBallFilter, truth: &GroundTruth) -> f64 {
    (filter.state(SelfBallState::SelfX) - truth.x).hypot(filter.state(SelfBallState::SelfY) - truth.y)
}

fn heading_error(filter: &SelfBallFilter, truth: &GroundTruth) -> f64 {
    wrap_to_pi(filter.state(SelfBallState::SelfTheta) - truth.theta)
}

fn ball_error(filter: &SelfBallFilter, truth: &GroundTruth) -> f64 {
    (filter.state(SelfBallState::BallX) - truth.ball_x)
        .hypot(filter.state(SelfBallState::BallY) - truth.ball_y)
}

fn filter_at_start(config: &FieldScenarioConfig) -> SelfBallFilter {
    let [x, y, theta] = config.start_pose;
    let [bx, by, bvx, bvy] = config.start_ball;
    let mean = DVector::from_vec(vec![x, y, theta, bx, by, bvx, bvy]);
    let sqrt_covariance = DMatrix::from_diagonal(&DVector::from_column_slice(&LOCAL_INITIAL_SD));
    SelfBallFilter::with_state(mean, sqrt_covariance, SelfBallConfig::default()).unwrap()
}

fn tally(stats: &mut ErrorStats, outcome: Result<UpdateOutcome, FilterError>) {
    let outcome = outcome.expect("measurement update failed numerically");
    stats.updates += 1;
    if outcome.is_outlier() {
        stats.outliers += 1;
    }
}

/// Run the self-and-ball filter over a scenario. With `use_vision` false only odometry is used.
fn run_closed_loop(
    filter: &mut SelfBallFilter,
    steps: &[ScenarioStep],
    config: &FieldScenarioConfig,
    use_vision: bool,
) -> ErrorStats {
    let mut stats = ErrorStats::default();
    let mut heading_sq = 0.0;
    for step in steps {
        let [dx, dy, dtheta] = step.odometry;
        filter.time_update(dx, dy, dtheta, config.dt_ms).unwrap();
        if use_vision {
            for landmark in &step.landmarks {
                tally(
                    &mut stats,
                    filter.field_object_update(&landmark.to_measurement(config)),
                );
            }
            if let Some(ball) = step.ball {
                tally(&mut stats, filter.ball_update(ball.range, ball.bearing));
            }
        }
        let e = position_error(filter, &step.truth);
        stats.mean_position_error += e;
        stats.max_position_error = stats.max_position_error.max(e);
        heading_sq += heading_error(filter, &step.truth).powi(2);
        stats.mean_ball_error += ball_error(filter, &step.truth);
    }
    let n = steps.len() as f64;
    stats.mean_position_error /= n;
    stats.mean_ball_error /= n;
    stats.rms_heading_error = (heading_sq / n).sqrt();
    stats
}

#[test]
fn self_ball_tracks_walking_robot() {
    init_logging();
    let config = FieldScenarioConfig::default();
    let steps = FieldScenario::new(config.clone()).unwrap().run(SCENARIO_STEPS);
    let mut filter = filter_at_start(&config);
    let stats = run_closed_loop(&mut filter, &steps, &config, true);
    println!("closed loop: {:?}", stats);

    assert!(stats.mean_position_error < 20.0, "{:?}", stats);
    assert!(stats.max_position_error < 60.0, "{:?}", stats);
    assert!(stats.rms_heading_error < 0.1, "{:?}", stats);
    assert!(stats.mean_ball_error < 40.0, "{:?}", stats);
    assert!(
        (stats.outliers as f64) < 0.1 * stats.updates as f64,
        "{:?}",
        stats
    );

    let last = &steps[steps.len() - 1].truth;
    assert!(position_error(&filter, last) < 30.0);
    // Alpha is only meaningful relative to other hypotheses; alone it just shrinks.
    assert!(filter.alpha() >= 0.0 && filter.alpha() < 1.0);
    let theta = filter.state(SelfBallState::SelfTheta);
    assert!(theta > -std::f64::consts::PI && theta <= std::f64::consts::PI);
}

#[test]
fn vision_beats_dead_reckoning() {
    init_logging();
    let config = FieldScenarioConfig::default();
    let steps = FieldScenario::new(config.clone()).unwrap().run(SCENARIO_STEPS);

    let mut closed = filter_at_start(&config);
    let closed_stats = run_closed_loop(&mut closed, &steps, &config, true);
    let mut open = filter_at_start(&config);
    let open_stats = run_closed_loop(&mut open, &steps, &config, false);

    // Without sightings the uncertainty only grows.
    assert!(open.sd(SelfBallState::SelfX) > closed.sd(SelfBallState::SelfX));
    assert!(open.sd(SelfBallState::BallX) > closed.sd(SelfBallState::BallX));
    assert!(closed_stats.mean_ball_error < open_stats.mean_ball_error);
    assert_eq!(open_stats.updates, 0);
}

#[test]
fn kidnapped_robot_recovers_after_reset() {
    init_logging();
    let config = FieldScenarioConfig::default();
    let steps = FieldScenario::new(config.clone()).unwrap().run(SCENARIO_STEPS);
    let mut filter = filter_at_start(&config);
    run_closed_loop(&mut filter, &steps[..200], &config, true);

    // Teleport the estimate 80 cm away without telling the filter, then signal a reset.
    let mut moved = filter.snapshot();
    moved.mean[SelfBallState::SelfX.index()] += 80.0;
    filter.restore(&moved).unwrap();
    filter.reset();
    assert!(filter.sd(SelfBallState::SelfX) > 100.0);

    run_closed_loop(&mut filter, &steps[200..], &config, true);
    let last = &steps[steps.len() - 1].truth;
    assert!(position_error(&filter, last) < 40.0);
}

#[test]
fn teammates_share_ball_estimates() {
    init_logging();
    let config = FieldScenarioConfig::default();
    let steps = FieldScenario::new(config.clone()).unwrap().run(100);
    let mut seer = filter_at_start(&config);
    run_closed_loop(&mut seer, &steps, &config, true);

    // A teammate that never saw the ball and only knows its own pose.
    let truth = steps[steps.len() - 1].truth;
    let mean = DVector::from_vec(vec![truth.x, truth.y, truth.theta, 0.0, 0.0, 0.0, 0.0]);
    let mut teammate = SelfBallFilter::with_mean(mean, SelfBallConfig::default()).unwrap();
    let before = ball_error(&teammate, &truth);
    let outcome = teammate.shared_ball_update(&seer.shared_ball()).unwrap();
    assert!(outcome.is_accepted());
    assert!(ball_error(&teammate, &truth) < before);
    assert!(teammate.sd(SelfBallState::BallX) < 150.0);
}

#[test]
fn branched_hypotheses_evolve_independently() {
    init_logging();
    let config = FieldScenarioConfig::default();
    let steps = FieldScenario::new(config.clone()).unwrap().run(10);
    let mut parent = filter_at_start(&config);
    let mut child = parent.branch();
    assert_eq!(child.parent_id(), Some(parent.id()));

    // The child believes it is facing the other way.
    let mut flipped = child.snapshot();
    flipped.mean[SelfBallState::SelfTheta.index()] = wrap_to_pi(config.start_pose[2] + 3.0);
    child.restore(&flipped).unwrap();

    run_closed_loop(&mut parent, &steps, &config, true);
    run_closed_loop(&mut child, &steps, &config, true);
    assert!(parent.alpha() > child.alpha());
    assert!(parent.alpha() > 0.0);
}

#[test]
fn orientation_tracks_sway() {
    init_logging();
    let tilt = TiltScenarioConfig::default();
    let mut scenario = TiltScenario::new(tilt.clone()).unwrap();
    let mut filter = OrientationFilter::new(OrientationConfig::default()).unwrap();
    let first = scenario.sample();
    filter.initialise(first.time_ms, &first.gyro, &first.accel).unwrap();

    let mut pitch_sq = 0.0;
    let mut roll_sq = 0.0;
    let mut count = 0;
    for i in 0..1000 {
        let sample = scenario.sample();
        filter.time_update(&sample.gyro, sample.time_ms).unwrap();
        filter.measurement_update(&sample.accel, None).unwrap();
        if i >= 500 {
            pitch_sq += (filter.pitch() - sample.pitch).powi(2);
            roll_sq += (filter.roll() - sample.roll).powi(2);
            count += 1;
        }
    }
    let pitch_rms = (pitch_sq / count as f64).sqrt();
    let roll_rms = (roll_sq / count as f64).sqrt();
    println!("tilt rms: pitch {pitch_rms:.4}, roll {roll_rms:.4}");
    assert!(pitch_rms < 0.05);
    assert!(roll_rms < 0.05);
    assert!((filter.roll_gyro_offset() - tilt.gyro_bias[0]).abs() < 0.1);
    assert!((filter.pitch_gyro_offset() - tilt.gyro_bias[1]).abs() < 0.1);
}
