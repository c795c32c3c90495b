//! Strategy behaviour seen through the fit driver.
//!
//! These tests run complete campaigns on problems with known minima and
//! check convergence, reproducibility across transports and the sampler
//! bookkeeping.

mod common;

use approx::assert_relative_eq;
use common::{Bowl, DoubleWell};
use ndarray::Array1;
use reflfit::{
    Bounds, FitConfig, FitDriver, FitProblem, InitMethod, Parameters, StrategyKind, Transport,
};

fn fit_bowl(config: FitConfig, transport: Transport) -> reflfit::FitResult {
    let mut driver = FitDriver::new(Bowl::new(), config, transport).unwrap();
    driver.fit().unwrap()
}

#[test]
fn test_de_converges_on_bowl() {
    let config = FitConfig::new().with_pop(20).with_steps(200).with_seed(42);
    let result = fit_bowl(config, Transport::serial());

    assert!(result.is_complete());
    assert!((result.value("x").unwrap() - 3.0).abs() < 1e-2);
    assert!((result.value("y").unwrap() - 7.0).abs() < 1e-2);
    assert!(result.nllf < 1e-4);
}

#[test]
fn test_deterministic_strategies_agree_across_transports() {
    for kind in [StrategyKind::De, StrategyKind::ParticleSwarm] {
        let config = FitConfig::new()
            .with_strategy(kind)
            .with_pop(12)
            .with_steps(60)
            .with_seed(7);
        let serial = fit_bowl(config.clone(), Transport::serial());
        let pool = fit_bowl(config, Transport::pool(4));

        assert_relative_eq!(serial.nllf, pool.nllf, epsilon = 1e-12);
        assert_eq!(serial.point, pool.point);
        assert_eq!(serial.evaluations, pool.evaluations);
    }
}

#[test]
fn test_seeded_runs_are_reproducible() {
    let config = FitConfig::new()
        .with_strategy(StrategyKind::RandomLines)
        .with_steps(40)
        .with_seed(11);
    let first = fit_bowl(config.clone(), Transport::serial());
    let second = fit_bowl(config, Transport::serial());
    assert_eq!(first.point, second.point);
    assert_eq!(first.seed, 11);
}

#[test]
fn test_more_starts_never_do_worse() {
    let single = FitConfig::new()
        .with_strategy(StrategyKind::RandomLines)
        .with_pop(4)
        .with_steps(5)
        .with_seed(3);
    let multi = single.clone().with_starts(4);

    let one = fit_bowl(single, Transport::serial());
    let many = fit_bowl(multi, Transport::serial());

    // Start 0 of the multi-start campaign is the single-start run
    assert!(many.nllf <= one.nllf);
    assert_eq!(many.starts_completed, 4);
    assert_eq!(many.steps, 4 * 5);
}

#[test]
fn test_degenerate_and_fixed_parameters_stay_put() {
    let mut problem = Bowl::new();
    problem
        .params
        .add_param_with_bounds("thickness", 12.5, 12.5, 12.5)
        .unwrap();
    problem.params.add_fixed("rho", 2.07).unwrap();

    let config = FitConfig::new().with_pop(10).with_steps(30).with_seed(5);
    let mut driver = FitDriver::new(problem, config, Transport::serial()).unwrap();
    let result = driver.fit().unwrap();

    assert_eq!(result.names, vec!["x".to_string(), "y".to_string()]);
    assert_eq!(result.point.len(), 2);
    let params = driver.problem().parameters();
    assert_eq!(params.get("thickness").unwrap().value(), 12.5);
    assert_eq!(params.get("rho").unwrap().value(), 2.07);
}

/// Bowl with a third parameter `t` whose stored value disagrees with its
/// collapsed bounds.
#[derive(Clone)]
struct PinnedBowl {
    params: Parameters,
}

impl FitProblem for PinnedBowl {
    fn parameters(&self) -> &Parameters {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    fn nllf(&self, values: &Array1<f64>) -> reflfit::Result<f64> {
        let (x, y, t) = (values[0], values[1], values[2]);
        Ok((x - 3.0).powi(2) + (y - 7.0).powi(2) + 1000.0 * (t - 5.0).powi(2))
    }

    fn degrees_of_freedom(&self) -> usize {
        1
    }
}

#[test]
fn test_pinned_parameter_is_evaluated_at_its_bound() {
    let mut params = Parameters::new();
    params.add_param_with_bounds("x", 5.0, 0.0, 10.0).unwrap();
    params.add_param_with_bounds("y", 5.0, 0.0, 10.0).unwrap();
    params.add_param("t", 3.0).unwrap();
    params
        .get_mut("t")
        .unwrap()
        .set_bounds(Bounds::range(5.0, 5.0).unwrap())
        .unwrap();

    let config = FitConfig::new().with_pop(20).with_steps(100).with_seed(9);
    let mut driver = FitDriver::new(PinnedBowl { params }, config, Transport::serial()).unwrap();
    let result = driver.fit().unwrap();

    assert_eq!(result.names, vec!["x".to_string(), "y".to_string()]);
    assert!(result.nllf < 1e-2);
    assert_eq!(driver.problem().parameters().get("t").unwrap().value(), 5.0);
}

#[test]
fn test_dream_keeps_exactly_the_requested_draws() {
    for draws in [0, 17] {
        let config = FitConfig::new()
            .with_strategy(StrategyKind::Dream)
            .with_pop(6)
            .with_burn(20)
            .with_steps(draws)
            .with_seed(8);
        let result = fit_bowl(config, Transport::serial());
        let posterior = result.posterior.unwrap();
        assert_eq!(posterior.draws(), draws);
        assert_eq!(posterior.chains(), 6);
        assert_eq!(posterior.dim(), 2);
        assert_eq!(result.steps, 20 + draws);
    }
}

#[test]
fn test_tempering_finds_deeper_well() {
    let config = FitConfig::new()
        .with_strategy(StrategyKind::Tempering)
        .with_temperatures(8, 0.1, 20.0)
        .with_burn(100)
        .with_steps(300)
        .with_seed(21);
    let mut driver = FitDriver::new(DoubleWell::new(-2.0), config, Transport::serial()).unwrap();
    let result = driver.fit().unwrap();
    assert!(result.point[0] > 1.5);
}

#[test]
fn test_every_init_method_starts_inside_bounds() {
    for init in [InitMethod::Random, InitMethod::Lhs, InitMethod::Covariance] {
        let config = FitConfig::new()
            .with_init(init)
            .with_pop(8)
            .with_steps(20)
            .with_seed(13);
        let result = fit_bowl(config, Transport::serial());
        assert!(result.is_complete());
        assert!(result.point.iter().all(|v| (0.0..=10.0).contains(v)));
    }
}

#[test]
fn test_unknown_strategy_names_the_choices() {
    let mut config = FitConfig::new();
    let err = config.set("fit", "amoeba").unwrap_err();
    let message = err.to_string();
    assert!(message.contains("amoeba"));
    assert!(message.contains("de|dream|rl|ps|pt"));
    assert!(err.is_configuration());
}
