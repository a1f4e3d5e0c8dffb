//! Bounded minimisation with an analytic gradient, and one-dimensional crossing search.

use std::collections::VecDeque;
use std::time::Instant;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::layout::ParamSpec;
use crate::likelihood::Score;

#[derive(Debug, Error, PartialEq)]
pub enum FitDidNotConverge {
    #[error("starting point lies outside the physical domain")]
    RejectedStart,

    #[error("gradient component {component} rejected at iteration {iteration}")]
    RejectedGradient { iteration: u64, component: usize },

    #[error("search direction became non-finite at iteration {0}")]
    NonFiniteDirection(u64),

    #[error("iteration limit of {0} reached")]
    IterationLimit(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescentConfig {
    pub max_iterations: u64,
    /// Projected gradient norm below which the search stops, scaled by `max(1, sqrt|f|)`.
    pub gradient_tolerance: f64,
    /// Relative decrease in value below which the search stops.
    pub value_tolerance: f64,
    /// Number of correction pairs retained for the inverse Hessian approximation.
    pub memory: usize,
    /// Sufficient decrease constant of the Armijo condition.
    pub armijo: f64,
    pub max_backtracks: u32,
}
impl DescentConfig {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.max_iterations == 0 {
            bail!("at least one iteration must be allowed");
        }
        if self.gradient_tolerance <= 0.0 {
            bail!("gradient tolerance must be positive");
        }
        if self.value_tolerance < 0.0 {
            bail!("value tolerance must be non-negative");
        }
        if self.memory == 0 {
            bail!("at least one correction pair must be retained");
        }
        if self.armijo <= 0.0 || self.armijo >= 1.0 {
            bail!("Armijo constant must lie in (0, 1)");
        }
        if self.max_backtracks == 0 {
            bail!("at least one backtrack must be allowed");
        }
        Ok(())
    }
}

impl Default for DescentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            gradient_tolerance: 1e-7,
            value_tolerance: 1e-14,
            memory: 10,
            armijo: 1e-4,
            max_backtracks: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    GradientNorm,
    ValueChange,
    /// No step along the search direction improves the value.
    Stalled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescentOutcome {
    pub iterations: u64,
    pub evaluations: u64,
    pub optimal_values: Vec<f64>,
    pub optimal_value: f64,
    pub termination: Termination,
}

struct Correction {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

/// Projected limited-memory quasi-Newton descent. Parameters flagged as fixed in `specs` are
/// held at their initial value; the rest are kept within their bounds. Rejected trial points
/// are treated as worse than any valid point.
pub fn bounded_descent(
    config: &DescentConfig,
    specs: &[ParamSpec],
    mut value_f: impl FnMut(&[f64]) -> Score,
    mut gradient_f: impl FnMut(&[f64]) -> Vec<Score>,
) -> Result<DescentOutcome, FitDidNotConverge> {
    debug_assert!(config.validate().is_ok(), "{:?}", config.validate());
    let start_time = Instant::now();
    let free = specs
        .iter()
        .enumerate()
        .filter(|(_, spec)| !spec.fixed)
        .map(|(index, _)| index)
        .collect::<Vec<_>>();
    let mut values = specs
        .iter()
        .map(|spec| {
            if spec.fixed {
                spec.init
            } else {
                spec.init.clamp(spec.lower, spec.upper)
            }
        })
        .collect::<Vec<_>>();

    let mut evaluations: u64 = 1;
    let mut value = value_f(&values)
        .valid()
        .ok_or(FitDidNotConverge::RejectedStart)?;
    let mut gradient = free_gradient(&mut gradient_f, &values, &free, 0)?;
    let mut history = VecDeque::with_capacity(config.memory);

    let outcome = |values: Vec<f64>,
                   value: f64,
                   iterations: u64,
                   evaluations: u64,
                   termination: Termination| {
        debug!(
            "descent {termination:?} after {iterations} iterations and {evaluations} evaluations, value: {value}, took {:?}",
            start_time.elapsed()
        );
        DescentOutcome {
            iterations,
            evaluations,
            optimal_values: values,
            optimal_value: value,
            termination,
        }
    };

    for iteration in 1..=config.max_iterations {
        let projected = project(&gradient, &values, &free, specs);
        let norm = dot(&projected, &projected).sqrt();
        if norm <= config.gradient_tolerance * value.abs().sqrt().max(1.0) {
            return Ok(outcome(
                values,
                value,
                iteration - 1,
                evaluations,
                Termination::GradientNorm,
            ));
        }

        let mut line_search = |direction: &[f64], init_step: f64| {
            let mut step = init_step;
            for _ in 0..config.max_backtracks {
                let trial = advance(&values, &free, specs, direction, step);
                let predicted = free
                    .iter()
                    .enumerate()
                    .map(|(offset, &index)| gradient[offset] * (trial[index] - values[index]))
                    .sum::<f64>();
                // a null step only gets smaller from here
                if predicted.is_nan() || predicted >= 0.0 {
                    return None;
                }
                evaluations += 1;
                if let Score::Valid(trial_value) = value_f(&trial) {
                    if trial_value < value && trial_value <= value + config.armijo * predicted {
                        return Some((trial, trial_value));
                    }
                }
                step *= 0.5;
            }
            None
        };

        let mut accepted = None;
        if !history.is_empty() {
            let mut direction = two_loop(&history, &projected);
            for (offset, &index) in free.iter().enumerate() {
                let spec = &specs[index];
                if (values[index] <= spec.lower && direction[offset] < 0.0)
                    || (values[index] >= spec.upper && direction[offset] > 0.0)
                {
                    direction[offset] = 0.0;
                }
            }
            let slope = dot(&direction, &projected);
            if slope < 0.0 && direction.iter().all(|component| component.is_finite()) {
                accepted = line_search(&direction, 1.0);
            }
            if accepted.is_none() {
                debug!("quasi-Newton step failed at iteration {iteration}, restarting from steepest descent");
                history.clear();
            }
        }
        if accepted.is_none() {
            let direction = projected
                .iter()
                .map(|component| -component)
                .collect::<Vec<_>>();
            if direction.iter().any(|component| !component.is_finite()) {
                return Err(FitDidNotConverge::NonFiniteDirection(iteration));
            }
            accepted = line_search(&direction, f64::min(1.0, 1.0 / norm));
        }
        let Some((trial, trial_value)) = accepted else {
            debug!("line search stalled at iteration {iteration}");
            return Ok(outcome(
                values,
                value,
                iteration - 1,
                evaluations,
                Termination::Stalled,
            ));
        };

        let trial_gradient = free_gradient(&mut gradient_f, &trial, &free, iteration)?;
        let s = free
            .iter()
            .map(|&index| trial[index] - values[index])
            .collect::<Vec<_>>();
        let y = trial_gradient
            .iter()
            .zip(&gradient)
            .map(|(next, previous)| next - previous)
            .collect::<Vec<_>>();
        let sy = dot(&s, &y);
        if sy > 1e-10 {
            if history.len() == config.memory {
                history.pop_front();
            }
            history.push_back(Correction { s, y, rho: 1.0 / sy });
        }

        let change = value - trial_value;
        values = trial;
        value = trial_value;
        gradient = trial_gradient;
        if change <= config.value_tolerance * value.abs().max(1.0) {
            // a flat stretch far from a stationary point is not convergence
            let projected = project(&gradient, &values, &free, specs);
            let norm = dot(&projected, &projected).sqrt();
            if norm <= config.gradient_tolerance.sqrt() * value.abs().sqrt().max(1.0) {
                return Ok(outcome(
                    values,
                    value,
                    iteration,
                    evaluations,
                    Termination::ValueChange,
                ));
            }
        }
    }
    Err(FitDidNotConverge::IterationLimit(config.max_iterations))
}

fn free_gradient(
    gradient_f: &mut impl FnMut(&[f64]) -> Vec<Score>,
    values: &[f64],
    free: &[usize],
    iteration: u64,
) -> Result<Vec<f64>, FitDidNotConverge> {
    let gradient = gradient_f(values);
    free.iter()
        .map(|&component| {
            gradient[component]
                .valid()
                .ok_or(FitDidNotConverge::RejectedGradient {
                    iteration,
                    component,
                })
        })
        .collect()
}

/// Zeroes the components of the free gradient that push against an active bound.
fn project(gradient: &[f64], values: &[f64], free: &[usize], specs: &[ParamSpec]) -> Vec<f64> {
    free.iter()
        .enumerate()
        .map(|(offset, &index)| {
            let spec = &specs[index];
            let component = gradient[offset];
            if (values[index] <= spec.lower && component > 0.0)
                || (values[index] >= spec.upper && component < 0.0)
            {
                0.0
            } else {
                component
            }
        })
        .collect()
}

/// `-H·g`, with `H` the limited-memory inverse Hessian approximation.
fn two_loop(history: &VecDeque<Correction>, gradient: &[f64]) -> Vec<f64> {
    let mut q = gradient.to_vec();
    let mut alphas = Vec::with_capacity(history.len());
    for correction in history.iter().rev() {
        let alpha = correction.rho * dot(&correction.s, &q);
        axpy(-alpha, &correction.y, &mut q);
        alphas.push(alpha);
    }
    if let Some(newest) = history.back() {
        let gamma = dot(&newest.s, &newest.y) / dot(&newest.y, &newest.y);
        q.iter_mut().for_each(|component| *component *= gamma);
    }
    for (correction, alpha) in history.iter().zip(alphas.into_iter().rev()) {
        let beta = correction.rho * dot(&correction.y, &q);
        axpy(alpha - beta, &correction.s, &mut q);
    }
    q.iter_mut().for_each(|component| *component = -*component);
    q
}

fn advance(
    values: &[f64],
    free: &[usize],
    specs: &[ParamSpec],
    direction: &[f64],
    step: f64,
) -> Vec<f64> {
    let mut trial = values.to_vec();
    for (offset, &index) in free.iter().enumerate() {
        let spec = &specs[index];
        trial[index] = (values[index] + step * direction[offset]).clamp(spec.lower, spec.upper);
    }
    trial
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

#[inline]
fn axpy(a: f64, x: &[f64], y: &mut [f64]) {
    y.iter_mut().zip(x).for_each(|(y, x)| *y += a * x);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootSearchConfig {
    /// Initial offset as a fraction of the parameter's magnitude.
    pub init_step_fraction: f64,
    /// Lower limit on the initial offset.
    pub min_step: f64,
    pub max_expansions: u32,
    pub max_bisections: u32,
    /// Relative width of the bracket at which bisection stops.
    pub tolerance: f64,
}
impl RootSearchConfig {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.init_step_fraction <= 0.0 {
            bail!("initial step fraction must be positive");
        }
        if self.min_step <= 0.0 {
            bail!("min step must be positive");
        }
        if self.max_expansions == 0 {
            bail!("at least one expansion must be allowed");
        }
        if self.tolerance <= 0.0 {
            bail!("tolerance must be positive");
        }
        Ok(())
    }

    pub fn init_step(&self, value: f64) -> f64 {
        f64::max(value.abs() * self.init_step_fraction, self.min_step)
    }
}

impl Default for RootSearchConfig {
    fn default() -> Self {
        Self {
            init_step_fraction: 0.01,
            min_step: 1e-6,
            max_expansions: 100,
            max_bisections: 200,
            tolerance: 1e-12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Crossing {
    Found(f64),
    /// A rejected point was met before the crossing.
    Rejected,
    /// The target was not reached within the allowed expansions.
    NotBracketed,
}

/// Finds the positive offset at which `rise_f` first reaches `target`, assuming
/// `rise_f(0) < target`. The offset is bracketed by doubling `init_step`, then bisected.
pub fn crossing_search(
    config: &RootSearchConfig,
    init_step: f64,
    target: f64,
    mut rise_f: impl FnMut(f64) -> Score,
) -> Crossing {
    let (mut below, mut above) = (0.0, None);
    let mut offset = init_step;
    for _ in 0..config.max_expansions {
        match rise_f(offset) {
            Score::Rejected => return Crossing::Rejected,
            Score::Valid(rise) if rise >= target => {
                above = Some(offset);
                break;
            }
            Score::Valid(_) => {
                below = offset;
                offset *= 2.0;
            }
        }
    }
    let Some(mut above) = above else {
        return Crossing::NotBracketed;
    };

    for _ in 0..config.max_bisections {
        if above - below <= config.tolerance * above {
            break;
        }
        let mid = (below + above) / 2.0;
        match rise_f(mid) {
            Score::Rejected => return Crossing::Rejected,
            Score::Valid(rise) if rise >= target => above = mid,
            Score::Valid(_) => below = mid,
        }
    }
    Crossing::Found((below + above) / 2.0)
}
