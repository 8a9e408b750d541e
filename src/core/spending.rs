use serde::Serialize;
use tracing::info;

use super::engine::Simulation;
use super::error::{ConfigError, SimulationError};
use super::types::PercentileValue;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingLevelResult {
    pub consumption: f64,
    pub success_rate: f64,
    pub success_ci_half_width: f64,
    pub median_failure_year: Option<f64>,
    pub final_value_percentiles: Vec<PercentileValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceThreshold {
    pub confidence: f64,
    pub consumption: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SustainableSpendingConfig {
    pub target_success_rate: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SustainableSpendingResult {
    pub target_success_rate: f64,
    pub consumption: Option<f64>,
    pub achieved_success_rate: Option<f64>,
    pub converged: bool,
    pub feasible: bool,
    pub iterations: Vec<SearchIteration>,
    pub message: String,
}

/// Runs `simulation` once per consumption level, sharing seed and providers so
/// levels differ only in spending. Results are ordered by consumption.
pub fn spending_sweep(
    simulation: &Simulation,
    levels: &[f64],
) -> Result<Vec<SpendingLevelResult>, SimulationError> {
    let mut levels = levels.to_vec();
    for &level in &levels {
        if !level.is_finite() {
            return Err(ConfigError::NonFinite {
                field: "spending_level",
            }
            .into());
        }
        if level < 0.0 {
            return Err(ConfigError::NegativeAmount {
                field: "spending_level",
                value: level,
            }
            .into());
        }
    }
    levels.sort_by(|a, b| a.total_cmp(b));
    levels.dedup();

    info!(levels = levels.len(), "starting spending sweep");
    levels
        .into_iter()
        .map(|consumption| -> Result<SpendingLevelResult, SimulationError> {
            let results = simulation.with_annual_consumption(consumption).run()?;
            Ok(SpendingLevelResult {
                consumption,
                success_rate: results.success_rate,
                success_ci_half_width: binomial_ci_half_width(
                    results.success_rate,
                    results.simulations,
                ),
                median_failure_year: results.median_failure_year,
                final_value_percentiles: results.final_value.percentiles,
            })
        })
        .collect()
}

/// Consumption sustainable at each confidence level (percent). Outside the
/// observed success range the best or worst observed level is returned.
pub fn confidence_thresholds(
    results: &[SpendingLevelResult],
    confidences: &[f64],
) -> Vec<ConfidenceThreshold> {
    if results.is_empty() {
        return Vec::new();
    }

    let mut curve: Vec<(f64, f64)> = results
        .iter()
        .map(|r| (r.consumption, r.success_rate))
        .collect();
    curve.sort_by(|a, b| a.0.total_cmp(&b.0));

    let (best, worst) = curve.iter().enumerate().fold((0, 0), |(best, worst), (i, p)| {
        (
            if p.1 > curve[best].1 { i } else { best },
            if p.1 < curve[worst].1 { i } else { worst },
        )
    });
    let max_rate = curve[best].1;
    let min_rate = curve[worst].1;

    // Success falls as spending rises, so walk the curve from the top level down.
    let rates: Vec<f64> = curve.iter().rev().map(|p| p.1).collect();
    let spend: Vec<f64> = curve.iter().rev().map(|p| p.0).collect();

    confidences
        .iter()
        .map(|&confidence| {
            let target = confidence / 100.0;
            let consumption = if target >= max_rate {
                curve[best].0
            } else if target <= min_rate {
                curve[worst].0
            } else {
                interpolate(target, &rates, &spend)
            };
            ConfidenceThreshold {
                confidence,
                consumption,
            }
        })
        .collect()
}

fn interpolate(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    for i in 0..xs.len().saturating_sub(1) {
        let (x0, x1) = (xs[i], xs[i + 1]);
        if x0 <= x && x <= x1 {
            if x1 - x0 <= f64::EPSILON {
                return ys[i];
            }
            let w = (x - x0) / (x1 - x0);
            return ys[i] + (ys[i + 1] - ys[i]) * w;
        }
    }
    xs.iter()
        .zip(ys)
        .min_by(|a, b| (a.0 - x).abs().total_cmp(&(b.0 - x).abs()))
        .map(|(_, y)| *y)
        .unwrap_or(0.0)
}

/// Bisects for the highest consumption whose success rate still meets the target.
pub fn solve_sustainable_spending(
    simulation: &Simulation,
    search: SustainableSpendingConfig,
) -> Result<SustainableSpendingResult, SimulationError> {
    validate_search(search)?;

    let success_at = |consumption: f64| -> Result<f64, SimulationError> {
        Ok(simulation
            .with_annual_consumption(consumption)
            .run()?
            .success_rate)
    };
    let meets = |rate: f64| rate + 1e-12 >= search.target_success_rate;

    let low_rate = success_at(search.search_min)?;
    let high_rate = success_at(search.search_max)?;
    let mut iterations = Vec::with_capacity(search.max_iterations as usize);

    if !meets(low_rate) {
        return Ok(SustainableSpendingResult {
            target_success_rate: search.target_success_rate,
            consumption: None,
            achieved_success_rate: None,
            converged: false,
            feasible: false,
            iterations,
            message: "No feasible consumption found within the search bounds.".to_string(),
        });
    }
    if meets(high_rate) {
        return Ok(SustainableSpendingResult {
            target_success_rate: search.target_success_rate,
            consumption: Some(search.search_max),
            achieved_success_rate: Some(high_rate),
            converged: true,
            feasible: true,
            iterations,
            message: "Upper consumption bound is still feasible; increase search max.".to_string(),
        });
    }

    let (mut lo, mut hi) = (search.search_min, search.search_max);
    let mut lo_rate = low_rate;
    let mut converged = false;
    for iteration in 1..=search.max_iterations {
        let mid = (lo + hi) * 0.5;
        let rate = success_at(mid)?;
        iterations.push(SearchIteration {
            iteration,
            lower_bound: lo,
            upper_bound: hi,
            candidate: mid,
            success_rate: rate,
        });

        if meets(rate) {
            lo = mid;
            lo_rate = rate;
        } else {
            hi = mid;
        }

        if (hi - lo).abs() <= search.tolerance {
            converged = true;
            break;
        }
    }

    info!(
        consumption = lo,
        success_rate = lo_rate,
        iterations = iterations.len(),
        converged,
        "sustainable spending search finished"
    );
    Ok(SustainableSpendingResult {
        target_success_rate: search.target_success_rate,
        consumption: Some(lo),
        achieved_success_rate: Some(lo_rate),
        converged,
        feasible: true,
        iterations,
        message: if converged {
            "Solved maximum sustainable consumption.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate.".to_string()
        },
    })
}

fn validate_search(search: SustainableSpendingConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&search.target_success_rate) {
        return Err(ConfigError::InvalidSearch(
            "target success rate must be between 0 and 1",
        ));
    }
    if !search.search_min.is_finite() || !search.search_max.is_finite() {
        return Err(ConfigError::InvalidSearch("search bounds must be finite"));
    }
    if search.search_min < 0.0 || search.search_max <= search.search_min {
        return Err(ConfigError::InvalidSearch(
            "search max must be greater than a non-negative search min",
        ));
    }
    if !search.tolerance.is_finite() || search.tolerance <= 0.0 {
        return Err(ConfigError::InvalidSearch("tolerance must be > 0"));
    }
    if search.max_iterations == 0 {
        return Err(ConfigError::InvalidSearch("max iterations must be > 0"));
    }
    Ok(())
}

fn binomial_ci_half_width(p: f64, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    1.96 * (p * (1.0 - p) / n as f64).sqrt()
}
