use std::collections::BTreeMap;

use super::engine::PathState;
use super::error::SimulationError;
use super::types::{
    AnnualCashflow, DistributionSummary, FailureYearCount, PercentileSeries, PercentileValue,
    SimulationResults, YearRecord,
};

/// Everything the year loop leaves behind for the aggregator.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub years: u32,
    pub include_mortality: bool,
    pub percentiles: Vec<f64>,
    /// `values_by_year[t][path]`, with `t = 0` the starting value.
    pub values_by_year: Vec<Vec<f64>>,
    pub states: Vec<PathState>,
    pub annual_cashflows: Vec<AnnualCashflow>,
    pub year_records: Option<Vec<Vec<YearRecord>>>,
}

pub fn aggregate(run: &CompletedRun) -> Result<SimulationResults, SimulationError> {
    let paths = run.states.len();
    if paths == 0 {
        return Err(SimulationError::Aggregation("run has no paths".to_string()));
    }
    for (year, values) in run.values_by_year.iter().enumerate() {
        if values.len() != paths {
            return Err(SimulationError::Aggregation(format!(
                "year {year} has {} values for {paths} paths",
                values.len()
            )));
        }
        if let Some(value) = values.iter().find(|v| !v.is_finite()) {
            return Err(SimulationError::Aggregation(format!(
                "non-finite portfolio value {value} in year {year}"
            )));
        }
    }

    let portfolio_percentiles = run
        .percentiles
        .iter()
        .map(|&p| PercentileSeries {
            percentile: p,
            values: run
                .values_by_year
                .iter()
                .map(|values| percentile(&mut values.clone(), p))
                .collect(),
        })
        .collect();

    let mut histogram: BTreeMap<u32, usize> = BTreeMap::new();
    let mut failure_years = Vec::new();
    for year in run.states.iter().filter_map(PathState::failure_year) {
        *histogram.entry(year).or_default() += 1;
        failure_years.push(f64::from(year));
    }
    let failed = failure_years.len();
    let success_rate = (paths - failed) as f64 / paths as f64;
    let median_failure_year =
        (!failure_years.is_empty()).then(|| percentile(&mut failure_years, 50.0));

    let mut depleted = 0;
    let depletion_probability_by_year = (1..=run.years)
        .map(|year| {
            depleted += histogram.get(&year).copied().unwrap_or(0);
            depleted as f64 / paths as f64
        })
        .collect();

    let final_values: Vec<f64> = run.values_by_year.last().cloned().unwrap_or_default();
    let estate_at_death = run.include_mortality.then(|| {
        let estates: Vec<f64> = run
            .states
            .iter()
            .filter_map(PathState::estate_value)
            .collect();
        summarize(&estates, &run.percentiles)
    });
    let survivors = run.states.iter().filter(|s| s.is_alive()).count();

    let taxes: Vec<f64> = run.states.iter().map(|s| s.lifetime_taxes).collect();
    let withdrawals: Vec<f64> = run.states.iter().map(|s| s.lifetime_withdrawals).collect();

    Ok(SimulationResults {
        simulations: paths,
        years: run.years,
        success_rate,
        survival_rate: survivors as f64 / paths as f64,
        portfolio_percentiles,
        final_value: summarize(&final_values, &run.percentiles),
        failure_years: histogram
            .into_iter()
            .map(|(year, count)| FailureYearCount { year, count })
            .collect(),
        depletion_probability_by_year,
        median_failure_year,
        estate_at_death,
        lifetime_taxes: summarize(&taxes, &run.percentiles),
        lifetime_withdrawals: summarize(&withdrawals, &run.percentiles),
        total_taxes: taxes.iter().sum(),
        total_withdrawals: withdrawals.iter().sum(),
        annual_cashflows: run.annual_cashflows.clone(),
        year_records: run.year_records.clone(),
    })
}

pub fn summarize(values: &[f64], percentiles: &[f64]) -> DistributionSummary {
    if values.is_empty() {
        return DistributionSummary {
            count: 0,
            mean: 0.0,
            min: 0.0,
            max: 0.0,
            percentiles: percentiles
                .iter()
                .map(|&p| PercentileValue {
                    percentile: p,
                    value: 0.0,
                })
                .collect(),
        };
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    DistributionSummary {
        count: values.len(),
        mean: values.iter().sum::<f64>() / values.len() as f64,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        percentiles: percentiles
            .iter()
            .map(|&p| PercentileValue {
                percentile: p,
                value: percentile(&mut sorted, p),
            })
            .collect(),
    }
}

/// Linear interpolation between closest ranks, `rank = p/100 * (n - 1)`.
pub fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_run() -> CompletedRun {
        let mut failed = PathState::new(0.0, 0.0);
        failed.record_failure(2);
        failed.lifetime_withdrawals = 300.0;
        let mut dead = PathState::new(80.0, 50.0);
        dead.mark_dead(2);
        dead.lifetime_taxes = 12.0;
        let alive = PathState::new(150.0, 100.0);

        CompletedRun {
            years: 3,
            include_mortality: true,
            percentiles: vec![0.0, 50.0, 100.0],
            values_by_year: vec![
                vec![100.0, 100.0, 100.0],
                vec![40.0, 80.0, 110.0],
                vec![0.0, 80.0, 130.0],
                vec![0.0, 80.0, 150.0],
            ],
            states: vec![failed, dead, alive],
            annual_cashflows: Vec::new(),
            year_records: None,
        }
    }

    #[test]
    fn percentile_interpolates_between_points() {
        let mut values = vec![1.0, 2.0, 3.0, 4.0];
        assert_approx(percentile(&mut values, 25.0), 1.75);
        assert_approx(percentile(&mut values, 0.0), 1.0);
        assert_approx(percentile(&mut values, 100.0), 4.0);
        assert_approx(percentile(&mut [7.0], 90.0), 7.0);
        assert_approx(percentile(&mut Vec::new(), 50.0), 0.0);
    }

    #[test]
    fn aggregate_reports_failures_and_estates() {
        let results = aggregate(&sample_run()).unwrap();
        assert_approx(results.success_rate, 2.0 / 3.0);
        assert_eq!(results.failure_years, vec![FailureYearCount { year: 2, count: 1 }]);
        assert_eq!(results.median_failure_year, Some(2.0));
        assert_eq!(results.depletion_probability_by_year.len(), 3);
        assert_approx(results.depletion_probability_by_year[0], 0.0);
        assert_approx(results.depletion_probability_by_year[2], 1.0 / 3.0);
        assert_approx(results.survival_rate, 2.0 / 3.0);

        let estate = results.estate_at_death.unwrap();
        assert_eq!(estate.count, 1);
        assert_approx(estate.mean, 80.0);

        let median = &results.portfolio_percentiles[1];
        assert_eq!(median.values, vec![100.0, 80.0, 80.0, 80.0]);
        assert_approx(results.final_value.max, 150.0);
        assert_approx(results.total_taxes, 12.0);
        assert_approx(results.total_withdrawals, 300.0);
    }

    #[test]
    fn aggregate_is_idempotent() {
        let run = sample_run();
        assert_eq!(aggregate(&run).unwrap(), aggregate(&run).unwrap());
    }

    #[test]
    fn non_finite_values_are_aggregation_errors() {
        let mut run = sample_run();
        run.values_by_year[2][1] = f64::INFINITY;
        let err = aggregate(&run).unwrap_err();
        assert_eq!(err.stage(), crate::core::error::Stage::Aggregation);
    }

    #[test]
    fn empty_summary_is_zeroed() {
        let summary = summarize(&[], &[50.0]);
        assert_eq!(summary.count, 0);
        assert_eq!(summary.percentiles[0].value, 0.0);
    }
}
