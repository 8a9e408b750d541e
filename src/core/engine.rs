use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tracing::{debug, info};

use super::aggregate::{CompletedRun, aggregate};
use super::error::{ConfigError, ReturnError, SimulationError};
use super::mortality::{GompertzMortality, MortalityGate, MortalityProvider, checked_probability};
use super::returns::{FatTailReturnGenerator, ReturnMatrix, ReturnSource};
use super::streams::IndexedStreams;
use super::tax::{NoTax, TaxAdapter, TaxBatchRequest, TaxFacts, TaxService};
use super::types::{AnnualCashflow, SimulationConfig, SimulationResults, YearRecord};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Vitality {
    Alive,
    Dead { year: u32 },
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PathState {
    pub portfolio_value: f64,
    pub cost_basis: f64,
    pub prior_year_tax_liability: f64,
    pub lifetime_withdrawals: f64,
    pub lifetime_taxes: f64,
    vitality: Vitality,
    failure_year: Option<u32>,
    estate_value: Option<f64>,
}

impl PathState {
    pub fn new(portfolio_value: f64, cost_basis: f64) -> Self {
        Self {
            portfolio_value,
            cost_basis,
            prior_year_tax_liability: 0.0,
            lifetime_withdrawals: 0.0,
            lifetime_taxes: 0.0,
            vitality: Vitality::Alive,
            failure_year: None,
            estate_value: None,
        }
    }

    pub fn vitality(&self) -> Vitality {
        self.vitality
    }

    pub fn is_alive(&self) -> bool {
        self.vitality == Vitality::Alive
    }

    pub fn failure_year(&self) -> Option<u32> {
        self.failure_year
    }

    pub fn estate_value(&self) -> Option<f64> {
        self.estate_value
    }

    /// Returns false when a failure year was already recorded.
    pub fn record_failure(&mut self, year: u32) -> bool {
        if self.failure_year.is_some() {
            return false;
        }
        self.failure_year = Some(year);
        true
    }

    /// Death is absorbing; a dead path keeps its original year and estate.
    pub fn mark_dead(&mut self, year: u32) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.vitality = Vitality::Dead { year };
        self.estate_value = Some(self.portfolio_value);
        self.prior_year_tax_liability = 0.0;
        true
    }
}

#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct Simulation {
    config: SimulationConfig,
    returns: Arc<dyn ReturnSource>,
    mortality: Arc<dyn MortalityProvider>,
    tax: TaxAdapter,
    streams: Option<IndexedStreams>,
    cancellation: Option<CancellationToken>,
}

impl Simulation {
    /// Validates `config` and wires the default providers: fat-tailed returns,
    /// Gompertz mortality and no tax.
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        let returns = FatTailReturnGenerator::new(
            config.expected_return,
            config.return_volatility,
            config.seed,
        )?;
        Ok(Self {
            config,
            returns: Arc::new(returns),
            mortality: Arc::new(GompertzMortality::default()),
            tax: TaxAdapter::new(Arc::new(NoTax)),
            streams: None,
            cancellation: None,
        })
    }

    pub fn with_returns(mut self, returns: Arc<dyn ReturnSource>) -> Self {
        self.returns = returns;
        self
    }

    pub fn with_mortality(mut self, mortality: Arc<dyn MortalityProvider>) -> Self {
        self.mortality = mortality;
        self
    }

    pub fn with_tax_service(mut self, service: Arc<dyn TaxService>) -> Self {
        self.tax = TaxAdapter::new(service);
        self
    }

    pub fn with_streams(mut self, streams: IndexedStreams) -> Result<Self, SimulationError> {
        let years = self.config.years as usize;
        if streams.years() != years {
            return Err(ConfigError::StreamLength {
                stream: "indexed streams",
                expected: years,
                actual: streams.years(),
            }
            .into());
        }
        self.streams = Some(streams);
        Ok(self)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Same providers and random streams, different base consumption.
    pub fn with_annual_consumption(&self, annual_consumption: f64) -> Self {
        let mut next = self.clone();
        next.config.annual_consumption = annual_consumption;
        next.streams = self
            .streams
            .as_ref()
            .map(|s| s.with_consumption(annual_consumption, self.config.consumption_growth_rate));
        next
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn run(&self) -> Result<SimulationResults, SimulationError> {
        let config = &self.config;
        config.validate()?;

        let paths = config.simulations as usize;
        let years = config.years as usize;
        info!(
            paths,
            years,
            mortality = config.include_mortality,
            seed = config.seed,
            "starting simulation"
        );

        let streams = self
            .streams
            .clone()
            .unwrap_or_else(|| IndexedStreams::from_config(config));
        let returns = self.returns.generate(paths, years)?;
        if returns.paths() != paths || returns.years() != years {
            return Err(ReturnError::ShapeMismatch {
                paths,
                years,
                actual_paths: returns.paths(),
                actual_years: returns.years(),
            }
            .into());
        }
        let gate = config
            .include_mortality
            .then(|| MortalityGate::draw(paths, years, config.seed));

        let mut states = vec![PathState::new(config.initial_portfolio, config.cost_basis()); paths];
        let mut values_by_year = Vec::with_capacity(years + 1);
        values_by_year.push(vec![config.initial_portfolio; paths]);
        let mut cashflows = Vec::with_capacity(years);
        let mut records: Option<Vec<Vec<YearRecord>>> = config
            .record_years
            .then(|| (0..paths).map(|_| Vec::with_capacity(years)).collect());

        for year in 1..=config.years {
            if self
                .cancellation
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
            {
                info!(year, "simulation cancelled");
                return Err(SimulationError::Cancelled { year });
            }

            let age = config.current_age + year;
            let probability = match gate {
                Some(_) => checked_probability(self.mortality.as_ref(), age, config.gender)
                    .map_err(|source| SimulationError::Mortality { year, source })?,
                None => 0.0,
            };

            let ctx = YearContext {
                config,
                year,
                age,
                probability,
                gate: gate.as_ref(),
                returns: &returns,
                streams: &streams,
            };
            let mut outcomes: Vec<StepOutcome> = states
                .par_iter_mut()
                .enumerate()
                .map(|(path, state)| ctx.advance(path, state))
                .collect();

            let tax_year = config.start_year + year - 1;
            let (taxed_paths, households): (Vec<usize>, Vec<TaxFacts>) = outcomes
                .iter()
                .enumerate()
                .filter_map(|(path, outcome)| outcome.facts.map(|facts| (path, facts)))
                .unzip();
            let request = TaxBatchRequest {
                tax_year,
                filing_status: config.filing_status,
                jurisdiction: config.jurisdiction.clone(),
                households,
            };
            let liabilities = self
                .tax
                .liabilities(&request)
                .map_err(|source| SimulationError::Tax {
                    year,
                    tax_year,
                    source,
                })?;

            for (path, liability) in taxed_paths.into_iter().zip(liabilities) {
                let state = &mut states[path];
                state.prior_year_tax_liability = liability;
                state.lifetime_taxes += liability;
                outcomes[path].record.tax_accrued = liability;
            }

            let cashflow = annual_cashflow(year, age, &outcomes);
            debug!(
                year,
                age,
                alive = cashflow.alive_paths,
                solvent = cashflow.solvent_paths,
                withdrawals = cashflow.total_withdrawals,
                taxes = cashflow.total_taxes_accrued,
                "simulated year"
            );
            cashflows.push(cashflow);
            values_by_year.push(states.iter().map(|s| s.portfolio_value).collect());
            if let Some(records) = records.as_mut() {
                for (path_records, outcome) in records.iter_mut().zip(&outcomes) {
                    path_records.push(outcome.record);
                }
            }
        }

        let run = CompletedRun {
            years: config.years,
            include_mortality: config.include_mortality,
            percentiles: config.percentiles.clone(),
            values_by_year,
            states,
            annual_cashflows: cashflows,
            year_records: records,
        };
        let results = aggregate(&run)?;
        info!(
            paths,
            years,
            success_rate = results.success_rate,
            survival_rate = results.survival_rate,
            "simulation complete"
        );
        Ok(results)
    }
}

struct YearContext<'a> {
    config: &'a SimulationConfig,
    year: u32,
    age: u32,
    probability: f64,
    gate: Option<&'a MortalityGate>,
    returns: &'a ReturnMatrix,
    streams: &'a IndexedStreams,
}

struct StepOutcome {
    record: YearRecord,
    facts: Option<TaxFacts>,
}

impl YearContext<'_> {
    fn frozen(&self, state: &PathState) -> StepOutcome {
        StepOutcome {
            record: YearRecord {
                year: self.year,
                age: self.age,
                alive: false,
                growth_factor: 1.0,
                dividends: 0.0,
                guaranteed_income: 0.0,
                withdrawal: 0.0,
                shortfall: 0.0,
                realized_gains: 0.0,
                tax_paid: 0.0,
                tax_accrued: 0.0,
                cost_basis: state.cost_basis,
                portfolio_value: state.portfolio_value,
            },
            facts: None,
        }
    }

    fn advance(&self, path: usize, state: &mut PathState) -> StepOutcome {
        if !state.is_alive() {
            return self.frozen(state);
        }
        if let Some(gate) = self.gate {
            if gate.dies(path, self.year, self.probability) {
                state.mark_dead(self.year);
                return self.frozen(state);
            }
        }

        let config = self.config;
        let year = self.year;
        let start_value = state.portfolio_value;
        let growth_factor = self.returns.get(path, year as usize - 1);
        let after_growth = start_value * growth_factor;
        let dividends = start_value * config.dividend_yield;

        let wages = if self.age < config.retirement_age {
            self.streams.wages(year)
        } else {
            0.0
        };
        let social_security = self.streams.social_security(year);
        let pension = self.streams.pension(year) + config.annuity_payment_for_year(year);
        let guaranteed_income = wages + social_security + pension;

        let tax_paid = state.prior_year_tax_liability;
        let need =
            (self.streams.consumption(year) + tax_paid - guaranteed_income - dividends).max(0.0);

        let (withdrawal, shortfall, realized_gains) = if start_value > 0.0 {
            let gain_fraction = if after_growth > 0.0 {
                ((after_growth - state.cost_basis) / after_growth).max(0.0)
            } else {
                0.0
            };
            let realized = need * gain_fraction;
            let drawn_fraction = if after_growth > 0.0 {
                (need / after_growth).min(1.0)
            } else {
                1.0
            };
            state.cost_basis = (state.cost_basis * (1.0 - drawn_fraction)).max(0.0);

            let new_value = after_growth - need;
            if new_value <= 0.0 {
                state.record_failure(year);
            }
            state.portfolio_value = new_value.max(0.0);
            (need, (-new_value).max(0.0), realized)
        } else {
            (0.0, need, 0.0)
        };
        state.lifetime_withdrawals += withdrawal;

        StepOutcome {
            record: YearRecord {
                year,
                age: self.age,
                alive: true,
                growth_factor,
                dividends,
                guaranteed_income,
                withdrawal,
                shortfall,
                realized_gains,
                tax_paid,
                tax_accrued: 0.0,
                cost_basis: state.cost_basis,
                portfolio_value: state.portfolio_value,
            },
            facts: Some(TaxFacts {
                capital_gains: realized_gains,
                social_security,
                pension_income: pension,
                wages,
                dividends,
                age: self.age,
            }),
        }
    }
}

fn annual_cashflow(year: u32, age: u32, outcomes: &[StepOutcome]) -> AnnualCashflow {
    let mut cashflow = AnnualCashflow {
        year,
        age,
        alive_paths: 0,
        solvent_paths: 0,
        total_withdrawals: 0.0,
        total_shortfall: 0.0,
        total_dividends: 0.0,
        total_guaranteed_income: 0.0,
        total_realized_gains: 0.0,
        total_taxes_paid: 0.0,
        total_taxes_accrued: 0.0,
    };
    for record in outcomes.iter().map(|o| &o.record).filter(|r| r.alive) {
        cashflow.alive_paths += 1;
        if record.portfolio_value > 0.0 {
            cashflow.solvent_paths += 1;
        }
        cashflow.total_withdrawals += record.withdrawal;
        cashflow.total_shortfall += record.shortfall;
        cashflow.total_dividends += record.dividends;
        cashflow.total_guaranteed_income += record.guaranteed_income;
        cashflow.total_realized_gains += record.realized_gains;
        cashflow.total_taxes_paid += record.tax_paid;
        cashflow.total_taxes_accrued += record.tax_accrued;
    }
    cashflow
}
