use serde::Serialize;
use thiserror::Error;

use super::types::Gender;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("current_age ({current_age}) must be below max_age ({max_age})")]
    CurrentAgeNotBelowMaxAge { current_age: u32, max_age: u32 },
    #[error(
        "retirement_age ({retirement_age}) cannot be less than current_age ({current_age})"
    )]
    RetirementBeforeCurrentAge {
        retirement_age: u32,
        current_age: u32,
    },
    #[error("simulations must be > 0")]
    NoSimulations,
    #[error("years must be > 0")]
    NoYears,
    #[error(
        "a {years}-year horizon from age {current_age} runs past max_age ({max_age})"
    )]
    HorizonPastMaxAge {
        current_age: u32,
        years: u32,
        max_age: u32,
    },
    #[error("a {years}-year run starting in {start_year} overflows the tax year")]
    TaxYearOverflow { start_year: u32, years: u32 },
    #[error("return volatility cannot be negative, got {0}")]
    NegativeVolatility(f64),
    #[error(
        "volatility {volatility} is too high for expected return {expected_return}: \
         a 4-sigma loss would produce a non-positive growth factor"
    )]
    VolatilityTooHigh {
        expected_return: f64,
        volatility: f64,
    },
    #[error("dividend_yield must be in [0, 1), got {0}")]
    DividendYieldOutOfRange(f64),
    #[error("{field} cannot be negative, got {value}")]
    NegativeAmount { field: &'static str, value: f64 },
    #[error("{field} must be finite")]
    NonFinite { field: &'static str },
    #[error("percentile {0} must be between 0 and 100")]
    InvalidPercentile(f64),
    #[error("spending search: {0}")]
    InvalidSearch(&'static str),
    #[error("{stream} stream has {actual} values, expected {expected}")]
    StreamLength {
        stream: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReturnError {
    #[error(
        "return matrix needs at least one path and one year, got {paths}x{years}"
    )]
    EmptyShape { paths: usize, years: usize },
    #[error("volatility cannot be negative, got {0}")]
    NegativeVolatility(f64),
    #[error("return model parameters must be finite")]
    NonFiniteParameter,
    #[error(
        "capped draws reach a non-positive growth factor ({floor}) for mu={mu}, sigma={sigma}"
    )]
    FactorFloorNotPositive { mu: f64, sigma: f64, floor: f64 },
    #[error("row {path} has {actual} years, expected {expected}")]
    RaggedRow {
        path: usize,
        expected: usize,
        actual: usize,
    },
    #[error(
        "growth factor at path {path}, year {year} must be positive and finite, got {value}"
    )]
    NonPositiveFactor {
        path: usize,
        year: usize,
        value: f64,
    },
    #[error(
        "return matrix is {actual_paths}x{actual_years}, simulation needs {paths}x{years}"
    )]
    ShapeMismatch {
        paths: usize,
        years: usize,
        actual_paths: usize,
        actual_years: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MortalityError {
    #[error(
        "mortality probability for age {age} ({gender:?}) must be in [0, 1], got {probability}"
    )]
    ProbabilityOutOfRange {
        age: u32,
        gender: Gender,
        probability: f64,
    },
    #[error("invalid mortality table: {0}")]
    InvalidTable(String),
}

#[derive(Debug, Error)]
pub enum TaxError {
    #[error("tax service transport failed: {0}")]
    Transport(String),
    #[error("tax service answered HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("tax service response could not be decoded: {0}")]
    Malformed(String),
    #[error(
        "tax service returned {received} liabilities for {expected} households"
    )]
    PartialBatch { expected: usize, received: usize },
    #[error(
        "tax liability for household {index} must be finite and >= 0, got {value}"
    )]
    InvalidLiability { index: usize, value: f64 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Configuration,
    Generation,
    Mortality,
    TaxBatch,
    Aggregation,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("return generation failed: {0}")]
    Generation(#[from] ReturnError),
    #[error("mortality gate failed in simulation year {year}: {source}")]
    Mortality { year: u32, source: MortalityError },
    #[error(
        "tax batch failed in simulation year {year} (tax year {tax_year}): {source}"
    )]
    Tax {
        year: u32,
        tax_year: u32,
        source: TaxError,
    },
    #[error("aggregation failed: {0}")]
    Aggregation(String),
    #[error("simulation cancelled before year {year}")]
    Cancelled { year: u32 },
}

impl SimulationError {
    pub fn stage(&self) -> Stage {
        match self {
            SimulationError::Config(_) => Stage::Configuration,
            SimulationError::Generation(_) => Stage::Generation,
            SimulationError::Mortality { .. } => Stage::Mortality,
            SimulationError::Tax { .. } => Stage::TaxBatch,
            SimulationError::Aggregation(_) => Stage::Aggregation,
            SimulationError::Cancelled { .. } => Stage::Cancelled,
        }
    }

    /// Simulation year that was in progress, when the failure is tied to one.
    pub fn year(&self) -> Option<u32> {
        match self {
            SimulationError::Mortality { year, .. }
            | SimulationError::Tax { year, .. }
            | SimulationError::Cancelled { year } => Some(*year),
            _ => None,
        }
    }
}
