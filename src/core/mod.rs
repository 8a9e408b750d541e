mod aggregate;
mod engine;
mod error;
mod mortality;
mod returns;
mod spending;
mod streams;
mod tax;
mod tax_http;
mod types;

pub use aggregate::{CompletedRun, aggregate, percentile, summarize};
pub use engine::{CancellationToken, PathState, Simulation, Vitality};
pub use error::{ConfigError, MortalityError, ReturnError, SimulationError, Stage, TaxError};
pub use mortality::{
    GompertzMortality, MortalityGate, MortalityProvider, MortalityTable, checked_probability,
};
pub use returns::{FatTailReturnGenerator, ReturnMatrix, ReturnSource, draw_shock};
pub use spending::{
    ConfidenceThreshold, SearchIteration, SpendingLevelResult, SustainableSpendingConfig,
    SustainableSpendingResult, confidence_thresholds, solve_sustainable_spending, spending_sweep,
};
pub use streams::IndexedStreams;
pub use tax::{
    BandedTax, FlatRateTax, NoTax, TaxAdapter, TaxBatchRequest, TaxBatchResponse, TaxFacts,
    TaxService,
};
pub use tax_http::HttpTaxService;
pub use types::{
    AnnualCashflow, AnnuityKind, AnnuityTerms, DEFAULT_PERCENTILES, DistributionSummary,
    FailureYearCount, FilingStatus, Gender, PercentileSeries, PercentileValue, SimulationConfig,
    SimulationResults, YearRecord,
};
