use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::core::{
    AnnuityKind, AnnuityTerms, BandedTax, ConfidenceThreshold, ConfigError, DEFAULT_PERCENTILES,
    FilingStatus, FlatRateTax, Gender, GompertzMortality, HttpTaxService, MortalityError,
    MortalityProvider, MortalityTable, NoTax, Simulation, SimulationConfig, SimulationError,
    SimulationResults, SpendingLevelResult, Stage, SustainableSpendingConfig,
    SustainableSpendingResult, TaxError, TaxService, confidence_thresholds,
    solve_sustainable_spending, spending_sweep,
};

pub const TAX_ENDPOINT_ENV: &str = "FINSIM_TAX_ENDPOINT";

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CliGender {
    #[serde(alias = "Male")]
    Male,
    #[serde(alias = "Female")]
    Female,
}

impl From<CliGender> for Gender {
    fn from(value: CliGender) -> Self {
        match value {
            CliGender::Male => Gender::Male,
            CliGender::Female => Gender::Female,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CliFilingStatus {
    #[serde(alias = "SINGLE")]
    Single,
    #[serde(alias = "JOINT")]
    Joint,
    #[serde(alias = "SEPARATE")]
    Separate,
    #[serde(alias = "HEAD_OF_HOUSEHOLD", alias = "headOfHousehold")]
    HeadOfHousehold,
    #[serde(alias = "WIDOW")]
    Widow,
}

impl From<CliFilingStatus> for FilingStatus {
    fn from(value: CliFilingStatus) -> Self {
        match value {
            CliFilingStatus::Single => FilingStatus::Single,
            CliFilingStatus::Joint => FilingStatus::Joint,
            CliFilingStatus::Separate => FilingStatus::Separate,
            CliFilingStatus::HeadOfHousehold => FilingStatus::HeadOfHousehold,
            CliFilingStatus::Widow => FilingStatus::Widow,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CliAnnuityKind {
    #[serde(alias = "lifeOnly")]
    LifeOnly,
    #[serde(alias = "lifeWithGuarantee")]
    LifeWithGuarantee,
    #[serde(alias = "fixedPeriod")]
    FixedPeriod,
}

impl From<CliAnnuityKind> for AnnuityKind {
    fn from(value: CliAnnuityKind) -> Self {
        match value {
            CliAnnuityKind::LifeOnly => AnnuityKind::LifeOnly,
            CliAnnuityKind::LifeWithGuarantee => AnnuityKind::LifeWithGuarantee,
            CliAnnuityKind::FixedPeriod => AnnuityKind::FixedPeriod,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CliTaxModel {
    None,
    #[serde(alias = "flat-rate", alias = "flatRate")]
    Flat,
    Banded,
    Http,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "finsim",
    about = "Monte Carlo retirement portfolio simulator (returns, mortality, taxes)"
)]
pub struct Cli {
    #[arg(long, default_value_t = 65)]
    pub current_age: u32,
    #[arg(long, default_value_t = 65)]
    pub retirement_age: u32,
    #[arg(long, default_value_t = 100)]
    pub max_age: u32,
    #[arg(long, value_enum, default_value_t = CliGender::Male)]
    pub gender: CliGender,
    #[arg(
        long,
        help = "Disable the mortality gate; every path lives the full horizon"
    )]
    pub no_mortality: bool,
    #[arg(
        long,
        help = "JSON mortality table {\"male\": {\"65\": q}, \"female\": {...}}"
    )]
    pub mortality_table: Option<PathBuf>,

    #[arg(long, default_value_t = 500_000.0)]
    pub initial_portfolio: f64,
    #[arg(long, help = "Cost basis at start; defaults to the initial portfolio")]
    pub initial_cost_basis: Option<f64>,
    #[arg(long, default_value_t = 60_000.0)]
    pub annual_consumption: f64,
    #[arg(long, default_value_t = 24_000.0)]
    pub social_security: f64,
    #[arg(long, default_value_t = 0.0)]
    pub pension: f64,
    #[arg(long, default_value_t = 0.0)]
    pub annuity_payment: f64,
    #[arg(long, value_enum, default_value_t = CliAnnuityKind::LifeOnly)]
    pub annuity_kind: CliAnnuityKind,
    #[arg(long, default_value_t = 0)]
    pub annuity_guarantee_years: u32,
    #[arg(long, default_value_t = 0.0)]
    pub employment_income: f64,

    #[arg(
        long,
        default_value_t = 7.0,
        help = "Expected annual return in percent"
    )]
    pub expected_return: f64,
    #[arg(
        long,
        default_value_t = 15.0,
        help = "Annual return volatility in percent"
    )]
    pub return_volatility: f64,
    #[arg(long, default_value_t = 1.8, help = "Dividend yield in percent")]
    pub dividend_yield: f64,
    #[arg(long, default_value_t = 2.5, help = "Consumption growth in percent")]
    pub consumption_growth: f64,
    #[arg(long, default_value_t = 2.5, help = "Social security COLA in percent")]
    pub social_security_cola: f64,
    #[arg(long, default_value_t = 0.0, help = "Pension COLA in percent")]
    pub pension_cola: f64,
    #[arg(long, default_value_t = 0.0, help = "Wage growth in percent")]
    pub wage_growth: f64,

    #[arg(long, default_value_t = 1_000)]
    pub simulations: u32,
    #[arg(long, default_value_t = 30)]
    pub years: u32,
    #[arg(long, default_value = "CA")]
    pub jurisdiction: String,
    #[arg(long, value_enum, default_value_t = CliFilingStatus::Single)]
    pub filing_status: CliFilingStatus,
    #[arg(long, default_value_t = 2025)]
    pub start_year: u32,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_PERCENTILES)]
    pub percentiles: Vec<f64>,
    #[arg(long, help = "Include per-path, per-year records in the output")]
    pub record_years: bool,

    #[arg(long, value_enum, default_value_t = CliTaxModel::None)]
    pub tax_model: CliTaxModel,
    #[arg(long, help = "Tax service URL for --tax-model http")]
    pub tax_endpoint: Option<String>,
    #[arg(
        long,
        default_value_t = 20.0,
        help = "Flat ordinary income rate in percent"
    )]
    pub flat_ordinary_rate: f64,
    #[arg(
        long,
        default_value_t = 15.0,
        help = "Flat capital gains rate in percent"
    )]
    pub flat_capital_gains_rate: f64,
    #[arg(
        long,
        default_value_t = 85.0,
        help = "Taxable share of social security in percent"
    )]
    pub social_security_taxable_share: f64,

    #[arg(long, value_delimiter = ',', help = "Consumption levels to sweep")]
    pub spending_levels: Vec<f64>,
    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = [90.0, 75.0, 50.0, 25.0, 10.0]
    )]
    pub confidence_levels: Vec<f64>,
    #[arg(
        long,
        help = "Solve for the consumption meeting this success rate (percent)"
    )]
    pub target_success_rate: Option<f64>,
    #[arg(long, default_value_t = 250_000.0)]
    pub search_max: f64,
    #[arg(long, default_value_t = 100.0)]
    pub search_tolerance: f64,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error(transparent)]
    Mortality(#[from] MortalityError),
    #[error(transparent)]
    Tax(#[from] TaxError),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<ConfigError> for ApiError {
    fn from(value: ConfigError) -> Self {
        ApiError::Simulation(value.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Simulation(err) => match err.stage() {
                Stage::Configuration => StatusCode::BAD_REQUEST,
                Stage::TaxBatch => StatusCode::BAD_GATEWAY,
                Stage::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Mortality(_) | ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Tax(_) | ApiError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingAnalysisResponse {
    pub levels: Vec<SpendingLevelResult>,
    pub thresholds: Vec<ConfidenceThreshold>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sustainable: Option<SustainableSpendingResult>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    year: Option<u32>,
}

pub fn build_config(cli: &Cli) -> Result<SimulationConfig, ConfigError> {
    let annuity = (cli.annuity_payment > 0.0).then(|| AnnuityTerms {
        annual_payment: cli.annuity_payment,
        kind: cli.annuity_kind.into(),
        guarantee_years: cli.annuity_guarantee_years,
    });

    let config = SimulationConfig {
        current_age: cli.current_age,
        retirement_age: cli.retirement_age,
        max_age: cli.max_age,
        gender: cli.gender.into(),
        include_mortality: !cli.no_mortality,
        initial_portfolio: cli.initial_portfolio,
        initial_cost_basis: cli.initial_cost_basis,
        annual_consumption: cli.annual_consumption,
        social_security: cli.social_security,
        pension: cli.pension,
        annuity,
        employment_income: cli.employment_income,
        expected_return: cli.expected_return / 100.0,
        return_volatility: cli.return_volatility / 100.0,
        dividend_yield: cli.dividend_yield / 100.0,
        consumption_growth_rate: cli.consumption_growth / 100.0,
        social_security_cola: cli.social_security_cola / 100.0,
        pension_cola: cli.pension_cola / 100.0,
        wage_growth_rate: cli.wage_growth / 100.0,
        simulations: cli.simulations,
        years: cli.years,
        jurisdiction: cli.jurisdiction.clone(),
        filing_status: cli.filing_status.into(),
        start_year: cli.start_year,
        seed: cli.seed,
        percentiles: cli.percentiles.clone(),
        record_years: cli.record_years,
    };
    config.validate()?;
    Ok(config)
}

fn tax_service(cli: &Cli) -> Result<Arc<dyn TaxService>, ApiError> {
    let service: Arc<dyn TaxService> = match cli.tax_model {
        CliTaxModel::None => Arc::new(NoTax),
        CliTaxModel::Flat => Arc::new(FlatRateTax {
            ordinary_rate: cli.flat_ordinary_rate / 100.0,
            capital_gains_rate: cli.flat_capital_gains_rate / 100.0,
            social_security_taxable_share: cli.social_security_taxable_share / 100.0,
        }),
        CliTaxModel::Banded => Arc::new(BandedTax {
            social_security_taxable_share: cli.social_security_taxable_share / 100.0,
            base_tax_year: cli.start_year,
            ..BandedTax::default()
        }),
        CliTaxModel::Http => {
            let Some(endpoint) = cli.tax_endpoint.as_deref() else {
                return Err(ApiError::InvalidRequest(format!(
                    "--tax-model http needs --tax-endpoint or {TAX_ENDPOINT_ENV}"
                )));
            };
            Arc::new(HttpTaxService::new(endpoint)?)
        }
    };
    Ok(service)
}

fn mortality_provider(cli: &Cli) -> Result<Arc<dyn MortalityProvider>, ApiError> {
    let provider: Arc<dyn MortalityProvider> = match cli.mortality_table.as_deref() {
        Some(path) => Arc::new(MortalityTable::from_path(path)?),
        None => Arc::new(GompertzMortality::default()),
    };
    Ok(provider)
}

pub fn build_simulation(cli: &Cli) -> Result<Simulation, ApiError> {
    let config = build_config(cli)?;
    Ok(Simulation::new(config)?
        .with_mortality(mortality_provider(cli)?)
        .with_tax_service(tax_service(cli)?))
}

pub fn simulate(cli: &Cli) -> Result<SimulationResults, ApiError> {
    Ok(build_simulation(cli)?.run()?)
}

pub fn spending_analysis(cli: &Cli) -> Result<SpendingAnalysisResponse, ApiError> {
    let simulation = build_simulation(cli)?;
    let levels = if cli.spending_levels.is_empty() {
        default_spending_levels(cli.annual_consumption)
    } else {
        cli.spending_levels.clone()
    };
    let results = spending_sweep(&simulation, &levels)?;
    let thresholds = confidence_thresholds(&results, &cli.confidence_levels);
    let sustainable = match cli.target_success_rate {
        Some(target) => Some(solve_sustainable_spending(
            &simulation,
            SustainableSpendingConfig {
                target_success_rate: target / 100.0,
                search_min: 0.0,
                search_max: cli.search_max,
                tolerance: cli.search_tolerance,
                max_iterations: 40,
            },
        )?),
        None => None,
    };
    Ok(SpendingAnalysisResponse {
        levels: results,
        thresholds,
        sustainable,
    })
}

/// Seven levels from half to one and a half times the configured consumption.
fn default_spending_levels(annual_consumption: f64) -> Vec<f64> {
    (0..7)
        .map(|i| annual_consumption * (0.5 + f64::from(i) / 6.0))
        .collect()
}

/// Runs one simulation, or a spending analysis when sweep or solve flags are
/// present, and renders the result as pretty JSON.
pub fn run_cli(cli: &Cli) -> Result<String, ApiError> {
    if cli.spending_levels.is_empty() && cli.target_success_rate.is_none() {
        Ok(serde_json::to_string_pretty(&simulate(cli)?)?)
    } else {
        Ok(serde_json::to_string_pretty(&spending_analysis(cli)?)?)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulatePayload {
    current_age: Option<u32>,
    retirement_age: Option<u32>,
    max_age: Option<u32>,
    gender: Option<CliGender>,
    include_mortality: Option<bool>,

    initial_portfolio: Option<f64>,
    initial_cost_basis: Option<f64>,
    annual_consumption: Option<f64>,
    social_security: Option<f64>,
    pension: Option<f64>,
    annuity_payment: Option<f64>,
    annuity_kind: Option<CliAnnuityKind>,
    annuity_guarantee_years: Option<u32>,
    employment_income: Option<f64>,

    expected_return: Option<f64>,
    return_volatility: Option<f64>,
    dividend_yield: Option<f64>,
    consumption_growth: Option<f64>,
    social_security_cola: Option<f64>,
    pension_cola: Option<f64>,
    wage_growth: Option<f64>,

    simulations: Option<u32>,
    years: Option<u32>,
    jurisdiction: Option<String>,
    filing_status: Option<CliFilingStatus>,
    start_year: Option<u32>,
    seed: Option<u64>,
    percentiles: Option<Vec<f64>>,
    record_years: Option<bool>,

    tax_model: Option<CliTaxModel>,
    flat_ordinary_rate: Option<f64>,
    flat_capital_gains_rate: Option<f64>,
    social_security_taxable_share: Option<f64>,

    spending_levels: Option<Vec<f64>>,
    confidence_levels: Option<Vec<f64>>,
    target_success_rate: Option<f64>,
    search_max: Option<f64>,
    search_tolerance: Option<f64>,
}

pub fn default_cli_for_api() -> Cli {
    Cli {
        current_age: 65,
        retirement_age: 65,
        max_age: 100,
        gender: CliGender::Male,
        no_mortality: false,
        mortality_table: None,
        initial_portfolio: 500_000.0,
        initial_cost_basis: None,
        annual_consumption: 60_000.0,
        social_security: 24_000.0,
        pension: 0.0,
        annuity_payment: 0.0,
        annuity_kind: CliAnnuityKind::LifeOnly,
        annuity_guarantee_years: 0,
        employment_income: 0.0,
        expected_return: 7.0,
        return_volatility: 15.0,
        dividend_yield: 1.8,
        consumption_growth: 2.5,
        social_security_cola: 2.5,
        pension_cola: 0.0,
        wage_growth: 0.0,
        simulations: 1_000,
        years: 30,
        jurisdiction: "CA".to_string(),
        filing_status: CliFilingStatus::Single,
        start_year: 2025,
        seed: 42,
        percentiles: DEFAULT_PERCENTILES.to_vec(),
        record_years: false,
        tax_model: CliTaxModel::None,
        tax_endpoint: None,
        flat_ordinary_rate: 20.0,
        flat_capital_gains_rate: 15.0,
        social_security_taxable_share: 85.0,
        spending_levels: Vec::new(),
        confidence_levels: vec![90.0, 75.0, 50.0, 25.0, 10.0],
        target_success_rate: None,
        search_max: 250_000.0,
        search_tolerance: 100.0,
    }
}

/// Overlays `payload` on the API defaults. The tax endpoint is never taken
/// from the request body; the server supplies it from the environment.
pub fn cli_from_payload(
    payload: SimulatePayload,
    tax_endpoint: Option<String>,
) -> Result<Cli, ApiError> {
    let mut cli = default_cli_for_api();

    macro_rules! overlay {
        ($($field:ident),* $(,)?) => {
            $(if let Some(v) = payload.$field {
                cli.$field = v;
            })*
        };
    }
    overlay!(
        current_age,
        retirement_age,
        max_age,
        gender,
        initial_portfolio,
        annual_consumption,
        social_security,
        pension,
        annuity_payment,
        annuity_kind,
        annuity_guarantee_years,
        employment_income,
        expected_return,
        return_volatility,
        dividend_yield,
        consumption_growth,
        social_security_cola,
        pension_cola,
        wage_growth,
        simulations,
        years,
        jurisdiction,
        filing_status,
        start_year,
        seed,
        percentiles,
        record_years,
        tax_model,
        flat_ordinary_rate,
        flat_capital_gains_rate,
        social_security_taxable_share,
        spending_levels,
        confidence_levels,
        search_max,
        search_tolerance,
    );
    if let Some(v) = payload.include_mortality {
        cli.no_mortality = !v;
    }
    if payload.initial_cost_basis.is_some() {
        cli.initial_cost_basis = payload.initial_cost_basis;
    }
    if payload.target_success_rate.is_some() {
        cli.target_success_rate = payload.target_success_rate;
    }

    if cli.tax_model == CliTaxModel::Http {
        if tax_endpoint.is_none() {
            return Err(ApiError::InvalidRequest(format!(
                "taxModel \"http\" is unavailable: {TAX_ENDPOINT_ENV} is not set"
            )));
        }
        cli.tax_endpoint = tax_endpoint;
    }
    Ok(cli)
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router();

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "finsim HTTP API listening");

    axum::serve(listener, app).await
}

fn router() -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/simulate", post(simulate_handler))
        .route("/api/spending-analysis", post(spending_analysis_handler))
        .fallback(not_found_handler)
}

async fn health_handler() -> Response {
    json_response(
        StatusCode::OK,
        serde_json::json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }),
    )
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_handler(Json(payload): Json<SimulatePayload>) -> Response {
    run_blocking(payload, |cli| simulate(&cli)).await
}

async fn spending_analysis_handler(Json(payload): Json<SimulatePayload>) -> Response {
    run_blocking(payload, |cli| spending_analysis(&cli)).await
}

/// Simulations and the blocking tax client run off the async workers.
async fn run_blocking<T, F>(payload: SimulatePayload, job: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(Cli) -> Result<T, ApiError> + Send + 'static,
{
    let cli = match cli_from_payload(payload, env::var(TAX_ENDPOINT_ENV).ok()) {
        Ok(cli) => cli,
        Err(err) => return api_error_response(&err),
    };

    match tokio::task::spawn_blocking(move || job(cli)).await {
        Ok(Ok(body)) => json_response(StatusCode::OK, body),
        Ok(Err(err)) => api_error_response(&err),
        Err(join_err) => {
            error!(error = %join_err, "simulation task panicked");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "simulation task failed")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
            stage: None,
            year: None,
        },
    )
}

fn api_error_response(err: &ApiError) -> Response {
    let status = err.status();
    let (stage, year) = match err {
        ApiError::Simulation(sim) => (Some(sim.stage()), sim.year()),
        _ => (None, None),
    };
    if status.is_server_error() {
        error!(error = %err, ?stage, ?year, "simulation request failed");
    }
    json_response(
        status,
        ErrorResponse {
            error: err.to_string(),
            stage,
            year,
        },
    )
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

    fn sample_cli() -> Cli {
        Cli {
            simulations: 50,
            years: 20,
            ..default_cli_for_api()
        }
    }

    fn payload(json: &str) -> SimulatePayload {
        serde_json::from_str(json).expect("payload should parse")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        serde_json::from_slice(&bytes).expect("body should be json")
    }

    #[test]
    fn clap_defaults_match_api_defaults() {
        let parsed = Cli::try_parse_from(["finsim"]).expect("defaults should parse");
        let defaults = default_cli_for_api();
        assert_eq!(build_config(&parsed).unwrap(), build_config(&defaults).unwrap());
        assert_eq!(parsed.confidence_levels, defaults.confidence_levels);
    }

    #[test]
    fn clap_parses_comma_delimited_levels() {
        let cli = Cli::try_parse_from([
            "finsim",
            "--spending-levels",
            "40000,50000,60000",
            "--percentiles",
            "10,50,90",
            "--tax-model",
            "flat",
            "--no-mortality",
        ])
        .unwrap();
        assert_eq!(cli.spending_levels, vec![40_000.0, 50_000.0, 60_000.0]);
        assert_eq!(cli.percentiles, vec![10.0, 50.0, 90.0]);
        assert_eq!(cli.tax_model, CliTaxModel::Flat);
        assert!(cli.no_mortality);
    }

    #[test]
    fn build_config_converts_percent_inputs() {
        let mut cli = sample_cli();
        cli.expected_return = 6.0;
        cli.return_volatility = 12.5;
        cli.dividend_yield = 2.0;
        cli.pension_cola = 1.5;
        let config = build_config(&cli).unwrap();
        assert_approx(config.expected_return, 0.06);
        assert_approx(config.return_volatility, 0.125);
        assert_approx(config.dividend_yield, 0.02);
        assert_approx(config.pension_cola, 0.015);
        assert!(config.annuity.is_none());
    }

    #[test]
    fn build_config_rejects_invalid_ages() {
        let mut cli = sample_cli();
        cli.retirement_age = 60;
        let err = build_config(&cli).unwrap_err();
        assert!(matches!(err, ConfigError::RetirementBeforeCurrentAge { .. }));
    }

    #[test]
    fn payload_overrides_defaults_with_camel_case_keys() {
        let cli = cli_from_payload(
            payload(
                r#"{
                  "currentAge": 62,
                  "retirementAge": 67,
                  "gender": "female",
                  "includeMortality": false,
                  "initialPortfolio": 750000,
                  "initialCostBasis": 400000,
                  "annuityPayment": 12000,
                  "annuityKind": "fixed-period",
                  "annuityGuaranteeYears": 10,
                  "employmentIncome": 50000,
                  "expectedReturn": 6,
                  "filingStatus": "JOINT",
                  "taxModel": "banded",
                  "simulations": 64,
                  "years": 25
                }"#,
            ),
            None,
        )
        .unwrap();
        let config = build_config(&cli).unwrap();
        assert_eq!(config.current_age, 62);
        assert_eq!(config.retirement_age, 67);
        assert_eq!(config.gender, Gender::Female);
        assert!(!config.include_mortality);
        assert_eq!(config.initial_cost_basis, Some(400_000.0));
        assert_eq!(config.filing_status, FilingStatus::Joint);
        assert_eq!(
            config.annuity.map(|a| a.kind),
            Some(AnnuityKind::FixedPeriod)
        );
        assert_approx(config.expected_return, 0.06);
        assert_eq!(cli.tax_model, CliTaxModel::Banded);
    }

    #[test]
    fn http_tax_model_needs_server_endpoint() {
        let err = cli_from_payload(payload(r#"{"taxModel": "http"}"#), None).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let cli = cli_from_payload(
            payload(r#"{"taxModel": "http"}"#),
            Some("http://127.0.0.1:9/tax".to_string()),
        )
        .unwrap();
        assert_eq!(cli.tax_endpoint.as_deref(), Some("http://127.0.0.1:9/tax"));
    }

    #[test]
    fn simulate_serializes_camel_case_results() {
        let mut cli = sample_cli();
        cli.tax_model = CliTaxModel::Flat;
        cli.no_mortality = true;
        cli.record_years = true;
        cli.simulations = 5;
        cli.years = 3;
        let json = run_cli(&cli).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["successRate"].is_number());
        assert_eq!(value["portfolioPercentiles"][0]["values"].as_array().unwrap().len(), 4);
        assert_eq!(value["annualCashflows"].as_array().unwrap().len(), 3);
        assert_eq!(value["yearRecords"].as_array().unwrap().len(), 5);
        assert!(value["yearRecords"][0][0]["taxAccrued"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn spending_analysis_reports_levels_and_thresholds() {
        let mut cli = sample_cli();
        cli.spending_levels = vec![30_000.0, 60_000.0, 90_000.0];
        let analysis = spending_analysis(&cli).unwrap();
        assert_eq!(analysis.levels.len(), 3);
        assert_eq!(analysis.thresholds.len(), 5);
        assert!(analysis.levels[0].success_rate >= analysis.levels[2].success_rate);
        assert!(analysis.sustainable.is_none());
    }

    #[test]
    fn default_spending_levels_bracket_consumption() {
        let levels = default_spending_levels(60_000.0);
        assert_eq!(levels.len(), 7);
        assert_approx(levels[0], 30_000.0);
        assert_approx(levels[3], 60_000.0);
        assert_approx(levels[6], 90_000.0);
    }

    #[test]
    fn missing_mortality_table_is_a_bad_request() {
        let mut cli = sample_cli();
        cli.mortality_table = Some(PathBuf::from("/nonexistent/mortality.json"));
        let err = simulate(&cli).unwrap_err();
        assert!(matches!(err, ApiError::Mortality(_)));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn error_status_follows_stage() {
        let config: ApiError = ConfigError::NoSimulations.into();
        assert_eq!(config.status(), StatusCode::BAD_REQUEST);

        let tax = ApiError::Simulation(SimulationError::Tax {
            year: 2,
            tax_year: 2026,
            source: TaxError::Transport("refused".to_string()),
        });
        assert_eq!(tax.status(), StatusCode::BAD_GATEWAY);

        let aggregation = ApiError::Simulation(SimulationError::Aggregation("nan".to_string()));
        assert_eq!(aggregation.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = health_handler().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store"
        );
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn simulate_handler_returns_results() {
        let response =
            simulate_handler(Json(payload(r#"{"simulations": 20, "years": 10}"#))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["simulations"], 20);
        assert_eq!(body["years"], 10);
    }

    #[tokio::test]
    async fn simulate_handler_reports_config_stage() {
        let response = simulate_handler(Json(payload(r#"{"simulations": 0}"#))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["stage"], "configuration");
    }

    #[tokio::test]
    async fn overflowing_start_year_is_a_bad_request() {
        let request = format!(r#"{{"startYear": {}, "years": 2}}"#, u32::MAX);
        let response = simulate_handler(Json(payload(&request))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["stage"], "configuration");
    }
}
