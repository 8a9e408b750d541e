use serde::{Deserialize, Serialize};

use super::error::ConfigError;

pub const DEFAULT_PERCENTILES: [f64; 7] = [5.0, 10.0, 25.0, 50.0, 75.0, 90.0, 95.0];

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    #[serde(alias = "Male", alias = "MALE")]
    Male,
    #[serde(alias = "Female", alias = "FEMALE")]
    Female,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilingStatus {
    Single,
    Joint,
    Separate,
    HeadOfHousehold,
    Widow,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnnuityKind {
    LifeOnly,
    /// Pays for life. The guarantee only covers beneficiaries after death,
    /// and dead paths are frozen, so `guarantee_years` never changes a payment.
    LifeWithGuarantee,
    /// Pays for `guarantee_years` and then stops, alive or not.
    FixedPeriod,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnuityTerms {
    pub annual_payment: f64,
    pub kind: AnnuityKind,
    pub guarantee_years: u32,
}

impl AnnuityTerms {
    /// Payment due in simulation year `year` (1-based) to a living annuitant.
    pub fn payment_for_year(&self, year: u32) -> f64 {
        match self.kind {
            AnnuityKind::LifeOnly | AnnuityKind::LifeWithGuarantee => self.annual_payment,
            AnnuityKind::FixedPeriod if year <= self.guarantee_years => self.annual_payment,
            AnnuityKind::FixedPeriod => 0.0,
        }
    }
}

/// All monetary amounts are annual and in today's money; rates are fractions
/// (0.07 = 7%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    pub current_age: u32,
    pub retirement_age: u32,
    pub max_age: u32,
    pub gender: Gender,
    pub include_mortality: bool,

    pub initial_portfolio: f64,
    pub initial_cost_basis: Option<f64>,
    pub annual_consumption: f64,
    pub social_security: f64,
    pub pension: f64,
    pub annuity: Option<AnnuityTerms>,
    pub employment_income: f64,

    pub expected_return: f64,
    pub return_volatility: f64,
    pub dividend_yield: f64,

    pub consumption_growth_rate: f64,
    pub social_security_cola: f64,
    pub pension_cola: f64,
    pub wage_growth_rate: f64,

    pub simulations: u32,
    pub years: u32,
    pub jurisdiction: String,
    pub filing_status: FilingStatus,
    pub start_year: u32,
    pub seed: u64,
    pub percentiles: Vec<f64>,
    pub record_years: bool,
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.current_age >= self.max_age {
            return Err(ConfigError::CurrentAgeNotBelowMaxAge {
                current_age: self.current_age,
                max_age: self.max_age,
            });
        }
        if self.retirement_age < self.current_age {
            return Err(ConfigError::RetirementBeforeCurrentAge {
                retirement_age: self.retirement_age,
                current_age: self.current_age,
            });
        }
        if self.simulations == 0 {
            return Err(ConfigError::NoSimulations);
        }
        if self.years == 0 {
            return Err(ConfigError::NoYears);
        }
        if self
            .current_age
            .checked_add(self.years)
            .is_none_or(|end_age| end_age > self.max_age)
        {
            return Err(ConfigError::HorizonPastMaxAge {
                current_age: self.current_age,
                years: self.years,
                max_age: self.max_age,
            });
        }
        if self.start_year.checked_add(self.years - 1).is_none() {
            return Err(ConfigError::TaxYearOverflow {
                start_year: self.start_year,
                years: self.years,
            });
        }

        for (field, value) in [
            ("expected_return", self.expected_return),
            ("return_volatility", self.return_volatility),
            ("dividend_yield", self.dividend_yield),
            ("consumption_growth_rate", self.consumption_growth_rate),
            ("social_security_cola", self.social_security_cola),
            ("pension_cola", self.pension_cola),
            ("wage_growth_rate", self.wage_growth_rate),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NonFinite { field });
            }
        }

        let annuity_payment = self.annuity.map(|a| a.annual_payment).unwrap_or(0.0);
        for (field, value) in [
            ("initial_portfolio", self.initial_portfolio),
            ("initial_cost_basis", self.initial_cost_basis.unwrap_or(0.0)),
            ("annual_consumption", self.annual_consumption),
            ("social_security", self.social_security),
            ("pension", self.pension),
            ("annuity_payment", annuity_payment),
            ("employment_income", self.employment_income),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NonFinite { field });
            }
            if value < 0.0 {
                return Err(ConfigError::NegativeAmount { field, value });
            }
        }

        if self.return_volatility < 0.0 {
            return Err(ConfigError::NegativeVolatility(self.return_volatility));
        }
        if 1.0 + self.expected_return - 4.0 * self.return_volatility <= 0.0 {
            return Err(ConfigError::VolatilityTooHigh {
                expected_return: self.expected_return,
                volatility: self.return_volatility,
            });
        }
        if !(0.0..1.0).contains(&self.dividend_yield) {
            return Err(ConfigError::DividendYieldOutOfRange(self.dividend_yield));
        }
        if let Some(p) = self
            .percentiles
            .iter()
            .copied()
            .find(|p| !(0.0..=100.0).contains(p))
        {
            return Err(ConfigError::InvalidPercentile(p));
        }

        Ok(())
    }

    pub fn cost_basis(&self) -> f64 {
        self.initial_cost_basis.unwrap_or(self.initial_portfolio)
    }

    pub fn annuity_payment_for_year(&self, year: u32) -> f64 {
        self.annuity
            .map(|terms| terms.payment_for_year(year))
            .unwrap_or(0.0)
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            current_age: 65,
            retirement_age: 65,
            max_age: 100,
            gender: Gender::Male,
            include_mortality: true,
            initial_portfolio: 500_000.0,
            initial_cost_basis: None,
            annual_consumption: 60_000.0,
            social_security: 24_000.0,
            pension: 0.0,
            annuity: None,
            employment_income: 0.0,
            expected_return: 0.07,
            return_volatility: 0.15,
            dividend_yield: 0.018,
            consumption_growth_rate: 0.025,
            social_security_cola: 0.025,
            pension_cola: 0.0,
            wage_growth_rate: 0.0,
            simulations: 1_000,
            years: 30,
            jurisdiction: "CA".to_string(),
            filing_status: FilingStatus::Single,
            start_year: 2025,
            seed: 42,
            percentiles: DEFAULT_PERCENTILES.to_vec(),
            record_years: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearRecord {
    pub year: u32,
    pub age: u32,
    pub alive: bool,
    pub growth_factor: f64,
    pub dividends: f64,
    pub guaranteed_income: f64,
    pub withdrawal: f64,
    pub shortfall: f64,
    pub realized_gains: f64,
    pub tax_paid: f64,
    pub tax_accrued: f64,
    pub cost_basis: f64,
    pub portfolio_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileValue {
    pub percentile: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionSummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub percentiles: Vec<PercentileValue>,
}

/// `values[0]` is the starting portfolio, `values[t]` the value at the end of year `t`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileSeries {
    pub percentile: f64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureYearCount {
    pub year: u32,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnualCashflow {
    pub year: u32,
    pub age: u32,
    pub alive_paths: usize,
    pub solvent_paths: usize,
    pub total_withdrawals: f64,
    pub total_shortfall: f64,
    pub total_dividends: f64,
    pub total_guaranteed_income: f64,
    pub total_realized_gains: f64,
    pub total_taxes_paid: f64,
    pub total_taxes_accrued: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResults {
    pub simulations: usize,
    pub years: u32,
    pub success_rate: f64,
    pub survival_rate: f64,
    pub portfolio_percentiles: Vec<PercentileSeries>,
    pub final_value: DistributionSummary,
    pub failure_years: Vec<FailureYearCount>,
    pub depletion_probability_by_year: Vec<f64>,
    pub median_failure_year: Option<f64>,
    pub estate_at_death: Option<DistributionSummary>,
    pub lifetime_taxes: DistributionSummary,
    pub lifetime_withdrawals: DistributionSummary,
    pub total_taxes: f64,
    pub total_withdrawals: f64,
    pub annual_cashflows: Vec<AnnualCashflow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year_records: Option<Vec<Vec<YearRecord>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SimulationConfig::default()
            .validate()
            .expect("default config should validate");
    }

    #[test]
    fn validate_rejects_age_ordering_errors() {
        let mut config = SimulationConfig::default();
        config.current_age = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CurrentAgeNotBelowMaxAge { .. })
        ));

        let mut config = SimulationConfig::default();
        config.current_age = 60;
        config.retirement_age = 55;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RetirementBeforeCurrentAge { .. })
        ));

        let mut config = SimulationConfig::default();
        config.years = 40;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HorizonPastMaxAge { .. })
        ));
    }

    #[test]
    fn validate_rejects_overflowing_horizons() {
        let mut config = SimulationConfig::default();
        config.years = u32::MAX - 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HorizonPastMaxAge { .. })
        ));

        let mut config = SimulationConfig::default();
        config.years = 2;
        config.start_year = u32::MAX;
        assert_eq!(
            config.validate(),
            Err(ConfigError::TaxYearOverflow {
                start_year: u32::MAX,
                years: 2
            })
        );

        config.years = 1;
        config.validate().expect("a one-year run ends in the start year");
    }

    #[test]
    fn validate_rejects_counts_and_volatility() {
        let mut config = SimulationConfig::default();
        config.simulations = 0;
        assert_eq!(config.validate(), Err(ConfigError::NoSimulations));

        let mut config = SimulationConfig::default();
        config.years = 0;
        assert_eq!(config.validate(), Err(ConfigError::NoYears));

        let mut config = SimulationConfig::default();
        config.return_volatility = -0.01;
        assert_eq!(config.validate(), Err(ConfigError::NegativeVolatility(-0.01)));

        let mut config = SimulationConfig::default();
        config.return_volatility = 0.30;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::VolatilityTooHigh { .. })
        ));
    }

    #[test]
    fn validate_rejects_negative_amounts_and_bad_percentiles() {
        let mut config = SimulationConfig::default();
        config.pension = -1.0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NegativeAmount {
                field: "pension",
                value: -1.0
            })
        );

        let mut config = SimulationConfig::default();
        config.percentiles = vec![50.0, 101.0];
        assert_eq!(config.validate(), Err(ConfigError::InvalidPercentile(101.0)));

        let mut config = SimulationConfig::default();
        config.expected_return = f64::NAN;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NonFinite {
                field: "expected_return"
            })
        );
    }

    #[test]
    fn cost_basis_defaults_to_initial_portfolio() {
        let mut config = SimulationConfig::default();
        assert_eq!(config.cost_basis(), 500_000.0);
        config.initial_cost_basis = Some(300_000.0);
        assert_eq!(config.cost_basis(), 300_000.0);
    }

    #[test]
    fn fixed_period_annuity_stops_after_guarantee() {
        let terms = AnnuityTerms {
            annual_payment: 12_000.0,
            kind: AnnuityKind::FixedPeriod,
            guarantee_years: 10,
        };
        assert_eq!(terms.payment_for_year(10), 12_000.0);
        assert_eq!(terms.payment_for_year(11), 0.0);

        let life = AnnuityTerms {
            kind: AnnuityKind::LifeOnly,
            ..terms
        };
        assert_eq!(life.payment_for_year(30), 12_000.0);
    }

    #[test]
    fn guaranteed_life_annuity_pays_like_life_only_while_alive() {
        let guaranteed = AnnuityTerms {
            annual_payment: 9_000.0,
            kind: AnnuityKind::LifeWithGuarantee,
            guarantee_years: 5,
        };
        let life = AnnuityTerms {
            kind: AnnuityKind::LifeOnly,
            ..guaranteed
        };
        for year in [1, 5, 6, 30] {
            assert_eq!(
                guaranteed.payment_for_year(year),
                life.payment_for_year(year)
            );
        }
    }

    #[test]
    fn config_round_trips_through_camel_case_json() {
        let config = SimulationConfig::default();
        let json = serde_json::to_string(&config).expect("config should serialize");
        assert!(json.contains("\"initialPortfolio\""));
        assert!(json.contains("\"filingStatus\":\"SINGLE\""));
        let back: SimulationConfig = serde_json::from_str(&json).expect("config should parse");
        assert_eq!(back, config);
    }
}
