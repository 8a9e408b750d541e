use super::error::ConfigError;
use super::types::SimulationConfig;

/// Per-year income and spending amounts, already escalated. Index 0 is simulation year 1.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedStreams {
    consumption: Vec<f64>,
    social_security: Vec<f64>,
    pension: Vec<f64>,
    wages: Vec<f64>,
}

fn escalate(base: f64, growth: f64, years: usize) -> Vec<f64> {
    (0..years)
        .map(|i| base * (1.0 + growth).powi(i as i32))
        .collect()
}

fn check_stream(stream: &'static str, values: &[f64], years: usize) -> Result<(), ConfigError> {
    if values.len() != years {
        return Err(ConfigError::StreamLength {
            stream,
            expected: years,
            actual: values.len(),
        });
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ConfigError::NonFinite { field: stream });
    }
    if let Some(&value) = values.iter().find(|v| **v < 0.0) {
        return Err(ConfigError::NegativeAmount {
            field: stream,
            value,
        });
    }
    Ok(())
}

impl IndexedStreams {
    /// Escalates each base amount at its configured rate: `base * (1 + g)^(t - 1)`.
    pub fn from_config(config: &SimulationConfig) -> Self {
        let years = config.years as usize;
        Self {
            consumption: escalate(
                config.annual_consumption,
                config.consumption_growth_rate,
                years,
            ),
            social_security: escalate(config.social_security, config.social_security_cola, years),
            pension: escalate(config.pension, config.pension_cola, years),
            wages: escalate(config.employment_income, config.wage_growth_rate, years),
        }
    }

    pub fn new(
        years: usize,
        consumption: Vec<f64>,
        social_security: Vec<f64>,
        pension: Vec<f64>,
        wages: Vec<f64>,
    ) -> Result<Self, ConfigError> {
        check_stream("consumption", &consumption, years)?;
        check_stream("social_security", &social_security, years)?;
        check_stream("pension", &pension, years)?;
        check_stream("wages", &wages, years)?;
        Ok(Self {
            consumption,
            social_security,
            pension,
            wages,
        })
    }

    /// Same streams with consumption rebased to `annual_consumption`, grown at `growth`.
    pub fn with_consumption(&self, annual_consumption: f64, growth: f64) -> Self {
        Self {
            consumption: escalate(annual_consumption, growth, self.consumption.len()),
            ..self.clone()
        }
    }

    pub fn years(&self) -> usize {
        self.consumption.len()
    }

    pub fn consumption(&self, year: u32) -> f64 {
        self.consumption[year as usize - 1]
    }

    pub fn social_security(&self, year: u32) -> f64 {
        self.social_security[year as usize - 1]
    }

    pub fn pension(&self, year: u32) -> f64 {
        self.pension[year as usize - 1]
    }

    pub fn wages(&self, year: u32) -> f64 {
        self.wages[year as usize - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn first_year_is_unescalated() {
        let config = SimulationConfig {
            annual_consumption: 50_000.0,
            consumption_growth_rate: 0.03,
            social_security: 20_000.0,
            social_security_cola: 0.02,
            pension: 10_000.0,
            pension_cola: 0.0,
            years: 10,
            ..SimulationConfig::default()
        };
        let streams = IndexedStreams::from_config(&config);
        assert_eq!(streams.years(), 10);
        assert_approx(streams.consumption(1), 50_000.0);
        assert_approx(streams.consumption(2), 51_500.0);
        assert_approx(streams.consumption(3), 50_000.0 * 1.03 * 1.03);
        assert_approx(streams.social_security(2), 20_400.0);
        assert_approx(streams.pension(10), 10_000.0);
    }

    #[test]
    fn explicit_streams_must_cover_horizon() {
        let err = IndexedStreams::new(3, vec![1.0; 3], vec![0.0; 2], vec![0.0; 3], vec![0.0; 3])
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::StreamLength {
                stream: "social_security",
                expected: 3,
                actual: 2
            }
        );

        let err = IndexedStreams::new(1, vec![-5.0], vec![0.0], vec![0.0], vec![0.0]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::NegativeAmount {
                field: "consumption",
                ..
            }
        ));
    }

    #[test]
    fn with_consumption_keeps_income_streams() {
        let config = SimulationConfig {
            years: 5,
            ..SimulationConfig::default()
        };
        let base = IndexedStreams::from_config(&config);
        let rebased = base.with_consumption(40_000.0, 0.0);
        assert_approx(rebased.consumption(5), 40_000.0);
        assert_approx(rebased.social_security(5), base.social_security(5));
    }
}
