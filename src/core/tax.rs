use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::TaxError;
use super::types::FilingStatus;

/// One household's taxable facts for a single tax year.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxFacts {
    pub capital_gains: f64,
    pub social_security: f64,
    pub pension_income: f64,
    pub wages: f64,
    pub dividends: f64,
    pub age: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBatchRequest {
    pub tax_year: u32,
    pub filing_status: FilingStatus,
    pub jurisdiction: String,
    pub households: Vec<TaxFacts>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBatchResponse {
    pub total_tax: Vec<f64>,
}

pub trait TaxService: Send + Sync {
    fn calculate_batch(&self, request: &TaxBatchRequest) -> Result<TaxBatchResponse, TaxError>;
}

/// Submits one batch per year and checks every household got a usable liability back.
#[derive(Clone)]
pub struct TaxAdapter {
    service: Arc<dyn TaxService>,
}

impl TaxAdapter {
    pub fn new(service: Arc<dyn TaxService>) -> Self {
        Self { service }
    }

    pub fn liabilities(&self, request: &TaxBatchRequest) -> Result<Vec<f64>, TaxError> {
        if request.households.is_empty() {
            return Ok(Vec::new());
        }

        let response = self.service.calculate_batch(request)?;
        if response.total_tax.len() != request.households.len() {
            return Err(TaxError::PartialBatch {
                expected: request.households.len(),
                received: response.total_tax.len(),
            });
        }
        if let Some((index, &value)) = response
            .total_tax
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(TaxError::InvalidLiability { index, value });
        }
        Ok(response.total_tax)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoTax;

impl TaxService for NoTax {
    fn calculate_batch(&self, request: &TaxBatchRequest) -> Result<TaxBatchResponse, TaxError> {
        Ok(TaxBatchResponse {
            total_tax: vec![0.0; request.households.len()],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatRateTax {
    pub ordinary_rate: f64,
    pub capital_gains_rate: f64,
    pub social_security_taxable_share: f64,
}

impl Default for FlatRateTax {
    fn default() -> Self {
        Self {
            ordinary_rate: 0.20,
            capital_gains_rate: 0.15,
            social_security_taxable_share: 0.85,
        }
    }
}

impl FlatRateTax {
    pub fn household_tax(&self, facts: &TaxFacts) -> f64 {
        let ordinary = facts.wages
            + facts.pension_income
            + facts.dividends
            + facts.social_security * self.social_security_taxable_share.clamp(0.0, 1.0);
        ordinary.max(0.0) * self.ordinary_rate.clamp(0.0, 1.0)
            + facts.capital_gains.max(0.0) * self.capital_gains_rate.clamp(0.0, 1.0)
    }
}

impl TaxService for FlatRateTax {
    fn calculate_batch(&self, request: &TaxBatchRequest) -> Result<TaxBatchResponse, TaxError> {
        Ok(TaxBatchResponse {
            total_tax: request
                .households
                .iter()
                .map(|facts| self.household_tax(facts))
                .collect(),
        })
    }
}

/// Personal allowance plus basic/higher/additional bands, with the allowance
/// withdrawn at half the income above the taper start. Thresholds are indexed
/// from `base_tax_year` at `threshold_indexation`.
///
/// The defaults are illustrative UK 2025/26 bands. They ignore the batch's
/// filing status and jurisdiction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandedTax {
    pub personal_allowance: f64,
    pub basic_rate_limit: f64,
    pub higher_rate_limit: f64,
    pub basic_rate: f64,
    pub higher_rate: f64,
    pub additional_rate: f64,
    pub allowance_taper_start: f64,
    pub allowance_taper_end: f64,
    pub capital_gains_rate: f64,
    pub capital_gains_allowance: f64,
    pub social_security_taxable_share: f64,
    pub base_tax_year: u32,
    pub threshold_indexation: f64,
}

impl Default for BandedTax {
    fn default() -> Self {
        Self {
            personal_allowance: 12_570.0,
            basic_rate_limit: 50_270.0,
            higher_rate_limit: 125_140.0,
            basic_rate: 0.20,
            higher_rate: 0.40,
            additional_rate: 0.45,
            allowance_taper_start: 100_000.0,
            allowance_taper_end: 125_140.0,
            capital_gains_rate: 0.20,
            capital_gains_allowance: 3_000.0,
            social_security_taxable_share: 1.0,
            base_tax_year: 2025,
            threshold_indexation: 0.0,
        }
    }
}

impl BandedTax {
    fn index(&self, tax_year: u32) -> f64 {
        let elapsed = tax_year.saturating_sub(self.base_tax_year);
        (1.0 + self.threshold_indexation).powi(elapsed as i32)
    }

    pub fn income_tax(&self, gross_income: f64, tax_year: u32) -> f64 {
        let gross = gross_income.max(0.0);
        let index = self.index(tax_year);

        let taper_start = (self.allowance_taper_start * index).max(0.0);
        let taper_end = (self.allowance_taper_end * index).max(taper_start);

        let mut allowance = (self.personal_allowance * index).max(0.0);
        if gross > taper_start {
            allowance = (allowance - (gross - taper_start) / 2.0).max(0.0);
        }
        if gross >= taper_end {
            allowance = 0.0;
        }

        let taxable_income = (gross - allowance).max(0.0);

        let basic_limit = (self.basic_rate_limit * index).max(0.0);
        let higher_limit = (self.higher_rate_limit * index).max(basic_limit);

        let basic_band_width = (basic_limit - allowance).max(0.0);
        let higher_band_width = (higher_limit - basic_limit).max(0.0);

        let basic_taxable = taxable_income.min(basic_band_width);
        let higher_taxable = (taxable_income - basic_taxable)
            .min(higher_band_width)
            .max(0.0);
        let additional_taxable = (taxable_income - basic_taxable - higher_taxable).max(0.0);

        basic_taxable * self.basic_rate.clamp(0.0, 1.0)
            + higher_taxable * self.higher_rate.clamp(0.0, 1.0)
            + additional_taxable * self.additional_rate.clamp(0.0, 1.0)
    }

    pub fn capital_gains_tax(&self, realized_gain: f64, tax_year: u32) -> f64 {
        let allowance = (self.capital_gains_allowance * self.index(tax_year)).max(0.0);
        let taxable_gain = (realized_gain.max(0.0) - allowance).max(0.0);
        taxable_gain * self.capital_gains_rate.clamp(0.0, 1.0)
    }

    pub fn household_tax(&self, facts: &TaxFacts, tax_year: u32) -> f64 {
        let ordinary = facts.wages
            + facts.pension_income
            + facts.dividends
            + facts.social_security * self.social_security_taxable_share.clamp(0.0, 1.0);
        self.income_tax(ordinary, tax_year) + self.capital_gains_tax(facts.capital_gains, tax_year)
    }
}

impl TaxService for BandedTax {
    fn calculate_batch(&self, request: &TaxBatchRequest) -> Result<TaxBatchResponse, TaxError> {
        Ok(TaxBatchResponse {
            total_tax: request
                .households
                .iter()
                .map(|facts| self.household_tax(facts, request.tax_year))
                .collect(),
        })
    }
}
