use std::collections::BTreeMap;
use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::Deserialize;

use super::error::MortalityError;
use super::types::Gender;

/// Ages from which tabulated death rates must not decrease.
pub const MONOTONE_FROM_AGE: u32 = 65;

const MORTALITY_SEED_SALT: u64 = 0x9E37_79B9_7F4A_7C15;

pub trait MortalityProvider: Send + Sync {
    /// Probability of dying within the year while aged `age`.
    fn probability_of_death(&self, age: u32, gender: Gender) -> f64;

    /// Cumulative survival from `start_age` to each age up to `end_age`; the first entry is 1.
    fn survival_curve(&self, start_age: u32, end_age: u32, gender: Gender) -> Vec<f64> {
        let mut survival = 1.0;
        (start_age..=end_age)
            .map(|age| {
                if age > start_age {
                    survival *= 1.0 - self.probability_of_death(age - 1, gender).clamp(0.0, 1.0);
                }
                survival
            })
            .collect()
    }

    fn life_expectancy(&self, age: u32, gender: Gender, max_age: u32) -> f64 {
        self.survival_curve(age, max_age.max(age), gender)
            .iter()
            .skip(1)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MortalityTable {
    male: Vec<(u32, f64)>,
    female: Vec<(u32, f64)>,
}

#[derive(Deserialize)]
struct MortalityTableFile {
    male: BTreeMap<String, f64>,
    female: BTreeMap<String, f64>,
}

impl MortalityTable {
    pub fn new(
        male: BTreeMap<u32, f64>,
        female: BTreeMap<u32, f64>,
    ) -> Result<Self, MortalityError> {
        let male = Self::checked_rates("male", male)?;
        let female = Self::checked_rates("female", female)?;
        Ok(Self { male, female })
    }

    /// Reads `{"male": {"65": 0.0127, ...}, "female": {...}}`.
    pub fn from_json(json: &str) -> Result<Self, MortalityError> {
        let file: MortalityTableFile = serde_json::from_str(json)
            .map_err(|err| MortalityError::InvalidTable(err.to_string()))?;
        Self::new(parse_ages(file.male)?, parse_ages(file.female)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, MortalityError> {
        let json = std::fs::read_to_string(path).map_err(|err| {
            MortalityError::InvalidTable(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json(&json)
    }

    fn checked_rates(
        label: &str,
        rates: BTreeMap<u32, f64>,
    ) -> Result<Vec<(u32, f64)>, MortalityError> {
        if rates.is_empty() {
            return Err(MortalityError::InvalidTable(format!(
                "{label} table has no entries"
            )));
        }
        let rates: Vec<(u32, f64)> = rates.into_iter().collect();
        for &(age, q) in &rates {
            if !q.is_finite() || !(0.0..=1.0).contains(&q) {
                return Err(MortalityError::InvalidTable(format!(
                    "{label} rate at age {age} must be in [0, 1], got {q}"
                )));
            }
        }
        for pair in rates.windows(2) {
            let ((_, q0), (age, q1)) = (pair[0], pair[1]);
            if pair[0].0 >= MONOTONE_FROM_AGE && q1 < q0 {
                return Err(MortalityError::InvalidTable(format!(
                    "{label} rates decrease at age {age} ({q0} -> {q1})"
                )));
            }
        }
        Ok(rates)
    }

    fn rates(&self, gender: Gender) -> &[(u32, f64)] {
        match gender {
            Gender::Male => &self.male,
            Gender::Female => &self.female,
        }
    }
}

fn parse_ages(raw: BTreeMap<String, f64>) -> Result<BTreeMap<u32, f64>, MortalityError> {
    raw.into_iter()
        .map(|(age, q)| {
            age.trim()
                .parse::<u32>()
                .map(|age| (age, q))
                .map_err(|_| {
                    MortalityError::InvalidTable(format!("age key {age:?} is not an integer"))
                })
        })
        .collect()
}

impl MortalityProvider for MortalityTable {
    fn probability_of_death(&self, age: u32, gender: Gender) -> f64 {
        let rates = self.rates(gender);
        let (Some(&(first_age, _)), Some(&(last_age, last_q))) = (rates.first(), rates.last())
        else {
            return 0.0;
        };
        if age < first_age {
            return 0.0;
        }
        if age >= last_age {
            return last_q;
        }

        let upper = rates.partition_point(|&(a, _)| a <= age);
        let (a0, q0) = rates[upper - 1];
        if a0 == age {
            return q0;
        }
        let (a1, q1) = rates[upper];
        let weight = f64::from(age - a0) / f64::from(a1 - a0);
        q0 + (q1 - q0) * weight
    }
}

/// Gompertz hazard `mu(x) = exp((x - m) / b) / b`, integrated over one year of age.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GompertzMortality {
    pub modal_age_male: f64,
    pub modal_age_female: f64,
    pub dispersion: f64,
}

impl Default for GompertzMortality {
    fn default() -> Self {
        Self {
            modal_age_male: 86.0,
            modal_age_female: 90.0,
            dispersion: 10.0,
        }
    }
}

impl MortalityProvider for GompertzMortality {
    fn probability_of_death(&self, age: u32, gender: Gender) -> f64 {
        let modal = match gender {
            Gender::Male => self.modal_age_male,
            Gender::Female => self.modal_age_female,
        };
        let b = self.dispersion;
        let cumulative = ((f64::from(age) - modal) / b).exp() * ((1.0 / b).exp() - 1.0);
        (1.0 - (-cumulative).exp()).clamp(0.0, 1.0)
    }
}

/// Pre-drawn uniforms, one per path per year, on streams independent of the return generator.
#[derive(Debug, Clone)]
pub struct MortalityGate {
    years: usize,
    draws: Vec<f64>,
}

impl MortalityGate {
    pub fn draw(paths: usize, years: usize, seed: u64) -> Self {
        let mut draws = vec![0.0; paths * years];
        if years > 0 {
            draws
                .par_chunks_mut(years)
                .enumerate()
                .for_each(|(path, row)| {
                    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ MORTALITY_SEED_SALT);
                    rng.set_stream(path as u64);
                    for cell in row.iter_mut() {
                        *cell = rng.random::<f64>();
                    }
                });
        }
        Self { years, draws }
    }

    /// Uniform draw for `path` in simulation year `year` (1-based).
    pub fn draw_for(&self, path: usize, year: u32) -> f64 {
        self.draws[path * self.years + (year as usize - 1)]
    }

    pub fn dies(&self, path: usize, year: u32, probability: f64) -> bool {
        self.draw_for(path, year) < probability
    }
}

/// Looks up the death probability and rejects anything outside `[0, 1]`.
pub fn checked_probability(
    provider: &dyn MortalityProvider,
    age: u32,
    gender: Gender,
) -> Result<f64, MortalityError> {
    let probability = provider.probability_of_death(age, gender);
    if probability.is_finite() && (0.0..=1.0).contains(&probability) {
        Ok(probability)
    } else {
        Err(MortalityError::ProbabilityOutOfRange {
            age,
            gender,
            probability,
        })
    }
}
