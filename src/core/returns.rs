use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use super::error::ReturnError;

pub const FAT_TAIL_PROBABILITY: f64 = 0.02;
pub const FAT_TAIL_MIN_SIGMA: f64 = 2.5;
pub const FAT_TAIL_MAX_SIGMA: f64 = 3.5;
pub const SIGMA_CAP: f64 = 4.0;

/// Dense `paths x years` grid of growth factors, row-major by path.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnMatrix {
    paths: usize,
    years: usize,
    factors: Vec<f64>,
}

impl ReturnMatrix {
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, ReturnError> {
        let paths = rows.len();
        let years = rows.first().map(Vec::len).unwrap_or(0);
        if paths == 0 || years == 0 {
            return Err(ReturnError::EmptyShape { paths, years });
        }

        let mut factors = Vec::with_capacity(paths * years);
        for (path, row) in rows.into_iter().enumerate() {
            if row.len() != years {
                return Err(ReturnError::RaggedRow {
                    path,
                    expected: years,
                    actual: row.len(),
                });
            }
            factors.extend(row);
        }

        let matrix = Self {
            paths,
            years,
            factors,
        };
        matrix.check_factors()?;
        Ok(matrix)
    }

    /// Every path sees the same factor every year.
    pub fn constant(paths: usize, years: usize, factor: f64) -> Result<Self, ReturnError> {
        if paths == 0 || years == 0 {
            return Err(ReturnError::EmptyShape { paths, years });
        }
        let matrix = Self {
            paths,
            years,
            factors: vec![factor; paths * years],
        };
        matrix.check_factors()?;
        Ok(matrix)
    }

    /// Every path sees the same year-by-year series.
    pub fn repeated(paths: usize, series: &[f64]) -> Result<Self, ReturnError> {
        Self::from_rows(vec![series.to_vec(); paths])
    }

    pub fn paths(&self) -> usize {
        self.paths
    }

    pub fn years(&self) -> usize {
        self.years
    }

    /// Growth factor for `path` in simulation year `year` (0-based column).
    pub fn get(&self, path: usize, year: usize) -> f64 {
        self.factors[path * self.years + year]
    }

    pub fn row(&self, path: usize) -> &[f64] {
        let start = path * self.years;
        &self.factors[start..start + self.years]
    }

    pub fn values(&self) -> &[f64] {
        &self.factors
    }

    fn check_factors(&self) -> Result<(), ReturnError> {
        for (i, value) in self.factors.iter().copied().enumerate() {
            if !value.is_finite() || value <= 0.0 {
                return Err(ReturnError::NonPositiveFactor {
                    path: i / self.years,
                    year: i % self.years,
                    value,
                });
            }
        }
        Ok(())
    }
}

pub trait ReturnSource: Send + Sync {
    fn generate(&self, paths: usize, years: usize) -> Result<ReturnMatrix, ReturnError>;
}

impl ReturnSource for ReturnMatrix {
    fn generate(&self, paths: usize, years: usize) -> Result<ReturnMatrix, ReturnError> {
        if self.paths != paths || self.years != years {
            return Err(ReturnError::ShapeMismatch {
                paths,
                years,
                actual_paths: self.paths,
                actual_years: self.years,
            });
        }
        Ok(self.clone())
    }
}

/// Normal annual returns with occasional 2.5 to 3.5 sigma shocks, capped at 4 sigma.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FatTailReturnGenerator {
    expected_return: f64,
    volatility: f64,
    seed: u64,
}

impl FatTailReturnGenerator {
    pub fn new(expected_return: f64, volatility: f64, seed: u64) -> Result<Self, ReturnError> {
        if !expected_return.is_finite() || !volatility.is_finite() {
            return Err(ReturnError::NonFiniteParameter);
        }
        if volatility < 0.0 {
            return Err(ReturnError::NegativeVolatility(volatility));
        }
        let floor = 1.0 + expected_return - SIGMA_CAP * volatility;
        if floor <= 0.0 {
            return Err(ReturnError::FactorFloorNotPositive {
                mu: expected_return,
                sigma: volatility,
                floor,
            });
        }
        Ok(Self {
            expected_return,
            volatility,
            seed,
        })
    }

    pub fn expected_return(&self) -> f64 {
        self.expected_return
    }

    pub fn volatility(&self) -> f64 {
        self.volatility
    }

    fn path_rng(&self, path: usize) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(path as u64);
        rng
    }
}

/// One standardized shock: a normal draw, replaced by a fat-tail move with
/// probability [`FAT_TAIL_PROBABILITY`], then capped to `[-SIGMA_CAP, SIGMA_CAP]`.
pub fn draw_shock<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let mut z: f64 = rng.sample(StandardNormal);
    if rng.random::<f64>() < FAT_TAIL_PROBABILITY {
        let magnitude = rng.random_range(FAT_TAIL_MIN_SIGMA..FAT_TAIL_MAX_SIGMA);
        let negative = if z == 0.0 {
            rng.random_bool(0.5)
        } else {
            z < 0.0
        };
        z = if negative { -magnitude } else { magnitude };
    }
    z.clamp(-SIGMA_CAP, SIGMA_CAP)
}

impl ReturnSource for FatTailReturnGenerator {
    fn generate(&self, paths: usize, years: usize) -> Result<ReturnMatrix, ReturnError> {
        if paths == 0 || years == 0 {
            return Err(ReturnError::EmptyShape { paths, years });
        }

        let mut factors = vec![0.0; paths * years];
        factors
            .par_chunks_mut(years)
            .enumerate()
            .for_each(|(path, row)| {
                let mut rng = self.path_rng(path);
                for cell in row.iter_mut() {
                    *cell = 1.0 + self.expected_return + self.volatility * draw_shock(&mut rng);
                }
            });

        Ok(ReturnMatrix {
            paths,
            years,
            factors,
        })
    }
}
