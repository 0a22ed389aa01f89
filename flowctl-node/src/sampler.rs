//! Empirical flow-size distribution and Poisson flow arrivals.

use std::{io, path::Path, sync::Arc, time::Duration};

use rand::Rng;
use thiserror::Error;

/// Share of link bandwidth left for payload: a full-size TCP segment carries 1448 bytes
/// of data in 1538 bytes on the wire.
pub const GOODPUT_RATIO: f64 = 1448.0 / 1538.0;

/// Smallest mean interval between two flows of one worker, in microseconds.
pub const MIN_MEAN_INTERVAL_US: f64 = 200.0;

#[derive(Debug, Error)]
pub enum CdfError {
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("Odd number of tokens ({0}): every value needs a cumulative probability")]
    OddTokenCount(usize),
    #[error("Invalid number {0:?}")]
    InvalidNumber(String),
    #[error("Cumulative probability decreases at entry {0}")]
    Descending(usize),
    #[error("Empty table")]
    Empty,
    #[error("Network load must be a positive number of Mbit/s, got {0}")]
    InvalidLoad(f64),
}

/// One point of an empirical CDF.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CdfEntry {
    pub value: f64,
    pub cdf: f64,
}

/// An empirical cumulative distribution, ascending in cumulative probability.
#[derive(Debug, Clone, PartialEq)]
pub struct CdfTable {
    entries: Vec<CdfEntry>,
    min_cdf: f64,
    max_cdf: f64,
}

impl CdfTable {
    /// Builds a table from `(value, cdf)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (f64, f64)>) -> Result<Self, CdfError> {
        let entries: Vec<CdfEntry> =
            pairs.into_iter().map(|(value, cdf)| CdfEntry { value, cdf }).collect();

        if entries.is_empty() {
            return Err(CdfError::Empty);
        }

        if let Some(i) = entries.windows(2).position(|w| w[1].cdf < w[0].cdf) {
            return Err(CdfError::Descending(i + 1));
        }

        let min_cdf = entries[0].cdf;
        let max_cdf = entries[entries.len() - 1].cdf;

        Ok(Self { entries, min_cdf, max_cdf })
    }

    /// Parses whitespace-separated `<value> <cumulative probability>` tokens.
    pub fn parse(text: &str) -> Result<Self, CdfError> {
        let tokens: Vec<&str> = text.split_whitespace().collect();

        if tokens.len() % 2 != 0 {
            return Err(CdfError::OddTokenCount(tokens.len()));
        }

        let number = |token: &str| {
            token.parse::<f64>().ok().filter(|n| n.is_finite()).ok_or_else(|| {
                CdfError::InvalidNumber(token.to_string())
            })
        };

        let pairs = tokens
            .chunks_exact(2)
            .map(|pair| Ok((number(pair[0])?, number(pair[1])?)))
            .collect::<Result<Vec<_>, CdfError>>()?;

        Self::from_pairs(pairs)
    }

    /// Loads a table from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CdfError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn entries(&self) -> &[CdfEntry] {
        &self.entries
    }

    /// The trapezoidal-rule mean of the distribution.
    pub fn average(&self) -> f64 {
        let first = self.entries[0];
        let head = first.value / 2.0 * first.cdf;

        head + self
            .entries
            .windows(2)
            .map(|w| (w[1].value + w[0].value) / 2.0 * (w[1].cdf - w[0].cdf))
            .sum::<f64>()
    }

    /// Returns the value at cumulative probability `x`, interpolating linearly between
    /// the two bracketing entries. Below the first entry, interpolates from `(0, 0)`.
    pub fn value_at(&self, x: f64) -> f64 {
        let first = self.entries[0];
        if x <= first.cdf {
            return interpolate(x, 0.0, 0.0, first.cdf, first.value);
        }

        match self.entries.windows(2).find(|w| x <= w[1].cdf) {
            Some(w) => interpolate(x, w[0].cdf, w[0].value, w[1].cdf, w[1].value),
            None => self.entries[self.entries.len() - 1].value,
        }
    }

    /// Draws a value from the distribution.
    ///
    /// The draw is uniform over the observed cumulative range, so the result always lies
    /// between the first and the last value of the table.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let x = if self.max_cdf > self.min_cdf {
            rng.gen_range(self.min_cdf..=self.max_cdf)
        } else {
            self.min_cdf
        };

        if x <= self.min_cdf {
            return self.entries[0].value;
        }

        self.value_at(x)
    }

    /// Draws a flow size in bytes, rounded to the nearest byte.
    pub fn sample_size<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        self.sample(rng).round().max(0.0) as u64
    }
}

fn interpolate(x: f64, x1: f64, y1: f64, x2: f64, y2: f64) -> f64 {
    if x1 == x2 {
        return (y1 + y2) / 2.0;
    }

    y1 + (x - x1) * (y2 - y1) / (x2 - x1)
}

/// Per-worker sampling state: a shared table plus this worker's arrival process.
#[derive(Debug, Clone)]
pub struct FlowSampler {
    table: Arc<CdfTable>,
    load_mbps: f64,
    /// Arrival rate in flows per microsecond, derived on first use.
    lambda: Option<f64>,
}

impl FlowSampler {
    pub fn new(table: Arc<CdfTable>, load_mbps: f64) -> Result<Self, CdfError> {
        if !(load_mbps.is_finite() && load_mbps > 0.0) {
            return Err(CdfError::InvalidLoad(load_mbps));
        }

        Ok(Self { table, load_mbps, lambda: None })
    }

    pub fn table(&self) -> &CdfTable {
        &self.table
    }

    /// The mean interval between flows, in microseconds.
    ///
    /// Chosen so that flows of the table's average size keep the link at the configured
    /// load, never below [`MIN_MEAN_INTERVAL_US`].
    pub fn mean_interval_us(&self) -> f64 {
        let period_us = self.table.average() * 8.0 / self.load_mbps / GOODPUT_RATIO;
        period_us.max(MIN_MEAN_INTERVAL_US)
    }

    /// Draws an exponentially distributed interval to sleep before the next flow.
    pub fn sample_interval<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let lambda = match self.lambda {
            Some(lambda) => lambda,
            None => {
                let lambda = 1.0 / self.mean_interval_us();
                tracing::debug!(lambda, load_mbps = self.load_mbps, "derived flow arrival rate");
                *self.lambda.insert(lambda)
            }
        };

        // In (0, 1], so the logarithm is finite.
        let u = 1.0 - rng.gen::<f64>();

        Duration::from_secs_f64(-u.ln() / lambda / 1_000_000.0)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    const WEB_SEARCH: &str = "
        6 0
        6 0.15
        13 0.2
        19 0.3
        33 0.4
        53 0.53
        133 0.6
        667 0.7
        1333 0.8
        3333 0.9
        6667 0.97
        20000 1
    ";

    #[test]
    fn sample_stays_within_table() {
        let table = CdfTable::parse(WEB_SEARCH).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..10_000 {
            let v = table.sample(&mut rng);
            assert!((6.0..=20_000.0).contains(&v), "{v}");

            let size = table.sample_size(&mut rng);
            assert!((6..=20_000).contains(&size), "{size}");
        }
    }

    #[test]
    fn sample_bounds_on_random_tables() {
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..200 {
            let len = rng.gen_range(1..10);
            let mut value = rng.gen_range(0.0..100.0);
            let mut cdf: f64 = rng.gen_range(0.0..0.5);
            let mut pairs = Vec::new();
            for _ in 0..len {
                pairs.push((value, cdf));
                value += rng.gen_range(0.0..1_000.0);
                cdf = (cdf + rng.gen_range(0.0..0.2)).min(1.0);
            }

            let table = CdfTable::from_pairs(pairs.clone()).unwrap();
            let (lo, hi) = (pairs[0].0, pairs[len - 1].0);
            for _ in 0..100 {
                let v = table.sample(&mut rng);
                assert!(v >= lo - 1e-9 && v <= hi + 1e-9, "{v} not in [{lo}, {hi}]");
            }
        }
    }

    #[test]
    fn average_of_uniform_is_half() {
        let table = CdfTable::from_pairs([(0.0, 0.0), (1_000.0, 1.0)]).unwrap();
        assert_eq!(table.average(), 500.0);
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(CdfTable::parse("1 0.5 2"), Err(CdfError::OddTokenCount(3))));
        assert!(matches!(CdfTable::parse("1 x"), Err(CdfError::InvalidNumber(_))));
        assert!(matches!(CdfTable::parse("1 0.5 2 0.4"), Err(CdfError::Descending(1))));
        assert!(matches!(CdfTable::parse("  \n"), Err(CdfError::Empty)));
    }

    #[test]
    fn interpolation() {
        let table = CdfTable::from_pairs([(100.0, 0.5), (200.0, 1.0)]).unwrap();

        assert_eq!(table.value_at(0.25), 50.0);
        assert_eq!(table.value_at(0.75), 150.0);
        assert_eq!(table.value_at(2.0), 200.0);

        // Repeated probabilities average their values.
        let steps = CdfTable::from_pairs([(0.0, 0.0), (10.0, 0.5), (30.0, 0.5)]).unwrap();
        assert_eq!(steps.value_at(0.5), 5.0);
    }

    #[test]
    fn interval_mean_follows_load() {
        let table = Arc::new(CdfTable::from_pairs([(0.0, 0.0), (20_000.0, 1.0)]).unwrap());
        let mut sampler = FlowSampler::new(Arc::clone(&table), 10.0).unwrap();

        // 10 kB average at 10 Mbit/s: 8000 us before goodput.
        let expected = 8_000.0 / GOODPUT_RATIO;
        assert!((sampler.mean_interval_us() - expected).abs() < 1e-6);

        let mut rng = StdRng::seed_from_u64(1);
        let n = 20_000;
        let total: f64 =
            (0..n).map(|_| sampler.sample_interval(&mut rng).as_secs_f64() * 1e6).sum();
        let mean = total / n as f64;
        assert!((mean - expected).abs() / expected < 0.05, "{mean} vs {expected}");

        // Very high loads are floored.
        let fast = FlowSampler::new(table, 1e9).unwrap();
        assert_eq!(fast.mean_interval_us(), MIN_MEAN_INTERVAL_US);

        assert!(FlowSampler::new(Arc::new(CdfTable::parse("1 1").unwrap()), 0.0).is_err());
    }
}
