//! Skewed target selection.
//!
//! A [`Distribution`] places a truncated normal curve over the *relative* position in the ordered
//! table list: `mean = 0.3` means "most traffic hits tables around 30% into the list", no matter
//! how many tables there are. [`WeightedSampler`] draws positions from that curve with rejection
//! sampling against `[0, 1]` and scales them into indices.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Deserialize;

/// Maximum number of normal draws before a sample gives up.
pub const MAX_ATTEMPTS: usize = 100_000;

/// The position used when no draw lands in `[0, 1]` within [`MAX_ATTEMPTS`]. It maps to index 0.
pub const FALLBACK_POSITION: f64 = 0.0;

/// One homogeneous group of workers and the access profile they share.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Distribution {
    /// Number of workers in this group.
    pub count: usize,
    /// Center of the profile, as a fraction of the table list.
    pub mean: f64,
    /// Spread of the profile; the standard deviation is its square root.
    pub variance: f64,
}

/// Seed of a worker, derived from the base seed, its group and its global worker id.
///
/// Reader groups use an offset of `(group + 1) * 1000`, writer groups `(group + 1) * 2000`.
pub fn worker_seed(base: u64, group_offset: u64, group: usize, worker: usize) -> u64 {
    base.wrapping_add((group as u64 + 1).wrapping_mul(group_offset))
        .wrapping_add(worker as u64)
}

/// A per-worker sampler. Not shared: every worker builds its own from its own seed.
#[derive(Debug)]
pub struct WeightedSampler {
    rng: StdRng,
    mean: f64,
    stddev: f64,
    exhausted: u64,
}

impl WeightedSampler {
    pub fn new(dist: &Distribution, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            mean: dist.mean,
            stddev: dist.variance.max(0.0).sqrt(),
            exhausted: 0,
        }
    }

    /// Draw a position in `[0, 1]`, or `None` if every attempt fell outside of it.
    fn draw(&mut self) -> Option<f64> {
        // a zero spread makes every draw identical, no point in retrying
        let attempts = if self.stddev > 0.0 { MAX_ATTEMPTS } else { 1 };
        for _ in 0..attempts {
            let z: f64 = self.rng.sample(StandardNormal);
            let v = z * self.stddev + self.mean;
            if (0.0..=1.0).contains(&v) {
                return Some(v);
            }
        }
        None
    }

    /// Pick the index of the next target among `n` targets. `n` must be at least 1.
    pub fn sample(&mut self, n: usize) -> usize {
        assert!(n > 0, "cannot sample from an empty target list");
        let v = match self.draw() {
            Some(v) => v,
            None => {
                self.exhausted += 1;
                if self.exhausted == 1 {
                    log::debug!(
                        "sampler exhausted {} attempts (mean {}, stddev {}), using fallback",
                        MAX_ATTEMPTS,
                        self.mean,
                        self.stddev
                    );
                }
                FALLBACK_POSITION
            }
        };
        let idx = (v * n as f64).floor();
        if idx < 0.0 {
            0
        } else {
            (idx as usize).min(n - 1)
        }
    }

    /// How many samples fell back to [`FALLBACK_POSITION`] so far.
    pub fn exhausted(&self) -> u64 {
        self.exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    fn dist(mean: f64, variance: f64) -> Distribution {
        Distribution {
            count: 1,
            mean,
            variance,
        }
    }

    #[test]
    fn index_always_in_range() {
        let cases = [
            (0.0, 0.0),
            (1.0, 0.0),
            (0.0, 0.5),
            (1.0, 0.5),
            (0.5, 10.0),
            (0.3, 0.0278),
        ];
        for (mean, variance) in cases {
            for n in [1, 2, 7, 40, 1000] {
                let mut s = WeightedSampler::new(&dist(mean, variance), 7);
                for _ in 0..2000 {
                    let idx = s.sample(n);
                    assert!(idx < n, "mean {} variance {} n {}: {}", mean, variance, n, idx);
                }
            }
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let d = dist(0.3, 0.0278);
        let mut a = WeightedSampler::new(&d, 42);
        let mut b = WeightedSampler::new(&d, 42);
        let sa: Vec<usize> = (0..1000).map(|_| a.sample(40)).collect();
        let sb: Vec<usize> = (0..1000).map(|_| b.sample(40)).collect();
        assert_eq!(sa, sb);

        let mut c = WeightedSampler::new(&d, 43);
        let sc: Vec<usize> = (0..1000).map(|_| c.sample(40)).collect();
        assert_ne!(sa, sc);
    }

    #[test]
    fn single_target_is_index_zero() {
        for (mean, variance) in [(0.0, 0.0), (1.0, 0.0), (0.5, 1.0), (0.9, 0.01)] {
            let mut s = WeightedSampler::new(&dist(mean, variance), 1);
            for _ in 0..100 {
                assert_eq!(s.sample(1), 0);
            }
        }
    }

    #[test]
    fn upper_bound_maps_to_last_index() {
        let mut s = WeightedSampler::new(&dist(1.0, 0.0), 1);
        assert_eq!(s.sample(40), 39);
        assert_eq!(s.exhausted(), 0);
    }

    #[test]
    fn degenerate_inputs_terminate_with_fallback() {
        // no draw can ever land in [0, 1]
        let mut s = WeightedSampler::new(&dist(5.0, 0.0), 1);
        assert_eq!(s.sample(40), 0);
        assert_eq!(s.exhausted(), 1);

        let mut s = WeightedSampler::new(&dist(-1000.0, 0.0001), 1);
        assert_eq!(s.sample(40), 0);
        assert_eq!(s.exhausted(), 1);
    }

    #[test]
    fn samples_cluster_around_mean() {
        // 0.0278 variance is a stddev of ~0.167, so ~68% within +-6.7 indices of the center
        for (mean, center) in [(0.3, 12usize), (0.7, 28usize)] {
            let mut s = WeightedSampler::new(&dist(mean, 0.0278), 42);
            let mut freq: HashMap<usize, u64> = HashMap::new();
            let total = 100_000;
            for _ in 0..total {
                *freq.entry(s.sample(40)).or_insert(0) += 1;
            }
            let near: u64 = freq
                .iter()
                .filter(|(idx, _)| idx.abs_diff(center) <= 7)
                .map(|(_, c)| *c)
                .sum();
            assert!(near as f64 / total as f64 > 0.6, "mean {}: {}", mean, near);
            let mode = freq.iter().max_by_key(|(_, c)| **c).map(|(i, _)| *i).unwrap();
            assert!(mode.abs_diff(center) <= 3, "mean {}: mode {}", mean, mode);
        }
    }

    #[test]
    fn zero_variance_is_deterministic_position() {
        let mut s = WeightedSampler::new(&dist(0.5, 0.0), 3);
        for _ in 0..100 {
            assert_eq!(s.sample(40), 20);
        }
    }

    #[test]
    fn worker_seeds() {
        assert_eq!(worker_seed(42, 1000, 0, 0), 1042);
        assert_eq!(worker_seed(42, 1000, 1, 3), 2045);
        assert_eq!(worker_seed(42, 2000, 0, 8), 2050);
        assert_eq!(worker_seed(u64::MAX, 1000, 0, 0), 999);
    }
}
