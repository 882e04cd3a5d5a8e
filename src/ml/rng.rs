use rand::seq::{index, SliceRandom};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Deterministic random source shared by every sampling step.
///
/// Parallel units (folds, bootstrap members, permutation repeats) never share
/// one instance; each derives its own stream with [`SeededRng::derive`].
#[derive(Debug, Clone)]
pub struct SeededRng {
    inner: ChaCha8Rng,
    seed: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: ChaCha8Rng::seed_from_u64(seed),
            seed,
        }
    }

    /// Independent child stream for unit `stream` (fold id, member index...).
    pub fn derive(seed: u64, stream: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(stream);
        Self { inner: rng, seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        self.inner.gen::<f64>()
    }

    /// Uniform index in [0, n). `n` must be > 0.
    pub fn gen_index(&mut self, n: usize) -> usize {
        self.inner.gen_range(0..n)
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.inner);
    }

    /// `k` draws from [0, n) with replacement, in draw order.
    pub fn sample_with_replacement(&mut self, n: usize, k: usize) -> Vec<usize> {
        if n == 0 {
            return Vec::new();
        }
        (0..k).map(|_| self.gen_index(n)).collect()
    }

    /// `k` distinct indices from [0, n), returned sorted.
    pub fn sample_without_replacement(&mut self, n: usize, k: usize) -> Vec<usize> {
        let k = k.min(n);
        let mut picked = index::sample(&mut self.inner, n, k).into_vec();
        picked.sort_unstable();
        picked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = SeededRng::new(7);
        let mut b = SeededRng::new(7);
        let xs: Vec<f64> = (0..16).map(|_| a.next_f64()).collect();
        let ys: Vec<f64> = (0..16).map(|_| b.next_f64()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_derived_streams_differ() {
        let mut a = SeededRng::derive(42, 0);
        let mut b = SeededRng::derive(42, 1);
        let xs: Vec<usize> = (0..8).map(|_| a.gen_index(1000)).collect();
        let ys: Vec<usize> = (0..8).map(|_| b.gen_index(1000)).collect();
        assert_ne!(xs, ys);
    }

    #[test]
    fn test_sample_without_replacement_is_sorted_and_unique() {
        let mut rng = SeededRng::new(3);
        let picked = rng.sample_without_replacement(20, 8);
        assert_eq!(picked.len(), 8);
        assert!(picked.windows(2).all(|w| w[0] < w[1]));
        assert!(picked.iter().all(|&i| i < 20));

        assert_eq!(rng.sample_without_replacement(3, 10).len(), 3);
    }

    #[test]
    fn test_sample_with_replacement_bounds() {
        let mut rng = SeededRng::new(11);
        let drawn = rng.sample_with_replacement(5, 50);
        assert_eq!(drawn.len(), 50);
        assert!(drawn.iter().all(|&i| i < 5));
        assert!(rng.sample_with_replacement(0, 5).is_empty());
    }
}
