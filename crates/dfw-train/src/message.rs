use std::collections::HashSet;

use dfw_tensor::{Shape, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::Bernoulli;

/// Draws i.i.d. Bernoulli(0.5) bit strings, independent of any image.
pub struct MessageSource {
    len: usize,
    dist: Bernoulli,
    rng: ChaCha8Rng,
}

impl MessageSource {
    pub fn new(len: usize, seed: u64) -> Self {
        Self {
            len,
            dist: Bernoulli::new(0.5).expect("0.5 is a valid probability"),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A `[n, len]` batch of 0.0/1.0 messages.
    pub fn sample(&mut self, n: usize) -> Tensor {
        let data = (0..n * self.len)
            .map(|_| if self.rng.sample(self.dist) { 1.0 } else { 0.0 })
            .collect();
        Tensor::new(data, Shape::from_slice(&[n, self.len]))
    }

    /// `n` pairwise distinct messages as `[n, len]`.
    ///
    /// Duplicates are redrawn while the message space allows it; once `n`
    /// exceeds `2^len` the remaining draws may repeat.
    pub fn sample_distinct(&mut self, n: usize) -> Tensor {
        let space = u32::try_from(self.len)
            .ok()
            .and_then(|l| 1usize.checked_shl(l))
            .unwrap_or(usize::MAX);
        let mut seen: HashSet<Vec<u8>> = HashSet::with_capacity(n);
        let mut data = Vec::with_capacity(n * self.len);
        let mut count = 0;
        while count < n {
            let row = self.sample(1);
            let key: Vec<u8> = row.data().iter().map(|&b| b as u8).collect();
            if seen.len() < space && !seen.insert(key) {
                continue;
            }
            data.extend_from_slice(row.data());
            count += 1;
        }
        Tensor::new(data, Shape::from_slice(&[n, self.len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_binary_and_balanced() {
        let mut src = MessageSource::new(32, 1);
        let msg = src.sample(256);
        assert_eq!(msg.dims(), &[256, 32]);
        assert!(msg.data().iter().all(|&b| b == 0.0 || b == 1.0));
        let ones = msg.mean();
        assert!((ones - 0.5).abs() < 0.03, "fraction of ones {ones}");
    }

    #[test]
    fn same_seed_same_messages() {
        let a = MessageSource::new(8, 42).sample(4);
        let b = MessageSource::new(8, 42).sample(4);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_messages_do_not_repeat() {
        let mut src = MessageSource::new(3, 0);
        let msgs = src.sample_distinct(8);
        let rows: HashSet<Vec<u64>> = msgs
            .rows()
            .map(|r| r.iter().map(|v| v.to_bits()).collect())
            .collect();
        assert_eq!(rows.len(), 8);
    }

    #[test]
    fn distinct_sampling_terminates_past_the_message_space() {
        let mut src = MessageSource::new(1, 0);
        assert_eq!(src.sample_distinct(5).batch_len(), 5);
    }
}
