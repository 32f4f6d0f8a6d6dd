use std::fmt;

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Metric name → value, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    entries: Vec<(String, f64)>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, keeping its original position if already present.
    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.entries.iter().find(|(k, _)| k == key).map(|&(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `k: v` pairs with three decimals, space separated.
impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{k}: {v:.3}")?;
        }
        Ok(())
    }
}

impl Serialize for Stats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Weighted running sum of per-batch stats.
///
/// Each batch contributes `weight * value` (weight = batch size); `finish`
/// divides by the total weight, which yields the dataset-level mean of any
/// per-sample metric whatever the batch partitioning.
#[derive(Debug, Clone, Default)]
pub struct StatsAccumulator {
    sums: Stats,
    total: f64,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, batch: &Stats, weight: usize) {
        let w = weight as f64;
        for (k, v) in batch.iter() {
            let sum = self.sums.get(k).unwrap_or(0.0) + w * v;
            self.sums.insert(k, sum);
        }
        self.total += w;
    }

    /// Number of samples seen.
    pub fn count(&self) -> usize {
        self.total as usize
    }

    pub fn finish(&self) -> Stats {
        if self.total == 0.0 {
            return self.sums.clone();
        }
        let mut out = Stats::new();
        for (k, v) in self.sums.iter() {
            out.insert(k, v / self.total);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_log_format() {
        let stats = Stats::new().with("loss", 1.23456).with("enc_loss", 0.5);
        assert_eq!(stats.to_string(), "loss: 1.235 enc_loss: 0.500");
    }

    #[test]
    fn insert_keeps_order() {
        let mut stats = Stats::new().with("b", 1.0).with("a", 2.0);
        stats.insert("b", 3.0);
        assert_eq!(stats.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(stats.get("b"), Some(3.0));
    }

    #[test]
    fn accumulator_weights_by_batch_size() {
        let mut acc = StatsAccumulator::new();
        acc.add(&Stats::new().with("x", 1.0), 3);
        acc.add(&Stats::new().with("x", 0.0), 1);
        assert_eq!(acc.count(), 4);
        assert_eq!(acc.finish().get("x"), Some(0.75));
    }

    #[test]
    fn serializes_as_ordered_json_object() {
        let stats = Stats::new().with("z", 1.0).with("a", 0.5);
        assert_eq!(serde_json::to_string(&stats).unwrap(), r#"{"z":1.0,"a":0.5}"#);
    }
}
