//! Event sampling
//!
//! A [`Sampler`] returns the rate `n` for an event's key; the publisher keeps
//! the event with probability `1/n` and records `n` on it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub trait Sampler: Send + Sync {
    /// Rate for `key`, always at least 1
    fn sample_rate(&self, key: &str) -> u32;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    Static,
    #[default]
    Avg,
}

/// Same rate for every key
#[derive(Debug, Clone, Copy)]
pub struct StaticSampler {
    rate: u32,
}

impl StaticSampler {
    pub fn new(rate: u32) -> Self {
        Self { rate: rate.max(1) }
    }
}

impl Sampler for StaticSampler {
    fn sample_rate(&self, _key: &str) -> u32 {
        self.rate
    }
}

/// Per-key rates aiming at an average of `goal_rate` over the whole stream
///
/// Keys seen often are sampled harder than rare ones: each key's share of the
/// kept events is proportional to the log of its count. Counts are collected
/// over `interval`; rates computed from one interval apply to the next. Keys
/// without a computed rate are kept at rate 1.
pub struct AvgSampleRate {
    goal_rate: u32,
    interval: Duration,
    state: Mutex<AvgState>,
}

struct AvgState {
    counts: HashMap<String, u64>,
    rates: HashMap<String, u32>,
    window_start: Instant,
}

impl AvgSampleRate {
    pub fn new(goal_rate: u32, interval: Duration) -> Self {
        Self {
            goal_rate: goal_rate.max(1),
            interval,
            state: Mutex::new(AvgState {
                counts: HashMap::new(),
                rates: HashMap::new(),
                window_start: Instant::now(),
            }),
        }
    }

    /// Close the current window now
    pub fn rotate(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.rotate_locked(&mut state);
    }

    fn rotate_locked(&self, state: &mut AvgState) {
        let counts = std::mem::take(&mut state.counts);
        state.rates = compute_rates(&counts, self.goal_rate);
        state.window_start = Instant::now();
        tracing::debug!(keys = state.rates.len(), goal_rate = self.goal_rate, "Sampler rates recomputed");
    }
}

impl Sampler for AvgSampleRate {
    fn sample_rate(&self, key: &str) -> u32 {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if state.window_start.elapsed() >= self.interval {
            self.rotate_locked(&mut state);
        }

        *state.counts.entry(key.to_string()).or_insert(0) += 1;
        state.rates.get(key).copied().unwrap_or(1)
    }
}

fn compute_rates(counts: &HashMap<String, u64>, goal_rate: u32) -> HashMap<String, u32> {
    let mut rates = HashMap::new();
    if counts.is_empty() {
        return rates;
    }

    let total: u64 = counts.values().sum();
    let goal_count = total as f64 / goal_rate as f64;
    let log_sum: f64 = counts.values().map(|&c| (c.max(1) as f64).ln()).sum();

    // Keeping everything, or every key was seen once: nothing to balance
    if goal_rate <= 1 || log_sum == 0.0 {
        for key in counts.keys() {
            rates.insert(key.clone(), 1);
        }
        return rates;
    }

    let goal_ratio = goal_count / log_sum;

    // Deterministic order so leftover budget is spread the same way each time
    let mut keys: Vec<&String> = counts.keys().collect();
    keys.sort();

    let mut keys_remaining = keys.len() as f64;
    let mut extra = 0.0;

    for key in keys {
        let count = counts[key].max(1) as f64;
        let mut goal_for_key = (count.ln() * goal_ratio).max(1.0);

        let extra_for_key = extra / keys_remaining;
        goal_for_key += extra_for_key;
        extra -= extra_for_key;
        keys_remaining -= 1.0;

        if count <= goal_for_key {
            rates.insert(key.clone(), 1);
            extra += goal_for_key - count;
        } else {
            let rate = (count / goal_for_key).ceil();
            rates.insert(key.clone(), rate as u32);
            extra += goal_for_key - count / rate;
        }
    }

    rates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_sampler() {
        assert_eq!(StaticSampler::new(5).sample_rate("anything"), 5);
        assert_eq!(StaticSampler::new(0).sample_rate("anything"), 1);
    }

    #[test]
    fn test_unknown_keys_start_at_one() {
        let sampler = AvgSampleRate::new(10, Duration::from_secs(300));
        assert_eq!(sampler.sample_rate("200_200_lb"), 1);
    }

    #[test]
    fn test_frequent_keys_sampled_harder() {
        let sampler = AvgSampleRate::new(10, Duration::from_secs(300));
        for _ in 0..1000 {
            sampler.sample_rate("200_200_lb");
        }
        for _ in 0..10 {
            sampler.sample_rate("500_500_lb");
        }
        sampler.rotate();

        let common = sampler.sample_rate("200_200_lb");
        let rare = sampler.sample_rate("500_500_lb");
        assert!(common > rare, "common={} rare={}", common, rare);
        assert!(rare >= 1);
    }

    #[test]
    fn test_single_hits_do_not_divide_by_zero() {
        let mut counts = HashMap::new();
        counts.insert("a".to_string(), 1);
        counts.insert("b".to_string(), 1);

        let rates = compute_rates(&counts, 10);
        assert_eq!(rates["a"], 1);
        assert_eq!(rates["b"], 1);
    }

    #[test]
    fn test_goal_rate_one_keeps_everything() {
        let mut counts = HashMap::new();
        counts.insert("a".to_string(), 500);
        counts.insert("b".to_string(), 20);

        let rates = compute_rates(&counts, 1);
        assert!(rates.values().all(|&r| r == 1));
    }

    #[test]
    fn test_expired_window_rotates() {
        let sampler = AvgSampleRate::new(10, Duration::from_millis(0));
        for _ in 0..100 {
            sampler.sample_rate("k");
        }
        // Every call rotates, so the rate reflects the previous single hit
        assert_eq!(sampler.sample_rate("k"), 1);
    }
}
