//! Candidate sampling
//!
//! Pipelines routinely push thousands of candidates through a filter or a
//! ranker. Counts are always kept exact; only the captured *content* is
//! bounded here, so a trace stays small while still showing what came in,
//! what survived and a representative slice of the middle.
//!
//! Every function is a pure transformation: the input is never mutated and
//! the returned [`Sample::total`] is always the true input length. Only the
//! random portions depend on the supplied RNG; pass a seeded one for
//! reproducible fixtures.

use rand::Rng;
use rand::seq::index;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;

use crate::config::{SamplingConfig, SamplingStrategy};

/// Bounded subset of a candidate list
#[derive(Debug, Clone, PartialEq)]
pub struct Sample<T> {
    /// Selected candidates, in their original relative order
    pub items: Vec<T>,
    /// False when `items` is the complete input
    pub sampled: bool,
    /// Length of the original input
    pub total: usize,
}

impl<T> Sample<T> {
    fn full(items: Vec<T>) -> Self {
        let total = items.len();
        Self {
            items,
            sampled: false,
            total,
        }
    }

    pub fn summary(&self) -> SamplingSummary {
        SamplingSummary::new(self.total, self.items.len())
    }
}

/// Size statistics for a sampling pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingSummary {
    pub original_count: usize,
    pub sampled_count: usize,
    pub sampling_rate: f64,
    pub data_reduction: f64,
}

impl SamplingSummary {
    pub fn new(original_count: usize, sampled_count: usize) -> Self {
        let sampling_rate = if original_count > 0 {
            sampled_count as f64 / original_count as f64
        } else {
            0.0
        };
        Self {
            original_count,
            sampled_count,
            sampling_rate,
            data_reduction: 1.0 - sampling_rate,
        }
    }
}

/// Head, random middle and tail, using the thread RNG
pub fn sample<T: Clone>(candidates: &[T], full_capture_threshold: usize, bucket_size: usize) -> Sample<T> {
    sample_with_rng(candidates, full_capture_threshold, bucket_size, &mut rand::thread_rng())
}

/// Head, random middle and tail
///
/// Lists no longer than `full_capture_threshold` are returned whole. Longer
/// lists keep the first and last `bucket_size` items plus `bucket_size`
/// items drawn uniformly from the interior (the whole interior if it is
/// smaller than a bucket). The result never exceeds `3 * bucket_size`.
pub fn sample_with_rng<T, R>(
    candidates: &[T],
    full_capture_threshold: usize,
    bucket_size: usize,
    rng: &mut R,
) -> Sample<T>
where
    T: Clone,
    R: Rng + ?Sized,
{
    let len = candidates.len();
    if len <= full_capture_threshold {
        return Sample::full(candidates.to_vec());
    }

    let head_end = bucket_size.min(len);
    let tail_start = len.saturating_sub(bucket_size).max(head_end);
    let interior = tail_start - head_end;

    let mut picked: Vec<usize> = (0..head_end).collect();
    if interior <= bucket_size {
        picked.extend(head_end..tail_start);
    } else {
        let mut middle = index::sample(rng, interior, bucket_size).into_vec();
        middle.sort_unstable();
        picked.extend(middle.into_iter().map(|i| head_end + i));
    }
    picked.extend(tail_start..len);

    select(candidates, &picked)
}

/// First and last `bucket_size` items only
pub fn head_tail<T: Clone>(candidates: &[T], full_capture_threshold: usize, bucket_size: usize) -> Sample<T> {
    let len = candidates.len();
    if len <= full_capture_threshold || len <= 2 * bucket_size {
        return Sample::full(candidates.to_vec());
    }

    let picked: Vec<usize> = (0..bucket_size).chain(len - bucket_size..len).collect();
    select(candidates, &picked)
}

/// `sample_size` items drawn uniformly from the whole list
pub fn random<T, R>(
    candidates: &[T],
    full_capture_threshold: usize,
    sample_size: usize,
    rng: &mut R,
) -> Sample<T>
where
    T: Clone,
    R: Rng + ?Sized,
{
    let len = candidates.len();
    if len <= full_capture_threshold || len <= sample_size {
        return Sample::full(candidates.to_vec());
    }

    let mut picked = index::sample(rng, len, sample_size).into_vec();
    picked.sort_unstable();
    select(candidates, &picked)
}

/// Up to `per_group` items for each distinct key
///
/// Candidates for which `key` returns `None` are left out of the sample.
pub fn stratified<T, K, F, R>(
    candidates: &[T],
    full_capture_threshold: usize,
    per_group: usize,
    key: F,
    rng: &mut R,
) -> Sample<T>
where
    T: Clone,
    K: Hash + Eq,
    F: Fn(&T) -> Option<K>,
    R: Rng + ?Sized,
{
    if candidates.len() <= full_capture_threshold {
        return Sample::full(candidates.to_vec());
    }

    let mut groups: HashMap<K, Vec<usize>> = HashMap::new();
    for (i, candidate) in candidates.iter().enumerate() {
        if let Some(k) = key(candidate) {
            groups.entry(k).or_default().push(i);
        }
    }

    let mut picked = Vec::new();
    for members in groups.values() {
        if members.len() <= per_group {
            picked.extend_from_slice(members);
        } else {
            picked.extend(
                index::sample(rng, members.len(), per_group)
                    .into_iter()
                    .map(|i| members[i]),
            );
        }
    }
    picked.sort_unstable();
    select(candidates, &picked)
}

impl SamplingConfig {
    /// Samples JSON candidates with the configured strategy
    pub fn apply<R: Rng + ?Sized>(&self, candidates: &[serde_json::Value], rng: &mut R) -> Sample<serde_json::Value> {
        let threshold = self.full_capture_threshold;
        let bucket = self.bucket_size;
        match &self.strategy {
            SamplingStrategy::Smart => sample_with_rng(candidates, threshold, bucket, rng),
            SamplingStrategy::HeadTail => head_tail(candidates, threshold, bucket),
            SamplingStrategy::Random => random(candidates, threshold, 3 * bucket, rng),
            SamplingStrategy::Stratified { key } => stratified(
                candidates,
                threshold,
                bucket,
                |candidate| candidate.get(key).map(|v| v.to_string()),
                rng,
            ),
        }
    }
}

/// Clones the items at `indices` (ascending) into a sampled result
fn select<T: Clone>(candidates: &[T], indices: &[usize]) -> Sample<T> {
    Sample {
        items: indices.iter().map(|&i| candidates[i].clone()).collect(),
        sampled: true,
        total: candidates.len(),
    }
}
