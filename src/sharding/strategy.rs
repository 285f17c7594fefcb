use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Divides shard items among live instances.
///
/// Strategies are pure: given the same instance enumeration, job name, and
/// item count they produce the same assignment on every caller.
pub trait ShardingStrategy: Send + Sync {
    /// Returns the items owned by each instance. Every item in
    /// `[0, total_count)` appears exactly once across the returned map;
    /// instances can be absent when they received no items.
    fn sharding(
        &self,
        instances: &[String],
        job_name: &str,
        total_count: usize,
    ) -> HashMap<String, Vec<usize>>;
}

/// Default strategy: contiguous blocks of `total / n` items per instance,
/// with the first `total % n` instances in enumeration order taking one
/// extra item, so counts differ by at most 1.
pub struct AverageAllocationStrategy;

impl ShardingStrategy for AverageAllocationStrategy {
    fn sharding(
        &self,
        instances: &[String],
        _job_name: &str,
        total_count: usize,
    ) -> HashMap<String, Vec<usize>> {
        let mut result = HashMap::new();
        if instances.is_empty() {
            return result;
        }
        let base = total_count / instances.len();
        let remainder = total_count % instances.len();
        let mut next = 0usize;
        for (idx, instance) in instances.iter().enumerate() {
            let size = base + usize::from(idx < remainder);
            if size == 0 {
                continue;
            }
            result.insert(instance.clone(), (next..next + size).collect());
            next += size;
        }
        result
    }
}

/// Average allocation over an instance order reversed for jobs whose name
/// hashes odd, spreading the low-numbered (often heavier) items across
/// different instances for different jobs.
pub struct OdevitySortedStrategy;

impl ShardingStrategy for OdevitySortedStrategy {
    fn sharding(
        &self,
        instances: &[String],
        job_name: &str,
        total_count: usize,
    ) -> HashMap<String, Vec<usize>> {
        let hash: u64 = job_name
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        if hash % 2 == 1 {
            let reversed: Vec<String> = instances.iter().rev().cloned().collect();
            AverageAllocationStrategy.sharding(&reversed, job_name, total_count)
        } else {
            AverageAllocationStrategy.sharding(instances, job_name, total_count)
        }
    }
}

/// Strategy selector carried in the job configuration document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardingStrategyKind {
    #[default]
    AverageAllocation,
    OdevitySorted,
}

impl ShardingStrategyKind {
    pub fn strategy(&self) -> Box<dyn ShardingStrategy> {
        match self {
            ShardingStrategyKind::AverageAllocation => Box::new(AverageAllocationStrategy),
            ShardingStrategyKind::OdevitySorted => Box::new(OdevitySortedStrategy),
        }
    }
}
