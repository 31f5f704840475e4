use serde::Deserialize;

/// Scheduler budgets and queue sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tokens processed per forward pass.
    pub max_tokens_per_batch: usize,
    /// Maximum number of sequences per forward pass.
    pub max_seqs_per_batch: usize,
    /// Capacity of the bounded submit queue; `submit` returns `Busy` when
    /// it is full.
    pub queue_capacity: usize,
    /// Tokens the draft model proposes per step. 0 disables speculative
    /// decoding; non-zero widens each sequence's token buffer by the
    /// proposal window plus the bonus token.
    pub num_speculative_tokens: usize,
    /// Sequence cap used when profiling memory for the kv-cache pool.
    pub max_seqs_per_batch_profiling: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_batch: 1024,
            max_seqs_per_batch: 128,
            queue_capacity: 100_000,
            num_speculative_tokens: 0,
            max_seqs_per_batch_profiling: 32,
        }
    }
}

/// Block pool and prefix cache sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of physical blocks in the pool.
    pub num_blocks: usize,
    /// Tokens per block.
    pub block_size: usize,
    /// Keep released kv state in the radix prefix cache for reuse.
    pub enable_prefix_cache: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_blocks: 512,
            block_size: 16,
            enable_prefix_cache: true,
        }
    }
}

impl CacheConfig {
    /// Derive the pool size from free device memory: the budget is
    /// `free_memory_bytes * max_memory_utilization`, capped by
    /// `max_cache_size` when non-zero.
    pub fn num_blocks_for_memory(
        free_memory_bytes: u64,
        block_size_bytes: u64,
        max_memory_utilization: f64,
        max_cache_size: u64,
    ) -> usize {
        debug_assert!(block_size_bytes > 0);
        let mut budget = (free_memory_bytes as f64 * max_memory_utilization) as u64;
        if max_cache_size > 0 {
            budget = budget.min(max_cache_size);
        }
        (budget / block_size_bytes) as usize
    }
}
