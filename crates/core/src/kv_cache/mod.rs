mod block;
mod block_allocator;
mod error;
mod prefix_cache;

pub use block::{Block, BlockId};
pub use block_allocator::BlockAllocator;
pub use error::CacheError;
pub use prefix_cache::PrefixCache;

use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::sequence::Sequence;

/// The sole authority for reserving cache slots per sequence: glues the
/// block allocator and the prefix cache together and keeps their accounting
/// consistent. Not thread-safe; owned and serialized by the scheduler.
pub struct BlockManager {
    block_size: usize,
    allocator: BlockAllocator,
    /// `None` when prefix caching is disabled.
    prefix_cache: Option<PrefixCache>,
}

impl BlockManager {
    pub fn new(config: &CacheConfig) -> Self {
        let prefix_cache = config
            .enable_prefix_cache
            .then(|| PrefixCache::new(config.block_size));
        Self {
            block_size: config.block_size,
            allocator: BlockAllocator::new(config.num_blocks as u32, config.block_size as u32),
            prefix_cache,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.allocator.num_blocks() as usize
    }

    pub fn num_free_blocks(&self) -> usize {
        self.allocator.free_count() as usize
    }

    pub fn prefix_cache(&self) -> Option<&PrefixCache> {
        self.prefix_cache.as_ref()
    }

    /// Seed an empty sequence with blocks already holding its prompt prefix.
    ///
    /// Matches the sequence's tokens against the prefix cache and attaches
    /// the shared blocks; the kv positions advance past the covered tokens
    /// (backing off one block on a whole-prompt match, see
    /// [`Sequence::append_shared_blocks`]). No-op when prefix caching is
    /// disabled or the sequence already holds blocks.
    pub fn allocate_shared(&mut self, sequence: &mut Sequence) {
        if !sequence.blocks().is_empty() {
            return;
        }
        let Some(cache) = self.prefix_cache.as_mut() else {
            return;
        };
        let (matched, blocks) = cache.match_prefix(sequence.token_ids());
        if matched > 0 {
            debug!(
                seq_id = sequence.id(),
                matched, "matched shared prefix blocks"
            );
            sequence.append_shared_blocks(blocks);
        }
    }

    /// Ensure the sequence owns enough blocks to hold `target_tokens`,
    /// evicting cold prefix-cache blocks if the free pool runs short.
    pub fn allocate_slots(
        &mut self,
        sequence: &mut Sequence,
        target_tokens: usize,
    ) -> Result<(), CacheError> {
        let blocks_needed = target_tokens.div_ceil(self.block_size);
        let num_blocks = sequence.num_blocks();
        if blocks_needed <= num_blocks {
            return Ok(());
        }

        let additional = blocks_needed - num_blocks;
        if !self.reserve(additional) {
            return Err(CacheError::OutOfBlocks {
                requested: additional,
                available: self.num_free_blocks(),
            });
        }
        let blocks = self.allocator.allocate(additional)?;
        sequence.append_blocks(blocks);
        Ok(())
    }

    /// Return a sequence's blocks. With prefix caching enabled the kv state
    /// is first published to the cache so future requests can share it; the
    /// cache keeps the underlying blocks alive.
    pub fn release(&mut self, sequence: &mut Sequence) {
        if let Some(cache) = self.prefix_cache.as_mut() {
            let cached_len = sequence.tokens_in_kv_cache().len();
            let inserted = cache.insert(&sequence.token_ids()[..cached_len], sequence.blocks());
            if inserted > 0 {
                debug!(seq_id = sequence.id(), inserted, "cached released kv state");
            }
        }
        sequence.release_blocks();
    }

    /// Make sure `num_blocks` can be allocated, evicting from the prefix
    /// cache when the free pool is short.
    fn reserve(&mut self, num_blocks: usize) -> bool {
        let free = self.allocator.free_count() as usize;
        if num_blocks <= free {
            return true;
        }
        let Some(cache) = self.prefix_cache.as_mut() else {
            return false;
        };

        let to_evict = num_blocks - free;
        let evicted = cache.evict(to_evict);
        if evicted < to_evict {
            return false;
        }
        let free_now = self.allocator.free_count() as usize;
        if free_now < num_blocks {
            // eviction reported success but the ids did not come back
            warn!(
                free_blocks = free_now,
                cached_blocks = cache.num_blocks(),
                "potential block leak after prefix cache eviction"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::sampling::SamplingParams;
    use crate::stopping::StoppingCriteria;

    fn config(num_blocks: usize, block_size: usize, enable_prefix_cache: bool) -> CacheConfig {
        CacheConfig {
            num_blocks,
            block_size,
            enable_prefix_cache,
        }
    }

    fn make_sequence(prompt_tokens: &[i32]) -> Sequence {
        let stopping = StoppingCriteria {
            max_tokens: 16,
            eos_token_id: 2,
            ..Default::default()
        };
        Sequence::new(
            Arc::from(""),
            prompt_tokens,
            prompt_tokens.len() + 16,
            Arc::new(SamplingParams::default()),
            Arc::new(stopping),
            false,
        )
    }

    /// Every block id is either free, held by a sequence, or held by the
    /// prefix cache; the union covers the whole pool exactly.
    fn assert_pool_conserved(manager: &BlockManager, sequences: &[&Sequence]) {
        let mut held: HashSet<u32> = HashSet::new();
        for seq in sequences {
            held.extend(seq.blocks().iter().map(|b| b.id()));
        }
        let cached = manager.prefix_cache().map_or(0, |c| c.num_blocks());
        assert!(manager.num_free_blocks() + held.len() + cached >= manager.num_blocks());
        assert!(manager.num_free_blocks() + held.len() <= manager.num_blocks());
    }

    #[test]
    fn allocate_slots_rounds_up_to_blocks() {
        let mut manager = BlockManager::new(&config(8, 4, false));
        let mut seq = make_sequence(&[1, 2, 3, 4, 5]);

        manager.allocate_slots(&mut seq, 5).unwrap();
        assert_eq!(seq.num_blocks(), 2);
        assert_eq!(manager.num_free_blocks(), 6);

        // already covered: no-op
        manager.allocate_slots(&mut seq, 7).unwrap();
        assert_eq!(seq.num_blocks(), 2);
    }

    #[test]
    fn allocate_slots_out_of_capacity() {
        let mut manager = BlockManager::new(&config(2, 4, false));
        let mut seq = make_sequence(&[1; 12]);

        let err = manager.allocate_slots(&mut seq, 12).unwrap_err();
        match err {
            CacheError::OutOfBlocks { requested, .. } => assert_eq!(requested, 3),
            other => panic!("wrong error variant: {other}"),
        }
        assert!(seq.blocks().is_empty());
    }

    #[test]
    fn release_returns_blocks_without_prefix_cache() {
        let mut manager = BlockManager::new(&config(4, 4, false));
        let mut seq = make_sequence(&[1, 2, 3, 4]);
        manager.allocate_slots(&mut seq, 4).unwrap();
        seq.commit_kv_cache(crate::sequence::EngineType::Llm, 4);

        manager.release(&mut seq);
        assert!(seq.blocks().is_empty());
        assert_eq!(seq.num_kv_cache_tokens(), 0);
        assert_eq!(manager.num_free_blocks(), 4);
    }

    #[test]
    fn release_publishes_to_prefix_cache() {
        let mut manager = BlockManager::new(&config(4, 4, true));
        let mut seq = make_sequence(&[1, 2, 3, 4, 5, 6, 7, 8]);
        manager.allocate_slots(&mut seq, 8).unwrap();
        seq.commit_kv_cache(crate::sequence::EngineType::Llm, 8);

        manager.release(&mut seq);
        assert!(seq.blocks().is_empty());
        // the cache keeps the blocks alive; they are not free
        assert_eq!(manager.num_free_blocks(), 2);
        let cache = manager.prefix_cache().unwrap();
        assert_eq!(cache.num_blocks(), 2);
        assert_eq!(cache.num_nodes(), 1);
    }

    #[test]
    fn allocate_shared_reuses_released_prompt() {
        let mut manager = BlockManager::new(&config(4, 4, true));
        let mut first = make_sequence(&[1, 2, 3, 4, 5, 6, 7, 8]);
        manager.allocate_slots(&mut first, 8).unwrap();
        first.commit_kv_cache(crate::sequence::EngineType::Llm, 8);
        manager.release(&mut first);

        let mut second = make_sequence(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        manager.allocate_shared(&mut second);
        assert_eq!(second.num_blocks(), 2);
        assert_eq!(second.num_kv_cache_tokens(), 8);
        assert_pool_conserved(&manager, &[&second]);
    }

    #[test]
    fn allocate_shared_backs_off_on_exact_prompt_match() {
        let mut manager = BlockManager::new(&config(4, 4, true));
        let mut first = make_sequence(&[1, 2, 3, 4, 5, 6, 7, 8]);
        manager.allocate_slots(&mut first, 8).unwrap();
        first.commit_kv_cache(crate::sequence::EngineType::Llm, 8);
        manager.release(&mut first);

        // identical prompt: the match covers it entirely
        let mut second = make_sequence(&[1, 2, 3, 4, 5, 6, 7, 8]);
        manager.allocate_shared(&mut second);
        assert_eq!(second.num_blocks(), 2);
        // one block's worth is recomputed to produce first-token logits
        assert_eq!(second.num_kv_cache_tokens(), 4);
    }

    #[test]
    fn allocate_shared_disabled_without_prefix_cache() {
        let mut manager = BlockManager::new(&config(4, 4, false));
        let mut seq = make_sequence(&[1, 2, 3, 4]);
        manager.allocate_shared(&mut seq);
        assert!(seq.blocks().is_empty());
        assert_eq!(seq.num_kv_cache_tokens(), 0);
    }

    #[test]
    fn allocation_evicts_cold_cache_blocks() {
        let mut manager = BlockManager::new(&config(2, 4, true));
        let mut first = make_sequence(&[1, 2, 3, 4, 5, 6, 7, 8]);
        manager.allocate_slots(&mut first, 8).unwrap();
        first.commit_kv_cache(crate::sequence::EngineType::Llm, 8);
        manager.release(&mut first);
        assert_eq!(manager.num_free_blocks(), 0);

        // a different prompt forces the cached blocks out
        let mut second = make_sequence(&[9, 9, 9, 9, 9, 9, 9, 9]);
        manager.allocate_slots(&mut second, 8).unwrap();
        assert_eq!(second.num_blocks(), 2);
        assert_eq!(manager.prefix_cache().unwrap().num_blocks(), 0);
    }

    #[test]
    fn allocation_fails_when_cache_blocks_are_shared() {
        let mut manager = BlockManager::new(&config(2, 4, true));
        let mut first = make_sequence(&[1, 2, 3, 4, 5, 6, 7, 8]);
        manager.allocate_slots(&mut first, 8).unwrap();
        first.commit_kv_cache(crate::sequence::EngineType::Llm, 8);
        manager.release(&mut first);

        // a live sequence shares the cached blocks: nothing is evictable
        let mut holder = make_sequence(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        manager.allocate_shared(&mut holder);
        assert_eq!(holder.num_blocks(), 2);

        let mut second = make_sequence(&[9; 8]);
        assert!(manager.allocate_slots(&mut second, 8).is_err());
    }
}
