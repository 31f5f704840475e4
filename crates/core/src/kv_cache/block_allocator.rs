use std::sync::{Arc, Mutex};

use super::block::{Block, BlockId, FreeList};
use super::error::CacheError;

/// Hands out [`Block`] handles from a finite pool of physical block ids.
///
/// The free list is a stack: ids come back out in the order they were most
/// recently freed, which maximizes reuse of still-warm cache slabs. Not
/// thread-safe by itself; the [`BlockManager`](super::BlockManager)
/// serializes access.
pub struct BlockAllocator {
    num_blocks: u32,
    block_size: u32,
    free_list: FreeList,
}

impl BlockAllocator {
    pub fn new(num_blocks: u32, block_size: u32) -> Self {
        assert!(block_size > 0, "block size should be greater than 0");
        // LIFO: push num_blocks..0 so that pop gives low ids first
        let free_list: Vec<BlockId> = (0..num_blocks).rev().collect();
        Self {
            num_blocks,
            block_size,
            free_list: Arc::new(Mutex::new(free_list)),
        }
    }

    /// Allocate `n` blocks. Returns `OutOfBlocks` if insufficient free blocks.
    pub fn allocate(&mut self, n: usize) -> Result<Vec<Block>, CacheError> {
        let mut free_list = self.free_list.lock().expect("free list poisoned");
        if n > free_list.len() {
            return Err(CacheError::OutOfBlocks {
                requested: n,
                available: free_list.len(),
            });
        }
        let mut blocks = Vec::with_capacity(n);
        for _ in 0..n {
            let id = free_list.pop().expect("checked above");
            blocks.push(Block::new(id, self.block_size, Arc::clone(&self.free_list)));
        }
        Ok(blocks)
    }

    pub fn free_count(&self) -> u32 {
        self.free_list.lock().expect("free list poisoned").len() as u32
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }
}
