use std::fmt;
use std::sync::{Arc, Mutex};

pub type BlockId = u32;

/// The allocator's free list, shared with every live [`Block`] handle so a
/// dropped block can return its id without going through the allocator.
pub(super) type FreeList = Arc<Mutex<Vec<BlockId>>>;

struct BlockInner {
    id: BlockId,
    size: u32,
    free_list: FreeList,
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        // Last handle gone: the id goes back on top of the free stack so the
        // next allocation reuses the most recently freed slab.
        self.free_list
            .lock()
            .expect("free list poisoned")
            .push(self.id);
    }
}

/// Handle to a fixed-size physical cache slab.
///
/// Cloning shares ownership (the reference count is the `Arc` strong count);
/// dropping the last handle returns the id to the allocator's free list.
/// A block is *shared* when more than one handle is alive, which is how the
/// prefix cache tells blocks still referenced by a running sequence apart
/// from ones it may evict.
#[derive(Clone)]
pub struct Block {
    inner: Arc<BlockInner>,
}

impl Block {
    pub(super) fn new(id: BlockId, size: u32, free_list: FreeList) -> Self {
        Self {
            inner: Arc::new(BlockInner {
                id,
                size,
                free_list,
            }),
        }
    }

    pub fn id(&self) -> BlockId {
        self.inner.id
    }

    /// Number of tokens the block holds.
    pub fn size(&self) -> u32 {
        self.inner.size
    }

    pub fn ref_count(&self) -> u32 {
        Arc::strong_count(&self.inner) as u32
    }

    pub fn is_shared(&self) -> bool {
        self.ref_count() > 1
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
