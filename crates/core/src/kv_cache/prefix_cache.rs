use super::block::Block;

/// Index into the node arena. Slot 0 is the root and is never released.
type NodeId = usize;

const ROOT: NodeId = 0;

struct Node {
    /// Token ids the node covers. Always a whole number of blocks:
    /// `token_ids.len() == blocks.len() * block_size`.
    token_ids: Vec<i32>,
    /// Blocks holding the kv state for `token_ids`, in order.
    blocks: Vec<Block>,
    children: Vec<NodeId>,
    parent: NodeId,
    /// Logical LRU clock tick of the last match/insert touching this node.
    last_access: u64,
}

impl Node {
    fn new(parent: NodeId, last_access: u64) -> Self {
        Self {
            token_ids: Vec::new(),
            blocks: Vec::new(),
            children: Vec::new(),
            parent,
            last_access,
        }
    }
}

/// Radix tree over token-id prefixes, mapping block-aligned prefixes to the
/// blocks that hold their kv state.
///
/// Blocks inserted here are the cache's cold pool: they stay alive (their
/// handles keep the ids out of the allocator's free list) until evicted, and
/// may simultaneously be shared with live sequences that matched the prefix.
/// Eviction walks the leaf set in LRU order and never touches a shared block.
pub struct PrefixCache {
    block_size: usize,
    nodes: Vec<Option<Node>>,
    free_slots: Vec<NodeId>,
    /// Live nodes excluding the root.
    num_nodes: usize,
    /// Total blocks held by the tree.
    num_blocks: usize,
    /// Monotonic clock for LRU ordering; one tick per cache operation.
    clock: u64,
}

fn common_prefix_length(a: &[i32], b: &[i32]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn round_down(n: usize, multiple: usize) -> usize {
    (n / multiple) * multiple
}

impl PrefixCache {
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "block size should be greater than 0");
        Self {
            block_size,
            nodes: vec![Some(Node::new(ROOT, 0))],
            free_slots: Vec::new(),
            num_nodes: 0,
            num_blocks: 0,
            clock: 0,
        }
    }

    /// Match the longest block-aligned cached prefix of `token_ids`.
    ///
    /// Returns the matched length (a multiple of the block size) and clones
    /// of the blocks covering it. Cloning shares ownership, so matched
    /// blocks become shared between the cache and the caller.
    pub fn match_prefix(&mut self, token_ids: &[i32]) -> (usize, Vec<Block>) {
        self.clock += 1;
        let now = self.clock;

        let n_tokens = round_down(token_ids.len(), self.block_size);
        let mut tokens = &token_ids[..n_tokens];

        let mut matched = 0;
        let mut blocks = Vec::new();
        let mut curr = ROOT;
        'descend: while !tokens.is_empty() {
            let children = self.node(curr).children.clone();
            for child_id in children {
                let child = self.node(child_id);
                let mut prefix_len = common_prefix_length(tokens, &child.token_ids);
                // only whole blocks count as a match
                prefix_len = round_down(prefix_len, self.block_size);
                if prefix_len == 0 {
                    continue;
                }

                let full_child = prefix_len == child.token_ids.len();
                let n_blocks = prefix_len / self.block_size;
                blocks.extend(child.blocks[..n_blocks].iter().cloned());
                self.node_mut(child_id).last_access = now;
                matched += prefix_len;
                tokens = &tokens[prefix_len..];

                if full_child {
                    // full match, continue to grand children
                    curr = child_id;
                    continue 'descend;
                }
                break 'descend;
            }
            break;
        }

        (matched, blocks)
    }

    /// Insert `token_ids` and their backing blocks, both truncated to a whole
    /// number of blocks. Already-cached prefixes are skipped (their incoming
    /// handles are dropped); a partially matched node is split at the aligned
    /// boundary. Returns the number of newly inserted tokens.
    pub fn insert(&mut self, token_ids: &[i32], blocks: &[Block]) -> usize {
        self.clock += 1;
        let now = self.clock;

        let n_blocks = (token_ids.len() / self.block_size).min(blocks.len());
        let n_tokens = n_blocks * self.block_size;
        let mut tokens = &token_ids[..n_tokens];
        let mut blocks = &blocks[..n_blocks];

        let mut new_inserted = 0;
        let mut curr = ROOT;
        'descend: while !tokens.is_empty() {
            let children = self.node(curr).children.clone();
            for child_id in children {
                let child = self.node(child_id);
                let mut prefix_len = common_prefix_length(tokens, &child.token_ids);
                prefix_len = round_down(prefix_len, self.block_size);
                if prefix_len == 0 {
                    continue;
                }

                self.node_mut(child_id).last_access = now;
                let n_matched_blocks = prefix_len / self.block_size;
                tokens = &tokens[prefix_len..];
                blocks = &blocks[n_matched_blocks..];

                if prefix_len < self.node(child_id).token_ids.len() {
                    // partial match, split the node at the aligned boundary
                    self.split_node(child_id, prefix_len);
                }
                curr = child_id;
                continue 'descend;
            }

            // no child shares a whole leading block: the rest becomes a new
            // child of the deepest node reached
            new_inserted += tokens.len();
            self.create_child(curr, tokens, blocks, now);
            break;
        }
        new_inserted
    }

    /// Evict up to `n_blocks` blocks, walking leaves in LRU order.
    ///
    /// Within a leaf, leading shared blocks (still referenced by a live
    /// sequence) are skipped and eviction takes from the tail. Unlinking an
    /// emptied leaf can turn its parent into a leaf, so the scan repeats
    /// until the budget is met or a pass makes no progress. Returns the
    /// number of blocks actually evicted.
    pub fn evict(&mut self, n_blocks: usize) -> usize {
        let mut total_evicted = 0;
        while total_evicted < n_blocks {
            let evicted = self.evict_pass(n_blocks - total_evicted);
            if evicted == 0 {
                break;
            }
            total_evicted += evicted;
        }
        total_evicted
    }

    fn evict_pass(&mut self, n_blocks: usize) -> usize {
        // leaves sorted by last access, least recent first
        let mut leaves: Vec<(u64, NodeId)> = self
            .nodes
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(id, slot)| slot.as_ref().map(|node| (id, node)))
            .filter(|(_, node)| node.children.is_empty())
            .map(|(id, node)| (node.last_access, id))
            .collect();
        leaves.sort_unstable();

        let mut total_evicted = 0;
        for (_, leaf_id) in leaves {
            if total_evicted >= n_blocks {
                break;
            }
            let leaf = self.node(leaf_id);
            let n_leaf_blocks = leaf.blocks.len();
            // skip leading blocks still referenced by live sequences
            let non_shared_start = leaf
                .blocks
                .iter()
                .position(|b| !b.is_shared())
                .unwrap_or(n_leaf_blocks);

            let n_to_evict = (n_blocks - total_evicted).min(n_leaf_blocks - non_shared_start);
            if n_to_evict == 0 {
                continue;
            }
            total_evicted += n_to_evict;
            if n_to_evict == n_leaf_blocks {
                self.release_node(leaf_id);
            } else {
                let n_left = n_leaf_blocks - n_to_evict;
                let n_left_tokens = n_left * self.block_size;
                let leaf = self.node_mut(leaf_id);
                leaf.blocks.truncate(n_left);
                leaf.token_ids.truncate(n_left_tokens);
            }
        }

        self.num_blocks -= total_evicted;
        total_evicted
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Number of nodes in the tree, excluding the root.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id].as_ref().expect("live node")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id].as_mut().expect("live node")
    }

    fn alloc_node(&mut self, node: Node) -> NodeId {
        self.num_nodes += 1;
        if let Some(slot) = self.free_slots.pop() {
            self.nodes[slot] = Some(node);
            slot
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    /// Unlink an emptied leaf from its parent and free its arena slot.
    fn release_node(&mut self, id: NodeId) {
        debug_assert_ne!(id, ROOT);
        debug_assert!(self.node(id).children.is_empty());
        let parent = self.node(id).parent;
        self.node_mut(parent).children.retain(|&c| c != id);
        self.nodes[id] = None;
        self.free_slots.push(id);
        self.num_nodes -= 1;
    }

    /// Split `id` at `prefix_len`: the shared prefix stays in the existing
    /// node, the suffix moves to a new child that inherits the grandchildren.
    fn split_node(&mut self, id: NodeId, prefix_len: usize) {
        debug_assert!(prefix_len > 0 && prefix_len % self.block_size == 0);
        let n_blocks = prefix_len / self.block_size;

        let node = self.nodes[id].as_mut().expect("live node");
        debug_assert!(node.token_ids.len() > prefix_len && node.blocks.len() > n_blocks);

        let suffix = Node {
            token_ids: node.token_ids.split_off(prefix_len),
            blocks: node.blocks.split_off(n_blocks),
            children: std::mem::take(&mut node.children),
            parent: id,
            last_access: node.last_access,
        };
        let grand_children = suffix.children.clone();
        let suffix_id = self.alloc_node(suffix);
        for grand_child in grand_children {
            self.node_mut(grand_child).parent = suffix_id;
        }
        self.node_mut(id).children.push(suffix_id);
    }

    fn create_child(&mut self, parent: NodeId, tokens: &[i32], blocks: &[Block], now: u64) {
        debug_assert!(!tokens.is_empty() && tokens.len() == blocks.len() * self.block_size);
        self.num_blocks += blocks.len();
        let child = Node {
            token_ids: tokens.to_vec(),
            blocks: blocks.to_vec(),
            children: Vec::new(),
            parent,
            last_access: now,
        };
        let child_id = self.alloc_node(child);
        self.node_mut(parent).children.push(child_id);
    }
}

#[cfg(test)]
mod tests {
    use super::super::block_allocator::BlockAllocator;
    use super::*;

    fn blocks(allocator: &mut BlockAllocator, n: usize) -> Vec<Block> {
        allocator.allocate(n).unwrap()
    }

    #[test]
    fn empty_cache_has_no_match() {
        let mut cache = PrefixCache::new(4);
        let (matched, blocks) = cache.match_prefix(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(matched, 0);
        assert!(blocks.is_empty());
        assert_eq!(cache.num_nodes(), 0);
    }

    #[test]
    fn insert_then_match_round_trip() {
        let mut allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        let tokens = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let owned = blocks(&mut allocator, 2);
        let inserted = cache.insert(&tokens, &owned);
        assert_eq!(inserted, 8);
        assert_eq!(cache.num_nodes(), 1);
        assert_eq!(cache.num_blocks(), 2);

        let (matched, shared) = cache.match_prefix(&tokens);
        assert_eq!(matched, 8);
        assert_eq!(shared.len(), 2);
        assert_eq!(shared[0].id(), owned[0].id());
        assert_eq!(shared[1].id(), owned[1].id());
        // cache + original + match result
        assert_eq!(shared[0].ref_count(), 3);
    }

    #[test]
    fn match_is_block_aligned() {
        let mut allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        let tokens = vec![1, 2, 3, 4, 5, 6, 7, 8];
        cache.insert(&tokens, &blocks(&mut allocator, 2));

        // 7 tokens round down to one block
        let (matched, shared) = cache.match_prefix(&[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(matched, 4);
        assert_eq!(shared.len(), 1);
    }

    #[test]
    fn insert_is_block_aligned() {
        let mut allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        // 6 tokens: only the first full block is inserted
        let inserted = cache.insert(&[1, 2, 3, 4, 5, 6], &blocks(&mut allocator, 2));
        assert_eq!(inserted, 4);
        assert_eq!(cache.num_blocks(), 1);
    }

    #[test]
    fn diverging_insert_splits_node() {
        let mut allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        cache.insert(&[1, 2, 3, 4, 5, 6, 7, 8], &blocks(&mut allocator, 2));
        // shares the first block, diverges in the second
        cache.insert(&[1, 2, 3, 4, 9, 9, 9, 9], &blocks(&mut allocator, 2));

        // prefix node + two divergent suffix nodes
        assert_eq!(cache.num_nodes(), 3);
        assert_eq!(cache.num_blocks(), 3);

        let (matched_a, _) = cache.match_prefix(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let (matched_b, _) = cache.match_prefix(&[1, 2, 3, 4, 9, 9, 9, 9]);
        assert_eq!(matched_a, 8);
        assert_eq!(matched_b, 8);
    }

    #[test]
    fn split_preserves_grandchildren() {
        let mut allocator = BlockAllocator::new(16, 4);
        let mut cache = PrefixCache::new(4);

        cache.insert(&[1, 2, 3, 4, 5, 6, 7, 8], &blocks(&mut allocator, 2));
        cache.insert(
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
            &blocks(&mut allocator, 3),
        );
        // splits [1..8] into [1..4] + [5..8]; the deep child hangs off [5..8]
        cache.insert(&[1, 2, 3, 4, 20, 20, 20, 20], &blocks(&mut allocator, 2));

        let (matched, shared) = cache.match_prefix(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(matched, 12);
        assert_eq!(shared.len(), 3);
    }

    #[test]
    fn duplicate_insert_adds_nothing() {
        let mut allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        let tokens = vec![1, 2, 3, 4, 5, 6, 7, 8];
        cache.insert(&tokens, &blocks(&mut allocator, 2));
        let second = blocks(&mut allocator, 2);
        let inserted = cache.insert(&tokens, &second);
        assert_eq!(inserted, 0);
        assert_eq!(cache.num_blocks(), 2);
        drop(second);
        // the duplicate's blocks were not kept by the cache
        assert_eq!(allocator.free_count(), 6);
    }

    #[test]
    fn evict_releases_blocks_to_allocator() {
        let mut allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        cache.insert(&[1, 2, 3, 4, 5, 6, 7, 8], &blocks(&mut allocator, 2));
        assert_eq!(allocator.free_count(), 6);

        let evicted = cache.evict(2);
        assert_eq!(evicted, 2);
        assert_eq!(cache.num_blocks(), 0);
        assert_eq!(cache.num_nodes(), 0);
        assert_eq!(allocator.free_count(), 8);
    }

    #[test]
    fn evict_skips_shared_blocks() {
        let mut allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        cache.insert(&[1, 2, 3, 4, 5, 6, 7, 8], &blocks(&mut allocator, 2));
        // a live sequence shares the whole prefix
        let (_, shared) = cache.match_prefix(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(shared.len(), 2);

        let evicted = cache.evict(2);
        assert_eq!(evicted, 0);
        assert_eq!(cache.num_blocks(), 2);

        drop(shared);
        let evicted = cache.evict(2);
        assert_eq!(evicted, 2);
    }

    #[test]
    fn evict_takes_trailing_blocks_first() {
        let mut allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        cache.insert(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12], &blocks(&mut allocator, 3));

        let evicted = cache.evict(1);
        assert_eq!(evicted, 1);
        assert_eq!(cache.num_blocks(), 2);
        assert_eq!(cache.num_nodes(), 1);

        // the surviving prefix still matches
        let (matched, _) = cache.match_prefix(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(matched, 8);
    }

    #[test]
    fn evict_is_lru_over_leaves() {
        let mut allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        cache.insert(&[1, 1, 1, 1], &blocks(&mut allocator, 1));
        cache.insert(&[2, 2, 2, 2], &blocks(&mut allocator, 1));
        // touch the first prefix so the second becomes least recent
        cache.match_prefix(&[1, 1, 1, 1]);

        let evicted = cache.evict(1);
        assert_eq!(evicted, 1);
        let (matched, _) = cache.match_prefix(&[1, 1, 1, 1]);
        assert_eq!(matched, 4);
        let (matched, _) = cache.match_prefix(&[2, 2, 2, 2]);
        assert_eq!(matched, 0);
    }

    #[test]
    fn evict_unlinks_parents_across_passes() {
        let mut allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        cache.insert(&[1, 2, 3, 4, 5, 6, 7, 8], &blocks(&mut allocator, 2));
        cache.insert(&[1, 2, 3, 4, 9, 9, 9, 9], &blocks(&mut allocator, 2));
        assert_eq!(cache.num_nodes(), 3);

        // evicting everything requires releasing both leaves, then the
        // parent that became a leaf
        let evicted = cache.evict(3);
        assert_eq!(evicted, 3);
        assert_eq!(cache.num_nodes(), 0);
        assert_eq!(cache.num_blocks(), 0);
        assert_eq!(allocator.free_count(), 8);
    }

    #[test]
    fn partial_eviction_keeps_alignment() {
        let mut allocator = BlockAllocator::new(8, 4);
        let mut cache = PrefixCache::new(4);

        cache.insert(&[1, 2, 3, 4, 5, 6, 7, 8], &blocks(&mut allocator, 2));
        cache.evict(1);

        // node invariant: token count is a whole number of blocks
        let (matched, shared) = cache.match_prefix(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(matched, 4);
        assert_eq!(shared.len(), 1);
    }
}
