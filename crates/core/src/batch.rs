use crate::config::SchedulerConfig;
use crate::sampling::SamplingParams;
use crate::sequence::Sequence;
use std::sync::Arc;

/// Per-sequence sampling metadata, padded to a common column width so the
/// engine can upload it as rectangular tensors.
#[derive(Debug, Default)]
pub struct SamplingInput {
    pub params: Vec<Arc<SamplingParams>>,
    /// Index into the flat token array of each sequence's final token.
    pub last_token_idxes: Vec<i32>,
    /// Unique token ids seen by each sequence, row-padded with 0.
    pub unique_token_ids: Vec<Vec<i64>>,
    /// Occurrence counts parallel to `unique_token_ids`, row-padded with 0.
    pub unique_token_counts: Vec<Vec<i32>>,
    /// Number of valid columns per row.
    pub unique_token_lens: Vec<i32>,
}

/// Packed input for one forward pass.
#[derive(Debug, Default)]
pub struct ModelInput {
    /// Tokens to process, all sequences concatenated.
    pub token_ids: Vec<i32>,
    /// Absolute position of each entry in `token_ids`.
    pub positions: Vec<i32>,
    pub num_sequences: usize,
    /// Cumulative full sequence lengths, starting at 0.
    pub kv_cu_seq_lens: Vec<i32>,
    /// Cumulative processed-token counts, starting at 0.
    pub q_cu_seq_lens: Vec<i32>,
    pub kv_max_seq_len: u32,
    pub q_max_seq_len: u32,
    /// Physical slot id for each processed token, parallel to `token_ids`.
    pub new_cache_slots: Vec<i32>,
    /// Row per sequence, padded with 0 to the longest block table.
    pub block_tables: Vec<Vec<i32>>,
    pub all_prefill_sequences: bool,
    pub sampling: SamplingInput,
}

impl ModelInput {
    fn clear(&mut self) {
        self.token_ids.clear();
        self.positions.clear();
        self.num_sequences = 0;
        self.kv_cu_seq_lens.clear();
        self.kv_cu_seq_lens.push(0);
        self.q_cu_seq_lens.clear();
        self.q_cu_seq_lens.push(0);
        self.kv_max_seq_len = 0;
        self.q_max_seq_len = 0;
        self.new_cache_slots.clear();
        self.block_tables.clear();
        self.all_prefill_sequences = true;
        self.sampling.params.clear();
        self.sampling.last_token_idxes.clear();
        self.sampling.unique_token_ids.clear();
        self.sampling.unique_token_counts.clear();
        self.sampling.unique_token_lens.clear();
    }

    /// Number of tokens the sequence at `index` processes this pass.
    pub fn tokens_to_process(&self, index: usize) -> usize {
        (self.q_cu_seq_lens[index + 1] - self.q_cu_seq_lens[index]) as usize
    }

    /// Whether the sequence at `index` reaches its final token this pass,
    /// i.e. the forward pass produces logits worth sampling from.
    pub fn samples_sequence(&self, index: usize) -> bool {
        let last_position = self.positions[self.sampling.last_token_idxes[index] as usize];
        let full_len = self.kv_cu_seq_lens[index + 1] - self.kv_cu_seq_lens[index];
        last_position + 1 == full_len
    }
}

/// Converts the scheduled `(sequence, token_budget)` pairs into a packed
/// [`ModelInput`]. Scratch buffers are pre-sized from the configured batch
/// budgets and reused across steps.
pub struct BatchAssembler {
    input: ModelInput,
}

impl BatchAssembler {
    pub fn new(config: &SchedulerConfig) -> Self {
        let max_seqs = config.max_seqs_per_batch.max(1);
        let max_tokens = config.max_tokens_per_batch.max(max_seqs);
        let mut input = ModelInput {
            token_ids: Vec::with_capacity(max_tokens),
            positions: Vec::with_capacity(max_tokens),
            kv_cu_seq_lens: Vec::with_capacity(max_seqs + 1),
            q_cu_seq_lens: Vec::with_capacity(max_seqs + 1),
            new_cache_slots: Vec::with_capacity(max_tokens),
            block_tables: Vec::with_capacity(max_seqs),
            sampling: SamplingInput {
                params: Vec::with_capacity(max_seqs),
                last_token_idxes: Vec::with_capacity(max_seqs),
                unique_token_ids: Vec::with_capacity(max_seqs),
                unique_token_counts: Vec::with_capacity(max_seqs),
                unique_token_lens: Vec::with_capacity(max_seqs),
            },
            ..Default::default()
        };
        input.clear();
        Self { input }
    }

    /// Start a new batch, clearing the buffers from the previous step.
    pub fn begin(&mut self) {
        self.input.clear();
    }

    /// Pack one sequence's next `token_budget` tokens and advance its
    /// kv-cache position past them.
    pub fn add(&mut self, sequence: &mut Sequence, token_budget: usize) {
        let input = &mut self.input;
        let seq_len = sequence.num_tokens();
        let n_kv = sequence.num_kv_cache_tokens();
        let n_process = (seq_len - n_kv).min(token_budget);
        // a scheduled sequence always has work left, otherwise it should
        // have been reaped as finished
        debug_assert!(n_process > 0, "no tokens to process");
        debug_assert!(sequence.kv_cache_capacity() >= n_kv + n_process);

        input.all_prefill_sequences &= sequence.is_prefill_stage();
        input.num_sequences += 1;

        let token_ids = sequence.token_ids();
        for pos in n_kv..n_kv + n_process {
            input.token_ids.push(token_ids[pos]);
            input.positions.push(pos as i32);
        }
        input
            .sampling
            .last_token_idxes
            .push(input.token_ids.len() as i32 - 1);

        let counts = sequence.token_to_count();
        let mut ids = Vec::with_capacity(counts.len());
        let mut occurrences = Vec::with_capacity(counts.len());
        for (&token_id, &count) in counts {
            ids.push(token_id as i64);
            occurrences.push(count as i32);
        }
        input.sampling.unique_token_lens.push(ids.len() as i32);
        input.sampling.unique_token_ids.push(ids);
        input.sampling.unique_token_counts.push(occurrences);
        input.sampling.params.push(Arc::clone(sequence.sampling_params()));

        input.kv_max_seq_len = input.kv_max_seq_len.max(seq_len as u32);
        input.q_max_seq_len = input.q_max_seq_len.max(n_process as u32);
        let kv_last = *input.kv_cu_seq_lens.last().expect("seeded with 0");
        input.kv_cu_seq_lens.push(kv_last + seq_len as i32);
        let q_last = *input.q_cu_seq_lens.last().expect("seeded with 0");
        input.q_cu_seq_lens.push(q_last + n_process as i32);

        input
            .new_cache_slots
            .extend(sequence.kv_cache_slots(n_kv, n_kv + n_process));
        input.block_tables.push(
            sequence
                .blocks()
                .iter()
                .map(|block| block.id() as i32)
                .collect(),
        );

        let engine_type = sequence.engine_type();
        sequence.commit_kv_cache(engine_type, n_process);
    }

    /// Pad the rectangular tables and hand out the finished input.
    pub fn finish(&mut self) -> &ModelInput {
        let input = &mut self.input;

        let max_unique = input
            .sampling
            .unique_token_ids
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(0);
        for row in input.sampling.unique_token_ids.iter_mut() {
            row.resize(max_unique, 0);
        }
        for row in input.sampling.unique_token_counts.iter_mut() {
            row.resize(max_unique, 0);
        }

        let max_block_table = input.block_tables.iter().map(Vec::len).max().unwrap_or(0);
        for row in input.block_tables.iter_mut() {
            row.resize(max_block_table, 0);
        }

        input
    }
}
