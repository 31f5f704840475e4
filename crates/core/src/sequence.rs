use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;

use crate::kv_cache::Block;
use crate::sampling::SamplingParams;
use crate::stopping::{FinishReason, StoppingCriteria};
use crate::tokenizer::Tokenizer;

/// Which engine's kv-cache position is being tracked. A sequence is shared
/// between the target LLM and the small draft model (SSM) during speculative
/// decoding, and their cache positions can be out of sync by one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineType {
    #[default]
    Llm,
    Ssm,
}

impl EngineType {
    pub const COUNT: usize = 2;

    fn index(self) -> usize {
        match self {
            EngineType::Llm => 0,
            EngineType::Ssm => 1,
        }
    }
}

/// Logprob information for one sampled token.
#[derive(Debug, Clone)]
pub struct LogProb {
    pub token_id: i32,
    pub logprob: f32,
    /// Top-k alternative token ids, highest probability first.
    pub top_tokens: Vec<i32>,
    pub top_logprobs: Vec<f32>,
}

/// Tokens of lookback kept when re-decoding for a streamed delta, to defeat
/// cleanup heuristics that add or drop a space depending on surrounding ids.
const STREAM_LOOKBACK_TOKENS: usize = 6;

static NEXT_SEQ_ID: AtomicU64 = AtomicU64::new(1);

/// Per-generation state: the token buffer, the cache blocks backing it, the
/// kv-cache positions per engine, and the stopping/streaming bookkeeping.
///
/// A sequence is in the prefill stage until its kv-cache position reaches the
/// prompt length, then decodes one (or, speculatively, a few) tokens per
/// step until a stopping rule fires.
pub struct Sequence {
    id: u64,
    /// Original prompt string; empty when the request was submitted as
    /// token ids only.
    prompt: Arc<str>,
    token_ids: Vec<i32>,
    num_prompt_tokens: usize,
    /// Occurrence count per token id, kept for penalty-aware sampling.
    token_to_count: AHashMap<i32, u32>,
    /// Physical blocks holding the kv cache, owned (possibly shared with the
    /// prefix cache or sibling sequences).
    blocks: Vec<Block>,
    /// Tokens already in the kv cache, indexed by [`EngineType`].
    num_kv_cache_tokens: [usize; EngineType::COUNT],
    engine_type: EngineType,

    sampling_params: Arc<SamplingParams>,
    stopping_criteria: Arc<StoppingCriteria>,
    /// Logprob entries aligned to generated tokens; populated only when the
    /// sampling params ask for logprobs.
    logprobs: Vec<LogProb>,
    streamed_logprobs: usize,

    cancelled: bool,
    is_finished: bool,
    finish_status_invalidated: bool,
    finish_reason: FinishReason,

    // Incremental detokenization state. All tokens before `output_offset`
    // have been streamed; `prefix_offset` trails it by the lookback window.
    prefix_offset: usize,
    output_offset: usize,
}

impl Sequence {
    pub fn new(
        prompt: Arc<str>,
        prompt_token_ids: &[i32],
        capacity: usize,
        sampling_params: Arc<SamplingParams>,
        stopping_criteria: Arc<StoppingCriteria>,
        echo: bool,
    ) -> Self {
        assert!(!prompt_token_ids.is_empty(), "empty prompt token ids");

        let mut token_ids = Vec::with_capacity(capacity.max(prompt_token_ids.len()));
        let mut token_to_count = AHashMap::new();
        for &token_id in prompt_token_ids {
            token_ids.push(token_id);
            *token_to_count.entry(token_id).or_insert(0) += 1;
        }
        let num_prompt_tokens = token_ids.len();
        // with echo the offsets start at 0 so the prompt is streamed back
        let output_start = if echo { 0 } else { num_prompt_tokens };

        Self {
            id: NEXT_SEQ_ID.fetch_add(1, Ordering::Relaxed),
            prompt,
            token_ids,
            num_prompt_tokens,
            token_to_count,
            blocks: Vec::new(),
            num_kv_cache_tokens: [0; EngineType::COUNT],
            engine_type: EngineType::Llm,
            sampling_params,
            stopping_criteria,
            logprobs: Vec::new(),
            streamed_logprobs: 0,
            cancelled: false,
            is_finished: false,
            finish_status_invalidated: true,
            finish_reason: FinishReason::None,
            prefix_offset: output_start,
            output_offset: output_start,
        }
    }

    /// Globally unique, monotonically assigned id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token_ids(&self) -> &[i32] {
        &self.token_ids
    }

    pub fn num_tokens(&self) -> usize {
        self.token_ids.len()
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.num_prompt_tokens
    }

    /// Number of generated tokens; 0 while still in the prefill stage.
    pub fn num_generated_tokens(&self) -> usize {
        self.token_ids.len().saturating_sub(self.num_prompt_tokens)
    }

    pub fn token_to_count(&self) -> &AHashMap<i32, u32> {
        &self.token_to_count
    }

    pub fn sampling_params(&self) -> &Arc<SamplingParams> {
        &self.sampling_params
    }

    pub fn stopping_criteria(&self) -> &Arc<StoppingCriteria> {
        &self.stopping_criteria
    }

    pub fn set_engine_type(&mut self, engine_type: EngineType) {
        self.engine_type = engine_type;
    }

    pub fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    /// Kv-cache position of the currently selected engine.
    pub fn num_kv_cache_tokens(&self) -> usize {
        self.num_kv_cache_tokens[self.engine_type.index()]
    }

    pub fn num_kv_cache_tokens_for(&self, engine_type: EngineType) -> usize {
        self.num_kv_cache_tokens[engine_type.index()]
    }

    /// Tokens this sequence still needs the forward pass to process.
    pub fn num_tokens_to_process(&self) -> usize {
        self.token_ids.len() - self.num_kv_cache_tokens()
    }

    pub fn is_prefill_stage(&self) -> bool {
        self.num_kv_cache_tokens() < self.num_prompt_tokens
    }

    /// The token prefix whose kv state is valid in the cache.
    ///
    /// With speculative decoding the LLM and SSM positions can differ by at
    /// most one; the smaller (SSM) position is the safe bound then. When the
    /// SSM engine is unused its position stays far behind and the LLM
    /// position is authoritative.
    pub fn tokens_in_kv_cache(&self) -> &[i32] {
        let llm = self.num_kv_cache_tokens[EngineType::Llm.index()];
        let ssm = self.num_kv_cache_tokens[EngineType::Ssm.index()];
        let n = if llm >= ssm && llm - ssm <= 1 { ssm } else { llm };
        &self.token_ids[..n]
    }

    /// Append one sampled token. Must not be called while the sequence is
    /// finished or still in the prefill stage.
    pub fn append_token(&mut self, token_id: i32, logprob: Option<LogProb>) {
        debug_assert!(!self.is_finished, "cannot append token to a finished sequence");
        debug_assert!(
            !self.is_prefill_stage(),
            "cannot append token to a prefill sequence"
        );

        self.token_ids.push(token_id);
        *self.token_to_count.entry(token_id).or_insert(0) += 1;
        if let Some(logprob) = logprob {
            self.logprobs.push(logprob);
        }
        // the finish status has to be recomputed for the new token
        self.finish_status_invalidated = true;
    }

    /// Validate draft tokens against the target model's accepted tokens
    /// (speculative decoding) and truncate the sequence to the agreed end.
    ///
    /// `accepted` covers the last `accepted.len()` positions. The final
    /// entry is the bonus token, or -1 when the target granted none. `-1`
    /// anywhere truncates at that position; the first mismatch overwrites
    /// the draft token with the accepted one and ends the run after its
    /// stop check. Stopping rules are checked after every accepted token.
    /// Returns the number of tokens accepted (at least one by contract).
    pub fn validate_tokens(&mut self, accepted: &[i64]) -> usize {
        let len = accepted.len();
        assert!(len > 0, "empty accepted token ids");
        assert!(len <= self.token_ids.len(), "accepted tokens exceed the sequence");

        let start = self.token_ids.len() - len;
        let mut end = start;
        let mut mismatched = false;
        for (i, &accepted_id) in accepted.iter().enumerate() {
            if accepted_id < 0 || mismatched {
                break;
            }
            let idx = start + i;
            let accepted_id = accepted_id as i32;
            let draft_id = self.token_ids[idx];
            if accepted_id != draft_id {
                // rejection: keep the corrected token, drop the rest
                mismatched = true;
                self.token_ids[idx] = accepted_id;
                self.dec_token_count(draft_id);
                *self.token_to_count.entry(accepted_id).or_insert(0) += 1;
            }
            end = idx + 1;
            if self.check_finished_at(idx) {
                break;
            }
        }
        debug_assert!(end > start, "at least one token must be accepted");

        // drop the counts of the truncated draft tokens
        for idx in end..self.token_ids.len() {
            let token_id = self.token_ids[idx];
            self.dec_token_count(token_id);
        }
        self.token_ids.truncate(end);

        // both engines must re-run at least the last token to get logits
        let clamp = self.token_ids.len() - 1;
        for pos in self.num_kv_cache_tokens.iter_mut() {
            *pos = (*pos).min(clamp);
        }
        end - start
    }

    fn dec_token_count(&mut self, token_id: i32) {
        if let Some(count) = self.token_to_count.get_mut(&token_id) {
            *count -= 1;
            if *count == 0 {
                self.token_to_count.remove(&token_id);
            }
        }
    }

    /// Total tokens the allocated blocks can hold.
    pub fn kv_cache_capacity(&self) -> usize {
        match self.blocks.first() {
            Some(block) => self.blocks.len() * block.size() as usize,
            None => 0,
        }
    }

    pub fn commit_kv_cache(&mut self, engine_type: EngineType, n: usize) {
        let capacity = self.kv_cache_capacity();
        let pos = &mut self.num_kv_cache_tokens[engine_type.index()];
        *pos += n;
        debug_assert!(*pos <= capacity);
    }

    pub fn rewind_kv_cache(&mut self, engine_type: EngineType, n: usize) {
        let pos = &mut self.num_kv_cache_tokens[engine_type.index()];
        debug_assert!(*pos >= n);
        *pos -= n;
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn append_blocks(&mut self, new_blocks: Vec<Block>) {
        self.blocks.extend(new_blocks);
    }

    /// Seed the sequence with blocks matched from the prefix cache and move
    /// the kv positions past the covered tokens.
    ///
    /// When the match covers every token there would be nothing left to
    /// produce logits from, so the position backs off one whole block; the
    /// block stays attached and its kv state is regenerated from the same
    /// tokens, which is safe.
    pub fn append_shared_blocks(&mut self, shared_blocks: Vec<Block>) {
        assert!(
            self.blocks.is_empty(),
            "shared blocks must be appended before any other blocks"
        );
        if shared_blocks.is_empty() {
            return;
        }
        let block_size = shared_blocks[0].size() as usize;
        let mut kv_cache_pos = shared_blocks.len() * block_size;
        self.blocks = shared_blocks;

        if kv_cache_pos >= self.token_ids.len() {
            kv_cache_pos -= block_size;
        }
        debug_assert!(kv_cache_pos < self.token_ids.len());
        self.num_kv_cache_tokens = [kv_cache_pos; EngineType::COUNT];
    }

    /// Drop all cache blocks and reset both kv positions. The generation
    /// state (tokens) survives, so a preempted sequence can be rescheduled.
    pub fn release_blocks(&mut self) {
        self.num_kv_cache_tokens = [0; EngineType::COUNT];
        self.blocks.clear();
    }

    /// Physical slot ids for the absolute positions `[pos_start, pos_end)`.
    pub fn kv_cache_slots(&self, pos_start: usize, pos_end: usize) -> Vec<i32> {
        debug_assert!(!self.blocks.is_empty(), "no cache blocks available");
        let block_size = self.blocks[0].size() as usize;
        (pos_start..pos_end)
            .map(|i| {
                let block_id = self.blocks[i / block_size].id();
                (block_id as usize * block_size + i % block_size) as i32
            })
            .collect()
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn finish_reason(&self) -> FinishReason {
        self.finish_reason
    }

    /// Check the stopping rules, reusing the cached verdict until a new
    /// token invalidates it.
    pub fn is_finished(&mut self) -> bool {
        if !self.finish_status_invalidated {
            return self.is_finished;
        }
        if self.token_ids.len() <= self.num_prompt_tokens {
            self.finish_status_invalidated = false;
            return false;
        }
        self.check_finished_at(self.token_ids.len() - 1)
    }

    fn check_finished_at(&mut self, last_token_idx: usize) -> bool {
        self.finish_status_invalidated = false;
        let reason = self
            .stopping_criteria
            .check_finished(&self.token_ids[..=last_token_idx], self.num_prompt_tokens);
        self.finish_reason = reason;
        self.is_finished = reason.is_finished();
        self.is_finished
    }

    /// Force the sequence into the finished state (cancellation, engine
    /// failure). The reason may stay `None`.
    pub fn force_finish(&mut self, reason: FinishReason) {
        self.finish_reason = reason;
        self.is_finished = true;
        self.finish_status_invalidated = false;
    }

    /// Index of the first token not yet streamed.
    pub fn output_offset(&self) -> usize {
        self.output_offset
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn logprobs(&self) -> &[LogProb] {
        &self.logprobs
    }

    /// Logprob entries accumulated since the last streamed delta.
    pub fn drain_stream_logprobs(&mut self) -> Vec<LogProb> {
        let new = self.logprobs[self.streamed_logprobs..].to_vec();
        self.streamed_logprobs = self.logprobs.len();
        new
    }

    /// Incrementally decode tokens up to `end`, returning the new text.
    ///
    /// A replacement character at the tail means the tokenizer stopped in
    /// the middle of a multi-byte glyph; the delta is held back until the
    /// glyph completes. While the output offset is still inside the prompt
    /// and the prompt string is known, the prompt is returned verbatim.
    pub fn decode_delta(&mut self, end: usize, tokenizer: &dyn Tokenizer) -> anyhow::Result<String> {
        if self.output_offset < self.num_prompt_tokens && !self.prompt.is_empty() {
            self.prefix_offset = self.num_prompt_tokens.saturating_sub(STREAM_LOOKBACK_TOKENS);
            self.output_offset = self.num_prompt_tokens;
            return Ok(self.prompt.to_string());
        }
        // speculative rejection can rewind below the streamed offset; the
        // already-sent text stands and new deltas wait for fresh tokens
        if end < self.output_offset {
            return Ok(String::new());
        }

        let prefix_text =
            tokenizer.decode(&self.token_ids[self.prefix_offset..self.output_offset], true)?;
        let new_text = tokenizer.decode(&self.token_ids[self.prefix_offset..end], true)?;
        if new_text.len() > prefix_text.len() && !new_text.ends_with('\u{FFFD}') {
            self.prefix_offset = self.output_offset;
            self.output_offset = end;
            return Ok(new_text[prefix_text.len()..].to_string());
        }
        Ok(String::new())
    }
}
