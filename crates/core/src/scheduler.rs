use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, warn};

use crate::batch::BatchAssembler;
use crate::config::{CacheConfig, SchedulerConfig};
use crate::engine::Engine;
use crate::error::Error;
use crate::kv_cache::BlockManager;
use crate::request::{Priority, Request, RequestId};
use crate::response::ResponseHandler;
use crate::sequence::{LogProb, Sequence};
use crate::tokenizer::Tokenizer;

/// Sleep granularity while waiting for work inside `step`.
const STEP_SLEEP: Duration = Duration::from_millis(10);

/// Heap entry ordering: higher priority first, earlier admission first
/// within a priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    priority: Priority,
    arrival: u64,
    id: RequestId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .rank()
            .cmp(&other.priority.rank())
            .then_with(|| other.arrival.cmp(&self.arrival))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One scheduled sequence and the number of tokens the forward pass may
/// process for it this step.
#[derive(Debug, Clone, Copy)]
struct ScheduledSequence {
    request_id: RequestId,
    seq_index: usize,
    token_budget: usize,
}

/// Cloneable multi-producer handle for submitting requests. Submission is
/// non-blocking: a full queue answers `Busy`.
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: Sender<Request>,
    num_speculative_tokens: usize,
}

impl SchedulerHandle {
    /// Validate and enqueue a request, transferring ownership.
    pub fn submit(&self, request: Request) -> Result<(), Error> {
        if request.prompt_tokens.is_empty() {
            return Err(Error::InvalidArgument("empty prompt token ids".into()));
        }
        if request.num_seqs == 0 {
            return Err(Error::InvalidArgument("num_seqs must be at least 1".into()));
        }
        let max_context_len = request.stopping_criteria.max_context_len;
        if max_context_len > 0
            && request.prompt_tokens.len() + self.num_speculative_tokens > max_context_len
        {
            return Err(Error::InvalidArgument(format!(
                "prompt length {} exceeds max context length {}",
                request.prompt_tokens.len(),
                max_context_len
            )));
        }
        self.sender.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => Error::Busy,
            TrySendError::Disconnected(_) => Error::Shutdown,
        })
    }
}

/// Continuous-batching scheduler: admits requests from a bounded queue into
/// a priority heap, assembles a token- and sequence-budgeted batch every
/// step (preempting low-priority requests when cache blocks run short),
/// drives the engine, and feeds the results back into the sequences.
///
/// Single-threaded by design; all sequence and block mutations happen on
/// the thread calling [`step`](Scheduler::step).
pub struct Scheduler<E: Engine> {
    config: SchedulerConfig,
    engine: E,
    block_manager: BlockManager,
    response_handler: ResponseHandler,
    assembler: BatchAssembler,

    queue_rx: Receiver<Request>,
    /// Owner of every admitted, unfinished request.
    requests: HashMap<RequestId, Request>,
    priority_queue: BinaryHeap<QueueEntry>,
    /// Requests scheduled in the current step, high priority first.
    requests_batch: Vec<RequestId>,
    sequences_batch: Vec<ScheduledSequence>,
    /// Currently scheduled requests that may be preempted, lowest priority
    /// at the back. The set gives O(1) membership.
    preemptable_candidates: VecDeque<RequestId>,
    preemptable_set: HashSet<RequestId>,
    arrival_counter: u64,
}

impl<E: Engine> Scheduler<E> {
    pub fn new(
        engine: E,
        tokenizer: Arc<dyn Tokenizer>,
        config: SchedulerConfig,
        cache_config: &CacheConfig,
    ) -> (Self, SchedulerHandle) {
        let (sender, queue_rx) = bounded(config.queue_capacity);
        let handle = SchedulerHandle {
            sender,
            num_speculative_tokens: config.num_speculative_tokens,
        };
        let scheduler = Self {
            assembler: BatchAssembler::new(&config),
            block_manager: BlockManager::new(cache_config),
            response_handler: ResponseHandler::new(tokenizer),
            engine,
            config,
            queue_rx,
            requests: HashMap::new(),
            priority_queue: BinaryHeap::new(),
            requests_batch: Vec::new(),
            sequences_batch: Vec::new(),
            preemptable_candidates: VecDeque::new(),
            preemptable_set: HashSet::new(),
            arrival_counter: 0,
        };
        (scheduler, handle)
    }

    /// Run one scheduling step: build a batch, execute the forward pass,
    /// and dispatch outputs. If no batch can be built, waits for new work
    /// up to `timeout` and returns without forward progress.
    pub fn step(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            self.build_sequence_batch();
            if !self.sequences_batch.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(STEP_SLEEP.min(deadline - now));
        }

        self.assembler.begin();
        for scheduled in &self.sequences_batch {
            let request = self
                .requests
                .get_mut(&scheduled.request_id)
                .expect("scheduled request is owned");
            let sequence = &mut request.sequences[scheduled.seq_index];
            self.assembler.add(sequence, scheduled.token_budget);
        }
        let input = self.assembler.finish();

        match self.engine.execute_model(input) {
            Ok(output) if output.sample_outputs.len() == self.sequences_batch.len() => {
                self.apply_sample_outputs(output.sample_outputs);
            }
            Ok(output) => {
                self.fail_batch(Error::Engine(format!(
                    "engine returned {} outputs for {} sequences",
                    output.sample_outputs.len(),
                    self.sequences_batch.len()
                )));
                return;
            }
            Err(e) => {
                self.fail_batch(Error::Engine(e.to_string()));
                return;
            }
        }

        // stream deltas for everything that ran this step
        for i in 0..self.sequences_batch.len() {
            let scheduled = self.sequences_batch[i];
            let Some(request) = self.requests.get_mut(&scheduled.request_id) else {
                continue;
            };
            if request.stream {
                self.response_handler
                    .on_sequence_stream(request, scheduled.seq_index);
            }
        }
    }

    /// Whether the scheduler currently has no admitted or queued work.
    pub fn is_idle(&self) -> bool {
        self.requests.is_empty() && self.queue_rx.is_empty()
    }

    pub fn num_active_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    // ── step phases ────────────────────────────────────────────────────

    fn build_sequence_batch(&mut self) {
        self.drain_waiting_queue();
        self.reap_requests();
        self.assemble_batch();
    }

    /// Move newly submitted requests into the priority queue.
    fn drain_waiting_queue(&mut self) {
        while let Ok(mut request) = self.queue_rx.try_recv() {
            request.arrival = self.arrival_counter;
            self.arrival_counter += 1;
            // room for the prompt, the generation budget, the speculative
            // proposals, and the bonus token
            request.seq_capacity = request.prompt_tokens.len()
                + request.stopping_criteria.max_tokens.max(1)
                + self.config.num_speculative_tokens
                + 1;
            if request.sequences.is_empty() {
                request.add_sequence();
            }
            debug!(request_id = request.id, "admitted request");
            self.priority_queue.push(QueueEntry {
                priority: request.priority,
                arrival: request.arrival,
                id: request.id,
            });
            self.requests.insert(request.id, request);
        }
    }

    /// Hand finished and cancelled requests to the response handler and
    /// push everything else back into the priority queue, rebuilding the
    /// preemptable deque (low priority at the back).
    fn reap_requests(&mut self) {
        self.preemptable_candidates.clear();
        self.preemptable_set.clear();
        let batch = std::mem::take(&mut self.requests_batch);
        self.sequences_batch.clear();

        // reverse order walks from the lowest priority to the highest
        for id in batch.into_iter().rev() {
            let request = self.requests.get_mut(&id).expect("batched request is owned");
            if request.is_cancelled() {
                debug!(request_id = id, "request cancelled");
                self.finish_request(id, Some(Error::Cancelled));
                continue;
            }
            if request.is_finished() {
                self.finish_request(id, None);
                continue;
            }
            if request.should_expand_sequences() {
                request.expand_sequences();
            }
            let entry = QueueEntry {
                priority: request.priority,
                arrival: request.arrival,
                id,
            };
            self.preemptable_candidates.push_front(id);
            self.preemptable_set.insert(id);
            self.priority_queue.push(entry);
        }
    }

    /// Build the next batch from the priority queue, preempting scheduled
    /// low-priority requests when block allocation fails, then spread any
    /// leftover token budget across the batch.
    fn assemble_batch(&mut self) {
        // per-sequence fair share of the token budget
        let avg_token_budget = (self.config.max_tokens_per_batch
            / self.config.max_seqs_per_batch.max(1))
        .max(1);
        let mut remaining_tokens = self
            .config
            .max_tokens_per_batch
            .max(self.config.max_seqs_per_batch);
        let mut remaining_seqs = self.config.max_seqs_per_batch.max(1);

        let mut requests_batch = Vec::new();
        let mut sequences_batch = Vec::new();

        while remaining_tokens > 0 && remaining_seqs > 0 {
            let Some(&QueueEntry { id, .. }) = self.priority_queue.peek() else {
                break;
            };
            let request = self.requests.get_mut(&id).expect("queued request is owned");

            let mut candidates = Vec::with_capacity(request.sequences.len());
            let mut allocated_tokens = 0;
            let mut allocated_seqs = 0;
            let mut has_enough_blocks = true;
            for seq_index in 0..request.sequences.len() {
                let sequence = &mut request.sequences[seq_index];
                if sequence.is_finished() {
                    continue;
                }
                if allocated_tokens >= remaining_tokens || allocated_seqs >= remaining_seqs {
                    break;
                }
                let token_budget = avg_token_budget.min(remaining_tokens - allocated_tokens);
                match allocate_for(&mut self.block_manager, sequence, token_budget) {
                    Some(actual_tokens) => {
                        allocated_tokens += actual_tokens;
                        allocated_seqs += 1;
                        candidates.push(ScheduledSequence {
                            request_id: id,
                            seq_index,
                            token_budget: actual_tokens,
                        });
                    }
                    None => {
                        has_enough_blocks = false;
                        break;
                    }
                }
            }

            if has_enough_blocks {
                self.priority_queue.pop();
                requests_batch.push(id);
                sequences_batch.extend(candidates);
                remaining_tokens -= allocated_tokens;
                remaining_seqs -= allocated_seqs;

                // a scheduled request is no longer a preemption candidate
                if self.preemptable_candidates.front() == Some(&id) {
                    self.preemptable_candidates.pop_front();
                    self.preemptable_set.remove(&id);
                }
                continue;
            }

            // out of blocks: preempt the lowest-priority scheduled request
            // and retry the same candidate
            if let Some(victim_id) = self.preemptable_candidates.pop_back() {
                if !self.preemptable_set.remove(&victim_id) {
                    continue;
                }
                if victim_id != id {
                    warn!(
                        request_id = victim_id,
                        "preempting request to free cache blocks"
                    );
                    let victim = self
                        .requests
                        .get_mut(&victim_id)
                        .expect("preemptable request is owned");
                    for sequence in victim.sequences.iter_mut() {
                        self.block_manager.release(sequence);
                    }
                }
                continue;
            }

            // nothing left to preempt; schedule the sequences that fit
            if !candidates.is_empty() {
                self.priority_queue.pop();
                requests_batch.push(id);
                sequences_batch.extend(candidates);
                remaining_tokens -= allocated_tokens;
                remaining_seqs -= allocated_seqs;
            }
            break;
        }

        // hand leftover token budget to sequences that can use more of it
        if remaining_tokens > 0 {
            for scheduled in sequences_batch.iter_mut() {
                let request = self
                    .requests
                    .get_mut(&scheduled.request_id)
                    .expect("scheduled request is owned");
                let sequence = &mut request.sequences[scheduled.seq_index];
                remaining_tokens += scheduled.token_budget;
                let Some(actual_tokens) =
                    allocate_for(&mut self.block_manager, sequence, remaining_tokens)
                else {
                    break;
                };
                scheduled.token_budget = actual_tokens;
                remaining_tokens -= actual_tokens;
                if remaining_tokens == 0 {
                    break;
                }
            }
        }

        self.requests_batch = requests_batch;
        self.sequences_batch = sequences_batch;

        // the head request cannot fit even after preempting everything
        if self.sequences_batch.is_empty() {
            if let Some(&QueueEntry { id, .. }) = self.priority_queue.peek() {
                self.priority_queue.pop();
                error!(
                    request_id = id,
                    "not enough cache capacity to schedule a single sequence"
                );
                self.finish_request(id, Some(Error::OutOfCapacity));
            }
        }
    }

    /// Feed sampled tokens back into the sequences: one token appends, a
    /// multi-token output validates speculative proposals.
    fn apply_sample_outputs(&mut self, sample_outputs: Vec<crate::engine::SampleOutput>) {
        for (scheduled, sample) in self.sequences_batch.iter().zip(sample_outputs) {
            let request = self
                .requests
                .get_mut(&scheduled.request_id)
                .expect("scheduled request is owned");
            let sequence = &mut request.sequences[scheduled.seq_index];
            if sample.token_ids.is_empty() || sequence.is_prefill_stage() {
                // mid-prompt chunk: nothing was sampled
                continue;
            }
            if sample.token_ids.len() == 1 {
                let logprob = build_logprob(sequence, &sample, 0);
                sequence.append_token(sample.token_ids[0] as i32, logprob);
            } else {
                sequence.validate_tokens(&sample.token_ids);
            }
        }
    }

    /// Abort every request in the current batch (engine failure). The
    /// batch's kv state was never computed, so the blocks are dropped
    /// without publishing anything to the prefix cache.
    fn fail_batch(&mut self, error: Error) {
        error!("forward pass failed: {error}");
        let batch = std::mem::take(&mut self.requests_batch);
        self.sequences_batch.clear();
        for id in batch {
            if let Some(request) = self.requests.get_mut(&id) {
                for sequence in request.sequences.iter_mut() {
                    sequence.release_blocks();
                }
            }
            self.finish_request(id, Some(error.clone()));
        }
    }

    /// Release the request's blocks (publishing reusable kv state to the
    /// prefix cache) and fire its final callback.
    fn finish_request(&mut self, id: RequestId, status: Option<Error>) {
        let Some(mut request) = self.requests.remove(&id) else {
            return;
        };
        self.preemptable_set.remove(&id);
        for sequence in request.sequences.iter_mut() {
            self.block_manager.release(sequence);
        }
        self.response_handler.on_request_finish(request, status);
    }
}

/// Reserve blocks so `sequence` can process up to `token_budget` more
/// tokens. Matches shared prefix blocks first for a sequence that has none.
/// Returns the number of tokens the forward pass must process, or `None`
/// when the pool is exhausted.
fn allocate_for(
    block_manager: &mut BlockManager,
    sequence: &mut Sequence,
    token_budget: usize,
) -> Option<usize> {
    debug_assert!(token_budget > 0);
    if sequence.num_blocks() == 0 {
        block_manager.allocate_shared(sequence);
    }

    let num_kv_tokens = sequence.num_kv_cache_tokens();
    let target_tokens = (num_kv_tokens + token_budget).min(sequence.num_tokens());
    let actual_tokens = target_tokens - num_kv_tokens;
    match block_manager.allocate_slots(sequence, target_tokens) {
        Ok(()) => Some(actual_tokens),
        Err(_) => None,
    }
}

/// Assemble the logprob entry for the `idx`-th sampled token, when the
/// request asked for logprobs and the engine returned them.
fn build_logprob(
    sequence: &Sequence,
    sample: &crate::engine::SampleOutput,
    idx: usize,
) -> Option<LogProb> {
    if !sequence.sampling_params().logprobs {
        return None;
    }
    let logprob = sample.logprobs.as_ref()?.get(idx).copied()?;
    Some(LogProb {
        token_id: sample.token_ids[idx] as i32,
        logprob,
        top_tokens: sample
            .top_tokens
            .as_ref()
            .and_then(|t| t.get(idx).cloned())
            .unwrap_or_default(),
        top_logprobs: sample
            .top_logprobs
            .as_ref()
            .and_then(|t| t.get(idx).cloned())
            .unwrap_or_default(),
    })
}
