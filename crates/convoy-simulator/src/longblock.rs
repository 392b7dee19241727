//! Longblock judging.
//!
//! A longblock signal cannot be cleared synchronously: the convoy files a
//! request and keeps waiting. Once per tick, after every convoy has stepped,
//! the judge walks the pending requests in filing order and decides each
//! one. Invalidated requests are dropped without a verdict.

use convoy_domain::{ConvoyId, TileCoord};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// A pending judging request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongblockRequest {
    pub convoy: ConvoyId,
    pub signal_tile: TileCoord,
    /// Route index of the signal
    pub signal_index: usize,
    /// Route index where the block behind the signal begins
    pub next_block: usize,
    pub filed_tick: u64,
    pub valid: bool,
}

/// Outcome of judging one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pending,
    Granted,
    Denied,
    /// Outstanding beyond the timeout; treated as a denial
    TimedOut,
    /// Invalidated before judging
    Dropped,
}

/// What the convoy remembers about its own request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongblockTicket {
    pub signal_tile: TileCoord,
    pub signal_index: usize,
    pub verdict: Verdict,
}

/// FIFO of pending longblock requests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LongblockJudge {
    queue: VecDeque<LongblockRequest>,
}

impl LongblockJudge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// File a request; a convoy has at most one outstanding request, a new
    /// one replaces the old one.
    pub fn file(&mut self, request: LongblockRequest) {
        self.queue.retain(|r| r.convoy != request.convoy);
        debug!(
            convoy = %request.convoy,
            signal = %request.signal_tile,
            tick = request.filed_tick,
            "Longblock request filed"
        );
        self.queue.push_back(request);
    }

    #[must_use]
    pub fn pending_for(&self, convoy: ConvoyId) -> Option<&LongblockRequest> {
        self.queue.iter().find(|r| r.convoy == convoy && r.valid)
    }

    /// Invalidate every request at a removed or changed signal.
    pub fn invalidate_signal(&mut self, tile: TileCoord) -> usize {
        let mut count = 0;
        for request in self.queue.iter_mut().filter(|r| r.signal_tile == tile && r.valid) {
            request.valid = false;
            count += 1;
        }
        count
    }

    /// Invalidate the request of a destroyed or rerouted convoy.
    pub fn invalidate_convoy(&mut self, convoy: ConvoyId) {
        for request in self.queue.iter_mut().filter(|r| r.convoy == convoy) {
            request.valid = false;
        }
    }

    /// One judging pass.
    ///
    /// Every valid request is decided by `decide` in filing order. Invalid
    /// requests are dropped without calling `decide`. A request `decide`
    /// leaves `Pending` stays queued for the next pass unless it is older
    /// than `timeout` ticks, in which case it is removed as `TimedOut`.
    pub fn run_pass(
        &mut self,
        tick: u64,
        timeout: u64,
        mut decide: impl FnMut(&LongblockRequest) -> Verdict,
    ) -> Vec<(LongblockRequest, Verdict)> {
        let mut results = Vec::with_capacity(self.queue.len());
        let mut kept = VecDeque::new();

        while let Some(request) = self.queue.pop_front() {
            if !request.valid {
                results.push((request, Verdict::Dropped));
                continue;
            }
            match decide(&request) {
                Verdict::Pending if tick.saturating_sub(request.filed_tick) > timeout => {
                    results.push((request, Verdict::TimedOut));
                }
                Verdict::Pending => kept.push_back(request),
                verdict => results.push((request, verdict)),
            }
        }
        self.queue = kept;
        results
    }

    pub fn iter(&self) -> impl Iterator<Item = &LongblockRequest> {
        self.queue.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
