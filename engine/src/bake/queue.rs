//! Bake Queue
//!
//! Runs several bake requests one after another through a single
//! [`BakeOrchestrator`]. Each bake temporarily replaces the shared scene, so
//! only one bake is ever active. The query backend is created once and reused
//! for every bake in the queue.
//!
//! # Example
//!
//! ```ignore
//! let mut queue = BakeQueue::new(BakeOrchestrator::new(backend, context));
//! queue.enqueue(level_a);
//! queue.enqueue(level_b);
//!
//! // Once per host tick
//! queue.step(&mut host);
//!
//! for outcome in queue.drain_outcomes() {
//!     // ...
//! }
//! ```

use std::collections::VecDeque;

use super::orchestrator::{BakeOrchestrator, BakeOutcome, BakeRequest, StepResult};
use super::query::PointVisibilityQuery;
use crate::scene::SceneHost;

/// What one queue step did.
#[derive(Clone, Debug, PartialEq)]
pub enum QueueStep {
    /// No active bake and nothing queued
    Idle,
    /// The active bake was stepped
    Running(StepResult),
}

pub struct BakeQueue<Q: PointVisibilityQuery> {
    orchestrator: BakeOrchestrator<Q>,
    pending: VecDeque<BakeRequest>,
    outcomes: Vec<BakeOutcome>,
}

impl<Q: PointVisibilityQuery> BakeQueue<Q> {
    pub fn new(orchestrator: BakeOrchestrator<Q>) -> Self {
        Self {
            orchestrator,
            pending: VecDeque::new(),
            outcomes: Vec::new(),
        }
    }

    pub fn orchestrator(&self) -> &BakeOrchestrator<Q> {
        &self.orchestrator
    }

    /// Add a request to the back of the queue.
    pub fn enqueue(&mut self, request: BakeRequest) {
        log::debug!(
            "[BakeQueue] queued `{}` ({} waiting)",
            request.name,
            self.pending.len() + 1
        );
        self.pending.push_back(request);
    }

    /// Requests waiting behind the active bake.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && !self.orchestrator.is_running()
    }

    /// Advance the active bake, starting the next queued one if none is active.
    pub fn step(&mut self, host: &mut dyn SceneHost) -> QueueStep {
        if !self.orchestrator.is_running() {
            let Some(request) = self.pending.pop_front() else {
                return QueueStep::Idle;
            };
            if let Err(e) = self.orchestrator.start(request) {
                log::error!("[BakeQueue] could not start bake: {e}");
                return QueueStep::Idle;
            }
        }

        let result = self.orchestrator.step(host);
        if matches!(result, StepResult::Done | StepResult::Aborted(_))
            && let Some(outcome) = self.orchestrator.take_outcome()
        {
            log::info!(
                "[BakeQueue] `{}` finished ({}), {} remaining",
                outcome.name,
                if outcome.result.is_ok() { "ok" } else { "aborted" },
                self.pending.len()
            );
            self.outcomes.push(outcome);
        }
        QueueStep::Running(result)
    }

    /// Step until every queued bake has finished.
    pub fn run_all(&mut self, host: &mut dyn SceneHost) -> Vec<BakeOutcome> {
        while self.step(host) != QueueStep::Idle {}
        self.drain_outcomes()
    }

    /// Outcomes collected since the last drain, in completion order.
    pub fn drain_outcomes(&mut self) -> Vec<BakeOutcome> {
        std::mem::take(&mut self.outcomes)
    }

    /// Drop every queued request and cancel the active bake. The active bake
    /// is torn down immediately and its outcome recorded.
    pub fn cancel_all(&mut self, host: &mut dyn SceneHost) {
        let dropped = self.pending.len();
        self.pending.clear();
        if self.orchestrator.is_running() {
            self.orchestrator.cancel();
            self.step(host);
        }
        log::info!("[BakeQueue] cancelled; dropped {dropped} queued bakes");
    }
}
