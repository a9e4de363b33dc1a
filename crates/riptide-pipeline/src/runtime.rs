//! The step interpreter.
//!
//! Owns the flat step list, an explicit cursor, the two-branch slot table,
//! and the hook registry. `run` drives the cursor to exhaustion, firing
//! `Step` hooks after every executed step, `Cycle` hooks once per exhaustion
//! (they may rewind the cursor for loops), and `End` hooks exactly once at
//! the true end. Every internal await is bounded by the earliest armed
//! deadline so a stuck pending computation cannot outlive a timeout.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_core::future::BoxFuture;
use riptide_types::{Env, TaskError};
use tokio::time::Instant;

use crate::hooks::{CycleNext, CycleOutcome, HookSet};
use crate::step::{call_handled, settle, BoxValue, Step, StepScope};

// ---------------------------------------------------------------------------
// Branch and cursor
// ---------------------------------------------------------------------------

/// Exactly one branch is active at any time; failure handling writes the
/// `Fail` slot and flips the active id.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Branch {
    Success,
    Fail,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Cursor {
    At(usize),
    Exhausted,
}

#[derive(Clone, Copy)]
pub(crate) struct DeadlineEntry {
    pub at: Instant,
    pub armed: Instant,
    pub limit: Duration,
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Mutable interpreter state shared with steps and hooks.
pub(crate) struct RunState {
    pub branch: Branch,
    pub success: Option<BoxValue>,
    pub failure: Option<TaskError>,
    pub cursor: Cursor,
    /// Index of the step that was running when the most recent failure
    /// occurred; the retry rewind target.
    pub reject: Option<usize>,
    /// Deadlines keyed by the timeout step that armed them. Re-execution of a
    /// timeout step replaces its entry with a fresh clock.
    pub deadlines: BTreeMap<usize, DeadlineEntry>,
    pub env: Env,
}

impl RunState {
    pub(crate) fn new() -> Self {
        Self {
            branch: Branch::Success,
            success: None,
            failure: None,
            cursor: Cursor::At(0),
            reject: None,
            deadlines: BTreeMap::new(),
            env: Env::new(),
        }
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.cursor == Cursor::Exhausted
    }

    pub(crate) fn record_failure(&mut self, index: usize, error: TaskError) {
        tracing::debug!(step = index, error = %error, "step failed");
        self.failure = Some(error);
        self.branch = Branch::Fail;
        self.reject = Some(index);
    }

    /// Deadline expiry. The reject position lands just before the timeout
    /// step, so a retry re-executes it and arms a fresh deadline. An already
    /// failed run is left untouched.
    pub(crate) fn record_timeout(&mut self, owner: usize, elapsed: Duration, limit: Duration) {
        if self.branch == Branch::Fail {
            return;
        }
        tracing::debug!(step = owner, ?elapsed, ?limit, "deadline elapsed, failing run");
        self.failure = Some(TaskError::Timeout { elapsed, limit });
        self.branch = Branch::Fail;
        self.reject = Some(owner.saturating_sub(1));
    }

    pub(crate) fn arm_deadline(&mut self, owner: usize, armed: Instant, limit: Duration) {
        self.deadlines.insert(owner, DeadlineEntry { at: armed + limit, armed, limit });
    }

    pub(crate) fn earliest_deadline(&self) -> Option<(usize, DeadlineEntry)> {
        self.deadlines
            .iter()
            .min_by_key(|(_, entry)| entry.at)
            .map(|(owner, entry)| (*owner, *entry))
    }

    /// Cycle rewind: move the cursor back and forget the reject position.
    pub(crate) fn rewind(&mut self, to: usize) {
        tracing::debug!(to, "cycle rewind");
        self.cursor = Cursor::At(to);
        self.reject = None;
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub(crate) struct Runtime {
    pub steps: Vec<Step>,
    pub state: RunState,
    pub hooks: HookSet,
}

impl Runtime {
    pub(crate) fn new() -> Self {
        Self { steps: Vec::new(), state: RunState::new(), hooks: HookSet::default() }
    }

    pub(crate) fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Front insertion (`provide` steps execute before everything declared
    /// earlier). Only used at build time, before any position-keyed hook
    /// exists.
    pub(crate) fn push_front(&mut self, step: Step) {
        self.steps.insert(0, step);
    }

    /// Drive the pipeline to its terminal value.
    pub(crate) async fn run(&mut self) -> Result<BoxValue, TaskError> {
        tracing::debug!(steps = self.steps.len(), "starting run");
        loop {
            // ---- step phase ----
            loop {
                let index = match self.state.cursor {
                    Cursor::At(i) if i < self.steps.len() => i,
                    Cursor::At(_) => {
                        self.state.cursor = Cursor::Exhausted;
                        break;
                    }
                    Cursor::Exhausted => break,
                };

                let Runtime { steps, state, hooks } = self;
                let total = steps.len();
                let step = &mut steps[index];
                if let Some(required) = step.guard {
                    if required != state.branch {
                        tracing::trace!(step = index, name = step.name, "guard mismatch, skipping");
                        state.cursor = Cursor::At(index + 1);
                        continue;
                    }
                }

                tracing::trace!(step = index, name = step.name, "executing step");
                let mut scope = StepScope { index, total, state, hooks };
                if let Some(future) = call_handled(step, &mut scope) {
                    // the cursor advances before the suspension so resumption
                    // continues at the next step
                    self.state.cursor = Cursor::At(index + 1);
                    match bounded(self.state.earliest_deadline(), future).await {
                        Bounded::Settled(result) => settle(&mut self.state, index, result),
                        Bounded::Killed { owner, elapsed, limit } => {
                            self.state.record_timeout(owner, elapsed, limit);
                        }
                    }
                    self.fire_step_hooks();
                    continue;
                }

                // a failure or a fast-forward may have moved the cursor
                if self.state.cursor == Cursor::At(index) {
                    self.state.cursor = Cursor::At(index + 1);
                }
                self.fire_step_hooks();
            }

            // ---- exhaustion phase ----
            for future in self.fire_cycle_hooks() {
                match bounded(self.state.earliest_deadline(), future).await {
                    Bounded::Settled(next) => self.apply_cycle_next(next),
                    Bounded::Killed { owner, elapsed, limit } => {
                        self.state.record_timeout(owner, elapsed, limit);
                        break;
                    }
                }
            }

            if !self.state.is_exhausted() {
                continue;
            }

            self.fire_end_hooks();
            return self.terminal();
        }
    }

    fn fire_step_hooks(&mut self) {
        for (_, hook) in self.hooks.step.iter_mut() {
            hook(&mut self.state);
        }
    }

    /// Fires every cycle hook once for this exhaustion event, collecting
    /// deferred verdicts for the caller to await. Hooks fire in reverse
    /// position order so a combinator later in the list (an inner loop, a
    /// flattener with a backlog) rewinds before an enclosing source pulls
    /// its next element. Every hook sees the same snapshot of the success
    /// slot, taken before any of them ran.
    fn fire_cycle_hooks(&mut self) -> Vec<BoxFuture<'static, CycleNext>> {
        let snapshot = self.state.success.as_ref().map(|value| value.clone_boxed());
        let mut deferred = Vec::new();
        for (_, hook) in self.hooks.cycle.iter_mut().rev() {
            match hook(&mut self.state, snapshot.as_ref()) {
                CycleOutcome::Done => {}
                CycleOutcome::Deferred(future) => deferred.push(future),
            }
        }
        deferred
    }

    /// A deferred verdict only applies while the run is still exhausted; a
    /// hook that already rewound this cycle wins.
    fn apply_cycle_next(&mut self, next: CycleNext) {
        if !self.state.is_exhausted() {
            return;
        }
        if let Some(value) = next.value {
            self.state.success = Some(value);
        }
        if let Some(position) = next.rewind_to {
            self.state.rewind(position);
        }
    }

    fn fire_end_hooks(&mut self) {
        for (key, hook) in self.hooks.end.iter_mut() {
            tracing::trace!(?key, "firing end hook");
            hook(&mut self.state);
        }
    }

    fn terminal(&mut self) -> Result<BoxValue, TaskError> {
        tracing::debug!(branch = ?self.state.branch, "run finished");
        match self.state.branch {
            Branch::Success => self.state.success.take().ok_or(TaskError::NoValue),
            Branch::Fail => Err(self.state.failure.take().unwrap_or(TaskError::NoValue)),
        }
    }
}

enum Bounded<T> {
    Settled(T),
    Killed { owner: usize, elapsed: Duration, limit: Duration },
}

/// Awaits `future`, abandoning it if the deadline passes first. Dropping
/// the future is the out-of-band kill: the pending computation is
/// cancelled, not merely ignored. The deadline snapshot is owned, keeping
/// the run future free of borrows across the await.
async fn bounded<T>(
    deadline: Option<(usize, DeadlineEntry)>,
    future: BoxFuture<'static, T>,
) -> Bounded<T> {
    match deadline {
        Some((owner, entry)) => match tokio::time::timeout_at(entry.at, future).await {
            Ok(value) => Bounded::Settled(value),
            Err(_) => Bounded::Killed { owner, elapsed: entry.armed.elapsed(), limit: entry.limit },
        },
        None => Bounded::Settled(future.await),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
