//! Control-flow combinators: loops, retry, deadlines, pacing, filtering,
//! sequencing and collection.
//!
//! These all work through the hook registry rather than nesting interpreters:
//! a loop is a cycle hook that rewinds the cursor, a timeout is a deadline
//! plus a step hook polling the clock, a sequence is a cycle hook feeding the
//! next element. Hook state (counters, iterators, retained values) lives in
//! the hook closure itself and survives rewinds.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_core::Stream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_stream::StreamExt;

use crate::hooks::{CycleNext, CycleOutcome, EndKey};
use crate::runtime::Branch;
use crate::step::{boxed, lock, peek, BoxValue, StepOutput, StepScope};
use crate::task::Task;

/// End-of-cycle value retained by `throttle`/`filter` for closed cycles.
type Retained = Arc<Mutex<Option<BoxValue>>>;

/// Arms (once) a cycle hook that records the end-of-cycle snapshot into
/// `retained` on every exhaustion.
fn arm_cycle_observer(scope: &mut StepScope<'_>, slot: &mut Option<Retained>) {
    if let Some(observer) = slot.take() {
        scope.hooks.arm_cycle(
            scope.index,
            Box::new(move |_, snapshot| {
                *lock(&observer) = snapshot.map(|value| value.clone_boxed());
                CycleOutcome::Done
            }),
        );
    }
}

impl<T: Any + Send + Clone> Task<T> {
    // === Loops ===

    /// Re-runs the steps after this point `count` more times.
    pub fn repeat(self, count: usize) -> Self {
        let mut remaining = count;
        self.rewind_cycle("repeat", move |_| {
            if remaining == 0 {
                false
            } else {
                remaining -= 1;
                true
            }
        })
    }

    /// Re-runs the steps after this point while `pred` approves the current
    /// success value.
    pub fn repeat_while<F>(self, mut pred: F) -> Self
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        self.rewind_cycle("repeat_while", move |value| match value {
            Some(value) => pred(value),
            None => false,
        })
    }

    /// Shared skeleton for the rewinding loops: a cycle hook that consults
    /// `pred` on each successful exhaustion and rewinds to the step after the
    /// loop marker. An earlier hook that already rewound short-circuits the
    /// predicate, leaving its state untouched for the next cycle.
    fn rewind_cycle<F>(self, name: &'static str, pred: F) -> Self
    where
        F: FnMut(Option<&T>) -> bool + Send + 'static,
    {
        let mut armed = Some(pred);
        self.push_step(name, None, move |scope: &mut StepScope<'_>| {
            if let Some(mut pred) = armed.take() {
                let target = scope.index + 1;
                scope.hooks.arm_cycle(
                    scope.index,
                    Box::new(move |state, _| {
                        if state.is_exhausted()
                            && state.branch == Branch::Success
                            && pred(state.success.as_ref().and_then(|value| peek::<T>(value)))
                        {
                            state.rewind(target);
                        }
                        CycleOutcome::Done
                    }),
                );
            }
            StepOutput::Done
        })
    }

    /// Retries a failed run while `pred` approves: the failure branch is
    /// flipped back to success and the cursor rewinds to the step that
    /// failed. A run that never fails never consults `pred`.
    pub fn retry_while<F>(self, pred: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let mut armed = Some(pred);
        self.push_step("retry_while", None, move |scope: &mut StepScope<'_>| {
            if let Some(mut pred) = armed.take() {
                let own = scope.index;
                scope.hooks.arm_cycle(
                    own,
                    Box::new(move |state, _| {
                        if state.is_exhausted() && state.branch == Branch::Fail && pred() {
                            tracing::debug!(rewind_to = ?state.reject, "retrying failed run");
                            state.branch = Branch::Success;
                            state.failure = None;
                            let target = state.reject.take().unwrap_or(own);
                            state.rewind(target);
                        }
                        CycleOutcome::Done
                    }),
                );
            }
            StepOutput::Done
        })
    }

    // === Timing ===

    /// Arms a deadline covering everything after this point. Expiry flips
    /// the run onto the failure branch with a timeout error and abandons any
    /// pending computation mid-await. Re-executing this step (a retry or an
    /// enclosing loop) restarts the clock, so every attempt gets the full
    /// window.
    pub fn timeout(self, limit: Duration) -> Self {
        self.push_step("timeout", None, move |scope: &mut StepScope<'_>| {
            let armed = Instant::now();
            let owner = scope.index;
            scope.state.arm_deadline(owner, armed, limit);
            scope.hooks.arm_step(
                owner,
                Box::new(move |state| {
                    let elapsed = armed.elapsed();
                    if elapsed >= limit {
                        state.record_timeout(owner, elapsed, limit);
                    }
                }),
            );
            StepOutput::Done
        })
    }

    /// Suspends the pipeline for `wait`, passing the value through.
    pub fn delay(self, wait: Duration) -> Self {
        self.push_step("delay", Some(Branch::Success), move |scope: &mut StepScope<'_>| {
            let value = match scope.peek_value::<T>() {
                Ok(value) => value.clone(),
                Err(error) => return StepOutput::Fail(error),
            };
            StepOutput::Suspend(Box::pin(async move {
                tokio::time::sleep(wait).await;
                Ok(Some(boxed(value)))
            }))
        })
    }

    /// Closes the pipeline for `window` after each value it passes. A value
    /// arriving while closed skips everything after this point and completes
    /// the cycle with the retained end-of-cycle value instead, so dropped
    /// values never reach downstream collectors.
    pub fn throttle(self, window: Duration) -> Self {
        let retained: Retained = Arc::new(Mutex::new(None));
        let mut observer = Some(Arc::clone(&retained));
        let mut reopen_at: Option<Instant> = None;
        self.push_step("throttle", Some(Branch::Success), move |scope: &mut StepScope<'_>| {
            arm_cycle_observer(scope, &mut observer);
            let now = Instant::now();
            let open = reopen_at.map_or(true, |at| now >= at);
            if open {
                reopen_at = Some(now + window);
                StepOutput::Done
            } else {
                tracing::trace!(step = scope.index, "throttle closed, skipping cycle");
                let substitute = lock(&retained).as_ref().map(|value| value.clone_boxed());
                scope.fast_forward(substitute);
                StepOutput::Done
            }
        })
    }

    /// Drops values rejected by `pred`: a rejected value skips everything
    /// after this point and completes the cycle with the retained
    /// end-of-cycle value.
    pub fn filter<F>(self, mut pred: F) -> Self
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        let retained: Retained = Arc::new(Mutex::new(None));
        let mut observer = Some(Arc::clone(&retained));
        self.push_step("filter", Some(Branch::Success), move |scope: &mut StepScope<'_>| {
            arm_cycle_observer(scope, &mut observer);
            let keep = match scope.peek_value::<T>() {
                Ok(value) => pred(value),
                Err(_) => false,
            };
            if keep {
                StepOutput::Done
            } else {
                let substitute = lock(&retained).as_ref().map(|value| value.clone_boxed());
                scope.fast_forward(substitute);
                StepOutput::Done
            }
        })
    }

    // === Sequencing ===

    /// Pipeline that emits each element of `source`, re-running the steps
    /// after this point once per element. The run completes with the value
    /// produced for the final element.
    pub fn sequence_from_iter<I>(source: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let mut source = Some(source.into_iter());
        Task::new().push_step("sequence", Some(Branch::Success), move |scope: &mut StepScope<'_>| {
            let mut iter = match source.take() {
                Some(iter) => iter,
                // Re-execution under an enclosing loop: the slot already
                // holds the current element.
                None => return StepOutput::Done,
            };
            let target = scope.index + 1;
            match iter.next() {
                Some(first) => scope.put_value(first),
                None => {
                    // Zero elements, zero executions of the rest of the list.
                    tracing::debug!("sequence source is empty");
                    scope.fast_forward(None);
                }
            }
            scope.hooks.arm_cycle(
                scope.index,
                Box::new(move |state, _| {
                    if state.is_exhausted() && state.branch == Branch::Success {
                        if let Some(item) = iter.next() {
                            state.success = Some(boxed(item));
                            state.rewind(target);
                        }
                    }
                    CycleOutcome::Done
                }),
            );
            StepOutput::Done
        })
    }

    /// Pipeline that emits each element of an asynchronous stream. Every
    /// element, the first included, is pulled by the exhaustion hook, so a
    /// source that ends immediately runs nothing downstream and the pipeline
    /// suspends between elements. An armed deadline bounds each pull.
    pub fn sequence_from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        let mut first = Some(Arc::new(AsyncMutex::new(Box::pin(stream))));
        Task::new().push_step(
            "sequence_stream",
            Some(Branch::Success),
            move |scope: &mut StepScope<'_>| {
                let source = match first.take() {
                    Some(source) => source,
                    None => return StepOutput::Done,
                };
                let target = scope.index + 1;
                let finished = Arc::new(AtomicBool::new(false));
                scope.hooks.arm_cycle(
                    scope.index,
                    Box::new(move |state, _| {
                        if !state.is_exhausted()
                            || state.branch != Branch::Success
                            || finished.load(Ordering::Acquire)
                        {
                            return CycleOutcome::Done;
                        }
                        let source = Arc::clone(&source);
                        let finished = Arc::clone(&finished);
                        CycleOutcome::Deferred(Box::pin(async move {
                            match source.lock().await.next().await {
                                Some(item) => CycleNext {
                                    value: Some(boxed(item)),
                                    rewind_to: Some(target),
                                },
                                None => {
                                    finished.store(true, Ordering::Release);
                                    CycleNext { value: None, rewind_to: None }
                                }
                            }
                        }))
                    }),
                );
                scope.fast_forward(None);
                StepOutput::Done
            },
        )
    }

    // === Collection ===

    /// Folds every value reaching this step. Under an enclosing loop the
    /// written accumulator becomes the next cycle's input when the types
    /// line up, so the fold compounds.
    pub fn reduce<R, F>(self, initial: R, mut f: F) -> Task<R>
    where
        R: Any + Send + Clone,
        F: FnMut(R, T) -> R + Send + 'static,
    {
        let mut acc = initial;
        self.push_step("reduce", Some(Branch::Success), move |scope: &mut StepScope<'_>| {
            match scope.take_value::<T>() {
                Ok(item) => {
                    acc = f(acc.clone(), item);
                    scope.put_value(acc.clone());
                    StepOutput::Done
                }
                Err(error) => StepOutput::Fail(error),
            }
        })
        .retyped()
    }

    /// Collects the values approved by `pred` across cycles. A run where
    /// nothing reached the collector still completes with an empty vector.
    pub fn collect_when<F>(mut self, mut pred: F) -> Task<Vec<T>>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        let all: Arc<Mutex<Vec<T>>> = Arc::new(Mutex::new(Vec::new()));
        let fixup = Arc::clone(&all);
        self.runtime.hooks.arm_end(
            EndKey::Named("collect"),
            Box::new(move |state| {
                if lock(&fixup).is_empty() {
                    state.success = Some(boxed(Vec::<T>::new()));
                }
            }),
        );
        self.push_step("collect_when", Some(Branch::Success), move |scope: &mut StepScope<'_>| {
            match scope.take_value::<T>() {
                Ok(item) => {
                    let mut all = lock(&all);
                    if pred(&item) {
                        all.push(item);
                    }
                    scope.put_value(all.clone());
                    StepOutput::Done
                }
                Err(error) => StepOutput::Fail(error),
            }
        })
        .retyped()
    }

    /// Collects every value across cycles.
    pub fn collect_all(self) -> Task<Vec<T>> {
        self.collect_when(|_| true)
    }

    // === Cleanup ===

    /// Registers a cleanup handler firing exactly once when the run ends.
    /// The handler receives the success value captured the last time this
    /// step executed, or `None` when the run was failing at that point.
    pub fn ensure<F>(self, handler: F) -> Self
    where
        F: FnMut(Option<T>) + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(handler));
        self.push_step("ensure", None, move |scope: &mut StepScope<'_>| {
            let captured = match scope.state.branch {
                Branch::Success => scope.peek_value::<T>().ok().cloned(),
                Branch::Fail => None,
            };
            let handler = Arc::clone(&shared);
            scope.hooks.arm_end(
                EndKey::At(scope.index),
                Box::new(move |_| {
                    (lock(&handler))(captured.clone());
                }),
            );
            StepOutput::Done
        })
    }
}

impl<U: Any + Send + Clone> Task<Vec<U>> {
    /// Flattens a vector value: emits the first element immediately and one
    /// more per cycle until drained, rewinding to the step after this one
    /// each time.
    pub fn flat(self) -> Task<U> {
        self.push_step("flat", Some(Branch::Success), move |scope: &mut StepScope<'_>| {
            let mut rest: VecDeque<U> = match scope.take_value::<Vec<U>>() {
                Ok(items) => items.into(),
                Err(error) => return StepOutput::Fail(error),
            };
            let target = scope.index + 1;
            match rest.pop_front() {
                Some(first) => scope.put_value(first),
                None => {
                    // An empty vector emits nothing this cycle.
                    tracing::debug!("flattened an empty vector");
                    scope.fast_forward(None);
                }
            }
            scope.hooks.arm_cycle(
                scope.index,
                Box::new(move |state, _| {
                    if state.is_exhausted() && state.branch == Branch::Success {
                        if let Some(item) = rest.pop_front() {
                            state.success = Some(boxed(item));
                            state.rewind(target);
                        }
                    }
                    CycleOutcome::Done
                }),
            );
            StepOutput::Done
        })
        .retyped()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
