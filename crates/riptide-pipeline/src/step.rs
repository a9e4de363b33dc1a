//! Step primitives: type-erased slot values, the step shape the interpreter
//! executes, and the handled-call adapter routing every outcome into exactly
//! one of two continuations.

use std::any::{type_name, Any};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_core::future::BoxFuture;
use riptide_types::TaskError;

use crate::hooks::HookSet;
use crate::runtime::{Branch, Cursor, RunState};

// ---------------------------------------------------------------------------
// Type-erased values
// ---------------------------------------------------------------------------

/// Object-safe `Any + Clone` bound for slot values.
///
/// Everything flowing through a pipeline is `Clone + Send + 'static`:
/// end-of-cycle retention (`filter`/`throttle`), cleanup capture (`ensure`),
/// and collectors all duplicate the slot value. Non-clonable resources travel
/// in an `Arc`.
pub(crate) trait AnyValue: Any + Send {
    fn clone_boxed(&self) -> BoxValue;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any + Send + Clone> AnyValue for T {
    fn clone_boxed(&self) -> BoxValue {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

pub(crate) type BoxValue = Box<dyn AnyValue>;

pub(crate) fn boxed<T: Any + Send + Clone>(value: T) -> BoxValue {
    Box::new(value)
}

/// Recovers a concrete value, naming the expected type on mismatch.
pub(crate) fn unbox<T: Any>(value: BoxValue) -> Result<T, TaskError> {
    value.into_any().downcast::<T>().map(|b| *b).map_err(|_| TaskError::TypeMismatch {
        expected: type_name::<T>(),
    })
}

pub(crate) fn peek<T: Any>(value: &BoxValue) -> Option<&T> {
    value.as_any().downcast_ref::<T>()
}

/// Poison-tolerant lock: a panicked holder does not poison the pipeline.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Step shape
// ---------------------------------------------------------------------------

/// Future produced by a suspending step. `Ok(None)` leaves the success slot
/// empty (a wait that carried no value), `Ok(Some(v))` writes it.
pub(crate) type StepFuture = BoxFuture<'static, Result<Option<BoxValue>, TaskError>>;

/// What one step execution produced.
pub(crate) enum StepOutput {
    /// Synchronously finished; the step already updated the state.
    Done,
    /// Synchronous failure, routed to the error continuation.
    Fail(TaskError),
    /// Pending computation; the interpreter suspends and settles it later.
    Suspend(StepFuture),
}

/// What a step sees while executing: its own position, the list length (the
/// fast-forward target), the mutable run state, and the hook registry.
pub(crate) struct StepScope<'a> {
    pub index: usize,
    pub total: usize,
    pub state: &'a mut RunState,
    pub hooks: &'a mut HookSet,
}

impl StepScope<'_> {
    pub(crate) fn take_value<T: Any>(&mut self) -> Result<T, TaskError> {
        match self.state.success.take() {
            Some(value) => unbox::<T>(value),
            None => Err(TaskError::NoValue),
        }
    }

    pub(crate) fn peek_value<T: Any>(&self) -> Result<&T, TaskError> {
        match &self.state.success {
            Some(value) => peek::<T>(value).ok_or(TaskError::TypeMismatch {
                expected: type_name::<T>(),
            }),
            None => Err(TaskError::NoValue),
        }
    }

    pub(crate) fn put_value<T: Any + Send + Clone>(&mut self, value: T) {
        self.state.success = Some(boxed(value));
    }

    /// Jump the cursor past the end of the list, substituting `value` for the
    /// success slot (`filter`/`throttle` fast-forward).
    pub(crate) fn fast_forward(&mut self, value: Option<BoxValue>) {
        tracing::debug!(from = self.index, "fast-forward to end of list");
        self.state.success = value;
        self.state.cursor = Cursor::At(self.total);
    }
}

pub(crate) type StepFn = Box<dyn FnMut(&mut StepScope<'_>) -> StepOutput + Send>;

/// One unit of pipeline work. `guard: None` executes on either branch (steps
/// whose only job is arming hooks); `Some(branch)` skips unless active.
pub(crate) struct Step {
    pub name: &'static str,
    pub guard: Option<Branch>,
    pub run: StepFn,
}

// ---------------------------------------------------------------------------
// Handled-call adapter
// ---------------------------------------------------------------------------

/// Executes one step and routes its outcome: a synchronous failure goes to
/// the failure continuation immediately, a pending computation is returned
/// for the interpreter to await, and a synchronous completion needs nothing
/// further. Exactly one continuation ever observes a given outcome.
pub(crate) fn call_handled(step: &mut Step, scope: &mut StepScope<'_>) -> Option<StepFuture> {
    match (step.run)(scope) {
        StepOutput::Done => None,
        StepOutput::Fail(error) => {
            scope.state.record_failure(scope.index, error);
            None
        }
        StepOutput::Suspend(future) => Some(future),
    }
}

/// The success/error continuation pair for a settled pending computation,
/// the only place a settled outcome touches the branch table.
pub(crate) fn settle(state: &mut RunState, index: usize, settled: Result<Option<BoxValue>, TaskError>) {
    match settled {
        Ok(value) => state.success = value,
        Err(error) => state.record_failure(index, error),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_parts() -> (RunState, HookSet) {
        (RunState::new(), HookSet::default())
    }

    #[test]
    fn unbox_roundtrip_and_mismatch() {
        let value = boxed(7u32);
        assert_eq!(unbox::<u32>(value).unwrap(), 7);

        let err = unbox::<String>(boxed(7u32)).unwrap_err();
        assert!(matches!(err, TaskError::TypeMismatch { .. }));
    }

    #[test]
    fn clone_boxed_duplicates_the_value() {
        let original = boxed(vec![1, 2, 3]);
        let copy = original.clone_boxed();
        assert_eq!(unbox::<Vec<i32>>(original).unwrap(), vec![1, 2, 3]);
        assert_eq!(unbox::<Vec<i32>>(copy).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn call_handled_routes_sync_failure() {
        let (mut state, mut hooks) = scope_parts();
        let mut scope = StepScope { index: 3, total: 5, state: &mut state, hooks: &mut hooks };
        let mut step = Step {
            name: "boom",
            guard: None,
            run: Box::new(|_| StepOutput::Fail(TaskError::failed("x"))),
        };

        assert!(call_handled(&mut step, &mut scope).is_none());
        assert_eq!(state.branch, Branch::Fail);
        assert_eq!(state.reject, Some(3));
        assert!(state.failure.is_some());
    }

    #[test]
    fn call_handled_returns_pending_work() {
        let (mut state, mut hooks) = scope_parts();
        let mut scope = StepScope { index: 0, total: 1, state: &mut state, hooks: &mut hooks };
        let mut step = Step {
            name: "later",
            guard: None,
            run: Box::new(|_| StepOutput::Suspend(Box::pin(async { Ok(Some(boxed(1u8))) }))),
        };

        assert!(call_handled(&mut step, &mut scope).is_some());
        assert_eq!(state.branch, Branch::Success);
        assert!(state.failure.is_none());
    }

    #[test]
    fn settle_writes_success_or_flips_branch() {
        let mut state = RunState::new();
        settle(&mut state, 2, Ok(Some(boxed("v"))));
        assert_eq!(state.branch, Branch::Success);
        assert_eq!(peek::<&str>(state.success.as_ref().unwrap()), Some(&"v"));

        settle(&mut state, 2, Err(TaskError::failed("late")));
        assert_eq!(state.branch, Branch::Fail);
        assert_eq!(state.reject, Some(2));
    }

    #[test]
    fn fast_forward_moves_cursor_and_substitutes_slot() {
        let (mut state, mut hooks) = scope_parts();
        let mut scope = StepScope { index: 1, total: 4, state: &mut state, hooks: &mut hooks };
        scope.fast_forward(Some(boxed(9i64)));
        assert_eq!(state.cursor, Cursor::At(4));
        assert_eq!(peek::<i64>(state.success.as_ref().unwrap()), Some(&9));
    }
}
