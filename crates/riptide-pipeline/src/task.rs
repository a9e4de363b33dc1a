//! The pipeline value and its builder API.
//!
//! A [`Task`] is a lazily-built description: every combinator appends (or
//! prepends) a step to a flat list, and nothing executes until [`Task::run`].
//! The phantom parameter tracks the value type the pipeline currently
//! produces; the slots underneath are type-erased.

use std::any::{type_name, Any};
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;

use riptide_types::{Env, TaskError};
use tokio::sync::oneshot;

use crate::runtime::{Branch, Runtime};
use crate::step::{boxed, unbox, BoxValue, Step, StepOutput, StepScope};

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A lazily-built effect pipeline producing a `T`.
///
/// Building is pure: no step body runs, no clock starts, no callback is
/// registered until the pipeline is driven by [`Task::run`] or
/// [`Task::run_unsafe`]. Values flowing through a pipeline are
/// `Clone + Send + 'static`; wrap anything else in an `Arc`.
pub struct Task<T> {
    pub(crate) runtime: Runtime,
    _value: PhantomData<fn() -> T>,
}

impl Task<()> {
    /// The empty pipeline: completes immediately with `()`.
    pub fn unit() -> Self {
        Task::succeed(())
    }
}

impl<T: Any + Send + Clone> Task<T> {
    pub(crate) fn new() -> Self {
        Self { runtime: Runtime::new(), _value: PhantomData }
    }

    /// Reinterprets the produced value type. Callers must have appended a
    /// step that actually writes a `U` to the slot.
    pub(crate) fn retyped<U>(self) -> Task<U> {
        Task { runtime: self.runtime, _value: PhantomData }
    }

    pub(crate) fn push_step<F>(mut self, name: &'static str, guard: Option<Branch>, run: F) -> Self
    where
        F: FnMut(&mut StepScope<'_>) -> StepOutput + Send + 'static,
    {
        self.runtime.push(Step { name, guard, run: Box::new(run) });
        self
    }

    pub(crate) fn push_front_step<F>(mut self, name: &'static str, run: F) -> Self
    where
        F: FnMut(&mut StepScope<'_>) -> StepOutput + Send + 'static,
    {
        self.runtime.push_front(Step { name, guard: None, run: Box::new(run) });
        self
    }

    // === Factories ===

    /// Pipeline that activates the success branch and produces `value`.
    pub fn succeed(value: T) -> Self {
        Task::new().push_step("succeed", None, move |scope: &mut StepScope<'_>| {
            scope.state.branch = Branch::Success;
            scope.put_value(value.clone());
            StepOutput::Done
        })
    }

    /// Pipeline that activates the failure branch with `error`.
    pub fn fail<E>(error: E) -> Self
    where
        E: Any + Debug + Send + Clone,
    {
        Task::new().push_step("fail", None, move |_: &mut StepScope<'_>| {
            StepOutput::Fail(TaskError::failed(error.clone()))
        })
    }

    /// Adapts a callback-registering function. `register` receives a
    /// [`Resolver`]; the pipeline suspends until it is resolved. Dropping the
    /// resolver unresolved fails the run with [`TaskError::Canceled`].
    pub fn from_callback<F>(mut register: F) -> Self
    where
        F: FnMut(Resolver<T>) + Send + 'static,
    {
        Task::new().push_step(
            "from_callback",
            Some(Branch::Success),
            move |_: &mut StepScope<'_>| {
                let (sender, receiver) = oneshot::channel();
                register(Resolver { sender });
                StepOutput::Suspend(Box::pin(async move {
                    match receiver.await {
                        Ok(value) => Ok(Some(boxed(value))),
                        Err(_) => Err(TaskError::Canceled),
                    }
                }))
            },
        )
    }

    // === Transforms ===

    pub fn map<U, F>(self, mut f: F) -> Task<U>
    where
        U: Any + Send + Clone,
        F: FnMut(T) -> U + Send + 'static,
    {
        self.push_step("map", Some(Branch::Success), move |scope: &mut StepScope<'_>| {
            match scope.take_value::<T>() {
                Ok(value) => {
                    scope.put_value(f(value));
                    StepOutput::Done
                }
                Err(error) => StepOutput::Fail(error),
            }
        })
        .retyped()
    }

    /// Replaces the success value with a constant.
    pub fn map_to<U>(self, value: U) -> Task<U>
    where
        U: Any + Send + Clone,
    {
        self.map(move |_| value.clone())
    }

    /// Fallible transform: an `Err` flips the pipeline onto the failure
    /// branch.
    pub fn try_map<U, E, F>(self, mut f: F) -> Task<U>
    where
        U: Any + Send + Clone,
        E: Any + Debug + Send,
        F: FnMut(T) -> std::result::Result<U, E> + Send + 'static,
    {
        self.push_step("try_map", Some(Branch::Success), move |scope: &mut StepScope<'_>| {
            let value = match scope.peek_value::<T>() {
                Ok(value) => value.clone(),
                Err(error) => return StepOutput::Fail(error),
            };
            match f(value) {
                Ok(mapped) => {
                    scope.put_value(mapped);
                    StepOutput::Done
                }
                Err(error) => StepOutput::Fail(TaskError::failed(error)),
            }
        })
        .retyped()
    }

    /// Asynchronous transform. The pipeline suspends on the returned future;
    /// an armed deadline can kill the suspension.
    pub fn map_async<U, Fut, F>(self, mut f: F) -> Task<U>
    where
        U: Any + Send + Clone,
        Fut: Future<Output = U> + Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
    {
        self.push_step("map_async", Some(Branch::Success), move |scope: &mut StepScope<'_>| {
            let value = match scope.peek_value::<T>() {
                Ok(value) => value.clone(),
                Err(error) => return StepOutput::Fail(error),
            };
            let future = f(value);
            StepOutput::Suspend(Box::pin(async move { Ok(Some(boxed(future.await))) }))
        })
        .retyped()
    }

    /// Fallible asynchronous transform. An `Err` from the future flips the
    /// pipeline onto the failure branch, with the reject position at this
    /// step; the input value stays in the slot, so a retry re-runs the
    /// operation.
    pub fn try_map_async<U, E, Fut, F>(self, mut f: F) -> Task<U>
    where
        U: Any + Send + Clone,
        E: Any + Debug + Send,
        Fut: Future<Output = std::result::Result<U, E>> + Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
    {
        self.push_step("try_map_async", Some(Branch::Success), move |scope: &mut StepScope<'_>| {
            let value = match scope.peek_value::<T>() {
                Ok(value) => value.clone(),
                Err(error) => return StepOutput::Fail(error),
            };
            let future = f(value);
            StepOutput::Suspend(Box::pin(async move {
                match future.await {
                    Ok(mapped) => Ok(Some(boxed(mapped))),
                    Err(error) => Err(TaskError::failed(error)),
                }
            }))
        })
        .retyped()
    }

    /// Observes the success value without changing it.
    pub fn tap<F>(self, mut f: F) -> Self
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.push_step("tap", Some(Branch::Success), move |scope: &mut StepScope<'_>| {
            match scope.peek_value::<T>() {
                Ok(value) => {
                    f(value);
                    StepOutput::Done
                }
                Err(error) => StepOutput::Fail(error),
            }
        })
    }

    /// Sequences a dependent sub-pipeline. The sub-pipeline inherits the
    /// ambient environment; inherited capabilities take precedence over the
    /// sub-pipeline's own `provide` calls.
    ///
    /// The current success value is left in place while the sub-pipeline
    /// runs, so a failure here leaves the last successful value available to
    /// [`Task::restore_when`].
    pub fn chain<U, F>(self, mut f: F) -> Task<U>
    where
        U: Any + Send + Clone,
        F: FnMut(T) -> Task<U> + Send + 'static,
    {
        self.push_step("chain", Some(Branch::Success), move |scope: &mut StepScope<'_>| {
            let value = match scope.peek_value::<T>() {
                Ok(value) => value.clone(),
                Err(error) => return StepOutput::Fail(error),
            };
            let sub = f(value).provide_env(scope.state.env.clone());
            StepOutput::Suspend(Box::pin(async move { sub.run_erased().await.map(Some) }))
        })
        .retyped()
    }

    /// Rewrites the failure value while staying on the failure branch. The
    /// reject position is left where the original failure put it, so a later
    /// retry re-runs the step that failed, not this rewrite.
    pub fn map_error<E, F>(self, mut f: F) -> Self
    where
        E: Any + Debug + Send,
        F: FnMut(TaskError) -> E + Send + 'static,
    {
        self.push_step("map_error", Some(Branch::Fail), move |scope: &mut StepScope<'_>| {
            let error = scope.state.failure.take().unwrap_or(TaskError::NoValue);
            scope.state.failure = Some(TaskError::failed(f(error)));
            StepOutput::Done
        })
    }

    /// Flips a matching failure back onto the success branch. The success
    /// slot is left as it was, so the pipeline resumes with the last
    /// successful value.
    pub fn restore_when<F>(self, mut pred: F) -> Self
    where
        F: FnMut(&TaskError) -> bool + Send + 'static,
    {
        self.push_step("restore_when", Some(Branch::Fail), move |scope: &mut StepScope<'_>| {
            let error = match scope.state.failure.take() {
                Some(error) => error,
                None => return StepOutput::Fail(TaskError::NoValue),
            };
            if pred(&error) {
                tracing::debug!(error = %error, "restoring success branch");
                scope.state.branch = Branch::Success;
                scope.state.reject = None;
            } else {
                scope.state.failure = Some(error);
            }
            StepOutput::Done
        })
    }

    // === Environment ===

    /// Reads the capability of type `C` from the environment, replacing the
    /// current success value with it.
    pub fn access<C>(self) -> Task<C>
    where
        C: Any + Send + Sync + Clone,
    {
        self.push_step("access", Some(Branch::Success), move |scope: &mut StepScope<'_>| {
            match scope.state.env.get::<C>() {
                Some(capability) => {
                    scope.put_value(capability);
                    StepOutput::Done
                }
                None => {
                    StepOutput::Fail(TaskError::MissingCapability { capability: type_name::<C>() })
                }
            }
        })
        .retyped()
    }

    /// Injects a capability. The step lands at the front of the list, so of
    /// two `provide` calls for the same type the later-declared one executes
    /// first and wins.
    pub fn provide<C>(self, capability: C) -> Self
    where
        C: Any + Send + Sync + Clone,
    {
        self.push_front_step("provide", move |scope: &mut StepScope<'_>| {
            scope.state.env.provide(capability.clone());
            StepOutput::Done
        })
    }

    /// Front-merges an inherited environment; runs before every declared
    /// `provide`, so inherited capabilities win.
    pub(crate) fn provide_env(self, env: Env) -> Self {
        self.push_front_step("inherit_env", move |scope: &mut StepScope<'_>| {
            scope.state.env.merge_missing(&env);
            StepOutput::Done
        })
    }

    // === Terminals ===

    /// Drives the pipeline to completion.
    pub async fn run(self) -> Result<T, TaskError> {
        unbox::<T>(self.run_erased().await?)
    }

    /// Drives the pipeline, panicking with the raw [`TaskError`] payload on
    /// failure. The panic payload downcasts back to [`TaskError`].
    pub async fn run_unsafe(self) -> T {
        match self.run().await {
            Ok(value) => value,
            Err(error) => std::panic::panic_any(error),
        }
    }

    pub(crate) async fn run_erased(mut self) -> Result<BoxValue, TaskError> {
        self.runtime.run().await
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// One-shot completion handle handed to [`Task::from_callback`]
/// registrations.
pub struct Resolver<T> {
    sender: oneshot::Sender<T>,
}

impl<T> Resolver<T> {
    /// Delivers the value and resumes the suspended pipeline. A resolver
    /// dropped without resolving cancels the run.
    pub fn resolve(self, value: T) {
        let _ = self.sender.send(value);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
