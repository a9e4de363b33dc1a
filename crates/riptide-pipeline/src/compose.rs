//! Aggregation of named sub-pipelines into a single keyed result.
//!
//! Both aggregators hand the ambient environment down to every field, and
//! both deliver results under the declared keys in declaration order. The
//! sequential form runs fields one after another and completes in a single
//! poll when every field is synchronous; the parallel form spawns one task
//! per field and lets all of them settle before reporting a failure.

use std::any::Any;

use indexmap::IndexMap;
use riptide_types::TaskError;

use crate::step::{boxed, unbox, StepOutput, StepScope};
use crate::task::Task;

impl<V: Any + Send + Clone> Task<IndexMap<String, V>> {
    /// Runs named sub-pipelines one after another, stopping at the first
    /// failure.
    pub fn struct_of<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Task<V>)>,
    {
        let declared: Vec<(String, Task<V>)> =
            fields.into_iter().map(|(name, task)| (name.into(), task)).collect();
        let mut pending = Some(declared);
        Task::new().push_step("struct", None, move |scope: &mut StepScope<'_>| {
            let fields = match pending.take() {
                Some(fields) => fields,
                None => return StepOutput::Fail(consumed()),
            };
            let env = scope.state.env.clone();
            StepOutput::Suspend(Box::pin(async move {
                let mut out = IndexMap::with_capacity(fields.len());
                for (name, task) in fields {
                    tracing::debug!(field = %name, "running aggregate field");
                    let value = task.provide_env(env.clone()).run_erased().await?;
                    out.insert(name, unbox::<V>(value)?);
                }
                Ok(Some(boxed(out)))
            }))
        })
    }

    /// Runs named sub-pipelines concurrently, one spawned task each. Results
    /// keep declaration order regardless of completion order, and the first
    /// failure (in declaration order) is reported only after every field has
    /// settled.
    pub fn struct_par<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Task<V>)>,
    {
        let declared: Vec<(String, Task<V>)> =
            fields.into_iter().map(|(name, task)| (name.into(), task)).collect();
        let mut pending = Some(declared);
        Task::new().push_step("struct_par", None, move |scope: &mut StepScope<'_>| {
            let fields = match pending.take() {
                Some(fields) => fields,
                None => return StepOutput::Fail(consumed()),
            };
            let env = scope.state.env.clone();
            StepOutput::Suspend(Box::pin(async move {
                let mut handles = Vec::with_capacity(fields.len());
                for (name, task) in fields {
                    let sub = task.provide_env(env.clone());
                    handles.push((name, tokio::spawn(sub.run_erased())));
                }

                let mut out = IndexMap::with_capacity(handles.len());
                let mut first_error = None;
                for (name, handle) in handles {
                    let settled = match handle.await {
                        Ok(settled) => settled,
                        Err(join) => {
                            tracing::warn!(field = %name, "aggregate field panicked");
                            if first_error.is_none() {
                                first_error =
                                    Some(TaskError::Internal(format!("field panicked: {join}")));
                            }
                            continue;
                        }
                    };
                    match settled.and_then(unbox::<V>) {
                        Ok(value) => {
                            out.insert(name, value);
                        }
                        Err(error) => {
                            if first_error.is_none() {
                                first_error = Some(error);
                            }
                        }
                    }
                }
                match first_error {
                    Some(error) => Err(error),
                    None => Ok(Some(boxed(out))),
                }
            }))
        })
    }
}

/// Aggregate steps consume their sub-pipelines on first execution; they
/// cannot re-run under a loop or retry.
fn consumed() -> TaskError {
    TaskError::Internal("aggregate sub-pipelines already consumed".into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
