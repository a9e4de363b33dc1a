//! Shared types for the Riptide pipeline engine.
//!
//! This crate provides the two foundations used across the workspace:
//! - `TaskError`: unified error taxonomy for pipeline runs
//! - `Env`: typed capability store filled by `provide` and read by `access`

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, TaskError>;

// ---------------------------------------------------------------------------
// TaskError
// ---------------------------------------------------------------------------

/// Unified error type for pipeline runs.
///
/// `Failed` carries the user's original error value type-erased, plus its
/// captured `Debug` rendering so the error stays printable after erasure.
/// `Timeout` is raised by the deadline mechanism and otherwise flows through
/// the `Fail` branch like any other failure.
#[derive(thiserror::Error)]
pub enum TaskError {
    // === Step failures ===
    #[error("Fail: {detail}")]
    Failed {
        detail: String,
        payload: Box<dyn Any + Send>,
    },

    #[error("timed out after {elapsed:?} (limit {limit:?})")]
    Timeout { elapsed: Duration, limit: Duration },

    // === Environment ===
    #[error("missing capability: {capability}")]
    MissingCapability { capability: &'static str },

    // === Plumbing ===
    #[error("canceled before a value was delivered")]
    Canceled,

    #[error("no value in the active branch slot")]
    NoValue,

    #[error("value type mismatch: expected {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("{0}")]
    Internal(String),
}

impl TaskError {
    /// Wraps an arbitrary error value, capturing its `Debug` form.
    pub fn failed<E>(error: E) -> Self
    where
        E: Any + fmt::Debug + Send,
    {
        TaskError::Failed {
            detail: format!("{error:?}"),
            payload: Box::new(error),
        }
    }

    /// Returns `true` for the distinguished timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout { .. })
    }

    /// Returns `true` for a user failure wrapped by [`TaskError::failed`].
    pub fn is_failed(&self) -> bool {
        matches!(self, TaskError::Failed { .. })
    }

    /// Borrows the original error value, if this is a `Failed` of type `E`.
    pub fn payload_ref<E: 'static>(&self) -> Option<&E> {
        match self {
            TaskError::Failed { payload, .. } => payload.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Recovers the original error value, handing the error back on mismatch.
    pub fn into_payload<E: 'static>(self) -> std::result::Result<E, Self> {
        match self {
            TaskError::Failed { detail, payload } => match payload.downcast::<E>() {
                Ok(e) => Ok(*e),
                Err(payload) => Err(TaskError::Failed { detail, payload }),
            },
            other => Err(other),
        }
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Failed { detail, .. } => write!(f, "Failed({detail})"),
            TaskError::Timeout { elapsed, limit } => {
                write!(f, "Timeout({elapsed:?} > {limit:?})")
            }
            TaskError::MissingCapability { capability } => {
                write!(f, "MissingCapability({capability})")
            }
            TaskError::Canceled => write!(f, "Canceled"),
            TaskError::NoValue => write!(f, "NoValue"),
            TaskError::TypeMismatch { expected } => write!(f, "TypeMismatch({expected})"),
            TaskError::Internal(msg) => write!(f, "Internal({msg})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Env
// ---------------------------------------------------------------------------

/// Typed capability store.
///
/// Capabilities are keyed by their type. A capability, once present, is never
/// overwritten: `provide` and `merge_missing` both skip existing keys. The
/// pipeline builder inserts `provide` steps at the front of the step list, so
/// the combination yields "earliest-executed provide wins"; equivalently, of
/// two conflicting `provide` calls, the later-declared one takes effect.
#[derive(Clone, Default)]
pub struct Env {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-capability environment.
    pub fn with<C>(capability: C) -> Self
    where
        C: Any + Send + Sync,
    {
        let mut env = Self::new();
        env.provide(capability);
        env
    }

    /// Inserts a capability unless one of the same type is already present.
    /// Returns `true` if the capability was inserted.
    pub fn provide<C>(&mut self, capability: C) -> bool
    where
        C: Any + Send + Sync,
    {
        match self.entries.entry(TypeId::of::<C>()) {
            std::collections::hash_map::Entry::Occupied(_) => {
                tracing::debug!(
                    capability = std::any::type_name::<C>(),
                    "capability already provided, keeping existing value"
                );
                false
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(Arc::new(capability));
                true
            }
        }
    }

    /// Copies every capability from `other` that is not already present.
    pub fn merge_missing(&mut self, other: &Env) {
        for (key, value) in &other.entries {
            self.entries.entry(*key).or_insert_with(|| Arc::clone(value));
        }
    }

    /// Clones the capability of type `C` out of the environment.
    pub fn get<C>(&self) -> Option<C>
    where
        C: Any + Send + Sync + Clone,
    {
        self.entries
            .get(&TypeId::of::<C>())
            .and_then(|entry| entry.downcast_ref::<C>())
            .cloned()
    }

    pub fn contains<C: Any>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<C>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env").field("capabilities", &self.len()).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
