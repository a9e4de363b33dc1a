//! Position-keyed hook registry.
//!
//! `Step` hooks fire after every executed step (deadline polling), `Cycle`
//! hooks fire once per list exhaustion and may rewind the cursor (loops,
//! sequencing), `End` hooks fire once at the very end of a run (cleanup,
//! collector fixup). Arming at an occupied key replaces the previous hook.

use std::collections::BTreeMap;

use futures_core::future::BoxFuture;

use crate::runtime::RunState;
use crate::step::BoxValue;

pub(crate) type StepHook = Box<dyn FnMut(&mut RunState) + Send>;
/// Cycle hooks additionally receive a snapshot of the success slot taken the
/// moment the list exhausted, unaffected by writes from earlier hooks in the
/// same cycle (the end-of-cycle value `filter`/`throttle` retain).
pub(crate) type CycleHook = Box<dyn FnMut(&mut RunState, Option<&BoxValue>) -> CycleOutcome + Send>;
pub(crate) type EndHook = Box<dyn FnMut(&mut RunState) + Send>;

/// A cycle hook either finishes synchronously (any rewind already applied to
/// the state) or defers to pending work whose verdict the interpreter awaits
/// before deciding whether the run is over.
pub(crate) enum CycleOutcome {
    Done,
    Deferred(BoxFuture<'static, CycleNext>),
}

/// Settled verdict of a deferred cycle hook.
pub(crate) struct CycleNext {
    pub value: Option<BoxValue>,
    pub rewind_to: Option<usize>,
}

/// `End` hooks come in two key flavors: build-time named finalizers (the
/// collector fixup) sort before position-armed cleanups.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) enum EndKey {
    Named(&'static str),
    At(usize),
}

#[derive(Default)]
pub(crate) struct HookSet {
    pub step: BTreeMap<usize, StepHook>,
    pub cycle: BTreeMap<usize, CycleHook>,
    pub end: BTreeMap<EndKey, EndHook>,
}

impl HookSet {
    pub(crate) fn arm_step(&mut self, position: usize, hook: StepHook) {
        tracing::trace!(position, "arming step hook");
        self.step.insert(position, hook);
    }

    pub(crate) fn arm_cycle(&mut self, position: usize, hook: CycleHook) {
        tracing::trace!(position, "arming cycle hook");
        self.cycle.insert(position, hook);
    }

    pub(crate) fn arm_end(&mut self, key: EndKey, hook: EndHook) {
        tracing::trace!(?key, "arming end hook");
        self.end.insert(key, hook);
    }
}
