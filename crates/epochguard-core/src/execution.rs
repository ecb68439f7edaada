//! Resumable thread bodies and saved execution state.
//!
//! A thread runs a [`ThreadBody`]: a step function over its own state.
//! Each call to [`ThreadBody::step`] runs plain code (allocation, memory
//! access, unlock) and returns a [`Step`] describing what to do next.
//! Blocking operations (lock, barrier, spawn, join, explicit commit) are
//! returned as steps and carried out by the engine between steps; their
//! result is visible to the next step through [`ThreadContext::outcome`].
//!
//! Step boundaries are the thread's safe points. At every epoch begin the
//! engine clones the body into a [`SavedExecutionState`]; a rollback
//! resumes from that clone, so "jump back to the epoch start" is simply
//! the next `step` call on the restored value.
//!
//! [`ThreadContext::outcome`]: crate::context::ThreadContext::outcome

use std::fmt;

use crate::context::ThreadContext;
use crate::error::EngineError;
use crate::sync::{BarrierId, MutexId};
use crate::thread_registry::ThreadId;

/// Program code run by one engine thread.
///
/// Bodies must be `Clone`: the clone taken at epoch begin is the state a
/// rollback returns to. Shared observers (e.g. an `Arc<Mutex<_>>`) survive
/// rollback; everything else in the body is rewound.
pub trait ThreadBody: BodyClone + Send + 'static {
    fn step(&mut self, cx: &mut ThreadContext<'_>) -> Result<Step, EngineError>;
}

/// Object-safe cloning for boxed bodies.
pub trait BodyClone {
    fn clone_box(&self) -> Box<dyn ThreadBody>;
}

impl<T: ThreadBody + Clone> BodyClone for T {
    fn clone_box(&self) -> Box<dyn ThreadBody> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn ThreadBody> {
    fn clone(&self) -> Self {
        (**self).clone_box()
    }
}

impl fmt::Debug for dyn ThreadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ThreadBody")
    }
}

/// A body built from a cloneable closure; captured state is the body state.
#[derive(Clone)]
pub struct StepFn<F>(F);

/// Wrap a closure as a [`ThreadBody`].
pub fn step_fn<F>(f: F) -> StepFn<F>
where
    F: FnMut(&mut ThreadContext<'_>) -> Result<Step, EngineError> + Clone + Send + 'static,
{
    StepFn(f)
}

impl<F> ThreadBody for StepFn<F>
where
    F: FnMut(&mut ThreadContext<'_>) -> Result<Step, EngineError> + Clone + Send + 'static,
{
    fn step(&mut self, cx: &mut ThreadContext<'_>) -> Result<Step, EngineError> {
        (self.0)(cx)
    }
}

/// What a body asks the engine to do after a step.
#[derive(Debug)]
pub enum Step {
    /// Call `step` again.
    Continue,
    Lock(MutexId),
    TryLock(MutexId),
    Barrier(BarrierId),
    Spawn(Box<dyn ThreadBody>),
    Join(ThreadId),
    /// End the epoch here (commit if clean).
    Commit,
    /// Finish the thread; on the main thread this ends the program.
    Exit(u64),
}

/// Result of the last blocking call, seen by the following step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Outcome {
    #[default]
    None,
    Locked,
    TryLocked(bool),
    /// `serial` is true for exactly one party per barrier round.
    BarrierPassed { serial: bool },
    Spawned(ThreadId),
    Joined(u64),
    Committed,
}

/// A blocking call in progress, with the progress it made so far.
#[derive(Debug, Clone)]
pub enum PendingCall {
    Lock {
        id: MutexId,
        turn_taken: bool,
    },
    TryLock {
        id: MutexId,
        turn_taken: bool,
    },
    Barrier {
        id: BarrierId,
        turn_taken: bool,
        /// Generation the thread arrived in, once counted.
        arrived_gen: Option<u64>,
        /// The arrival released the round.
        serial: bool,
    },
    Spawn {
        body: Box<dyn ThreadBody>,
        turn_taken: bool,
        /// A commit already ran to free a slot.
        retried: bool,
    },
    Join(ThreadId),
    Commit,
    Exit(u64),
}

impl PendingCall {
    /// The call for a step; `None` for [`Step::Continue`].
    #[must_use]
    pub fn from_step(step: Step) -> Option<Self> {
        match step {
            Step::Lock(id) => Some(Self::Lock {
                id,
                turn_taken: false,
            }),
            Step::TryLock(id) => Some(Self::TryLock {
                id,
                turn_taken: false,
            }),
            Step::Barrier(id) => Some(Self::Barrier {
                id,
                turn_taken: false,
                arrived_gen: None,
                serial: false,
            }),
            Step::Spawn(body) => Some(Self::Spawn {
                body,
                turn_taken: false,
                retried: false,
            }),
            Step::Join(t) => Some(Self::Join(t)),
            Step::Commit => Some(Self::Commit),
            Step::Exit(value) => Some(Self::Exit(value)),
            Step::Continue => None,
        }
    }

    /// Drop replay progress that only meant something in the epoch it was
    /// made in.
    fn rewind_turn(&mut self) {
        match self {
            Self::Lock { turn_taken, .. }
            | Self::TryLock { turn_taken, .. }
            | Self::Barrier { turn_taken, .. }
            | Self::Spawn { turn_taken, .. } => *turn_taken = false,
            Self::Join(_) | Self::Commit | Self::Exit(_) => {}
        }
    }
}

/// Live execution state of one thread.
#[derive(Debug)]
pub struct Execution {
    pub body: Box<dyn ThreadBody>,
    pub pending: Option<PendingCall>,
    pub outcome: Outcome,
    /// Passed the spawn gate.
    pub gated: bool,
    pub steps: u64,
}

impl Execution {
    #[must_use]
    pub fn new(body: Box<dyn ThreadBody>, gated: bool) -> Self {
        Self {
            body,
            pending: None,
            outcome: Outcome::None,
            gated,
            steps: 0,
        }
    }
}

/// Snapshot of an [`Execution`] taken at epoch begin.
#[derive(Debug, Clone)]
pub struct SavedExecutionState {
    body: Box<dyn ThreadBody>,
    pending: Option<PendingCall>,
    outcome: Outcome,
    gated: bool,
    steps: u64,
}

impl SavedExecutionState {
    #[must_use]
    pub fn capture(exec: &Execution) -> Self {
        let mut pending = exec.pending.clone();
        if let Some(call) = pending.as_mut() {
            call.rewind_turn();
        }
        Self {
            body: exec.body.clone(),
            pending,
            outcome: exec.outcome,
            gated: exec.gated,
            steps: exec.steps,
        }
    }

    /// A fresh execution continuing from this snapshot.
    #[must_use]
    pub fn resume(&self) -> Execution {
        Execution {
            body: self.body.clone(),
            pending: self.pending.clone(),
            outcome: self.outcome,
            gated: self.gated,
            steps: self.steps,
        }
    }

    /// Steps completed when the snapshot was taken.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }
}
