//! Cooperative single-active-task scheduler.
//!
//! [`TaskQueue`] holds at most one active task and a FIFO of pending ones.
//! The owner drives it once per tick:
//!
//! 1. [`begin()`](TaskQueue::begin) moves the active task (or the next
//!    pending one) out of the queue.
//! 2. The owner runs one step of it.
//! 3. [`finish()`](TaskQueue::finish) parks it again, or retires it and
//!    queues its chained follow-up at the front.
//!
//! Because the task is outside the queue while it runs, a
//! [`clear()`](TaskQueue::clear) issued during its step cannot destroy it
//! mid-run; the generation counter makes `finish` drop it afterwards.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// A task the queue can schedule.
pub trait QueuedTask {
    /// Discriminant used to coalesce duplicate requests.
    type Kind: Copy + Eq + fmt::Debug;

    /// This task's kind.
    fn kind(&self) -> Self::Kind;
}

/// Outcome of one step of a task.
#[derive(Debug, PartialEq)]
pub enum TaskStep<T> {
    /// Run again next tick.
    Pending,
    /// Finished, optionally chaining a follow-up task.
    Done {
        /// Task to run next, ahead of anything already pending.
        next: Option<T>,
    },
}

/// A task taken out of the queue for execution.
#[derive(Debug)]
pub struct ActiveTask<T> {
    /// The task.
    pub task: T,
    started: bool,
    generation: u64,
}

impl<T> ActiveTask<T> {
    /// Whether this is the task's first step, when its start hook runs.
    pub fn is_starting(&self) -> bool {
        !self.started
    }
}

/// Single-active-task FIFO with duplicate-kind coalescing.
#[derive(Debug)]
pub struct TaskQueue<T: QueuedTask> {
    active: Option<ActiveTask<T>>,
    executing: Option<T::Kind>,
    pending: VecDeque<T>,
    generation: u64,
}

impl<T: QueuedTask> Default for TaskQueue<T> {
    fn default() -> Self {
        Self {
            active: None,
            executing: None,
            pending: VecDeque::new(),
            generation: 0,
        }
    }
}

impl<T: QueuedTask> TaskQueue<T> {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` unless one of the same kind is active, executing or
    /// pending. Returns `false` when the request was coalesced.
    pub fn push(&mut self, task: T) -> bool {
        if self.contains(task.kind()) {
            return false;
        }
        self.pending.push_back(task);
        true
    }

    /// Whether a task of `kind` is active, executing or pending.
    pub fn contains(&self, kind: T::Kind) -> bool {
        self.executing == Some(kind)
            || self.active.as_ref().is_some_and(|a| a.task.kind() == kind)
            || self.pending.iter().any(|t| t.kind() == kind)
    }

    /// Whether any task is active, executing or pending.
    pub fn is_busy(&self) -> bool {
        self.active.is_some() || self.executing.is_some() || !self.pending.is_empty()
    }

    /// Kind of the active or executing task.
    pub fn active_kind(&self) -> Option<T::Kind> {
        self.executing
            .or_else(|| self.active.as_ref().map(|a| a.task.kind()))
    }

    /// Take the task to run this tick.
    pub fn begin(&mut self) -> Option<ActiveTask<T>> {
        let active = match self.active.take() {
            Some(active) => active,
            None => ActiveTask {
                task: self.pending.pop_front()?,
                started: false,
                generation: self.generation,
            },
        };
        self.executing = Some(active.task.kind());
        Some(active)
    }

    /// Return a task after its step.
    ///
    /// Returns `false` if the queue was cleared while the task ran, in
    /// which case the task and any follow-up are dropped.
    pub fn finish(&mut self, mut active: ActiveTask<T>, step: TaskStep<T>) -> bool {
        self.executing = None;
        if active.generation != self.generation {
            return false;
        }
        match step {
            TaskStep::Pending => {
                active.started = true;
                self.active = Some(active);
            }
            TaskStep::Done { next } => {
                if let Some(next) = next {
                    self.pending.push_front(next);
                }
            }
        }
        true
    }

    /// Drop every task. Returns the parked active task, if any, so the
    /// caller can undo what it had partially done.
    pub fn clear(&mut self) -> Option<T> {
        self.generation += 1;
        self.executing = None;
        self.pending.clear();
        self.active.take().map(|a| a.task)
    }
}

// ── Replay tasks ───────────────────────────────────────────────────

/// Kind of a [`ReplayTask`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    /// Seek to an absolute time.
    GotoTime,
    /// Fast-forward by a relative amount.
    SkipTime,
    /// Wait for the live edge to move, then seek near it.
    JumpToLive,
}

/// Long-running playback operations.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplayTask {
    /// Load the nearest checkpoint at or before `target` and fast-forward.
    GotoTime {
        /// Requested time in seconds; clamped when the task starts.
        target: f64,
        /// Playback time when the task started, restored on failure.
        previous: Option<f64>,
    },
    /// Fast-forward from the current time.
    SkipTime {
        /// Seconds to skip. Non-negative.
        delta: f64,
        /// Absolute target, fixed when the task starts.
        target: Option<f64>,
    },
    /// Chain a goto near the live edge once the duration moves.
    JumpToLive {
        /// Duration observed when the task started.
        initial_total_ms: Option<u64>,
        /// Clock reading when the task started.
        started_at: Option<Duration>,
    },
}

impl ReplayTask {
    /// A seek to `seconds`.
    pub fn goto(seconds: f64) -> Self {
        Self::GotoTime {
            target: seconds,
            previous: None,
        }
    }

    /// A forward skip by `seconds`.
    pub fn skip(seconds: f64) -> Self {
        Self::SkipTime {
            delta: seconds,
            target: None,
        }
    }

    /// A jump to the live edge.
    pub fn jump_to_live() -> Self {
        Self::JumpToLive {
            initial_total_ms: None,
            started_at: None,
        }
    }
}

impl QueuedTask for ReplayTask {
    type Kind = TaskKind;

    fn kind(&self) -> TaskKind {
        match self {
            Self::GotoTime { .. } => TaskKind::GotoTime,
            Self::SkipTime { .. } => TaskKind::SkipTime,
            Self::JumpToLive { .. } => TaskKind::JumpToLive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_kinds_are_coalesced() {
        let mut q = TaskQueue::new();
        assert!(q.push(ReplayTask::goto(3.0)));
        assert!(q.push(ReplayTask::skip(2.0)));
        assert!(!q.push(ReplayTask::skip(2.0)));
        assert!(!q.push(ReplayTask::goto(1.0)));
        assert!(q.contains(TaskKind::SkipTime));
        assert!(!q.contains(TaskKind::JumpToLive));
    }

    #[test]
    fn executing_task_still_counts_for_coalescing() {
        let mut q = TaskQueue::new();
        q.push(ReplayTask::goto(3.0));
        let active = q.begin().unwrap();
        assert!(active.is_starting());
        assert!(q.contains(TaskKind::GotoTime));
        assert!(!q.push(ReplayTask::goto(4.0)));
        assert!(q.finish(active, TaskStep::Pending));

        let active = q.begin().unwrap();
        assert!(!active.is_starting());
        assert!(q.finish(active, TaskStep::Done { next: None }));
        assert!(!q.is_busy());
    }

    #[test]
    fn chained_task_runs_before_pending() {
        let mut q = TaskQueue::new();
        q.push(ReplayTask::jump_to_live());
        q.push(ReplayTask::skip(1.0));
        let active = q.begin().unwrap();
        q.finish(
            active,
            TaskStep::Done {
                next: Some(ReplayTask::goto(9.0)),
            },
        );
        assert_eq!(q.begin().unwrap().task, ReplayTask::goto(9.0));
    }

    #[test]
    fn clear_during_execution_drops_the_task_afterwards() {
        let mut q = TaskQueue::new();
        q.push(ReplayTask::goto(3.0));
        q.push(ReplayTask::skip(1.0));
        let active = q.begin().unwrap();
        assert_eq!(q.clear(), None);
        assert!(!q.finish(active, TaskStep::Pending));
        assert!(!q.is_busy());
    }

    #[test]
    fn clear_returns_the_parked_task() {
        let mut q = TaskQueue::new();
        q.push(ReplayTask::goto(3.0));
        let active = q.begin().unwrap();
        q.finish(active, TaskStep::Pending);
        assert_eq!(q.clear(), Some(ReplayTask::goto(3.0)));
        assert!(!q.is_busy());
    }

    // ── proptest ───────────────────────────────────────────────

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Debug)]
        enum Op {
            Push(u8),
            Step { done: bool },
            Clear,
        }

        fn arb_op() -> impl Strategy<Value = Op> {
            prop_oneof![
                4 => (0u8..3).prop_map(Op::Push),
                3 => any::<bool>().prop_map(|done| Op::Step { done }),
                1 => Just(Op::Clear),
            ]
        }

        fn task(kind: u8) -> ReplayTask {
            match kind {
                0 => ReplayTask::goto(1.0),
                1 => ReplayTask::skip(1.0),
                _ => ReplayTask::jump_to_live(),
            }
        }

        fn kinds(q: &TaskQueue<ReplayTask>) -> Vec<TaskKind> {
            q.active
                .iter()
                .map(|a| a.task.kind())
                .chain(q.pending.iter().map(|t| t.kind()))
                .collect()
        }

        proptest! {
            #[test]
            fn at_most_one_task_per_kind(ops in prop::collection::vec(arb_op(), 0..64)) {
                let mut q = TaskQueue::new();
                for op in ops {
                    match op {
                        Op::Push(kind) => {
                            let task = task(kind);
                            let present = q.contains(task.kind());
                            prop_assert_eq!(q.push(task), !present);
                        }
                        Op::Step { done } => {
                            if let Some(active) = q.begin() {
                                let step = if done {
                                    TaskStep::Done { next: None }
                                } else {
                                    TaskStep::Pending
                                };
                                prop_assert!(q.finish(active, step));
                            }
                        }
                        Op::Clear => {
                            q.clear();
                            prop_assert!(!q.is_busy());
                        }
                    }
                    let queued = kinds(&q);
                    for (i, kind) in queued.iter().enumerate() {
                        prop_assert!(!queued[i + 1..].contains(kind), "duplicate {:?}", kind);
                    }
                }
            }
        }
    }
}
