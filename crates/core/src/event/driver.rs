//! The event driver: simulated time and activity scheduling.
//!
//! The driver owns the event list and an arena of [`Activity`] descriptors.
//! Components schedule activities at `now + delta`; the simulation loop pops
//! the earliest one, advances simulated time to its wakeup, and dispatches
//! its body. An activity that wants to run again reschedules itself during
//! dispatch; one that does not is returned to the pool when the dispatcher
//! calls [`EventDriver::complete`].
//!
//! Suspension (for network back-pressure) is explicit: [`EventDriver::suspend`]
//! parks an activity outside the event list in the `Waiting` state while some
//! resource's waiter queue holds its id; [`EventDriver::wake`] re-inserts it.

use tracing::trace;

use super::pool::{Pool, PoolId};
use super::queue::{EventKey, EventQueue};
use crate::common::{SimError, SimTime};
use crate::config::EventListKind;
use crate::pool_id;

pool_id! {
    /// Identifier of an activity descriptor in the driver's arena.
    ActId
}

/// Lifecycle state of an activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ActState {
    /// Allocated but not scheduled anywhere.
    #[default]
    Limbo,
    /// In the event list with wakeup == now (scheduled with delta 0).
    Ready,
    /// In the event list with a future wakeup.
    Delayed,
    /// Parked on some resource's waiter queue, not in the event list.
    Waiting,
    /// Currently being dispatched.
    Running,
}

/// Scheduling mode.
///
/// The engine distinguishes the three historical modes; the simulator core
/// schedules everything `Independent`. `Blocking` and `Forking` relate the
/// activity to a parent process and are accepted but not otherwise treated
/// specially.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Runs on its own; nobody waits for it.
    #[default]
    Independent,
    /// Parent logically blocks until this activity completes.
    Blocking,
    /// Parent logically continues alongside this activity.
    Forking,
}

/// An activity descriptor: a schedulable unit of simulator work.
#[derive(Clone, Copy, Debug, Default)]
pub struct Activity<B> {
    /// What to do when this activity fires; dispatched by the simulator.
    pub body: B,
    /// Lifecycle state.
    pub state: ActState,
    /// Wakeup time (valid while Ready/Delayed).
    pub time: SimTime,
}

/// The event driver.
pub struct EventDriver<B> {
    queue: EventQueue,
    pool: Pool<Activity<B>, ActId>,
    now: SimTime,
    seq: u64,
    interrupted: bool,
    /// The activity currently being dispatched, for diagnostics.
    active: Option<ActId>,
}

impl<B: Copy + Default + std::fmt::Debug> EventDriver<B> {
    /// Creates a driver with the selected event-list implementation.
    pub fn new(kind: EventListKind) -> Self {
        Self {
            queue: EventQueue::new(kind),
            pool: Pool::new("activity", 64),
            now: 0.0,
            seq: 0,
            interrupted: false,
            active: None,
        }
    }

    /// Current simulated time.
    #[inline]
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Number of pending activities.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// The activity currently being dispatched, if any.
    pub fn active(&self) -> Option<ActId> {
        self.active
    }

    /// Allocates an activity in the `Limbo` state without scheduling it.
    pub fn alloc(&mut self, body: B) -> ActId {
        let id = self.pool.get();
        let act = self.pool.get_mut(id);
        act.body = body;
        act.state = ActState::Limbo;
        id
    }

    /// Allocates and schedules an activity at `now + delta`.
    pub fn schedule(&mut self, body: B, delta: f64, mode: ScheduleMode) -> Result<ActId, SimError> {
        let id = self.alloc(body);
        self.schedule_existing(id, delta, mode)?;
        Ok(id)
    }

    /// Schedules an already-allocated activity at `now + delta`.
    ///
    /// Fails if `delta` is negative or the activity is already pending.
    pub fn schedule_existing(
        &mut self,
        id: ActId,
        delta: f64,
        _mode: ScheduleMode,
    ) -> Result<(), SimError> {
        if delta < 0.0 {
            return Err(SimError::ScheduleIntoPast {
                delta,
                now: self.now,
            });
        }
        let state = self.pool.get_ref(id).state;
        if matches!(state, ActState::Ready | ActState::Delayed) {
            return Err(SimError::EventListCorrupt {
                detail: format!("rescheduling pending activity {id:?}"),
                now: self.now,
            });
        }
        let time = self.now + delta;
        let act = self.pool.get_mut(id);
        act.time = time;
        act.state = if delta == 0.0 {
            ActState::Ready
        } else {
            ActState::Delayed
        };
        let key = EventKey {
            time,
            seq: self.seq,
        };
        self.seq += 1;
        self.queue.insert(key, id);
        trace!(target: "event", ?id, time, "schedule");
        Ok(())
    }

    /// Parks a pending or limbo activity in the `Waiting` state.
    ///
    /// The caller is responsible for holding the id somewhere it can be
    /// woken from; the driver removes it from the event list if present.
    pub fn suspend(&mut self, id: ActId) {
        let _ = self.queue.delete(id);
        self.pool.get_mut(id).state = ActState::Waiting;
    }

    /// Wakes a `Waiting` (or limbo) activity at `now + delta`.
    pub fn wake(&mut self, id: ActId, delta: f64) -> Result<(), SimError> {
        self.schedule_existing(id, delta, ScheduleMode::Independent)
    }

    /// Body of an allocated activity.
    pub fn body(&self, id: ActId) -> B {
        self.pool.get_ref(id).body
    }

    /// Pops the next activity if its wakeup is before `until`, advancing
    /// simulated time to it and marking it `Running`.
    ///
    /// Returns `Ok(None)` when the list is empty, when the next wakeup is at
    /// or past `until`, or after [`EventDriver::interrupt`] was called (the
    /// flag is consumed).
    pub fn pop_next(&mut self, until: Option<SimTime>) -> Result<Option<(ActId, B)>, SimError> {
        if self.interrupted {
            self.interrupted = false;
            return Ok(None);
        }
        let Some(key) = self.queue.peek_min() else {
            return Ok(None);
        };
        if let Some(limit) = until {
            if key.time >= limit {
                return Ok(None);
            }
        }
        let Some((key, id)) = self.queue.pop_min() else {
            return Ok(None);
        };
        if key.time < self.now {
            return Err(SimError::EventListCorrupt {
                detail: format!("pop went backwards: {} < {}", key.time, self.now),
                now: self.now,
            });
        }
        self.now = key.time;
        let act = self.pool.get_mut(id);
        act.state = ActState::Running;
        self.active = Some(id);
        Ok(Some((id, act.body)))
    }

    /// Finishes dispatch of an activity.
    ///
    /// If the activity did not reschedule itself while running, its
    /// descriptor is returned to the pool (the "delete flag" of the
    /// historical driver, inverted: deletion is the default).
    pub fn complete(&mut self, id: ActId) -> Result<(), SimError> {
        self.active = None;
        if self.pool.get_ref(id).state == ActState::Running {
            self.pool.put(id, self.now)?;
        }
        Ok(())
    }

    /// Frees an activity that is not in the event list (limbo or waiting).
    pub fn free(&mut self, id: ActId) -> Result<(), SimError> {
        let _ = self.queue.delete(id);
        self.pool.put(id, self.now)
    }

    /// Requests that the dispatch loop stop at the next pop.
    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }

    /// Clears the event list and pool and rewinds time to zero.
    pub fn reset(&mut self, kind: EventListKind) {
        self.queue = EventQueue::new(kind);
        self.pool.reset();
        self.now = 0.0;
        self.seq = 0;
        self.interrupted = false;
        self.active = None;
    }
}
