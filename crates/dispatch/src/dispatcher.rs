use std::cell::RefCell;

use crate::queue::{Handle, Priority, PriorityQueue};

/// Limits on the number of jobs running concurrently.
///
/// `reserved_slots[p]` slots are usable only by jobs at priority `p` or
/// higher; the remainder (`total_jobs - sum(reserved_slots)`) are open to
/// any priority. For example `total_jobs = 30` with
/// `reserved_slots = [0, 5, 10, 5]` caps priority-0 jobs at 10 running,
/// because 20 slots are reserved for priorities 1 and above.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    pub total_jobs: usize,
    /// Must satisfy `sum(reserved_slots) <= total_jobs`.
    pub reserved_slots: Vec<usize>,
}

impl Limits {
    pub fn new(num_priorities: usize, total_jobs: usize) -> Self {
        Self {
            total_jobs,
            reserved_slots: vec![0; num_priorities],
        }
    }
}

/// A job started by the dispatcher.
///
/// `start` runs synchronously on the dispatcher's thread and is free to
/// reenter the dispatcher: add further jobs, cancel queued ones, or call
/// [`PrioritizedDispatcher::on_job_finished`] for itself. The dispatcher
/// never stores a borrow across the call.
pub trait Job {
    fn start(&self);
}

impl<J: Job + ?Sized> Job for std::rc::Rc<J> {
    fn start(&self) {
        (**self).start()
    }
}

/// Starts jobs in strict (priority, insertion-order) order, capped by
/// [`Limits`]. Jobs which cannot start immediately wait in a
/// [`PriorityQueue`]; the handle returned by [`add`](Self::add) cancels or
/// re-prioritizes them until they start.
pub struct PrioritizedDispatcher<J: Job> {
    state: RefCell<State<J>>,
}

struct State<J> {
    queue: PriorityQueue<J>,
    // max_running_jobs[p]: total running jobs allowed while starting a job
    // at priority p. A job may start iff num_running_jobs is below it.
    max_running_jobs: Vec<usize>,
    num_running_jobs: usize,
}

impl<J: Job> PrioritizedDispatcher<J> {
    pub fn new(limits: &Limits) -> Self {
        let num_priorities = limits.reserved_slots.len();
        let dispatcher = Self {
            state: RefCell::new(State {
                queue: PriorityQueue::new(num_priorities),
                max_running_jobs: vec![0; num_priorities],
                num_running_jobs: 0,
            }),
        };
        dispatcher.set_limits(limits);
        dispatcher
    }

    pub fn num_running_jobs(&self) -> usize {
        self.state.borrow().num_running_jobs
    }

    pub fn num_queued_jobs(&self) -> usize {
        self.state.borrow().queue.len()
    }

    pub fn num_priorities(&self) -> usize {
        self.state.borrow().max_running_jobs.len()
    }

    /// Adds `job` at `priority`. If limits permit the job is started
    /// synchronously and `None` is returned; otherwise the job is queued
    /// at the tail of its priority level and its handle returned.
    pub fn add(&self, job: J, priority: Priority) -> Option<Handle> {
        self.add_inner(job, priority, false)
    }

    /// Like [`add`](Self::add), but queues at the head of the priority level.
    pub fn add_at_head(&self, job: J, priority: Priority) -> Option<Handle> {
        self.add_inner(job, priority, true)
    }

    fn add_inner(&self, job: J, priority: Priority, at_head: bool) -> Option<Handle> {
        let start_now = {
            let mut state = self.state.borrow_mut();
            assert!(
                usize::from(priority) < state.max_running_jobs.len(),
                "priority out of range"
            );
            if state.num_running_jobs < state.max_running_jobs[usize::from(priority)] {
                state.num_running_jobs += 1;
                true
            } else {
                false
            }
        };
        if start_now {
            job.start();
            return None;
        }

        let mut state = self.state.borrow_mut();
        let handle = if at_head {
            state.queue.insert_at_front(job, priority)
        } else {
            state.queue.insert(job, priority)
        };
        Some(handle)
    }

    /// Removes the queued job designated by `handle` and returns it.
    /// Does not affect the running count. Panics on a stale handle.
    pub fn cancel(&self, handle: Handle) -> J {
        self.state.borrow_mut().queue.erase(handle)
    }

    /// Removes and returns the oldest job at the lowest queued priority,
    /// or `None` if nothing is queued.
    pub fn evict_oldest_lowest(&self) -> Option<J> {
        let mut state = self.state.borrow_mut();
        let handle = state.queue.first_min()?;
        Some(state.queue.erase(handle))
    }

    /// Moves the queued job at `handle` to the tail of `priority`,
    /// returning its new handle; or starts it (returning `None`) if the
    /// new priority has a free slot. No-op if the priority is unchanged.
    pub fn change_priority(&self, handle: Handle, priority: Priority) -> Option<Handle> {
        if handle.priority() == priority {
            return Some(handle);
        }

        let started = {
            let mut state = self.state.borrow_mut();
            assert!(
                usize::from(priority) < state.max_running_jobs.len(),
                "priority out of range"
            );
            if state.num_running_jobs < state.max_running_jobs[usize::from(priority)] {
                let job = state.queue.erase(handle);
                state.num_running_jobs += 1;
                Some(job)
            } else {
                None
            }
        };
        match started {
            Some(job) => {
                job.start();
                None
            }
            None => {
                let mut state = self.state.borrow_mut();
                let job = state.queue.erase(handle);
                Some(state.queue.insert(job, priority))
            }
        }
    }

    /// Releases the slot of a finished job and dispatches the next queued
    /// job if limits permit. Panics if no job is running.
    pub fn on_job_finished(&self) {
        {
            let mut state = self.state.borrow_mut();
            assert!(
                state.num_running_jobs > 0,
                "on_job_finished called with no running jobs"
            );
            state.num_running_jobs -= 1;
        }
        self.maybe_dispatch_next_job();
    }

    /// Reconstructs the currently effective [`Limits`]. The slot count
    /// reserved for the lowest priority is always reported as zero.
    pub fn limits(&self) -> Limits {
        let state = self.state.borrow();
        let num_priorities = state.max_running_jobs.len();
        let total = state.max_running_jobs.last().copied().unwrap_or(0);
        let mut limits = Limits::new(num_priorities, total);
        for p in 1..num_priorities {
            limits.reserved_slots[p] = state.max_running_jobs[p] - state.max_running_jobs[p - 1];
        }
        limits
    }

    /// Replaces the limits, starting queued jobs as the new limits permit.
    /// Never stops a running job, so the running count may temporarily
    /// exceed lowered limits. The number of priorities must be preserved.
    pub fn set_limits(&self, limits: &Limits) {
        {
            let mut state = self.state.borrow_mut();
            assert_eq!(
                state.max_running_jobs.len(),
                limits.reserved_slots.len(),
                "limits must preserve the number of priorities"
            );
            let mut total = 0;
            for (max, reserved) in state.max_running_jobs.iter_mut().zip(&limits.reserved_slots) {
                total += *reserved;
                *max = total;
            }
            assert!(
                total <= limits.total_jobs,
                "sum(reserved_slots) must not exceed total_jobs"
            );
            // Unreserved slots are available to every priority.
            let spare = limits.total_jobs - total;
            for max in state.max_running_jobs.iter_mut() {
                *max += spare;
            }
            tracing::debug!(
                total_jobs = limits.total_jobs,
                running = state.num_running_jobs,
                queued = state.queue.len(),
                "dispatcher limits updated"
            );
        }
        while self.maybe_dispatch_next_job() {}
    }

    /// Prevents any further job from starting until limits are restored.
    pub fn set_limits_to_zero(&self) {
        let num_priorities = self.num_priorities();
        self.set_limits(&Limits::new(num_priorities, 0));
    }

    // Dispatches the oldest highest-priority queued job, if its priority
    // has a free slot. The state borrow is released before Job::start.
    fn maybe_dispatch_next_job(&self) -> bool {
        let job = {
            let mut state = self.state.borrow_mut();
            let Some(handle) = state.queue.first_max() else {
                return false;
            };
            if state.num_running_jobs >= state.max_running_jobs[usize::from(handle.priority())] {
                return false;
            }
            let job = state.queue.erase(handle);
            state.num_running_jobs += 1;
            job
        };
        job.start();
        true
    }
}
