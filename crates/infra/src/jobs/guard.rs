//! Per-job execution guard.
//!
//! The guard map is the only mutable state shared between concurrently running
//! message handlers. An entry exists exactly while a `GuardToken` for that job
//! is alive, so the map never holds more than the in-flight jobs. Attempt
//! numbers across deliveries come from the broker's delivery count.
//! The mutex is only held for map updates, never across an await.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use agentexec_core::JobId;

use super::types::{ExecutionState, ExecutionStatus};

type SlotMap = HashMap<JobId, ExecutionState>;

#[derive(Debug, Clone, Default)]
pub struct ExecutionGuard {
    slots: Arc<Mutex<SlotMap>>,
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the job, or `None` when another handler already holds it.
    pub fn try_acquire(&self, job_id: &JobId) -> Option<GuardToken> {
        match lock(&self.slots).entry(job_id.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(ExecutionState::received());
            }
        }

        Some(GuardToken {
            job_id: job_id.clone(),
            slots: self.slots.clone(),
        })
    }

    pub fn is_active(&self, job_id: &JobId) -> bool {
        lock(&self.slots).contains_key(job_id)
    }

    pub fn state(&self, job_id: &JobId) -> Option<ExecutionState> {
        lock(&self.slots).get(job_id).cloned()
    }

    /// Jobs currently claimed by a handler.
    pub fn tracked_count(&self) -> usize {
        lock(&self.slots).len()
    }
}

/// Exclusive claim on one job id. Dropping it releases the claim and
/// discards the job's state.
#[derive(Debug)]
pub struct GuardToken {
    job_id: JobId,
    slots: Arc<Mutex<SlotMap>>,
}

impl GuardToken {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn state(&self) -> ExecutionState {
        self.with_state(|state| state.clone())
    }

    /// Move to `Executing` and return the attempt number.
    ///
    /// The broker's delivery count is authoritative; a second attempt within
    /// the same claim still counts up.
    pub fn begin_attempt(&self, delivery_count: u32) -> u32 {
        self.with_state(|state| {
            state.attempt_count = (state.attempt_count + 1).max(delivery_count);
            state.status = ExecutionStatus::Executing;
            state.started_at = Some(Utc::now());
            state.attempt_count
        })
    }

    pub fn record_failure(&self, error: impl Into<String>) {
        let error = error.into();
        self.with_state(|state| {
            state.status = ExecutionStatus::Received;
            state.last_error = Some(error);
        });
    }

    pub fn mark_completed(&self) {
        self.with_state(|state| state.status = ExecutionStatus::Completed);
    }

    pub fn mark_failed(&self) {
        self.with_state(|state| state.status = ExecutionStatus::Failed);
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ExecutionState) -> R) -> R {
        let mut slots = lock(&self.slots);
        let state = slots
            .entry(self.job_id.clone())
            .or_insert_with(ExecutionState::received);
        f(state)
    }
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        lock(&self.slots).remove(&self.job_id);
    }
}

fn lock(slots: &Mutex<SlotMap>) -> MutexGuard<'_, SlotMap> {
    // A panicking handler must not wedge every other job.
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> JobId {
        JobId::new(id).unwrap()
    }

    #[test]
    fn second_acquire_is_refused_until_release() {
        let guard = ExecutionGuard::new();
        let first = guard.try_acquire(&job("J1")).unwrap();

        assert!(guard.try_acquire(&job("J1")).is_none());
        assert!(guard.is_active(&job("J1")));

        drop(first);
        assert!(!guard.is_active(&job("J1")));
        assert!(guard.try_acquire(&job("J1")).is_some());
    }

    #[test]
    fn different_jobs_do_not_contend() {
        let guard = ExecutionGuard::new();
        let _a = guard.try_acquire(&job("A")).unwrap();
        let _b = guard.try_acquire(&job("B")).unwrap();
        assert_eq!(guard.tracked_count(), 2);
    }

    #[test]
    fn released_job_leaves_nothing_behind() {
        let guard = ExecutionGuard::new();

        let token = guard.try_acquire(&job("J1")).unwrap();
        assert_eq!(token.begin_attempt(1), 1);
        token.record_failure("boom");
        drop(token);

        assert_eq!(guard.tracked_count(), 0);
        assert!(guard.state(&job("J1")).is_none());

        let token = guard.try_acquire(&job("J1")).unwrap();
        assert_eq!(token.begin_attempt(2), 2);
        assert!(token.state().last_error.is_none());
    }

    #[test]
    fn many_released_jobs_do_not_accumulate() {
        let guard = ExecutionGuard::new();
        for i in 0..1_000 {
            let token = guard.try_acquire(&job(&format!("J{i}"))).unwrap();
            token.begin_attempt(1);
            token.record_failure("transient");
        }
        assert_eq!(guard.tracked_count(), 0);
    }

    #[test]
    fn broker_delivery_count_wins_after_restart() {
        let guard = ExecutionGuard::new();
        let token = guard.try_acquire(&job("J1")).unwrap();
        assert_eq!(token.begin_attempt(4), 4);
    }

    #[test]
    fn terminal_state_is_discarded_on_release() {
        let guard = ExecutionGuard::new();
        let token = guard.try_acquire(&job("J1")).unwrap();
        token.begin_attempt(1);
        token.mark_completed();
        drop(token);

        assert_eq!(guard.tracked_count(), 0);
        assert!(guard.state(&job("J1")).is_none());
    }

    #[test]
    fn concurrent_acquires_admit_exactly_one() {
        let guard = ExecutionGuard::new();
        let start = Arc::new(std::sync::Barrier::new(8));
        let tried = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                let start = start.clone();
                let tried = tried.clone();
                std::thread::spawn(move || {
                    start.wait();
                    let token = guard.try_acquire(&job("J1"));
                    // Hold the winner's token until every thread has tried.
                    tried.wait();
                    token.is_some()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
