//! Global lifecycle of the traced process and the gate semaphore every
//! application thread blocks on while the process is suspended.

use crate::semaphore::Semaphore;
use std::sync::{Mutex, MutexGuard};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ProcessState {
    /// Not started yet: no event is reported until PROCESS_START is queued.
    None,
    /// Application threads are running.
    Running,
    /// Pause request received, waiting for a thread to reach the control
    /// routine.
    PauseRequested,
    /// Suspended, waiting for resume.
    Suspended,
    /// Suspended because the trace buffer is full; released by the trace
    /// buffer gate rather than the run gate.
    WaitFlush,
    /// Process is exiting. Terminal.
    Exiting,
    /// Detached. Terminal.
    Detached,
}

impl ProcessState {
    pub fn started(self) -> bool {
        self != ProcessState::None
    }

    pub fn exiting(self) -> bool {
        self == ProcessState::Exiting
    }

    pub fn detached(self) -> bool {
        self == ProcessState::Detached
    }

    pub fn pause_requested(self) -> bool {
        self == ProcessState::PauseRequested
    }

    pub fn suspended(self) -> bool {
        self == ProcessState::Suspended || self == ProcessState::WaitFlush
    }

    pub fn terminal(self) -> bool {
        self.exiting() || self.detached()
    }
}

/// The state machine proper. Compound transitions (suspend plus event
/// enqueue, resume plus reinstrumentation) are driven by the agent while
/// holding the guard returned by `lock`.
pub struct ProcessCtl {
    state: Mutex<ProcessState>,
    /// Set while application threads may run. Cleared exactly while the
    /// state is Suspended or WaitFlush.
    pub run_app: Semaphore,
}

impl ProcessCtl {
    pub fn new() -> ProcessCtl {
        ProcessCtl {
            state: Mutex::new(ProcessState::None),
            run_app: Semaphore::new(false),
        }
    }

    pub fn lock(&self) -> MutexGuard<ProcessState> {
        self.state.lock().unwrap()
    }

    pub fn get(&self) -> ProcessState {
        *self.lock()
    }
}

impl Default for ProcessCtl {
    fn default() -> ProcessCtl {
        ProcessCtl::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        use ProcessState::*;
        assert!(!None.started());
        assert!(Running.started());
        assert!(Suspended.suspended());
        assert!(WaitFlush.suspended());
        assert!(!Running.suspended());
        assert!(Exiting.terminal());
        assert!(Detached.terminal());
        assert!(!PauseRequested.terminal());
    }

    #[test]
    fn starts_unstarted_with_closed_gate() {
        let p = ProcessCtl::new();
        assert_eq!(p.get(), ProcessState::None);
        assert!(!p.run_app.is_set());
    }
}
