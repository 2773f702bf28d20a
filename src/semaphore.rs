use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Binary semaphore with the set/clear/wait surface the suspension protocol
/// is written against. `wait` returns immediately while the semaphore is
/// set; clearing it parks every subsequent waiter until `set` is called.
pub struct Semaphore {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initially_set: bool) -> Semaphore {
        Semaphore {
            state: Mutex::new(initially_set),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut s = self.state.lock().unwrap();
        *s = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        let mut s = self.state.lock().unwrap();
        *s = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    pub fn wait(&self) {
        let mut s = self.state.lock().unwrap();
        while !*s {
            s = self.cond.wait(s).unwrap();
        }
    }

    /// Wait until the semaphore is set or `timeout` elapses. Returns whether
    /// the semaphore was set.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut s = self.state.lock().unwrap();
        while !*s {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, res) = self.cond.wait_timeout(s, deadline - now).unwrap();
            s = guard;
            if res.timed_out() && !*s {
                return false;
            }
        }
        true
    }
}
