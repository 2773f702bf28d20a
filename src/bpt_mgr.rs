//! Breakpoint, pause and single-step bookkeeping.
//!
//! The hot-path predicate `control_enabled` is a plain atomic read with no
//! locking; it is recomputed under the breakpoint lock whenever any of its
//! inputs changes (lock-free-by-design on the read side, per-instruction
//! call frequency). Installing or removing a breakpoint needs the engine's
//! code cache invalidated, so a new breakpoint first lands in the
//! `pending` set and is promoted to the installed set the next time the
//! engine precompiles its instruction after a successful flush.

use crate::host::{ThreadId, INVALID_THREAD_ID};
use crate::protocol::Addr;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

pub struct BptState {
    /// Breakpoints already reflected in precompiled code.
    pub bpts: HashSet<Addr>,
    /// Requested but not yet reflected; handled by the control routine in
    /// the meantime.
    pub pending_bpts: HashSet<Addr>,
    /// Thread to single-step, if any.
    pub stepping_thread: ThreadId,
    /// True if the code cache must be flushed on the next resume.
    pub need_reinst: bool,
}

pub struct BptMgr {
    inner: Mutex<BptState>,
    control_enabled: AtomicBool,
    break_at_next_inst: AtomicBool,
}

impl BptMgr {
    pub fn new() -> BptMgr {
        BptMgr {
            inner: Mutex::new(BptState {
                bpts: HashSet::new(),
                pending_bpts: HashSet::new(),
                stepping_thread: INVALID_THREAD_ID,
                need_reinst: false,
            }),
            control_enabled: AtomicBool::new(false),
            break_at_next_inst: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> MutexGuard<BptState> {
        self.inner.lock().unwrap()
    }

    /// The per-instruction "is control needed?" predicate. Pure load, no
    /// side effects, no calls; cheap enough for the engine to inline into
    /// the rewritten code stream.
    pub fn control_enabled(&self) -> bool {
        self.control_enabled.load(Ordering::Relaxed)
    }

    pub fn break_at_next_inst(&self) -> bool {
        self.break_at_next_inst.load(Ordering::Relaxed)
    }

    pub fn set_break_at_next_inst(&self, val: bool) {
        self.break_at_next_inst.store(val, Ordering::Relaxed);
    }

    pub fn add_soft_bpt(&self, at: Addr) {
        let mut b = self.lock();
        if b.bpts.contains(&at) {
            return;
        }
        if !b.pending_bpts.contains(&at) {
            debug_msg!(2, "add_soft_bpt({:#x})", at);
            b.pending_bpts.insert(at);
            b.need_reinst = true;
        }
    }

    pub fn del_soft_bpt(&self, at: Addr) {
        let mut b = self.lock();
        if b.bpts.remove(&at) {
            debug_msg!(2, "del_soft_bpt({:#x}, installed)", at);
            b.need_reinst = true;
            return;
        }
        if b.pending_bpts.remove(&at) {
            debug_msg!(2, "del_soft_bpt({:#x}, pending)", at);
            b.need_reinst = true;
        }
    }

    pub fn have_bpt_at(&self, addr: Addr) -> bool {
        self.lock().bpts.contains(&addr)
    }

    pub fn set_step(&self, stepping_tid: ThreadId) {
        let mut b = self.lock();
        debug_msg!(2, "set_step(tid={})", stepping_tid);
        b.stepping_thread = stepping_tid;
    }

    /// About to resume: recompute the control flag and report (and reset)
    /// whether a reinstrumentation cycle is due.
    pub fn prepare_resume(&self, have_suspended_threads: bool) -> bool {
        let mut b = self.lock();
        self.update_ctrl_flag(&b, have_suspended_threads);
        let ret = b.need_reinst;
        b.need_reinst = false;
        debug_msg!(
            2,
            "prepare_resume -> (control_enabled={}) {}",
            self.control_enabled(),
            ret
        );
        ret
    }

    /// About to suspend: force the control routine on so every running
    /// thread stops at its next instruction. Skipped once the process is
    /// exiting or detached.
    pub fn prepare_suspend(&self, terminal: bool) {
        if terminal {
            debug_msg!(2, "prepare_suspend: detached/exiting - don't suspend");
        } else {
            debug_msg!(2, "prepare_suspend");
            let _b = self.lock();
            self.control_enabled.store(true, Ordering::Relaxed);
        }
    }

    pub fn need_control_cb(&self, b: &BptState, have_suspended_threads: bool) -> bool {
        b.stepping_thread != INVALID_THREAD_ID
            || self.break_at_next_inst()
            || have_suspended_threads
            || !b.pending_bpts.is_empty()
    }

    pub fn update_ctrl_flag(&self, b: &BptState, have_suspended_threads: bool) {
        self.control_enabled.store(
            self.need_control_cb(b, have_suspended_threads),
            Ordering::Relaxed,
        );
    }

    /// Clear the one-shot stop conditions once an event has been emitted.
    pub fn clear_stop_conditions(&self) {
        let mut b = self.lock();
        self.break_at_next_inst.store(false, Ordering::Relaxed);
        b.stepping_thread = INVALID_THREAD_ID;
    }
}

impl Default for BptMgr {
    fn default() -> BptMgr {
        BptMgr::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_and_pending_stay_disjoint() {
        let m = BptMgr::new();
        m.add_soft_bpt(0x1000);
        {
            let b = m.lock();
            assert!(b.pending_bpts.contains(&0x1000));
            assert!(!b.bpts.contains(&0x1000));
            assert!(b.need_reinst);
        }
        // adding again is a no-op
        m.add_soft_bpt(0x1000);
        assert_eq!(m.lock().pending_bpts.len(), 1);

        // promote the way the precompile path does
        {
            let mut b = m.lock();
            b.pending_bpts.remove(&0x1000);
            b.bpts.insert(0x1000);
        }
        m.add_soft_bpt(0x1000);
        {
            let b = m.lock();
            assert!(b.pending_bpts.is_empty());
            assert!(b.bpts.contains(&0x1000));
        }
    }

    #[test]
    fn deleting_pending_and_installed_bpts() {
        let m = BptMgr::new();
        m.add_soft_bpt(0x1000);
        m.del_soft_bpt(0x1000);
        assert!(m.lock().pending_bpts.is_empty());

        {
            let mut b = m.lock();
            b.bpts.insert(0x2000);
            b.need_reinst = false;
        }
        m.del_soft_bpt(0x2000);
        let b = m.lock();
        assert!(!b.bpts.contains(&0x2000));
        assert!(b.need_reinst);
    }

    #[test]
    fn control_flag_follows_its_inputs() {
        let m = BptMgr::new();
        assert!(!m.control_enabled());

        m.add_soft_bpt(0x1000);
        {
            let b = m.lock();
            m.update_ctrl_flag(&b, false);
        }
        assert!(m.control_enabled());

        m.del_soft_bpt(0x1000);
        {
            let b = m.lock();
            m.update_ctrl_flag(&b, false);
        }
        assert!(!m.control_enabled());

        m.set_step(7);
        {
            let b = m.lock();
            m.update_ctrl_flag(&b, false);
        }
        assert!(m.control_enabled());
        m.clear_stop_conditions();

        {
            let b = m.lock();
            m.update_ctrl_flag(&b, true);
            assert!(m.need_control_cb(&b, true));
        }
        assert!(m.control_enabled());
    }

    #[test]
    fn prepare_resume_reports_reinstrumentation_once() {
        let m = BptMgr::new();
        m.add_soft_bpt(0x1000);
        assert!(m.prepare_resume(false));
        assert!(!m.prepare_resume(false));
    }

    #[test]
    fn prepare_suspend_is_a_no_op_when_terminal() {
        let m = BptMgr::new();
        m.prepare_suspend(true);
        assert!(!m.control_enabled());
        m.prepare_suspend(false);
        assert!(m.control_enabled());
    }
}
