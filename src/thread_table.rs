//! Per-thread state: saved register context, suspension semaphore and the
//! engine-local/OS thread-id mapping.
//!
//! Entries are created on first observation of an engine thread id and
//! destroyed only when the client acknowledges the corresponding
//! THREAD_EXIT, so the exit-time context survives until the client reads
//! it. The table owns the entries; nothing holds back-pointers into it,
//! callers look an entry up by id each time.

use crate::event::NO_THREAD;
use crate::host::{HostContext, ThreadId};
use crate::protocol::{Addr, RegisterSet, BADADDR};
use crate::registers;
use crate::semaphore::Semaphore;
use libc::pid_t;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

struct CtxSlot {
    /// Last saved register context, if any. Threads caught inside unknown
    /// system calls may never get one.
    ctx: Option<HostContext>,
    /// Overriding snapshot taken from a physical context whose capture
    /// does not outlive the callback that produced it.
    ctx_regs: Option<RegisterSet>,
}

pub struct ThreadEntry {
    slot: Mutex<CtxSlot>,
    /// Cleared while the thread is individually suspended.
    pub thr_sem: Semaphore,
    ext_tid: AtomicI32,
    susp: AtomicBool,
    /// True if the last exception is being handled by the debugger.
    ev_handled: AtomicBool,
}

impl ThreadEntry {
    fn new() -> ThreadEntry {
        ThreadEntry {
            slot: Mutex::new(CtxSlot {
                ctx: None,
                ctx_regs: None,
            }),
            thr_sem: Semaphore::new(true),
            ext_tid: AtomicI32::new(NO_THREAD),
            susp: AtomicBool::new(false),
            ev_handled: AtomicBool::new(false),
        }
    }

    pub fn ctx_ok(&self) -> bool {
        let s = self.slot.lock().unwrap();
        s.ctx.is_some() || s.ctx_regs.is_some()
    }

    pub fn save_ctx(&self, src: &HostContext) {
        let mut s = self.slot.lock().unwrap();
        s.ctx = Some(src.clone());
        s.ctx_regs = None;
    }

    pub fn save_ctx_regs(&self, regs: RegisterSet) {
        let mut s = self.slot.lock().unwrap();
        s.ctx_regs = Some(regs);
    }

    /// Invalidate the overriding snapshot once the client has resumed past
    /// the engine-internal exception it was captured for.
    pub fn drop_ctx_regs(&self) {
        let mut s = self.slot.lock().unwrap();
        s.ctx_regs = None;
    }

    /// Registers for the client: the overriding snapshot wins over the
    /// decomposed saved context.
    pub fn export_ctx(&self) -> Option<RegisterSet> {
        let s = self.slot.lock().unwrap();
        if let Some(regs) = s.ctx_regs {
            return Some(regs);
        }
        s.ctx.as_ref().map(registers::from_context)
    }

    pub fn ip(&self) -> Addr {
        let s = self.slot.lock().unwrap();
        if let Some(regs) = s.ctx_regs {
            return regs.eip;
        }
        match s.ctx.as_ref() {
            Some(c) => c.ip(),
            None => BADADDR,
        }
    }

    pub fn suspended(&self) -> bool {
        self.susp.load(Ordering::Relaxed)
    }

    pub fn excp_handled(&self) -> bool {
        self.ev_handled.load(Ordering::Relaxed)
    }

    pub fn set_excp_handled(&self, val: bool) {
        debug_msg!(
            3,
            "thread {}: exception handled={}",
            self.ext_tid(),
            val
        );
        self.ev_handled.store(val, Ordering::Relaxed);
    }

    pub fn ext_tid(&self) -> pid_t {
        self.ext_tid.load(Ordering::Relaxed)
    }
}

struct TableInner {
    map: HashMap<ThreadId, Arc<ThreadEntry>>,
    ext_map: HashMap<pid_t, ThreadId>,
}

pub struct ThreadTable {
    inner: Mutex<TableInner>,
    nthreads: AtomicI32,
    nsuspended: AtomicI32,
}

impl ThreadTable {
    pub fn new() -> ThreadTable {
        ThreadTable {
            inner: Mutex::new(TableInner {
                map: HashMap::new(),
                ext_map: HashMap::new(),
            }),
            nthreads: AtomicI32::new(0),
            nsuspended: AtomicI32::new(0),
        }
    }

    /// Return or create the entry for `tid`. External-id initialization is
    /// best effort: the OS thread-id query answers for the caller only, so
    /// it succeeds only when `tid` names the calling thread; otherwise the
    /// external id stays unknown until a later call from inside the thread.
    pub fn lookup(&self, tid: ThreadId, cur_tid: ThreadId, os_tid: pid_t) -> Arc<ThreadEntry> {
        let mut t = self.inner.lock().unwrap();
        let entry = match t.map.get(&tid) {
            Some(e) => Arc::clone(e),
            None => {
                let e = Arc::new(ThreadEntry::new());
                t.map.insert(tid, Arc::clone(&e));
                self.nthreads.fetch_add(1, Ordering::Relaxed);
                msg!(
                    "Created thread data ({}), #threads={}",
                    tid,
                    self.nthreads.load(Ordering::Relaxed)
                );
                e
            }
        };
        if entry.ext_tid() == NO_THREAD {
            if tid == cur_tid {
                entry.ext_tid.store(os_tid, Ordering::Relaxed);
                t.ext_map.insert(os_tid, tid);
            } else {
                msg!("external tid of thread {} unknown inside {}", tid, cur_tid);
            }
        }
        entry
    }

    pub fn get(&self, tid: ThreadId) -> Option<Arc<ThreadEntry>> {
        let t = self.inner.lock().unwrap();
        t.map.get(&tid).map(Arc::clone)
    }

    pub fn ext_tid_of(&self, tid: ThreadId) -> pid_t {
        match self.get(tid) {
            Some(e) => e.ext_tid(),
            None => NO_THREAD,
        }
    }

    pub fn local_tid_of(&self, ext: pid_t) -> Option<ThreadId> {
        let t = self.inner.lock().unwrap();
        t.ext_map.get(&ext).copied()
    }

    /// Drop a thread's entry. Called when the client resumes past the
    /// thread's THREAD_EXIT event.
    pub fn release(&self, tid: ThreadId) -> bool {
        let mut t = self.inner.lock().unwrap();
        match t.map.remove(&tid) {
            Some(e) => {
                let ext = e.ext_tid();
                if ext != NO_THREAD {
                    t.ext_map.remove(&ext);
                }
                self.nthreads.fetch_sub(1, Ordering::Relaxed);
                debug_msg!(
                    2,
                    "Thread data deleted ({}), #threads={}",
                    tid,
                    self.nthreads.load(Ordering::Relaxed)
                );
                true
            }
            None => false,
        }
    }

    pub fn any_stopped(&self) -> Option<Arc<ThreadEntry>> {
        let t = self.inner.lock().unwrap();
        t.map.values().find(|e| e.suspended()).map(Arc::clone)
    }

    pub fn nthreads(&self) -> i32 {
        self.nthreads.load(Ordering::Relaxed)
    }

    pub fn nsuspended(&self) -> i32 {
        self.nsuspended.load(Ordering::Relaxed)
    }

    pub fn have_suspended_threads(&self) -> bool {
        self.nsuspended() != 0
    }

    pub fn all_threads_suspended(&self) -> bool {
        let n = self.nthreads();
        n != 0 && self.nsuspended() == n
    }

    pub fn suspend(&self, entry: &ThreadEntry) {
        entry.thr_sem.clear();
        entry.susp.store(true, Ordering::Relaxed);
        self.nsuspended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resume(&self, entry: &ThreadEntry) {
        entry.susp.store(false, Ordering::Relaxed);
        self.nsuspended.fetch_sub(1, Ordering::Relaxed);
        entry.thr_sem.set();
    }
}

impl Default for ThreadTable {
    fn default() -> ThreadTable {
        ThreadTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CtxReg;

    #[test]
    fn lookup_creates_once_and_learns_ext_tid_from_inside_only() {
        let t = ThreadTable::new();
        // called from thread 7 about thread 3: external id stays unknown
        let e = t.lookup(3, 7, 300);
        assert_eq!(e.ext_tid(), NO_THREAD);
        assert_eq!(t.nthreads(), 1);
        // later call from inside thread 3 fills it in
        let e2 = t.lookup(3, 3, 303);
        assert_eq!(e2.ext_tid(), 303);
        assert_eq!(t.nthreads(), 1);
        assert_eq!(t.local_tid_of(303), Some(3));
        assert_eq!(t.ext_tid_of(3), 303);
    }

    #[test]
    fn suspend_flag_matches_cleared_semaphore() {
        let t = ThreadTable::new();
        let e = t.lookup(1, 1, 100);
        assert!(e.thr_sem.is_set());
        t.suspend(&e);
        assert!(e.suspended());
        assert!(!e.thr_sem.is_set());
        assert_eq!(t.nsuspended(), 1);
        t.resume(&e);
        assert!(!e.suspended());
        assert!(e.thr_sem.is_set());
        assert_eq!(t.nsuspended(), 0);
    }

    #[test]
    fn all_threads_suspended_needs_every_entry() {
        let t = ThreadTable::new();
        let a = t.lookup(1, 1, 100);
        let b = t.lookup(2, 2, 200);
        assert!(!t.all_threads_suspended());
        t.suspend(&a);
        assert!(t.have_suspended_threads());
        assert!(!t.all_threads_suspended());
        t.suspend(&b);
        assert!(t.all_threads_suspended());
    }

    #[test]
    fn release_removes_both_mappings() {
        let t = ThreadTable::new();
        t.lookup(5, 5, 500);
        assert!(t.release(5));
        assert!(!t.release(5));
        assert_eq!(t.nthreads(), 0);
        assert_eq!(t.local_tid_of(500), None);
    }

    #[test]
    fn export_prefers_the_overriding_snapshot() {
        let t = ThreadTable::new();
        let e = t.lookup(1, 1, 100);
        assert!(!e.ctx_ok());
        assert!(e.export_ctx().is_none());

        let mut ctx = HostContext::new();
        ctx.set(CtxReg::InstPtr, 0x1000);
        e.save_ctx(&ctx);
        assert_eq!({ e.export_ctx().unwrap().eip }, 0x1000);

        e.save_ctx_regs(RegisterSet::undefined_at(0x2000));
        assert_eq!({ e.export_ctx().unwrap().eip }, 0x2000);
        assert_eq!(e.ip(), 0x2000);

        e.drop_ctx_regs();
        assert_eq!({ e.export_ctx().unwrap().eip }, 0x1000);
    }
}
