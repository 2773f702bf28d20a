//! The agent proper: one process-wide object tying the queue, thread
//! table, state machine, breakpoint manager and instrumenter together.
//!
//! Everything here runs inside engine callbacks or analysis routines, on
//! whatever thread the engine picked. Callbacks only enqueue and return
//! or park on a named semaphore; the long waits are released by the
//! request dispatcher. A callback never blocks on a semaphore held by
//! another callback.

use crate::bpt_mgr::BptMgr;
use crate::ev_queue::EvQueue;
use crate::event::{
    BptAddrs, DebugEvent, EventId, EventPayload, ExceptionInfo, ModuleInfo, NO_THREAD,
};
use crate::host::{
    get_ctx_ip, ContextChangeReason, Host, HostContext, HookKind, HookPoint, ImageInfo, InsDesc,
    Splice, ThreadId, TraceLayer, INVALID_THREAD_ID, ORDER_DEFAULT, ORDER_FIRST, ORDER_LAST,
};
use crate::instrumenter::{
    Instrumenter, InstrState, TevType, TraceEntry, INST_BBLOCK, INST_INSN, INST_ROUTINE,
};
use crate::net::{self, Channel, IoOutcome};
use crate::process_state::{ProcessCtl, ProcessState};
use crate::protocol::{bytes_of, bytes_of_mut, Addr, Pod, BADADDR};
use crate::registers;
use crate::semaphore::Semaphore;
use crate::thread_table::{ThreadEntry, ThreadTable};
use nix::errno::Errno;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Software-trap exception code that must never be masked: masking resumes
/// at the same address and loops forever.
pub const TRAP_EXCEPTION_CODE: i32 = 0x8000_0003u32 as i32;

/// Outcome of the control/breakpoint analysis routines.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum CtrlEv {
    Paused,
    SingleStep,
    Bpt,
    InitialStop,
    None,
}

pub struct Agent {
    host: RwLock<Arc<dyn Host>>,
    pub events: EvQueue,
    pub threads: ThreadTable,
    pub process: ProcessCtl,
    pub breakpoints: BptMgr,
    pub instr: Instrumenter,
    pub chan: Channel,

    /// Flipped by the listener thread once it owns the socket; protected
    /// by its own lock since it arbitrates who may talk to the client.
    listener_ready: Mutex<bool>,
    pub listener_exited: Semaphore,

    /// Main thread gets no THREAD_START event; the client learns it from
    /// PROCESS_START.
    main_thread: AtomicU32,
    /// PROCESS_START remembered while attaching, replayed as
    /// PROCESS_ATTACH at the initial stop.
    attach_ev: Mutex<Option<DebugEvent>>,
    app_start_called: AtomicBool,
    // for debug purposes
    last_packet: Mutex<&'static str>,
}

lazy_static! {
    pub static ref AGENT: Agent = Agent::new(Arc::new(crate::host::SysHost::new()));
}

impl Agent {
    pub fn new(host: Arc<dyn Host>) -> Agent {
        Agent {
            host: RwLock::new(host),
            events: EvQueue::new(),
            threads: ThreadTable::new(),
            process: ProcessCtl::new(),
            breakpoints: BptMgr::new(),
            instr: Instrumenter::new(),
            chan: Channel::new(),
            listener_ready: Mutex::new(false),
            listener_exited: Semaphore::new(false),
            main_thread: AtomicU32::new(INVALID_THREAD_ID),
            attach_ev: Mutex::new(None),
            app_start_called: AtomicBool::new(false),
            last_packet: Mutex::new("NONE"),
        }
    }

    pub fn host(&self) -> Arc<dyn Host> {
        Arc::clone(&*self.host.read().unwrap())
    }

    /// Swap in the engine binding. Done once at startup, before any
    /// callback can fire.
    pub fn set_host(&self, host: Arc<dyn Host>) {
        *self.host.write().unwrap() = host;
    }

    pub fn main_thread(&self) -> ThreadId {
        self.main_thread.load(Ordering::Relaxed)
    }

    pub fn listener_is_ready(&self) -> bool {
        *self.listener_ready.lock().unwrap()
    }

    pub fn set_listener_ready(&self, val: bool) {
        *self.listener_ready.lock().unwrap() = val;
    }

    pub fn last_packet(&self) -> &'static str {
        *self.last_packet.lock().unwrap()
    }

    pub fn set_last_packet(&self, name: &'static str) {
        *self.last_packet.lock().unwrap() = name;
    }

    // ---- thread helpers ----

    pub fn cur_thread_id(&self) -> ThreadId {
        self.host().thread_id()
    }

    pub fn thread_data(&self, tid: ThreadId) -> Arc<ThreadEntry> {
        let h = self.host();
        self.threads.lookup(tid, h.thread_id(), h.os_thread_id())
    }

    fn thread_wait(&self, td: &ThreadEntry) {
        // do not park the thread while the listener has not started yet
        if self.listener_is_ready() {
            td.thr_sem.wait();
        }
    }

    // ---- process exit / detach ----

    pub fn exit_process(&self, code: i32) -> ! {
        {
            let mut st = self.process.lock();
            *st = ProcessState::Exiting;
        }
        self.process.run_app.set();
        self.host().exit_process(code)
    }

    pub fn detach_process(&self) {
        {
            let mut st = self.process.lock();
            *st = ProcessState::Detached;
        }
        self.process.run_app.set();
        self.host().detach();
    }

    // ---- network policy ----

    fn check_network_error(&self, err: Errno, from_where: &str) {
        if err != Errno::EAGAIN {
            msg!(
                "A network error {} happened in {}, exiting from application...",
                err,
                from_where
            );
            self.exit_process(-1);
        }
        msg!("Timeout, called from {}", from_where);
    }

    pub fn net_send(&self, buf: &[u8], from_where: &str) -> isize {
        match net::send_exact(self.chan.cli(), buf) {
            IoOutcome::Done => buf.len() as isize,
            IoOutcome::Closed => 0,
            IoOutcome::Failed(e) => {
                self.check_network_error(e, from_where);
                -1
            }
        }
    }

    pub fn net_recv(&self, buf: &mut [u8], from_where: &str) -> isize {
        match net::recv_exact(self.chan.cli(), buf) {
            IoOutcome::Done => buf.len() as isize,
            IoOutcome::Closed => 0,
            IoOutcome::Failed(e) => {
                self.check_network_error(e, from_where);
                -1
            }
        }
    }

    pub fn send_frame<T: Pod>(&self, v: &T, from_where: &str) -> bool {
        self.net_send(bytes_of(v), from_where) == mem::size_of::<T>() as isize
    }

    pub fn recv_frame<T: Pod>(&self, v: &mut T, from_where: &str) -> isize {
        self.net_recv(bytes_of_mut(v), from_where)
    }

    // ---- event plumbing ----

    /// Fill the common fields and queue the event.
    pub fn enqueue_event(&self, mut ev: DebugEvent, tid: ThreadId) {
        ev.pid = self.host().pid();
        ev.tid = self.threads.ext_tid_of(tid);
        ev.handled = false;
        self.events.push_back(ev);
    }

    /// Queue a stop event carrying an already-known external thread id.
    fn emit_suspend_ev(&self, eid: EventId, ea: Addr, ext_tid: libc::pid_t) {
        let mut event = if eid == EventId::ProcessAttach {
            match self.attach_ev.lock().unwrap().clone() {
                Some(ev) => ev,
                None => DebugEvent::new(eid),
            }
        } else {
            let mut ev = DebugEvent::new(eid);
            if eid == EventId::Breakpoint {
                ev.payload = EventPayload::Bpt(BptAddrs {
                    hea: BADADDR,
                    kea: BADADDR,
                });
            }
            ev
        };
        event.eid = eid;
        event.ea = ea;
        event.tid = ext_tid;
        event.pid = self.host().pid();
        self.events.push_back(event);
    }

    /// Dequeue one event. Events queued with an unknown thread id (a bare
    /// PAUSE broadcast) are patched from any thread that is actually
    /// stopped; with none, the sentinel id goes out and is logged.
    pub fn pop_debug_event(&self) -> Option<DebugEvent> {
        let mut ev = self.events.pop_front()?;
        if ev.tid == NO_THREAD {
            match self.threads.any_stopped() {
                Some(td) => {
                    ev.tid = td.ext_tid();
                    ev.ea = td.ip();
                    debug_msg!(2, "pop event->correct tid({})/ea({:#x})", ev.tid, ev.ea);
                }
                None => {
                    msg!("agent error: undefined event TID and no stopped thread found");
                }
            }
        }
        Some(ev)
    }

    /// Move to the given suspended state: close the gate, flag the control
    /// routine on. Process-state lock held by the caller.
    pub fn do_suspend_nolock(&self, st: &mut ProcessState, new_state: ProcessState) {
        if !st.suspended() {
            if new_state == ProcessState::WaitFlush {
                msg!("do_suspend_nolock - invalid state WaitFlush");
                self.exit_process(-1);
            }
            self.process.run_app.clear();
            *st = new_state;
            debug_msg!(2, "do_suspend_nolock({:?})", new_state);
            self.breakpoints.prepare_suspend(st.terminal());
        }
    }

    /// Queue the event and suspend the process, unless it is already going
    /// away.
    pub fn suspend_at_event(&self, ev: DebugEvent, tid: ThreadId) {
        let mut st = self.process.lock();
        if !st.detached() && !st.exiting() {
            self.enqueue_event(ev, tid);
            self.do_suspend_nolock(&mut st, ProcessState::Suspended);
        }
    }

    /// Callbacks cannot park on the gate themselves; they arm the control
    /// routine so the thread stops at its next instruction instead.
    pub fn wait_after_callback(&self) {
        let st = self.process.lock();
        debug_msg!(2, "callback wait (state={:?})", *st);
        self.breakpoints.prepare_suspend(st.terminal());
    }

    /// Park until `sem` is set, serving requests synchronously first while
    /// the listener thread is not live yet (early breakpoints arrive that
    /// way).
    pub fn wait_app_resume(&'static self, sem: &Semaphore) {
        if !self.serve_sync() {
            // nothing sensible left to do if the synchronous path failed;
            // open the gate rather than deadlock
            sem.set();
        }
        sem.wait();
    }

    // ---- engine callbacks ----

    /// The target is about to execute its first instruction.
    pub fn app_start_cb(&'static self) {
        debug_msg!(2, "Setting process started to true");
        {
            let mut st = self.process.lock();
            *st = ProcessState::Running;
        }
        let tid = self.cur_thread_id();
        self.main_thread.store(tid, Ordering::Relaxed);

        let images = self.host().images();
        let img = match images.iter().find(|i| i.is_main) {
            Some(img) => img,
            None => {
                fatal!("Cannot find the 1st instruction of the main executable!");
            }
        };

        let mut event = DebugEvent::new(EventId::ProcessStart);
        event.ea = img.entry;
        event.payload = EventPayload::Module(ModuleInfo {
            name: img.name.clone(),
            base: img.low,
            size: (img.high - img.low) as u32,
            rebase_to: BADADDR,
        });
        if self.host().is_attaching() {
            *self.attach_ev.lock().unwrap() = Some(event.clone());
        }
        self.suspend_at_event(event, tid);

        if !self.app_start_called.swap(true, Ordering::SeqCst) {
            msg!(
                "Head image: {} Start {:#x} End {:#x}",
                img.name,
                img.low,
                img.high
            );
            self.instr
                .process_image_window(&img.name, img.low, img.high, true);
        }

        // Serve requests in the application thread until the RESUME for
        // PROCESS_START arrives, so breakpoints land before the target's
        // code runs.
        if !self.handle_packets(-1, EventId::ProcessStart) {
            msg!("Error handling initial requests, exiting...");
            self.exit_process(-1);
        }
        msg!("All breakpoints seem to be added, running the application...");
    }

    pub fn image_load_cb(&self, img: &ImageInfo) {
        msg!(
            "Loading library {} {:#x}:{:#x}",
            img.name,
            img.low,
            img.high
        );

        let mut event = DebugEvent::new(EventId::LibraryLoad);
        event.ea = img.entry;
        event.payload = EventPayload::Module(ModuleInfo {
            name: img.name.clone(),
            base: img.low,
            size: (img.high - img.low) as u32,
            rebase_to: BADADDR,
        });
        self.enqueue_event(event, self.cur_thread_id());

        self.instr
            .process_image_window(&img.name, img.low, img.high, false);
    }

    pub fn image_unload_cb(&self, img: &ImageInfo) {
        let mut event = DebugEvent::new(EventId::LibraryUnload);
        event.ea = BADADDR;
        event.payload = EventPayload::Text(img.name.clone());
        self.enqueue_event(event, self.cur_thread_id());

        msg!("Unloading {}", img.name);
    }

    pub fn thread_start_cb(&self, tid: ThreadId, ctx: &HostContext) {
        let tdata = self.thread_data(tid);
        tdata.save_ctx(ctx);

        debug_msg!(2, "thread_start_cb({}/{})", tid, tdata.ext_tid());

        if tid != self.main_thread() {
            let mut ev = DebugEvent::new(EventId::ThreadStart);
            ev.ea = ctx.ip();
            self.suspend_at_event(ev, tid);
            debug_msg!(2, "THREAD START: {} AT {:#x}", tdata.ext_tid(), ctx.ip());

            self.wait_after_callback();
        }
    }

    pub fn thread_fini_cb(&'static self, tid: ThreadId, ctx: &HostContext, code: i32) {
        let tdata = self.thread_data(tid);
        tdata.save_ctx(ctx);

        let mut ev = DebugEvent::new(EventId::ThreadExit);
        ev.ea = ctx.ip();
        ev.payload = EventPayload::ExitCode(code);
        debug_msg!(2, "THREAD FINISH: {} AT {:#x}", tid, ctx.ip());
        self.suspend_at_event(ev, tid);

        self.wait_after_callback();
    }

    /// The target is exiting; queue PROCESS_EXIT and wait (bounded) for
    /// the internal threads to drain.
    pub fn fini_cb(&self, code: i32) {
        let mut ev = DebugEvent::new(EventId::ProcessExit);
        ev.payload = EventPayload::ExitCode(code);
        self.enqueue_event(ev, self.cur_thread_id());

        msg!("Waiting for internal threads to exit...");
        if self.listener_exited.timed_wait(Duration::from_secs(10))
            && self.finish_instrumenter()
        {
            msg!("Everything OK");
        } else {
            msg!("Timeout waiting for internal thread.");
        }
    }

    /// The target received a signal/exception or returns from one.
    /// Returns true when the client chose to mask the exception, i.e. the
    /// engine must resume from the pre-exception context.
    pub fn context_change_cb(
        &'static self,
        tid: ThreadId,
        reason: ContextChangeReason,
        ctxt_from: Option<&HostContext>,
        to_ip: Addr,
        sig: i32,
    ) -> bool {
        let tdata = self.thread_data(tid);
        let ea = get_ctx_ip(ctxt_from);
        if let Some(ctx) = ctxt_from {
            tdata.save_ctx(ctx);
        }

        let info = match reason {
            ContextChangeReason::FatalSignal => {
                format!("Fatal signal {} at {:#x}", sig, ea)
            }
            ContextChangeReason::Signal => format!("Signal {} at {:#x}", sig, ea),
            ContextChangeReason::Exception => {
                format!("Exception {:#x} at address {:#x}", sig as u32, ea)
            }
            ContextChangeReason::SigReturn => {
                msg!("Context changed: signal return {} at {:#x}", sig, ea);
                return false;
            }
            ContextChangeReason::Apc => {
                msg!("Context changed: Asynchronous Process Call {} at {:#x}", sig, ea);
                return false;
            }
            ContextChangeReason::Callback => {
                msg!("Context changed: Window's Call-back {} at {:#x}", sig, ea);
                return false;
            }
        };

        let mut event = DebugEvent::new(EventId::Exception);
        event.ea = ea;
        event.payload = EventPayload::Exception(ExceptionInfo {
            code: sig as u32,
            can_cont: reason != ContextChangeReason::FatalSignal,
            ea,
            info,
        });

        tdata.set_excp_handled(false);
        self.suspend_at_event(event, tid);

        msg!(
            "EXCEPTION at {:#x} -> {:#x} (thread {})",
            ea,
            to_ip,
            tdata.ext_tid()
        );

        self.wait_app_resume(&self.process.run_app);
        if tdata.excp_handled() {
            if reason == ContextChangeReason::Exception && sig == TRAP_EXCEPTION_CODE {
                // masking a software trap resumes at the same address and
                // raises the same exception again
                msg!("Don't mask INT3 exception to avoid infinite loop");
                false
            } else {
                msg!("Mask exception");
                true
            }
        } else {
            msg!("Pass exception to the application");
            false
        }
    }

    /// Exception raised inside the engine itself. The physical context
    /// does not outlive this callback, so its registers are decomposed and
    /// parked as the thread's overriding snapshot until the client resumes.
    /// Returns true when execution should continue as handled.
    pub fn internal_exception_cb(
        &'static self,
        tid: ThreadId,
        code: u32,
        ea: Addr,
        info: String,
        phys_ctx: &HostContext,
    ) -> bool {
        let mut event = DebugEvent::new(EventId::Exception);
        event.ea = ea;
        event.payload = EventPayload::Exception(ExceptionInfo {
            code,
            can_cont: true,
            ea,
            info: info.clone(),
        });

        let tdata = self.thread_data(tid);
        tdata.save_ctx_regs(registers::from_context(phys_ctx));

        msg!("INTERNAL EXCEPTION (thread {}, code={:x}): {}", tid, code, info);
        let exc_ip = phys_ctx.ip();
        if ea != exc_ip {
            msg!("ExceptionAddress({:#x}) differs from ExceptionEIP ({:#x})!!!", ea, exc_ip);
        }

        tdata.set_excp_handled(false);
        self.suspend_at_event(event, tid);
        self.wait_app_resume(&self.process.run_app);
        tdata.drop_ctx_regs();
        if tdata.excp_handled() {
            msg!("Continue execution after internal exception");
            true
        } else {
            msg!("Execute default system procedure for internal exception");
            false
        }
    }

    // ---- control/breakpoint analysis routines ----

    /// The inlinable "if" half of the control pair: a pure flag read.
    pub fn ctrl_rtn_enabled(&self) -> bool {
        self.breakpoints.control_enabled()
    }

    pub fn ctrl_rtn(&'static self, addr: Addr, ctx: &HostContext) {
        if self.process.get().exiting() {
            return;
        }

        let tid = self.cur_thread_id();
        let tdata = self.thread_data(tid);

        debug_msg!(3, "ctrl_rtn at {:#x} (thread {})", addr, tid);

        // save the current thread's context in case the process suspends
        tdata.save_ctx(ctx);

        let mut eid = CtrlEv::None;
        {
            let b = self.breakpoints.lock();
            if b.pending_bpts.contains(&addr) {
                eid = CtrlEv::Bpt;
                debug_msg!(2, "Pending bpt at {:#x} (thread {})", addr, tid);
            } else if b.stepping_thread == tid {
                if !b.bpts.contains(&addr) {
                    eid = CtrlEv::SingleStep;
                }
            } else if self.breakpoints.break_at_next_inst() && !b.bpts.contains(&addr) {
                // emit only if there is no installed bpt here, otherwise
                // the breakpoint routine reports this address
                eid = CtrlEv::InitialStop;
            }
        }

        {
            let mut st = self.process.lock();
            if eid == CtrlEv::None && st.pause_requested() {
                eid = CtrlEv::Paused;
            }
            self.emit_ctrl_event(&mut st, eid, addr, tid);
        }

        // suspend the thread if needed
        self.thread_wait(&tdata);
        self.wait_app_resume(&self.process.run_app);
    }

    pub fn bpt_rtn(&'static self, addr: Addr, ctx: &HostContext) {
        if self.process.get().exiting() {
            return;
        }

        let tid = self.cur_thread_id();
        let tdata = self.thread_data(tid);

        debug_msg!(2, "bpt_rtn at {:#x} (thread {})", addr, tid);

        tdata.save_ctx(ctx);

        {
            let mut st = self.process.lock();
            if self.breakpoints.have_bpt_at(addr) {
                self.emit_ctrl_event(&mut st, CtrlEv::Bpt, addr, tid);
            }
        }

        self.thread_wait(&tdata);
        self.wait_app_resume(&self.process.run_app);
    }

    /// Process-state lock held by the caller.
    fn emit_ctrl_event(&self, st: &mut ProcessState, eid: CtrlEv, addr: Addr, tid: ThreadId) {
        let (name, event_id) = match eid {
            CtrlEv::Paused => ("Paused", EventId::ProcessSuspend),
            CtrlEv::SingleStep => ("Single step", EventId::Step),
            CtrlEv::Bpt => ("Breakpoint", EventId::Breakpoint),
            CtrlEv::InitialStop => ("Initial break", EventId::ProcessAttach),
            CtrlEv::None => return,
        };
        if !st.detached() && !st.exiting() {
            self.breakpoints.clear_stop_conditions();
            self.do_suspend_nolock(st, ProcessState::Suspended);

            let ext_tid = self.threads.ext_tid_of(tid);
            msg!("{} at {:#x} (thread {}/{})", name, addr, ext_tid, tid);

            self.emit_suspend_ev(event_id, addr, ext_tid);
        }
    }

    // ---- precompilation hooks ----

    /// Per-instruction layer: splice the trace hook when enabled, and the
    /// control/breakpoint pair always.
    pub fn precompile_ins(&self, ins: &InsDesc, hooks: &mut Vec<Splice>) {
        eprintln!("DBG precompile_ins addr={:#x} tracing_instruction={} check_address={} ban={}", ins.addr, self.instr.tracing_instruction(), self.instr.check_address(ins.addr, self.breakpoints.break_at_next_inst()), self.breakpoints.break_at_next_inst());
        if self.instr.tracing_instruction()
            && self
                .instr
                .check_address(ins.addr, self.breakpoints.break_at_next_inst())
        {
            hooks.push(Splice {
                order: ORDER_LAST,
                point: HookPoint::Before,
                kind: HookKind::TraceIns(TevType::Insn),
            });
        }
        self.add_bpt_rtns(ins.addr, hooks);
    }

    /// Basic-block layer: the block head and every control-transfer or
    /// odd instruction gets a classified trace hook.
    pub fn precompile_bbl(&self, ins: &InsDesc, hooks: &mut Vec<Splice>) {
        if !self.instr.tracing_bblock()
            || !self
                .instr
                .check_address(ins.addr, self.breakpoints.break_at_next_inst())
        {
            return;
        }
        if ins.is_bbl_head
            || ins.is_branch_or_call
            || ins.is_ret
            || ins.is_syscall
            || !ins.is_valid
        {
            let tev_type = if ins.is_call {
                TevType::Call
            } else if ins.is_ret {
                TevType::Ret
            } else {
                TevType::Insn
            };
            hooks.push(Splice {
                order: ORDER_DEFAULT,
                point: HookPoint::Before,
                kind: HookKind::TraceIns(tev_type),
            });
        }
    }

    /// Routine layer: calls and returns report at the taken-branch point.
    /// push + ret pairs count as returns, hence no call-only filter.
    pub fn precompile_rtn(&self, ins: &InsDesc, hooks: &mut Vec<Splice>) {
        if self.instr.tracing_routine() && (ins.is_call || ins.is_ret) {
            hooks.push(Splice {
                order: ORDER_DEFAULT,
                point: HookPoint::TakenBranch,
                kind: HookKind::Rtn,
            });
        }
    }

    /// Attach the control pair to every instruction and the breakpoint
    /// routine where one is (or is about to be) installed. Also the place
    /// where pending breakpoints get promoted: once the instrumenter state
    /// says the cache flush happened, seeing an instruction here means its
    /// precompiled code is fresh.
    fn add_bpt_rtns(&self, ins_addr: Addr, hooks: &mut Vec<Splice>) {
        debug_msg!(
            3,
            "add_bpt_rtns ({:#x}) -> {}",
            ins_addr,
            self.breakpoints.control_enabled()
        );
        hooks.push(Splice {
            order: ORDER_FIRST,
            point: HookPoint::Before,
            kind: HookKind::Ctrl,
        });

        let have_susp = self.threads.have_suspended_threads();
        let mut b = self.breakpoints.lock();
        let have_bpt;
        if b.stepping_thread != INVALID_THREAD_ID || have_susp || !self.instr.state_ok() {
            // reinstrumentation has not really started, or the control
            // routine is active anyway: serve this pending bpt from here
            if b.pending_bpts.remove(&ins_addr) {
                b.bpts.insert(ins_addr);
                have_bpt = true;
                self.breakpoints.update_ctrl_flag(&b, have_susp);
                debug_msg!(
                    2,
                    "Inject pending bpt at {:#x}, npending={}, ctrl_flag={}",
                    ins_addr,
                    b.pending_bpts.len(),
                    self.breakpoints.control_enabled()
                );
            } else {
                have_bpt = b.bpts.contains(&ins_addr);
            }
        } else {
            // the jit cache has been cleaned: move every pending bpt to
            // the permanent set and deactivate the control routine as soon
            // as possible
            if !b.pending_bpts.is_empty() {
                debug_msg!(
                    2,
                    "Move {} pending breakpoints to permanent set",
                    b.pending_bpts.len()
                );
                let pend: Vec<Addr> = b.pending_bpts.drain().collect();
                for a in pend {
                    b.bpts.insert(a);
                }
                self.breakpoints.update_ctrl_flag(&b, have_susp);
            }
            have_bpt = b.bpts.contains(&ins_addr);
        }
        if have_bpt {
            debug_msg!(2, "attach bpt routine ({:#x})", ins_addr);
            hooks.push(Splice {
                order: ORDER_FIRST + 1,
                point: HookPoint::Before,
                kind: HookKind::Bpt,
            });
        }
    }

    // ---- trace analysis routines ----

    pub fn ins_enabled(&self) -> bool {
        self.instr.tracing_instruction()
    }

    pub fn trc_enabled(&self) -> bool {
        self.instr.tracing_bblock()
    }

    pub fn rtn_enabled(&self) -> bool {
        self.instr.tracing_routine()
    }

    /// Before an instruction executes (instruction and basic-block modes).
    pub fn ins_logic_cb(&'static self, ctx: Option<&HostContext>, ip: Addr, tev_type: TevType) {
        eprintln!("DBG ins_logic_cb ip={:#x} tev={:?} check={}", ip, tev_type, self.instr.check_address_typed(ip, tev_type, self.breakpoints.break_at_next_inst()));
        if self
            .instr
            .check_address_typed(ip, tev_type, self.breakpoints.break_at_next_inst())
        {
            self.add_to_trace(ctx, ip, tev_type);
        }
    }

    /// At the taken branch of a call or return.
    pub fn rtn_logic_cb(&'static self, ins_ip: Addr, target_ip: Addr, _is_indirect: bool, is_ret: bool) {
        let ban = self.breakpoints.break_at_next_inst();
        if self.instr.check_address(ins_ip, ban) {
            if is_ret {
                if self.instr.log_ret_insns() {
                    self.add_to_trace(None, ins_ip, TevType::Ret);
                }
            } else {
                self.add_to_trace(None, ins_ip, TevType::Call);
            }
        }
        if !is_ret && self.instr.check_address_typed(target_ip, TevType::Insn, ban) {
            // record call targets; the client builds its graph views from
            // them
            self.add_to_trace(None, target_ip, TevType::Insn);
        }
    }

    fn add_to_trace(&'static self, ctx: Option<&HostContext>, ea: Addr, tev_type: TevType) {
        debug_msg!(3, "add_to_trace: {:#x}", ea);
        if let Some(c) = ctx {
            // keep the thread's context fresh for register reads
            let tdata = self.thread_data(self.cur_thread_id());
            tdata.save_ctx(c);
        }
        self.store_trace_entry(ctx, ea, tev_type);
    }

    fn store_trace_entry(&'static self, ctx: Option<&HostContext>, ea: Addr, tev_type: TevType) {
        // wait until the tracebuf is drained if it filled up
        self.wait_app_resume(&self.instr.tracebuf_sem);

        if self.instr.tracebuf_is_full() {
            self.prepare_and_wait_trace_flush();
        }

        let mut trc = TraceEntry::new(self.host().os_thread_id(), ea, tev_type);
        if self.instr.tracing_registers() {
            if let Some(c) = ctx {
                trc.regs = registers::from_context(c);
            }
        }
        self.instr.push_trace(trc);
    }

    /// The buffer hit its limit: report TRACE_FULL ahead of everything
    /// else in the queue, halt the target and park until the client drains
    /// the trace and resumes.
    fn prepare_and_wait_trace_flush(&'static self) {
        {
            let mut st = self.process.lock();
            if *st == ProcessState::Running {
                debug_msg!(
                    2,
                    "trace buffer full, generate TRACE_FULL event (trace size={})",
                    self.instr.tracebuf_size()
                );
                let mut ev = DebugEvent::new(EventId::TraceFull);
                ev.pid = self.host().pid();
                ev.tid = self.thread_data(self.cur_thread_id()).ext_tid();
                self.events.push_front(ev);
                self.process.run_app.clear();
                *st = ProcessState::WaitFlush;
                self.instr.tracebuf_sem.clear();
            }
        }

        // pause until the trace is read; the client sends RESUME then
        self.wait_app_resume(&self.instr.tracebuf_sem);
        debug_msg!(2, "flush ended");
    }

    // ---- instrumentation management ----

    pub fn init_instrumentations(&self) {
        if !self.instr.tracing_instruction()
            && !self.instr.tracing_bblock()
            && !self.instr.tracing_routine()
        {
            msg!("NOTICE: No tracing method selected, nothing will be recorded until some tracing method is selected.");
        }

        let everything = self.instr.trace_everything();
        msg!(
            "Init tracing/{:#x}..{:#x}/ {}routine{}, {}bblk, {}instruction{}, {}regs, {}flow",
            if everything { 0 } else { self.instr.min_address() },
            if everything { BADADDR } else { self.instr.max_address() },
            if self.instr.tracing_routine() { '+' } else { '-' },
            if self.instr.tracing_routine() && self.instr.log_ret_insns() {
                "+retns"
            } else {
                ""
            },
            if self.instr.tracing_bblock() { '+' } else { '-' },
            if self.instr.tracing_instruction() { '+' } else { '-' },
            if self.instr.tracing_instruction() && self.instr.only_new_instructions() {
                "/new only"
            } else {
                ""
            },
            if self.instr.tracing_registers() { '+' } else { '-' },
            if self.breakpoints.control_enabled() { '+' } else { '-' },
        );

        // the control/breakpoint pair rides on the instruction layer, so
        // that one is always on
        self.add_instrumentation(INST_INSN, TraceLayer::Instruction);
        if self.instr.tracing_bblock() {
            self.add_instrumentation(INST_BBLOCK, TraceLayer::BasicBlock);
        }
        if self.instr.tracing_routine() {
            self.add_instrumentation(INST_ROUTINE, TraceLayer::Routine);
        }
    }

    fn add_instrumentation(&self, bit: u8, layer: TraceLayer) {
        if self.instr.note_instrumentation(bit) {
            msg!("Adding {:?} level instrumentation...", layer);
            self.host().add_instrumentation(layer);
        }
    }

    pub fn update_instrumentation(&self, trace_types: u32) {
        msg!("Set trace to {}", trace_types);
        let do_reinit = self.instr.apply_trace_types(trace_types);
        if do_reinit {
            self.reinit_instrumentations();
        } else {
            self.init_instrumentations();
        }
        msg!(
            "{}abling register values tracing...",
            if self.instr.tracing_registers() {
                "En"
            } else {
                "Dis"
            }
        );
    }

    /// Request a reinstrumentation cycle: flag the state and wake the
    /// worker. Flushing the cache from the listener thread would deadlock
    /// with an application thread parked inside a callback, hence the
    /// dedicated thread.
    pub fn reinit_instrumentations(&self) {
        msg!("Reinit instrumentations");

        if self.instr.state() != InstrState::Initial {
            self.instr.set_state(InstrState::NeedReinit);
            if self.instr.reinstr_started.load(Ordering::Relaxed) {
                self.instr.reinstr_sem.set();
            }
        } else {
            // first call: nothing precompiled yet
            self.instr.set_state(InstrState::Ok);
        }
        self.init_instrumentations();
    }

    fn remove_instrumentations(&self) {
        self.instr.set_state(InstrState::ReinitStarted);
        debug_msg!(3, "code cache flush requested");
        self.host().flush_code_cache();
        self.instr.set_state(InstrState::Ok);
        debug_msg!(2, "JIT cache cleaned");
    }

    /// Body of the reinstrumentation worker thread.
    pub fn reinstrumenter_main(&self) {
        msg!("Reinstrumenter started (thread = {})", self.cur_thread_id());

        self.instr.reinstr_started.store(true, Ordering::Relaxed);
        loop {
            let st = self.process.get();
            if st.exiting() || st.detached() {
                break;
            }
            if self.instr.reinstr_sem.timed_wait(Duration::from_millis(100)) {
                self.remove_instrumentations();
                self.instr.reinstr_sem.clear();
            }
        }
        msg!("Reinstrumenter exited");
        self.instr.reinstr_exited.set();
    }

    /// Spawn the worker; its cache flushes must not run on the listener.
    pub fn init_instrumenter(&'static self) -> bool {
        if !self
            .host()
            .spawn_internal_thread("reinstrumenter", Box::new(move || self.reinstrumenter_main()))
        {
            msg!("spawn_internal_thread(reinstrumenter) failed");
            return false;
        }
        true
    }

    /// Wake the worker one last time and wait for it, bounded.
    pub fn finish_instrumenter(&self) -> bool {
        if self.instr.reinstr_started.load(Ordering::Relaxed) {
            self.instr.reinstr_sem.set();
            return self.instr.reinstr_exited.timed_wait(Duration::from_secs(10));
        }
        true
    }
}
