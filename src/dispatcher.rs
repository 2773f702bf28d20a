//! Request dispatcher: one straight-line switch over the packet codes.
//!
//! Requests arrive either on the listener thread or, before it is live,
//! on whichever application thread is serving synchronously. Replies go
//! back over the same socket; transport failure is fatal.

use crate::agent::Agent;
use crate::event::{DebugEvent, EventId, NO_THREAD};
use crate::host::MemRegion;
use crate::process_state::ProcessState;
use crate::protocol::{
    get_cstr, packet_name, zeroed, LimitsPacket, MemImagesPacket, MemResponsePacket,
    MemoryInfoFrame, Packet, PacketCode, RegisterSet, TraceEventsPacket, BITNESS,
    MEM_CHUNK_SIZE, PACKET_CODE_END,
};
use libc::pid_t;
use std::mem;

impl Agent {
    /// Read one request frame and dispatch it. Returns false only on a
    /// hard receive error; a closed connection or a handling failure
    /// terminates the target.
    pub fn read_handle_packet(&'static self, out: Option<&mut Packet>) -> bool {
        let mut pkt: Packet = zeroed();
        debug_msg!(
            4,
            "Receiving packet, expected {} bytes...",
            mem::size_of::<Packet>()
        );
        let bytes = self.recv_frame(&mut pkt, "read_handle_packet");
        if bytes == -1 {
            msg!("recv failed");
            return false;
        }
        if bytes == 0 {
            msg!("Connection closed by peer, exiting...");
            self.exit_process(0);
        }

        if !self.handle_packet(&pkt) {
            msg!("Error handling {} packet, exiting...", self.last_packet());
            self.exit_process(-1);
        }
        if let Some(out) = out {
            *out = pkt;
        }
        true
    }

    /// Serve up to `total` packets (-1 for unlimited), stopping early at
    /// the RESUME that acknowledges `until_ev`.
    pub fn handle_packets(&'static self, total: i32, until_ev: EventId) -> bool {
        let mut packets = 0;
        loop {
            if total != -1 {
                packets += 1;
                if packets > total {
                    break;
                }
            }
            let mut pkt: Packet = zeroed();
            if !self.read_handle_packet(Some(&mut pkt)) {
                return false;
            }
            if { pkt.code } == PacketCode::Resume as u16 {
                let acked = EventId::from_u32(pkt.data as u32);
                if until_ev != EventId::NoEvent && acked == Some(until_ev) {
                    msg!("Expected resume packet, received (ev={:x})", { pkt.data });
                    return true;
                }
            }
        }
        debug_msg!(
            2,
            "Maximum number of packets reached, exiting from handle_packets..."
        );
        true
    }

    pub fn handle_packet(&'static self, req: &Packet) -> bool {
        let mut ret = false;
        let mut ans: Packet = zeroed();
        ans.size = 0;
        ans.code = PacketCode::Error as u16;

        let code = { req.code };
        if code >= PACKET_CODE_END {
            msg!("Unknown packet type {}", code);
            return false;
        }
        let name = packet_name(code);
        if self.last_packet() != "READ EVENT" || name != self.last_packet() {
            debug_msg!(
                2,
                "(thread {}) Handle packet({})",
                self.cur_thread_id(),
                name
            );
        }
        self.set_last_packet(name);

        match PacketCode::from_u16(code) {
            Some(PacketCode::StartProcess) => {
                // does not return while the target lives
                self.handle_start_process();
                ret = true;
            }
            Some(PacketCode::ExitProcess) => {
                msg!("Received EXIT PROCESS, exiting from process...");
                // does not return
                self.exit_process(0);
            }
            Some(PacketCode::DebugEvent) => {
                ans.data = 0;
                let started = self.process.get().started();
                if !self.events.empty() && started {
                    debug_msg!(2, "Total of {} events recorded", self.events.size());
                    ans.size = self.events.size() as u32;
                    ans.code = PacketCode::DebugEvent as u16;
                } else {
                    ans.size = 0;
                    ans.code = PacketCode::Ack as u16;
                }
                ret = self.send_frame(&ans, "handle_packet");
            }
            Some(PacketCode::ReadEvent) => {
                let ev = self
                    .pop_debug_event()
                    .unwrap_or_else(|| DebugEvent::new(EventId::NoEvent));
                debug_msg!(4, "Send event: {:x}", ev.eid as u32);
                let frame = ev.encode();
                ret = self.send_frame(&frame, "handle_packet");
            }
            Some(PacketCode::MemoryInfo) => {
                ret = self.handle_memory_info();
            }
            Some(PacketCode::ReadMemory) => {
                ret = self.handle_read_memory(req.data, { req.size });
            }
            Some(PacketCode::Detach) => {
                msg!("Detach request processed");
                ans.data = 0;
                ans.code = PacketCode::Ack as u16;
                ret = self.send_frame(&ans, "handle_packet");
                // past this point no request is served again
                self.detach_process();
            }
            Some(PacketCode::Pause) => {
                // the execution threads suspend later, inside the control
                // routine; here we acknowledge and arm the state machine
                debug_msg!(2, "Pause request received...");
                if self.process.get().terminal() {
                    msg!("Pause refused: target is gone");
                    ans.code = PacketCode::Error as u16;
                    ret = self.send_frame(&ans, "handle_packet");
                } else {
                    ans.code = PacketCode::Ack as u16;
                    ret = self.send_frame(&ans, "handle_packet");
                    self.prepare_pause();
                    msg!("Pause request processed");
                }
            }
            Some(PacketCode::Resume) => {
                debug_msg!(2, "Resuming after event {:x}", { req.data });
                ret = self.do_resume(&mut ans, req);
            }
            Some(PacketCode::CountTrace) => {
                ans.code = PacketCode::Ack as u16;
                ans.data = self.instr.tracebuf_size() as u64;
                ret = self.send_frame(&ans, "handle_packet");
            }
            Some(PacketCode::ReadTrace) => {
                ret = self.handle_read_trace();
            }
            Some(PacketCode::ClearTrace) => {
                self.instr.clear_trace();
                ret = true;
            }
            Some(PacketCode::AddBpt) => {
                msg!("Adding software breakpoint at {:#x}", { req.data });
                self.breakpoints.add_soft_bpt(req.data);
                ans.code = PacketCode::Ack as u16;
                ret = self.send_frame(&ans, "handle_packet");
            }
            Some(PacketCode::DelBpt) => {
                msg!("Remove software breakpoint at {:#x}", { req.data });
                self.breakpoints.del_soft_bpt(req.data);
                ans.code = PacketCode::Ack as u16;
                ret = self.send_frame(&ans, "handle_packet");
            }
            Some(PacketCode::CanReadRegs) => {
                let ctx_ok = self
                    .local_tid_of_request(req.data)
                    .and_then(|tid| self.threads.get(tid))
                    .map(|td| td.ctx_ok())
                    .unwrap_or(false);
                ans.code = if ctx_ok {
                    PacketCode::Ack as u16
                } else {
                    PacketCode::Error as u16
                };
                ret = self.send_frame(&ans, "handle_packet");
            }
            Some(PacketCode::ReadRegs) => {
                ret = self.handle_read_regs(req.data);
            }
            Some(PacketCode::SetTrace) => {
                let trace_types = req.data as u32;
                self.update_instrumentation(trace_types);
                ans.code = PacketCode::Ack as u16;
                ret = self.send_frame(&ans, "handle_packet");
            }
            Some(PacketCode::SetOptions) => {
                ans.code = PacketCode::Ack as u16;
                if self.send_frame(&ans, "handle_packet") {
                    ret = self.handle_limits();
                }
            }
            Some(PacketCode::Step) => {
                ans.code = PacketCode::Ack as u16;
                if self.send_frame(&ans, "handle_packet") {
                    if let Some(tid) = self.local_tid_of_request(req.data) {
                        self.breakpoints.set_step(tid);
                        ret = true;
                    } else {
                        msg!("STEP error: unknown thread {}", req.data as pid_t);
                    }
                }
            }
            Some(PacketCode::ThreadSuspend) => {
                ans.code = PacketCode::Ack as u16;
                if self.send_frame(&ans, "handle_packet") {
                    if let Some(td) = self
                        .local_tid_of_request(req.data)
                        .and_then(|tid| self.threads.get(tid))
                    {
                        self.threads.suspend(&td);
                        ret = true;
                    } else {
                        msg!("THREAD SUSPEND error: unknown thread {}", req.data as pid_t);
                    }
                }
            }
            Some(PacketCode::ThreadResume) => {
                ans.code = PacketCode::Ack as u16;
                if self.send_frame(&ans, "handle_packet") {
                    if let Some(td) = self
                        .local_tid_of_request(req.data)
                        .and_then(|tid| self.threads.get(tid))
                    {
                        self.threads.resume(&td);
                        ret = true;
                    } else {
                        msg!("THREAD RESUME error: unknown thread {}", req.data as pid_t);
                    }
                }
            }
            _ => {
                msg!("UNKNOWN PACKET RECEIVED WITH CODE {}", code);
            }
        }
        debug_msg!(4, "LAST PACKET WAS {}", self.last_packet());
        ret
    }

    fn local_tid_of_request(&self, data: u64) -> Option<crate::host::ThreadId> {
        self.threads.local_tid_of(data as pid_t)
    }

    /// START_PROCESS: arm the state machine, spawn the internal threads
    /// and hand control to the target.
    pub fn handle_start_process(&'static self) {
        if self.host().is_attaching() {
            self.breakpoints.set_break_at_next_inst(true);
        }

        self.breakpoints
            .prepare_resume(self.threads.have_suspended_threads());
        self.init_instrumentations();

        // from here application threads may run
        self.process.run_app.set();

        if !self
            .host()
            .spawn_internal_thread("listener", Box::new(move || self.listener_main()))
        {
            msg!("spawn_internal_thread(listener) failed");
            self.exit_process(-1);
        }

        if !self.init_instrumenter() {
            self.exit_process(-1);
        }

        // never returns while the target lives
        self.host().run_program();
    }

    /// PAUSE: if events are already queued the suspend event piggybacks on
    /// the last of them; otherwise the control routine reports the next
    /// instruction of whichever thread gets there first.
    fn prepare_pause(&self) {
        if let Some(lastev) = self.events.back() {
            debug_msg!(2, "prepare_pause: already have events - just generate SUSPEND event");
            self.enqueue_suspend_from(&lastev);
        } else {
            debug_msg!(2, "Use semaphores inside the control routine to suspend process");
            let mut st = self.process.lock();
            if *st == ProcessState::Running {
                if self.threads.have_suspended_threads() {
                    // at least one suspended thread exists: queue SUSPEND
                    // with an undefined tid; the pop path fills it in from
                    // an arbitrary stopped thread
                    debug_msg!(
                        2,
                        "prepare_pause: already have suspended threads - generate SUSPEND event"
                    );
                    let mut ev = DebugEvent::new(EventId::ProcessSuspend);
                    ev.pid = self.host().pid();
                    ev.tid = NO_THREAD;
                    self.events.push_back(ev);
                    self.do_suspend_nolock(&mut st, ProcessState::Suspended);
                } else {
                    // tell the breakpoint manager to suspend application
                    // threads as soon as it can
                    self.breakpoints.prepare_suspend(st.terminal());
                    *st = ProcessState::PauseRequested;
                }
            }
        }
    }

    fn enqueue_suspend_from(&self, lastev: &DebugEvent) {
        let mut ev = DebugEvent::new(EventId::ProcessSuspend);
        ev.pid = self.host().pid();
        ev.ea = lastev.ea;
        ev.tid = lastev.tid;
        self.events.push_back(ev);
    }

    /// Buffered resume. The client acknowledges every event with a RESUME;
    /// the target actually runs again only when the queue is empty, which
    /// keeps it halted across a burst of events without racy re-suspends.
    fn do_resume(&'static self, ans: &mut Packet, request: &Packet) -> bool {
        if self.threads.all_threads_suspended() {
            msg!("Can't resume: all threads are suspended");
            ans.code = PacketCode::Error as u16;
            return self.send_frame(ans, "do_resume");
        }

        let eid = EventId::from_u32(request.data as u32);
        let last_ev = self.events.last_ev();
        if eid != Some(last_ev.eid) {
            msg!(
                "Unexpected resume: eid={:x} ({:x} expected)",
                { request.data },
                last_ev.eid as u32
            );
        }
        if eid == Some(EventId::Exception) {
            // request.size tells whether the exception is masked or goes
            // to the target's own handler
            match self
                .threads
                .local_tid_of(last_ev.tid)
                .and_then(|tid| self.threads.get(tid))
            {
                Some(td) => td.set_excp_handled(request.size != 0),
                None => msg!("RESUME error: can't find thread data for {}", last_ev.tid),
            }
        }
        {
            let mut st = self.process.lock();
            if self.events.empty() {
                debug_msg!(2, "Event queue is empty, do actual resume");
                if st.suspended() {
                    *st = ProcessState::Running;
                    if self
                        .breakpoints
                        .prepare_resume(self.threads.have_suspended_threads())
                    {
                        self.reinit_instrumentations();
                    }
                    self.process.run_app.set();
                }
            } else {
                debug_msg!(
                    2,
                    "{} event(s) left in the queue, do not resume",
                    self.events.size()
                );
            }
            if eid == Some(EventId::ProcessExit) {
                *st = ProcessState::Exiting;
            }
            if eid == Some(EventId::ThreadExit) {
                // the thread's context had to survive until the client
                // read THREAD_EXIT; it can go now
                if let Some(tid) = self.threads.local_tid_of(last_ev.tid) {
                    self.threads.release(tid);
                }
            }
        }
        self.instr.resume();
        ans.code = PacketCode::Ack as u16;
        self.send_frame(ans, "do_resume")
    }

    // ---- payload-carrying replies ----

    fn handle_memory_info(&self) -> bool {
        let mut miv: Vec<MemRegion> = Vec::new();

        for img in self.host().images() {
            for sec in &img.sections {
                if sec.start == 0 {
                    continue;
                }
                let end = sec.start + sec.size;
                let name = if sec.name.is_empty() {
                    img.name.clone()
                } else {
                    format!("{}:{}", img.name, sec.name)
                };
                add_segment(
                    &mut miv,
                    MemRegion {
                        start: sec.start,
                        end,
                        perm: sec.perm,
                        name,
                    },
                );
            }
        }

        for reg in self.host().os_segments() {
            add_segment(&mut miv, reg);
        }

        let mut pkt: MemImagesPacket = zeroed();
        pkt.code = PacketCode::MemoryInfo as u16;
        pkt.size = miv.len() as u32;
        if !self.send_frame(&pkt, "handle_memory_info(1)") {
            return false;
        }
        for reg in &miv {
            let mut mi: MemoryInfoFrame = zeroed();
            mi.start_ea = reg.start;
            mi.end_ea = reg.end;
            crate::protocol::put_cstr(&mut mi.name, &reg.name);
            mi.name_size = reg.name.len().min(crate::protocol::MAXSTR) as u32;
            mi.bitness = BITNESS;
            mi.perm = reg.perm;
            if !self.send_frame(&mi, "handle_memory_info(2)") {
                return false;
            }
        }
        true
    }

    fn handle_read_memory(&self, ea: u64, size: u32) -> bool {
        debug_msg!(2, "Reading {} bytes at address {:#x}", size, ea);

        let mut pkt: MemResponsePacket = zeroed();
        let copy_size = (size as usize).min(MEM_CHUNK_SIZE);
        let read_bytes = self.host().safe_copy(ea, &mut pkt.buf[..copy_size]);
        pkt.size = read_bytes as u32;
        pkt.code = PacketCode::ReadMemory as u16;
        self.send_frame(&pkt, "handle_read_memory")
    }

    fn handle_read_trace(&self) -> bool {
        let mut pkt: Box<TraceEventsPacket> = Box::new(zeroed());
        self.instr.get_trace_events(&mut pkt);
        pkt.code = PacketCode::Ack as u16;
        self.send_frame(&*pkt, "handle_read_trace")
    }

    fn handle_read_regs(&self, data: u64) -> bool {
        let regs = self
            .local_tid_of_request(data)
            .and_then(|tid| self.threads.get(tid))
            .and_then(|td| td.export_ctx());
        let regs = match regs {
            Some(r) => r,
            None => {
                msg!("READ REGS: no context for thread {}", data as pid_t);
                RegisterSet::undefined_at(crate::protocol::BADADDR)
            }
        };
        debug_msg!(2, "read regs: ip = {:#x}", { regs.eip });
        self.send_frame(&regs, "handle_read_regs")
    }

    /// SET_OPTIONS second half: the limits frame follows our ACK. An
    /// unsupported configuration is answered with ERROR and is fatal.
    fn handle_limits(&'static self) -> bool {
        let mut limits: LimitsPacket = zeroed();
        let bytes = self.recv_frame(&mut limits, "handle_limits");
        if bytes != mem::size_of::<LimitsPacket>() as isize {
            return false;
        }
        let imgname = get_cstr(&limits.image_name);
        let ok = self
            .instr
            .set_limits(limits.only_new != 0, { limits.trace_limit }, &imgname);

        let mut res: Packet = zeroed();
        res.code = if ok {
            PacketCode::Ack as u16
        } else {
            PacketCode::Error as u16
        };
        let sent = self.send_frame(&res, "handle_limits");
        if !ok || !sent {
            msg!("Unsupported configuration or network error while setting limits, exiting");
            self.exit_process(-1);
        }
        true
    }
}

/// Keep the reply list sorted by start address, drop duplicate starts.
fn add_segment(miv: &mut Vec<MemRegion>, mi: MemRegion) {
    for p in (0..miv.len()).rev() {
        if miv[p].start == mi.start {
            return;
        }
        if miv[p].end <= mi.start {
            miv.insert(p + 1, mi);
            return;
        }
    }
    miv.insert(0, mi);
}
