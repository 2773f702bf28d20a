//! Trace configuration and the bounded trace buffer.
//!
//! Three instrumentation layers (per-instruction, per-basic-block,
//! per-routine) can be switched on and off; changing the set requires a
//! reinstrumentation cycle driven by a dedicated worker thread (see the
//! agent). The layer switches and the filter window are read by the
//! enabling predicates before every candidate instruction, so they are
//! plain atomics; everything that changes together with the buffer lives
//! behind the buffer lock.

use crate::protocol::{
    Addr, RegisterSet, TraceEntryFrame, TraceEventsPacket, TraceFlags, BADADDR, TRACE_EVENTS_SIZE,
};
use crate::semaphore::Semaphore;
use libc::pid_t;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

/// Trace entry kinds, as they go out on the wire.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum TevType {
    None = 0,
    Insn = 1,
    Call = 2,
    Ret = 3,
}

#[derive(Clone)]
pub struct TraceEntry {
    pub tid: pid_t,
    pub ea: Addr,
    pub kind: TevType,
    pub regs: RegisterSet,
}

impl TraceEntry {
    /// Registers default to undefined with only the ip known.
    pub fn new(tid: pid_t, ea: Addr, kind: TevType) -> TraceEntry {
        TraceEntry {
            tid,
            ea,
            kind,
            regs: RegisterSet::undefined_at(ea),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InstrState {
    Initial,
    NeedReinit,
    ReinitStarted,
    Ok,
}

/// Layer registration bits, mirroring the SET_TRACE mask values.
pub const INST_INSN: u8 = 0x02;
pub const INST_BBLOCK: u8 = 0x04;
pub const INST_ROUTINE: u8 = 0x08;

/// Remember only the last million traced addresses for the only-new filter.
pub const SKIP_LIMIT: usize = 1_000_000;

pub const DEFAULT_ENQUEUE_LIMIT: u32 = 1_000_000;

struct TraceBuf {
    trace: VecDeque<TraceEntry>,
    /// Addresses already traced, newest first; consulted (linearly) by the
    /// only-new filter.
    all_addrs: VecDeque<Addr>,
}

pub struct Instrumenter {
    // trace mode switches
    tracing_instruction: AtomicBool,
    tracing_bblock: AtomicBool,
    tracing_routine: AtomicBool,
    tracing_registers: AtomicBool,
    log_ret_insns: AtomicBool,
    only_new_instructions: AtomicBool,
    trace_everything: AtomicBool,

    // filter window; BADADDR until the first image is processed
    min_address: AtomicU64,
    max_address: AtomicU64,

    enqueue_limit: AtomicU32,
    image_name: Mutex<String>,

    instrumentations: AtomicU8,
    state: Mutex<InstrState>,

    buf: Mutex<TraceBuf>,
    /// Cleared while the buffer waits to be drained; back-pressures every
    /// append.
    pub tracebuf_sem: Semaphore,

    /// Wakes the reinstrumentation worker.
    pub reinstr_sem: Semaphore,
    pub reinstr_started: AtomicBool,
    pub reinstr_exited: Semaphore,
}

impl Instrumenter {
    pub fn new() -> Instrumenter {
        Instrumenter {
            tracing_instruction: AtomicBool::new(true),
            tracing_bblock: AtomicBool::new(false),
            tracing_routine: AtomicBool::new(false),
            tracing_registers: AtomicBool::new(false),
            log_ret_insns: AtomicBool::new(true),
            only_new_instructions: AtomicBool::new(false),
            trace_everything: AtomicBool::new(false),
            min_address: AtomicU64::new(BADADDR),
            max_address: AtomicU64::new(BADADDR),
            enqueue_limit: AtomicU32::new(DEFAULT_ENQUEUE_LIMIT),
            image_name: Mutex::new(String::new()),
            instrumentations: AtomicU8::new(0),
            state: Mutex::new(InstrState::Initial),
            buf: Mutex::new(TraceBuf {
                trace: VecDeque::new(),
                all_addrs: VecDeque::new(),
            }),
            tracebuf_sem: Semaphore::new(true),
            reinstr_sem: Semaphore::new(false),
            reinstr_started: AtomicBool::new(false),
            reinstr_exited: Semaphore::new(false),
        }
    }

    // ---- layer switches (read by the enabling predicates) ----

    pub fn tracing_instruction(&self) -> bool {
        self.tracing_instruction.load(Ordering::Relaxed)
    }

    pub fn tracing_bblock(&self) -> bool {
        self.tracing_bblock.load(Ordering::Relaxed)
    }

    pub fn tracing_routine(&self) -> bool {
        self.tracing_routine.load(Ordering::Relaxed)
    }

    pub fn tracing_registers(&self) -> bool {
        self.tracing_registers.load(Ordering::Relaxed)
    }

    pub fn log_ret_insns(&self) -> bool {
        self.log_ret_insns.load(Ordering::Relaxed)
    }

    pub fn only_new_instructions(&self) -> bool {
        self.only_new_instructions.load(Ordering::Relaxed)
    }

    pub fn trace_everything(&self) -> bool {
        self.trace_everything.load(Ordering::Relaxed)
    }

    pub fn curr_trace_types(&self) -> u32 {
        let mut types = 0;
        if self.tracing_instruction() {
            types |= TraceFlags::TRACE_INSN.bits();
        }
        if self.tracing_bblock() {
            types |= TraceFlags::TRACE_BBLOCK.bits();
        }
        if self.tracing_routine() {
            types |= TraceFlags::TRACE_ROUTINE.bits();
        }
        types
    }

    /// Apply a SET_TRACE mask. Returns true when the layer set changed and
    /// a reinstrumentation cycle is required.
    pub fn apply_trace_types(&self, trace_types: u32) -> bool {
        let flags = TraceFlags::from_bits_truncate(trace_types);
        let do_reinit =
            (trace_types & !TraceFlags::REGISTERS.bits()) != self.curr_trace_types();

        self.tracing_instruction
            .store(flags.contains(TraceFlags::TRACE_INSN), Ordering::Relaxed);
        self.tracing_bblock
            .store(flags.contains(TraceFlags::TRACE_BBLOCK), Ordering::Relaxed);
        self.tracing_routine
            .store(flags.contains(TraceFlags::TRACE_ROUTINE), Ordering::Relaxed);
        self.tracing_registers
            .store(flags.contains(TraceFlags::REGISTERS), Ordering::Relaxed);
        self.log_ret_insns
            .store(flags.contains(TraceFlags::LOG_RET), Ordering::Relaxed);
        self.only_new_instructions
            .store(flags.contains(TraceFlags::ONLY_NEW_INSNS), Ordering::Relaxed);
        self.trace_everything
            .store(flags.contains(TraceFlags::TRACE_EVERYTHING), Ordering::Relaxed);
        crate::log::set_client_logging(flags.contains(TraceFlags::LOGGING));

        do_reinit
    }

    // ---- filter window ----

    pub fn min_address(&self) -> Addr {
        self.min_address.load(Ordering::Relaxed)
    }

    pub fn max_address(&self) -> Addr {
        self.max_address.load(Ordering::Relaxed)
    }

    pub fn set_window(&self, min: Addr, max: Addr) {
        self.min_address.store(min, Ordering::Relaxed);
        self.max_address.store(max, Ordering::Relaxed);
    }

    pub fn image_name(&self) -> String {
        self.image_name.lock().unwrap().clone()
    }

    /// Record the client's limits. `*` as the image name lifts the window.
    pub fn set_limits(&self, only_new: bool, enq_size: u32, imgname: &str) -> bool {
        self.only_new_instructions
            .store(only_new, Ordering::Relaxed);
        self.enqueue_limit.store(enq_size, Ordering::Relaxed);
        msg!(
            "Setting maximum enqueue limit to {}, tracing image '{}', new instructions only {}",
            enq_size,
            imgname,
            only_new
        );
        let mut name = self.image_name.lock().unwrap();
        if name.is_empty() || *name != imgname {
            *name = imgname.to_owned();
            let everything = *name == "*";
            self.trace_everything.store(everything, Ordering::Relaxed);
            if everything {
                msg!("Image name set to '*', tracing everything!");
            }
        }
        msg!("Correct configuration received");
        true
    }

    pub fn enqueue_limit(&self) -> u32 {
        self.enqueue_limit.load(Ordering::Relaxed)
    }

    /// Adopt an image as the filter window: the main image by default, or
    /// whichever image the client named.
    pub fn process_image_window(&self, img_name: &str, low: Addr, high: Addr, as_default: bool) {
        if self.min_address() == low && self.max_address() == high {
            return;
        }
        let base_head = basename(img_name).to_lowercase();
        let configured = self.image_name();
        let base_image = basename(&configured).to_lowercase();
        if (as_default && configured.is_empty()) || base_head == base_image {
            msg!("Image boundaries: Min EA {:#x} Max EA {:#x}", low, high);
            self.set_window(low, high);
        }
    }

    // ---- address filters ----

    pub fn in_window(&self, addr: Addr) -> bool {
        self.trace_everything()
            || (addr >= self.min_address() && addr <= self.max_address())
    }

    /// Should this address be traced at all (type-independent part)?
    /// `break_at_next` forces everything through so the initial stop is
    /// not filtered away.
    pub fn check_address(&self, addr: Addr, break_at_next: bool) -> bool {
        eprintln!("DBG check_address addr={:#x} trace_everything={} min={:#x} max={:#x}", addr, self.trace_everything(), self.min_address(), self.max_address());
        if break_at_next {
            return true;
        }
        self.in_window(addr)
    }

    pub fn check_address_typed(&self, addr: Addr, tev: TevType, break_at_next: bool) -> bool {
        if !self.check_address(addr, break_at_next) {
            return false;
        }
        tev != TevType::Insn || !self.only_new_instructions() || !self.insn_is_registered(addr)
    }

    // ---- layer registration bookkeeping ----

    pub fn instrumentations(&self) -> u8 {
        self.instrumentations.load(Ordering::Relaxed)
    }

    /// Mark a layer as registered with the engine. Returns false if it
    /// already was.
    pub fn note_instrumentation(&self, bit: u8) -> bool {
        let prev = self.instrumentations.fetch_or(bit, Ordering::Relaxed);
        prev & bit == 0
    }

    // ---- reinstrumentation state ----

    pub fn state(&self) -> InstrState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, s: InstrState) {
        *self.state.lock().unwrap() = s;
    }

    pub fn state_ok(&self) -> bool {
        self.state() == InstrState::Ok
    }

    // ---- trace buffer ----

    pub fn tracebuf_size(&self) -> usize {
        self.buf.lock().unwrap().trace.len()
    }

    pub fn tracebuf_is_full(&self) -> bool {
        self.tracebuf_size() >= self.enqueue_limit() as usize
    }

    /// Append one entry, registering its address for the only-new filter.
    pub fn push_trace(&self, entry: TraceEntry) {
        let mut b = self.buf.lock().unwrap();
        if self.only_new_instructions() {
            b.all_addrs.push_front(entry.ea);
            if b.all_addrs.len() >= SKIP_LIMIT {
                b.all_addrs.truncate(SKIP_LIMIT);
            }
        }
        b.trace.push_back(entry);
    }

    /// Linear scan of the remembered addresses; acknowledged best-effort.
    pub fn insn_is_registered(&self, addr: Addr) -> bool {
        let b = self.buf.lock().unwrap();
        b.all_addrs.iter().any(|&a| a == addr)
    }

    /// Move up to TRACE_EVENTS_SIZE entries into the reply frame, oldest
    /// first. Returns the count.
    pub fn get_trace_events(&self, out: &mut TraceEventsPacket) -> u32 {
        out.size = 0;
        let mut b = self.buf.lock().unwrap();
        while (out.size as usize) < TRACE_EVENTS_SIZE {
            let trc = match b.trace.pop_front() {
                Some(t) => t,
                None => break,
            };
            out.trace[out.size as usize] = TraceEntryFrame {
                ea: trc.ea,
                tid: trc.tid,
                ttype: trc.kind as u32,
                registers: trc.regs,
            };
            out.size += 1;
        }
        out.size
    }

    pub fn clear_trace(&self) {
        let mut b = self.buf.lock().unwrap();
        b.trace.clear();
    }

    /// RESUME releases threads parked on the buffer gate.
    pub fn resume(&self) {
        self.tracebuf_sem.set();
    }
}

impl Default for Instrumenter {
    fn default() -> Instrumenter {
        Instrumenter::new()
    }
}

pub fn basename(path: &str) -> &str {
    match path.rfind(|c| c == '/' || c == '\\') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_strips_both_separators() {
        assert_eq!(basename("/usr/bin/target"), "target");
        assert_eq!(basename("C:\\bin\\target.exe"), "target.exe");
        assert_eq!(basename("target"), "target");
    }

    #[test]
    fn trace_buffer_is_fifo_and_drains_in_chunks() {
        let i = Instrumenter::new();
        for n in 0..5u64 {
            i.push_trace(TraceEntry::new(1, 0x1000 + n, TevType::Insn));
        }
        assert_eq!(i.tracebuf_size(), 5);
        let mut pkt: Box<TraceEventsPacket> = Box::new(crate::protocol::zeroed());
        let n = i.get_trace_events(&mut pkt);
        assert_eq!(n, 5);
        assert_eq!({ pkt.trace[0].ea }, 0x1000);
        assert_eq!({ pkt.trace[4].ea }, 0x1004);
        assert_eq!(i.tracebuf_size(), 0);
    }

    #[test]
    fn enqueue_limit_marks_the_buffer_full() {
        let i = Instrumenter::new();
        i.set_limits(false, 3, "*");
        assert!(i.trace_everything());
        for n in 0..3u64 {
            assert!(!i.tracebuf_is_full());
            i.push_trace(TraceEntry::new(1, n, TevType::Insn));
        }
        assert!(i.tracebuf_is_full());
        i.clear_trace();
        assert!(!i.tracebuf_is_full());
    }

    #[test]
    fn only_new_filter_rejects_repeats() {
        let i = Instrumenter::new();
        i.set_limits(true, 100, "*");
        assert!(i.check_address_typed(0x5000, TevType::Insn, false));
        i.push_trace(TraceEntry::new(1, 0x5000, TevType::Insn));
        assert!(i.insn_is_registered(0x5000));
        assert!(!i.check_address_typed(0x5000, TevType::Insn, false));
        // non-instruction kinds are not filtered
        assert!(i.check_address_typed(0x5000, TevType::Call, false));
    }

    #[test]
    fn window_filter_and_break_at_next_override() {
        let i = Instrumenter::new();
        i.set_window(0x1000, 0x2000);
        assert!(i.check_address(0x1800, false));
        assert!(!i.check_address(0x3000, false));
        assert!(i.check_address(0x3000, true));
    }

    #[test]
    fn window_follows_the_configured_image() {
        let i = Instrumenter::new();
        // default: first (main) image wins while no name is configured
        i.process_image_window("/bin/app", 0x400000, 0x500000, true);
        assert_eq!(i.min_address(), 0x400000);
        // a non-matching library does not disturb the window
        i.process_image_window("/lib/libc.so", 0x7000000, 0x8000000, false);
        assert_eq!(i.min_address(), 0x400000);
        // but the configured image does
        i.set_limits(false, 1000, "libfoo.so");
        i.process_image_window("/lib/LIBFOO.SO", 0x9000000, 0x9100000, false);
        assert_eq!(i.min_address(), 0x9000000);
        assert_eq!(i.max_address(), 0x9100000);
    }

    #[test]
    fn apply_trace_types_reports_layer_changes() {
        let i = Instrumenter::new();
        // default layer set is insn-only
        assert!(!i.apply_trace_types(TraceFlags::TRACE_INSN.bits()));
        assert!(i.apply_trace_types(
            (TraceFlags::TRACE_INSN | TraceFlags::TRACE_BBLOCK).bits()
        ));
        assert!(i.tracing_bblock());
        // toggling registers alone does not force a reinit
        assert!(!i.apply_trace_types(
            (TraceFlags::TRACE_INSN | TraceFlags::TRACE_BBLOCK | TraceFlags::REGISTERS).bits()
        ));
        assert!(i.tracing_registers());
    }

    #[test]
    fn instrumentation_bits_register_once() {
        let i = Instrumenter::new();
        assert!(i.note_instrumentation(INST_INSN));
        assert!(!i.note_instrumentation(INST_INSN));
        assert!(i.note_instrumentation(INST_BBLOCK));
        assert_eq!(i.instrumentations(), INST_INSN | INST_BBLOCK);
    }
}
