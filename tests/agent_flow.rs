//! End-to-end exercises of the agent against a scripted instrumentation
//! engine: breakpoints, stepping, pause, trace-buffer back-pressure and
//! per-thread suspension, with the requests and replies going over a real
//! socket pair.

use ditrace::agent::Agent;
use ditrace::event::EventId;
use ditrace::host::{
    Host, HostContext, HookKind, ImageInfo, InsDesc, MemRegion, SectionInfo, Splice, ThreadId,
    TraceLayer, ORDER_LAST,
};
use ditrace::net::{self, Greeting, IoOutcome};
use ditrace::process_state::ProcessState;
use ditrace::protocol::{
    bytes_of, bytes_of_mut, zeroed, Packet, PacketCode, PacketV1, Pod, TraceEventsPacket,
    TraceFlags, PROTOCOL_VERSION, TARGET_OS,
};
use libc::pid_t;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd;
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

thread_local! {
    static MOCK_TID: Cell<ThreadId> = Cell::new(0);
    static MOCK_OS_TID: Cell<pid_t> = Cell::new(1000);
}

fn enter_mock_thread(tid: ThreadId, os_tid: pid_t) {
    MOCK_TID.with(|c| c.set(tid));
    MOCK_OS_TID.with(|c| c.set(os_tid));
}

/// Scripted engine: keeps a per-address cache of spliced analysis
/// routines, built by the agent's precompilation hooks the first time an
/// address is executed, exactly like a JIT would.
struct MockHost {
    layers: Mutex<HashSet<TraceLayer>>,
    cache: Mutex<HashMap<u64, Vec<Splice>>>,
}

impl MockHost {
    fn new() -> MockHost {
        MockHost {
            layers: Mutex::new(HashSet::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl Host for MockHost {
    fn thread_id(&self) -> ThreadId {
        MOCK_TID.with(|c| c.get())
    }

    fn os_thread_id(&self) -> pid_t {
        MOCK_OS_TID.with(|c| c.get())
    }

    fn pid(&self) -> u32 {
        4242
    }

    fn is_attaching(&self) -> bool {
        false
    }

    fn is_process_exiting(&self) -> bool {
        false
    }

    fn safe_copy(&self, _ea: u64, buf: &mut [u8]) -> usize {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = i as u8;
        }
        buf.len()
    }

    fn images(&self) -> Vec<ImageInfo> {
        vec![ImageInfo {
            name: "target".into(),
            low: 0x400000,
            high: 0x402000,
            entry: 0x401000,
            is_main: true,
            sections: vec![SectionInfo {
                name: ".text".into(),
                start: 0x401000,
                size: 0x1000,
                perm: 5,
            }],
        }]
    }

    fn os_segments(&self) -> Vec<MemRegion> {
        Vec::new()
    }

    fn add_instrumentation(&self, layer: TraceLayer) {
        self.layers.lock().unwrap().insert(layer);
    }

    fn flush_code_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    fn spawn_internal_thread(&self, _name: &'static str, f: Box<dyn FnOnce() + Send>) -> bool {
        thread::spawn(f);
        true
    }

    fn run_program(&self) {}

    fn exit_process(&self, code: i32) -> ! {
        panic!("unexpected exit_process({})", code);
    }

    fn detach(&self) {}
}

/// Execute one instruction of the scripted target: consult (or build) the
/// splice cache, then run the analysis routines in order with their
/// enabling predicates.
fn exec_ins(agent: &'static Agent, host: &MockHost, ins: &InsDesc, ctx: &HostContext) {
    let splices = {
        let mut cache = host.cache.lock().unwrap();
        cache
            .entry(ins.addr)
            .or_insert_with(|| {
                let mut hooks = Vec::new();
                let layers = host.layers.lock().unwrap().clone();
                if layers.contains(&TraceLayer::Instruction) {
                    agent.precompile_ins(ins, &mut hooks);
                }
                if layers.contains(&TraceLayer::BasicBlock) {
                    agent.precompile_bbl(ins, &mut hooks);
                }
                if layers.contains(&TraceLayer::Routine) {
                    agent.precompile_rtn(ins, &mut hooks);
                }
                hooks.sort_by_key(|s| s.order);
                hooks
            })
            .clone()
    };
    eprintln!("DBG exec_ins addr={:#x} splices={:?}", ins.addr, splices.iter().map(|s| (s.order, format!("{:?}", s.kind))).collect::<Vec<_>>());
    for s in &splices {
        match s.kind {
            HookKind::Ctrl => {
                if agent.ctrl_rtn_enabled() {
                    agent.ctrl_rtn(ins.addr, ctx);
                }
            }
            HookKind::Bpt => agent.bpt_rtn(ins.addr, ctx),
            HookKind::TraceIns(tev) => {
                let enabled = if s.order == ORDER_LAST {
                    agent.ins_enabled()
                } else {
                    agent.trc_enabled()
                };
                if enabled {
                    agent.ins_logic_cb(Some(ctx), ins.addr, tev);
                }
            }
            HookKind::Rtn => {
                if agent.rtn_enabled() {
                    agent.rtn_logic_cb(ins.addr, ins.addr + 5, false, ins.is_ret);
                }
            }
        }
    }
}

fn ctx_at(ea: u64) -> HostContext {
    let mut ctx = HostContext::new();
    ctx.set(ditrace::host::CtxReg::InstPtr, ea);
    ctx
}

fn leaked_agent() -> (&'static Agent, Arc<MockHost>) {
    let host = Arc::new(MockHost::new());
    let agent: &'static Agent = Box::leak(Box::new(Agent::new(host.clone())));
    (agent, host)
}

/// Put the agent in the state it has right after START_PROCESS was
/// resumed: target running, gate open, listener live.
fn start_running(agent: &'static Agent) {
    {
        let mut st = agent.process.lock();
        *st = ProcessState::Running;
    }
    agent.process.run_app.set();
    agent
        .breakpoints
        .prepare_resume(agent.threads.have_suspended_threads());
    agent.init_instrumentations();
    agent.set_listener_ready(true);
}

fn client_pair(agent: &Agent) -> RawFd {
    let (client, server) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .unwrap();
    agent.chan.set_cli(server);
    client
}

fn read_frame<T: Pod>(fd: RawFd) -> T {
    let mut v: T = zeroed();
    match net::recv_exact(fd, bytes_of_mut(&mut v)) {
        IoOutcome::Done => v,
        _ => panic!("short read from agent"),
    }
}

fn request(code: PacketCode, size: u32, data: u64) -> Packet {
    let mut p: Packet = zeroed();
    p.code = code as u16;
    p.size = size;
    p.data = data;
    p
}

fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Pop one debug event through the wire path and return its frame.
fn read_event(agent: &'static Agent, client: RawFd) -> ditrace::event::EventFrame {
    assert!(agent.handle_packet(&request(PacketCode::ReadEvent, 0, 0)));
    read_frame::<ditrace::event::EventFrame>(client)
}

// ---------------------------------------------------------------------------

#[test]
fn handshake_rejects_v1_then_accepts_modern_client() {
    // version-1 client
    let (client, server) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .unwrap();
    let mut hello: PacketV1 = zeroed();
    hello.code = PacketCode::Hello as u16;
    hello.size = 1;
    assert!(matches!(
        net::send_exact(client, bytes_of(&hello)),
        IoOutcome::Done
    ));
    assert!(matches!(net::greet_client(server), Greeting::V1Rejected));
    let ack: PacketV1 = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);
    assert_eq!({ ack.size }, PROTOCOL_VERSION);
    assert_eq!({ ack.data }, mem::size_of::<usize>());
    let _ = unistd::close(client);
    let _ = unistd::close(server);

    // the same client reconnects speaking the modern protocol
    let (client, server) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .unwrap();
    let mut hello: Packet = zeroed();
    hello.code = PacketCode::Hello as u16;
    hello.size = PROTOCOL_VERSION;
    assert!(matches!(
        net::send_exact(client, bytes_of(&hello)),
        IoOutcome::Done
    ));
    assert!(matches!(net::greet_client(server), Greeting::Accepted));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);
    assert_eq!({ ack.size }, PROTOCOL_VERSION);
    assert_eq!({ ack.data }, mem::size_of::<usize>() as u64 | TARGET_OS);
    let _ = unistd::close(client);
    let _ = unistd::close(server);

    // a non-HELLO opener is refused outright
    let (client, server) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .unwrap();
    let bogus = request(PacketCode::Pause, 0, 0);
    assert!(matches!(
        net::send_exact(client, bytes_of(&bogus)),
        IoOutcome::Done
    ));
    assert!(matches!(net::greet_client(server), Greeting::Failed));
    let _ = unistd::close(client);
    let _ = unistd::close(server);
}

#[test]
fn start_process_request_arms_and_starts_the_target() {
    let (agent, host) = leaked_agent();
    let client = client_pair(agent);

    // the real entry point: the engine's run_program returns once the
    // (scripted) target finishes, so the handler comes back here
    assert!(agent.handle_packet(&request(PacketCode::StartProcess, 0, 0)));

    // the gate is open, the layer carrying the control pair is
    // registered, and no attach stop is pending for a launched target
    assert!(agent.process.run_app.is_set());
    assert!(!agent.breakpoints.break_at_next_inst());
    assert!(host
        .layers
        .lock()
        .unwrap()
        .contains(&TraceLayer::Instruction));

    // both internal threads come up
    wait_until("listener to come up", || agent.listener_is_ready());
    wait_until("reinstrumenter to come up", || {
        agent.instr.reinstr_started.load(Ordering::SeqCst)
    });

    // the listener owns the socket now: a request over the wire is
    // answered without any help from the test side
    let pkt = request(PacketCode::CountTrace, 0, 0);
    assert!(matches!(
        net::send_exact(client, bytes_of(&pkt)),
        IoOutcome::Done
    ));
    let ans: Packet = read_frame(client);
    assert_eq!({ ans.code }, PacketCode::Ack as u16);
    assert_eq!({ ans.data }, 0);

    // DETACH over the wire winds both internal threads down
    let pkt = request(PacketCode::Detach, 0, 0);
    assert!(matches!(
        net::send_exact(client, bytes_of(&pkt)),
        IoOutcome::Done
    ));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);
    assert!(agent.listener_exited.timed_wait(Duration::from_secs(10)));
    assert!(agent
        .instr
        .reinstr_exited
        .timed_wait(Duration::from_secs(10)));
    assert_eq!(agent.process.get(), ProcessState::Detached);
}

#[test]
fn breakpoint_hit_then_single_step() {
    let (agent, host) = leaked_agent();
    let client = client_pair(agent);

    // plant the breakpoint before the target runs
    assert!(agent.handle_packet(&request(PacketCode::AddBpt, 0, 0x401000)));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);

    start_running(agent);

    let host2 = host.clone();
    let done = Arc::new(AtomicBool::new(false));
    let done2 = done.clone();
    let app = thread::spawn(move || {
        enter_mock_thread(1, 100);
        for &ea in &[0x401000u64, 0x401003] {
            exec_ins(agent, &host2, &InsDesc::plain(ea), &ctx_at(ea));
        }
        done2.store(true, Ordering::SeqCst);
    });

    // breakpoint event arrives and the target is held
    wait_until("breakpoint event", || !agent.events.empty());
    assert!(agent.handle_packet(&request(PacketCode::DebugEvent, 0, 0)));
    let ans: Packet = read_frame(client);
    assert_eq!({ ans.code }, PacketCode::DebugEvent as u16);
    assert_eq!({ ans.size }, 1);

    let ev = read_event(agent, client);
    assert_eq!({ ev.eid }, EventId::Breakpoint as u32);
    assert_eq!({ ev.ea }, 0x401000);
    assert_eq!({ ev.tid }, 100);
    assert_eq!(agent.process.get(), ProcessState::Suspended);
    assert!(!done.load(Ordering::SeqCst));

    // registers of the stopped thread are readable
    assert!(agent.handle_packet(&request(PacketCode::CanReadRegs, 0, 100)));
    let ans: Packet = read_frame(client);
    assert_eq!({ ans.code }, PacketCode::Ack as u16);
    assert!(agent.handle_packet(&request(PacketCode::ReadRegs, 0, 100)));
    let regs: ditrace::protocol::RegisterSet = read_frame(client);
    assert_eq!({ regs.eip }, 0x401000);

    // ask for a single step of the stopped thread, then resume
    assert!(agent.handle_packet(&request(PacketCode::Step, 0, 100)));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);

    assert!(agent.handle_packet(&request(
        PacketCode::Resume,
        0,
        EventId::Breakpoint as u32 as u64
    )));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);

    // one instruction later the STEP event lands
    wait_until("step event", || !agent.events.empty());
    let ev = read_event(agent, client);
    assert_eq!({ ev.eid }, EventId::Step as u32);
    assert_eq!({ ev.ea }, 0x401003);
    assert_eq!({ ev.tid }, 100);

    assert!(agent.handle_packet(&request(
        PacketCode::Resume,
        0,
        EventId::Step as u32 as u64
    )));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);

    app.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(agent.process.get(), ProcessState::Running);
}

#[test]
fn trace_overflow_halts_target_until_drained() {
    ditrace::log::set_level(4);
    let (agent, host) = leaked_agent();
    let client = client_pair(agent);
    start_running(agent);

    // SET_OPTIONS: the limits frame follows the request
    let mut limits: ditrace::protocol::LimitsPacket = zeroed();
    ditrace::protocol::put_cstr(&mut limits.image_name, "*");
    limits.trace_limit = 3;
    limits.only_new = 0;
    assert!(matches!(
        net::send_exact(client, bytes_of(&limits)),
        IoOutcome::Done
    ));
    assert!(agent.handle_packet(&request(PacketCode::SetOptions, 0, 0)));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);

    assert!(agent.handle_packet(&request(
        PacketCode::SetTrace,
        0,
        TraceFlags::TRACE_INSN.bits() as u64
    )));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);

    // a long straight-line run overflows the 3-entry buffer
    let host2 = host.clone();
    let app = thread::spawn(move || {
        enter_mock_thread(1, 100);
        for n in 0..6u64 {
            let ea = 0x401000 + n;
            exec_ins(agent, &host2, &InsDesc::plain(ea), &ctx_at(ea));
        }
    });

    wait_until("trace-full event", || !agent.events.empty());
    assert_eq!(agent.process.get(), ProcessState::WaitFlush);

    // TRACE_FULL is at the front of the queue
    let ev = read_event(agent, client);
    assert_eq!({ ev.eid }, EventId::TraceFull as u32);

    assert!(agent.handle_packet(&request(PacketCode::CountTrace, 0, 0)));
    let ans: Packet = read_frame(client);
    assert_eq!({ ans.code }, PacketCode::Ack as u16);
    assert_eq!({ ans.data }, 3);

    // drain the trace; the reply frame is large, so read concurrently
    let reader = thread::spawn(move || read_frame::<TraceEventsPacket>(client));
    assert!(agent.handle_packet(&request(PacketCode::ReadTrace, 0, 0)));
    let trc = reader.join().unwrap();
    assert_eq!({ trc.size }, 3);
    assert_eq!({ trc.trace[0].ea }, 0x401000);
    assert_eq!({ trc.trace[1].ea }, 0x401001);
    assert_eq!({ trc.trace[2].ea }, 0x401002);
    assert_eq!({ trc.trace[0].tid }, 100);

    // RESUME releases the halted target
    assert!(agent.handle_packet(&request(
        PacketCode::Resume,
        0,
        EventId::TraceFull as u32 as u64
    )));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);

    app.join().unwrap();
    assert_eq!(agent.process.get(), ProcessState::Running);
    // the remaining instructions were recorded after the flush
    assert_eq!(agent.instr.tracebuf_size(), 3);
}

#[test]
fn per_thread_suspend_blocks_one_thread_only() {
    let (agent, host) = leaked_agent();
    let client = client_pair(agent);
    start_running(agent);

    let t1_done = Arc::new(AtomicBool::new(false));
    let t2_done = Arc::new(AtomicBool::new(false));
    let halt = Arc::new(AtomicBool::new(false));

    let (host1, halt1, t1_done2) = (host.clone(), halt.clone(), t1_done.clone());
    let t1 = thread::spawn(move || {
        enter_mock_thread(1, 101);
        agent.thread_data(1);
        while !halt1.load(Ordering::SeqCst) {
            exec_ins(agent, &host1, &InsDesc::plain(0x401100), &ctx_at(0x401100));
            thread::sleep(Duration::from_millis(1));
        }
        t1_done2.store(true, Ordering::SeqCst);
    });

    let (host2, t2_done2) = (host.clone(), t2_done.clone());
    let t2 = thread::spawn(move || {
        enter_mock_thread(2, 202);
        agent.thread_data(2);
        for _ in 0..50 {
            exec_ins(agent, &host2, &InsDesc::plain(0x401200), &ctx_at(0x401200));
        }
        t2_done2.store(true, Ordering::SeqCst);
    });

    wait_until("both threads known", || agent.threads.nthreads() == 2);

    // PAUSE stops the whole process at the next instrumented instruction
    assert!(agent.handle_packet(&request(PacketCode::Pause, 0, 0)));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);

    wait_until("suspend event", || !agent.events.empty());
    let ev = read_event(agent, client);
    assert_eq!({ ev.eid }, EventId::ProcessSuspend as u32);
    assert_ne!({ ev.tid }, 0);

    // suspend T1 individually, then resume the process: T2 keeps running
    assert!(agent.handle_packet(&request(PacketCode::ThreadSuspend, 0, 101)));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);

    assert!(agent.handle_packet(&request(
        PacketCode::Resume,
        0,
        EventId::ProcessSuspend as u32 as u64
    )));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);

    // T2 finishes its run while T1 stays parked on its own gate
    wait_until("T2 to finish", || t2_done.load(Ordering::SeqCst));
    t2.join().unwrap();
    assert!(!t1_done.load(Ordering::SeqCst));
    assert!(agent.threads.have_suspended_threads());

    // with every remaining thread individually suspended, a whole-process
    // resume is refused
    assert!(agent.handle_packet(&request(PacketCode::ThreadSuspend, 0, 202)));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);
    assert!(agent.threads.all_threads_suspended());
    assert!(agent.handle_packet(&request(
        PacketCode::Resume,
        0,
        EventId::NoEvent as u32 as u64
    )));
    let err: Packet = read_frame(client);
    assert_eq!({ err.code }, PacketCode::Error as u16);

    // release both; T1 runs to completion
    assert!(agent.handle_packet(&request(PacketCode::ThreadResume, 0, 202)));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);
    assert!(agent.handle_packet(&request(PacketCode::ThreadResume, 0, 101)));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);

    halt.store(true, Ordering::SeqCst);
    t1.join().unwrap();
    assert!(t1_done.load(Ordering::SeqCst));
}

#[test]
fn initial_attach_stop_reports_process_attach() {
    let (agent, host) = leaked_agent();
    let client = client_pair(agent);
    start_running(agent);

    agent.breakpoints.set_break_at_next_inst(true);
    agent
        .breakpoints
        .prepare_resume(agent.threads.have_suspended_threads());

    let host2 = host.clone();
    let app = thread::spawn(move || {
        enter_mock_thread(1, 100);
        exec_ins(agent, &host2, &InsDesc::plain(0x401000), &ctx_at(0x401000));
    });

    wait_until("attach event", || !agent.events.empty());
    let ev = read_event(agent, client);
    assert_eq!({ ev.eid }, EventId::ProcessAttach as u32);
    assert_eq!({ ev.ea }, 0x401000);
    assert!(!agent.breakpoints.break_at_next_inst());

    assert!(agent.handle_packet(&request(
        PacketCode::Resume,
        0,
        EventId::ProcessAttach as u32 as u64
    )));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);
    app.join().unwrap();
}

#[test]
fn gate_semaphore_tracks_suspension_states() {
    let (agent, _host) = leaked_agent();
    let client = client_pair(agent);
    start_running(agent);
    assert!(agent.process.run_app.is_set());

    // a suspend closes the gate
    {
        let mut st = agent.process.lock();
        agent.do_suspend_nolock(&mut st, ProcessState::Suspended);
    }
    assert!(!agent.process.run_app.is_set());
    assert_eq!(agent.process.get(), ProcessState::Suspended);

    // queue is empty, so RESUME reopens it immediately
    assert!(agent.handle_packet(&request(PacketCode::Resume, 0, 0)));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);
    assert!(agent.process.run_app.is_set());
    assert_eq!(agent.process.get(), ProcessState::Running);
}

#[test]
fn pause_with_no_stopped_thread_delivers_sentinel_tid() {
    let (agent, _host) = leaked_agent();
    let client = client_pair(agent);
    start_running(agent);

    // force the broadcast shape: a SUSPEND event with no thread attached
    let mut ev = ditrace::event::DebugEvent::new(EventId::ProcessSuspend);
    ev.pid = 4242;
    agent.events.push_back(ev);

    let frame = read_event(agent, client);
    assert_eq!({ frame.eid }, EventId::ProcessSuspend as u32);
    // nobody is stopped, so the sentinel id goes out as-is
    assert_eq!({ frame.tid }, 0);
}

#[test]
fn detach_is_terminal() {
    let (agent, _host) = leaked_agent();
    let client = client_pair(agent);
    start_running(agent);

    assert!(agent.handle_packet(&request(PacketCode::Detach, 0, 0)));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);
    assert_eq!(agent.process.get(), ProcessState::Detached);
    // the gate opens so nothing stays parked behind a dead session
    assert!(agent.process.run_app.is_set());

    // a later pause is refused and the state does not move
    assert!(agent.handle_packet(&request(PacketCode::Pause, 0, 0)));
    let err: Packet = read_frame(client);
    assert_eq!({ err.code }, PacketCode::Error as u16);
    assert_eq!(agent.process.get(), ProcessState::Detached);

    // detach again: no state change, still acknowledged
    assert!(agent.handle_packet(&request(PacketCode::Detach, 0, 0)));
    let ack: Packet = read_frame(client);
    assert_eq!({ ack.code }, PacketCode::Ack as u16);
    assert_eq!(agent.process.get(), ProcessState::Detached);
}

#[test]
fn memory_info_and_read_memory_round_trip() {
    let (agent, _host) = leaked_agent();
    let client = client_pair(agent);
    start_running(agent);

    let reader = thread::spawn(move || {
        let hdr: ditrace::protocol::MemImagesPacket = read_frame(client);
        assert_eq!({ hdr.code }, PacketCode::MemoryInfo as u16);
        let mut regions = Vec::new();
        let count = { hdr.size };
        for _ in 0..count {
            let mi: ditrace::protocol::MemoryInfoFrame = read_frame(client);
            regions.push(({ mi.start_ea }, { mi.end_ea }));
        }
        regions
    });
    assert!(agent.handle_packet(&request(PacketCode::MemoryInfo, 0, 0)));
    let regions = reader.join().unwrap();
    assert_eq!(regions, vec![(0x401000, 0x402000)]);

    assert!(agent.handle_packet(&request(PacketCode::ReadMemory, 16, 0x401000)));
    let mem_reply: ditrace::protocol::MemResponsePacket = read_frame(client);
    assert_eq!({ mem_reply.code }, PacketCode::ReadMemory as u16);
    assert_eq!({ mem_reply.size }, 16);
    assert_eq!(&mem_reply.buf[..4], &[0, 1, 2, 3]);
}
