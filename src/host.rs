//! Seam between the agent and the instrumentation engine it lives inside.
//!
//! The engine owns the scheduler: every entry into the agent is a callback
//! or an analysis routine invoked on one of the target's threads. The
//! `Host` trait is the opposite direction, the primitives the agent asks
//! of the engine. `SysHost` implements the service surface over the
//! current process so the agent links into a complete program; an engine
//! binding substitutes its own implementation at startup.

use crate::protocol::{Addr, BADADDR, SEGPERM_EXEC, SEGPERM_READ, SEGPERM_WRITE};
use libc::pid_t;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::thread;

/// Engine-local thread id, distinct from the OS thread id the client sees.
pub type ThreadId = u32;
pub const INVALID_THREAD_ID: ThreadId = !0u32;

/// Registers readable from a captured context.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum CtxReg {
    Gax,
    Gbx,
    Gcx,
    Gdx,
    Gsi,
    Gdi,
    Gbp,
    StackPtr,
    InstPtr,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Flags,
    SegCs,
    SegDs,
    SegEs,
    SegFs,
    SegGs,
    SegSs,
}

pub const NCTX_REGS: usize = 24;

/// A register capture the engine hands to callbacks and analysis routines.
/// Saving one is cheap; it has no ties to the engine after the copy.
#[derive(Clone)]
pub struct HostContext {
    regs: [u64; NCTX_REGS],
}

impl HostContext {
    pub fn new() -> HostContext {
        HostContext {
            regs: [BADADDR; NCTX_REGS],
        }
    }

    pub fn get(&self, r: CtxReg) -> u64 {
        self.regs[r as usize]
    }

    pub fn set(&mut self, r: CtxReg, v: u64) -> &mut HostContext {
        self.regs[r as usize] = v;
        self
    }

    pub fn ip(&self) -> Addr {
        self.get(CtxReg::InstPtr)
    }
}

impl Default for HostContext {
    fn default() -> HostContext {
        HostContext::new()
    }
}

pub fn get_ctx_ip(ctx: Option<&HostContext>) -> Addr {
    match ctx {
        Some(c) => c.ip(),
        None => BADADDR,
    }
}

/// Why the engine delivered a context-change callback.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ContextChangeReason {
    FatalSignal,
    Signal,
    Exception,
    SigReturn,
    Apc,
    Callback,
}

/// Instrumentation granularities the agent can ask the engine for.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum TraceLayer {
    /// Per-instruction callbacks; the control/breakpoint routines ride on
    /// this layer, so it is always registered.
    Instruction,
    /// Per-basic-block callbacks.
    BasicBlock,
    /// Call/return taken-branch callbacks.
    Routine,
}

/// What the engine tells the agent about an instruction it is about to
/// precompile.
#[derive(Copy, Clone, Debug)]
pub struct InsDesc {
    pub addr: Addr,
    pub is_bbl_head: bool,
    pub is_call: bool,
    pub is_direct_call: bool,
    pub is_ret: bool,
    pub is_branch_or_call: bool,
    pub is_syscall: bool,
    pub is_valid: bool,
}

impl InsDesc {
    pub fn plain(addr: Addr) -> InsDesc {
        InsDesc {
            addr,
            is_bbl_head: false,
            is_call: false,
            is_direct_call: false,
            is_ret: false,
            is_branch_or_call: false,
            is_syscall: false,
            is_valid: true,
        }
    }
}

/// Where an analysis routine is spliced relative to the instruction.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HookPoint {
    Before,
    TakenBranch,
}

/// Which analysis routine to splice. Every hook is an if/then pair: the
/// engine inlines the cheap enabling predicate and only calls into the
/// agent when it holds.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HookKind {
    /// `ctrl_rtn` guarded by the control-enabled flag.
    Ctrl,
    /// `bpt_rtn`, unconditional.
    Bpt,
    /// `ins_logic` with the given trace entry kind, guarded by the
    /// owning layer's enabling predicate.
    TraceIns(crate::instrumenter::TevType),
    /// `rtn_logic` at the taken-branch point.
    Rtn,
}

/// Splice order ranks; lower runs first.
pub const ORDER_FIRST: i32 = 0;
pub const ORDER_DEFAULT: i32 = 100;
pub const ORDER_LAST: i32 = 200;

#[derive(Copy, Clone, Debug)]
pub struct Splice {
    pub order: i32,
    pub point: HookPoint,
    pub kind: HookKind,
}

#[derive(Clone, Debug, Default)]
pub struct SectionInfo {
    pub name: String,
    pub start: Addr,
    pub size: u64,
    pub perm: u8,
}

#[derive(Clone, Debug, Default)]
pub struct ImageInfo {
    pub name: String,
    pub low: Addr,
    pub high: Addr,
    pub entry: Addr,
    pub is_main: bool,
    pub sections: Vec<SectionInfo>,
}

/// One OS-level memory mapping, as merged into MEMORY_INFO replies.
#[derive(Clone, Debug, Default)]
pub struct MemRegion {
    pub start: Addr,
    pub end: Addr,
    pub perm: u8,
    pub name: String,
}

pub trait Host: Send + Sync {
    /// Engine-local id of the calling thread.
    fn thread_id(&self) -> ThreadId;
    /// OS id of the calling thread (only valid for the caller).
    fn os_thread_id(&self) -> pid_t;
    fn pid(&self) -> u32;
    /// True when the engine attached to a running process instead of
    /// launching it.
    fn is_attaching(&self) -> bool;
    fn is_process_exiting(&self) -> bool;
    /// Copy target memory, stopping at the first unreadable byte. Returns
    /// the number of bytes actually copied.
    fn safe_copy(&self, ea: Addr, buf: &mut [u8]) -> usize;
    fn images(&self) -> Vec<ImageInfo>;
    /// OS-level mappings to merge behind the image sections.
    fn os_segments(&self) -> Vec<MemRegion>;
    /// Ask the engine to deliver precompilation callbacks at the given
    /// granularity from now on. Idempotent.
    fn add_instrumentation(&self, layer: TraceLayer);
    /// Invalidate all precompiled code so instrumentation decisions are
    /// taken again. Acquires the engine's instrumentation lock; must not
    /// be called from a thread that is blocked inside a callback.
    fn flush_code_cache(&self);
    /// Spawn an engine-internal thread (not visible to the client).
    fn spawn_internal_thread(&self, name: &'static str, f: Box<dyn FnOnce() + Send>) -> bool;
    /// Hand control to the target. Does not return until the target is
    /// done; all further agent activity happens in callbacks.
    fn run_program(&self);
    fn exit_process(&self, code: i32) -> !;
    fn detach(&self);
}

// ---------------------------------------------------------------------------

/// One parsed line of /proc/self/maps.
#[derive(Clone, Debug, Default)]
pub struct MapsEntry {
    pub start: Addr,
    pub end: Addr,
    pub perm: u8,
    pub fname: String,
}

/// Parse a `/proc/<pid>/maps` line. Returns None for malformed lines.
pub fn parse_maps_line(line: &str) -> Option<MapsEntry> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let _offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let mut fname = fields.collect::<Vec<_>>().join(" ");
    const DELETED_SUFFIX: &str = " (deleted)";
    if fname.ends_with(DELETED_SUFFIX) {
        let cut = fname.len() - DELETED_SUFFIX.len();
        fname.truncate(cut);
    }

    let dash = range.find('-')?;
    let start = Addr::from_str_radix(&range[..dash], 16).ok()?;
    let end = Addr::from_str_radix(&range[dash + 1..], 16).ok()?;

    let mut perm = 0u8;
    if perms.contains('r') {
        perm |= SEGPERM_READ;
    }
    if perms.contains('w') {
        perm |= SEGPERM_WRITE;
    }
    if perms.contains('x') {
        perm |= SEGPERM_EXEC;
    }

    Some(MapsEntry {
        start,
        end,
        perm,
        fname,
    })
}

/// Service-surface implementation over the current process. Stands in for
/// the engine binding: memory and mappings are real, instrumentation
/// requests are recorded but nothing is precompiled.
pub struct SysHost;

impl SysHost {
    pub fn new() -> SysHost {
        SysHost
    }

    fn read_maps(&self) -> Vec<MapsEntry> {
        let mut out = Vec::new();
        let data = match fs::read_to_string("/proc/self/maps") {
            Ok(d) => d,
            Err(_) => return out,
        };
        for line in data.lines() {
            if let Some(me) = parse_maps_line(line) {
                out.push(me);
            }
        }
        out
    }
}

impl Host for SysHost {
    fn thread_id(&self) -> ThreadId {
        nix::unistd::gettid().as_raw() as ThreadId
    }

    fn os_thread_id(&self) -> pid_t {
        nix::unistd::gettid().as_raw()
    }

    fn pid(&self) -> u32 {
        nix::unistd::getpid().as_raw() as u32
    }

    fn is_attaching(&self) -> bool {
        false
    }

    fn is_process_exiting(&self) -> bool {
        false
    }

    fn safe_copy(&self, ea: Addr, buf: &mut [u8]) -> usize {
        // Going through /proc/self/mem turns wild addresses into short
        // reads instead of faults.
        let mut f = match fs::File::open("/proc/self/mem") {
            Ok(f) => f,
            Err(_) => return 0,
        };
        if f.seek(SeekFrom::Start(ea)).is_err() {
            return 0;
        }
        match f.read(buf) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }

    fn images(&self) -> Vec<ImageInfo> {
        let exe = fs::read_link("/proc/self/exe")
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut img = ImageInfo {
            name: exe.clone(),
            low: BADADDR,
            high: 0,
            entry: BADADDR,
            is_main: true,
            sections: Vec::new(),
        };
        for me in self.read_maps() {
            if me.fname != exe {
                continue;
            }
            if img.low == BADADDR || me.start < img.low {
                img.low = me.start;
            }
            if me.end > img.high {
                img.high = me.end;
            }
            img.sections.push(SectionInfo {
                name: me.fname.clone(),
                start: me.start,
                size: me.end - me.start,
                perm: me.perm,
            });
        }
        if img.low != BADADDR {
            img.entry = img.low;
            vec![img]
        } else {
            Vec::new()
        }
    }

    fn os_segments(&self) -> Vec<MemRegion> {
        self.read_maps()
            .into_iter()
            .map(|me| MemRegion {
                start: me.start,
                end: me.end,
                perm: me.perm,
                name: me.fname,
            })
            .collect()
    }

    fn add_instrumentation(&self, _layer: TraceLayer) {}

    fn flush_code_cache(&self) {}

    fn spawn_internal_thread(&self, name: &'static str, f: Box<dyn FnOnce() + Send>) -> bool {
        thread::Builder::new().name(name.into()).spawn(f).is_ok()
    }

    fn run_program(&self) {
        // Without an engine there is no rewritten code to run; the binding
        // that provides one replaces this host before START_PROCESS.
        loop {
            thread::park();
        }
    }

    fn exit_process(&self, code: i32) -> ! {
        std::process::exit(code);
    }

    fn detach(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_line_with_path() {
        let me =
            parse_maps_line("559e9d0000-559e9d2000 r-xp 00000000 103:02 1579 /usr/bin/target")
                .unwrap();
        assert_eq!(me.start, 0x559e9d0000);
        assert_eq!(me.end, 0x559e9d2000);
        assert_eq!(me.perm, SEGPERM_READ | SEGPERM_EXEC);
        assert_eq!(me.fname, "/usr/bin/target");
    }

    #[test]
    fn maps_line_anonymous_and_deleted() {
        let anon = parse_maps_line("7f0000-7f1000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(anon.fname, "");
        assert_eq!(anon.perm, SEGPERM_READ | SEGPERM_WRITE);

        let deleted =
            parse_maps_line("7f0000-7f1000 rw-p 00000000 00:00 12 /tmp/x (deleted)").unwrap();
        assert_eq!(deleted.fname, "/tmp/x");
    }

    #[test]
    fn malformed_maps_lines_are_skipped() {
        assert!(parse_maps_line("").is_none());
        assert!(parse_maps_line("not-a-range rw-p 0 0 0").is_none());
    }

    #[test]
    fn sys_host_reads_own_memory() {
        let host = SysHost::new();
        let data = [0xa5u8; 16];
        let mut buf = [0u8; 16];
        let n = host.safe_copy(data.as_ptr() as Addr, &mut buf);
        assert_eq!(n, 16);
        assert_eq!(buf, data);
        // A wild address yields a short (empty) read, not a fault.
        assert_eq!(host.safe_copy(0x10, &mut buf), 0);
    }
}
