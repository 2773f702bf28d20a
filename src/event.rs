//! Debug events as the agent stores them, and their fixed wire encoding.

use crate::protocol::{bytes_of, put_cstr, zeroed, Addr, Pod, BADADDR, MAXSTR};
use libc::pid_t;
use static_assertions::const_assert_eq;
use std::mem;

/// External thread id unknown/not applicable.
pub const NO_THREAD: pid_t = 0;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum EventId {
    NoEvent = 0x0000_0000,
    ProcessStart = 0x0000_0001,
    ProcessExit = 0x0000_0002,
    ThreadStart = 0x0000_0004,
    ThreadExit = 0x0000_0008,
    Breakpoint = 0x0000_0010,
    Step = 0x0000_0020,
    Exception = 0x0000_0040,
    LibraryLoad = 0x0000_0080,
    LibraryUnload = 0x0000_0100,
    Information = 0x0000_0200,
    ProcessAttach = 0x0000_1000,
    ProcessDetach = 0x0000_2000,
    ProcessSuspend = 0x0000_4000,
    TraceFull = 0x0000_8000,
}

impl EventId {
    pub fn from_u32(v: u32) -> Option<EventId> {
        use EventId::*;
        Some(match v {
            0x0000 => NoEvent,
            0x0001 => ProcessStart,
            0x0002 => ProcessExit,
            0x0004 => ThreadStart,
            0x0008 => ThreadExit,
            0x0010 => Breakpoint,
            0x0020 => Step,
            0x0040 => Exception,
            0x0080 => LibraryLoad,
            0x0100 => LibraryUnload,
            0x0200 => Information,
            0x1000 => ProcessAttach,
            0x2000 => ProcessDetach,
            0x4000 => ProcessSuspend,
            0x8000 => TraceFull,
            _ => return None,
        })
    }
}

/// Module descriptor carried by PROCESS_START, PROCESS_ATTACH and
/// LIBRARY_LOAD.
#[derive(Clone, Debug, Default)]
pub struct ModuleInfo {
    pub name: String,
    pub base: Addr,
    pub size: u32,
    /// If not BADADDR the client rebases the program to this address.
    pub rebase_to: Addr,
}

#[derive(Copy, Clone, Debug)]
pub struct BptAddrs {
    /// Possible address referenced by hardware breakpoints.
    pub hea: Addr,
    /// Triggered address from the kernel's point of view; BADADDR for a
    /// flat memory model.
    pub kea: Addr,
}

#[derive(Clone, Debug)]
pub struct ExceptionInfo {
    pub code: u32,
    pub can_cont: bool,
    pub ea: Addr,
    pub info: String,
}

#[derive(Clone, Debug)]
pub enum EventPayload {
    None,
    Module(ModuleInfo),
    ExitCode(i32),
    Text(String),
    Bpt(BptAddrs),
    Exception(ExceptionInfo),
}

#[derive(Clone, Debug)]
pub struct DebugEvent {
    pub eid: EventId,
    pub pid: u32,
    pub tid: pid_t,
    pub ea: Addr,
    /// Is the event handled by the debugger? Meaningful for EXCEPTION.
    pub handled: bool,
    pub payload: EventPayload,
}

impl Default for DebugEvent {
    fn default() -> DebugEvent {
        DebugEvent::new(EventId::NoEvent)
    }
}

impl DebugEvent {
    pub fn new(eid: EventId) -> DebugEvent {
        DebugEvent {
            eid,
            pid: 0,
            tid: NO_THREAD,
            ea: BADADDR,
            handled: false,
            payload: EventPayload::None,
        }
    }
}

// Wire forms of the payload union members.

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct ModuleInfoFrame {
    name: [u8; MAXSTR],
    base: u64,
    size: u32,
    rebase_to: u64,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct BptFrame {
    hea: u64,
    kea: u64,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct ExceptionFrame {
    code: u32,
    can_cont: u8,
    ea: u64,
    info: [u8; MAXSTR],
}

unsafe impl Pod for ModuleInfoFrame {}
unsafe impl Pod for BptFrame {}
unsafe impl Pod for ExceptionFrame {}

/// The union is as wide as its widest member, the module descriptor.
pub const EVENT_INFO_SIZE: usize = mem::size_of::<ModuleInfoFrame>();

const_assert_eq!(EVENT_INFO_SIZE, 1044);

/// Fixed-size event record sent in reply to READ_EVENT.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct EventFrame {
    pub eid: u32,
    pub pid: u32,
    pub tid: i32,
    pub ea: u64,
    pub handled: u8,
    pub info: [u8; EVENT_INFO_SIZE],
}

unsafe impl Pod for EventFrame {}

const_assert_eq!(mem::size_of::<EventFrame>(), 1065);

impl DebugEvent {
    pub fn encode(&self) -> EventFrame {
        let mut f: EventFrame = zeroed();
        f.eid = self.eid as u32;
        f.pid = self.pid;
        f.tid = self.tid;
        f.ea = self.ea;
        f.handled = self.handled as u8;
        match &self.payload {
            EventPayload::None => {}
            EventPayload::Module(m) => {
                let mut w: ModuleInfoFrame = zeroed();
                put_cstr(&mut w.name, &m.name);
                w.base = m.base;
                w.size = m.size;
                w.rebase_to = m.rebase_to;
                let b = bytes_of(&w);
                f.info[..b.len()].copy_from_slice(b);
            }
            EventPayload::ExitCode(code) => {
                f.info[..4].copy_from_slice(&code.to_le_bytes());
            }
            EventPayload::Text(s) => {
                let mut name = [0u8; MAXSTR];
                put_cstr(&mut name, s);
                f.info[..MAXSTR].copy_from_slice(&name);
            }
            EventPayload::Bpt(b) => {
                let w = BptFrame {
                    hea: b.hea,
                    kea: b.kea,
                };
                let b = bytes_of(&w);
                f.info[..b.len()].copy_from_slice(b);
            }
            EventPayload::Exception(e) => {
                let mut w: ExceptionFrame = zeroed();
                w.code = e.code;
                w.can_cont = e.can_cont as u8;
                w.ea = e.ea;
                put_cstr(&mut w.info, &e.info);
                let b = bytes_of(&w);
                f.info[..b.len()].copy_from_slice(b);
            }
        }
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_event_is_empty() {
        let ev = DebugEvent::default();
        assert_eq!(ev.eid, EventId::NoEvent);
        assert_eq!(ev.ea, BADADDR);
        assert_eq!(ev.tid, NO_THREAD);
        assert!(!ev.handled);
    }

    #[test]
    fn breakpoint_encoding_places_both_addresses() {
        let mut ev = DebugEvent::new(EventId::Breakpoint);
        ev.tid = 42;
        ev.ea = 0x401000;
        ev.payload = EventPayload::Bpt(BptAddrs {
            hea: BADADDR,
            kea: BADADDR,
        });
        let f = ev.encode();
        assert_eq!({ f.eid }, EventId::Breakpoint as u32);
        assert_eq!({ f.tid }, 42);
        assert_eq!({ f.ea }, 0x401000);
        assert_eq!(&f.info[..8], &BADADDR.to_le_bytes());
        assert_eq!(&f.info[8..16], &BADADDR.to_le_bytes());
    }

    #[test]
    fn exception_encoding_keeps_code_flag_and_text() {
        let mut ev = DebugEvent::new(EventId::Exception);
        ev.payload = EventPayload::Exception(ExceptionInfo {
            code: 11,
            can_cont: true,
            ea: 0xdead,
            info: "Signal 11 at 0xdead".into(),
        });
        let f = ev.encode();
        assert_eq!(&f.info[..4], &11u32.to_le_bytes());
        assert_eq!(f.info[4], 1);
        assert_eq!(&f.info[5..13], &0xdeadu64.to_le_bytes());
        assert_eq!(&f.info[13..32], b"Signal 11 at 0xdead");
    }

    #[test]
    fn module_encoding_fills_the_union_exactly() {
        let mut ev = DebugEvent::new(EventId::ProcessStart);
        ev.payload = EventPayload::Module(ModuleInfo {
            name: "target".into(),
            base: 0x400000,
            size: 0x2000,
            rebase_to: BADADDR,
        });
        let f = ev.encode();
        assert_eq!(&f.info[..6], b"target");
        assert_eq!(&f.info[MAXSTR..MAXSTR + 8], &0x400000u64.to_le_bytes());
        assert_eq!(
            &f.info[MAXSTR + 8..MAXSTR + 12],
            &0x2000u32.to_le_bytes()
        );
    }

    #[test]
    fn event_id_round_trips() {
        for &id in &[
            EventId::NoEvent,
            EventId::ProcessStart,
            EventId::TraceFull,
            EventId::ProcessSuspend,
        ] {
            assert_eq!(EventId::from_u32(id as u32), Some(id));
        }
        assert_eq!(EventId::from_u32(0x3), None);
    }
}
