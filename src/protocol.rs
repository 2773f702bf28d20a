//! Fixed-layout request/response frames. Everything on the wire is
//! little-endian, packed to one byte, and sized exactly as the client
//! expects; the `const_assert_eq` pins below are the contract.

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use std::mem;
use std::slice;

pub type Addr = u64;
pub const BADADDR: Addr = !0u64;

/// Wire protocol version spoken by this agent.
pub const PROTOCOL_VERSION: u32 = 2;

pub const MAXSTR: usize = 1024;
pub const MEM_CHUNK_SIZE: usize = 1024;
pub const TRACE_EVENTS_SIZE: usize = 1000;

/// Target OS tag merged into the HELLO reply's `data` field.
#[cfg(target_os = "linux")]
pub const TARGET_OS: u64 = 0x2000;
#[cfg(target_os = "macos")]
pub const TARGET_OS: u64 = 0x4000;
#[cfg(target_os = "windows")]
pub const TARGET_OS: u64 = 0x1000;

/// Request/response codes. ACK and ERROR double as reply codes for the
/// control answers; the rest identify requests.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u16)]
pub enum PacketCode {
    Ack = 0,
    Error = 1,
    Hello = 2,
    ExitProcess = 3,
    StartProcess = 4,
    DebugEvent = 5,
    ReadEvent = 6,
    MemoryInfo = 7,
    ReadMemory = 8,
    Detach = 9,
    CountTrace = 10,
    ReadTrace = 11,
    ClearTrace = 12,
    Pause = 13,
    Resume = 14,
    ResumeStart = 15, // not used since v.2
    AddBpt = 16,
    DelBpt = 17,
    ResumeBpt = 18, // not used since v.2
    CanReadRegs = 19,
    ReadRegs = 20,
    SetTrace = 21,
    SetOptions = 22,
    Step = 23,
    ThreadSuspend = 24,
    ThreadResume = 25,
}

pub const PACKET_CODE_END: u16 = 26;

impl PacketCode {
    pub fn from_u16(v: u16) -> Option<PacketCode> {
        use PacketCode::*;
        Some(match v {
            0 => Ack,
            1 => Error,
            2 => Hello,
            3 => ExitProcess,
            4 => StartProcess,
            5 => DebugEvent,
            6 => ReadEvent,
            7 => MemoryInfo,
            8 => ReadMemory,
            9 => Detach,
            10 => CountTrace,
            11 => ReadTrace,
            12 => ClearTrace,
            13 => Pause,
            14 => Resume,
            15 => ResumeStart,
            16 => AddBpt,
            17 => DelBpt,
            18 => ResumeBpt,
            19 => CanReadRegs,
            20 => ReadRegs,
            21 => SetTrace,
            22 => SetOptions,
            23 => Step,
            24 => ThreadSuspend,
            25 => ThreadResume,
            _ => return None,
        })
    }
}

// for debug purposes
pub const PACKET_NAMES: [&str; 26] = [
    "ACK",
    "ERROR",
    "HELLO",
    "EXIT PROCESS",
    "START PROCESS",
    "DEBUG EVENT",
    "READ EVENT",
    "MEMORY INFO",
    "READ MEMORY",
    "DETACH",
    "COUNT TRACE",
    "READ TRACE",
    "CLEAR TRACE",
    "PAUSE",
    "RESUME",
    "RESUME START",
    "ADD BPT",
    "DEL BPT",
    "RESUME BPT",
    "CAN READ REGS",
    "READ REGS",
    "SET TRACE",
    "SET OPTIONS",
    "STEP INTO",
    "THREAD SUSPEND",
    "THREAD RESUME",
];

pub fn packet_name(code: u16) -> &'static str {
    PACKET_NAMES
        .get(code as usize)
        .copied()
        .unwrap_or("UNKNOWN")
}

bitflags! {
    /// SET_TRACE flag mask.
    pub struct TraceFlags: u32 {
        const STEP            = 0x0001;
        const TRACE_INSN      = 0x0002;
        const TRACE_BBLOCK    = 0x0004;
        const TRACE_ROUTINE   = 0x0008;
        const REGISTERS       = 0x0010;
        const LOG_RET         = 0x0020;
        const TRACE_EVERYTHING = 0x0040;
        const ONLY_NEW_INSNS  = 0x0080;
        const LOGGING         = 0x0100;
    }
}

/// Marker for plain-old-data frame types that may be reinterpreted as raw
/// bytes for the socket. Only packed structs with no padding and no
/// invariants implement this.
pub unsafe trait Pod: Copy + 'static {}

pub fn bytes_of<T: Pod>(v: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(v as *const T as *const u8, mem::size_of::<T>()) }
}

pub fn bytes_of_mut<T: Pod>(v: &mut T) -> &mut [u8] {
    unsafe { slice::from_raw_parts_mut(v as *mut T as *mut u8, mem::size_of::<T>()) }
}

pub fn zeroed<T: Pod>() -> T {
    unsafe { mem::zeroed() }
}

/// Copy a string into a fixed NUL-padded wire field, truncating if needed.
pub fn put_cstr(dst: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len().saturating_sub(1));
    dst[..n].copy_from_slice(&bytes[..n]);
    for b in dst[n..].iter_mut() {
        *b = 0;
    }
}

/// The inverse of `put_cstr`: everything up to the first NUL, lossily.
pub fn get_cstr(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

/// Modern request/response frame.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct Packet {
    pub code: u16,
    pub size: u32,
    pub data: u64,
}

/// Legacy frame: the prefix shared with protocol version 1, whose `data`
/// field is address-width rather than a fixed 64 bits.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct PacketV1 {
    pub code: u16,
    pub size: u32,
    pub data: usize,
}

/// Reply header for MEMORY_INFO: a count, followed by that many
/// `MemoryInfoFrame`s.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct MemImagesPacket {
    pub code: u16,
    pub size: u32,
}

/// One memory area. `bitness` is 0/1/2 for 16/32/64-bit segments.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct MemoryInfoFrame {
    pub start_ea: u64,
    pub end_ea: u64,
    pub name_size: u32,
    pub name: [u8; MAXSTR],
    pub bitness: u8,
    pub perm: u8,
}

pub const SEGPERM_EXEC: u8 = 1;
pub const SEGPERM_WRITE: u8 = 2;
pub const SEGPERM_READ: u8 = 4;

#[cfg(target_pointer_width = "64")]
pub const BITNESS: u8 = 2;
#[cfg(target_pointer_width = "32")]
pub const BITNESS: u8 = 1;

/// READ_MEMORY reply; `size` carries the byte count actually copied.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct MemResponsePacket {
    pub code: u16,
    pub size: u32,
    pub buf: [u8; MEM_CHUNK_SIZE],
}

/// Register values in the wire's fixed layout. Unknown values are BADADDR.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct RegisterSet {
    pub eax: u64,
    pub ebx: u64,
    pub ecx: u64,
    pub edx: u64,
    pub esi: u64,
    pub edi: u64,
    pub ebp: u64,
    pub esp: u64,
    pub eip: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub eflags: u64,
    pub cs: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
    pub ss: u64,
}

impl RegisterSet {
    /// All registers undefined except the instruction pointer.
    pub fn undefined_at(ea: Addr) -> RegisterSet {
        RegisterSet {
            eax: BADADDR,
            ebx: BADADDR,
            ecx: BADADDR,
            edx: BADADDR,
            esi: BADADDR,
            edi: BADADDR,
            ebp: BADADDR,
            esp: BADADDR,
            eip: ea,
            r8: BADADDR,
            r9: BADADDR,
            r10: BADADDR,
            r11: BADADDR,
            r12: BADADDR,
            r13: BADADDR,
            r14: BADADDR,
            r15: BADADDR,
            eflags: BADADDR,
            cs: BADADDR,
            ds: BADADDR,
            es: BADADDR,
            fs: BADADDR,
            gs: BADADDR,
            ss: BADADDR,
        }
    }
}

/// One recorded trace entry as sent to the client.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct TraceEntryFrame {
    pub ea: u64,
    pub tid: i32,
    pub ttype: u32,
    pub registers: RegisterSet,
}

/// READ_TRACE reply: up to TRACE_EVENTS_SIZE entries, count in `size`.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct TraceEventsPacket {
    pub code: u16,
    pub size: u32,
    pub trace: [TraceEntryFrame; TRACE_EVENTS_SIZE],
}

/// Limits frame following SET_OPTIONS. `image_name` is the image to trace,
/// `*` to trace everything.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct LimitsPacket {
    pub image_name: [u8; MAXSTR],
    pub trace_limit: u32,
    pub bytes: u32,
    pub only_new: u8,
}

unsafe impl Pod for Packet {}
unsafe impl Pod for PacketV1 {}
unsafe impl Pod for MemImagesPacket {}
unsafe impl Pod for MemoryInfoFrame {}
unsafe impl Pod for MemResponsePacket {}
unsafe impl Pod for RegisterSet {}
unsafe impl Pod for TraceEntryFrame {}
unsafe impl Pod for TraceEventsPacket {}
unsafe impl Pod for LimitsPacket {}

const_assert_eq!(mem::size_of::<Packet>(), 14);
const_assert_eq!(mem::size_of::<MemImagesPacket>(), 6);
const_assert_eq!(mem::size_of::<MemoryInfoFrame>(), 1046);
const_assert_eq!(mem::size_of::<MemResponsePacket>(), 1030);
const_assert_eq!(mem::size_of::<RegisterSet>(), 192);
const_assert_eq!(mem::size_of::<TraceEntryFrame>(), 208);
const_assert_eq!(
    mem::size_of::<TraceEventsPacket>(),
    6 + 208 * TRACE_EVENTS_SIZE
);
const_assert_eq!(mem::size_of::<LimitsPacket>(), 1033);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_prefix_is_a_prefix_of_the_modern_frame() {
        assert!(mem::size_of::<PacketV1>() <= mem::size_of::<Packet>());
    }

    #[test]
    fn roundtrip_packet_bytes() {
        let mut p: Packet = zeroed();
        p.code = PacketCode::AddBpt as u16;
        p.size = 7;
        p.data = 0x401000;
        let mut q: Packet = zeroed();
        bytes_of_mut(&mut q).copy_from_slice(bytes_of(&p));
        assert_eq!({ q.code }, PacketCode::AddBpt as u16);
        assert_eq!({ q.size }, 7);
        assert_eq!({ q.data }, 0x401000);
    }

    #[test]
    fn cstr_fields_truncate_and_terminate() {
        let mut buf = [0xffu8; 8];
        put_cstr(&mut buf, "too long for this");
        assert_eq!(buf[7], 0);
        assert_eq!(get_cstr(&buf), "too lon");
        let mut buf2 = [0xffu8; 16];
        put_cstr(&mut buf2, "short");
        assert_eq!(get_cstr(&buf2), "short");
    }

    #[test]
    fn unknown_codes_are_rejected() {
        assert_eq!(PacketCode::from_u16(26), None);
        assert_eq!(PacketCode::from_u16(14), Some(PacketCode::Resume));
        assert_eq!(packet_name(99), "UNKNOWN");
    }

    #[test]
    fn undefined_registers_carry_only_the_ip() {
        let r = RegisterSet::undefined_at(0x1234);
        assert_eq!({ r.eip }, 0x1234);
        assert_eq!({ r.eax }, BADADDR);
        assert_eq!({ r.ss }, BADADDR);
    }
}
