//! Blocking socket plumbing between the agent and the client.
//!
//! One party writes the client socket at a time - the listener thread
//! after startup, or whichever application thread is serving requests
//! synchronously before it - so the channel itself carries no write lock;
//! the listener-ready flag is the arbiter.

use crate::protocol::{
    bytes_of, bytes_of_mut, zeroed, Packet, PacketCode, PacketV1, PROTOCOL_VERSION, TARGET_OS,
};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{
    accept, bind, listen, setsockopt, socket, sockopt, AddressFamily, InetAddr, IpAddr, SockAddr,
    SockFlag, SockType,
};
use nix::unistd;
use nix::Error;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

/// The two sockets the agent owns: the listening socket and, once a client
/// connected, the conversation socket. Stored as raw descriptors so any
/// thread may use them; closing is idempotent.
pub struct Channel {
    srv: AtomicI32,
    cli: AtomicI32,
}

impl Channel {
    pub fn new() -> Channel {
        Channel {
            srv: AtomicI32::new(-1),
            cli: AtomicI32::new(-1),
        }
    }

    pub fn srv(&self) -> RawFd {
        self.srv.load(Ordering::Relaxed)
    }

    pub fn cli(&self) -> RawFd {
        self.cli.load(Ordering::Relaxed)
    }

    pub fn set_srv(&self, fd: RawFd) {
        self.srv.store(fd, Ordering::Relaxed);
    }

    pub fn set_cli(&self, fd: RawFd) {
        self.cli.store(fd, Ordering::Relaxed);
    }

    pub fn close_cli(&self) {
        let fd = self.cli.swap(-1, Ordering::Relaxed);
        if fd >= 0 {
            let _ = unistd::close(fd);
        }
    }

    pub fn close_srv(&self) {
        let fd = self.srv.swap(-1, Ordering::Relaxed);
        if fd >= 0 {
            let _ = unistd::close(fd);
        }
    }
}

impl Default for Channel {
    fn default() -> Channel {
        Channel::new()
    }
}

pub enum IoOutcome {
    /// The whole buffer was transferred.
    Done,
    /// The peer closed the connection.
    Closed,
    Failed(Errno),
}

/// Read exactly `buf.len()` bytes, retrying on EINTR.
pub fn recv_exact(fd: RawFd, buf: &mut [u8]) -> IoOutcome {
    let mut off = 0;
    while off < buf.len() {
        match unistd::read(fd, &mut buf[off..]) {
            Ok(0) => return IoOutcome::Closed,
            Ok(n) => off += n,
            Err(Error::Sys(Errno::EINTR)) => continue,
            Err(Error::Sys(e)) => return IoOutcome::Failed(e),
            Err(_) => return IoOutcome::Failed(Errno::EIO),
        }
    }
    IoOutcome::Done
}

/// Write all of `buf`, looping over partial writes, retrying on EINTR.
pub fn send_exact(fd: RawFd, buf: &[u8]) -> IoOutcome {
    let mut off = 0;
    while off < buf.len() {
        match unistd::write(fd, &buf[off..]) {
            Ok(0) => return IoOutcome::Closed,
            Ok(n) => off += n,
            Err(Error::Sys(Errno::EINTR)) => continue,
            Err(Error::Sys(e)) => return IoOutcome::Failed(e),
            Err(_) => return IoOutcome::Failed(Errno::EIO),
        }
    }
    IoOutcome::Done
}

/// Poll for readability, waiting `timeout_ms` (-1 means forever). Returns
/// true if data is ready.
pub fn poll_incoming(fd: RawFd, timeout_ms: i32) -> bool {
    let mut pfds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut pfds, timeout_ms) {
        Ok(ret) if ret > 0 => true,
        Err(Error::Sys(err)) if err != Errno::EINTR => {
            msg!("socket poll failed: {}", err);
            false
        }
        _ => false,
    }
}

pub enum Greeting {
    Accepted,
    /// A protocol-version-1 client was refused with a legacy-shaped reply.
    V1Rejected,
    Failed,
}

/// Run the HELLO exchange on a connected socket.
///
/// The legacy subset of the frame is read first since a version-1 client
/// sends a shorter packet. A v1 client gets a legacy-shaped ACK naming the
/// current protocol version, and the connection is dropped: explicit
/// refusal beats silent misbehavior. A modern client gets an ACK whose
/// `data` carries the address width and target OS tag and whose `size` is
/// the protocol version.
pub fn greet_client(fd: RawFd) -> Greeting {
    let mut req_v1: PacketV1 = zeroed();
    debug_msg!(
        4,
        "Receiving packet, expected {} bytes...",
        mem::size_of::<PacketV1>()
    );
    match recv_exact(fd, bytes_of_mut(&mut req_v1)) {
        IoOutcome::Done => {}
        IoOutcome::Closed => {
            msg!("recv: connection closed by peer");
            return Greeting::Failed;
        }
        IoOutcome::Failed(e) => {
            msg!("recv: {}", e);
            return Greeting::Failed;
        }
    }
    if { req_v1.code } != PacketCode::Hello as u16 {
        msg!(
            "'HELLO' expected, '{}' received",
            crate::protocol::packet_name(req_v1.code)
        );
        return Greeting::Failed;
    }
    if { req_v1.size } == 1 {
        // version 1 (incompatible) client - send v1 packet answer and drop
        msg!("Incompatible client (version 1) - disconnect");
        req_v1.size = PROTOCOL_VERSION;
        req_v1.data = mem::size_of::<usize>();
        req_v1.code = PacketCode::Ack as u16;
        let _ = send_exact(fd, bytes_of(&req_v1));
        return Greeting::V1Rejected;
    }
    // valid client: read the rest of the modern HELLO, if any
    let mut req: Packet = zeroed();
    let prefix = mem::size_of::<PacketV1>();
    let rest = mem::size_of::<Packet>() - prefix;
    bytes_of_mut(&mut req)[..prefix].copy_from_slice(bytes_of(&req_v1));
    if rest > 0 {
        if let IoOutcome::Done = recv_exact(fd, &mut bytes_of_mut(&mut req)[prefix..]) {
        } else {
            return Greeting::Failed;
        }
    }
    // the address width and target OS tell the client whether it picked
    // the right-bitness debugger
    let mut ans: Packet = zeroed();
    ans.data = mem::size_of::<usize>() as u64 | TARGET_OS;
    ans.size = PROTOCOL_VERSION;
    ans.code = PacketCode::Ack as u16;
    match send_exact(fd, bytes_of(&ans)) {
        IoOutcome::Done => Greeting::Accepted,
        _ => Greeting::Failed,
    }
}

/// Bind, listen and accept one client, honoring the connect timeout
/// (seconds; zero means wait forever). A version-1 client is turned away
/// and the next connection is awaited.
pub fn init_socket(chan: &Channel, port: u16, timeout_secs: u32) -> bool {
    let srv = match socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    ) {
        Ok(fd) => fd,
        Err(e) => {
            msg!("socket: {}", e);
            return false;
        }
    };
    chan.set_srv(srv);

    if let Err(e) = setsockopt(srv, sockopt::ReuseAddr, &true) {
        msg!("setsockopt: {}", e);
    }

    let addr = SockAddr::new_inet(InetAddr::new(IpAddr::new_v4(0, 0, 0, 0), port));
    if let Err(e) = bind(srv, &addr) {
        msg!("bind: {}", e);
        return false;
    }
    if let Err(e) = listen(srv, 1) {
        msg!("listen: {}", e);
        return false;
    }
    msg!("Listening at port {}...", port);

    loop {
        if timeout_secs != 0 && !poll_incoming(srv, timeout_secs as i32 * 1000) {
            msg!("client connect timeout");
            return false;
        }
        let pending = match accept(srv) {
            Ok(fd) => PendingClient { fd },
            Err(e) => {
                msg!("accept: {}", e);
                return false;
            }
        };
        match greet_client(pending.fd) {
            Greeting::Accepted => {
                pending.adopt(chan);
                return true;
            }
            Greeting::V1Rejected => {
                // dropping the pending connection hangs up; the
                // incompatible client may come back speaking the modern
                // protocol
                continue;
            }
            Greeting::Failed => return false,
        }
    }
}

/// A connection that was accepted but has not passed the HELLO exchange.
/// Dropping it hangs up; only a greeted client is adopted into the
/// channel.
struct PendingClient {
    fd: RawFd,
}

impl PendingClient {
    fn adopt(mut self, chan: &Channel) {
        chan.set_cli(self.fd);
        self.fd = -1;
    }
}

impl Drop for PendingClient {
    fn drop(&mut self) {
        if self.fd >= 0 {
            let _ = unistd::close(self.fd);
        }
    }
}
