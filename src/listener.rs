//! The listener thread owns the client socket once the target is running.
//! Until it has flipped its ready flag, a suspended application thread
//! serves requests synchronously from its own stack, so breakpoints
//! planted before the target's first instruction are honored.

use crate::agent::Agent;
use crate::event::EventId;
use crate::net;

impl Agent {
    /// Serve requests synchronously while the listener thread is not live
    /// yet. Aborts as soon as the listener flag flips. Returns false when
    /// the process is going away.
    pub fn serve_sync(&'static self) -> bool {
        loop {
            {
                let st = self.process.lock();
                if st.detached() || st.exiting() {
                    return false;
                }
                if !(st.pause_requested() || st.suspended()) {
                    break;
                }
            }
            if self.listener_is_ready() {
                // all further requests are processed by the listener
                break;
            }
            if !self.read_handle_packet(None) {
                return false;
            }
        }
        true
    }

    /// Body of the dedicated request-serving thread.
    pub fn listener_main(&'static self) {
        msg!("Listener started (thread = {})", self.cur_thread_id());

        self.set_listener_ready(true);

        loop {
            debug_msg!(4, "Handling events in listener");
            self.read_handle_packet(None);
            if self.process.get().detached() {
                msg!("Detached");
                self.chan.close_cli();
                self.chan.close_srv();
                break;
            }
            if self.host().is_process_exiting() {
                debug_msg!(2, "host reports process exiting");
                if self.events.empty() && self.process.get().exiting() {
                    msg!("Process is exiting...");
                    break;
                }
            }
        }
        msg!("Listener exited");
        self.listener_exited.set();
    }

    /// Connect to the client and serve the first requests; START_PROCESS
    /// must be among them, and its handler does not return while the
    /// target lives.
    pub fn listen_for_client(&'static self, port: u16, timeout_secs: u32) -> bool {
        if !net::init_socket(&self.chan, port, timeout_secs) {
            debug_msg!(2, "listen_for_client: init_socket() failed!");
            return false;
        }

        msg!("CONNECTED TO THE DEBUGGER");

        // A well-behaved client starts the target within its first few
        // requests; a runaway handshake is refused rather than served
        // forever.
        let ret = self.handle_packets(5, EventId::NoEvent);
        msg!("Exiting from listen_for_client");
        ret
    }
}
