use ditrace::agent::AGENT;
use ditrace::options::Options;
use ditrace::{debug_msg, log, msg};
use structopt::StructOpt;

fn main() {
    let opts = Options::from_args();

    let level = opts.effective_debug_level();
    if level > 0 {
        log::set_level(level);
        msg!("Dynamic-instrumentation debug agent\nInitializing...\n");
    }

    debug_msg!(2, "agent started (debug level={})", level);

    // Connect to the debugger; only returns on error.
    if !AGENT.listen_for_client(opts.port, opts.connect_timeout) {
        debug_msg!(2, "listen_for_client() failed");
        std::process::exit(-1);
    }
}
