use std::env;
use structopt::StructOpt;

/// Command line switches consumed by the agent. The instrumentation engine
/// strips its own arguments before ours are parsed.
#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "ditrace")]
pub struct Options {
    /// Port where the debugger is listening for incoming connections
    #[structopt(short = "p", long = "port", default_value = "23946")]
    pub port: u16,

    /// How many seconds to wait for a client connection (0 - wait forever)
    #[structopt(short = "T", long = "connect-timeout", default_value = "0")]
    pub connect_timeout: u32,

    /// Debug mode (verbosity 0-4)
    #[structopt(short = "d", long = "idadbg", default_value = "0")]
    pub debug_mode: i32,
}

impl Options {
    /// The environment overrides a zero command-line verbosity, so the agent
    /// can be made chatty without editing the engine invocation.
    pub fn effective_debug_level(&self) -> i32 {
        if self.debug_mode > 0 {
            return self.debug_mode;
        }
        match env::var("IDAPIN_DEBUG") {
            Ok(v) => v.parse::<i32>().unwrap_or(0),
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = Options::from_iter(&["ditrace"]);
        assert_eq!(opts.port, 23946);
        assert_eq!(opts.connect_timeout, 0);
        assert_eq!(opts.debug_mode, 0);
    }

    #[test]
    fn explicit_switches() {
        let opts = Options::from_iter(&["ditrace", "-p", "4444", "-T", "30", "--idadbg", "2"]);
        assert_eq!(opts.port, 4444);
        assert_eq!(opts.connect_timeout, 30);
        assert_eq!(opts.debug_mode, 2);
        assert_eq!(opts.effective_debug_level(), 2);
    }
}
