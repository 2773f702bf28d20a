#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod log;

pub mod agent;
pub mod bpt_mgr;
pub mod dispatcher;
pub mod ev_queue;
pub mod event;
pub mod host;
pub mod instrumenter;
pub mod listener;
pub mod net;
pub mod options;
pub mod process_state;
pub mod protocol;
pub mod registers;
pub mod semaphore;
pub mod thread_table;
