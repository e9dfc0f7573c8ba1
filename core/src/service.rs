//! The `service` module implements a trait for fabric services, which are
//! groups of threads joined on shutdown.

use std::thread;

pub trait Service {
    fn thread_hdls(self) -> Vec<thread::JoinHandle<()>>;
    fn join(self) -> thread::Result<()>;
}
