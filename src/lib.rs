//! Connection-oriented messaging over plain sockets: ships (messages) are fragmented, sent,
//!  retried and acknowledged by a docker per peer, and the gate keeps the dockers and their
//!  connections alive.

pub mod config;
pub mod error;
pub mod ship;
pub mod dock;
pub mod net;
pub mod mtp;
pub mod port;
pub mod gate;
pub mod driver;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            // .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
