//! The connection layer: channels do the actual (non-blocking) I/O, connections track liveness
//!  on top of them, and the hub owns both and drives them.

pub mod address;
pub mod channel;
pub mod connection;
pub mod hub;
pub mod state;
pub mod tcp;
pub mod udp;
