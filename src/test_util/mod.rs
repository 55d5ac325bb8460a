//! This module contains utilities for testing code built on docks and dockers: ships that are
//!  independent of any wire format, an in-memory channel, and a delegate that records callbacks.
//!  They are used for testing this crate itself, but they are also exported for application
//!  testing, which is why they are part of the crate's regular (non-#[cfg(test)]) code.

pub mod channel;
pub mod delegate;
pub mod ship;
