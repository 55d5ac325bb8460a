//! Ships are the tracked units of delivery: an [Arrival] is an inbound message that may still be
//!  waiting for some of its fragments, a [Departure] is an outbound task that is sent, and
//!  re-sent until it is acknowledged or runs out of tries.
//!
//! The lifecycle of both is purely timestamp driven: callers pass in the current time, and
//!  nothing in here ever sleeps or spawns.

pub mod plain;

use std::fmt::{Debug, Formatter};
use std::time::Duration;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use crate::config::StarTrekConfig;

/// The transaction id ('SN') correlating fragments and responses to one logical message
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TransactionId(u64);

impl Debug for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[sn:{:016x}]", self.0)
    }
}

impl TransactionId {
    pub const SERIALIZED_LEN: usize = size_of::<u64>();

    pub fn generate() -> TransactionId {
        TransactionId(rand::random())
    }

    pub const fn from_raw(raw: u64) -> TransactionId {
        TransactionId(raw)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

/// Smaller values are more urgent
pub type Priority = i32;

pub const PRIORITY_URGENT: Priority = -1;
pub const PRIORITY_NORMAL: Priority = 0;
pub const PRIORITY_SLOWER: Priority = 1;


pub trait Ship {
    /// Ships without an SN can neither be fragmented nor acknowledged
    fn sn(&self) -> Option<TransactionId>;
}

/// A peer's response to (a fragment of) a departure, extracted from an incoming ship
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub sn: TransactionId,
    /// the page that is acknowledged, or `None` for the whole departure
    pub page: Option<u32>,
    /// the peer asks to retry later: the departure's timer is reset without using up a try
    pub again: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalStatus {
    Assembling,
    Expired,
}

/// An inbound message, possibly still incomplete
pub trait Arrival: Ship + Send + Sync + 'static {
    fn is_complete(&self) -> bool;

    /// Adds another fragment of the same message, returning `true` if this completed the
    ///  message. Fragments that were received before are ignored.
    fn assemble(&mut self, fragment: Self) -> bool where Self: Sized;

    /// the application payload of a complete arrival
    fn payload(&self) -> Bytes;

    /// if this ship is a response to one of our departures, this is what it acknowledges
    fn acknowledgement(&self) -> Option<Acknowledgement>;

    fn touch(&mut self, now: Instant);

    fn status(&self, now: Instant) -> ArrivalStatus;
}

/// Expiry bookkeeping for arrivals: an arrival expires a fixed time after it was last touched
#[derive(Debug, Clone)]
pub struct ArrivalState {
    expires: Duration,
    expired: Option<Instant>,
}
impl ArrivalState {
    pub fn new(config: &StarTrekConfig) -> ArrivalState {
        ArrivalState {
            expires: config.arrival_expires,
            expired: None,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.expired = Some(now + self.expires);
    }

    pub fn status(&self, now: Instant) -> ArrivalStatus {
        match self.expired {
            Some(expired) if now > expired => ArrivalStatus::Expired,
            _ => ArrivalStatus::Assembling,
        }
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartureStatus {
    /// all fragments were acknowledged, or there was nothing to send in the first place
    Done,
    /// not sent yet
    New,
    /// sent, waiting for a response
    Waiting,
    /// no response in time, there are tries left
    Timeout,
    /// no response in time, and no tries left
    Failed,
}

/// An outbound task. Implementations use interior mutability since a departure is shared
///  between the dock that tracks it and the docker that writes it to the wire.
pub trait Departure: Ship + Send + Sync + 'static {
    fn state(&self) -> &DepartureState;

    /// the fragments that still need to be sent, i.e. that were not acknowledged yet
    fn fragments(&self) -> Vec<Bytes>;

    /// An important departure needs a response from the peer to be done. All others are
    ///  fire-and-forget, their tracking ends as soon as they are handed to the connection.
    fn is_important(&self) -> bool;

    /// Applies a response, returning `true` if this departure is now fully acknowledged
    fn check_response(&self, ack: &Acknowledgement) -> bool;

    fn priority(&self) -> Priority {
        self.state().priority()
    }

    fn status(&self, now: Instant) -> DepartureStatus {
        self.state().status(!self.fragments().is_empty(), now)
    }

    fn touch(&self, now: Instant) {
        self.state().touch(now)
    }
}

/// Priority, expiry and remaining tries of a departure
#[derive(Debug)]
pub struct DepartureState {
    expires: Duration,
    inner: Mutex<DepartureTimer>,
}

#[derive(Debug)]
struct DepartureTimer {
    priority: Priority,
    /// `None` while the departure was never sent
    expired: Option<Instant>,
    tries: u32,
}

impl DepartureState {
    pub fn new(priority: Priority, config: &StarTrekConfig) -> DepartureState {
        Self::with_timing(priority, config.departure_expires, config.departure_max_tries())
    }

    pub fn with_timing(priority: Priority, expires: Duration, max_tries: u32) -> DepartureState {
        DepartureState {
            expires,
            inner: Mutex::new(DepartureTimer {
                priority,
                expired: None,
                tries: max_tries,
            }),
        }
    }

    pub fn priority(&self) -> Priority {
        self.inner.lock().priority
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        self.inner.lock().priority = priority;
    }

    pub fn tries(&self) -> u32 {
        self.inner.lock().tries
    }

    /// marks the departure as sent (again): uses up one try and restarts the response timer
    pub fn touch(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.expired = Some(now + self.expires);
        inner.tries = inner.tries.saturating_sub(1);
    }

    /// restarts the response timer without using up a try
    pub fn retry_later(&self, now: Instant) {
        let mut inner = self.inner.lock();
        if inner.expired.is_some() {
            inner.expired = Some(now + self.expires);
        }
    }

    pub fn status(&self, has_fragments: bool, now: Instant) -> DepartureStatus {
        let inner = self.inner.lock();
        if !has_fragments {
            return DepartureStatus::Done;
        }
        match inner.expired {
            None => DepartureStatus::New,
            Some(expired) if now < expired => DepartureStatus::Waiting,
            Some(_) if inner.tries > 0 => DepartureStatus::Timeout,
            Some(_) => DepartureStatus::Failed,
        }
    }
}
