//! A porter ('docker') sits between a connection and the application: It turns outbound payloads
//!  into departures and writes them to the connection, and it parses inbound data into arrivals,
//!  handles protocol chatter (heartbeats, responses) and delivers complete messages.
//!
//! The wire format is pluggable via [Protocol], everything else is shared by [docker::StarDocker].

pub mod docker;
pub mod packet;
pub mod plain;

use std::net::SocketAddr;
use std::sync::Arc;
use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use crate::error::DockerError;
use crate::net::connection::Connection;
use crate::net::state::ConnectionState;
use crate::ship::{Arrival, Departure, Priority};

/// A docker's status as seen by the application, derived from its connection's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DockerStatus {
    Error,
    Init,
    Preparing,
    Ready,
}

impl From<ConnectionState> for DockerStatus {
    fn from(value: ConnectionState) -> Self {
        match value {
            ConnectionState::Default => DockerStatus::Init,
            ConnectionState::Preparing => DockerStatus::Preparing,
            ConnectionState::Ready | ConnectionState::Expired | ConnectionState::Maintaining => DockerStatus::Ready,
            ConnectionState::Error => DockerStatus::Error,
        }
    }
}

/// The object-safe view of a docker, used by the gate and passed to delegates
pub trait Porter: Send + Sync + 'static {
    fn remote_addr(&self) -> SocketAddr;
    fn local_addr(&self) -> Option<SocketAddr>;

    fn connection(&self) -> Option<Arc<Connection>>;

    fn status(&self) -> DockerStatus;

    /// `false` once the docker was closed or its connection is gone or broken
    fn is_alive(&self) -> bool;

    /// Queues a payload for sending, returning `false` if it was rejected
    fn send_data(&self, payload: Bytes, priority: Priority) -> bool;

    /// handles data that was received on the connection
    fn process_received(&self, data: &[u8], now: Instant);

    /// queues a keep-alive for the connection
    fn heartbeat(&self);

    /// Sends the next departure if there is one, returning `true` if there was work
    fn process(&self, now: Instant) -> bool;

    /// drops expired arrivals and stale bookkeeping
    fn purge(&self, now: Instant);

    /// reports all pending departures as failed, and stops accepting new ones
    fn close(&self);
}

/// Callbacks from a docker to the application
pub trait DockerDelegate: Send + Sync + 'static {
    /// a complete message arrived
    fn on_docker_received(&self, arrival: &dyn Arrival, docker: &dyn Porter);

    /// A departure is done: it was acknowledged by the peer or, if it does not need
    ///  acknowledgement, it was written to the connection
    fn on_docker_sent(&self, departure: &dyn Departure, docker: &dyn Porter);

    /// a departure is given up on
    fn on_docker_failed(&self, error: &DockerError, departure: &dyn Departure, docker: &dyn Porter);

    /// a recoverable problem, the affected departure (if any) is retried
    fn on_docker_error(&self, error: &DockerError, departure: Option<&dyn Departure>, docker: &dyn Porter);

    fn on_docker_status_changed(&self, previous: DockerStatus, current: DockerStatus, docker: &dyn Porter);
}

/// What to do with a received ship
pub struct ArrivalCheck<A, D> {
    /// the ship to hand to the arrival hall, or `None` if it was protocol chatter
    pub deliver: Option<A>,
    /// responses to send back
    pub replies: Vec<D>,
}

impl <A, D> ArrivalCheck<A, D> {
    pub fn deliver(arrival: A) -> ArrivalCheck<A, D> {
        ArrivalCheck { deliver: Some(arrival), replies: Vec::new() }
    }

    pub fn deliver_and_reply(arrival: A, reply: D) -> ArrivalCheck<A, D> {
        ArrivalCheck { deliver: Some(arrival), replies: vec![reply] }
    }

    pub fn reply(reply: D) -> ArrivalCheck<A, D> {
        ArrivalCheck { deliver: None, replies: vec![reply] }
    }

    pub fn swallow() -> ArrivalCheck<A, D> {
        ArrivalCheck { deliver: None, replies: Vec::new() }
    }
}

/// A wire format, i.e. how a docker frames and unframes data
pub trait Protocol: Send + Sync + 'static {
    type Arrival: Arrival;
    type Departure: Departure;

    /// Parses as many ships as possible from the receive cache, consuming what was parsed (or
    ///  skipped as garbage). An incomplete tail stays in the cache.
    fn parse(&self, cache: &mut BytesMut) -> Vec<Self::Arrival>;

    fn check_arrival(&self, arrival: Self::Arrival) -> ArrivalCheck<Self::Arrival, Self::Departure>;

    fn pack(&self, payload: Bytes, priority: Priority) -> Self::Departure;

    fn heartbeat(&self) -> Self::Departure;
}
