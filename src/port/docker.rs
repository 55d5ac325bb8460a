use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, span, trace, warn, Level};
use uuid::Uuid;
use crate::config::StarTrekConfig;
use crate::dock::LockedDock;
use crate::error::DockerError;
use crate::net::connection::Connection;
use crate::net::state::ConnectionState;
use crate::port::{DockerDelegate, DockerStatus, Porter, Protocol};
use crate::ship::{Arrival, Departure, DepartureStatus, Priority, Ship};

/// The generic docker: a dock for a single connection, plus the logic for moving ships between
///  the two. The wire format is left to the [Protocol].
pub struct StarDocker<P: Protocol> {
    protocol: P,
    remote: SocketAddr,
    local: Option<SocketAddr>,
    connection: Weak<Connection>,
    delegate: Weak<dyn DockerDelegate>,
    dock: LockedDock<P::Arrival, P::Departure>,
    /// the unsent rest of a departure whose write was cut short, to be sent before anything else
    last_fragments: Mutex<Option<(Arc<P::Departure>, Vec<Bytes>)>>,
    /// received data that the protocol could not parse yet
    receive_cache: Mutex<BytesMut>,
    closed: AtomicBool,
}

impl <P: Protocol> StarDocker<P> {
    pub fn new(protocol: P, connection: &Arc<Connection>, delegate: Weak<dyn DockerDelegate>, config: Arc<StarTrekConfig>) -> StarDocker<P> {
        StarDocker {
            dock: LockedDock::new(config),
            protocol,
            remote: connection.remote_addr(),
            local: connection.local_addr(),
            connection: Arc::downgrade(connection),
            delegate,
            last_fragments: Default::default(),
            receive_cache: Default::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn num_pending_departures(&self) -> usize {
        self.dock.num_pending_departures()
    }

    /// queues a departure directly, e.g. one built by the protocol with a specific SN
    pub fn send_ship(&self, departure: P::Departure) -> bool {
        if self.closed.load(Ordering::Acquire) {
            debug!("docker {:?} is closed, rejecting departure", self.remote);
            return false;
        }
        self.dock.add_departure(Arc::new(departure))
    }

    fn delegate(&self) -> Option<Arc<dyn DockerDelegate>> {
        self.delegate.upgrade()
    }

    fn handle_arrival(&self, arrival: P::Arrival, now: Instant) {
        if let Some(ack) = arrival.acknowledgement() {
            trace!("received acknowledgement {:?}", ack);
            if let Some(departure) = self.dock.check_response(&ack, now) {
                debug!("departure {:?} was acknowledged", departure.sn());
                if let Some(delegate) = self.delegate() {
                    delegate.on_docker_sent(departure.as_ref(), self);
                }
            }
        }

        let check = self.protocol.check_arrival(arrival);
        for reply in check.replies {
            self.dock.add_departure(Arc::new(reply));
        }
        if let Some(arrival) = check.deliver {
            if let Some(complete) = self.dock.assemble_arrival(arrival, now) {
                match self.delegate() {
                    Some(delegate) => delegate.on_docker_received(&complete, self),
                    None => warn!("no delegate for received message - dropping"),
                }
            }
        }
    }

    fn send_fragments(&self, connection: &Connection, departure: Arc<P::Departure>, fragments: Vec<Bytes>, now: Instant) {
        let total: usize = fragments.iter().map(|f| f.len()).sum();
        let mut sent = 0;

        for (i, fragment) in fragments.iter().enumerate() {
            let (error, written) = match connection.send(fragment, now) {
                Ok(n) if n == fragment.len() => {
                    sent += n;
                    continue;
                }
                Ok(n) => (DockerError::SendIncomplete { sent: sent + n, total }, n),
                Err(e) => (DockerError::ConnectionLost(e.to_string()), 0),
            };

            let mut rest = fragments[i..].to_vec();
            rest[0] = fragment.slice(written..);
            debug!("{} - keeping {} fragment(s) of {:?} for the next round", error, rest.len(), departure.sn());
            *self.last_fragments.lock() = Some((departure.clone(), rest));
            if let Some(delegate) = self.delegate() {
                delegate.on_docker_error(&error, Some(departure.as_ref()), self);
            }
            return;
        }

        trace!("sent {} bytes for {:?}", total, departure.sn());
        self.on_written(&departure);
    }

    /// A departure that waits for no acknowledgement is done once it is written
    fn on_written(&self, departure: &Arc<P::Departure>) {
        let needs_ack = departure.is_important() && departure.sn().is_some();
        if !needs_ack {
            if let Some(delegate) = self.delegate() {
                delegate.on_docker_sent(departure.as_ref(), self);
            }
        }
    }
}

impl <P: Protocol> Porter for StarDocker<P> {
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    fn status(&self) -> DockerStatus {
        match self.connection.upgrade() {
            Some(connection) => connection.state().into(),
            None => DockerStatus::Error,
        }
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.connection.upgrade().is_some_and(|c| c.state() != ConnectionState::Error)
    }

    fn send_data(&self, payload: Bytes, priority: Priority) -> bool {
        self.send_ship(self.protocol.pack(payload, priority))
    }

    fn process_received(&self, data: &[u8], now: Instant) {
        if self.closed.load(Ordering::Acquire) {
            debug!("docker {:?} is closed, dropping {} received bytes", self.remote, data.len());
            return;
        }

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "docker_received", ?correlation_id);
        let _entered = span.enter();
        trace!("received {} bytes from {:?}", data.len(), self.remote);

        let arrivals = {
            let mut cache = self.receive_cache.lock();
            cache.extend_from_slice(data);
            self.protocol.parse(&mut cache)
        };

        for arrival in arrivals {
            self.handle_arrival(arrival, now);
        }
    }

    fn heartbeat(&self) {
        trace!("queueing heartbeat for {:?}", self.remote);
        self.send_ship(self.protocol.heartbeat());
    }

    fn process(&self, now: Instant) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let connection = match self.connection.upgrade() {
            Some(connection) => connection,
            None => return false,
        };
        if !connection.is_vacant() {
            return false;
        }

        let continuation = self.last_fragments.lock().take();
        let (departure, fragments) = match continuation {
            Some(continuation) => continuation,
            None => {
                let departure = match self.dock.next_departure(now) {
                    Some(departure) => departure,
                    None => return false,
                };
                if departure.status(now) == DepartureStatus::Failed {
                    debug!("departure {:?} failed after all retries", departure.sn());
                    if let Some(delegate) = self.delegate() {
                        delegate.on_docker_failed(&DockerError::RequestTimeout(departure.sn()), departure.as_ref(), self);
                    }
                    return true;
                }
                let fragments = departure.fragments();
                (departure, fragments)
            }
        };

        if fragments.is_empty() {
            trace!("nothing to write for {:?}", departure.sn());
            self.on_written(&departure);
            return true;
        }
        self.send_fragments(&connection, departure, fragments, now);
        true
    }

    fn purge(&self, now: Instant) {
        let expired = self.dock.purge(now);
        if expired.is_empty() {
            return;
        }
        let delegate = self.delegate();
        for arrival in expired {
            if let (Some(sn), Some(delegate)) = (arrival.sn(), &delegate) {
                delegate.on_docker_error(&DockerError::ArrivalExpired(sn), None, self);
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing docker {:?}", self.remote);

        let mut pending = self.dock.drain_departures();
        if let Some((departure, _)) = self.last_fragments.lock().take() {
            if !pending.iter().any(|d| Arc::ptr_eq(d, &departure)) {
                pending.push(departure);
            }
        }

        if let Some(delegate) = self.delegate() {
            let error = DockerError::ConnectionLost("docker closed".to_string());
            for departure in pending {
                delegate.on_docker_failed(&error, departure.as_ref(), self);
            }
        }
    }
}
