//! The gate is the application's entry point: it owns the [Hub] with its connections, and it keeps
//!  one docker per connection, creating dockers lazily when data arrives from a new peer or when
//!  the application sends to one.
//!
//! Until the kind of a new peer's docker is known, its data is buffered as an 'advance party' and
//!  replayed through the docker once it exists.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use anyhow::bail;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::config::StarTrekConfig;
use crate::mtp::header::Header;
use crate::net::address::{AddressPairMap, SocketPair};
use crate::net::channel::ChannelFactory;
use crate::net::connection::Connection;
use crate::net::hub::{ConnectionDelegate, Hub};
use crate::net::state::ConnectionState;
use crate::port::docker::StarDocker;
use crate::port::packet::PacketProtocol;
use crate::port::plain::PlainProtocol;
use crate::port::{DockerDelegate, DockerStatus, Porter};
use crate::ship::Priority;

const MAGIC: &[u8] = Header::MAGIC;

/// Decides which docker to create for a connection
pub trait DockerFactory: Send + Sync + 'static {
    /// `advance_party` is the data received from the peer so far, in order. It is empty for
    ///  connections opened by this side. Returns `None` if more data is needed to decide.
    fn create_docker(&self, connection: &Arc<Connection>, advance_party: &[Bytes], delegate: Weak<dyn DockerDelegate>) -> Option<Arc<dyn Porter>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerKind {
    Plain,
    Packet,
}

/// Creates MTP dockers for peers that start with the MTP magic, and plain dockers for everyone
///  else. Outbound connections get the configured default kind.
pub struct AutoDockerFactory {
    config: Arc<StarTrekConfig>,
    datagram: bool,
    outbound_kind: DockerKind,
}

impl AutoDockerFactory {
    pub fn new(config: Arc<StarTrekConfig>, datagram: bool, outbound_kind: DockerKind) -> AutoDockerFactory {
        AutoDockerFactory {
            config,
            datagram,
            outbound_kind,
        }
    }

    pub fn detect(&self, advance_party: &[Bytes]) -> Option<DockerKind> {
        let first = match advance_party.first() {
            Some(first) => first,
            None => return Some(self.outbound_kind),
        };

        if self.datagram {
            // every datagram is a whole unit, so the first one decides
            return Some(if first.starts_with(MAGIC) { DockerKind::Packet } else { DockerKind::Plain });
        }

        let mut head = Vec::with_capacity(MAGIC.len());
        for chunk in advance_party {
            let missing = MAGIC.len() - head.len();
            head.extend_from_slice(&chunk[..chunk.len().min(missing)]);
            if head.len() == MAGIC.len() {
                break;
            }
        }

        if head.as_slice() == MAGIC {
            Some(DockerKind::Packet)
        }
        else if MAGIC.starts_with(&head) {
            None
        }
        else {
            Some(DockerKind::Plain)
        }
    }
}

impl DockerFactory for AutoDockerFactory {
    fn create_docker(&self, connection: &Arc<Connection>, advance_party: &[Bytes], delegate: Weak<dyn DockerDelegate>) -> Option<Arc<dyn Porter>> {
        let kind = self.detect(advance_party)?;
        debug!("creating {:?} docker for {:?}", kind, connection);

        let docker: Arc<dyn Porter> = match kind {
            DockerKind::Plain => Arc::new(StarDocker::new(PlainProtocol::new(self.config.clone()), connection, delegate, self.config.clone())),
            DockerKind::Packet => Arc::new(StarDocker::new(PacketProtocol::new(self.config.clone(), self.datagram), connection, delegate, self.config.clone())),
        };
        Some(docker)
    }
}


/// Lock order: `advance_parties` before `dockers`
pub struct StarGate {
    hub: Hub,
    docker_factory: Arc<dyn DockerFactory>,
    delegate: Weak<dyn DockerDelegate>,
    dockers: RwLock<AddressPairMap<Arc<dyn Porter>>>,
    advance_parties: Mutex<FxHashMap<SocketPair, Vec<Bytes>>>,
}

impl StarGate {
    pub fn new(
        config: Arc<StarTrekConfig>,
        channel_factory: Option<Arc<dyn ChannelFactory>>,
        docker_factory: Arc<dyn DockerFactory>,
        delegate: Weak<dyn DockerDelegate>,
    ) -> Arc<StarGate> {
        Arc::new_cyclic(|gate: &Weak<StarGate>| {
            let connection_delegate: Weak<dyn ConnectionDelegate> = gate.clone();
            StarGate {
                hub: Hub::new(config, channel_factory, connection_delegate),
                docker_factory,
                delegate,
                dockers: Default::default(),
                advance_parties: Default::default(),
            }
        })
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn docker(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Option<Arc<dyn Porter>> {
        self.dockers.read().get(remote, local).cloned()
    }

    pub fn dockers(&self) -> Vec<Arc<dyn Porter>> {
        self.dockers.read().values().cloned().collect()
    }

    /// Returns the docker for `remote`, connecting and creating it if necessary. A connection
    ///  whose channel was closed gets a fresh channel first.
    ///
    /// This goes through [Hub::connect], so when a stream channel has to be opened the call blocks
    ///  for up to the configured `connect_timeout`, and it must run inside a tokio runtime.
    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>, now: Instant) -> anyhow::Result<Arc<dyn Porter>> {
        let connection = self.hub.connect(remote, local, now)?;
        if let Some(docker) = self.docker(connection.remote_addr(), connection.local_addr()) {
            return Ok(docker);
        }

        let docker = match self.docker_factory.create_docker(&connection, &[], self.delegate.clone()) {
            Some(docker) => docker,
            None => bail!("no docker for outbound connection {:?}", connection),
        };
        Ok(self.register_docker(&connection, docker))
    }

    /// Queues a payload for `remote`. Delivery is reported to the delegate asynchronously, the
    ///  result only says whether the payload was accepted.
    ///
    /// Connecting happens on the caller's thread, see [StarGate::connect]. With a TCP channel
    ///  factory, sending to a peer without an open channel blocks for up to `connect_timeout`.
    pub fn send_data(&self, payload: Bytes, remote: SocketAddr, local: Option<SocketAddr>, priority: Priority, now: Instant) -> anyhow::Result<()> {
        let docker = self.connect(remote, local, now)?;
        if !docker.send_data(payload, priority) {
            bail!("docker for {:?} rejected the payload", remote);
        }
        Ok(())
    }

    /// Inserts a new docker unless another one won the race, returning the docker that is
    ///  registered
    fn register_docker(&self, connection: &Connection, docker: Arc<dyn Porter>) -> Arc<dyn Porter> {
        let mut dockers = self.dockers.write();
        if let Some(existing) = dockers.get(connection.remote_addr(), connection.local_addr()) {
            trace!("docker for {:?} was created concurrently", connection);
            return existing.clone();
        }
        dockers.insert(connection.remote_addr(), connection.local_addr(), docker.clone());
        docker
    }

    fn remove_docker(&self, remote: SocketAddr, local: Option<SocketAddr>) {
        self.advance_parties.lock().remove(&SocketPair::new(remote, local));
        let removed = self.dockers.write().remove(remote, local);
        if let Some(docker) = removed {
            debug!("removing docker for {:?}", SocketPair::new(remote, local));
            docker.close();
        }
    }

    /// One round of work: reads from all channels, advances connection states, and gives every
    ///  docker the chance to send. Returns `true` if there was anything to do, i.e. if calling
    ///  again right away is likely to make progress.
    pub fn process(&self, now: Instant) -> bool {
        let mut busy = self.hub.process(now);
        self.hub.tick(now);

        let dockers = self.dockers.read().iter()
            .map(|(pair, docker)| (pair, docker.clone()))
            .collect::<Vec<_>>();

        for (pair, docker) in dockers {
            if !docker.is_alive() {
                info!("docker for {:?} is dead", pair);
                self.remove_docker(pair.remote, pair.local);
                continue;
            }
            if docker.process(now) {
                busy = true;
            }
            docker.purge(now);
        }
        busy
    }

    /// closes all dockers, reporting their pending departures as failed, and the hub
    pub fn close(&self) {
        self.advance_parties.lock().clear();
        let dockers = std::mem::take(&mut *self.dockers.write());
        for docker in dockers.values() {
            docker.close();
        }
        self.hub.close();
    }
}

impl ConnectionDelegate for StarGate {
    fn on_connection_state_changed(&self, previous: ConnectionState, current: ConnectionState, connection: &Arc<Connection>) {
        let docker = self.docker(connection.remote_addr(), connection.local_addr());

        if let Some(docker) = &docker {
            let (previous_status, current_status): (DockerStatus, DockerStatus) = (previous.into(), current.into());
            if previous_status != current_status {
                if let Some(delegate) = self.delegate.upgrade() {
                    delegate.on_docker_status_changed(previous_status, current_status, docker.as_ref());
                }
            }
        }

        match current {
            ConnectionState::Error => {
                warn!("connection {:?} failed", connection);
                self.remove_docker(connection.remote_addr(), connection.local_addr());
            }
            ConnectionState::Expired => {
                if let Some(docker) = docker {
                    docker.heartbeat();
                }
            }
            _ => {}
        }
    }

    fn on_connection_received(&self, data: &[u8], connection: &Arc<Connection>, now: Instant) {
        if let Some(docker) = self.docker(connection.remote_addr(), connection.local_addr()) {
            docker.process_received(data, now);
            return;
        }

        let pair = connection.socket_pair();
        let (docker, advance_party) = {
            let mut advance_parties = self.advance_parties.lock();
            let party = advance_parties.entry(pair).or_default();
            party.push(Bytes::copy_from_slice(data));

            match self.docker_factory.create_docker(connection, party, self.delegate.clone()) {
                Some(docker) => {
                    let party = advance_parties.remove(&pair).unwrap_or_default();
                    (self.register_docker(connection, docker), party)
                }
                None => {
                    trace!("undecided docker kind for {:?} - buffering {} bytes", pair, data.len());
                    return;
                }
            }
        };

        for chunk in advance_party {
            docker.process_received(&chunk, now);
        }
    }
}
