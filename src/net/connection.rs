use std::fmt::{Debug, Formatter};
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::StarTrekConfig;
use crate::net::address::SocketPair;
use crate::net::channel::Channel;
use crate::net::state::{ConnectionState, Liveness, StateChange, StateMachine};

#[derive(Debug, Default, Clone, Copy)]
struct Timestamps {
    last_sent: Option<Instant>,
    last_received: Option<Instant>,
}

/// A connection is the logical association between a local and a remote address, on top of a
///  [Channel]. It tracks traffic timestamps and derives its [ConnectionState] from them.
///
/// I/O errors are not passed on as such: A channel that fails is closed, and the connection's
///  state machine moves to [ConnectionState::Error] on the next tick.
pub struct Connection {
    config: Arc<StarTrekConfig>,
    remote: SocketAddr,
    local: Option<SocketAddr>,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    timestamps: Mutex<Timestamps>,
    fsm: Mutex<StateMachine<ConnectionState>>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{:?}", self.socket_pair())
    }
}

impl Connection {
    pub fn new(config: Arc<StarTrekConfig>, remote: SocketAddr, local: Option<SocketAddr>, channel: Option<Arc<dyn Channel>>, now: Instant) -> Connection {
        Connection {
            config,
            remote,
            local,
            channel: RwLock::new(channel),
            timestamps: Default::default(),
            fsm: Mutex::new(StateMachine::new(ConnectionState::Default, now)),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn socket_pair(&self) -> SocketPair {
        SocketPair::new(self.remote, self.local)
    }

    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.read().clone()
    }

    /// Replaces the underlying channel. The previous channel is closed if it is owned by this
    ///  connection alone, i.e. if it is connected to this connection's remote address.
    pub fn set_channel(&self, channel: Option<Arc<dyn Channel>>) {
        let previous = std::mem::replace(&mut *self.channel.write(), channel.clone());
        if let Some(previous) = previous {
            let same = channel.as_ref().is_some_and(|c| Arc::ptr_eq(c, &previous));
            if !same && previous.remote_addr() == Some(self.remote) {
                previous.close();
            }
        }
    }

    /// Takes over a fresh channel after the previous one failed. A connection in error state
    ///  starts over from [ConnectionState::Default]: the error belonged to the old channel.
    pub fn reconnect(&self, channel: Arc<dyn Channel>, now: Instant) {
        self.set_channel(Some(channel));
        let mut fsm = self.fsm.lock();
        if fsm.current() == ConnectionState::Error {
            debug!("{:?}: reconnected, leaving error state", self);
            *fsm = StateMachine::new(ConnectionState::Default, now);
        }
    }

    pub fn is_bound(&self) -> bool {
        self.channel().is_some_and(|c| c.is_bound())
    }

    pub fn is_connected(&self) -> bool {
        self.channel().is_some_and(|c| c.is_connected())
    }

    /// `true` if data can be sent right now
    pub fn is_vacant(&self) -> bool {
        self.channel().is_some_and(|c| c.is_vacant())
    }

    pub fn state(&self) -> ConnectionState {
        self.fsm.lock().current()
    }

    pub fn last_sent_time(&self) -> Option<Instant> {
        self.timestamps.lock().last_sent
    }

    /// Sends (a prefix of) `data` to the remote address, returning the number of bytes that were
    ///  written. Failing channels are closed before the error is returned.
    pub fn send(&self, data: &[u8], now: Instant) -> io::Result<usize> {
        let channel = match self.channel() {
            Some(c) => c,
            None => return Err(ErrorKind::NotConnected.into()),
        };

        match channel.send(data, self.remote) {
            Ok(n) => {
                trace!("{:?}: sent {} of {} bytes", self, n, data.len());
                if n > 0 {
                    self.timestamps.lock().last_sent = Some(now);
                }
                Ok(n)
            }
            Err(e) => {
                warn!("{:?}: error sending data: {}", self, e);
                // a shared server-side channel must survive a single peer's failure
                if channel.remote_addr() == Some(self.remote) {
                    channel.close();
                }
                Err(e)
            }
        }
    }

    /// to be called for every piece of data that was read on behalf of this connection
    pub fn on_received(&self, now: Instant) {
        self.timestamps.lock().last_received = Some(now);
    }

    pub fn tick(&self, now: Instant) -> Option<StateChange<ConnectionState>> {
        let change = self.fsm.lock().tick(self, now)?;
        debug!("{:?}: {:?} -> {:?}", self, change.previous, change.current);

        if change.current == ConnectionState::Ready && change.previous != ConnectionState::Maintaining {
            // a fresh connection starts out 'just expired' rather than 'long dead'
            let just_expired = now.checked_sub(self.config.connection_expires + Duration::from_secs(1));
            let mut timestamps = self.timestamps.lock();
            timestamps.last_sent = just_expired;
            timestamps.last_received = just_expired;
        }
        Some(change)
    }

    /// A connection is dead when it is in an error state, and was for longer than the grace
    ///  period. Dead connections are evicted from the hub.
    pub fn is_dead(&self, now: Instant) -> bool {
        let fsm = self.fsm.lock();
        fsm.current() == ConnectionState::Error
            && now.saturating_duration_since(fsm.entered()) > self.config.connection_dying_grace
    }

    pub fn close(&self) {
        if let Some(channel) = self.channel.write().take() {
            if channel.remote_addr() == Some(self.remote) {
                channel.close();
            }
        }
    }
}

impl Liveness for Connection {
    fn is_open(&self) -> bool {
        self.channel().is_some_and(|c| c.is_open())
    }

    fn is_alive(&self) -> bool {
        self.channel().is_some_and(|c| c.is_open() && (c.is_connected() || c.is_bound()))
    }

    fn is_sent_recently(&self, now: Instant) -> bool {
        self.timestamps.lock().last_sent
            .is_some_and(|t| now < t + self.config.connection_expires)
    }

    fn is_received_recently(&self, now: Instant) -> bool {
        self.timestamps.lock().last_received
            .is_some_and(|t| now < t + self.config.connection_expires)
    }

    fn is_not_received_long_time_ago(&self, now: Instant) -> bool {
        match self.timestamps.lock().last_received {
            Some(t) => now > t + self.config.connection_long_time_ago(),
            None => false,
        }
    }

    fn last_received_time(&self) -> Option<Instant> {
        self.timestamps.lock().last_received
    }
}
