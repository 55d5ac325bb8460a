use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use anyhow::anyhow;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::config::StarTrekConfig;
use crate::net::address::AddressPairMap;
use crate::net::channel::{Channel, ChannelFactory};
use crate::net::connection::Connection;
use crate::net::state::ConnectionState;
#[cfg(test)] use mockall::automock;

/// Callbacks from the [Hub] to whoever owns the connections' content (typically the gate)
#[cfg_attr(test, automock)]
pub trait ConnectionDelegate: Send + Sync + 'static {
    fn on_connection_state_changed(&self, previous: ConnectionState, current: ConnectionState, connection: &Arc<Connection>);

    fn on_connection_received(&self, data: &[u8], connection: &Arc<Connection>, now: Instant);
}

/// The hub owns channels and connections. It reads from all channels, attributing incoming data
///  to (and creating on demand) a connection per remote address, and it drives the connections'
///  state machines.
///
/// Callbacks to the delegate happen without any of the hub's locks held, so the delegate is free
///  to call back into the hub.
pub struct Hub {
    config: Arc<StarTrekConfig>,
    factory: Option<Arc<dyn ChannelFactory>>,
    delegate: Weak<dyn ConnectionDelegate>,
    channels: RwLock<Vec<Arc<dyn Channel>>>,
    connections: RwLock<AddressPairMap<Arc<Connection>>>,
}

impl Hub {
    pub fn new(config: Arc<StarTrekConfig>, factory: Option<Arc<dyn ChannelFactory>>, delegate: Weak<dyn ConnectionDelegate>) -> Hub {
        Hub {
            config,
            factory,
            delegate,
            channels: Default::default(),
            connections: Default::default(),
        }
    }

    /// Registers a channel for reading. A connected channel (e.g. an accepted TCP stream) gets
    ///  its connection right away.
    pub fn bind_channel(&self, channel: Arc<dyn Channel>, now: Instant) {
        debug!("binding channel {:?} <- {:?}", channel.local_addr(), channel.remote_addr());
        self.channels.write().push(channel.clone());

        if let Some(remote) = channel.remote_addr() {
            let connection = self.get_or_create_connection(remote, channel.local_addr(), &channel, now);
            if !connection.channel().is_some_and(|c| Arc::ptr_eq(&c, &channel)) {
                connection.set_channel(Some(channel));
            }
        }
    }

    pub fn connection(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Option<Arc<Connection>> {
        self.connections.read().get(remote, local).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Returns the connection to `remote`, opening a new one if necessary. A new connection uses
    ///  a bound channel for `local` if there is one, and a channel from the factory otherwise.
    ///  A cached connection whose channel was closed gets a fresh channel the same way.
    ///
    /// Opening a stream channel through the factory blocks the caller for up to the configured
    ///  `connect_timeout`, and it has to happen inside a tokio runtime.
    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>, now: Instant) -> anyhow::Result<Arc<Connection>> {
        if let Some(connection) = self.connection(remote, local) {
            if connection.channel().is_some_and(|c| c.is_open()) {
                return Ok(connection);
            }
            let channel = self.open_channel(remote, local)?;
            info!("reconnecting {:?}", connection);
            connection.reconnect(channel, now);
            return Ok(connection);
        }

        let channel = self.open_channel(remote, local)?;
        Ok(self.get_or_create_connection(remote, local.or(channel.local_addr()), &channel, now))
    }

    fn open_channel(&self, remote: SocketAddr, local: Option<SocketAddr>) -> anyhow::Result<Arc<dyn Channel>> {
        if let Some(channel) = self.find_channel(remote, local) {
            return Ok(channel);
        }

        let factory = self.factory.as_ref()
            .ok_or_else(|| anyhow!("no channel to {:?} and no way to open one", remote))?;
        let channel = factory.open_channel(remote, local)?;
        info!("opened channel {:?} -> {:?}", channel.local_addr(), remote);
        self.channels.write().push(channel.clone());
        Ok(channel)
    }

    /// Removes the connection, closing its channel if it is not shared
    pub fn disconnect(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Option<Arc<Connection>> {
        let connection = self.connections.write().remove(remote, local)?;
        debug!("disconnecting {:?}", connection);
        connection.close();
        Some(connection)
    }

    fn find_channel(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Option<Arc<dyn Channel>> {
        let channels = self.channels.read();
        let open = || channels.iter().filter(|c| c.is_open());

        if let Some(c) = open().find(|c| c.remote_addr() == Some(remote) && (local.is_none() || c.local_addr() == local)) {
            return Some(c.clone());
        }
        open()
            .filter(|c| c.remote_addr().is_none())
            .filter(|c| local.is_none() || c.local_addr() == local)
            .find(|c| c.local_addr().is_some_and(|l| l.is_ipv4() == remote.is_ipv4()))
            .cloned()
    }

    fn get_or_create_connection(&self, remote: SocketAddr, local: Option<SocketAddr>, channel: &Arc<dyn Channel>, now: Instant) -> Arc<Connection> {
        if let Some(connection) = self.connection(remote, local) {
            return connection;
        }

        let mut connections = self.connections.write();
        if let Some(connection) = connections.get(remote, local) {
            return connection.clone();
        }
        let connection = Arc::new(Connection::new(self.config.clone(), remote, local, Some(channel.clone()), now));
        debug!("new connection {:?}", connection);
        connections.insert(remote, local, connection.clone());
        connection
    }

    /// Reads from all channels, passing the data on to the delegate. Returns `true` if anything
    ///  was read.
    pub fn process(&self, now: Instant) -> bool {
        let channels = self.channels.read().clone();
        let mut buf = vec![0u8; self.config.receive_buffer_size];

        let mut received_any = false;
        for channel in channels {
            if self.drive_channel(&channel, &mut buf, now) {
                received_any = true;
            }
        }
        received_any
    }

    fn drive_channel(&self, channel: &Arc<dyn Channel>, buf: &mut [u8], now: Instant) -> bool {
        if !channel.is_open() {
            return false;
        }

        let mut received_any = false;
        for _ in 0..self.config.max_reads_per_tick {
            match channel.receive(buf) {
                Ok(Some((n, from))) => {
                    trace!("received {} bytes from {:?}", n, from);
                    received_any = true;

                    let connection = self.get_or_create_connection(from, channel.local_addr(), channel, now);
                    connection.on_received(now);
                    match self.delegate.upgrade() {
                        Some(delegate) => delegate.on_connection_received(&buf[..n], &connection, now),
                        None => warn!("no delegate for received data - dropping"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("error reading from channel {:?} <- {:?}, closing: {}", channel.local_addr(), channel.remote_addr(), e);
                    channel.close();
                    break;
                }
            }
        }
        received_any
    }

    /// Advances all connections' state machines, and evicts connections that are dead past the
    ///  grace period
    pub fn tick(&self, now: Instant) {
        let delegate = self.delegate.upgrade();
        for connection in self.connections() {
            if let Some(change) = connection.tick(now) {
                if let Some(delegate) = &delegate {
                    delegate.on_connection_state_changed(change.previous, change.current, &connection);
                }
            }
        }
        self.reap(now);
    }

    fn reap(&self, now: Instant) {
        let mut dead = Vec::new();
        self.connections.write().retain(|_, connection| {
            if connection.is_dead(now) {
                dead.push(connection.clone());
                false
            }
            else {
                true
            }
        });
        for connection in dead {
            info!("evicting dead connection {:?}", connection);
            connection.close();
        }

        let connections = self.connections.read();
        self.channels.write().retain(|c| {
            c.is_open() || connections.values().any(|conn| conn.channel().is_some_and(|cc| Arc::ptr_eq(&cc, c)))
        });
    }

    /// closes all connections and channels
    pub fn close(&self) {
        let connections = std::mem::take(&mut *self.connections.write());
        for connection in connections.values() {
            connection.close();
        }
        for channel in std::mem::take(&mut *self.channels.write()) {
            channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use parking_lot::Mutex;
    use crate::net::channel::MockChannel;
    use crate::test_util::channel::MemoryConnector;
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn server_channel(reads: Vec<(Vec<u8>, SocketAddr)>) -> MockChannel {
        let mut channel = MockChannel::new();
        channel.expect_is_open().return_const(true);
        channel.expect_is_bound().return_const(true);
        channel.expect_is_connected().return_const(false);
        channel.expect_is_vacant().return_const(true);
        channel.expect_remote_addr().return_const(None);
        channel.expect_local_addr().return_const(Some(addr(9394)));

        let reads = Mutex::new(reads.into_iter());
        channel.expect_receive().returning(move |buf| {
            match reads.lock().next() {
                Some((data, from)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(Some((data.len(), from)))
                }
                None => Ok(None),
            }
        });
        channel
    }

    #[test]
    fn test_process_creates_connection_per_remote() {
        let now = Instant::now();
        let channel = server_channel(vec![
            (b"a".to_vec(), addr(1)),
            (b"b".to_vec(), addr(2)),
            (b"c".to_vec(), addr(1)),
        ]);

        let received = Arc::new(Mutex::new(Vec::new()));
        let mut delegate = MockConnectionDelegate::new();
        let r = received.clone();
        delegate.expect_on_connection_received()
            .times(3)
            .returning(move |data, conn, _| r.lock().push((data.to_vec(), conn.remote_addr())));
        let delegate: Arc<dyn ConnectionDelegate> = Arc::new(delegate);

        let hub = Hub::new(Arc::new(StarTrekConfig::default()), None, Arc::downgrade(&delegate));
        hub.bind_channel(Arc::new(channel), now);

        assert!(hub.process(now));
        assert!(!hub.process(now));

        assert_eq!(*received.lock(), vec![
            (b"a".to_vec(), addr(1)),
            (b"b".to_vec(), addr(2)),
            (b"c".to_vec(), addr(1)),
        ]);
        assert_eq!(hub.connections().len(), 2);

        let conn = hub.connection(addr(1), None).unwrap();
        assert_eq!(conn.local_addr(), Some(addr(9394)));
        assert!(Arc::ptr_eq(&conn, &hub.connection(addr(1), Some(addr(9394))).unwrap()));
    }

    #[test]
    fn test_reads_per_tick_are_bounded() {
        let now = Instant::now();
        let channel = server_channel((0..10).map(|i| (vec![i], addr(1))).collect());

        let mut delegate = MockConnectionDelegate::new();
        delegate.expect_on_connection_received().times(10).return_const(());
        let delegate: Arc<dyn ConnectionDelegate> = Arc::new(delegate);

        let mut config = StarTrekConfig::default();
        config.max_reads_per_tick = 4;
        let hub = Hub::new(Arc::new(config), None, Arc::downgrade(&delegate));
        hub.bind_channel(Arc::new(channel), now);

        assert!(hub.process(now));
        assert!(hub.process(now));
        assert!(hub.process(now));
        assert!(!hub.process(now));
    }

    #[test]
    fn test_read_error_closes_channel() {
        let now = Instant::now();
        let open = Arc::new(AtomicBool::new(true));

        let mut channel = MockChannel::new();
        let o = open.clone();
        channel.expect_is_open().returning(move || o.load(Ordering::Acquire));
        channel.expect_remote_addr().return_const(None);
        channel.expect_local_addr().return_const(Some(addr(9394)));
        channel.expect_receive().times(1).returning(|_| Err(std::io::ErrorKind::ConnectionReset.into()));
        let o = open.clone();
        channel.expect_close().times(1).returning(move || o.store(false, Ordering::Release));

        let delegate: Arc<dyn ConnectionDelegate> = Arc::new(MockConnectionDelegate::new());
        let hub = Hub::new(Arc::new(StarTrekConfig::default()), None, Arc::downgrade(&delegate));
        hub.bind_channel(Arc::new(channel), now);

        assert!(!hub.process(now));
        assert!(!hub.process(now));
    }

    #[test]
    fn test_tick_reports_state_changes_and_reaps() {
        let t0 = Instant::now();
        let open = Arc::new(AtomicBool::new(true));

        let mut channel = MockChannel::new();
        let o = open.clone();
        channel.expect_is_open().returning(move || o.load(Ordering::Acquire));
        let o = open.clone();
        channel.expect_is_connected().returning(move || o.load(Ordering::Acquire));
        channel.expect_is_bound().return_const(true);
        channel.expect_remote_addr().return_const(Some(addr(1)));
        channel.expect_local_addr().return_const(Some(addr(9394)));
        channel.expect_receive().returning(|_| Ok(None));
        let o = open.clone();
        channel.expect_close().returning(move || o.store(false, Ordering::Release));

        let changes = Arc::new(Mutex::new(Vec::new()));
        let mut delegate = MockConnectionDelegate::new();
        let c = changes.clone();
        delegate.expect_on_connection_state_changed()
            .returning(move |prev, cur, _| c.lock().push((prev, cur)));
        let delegate: Arc<dyn ConnectionDelegate> = Arc::new(delegate);

        let mut config = StarTrekConfig::default();
        config.connection_dying_grace = Duration::from_secs(10);
        let hub = Hub::new(Arc::new(config), None, Arc::downgrade(&delegate));
        hub.bind_channel(Arc::new(channel), t0);
        assert_eq!(hub.connections().len(), 1);

        hub.tick(t0);
        hub.tick(t0);
        open.store(false, Ordering::Release);
        hub.tick(t0);
        assert_eq!(*changes.lock(), vec![
            (ConnectionState::Default, ConnectionState::Preparing),
            (ConnectionState::Preparing, ConnectionState::Ready),
            (ConnectionState::Ready, ConnectionState::Error),
        ]);

        hub.tick(t0 + Duration::from_secs(10));
        assert_eq!(hub.connections().len(), 1);
        hub.tick(t0 + Duration::from_secs(11));
        assert!(hub.connections().is_empty());
        assert!(hub.connection(addr(1), None).is_none());
    }

    #[test]
    fn test_connect_uses_factory() {
        struct Factory {
            opened: Mutex<Vec<SocketAddr>>,
        }
        impl ChannelFactory for Factory {
            fn open_channel(&self, remote: SocketAddr, _local: Option<SocketAddr>) -> anyhow::Result<Arc<dyn Channel>> {
                self.opened.lock().push(remote);
                let mut channel = MockChannel::new();
                channel.expect_is_open().return_const(true);
                channel.expect_remote_addr().return_const(Some(remote));
                channel.expect_local_addr().return_const(Some(addr(5555)));
                Ok(Arc::new(channel))
            }
        }

        let now = Instant::now();
        let factory = Arc::new(Factory { opened: Mutex::new(Vec::new()) });
        let delegate: Arc<dyn ConnectionDelegate> = Arc::new(MockConnectionDelegate::new());
        let hub = Hub::new(Arc::new(StarTrekConfig::default()), Some(factory.clone()), Arc::downgrade(&delegate));

        let conn = hub.connect(addr(1), None, now).unwrap();
        assert_eq!(conn.local_addr(), Some(addr(5555)));
        let again = hub.connect(addr(1), None, now).unwrap();
        assert!(Arc::ptr_eq(&conn, &again));
        assert_eq!(*factory.opened.lock(), vec![addr(1)]);

        let without_factory = Hub::new(Arc::new(StarTrekConfig::default()), None, Arc::downgrade(&delegate));
        assert!(without_factory.connect(addr(1), None, now).is_err());
    }

    fn connector_hub(connector: &Arc<MemoryConnector>, delegate: &Arc<dyn ConnectionDelegate>) -> Hub {
        let factory: Arc<dyn ChannelFactory> = connector.clone();
        Hub::new(Arc::new(StarTrekConfig::default()), Some(factory), Arc::downgrade(delegate))
    }

    #[test]
    fn test_connect_reopens_closed_channel() {
        let t0 = Instant::now();
        let connector = Arc::new(MemoryConnector::new(addr(5555)));
        let mut delegate = MockConnectionDelegate::new();
        delegate.expect_on_connection_state_changed().return_const(());
        let delegate: Arc<dyn ConnectionDelegate> = Arc::new(delegate);
        let hub = connector_hub(&connector, &delegate);

        let conn = hub.connect(addr(1), None, t0).unwrap();
        hub.tick(t0);
        hub.tick(t0);
        assert_eq!(conn.state(), ConnectionState::Ready);

        connector.opened()[0].close();
        hub.tick(t0);
        assert_eq!(conn.state(), ConnectionState::Error);

        let t1 = t0 + Duration::from_secs(1);
        let again = hub.connect(addr(1), None, t1).unwrap();
        assert!(Arc::ptr_eq(&conn, &again));
        assert_eq!(conn.state(), ConnectionState::Default);

        let opened = connector.opened();
        assert_eq!(opened.len(), 2);
        let fresh: Arc<dyn Channel> = opened[1].clone();
        assert!(Arc::ptr_eq(&conn.channel().unwrap(), &fresh));

        hub.tick(t1);
        assert_eq!(conn.state(), ConnectionState::Preparing);
        assert!(Arc::ptr_eq(&hub.connect(addr(1), None, t1).unwrap(), &conn));
        assert_eq!(connector.opened().len(), 2);
    }

    #[test]
    fn test_disconnect() {
        let now = Instant::now();
        let connector = Arc::new(MemoryConnector::new(addr(5555)));
        let delegate: Arc<dyn ConnectionDelegate> = Arc::new(MockConnectionDelegate::new());
        let hub = connector_hub(&connector, &delegate);

        let conn = hub.connect(addr(1), None, now).unwrap();
        let removed = hub.disconnect(addr(1), None).unwrap();
        assert!(Arc::ptr_eq(&conn, &removed));
        assert!(conn.channel().is_none());
        assert!(!connector.opened()[0].is_open());
        assert!(hub.connection(addr(1), None).is_none());
        assert!(hub.disconnect(addr(1), None).is_none());
    }
}
