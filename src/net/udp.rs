use std::io;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};
use crate::net::channel::{Channel, ChannelFactory};

/// A [Channel] on a UDP socket. A 'connected' channel talks to a single peer, an unconnected one
///  receives from and sends to anyone - that is the typical server side.
///
/// All I/O goes through tokio's non-blocking `try_*` operations, so channels must be created in
///  the context of a tokio runtime.
pub struct PacketChannel {
    socket: RwLock<Option<UdpSocket>>,
    local: SocketAddr,
    remote: Option<SocketAddr>,
}

impl PacketChannel {
    pub fn bind(local: SocketAddr) -> anyhow::Result<PacketChannel> {
        let socket = Self::new_socket(local)?;
        let socket = UdpSocket::from_std(socket.into())?;
        let local = socket.local_addr()?;
        info!("bound UDP socket to {:?}", local);

        Ok(PacketChannel {
            socket: RwLock::new(Some(socket)),
            local,
            remote: None,
        })
    }

    pub fn connect(remote: SocketAddr, local: Option<SocketAddr>) -> anyhow::Result<PacketChannel> {
        let local = local.unwrap_or_else(|| match remote {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        });
        let socket = Self::new_socket(local)?;
        socket.connect(&remote.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        let local = socket.local_addr()?;
        debug!("connected UDP socket {:?} -> {:?}", local, remote);

        Ok(PacketChannel {
            socket: RwLock::new(Some(socket)),
            local,
            remote: Some(remote),
        })
    }

    fn new_socket(local: SocketAddr) -> anyhow::Result<Socket> {
        //TODO "don't fragment" flag
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&local.into())?;
        Ok(socket)
    }
}

impl Channel for PacketChannel {
    fn is_open(&self) -> bool {
        self.socket.read().is_some()
    }

    fn is_bound(&self) -> bool {
        self.is_open()
    }

    fn is_connected(&self) -> bool {
        self.is_open() && self.remote.is_some()
    }

    fn is_vacant(&self) -> bool {
        self.is_open()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let result = match self.socket.read().as_ref() {
            Some(socket) => socket.try_recv_from(buf),
            None => return Err(ErrorKind::NotConnected.into()),
        };
        match result {
            Ok((n, from)) => {
                trace!("received {} bytes from {:?}", n, from);
                Ok(Some((n, from)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        let guard = self.socket.read();
        let socket = match guard.as_ref() {
            Some(socket) => socket,
            None => return Err(ErrorKind::NotConnected.into()),
        };

        let result = if self.remote.is_some() {
            socket.try_send(data)
        }
        else {
            socket.try_send_to(data, target)
        };
        match result {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn close(&self) {
        if self.socket.write().take().is_some() {
            debug!("closed UDP socket {:?}", self.local);
        }
    }
}


/// Opens a connected [PacketChannel] per remote address
#[derive(Default)]
pub struct UdpConnector {}

impl ChannelFactory for UdpConnector {
    fn open_channel(&self, remote: SocketAddr, local: Option<SocketAddr>) -> anyhow::Result<Arc<dyn Channel>> {
        Ok(Arc::new(PacketChannel::connect(remote, local)?))
    }
}
