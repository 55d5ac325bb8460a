use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::{debug, trace};
use crate::net::channel::{Channel, ChannelFactory};

/// A [Channel] on a TCP stream. All I/O goes through tokio's non-blocking `try_*` operations,
///  so the stream must be registered with a tokio runtime.
pub struct StreamChannel {
    stream: RwLock<Option<TcpStream>>,
    local: Option<SocketAddr>,
    remote: SocketAddr,
}

impl StreamChannel {
    pub fn new(stream: TcpStream) -> anyhow::Result<StreamChannel> {
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(StreamChannel {
            stream: RwLock::new(Some(stream)),
            local,
            remote,
        })
    }

    /// Connects to `remote`, optionally binding to a given local address first. This blocks for
    ///  at most `timeout`, and it must be called in the context of a tokio runtime. Outside a
    ///  runtime it fails without touching the network.
    pub fn connect(remote: SocketAddr, local: Option<SocketAddr>, timeout: Duration) -> anyhow::Result<StreamChannel> {
        Handle::try_current()
            .map_err(|e| anyhow!("connecting to {:?} requires a tokio runtime: {}", remote, e))?;

        let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
        if let Some(local) = local {
            socket.set_reuse_address(true)?;
            socket.bind(&local.into())?;
        }
        socket.connect_timeout(&remote.into(), timeout)?;
        socket.set_nonblocking(true)?;

        let stream = TcpStream::from_std(socket.into())?;
        debug!("connected TCP stream {:?} -> {:?}", stream.local_addr().ok(), remote);
        Self::new(stream)
    }
}

impl Channel for StreamChannel {
    fn is_open(&self) -> bool {
        self.stream.read().is_some()
    }

    fn is_bound(&self) -> bool {
        self.is_open() && self.local.is_some()
    }

    fn is_connected(&self) -> bool {
        self.is_open()
    }

    fn is_vacant(&self) -> bool {
        self.is_open()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let result = match self.stream.read().as_ref() {
            Some(stream) => stream.try_read(buf),
            None => return Err(ErrorKind::NotConnected.into()),
        };

        match result {
            Ok(0) => {
                debug!("TCP stream from {:?} was closed by the peer", self.remote);
                self.close();
                Err(io::Error::new(ErrorKind::UnexpectedEof, "stream closed by peer"))
            }
            Ok(n) => {
                trace!("read {} bytes from {:?}", n, self.remote);
                Ok(Some((n, self.remote)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send(&self, data: &[u8], _target: SocketAddr) -> io::Result<usize> {
        match self.stream.read().as_ref() {
            Some(stream) => match stream.try_write(data) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(e),
            },
            None => Err(ErrorKind::NotConnected.into()),
        }
    }

    fn close(&self) {
        if self.stream.write().take().is_some() {
            debug!("closed TCP stream to {:?}", self.remote);
        }
    }
}


/// Opens a [StreamChannel] per remote address
pub struct TcpConnector {
    connect_timeout: Duration,
}
impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> TcpConnector {
        TcpConnector { connect_timeout }
    }
}

impl ChannelFactory for TcpConnector {
    /// Blocks the calling thread until the connection is established or `connect_timeout` has
    ///  passed. The caller must be inside a tokio runtime, preferably on a thread where blocking
    ///  is acceptable (e.g. via `spawn_blocking` or a multi-threaded runtime).
    fn open_channel(&self, remote: SocketAddr, local: Option<SocketAddr>) -> anyhow::Result<Arc<dyn Channel>> {
        Ok(Arc::new(StreamChannel::connect(remote, local, self.connect_timeout)?))
    }
}
