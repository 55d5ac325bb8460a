use std::collections::VecDeque;
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use bytes::Bytes;
use parking_lot::Mutex;
use crate::net::channel::{Channel, ChannelFactory};

/// A [Channel] that keeps inbound and outbound data in memory. Data 'sent' on one memory channel
///  can be fed into another with [MemoryChannel::push_inbound], which allows wiring up peers in
///  tests without any real I/O.
#[derive(Debug)]
pub struct MemoryChannel {
    local: SocketAddr,
    remote: Option<SocketAddr>,
    open: AtomicBool,
    inbound: Mutex<VecDeque<(Bytes, SocketAddr)>>,
    outbound: Mutex<Vec<(Bytes, SocketAddr)>>,
    /// the maximum number of bytes accepted by a single send, for simulating full buffers
    send_limit: Mutex<Option<usize>>,
}

impl MemoryChannel {
    /// an unconnected channel, like a server-side UDP socket
    pub fn bound(local: SocketAddr) -> MemoryChannel {
        Self::new(local, None)
    }

    pub fn connected(local: SocketAddr, remote: SocketAddr) -> MemoryChannel {
        Self::new(local, Some(remote))
    }

    fn new(local: SocketAddr, remote: Option<SocketAddr>) -> MemoryChannel {
        MemoryChannel {
            local,
            remote,
            open: AtomicBool::new(true),
            inbound: Default::default(),
            outbound: Default::default(),
            send_limit: Default::default(),
        }
    }

    pub fn push_inbound(&self, data: impl Into<Bytes>, from: SocketAddr) {
        self.inbound.lock().push_back((data.into(), from));
    }

    /// returns and forgets everything that was sent so far
    pub fn take_outbound(&self) -> Vec<(Bytes, SocketAddr)> {
        std::mem::take(&mut *self.outbound.lock())
    }

    pub fn set_send_limit(&self, limit: Option<usize>) {
        *self.send_limit.lock() = limit;
    }
}

impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
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
        if !self.is_open() {
            return Err(ErrorKind::NotConnected.into());
        }
        Ok(self.inbound.lock()
            .pop_front()
            .map(|(data, from)| {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                (n, from)
            }))
    }

    fn send(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        if !self.is_open() {
            return Err(ErrorKind::NotConnected.into());
        }
        let n = match *self.send_limit.lock() {
            Some(limit) => data.len().min(limit),
            None => data.len(),
        };
        if n > 0 {
            self.outbound.lock().push((Bytes::copy_from_slice(&data[..n]), self.remote.unwrap_or(target)));
        }
        Ok(n)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// A [ChannelFactory] that opens connected [MemoryChannel]s and keeps them for inspection
#[derive(Debug)]
pub struct MemoryConnector {
    local: SocketAddr,
    opened: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnector {
    pub fn new(local: SocketAddr) -> MemoryConnector {
        MemoryConnector {
            local,
            opened: Default::default(),
        }
    }

    /// all channels opened so far, oldest first
    pub fn opened(&self) -> Vec<Arc<MemoryChannel>> {
        self.opened.lock().clone()
    }
}

impl ChannelFactory for MemoryConnector {
    fn open_channel(&self, remote: SocketAddr, _local: Option<SocketAddr>) -> anyhow::Result<Arc<dyn Channel>> {
        let channel = Arc::new(MemoryChannel::connected(self.local, remote));
        self.opened.lock().push(channel.clone());
        Ok(channel)
    }
}
