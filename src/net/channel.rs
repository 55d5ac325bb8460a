use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
#[cfg(test)] use mockall::automock;

/// This is the contract for the socket-like primitive below a [crate::net::connection::Connection],
///  introduced to decouple connection handling from actual I/O and to facilitate mocking.
///
/// All operations are non-blocking: They take effect immediately or report that they could not.
#[cfg_attr(test, automock)]
pub trait Channel: Send + Sync + 'static {
    fn is_open(&self) -> bool;
    fn is_bound(&self) -> bool;
    fn is_connected(&self) -> bool;

    /// `true` if the channel can take data right now
    fn is_vacant(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Reads whatever is available, returning the number of bytes and the sender's address.
    ///  `Ok(None)` means there is nothing to read right now; a channel closed by the peer is
    ///  reported as an error.
    fn receive(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Writes (a prefix of) `data`, returning the number of bytes that were actually accepted.
    ///  This may be less than `data.len()`, including zero if the channel's buffers are full.
    fn send(&self, data: &[u8], target: SocketAddr) -> io::Result<usize>;

    fn close(&self);
}

/// Opens channels for outbound connections
pub trait ChannelFactory: Send + Sync + 'static {
    fn open_channel(&self, remote: SocketAddr, local: Option<SocketAddr>) -> anyhow::Result<Arc<dyn Channel>>;
}
