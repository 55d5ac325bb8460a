//! MTP is the packet protocol with transaction ids: every message gets an SN, is split into
//!  MTU-sized fragments if necessary, and every fragment is acknowledged by the peer.
//!
//! The same framing works on datagrams (one package per datagram) and on streams, where a
//!  reader resynchronizes on the magic bytes after garbage.

pub mod header;
pub mod package;
pub mod ship;
