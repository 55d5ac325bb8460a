use std::sync::Arc;
use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};
use crate::config::StarTrekConfig;
use crate::mtp::header::DataType;
use crate::mtp::package::{Package, Parsed};
use crate::mtp::ship::{PacketArrival, PacketDeparture};
use crate::port::{ArrivalCheck, Protocol};
use crate::ship::{Priority, TransactionId, PRIORITY_SLOWER, PRIORITY_URGENT};

pub const PING: &[u8] = b"PING";
pub const PONG: &[u8] = b"PONG";
pub const NOOP: &[u8] = b"NOOP";
pub const OK: &[u8] = b"OK";

/// The MTP wire format. On datagram transports, every read is a whole number of packages and
///  anything left over is dropped; on streams, an incomplete tail waits for more data.
pub struct PacketProtocol {
    config: Arc<StarTrekConfig>,
    datagram: bool,
}

impl PacketProtocol {
    pub fn new(config: Arc<StarTrekConfig>, datagram: bool) -> PacketProtocol {
        PacketProtocol { config, datagram }
    }

    fn departure(&self, package: Package, priority: Priority) -> PacketDeparture {
        PacketDeparture::new(package, priority, &self.config)
    }

    fn respond(&self, request: &Package, body: &'static [u8]) -> PacketDeparture {
        self.departure(Package::response(request.header(), Bytes::from_static(body)), PRIORITY_URGENT)
    }
}

impl Protocol for PacketProtocol {
    type Arrival = PacketArrival;
    type Departure = PacketDeparture;

    fn parse(&self, cache: &mut BytesMut) -> Vec<PacketArrival> {
        let mut result = Vec::new();
        while !cache.is_empty() {
            match Package::parse(cache) {
                Parsed::Complete(package, len) => {
                    trace!("received {:?}", package);
                    cache.advance(len);
                    result.push(PacketArrival::new(package, &self.config));
                }
                Parsed::Incomplete => {
                    if self.datagram {
                        debug!("dropping {} bytes of truncated datagram", cache.len());
                        cache.clear();
                    }
                    break;
                }
                Parsed::Invalid(e) => {
                    let skip = Package::next_candidate(cache);
                    warn!("skipping {} bytes of garbage: {}", skip, e);
                    cache.advance(skip);
                }
            }
        }
        result
    }

    fn check_arrival(&self, arrival: PacketArrival) -> ArrivalCheck<PacketArrival, PacketDeparture> {
        let head = arrival.head();
        match head.data_type() {
            DataType::Command => {
                let reply = match head.body().as_ref() {
                    PING => Some(self.respond(head, PONG)),
                    NOOP => Some(self.respond(head, OK)),
                    other => {
                        debug!("ignoring unsupported command {:?}", String::from_utf8_lossy(other));
                        None
                    }
                };
                ArrivalCheck { deliver: None, replies: reply.into_iter().collect() }
            }
            DataType::CommandResponse | DataType::MessageResponse => {
                // the acknowledgement was applied to the departure hall already
                ArrivalCheck::swallow()
            }
            DataType::Message | DataType::MessageFragment => {
                let reply = self.respond(head, OK);
                ArrivalCheck::deliver_and_reply(arrival, reply)
            }
        }
    }

    fn pack(&self, payload: Bytes, priority: Priority) -> PacketDeparture {
        self.departure(Package::message(TransactionId::generate(), payload), priority)
    }

    fn heartbeat(&self) -> PacketDeparture {
        self.departure(Package::command(TransactionId::generate(), Bytes::from_static(PING)), PRIORITY_SLOWER)
    }
}
