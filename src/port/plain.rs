use std::sync::Arc;
use bytes::{Bytes, BytesMut};
use tracing::trace;
use crate::config::StarTrekConfig;
use crate::port::{ArrivalCheck, Protocol};
use crate::ship::plain::{PlainArrival, PlainDeparture};
use crate::ship::{Arrival, Priority, PRIORITY_SLOWER, PRIORITY_URGENT};

pub const PING: &[u8] = b"PING";
pub const PONG: &[u8] = b"PONG";
pub const NOOP: &[u8] = b"NOOP";

/// Unframed data: whatever is read is delivered as it is, and whatever is sent is written as it
///  is. The only protocol on top is a keep-alive, where the literal chunks `PING`, `PONG` and
///  `NOOP` are never passed on to the application.
pub struct PlainProtocol {
    config: Arc<StarTrekConfig>,
}

impl PlainProtocol {
    pub fn new(config: Arc<StarTrekConfig>) -> PlainProtocol {
        PlainProtocol { config }
    }
}

impl Protocol for PlainProtocol {
    type Arrival = PlainArrival;
    type Departure = PlainDeparture;

    fn parse(&self, cache: &mut BytesMut) -> Vec<PlainArrival> {
        if cache.is_empty() {
            return Vec::new();
        }
        vec![PlainArrival::new(cache.split().freeze(), &self.config)]
    }

    fn check_arrival(&self, arrival: PlainArrival) -> ArrivalCheck<PlainArrival, PlainDeparture> {
        let payload = arrival.payload();
        match payload.as_ref() {
            PING => {
                trace!("received PING, responding with PONG");
                ArrivalCheck::reply(PlainDeparture::new(Bytes::from_static(PONG), PRIORITY_URGENT, &self.config))
            }
            PONG | NOOP => {
                trace!("received {:?}, ignoring", String::from_utf8_lossy(&payload));
                ArrivalCheck::swallow()
            }
            _ => ArrivalCheck::deliver(arrival),
        }
    }

    fn pack(&self, payload: Bytes, priority: Priority) -> PlainDeparture {
        PlainDeparture::new(payload, priority, &self.config)
    }

    fn heartbeat(&self) -> PlainDeparture {
        PlainDeparture::new(Bytes::from_static(PING), PRIORITY_SLOWER, &self.config)
    }
}
