use bytes::Bytes;
use tokio::time::Instant;
use crate::config::StarTrekConfig;
use crate::ship::{Acknowledgement, Arrival, ArrivalState, ArrivalStatus, Departure, DepartureState, Priority, Ship, TransactionId};

/// A chunk of bytes as it came off an unframed stream. It is complete by definition, and it
///  never takes part in reassembly.
#[derive(Debug, Clone)]
pub struct PlainArrival {
    payload: Bytes,
    state: ArrivalState,
}
impl PlainArrival {
    pub fn new(payload: Bytes, config: &StarTrekConfig) -> PlainArrival {
        PlainArrival {
            payload,
            state: ArrivalState::new(config),
        }
    }
}

impl Ship for PlainArrival {
    fn sn(&self) -> Option<TransactionId> {
        None
    }
}

impl Arrival for PlainArrival {
    fn is_complete(&self) -> bool {
        true
    }

    fn assemble(&mut self, _fragment: Self) -> bool {
        true
    }

    fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    fn acknowledgement(&self) -> Option<Acknowledgement> {
        None
    }

    fn touch(&mut self, now: Instant) {
        self.state.touch(now);
    }

    fn status(&self, now: Instant) -> ArrivalStatus {
        self.state.status(now)
    }
}


/// Fire-and-forget payload for an unframed stream: written as is, never acknowledged
#[derive(Debug)]
pub struct PlainDeparture {
    payload: Bytes,
    state: DepartureState,
}
impl PlainDeparture {
    pub fn new(payload: Bytes, priority: Priority, config: &StarTrekConfig) -> PlainDeparture {
        PlainDeparture {
            payload,
            state: DepartureState::new(priority, config),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl Ship for PlainDeparture {
    fn sn(&self) -> Option<TransactionId> {
        None
    }
}

impl Departure for PlainDeparture {
    fn state(&self) -> &DepartureState {
        &self.state
    }

    fn fragments(&self) -> Vec<Bytes> {
        if self.payload.is_empty() {
            vec![]
        }
        else {
            vec![self.payload.clone()]
        }
    }

    fn is_important(&self) -> bool {
        false
    }

    fn check_response(&self, _ack: &Acknowledgement) -> bool {
        false
    }
}
