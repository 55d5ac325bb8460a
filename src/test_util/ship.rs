use std::collections::BTreeMap;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::time::Instant;
use crate::config::StarTrekConfig;
use crate::ship::{Acknowledgement, Arrival, ArrivalState, ArrivalStatus, Departure, DepartureState, Priority, Ship, TransactionId};

/// A protocol-neutral arrival made of numbered pages
#[derive(Debug, Clone)]
pub struct TestArrival {
    sn: Option<TransactionId>,
    pages: u32,
    received: BTreeMap<u32, Bytes>,
    state: ArrivalState,
}
impl TestArrival {
    pub fn whole(sn: Option<TransactionId>, payload: Bytes) -> TestArrival {
        let mut received = BTreeMap::new();
        received.insert(0, payload);
        TestArrival {
            sn,
            pages: 1,
            received,
            state: ArrivalState::new(&StarTrekConfig::default()),
        }
    }

    pub fn fragment(sn: TransactionId, pages: u32, offset: u32, body: Bytes) -> TestArrival {
        Self::fragment_with_config(sn, pages, offset, body, &StarTrekConfig::default())
    }

    pub fn fragment_with_config(sn: TransactionId, pages: u32, offset: u32, body: Bytes, config: &StarTrekConfig) -> TestArrival {
        let mut received = BTreeMap::new();
        received.insert(offset, body);
        TestArrival {
            sn: Some(sn),
            pages,
            received,
            state: ArrivalState::new(config),
        }
    }
}

impl Ship for TestArrival {
    fn sn(&self) -> Option<TransactionId> {
        self.sn
    }
}

impl Arrival for TestArrival {
    fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.pages
    }

    fn assemble(&mut self, fragment: Self) -> bool {
        for (offset, body) in fragment.received {
            self.received.entry(offset).or_insert(body);
        }
        self.is_complete()
    }

    fn payload(&self) -> Bytes {
        let mut result = BytesMut::new();
        for body in self.received.values() {
            result.extend_from_slice(body);
        }
        result.freeze()
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


/// A protocol-neutral departure: page `i` has the body `i` (as a decimal string), and each page
///  is acknowledged individually
#[derive(Debug)]
pub struct TestDeparture {
    sn: Option<TransactionId>,
    important: bool,
    pages: Mutex<BTreeMap<u32, Bytes>>,
    state: DepartureState,
}
impl TestDeparture {
    pub fn new(sn: Option<TransactionId>, priority: Priority, pages: u32, important: bool, config: &StarTrekConfig) -> TestDeparture {
        TestDeparture {
            sn,
            important,
            pages: Mutex::new((0..pages).map(|i| (i, Bytes::from(i.to_string()))).collect()),
            state: DepartureState::new(priority, config),
        }
    }
}

impl Ship for TestDeparture {
    fn sn(&self) -> Option<TransactionId> {
        self.sn
    }
}

impl Departure for TestDeparture {
    fn state(&self) -> &DepartureState {
        &self.state
    }

    fn fragments(&self) -> Vec<Bytes> {
        self.pages.lock().values().cloned().collect()
    }

    fn is_important(&self) -> bool {
        self.important
    }

    fn check_response(&self, ack: &Acknowledgement) -> bool {
        if Some(ack.sn) != self.sn {
            return false;
        }
        let mut pages = self.pages.lock();
        match ack.page {
            Some(page) => { pages.remove(&page); }
            None => pages.clear(),
        }
        pages.is_empty()
    }
}
