//! The dock pairs an [ArrivalHall] for reassembling inbound messages with a [DepartureHall] for
//!  queueing and retrying outbound ones. There is one dock per docker, i.e. per peer.

pub mod arrival_hall;
pub mod departure_hall;

use std::sync::Arc;
use parking_lot::RwLock;
use tokio::time::Instant;
use crate::config::StarTrekConfig;
use crate::dock::arrival_hall::ArrivalHall;
use crate::dock::departure_hall::DepartureHall;
use crate::ship::{Acknowledgement, Arrival, Departure};

pub struct Dock<A: Arrival, D: Departure> {
    arrival_hall: ArrivalHall<A>,
    departure_hall: DepartureHall<D>,
}

impl <A: Arrival, D: Departure> Dock<A, D> {
    pub fn new(config: Arc<StarTrekConfig>) -> Dock<A, D> {
        Dock {
            arrival_hall: ArrivalHall::new(config.clone()),
            departure_hall: DepartureHall::new(config),
        }
    }

    pub fn assemble_arrival(&mut self, income: A, now: Instant) -> Option<A> {
        self.arrival_hall.assemble_arrival(income, now)
    }

    pub fn add_departure(&mut self, outgo: Arc<D>) -> bool {
        self.departure_hall.add_departure(outgo)
    }

    pub fn next_departure(&mut self, now: Instant) -> Option<Arc<D>> {
        self.departure_hall.next_departure(now)
    }

    pub fn check_response(&mut self, ack: &Acknowledgement, now: Instant) -> Option<Arc<D>> {
        self.departure_hall.check_response(ack, now)
    }

    /// returns the arrivals that expired before they were complete
    pub fn purge(&mut self, now: Instant) -> Vec<A> {
        self.departure_hall.purge(now);
        self.arrival_hall.purge(now)
    }

    pub fn drain_departures(&mut self) -> Vec<Arc<D>> {
        self.departure_hall.drain()
    }

    pub fn arrival_hall(&self) -> &ArrivalHall<A> {
        &self.arrival_hall
    }

    pub fn departure_hall(&self) -> &DepartureHall<D> {
        &self.departure_hall
    }
}


/// A [Dock] that can be shared between the tick loop and I/O callbacks. Lookups take the read
///  lock, everything that changes the halls' structure takes the write lock - in particular
///  reassembly, so there is never more than one arrival in flight per SN.
pub struct LockedDock<A: Arrival, D: Departure> {
    inner: RwLock<Dock<A, D>>,
}

impl <A: Arrival, D: Departure> LockedDock<A, D> {
    pub fn new(config: Arc<StarTrekConfig>) -> LockedDock<A, D> {
        LockedDock {
            inner: RwLock::new(Dock::new(config)),
        }
    }

    pub fn assemble_arrival(&self, income: A, now: Instant) -> Option<A> {
        self.inner.write().assemble_arrival(income, now)
    }

    pub fn add_departure(&self, outgo: Arc<D>) -> bool {
        self.inner.write().add_departure(outgo)
    }

    pub fn next_departure(&self, now: Instant) -> Option<Arc<D>> {
        self.inner.write().next_departure(now)
    }

    pub fn check_response(&self, ack: &Acknowledgement, now: Instant) -> Option<Arc<D>> {
        self.inner.write().check_response(ack, now)
    }

    pub fn purge(&self, now: Instant) -> Vec<A> {
        self.inner.write().purge(now)
    }

    pub fn drain_departures(&self) -> Vec<Arc<D>> {
        self.inner.write().drain_departures()
    }

    pub fn num_assembling(&self) -> usize {
        self.inner.read().arrival_hall().num_assembling()
    }

    pub fn num_pending_departures(&self) -> usize {
        let inner = self.inner.read();
        inner.departure_hall().num_new() + inner.departure_hall().num_in_flight()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use bytes::Bytes;
    use crate::ship::TransactionId;
    use crate::test_util::ship::{TestArrival, TestDeparture};
    use super::*;

    #[test]
    fn test_concurrent_reassembly_delivers_once() {
        let config = Arc::new(StarTrekConfig::default());
        let dock = Arc::new(LockedDock::<TestArrival, TestDeparture>::new(config));
        let now = Instant::now();
        let pages = 32u32;

        let handles = (0..4)
            .map(|worker| {
                let dock = dock.clone();
                thread::spawn(move || {
                    let mut completed = 0;
                    // every worker delivers every fragment - only one completion overall
                    for offset in 0..pages {
                        let offset = (offset + worker * 8) % pages;
                        let fragment = TestArrival::fragment(TransactionId::from_raw(1), pages, offset, Bytes::from(vec![offset as u8]));
                        if dock.assemble_arrival(fragment, now).is_some() {
                            completed += 1;
                        }
                    }
                    completed
                })
            })
            .collect::<Vec<_>>();

        let total: i32 = handles.into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(total, 1);
        assert_eq!(dock.num_assembling(), 0);
    }

    #[test]
    fn test_pending_departures() {
        let config = Arc::new(StarTrekConfig::default());
        let dock = LockedDock::<TestArrival, TestDeparture>::new(config.clone());
        let now = Instant::now();

        dock.add_departure(Arc::new(TestDeparture::new(Some(TransactionId::from_raw(1)), 0, 1, true, &config)));
        dock.add_departure(Arc::new(TestDeparture::new(None, 0, 1, false, &config)));
        assert_eq!(dock.num_pending_departures(), 2);

        dock.next_departure(now);
        dock.next_departure(now);
        assert_eq!(dock.num_pending_departures(), 1);
        assert_eq!(dock.drain_departures().len(), 1);
        assert_eq!(dock.num_pending_departures(), 0);
    }
}
