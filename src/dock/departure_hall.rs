use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::StarTrekConfig;
use crate::ship::{Acknowledgement, Departure, DepartureStatus, Priority, TransactionId};

/// Identity of a departure for duplicate detection: the SN of an important departure, the
///  allocation otherwise. Responses carry the SN of the request they answer, so there may be
///  several of them with the same SN.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
enum DepartureKey {
    Sn(TransactionId),
    Ptr(usize),
}
impl DepartureKey {
    fn of<D: Departure>(departure: &Arc<D>) -> DepartureKey {
        match departure.sn() {
            Some(sn) if departure.is_important() => DepartureKey::Sn(sn),
            _ => DepartureKey::Ptr(Arc::as_ptr(departure) as *const () as usize),
        }
    }
}

/// Outbound task queue with priorities and retries.
///
/// New departures wait in `new_departures`, sorted by priority and submission order. Once they
///  are handed out, those that need a response move to a 'fleet' for their priority, where they
///  wait for acknowledgement. If that does not come in time, they are handed out again - with
///  their priority degraded by one level for every retry, so a flaky peer's messages do not
///  starve others at the same level.
///
/// Invariant: every SN in `departure_map` is in `departure_level`, and the departure is in the
///  fleet for exactly that priority (and no other fleet).
pub struct DepartureHall<D: Departure> {
    config: Arc<StarTrekConfig>,

    /// everything that is currently tracked, for rejecting duplicate submissions
    all_departures: FxHashSet<DepartureKey>,
    /// not sent yet, sorted by ascending priority, stable for the same priority
    new_departures: VecDeque<Arc<D>>,
    /// sent, waiting for a response; the BTreeMap's key order is the order in which priority
    ///  levels are checked for timeouts
    fleets: BTreeMap<Priority, VecDeque<Arc<D>>>,
    departure_map: FxHashMap<TransactionId, Arc<D>>,
    departure_level: FxHashMap<TransactionId, Priority>,
    /// acknowledged departures, kept for a while to ignore duplicate responses
    departure_finished: FxHashMap<TransactionId, Instant>,
}

impl <D: Departure> DepartureHall<D> {
    pub fn new(config: Arc<StarTrekConfig>) -> DepartureHall<D> {
        DepartureHall {
            config,
            all_departures: Default::default(),
            new_departures: Default::default(),
            fleets: Default::default(),
            departure_map: Default::default(),
            departure_level: Default::default(),
            departure_finished: Default::default(),
        }
    }

    /// Queues a departure for sending. Returns `false` (and does nothing) if the same departure
    ///  is already queued or in flight.
    pub fn add_departure(&mut self, outgo: Arc<D>) -> bool {
        if !self.all_departures.insert(DepartureKey::of(&outgo)) {
            debug!(sn = ?outgo.sn(), "departure is tracked already - ignoring duplicate submission");
            return false;
        }

        let priority = outgo.priority();
        let pos = self.new_departures.partition_point(|d| d.priority() <= priority);
        self.new_departures.insert(pos, outgo);
        true
    }

    /// Returns the next departure that is due for sending, if any. New departures always go
    ///  before retries.
    ///
    /// A departure with status [DepartureStatus::Failed] is returned exactly once, after it was
    ///  removed from tracking; it is the caller's responsibility to report it and not send it.
    pub fn next_departure(&mut self, now: Instant) -> Option<Arc<D>> {
        if let Some(outgo) = self.next_new_departure(now) {
            return Some(outgo);
        }
        self.next_timeout_departure(now)
    }

    fn next_new_departure(&mut self, now: Instant) -> Option<Arc<D>> {
        let outgo = self.new_departures.pop_front()?;

        match outgo.sn() {
            Some(sn) if outgo.is_important() => {
                let priority = outgo.priority();
                self.fleets.entry(priority)
                    .or_default()
                    .push_back(outgo.clone());
                self.departure_map.insert(sn, outgo.clone());
                self.departure_level.insert(sn, priority);
            }
            _ => {
                // fire-and-forget: nothing to wait for once it is handed to the connection
                self.all_departures.remove(&DepartureKey::of(&outgo));
            }
        }

        outgo.touch(now);
        Some(outgo)
    }

    fn next_timeout_departure(&mut self, now: Instant) -> Option<Arc<D>> {
        let (priority, idx, status) = self.fleets.iter()
            .find_map(|(priority, fleet)| {
                fleet.iter()
                    .enumerate()
                    .find_map(|(idx, d)| {
                        match d.status(now) {
                            status @ (DepartureStatus::Timeout | DepartureStatus::Failed) => Some((*priority, idx, status)),
                            _ => None,
                        }
                    })
            })?;

        let outgo = self.remove_from_fleet(priority, idx)?;
        let sn = outgo.sn();

        if status == DepartureStatus::Failed {
            warn!(?sn, "departure failed after exhausting its retries");
            if let Some(sn) = sn {
                self.departure_map.remove(&sn);
                self.departure_level.remove(&sn);
            }
            self.all_departures.remove(&DepartureKey::of(&outgo));
            return Some(outgo);
        }

        let degraded = priority + 1;
        debug!(?sn, "departure timed out - retrying with priority {}", degraded);
        outgo.state().set_priority(degraded);
        self.fleets.entry(degraded)
            .or_default()
            .push_back(outgo.clone());
        if let Some(sn) = sn {
            self.departure_level.insert(sn, degraded);
        }

        outgo.touch(now);
        Some(outgo)
    }

    fn remove_from_fleet(&mut self, priority: Priority, idx: usize) -> Option<Arc<D>> {
        let fleet = self.fleets.get_mut(&priority)?;
        let removed = fleet.remove(idx);
        if fleet.is_empty() {
            self.fleets.remove(&priority);
        }
        removed
    }

    /// Removes a tracked departure by SN from all indices
    fn remove_departure(&mut self, sn: TransactionId) -> Option<Arc<D>> {
        let departure = self.departure_map.remove(&sn)?;
        if let Some(priority) = self.departure_level.remove(&sn) {
            if let Some(fleet) = self.fleets.get_mut(&priority) {
                fleet.retain(|d| !Arc::ptr_eq(d, &departure));
                if fleet.is_empty() {
                    self.fleets.remove(&priority);
                }
            }
        }
        self.all_departures.remove(&DepartureKey::Sn(sn));
        Some(departure)
    }

    /// Applies a peer's response. Returns the departure if this response completed it - that is
    ///  the point at which it counts as sent.
    pub fn check_response(&mut self, ack: &Acknowledgement, now: Instant) -> Option<Arc<D>> {
        let sn = ack.sn;
        if self.departure_finished.contains_key(&sn) {
            trace!(?sn, "response for a departure that is finished already - ignoring");
            return None;
        }

        let departure = self.departure_map.get(&sn)?.clone();
        if ack.again {
            debug!(?sn, "peer asks to send again later");
            departure.state().retry_later(now);
            return None;
        }

        if !departure.check_response(ack) {
            return None;
        }

        trace!(?sn, "departure is fully acknowledged");
        self.remove_departure(sn);
        self.departure_finished.insert(sn, now);
        Some(departure)
    }

    /// Removes departures that are done, and forgets finished SNs after their TTL. Returns the
    ///  number of departures that were removed.
    pub fn purge(&mut self, now: Instant) -> usize {
        let done = self.fleets.values()
            .flat_map(|fleet| fleet.iter())
            .filter(|d| d.status(now) == DepartureStatus::Done)
            .cloned()
            .collect::<Vec<_>>();

        for departure in done.iter() {
            match departure.sn() {
                Some(sn) => {
                    self.remove_departure(sn);
                    self.departure_finished.insert(sn, now);
                }
                None => {
                    // not expected for tracked departures, but must not get stuck either
                    for fleet in self.fleets.values_mut() {
                        fleet.retain(|d| !Arc::ptr_eq(d, departure));
                    }
                    self.all_departures.remove(&DepartureKey::of(departure));
                }
            }
        }
        self.fleets.retain(|_, fleet| !fleet.is_empty());

        let ttl = self.config.departure_finished_ttl;
        self.departure_finished
            .retain(|_, finished| now.saturating_duration_since(*finished) <= ttl);

        done.len()
    }

    /// Removes and returns everything that is queued or in flight, e.g. when the connection is
    ///  gone for good
    pub fn drain(&mut self) -> Vec<Arc<D>> {
        let mut result = self.new_departures.drain(..).collect::<Vec<_>>();
        for (_, fleet) in std::mem::take(&mut self.fleets) {
            result.extend(fleet);
        }
        self.departure_map.clear();
        self.departure_level.clear();
        self.all_departures.clear();
        result
    }

    pub fn num_new(&self) -> usize {
        self.new_departures.len()
    }

    pub fn num_in_flight(&self) -> usize {
        self.departure_map.len()
    }

    /// the priority levels that currently have departures waiting for a response, ascending
    pub fn priorities(&self) -> Vec<Priority> {
        self.fleets.keys().cloned().collect()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        assert_eq!(self.departure_map.len(), self.departure_level.len());
        assert_eq!(self.departure_map.len(), self.fleets.values().map(|f| f.len()).sum::<usize>());
        for (sn, priority) in self.departure_level.iter() {
            let departure = self.departure_map.get(sn).unwrap();
            for (p, fleet) in self.fleets.iter() {
                let count = fleet.iter().filter(|d| Arc::ptr_eq(d, departure)).count();
                assert_eq!(count, if p == priority { 1 } else { 0 });
            }
        }
    }
}
