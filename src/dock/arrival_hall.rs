use std::collections::hash_map::Entry;
use std::sync::Arc;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::StarTrekConfig;
use crate::ship::{Arrival, ArrivalStatus, TransactionId};

/// Reassembly of inbound messages: fragments are collected per SN until the message is complete,
///  and each message is handed out exactly once.
pub struct ArrivalHall<A: Arrival> {
    config: Arc<StarTrekConfig>,
    /// messages that are waiting for more fragments
    arrivals: FxHashMap<TransactionId, A>,
    /// SNs of messages that were completed, with their completion timestamp. Fragments arriving
    ///  late (e.g. re-sent because our acknowledgement got lost) are dropped based on this.
    arrival_finished: FxHashMap<TransactionId, Instant>,
}

impl <A: Arrival> ArrivalHall<A> {
    pub fn new(config: Arc<StarTrekConfig>) -> ArrivalHall<A> {
        ArrivalHall {
            config,
            arrivals: Default::default(),
            arrival_finished: Default::default(),
        }
    }

    /// Feeds an incoming ship into reassembly. Returns the complete message if this ship
    ///  completed it (or was complete on its own), and `None` if the message is still incomplete
    ///  or was already delivered before.
    pub fn assemble_arrival(&mut self, mut income: A, now: Instant) -> Option<A> {
        let sn = match income.sn() {
            None => {
                // no SN means no fragmentation
                return Some(income);
            }
            Some(sn) => sn,
        };

        if self.arrival_finished.contains_key(&sn) {
            debug!(?sn, "arrival was completed before - dropping duplicate");
            return None;
        }

        match self.arrivals.entry(sn) {
            Entry::Vacant(e) => {
                if income.is_complete() {
                    self.arrival_finished.insert(sn, now);
                    return Some(income);
                }
                trace!(?sn, "first fragment of a new arrival");
                income.touch(now);
                e.insert(income);
                None
            }
            Entry::Occupied(mut e) => {
                if e.get_mut().assemble(income) {
                    trace!(?sn, "arrival is complete");
                    let completed = e.remove();
                    self.arrival_finished.insert(sn, now);
                    Some(completed)
                }
                else {
                    e.get_mut().touch(now);
                    None
                }
            }
        }
    }

    /// Drops incomplete arrivals that did not make progress for too long, returning them so the
    ///  loss can be reported. Also forgets completed SNs after their deduplication TTL.
    pub fn purge(&mut self, now: Instant) -> Vec<A> {
        let expired_sns = self.arrivals.iter()
            .filter(|(_, a)| a.status(now) == ArrivalStatus::Expired)
            .map(|(sn, _)| *sn)
            .collect::<Vec<_>>();

        let mut expired = Vec::with_capacity(expired_sns.len());
        for sn in expired_sns {
            warn!(?sn, "incomplete arrival expired - dropping its fragments");
            if let Some(a) = self.arrivals.remove(&sn) {
                expired.push(a);
            }
        }

        let ttl = self.config.arrival_finished_ttl;
        self.arrival_finished
            .retain(|_, finished| now.saturating_duration_since(*finished) <= ttl);

        expired
    }

    pub fn num_assembling(&self) -> usize {
        self.arrivals.len()
    }

    pub fn is_finished(&self, sn: &TransactionId) -> bool {
        self.arrival_finished.contains_key(sn)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::ship::Ship;
    use crate::test_util::ship::TestArrival;
    use super::*;

    fn new_hall() -> ArrivalHall<TestArrival> {
        let mut config = StarTrekConfig::default();
        config.arrival_expires = Duration::from_secs(10);
        config.arrival_finished_ttl = Duration::from_secs(100);
        ArrivalHall::new(Arc::new(config))
    }

    fn fragments(sn: u64, pages: &[&'static [u8]]) -> Vec<TestArrival> {
        pages.iter()
            .enumerate()
            .map(|(i, body)| TestArrival::fragment(TransactionId::from_raw(sn), pages.len() as u32, i as u32, Bytes::from_static(body)))
            .collect()
    }

    #[test]
    fn test_no_sn_passes_through() {
        let mut hall = new_hall();
        let result = hall.assemble_arrival(TestArrival::whole(None, Bytes::from_static(b"x")), Instant::now());
        assert_eq!(result.unwrap().payload(), Bytes::from_static(b"x"));
        assert_eq!(hall.num_assembling(), 0);
    }

    #[test]
    fn test_single_fragment_message() {
        let mut hall = new_hall();
        let now = Instant::now();
        let mut income = fragments(1, &[b"only"]);
        let result = hall.assemble_arrival(income.remove(0), now);
        assert_eq!(result.unwrap().payload(), Bytes::from_static(b"only"));
        assert!(hall.is_finished(&TransactionId::from_raw(1)));

        // re-delivery of the whole message is suppressed
        let mut income = fragments(1, &[b"only"]);
        assert!(hall.assemble_arrival(income.remove(0), now).is_none());
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2])]
    #[case::reversed(vec![2, 1, 0])]
    #[case::mixed(vec![1, 2, 0])]
    #[case::last_first(vec![2, 0, 1])]
    fn test_reassembly_exactly_once(#[case] order: Vec<usize>) {
        let mut hall = new_hall();
        let now = Instant::now();
        let mut income = fragments(7, &[b"ab", b"cd", b"ef"])
            .into_iter()
            .map(Some)
            .collect::<Vec<_>>();

        let mut completed = Vec::new();
        for i in order.iter() {
            if let Some(a) = hall.assemble_arrival(income[*i].take().unwrap(), now) {
                completed.push(a);
            }
        }
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].payload(), Bytes::from_static(b"abcdef"));
        assert_eq!(completed[0].sn(), Some(TransactionId::from_raw(7)));
        assert_eq!(hall.num_assembling(), 0);

        // late duplicates of any fragment produce nothing and are not tracked again
        for dup in fragments(7, &[b"ab", b"cd", b"ef"]) {
            assert!(hall.assemble_arrival(dup, now).is_none());
        }
        assert_eq!(hall.num_assembling(), 0);
    }

    #[test]
    fn test_duplicate_fragment_while_assembling() {
        let mut hall = new_hall();
        let now = Instant::now();
        let mut first = fragments(3, &[b"a", b"b"]);
        let mut again = fragments(3, &[b"a", b"b"]);

        assert!(hall.assemble_arrival(first.remove(0), now).is_none());
        assert!(hall.assemble_arrival(again.remove(0), now).is_none());
        assert_eq!(hall.num_assembling(), 1);
        assert_eq!(hall.assemble_arrival(first.remove(0), now).unwrap().payload(), Bytes::from_static(b"ab"));
    }

    #[test]
    fn test_interleaved_messages() {
        let mut hall = new_hall();
        let now = Instant::now();
        let mut a = fragments(1, &[b"a1", b"a2"]);
        let mut b = fragments(2, &[b"b1", b"b2"]);

        assert!(hall.assemble_arrival(a.remove(0), now).is_none());
        assert!(hall.assemble_arrival(b.remove(1), now).is_none());
        assert_eq!(hall.num_assembling(), 2);
        assert_eq!(hall.assemble_arrival(b.remove(0), now).unwrap().payload(), Bytes::from_static(b"b1b2"));
        assert_eq!(hall.assemble_arrival(a.remove(0), now).unwrap().payload(), Bytes::from_static(b"a1a2"));
    }

    #[test]
    fn test_purge() {
        let mut hall = new_hall();
        let t0 = Instant::now();

        let mut stale = fragments(1, &[b"a", b"b"]);
        let mut fresh = fragments(2, &[b"a", b"b"]);
        let mut done = fragments(3, &[b"x"]);

        assert!(hall.assemble_arrival(stale.remove(0), t0).is_none());
        assert!(hall.assemble_arrival(fresh.remove(0), t0 + Duration::from_secs(5)).is_none());
        assert!(hall.assemble_arrival(done.remove(0), t0).is_some());

        let expired = hall.purge(t0 + Duration::from_secs(11));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].sn(), Some(TransactionId::from_raw(1)));
        assert_eq!(hall.num_assembling(), 1);
        assert!(hall.is_finished(&TransactionId::from_raw(3)));

        // the fragment that was dropped starts a new assembly; the surviving one is completed
        assert!(hall.assemble_arrival(stale.remove(0), t0 + Duration::from_secs(11)).is_none());
        assert!(hall.assemble_arrival(fresh.remove(0), t0 + Duration::from_secs(11)).is_some());

        hall.purge(t0 + Duration::from_secs(101));
        assert!(!hall.is_finished(&TransactionId::from_raw(3)));
        assert!(hall.is_finished(&TransactionId::from_raw(2)));
    }
}
