use std::collections::BTreeMap;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::time::Instant;
use crate::config::StarTrekConfig;
use crate::mtp::header::{DataType, Header};
use crate::mtp::package::Package;
use crate::ship::{Acknowledgement, Arrival, ArrivalState, ArrivalStatus, Departure, DepartureState, Priority, Ship, TransactionId};

/// The body of a message response asking the sender to try again later
pub const RESPONSE_AGAIN: &[u8] = b"AGAIN";

/// An inbound MTP message, collecting its fragments by offset
#[derive(Debug)]
pub struct PacketArrival {
    head: Package,
    packages: BTreeMap<u32, Package>,
    state: ArrivalState,
}

impl PacketArrival {
    pub fn new(package: Package, config: &StarTrekConfig) -> PacketArrival {
        let mut packages = BTreeMap::new();
        packages.insert(package.offset(), package.clone());
        PacketArrival {
            head: package,
            packages,
            state: ArrivalState::new(config),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.head.data_type()
    }

    /// the package this arrival was created from, i.e. its first received fragment
    pub fn head(&self) -> &Package {
        &self.head
    }
}

impl Ship for PacketArrival {
    fn sn(&self) -> Option<TransactionId> {
        Some(self.head.sn())
    }
}

impl Arrival for PacketArrival {
    fn is_complete(&self) -> bool {
        self.packages.len() as u32 >= self.head.pages()
    }

    fn assemble(&mut self, fragment: Self) -> bool {
        for (offset, package) in fragment.packages {
            if offset < self.head.pages() {
                self.packages.entry(offset).or_insert(package);
            }
        }
        self.is_complete()
    }

    fn payload(&self) -> Bytes {
        if self.packages.len() == 1 {
            if let Some(package) = self.packages.values().next() {
                return package.body().clone();
            }
        }
        let mut result = BytesMut::with_capacity(self.packages.values().map(|p| p.body().len()).sum());
        for package in self.packages.values() {
            result.extend_from_slice(package.body());
        }
        result.freeze()
    }

    fn acknowledgement(&self) -> Option<Acknowledgement> {
        match self.data_type() {
            DataType::MessageResponse => Some(Acknowledgement {
                sn: self.head.sn(),
                page: self.head.header().fragment.map(|f| f.offset),
                again: self.head.body().as_ref() == RESPONSE_AGAIN,
            }),
            DataType::CommandResponse => Some(Acknowledgement {
                sn: self.head.sn(),
                page: None,
                again: false,
            }),
            _ => None,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.state.touch(now);
    }

    fn status(&self, now: Instant) -> ArrivalStatus {
        self.state.status(now)
    }
}


/// An outbound MTP task. Messages are split into fragments that fit the MTU, and each fragment
///  is removed as its response comes in.
#[derive(Debug)]
pub struct PacketDeparture {
    sn: TransactionId,
    data_type: DataType,
    packages: Mutex<Vec<Package>>,
    state: DepartureState,
}

impl PacketDeparture {
    pub fn new(package: Package, priority: Priority, config: &StarTrekConfig) -> PacketDeparture {
        let sn = package.sn();
        let data_type = package.data_type();
        PacketDeparture {
            sn,
            data_type,
            packages: Mutex::new(package.split(Self::max_body(config))),
            state: DepartureState::new(priority, config),
        }
    }

    /// the largest body that fits into a single datagram together with a fragment header
    pub fn max_body(config: &StarTrekConfig) -> usize {
        config.mtu.saturating_sub(Header::FRAGMENT_LEN)
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn num_packages(&self) -> usize {
        self.packages.lock().len()
    }
}

impl Ship for PacketDeparture {
    fn sn(&self) -> Option<TransactionId> {
        Some(self.sn)
    }
}

impl Departure for PacketDeparture {
    fn state(&self) -> &DepartureState {
        &self.state
    }

    fn fragments(&self) -> Vec<Bytes> {
        self.packages.lock()
            .iter()
            .map(|p| p.ser())
            .collect()
    }

    fn is_important(&self) -> bool {
        self.data_type.is_message()
    }

    fn check_response(&self, ack: &Acknowledgement) -> bool {
        if ack.sn != self.sn {
            return false;
        }
        let mut packages = self.packages.lock();
        match ack.page {
            Some(page) => packages.retain(|p| p.offset() != page),
            None => packages.clear(),
        }
        packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;

    fn config(mtu: usize) -> StarTrekConfig {
        let mut config = StarTrekConfig::default();
        config.mtu = mtu;
        config
    }

    #[test]
    fn test_departure_is_fragmented_and_acknowledged_per_page() {
        let config = config(64);
        let body = Bytes::from(vec![7u8; 100]);
        let departure = PacketDeparture::new(Package::message(TransactionId::from_raw(5), body), 0, &config);

        assert!(departure.is_important());
        assert_eq!(departure.num_packages(), 3);
        let fragments = departure.fragments();
        assert_eq!(fragments.iter().map(|f| f.len()).collect::<Vec<_>>(), vec![64, 64, 24 + 20]);

        let ack = |page| Acknowledgement { sn: TransactionId::from_raw(5), page: Some(page), again: false };
        assert!(!departure.check_response(&ack(1)));
        assert!(!departure.check_response(&Acknowledgement { sn: TransactionId::from_raw(6), page: None, again: false }));
        assert!(!departure.check_response(&ack(0)));
        assert_eq!(departure.fragments().len(), 1);
        assert!(departure.check_response(&ack(2)));
        assert!(departure.fragments().is_empty());
    }

    #[test]
    fn test_command_departure_is_not_important() {
        let config = config(1472);
        let departure = PacketDeparture::new(Package::command(TransactionId::from_raw(1), Bytes::from_static(b"PING")), 1, &config);
        assert!(!departure.is_important());
        assert_eq!(departure.priority(), 1);
        assert_eq!(departure.fragments().len(), 1);
    }

    #[test]
    fn test_arrival_reassembly() {
        let config = config(1472);
        let sn = TransactionId::from_raw(9);
        let mut arrival = PacketArrival::new(Package::fragment(sn, 3, 2, Bytes::from_static(b"c")), &config);
        assert!(!arrival.is_complete());
        assert!(!arrival.assemble(PacketArrival::new(Package::fragment(sn, 3, 0, Bytes::from_static(b"a")), &config)));
        // duplicates are ignored
        assert!(!arrival.assemble(PacketArrival::new(Package::fragment(sn, 3, 0, Bytes::from_static(b"x")), &config)));
        assert!(arrival.assemble(PacketArrival::new(Package::fragment(sn, 3, 1, Bytes::from_static(b"b")), &config)));
        assert_eq!(arrival.payload(), Bytes::from_static(b"abc"));
        assert_eq!(arrival.acknowledgement(), None);
    }

    #[test]
    fn test_arrival_acknowledgements() {
        let config = config(1472);
        let sn = TransactionId::from_raw(9);

        let request = Package::fragment(sn, 3, 1, Bytes::new());
        let ok = PacketArrival::new(Package::response(request.header(), Bytes::from_static(b"OK")), &config);
        assert_eq!(ok.acknowledgement(), Some(Acknowledgement { sn, page: Some(1), again: false }));

        let again = PacketArrival::new(Package::response(Package::message(sn, Bytes::new()).header(), Bytes::from_static(RESPONSE_AGAIN)), &config);
        assert_eq!(again.acknowledgement(), Some(Acknowledgement { sn, page: None, again: true }));

        let pong = PacketArrival::new(Package::response(Package::command(sn, Bytes::new()).header(), Bytes::from_static(b"PONG")), &config);
        assert_eq!(pong.acknowledgement(), Some(Acknowledgement { sn, page: None, again: false }));
    }

    #[test]
    fn test_arrival_expiry() {
        let mut config = config(1472);
        config.arrival_expires = Duration::from_secs(10);
        let now = Instant::now();
        let mut arrival = PacketArrival::new(Package::fragment(TransactionId::from_raw(1), 2, 0, Bytes::new()), &config);
        arrival.touch(now);
        assert_eq!(arrival.status(now + Duration::from_secs(10)), ArrivalStatus::Assembling);
        assert_eq!(arrival.status(now + Duration::from_secs(11)), ArrivalStatus::Expired);
    }
}
