use bytes::Bytes;
use parking_lot::Mutex;
use crate::error::DockerError;
use crate::port::{DockerDelegate, DockerStatus, Porter};
use crate::ship::{Arrival, Departure, TransactionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEvent {
    Received(Bytes),
    Sent(Option<TransactionId>),
    Failed(DockerError, Option<TransactionId>),
    Error(DockerError, Option<TransactionId>),
    StatusChanged(DockerStatus, DockerStatus),
}

/// A [DockerDelegate] that records all callbacks for later inspection
#[derive(Debug, Default)]
pub struct TrackingDelegate {
    events: Mutex<Vec<DockerEvent>>,
}

impl TrackingDelegate {
    pub fn new() -> TrackingDelegate {
        Self::default()
    }

    /// returns and forgets all events recorded so far
    pub fn take_events(&self) -> Vec<DockerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn events(&self) -> Vec<DockerEvent> {
        self.events.lock().clone()
    }

    /// the payloads of all received messages, in order
    pub fn received(&self) -> Vec<Bytes> {
        self.events.lock()
            .iter()
            .filter_map(|e| match e {
                DockerEvent::Received(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn assert_no_failures(&self) {
        let events = self.events.lock();
        let failures = events.iter()
            .filter(|e| matches!(e, DockerEvent::Failed(..)))
            .collect::<Vec<_>>();
        assert!(failures.is_empty(), "unexpected failures: {:?}", failures);
    }
}

impl DockerDelegate for TrackingDelegate {
    fn on_docker_received(&self, arrival: &dyn Arrival, _docker: &dyn Porter) {
        self.events.lock().push(DockerEvent::Received(arrival.payload()));
    }

    fn on_docker_sent(&self, departure: &dyn Departure, _docker: &dyn Porter) {
        self.events.lock().push(DockerEvent::Sent(departure.sn()));
    }

    fn on_docker_failed(&self, error: &DockerError, departure: &dyn Departure, _docker: &dyn Porter) {
        self.events.lock().push(DockerEvent::Failed(error.clone(), departure.sn()));
    }

    fn on_docker_error(&self, error: &DockerError, departure: Option<&dyn Departure>, _docker: &dyn Porter) {
        self.events.lock().push(DockerEvent::Error(error.clone(), departure.and_then(|d| d.sn())));
    }

    fn on_docker_status_changed(&self, previous: DockerStatus, current: DockerStatus, _docker: &dyn Porter) {
        self.events.lock().push(DockerEvent::StatusChanged(previous, current));
    }
}
