use std::fmt::{Display, Formatter};
use crate::ship::TransactionId;

/// Failures that are reported to a [crate::port::DockerDelegate]. Sending is asynchronous, so
///  there is no synchronous error path for these - they only ever surface through callbacks.
///
/// NB: Duplicate arrivals and departures are deliberately not represented here: they are
///      swallowed silently as part of deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerError {
    /// the channel failed or was closed, so the connection is (or will shortly be) in
    ///  error state
    ConnectionLost(String),
    /// The channel accepted only part of a departure's data. The unsent remainder is kept
    ///  and sent on the next round, so this is recoverable.
    SendIncomplete {
        sent: usize,
        total: usize,
    },
    /// a departure exhausted its retries without being acknowledged
    RequestTimeout(Option<TransactionId>),
    /// an inbound message was dropped because its missing fragments did not arrive in time
    ArrivalExpired(TransactionId),
}

impl Display for DockerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DockerError::ConnectionLost(reason) => write!(f, "connection lost: {}", reason),
            DockerError::SendIncomplete { sent, total } => write!(f, "send incomplete: {} of {} bytes written", sent, total),
            DockerError::RequestTimeout(Some(sn)) => write!(f, "request {:?} timed out", sn),
            DockerError::RequestTimeout(None) => write!(f, "request timed out"),
            DockerError::ArrivalExpired(sn) => write!(f, "arrival {:?} expired before it was complete", sn),
        }
    }
}

impl std::error::Error for DockerError {}

impl DockerError {
    /// terminal errors mean the departure is gone, as opposed to errors after which the
    ///  departure is retained and retried
    pub fn is_terminal(&self) -> bool {
        matches!(self, DockerError::RequestTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::lost(DockerError::ConnectionLost("reset".to_string()), "connection lost: reset", false)]
    #[case::incomplete(DockerError::SendIncomplete { sent: 3, total: 10 }, "send incomplete: 3 of 10 bytes written", false)]
    #[case::timeout(DockerError::RequestTimeout(None), "request timed out", true)]
    #[case::expired(DockerError::ArrivalExpired(TransactionId::from_raw(17)), "arrival [sn:0000000000000011] expired before it was complete", false)]
    fn test_display(#[case] error: DockerError, #[case] expected: &str, #[case] terminal: bool) {
        assert_eq!(error.to_string(), expected);
        assert_eq!(error.is_terminal(), terminal);
    }
}
