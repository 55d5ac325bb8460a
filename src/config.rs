use std::time::Duration;
use anyhow::bail;

/// Tuning for connections, ships and docks. There are no global constants - every component
///  gets its configuration passed in, so tests can run with short timeouts side by side.
#[derive(Debug, Clone)]
pub struct StarTrekConfig {
    /// A connection counts as 'recently' active in a direction if there was traffic in that
    ///  direction during this window. After 16 times this window without receiving anything, the
    ///  connection is considered dead.
    pub connection_expires: Duration,
    /// Dead connections are kept in the pool for this long before they are evicted, giving
    ///  late callbacks a chance to find them
    pub connection_dying_grace: Duration,

    /// An incomplete inbound message is dropped if no fragment arrived for this long
    pub arrival_expires: Duration,
    /// SNs of completed inbound messages are remembered for this long to suppress duplicates
    pub arrival_finished_ttl: Duration,

    /// Time to wait for a response before an outbound task is re-sent
    pub departure_expires: Duration,
    /// Number of re-sends after the first attempt before an outbound task fails
    pub departure_retries: u32,
    /// SNs of acknowledged outbound tasks are remembered for this long
    pub departure_finished_ttl: Duration,

    /// Payload size inside a datagram. Packet bodies are fragmented so that header plus body fit.
    ///
    /// With full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472` for
    ///  IPV4.
    pub mtu: usize,
    /// size of the buffer for a single non-blocking read
    pub receive_buffer_size: usize,
    /// upper bound for reads from a single channel in one tick, so a chatty peer can not
    ///  starve others
    pub max_reads_per_tick: usize,

    /// cadence of the driving loop
    pub tick_interval: Duration,
    /// upper bound for establishing an outbound stream connection
    pub connect_timeout: Duration,
}

impl Default for StarTrekConfig {
    fn default() -> Self {
        StarTrekConfig {
            connection_expires: Duration::from_secs(16),
            connection_dying_grace: Duration::from_secs(120),
            arrival_expires: Duration::from_secs(300),
            arrival_finished_ttl: Duration::from_secs(3600),
            departure_expires: Duration::from_secs(120),
            departure_retries: 2,
            departure_finished_ttl: Duration::from_secs(3600),
            mtu: 1472,
            receive_buffer_size: 64*1024,
            max_reads_per_tick: 64,
            tick_interval: Duration::from_millis(16),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl StarTrekConfig {
    pub fn new() -> StarTrekConfig {
        Self::default()
    }

    /// threshold after which a connection that received nothing is given up on
    pub fn connection_long_time_ago(&self) -> Duration {
        self.connection_expires * 16
    }

    /// number of attempts for an outbound task, i.e. the initial send plus retries
    pub fn departure_max_tries(&self) -> u32 {
        self.departure_retries + 1
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection_expires.is_zero() {
            bail!("connection expiry must be positive");
        }
        if self.departure_expires.is_zero() {
            bail!("departure expiry must be positive");
        }
        if self.arrival_expires.is_zero() {
            bail!("arrival expiry must be positive");
        }
        if self.mtu < 64 {
            bail!("MTU of {} is too small to hold a packet header and a meaningful body", self.mtu);
        }
        if self.receive_buffer_size < self.mtu {
            bail!("receive buffer ({} bytes) must hold at least a full datagram ({} bytes)", self.receive_buffer_size, self.mtu);
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be positive");
        }
        if self.max_reads_per_tick == 0 {
            bail!("at least one read per tick is required");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StarTrekConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection_long_time_ago(), Duration::from_secs(256));
        assert_eq!(config.departure_max_tries(), 3);
    }

    #[rstest]
    #[case::zero_connection_expiry(|c: &mut StarTrekConfig| c.connection_expires = Duration::ZERO)]
    #[case::zero_departure_expiry(|c: &mut StarTrekConfig| c.departure_expires = Duration::ZERO)]
    #[case::zero_arrival_expiry(|c: &mut StarTrekConfig| c.arrival_expires = Duration::ZERO)]
    #[case::tiny_mtu(|c: &mut StarTrekConfig| c.mtu = 20)]
    #[case::small_receive_buffer(|c: &mut StarTrekConfig| c.receive_buffer_size = 100)]
    #[case::zero_connect_timeout(|c: &mut StarTrekConfig| c.connect_timeout = Duration::ZERO)]
    #[case::no_reads(|c: &mut StarTrekConfig| c.max_reads_per_tick = 0)]
    fn test_validate_rejects(#[case] modify: fn(&mut StarTrekConfig)) {
        let mut config = StarTrekConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
