use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use crate::config::StarTrekConfig;
use crate::gate::StarGate;
use crate::net::tcp::StreamChannel;

/// Drives a gate at the configured cadence until `shutdown` changes (or its sender is dropped),
///  and closes the gate afterwards.
///
/// While there is work, a tick calls [StarGate::process] repeatedly, but never more than
///  `max_reads_per_tick` times so that one busy peer cannot stall the runtime.
pub async fn run_gate(gate: Arc<StarGate>, config: Arc<StarTrekConfig>, mut shutdown: watch::Receiver<bool>) {
    let mut ticks = interval(config.tick_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("starting gate driver");
    loop {
        select! {
            _ = ticks.tick() => {
                let now = Instant::now();
                for _ in 0..config.max_reads_per_tick {
                    if !gate.process(now) {
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("shutting down gate driver");
                break;
            }
        }
    }
    gate.close();
}

/// Accepts incoming TCP connections and registers them with the gate's hub
pub async fn accept_loop(listener: TcpListener, gate: Arc<StarGate>, mut shutdown: watch::Receiver<bool>) {
    info!("accepting TCP connections on {:?}", listener.local_addr().ok());
    loop {
        select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("error accepting TCP connection: {}", e);
                        continue;
                    }
                };
                debug!("accepted TCP connection from {:?}", peer);
                match StreamChannel::new(stream) {
                    Ok(channel) => gate.hub().bind_channel(Arc::new(channel), Instant::now()),
                    Err(e) => error!("could not set up channel for {:?}: {}", peer, e),
                }
            }
            _ = shutdown.changed() => {
                info!("stopping TCP accept loop");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Weak;
    use std::time::Duration;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};
    use crate::gate::{AutoDockerFactory, DockerKind};
    use crate::net::channel::Channel;
    use crate::net::udp::PacketChannel;
    use crate::port::DockerDelegate;
    use crate::test_util::delegate::{DockerEvent, TrackingDelegate};
    use super::*;

    fn new_gate(config: &Arc<StarTrekConfig>, datagram: bool) -> (Arc<StarGate>, Arc<TrackingDelegate>) {
        let delegate = Arc::new(TrackingDelegate::new());
        let weak = Arc::downgrade(&delegate);
        let weak_delegate: Weak<dyn DockerDelegate> = weak;
        let factory = Arc::new(AutoDockerFactory::new(config.clone(), datagram, DockerKind::Packet));
        (StarGate::new(config.clone(), None, factory, weak_delegate), delegate)
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let config = Arc::new(StarTrekConfig::default());
        let loopback = SocketAddr::from(([127, 0, 0, 1], 0));

        let (gate_a, delegate_a) = new_gate(&config, true);
        let (gate_b, delegate_b) = new_gate(&config, true);
        let channel_a = Arc::new(PacketChannel::bind(loopback).unwrap());
        let channel_b = Arc::new(PacketChannel::bind(loopback).unwrap());
        let addr_b = channel_b.local_addr().unwrap();
        gate_a.hub().bind_channel(channel_a.clone(), Instant::now());
        gate_b.hub().bind_channel(channel_b.clone(), Instant::now());

        let (shutdown_send, shutdown) = watch::channel(false);
        let driver_a = tokio::spawn(run_gate(gate_a.clone(), config.clone(), shutdown.clone()));
        let driver_b = tokio::spawn(run_gate(gate_b.clone(), config.clone(), shutdown));

        let payload = Bytes::from(vec![7u8; 4000]);
        gate_a.send_data(payload.clone(), addr_b, None, 0, Instant::now()).unwrap();

        wait_for(|| !delegate_b.received().is_empty()).await;
        assert_eq!(delegate_b.received(), vec![payload]);
        wait_for(|| delegate_a.events().iter().any(|e| matches!(e, DockerEvent::Sent(Some(_))))).await;
        delegate_a.assert_no_failures();

        shutdown_send.send(true).unwrap();
        driver_a.await.unwrap();
        driver_b.await.unwrap();
        assert!(!channel_a.is_open());
        assert!(!channel_b.is_open());
    }

    #[tokio::test]
    async fn test_accepted_plain_stream() {
        let config = Arc::new(StarTrekConfig::default());
        let (gate, delegate) = new_gate(&config, false);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_send, shutdown) = watch::channel(false);
        let acceptor = tokio::spawn(accept_loop(listener, gate.clone(), shutdown.clone()));
        let driver = tokio::spawn(run_gate(gate.clone(), config.clone(), shutdown));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        wait_for(|| !delegate.received().is_empty()).await;
        assert_eq!(delegate.received(), vec![Bytes::from_static(b"hello")]);

        client.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"PONG");

        shutdown_send.send(true).unwrap();
        acceptor.await.unwrap();
        driver.await.unwrap();
    }
}
