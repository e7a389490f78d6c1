//! UDP Transport Implementation
//!
//! One socket serves every neighbor and every joining peer. Datagrams are
//! addressed by raw `SocketAddr`; there is no link state at this layer.

use super::{PacketTx, ReceivedDatagram, TransportError, TransportState};
use crate::config::UdpConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// UDP socket plus its receive loop.
pub struct UdpTransport {
    config: UdpConfig,
    state: TransportState,
    /// Bound socket (None until started).
    socket: Option<Arc<UdpSocket>>,
    /// Channel for delivering received datagrams to the node.
    packet_tx: PacketTx,
    recv_task: Option<JoinHandle<()>>,
    /// Local bound address (after start).
    local_addr: Option<SocketAddr>,
}

impl UdpTransport {
    pub fn new(config: UdpConfig, packet_tx: PacketTx) -> Self {
        Self {
            config,
            state: TransportState::Configured,
            socket: None,
            packet_tx,
            recv_task: None,
            local_addr: None,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn mtu(&self) -> u16 {
        self.config.mtu()
    }

    /// Get the local bound address (only valid after start).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the socket and spawn the receive loop.
    pub async fn start_async(&mut self) -> Result<(), TransportError> {
        if !self.state.can_start() {
            return Err(TransportError::AlreadyStarted);
        }

        self.state = TransportState::Starting;

        let bind_addr: SocketAddr = match self.config.bind_addr().parse() {
            Ok(addr) => addr,
            Err(e) => {
                self.state = TransportState::Failed;
                return Err(TransportError::InvalidAddress(format!(
                    "{}: {}",
                    self.config.bind_addr(),
                    e
                )));
            }
        };

        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                self.state = TransportState::Failed;
                return Err(TransportError::StartFailed(format!("bind failed: {}", e)));
            }
        };

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.state = TransportState::Failed;
                return Err(TransportError::StartFailed(format!("get local addr: {}", e)));
            }
        };
        self.local_addr = Some(local_addr);

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());

        let packet_tx = self.packet_tx.clone();
        let mtu = self.config.mtu();
        self.recv_task = Some(tokio::spawn(async move {
            udp_receive_loop(socket, packet_tx, mtu).await;
        }));
        self.state = TransportState::Up;

        info!(local_addr = %local_addr, mtu = mtu, "UDP transport started");

        Ok(())
    }

    /// Abort the receive loop and close the socket.
    pub async fn stop_async(&mut self) -> Result<(), TransportError> {
        if !self.state.is_operational() {
            return Err(TransportError::NotStarted);
        }

        if let Some(task) = self.recv_task.take() {
            task.abort();
            let _ = task.await; // JoinError from abort
        }

        self.socket.take();
        self.local_addr = None;
        self.state = TransportState::Down;

        debug!("UDP transport stopped");

        Ok(())
    }

    /// Send one datagram. Payloads above the MTU are refused, never
    /// fragmented.
    pub async fn send_async(&self, to: SocketAddr, data: &[u8]) -> Result<usize, TransportError> {
        if !self.state.is_operational() {
            return Err(TransportError::NotStarted);
        }

        if data.len() > self.config.mtu() as usize {
            return Err(TransportError::MtuExceeded {
                packet_size: data.len(),
                mtu: self.config.mtu(),
            });
        }

        let socket = self.socket.as_ref().ok_or(TransportError::NotStarted)?;
        let bytes_sent = socket
            .send_to(data, to)
            .await
            .map_err(|e| TransportError::SendFailed(format!("{}: {}", to, e)))?;

        trace!(remote_addr = %to, bytes = bytes_sent, "UDP datagram sent");

        Ok(bytes_sent)
    }
}

/// Receive loop; runs as a spawned task until the channel closes.
async fn udp_receive_loop(socket: Arc<UdpSocket>, packet_tx: PacketTx, mtu: u16) {
    // Headroom so oversized datagrams arrive whole and fail decoding
    let mut buf = vec![0u8; mtu as usize + 100];

    debug!("UDP receive loop starting");

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, remote_addr)) => {
                trace!(remote_addr = %remote_addr, bytes = len, "UDP datagram received");
                let datagram = ReceivedDatagram::new(remote_addr, buf[..len].to_vec());
                if packet_tx.send(datagram).await.is_err() {
                    info!("Packet channel closed, stopping receive loop");
                    break;
                }
            }
            Err(e) => {
                // Transient errors (ICMP unreachable on some platforms)
                warn!(error = %e, "UDP receive error");
            }
        }
    }

    debug!("UDP receive loop stopped");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::packet_channel;
    use tokio::time::{timeout, Duration};

    fn make_config() -> UdpConfig {
        UdpConfig {
            bind_addr: Some("127.0.0.1:0".to_string()),
            mtu: Some(548),
        }
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (tx, _rx) = packet_channel(100);
        let mut transport = UdpTransport::new(make_config(), tx);

        assert_eq!(transport.state(), TransportState::Configured);

        transport.start_async().await.unwrap();
        assert_eq!(transport.state(), TransportState::Up);
        assert!(transport.local_addr().is_some());

        transport.stop_async().await.unwrap();
        assert_eq!(transport.state(), TransportState::Down);
        assert!(transport.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let (tx, _rx) = packet_channel(100);
        let mut transport = UdpTransport::new(make_config(), tx);

        transport.start_async().await.unwrap();
        let result = transport.start_async().await;
        assert!(matches!(result, Err(TransportError::AlreadyStarted)));

        transport.stop_async().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_not_started_fails() {
        let (tx, _rx) = packet_channel(100);
        let mut transport = UdpTransport::new(make_config(), tx);

        let result = transport.stop_async().await;
        assert!(matches!(result, Err(TransportError::NotStarted)));
    }

    #[tokio::test]
    async fn test_invalid_bind_addr() {
        let (tx, _rx) = packet_channel(100);
        let config = UdpConfig {
            bind_addr: Some("not-an-address".to_string()),
            mtu: None,
        };
        let mut transport = UdpTransport::new(config, tx);

        let result = transport.start_async().await;
        assert!(matches!(result, Err(TransportError::InvalidAddress(_))));
        assert_eq!(transport.state(), TransportState::Failed);
    }

    #[tokio::test]
    async fn test_bidirectional() {
        let (tx1, mut rx1) = packet_channel(100);
        let (tx2, mut rx2) = packet_channel(100);

        let mut t1 = UdpTransport::new(make_config(), tx1);
        let mut t2 = UdpTransport::new(make_config(), tx2);

        t1.start_async().await.unwrap();
        t2.start_async().await.unwrap();

        let addr1 = t1.local_addr().unwrap();
        let addr2 = t2.local_addr().unwrap();

        let sent = t1.send_async(addr2, b"ping").await.unwrap();
        assert_eq!(sent, 4);

        let datagram = timeout(Duration::from_secs(1), rx2.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(datagram.data, b"ping");
        assert_eq!(datagram.from, addr1);

        t2.send_async(addr1, b"pong").await.unwrap();

        let datagram = timeout(Duration::from_secs(1), rx1.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(datagram.data, b"pong");
        assert_eq!(datagram.from, addr2);

        t1.stop_async().await.unwrap();
        t2.stop_async().await.unwrap();
    }

    #[tokio::test]
    async fn test_mtu_exceeded() {
        let (tx, _rx) = packet_channel(100);
        let mut transport = UdpTransport::new(
            UdpConfig {
                mtu: Some(100),
                ..make_config()
            },
            tx,
        );

        transport.start_async().await.unwrap();

        let oversized = vec![0u8; 200];
        let result = transport
            .send_async("127.0.0.1:9999".parse().unwrap(), &oversized)
            .await;
        assert!(matches!(
            result,
            Err(TransportError::MtuExceeded {
                packet_size: 200,
                mtu: 100
            })
        ));

        transport.stop_async().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_not_started() {
        let (tx, _rx) = packet_channel(100);
        let transport = UdpTransport::new(make_config(), tx);

        let result = transport
            .send_async("127.0.0.1:9999".parse().unwrap(), b"test")
            .await;
        assert!(matches!(result, Err(TransportError::NotStarted)));
    }
}
