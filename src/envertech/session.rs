use crate::prelude::*;
use crate::envertech::frame::{build_handshake_reply, FrameDecoder};
use crate::envertech::inverter::{MalformedSerial, SnapshotCallback};

use {
    bytes::BytesMut,
    net2::TcpStreamExt,
    std::io::ErrorKind,
    std::sync::atomic::{AtomicBool, Ordering},
    std::sync::Arc,
    std::time::Duration,
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    tokio::net::TcpStream,
    tokio::time::timeout,
    tokio_util::codec::Decoder,
};

const MAX_BUFFER_SIZE: usize = 65536; // 64KB max buffer size
const WRITE_TIMEOUT_SECS: u64 = 5; // Timeout for write operations

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Connecting,
    AwaitingFirstFrame,
    Handshaking,
    Streaming,
    Closed,
}

/// Why a session ended. Everything except `Stopped` leads to a reconnect.
#[derive(Debug, thiserror::Error)]
pub enum CloseCause {
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),
    #[error("no data received for {0:?}")]
    Timeout(Duration),
    #[error("connection closed by peer")]
    PeerClosed,
    #[error("read error: {0}")]
    ReadError(#[source] std::io::Error),
    #[error("write failed: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error(transparent)]
    MalformedSerial(#[from] MalformedSerial),
    #[error("stop requested")]
    Stopped,
}

/// One TCP connection to one device, from connect to close.
pub struct ConnectionSession {
    identity: Arc<DeviceIdentity>,
    settings: DeviceSettings,
    aggregator: SnapshotAggregator,
    on_snapshot_changed: SnapshotCallback,
    stop_rx: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    state: SessionState,
}

impl ConnectionSession {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        settings: DeviceSettings,
        aggregator: SnapshotAggregator,
        on_snapshot_changed: SnapshotCallback,
        stop_rx: watch::Receiver<bool>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            identity,
            settings,
            aggregator,
            on_snapshot_changed,
            stop_rx,
            connected,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run(&mut self) -> CloseCause {
        let mut stop_rx = self.stop_rx.clone();

        let connected = tokio::select! {
            _ = stop_rx.wait_for(|stop| *stop) => Err(CloseCause::Stopped),
            r = self.connect() => r,
        };

        match connected {
            Ok(stream) => self.run_on(stream).await,
            Err(cause) => self.close(cause),
        }
    }

    async fn connect(&self) -> Result<TcpStream, CloseCause> {
        info!(
            "connecting to inverter {} at {}:{}",
            self.identity.serial_hex, self.identity.host, self.identity.port
        );

        let inverter_hp = (self.identity.host.to_owned(), self.identity.port);

        let stream = match timeout(self.settings.connect_timeout, TcpStream::connect(inverter_hp)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(CloseCause::ConnectFailed(e)),
            Err(_) => {
                return Err(CloseCause::ConnectFailed(std::io::Error::new(
                    ErrorKind::TimedOut,
                    format!("connection timeout after {:?}", self.settings.connect_timeout),
                )))
            }
        };

        let std_stream = stream.into_std().map_err(CloseCause::ConnectFailed)?;
        if let Err(e) = std_stream.set_keepalive(Some(self.settings.tcp_keepalive)) {
            warn!("Failed to set TCP keepalive: {}", e);
        }

        let stream = TcpStream::from_std(std_stream).map_err(CloseCause::ConnectFailed)?;

        if self.settings.use_tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }
        }

        info!("inverter {}: connected!", self.identity.serial_hex);

        Ok(stream)
    }

    /// Drives the protocol over an already connected stream until it closes.
    pub async fn run_on<S>(&mut self, stream: S) -> CloseCause
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = BytesMut::with_capacity(MAX_BUFFER_SIZE);
        let mut decoder = FrameDecoder::new(self.settings.strict_frame_check);
        let mut stop_rx = self.stop_rx.clone();

        self.state = SessionState::AwaitingFirstFrame;
        self.connected.store(true, Ordering::SeqCst);

        loop {
            if buf.len() >= MAX_BUFFER_SIZE {
                return self.close(CloseCause::ReadError(std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("received data exceeds maximum size of {} bytes", MAX_BUFFER_SIZE),
                )));
            }
            // split() hands capacity away with each frame; top it back up
            buf.reserve(MAX_BUFFER_SIZE - buf.len());

            let read_result = tokio::select! {
                _ = stop_rx.wait_for(|stop| *stop) => return self.close(CloseCause::Stopped),
                r = timeout(self.settings.read_timeout, reader.read_buf(&mut buf)) => r,
            };

            let len = match read_result {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return self.close(CloseCause::ReadError(e)),
                Err(_) => return self.close(CloseCause::Timeout(self.settings.read_timeout)),
            };

            if len == 0 {
                return self.close(CloseCause::PeerClosed);
            }

            trace!("inverter {}: RX {:?}", self.identity.serial_hex, &buf[..]);

            loop {
                let parsed = match decoder.decode(&mut buf) {
                    Ok(Some(parsed)) => parsed,
                    Ok(None) => break,
                    Err(e) => return self.close(CloseCause::ReadError(e)),
                };

                match parsed {
                    ParsedFrame::Frame(frame) => {
                        if let Err(cause) = self.handle_frame(frame, &mut writer).await {
                            return self.close(cause);
                        }
                    }
                    ParsedFrame::Invalid(e) => {
                        warn!("inverter {}: discarding invalid frame: {}", self.identity.serial_hex, e)
                    }
                    ParsedFrame::Incomplete => break,
                }
            }
        }
    }

    async fn handle_frame<W>(&mut self, frame: Frame, writer: &mut W) -> Result<(), CloseCause>
    where
        W: AsyncWrite + Unpin,
    {
        if frame.is_challenge() {
            debug!("inverter {}: challenge received", self.identity.serial_hex);
            self.state = SessionState::Handshaking;

            let reply = build_handshake_reply(&self.identity.serial_hex)?;
            debug!("inverter {}: TX {:?}", self.identity.serial_hex, reply);

            return match timeout(Duration::from_secs(WRITE_TIMEOUT_SECS), writer.write_all(&reply)).await {
                Ok(Ok(_)) => writer.flush().await.map_err(CloseCause::WriteFailed),
                Ok(Err(e)) => Err(CloseCause::WriteFailed(e)),
                Err(_) => Err(CloseCause::WriteFailed(std::io::Error::new(
                    ErrorKind::TimedOut,
                    format!("write timed out after {} seconds", WRITE_TIMEOUT_SECS),
                ))),
            };
        }

        if frame.is_data() {
            self.aggregator.apply_data_frame(&frame);
            if self.state != SessionState::Streaming {
                info!(
                    "inverter {}: streaming data for {} modules",
                    self.identity.serial_hex,
                    self.aggregator.module_count()
                );
                self.state = SessionState::Streaming;
            }

            let snapshot = self.aggregator.snapshot();
            (self.on_snapshot_changed)(&snapshot);
            return Ok(());
        }

        debug!(
            "inverter {}: ignoring {} byte frame with control code {:#06x}",
            self.identity.serial_hex,
            frame.len(),
            frame.control_code()
        );
        Ok(())
    }

    fn close(&mut self, cause: CloseCause) -> CloseCause {
        debug!("inverter {}: {:?} -> Closed ({})", self.identity.serial_hex, self.state, cause);
        self.state = SessionState::Closed;
        self.connected.store(false, Ordering::SeqCst);
        cause
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envertech::frame::FrameFactory;
    use std::sync::atomic::AtomicUsize;

    fn session(serial: &str, read_timeout: Duration) -> (ConnectionSession, watch::Sender<bool>, Arc<AtomicUsize>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let settings = DeviceSettings {
            read_timeout,
            ..DeviceSettings::default()
        };

        let session = ConnectionSession::new(
            Arc::new(DeviceIdentity::new("127.0.0.1", 0, serial)),
            settings.clone(),
            SnapshotAggregator::new(settings.firmware),
            Arc::new(move |_: &Snapshot| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            stop_rx,
            Arc::new(AtomicBool::new(false)),
        );

        (session, stop_tx, calls)
    }

    fn challenge() -> Vec<u8> {
        FrameFactory::build(0x1001, &[0u8; 24])
    }

    #[tokio::test]
    async fn answers_challenge_then_streams() {
        let (mut session, _stop_tx, calls) = session("1a2b3c4d", Duration::from_secs(5));
        let (client, mut device) = tokio::io::duplex(1024);

        let device_task = tokio::spawn(async move {
            device.write_all(&challenge()).await.unwrap();

            let mut reply = [0u8; 32];
            device.read_exact(&mut reply).await.unwrap();

            device
                .write_all(&FrameFactory::build(ControlCode::Data.into(), &[0u8; 14 + 64]))
                .await
                .unwrap();
            reply
        });

        let driver = tokio::spawn(async move {
            let cause = session.run_on(client).await;
            (cause, session)
        });

        let reply = device_task.await.unwrap();
        assert_eq!(reply, build_handshake_reply("1a2b3c4d").unwrap());

        // device side is gone now
        let (cause, session) = driver.await.unwrap();
        assert!(matches!(cause, CloseCause::PeerClosed));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.aggregator.module_count(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ignores_invalid_and_unknown_frames() {
        let (mut session, _stop_tx, calls) = session("1a2b3c4d", Duration::from_secs(5));
        let (client, mut device) = tokio::io::duplex(1024);

        let device_task = tokio::spawn(async move {
            let mut bad = challenge();
            bad[3] = 0x00;
            device.write_all(&bad).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            device.write_all(&FrameFactory::build(0x1099, &[0u8; 40])).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        });

        let cause = session.run_on(client).await;
        device_task.await.unwrap();

        assert!(matches!(cause, CloseCause::PeerClosed));
        assert!(!session.aggregator.is_ready());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_serial_closes_session() {
        let (mut session, _stop_tx, _) = session("xyz", Duration::from_secs(5));
        let (client, mut device) = tokio::io::duplex(1024);

        device.write_all(&challenge()).await.unwrap();

        let cause = session.run_on(client).await;
        assert!(matches!(cause, CloseCause::MalformedSerial(_)));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn times_out_without_data() {
        let (mut session, _stop_tx, _) = session("1a2b3c4d", Duration::from_millis(50));
        let (client, _device) = tokio::io::duplex(1024);

        let cause = session.run_on(client).await;
        assert!(matches!(cause, CloseCause::Timeout(_)));
    }

    #[tokio::test]
    async fn stops_promptly() {
        let (mut session, stop_tx, _) = session("1a2b3c4d", Duration::from_secs(60));
        let (client, _device) = tokio::io::duplex(1024);

        stop_tx.send_replace(true);

        let cause = timeout(Duration::from_secs(1), session.run_on(client)).await.unwrap();
        assert!(matches!(cause, CloseCause::Stopped));
    }

    #[tokio::test]
    async fn reply_read_failure_closes() {
        let (mut session, _stop_tx, calls) = session("1a2b3c4d", Duration::from_secs(5));
        let (client, mut device) = tokio::io::duplex(1024);

        let device_task = tokio::spawn(async move {
            device.write_all(&challenge()).await.unwrap();
            let mut reply = [0u8; 32];
            device.read_exact(&mut reply).await.unwrap();
            // hang up instead of streaming
        });

        let cause = session.run_on(client).await;
        device_task.await.unwrap();

        assert!(matches!(cause, CloseCause::PeerClosed));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.connected.load(Ordering::SeqCst));
        assert!(!session.aggregator.is_ready());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn keeps_streaming_past_buffer_capacity() {
        const FRAMES: usize = 600; // 600 * 150 bytes, well past MAX_BUFFER_SIZE

        let (mut session, _stop_tx, calls) = session("1a2b3c4d", Duration::from_secs(5));
        let (client, mut device) = tokio::io::duplex(1024);
        let connected = session.connected.clone();

        let device_task = {
            let calls = calls.clone();
            tokio::spawn(async move {
                let frame = FrameFactory::build(ControlCode::Data.into(), &[0u8; 14 + 4 * 32]);
                assert_eq!(frame.len(), 150);

                for sent in 1..=FRAMES {
                    device.write_all(&frame).await.unwrap();
                    // one frame per read, the protocol never coalesces them
                    for _ in 0..1000 {
                        if calls.load(Ordering::SeqCst) >= sent {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    assert_eq!(calls.load(Ordering::SeqCst), sent);
                }
                assert!(connected.load(Ordering::SeqCst));
            })
        };

        let cause = session.run_on(client).await;
        device_task.await.unwrap();

        assert!(matches!(cause, CloseCause::PeerClosed));
        assert_eq!(calls.load(Ordering::SeqCst), FRAMES);
        assert_eq!(session.aggregator.module_count(), 4);
        assert!(!session.connected.load(Ordering::SeqCst));
    }
}
