//! Bus task
//!
//! The only code that touches the transport. Each pass drains control
//! commands, lets the core do its housekeeping, sends at most one frame and
//! then listens for a short window. Every transmission is followed by a
//! quiet gap so slaves get a turn on the half-duplex line.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use errors::{TwcError, TwcResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use twc_protocol::{hex_str, Frame, FrameReceiver, Received};

use crate::control::ControlCommand;
use crate::core::Core;
use crate::transport::{Transport, TransportError};

/// Listen window per pass
const RECEIVE_WINDOW: Duration = Duration::from_millis(25);
/// Quiet time after each transmission
const SEND_GAP: Duration = Duration::from_millis(100);
const RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Wall-clock seconds since the epoch
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

pub struct BusLoop {
    core: Core,
    transport: Box<dyn Transport>,
    receiver: FrameReceiver,
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    buffer: Vec<u8>,
}

impl BusLoop {
    pub fn new(
        core: Core,
        transport: Box<dyn Transport>,
        commands: mpsc::UnboundedReceiver<ControlCommand>,
    ) -> Self {
        Self {
            core,
            transport,
            receiver: FrameReceiver::new(),
            commands,
            buffer: vec![0; 256],
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> TwcResult<()> {
        self.transport.connect().await?;
        info!(
            "Bus running on {} transport as master {}",
            self.transport.transport_type(),
            self.core.id()
        );

        while !cancel.is_cancelled() {
            while let Ok(command) = self.commands.try_recv() {
                self.core.handle_command(command, now_secs());
            }

            let now = now_secs();
            self.core.tick(now);

            if let Some(frame) = self.core.next_transmission(now) {
                if let Err(e) = self.send(&frame).await {
                    self.recover(e, &cancel).await?;
                    continue;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(SEND_GAP) => {},
                }
            }

            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.transport.receive(&mut self.buffer, Some(RECEIVE_WINDOW)) => r,
            };
            match received {
                Ok(n) => self.feed(n),
                Err(TransportError::Timeout(_)) => {},
                Err(e) => self.recover(e, &cancel).await?,
            }
            self.receiver.expire(Instant::now());
        }

        info!("Bus stopping");
        if let Err(e) = self.transport.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
        Ok(())
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let wire = frame.to_wire();
        trace!(hex_data = %hex_str(&wire), "Sending");
        self.transport.send(&wire).await?;
        Ok(())
    }

    fn feed(&mut self, n: usize) {
        let now = Instant::now();
        let received_at = now_secs();
        for i in 0..n {
            match self.receiver.push(self.buffer[i], now) {
                Received::Frame(frame) => {
                    trace!(hex_data = %hex_str(frame.payload()), "Received");
                    self.core.handle_frame(&frame, received_at);
                },
                Received::Rejected(e) => debug!("Discarding bad frame: {}", e),
                Received::Pending | Received::Ignored => {},
            }
        }
    }

    /// Re-open the link after a fatal error
    async fn recover(&mut self, err: TransportError, cancel: &CancellationToken) -> TwcResult<()> {
        if !err.is_fatal() {
            debug!("Transient transport error: {}", err);
            return Ok(());
        }
        error!("Transport error: {}", err);
        if let Err(e) = self.transport.disconnect().await {
            warn!("Disconnect before reconnect failed: {}", e);
        }
        self.receiver = FrameReceiver::new();

        let mut delay = RECONNECT_DELAY;
        for attempt in 1..=RECONNECT_ATTEMPTS {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {},
            }
            match self.transport.connect().await {
                Ok(()) => {
                    info!("Reconnected after {} attempt(s)", attempt);
                    return Ok(());
                },
                Err(e) => {
                    warn!("Reconnect attempt {}/{} failed: {}", attempt, RECONNECT_ATTEMPTS, e);
                    delay *= 2;
                },
            }
        }
        Err(TwcError::Transport(format!(
            "gave up after {RECONNECT_ATTEMPTS} reconnect attempts: {err}"
        )))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use crate::config::CoreConfig;
    use crate::master::Shared;
    use crate::tasks::TaskQueue;
    use crate::transport::{DummyTransport, DummyTransportConfig};
    use std::sync::Arc;
    use tracing_test::traced_test;
    use twc_policy::{PolicyConfig, PolicyEngine};
    use twc_protocol::TwcId;

    use std::sync::atomic::{AtomicU32, Ordering};

    fn core(shared: Arc<Shared>) -> Core {
        let config = CoreConfig {
            wiring_max_amps_all_twcs: 32.0,
            wiring_max_amps_per_twc: 32.0,
            ..Default::default()
        };
        let policy: PolicyConfig = serde_yaml::from_str(
            "override:\n  - name: Fixed\n    match: [none]\n    condition: [none]\n    value: [none]\n    charge_amps: 24\n",
        )
        .unwrap();
        Core::with_id(
            config,
            PolicyEngine::from_config(&policy, None).unwrap(),
            shared,
            Arc::new(TaskQueue::new()),
            &Collaborators::default(),
            TwcId::new(0x77, 0x77),
            0x55,
        )
    }

    /// A line that drops every write and fails to close
    #[derive(Debug)]
    struct BrokenLine {
        connects: Arc<AtomicU32>,
        reconnect_ok: bool,
    }

    #[async_trait::async_trait]
    impl Transport for BrokenLine {
        fn transport_type(&self) -> &str {
            "broken"
        }

        async fn connect(&mut self) -> Result<(), TransportError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n == 0 || self.reconnect_ok {
                Ok(())
            } else {
                Err(TransportError::ConnectionFailed("no such device".into()))
            }
        }

        async fn disconnect(&mut self) -> Result<(), TransportError> {
            Err(TransportError::ConnectionFailed("device vanished".into()))
        }

        async fn send(&mut self, _data: &[u8]) -> Result<usize, TransportError> {
            Err(TransportError::SendFailed("broken pipe".into()))
        }

        async fn receive(
            &mut self,
            _buffer: &mut [u8],
            timeout: Option<Duration>,
        ) -> Result<usize, TransportError> {
            tokio::time::sleep(timeout.unwrap_or(RECEIVE_WINDOW)).await;
            Ok(0)
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn stats(&self) -> crate::transport::TransportStats {
            crate::transport::TransportStats::new()
        }
    }

    #[tokio::test]
    async fn test_dummy_slave_gets_an_offer() {
        let shared = Arc::new(Shared::default());
        let transport = DummyTransport::new(DummyTransportConfig::default()).unwrap();
        let (_tx, rx) = mpsc::unbounded_channel();
        let bus = BusLoop::new(core(shared.clone()), Box::new(transport), rx);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(bus.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let status = shared.status.read().clone();
        assert_eq!(status.max_amps_to_divide, 24.0);
        assert_eq!(status.slaves.len(), 1);
        assert_eq!(status.slaves[0].twc_id, "AB01");
        assert_eq!(status.slaves[0].last_amps_offered, 24.0);
    }

    #[tokio::test]
    async fn test_reconnects_after_failed_send() {
        let connects = Arc::new(AtomicU32::new(0));
        let line = BrokenLine {
            connects: connects.clone(),
            reconnect_ok: true,
        };
        let (_tx, rx) = mpsc::unbounded_channel();
        let bus = BusLoop::new(core(Arc::new(Shared::default())), Box::new(line), rx);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(bus.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert!(connects.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_gives_up_after_three_reconnects() {
        let connects = Arc::new(AtomicU32::new(0));
        let line = BrokenLine {
            connects: connects.clone(),
            reconnect_ok: false,
        };
        let (_tx, rx) = mpsc::unbounded_channel();
        let bus = BusLoop::new(core(Arc::new(Shared::default())), Box::new(line), rx);

        let err = bus.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TwcError::Transport(ref msg) if msg.contains("gave up")));
        assert_eq!(connects.load(Ordering::SeqCst), 1 + RECONNECT_ATTEMPTS);
        assert!(logs_contain("Disconnect before reconnect failed: "));
    }
}
