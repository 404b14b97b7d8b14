//! Dummy Transport Implementation
//!
//! An in-memory bus with one simulated slave TWC behind it. Every frame we
//! send is parsed on the spot and the slave's answer is queued for the next
//! `receive`. The simulated car draws whatever it is offered, up to its own
//! limit, once the offer reaches the slave's minimum.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use twc_protocol::{
    hex_str, Frame, FrameReceiver, HeartbeatData, MasterCommand, Message, ProtocolVersion,
    Received, SlaveHeartbeat, SlaveStatus, TwcId, VinPart,
};

use super::traits::{ConnectionState, Transport, TransportError, TransportStats};

/// Simulated slave configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DummyTransportConfig {
    pub twc_id: TwcId,
    /// Hardware rating reported in the linkready
    pub max_amps: f64,
    /// 1 or 2
    pub protocol: u8,
    /// Amps the simulated car will draw at most, 0 for no car
    pub car_amps: f64,
    /// VIN reported by the simulated car
    pub vin: String,
    /// Mains voltage on each phase
    pub volts: u16,
}

impl Default for DummyTransportConfig {
    fn default() -> Self {
        Self {
            twc_id: TwcId::new(0xAB, 0x01),
            max_amps: 32.0,
            protocol: 2,
            car_amps: 32.0,
            vin: "5YJ3E1EA1JF000123".to_string(),
            volts: 240,
        }
    }
}

impl DummyTransportConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if !matches!(self.protocol, 1 | 2) {
            return Err(TransportError::ConfigError(
                "Protocol must be 1 or 2".to_string(),
            ));
        }
        if self.max_amps <= 0.0 {
            return Err(TransportError::ConfigError(
                "maxAmps must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn protocol_version(&self) -> ProtocolVersion {
        if self.protocol == 1 {
            ProtocolVersion::V1
        } else {
            ProtocolVersion::V2
        }
    }
}

/// State of the simulated slave
#[derive(Debug)]
struct SimulatedSlave {
    id: TwcId,
    sign: u8,
    protocol: ProtocolVersion,
    max_amps: f64,
    car_amps: f64,
    vin: String,
    volts: u16,
    linked: bool,
    offered: f64,
    actual: f64,
    stopped: bool,
    lifetime_wh: f64,
    last_heartbeat: Option<Instant>,
}

impl SimulatedSlave {
    fn new(config: &DummyTransportConfig) -> Self {
        Self {
            id: config.twc_id,
            sign: twc_protocol::random_sign(),
            protocol: config.protocol_version(),
            max_amps: config.max_amps,
            car_amps: config.car_amps,
            vin: config.vin.clone(),
            volts: config.volts,
            linked: false,
            offered: 0.0,
            actual: 0.0,
            stopped: false,
            lifetime_wh: 0.0,
            last_heartbeat: None,
        }
    }

    /// Answer one frame from the master, if it calls for an answer
    fn answer(&mut self, message: Message, now: Instant) -> Option<Message> {
        match message {
            Message::MasterLinkready1 { .. } | Message::MasterLinkready2 { .. } if !self.linked => {
                self.linked = true;
                Some(Message::SlaveLinkready {
                    sender: self.id,
                    sign: self.sign,
                    max_amps: self.max_amps,
                    protocol: self.protocol,
                })
            },
            Message::MasterHeartbeat {
                sender,
                receiver,
                data,
            } if receiver == self.id => {
                self.linked = true;
                self.apply_heartbeat(&HeartbeatData::from_bytes(&data), now);
                let state = if self.actual >= 1.0 {
                    SlaveStatus::Charging
                } else if self.car_amps > 0.0 {
                    SlaveStatus::PluggedReady
                } else {
                    SlaveStatus::Ready
                };
                let raw = SlaveHeartbeat::encode(state, self.offered, self.actual);
                Some(Message::SlaveHeartbeat {
                    sender: self.id,
                    receiver: sender,
                    heartbeat: SlaveHeartbeat {
                        state,
                        amps_max: self.offered,
                        amps_actual: self.actual,
                        raw: raw[..self.protocol.heartbeat_len()].to_vec(),
                    },
                })
            },
            Message::VoltageRequest { receiver, .. } if receiver == self.id => {
                Some(Message::VoltageResponse {
                    sender: self.id,
                    lifetime_kwh: (self.lifetime_wh / 1000.0) as u32,
                    volts: [self.volts, 0, 0],
                })
            },
            Message::GetVin { receiver, part, .. } if receiver == self.id => {
                let start = part.index() * 7;
                let text = if self.actual >= 1.0 {
                    self.vin.chars().skip(start).take(7).collect()
                } else {
                    String::new()
                };
                Some(Message::VinReply {
                    sender: self.id,
                    part,
                    text,
                })
            },
            Message::StartCharging { receiver, .. } if receiver == self.id => {
                self.stopped = false;
                Some(Message::AckStart { sender: self.id })
            },
            Message::StopCharging { receiver, .. } if receiver == self.id => {
                self.stopped = true;
                self.actual = 0.0;
                Some(Message::AckStop { sender: self.id })
            },
            _ => None,
        }
    }

    fn apply_heartbeat(&mut self, data: &HeartbeatData, now: Instant) {
        if let Some(last) = self.last_heartbeat {
            let hours = now.duration_since(last).as_secs_f64() / 3600.0;
            self.lifetime_wh += self.actual * f64::from(self.volts) * hours;
        }
        self.last_heartbeat = Some(now);

        if matches!(data.command(), MasterCommand::SetAmps | MasterCommand::SetAmpsCharging) {
            self.offered = data.amps().min(self.max_amps);
        }
        self.actual = if !self.stopped && self.offered >= self.protocol.min_amps_supported() {
            self.offered.min(self.car_amps)
        } else {
            0.0
        };
    }
}

/// Dummy transport with a simulated slave
#[derive(Debug)]
pub struct DummyTransport {
    slave: SimulatedSlave,
    receiver: FrameReceiver,
    inbound: BytesMut,
    connected: bool,
    stats: TransportStats,
}

impl DummyTransport {
    pub fn new(config: DummyTransportConfig) -> Result<Self, TransportError> {
        config.validate()?;

        Ok(Self {
            slave: SimulatedSlave::new(&config),
            receiver: FrameReceiver::new(),
            inbound: BytesMut::new(),
            connected: false,
            stats: TransportStats::new(),
        })
    }

    fn queue(&mut self, message: &Message) -> Result<(), TransportError> {
        let payload = message
            .encode()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let wire = Frame::from_payload(payload).to_wire();
        trace!(hex_data = %hex_str(&wire), "[Dummy] Slave reply queued");
        self.inbound.extend_from_slice(&wire);
        Ok(())
    }
}

#[async_trait]
impl Transport for DummyTransport {
    fn transport_type(&self) -> &str {
        "dummy"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.stats.record_connection_attempt();
        self.connected = true;
        self.stats.record_successful_connection();
        debug!("Dummy bus connected, simulated slave {}", self.slave.id);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            self.connected = false;
            self.stats.record_disconnection();
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::SendFailed("Not connected".to_string()));
        }
        self.stats.record_bytes_sent(data.len());

        let now = Instant::now();
        for &byte in data {
            if let Received::Frame(frame) = self.receiver.push(byte, now) {
                match Message::decode(&frame) {
                    Ok(message) => {
                        if let Some(reply) = self.slave.answer(message, now) {
                            self.queue(&reply)?;
                        }
                    },
                    Err(e) => debug!("[Dummy] Slave ignored frame: {e}"),
                }
            }
        }
        Ok(data.len())
    }

    async fn receive(
        &mut self,
        buffer: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::ReceiveFailed("Not connected".to_string()));
        }
        if self.inbound.is_empty() {
            tokio::time::sleep(timeout.unwrap_or(Duration::from_millis(25))).await;
            return Ok(0);
        }

        let n = buffer.len().min(self.inbound.len());
        buffer[..n].copy_from_slice(&self.inbound[..n]);
        self.inbound.advance(n);
        self.stats.record_bytes_received(n);
        Ok(n)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.stats.clone();
        if !self.connected && stats.connection_state == ConnectionState::Connected {
            stats.connection_state = ConnectionState::Disconnected;
        }
        stats
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    async fn exchange(transport: &mut DummyTransport, message: Message) -> Option<Message> {
        let wire = Frame::from_payload(message.encode().unwrap()).to_wire();
        transport.send(&wire).await.unwrap();

        let mut rx = FrameReceiver::new();
        let mut buf = [0u8; 64];
        let n = transport
            .receive(&mut buf, Some(Duration::from_millis(1)))
            .await
            .unwrap();
        let now = Instant::now();
        buf[..n].iter().find_map(|&b| match rx.push(b, now) {
            Received::Frame(frame) => Message::decode(&frame).ok(),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_simulated_slave_answers_linkready_and_heartbeat() {
        let master = TwcId::new(0x77, 0x77);
        let mut transport = DummyTransport::new(DummyTransportConfig::default()).unwrap();
        transport.connect().await.unwrap();

        let reply = exchange(&mut transport, Message::MasterLinkready1 { sender: master, sign: 1 })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Message::SlaveLinkready { sender, protocol: ProtocolVersion::V2, .. } if sender == TwcId::new(0xAB, 0x01)
        ));

        // Only the first linkready is answered
        assert!(exchange(&mut transport, Message::MasterLinkready2 { sender: master, sign: 1 })
            .await
            .is_none());

        let data = HeartbeatData::set_amps(ProtocolVersion::V2, 16.0);
        let reply = exchange(
            &mut transport,
            Message::MasterHeartbeat {
                sender: master,
                receiver: TwcId::new(0xAB, 0x01),
                data: data.for_protocol(ProtocolVersion::V2).to_vec(),
            },
        )
        .await
        .unwrap();
        match reply {
            Message::SlaveHeartbeat { heartbeat, receiver, .. } => {
                assert_eq!(receiver, master);
                assert_eq!(heartbeat.state, SlaveStatus::Charging);
                assert_eq!(heartbeat.amps_max, 16.0);
                assert_eq!(heartbeat.amps_actual, 16.0);
            },
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_vin_only_reported_while_charging() {
        let master = TwcId::new(0x77, 0x77);
        let slave = TwcId::new(0xAB, 0x01);
        let mut transport = DummyTransport::new(DummyTransportConfig::default()).unwrap();
        transport.connect().await.unwrap();

        let reply = exchange(
            &mut transport,
            Message::GetVin { sender: master, receiver: slave, part: VinPart::First },
        )
        .await
        .unwrap();
        assert!(matches!(reply, Message::VinReply { ref text, .. } if text.is_empty()));

        let data = HeartbeatData::set_amps(ProtocolVersion::V2, 20.0);
        exchange(
            &mut transport,
            Message::MasterHeartbeat { sender: master, receiver: slave, data: data.0.to_vec() },
        )
        .await
        .unwrap();

        let reply = exchange(
            &mut transport,
            Message::GetVin { sender: master, receiver: slave, part: VinPart::Third },
        )
        .await
        .unwrap();
        assert!(matches!(reply, Message::VinReply { ref text, .. } if text == "123"));
    }

    #[test]
    fn test_config_validation() {
        let config = DummyTransportConfig {
            protocol: 3,
            ..Default::default()
        };
        assert!(DummyTransport::new(config).is_err());
    }
}
