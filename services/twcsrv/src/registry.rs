//! Slave registry
//!
//! Discovered slaves in the order they first appeared. The order doubles as
//! the heartbeat round-robin order and decides who is evicted when a fourth
//! slave shows up.

use tracing::{info, warn};
use twc_protocol::{ProtocolVersion, TwcId};

use crate::config::CoreConfig;
use crate::slave::{PeerLoad, SlaveState};

/// The bus supports at most this many slaves
pub const MAX_SLAVES: usize = 3;

/// Outcome of [`SlaveRegistry::upsert`]
#[derive(Debug)]
pub struct Upsert<'a> {
    pub slave: &'a mut SlaveState,
    pub created: bool,
    /// Oldest slave, dropped to make room
    pub evicted: Option<SlaveState>,
}

#[derive(Debug, Default)]
pub struct SlaveRegistry {
    slaves: Vec<SlaveState>,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    pub fn lookup(&self, id: &TwcId) -> Option<&SlaveState> {
        self.slaves.iter().find(|s| &s.id == id)
    }

    pub fn get_mut(&mut self, id: &TwcId) -> Option<&mut SlaveState> {
        self.slaves.iter_mut().find(|s| &s.id == id)
    }

    /// Return the slave for `id`, creating it from linkready data if unknown
    pub fn upsert(
        &mut self,
        id: TwcId,
        sign: u8,
        max_amps: f64,
        protocol: ProtocolVersion,
        config: &CoreConfig,
        now: f64,
    ) -> Upsert<'_> {
        if let Some(pos) = self.slaves.iter().position(|s| s.id == id) {
            return Upsert {
                slave: &mut self.slaves[pos],
                created: false,
                evicted: None,
            };
        }

        let evicted = if self.slaves.len() >= MAX_SLAVES {
            let oldest = self.slaves.remove(0);
            warn!(
                "More than {} slave TWCs seen on the bus, dropping {}",
                MAX_SLAVES, oldest.id
            );
            Some(oldest)
        } else {
            None
        };

        info!(
            "New slave TWC {} (protocol {}, {:.2}A max)",
            id,
            protocol.number(),
            max_amps
        );
        self.slaves
            .push(SlaveState::new(id, sign, max_amps, protocol, config, now));
        let last = self.slaves.len() - 1;
        Upsert {
            slave: &mut self.slaves[last],
            created: true,
            evicted,
        }
    }

    pub fn evict(&mut self, id: &TwcId) -> Option<SlaveState> {
        let pos = self.slaves.iter().position(|s| &s.id == id)?;
        Some(self.slaves.remove(pos))
    }

    /// Drop every slave silent for longer than the liveness timeout
    pub fn evict_stale(&mut self, now: f64) -> Vec<SlaveState> {
        let (stale, live): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.slaves).into_iter().partition(|s| s.is_stale(now));
        self.slaves = live;
        for slave in &stale {
            warn!(
                "Slave TWC {} timed out after {:.0}s without a frame",
                slave.id,
                now - slave.time_last_rx
            );
        }
        stale
    }

    pub fn all(&self) -> &[SlaveState] {
        &self.slaves
    }

    pub fn all_mut(&mut self) -> &mut [SlaveState] {
        &mut self.slaves
    }

    /// Slave at a round-robin position
    pub fn at(&self, index: usize) -> Option<&SlaveState> {
        self.slaves.get(index)
    }

    /// Loads of every slave except `id`
    pub fn others(&self, id: &TwcId) -> Vec<PeerLoad> {
        self.slaves
            .iter()
            .filter(|s| &s.id != id)
            .map(SlaveState::peer_load)
            .collect()
    }

    /// Total amps currently drawn by all slaves
    pub fn total_amps_actual(&self) -> f64 {
        self.slaves.iter().map(|s| s.reported_amps_actual).sum()
    }
}
