//! Randomized fault injection on the node's data path.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crossbar_core::config::FaultConfig;

/// Rolls the two per-frame fault dice: corrupt-on-send and ack-withhold.
pub struct FaultInjector {
    rng: SmallRng,
    corrupt_percent: u8,
    ack_drop_percent: u8,
}

impl FaultInjector {
    pub fn new(cfg: &FaultConfig) -> Self {
        Self {
            rng: SmallRng::from_entropy(),
            corrupt_percent: cfg.corrupt_percent,
            ack_drop_percent: cfg.ack_drop_percent,
        }
    }

    /// Transmit a checksum-damaged copy of the next data frame?
    pub fn corrupt_send(&mut self) -> bool {
        self.roll(self.corrupt_percent)
    }

    /// Accept the next inbound data frame but withhold the ack?
    pub fn drop_ack(&mut self) -> bool {
        self.roll(self.ack_drop_percent)
    }

    fn roll(&mut self, percent: u8) -> bool {
        percent > 0 && self.rng.gen_range(1..=100u32) <= u32::from(percent)
    }
}
