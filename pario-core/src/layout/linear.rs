// vim: tw=80
//! The linear declustered layout
//!
//! Units are numbered consecutively across all groups, `idx = g * W + u`, and
//! dealt out to the pool's devices round-robin.  When the pool is wider than a
//! group, consecutive groups land on overlapping but shifted device sets, which
//! spreads reconstruction load after a failure.

use super::{Locator, SrcAddr, TgtAddr};

#[derive(Clone, Debug)]
pub struct LinearLocator {
    /// Units per group
    width: u32,
    /// Devices in the pool
    devices: u32,
}

impl LinearLocator {
    pub fn new(width: u32, devices: u32) -> Self {
        assert!(devices >= width, "pool must be at least one group wide");
        LinearLocator{width, devices}
    }
}

impl Locator for LinearLocator {
    fn devices(&self) -> u32 {
        self.devices
    }

    fn id2loc(&self, src: SrcAddr) -> TgtAddr {
        let idx = src.group * u64::from(self.width) + u64::from(src.unit);
        let p = u64::from(self.devices);
        TgtAddr {
            dev: (idx % p) as u32,
            frame: idx / p
        }
    }

    fn loc2id(&self, tgt: TgtAddr) -> SrcAddr {
        let idx = tgt.frame * u64::from(self.devices) + u64::from(tgt.dev);
        let w = u64::from(self.width);
        SrcAddr {
            group: idx / w,
            unit: (idx % w) as u32
        }
    }
}

// LCOV_EXCL_STOP
