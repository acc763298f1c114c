// vim: tw=80
//! The rotating layout
//!
//! The pool is exactly one group wide.  Group `g` occupies frame `g` of every
//! device, and its units are rotated by `g` so that parity and spare units are
//! spread evenly over all devices.

use super::{Locator, SrcAddr, TgtAddr};

#[derive(Clone, Debug)]
pub struct RotatingLocator {
    width: u32,
}

impl RotatingLocator {
    pub fn new(width: u32) -> Self {
        RotatingLocator{width}
    }
}

impl Locator for RotatingLocator {
    fn devices(&self) -> u32 {
        self.width
    }

    fn id2loc(&self, src: SrcAddr) -> TgtAddr {
        let w = u64::from(self.width);
        TgtAddr {
            dev: ((u64::from(src.unit) + src.group % w) % w) as u32,
            frame: src.group
        }
    }

    fn loc2id(&self, tgt: TgtAddr) -> SrcAddr {
        let w = u64::from(self.width);
        SrcAddr {
            group: tgt.frame,
            unit: ((u64::from(tgt.dev) + w - tgt.frame % w) % w) as u32
        }
    }
}

// LCOV_EXCL_STOP
