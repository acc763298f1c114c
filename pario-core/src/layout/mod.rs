// vim: tw=80
//! Striped parity-group layouts
//!
//! A file is divided into parity groups of `N` data units.  Each group is
//! stored as `W = N + 2K` units: the `N` data units, `K` parity units, and `K`
//! spare units that receive the contents of failed devices once they have been
//! repaired.  A unit is a fixed number of pages.  Within a group, byte offsets
//! are laid out column-major: the first `unit_size` bytes belong to data unit
//! 0, the next `unit_size` bytes to data unit 1, and so on.
//!
//! Everything here is pure arithmetic.  A `Locator` maps each (group, unit)
//! pair onto a device and a frame within that device's component object.

use enum_dispatch::enum_dispatch;
use serde_derive::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

use crate::{
    config::LayoutConfig,
    extent::Extent,
    types::*,
    util::ZERO_REGION_LEN,
};

mod linear;
mod rotating;

pub use self::linear::LinearLocator;
pub use self::rotating::RotatingLocator;

/// Which `Locator` a layout uses.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutAlgorithm {
    /// Groups declustered over a pool of any width
    #[default]
    Linear,
    /// One group per frame, rotated across exactly `N + 2K` devices
    Rotating,
}

/// Address of a unit within the file's logical group space
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SrcAddr {
    pub group: u64,
    pub unit: u32
}

impl SrcAddr {
    pub const fn new(group: u64, unit: u32) -> Self {
        SrcAddr{group, unit}
    }
}

/// Address of a unit on a storage device
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TgtAddr {
    pub dev: u32,
    /// Which unit-sized slot of the component object
    pub frame: u64
}

impl TgtAddr {
    pub const fn new(dev: u32, frame: u64) -> Self {
        TgtAddr{dev, frame}
    }
}

/// What a unit of a parity group holds
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnitKind {
    Data,
    Parity,
    Spare
}

/// Position of a page within a parity group's buffer matrix
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PagePos {
    /// Page index within its unit
    pub row: usize,
    /// Unit index within the group
    pub col: usize
}

impl Display for PagePos {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Maps units between a file's group space and the pool's devices
#[enum_dispatch]
pub trait Locator {
    /// Number of devices the layout spreads over
    fn devices(&self) -> u32;

    /// Return the location of the given unit
    fn id2loc(&self, src: SrcAddr) -> TgtAddr;

    /// Return the unit stored at the given location
    fn loc2id(&self, tgt: TgtAddr) -> SrcAddr;
}

#[enum_dispatch(Locator)]
#[derive(Clone, Debug)]
pub enum LocatorImpl {
    Linear(LinearLocator),
    Rotating(RotatingLocator),
}

/// Geometry of a file's striping
#[derive(Clone, Debug)]
pub struct Layout {
    /// Data units per group
    n: u32,
    /// Parity units per group.  Also the number of spare units.
    k: u32,
    unit_size: u64,
    page_size: u64,
    locator: LocatorImpl,
}

impl Layout {
    pub fn new(cfg: &LayoutConfig) -> Result<Self> {
        let n = cfg.data_units;
        let k = cfg.parity_units;
        let page = cfg.page_size;
        if n < 1 || k < 1 || n + k > 256 {
            tracing::warn!(n, k, "unsupported group geometry");
            return Err(Error::EINVAL);
        }
        if !page.is_power_of_two() || page > ZERO_REGION_LEN as u64 {
            tracing::warn!(page, "unsupported page size");
            return Err(Error::EINVAL);
        }
        if cfg.unit_size == 0 || cfg.unit_size % page != 0 {
            tracing::warn!(unit_size = cfg.unit_size, page,
                "unit size must be a positive multiple of the page size");
            return Err(Error::EINVAL);
        }
        let width = n + 2 * k;
        let locator = match cfg.algorithm {
            LayoutAlgorithm::Linear if cfg.pool_width >= width =>
                LinearLocator::new(width, cfg.pool_width).into(),
            LayoutAlgorithm::Rotating if cfg.pool_width == width =>
                RotatingLocator::new(width).into(),
            _ => {
                tracing::warn!(algorithm = ?cfg.algorithm,
                    pool_width = cfg.pool_width, width,
                    "pool width does not fit the layout");
                return Err(Error::EINVAL);
            }
        };
        Ok(Layout {
            n,
            k,
            unit_size: cfg.unit_size,
            page_size: page,
            locator
        })
    }

    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    /// Total units per group, including parity and spares
    pub fn width(&self) -> u32 {
        self.n + 2 * self.k
    }

    pub fn unit_size(&self) -> u64 {
        self.unit_size
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn pool_width(&self) -> u32 {
        self.locator.devices()
    }

    /// Number of pages in one unit.  Also the number of rows in a group's
    /// buffer matrix.
    pub fn rows(&self) -> usize {
        (self.unit_size / self.page_size) as usize
    }

    /// Bytes of file data stored by one parity group
    pub fn group_data_size(&self) -> u64 {
        self.unit_size * u64::from(self.n)
    }

    /// Number of data pages in one parity group
    pub fn group_pages(&self) -> u64 {
        self.group_data_size() / self.page_size
    }

    /// Number of parity pages in one parity group
    pub fn parity_pages(&self) -> u64 {
        self.unit_size / self.page_size * u64::from(self.k)
    }

    pub fn group_of(&self, offset: u64) -> u64 {
        offset / self.group_data_size()
    }

    pub fn group_start(&self, group: u64) -> u64 {
        group * self.group_data_size()
    }

    /// End of the file byte range stored by `group`, if it is addressable
    pub fn group_end(&self, group: u64) -> Option<u64> {
        group.checked_add(1)?.checked_mul(self.group_data_size())
    }

    /// The file byte range stored by `group`
    pub fn group_extent(&self, group: u64) -> Extent {
        let start = self.group_start(group);
        Extent{start, end: start + self.group_data_size()}
    }

    /// Locate the page containing `offset` within its group's matrix
    pub fn page_position(&self, group: u64, offset: u64) -> PagePos {
        debug_assert_eq!(self.group_of(offset), group);
        let goff = offset - self.group_start(group);
        let page = goff / self.page_size;
        let rows = self.unit_size / self.page_size;
        PagePos {
            row: (page % rows) as usize,
            col: (page / rows) as usize
        }
    }

    /// Inverse of `page_position`: the file offset of a data cell
    pub fn page_offset(&self, group: u64, pos: PagePos) -> u64 {
        self.group_start(group)
            + pos.col as u64 * self.unit_size
            + pos.row as u64 * self.page_size
    }

    /// Byte offset within a component object
    pub fn target_offset(&self, frame: u64, unit_offset: u64) -> u64 {
        debug_assert!(unit_offset < self.unit_size);
        frame * self.unit_size + unit_offset
    }

    pub fn unit_classify(&self, unit: u32) -> UnitKind {
        if unit < self.n {
            UnitKind::Data
        } else if unit < self.n + self.k {
            UnitKind::Parity
        } else {
            debug_assert!(unit < self.width());
            UnitKind::Spare
        }
    }

    /// Index of the spare unit that replaces the device holding spare slot
    /// `slot`
    pub fn spare_unit(&self, slot: u32) -> u32 {
        debug_assert!(slot < self.k);
        self.n + self.k + slot
    }

    pub fn src_to_tgt(&self, src: SrcAddr) -> TgtAddr {
        debug_assert!(src.unit < self.width());
        self.locator.id2loc(src)
    }

    pub fn tgt_to_src(&self, tgt: TgtAddr) -> SrcAddr {
        self.locator.loc2id(tgt)
    }
}

// LCOV_EXCL_STOP
