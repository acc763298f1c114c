// vim: tw=80
//! Per-target I/O accumulation and batching into protocol requests

use std::fmt::{self, Debug, Formatter};

use crate::{
    buf::PageFlags,
    layout::{Layout, UnitKind},
    pargrp::{CellKind, ParityGroupMap},
    pool::DeviceState,
    types::*,
};

/// Names one page buffer of one of a request's parity group maps
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BufRef {
    /// Index of the map within the request
    pub map: usize,
    pub kind: CellKind,
    pub row: usize,
    pub col: usize,
}

impl BufRef {
    /// Index of the unit within its group
    pub fn unit(&self, layout: &Layout) -> u32 {
        match self.kind {
            CellKind::Data => self.col as u32,
            CellKind::Parity => layout.n() + self.col as u32,
        }
    }
}

/// One page of a target's I/O
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Seg {
    /// Byte offset within the component object
    pub offset: u64,
    pub buf: BufRef,
    /// The page's flags at the time it was added
    pub flags: PageFlags,
}

/// A target keeps two segment lists.  The degraded one is filled only after a
/// normal pass, so the normal one stays intact for retries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Vector {
    Normal,
    Degraded
}

/// Selects which segments become protocol requests
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FopFilter {
    pub dir: IoDir,
    /// Segments must have at least one of these
    pub any: PageFlags,
    /// Segments must have none of these
    pub none: PageFlags,
    pub vector: Vector,
}

impl FopFilter {
    /// Fetch pages marked for reading
    pub fn read(vector: Vector) -> Self {
        let any = match vector {
            Vector::Normal => PageFlags::READ,
            Vector::Degraded => PageFlags::READ | PageFlags::DEGRADED_READ
        };
        FopFilter {
            dir: IoDir::Read,
            any,
            none: PageFlags::READ_FAILED,
            vector
        }
    }

    /// Store pages marked for writing
    pub fn write(vector: Vector) -> Self {
        FopFilter {
            dir: IoDir::Write,
            any: PageFlags::WRITE,
            none: PageFlags::empty(),
            vector
        }
    }

    fn matches(&self, seg: &Seg) -> bool {
        seg.flags.intersects(self.any) && !seg.flags.intersects(self.none)
    }
}

/// Size limits of one protocol request
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FopLimits {
    pub max_bytes: u64,
    pub max_segs: usize,
}

/// Buffers of one protocol request, with the target offset of each
pub enum FopBufs {
    Read(Vec<(u64, IoVecMut)>),
    Write(Vec<(u64, IoVec)>),
}

/// One protocol request ("file operation") to a single target
pub struct Fop {
    pub tgt: TargetId,
    /// The pool version the request was built against
    pub pool_version: u64,
    pub bufs: FopBufs,
}

impl Fop {
    fn new(tgt: TargetId, pool_version: u64, dir: IoDir) -> Self {
        let bufs = match dir {
            IoDir::Read => FopBufs::Read(Vec::new()),
            IoDir::Write => FopBufs::Write(Vec::new()),
        };
        Fop{tgt, pool_version, bufs}
    }

    pub fn dir(&self) -> IoDir {
        match self.bufs {
            FopBufs::Read(_) => IoDir::Read,
            FopBufs::Write(_) => IoDir::Write,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nsegs() == 0
    }

    /// Payload size in bytes
    pub fn len(&self) -> u64 {
        match &self.bufs {
            FopBufs::Read(v) => v.iter().map(|(_, b)| b.len() as u64).sum(),
            FopBufs::Write(v) => v.iter().map(|(_, b)| b.len() as u64).sum(),
        }
    }

    pub fn nsegs(&self) -> usize {
        match &self.bufs {
            FopBufs::Read(v) => v.len(),
            FopBufs::Write(v) => v.len(),
        }
    }
}

impl Debug for Fop {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Fop")
            .field("tgt", &self.tgt)
            .field("pool_version", &self.pool_version)
            .field("dir", &self.dir())
            .field("nsegs", &self.nsegs())
            .field("len", &self.len())
            .finish()
    }
}

/// All of one request's I/O to a single component object
#[derive(Debug)]
pub struct TargetIoReq {
    tgt: TargetId,
    state: DeviceState,
    segs: Vec<Seg>,
    dg_segs: Vec<Seg>,
    /// Outstanding protocol requests
    pending: usize,
    /// First error reported by this target
    rc: Option<Error>,
    /// Bytes transferred successfully
    bytes: u64,
    /// Did the target reject a request for carrying an old pool version?
    stale: bool,
}

impl TargetIoReq {
    pub fn new(tgt: TargetId, state: DeviceState) -> Self {
        TargetIoReq {
            tgt,
            state,
            segs: Vec::new(),
            dg_segs: Vec::new(),
            pending: 0,
            rc: None,
            bytes: 0,
            stale: false
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Forget an error that the caller has decided to handle otherwise
    pub(crate) fn clear_rc(&mut self) -> Option<Error> {
        self.rc.take()
    }

    pub(crate) fn fop_done(&mut self, result: Result<u64>) {
        debug_assert!(self.pending > 0);
        self.pending -= 1;
        match result {
            Ok(bytes) => self.bytes += bytes,
            Err(e) if e.is_stale() => {
                tracing::debug!(tgt = %self.tgt, "stale pool version");
                self.stale = true;
            }
            Err(e) => {
                tracing::warn!(tgt = %self.tgt, error = ?e, "I/O error");
                self.rc.get_or_insert(e);
            }
        }
    }

    pub(crate) fn fop_sent(&mut self) {
        self.pending += 1;
    }

    /// Build the protocol requests for this target's segments that match
    /// `filter`.
    ///
    /// Segments are batched in order, a new request opening whenever the next
    /// segment would break `limits`.  Requests with nothing in them are never
    /// built.  Normal writes to a target that isn't online are silently
    /// dropped; repair will restore those units.
    pub fn iofops_prepare(&self, maps: &[ParityGroupMap], filter: &FopFilter,
                          limits: &FopLimits, pool_version: u64)
        -> Result<Vec<Fop>>
    {
        if !self.state.is_online() {
            return Ok(Vec::new());
        }
        let segs = match filter.vector {
            Vector::Normal => &self.segs,
            Vector::Degraded => &self.dg_segs,
        };
        let mut fops = Vec::new();
        let mut fop = Fop::new(self.tgt, pool_version, filter.dir);
        let mut fop_bytes = 0;
        for seg in segs.iter().filter(|s| filter.matches(s)) {
            let b = seg.buf;
            let buf = maps[b.map].cell(b.kind, b.row, b.col)
                .ok_or(Error::EINVAL)?;
            let page = maps[b.map].layout().page_size();
            if !fop.is_empty() && (fop_bytes + page > limits.max_bytes ||
                                   fop.nsegs() >= limits.max_segs)
            {
                let full = std::mem::replace(&mut fop,
                    Fop::new(self.tgt, pool_version, filter.dir));
                fops.push(full);
                fop_bytes = 0;
            }
            match &mut fop.bufs {
                FopBufs::Read(v) => v.push((seg.offset, buf.read_target()?)),
                FopBufs::Write(v) => v.push((seg.offset, buf.contents()?)),
            }
            fop_bytes += page;
        }
        if !fop.is_empty() {
            fops.push(fop);
        }
        Ok(fops)
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn rc(&self) -> Option<Error> {
        self.rc
    }

    pub fn segs(&self, vector: Vector) -> &[Seg] {
        match vector {
            Vector::Normal => &self.segs,
            Vector::Degraded => &self.dg_segs,
        }
    }

    /// Add part of a unit to the target.
    ///
    /// # Parameters
    ///
    /// - `frame`:          Where the unit lives on this target
    /// - `unit_offset`:    Page-aligned offset of the part within the unit
    /// - `unit`:           The unit whose buffers back the part.  When
    ///                     writing to a spare, this is the unit it replaces.
    /// - `len`:            Length of the part in bytes
    #[allow(clippy::too_many_arguments)]
    pub fn segment_add(&mut self, layout: &Layout, map: &ParityGroupMap,
                       map_idx: usize, frame: u64, unit_offset: u64, unit: u32,
                       len: u64, vector: Vector)
    {
        let psize = layout.page_size();
        let (kind, col) = match layout.unit_classify(unit) {
            UnitKind::Data => (CellKind::Data, unit as usize),
            UnitKind::Parity =>
                (CellKind::Parity, (unit - layout.n()) as usize),
            UnitKind::Spare => {
                debug_assert!(false, "spare units have no buffers");
                return;
            }
        };
        let segs = match vector {
            Vector::Normal => &mut self.segs,
            Vector::Degraded => &mut self.dg_segs,
        };
        for uoff in (unit_offset..unit_offset + len).step_by(psize as usize) {
            let row = (uoff / psize) as usize;
            let Some(buf) = map.cell(kind, row, col) else {
                continue;
            };
            segs.push(Seg {
                offset: layout.target_offset(frame, uoff),
                buf: BufRef{map: map_idx, kind, row, col},
                flags: buf.flags()
            });
        }
    }

    pub(crate) fn set_state(&mut self, state: DeviceState) {
        self.state = state;
    }

    pub(crate) fn clear_stale(&mut self) {
        self.stale = false;
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn tgt(&self) -> TargetId {
        self.tgt
    }
}

// LCOV_EXCL_STOP
