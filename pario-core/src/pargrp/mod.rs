// vim: tw=80
//! Per-parity-group I/O planning
//!
//! A `ParityGroupMap` turns the slice of a request that falls within one parity
//! group into a page-aligned plan: which pages must be read, which written,
//! which buffers back them, and how parity will be kept consistent.
//!
//! A write that covers less than a whole group needs the rest of the group's
//! contents to compute parity.  There are two ways to get them:
//!
//! * *read-old* reads the previous contents of just the pages being written,
//!   plus the old parity, and updates parity by the difference.
//! * *read-rest* reads every page of the group that is not being overwritten
//!   and recomputes parity from scratch.

use fixedbitset::FixedBitSet;
use std::cmp;

use crate::{
    buf::{BufAlloc, BufMatrix, DataBuf, PageFlags},
    codec::Codec,
    extent::{Extent, ExtentList},
    layout::{Layout, PagePos, UnitKind},
    types::*,
    util::{round_down, round_up, xor_into, zero_page},
};


/// How a write keeps parity consistent when it doesn't cover a whole group
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RmwKind {
    /// Not a read-modify-write.  Parity is computed from the new data alone.
    #[default]
    None,
    ReadOld,
    ReadRest,
}

/// Selects one of a map's two buffer matrices
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CellKind {
    Data,
    Parity
}

/// Estimated page I/O of each read-modify-write strategy
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RmwCost {
    pub read_old: u64,
    pub read_rest: u64,
}

impl RmwCost {
    /// Estimate the cost of each strategy for a group.
    ///
    /// # Parameters
    ///
    /// - `touched`:    Data pages within the write's page-rounded extents
    /// - `fullmod`:    How many of those are entirely overwritten
    pub fn estimate(layout: &Layout, touched: u64, fullmod: u64) -> Self {
        debug_assert!(fullmod <= touched);
        let parity = layout.parity_pages();
        let group = layout.group_pages();
        RmwCost {
            // Read the touched pages that aren't fully overwritten and the
            // parity, then write the touched pages and the parity.
            read_old: (touched - fullmod + parity) + (touched + parity),
            // Read everything not fully overwritten, then write the whole
            // group and its parity.
            read_rest: (group - fullmod) + (group + parity),
        }
    }

    /// The cheaper strategy.  Ties go to read-old.
    pub fn choice(&self) -> RmwKind {
        if self.read_old <= self.read_rest {
            RmwKind::ReadOld
        } else {
            RmwKind::ReadRest
        }
    }
}

/// The I/O plan for one parity group of one request
#[derive(Debug)]
pub struct ParityGroupMap {
    grpid: u64,
    dir: IoDir,
    layout: Layout,
    alloc: BufAlloc,
    /// Page-aligned file extents that this group must transfer
    exts: ExtentList,
    rmw: RmwKind,
    degraded: bool,
    /// Units of the group, by index, that can't be read
    failed: FixedBitSet,
    /// Indexed by `[page row][data unit]`
    data: BufMatrix,
    /// Indexed by `[page row][parity unit]`
    parity: BufMatrix,
}

impl ParityGroupMap {
    pub fn new(grpid: u64, dir: IoDir, layout: &Layout, alloc: &BufAlloc)
        -> Self
    {
        let rows = layout.rows();
        let n = layout.n() as usize;
        let k = layout.k() as usize;
        ParityGroupMap {
            grpid,
            dir,
            layout: layout.clone(),
            alloc: alloc.clone(),
            exts: ExtentList::new(),
            rmw: RmwKind::None,
            degraded: false,
            failed: FixedBitSet::with_capacity(n + k),
            data: BufMatrix::new(rows, n),
            parity: BufMatrix::new(rows, k),
        }
    }

    pub fn cell(&self, kind: CellKind, row: usize, col: usize)
        -> Option<&DataBuf>
    {
        match kind {
            CellKind::Data => self.data.get(row, col),
            CellKind::Parity => self.parity.get(row, col),
        }
    }

    /// Iterate over the allocated cells of one matrix
    pub fn cells(&self, kind: CellKind)
        -> impl Iterator<Item=(usize, usize, &DataBuf)>
    {
        match kind {
            CellKind::Data => self.data.iter(),
            CellKind::Parity => self.parity.iter(),
        }
    }

    /// Copy caller data into the group's data pages.
    ///
    /// Only pages with at least one of the flags in `filter` are written.
    /// `[off, off + src.len())` must lie within this group's extents.
    pub fn copy_in(&self, off: u64, src: &[u8], filter: PageFlags)
        -> Result<()>
    {
        self.for_each_page(off, src.len(), |buf, poff, range| {
            if buf.flags().intersects(filter) {
                buf.contents_mut()?[poff..poff + range.len()]
                    .copy_from_slice(&src[range]);
            }
            Ok(())
        })
    }

    /// Copy data out of the group's data pages into the caller's buffer
    pub fn copy_out(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.for_each_page(off, dst.len(), |buf, poff, range| {
            let contents = buf.contents()?;
            dst[range.clone()]
                .copy_from_slice(&contents[poff..poff + range.len()]);
            Ok(())
        })
    }

    fn count_flags(&self, flags: PageFlags) -> u64 {
        self.data.iter()
            .filter(|(_, _, buf)| buf.flags().contains(flags))
            .count() as u64
    }

    /// Expand a degraded group so that every lost page can be reconstructed.
    ///
    /// The map grows to cover the whole group, up to end of file.  Every
    /// surviving page that hasn't already been read is marked
    /// `DEGRADED_READ`, and every page of a failed unit `READ_FAILED`.  A
    /// read-old group becomes a read-rest group, because its parity can no
    /// longer be updated incrementally.
    pub fn dgmode_postprocess(&mut self, file_size: u64) -> Result<()> {
        if !self.degraded {
            return Ok(());
        }
        if self.rmw == RmwKind::ReadOld {
            for (_, _, buf) in self.data.iter_mut() {
                buf.discard_aux();
            }
            self.rmw = RmwKind::ReadRest;
        }
        let whole = self.eof_clamped_group(file_size);
        let mut added = Vec::new();
        let r = self.dgmode_alloc(&whole, &mut added);
        if r.is_err() {
            for (kind, row, col) in added {
                match kind {
                    CellKind::Data => self.data.take(row, col),
                    CellKind::Parity => self.parity.take(row, col),
                };
            }
            return r;
        }
        self.exts.insert(whole);
        Ok(())
    }

    fn dgmode_alloc(&mut self, whole: &Extent,
                    added: &mut Vec<(CellKind, usize, usize)>) -> Result<()>
    {
        let n = self.layout.n() as usize;
        let psize = self.layout.page_size();
        let wflag = if self.dir == IoDir::Write {
            PageFlags::WRITE
        } else {
            PageFlags::empty()
        };
        for off in (whole.start..whole.end).step_by(psize as usize) {
            let pos = self.layout.page_position(self.grpid, off);
            if self.data.get(pos.row, pos.col).is_none() {
                added.push((CellKind::Data, pos.row, pos.col));
            }
            let failed = self.failed.contains(pos.col);
            let buf = self.data.get_or_alloc(pos.row, pos.col, &self.alloc,
                PageFlags::DATA | wflag)?;
            Self::dgmode_mark(buf, failed);
        }
        for row in 0..self.parity.rows() {
            for col in 0..self.parity.cols() {
                if self.parity.get(row, col).is_none() {
                    added.push((CellKind::Parity, row, col));
                }
                let failed = self.failed.contains(n + col);
                let buf = self.parity.get_or_alloc(row, col, &self.alloc,
                    PageFlags::PARITY | wflag)?;
                Self::dgmode_mark(buf, failed);
            }
        }
        Ok(())
    }

    fn dgmode_mark(buf: &mut DataBuf, failed: bool) {
        if failed {
            buf.set_flags(PageFlags::READ_FAILED);
        } else if !buf.flags().contains(PageFlags::READ) {
            buf.set_flags(PageFlags::DEGRADED_READ);
        }
    }

    /// Record that `unit` of this group can't be read, marking the group
    /// degraded.
    pub fn dgmode_process(&mut self, unit: u32) {
        let n = self.layout.n();
        let (matrix, col) = match self.layout.unit_classify(unit) {
            UnitKind::Data => (&mut self.data, unit),
            UnitKind::Parity => (&mut self.parity, unit - n),
            UnitKind::Spare => {
                // Spares are addressed only on behalf of other units
                return;
            }
        };
        for row in 0..matrix.rows() {
            if let Some(buf) = matrix.get_mut(row, col as usize) {
                buf.set_flags(PageFlags::READ_FAILED);
            }
        }
        if !self.failed.contains(unit as usize) {
            tracing::debug!(group = self.grpid, unit, "unit lost");
        }
        self.failed.insert(unit as usize);
        self.degraded = true;
    }

    /// Reconstruct the pages of failed units, row by row.
    pub fn dgmode_recover(&mut self, codec: &Codec) -> Result<()> {
        if !self.degraded {
            return Ok(());
        }
        let n = self.layout.n() as usize;
        let k = self.layout.k() as usize;
        if self.failed.count_ones(..) > k {
            tracing::error!(group = self.grpid,
                failed = self.failed.count_ones(..),
                "too many units lost to reconstruct");
            return Err(Error::EIO);
        }
        let psize = self.layout.page_size() as usize;
        for row in 0..self.data.rows() {
            let mut erasures = FixedBitSet::with_capacity(n + k);
            let mut columns = Vec::with_capacity(n + k);
            for u in 0..n + k {
                let cell = if u < n {
                    self.data.get(row, u)
                } else {
                    self.parity.get(row, u - n)
                };
                match cell {
                    Some(_) if self.failed.contains(u) => {
                        erasures.insert(u);
                        columns.push(vec![0u8; psize]);
                    }
                    Some(buf) => columns.push(buf.contents()?.to_vec()),
                    // Beyond end of file
                    None => columns.push(vec![0u8; psize]),
                }
            }
            if erasures.count_ones(..) == 0 {
                continue;
            }
            codec.decode(&mut columns, &erasures)?;
            for u in erasures.ones() {
                let cell = if u < n {
                    self.data.get(row, u)
                } else {
                    self.parity.get(row, u - n)
                };
                if let Some(buf) = cell {
                    buf.contents_mut()?.copy_from_slice(&columns[u]);
                }
            }
        }
        Ok(())
    }

    pub fn dir(&self) -> IoDir {
        self.dir
    }

    /// The whole group, truncated at the page containing end of file or at
    /// the end of the map's current extents, whichever is later.
    fn eof_clamped_group(&self, file_size: u64) -> Extent {
        let gext = self.layout.group_extent(self.grpid);
        let eof = round_up(file_size, self.layout.page_size());
        let span_end = self.exts.span().map(|e| e.end).unwrap_or(gext.start);
        let end = cmp::min(gext.end, cmp::max(eof, span_end));
        Extent{start: gext.start, end: cmp::max(end, gext.start)}
    }

    pub fn extents(&self) -> &ExtentList {
        &self.exts
    }

    pub fn failed(&self) -> &FixedBitSet {
        &self.failed
    }

    /// Call `f` for each page touched by `[off, off + len)`, with the page's
    /// buffer, the offset within the page, and the corresponding range of the
    /// caller's buffer.
    fn for_each_page<F>(&self, off: u64, len: usize, mut f: F) -> Result<()>
        where F: FnMut(&DataBuf, usize, std::ops::Range<usize>) -> Result<()>
    {
        let psize = self.layout.page_size();
        let mut done = 0usize;
        while done < len {
            let o = off + done as u64;
            let poff = (o - round_down(o, psize)) as usize;
            let chunk = cmp::min(len - done, psize as usize - poff);
            let pos = self.layout.page_position(self.grpid, o);
            let buf = self.data.get(pos.row, pos.col).ok_or_else(|| {
                tracing::error!(group = self.grpid, offset = o,
                    "no page planned for offset");
                Error::EINVAL
            })?;
            f(buf, poff, done..done + chunk)?;
            done += chunk;
        }
        Ok(())
    }

    pub fn grpid(&self) -> u64 {
        self.grpid
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Does this map carry parity?
    pub fn has_parity(&self) -> bool {
        !self.parity.is_empty()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Recompute the group's parity from its data pages.
    ///
    /// Read-old groups apply the difference between each page's old and new
    /// contents to the old parity.  Everything else computes parity from
    /// whole rows, treating unplanned pages as zero.
    pub fn parity_recalc(&self, codec: &Codec) -> Result<()> {
        debug_assert_eq!(self.dir, IoDir::Write);
        match self.rmw {
            RmwKind::ReadOld => self.parity_update(codec),
            RmwKind::None | RmwKind::ReadRest => self.parity_calc(codec),
        }
    }

    fn parity_calc(&self, codec: &Codec) -> Result<()> {
        let zero = zero_page(self.layout.page_size() as usize);
        for row in 0..self.data.rows() {
            let dbufs = (0..self.data.cols())
                .map(|col| self.data.get(row, col)
                     .map(DataBuf::contents)
                     .transpose())
                .collect::<Result<Vec<_>>>()?;
            let drefs = dbufs.iter()
                .map(|d| d.as_ref().map(|d| &d[..]).unwrap_or(zero))
                .collect::<Vec<_>>();
            let mut pbufs = self.parity_row_mut(row)?;
            let mut prefs = pbufs.iter_mut()
                .map(|p| &mut p[..])
                .collect::<Vec<_>>();
            codec.encode(&drefs, &mut prefs)?;
        }
        Ok(())
    }

    fn parity_row_mut(&self, row: usize) -> Result<Vec<IoVecMut>> {
        (0..self.parity.cols())
            .map(|col| self.parity.get(row, col)
                 .ok_or(Error::EINVAL)
                 .and_then(DataBuf::contents_mut))
            .collect()
    }

    fn parity_update(&self, codec: &Codec) -> Result<()> {
        for row in 0..self.data.rows() {
            let mut pbufs = self.parity_row_mut(row)?;
            let mut prefs = pbufs.iter_mut()
                .map(|p| &mut p[..])
                .collect::<Vec<_>>();
            for col in 0..self.data.cols() {
                let Some(buf) = self.data.get(row, col) else {
                    continue;
                };
                let Some(old) = buf.old_contents()? else {
                    continue;
                };
                let mut delta = old.to_vec();
                xor_into(&mut delta, &buf.contents()?);
                if delta.iter().all(|b| *b == 0) {
                    continue;
                }
                codec.encode_delta(col, &delta, &mut prefs)?;
            }
        }
        Ok(())
    }

    fn parity_alloc(&mut self) -> Result<()> {
        let mut flags = PageFlags::PARITY | PageFlags::WRITE;
        if self.rmw == RmwKind::ReadOld {
            flags |= PageFlags::READ;
        }
        for row in 0..self.parity.rows() {
            for col in 0..self.parity.cols() {
                self.parity.get_or_alloc(row, col, &self.alloc, flags)?
                    .set_flags(flags);
            }
        }
        Ok(())
    }

    /// Plan the group's share of a request.
    ///
    /// `req` is the whole request's extent list; only the part within this
    /// group is used.  On failure every buffer allocated by this call is
    /// freed.
    pub fn populate(&mut self, req: &ExtentList, file_size: u64) -> Result<()>
    {
        let r = self.populate_priv(req, file_size);
        if r.is_err() {
            self.data.clear();
            self.parity.clear();
            self.exts = ExtentList::new();
            self.rmw = RmwKind::None;
        }
        r
    }

    fn populate_priv(&mut self, req: &ExtentList, file_size: u64) -> Result<()>
    {
        let gext = self.layout.group_extent(self.grpid);
        let psize = self.layout.page_size();
        let covered = req.clip(&gext);
        for ext in covered.iter() {
            let seg = ext.round_out(psize);
            self.exts.insert(seg);
            for off in (seg.start..seg.end).step_by(psize as usize) {
                self.seg_process(off, &covered, file_size)?;
            }
        }
        if self.dir == IoDir::Write {
            if covered.total() < self.layout.group_data_size() &&
                gext.start < file_size
            {
                let touched = self.data.count() as u64;
                let fullmod = self.count_flags(PageFlags::FULLPAGE_MODIFY);
                let cost = RmwCost::estimate(&self.layout, touched, fullmod);
                self.rmw = cost.choice();
                tracing::debug!(group = self.grpid, touched, fullmod,
                    read_old = cost.read_old, read_rest = cost.read_rest,
                    rmw = ?self.rmw, "read-modify-write");
                match self.rmw {
                    RmwKind::ReadOld => self.readold_auxbuf_alloc(file_size)?,
                    RmwKind::ReadRest => self.readrest(file_size)?,
                    RmwKind::None => unreachable!(),
                }
            }
            self.parity_alloc()?;
        }
        Ok(())
    }

    /// Allocate a snapshot page for every touched page, and mark those within
    /// the file for reading.
    fn readold_auxbuf_alloc(&mut self, file_size: u64) -> Result<()> {
        for (row, col, buf) in self.data.iter_mut() {
            buf.attach_aux(&self.alloc)?;
            let off = self.layout.page_offset(self.grpid, PagePos{row, col});
            if off < file_size {
                buf.set_flags(PageFlags::READ);
            }
        }
        Ok(())
    }

    /// Extend the map over the whole group, reading every page not already
    /// planned.
    fn readrest(&mut self, file_size: u64) -> Result<()> {
        let whole = self.eof_clamped_group(file_size);
        let psize = self.layout.page_size();
        for off in (whole.start..whole.end).step_by(psize as usize) {
            let pos = self.layout.page_position(self.grpid, off);
            if self.data.get(pos.row, pos.col).is_none() {
                let mut flags = PageFlags::DATA | PageFlags::WRITE;
                if off < file_size {
                    flags |= PageFlags::READ;
                }
                self.data.get_or_alloc(pos.row, pos.col, &self.alloc, flags)?;
            }
        }
        self.exts.insert(whole);
        Ok(())
    }

    /// Get a read-old group ready for the caller's partial pages: each one
    /// starts out as its old contents.
    pub fn readold_merge(&self) -> Result<()> {
        if self.rmw != RmwKind::ReadOld {
            return Ok(());
        }
        for (_, _, buf) in self.data.iter() {
            let flags = PageFlags::PARTPAGE_MODIFY | PageFlags::READ;
            if buf.flags().contains(flags) {
                buf.restore_from_aux()?;
            }
        }
        Ok(())
    }

    pub fn rmw(&self) -> RmwKind {
        self.rmw
    }

    /// Plan one page of the request
    fn seg_process(&mut self, off: u64, covered: &ExtentList, file_size: u64)
        -> Result<()>
    {
        let psize = self.layout.page_size();
        let pos = self.layout.page_position(self.grpid, off);
        let page = Extent{start: off, end: off + psize};
        let mut flags = PageFlags::DATA;
        match self.dir {
            IoDir::Read => flags |= PageFlags::READ,
            IoDir::Write => {
                flags |= PageFlags::WRITE;
                if covered.covers(&page) {
                    flags |= PageFlags::FULLPAGE_MODIFY;
                } else {
                    flags |= PageFlags::PARTPAGE_MODIFY;
                    if off < file_size {
                        flags |= PageFlags::READ;
                    }
                }
            }
        }
        self.data.get_or_alloc(pos.row, pos.col, &self.alloc, flags)?
            .set_flags(flags);
        Ok(())
    }
}
