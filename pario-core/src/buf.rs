// vim: tw=80
//! Page buffers
//!
//! Every page touched by a request is backed by a `DataBuf`, owned by its
//! parity group's `BufMatrix`.  Pages are freed when their owner is dropped, on
//! every path.  The allocator counts allocations and frees so that leaks are
//! observable, and can be told to fail on demand.

use bitflags::bitflags;
use divbuf::DivBufShared;
use std::{
    fmt::{self, Debug, Formatter},
    iter,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
};

use crate::types::*;

bitflags! {
    /// Role and progress of one page within a request
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct PageFlags: u32 {
        /// Must be fetched from storage
        const READ = 1 << 0;
        /// Must be sent to storage
        const WRITE = 1 << 1;
        /// Entirely overwritten by the caller
        const FULLPAGE_MODIFY = 1 << 2;
        /// Partially overwritten by the caller
        const PARTPAGE_MODIFY = 1 << 3;
        const DATA = 1 << 4;
        const PARITY = 1 << 5;
        /// Lives on an unavailable device and must be reconstructed
        const READ_FAILED = 1 << 6;
        /// Fetched only to reconstruct a failed page
        const DEGRADED_READ = 1 << 7;
    }
}

/// Allocation counters for page buffers
#[derive(Debug)]
pub struct BufStats {
    allocated: AtomicU64,
    freed: AtomicU64,
    /// Number of allocations left before an injected failure.  Negative when
    /// disarmed.
    fail_after: AtomicI64,
}

impl Default for BufStats {
    fn default() -> Self {
        BufStats {
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
            fail_after: AtomicI64::new(-1)
        }
    }
}

impl BufStats {
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn freed(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }

    /// Number of pages currently allocated
    pub fn live(&self) -> u64 {
        self.allocated() - self.freed()
    }

    /// Make an allocation fail with `ENOMEM` after `n` more succeed.
    pub fn inject_failure(&self, n: u64) {
        self.fail_after.store(n as i64, Ordering::Relaxed);
    }

    /// Consume one allocation from the failure countdown.  Returns true if
    /// this allocation should fail.
    fn should_fail(&self) -> bool {
        let prev = self.fail_after.fetch_update(Ordering::Relaxed,
            Ordering::Relaxed,
            |n| (n >= 0).then_some(n - 1));
        prev == Ok(0)
    }
}

/// One page of memory, counted by its allocator.
struct Page {
    dbs: DivBufShared,
    stats: Arc<BufStats>,
}

impl Drop for Page {
    fn drop(&mut self) {
        self.stats.freed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Allocates zero-filled pages
#[derive(Clone, Debug)]
pub struct BufAlloc {
    page_size: usize,
    stats: Arc<BufStats>,
}

impl BufAlloc {
    pub fn new(page_size: usize) -> Self {
        BufAlloc{page_size, stats: Arc::new(BufStats::default())}
    }

    pub fn alloc(&self, flags: PageFlags) -> Result<DataBuf> {
        Ok(DataBuf {
            page: self.page()?,
            aux: None,
            flags
        })
    }

    fn page(&self) -> Result<Page> {
        if self.stats.should_fail() {
            tracing::warn!("injected page allocation failure");
            return Err(Error::ENOMEM);
        }
        let mut v = Vec::new();
        v.try_reserve_exact(self.page_size).map_err(|_| Error::ENOMEM)?;
        v.resize(self.page_size, 0);
        self.stats.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(Page{dbs: DivBufShared::from(v), stats: self.stats.clone()})
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn stats(&self) -> &Arc<BufStats> {
        &self.stats
    }
}

/// One page of a parity group, plus an optional snapshot of its previous
/// contents.
pub struct DataBuf {
    page: Page,
    /// Pre-overwrite contents, used for incremental parity
    aux: Option<Page>,
    flags: PageFlags,
}

impl DataBuf {
    /// Allocate the auxiliary page, if it isn't already.
    pub fn attach_aux(&mut self, alloc: &BufAlloc) -> Result<()> {
        if self.aux.is_none() {
            self.aux = Some(alloc.page()?);
        }
        Ok(())
    }

    pub fn contents(&self) -> Result<IoVec> {
        self.page.dbs.try_const().map_err(|_| Error::EBUSY)
    }

    pub fn contents_mut(&self) -> Result<IoVecMut> {
        self.page.dbs.try_mut().map_err(|_| Error::EBUSY)
    }

    /// Drop the auxiliary page, making its contents the primary page's.
    pub fn discard_aux(&mut self) {
        if let Some(aux) = self.aux.take() {
            self.page = aux;
        }
    }

    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    #[cfg(test)]
    pub fn has_aux(&self) -> bool {
        self.aux.is_some()
    }

    /// Previous contents, if they were snapshotted
    pub fn old_contents(&self) -> Result<Option<IoVec>> {
        self.aux.as_ref()
            .map(|aux| aux.dbs.try_const().map_err(|_| Error::EBUSY))
            .transpose()
    }

    /// The buffer that a read from storage should fill: the auxiliary page if
    /// present, otherwise the primary.
    pub fn read_target(&self) -> Result<IoVecMut> {
        self.aux.as_ref()
            .unwrap_or(&self.page)
            .dbs
            .try_mut()
            .map_err(|_| Error::EBUSY)
    }

    /// Copy the auxiliary page over the primary one, keeping both.
    pub fn restore_from_aux(&self) -> Result<()> {
        if let Some(old) = self.old_contents()? {
            self.contents_mut()?.copy_from_slice(&old[..]);
        }
        Ok(())
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        self.flags.insert(flags);
    }
}

impl Debug for DataBuf {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("DataBuf")
            .field("len", &self.page.dbs.len())
            .field("aux", &self.aux.is_some())
            .field("flags", &self.flags)
            .finish()
    }
}

/// A `rows` × `cols` matrix of lazily allocated pages
#[derive(Debug)]
pub struct BufMatrix {
    rows: usize,
    cols: usize,
    cells: Vec<Option<DataBuf>>,
}

impl BufMatrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        let cells = iter::repeat_with(|| None).take(rows * cols).collect();
        BufMatrix{rows, cols, cells}
    }

    fn idx(&self, row: usize, col: usize) -> usize {
        assert!(row < self.rows && col < self.cols,
            "cell ({row}, {col}) outside a {}x{} matrix", self.rows, self.cols);
        row * self.cols + col
    }

    /// Free every page
    pub fn clear(&mut self) {
        for cell in self.cells.iter_mut() {
            *cell = None;
        }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of allocated cells
    pub fn count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&DataBuf> {
        self.cells[self.idx(row, col)].as_ref()
    }

    pub fn get_mut(&mut self, row: usize, col: usize) -> Option<&mut DataBuf> {
        let i = self.idx(row, col);
        self.cells[i].as_mut()
    }

    /// Return the cell at `(row, col)`, allocating it with `flags` if empty.
    pub fn get_or_alloc(&mut self, row: usize, col: usize, alloc: &BufAlloc,
                        flags: PageFlags) -> Result<&mut DataBuf>
    {
        let i = self.idx(row, col);
        let cell = &mut self.cells[i];
        let buf = match cell.take() {
            Some(buf) => buf,
            None => alloc.alloc(flags)?
        };
        Ok(cell.insert(buf))
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(Option::is_none)
    }

    /// Iterate over allocated cells as `(row, col, buf)`
    pub fn iter(&self) -> impl Iterator<Item=(usize, usize, &DataBuf)> {
        let cols = self.cols;
        self.cells.iter()
            .enumerate()
            .filter_map(move |(i, c)| {
                c.as_ref().map(|b| (i / cols, i % cols, b))
            })
    }

    pub fn iter_mut(&mut self)
        -> impl Iterator<Item=(usize, usize, &mut DataBuf)>
    {
        let cols = self.cols;
        self.cells.iter_mut()
            .enumerate()
            .filter_map(move |(i, c)| {
                c.as_mut().map(|b| (i / cols, i % cols, b))
            })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Remove a cell from the matrix
    pub fn take(&mut self, row: usize, col: usize) -> Option<DataBuf> {
        let i = self.idx(row, col);
        self.cells[i].take()
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;
    use super::*;

    #[test]
    fn aux() {
        let alloc = BufAlloc::new(16);
        let mut db = alloc.alloc(PageFlags::DATA).unwrap();
        assert!(db.old_contents().unwrap().is_none());
        db.attach_aux(&alloc).unwrap();
        db.read_target().unwrap().copy_from_slice(&[7u8; 16]);
        assert_eq!(&db.contents().unwrap()[..], &[0u8; 16][..]);
        db.restore_from_aux().unwrap();
        assert_eq!(&db.contents().unwrap()[..], &[7u8; 16][..]);
        assert!(db.has_aux());

        db.read_target().unwrap().copy_from_slice(&[9u8; 16]);
        db.discard_aux();
        assert!(!db.has_aux());
        assert_eq!(&db.contents().unwrap()[..], &[9u8; 16][..]);
        drop(db);
        assert_eq!(alloc.stats().allocated(), 2);
        assert_eq!(alloc.stats().live(), 0);
    }

    #[test]
    fn busy() {
        let alloc = BufAlloc::new(16);
        let db = alloc.alloc(PageFlags::DATA).unwrap();
        let _reader = db.contents().unwrap();
        assert_eq!(db.contents_mut().unwrap_err(), Error::EBUSY);
    }

    #[test]
    fn counters() {
        let alloc = BufAlloc::new(4096);
        let a = alloc.alloc(PageFlags::DATA).unwrap();
        let b = alloc.alloc(PageFlags::PARITY).unwrap();
        assert_eq!(alloc.stats().live(), 2);
        drop(a);
        assert_eq!(alloc.stats().live(), 1);
        assert_eq!(alloc.stats().freed(), 1);
        drop(b);
        assert_eq!(alloc.stats().live(), 0);
        assert_eq!(alloc.stats().allocated(), 2);
    }

    #[test]
    fn injected_failure() {
        let alloc = BufAlloc::new(4096);
        alloc.stats().inject_failure(2);
        let _a = alloc.alloc(PageFlags::DATA).unwrap();
        let _b = alloc.alloc(PageFlags::DATA).unwrap();
        assert_eq!(alloc.alloc(PageFlags::DATA).unwrap_err(), Error::ENOMEM);
        // The failure is one-shot
        let _c = alloc.alloc(PageFlags::DATA).unwrap();
        assert_eq!(alloc.stats().live(), 3);
    }

    #[test]
    fn matrix() {
        let alloc = BufAlloc::new(64);
        let mut m = BufMatrix::new(3, 2);
        assert!(m.is_empty());
        m.get_or_alloc(2, 1, &alloc, PageFlags::DATA).unwrap()
            .set_flags(PageFlags::READ);
        m.get_or_alloc(0, 0, &alloc, PageFlags::DATA).unwrap();
        // A second lookup must not reallocate
        let db = m.get_or_alloc(2, 1, &alloc, PageFlags::empty()).unwrap();
        assert_eq!(db.flags(), PageFlags::DATA | PageFlags::READ);
        assert_eq!(m.count(), 2);
        assert_eq!(alloc.stats().allocated(), 2);
        let cells = m.iter().map(|(r, c, _)| (r, c)).collect::<Vec<_>>();
        assert_eq!(cells, vec![(0, 0), (2, 1)]);
        assert!(m.get(1, 1).is_none());
        m.clear();
        assert_eq!(alloc.stats().live(), 0);
    }

    #[test]
    #[should_panic(expected = "outside a 3x2 matrix")]
    fn matrix_bounds() {
        let m = BufMatrix::new(3, 2);
        m.get(0, 2);
    }
}
// LCOV_EXCL_STOP
