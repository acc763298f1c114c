// vim: tw=80
//! A mounted client: the caller-facing entry point of the I/O engine

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicU64, Ordering},
    }
};

use futures_locks::RwLock;
use tracing::instrument;

use crate::{
    buf::{BufAlloc, BufStats},
    codec::Codec,
    config::Config,
    ioreq::{IoReq, UserIo},
    layout::Layout,
    pool::PoolState,
    sm_group::{GroupStats, SmGroup},
    tioreq::FopLimits,
    transport::Transport,
    types::*,
};

/// Per-file state shared by every request to the file
pub struct FileState {
    /// Serializes writers against everything else
    lock: RwLock<()>,
    size: AtomicU64,
}

impl Default for FileState {
    fn default() -> Self {
        FileState {
            lock: RwLock::new(()),
            size: AtomicU64::new(0)
        }
    }
}

impl FileState {
    /// Advance the file size to at least `end`
    pub fn grow(&self, end: u64) {
        self.size.fetch_max(end, Ordering::Relaxed);
    }

    pub fn lock(&self) -> &RwLock<()> {
        &self.lock
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }
}

pub struct Client {
    config: Config,
    layout: Layout,
    codec: Codec,
    pool: Arc<dyn PoolState>,
    transport: Arc<dyn Transport>,
    group: SmGroup,
    alloc: BufAlloc,
    files: Mutex<BTreeMap<Fid, Arc<FileState>>>,
}

impl Client {
    pub(crate) fn alloc(&self) -> &BufAlloc {
        &self.alloc
    }

    /// Page allocation counters, shared by every request of this client
    pub fn buf_stats(&self) -> &Arc<BufStats> {
        self.alloc.stats()
    }

    pub(crate) fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn file(&self, fid: Fid) -> Arc<FileState> {
        self.files.lock().unwrap()
            .entry(fid)
            .or_default()
            .clone()
    }

    /// Current size of a file.  Files that were never written are empty.
    pub fn file_size(&self, fid: Fid) -> u64 {
        self.files.lock().unwrap()
            .get(&fid)
            .map(|f| f.size())
            .unwrap_or(0)
    }

    pub(crate) fn fop_limits(&self) -> FopLimits {
        FopLimits {
            max_bytes: self.config.max_fop_bytes,
            max_segs: self.config.max_fop_segs
        }
    }

    pub(crate) fn group(&self) -> &SmGroup {
        &self.group
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn new(config: Config, pool: Arc<dyn PoolState>,
               transport: Arc<dyn Transport>) -> Result<Self>
    {
        config.validate()?;
        let layout = Layout::new(&config.layout)?;
        let codec = Codec::new(layout.n(), layout.k())?;
        let alloc = BufAlloc::new(layout.page_size() as usize);
        let group = SmGroup::new();
        tracing::debug!(group = %group.id(), n = layout.n(), k = layout.k(),
            "client ready");
        Ok(Client {
            config,
            layout,
            codec,
            pool,
            transport,
            group,
            alloc,
            files: Mutex::new(BTreeMap::new())
        })
    }

    pub(crate) fn pool(&self) -> &dyn PoolState {
        &*self.pool
    }

    /// Read from a single offset.  Returns the number of bytes read, which is
    /// short if the read crosses end of file.
    pub async fn read_at(&self, fid: Fid, offset: u64, buf: &mut [u8])
        -> Result<u64>
    {
        self.submit(fid, UserIo::Read(vec![(offset, buf)])).await
    }

    /// Counters of this client's state machine group
    pub async fn stats(&self) -> GroupStats {
        self.group.stats().await
    }

    /// Perform one vectored I/O request against a file.
    ///
    /// Returns the number of bytes transferred.
    #[instrument(skip(self, io), fields(dir = %io.dir()))]
    pub async fn submit(&self, fid: Fid, io: UserIo<'_>) -> Result<u64> {
        IoReq::new(self, fid, io).execute().await
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn write_at(&self, fid: Fid, offset: u64, buf: &[u8])
        -> Result<u64>
    {
        self.submit(fid, UserIo::Write(vec![(offset, buf)])).await
    }
}

// LCOV_EXCL_STOP
