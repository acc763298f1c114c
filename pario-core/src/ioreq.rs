// vim: tw=80
//! The I/O request state machine
//!
//! Every call to [`Client::submit`](crate::client::Client::submit) creates one
//! `IoReq`, which owns the call's parity group maps and network transfer and
//! drives them through
//!
//! ```text
//! Init -> LockAcquired -> Reading -> ReadComplete [<-> DegradedReading]
//!                      \                        \
//!                       `-> Writing <------------'
//!                             -> WriteComplete [<-> DegradedWriting]
//!      -> LockRelinquished -> Complete
//! ```
//!
//! Any state before `LockRelinquished` may instead go to `Failed`, which in
//! turn leads to `Complete`.

use std::{
    cmp,
    fmt::{self, Debug, Display, Formatter},
    ops::Range,
};

use crate::{
    buf::PageFlags,
    client::{Client, FileState},
    extent::{Extent, ExtentList},
    layout::Layout,
    nw_xfer::{NwXfer, XferCtx},
    pargrp::{ParityGroupMap, RmwKind},
    tioreq::{FopFilter, Vector},
    types::*,
};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum IoState {
    Init,
    LockAcquired,
    Reading,
    ReadComplete,
    DegradedReading,
    Writing,
    WriteComplete,
    DegradedWriting,
    LockRelinquished,
    Failed,
    Complete,
}

impl IoState {
    pub fn can_move_to(self, next: IoState) -> bool {
        use IoState::*;

        matches!((self, next),
            (Init, LockAcquired) |
            (LockAcquired, Reading) |
            (LockAcquired, Writing) |
            (Reading, ReadComplete) |
            (ReadComplete, DegradedReading) |
            (ReadComplete, Writing) |
            (ReadComplete, LockRelinquished) |
            (DegradedReading, ReadComplete) |
            (Writing, WriteComplete) |
            (WriteComplete, DegradedWriting) |
            (WriteComplete, LockRelinquished) |
            (DegradedWriting, WriteComplete) |
            (LockRelinquished, Complete) |
            (Failed, Complete)
        ) || (next == Failed && !matches!(self,
            LockRelinquished | Failed | Complete))
    }
}

impl Display for IoState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// The caller's buffers, each with the file offset it refers to
#[derive(Debug)]
pub enum UserIo<'a> {
    Read(Vec<(u64, &'a mut [u8])>),
    Write(Vec<(u64, &'a [u8])>),
}

impl<'a> UserIo<'a> {
    pub fn dir(&self) -> IoDir {
        match self {
            UserIo::Read(_) => IoDir::Read,
            UserIo::Write(_) => IoDir::Write,
        }
    }

    /// The byte extents of the request, sorted.  Empty buffers are ignored.
    ///
    /// # Errors
    ///
    /// - `EOVERFLOW`:  A buffer extends beyond the largest file offset
    /// - `EINVAL`:     Two buffers overlap
    pub fn extents(&self) -> Result<ExtentList> {
        let mut exts = match self {
            UserIo::Read(v) => v.iter()
                .map(|(off, buf)| (*off, buf.len() as u64))
                .collect::<Vec<_>>(),
            UserIo::Write(v) => v.iter()
                .map(|(off, buf)| (*off, buf.len() as u64))
                .collect::<Vec<_>>(),
        }.into_iter()
            .filter(|(_, len)| *len > 0)
            .map(|(off, len)| Extent::new(off, len).ok_or(Error::EOVERFLOW))
            .collect::<Result<Vec<_>>>()?;
        exts.sort();
        if exts.windows(2).any(|w| w[0].end > w[1].start) {
            return Err(Error::EINVAL);
        }
        Ok(exts.into_iter().collect())
    }
}

/// Split the byte range `[off, off + len)` at group boundaries.
///
/// Yields each piece's group, its starting offset, and its range relative to
/// `off`.
fn group_pieces(layout: &Layout, off: u64, len: u64)
    -> impl Iterator<Item=(u64, u64, Range<usize>)> + '_
{
    let end = off + len;
    let mut pos = off;
    std::iter::from_fn(move || {
        if pos >= end {
            return None;
        }
        let group = layout.group_of(pos);
        let piece_end = cmp::min(end, layout.group_start(group + 1));
        let r = (pos - off) as usize..(piece_end - off) as usize;
        let item = (group, pos, r);
        pos = piece_end;
        Some(item)
    })
}

fn map_of(maps: &[ParityGroupMap], group: u64) -> Result<&ParityGroupMap> {
    maps.binary_search_by_key(&group, ParityGroupMap::grpid)
        .map(|i| &maps[i])
        .map_err(|_| {
            tracing::error!(group, "no map for group");
            Error::EINVAL
        })
}

/// Copy read data to the caller.  Returns the number of bytes copied, which
/// excludes anything past end of file.
fn copy_out(maps: &[ParityGroupMap], layout: &Layout,
            bufs: &mut [(u64, &mut [u8])], file_size: u64) -> Result<u64>
{
    let mut copied = 0;
    for (off, buf) in bufs.iter_mut() {
        let len = cmp::min(buf.len() as u64, file_size.saturating_sub(*off));
        for (group, pos, r) in group_pieces(layout, *off, len) {
            map_of(maps, group)?.copy_out(pos, &mut buf[r])?;
        }
        copied += len;
    }
    Ok(copied)
}

/// One caller request, from submission to completion
pub struct IoReq<'a> {
    client: &'a Client,
    fid: Fid,
    state: IoState,
    io: UserIo<'a>,
    exts: ExtentList,
    /// One per group touched, sorted by group
    maps: Vec<ParityGroupMap>,
    xfer: NwXfer,
}

impl<'a> IoReq<'a> {
    pub fn new(client: &'a Client, fid: Fid, io: UserIo<'a>) -> Self {
        IoReq {
            client,
            fid,
            state: IoState::Init,
            io,
            exts: ExtentList::new(),
            maps: Vec::new(),
            xfer: NwXfer::new()
        }
    }

    /// Copy the caller's data into pages that have any of `filter`
    fn copy_in(&self, filter: PageFlags) -> Result<()> {
        let UserIo::Write(bufs) = &self.io else {
            return Err(Error::EINVAL);
        };
        let client = self.client;
        let layout = client.layout();
        for (off, buf) in bufs.iter() {
            for (group, pos, r) in group_pieces(layout, *off, buf.len() as u64)
            {
                map_of(&self.maps, group)?.copy_in(pos, &buf[r], filter)?;
            }
        }
        Ok(())
    }

    fn ctx(&self) -> XferCtx<'a> {
        let client = self.client;
        XferCtx {
            fid: self.fid,
            pool: client.pool(),
            transport: client.transport(),
            group: client.group(),
            limits: client.fop_limits(),
            max_stale_retries: client.config().max_stale_retries
        }
    }

    /// Fetch and reconstruct whatever the normal read pass couldn't get
    async fn dgmode_read(&mut self, file_size: u64) -> Result<()> {
        let ctx = self.ctx();
        if !self.xfer.dgmode_read_prepare(self.fid, ctx.pool, &mut self.maps,
                                          file_size)?
        {
            return Ok(());
        }
        tracing::info!(fid = %self.fid, "degraded read");
        self.move_to(IoState::DegradedReading).await;
        self.xfer.run(&ctx, &self.maps, FopFilter::read(Vector::Degraded))
            .await?;
        if self.xfer.dgmode_lost() {
            tracing::error!(fid = %self.fid,
                "device lost during degraded read");
            return Err(Error::EIO);
        }
        let client = self.client;
        for map in self.maps.iter_mut() {
            map.dgmode_recover(client.codec())?;
        }
        self.move_to(IoState::ReadComplete).await;
        Ok(())
    }

    /// Send writes meant for repaired devices to their spares
    async fn dgmode_write(&mut self) -> Result<()> {
        let ctx = self.ctx();
        if !self.xfer.dgmode_write_prepare(self.fid, ctx.pool, &self.maps)? {
            return Ok(());
        }
        self.move_to(IoState::DegradedWriting).await;
        self.xfer.run(&ctx, &self.maps, FopFilter::write(Vector::Degraded))
            .await?;
        self.move_to(IoState::WriteComplete).await;
        Ok(())
    }

    /// Run the request to completion.  Returns the number of bytes
    /// transferred to or from the caller's buffers.
    pub async fn execute(mut self) -> Result<u64> {
        self.client.group().lock().await.requests += 1;
        let r = self.execute_priv().await;
        if let Err(e) = r {
            tracing::debug!(error = ?e, state = %self.state, "request failed");
            self.move_to(IoState::Failed).await;
            self.client.group().lock().await.failed += 1;
        }
        // Nothing may be left in flight once the request is complete
        self.xfer.wait(self.client.group()).await;
        self.move_to(IoState::Complete).await;
        r
    }

    async fn execute_priv(&mut self) -> Result<u64> {
        self.exts = self.io.extents()?;
        let file = self.client.file(self.fid);
        match self.io.dir() {
            IoDir::Read => {
                let guard = file.lock().read().await;
                self.move_to(IoState::LockAcquired).await;
                let bytes = self.read(file.size()).await?;
                drop(guard);
                self.move_to(IoState::LockRelinquished).await;
                Ok(bytes)
            }
            IoDir::Write => {
                let guard = file.lock().write().await;
                self.move_to(IoState::LockAcquired).await;
                let bytes = self.write(&file).await?;
                drop(guard);
                self.move_to(IoState::LockRelinquished).await;
                Ok(bytes)
            }
        }
    }

    /// Allocate and populate one map for each group the request touches.
    ///
    /// Fails with `EFBIG` if a group would extend past the largest file offset.
    fn maps_build(&mut self, exts: &ExtentList, file_size: u64) -> Result<()>
    {
        let client = self.client;
        let layout = client.layout();
        let mut groups = Vec::new();
        for ext in exts.iter() {
            let first = layout.group_of(ext.start);
            let last = layout.group_of(ext.end - 1);
            if layout.group_end(last).is_none() {
                tracing::debug!(%ext, "beyond the largest group");
                return Err(Error::EFBIG);
            }
            groups.extend(first..=last);
        }
        groups.dedup();
        for group in groups {
            let mut map = ParityGroupMap::new(group, self.io.dir(), layout,
                                              client.alloc());
            map.populate(exts, file_size)?;
            self.maps.push(map);
        }
        Ok(())
    }

    async fn move_to(&mut self, next: IoState) {
        assert!(self.state.can_move_to(next),
            "illegal transition {} -> {}", self.state, next);
        let mut stats = self.client.group().lock().await;
        stats.transitions += 1;
        tracing::debug!(from = %self.state, to = %next, "transition");
        self.state = next;
    }

    async fn read(&mut self, file_size: u64) -> Result<u64> {
        let exts = self.exts.clip(&Extent{start: 0, end: file_size});
        self.maps_build(&exts, file_size)?;
        let ctx = self.ctx();
        self.xfer.distribute(self.fid, ctx.pool, &self.maps);
        self.move_to(IoState::Reading).await;
        self.xfer.run(&ctx, &self.maps, FopFilter::read(Vector::Normal)).await?;
        self.move_to(IoState::ReadComplete).await;
        self.dgmode_read(file_size).await?;
        let client = self.client;
        let UserIo::Read(bufs) = &mut self.io else {
            return Err(Error::EINVAL);
        };
        copy_out(&self.maps, client.layout(), bufs, file_size)
    }

    pub fn state(&self) -> IoState {
        self.state
    }

    async fn write(&mut self, file: &FileState) -> Result<u64> {
        let file_size = file.size();
        let exts = self.exts.clone();
        self.maps_build(&exts, file_size)?;
        let ctx = self.ctx();
        let rmw = self.maps.iter().any(|m| m.rmw() != RmwKind::None);
        self.xfer.distribute(self.fid, ctx.pool, &self.maps);
        if rmw {
            self.move_to(IoState::Reading).await;
            self.xfer.run(&ctx, &self.maps, FopFilter::read(Vector::Normal))
                .await?;
            self.move_to(IoState::ReadComplete).await;
            self.dgmode_read(file_size).await?;
            self.copy_in(PageFlags::FULLPAGE_MODIFY)?;
            for map in self.maps.iter() {
                map.readold_merge()?;
            }
            self.copy_in(PageFlags::PARTPAGE_MODIFY)?;
            // Degraded mode may have widened the maps
            self.xfer.reset();
            self.xfer.distribute(self.fid, ctx.pool, &self.maps);
        } else {
            self.copy_in(PageFlags::FULLPAGE_MODIFY |
                         PageFlags::PARTPAGE_MODIFY)?;
        }
        let client = self.client;
        for map in self.maps.iter() {
            map.parity_recalc(client.codec())?;
        }
        self.move_to(IoState::Writing).await;
        self.xfer.run(&ctx, &self.maps, FopFilter::write(Vector::Normal))
            .await?;
        self.move_to(IoState::WriteComplete).await;
        self.dgmode_write().await?;
        if let Some(span) = self.exts.span() {
            file.grow(span.end);
        }
        Ok(self.exts.total())
    }
}

// LCOV_EXCL_STOP
