// vim: tw=80
//! Network transfer of one I/O request: distribution of its parity groups
//! among targets, dispatch of protocol requests, and collection of replies.

use std::{
    cmp,
    collections::BTreeMap,
    sync::Arc,
};

use tokio::sync::mpsc;
use tracing::instrument;
use tracing_futures::Instrument;

use crate::{
    layout::SrcAddr,
    pargrp::ParityGroupMap,
    pool::PoolState,
    sm_group::SmGroup,
    tioreq::{Fop, FopFilter, FopLimits, TargetIoReq, Vector},
    transport::Transport,
    types::*,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum XferState {
    Initialized,
    InFlight,
    Complete,
}

/// What's left to do after a transfer cycle completed without error
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Completion {
    Done,
    /// These targets refused requests built with an outdated pool version, or
    /// were skipped because the outdated version said they weren't online.
    /// They are online now, so their requests should be rebuilt and resent.
    Stale(Vec<TargetId>),
}

/// Reply to one protocol request
#[derive(Debug)]
struct FopEvent {
    tgt: TargetId,
    result: Result<u64>,
}

/// Everything a transfer needs from the client that issued it
pub struct XferCtx<'a> {
    pub fid: Fid,
    pub pool: &'a dyn PoolState,
    pub transport: &'a Arc<dyn Transport>,
    pub group: &'a SmGroup,
    pub limits: FopLimits,
    pub max_stale_retries: u32,
}

/// All of one I/O request's traffic
#[derive(Debug)]
pub struct NwXfer {
    state: XferState,
    targets: BTreeMap<TargetId, TargetIoReq>,
    /// Protocol requests sent but not yet reaped
    inflight: usize,
    tx: mpsc::UnboundedSender<FopEvent>,
    rx: mpsc::UnboundedReceiver<FopEvent>,
}

impl NwXfer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        NwXfer {
            state: XferState::Initialized,
            targets: BTreeMap::new(),
            inflight: 0,
            tx,
            rx
        }
    }

    /// Total bytes transferred so far, in either direction
    pub fn bytes(&self) -> u64 {
        self.targets.values().map(TargetIoReq::bytes).sum()
    }

    /// Collect the results of a transfer cycle.
    ///
    /// If any target erred or was stale, the pool view is refreshed.  Errors
    /// from targets that are no longer online are forgiven; degraded mode will
    /// deal with those.  Any other error fails the transfer.  Targets that the
    /// refresh found back online are returned for resending along with the
    /// stale ones.
    pub fn complete(&mut self, pool: &dyn PoolState) -> Result<Completion> {
        debug_assert_eq!(self.inflight, 0);
        self.state = XferState::Complete;
        let troubled = self.targets.values()
            .any(|ti| ti.rc().is_some() || ti.is_stale());
        let mut stale = Vec::new();
        if troubled {
            pool.refresh();
            stale = self.refresh_states(pool);
        }
        let mut rc = None;
        for ti in self.targets.values_mut() {
            if !ti.state().is_online() {
                if let Some(e) = ti.clear_rc() {
                    tracing::info!(tgt = %ti.tgt(), state = %ti.state(),
                        error = ?e, "target lost during transfer");
                }
            }
            if ti.is_stale() {
                ti.clear_stale();
                if ti.state().is_online() {
                    stale.push(ti.tgt());
                }
            }
            if rc.is_none() {
                rc = ti.rc();
            }
        }
        if let Some(e) = rc {
            return Err(e);
        }
        if stale.is_empty() {
            Ok(Completion::Done)
        } else {
            Ok(Completion::Stale(stale))
        }
    }

    /// Send protocol requests.  Their replies are collected by
    /// [`wait`](Self::wait).
    pub fn dispatch(&mut self, transport: &Arc<dyn Transport>, fops: Vec<Fop>)
    {
        for fop in fops {
            let tgt = fop.tgt;
            tracing::trace!(?fop, "dispatch");
            if let Some(ti) = self.targets.get_mut(&tgt) {
                ti.fop_sent();
            }
            self.inflight += 1;
            let tx = self.tx.clone();
            let fut = transport.submit(fop);
            let span = tracing::debug_span!("fop", %tgt);
            tokio::spawn(async move {
                let result = fut.await;
                // The receiver lives as long as the request
                let _ = tx.send(FopEvent{tgt, result});
            }.instrument(span));
        }
        self.state = XferState::InFlight;
    }

    /// Assign the request's units to their primary targets.
    ///
    /// Data units get the parts covered by their group's extents.  Parity
    /// units, when the group has any, are transferred whole.
    pub fn distribute(&mut self, fid: Fid, pool: &dyn PoolState,
                      maps: &[ParityGroupMap])
    {
        for (map_idx, map) in maps.iter().enumerate() {
            let layout = map.layout();
            let unit_size = layout.unit_size();
            let gstart = layout.group_start(map.grpid());
            for ext in map.extents() {
                let mut off = ext.start;
                while off < ext.end {
                    let goff = off - gstart;
                    let unit = (goff / unit_size) as u32;
                    let uoff = goff % unit_size;
                    let len = cmp::min(ext.end - off, unit_size - uoff);
                    self.unit_add(fid, pool, maps, map_idx, unit, uoff, len);
                    off += len;
                }
            }
            if map.has_parity() {
                for p in 0..layout.k() {
                    self.unit_add(fid, pool, maps, map_idx, layout.n() + p, 0,
                                  unit_size);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn unit_add(&mut self, fid: Fid, pool: &dyn PoolState,
                maps: &[ParityGroupMap], map_idx: usize, unit: u32, uoff: u64,
                len: u64)
    {
        let map = &maps[map_idx];
        let layout = map.layout();
        let src = SrcAddr::new(map.grpid(), unit);
        let addr = layout.src_to_tgt(src);
        debug_assert_eq!(layout.tgt_to_src(addr), src);
        self.target_entry(fid, addr.dev, pool)
            .segment_add(layout, map, map_idx, addr.frame, uoff, unit, len,
                         Vector::Normal);
    }

    /// Build the protocol requests for one transfer cycle.
    ///
    /// If `only` is given, just those targets participate.  On error, nothing
    /// has been sent and no buffers remain borrowed.
    pub fn prepare(&self, maps: &[ParityGroupMap], filter: &FopFilter,
                   limits: &FopLimits, pool_version: u64,
                   only: Option<&[TargetId]>) -> Result<Vec<Fop>>
    {
        let mut fops = Vec::new();
        for ti in self.targets.values() {
            if only.map(|o| o.contains(&ti.tgt())).unwrap_or(true) {
                fops.extend(
                    ti.iofops_prepare(maps, filter, limits, pool_version)?
                );
            }
        }
        Ok(fops)
    }

    /// Catch up each target's device state with the pool view.
    ///
    /// Returns the targets that came back online.
    pub fn refresh_states(&mut self, pool: &dyn PoolState) -> Vec<TargetId> {
        let mut revived = Vec::new();
        for ti in self.targets.values_mut() {
            let was_online = ti.state().is_online();
            ti.set_state(pool.device_state(ti.tgt().dev));
            if !was_online && ti.state().is_online() {
                tracing::info!(tgt = %ti.tgt(), "target back online");
                revived.push(ti.tgt());
            }
        }
        revived
    }

    /// Forget all targets, so the request may be distributed anew
    pub fn reset(&mut self) {
        assert_eq!(self.inflight, 0, "Can't reset a transfer in flight");
        self.targets.clear();
        self.state = XferState::Initialized;
    }

    /// Run one transfer cycle: send every matching segment, then wait for the
    /// replies.  Targets that report a stale pool version are retried, up to
    /// `ctx.max_stale_retries` times.
    #[instrument(skip_all, fields(dir = %filter.dir, vector = ?filter.vector))]
    pub async fn run(&mut self, ctx: &XferCtx<'_>, maps: &[ParityGroupMap],
                     filter: FopFilter) -> Result<()>
    {
        let fops = self.prepare(maps, &filter, &ctx.limits, ctx.pool.version(),
                                None)?;
        self.dispatch(ctx.transport, fops);
        let mut retries = 0;
        loop {
            self.wait(ctx.group).await;
            match self.complete(ctx.pool)? {
                Completion::Done => return Ok(()),
                Completion::Stale(tgts) => {
                    if retries >= ctx.max_stale_retries {
                        tracing::warn!(retries, "pool keeps changing");
                        return Err(Error::EVERMISMATCH);
                    }
                    let fops = self.prepare(maps, &filter, &ctx.limits,
                        ctx.pool.version(), Some(&tgts))?;
                    if fops.is_empty() {
                        return Ok(());
                    }
                    retries += 1;
                    tracing::debug!(ntargets = tgts.len(), retries,
                        "resending to stale targets");
                    self.dispatch(ctx.transport, fops);
                }
            }
        }
    }

    pub fn state(&self) -> XferState {
        self.state
    }

    /// Get a target's request, creating it if necessary
    pub(crate) fn target_entry(&mut self, fid: Fid, dev: u32,
                               pool: &dyn PoolState) -> &mut TargetIoReq
    {
        let tgt = TargetId::new(fid, dev);
        self.targets.entry(tgt)
            .or_insert_with(|| TargetIoReq::new(tgt, pool.device_state(dev)))
    }

    pub fn targets(&self) -> impl Iterator<Item=&TargetIoReq> {
        self.targets.values()
    }

    /// Reap replies until nothing remains in flight.  Each reply is handled
    /// under the group lock.
    pub async fn wait(&mut self, group: &SmGroup) {
        while self.inflight > 0 {
            let Some(ev) = self.rx.recv().await else {
                break;
            };
            let mut stats = group.lock().await;
            stats.fops += 1;
            self.inflight -= 1;
            if let Some(ti) = self.targets.get_mut(&ev.tgt) {
                ti.fop_done(ev.result);
            }
        }
    }
}

impl Default for NwXfer {
    fn default() -> Self {
        Self::new()
    }
}

// LCOV_EXCL_STOP
