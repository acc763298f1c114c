// vim: tw=80
//! Degraded mode: I/O to parity groups that have units on devices that aren't
//! online.
//!
//! A unit whose device has been repaired lives on a spare unit of the same
//! group, so its I/O is simply redirected.  A unit on a device that is offline,
//! failed, or still being repaired is lost.  Reads reconstruct lost units from
//! the rest of the group; writes to them are dropped and left for repair.

use std::collections::BTreeSet;

use crate::{
    buf::PageFlags,
    layout::{Layout, SrcAddr, TgtAddr},
    nw_xfer::NwXfer,
    pargrp::{CellKind, ParityGroupMap},
    pool::{DeviceState, PoolState},
    tioreq::{BufRef, Seg, Vector},
    types::*,
};

/// Where a unit may currently be accessed
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Placement {
    /// At its usual location
    Primary(TgtAddr),
    /// On a spare unit, because its device was repaired
    Spare(TgtAddr),
    /// Nowhere
    Unavailable,
}

/// Find where `src` can currently be accessed.
///
/// If a spare is itself on a repaired device, the chain of spares is followed,
/// up to one hop per spare unit in the group.
pub fn placement(layout: &Layout, pool: &dyn PoolState, src: SrcAddr)
    -> Placement
{
    let mut tgt = layout.src_to_tgt(src);
    let mut redirected = false;
    for _ in 0..=layout.k() {
        match pool.device_state(tgt.dev) {
            DeviceState::Online if redirected => return Placement::Spare(tgt),
            DeviceState::Online => return Placement::Primary(tgt),
            DeviceState::Repaired => {
                let slot = match pool.spare_slot(tgt.dev) {
                    Some(s) if s < layout.k() => s,
                    _ => return Placement::Unavailable
                };
                let spare = SrcAddr::new(src.group, layout.spare_unit(slot));
                tgt = layout.src_to_tgt(spare);
                redirected = true;
            }
            _ => return Placement::Unavailable
        }
    }
    Placement::Unavailable
}

/// A request can't proceed once more devices are lost than the layout can
/// tolerate
fn check_lost(lost: &BTreeSet<u32>, maps: &[ParityGroupMap]) -> Result<()> {
    let k = maps.first().map(|m| m.layout().k()).unwrap_or(0);
    if lost.len() > k as usize {
        tracing::error!(?lost, k, "too many devices lost");
        Err(Error::EIO)
    } else {
        Ok(())
    }
}

impl NwXfer {
    /// Did any target of the degraded pass become unavailable during it?
    pub fn dgmode_lost(&self) -> bool {
        self.targets().any(|ti| {
            !ti.state().is_online() && !ti.segs(Vector::Degraded).is_empty()
        })
    }

    /// Segments with any of `flags` that belong to targets that aren't online,
    /// along with each target's device.
    fn lost_segs(&self, flags: PageFlags) -> Vec<(u32, Seg)> {
        self.targets()
            .filter(|ti| !ti.state().is_online())
            .flat_map(|ti| {
                let dev = ti.tgt().dev;
                ti.segs(Vector::Normal)
                    .iter()
                    .filter(move |s| s.flags.intersects(flags))
                    .map(move |s| (dev, *s))
            }).collect()
    }

    /// Add one page to the degraded vector of whichever target holds `addr`
    fn page_add(&mut self, fid: Fid, pool: &dyn PoolState,
                map: &ParityGroupMap, buf: BufRef, addr: TgtAddr)
    {
        let layout = map.layout();
        let psize = layout.page_size();
        let ti = self.target_entry(fid, addr.dev, pool);
        ti.set_state(pool.device_state(addr.dev));
        ti.segment_add(layout, map, buf.map, addr.frame,
                       buf.row as u64 * psize, buf.unit(layout), psize,
                       Vector::Degraded);
    }

    /// Prepare the degraded pass of a read.
    ///
    /// Pages that couldn't be read from their usual targets are redirected to
    /// spares where possible.  Groups that lost units are expanded so those
    /// units can be reconstructed, and their additional pages are added to the
    /// degraded vectors as well.
    ///
    /// Returns whether a degraded pass is needed at all.
    pub fn dgmode_read_prepare(&mut self, fid: Fid, pool: &dyn PoolState,
                               maps: &mut [ParityGroupMap], file_size: u64)
        -> Result<bool>
    {
        let segs = self.lost_segs(PageFlags::READ);
        if segs.is_empty() {
            return Ok(false);
        }
        let mut lost_devs = BTreeSet::new();
        let mut lost_units = BTreeSet::new();
        for (dev, seg) in segs {
            let map = &maps[seg.buf.map];
            let unit = seg.buf.unit(map.layout());
            let src = SrcAddr::new(map.grpid(), unit);
            match placement(map.layout(), pool, src) {
                Placement::Primary(addr) | Placement::Spare(addr) => {
                    self.page_add(fid, pool, map, seg.buf, addr);
                }
                Placement::Unavailable => {
                    lost_devs.insert(dev);
                    lost_units.insert((seg.buf.map, unit));
                }
            }
        }
        check_lost(&lost_devs, maps)?;
        for (map_idx, unit) in lost_units {
            maps[map_idx].dgmode_process(unit);
        }
        for map in maps.iter_mut() {
            map.dgmode_postprocess(file_size)?;
        }

        for map_idx in 0..maps.len() {
            if !maps[map_idx].is_degraded() {
                continue;
            }
            let map = &maps[map_idx];
            let layout = map.layout();
            let wanted = [CellKind::Data, CellKind::Parity].into_iter()
                .flat_map(move |kind| {
                    map.cells(kind)
                        .filter(|(_, _, buf)| {
                            let f = buf.flags();
                            f.contains(PageFlags::DEGRADED_READ) &&
                                !f.contains(PageFlags::READ_FAILED)
                        }).map(move |(row, col, _)| {
                            BufRef{map: map_idx, kind, row, col}
                        })
                }).collect::<Vec<_>>();
            let mut more_lost = BTreeSet::new();
            for buf in wanted {
                let src = SrcAddr::new(map.grpid(), buf.unit(layout));
                match placement(layout, pool, src) {
                    Placement::Primary(addr) | Placement::Spare(addr) => {
                        self.page_add(fid, pool, map, buf, addr);
                    }
                    Placement::Unavailable => {
                        lost_devs.insert(layout.src_to_tgt(src).dev);
                        more_lost.insert(src.unit);
                    }
                }
            }
            for unit in more_lost {
                maps[map_idx].dgmode_process(unit);
            }
        }
        check_lost(&lost_devs, maps)?;
        Ok(true)
    }

    /// Prepare the degraded pass of a write.
    ///
    /// Pages destined for repaired devices are redirected to their spares.
    /// Pages destined for devices that are otherwise unavailable are dropped.
    ///
    /// Returns whether anything was redirected.
    pub fn dgmode_write_prepare(&mut self, fid: Fid, pool: &dyn PoolState,
                                maps: &[ParityGroupMap]) -> Result<bool>
    {
        let segs = self.lost_segs(PageFlags::WRITE);
        let mut lost_devs = BTreeSet::new();
        let mut redirected = false;
        for (dev, seg) in segs {
            let map = &maps[seg.buf.map];
            let src = SrcAddr::new(map.grpid(), seg.buf.unit(map.layout()));
            match placement(map.layout(), pool, src) {
                Placement::Primary(addr) | Placement::Spare(addr) => {
                    self.page_add(fid, pool, map, seg.buf, addr);
                    redirected = true;
                }
                Placement::Unavailable => {
                    lost_devs.insert(dev);
                }
            }
        }
        check_lost(&lost_devs, maps)?;
        if !lost_devs.is_empty() {
            tracing::debug!(?lost_devs, "dropping writes to lost devices");
        }
        Ok(redirected)
    }
}

// LCOV_EXCL_STOP
