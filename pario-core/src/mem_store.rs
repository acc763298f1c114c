// vim: tw=80
//! An in-memory storage service, for simulation and testing

use std::{
    collections::{BTreeMap, HashMap},
    ops::Range,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicU64, Ordering},
    }
};

use fixedbitset::FixedBitSet;
use futures::future;

use crate::{
    codec::Codec,
    dgmode::{placement, Placement},
    layout::{Layout, SrcAddr, TgtAddr},
    pool::{DeviceState, PoolMachine, PoolState},
    tioreq::{Fop, FopBufs},
    transport::{BoxFopFut, Transport},
    types::*,
};

/// Stores every component object as a sparse byte vector.
///
/// Requests are checked against the authoritative pool, so a request built
/// from an outdated view is refused with `EVERMISMATCH`, and a request to a
/// device that isn't online fails with `EIO`.
#[derive(Debug)]
pub struct MemStore {
    objects: Mutex<HashMap<TargetId, Vec<u8>>>,
    pool: Arc<PoolMachine>,
    /// Errors to return for every request to a device
    errors: Mutex<BTreeMap<u32, Error>>,
    submitted: AtomicU64,
}

impl MemStore {
    pub fn new(pool: Arc<PoolMachine>) -> Self {
        MemStore {
            objects: Mutex::new(HashMap::new()),
            pool,
            errors: Mutex::new(BTreeMap::new()),
            submitted: AtomicU64::new(0)
        }
    }

    /// Make every subsequent request to `dev` fail with `error`
    pub fn inject_error(&self, dev: u32, error: Error) {
        self.errors.lock().unwrap().insert(dev, error);
    }

    pub fn clear_errors(&self) {
        self.errors.lock().unwrap().clear();
    }

    /// Throw away a device's contents, as if it were replaced by a new disk
    pub fn erase(&self, dev: u32) {
        self.objects.lock().unwrap().retain(|tgt, _| tgt.dev != dev);
    }

    /// Read a component object directly, bypassing all checks.  Holes read
    /// as zeros.
    pub fn read_raw(&self, tgt: TargetId, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        if let Some(obj) = self.objects.lock().unwrap().get(&tgt) {
            copy_from_obj(obj, offset, &mut buf);
        }
        buf
    }

    /// Write a component object directly, bypassing all checks
    pub fn write_raw(&self, tgt: TargetId, offset: u64, data: &[u8]) {
        let mut objects = self.objects.lock().unwrap();
        copy_to_obj(objects.entry(tgt).or_default(), offset, data);
    }

    /// Rebuild the units that `dev` holds for `groups` of file `fid` onto the
    /// spare unit `slot` of each group, reconstructing them from the rest of
    /// the group.
    ///
    /// The units `dev` holds include spare units that stand in for devices
    /// repaired earlier.
    pub fn repair(&self, layout: &Layout, codec: &Codec, fid: Fid,
                  groups: Range<u64>, dev: u32, slot: u32) -> Result<()>
    {
        let unit_size = layout.unit_size() as usize;
        let width = (layout.n() + layout.k()) as usize;
        let before = Restored{pool: &*self.pool, dev};
        for group in groups {
            let mut erasures = FixedBitSet::with_capacity(width);
            let mut lost = None;
            let mut columns = Vec::with_capacity(width);
            for unit in 0..width {
                let src = SrcAddr::new(group, unit as u32);
                match placement(layout, &before, src) {
                    Placement::Primary(addr) | Placement::Spare(addr)
                        if addr.dev != dev =>
                    {
                        let tgt = TargetId::new(fid, addr.dev);
                        let off = layout.target_offset(addr.frame, 0);
                        columns.push(self.read_raw(tgt, off, unit_size));
                        continue;
                    }
                    Placement::Unavailable => (),
                    _ => lost = Some(unit)
                }
                erasures.insert(unit);
                columns.push(vec![0; unit_size]);
            }
            let Some(unit) = lost else {
                continue;
            };
            codec.decode(&mut columns, &erasures)?;
            let spare = spare_home(layout, &*self.pool, group, slot);
            self.write_raw(TargetId::new(fid, spare.dev),
                layout.target_offset(spare.frame, 0), &columns[unit]);
        }
        tracing::debug!(%fid, dev, slot, "repaired");
        Ok(())
    }

    /// How many requests have been submitted, including refused ones
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    fn execute(&self, fop: Fop) -> Result<u64> {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = self.errors.lock().unwrap().get(&fop.tgt.dev) {
            return Err(*e);
        }
        if fop.pool_version != self.pool.version() {
            return Err(Error::EVERMISMATCH);
        }
        if !self.pool.device_state(fop.tgt.dev).is_online() {
            return Err(Error::EIO);
        }
        let mut objects = self.objects.lock().unwrap();
        let mut bytes = 0;
        match fop.bufs {
            FopBufs::Read(mut v) => {
                for (offset, iovec) in v.iter_mut() {
                    iovec.fill(0);
                    if let Some(obj) = objects.get(&fop.tgt) {
                        copy_from_obj(obj, *offset, &mut iovec[..]);
                    }
                    bytes += iovec.len() as u64;
                }
            }
            FopBufs::Write(v) => {
                let obj = objects.entry(fop.tgt).or_default();
                for (offset, iovec) in v.iter() {
                    copy_to_obj(obj, *offset, &iovec[..]);
                    bytes += iovec.len() as u64;
                }
            }
        }
        Ok(bytes)
    }
}

impl Transport for MemStore {
    fn submit(&self, fop: Fop) -> BoxFopFut {
        // The request's buffers get dropped here, before the future resolves
        Box::pin(future::ready(self.execute(fop)))
    }
}

/// The pool as it was before one device failed
struct Restored<'a> {
    pool: &'a dyn PoolState,
    dev: u32,
}

impl PoolState for Restored<'_> {
    fn device_state(&self, dev: u32) -> DeviceState {
        if dev == self.dev {
            DeviceState::Online
        } else {
            self.pool.device_state(dev)
        }
    }

    fn spare_slot(&self, dev: u32) -> Option<u32> {
        self.pool.spare_slot(dev)
    }

    fn version(&self) -> u64 {
        self.pool.version()
    }

    fn refresh(&self) {}
}

/// Where spare unit `slot` of `group` actually lives.  If that spare is on a
/// repaired device, reads will chase it to that device's own spare, so it must
/// be stored there.
fn spare_home(layout: &Layout, pool: &dyn PoolState, group: u64, slot: u32)
    -> TgtAddr
{
    let spare = SrcAddr::new(group, layout.spare_unit(slot));
    let mut tgt = layout.src_to_tgt(spare);
    for _ in 1..layout.k() {
        if pool.device_state(tgt.dev) != DeviceState::Repaired {
            break;
        }
        match pool.spare_slot(tgt.dev) {
            Some(s) if s < layout.k() => {
                let spare = SrcAddr::new(group, layout.spare_unit(s));
                tgt = layout.src_to_tgt(spare);
            }
            _ => break
        }
    }
    tgt
}

fn copy_from_obj(obj: &[u8], offset: u64, dst: &mut [u8]) {
    let start = offset as usize;
    if start < obj.len() {
        let end = obj.len().min(start + dst.len());
        dst[..end - start].copy_from_slice(&obj[start..end]);
    }
}

fn copy_to_obj(obj: &mut Vec<u8>, offset: u64, src: &[u8]) {
    let start = offset as usize;
    let end = start + src.len();
    if obj.len() < end {
        obj.resize(end, 0);
    }
    obj[start..end].copy_from_slice(src);
}

// LCOV_EXCL_STOP
