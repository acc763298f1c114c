// vim: tw=80
//! Pool membership and device state
//!
//! The authoritative state of every device lives in the cluster's pool
//! machine.  Clients consult a cached copy through the `PoolState` trait and
//! only refresh it when a storage target tells them it is stale.

#[cfg(test)] use mockall::automock;
use serde_derive::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    sync::{Arc, RwLock},
};

use crate::types::*;

/// Health of one device in the pool
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub enum DeviceState {
    #[default]
    Online,
    /// Temporarily unreachable
    Offline,
    /// Permanently failed; repair has not started
    Failed,
    /// Its contents are being reconstructed onto spare units
    Repairing,
    /// Its contents have been reconstructed onto spare units
    Repaired,
}

impl DeviceState {
    pub fn is_online(self) -> bool {
        self == DeviceState::Online
    }

    /// Has the device been permanently lost, so that it needs a spare?
    pub fn needs_spare(self) -> bool {
        matches!(self, DeviceState::Failed |
                       DeviceState::Repairing |
                       DeviceState::Repaired)
    }
}

impl Display for DeviceState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            DeviceState::Online => "online",
            DeviceState::Offline => "offline",
            DeviceState::Failed => "failed",
            DeviceState::Repairing => "repairing",
            DeviceState::Repaired => "repaired",
        };
        f.write_str(s)
    }
}

/// Read-only view of pool membership, as used by the I/O engine
#[cfg_attr(test, automock)]
pub trait PoolState: Send + Sync {
    /// Current state of a device.  Devices beyond the pool are `Failed`.
    fn device_state(&self, dev: u32) -> DeviceState;

    /// Spare slot held by a device, if it has failed since it was last online.
    /// A repaired device's units live on the spare unit of this index.
    fn spare_slot(&self, dev: u32) -> Option<u32>;

    /// Version of this view
    fn version(&self) -> u64;

    /// Bring a cached view up to date with the authoritative state
    fn refresh(&self);
}

/// A consistent copy of the pool's state
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolSnapshot {
    version: u64,
    states: Vec<DeviceState>,
    /// Spare slots, each held by at most one failed device.  A slot keeps its
    /// index for as long as its device holds it.
    slots: Vec<Option<u32>>,
}

impl PoolSnapshot {
    fn device_state(&self, dev: u32) -> DeviceState {
        self.states.get(dev as usize)
            .copied()
            .unwrap_or(DeviceState::Failed)
    }

    fn spare_slot(&self, dev: u32) -> Option<u32> {
        self.slots.iter()
            .position(|&d| d == Some(dev))
            .map(|p| p as u32)
    }
}

/// The authoritative pool state
#[derive(Debug)]
pub struct PoolMachine {
    inner: RwLock<PoolSnapshot>
}

impl PoolMachine {
    pub fn new(devices: u32) -> Self {
        let snap = PoolSnapshot {
            version: 1,
            states: vec![DeviceState::Online; devices as usize],
            slots: Vec::new()
        };
        PoolMachine{inner: RwLock::new(snap)}
    }

    pub fn devices(&self) -> u32 {
        self.inner.read().unwrap().states.len() as u32
    }

    /// Change a device's state, bumping the pool version.
    ///
    /// A device that fails takes the lowest free spare slot, and keeps it until
    /// it returns to `Online`.  Offline devices don't take a slot.
    pub fn set_state(&self, dev: u32, state: DeviceState) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let old = *inner.states.get(dev as usize).ok_or(Error::ENODEV)?;
        if old == state {
            return Ok(());
        }
        inner.states[dev as usize] = state;
        let held = inner.spare_slot(dev);
        if state.is_online() {
            if let Some(slot) = held {
                inner.slots[slot as usize] = None;
            }
        } else if state.needs_spare() && held.is_none() {
            match inner.slots.iter().position(Option::is_none) {
                Some(free) => inner.slots[free] = Some(dev),
                None => inner.slots.push(Some(dev))
            }
        }
        inner.version += 1;
        tracing::debug!(dev, %old, new = %state, version = inner.version,
            "device state change");
        Ok(())
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.inner.read().unwrap().clone()
    }
}

impl PoolState for PoolMachine {
    fn device_state(&self, dev: u32) -> DeviceState {
        self.inner.read().unwrap().device_state(dev)
    }

    fn spare_slot(&self, dev: u32) -> Option<u32> {
        self.inner.read().unwrap().spare_slot(dev)
    }

    fn version(&self) -> u64 {
        self.inner.read().unwrap().version
    }

    fn refresh(&self) {}
}

/// A client's cached view of a `PoolMachine`.
///
/// It changes only on `refresh`, so a client may keep using a stale view
/// until a storage target rejects its requests.
#[derive(Debug)]
pub struct PoolView {
    machine: Arc<PoolMachine>,
    cached: RwLock<PoolSnapshot>,
}

impl PoolView {
    pub fn new(machine: Arc<PoolMachine>) -> Self {
        let cached = RwLock::new(machine.snapshot());
        PoolView{machine, cached}
    }
}

impl PoolState for PoolView {
    fn device_state(&self, dev: u32) -> DeviceState {
        self.cached.read().unwrap().device_state(dev)
    }

    fn spare_slot(&self, dev: u32) -> Option<u32> {
        self.cached.read().unwrap().spare_slot(dev)
    }

    fn version(&self) -> u64 {
        self.cached.read().unwrap().version
    }

    fn refresh(&self) {
        let snap = self.machine.snapshot();
        tracing::debug!(version = snap.version, "refreshed pool view");
        *self.cached.write().unwrap() = snap;
    }
}

// LCOV_EXCL_STOP
