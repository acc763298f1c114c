// vim: tw=80
//! End-to-end tests of the I/O engine against an in-memory storage service

use std::sync::Arc;

use pario_core::{
    client::Client,
    codec::Codec,
    config::{Config, LayoutConfig},
    layout::{LayoutAlgorithm, SrcAddr},
    mem_store::MemStore,
    pool::{DeviceState, PoolMachine, PoolState, PoolView},
    Fid,
    TargetId,
};
use rand::{Rng, RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

const PAGE: u64 = 4096;

/// Everything needed to drive one client against one simulated pool
struct Harness {
    machine: Arc<PoolMachine>,
    store: Arc<MemStore>,
    client: Client,
}

impl Harness {
    /// Check that a group's parity on disk matches its data on disk
    fn check_parity(&self, fid: Fid, group: u64) {
        let layout = self.client.layout();
        let unit_size = layout.unit_size() as usize;
        let units = (0..layout.n() + layout.k())
            .map(|unit| {
                let addr = layout.src_to_tgt(SrcAddr::new(group, unit));
                self.store.read_raw(TargetId::new(fid, addr.dev),
                    layout.target_offset(addr.frame, 0), unit_size)
            }).collect::<Vec<_>>();
        let (data, parity) = units.split_at(layout.n() as usize);
        let data = data.iter().map(Vec::as_slice).collect::<Vec<_>>();
        let mut expected = vec![vec![0u8; unit_size]; layout.k() as usize];
        let mut refs = expected.iter_mut()
            .map(Vec::as_mut_slice)
            .collect::<Vec<_>>();
        t!(self.codec().encode(&data, &mut refs));
        assert!(parity == &expected[..], "group {group} parity mismatch");
    }

    fn codec(&self) -> Codec {
        let layout = self.client.layout();
        t!(Codec::new(layout.n(), layout.k()))
    }

    /// Fail a device, then rebuild its contents onto the spares the way the
    /// storage service would, leaving it `Repaired`.
    fn fail_and_repair(&self, fid: Fid, dev: u32) {
        t!(self.machine.set_state(dev, DeviceState::Failed));
        t!(self.machine.set_state(dev, DeviceState::Repairing));
        let slot = self.machine.spare_slot(dev)
            .expect("a failed device has a slot");
        let layout = self.client.layout();
        let size = self.client.file_size(fid);
        let groups = size.div_ceil(layout.group_data_size());
        t!(self.store.repair(layout, &self.codec(), fid, 0..groups, dev, slot));
        t!(self.machine.set_state(dev, DeviceState::Repaired));
    }

    async fn read_all(&self, fid: Fid) -> Vec<u8> {
        let mut buf = vec![0u8; self.client.file_size(fid) as usize];
        let r = t!(self.client.read_at(fid, 0, &mut buf).await);
        assert_eq!(r, buf.len() as u64);
        buf
    }

    /// Write `buf` at `offset` and apply the same write to `model`
    async fn write_model(&self, fid: Fid, model: &mut Vec<u8>, offset: u64,
                         buf: &[u8])
    {
        let r = t!(self.client.write_at(fid, offset, buf).await);
        assert_eq!(r, buf.len() as u64);
        let end = offset as usize + buf.len();
        if model.len() < end {
            model.resize(end, 0);
        }
        model[offset as usize..end].copy_from_slice(buf);
    }
}

#[derive(Clone, Debug)]
struct HarnessBuilder {
    config: Config,
}

impl HarnessBuilder {
    fn algorithm(&mut self, algorithm: LayoutAlgorithm) -> &mut Self {
        self.config.layout.algorithm = algorithm;
        self
    }

    fn build(&self) -> Harness {
        let machine = Arc::new(PoolMachine::new(self.config.layout.pool_width));
        let view = Arc::new(PoolView::new(machine.clone()));
        let store = Arc::new(MemStore::new(machine.clone()));
        let client = t!(Client::new(self.config.clone(), view, store.clone()));
        Harness{machine, store, client}
    }

    fn geometry(&mut self, n: u32, k: u32, pool_width: u32) -> &mut Self {
        self.config.layout.data_units = n;
        self.config.layout.parity_units = k;
        self.config.layout.pool_width = pool_width;
        self
    }

    fn max_fop_segs(&mut self, segs: usize) -> &mut Self {
        self.config.max_fop_segs = segs;
        self
    }

    /// Three data units and one parity unit of three pages each, declustered
    /// over seven devices
    fn new() -> Self {
        let config = Config {
            layout: LayoutConfig {
                data_units: 3,
                parity_units: 1,
                unit_size: 3 * PAGE,
                page_size: PAGE,
                pool_width: 7,
                algorithm: LayoutAlgorithm::Linear
            },
            ..Default::default()
        };
        HarnessBuilder{config}
    }

    fn unit_pages(&mut self, pages: u64) -> &mut Self {
        self.config.layout.unit_size = pages * PAGE;
        self
    }
}

fn random_bytes(rng: &mut XorShiftRng, len: usize) -> Vec<u8> {
    let mut v = vec![0u8; len];
    rng.fill_bytes(&mut v);
    v
}

fn rng(seed: u8) -> XorShiftRng {
    XorShiftRng::from_seed([seed; 16])
}

mod client;
mod degraded;
mod rmw;
