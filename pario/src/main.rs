// vim: tw=80
//! Drive the pario I/O engine against a simulated pool

use std::{path::PathBuf, sync::Arc};

use clap::{crate_version, Parser};
use pario_core::{
    client::Client,
    codec::Codec,
    config::Config,
    dgmode::{placement, Placement},
    layout::{Layout, SrcAddr},
    mem_store::MemStore,
    pool::{DeviceState, PoolMachine, PoolState, PoolView},
    Error,
    Fid,
    Result,
};
use rand::{Rng, RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;
use tracing_subscriber::EnvFilter;

si_scale::scale_fn!(bibytes1,
                    base: B1024,
                    constraint: UnitAndAbove,
                    mantissa_fmt: "{:.1}",
                    groupings: '_',
                    unit: "B");

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(p) => Config::from_path(p),
        None => Ok(Config::default())
    }
}

/// Mark devices failed, and possibly repaired, in a pool
fn degrade(machine: &PoolMachine, failed: &[u32], repaired: &[u32])
    -> Result<()>
{
    for dev in failed.iter().chain(repaired.iter()) {
        machine.set_state(*dev, DeviceState::Failed)?;
    }
    for dev in repaired {
        machine.set_state(*dev, DeviceState::Repaired)?;
    }
    Ok(())
}

/// Check data read at `offset` against the model of the file
fn verify(step: u32, offset: usize, data: &[u8], model: &[u8]) -> Result<()> {
    let expected = model.get(offset..offset + data.len());
    if expected == Some(data) {
        Ok(())
    } else {
        tracing::error!(step, offset, len = data.len(), "data mismatch");
        Err(Error::EIO)
    }
}

#[derive(Parser, Clone, Debug)]
/// Show where a file offset lives
struct Map {
    /// Byte offset within the file
    #[clap(long)]
    offset:   u64,
    /// Devices to treat as failed
    #[clap(long, value_delimiter(','))]
    failed:   Vec<u32>,
    /// Devices to treat as repaired onto spares
    #[clap(long, value_delimiter(','))]
    repaired: Vec<u32>,
}

impl Map {
    fn main(self, config: &Config) -> Result<()> {
        let layout = Layout::new(&config.layout)?;
        let machine = PoolMachine::new(layout.pool_width());
        degrade(&machine, &self.failed, &self.repaired)?;

        let group = layout.group_of(self.offset);
        let pos = layout.page_position(group, self.offset);
        println!("offset {} is in group {} at page {}", self.offset, group,
                 pos);

        let mut table = tabular::Table::new("{:>} {:<} {:>} {:>} {:<}");
        table.add_row(tabular::Row::new()
            .with_cell("UNIT")
            .with_cell("KIND")
            .with_cell("DEVICE")
            .with_cell("FRAME")
            .with_cell("PLACEMENT"));
        for unit in 0..layout.width() {
            let src = SrcAddr::new(group, unit);
            let tgt = layout.src_to_tgt(src);
            let placed = match placement(&layout, &machine, src) {
                Placement::Primary(_) => String::from("primary"),
                Placement::Spare(t) => format!("spare on {}", t.dev),
                Placement::Unavailable => String::from("unavailable"),
            };
            table.add_row(tabular::Row::new()
                .with_cell(unit)
                .with_cell(format!("{:?}", layout.unit_classify(unit)))
                .with_cell(tgt.dev)
                .with_cell(tgt.frame)
                .with_cell(placed));
        }
        print!("{table}");
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Run a random workload against an in-memory pool
struct Sim {
    /// Seed for the workload's random number generator
    #[clap(long, default_value_t = 0)]
    seed:      u64,
    /// Number of write and verify steps
    #[clap(long, default_value_t = 100)]
    steps:     u32,
    /// Highest file offset the workload touches, in parity groups
    #[clap(long, default_value_t = 16)]
    groups:    u64,
    /// Device to fail during the run
    #[clap(long, requires("fail_at"))]
    fail_dev:  Option<u32>,
    /// Step at which to fail the device
    #[clap(long, requires("fail_dev"))]
    fail_at:   Option<u32>,
    /// Step at which to rebuild the failed device onto spares
    #[clap(long, requires("fail_at"))]
    repair_at: Option<u32>,
}

impl Sim {
    async fn main(self, config: Config) -> Result<()> {
        let machine = Arc::new(PoolMachine::new(config.layout.pool_width));
        let view = Arc::new(PoolView::new(machine.clone()));
        let store = Arc::new(MemStore::new(machine.clone()));
        let client = Client::new(config, view, store.clone())?;
        let layout = client.layout();
        let codec = Codec::new(layout.n(), layout.k())?;
        let gds = layout.group_data_size();
        let fid = Fid::new(0, 1);

        let mut seed = [0u8; 16];
        seed[..8].copy_from_slice(&self.seed.to_le_bytes());
        let mut rng = XorShiftRng::from_seed(seed);
        let mut model: Vec<u8> = Vec::new();
        let mut written = 0u64;
        for step in 0..self.steps {
            let dev = self.fail_dev;
            if let Some(dev) = dev.filter(|_| self.fail_at == Some(step)) {
                tracing::info!(step, dev, "failing device");
                machine.set_state(dev, DeviceState::Failed)?;
            }
            if let Some(dev) = dev.filter(|_| self.repair_at == Some(step)) {
                tracing::info!(step, dev, "repairing device");
                machine.set_state(dev, DeviceState::Repairing)?;
                let slot = machine.spare_slot(dev).ok_or(Error::EINVAL)?;
                let groups = client.file_size(fid).div_ceil(gds);
                store.repair(layout, &codec, fid, 0..groups, dev, slot)?;
                machine.set_state(dev, DeviceState::Repaired)?;
            }

            let offset = rng.gen_range(0..self.groups * gds);
            let mut wbuf = vec![0u8; rng.gen_range(1..=gds as usize)];
            rng.fill_bytes(&mut wbuf);
            written += client.write_at(fid, offset, &wbuf).await?;
            let end = offset as usize + wbuf.len();
            if model.len() < end {
                model.resize(end, 0);
            }
            model[offset as usize..end].copy_from_slice(&wbuf);

            let offset = rng.gen_range(0..model.len());
            let len = rng.gen_range(1..=model.len() - offset);
            let mut rbuf = vec![0u8; len];
            client.read_at(fid, offset as u64, &mut rbuf).await?;
            verify(step, offset, &rbuf, &model)?;
        }

        let stats = client.stats().await;
        let bufs = client.buf_stats();
        println!("steps:        {}", self.steps);
        println!("written:      {}", bibytes1(written as f64));
        println!("file size:    {}", bibytes1(client.file_size(fid) as f64));
        println!("requests:     {} ({} failed)", stats.requests, stats.failed);
        println!("transitions:  {}", stats.transitions);
        println!("fops:         {} ({} submitted)", stats.fops,
                 store.submitted());
        println!("pages:        {} allocated, {} live", bufs.allocated(),
                 bufs.live());
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
enum SubCommand {
    Map(Map),
    Sim(Sim),
}

#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
struct Cli {
    /// Path to a YAML configuration file
    #[clap(long)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    cmd:    SubCommand,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli: Cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    match cli.cmd {
        SubCommand::Map(map) => map.main(&config),
        SubCommand::Sim(sim) => sim.main(config).await,
    }
}

// LCOV_EXCL_STOP
