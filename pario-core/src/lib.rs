// vim: tw=80
//! Client-side I/O engine for erasure-coded files.
//!
//! Files are striped over a pool of devices in parity groups of `N` data
//! units, `K` parity units, and `K` spare units.  The engine turns each caller
//! request into per-group buffer plans, chooses between full-stripe and
//! read-modify-write updates, batches the resulting page I/O into protocol
//! requests per target, and reconstructs data lost to failed devices.

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// Error variants are spelled like the errno values they carry
#![allow(clippy::upper_case_acronyms)]

pub mod buf;
pub mod client;
pub mod codec;
pub mod config;
pub mod dgmode;
pub mod extent;
pub mod ioreq;
pub mod layout;
pub mod mem_store;
pub mod nw_xfer;
pub mod pargrp;
pub mod pool;
pub mod sm_group;
pub mod tioreq;
pub mod transport;
pub mod types;
pub mod util;

pub use crate::types::*;
