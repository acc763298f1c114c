// vim: tw=80
//! The seam between the I/O engine and the storage service

use std::pin::Pin;

#[cfg(test)] use mockall::automock;

use crate::{
    tioreq::Fop,
    types::*,
};

/// Future representing one protocol request.  Resolves to the number of
/// bytes transferred.
pub type FopFut = dyn futures::Future<Output = Result<u64>> + Send;

/// Boxed `FopFut`
pub type BoxFopFut = Pin<Box<FopFut>>;

/// Delivers protocol requests to the targets that own component objects.
///
/// The returned future must not borrow from the transport.  Once it
/// completes, every buffer that `fop` carried must have been dropped.
#[cfg_attr(test, automock)]
pub trait Transport: Send + Sync {
    fn submit(&self, fop: Fop) -> BoxFopFut;
}
