// vim: tw=80
//! Common utility functions used throughout pario

use std::ops::{Add, Div, Sub};

/// Length of the global read-only `ZERO_REGION`.  Also the largest supported
/// page size.
pub const ZERO_REGION_LEN: usize = 64 * 1024;

/// A read-only buffer of zeros, standing in for data pages that were never
/// allocated.
pub static ZERO_REGION: [u8; ZERO_REGION_LEN] = [0; ZERO_REGION_LEN];

/// Return a zero-filled page of the given size.
///
/// # Panics
///
/// If `len` is larger than `ZERO_REGION_LEN`.  Layout validation rejects such
/// page sizes.
pub fn zero_page(len: usize) -> &'static [u8] {
    &ZERO_REGION[..len]
}

/// Types that are compatible with `div_roundup`
pub trait RoundupAble: Copy + Add<Output=Self> + Div<Output=Self>
    + Sub<Output=Self> + From<u8> {}

impl<T> RoundupAble for T
    where T: Copy + Add<Output=T> + Div<Output=T> + Sub<Output=T> + From<u8> {}

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T: RoundupAble>(dividend: T, divisor: T) -> T {
    (dividend + divisor - T::from(1u8)) / divisor
}

/// Round `x` down to a multiple of `align`
pub fn round_down(x: u64, align: u64) -> u64 {
    x - x % align
}

/// Round `x` up to a multiple of `align`
pub fn round_up(x: u64, align: u64) -> u64 {
    div_roundup(x, align) * align
}

/// XOR `src` into `dst`.
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= *s;
    }
}

// LCOV_EXCL_START
#[cfg(test)]
/// Helper to generate the runtime used by most unit tests
pub fn basic_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

// LCOV_EXCL_STOP
