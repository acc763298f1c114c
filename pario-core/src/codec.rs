// vim: tw=80
//! Reed-Solomon erasure coding of parity group rows

use fixedbitset::FixedBitSet;
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::mem;

use crate::{
    types::*,
    util::{xor_into, zero_page},
};

impl From<reed_solomon_erasure::Error> for Error {
    fn from(e: reed_solomon_erasure::Error) -> Self {
        match e {
            reed_solomon_erasure::Error::TooFewShardsPresent => Error::EIO,
            _ => Error::EINVAL
        }
    }
}

/// An encoder/decoder for Reed-Solomon Erasure coding in GF(2^8), operating on
/// one page-row of a parity group at a time.
///
/// The code is linear, so parity may be updated incrementally: encoding a
/// difference between old and new data and adding it to the old parity yields
/// the new parity.
pub struct Codec {
    /// Number of data columns
    n: usize,

    /// Number of parity columns.  This many columns may be lost before the data
    /// becomes irrecoverable.
    k: usize,

    rs: ReedSolomon,
}

impl Codec {
    /// Initialize a new erasure codec for `n` data and `k` parity columns
    pub fn new(n: u32, k: u32) -> Result<Self> {
        let rs = ReedSolomon::new(n as usize, k as usize)?;
        Ok(Codec{n: n as usize, k: k as usize, rs})
    }

    /// Reconstruct missing columns in place
    ///
    /// # Parameters
    ///
    /// - `columns`:    Exactly `n + k` columns of equal length: data columns
    ///                 followed by parity columns.  Upon success every column
    ///                 named by `erasures` holds its original contents.
    /// - `erasures`:   Bitmap of the column indices of the missing columns.
    ///                 Their contents on entry are ignored.
    pub fn decode(&self, columns: &mut [Vec<u8>], erasures: &FixedBitSet)
        -> Result<()>
    {
        assert_eq!(columns.len(), self.n + self.k);
        if erasures.count_ones(..) > self.k {
            return Err(Error::EIO);
        }
        let mut shards = columns.iter_mut()
            .enumerate()
            .map(|(i, c)| (!erasures.contains(i)).then(|| mem::take(c)))
            .collect::<Vec<_>>();
        let r = self.rs.reconstruct(&mut shards);
        for (c, s) in columns.iter_mut().zip(shards) {
            if let Some(s) = s {
                *c = s;
            }
        }
        Ok(r?)
    }

    /// Generate parity columns from a complete set of data columns
    ///
    /// # Parameters
    /// - `data`:   Input array: `n` columns of equal length
    /// - `parity`: Storage for parity columns.  `k` columns of the same
    ///             length: will be overwritten upon return.
    pub fn encode(&self, data: &[&[u8]], parity: &mut [&mut [u8]])
        -> Result<()>
    {
        Ok(self.rs.encode_sep(data, parity)?)
    }

    /// Update parity for a change in a single data column.
    ///
    /// # Parameters
    /// - `col`:    Index of the changed data column
    /// - `delta`:  The XOR difference between that column's old and new
    ///             contents.
    /// - `parity`: The column's row of old parity.  Will be updated to the
    ///             new parity upon return.
    pub fn encode_delta(&self, col: usize, delta: &[u8],
                        parity: &mut [&mut [u8]]) -> Result<()>
    {
        assert!(col < self.n);
        let zero = zero_page(delta.len());
        let data = (0..self.n)
            .map(|i| if i == col { delta } else { zero })
            .collect::<Vec<_>>();
        let mut scratch = vec![vec![0u8; delta.len()]; self.k];
        self.rs.encode_sep(&data, &mut scratch)?;
        for (p, s) in parity.iter_mut().zip(scratch.iter()) {
            xor_into(p, s);
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
