//! ito-crypto: temporary contact number generation and disclosure
//!
//! Hash chain:
//! ```text
//! seed (256-bit random) = chain[0]
//!   chain[i+1] = SHA-256("ito-ratchet-step" || chain[i])
//!   tcn[i]     = SHA-256("ito-tcn" || i_be32 || chain[i])[..16]
//! ```
//!
//! A report discloses `chain[start]` together with `[start, end]`. Anyone holding
//! the report re-walks the chain forward and recomputes every TCN in range; the
//! step is one-way, so nothing before `start` can be recovered.
//!
//! Report wire format:
//! ```text
//! [version: 1][chain[start]: 32][start: 4 BE][end: 4 BE][memo_len: 1][memo: memo_len]
//! ```

pub mod keys;
pub mod ratchet;
pub mod report;

pub use keys::{advance, derive_tcn, generate_seed, ChainKey};
pub use ratchet::RatchetState;
pub use report::{Report, TcnIter};

/// Size of a chain key / ratchet seed in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Current report wire format version
pub const REPORT_VERSION: u8 = 1;

/// Fixed part of an encoded report: version + commitment + start + end + memo_len
pub const REPORT_HEADER_SIZE: usize = 1 + KEY_SIZE + 4 + 4 + 1;

/// Largest memo a report can carry (length is encoded in one byte)
pub const MAX_MEMO_LEN: usize = u8::MAX as usize;
