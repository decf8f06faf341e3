pub use storage::encdec::{DecodingError, DecodingResult};

pub mod colored;
pub mod error;
pub mod ledger;
pub mod shutdown;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod test_utils;
