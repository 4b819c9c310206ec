//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

mod error;
mod hash;

pub use error::ChunkDbError;
pub use hash::{chunk_of, fnv1a_64};
