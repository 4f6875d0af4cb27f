pub mod codec;
pub mod hashing;
pub mod types;

pub use types::*;
