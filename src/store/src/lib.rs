pub mod codec;
pub mod error;
pub mod store;

pub use codec::{Codec, FnCodec, JsonCodec};
pub use error::Error;
pub use store::{open_database, DiskStore, Tombstone};
