//! Concrete blob stores: an instrumented in-memory store, a local directory
//! store and a key-prefixing adapter.

pub mod dir;
pub mod memory;
pub mod prefix;

pub use dir::DirBlobStore;
pub use memory::{MemoryBlobStore, StoreStats};
pub use prefix::PrefixBlobStore;
