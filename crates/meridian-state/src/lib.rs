//! Meridian State - Persistence of committed blocks and evidence
//!
//! This crate provides the key/value storage abstraction and the
//! height-ordered block store the consensus layer appends commits to.

pub mod block_store;
pub mod error;
pub mod storage;

pub use block_store::BlockStore;
pub use error::StateError;
pub use storage::{FileStorage, MemoryStorage, Storage, WriteBatch};
