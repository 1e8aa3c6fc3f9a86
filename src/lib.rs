//! Tiny embedded ordered key/value store.
//!
//! A single file holds everything: a copy-on-write B+tree of fixed
//! 4096-byte pages, a free list recycling the pages each rewrite leaves
//! behind, and a meta page anchoring the committed state. Reads are served
//! from a memory map; every mutation is flushed and fsynced before its
//! meta page is written, so a crash always lands on a committed state.
//!
//! ```no_run
//! use mykv::Store;
//!
//! let mut store = Store::open("data.db")?;
//! store.insert(b"page.title", b"hello")?;
//! assert_eq!(store.get(b"page.title")?, b"hello");
//! store.delete(b"page.title")?;
//! # Ok::<(), mykv::Error>(())
//! ```

#[macro_use]
mod errors;
pub mod storage;

pub use errors::Error;
pub use storage::store::Store;
