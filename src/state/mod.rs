//! Durable state backends
//!
//! Both backends implement [`declarative::StateStore`]. Records arrive with
//! secrets already sealed, so nothing here ever sees plaintext.

mod file;
mod sqlite;

pub use declarative::{MemoryStateStore, StateStore};
pub use file::FileStateStore;
pub use sqlite::SqliteStateStore;
