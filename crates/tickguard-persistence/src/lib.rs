//! Bundled collaborators for the protection engine.
//!
//! - [`MemoryPositionStore`]: open positions held in memory, optionally
//!   seeded from a JSON file
//! - [`CommandJournal`]: close commands appended to daily JSON Lines files

pub mod error;
pub mod journal;
pub mod store;

pub use error::{PersistenceError, PersistenceResult};
pub use journal::{read_journal, CommandJournal};
pub use store::MemoryPositionStore;
