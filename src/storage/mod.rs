pub mod sqlite;

pub use sqlite::EntryStore;
