//! redb table definitions for the record store.
//!
//! Values and versions live in separate tables keyed by the full record
//! path (`/{root}/{framework}/{record}`). A key present in
//! `RECORD_VERSIONS` is the authority on whether a record exists.

use redb::{Database, TableDefinition};

/// Record payloads keyed by path.
pub const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Current version of each record keyed by path.
pub const RECORD_VERSIONS: TableDefinition<&str, u64> = TableDefinition::new("record_versions");

/// Create the record tables if they don't exist yet.
pub fn ensure_tables(db: &Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    // Opening a table in a write transaction creates it if absent.
    txn.open_table(RECORDS)?;
    txn.open_table(RECORD_VERSIONS)?;
    txn.commit()?;
    Ok(())
}
