//! Database session abstraction.
//!
//! The archive engine never talks to a server directly. Restoring into a
//! database and parallel jobs go through these traits, the binary or an
//! embedding application provides the implementation.

use std::sync::Arc;

use anyhow::Error;

use pgarch_api_types::Oid;

use crate::error::ArchiveError;

/// Cancels the statement currently running on a session.
///
/// Must be callable from any thread while the session is busy.
pub trait CancelToken: Send + Sync {
    fn cancel(&self) -> Result<(), Error>;
}

/// One database session.
pub trait Connection: Send {
    /// Execute one or more SQL statements.
    fn execute(&mut self, sql: &str) -> Result<(), Error>;

    /// Enter COPY FROM STDIN mode with the given statement.
    fn copy_start(&mut self, copy_stmt: &str) -> Result<(), Error>;

    /// Send raw COPY data.
    fn copy_data(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Finish COPY mode and report the server's verdict.
    fn copy_end(&mut self) -> Result<(), Error>;

    /// Create large object `oid` and open it for writing.
    fn lo_create(&mut self, oid: Oid) -> Result<(), Error>;

    fn lo_write(&mut self, oid: Oid, data: &[u8]) -> Result<(), Error>;

    fn lo_close(&mut self, oid: Oid) -> Result<(), Error>;

    fn cancel_token(&self) -> Option<Arc<dyn CancelToken>> {
        None
    }
}

/// Opens new sessions for parallel workers.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>, Error>;
}

/// Take an ACCESS SHARE lock on `relation` without waiting.
///
/// Used by worker jobs, so a conflicting lock requested after the leader
/// locked the table fails the job instead of deadlocking it.
pub fn lock_relation_nowait(
    conn: &mut dyn Connection,
    relation: &str,
    dump_id: i32,
) -> Result<(), Error> {
    let sql = format!("LOCK TABLE {} IN ACCESS SHARE MODE NOWAIT", relation);
    conn.execute(&sql).map_err(|err| {
        log::debug!("lock on {} failed: {}", relation, err);
        ArchiveError::LockNotAvailable {
            relation: relation.to_string(),
            dump_id,
        }
        .into()
    })
}
