//! Restoring and listing existing archives.

use std::sync::Arc;

use anyhow::Error;

use pgarch_api_types::{ArchiveFormat, RestoreOptions};
use pgarch_archive::{ArchiveHandle, Connector};
use pgarch_tools::exit::ExitContext;

/// Where restored statements go.
pub enum RestoreTarget {
    /// Print a script, to `RestoreOptions::filename` or standard output.
    Script,
    /// Execute through sessions from this connector.
    Database(Arc<dyn Connector>),
}

/// Restore the archive at `path`. Returns the number of errors ignored
/// while restoring into a database.
pub fn restore_archive(
    path: &str,
    format: ArchiveFormat,
    ropts: &RestoreOptions,
    jobs: usize,
    target: RestoreTarget,
    exit: ExitContext,
) -> Result<usize, Error> {
    let mut handle = ArchiveHandle::open(path, format, exit)?;
    handle.set_jobs(jobs);

    // scripts go to standard output unless ropts.filename redirects them
    if let RestoreTarget::Database(connector) = target {
        let connection = connector.connect()?;
        handle.set_connection(connection);
        handle.set_connector(connector);
    }

    handle.restore(ropts)?;
    let errors = handle.error_count();
    handle.close()?;

    if errors > 0 {
        log::warn!("errors ignored on restore: {}", errors);
    }
    Ok(errors)
}

/// Print the table of contents of the archive at `path`.
pub fn list_archive(
    path: &str,
    format: ArchiveFormat,
    ropts: &RestoreOptions,
    exit: ExitContext,
) -> Result<(), Error> {
    let mut handle = ArchiveHandle::open(path, format, exit)?;
    if let Some(list) = &ropts.toc_file {
        let mut ropts = ropts.clone();
        ropts.id_wanted = Some(handle.sort_toc_from_file(list)?);
        handle.print_toc_summary(&ropts)?;
    } else {
        handle.print_toc_summary(ropts)?;
    }
    handle.close()
}
