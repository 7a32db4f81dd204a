//! Output side of restores: script files and database sessions.

use std::fmt;

use anyhow::{bail, format_err, Error};

use pgarch_api_types::{CompressionAlgorithm, CompressionSpec, Oid};
use pgarch_tools::compression::CompressFileHandle;

use crate::archive::ArchiveCore;
use crate::file_formats::INV_WRITE;
use crate::format::is_std_stream;

/// What kind of text is currently being written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    /// SQL statements.
    SqlCmds,
    /// Rows of a running COPY.
    CopyData,
    /// Data written as statements, e.g. INSERT commands.
    OtherData,
}

impl ArchiveCore {
    pub(crate) fn set_output(&mut self, handle: CompressFileHandle) -> Option<CompressFileHandle> {
        self.output.replace(handle)
    }

    /// Direct script output to `path`, `""` or `"-"` meaning standard
    /// output.
    pub(crate) fn set_output_file(
        &mut self,
        path: &str,
        compression: CompressionSpec,
    ) -> Result<Option<CompressFileHandle>, Error> {
        let handle = if is_std_stream(path) {
            CompressFileHandle::to_writer(Box::new(std::io::stdout()), compression)?
        } else if compression.is_none()
            || CompressionAlgorithm::from_suffix(
                std::path::Path::new(path)
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .unwrap_or(""),
            ) == Some(compression.algorithm)
        {
            CompressFileHandle::open_write_exact(path, compression)?
        } else {
            CompressFileHandle::open_write(path, compression)?
        };
        Ok(self.set_output(handle))
    }

    /// Output for script text, falling back to standard output.
    fn output_handle(&mut self) -> Result<&mut CompressFileHandle, Error> {
        if self.output.is_none() {
            let stdout = CompressFileHandle::to_writer(Box::new(std::io::stdout()), CompressionSpec::NONE)?;
            self.output = Some(stdout);
        }
        match self.output.as_mut() {
            Some(handle) => Ok(handle),
            None => bail!("no output file is open"),
        }
    }

    pub(crate) fn flush_output(&mut self) -> Result<(), Error> {
        if let Some(handle) = self.output.as_mut() {
            std::io::Write::flush(handle)
                .map_err(|err| format_err!("could not write to output file: {}", err))?;
        }
        Ok(())
    }

    pub(crate) fn close_output(&mut self) -> Result<(), Error> {
        if let Some(mut handle) = self.output.take() {
            handle
                .close()
                .map_err(|err| format_err!("could not close output file: {}", err))?;
        }
        Ok(())
    }

    /// Raw text for the script or the statement buffer, bypassing large
    /// object handling.
    pub(crate) fn write_output(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.connection.is_some() {
            match self.output_kind {
                OutputKind::CopyData => {
                    if self.copy_failed {
                        return Ok(());
                    }
                    let result = match self.connection.as_mut() {
                        Some(conn) => conn.copy_data(data),
                        None => Ok(()),
                    };
                    if let Err(err) = result {
                        self.copy_failed = true;
                        self.report_restore_error(format_err!("error returned by COPY: {}", err))?;
                    }
                }
                OutputKind::SqlCmds | OutputKind::OtherData => {
                    self.sql_buffer.push_str(&String::from_utf8_lossy(data));
                }
            }
            return Ok(());
        }

        self.output_handle()?
            .write_all(data)
            .map_err(|err| format_err!("could not write to output file: {}", err))
    }

    /// Write restored data: table data, statements or large object bytes.
    pub fn ahwrite(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        if let Some(oid) = self.writing_lo {
            if self.lo_failed {
                return Ok(());
            }
            if let Some(conn) = self.connection.as_mut() {
                return conn
                    .lo_write(oid, data)
                    .map_err(|err| format_err!("could not write to large object {}: {}", oid, err));
            }
            let text = format!(
                "SELECT pg_catalog.lowrite(0, '\\x{}');\n",
                hex::encode(data)
            );
            return self.write_output(text.as_bytes());
        }

        self.write_output(data)
    }

    pub fn ahprintf(&mut self, args: fmt::Arguments) -> Result<(), Error> {
        let text = fmt::format(args);
        self.write_output(text.as_bytes())
    }

    /// Count an error of a database restore, or fail if errors are fatal.
    pub(crate) fn report_restore_error(&mut self, err: Error) -> Result<(), Error> {
        if self.ropts.exit_on_error {
            return Err(err);
        }
        log::warn!("{}", err);
        self.n_errors += 1;
        Ok(())
    }

    /// Execute the buffered statements when restoring into a database.
    pub(crate) fn flush_sql(&mut self) -> Result<(), Error> {
        if self.sql_buffer.trim().is_empty() {
            self.sql_buffer.clear();
            return Ok(());
        }
        let sql = std::mem::take(&mut self.sql_buffer);
        let result = match self.connection.as_mut() {
            Some(conn) => conn.execute(&sql),
            None => return Ok(()),
        };
        if let Err(err) = result {
            self.report_restore_error(format_err!(
                "could not execute query: {}\nCommand was: {}",
                err,
                sql.trim_end()
            ))?;
        }
        Ok(())
    }

    /// Run one statement: executed directly, or printed to the script.
    pub(crate) fn execute_or_print(&mut self, sql: &str) -> Result<(), Error> {
        if self.connection.is_some() {
            self.flush_sql()?;
            self.sql_buffer.push_str(sql);
            return self.flush_sql();
        }
        self.write_output(sql.as_bytes())?;
        self.write_output(b"\n\n")
    }

    pub(crate) fn start_copy(&mut self, copy_stmt: &str) -> Result<(), Error> {
        self.copy_failed = false;
        if self.connection.is_some() {
            self.flush_sql()?;
            let result = match self.connection.as_mut() {
                Some(conn) => conn.copy_start(copy_stmt),
                None => Ok(()),
            };
            if let Err(err) = result {
                self.copy_failed = true;
                self.report_restore_error(format_err!(
                    "could not execute query: {}\nCommand was: {}",
                    err,
                    copy_stmt.trim_end()
                ))?;
            }
        } else {
            self.write_output(copy_stmt.as_bytes())?;
        }
        self.output_kind = OutputKind::CopyData;
        Ok(())
    }

    pub(crate) fn end_copy(&mut self, tag: &str) -> Result<(), Error> {
        self.output_kind = OutputKind::SqlCmds;
        if self.connection.is_none() {
            return self.write_output(b"\\.\n\n");
        }
        if self.copy_failed {
            return Ok(());
        }
        let result = match self.connection.as_mut() {
            Some(conn) => conn.copy_end(),
            None => Ok(()),
        };
        if let Err(err) = result {
            self.report_restore_error(format_err!("COPY failed for table \"{}\": {}", tag, err))?;
        }
        Ok(())
    }

    pub(crate) fn start_restore_los(&mut self) -> Result<(), Error> {
        if !self.ropts.single_transaction {
            if self.connection.is_some() {
                self.execute_or_print("BEGIN")?;
            } else {
                self.ahprintf(format_args!("BEGIN;\n\n"))?;
            }
        }
        Ok(())
    }

    pub(crate) fn end_restore_los(&mut self) -> Result<(), Error> {
        if !self.ropts.single_transaction {
            if self.connection.is_some() {
                self.execute_or_print("COMMIT")?;
            } else {
                self.ahprintf(format_args!("COMMIT;\n\n"))?;
            }
        }
        Ok(())
    }

    pub(crate) fn start_restore_lo(&mut self, oid: Oid) -> Result<(), Error> {
        log::debug!("restoring large object with OID {}", oid);

        self.lo_failed = false;
        if let Some(conn) = self.connection.as_mut() {
            if let Err(err) = conn.lo_create(oid) {
                self.lo_failed = true;
                self.report_restore_error(format_err!("could not create large object {}: {}", oid, err))?;
            }
        } else {
            if self.ropts.drop_schema {
                self.ahprintf(format_args!(
                    "SELECT pg_catalog.lo_unlink(oid) FROM pg_catalog.pg_largeobject_metadata WHERE oid = '{}';\n",
                    oid
                ))?;
            }
            self.ahprintf(format_args!(
                "SELECT pg_catalog.lo_create('{}');\nSELECT pg_catalog.lo_open('{}', {});\n",
                oid, oid, INV_WRITE
            ))?;
        }

        self.writing_lo = Some(oid);
        Ok(())
    }

    pub(crate) fn end_restore_lo(&mut self, oid: Oid) -> Result<(), Error> {
        self.writing_lo = None;
        if std::mem::take(&mut self.lo_failed) {
            return Ok(());
        }
        match self.connection.as_mut() {
            Some(conn) => conn
                .lo_close(oid)
                .map_err(|err| format_err!("could not close large object {}: {}", oid, err)),
            None => self.ahprintf(format_args!("SELECT pg_catalog.lo_close(0);\n\n")),
        }
    }
}
