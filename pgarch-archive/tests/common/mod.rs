#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Error};

use pgarch_api_types::{ArchiveFormat, CompressionSpec, DumpId, DumpOptions, ObjectClass, Oid};
use pgarch_archive::{ArchiveEntryOpts, ArchiveHandle, Connection, Connector, DumpContext};
use pgarch_tools::exit::ExitContext;

/// Script output collected in memory.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Fresh, not yet existing path below the system temp directory.
pub fn test_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("pgarch-test-{}-{}", std::process::id(), name));
    let _ = std::fs::remove_dir_all(&path);
    let _ = std::fs::remove_file(&path);
    path
}

pub fn exit_context() -> ExitContext {
    ExitContext::new("pgarch-test")
}

pub fn create(path: &PathBuf, format: ArchiveFormat, compression: CompressionSpec) -> ArchiveHandle {
    let options = DumpOptions {
        compression,
        dbname: "regression".to_string(),
        ..Default::default()
    };
    ArchiveHandle::create(path.to_str().unwrap(), format, &options, exit_context()).unwrap()
}

pub fn open(path: &PathBuf) -> ArchiveHandle {
    ArchiveHandle::open(path.to_str().unwrap(), ArchiveFormat::Unknown, exit_context()).unwrap()
}

/// Script output of a handle, captured in memory.
pub fn capture(handle: &mut ArchiveHandle) -> SharedBuffer {
    let buffer = SharedBuffer::default();
    handle
        .set_output_writer(Box::new(buffer.clone()), CompressionSpec::NONE)
        .unwrap();
    buffer
}

pub fn table(handle: &mut ArchiveHandle, name: &str) -> DumpId {
    handle
        .archive_entry(
            ArchiveEntryOpts::new(ObjectClass::Table, name)
                .defn(&format!("CREATE TABLE {} (a int, b text);\n", name))
                .drop_stmt(&format!("DROP TABLE {};\n", name)),
        )
        .unwrap()
}

/// Data entry producing `rows` COPY rows.
pub fn table_data(handle: &mut ArchiveHandle, name: &str, deps: &[DumpId], rows: usize) -> DumpId {
    handle
        .archive_entry(
            ArchiveEntryOpts::new(ObjectClass::TableData, name)
                .copy_stmt(&format!("COPY {} (a, b) FROM stdin;\n", name))
                .deps(deps)
                .dumper(move |ctx: &mut DumpContext<'_>| -> Result<(), Error> {
                    for i in 0..rows {
                        ctx.write_data(format!("{}\trow {}\n", i, i).as_bytes())?;
                    }
                    Ok(())
                }),
        )
        .unwrap()
}

#[derive(Default)]
pub struct FakeDbState {
    /// Committed row count per table.
    pub rows: HashMap<String, usize>,
    /// Statements per session, in execution order.
    pub sessions: Vec<Vec<String>>,
    /// Large objects with their contents.
    pub large_objects: HashMap<Oid, Vec<u8>>,
    /// LOCK statements on this relation fail.
    pub locked: Option<String>,
    /// Creating this large object fails.
    pub broken_lo: Option<Oid>,
}

/// In-memory stand-in for a database server.
#[derive(Clone, Default)]
pub struct FakeDb(pub Arc<Mutex<FakeDbState>>);

impl FakeDb {
    pub fn locking(relation: &str) -> Self {
        let db = FakeDb::default();
        db.0.lock().unwrap().locked = Some(relation.to_string());
        db
    }

    pub fn rows(&self, table: &str) -> usize {
        self.0.lock().unwrap().rows.get(table).copied().unwrap_or(0)
    }

    pub fn sessions(&self) -> Vec<Vec<String>> {
        self.0.lock().unwrap().sessions.clone()
    }

    pub fn session(&self) -> FakeSession {
        let mut state = self.0.lock().unwrap();
        state.sessions.push(Vec::new());
        FakeSession {
            db: self.clone(),
            index: state.sessions.len() - 1,
            copy: None,
        }
    }
}

impl Connector for FakeDb {
    fn connect(&self) -> Result<Box<dyn Connection>, Error> {
        Ok(Box::new(self.session()))
    }
}

pub struct FakeSession {
    db: FakeDb,
    index: usize,
    copy: Option<(String, usize)>,
}

impl FakeSession {
    fn log(&self, sql: &str) {
        self.db.0.lock().unwrap().sessions[self.index].push(sql.trim().to_string());
    }
}

impl Connection for FakeSession {
    fn execute(&mut self, sql: &str) -> Result<(), Error> {
        self.log(sql);
        let state = self.db.0.lock().unwrap();
        if let Some(relation) = &state.locked {
            if sql.starts_with("LOCK TABLE") && sql.contains(&format!("{} IN", relation)) {
                bail!("could not obtain lock on relation \"{}\"", relation);
            }
        }
        Ok(())
    }

    fn copy_start(&mut self, copy_stmt: &str) -> Result<(), Error> {
        self.log(copy_stmt);
        let table = copy_stmt
            .split_whitespace()
            .nth(1)
            .unwrap_or_default()
            .to_string();
        self.copy = Some((table, 0));
        Ok(())
    }

    fn copy_data(&mut self, data: &[u8]) -> Result<(), Error> {
        match self.copy.as_mut() {
            Some((_, rows)) => {
                *rows += data.iter().filter(|b| **b == b'\n').count();
                Ok(())
            }
            None => bail!("not in COPY mode"),
        }
    }

    fn copy_end(&mut self) -> Result<(), Error> {
        let (table, rows) = match self.copy.take() {
            Some(copy) => copy,
            None => bail!("not in COPY mode"),
        };
        self.log("\\.");
        *self.db.0.lock().unwrap().rows.entry(table).or_insert(0) += rows;
        Ok(())
    }

    fn lo_create(&mut self, oid: Oid) -> Result<(), Error> {
        let mut state = self.db.0.lock().unwrap();
        if state.broken_lo == Some(oid) {
            bail!("large object {} already exists", oid);
        }
        state.large_objects.insert(oid, Vec::new());
        Ok(())
    }

    fn lo_write(&mut self, oid: Oid, data: &[u8]) -> Result<(), Error> {
        match self.db.0.lock().unwrap().large_objects.get_mut(&oid) {
            Some(content) => {
                content.extend_from_slice(data);
                Ok(())
            }
            None => bail!("large object {} does not exist", oid),
        }
    }

    fn lo_close(&mut self, _oid: Oid) -> Result<(), Error> {
        Ok(())
    }
}
