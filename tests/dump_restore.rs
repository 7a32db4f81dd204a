use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Error};
use serde_json::json;

use pgarch::restore::{list_archive, restore_archive, RestoreTarget};
use pgarch::source::{Manifest, ManifestSource};
use pgarch_api_types::{ArchiveFormat, CompressionSpec, DumpOptions, Oid, RestoreOptions};
use pgarch_archive::{Connection, Connector, LoopRepair};
use pgarch_tools::exit::ExitContext;

fn test_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("pgarch-root-{}-{}", std::process::id(), name));
    let _ = std::fs::remove_dir_all(&path);
    let _ = std::fs::remove_file(&path);
    path
}

fn shop_manifest() -> Manifest {
    serde_json::from_value(json!({
        "dbname": "shop",
        "server-version": "16.2",
        "objects": [
            {
                "class": "SCHEMA",
                "name": "sales",
                "create": "CREATE SCHEMA sales;\n",
                "drop": "DROP SCHEMA sales;\n",
            },
            {
                "class": "TABLE",
                "schema": "sales",
                "name": "orders",
                "owner": "shop",
                "create": "CREATE TABLE sales.orders (id integer, qty integer);\n",
                "drop": "DROP TABLE sales.orders;\n",
                "depends": ["SCHEMA sales", "CHECK CONSTRAINT sales.orders_qty_check"],
            },
            {
                "class": "CHECK CONSTRAINT",
                "schema": "sales",
                "name": "orders_qty_check",
                "create": "ALTER TABLE sales.orders ADD CONSTRAINT orders_qty_check CHECK (qty > 0);\n",
                "depends": ["TABLE sales.orders"],
                "owning-object": "TABLE sales.orders",
            },
            {
                "class": "TABLE DATA",
                "schema": "sales",
                "name": "orders",
                "copy": "COPY sales.orders (id, qty) FROM stdin;\n",
                "depends": ["TABLE sales.orders"],
                "rows": ["1\t3", "2\t5", "3\t1"],
            },
            {
                "class": "INDEX",
                "schema": "sales",
                "name": "orders_id_idx",
                "create": "CREATE INDEX orders_id_idx ON sales.orders (id);\n",
                "depends": ["TABLE sales.orders"],
            },
            {
                "class": "BLOBS",
                "name": "BLOBS",
                "blobs": [{ "oid": 24601, "data": "deadbeef" }],
            },
        ],
    }))
    .unwrap()
}

fn dump(path: &PathBuf, format: ArchiveFormat) -> Result<pgarch::dump::DumpStatus, Error> {
    let source = ManifestSource::new(shop_manifest(), &std::env::temp_dir());
    let options = DumpOptions {
        compression: CompressionSpec::from_gzip_level(6),
        ..Default::default()
    };
    pgarch::dump::dump_archive(
        &source,
        path.to_str().unwrap(),
        format,
        &options,
        &RestoreOptions::default(),
        ExitContext::new("pgarch-test"),
    )
}

fn restore_script(path: &PathBuf, ropts: RestoreOptions) -> Result<String, Error> {
    let script = test_path(&format!(
        "{}.sql",
        path.file_name().unwrap().to_string_lossy()
    ));
    let ropts = RestoreOptions {
        filename: Some(script.to_str().unwrap().to_string()),
        ..ropts
    };
    restore_archive(
        path.to_str().unwrap(),
        ArchiveFormat::Unknown,
        &ropts,
        1,
        RestoreTarget::Script,
        ExitContext::new("pgarch-test"),
    )?;
    let text = std::fs::read_to_string(&script)?;
    let _ = std::fs::remove_file(&script);
    Ok(text)
}

#[test]
fn check_constraint_loop_is_repaired() -> Result<(), Error> {
    let path = test_path("check-loop.dump");
    let status = dump(&path, ArchiveFormat::Custom)?;
    assert_eq!(status.entries, 6);

    assert!(status.sort_report.repairs.iter().any(|repair| matches!(
        repair,
        LoopRepair::TableConstraint {
            owner_id: 2,
            constraint_id: 3,
            ..
        }
    )));

    let script = restore_script(&path, RestoreOptions::default())?;
    let schema = script.find("CREATE SCHEMA sales;").unwrap();
    let table = script.find("CREATE TABLE sales.orders").unwrap();
    let check = script.find("ADD CONSTRAINT orders_qty_check").unwrap();
    let copy = script.find("COPY sales.orders (id, qty) FROM stdin;").unwrap();
    let index = script.find("CREATE INDEX orders_id_idx").unwrap();
    assert!(schema < table && table < check && check < copy && copy < index);
    assert!(script.contains("1\t3\n2\t5\n3\t1\n\\.\n"));
    assert!(script.contains("pg_catalog.lo_open('24601'"));

    let _ = std::fs::remove_file(&path);
    Ok(())
}

#[test]
fn sections_and_listing() -> Result<(), Error> {
    let path = test_path("sections.dump");
    dump(&path, ArchiveFormat::Directory)?;

    let ropts = RestoreOptions {
        sections: vec![pgarch_api_types::Section::PostData],
        ..Default::default()
    };
    let script = restore_script(&path, ropts)?;
    assert!(script.contains("CREATE INDEX orders_id_idx"));
    assert!(!script.contains("CREATE TABLE sales.orders"));
    assert!(!script.contains("COPY sales.orders"));

    let listing = test_path("sections.list");
    let ropts = RestoreOptions {
        filename: Some(listing.to_str().unwrap().to_string()),
        ..Default::default()
    };
    list_archive(
        path.to_str().unwrap(),
        ArchiveFormat::Unknown,
        &ropts,
        ExitContext::new("pgarch-test"),
    )?;
    let text = std::fs::read_to_string(&listing)?;
    assert!(text.contains(";     dbname: shop"));
    assert!(text.contains(";     Dumped from database version: 16.2"));
    assert!(text.contains("; Selected TOC Entries:"));
    assert!(text.contains("TABLE sales orders shop"));

    let _ = std::fs::remove_dir_all(&path);
    let _ = std::fs::remove_file(&listing);
    Ok(())
}

#[test]
fn tar_dump_carries_restore_script() -> Result<(), Error> {
    let path = test_path("shop.tar");
    dump(&path, ArchiveFormat::Tar)?;

    let mut archive = tar::Archive::new(std::fs::File::open(&path)?);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        names.push(entry?.path()?.to_string_lossy().into_owned());
    }
    assert_eq!(names.first().map(String::as_str), Some("toc.dat"));
    assert_eq!(names.last().map(String::as_str), Some("restore.sql"));
    assert!(names.iter().any(|name| name == "blob_24601.dat"));

    let _ = std::fs::remove_file(&path);
    Ok(())
}

#[test]
fn unknown_dependency_is_rejected() {
    let mut manifest = shop_manifest();
    manifest.objects[3].depends.push("TABLE sales.missing".to_string());
    let source = ManifestSource::new(manifest, &std::env::temp_dir());

    let path = test_path("unknown-dep.dump");
    let err = pgarch::dump::dump_archive(
        &source,
        path.to_str().unwrap(),
        ArchiveFormat::Custom,
        &DumpOptions::default(),
        &RestoreOptions::default(),
        ExitContext::new("pgarch-test"),
    )
    .unwrap_err();
    assert_eq!(
        err.to_string(),
        "object TABLE DATA sales.orders references unknown object TABLE sales.missing"
    );
    let _ = std::fs::remove_file(&path);
}

#[derive(Default)]
struct Recorded {
    statements: Vec<String>,
    copied: Vec<u8>,
    large_objects: Vec<(Oid, Vec<u8>)>,
}

#[derive(Clone, Default)]
struct RecordingDb(Arc<Mutex<Recorded>>);

impl Connector for RecordingDb {
    fn connect(&self) -> Result<Box<dyn Connection>, Error> {
        Ok(Box::new(self.clone()))
    }
}

impl Connection for RecordingDb {
    fn execute(&mut self, sql: &str) -> Result<(), Error> {
        if sql.contains("CREATE INDEX") {
            bail!("relation \"orders_id_idx\" already exists");
        }
        self.0.lock().unwrap().statements.push(sql.to_string());
        Ok(())
    }

    fn copy_start(&mut self, copy_stmt: &str) -> Result<(), Error> {
        self.0.lock().unwrap().statements.push(copy_stmt.to_string());
        Ok(())
    }

    fn copy_data(&mut self, data: &[u8]) -> Result<(), Error> {
        self.0.lock().unwrap().copied.extend_from_slice(data);
        Ok(())
    }

    fn copy_end(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn lo_create(&mut self, oid: Oid) -> Result<(), Error> {
        self.0.lock().unwrap().large_objects.push((oid, Vec::new()));
        Ok(())
    }

    fn lo_write(&mut self, oid: Oid, data: &[u8]) -> Result<(), Error> {
        let mut state = self.0.lock().unwrap();
        match state.large_objects.iter_mut().find(|(id, _)| *id == oid) {
            Some((_, content)) => content.extend_from_slice(data),
            None => bail!("large object {} not open", oid),
        }
        Ok(())
    }

    fn lo_close(&mut self, _oid: Oid) -> Result<(), Error> {
        Ok(())
    }
}

#[test]
fn restore_into_database_counts_errors() -> Result<(), Error> {
    let path = test_path("database.dump");
    dump(&path, ArchiveFormat::Custom)?;

    let db = RecordingDb::default();
    let errors = restore_archive(
        path.to_str().unwrap(),
        ArchiveFormat::Custom,
        &RestoreOptions::default(),
        1,
        RestoreTarget::Database(Arc::new(db.clone())),
        ExitContext::new("pgarch-test"),
    )?;
    assert_eq!(errors, 1);

    let state = db.0.lock().unwrap();
    assert_eq!(state.copied, b"1\t3\n2\t5\n3\t1\n".to_vec());
    assert_eq!(state.large_objects, vec![(24601, vec![0xde, 0xad, 0xbe, 0xef])]);
    assert!(state
        .statements
        .iter()
        .any(|sql| sql.contains("CREATE TABLE sales.orders")));
    drop(state);

    let ropts = RestoreOptions {
        exit_on_error: true,
        ..Default::default()
    };
    let err = restore_archive(
        path.to_str().unwrap(),
        ArchiveFormat::Custom,
        &ropts,
        1,
        RestoreTarget::Database(Arc::new(RecordingDb::default())),
        ExitContext::new("pgarch-test"),
    )
    .unwrap_err();
    assert!(err.to_string().contains("could not execute query"));

    let _ = std::fs::remove_file(&path);
    Ok(())
}
