use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Error;

use pgarch_api_types::{ArchiveFormat, CompressionSpec, DumpOptions, RestoreOptions};
use pgarch_archive::ArchiveHandle;

mod common;
use common::*;

/// Directory archive with three tables whose data refer to each other in
/// a ring, plus an index on each.
fn ring_archive(name: &str) -> PathBuf {
    let path = test_path(name);
    let mut handle = create(&path, ArchiveFormat::Directory, CompressionSpec::NONE);

    let ta = table(&mut handle, "a");
    let tb = table(&mut handle, "b");
    let tc = table(&mut handle, "c");
    // forward references, ids 4..6 are the data entries below
    table_data(&mut handle, "a", &[ta, 5], 300);
    table_data(&mut handle, "b", &[tb, 6], 200);
    table_data(&mut handle, "c", &[tc, 4], 100);
    for (table, id) in [("a", ta), ("b", tb), ("c", tc)] {
        handle
            .archive_entry(
                pgarch_archive::ArchiveEntryOpts::new(
                    pgarch_api_types::ObjectClass::Index,
                    &format!("{}_a_idx", table),
                )
                .defn(&format!("CREATE INDEX {0}_a_idx ON {0} (a);\n", table))
                .deps(&[id]),
            )
            .unwrap();
    }

    handle.close().unwrap();
    assert!(handle.sort_report().has_foreign_key_ring());
    path
}

fn restore_into(path: &PathBuf, db: &FakeDb, jobs: usize) -> Result<(), Error> {
    let mut handle = open(path);
    handle.set_connection(Box::new(db.session()));
    handle.set_connector(Arc::new(db.clone()));
    handle.set_jobs(jobs);
    handle.restore(&RestoreOptions::default())?;
    handle.close()
}

/// Every table lock lives inside its own transaction.
fn assert_locks_in_transactions(session: &[String]) {
    let mut in_transaction = false;
    for statement in session {
        if statement == "BEGIN" {
            assert!(!in_transaction, "nested BEGIN in {:?}", session);
            in_transaction = true;
        } else if statement.starts_with("LOCK TABLE") {
            assert!(in_transaction, "lock outside transaction in {:?}", session);
        } else if statement == "COMMIT" || statement == "ROLLBACK" {
            in_transaction = false;
        }
    }
    assert!(!in_transaction, "unterminated transaction in {:?}", session);
}

#[test]
fn foreign_key_ring_restores_in_parallel() -> Result<(), Error> {
    let path = ring_archive("fk-ring");

    let serial = FakeDb::default();
    restore_into(&path, &serial, 1)?;

    let parallel = FakeDb::default();
    restore_into(&path, &parallel, 4)?;

    for (table, rows) in [("a", 300), ("b", 200), ("c", 100)] {
        assert_eq!(serial.rows(table), rows);
        assert_eq!(parallel.rows(table), rows);
    }

    // leader plus one session per worker
    let sessions = parallel.sessions();
    assert_eq!(sessions.len(), 5);

    let leader = &sessions[0];
    for table in ["a", "b", "c"] {
        let create = format!("CREATE TABLE {} (a int, b text);", table);
        assert!(leader.iter().any(|s| s.contains(&create)));
    }

    let mut locks = 0;
    for session in sessions.iter() {
        assert_locks_in_transactions(session);
        locks += session.iter().filter(|s| s.starts_with("LOCK TABLE")).count();
    }
    assert_eq!(locks, 3);

    let indexes = sessions
        .iter()
        .flatten()
        .filter(|s| s.contains("CREATE INDEX"))
        .count();
    assert_eq!(indexes, 3);

    let _ = std::fs::remove_dir_all(&path);
    Ok(())
}

#[test]
fn unavailable_lock_fails_restore() -> Result<(), Error> {
    let path = ring_archive("lock-fail");

    let db = FakeDb::locking("b");
    let err = restore_into(&path, &db, 2).unwrap_err();
    assert!(
        err.to_string().contains("could not obtain lock on relation \"b\""),
        "unexpected error: {}",
        err
    );

    let sessions = db.sessions();
    let failing = sessions
        .iter()
        .find(|session| session.iter().any(|s| s.starts_with("LOCK TABLE b IN")))
        .expect("no session tried to lock b");
    let pos = failing
        .iter()
        .position(|s| s.starts_with("LOCK TABLE b IN"))
        .unwrap();
    assert_eq!(failing[pos + 1..].to_vec(), vec!["ROLLBACK".to_string()]);
    for session in sessions.iter() {
        assert_locks_in_transactions(session);
    }

    let _ = std::fs::remove_dir_all(&path);
    Ok(())
}

/// Directory archive of five tables, dumped by three workers with
/// sessions from `source`.
fn parallel_dump(path: &PathBuf, source: &FakeDb) -> Result<Vec<(&'static str, usize)>, Error> {
    let options = DumpOptions {
        compression: CompressionSpec::from_gzip_level(-1),
        dbname: "regression".to_string(),
        jobs: 3,
        ..Default::default()
    };
    let mut handle = ArchiveHandle::create(
        path.to_str().unwrap(),
        ArchiveFormat::Directory,
        &options,
        exit_context(),
    )?;
    handle.set_connector(Arc::new(source.clone()));

    let mut expected = Vec::new();
    for (i, name) in ["t1", "t2", "t3", "t4", "t5"].iter().enumerate() {
        let id = table(&mut handle, name);
        let rows = (i + 1) * 1000;
        table_data(&mut handle, name, &[id], rows);
        expected.push((*name, rows));
    }
    handle.close()?;
    Ok(expected)
}

#[test]
fn parallel_dump_writes_all_data() -> Result<(), Error> {
    let path = test_path("parallel-dump");
    let source = FakeDb::default();
    let expected = parallel_dump(&path, &source)?;

    let sessions = source.sessions();
    assert_eq!(sessions.len(), 3);
    let mut locks = 0;
    for session in sessions.iter() {
        assert_locks_in_transactions(session);
        locks += session.iter().filter(|s| s.starts_with("LOCK TABLE")).count();
        let commits = session.iter().filter(|s| *s == "COMMIT").count();
        assert_eq!(commits, session.iter().filter(|s| *s == "BEGIN").count());
    }
    assert_eq!(locks, 5);

    let db = FakeDb::default();
    restore_into(&path, &db, 1)?;
    for (name, rows) in expected {
        assert_eq!(db.rows(name), rows);
    }

    let _ = std::fs::remove_dir_all(&path);
    Ok(())
}

#[test]
fn unavailable_lock_fails_dump() -> Result<(), Error> {
    let path = test_path("parallel-dump-lock");
    let source = FakeDb::locking("t3");
    assert!(parallel_dump(&path, &source).is_err());

    let sessions = source.sessions();
    let failing = sessions
        .iter()
        .find(|session| session.iter().any(|s| s.starts_with("LOCK TABLE t3 IN")))
        .expect("no session tried to lock t3");
    let pos = failing
        .iter()
        .position(|s| s.starts_with("LOCK TABLE t3 IN"))
        .unwrap();
    assert_eq!(failing[pos - 1], "BEGIN");
    assert_eq!(failing[pos + 1..].to_vec(), vec!["ROLLBACK".to_string()]);
    for session in sessions.iter() {
        assert_locks_in_transactions(session);
    }

    let _ = std::fs::remove_dir_all(&path);
    Ok(())
}

#[test]
fn parallel_restore_needs_a_database() -> Result<(), Error> {
    let path = ring_archive("needs-db");

    let mut handle = open(&path);
    let _output = capture(&mut handle);
    handle.set_jobs(2);
    let err = handle.restore(&RestoreOptions::default()).unwrap_err();
    assert!(err
        .to_string()
        .contains("parallel restore is only supported when restoring into a database"));

    let _ = std::fs::remove_dir_all(&path);
    Ok(())
}

#[test]
fn list_file_selects_and_orders() -> Result<(), Error> {
    let path = test_path("list-file.dump");
    let mut handle = create(&path, ArchiveFormat::Custom, CompressionSpec::NONE);
    let t1 = table(&mut handle, "first");
    let t2 = table(&mut handle, "second");
    let t3 = table(&mut handle, "third");
    handle.close()?;

    let mut handle = open(&path);
    let listing = capture(&mut handle);
    handle.print_toc_summary(&RestoreOptions::default())?;
    let text = listing.text();
    assert!(text.contains("; Selected TOC Entries:"));
    assert!(text.contains(";     dbname: regression"));
    assert!(text.contains(&format!("{}; 0 0 TABLE - first", t1)));

    let list = test_path("list-file.list");
    std::fs::write(
        &list,
        format!("; reversed\n{}; TABLE - third\n\n{}; TABLE - first\n", t3, t1),
    )?;

    let script = capture(&mut handle);
    let ropts = RestoreOptions {
        toc_file: Some(list.to_str().unwrap().to_string()),
        ..Default::default()
    };
    handle.restore(&ropts)?;
    handle.close()?;

    let text = script.text();
    let third = text.find("CREATE TABLE third").unwrap();
    let first = text.find("CREATE TABLE first").unwrap();
    assert!(third < first);
    assert!(!text.contains("CREATE TABLE second"));
    let _ = t2;

    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(&list);
    Ok(())
}
