use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;

use anyhow::Error;

use pgarch_api_types::{ArchiveFormat, CompressionSpec, ObjectClass, RestoreOptions};
use pgarch_archive::file_formats::K_VERS_MAX;
use pgarch_archive::{ArchiveEntryOpts, ArchiveHandle, DumpContext};

mod common;
use common::*;

fn rows_text(rows: usize) -> String {
    (0..rows).map(|i| format!("{}\trow {}\n", i, i)).collect()
}

#[test]
fn empty_custom_archive() -> Result<(), Error> {
    let path = test_path("empty.dump");
    let mut handle = create(&path, ArchiveFormat::Custom, CompressionSpec::NONE);
    let version = handle.header().version();
    handle.close()?;

    let handle = open(&path);
    assert_eq!(handle.format(), ArchiveFormat::Custom);
    assert_eq!(handle.header().version(), version);
    assert_eq!(version, K_VERS_MAX);
    assert_eq!(handle.header().dbname, "regression");
    assert!(handle.toc().iter().all(|te| te.class.is_boundary()));
    Ok(())
}

#[test]
fn single_table_script() -> Result<(), Error> {
    let path = test_path("single.dump");
    let mut handle = create(&path, ArchiveFormat::Custom, CompressionSpec::NONE);
    handle.archive_entry(
        ArchiveEntryOpts::new(ObjectClass::Table, "t")
            .defn("CREATE TABLE t (a int, b text);")
            .drop_stmt("DROP TABLE t;"),
    )?;
    handle.close()?;

    let mut handle = open(&path);
    let output = capture(&mut handle);
    handle.restore(&RestoreOptions::default())?;

    let script = output.text();
    assert!(script.contains("CREATE TABLE t (a int, b text);"));
    assert!(!script.contains("COPY"));
    assert!(!script.contains("DROP TABLE"));

    // with --clean the drop statement comes first
    let output = capture(&mut handle);
    handle.restore(&RestoreOptions {
        drop_schema: true,
        ..Default::default()
    })?;
    let script = output.text();
    let drop_pos = script.find("DROP TABLE t;").unwrap();
    let create_pos = script.find("CREATE TABLE t").unwrap();
    assert!(drop_pos < create_pos);
    Ok(())
}

#[test]
fn toc_survives_round_trip() -> Result<(), Error> {
    for format in [ArchiveFormat::Custom, ArchiveFormat::Directory, ArchiveFormat::Tar] {
        let path = test_path(&format!("roundtrip-{}", format.summary_name()));
        let mut handle = create(&path, format, CompressionSpec::NONE);
        let t = table(&mut handle, "t");
        table_data(&mut handle, "t", &[t], 3);
        handle.archive_entry(
            ArchiveEntryOpts::new(ObjectClass::Index, "t_idx")
                .namespace("public")
                .owner("alice")
                .defn("CREATE INDEX t_idx ON t (a);\n")
                .deps(&[t]),
        )?;
        handle.close()?;

        let written: Vec<_> = handle.toc().iter().cloned().collect();
        let read = open(&path);
        let read: Vec<_> = read.toc().iter().cloned().collect();

        assert_eq!(written.len(), read.len());
        for (a, b) in written.iter().zip(read.iter()) {
            assert_eq!(a.dump_id, b.dump_id);
            assert_eq!(a.catalog_id, b.catalog_id);
            assert_eq!(a.tag, b.tag);
            assert_eq!(a.class, b.class);
            assert_eq!(a.owner, b.owner);
            assert_eq!(a.defn, b.defn);
            assert_eq!(a.drop_stmt, b.drop_stmt);
            assert_eq!(a.deps, b.deps);
            assert_eq!(a.section, b.section);
        }
    }
    Ok(())
}

#[test]
fn directory_with_gzip() -> Result<(), Error> {
    let path = test_path("dir-gzip");
    let mut handle = create(&path, ArchiveFormat::Directory, "gzip".parse()?);
    let big = table_data(&mut handle, "t1", &[], 100_000);
    let small = table_data(&mut handle, "t2", &[], 10);
    handle.close()?;

    assert!(path.join("toc.dat").exists());
    assert!(path.join(format!("{}.dat.gz", big)).exists());
    assert!(path.join(format!("{}.dat.gz", small)).exists());

    let mut handle = open(&path);
    handle.prep_parallel_restore()?;
    let big_len = handle.toc().get(big).unwrap().data_length;
    let small_len = handle.toc().get(small).unwrap().data_length;
    assert!(big_len > small_len);

    let db = FakeDb::default();
    handle.set_connection(Box::new(db.session()));
    handle.restore(&RestoreOptions::default())?;
    assert_eq!(handle.error_count(), 0);
    assert_eq!(db.rows("t1"), 100_000);
    assert_eq!(db.rows("t2"), 10);
    Ok(())
}

#[test]
fn tar_rejects_out_of_order_reads() -> Result<(), Error> {
    let path = test_path("order.tar");
    let mut handle = create(&path, ArchiveFormat::Tar, CompressionSpec::NONE);
    for name in ["a", "b", "c"] {
        table_data(&mut handle, name, &[], 2);
    }
    handle.close()?;

    let mut handle = ArchiveHandle::open_stream(
        Box::new(File::open(&path)?),
        ArchiveFormat::Unknown,
        exit_context(),
    )?;
    assert_eq!(handle.format(), ArchiveFormat::Tar);
    let output = capture(&mut handle);

    handle.print_entry_data(3)?;
    assert_eq!(output.text(), rows_text(2));

    let err = handle.print_entry_data(2).unwrap_err();
    assert_eq!(
        err.to_string(),
        "restoring data out of order is not supported in this archive format"
    );
    Ok(())
}

#[test]
fn custom_seek_matches_sequential_read() -> Result<(), Error> {
    let path = test_path("seek.dump");
    let mut handle = create(&path, ArchiveFormat::Custom, "zstd".parse()?);
    let ids: Vec<_> = [10, 2000, 30]
        .iter()
        .enumerate()
        .map(|(i, rows)| table_data(&mut handle, &format!("t{}", i), &[], *rows))
        .collect();
    handle.close()?;

    let mut sequential = Vec::new();
    let mut stream = ArchiveHandle::open_stream(
        Box::new(File::open(&path)?),
        ArchiveFormat::Custom,
        exit_context(),
    )?;
    for id in &ids {
        let output = capture(&mut stream);
        stream.print_entry_data(*id)?;
        sequential.push(output.text());
    }

    let mut seekable = open(&path);
    for (id, expected) in ids.iter().zip(sequential.iter()).rev() {
        let output = capture(&mut seekable);
        seekable.print_entry_data(*id)?;
        assert_eq!(&output.text(), expected);
    }
    assert_eq!(sequential[1], rows_text(2000));
    Ok(())
}

fn member_names(path: &std::path::Path) -> Result<BTreeSet<String>, Error> {
    let mut archive = tar::Archive::new(File::open(path)?);
    let mut names = BTreeSet::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.insert(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}

#[test]
fn tar_members_match_directory_files() -> Result<(), Error> {
    let dir = test_path("layout-dir");
    let tar_path = test_path("layout.tar");

    for (path, format) in [(&dir, ArchiveFormat::Directory), (&tar_path, ArchiveFormat::Tar)] {
        let mut handle = create(path, format, CompressionSpec::NONE);
        let t = table(&mut handle, "t");
        table_data(&mut handle, "t", &[t], 5);
        table(&mut handle, "u");
        handle.close()?;
    }

    let mut files = BTreeSet::new();
    for entry in walkdir::WalkDir::new(&dir).min_depth(1) {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }

    let mut members = member_names(&tar_path)?;
    assert!(members.remove("restore.sql"));
    assert_eq!(members, files);
    assert!(files.contains("toc.dat"));
    Ok(())
}

#[test]
fn tar_restore_script_references_members() -> Result<(), Error> {
    let path = test_path("script.tar");
    let mut handle = create(&path, ArchiveFormat::Tar, CompressionSpec::NONE);
    let t = table(&mut handle, "t");
    let data = table_data(&mut handle, "t", &[t], 1);
    handle.close()?;

    let mut archive = tar::Archive::new(File::open(&path)?);
    let mut script = String::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == "restore.sql" {
            std::io::Read::read_to_string(&mut entry, &mut script)?;
        }
    }
    assert!(script.contains("CREATE TABLE t (a int, b text);"));
    assert!(script.contains(&format!("COPY t (a, b) FROM '$$PATH$$/{}.dat';", data)));
    Ok(())
}

#[test]
fn plain_script_is_written_on_close() -> Result<(), Error> {
    let path = test_path("plain.sql");
    let mut handle = create(&path, ArchiveFormat::Plain, CompressionSpec::NONE);
    let t = table(&mut handle, "t");
    table_data(&mut handle, "t", &[t], 2);
    handle.close()?;

    let script = std::fs::read_to_string(&path)?;
    let create_pos = script.find("CREATE TABLE t (a int, b text);").unwrap();
    let copy_pos = script.find("COPY t (a, b) FROM stdin;\n").unwrap();
    assert!(create_pos < copy_pos);
    assert!(script.contains(&format!("{}\\.\n", rows_text(2))));
    assert!(script.ends_with("-- PostgreSQL database dump complete\n--\n\n"));
    Ok(())
}

#[test]
fn null_format_prints_data_directly() -> Result<(), Error> {
    let options = pgarch_api_types::DumpOptions::default();
    let mut handle = ArchiveHandle::create("", ArchiveFormat::Null, &options, exit_context())?;
    let output = capture(&mut handle);

    let t = table(&mut handle, "t");
    table_data(&mut handle, "t", &[t], 3);
    handle.restore(&RestoreOptions {
        data_only: true,
        ..Default::default()
    })?;

    let script = output.text();
    assert!(!script.contains("CREATE TABLE"));
    assert!(script.contains(&format!("COPY t (a, b) FROM stdin;\n{}\\.\n", rows_text(3))));
    handle.close()?;
    Ok(())
}

#[test]
fn large_objects_round_trip() -> Result<(), Error> {
    for format in [ArchiveFormat::Custom, ArchiveFormat::Directory] {
        let path = test_path(&format!("blobs-{}", format.summary_name()));
        let mut handle = create(&path, format, "lz4".parse()?);
        handle.archive_entry(ArchiveEntryOpts::new(ObjectClass::Blobs, "BLOBS").dumper(
            |ctx: &mut DumpContext<'_>| -> Result<(), Error> {
                ctx.start_lo(16401)?;
                ctx.write_all(b"first large object")?;
                ctx.end_lo(16401)?;
                ctx.start_lo(16402)?;
                ctx.write_all(&[0u8, 255, 1, 254])?;
                ctx.end_lo(16402)?;
                // above i32::MAX, stored as a negative integer
                ctx.start_lo(0x8000_0000)?;
                ctx.write_all(b"high oid")?;
                ctx.end_lo(0x8000_0000)?;
                Ok(())
            },
        ))?;
        handle.close()?;

        let mut handle = open(&path);
        let db = FakeDb::default();
        handle.set_connection(Box::new(db.session()));
        handle.restore(&RestoreOptions::default())?;

        let state = db.0.lock().unwrap();
        assert_eq!(state.large_objects[&16401], b"first large object".to_vec());
        assert_eq!(state.large_objects[&16402], vec![0u8, 255, 1, 254]);
        assert_eq!(state.large_objects[&0x8000_0000], b"high oid".to_vec());
    }
    Ok(())
}

#[test]
fn failed_lo_create_is_counted() -> Result<(), Error> {
    let path = test_path("broken-lo.dump");
    let mut handle = create(&path, ArchiveFormat::Custom, CompressionSpec::NONE);
    handle.archive_entry(ArchiveEntryOpts::new(ObjectClass::Blobs, "BLOBS").dumper(
        |ctx: &mut DumpContext<'_>| -> Result<(), Error> {
            for oid in [16501, 16502, 16503] {
                ctx.start_lo(oid)?;
                ctx.write_all(format!("object {}", oid).as_bytes())?;
                ctx.end_lo(oid)?;
            }
            Ok(())
        },
    ))?;
    handle.close()?;

    let db = FakeDb::default();
    db.0.lock().unwrap().broken_lo = Some(16502);
    let mut handle = open(&path);
    handle.set_connection(Box::new(db.session()));
    handle.restore(&RestoreOptions::default())?;
    assert_eq!(handle.error_count(), 1);

    let state = db.0.lock().unwrap();
    assert_eq!(state.large_objects[&16501], b"object 16501".to_vec());
    assert!(!state.large_objects.contains_key(&16502));
    assert_eq!(state.large_objects[&16503], b"object 16503".to_vec());
    drop(state);

    let ropts = RestoreOptions {
        exit_on_error: true,
        ..Default::default()
    };
    let db = FakeDb::default();
    db.0.lock().unwrap().broken_lo = Some(16502);
    let mut handle = open(&path);
    handle.set_connection(Box::new(db.session()));
    let err = handle.restore(&ropts).unwrap_err();
    assert!(err.to_string().contains("could not create large object 16502"));

    let _ = std::fs::remove_file(&path);
    Ok(())
}

#[test]
fn failed_close_can_be_retried() -> Result<(), Error> {
    let path = test_path("retry-close");
    let mut handle = create(&path, ArchiveFormat::Directory, CompressionSpec::NONE);
    table(&mut handle, "kept");

    // the TOC file can not be written without its directory
    std::fs::remove_dir_all(&path)?;
    assert!(handle.close().is_err());

    std::fs::create_dir(&path)?;
    handle.close()?;
    assert!(path.join("toc.dat").exists());

    let mut handle = open(&path);
    let script = capture(&mut handle);
    handle.restore(&RestoreOptions::default())?;
    handle.close()?;
    assert!(script.text().contains("CREATE TABLE kept (a int, b text);"));

    let _ = std::fs::remove_dir_all(&path);
    Ok(())
}

#[test]
fn failed_dumper_keeps_archive_readable() -> Result<(), Error> {
    let path = test_path("failed.dump");
    let mut handle = create(&path, ArchiveFormat::Custom, CompressionSpec::NONE);
    table_data(&mut handle, "good", &[], 2);
    handle.archive_entry(
        ArchiveEntryOpts::new(ObjectClass::TableData, "bad")
            .copy_stmt("COPY bad FROM stdin;\n")
            .dumper(|ctx: &mut DumpContext<'_>| -> Result<(), Error> {
                ctx.write_data(b"partial\n")?;
                anyhow::bail!("connection lost")
            }),
    )?;
    table_data(&mut handle, "after", &[], 4);
    assert!(handle.close().is_err());

    let mut handle = open(&path);
    let db = FakeDb::default();
    handle.set_connection(Box::new(db.session()));
    handle.restore(&RestoreOptions::default())?;
    assert_eq!(db.rows("good"), 2);
    assert_eq!(db.rows("after"), 4);
    Ok(())
}
