use std::path::PathBuf;
use std::process::Command;

fn test_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("pgarch-cli-{}-{}", std::process::id(), name));
    let _ = std::fs::remove_dir_all(&path);
    let _ = std::fs::remove_file(&path);
    path
}

fn pgarch(args: &[&str]) -> std::process::Output {
    let exec_path = env!("CARGO_BIN_EXE_pgarch");
    Command::new(exec_path)
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("Failed to invoke '{}': {}", exec_path, err))
}

const MANIFEST: &str = r#"{
    "dbname": "inventory",
    "objects": [
        {
            "class": "TABLE",
            "name": "items",
            "create": "CREATE TABLE items (id integer, label text);\n",
            "drop": "DROP TABLE items;\n"
        },
        {
            "class": "TABLE DATA",
            "name": "items",
            "copy": "COPY items (id, label) FROM stdin;\n",
            "depends": ["TABLE items"],
            "rows": ["1\tbolt", "2\tnut"]
        }
    ]
}"#;

#[test]
fn dump_list_and_restore() {
    let manifest = test_path("manifest.json");
    std::fs::write(&manifest, MANIFEST).unwrap();
    let archive = test_path("inventory.dump");
    let manifest = manifest.to_str().unwrap();
    let archive = archive.to_str().unwrap();

    let output = pgarch(&["dump", manifest, archive, "--format", "custom", "--compress", "zstd"]);
    assert!(output.status.success(), "dump failed: {:?}", output);

    let output = pgarch(&["list", archive]);
    assert!(output.status.success(), "list failed: {:?}", output);
    let listing = String::from_utf8_lossy(&output.stdout);
    assert!(listing.contains(";     dbname: inventory"));
    assert!(listing.contains("TABLE DATA - items"));

    let output = pgarch(&["restore", archive, "--clean", "true"]);
    assert!(output.status.success(), "restore failed: {:?}", output);
    let script = String::from_utf8_lossy(&output.stdout);
    let drop = script.find("DROP TABLE items;").unwrap();
    let create = script.find("CREATE TABLE items").unwrap();
    assert!(drop < create);
    assert!(script.contains("COPY items (id, label) FROM stdin;\n1\tbolt\n2\tnut\n\\.\n"));

    let output = pgarch(&["restore", archive, "--data-only", "true", "--schema-only", "true"]);
    assert!(!output.status.success());

    let _ = std::fs::remove_file(manifest);
    let _ = std::fs::remove_file(archive);
}

#[test]
fn directory_dump_needs_a_path() {
    let manifest = test_path("dir-manifest.json");
    std::fs::write(&manifest, MANIFEST).unwrap();

    let output = pgarch(&["dump", manifest.to_str().unwrap(), "--format", "directory"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("requires an archive path"));

    let _ = std::fs::remove_file(&manifest);
}
