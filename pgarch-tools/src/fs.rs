//! File system helper utilities.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, format_err, Error};

/// Anonymous temporary file, readable and writable by the owner only.
///
/// The file has no name, so it disappears with its last descriptor.
pub fn create_tmpfile() -> Result<File, Error> {
    let dir = std::env::temp_dir();
    OpenOptions::new()
        .write(true)
        .read(true)
        .mode(0o600)
        .custom_flags(libc::O_TMPFILE)
        .open(&dir)
        .map_err(|err| format_err!("could not generate temporary file name in {:?}: {}", dir, err))
}

/// Create `path` as a directory, or accept an existing empty one.
pub fn create_empty_dir<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    match std::fs::read_dir(path) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                bail!(
                    "could not create directory \"{}\": directory exists and is not empty",
                    path.display()
                );
            }
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => std::fs::create_dir(path)
            .map_err(|err| format_err!("could not create directory \"{}\": {}", path.display(), err)),
        Err(err) => bail!("could not open directory \"{}\": {}", path.display(), err),
    }
}

fn fsync_path(path: &Path) -> Result<(), Error> {
    let file = File::open(path)
        .map_err(|err| format_err!("could not open file \"{}\": {}", path.display(), err))?;
    nix::unistd::fsync(file.as_raw_fd())
        .map_err(|err| format_err!("could not fsync file \"{}\": {}", path.display(), err))
}

/// Flush every file below `path` and then the directories themselves,
/// deepest first, so the new names are persistent too.
pub fn fsync_dir_recursive<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    for entry in walkdir::WalkDir::new(path).contents_first(true) {
        let entry = entry.map_err(|err| format_err!("could not read directory \"{}\": {}", path.display(), err))?;
        let file_type = entry.file_type();
        if file_type.is_file() || file_type.is_dir() {
            fsync_path(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn tmpfile_and_empty_dir() -> Result<(), Error> {
        let mut file = create_tmpfile()?;
        file.write_all(b"COPY data")?;
        file.seek(SeekFrom::Start(0))?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        assert_eq!(text, "COPY data");

        let dir = std::env::temp_dir().join(format!("pgarch-fs-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        create_empty_dir(&dir)?;
        create_empty_dir(&dir)?;
        std::fs::write(dir.join("toc.dat"), b"x")?;
        assert!(create_empty_dir(&dir).is_err());
        fsync_dir_recursive(&dir)?;
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
