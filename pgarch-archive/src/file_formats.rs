//! Constants of the on-disk archive formats.

// WARNING: PLEASE DO NOT MODIFY THOSE MAGIC VALUES

/// First bytes of every binary header.
pub const ARCHIVE_MAGIC: &[u8; 5] = b"PGDMP";

/// Encode a version triple the way it is compared internally.
pub const fn make_archive_version(major: u8, minor: u8, rev: u8) -> u32 {
    ((major as u32 * 100) + minor as u32) * 100 + rev as u32
}

pub const K_VERS_1_0: u32 = make_archive_version(1, 0, 0);
/// compression byte in header
pub const K_VERS_1_2: u32 = make_archive_version(1, 2, 0);
/// copy statement in TOC entries
pub const K_VERS_1_3: u32 = make_archive_version(1, 3, 0);
/// compression int, creation date and database name in header
pub const K_VERS_1_4: u32 = make_archive_version(1, 4, 0);
/// dependencies in TOC entries
pub const K_VERS_1_5: u32 = make_archive_version(1, 5, 0);
/// schema field in TOC entries
pub const K_VERS_1_6: u32 = make_archive_version(1, 6, 0);
/// file offsets with their own size and a state flag
pub const K_VERS_1_7: u32 = make_archive_version(1, 7, 0);
/// catalog table OID in TOC entries
pub const K_VERS_1_8: u32 = make_archive_version(1, 8, 0);
/// tablespace in TOC entries, versions of server and dumper in header
pub const K_VERS_1_10: u32 = make_archive_version(1, 10, 0);
/// section in TOC entries
pub const K_VERS_1_11: u32 = make_archive_version(1, 11, 0);
/// compression algorithm byte and level in header
pub const K_VERS_1_15: u32 = make_archive_version(1, 15, 0);

/// Version written by this implementation. Newer archives are refused.
pub const K_VERS_MAX: u32 = K_VERS_1_15;

pub const K_VERS_MAJOR: u8 = 1;
pub const K_VERS_MINOR: u8 = 15;
pub const K_VERS_REV: u8 = 0;

/// Block types of the custom format.
pub const BLK_DATA: u8 = 1;
pub const BLK_BLOBS: u8 = 3;

/// Offset states of custom format TOC entries.
pub const K_OFFSET_POS_NOT_SET: u8 = 1;
pub const K_OFFSET_POS_SET: u8 = 2;
pub const K_OFFSET_NO_DATA: u8 = 3;

/// Integer and offset width written into new archives.
pub const DEFAULT_INT_SIZE: usize = 4;
pub const DEFAULT_OFF_SIZE: usize = 8;

/// TOC member of directory and tar archives.
pub const TOC_FILE_NAME: &str = "toc.dat";
/// Script member of tar archives.
pub const RESTORE_SCRIPT_NAME: &str = "restore.sql";
/// Large object TOC name written by old versions.
pub const LEGACY_BLOBS_TOC_NAME: &str = "blobs.toc";

/// Placeholder for the extraction directory inside `restore.sql`.
pub const TAR_PATH_PLACEHOLDER: &str = "$$PATH$$";

/// Size of tar headers and blocks.
pub const TAR_BLOCK_SIZE: usize = 512;

/// Mode passed to lo_open() for writing.
pub const INV_WRITE: u32 = 0x20000;

/// Weight applied to the size of a large object TOC when estimating the
/// amount of work behind a BLOBS entry.
pub const BLOBS_SIZE_FACTOR: u64 = 1024;

/// File name of the data of entry `id` in directory and tar archives.
pub fn data_file_name(id: i32) -> String {
    format!("{}.dat", id)
}

/// File name of a large object in directory and tar archives.
pub fn blob_file_name(oid: u32) -> String {
    format!("blob_{}.dat", oid)
}

/// File name of the large object TOC of the BLOBS entry `id`.
pub fn blobs_toc_name(id: i32) -> String {
    format!("blobs_{}.toc", id)
}
