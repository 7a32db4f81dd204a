use pgarch_api_types::DumpId;

/// Failures callers may want to tell apart.
///
/// Everything else is reported as plain [`anyhow::Error`] with a
/// descriptive message.
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("could not open output file \"{path}\": {reason}")]
    CannotOpenOutput { path: String, reason: String },
    #[error("unrecognized archive format ({0}); please specify \"c\", \"d\", \"p\", or \"t\"")]
    UnsupportedFormat(String),
    #[error("did not find magic string in file header")]
    BadMagic,
    #[error("unsupported version ({major}.{minor}) in file header")]
    UnsupportedVersion { major: u8, minor: u8 },
    #[error("could not read from input file: end of file")]
    TruncatedFile,
    #[error("{0}")]
    OutOfOrder(String),
    #[error("corrupt tar header found in \"{name}\" (expected {expected}, computed {computed}) file position {pos}")]
    CorruptTarHeader {
        name: String,
        expected: u64,
        computed: u64,
        pos: u64,
    },
    #[error("{0}")]
    WorkerProtocol(String),
    #[error("a worker process died unexpectedly")]
    WorkerDied,
    #[error("could not obtain lock on relation \"{relation}\"\nThis usually means that someone requested an ACCESS EXCLUSIVE lock on the table after the pg_dump parent process had gotten the initial ACCESS SHARE lock on the table.")]
    LockNotAvailable { relation: String, dump_id: DumpId },
}

impl ArchiveError {
    pub(crate) fn out_of_order_tar() -> Self {
        ArchiveError::OutOfOrder(
            "restoring data out of order is not supported in this archive format".to_string(),
        )
    }
}
