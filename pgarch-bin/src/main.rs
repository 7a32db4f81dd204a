use anyhow::{bail, format_err, Error};

use proxmox_router::cli::*;
use proxmox_schema::api;

use pgarch::restore::RestoreTarget;
use pgarch::source::ManifestSource;
use pgarch_api_types::{ArchiveFormat, CompressionSpec, DumpOptions, RestoreOptions, Section};
use pgarch_tools::exit::{install_termination_handlers, ExitContext};

const PROGNAME: &str = "pgarch";

fn exit_context() -> Result<ExitContext, Error> {
    install_termination_handlers()?;
    Ok(ExitContext::new(PROGNAME))
}

fn parse_compression(compress: Option<String>) -> Result<Option<CompressionSpec>, Error> {
    compress
        .map(|spec| {
            spec.parse::<CompressionSpec>()
                .map_err(|err| format_err!("invalid compression specification: {}", err))
        })
        .transpose()
}

/// Restore options from an optional JSON file, overridden by the command
/// line flags which are set.
fn load_restore_options(config: &Option<String>) -> Result<RestoreOptions, Error> {
    match config {
        Some(path) => {
            let raw = proxmox_sys::fs::file_read_string(path)?;
            serde_json::from_str(&raw)
                .map_err(|err| format_err!("unable to parse restore options {:?} - {}", path, err))
        }
        None => Ok(RestoreOptions::default()),
    }
}

#[api(
    input: {
        properties: {
            manifest: {
                description: "JSON file describing the objects to archive.",
            },
            archive: {
                description: "Archive to create, '-' for standard output.",
                optional: true,
            },
            format: {
                type: ArchiveFormat,
                optional: true,
            },
            compress: {
                description: "Compression, e.g. 'gzip:9', 'lz4', 'zstd:3' or 'none'.",
                optional: true,
            },
            jobs: {
                description: "Number of parallel data dumpers (directory format only).",
                type: Integer,
                minimum: 1,
                optional: true,
            },
            config: {
                description: "JSON file with the script options of the plain format.",
                optional: true,
            },
        },
    },
)]
/// Write an archive.
fn dump(
    manifest: String,
    archive: Option<String>,
    format: Option<ArchiveFormat>,
    compress: Option<String>,
    jobs: Option<usize>,
    config: Option<String>,
) -> Result<(), Error> {
    let format = format.unwrap_or(ArchiveFormat::Plain);
    let archive = archive.unwrap_or_else(|| "-".to_string());
    if format == ArchiveFormat::Directory && (archive.is_empty() || archive == "-") {
        bail!("the directory format requires an archive path");
    }

    let mut options = DumpOptions::default();
    if let Some(compression) = parse_compression(compress)? {
        options.compression = compression;
    } else if matches!(format, ArchiveFormat::Custom | ArchiveFormat::Directory) {
        options.compression = CompressionSpec::from_gzip_level(-1);
    }
    if let Some(jobs) = jobs {
        options.jobs = jobs;
    }

    let source = ManifestSource::load(&manifest)?;
    let ropts = load_restore_options(&config)?;

    let status = pgarch::dump::dump_archive(
        &source,
        &archive,
        format,
        &options,
        &ropts,
        exit_context()?,
    )?;

    if status.sort_report.has_foreign_key_ring() {
        log::warn!("archive contains circular foreign-key constraints");
    }
    Ok(())
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive to restore, '-' for standard input.",
            },
            format: {
                type: ArchiveFormat,
                optional: true,
            },
            config: {
                description: "JSON file with restore options.",
                optional: true,
            },
            file: {
                description: "Write the script to this file instead of standard output.",
                optional: true,
            },
            compress: {
                description: "Compression of the script output.",
                optional: true,
            },
            "data-only": {
                description: "Restore only the data, not the schema.",
                optional: true,
                default: false,
            },
            "schema-only": {
                description: "Restore only the schema, no data.",
                optional: true,
                default: false,
            },
            clean: {
                description: "Drop objects before recreating them.",
                optional: true,
                default: false,
            },
            "no-owner": {
                description: "Skip restoration of object ownership.",
                optional: true,
                default: false,
            },
            "no-acl": {
                description: "Skip restoration of access privileges.",
                optional: true,
                default: false,
            },
            "single-transaction": {
                description: "Restore as a single transaction.",
                optional: true,
                default: false,
            },
            section: {
                description: "Restore the named sections only.",
                type: Array,
                items: {
                    type: Section,
                },
                optional: true,
            },
            "use-list": {
                description: "Use the table of contents from this file for selecting and ordering.",
                optional: true,
            },
            verbose: {
                description: "Verbose mode.",
                optional: true,
                default: false,
            },
        },
    },
)]
/// Print the SQL script restoring an archive.
#[allow(clippy::too_many_arguments)]
fn restore(
    archive: String,
    format: Option<ArchiveFormat>,
    config: Option<String>,
    file: Option<String>,
    compress: Option<String>,
    data_only: bool,
    schema_only: bool,
    clean: bool,
    no_owner: bool,
    no_acl: bool,
    single_transaction: bool,
    section: Option<Vec<Section>>,
    use_list: Option<String>,
    verbose: bool,
) -> Result<(), Error> {
    let mut ropts = load_restore_options(&config)?;

    ropts.data_only |= data_only;
    ropts.schema_only |= schema_only;
    ropts.drop_schema |= clean;
    ropts.no_owner |= no_owner;
    ropts.acls_skip |= no_acl;
    ropts.single_transaction |= single_transaction;
    ropts.verbose |= verbose;
    if let Some(sections) = section {
        ropts.sections = sections;
    }
    if use_list.is_some() {
        ropts.toc_file = use_list;
    }
    if file.is_some() {
        ropts.filename = file;
    }
    if let Some(compression) = parse_compression(compress)? {
        ropts.compression = Some(compression);
    }

    if ropts.data_only && ropts.schema_only {
        bail!("options data-only and schema-only cannot be used together");
    }
    if ropts.data_only && ropts.drop_schema {
        bail!("options clean and data-only cannot be used together");
    }

    pgarch::restore::restore_archive(
        &archive,
        format.unwrap_or(ArchiveFormat::Unknown),
        &ropts,
        1,
        RestoreTarget::Script,
        exit_context()?,
    )?;
    Ok(())
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive to list, '-' for standard input.",
            },
            format: {
                type: ArchiveFormat,
                optional: true,
            },
            file: {
                description: "Write the listing to this file.",
                optional: true,
            },
            "use-list": {
                description: "Order and select the listed entries as given in this file.",
                optional: true,
            },
            verbose: {
                description: "Also list unselected entries and dependencies.",
                optional: true,
                default: false,
            },
        },
    },
)]
/// List the table of contents of an archive.
fn list(
    archive: String,
    format: Option<ArchiveFormat>,
    file: Option<String>,
    use_list: Option<String>,
    verbose: bool,
) -> Result<(), Error> {
    let ropts = RestoreOptions {
        filename: file,
        toc_file: use_list,
        verbose,
        ..Default::default()
    };

    pgarch::restore::list_archive(
        &archive,
        format.unwrap_or(ArchiveFormat::Unknown),
        &ropts,
        exit_context()?,
    )
}

fn main() {
    init_cli_logger("PGARCH_LOG", "info");

    let cmd_def = CliCommandMap::new()
        .insert(
            "dump",
            CliCommand::new(&API_METHOD_DUMP)
                .arg_param(&["manifest", "archive"])
                .completion_cb("manifest", complete_file_name)
                .completion_cb("archive", complete_file_name)
                .completion_cb("config", complete_file_name),
        )
        .insert(
            "restore",
            CliCommand::new(&API_METHOD_RESTORE)
                .arg_param(&["archive"])
                .completion_cb("archive", complete_file_name)
                .completion_cb("config", complete_file_name)
                .completion_cb("file", complete_file_name)
                .completion_cb("use-list", complete_file_name),
        )
        .insert(
            "list",
            CliCommand::new(&API_METHOD_LIST)
                .arg_param(&["archive"])
                .completion_cb("archive", complete_file_name)
                .completion_cb("use-list", complete_file_name),
        );

    let rpcenv = CliEnvironment::new();
    run_cli_command(cmd_def, rpcenv, None);
}
