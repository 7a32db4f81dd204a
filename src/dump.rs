//! Writing archives from an [`ObjectSource`].

use anyhow::{bail, format_err, Error};

use pgarch_api_types::{ArchiveFormat, DumpId, DumpOptions, RestoreOptions};
use pgarch_archive::{ArchiveHandle, SortReport};
use pgarch_tools::exit::ExitContext;

use crate::source::{assign_dump_ids, ObjectSource, SourceObject};

/// Outcome of a dump.
#[derive(Debug, Default)]
pub struct DumpStatus {
    pub entries: usize,
    pub sort_report: SortReport,
}

fn lookup(
    ids: &std::collections::HashMap<String, DumpId>,
    object: &SourceObject,
    key: &str,
) -> Result<DumpId, Error> {
    ids.get(key)
        .copied()
        .ok_or_else(|| format_err!("object {} references unknown object {}", object.key(), key))
}

/// Add all objects of `source` to a new archive at `path` and close it.
///
/// `script_options` only matter for the plain format, which prints its
/// script while closing.
pub fn dump_archive(
    source: &dyn ObjectSource,
    path: &str,
    format: ArchiveFormat,
    options: &DumpOptions,
    script_options: &RestoreOptions,
    exit: ExitContext,
) -> Result<DumpStatus, Error> {
    let mut options = options.clone();
    if options.dbname.is_empty() {
        options.dbname = source.dbname();
    }
    if options.server_version.is_empty() {
        options.server_version = source.server_version();
    }

    let objects = source.objects()?;
    let ids = assign_dump_ids(&objects)?;

    let mut handle = ArchiveHandle::create(path, format, &options, exit)?;
    handle.set_restore_options(script_options);

    for (i, object) in objects.into_iter().enumerate() {
        let mut deps = Vec::with_capacity(object.depends.len());
        for key in &object.depends {
            deps.push(lookup(&ids, &object, key)?);
        }

        let mut sort = object.entry.sort.clone();
        if let Some(key) = &object.owning_object {
            sort.owning_object = Some(lookup(&ids, &object, key)?);
        }
        if let Some(key) = &object.shell_type {
            sort.shell_type = Some(lookup(&ids, &object, key)?);
        }

        let entry = object.entry.deps(&deps).sort_info(sort);
        let id = handle.archive_entry(entry)?;
        if id != (i + 1) as DumpId {
            bail!("unexpected dump id {} for object {}", id, i + 1);
        }
    }

    let entries = handle.toc().len();
    handle.close()?;

    let sort_report = handle.sort_report().clone();
    log::info!("archived {} entries to {}", entries, display_path(path));

    Ok(DumpStatus {
        entries,
        sort_report,
    })
}

fn display_path(path: &str) -> &str {
    if path.is_empty() || path == "-" {
        "standard output"
    } else {
        path
    }
}
