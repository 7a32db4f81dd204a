//! Restore logic shared by all formats.
//!
//! The entries of a TOC are printed in list order, either as a script to
//! the current output or executed in the connected database. The data of
//! an entry is produced by a [`TocDataPrinter`], usually the format driver.

use anyhow::{bail, Error};

use pgarch_api_types::{CompressionSpec, DumpId, ObjectClass, RestoreOptions, Section};
use pgarch_tools::compression::CompressFileHandle;
use pgarch_tools::str::{fmt_id, fmt_qualified, quote_literal};

use crate::archive::ArchiveCore;
use crate::file_formats::TAR_PATH_PLACEHOLDER;
use crate::output::OutputKind;
use crate::toc::TocEntry;

bitflags::bitflags! {
    /// Parts of an entry selected for restore.
    pub struct Requirement: u8 {
        const SCHEMA = 0x01;
        const DATA = 0x02;
    }
}

/// Prints the data part of entries.
pub trait TocDataPrinter {
    fn print_toc_data(&mut self, core: &mut ArchiveCore, id: DumpId) -> Result<(), Error>;

    /// Format specific details shown in verbose entry headers.
    fn print_extra_toc(&self, _core: &ArchiveCore, _te: &TocEntry) -> Option<String> {
        None
    }

    /// Name of an external file holding the data of `te`. When set, the
    /// script references the file instead of containing the data.
    fn data_file_reference(&self, _te: &TocEntry) -> Option<String> {
        None
    }
}

fn always_printed(class: &ObjectClass) -> bool {
    matches!(
        class,
        ObjectClass::Encoding | ObjectClass::StdStrings | ObjectClass::SearchPath
    )
}

fn name_selected(names: &[String], tag: &str) -> bool {
    names.is_empty() || names.iter().any(|name| name == tag)
}

/// Decide which parts of `te` the options select.
pub fn toc_entry_required(te: &TocEntry, ropts: &RestoreOptions) -> Requirement {
    if te.class.is_boundary() {
        return Requirement::empty();
    }

    // session settings, needed by every script
    if always_printed(&te.class) {
        return Requirement::SCHEMA;
    }

    if ropts.acls_skip && te.class.is_acl() {
        return Requirement::empty();
    }

    if !ropts.section_wanted(te.section) {
        return Requirement::empty();
    }

    if ropts.sel_types {
        let selected = match te.class {
            ObjectClass::Table
            | ObjectClass::TableData
            | ObjectClass::View
            | ObjectClass::MaterializedView
            | ObjectClass::Sequence
            | ObjectClass::SequenceSet => {
                ropts.sel_table && name_selected(&ropts.table_names, &te.tag)
            }
            ObjectClass::Index => ropts.sel_index && name_selected(&ropts.index_names, &te.tag),
            ObjectClass::Function | ObjectClass::Aggregate => {
                ropts.sel_function && name_selected(&ropts.function_names, &te.tag)
            }
            ObjectClass::Trigger => {
                ropts.sel_trigger && name_selected(&ropts.trigger_names, &te.tag)
            }
            _ => false,
        };
        if !selected {
            return Requirement::empty();
        }
    }

    if let Some(wanted) = &ropts.id_wanted {
        if !wanted.contains(&te.dump_id) {
            return Requirement::empty();
        }
    }

    let mut res = Requirement::SCHEMA | Requirement::DATA;

    if !te.has_data() {
        // sequence values are data even though they are plain statements
        if te.class == ObjectClass::SequenceSet {
            res = Requirement::DATA;
        } else {
            res.remove(Requirement::DATA);
        }
    }

    if te.defn.is_empty() && te.class != ObjectClass::SequenceSet {
        res.remove(Requirement::SCHEMA);
    }

    if ropts.data_only {
        res &= Requirement::DATA;
    }
    if ropts.schema_only {
        res &= Requirement::SCHEMA;
    }

    res
}

fn verbose_log(core: &ArchiveCore, text: String) {
    if core.ropts.verbose {
        log::info!("{}", text);
    } else {
        log::debug!("{}", text);
    }
}

/// Switch the session user.
fn become_user(core: &mut ArchiveCore, user: &str) -> Result<(), Error> {
    if core.current_user.as_deref() == Some(user) {
        return Ok(());
    }

    if core.connection.is_some() || core.ropts.use_setsessauth {
        core.execute_or_print(&format!("SET SESSION AUTHORIZATION {};", fmt_id(user)))?;
    } else {
        core.ahprintf(format_args!("\\connect - {}\n\n", fmt_id(user)))?;
        // a new session starts with the default search path
        core.current_schema = None;
    }

    core.current_user = Some(user.to_string());
    Ok(())
}

fn become_owner(core: &mut ArchiveCore, te: &TocEntry) -> Result<(), Error> {
    if core.ropts.no_owner || te.owner.is_empty() {
        return Ok(());
    }
    become_user(core, &te.owner)
}

fn select_schema(core: &mut ArchiveCore, namespace: &str) -> Result<(), Error> {
    if namespace.is_empty() || core.current_schema.as_deref() == Some(namespace) {
        return Ok(());
    }
    core.execute_or_print(&format!("SET search_path = {}, pg_catalog;", fmt_id(namespace)))?;
    core.current_schema = Some(namespace.to_string());
    Ok(())
}

/// Print the comment header of `te` and, unless `is_data`, its
/// definition.
fn print_toc_entry<P: TocDataPrinter + ?Sized>(
    core: &mut ArchiveCore,
    printer: &P,
    te: &TocEntry,
    is_data: bool,
) -> Result<(), Error> {
    become_owner(core, te)?;
    select_schema(core, &te.namespace)?;

    let mut header = String::from("--\n");
    if core.ropts.verbose {
        header.push_str(&format!(
            "-- TOC entry {} (class {} OID {})\n",
            te.dump_id, te.catalog_id.tableoid, te.catalog_id.oid
        ));
        if !te.deps.is_empty() {
            let deps: Vec<String> = te.deps.iter().map(|dep| dep.to_string()).collect();
            header.push_str(&format!("-- Dependencies: {}\n", deps.join(" ")));
        }
    }

    header.push_str(&format!(
        "-- {}Name: {}; Type: {}; Schema: {}; Owner: {}",
        if is_data { "Data for " } else { "" },
        te.tag,
        te.class,
        if te.namespace.is_empty() { "-" } else { te.namespace.as_str() },
        if core.ropts.no_owner || te.owner.is_empty() {
            "-"
        } else {
            te.owner.as_str()
        },
    ));
    if !te.tablespace.is_empty() {
        header.push_str(&format!("; Tablespace: {}", te.tablespace));
    }
    header.push('\n');

    if core.ropts.verbose {
        if let Some(extra) = printer.print_extra_toc(core, te) {
            header.push_str(&format!("-- {}\n", extra));
        }
    }
    header.push_str("--\n\n");

    core.ahprintf(format_args!("{}", header))?;

    if !is_data && !te.defn.is_empty() {
        core.ahprintf(format_args!("{}", te.defn))?;
        if !te.defn.ends_with('\n') {
            core.ahprintf(format_args!("\n"))?;
        }
        core.ahprintf(format_args!("\n"))?;
    }

    Ok(())
}

fn disable_triggers(core: &mut ArchiveCore, te: &TocEntry) -> Result<(), Error> {
    verbose_log(core, format!("disabling triggers for {}", te.tag));

    if let Some(superuser) = core.ropts.superuser.clone() {
        become_user(core, &superuser)?;
    }
    if core.connection.is_none() {
        core.ahprintf(format_args!("-- Disable triggers\n"))?;
    }
    core.execute_or_print(&format!(
        "UPDATE \"pg_class\" SET \"reltriggers\" = 0 WHERE \"relname\" = {};",
        quote_literal(&te.tag)
    ))?;
    if core.ropts.superuser.is_some() {
        become_owner(core, te)?;
    }
    Ok(())
}

fn enable_triggers(core: &mut ArchiveCore, te: &TocEntry) -> Result<(), Error> {
    verbose_log(core, format!("enabling triggers for {}", te.tag));

    if let Some(superuser) = core.ropts.superuser.clone() {
        become_user(core, &superuser)?;
    }
    if core.connection.is_none() {
        core.ahprintf(format_args!("-- Enable triggers\n"))?;
    }
    core.execute_or_print(&format!(
        "UPDATE pg_class SET reltriggers = (SELECT count(*) FROM pg_trigger where pg_class.oid = tgrelid) WHERE relname = {};",
        quote_literal(&te.tag)
    ))?;
    if core.ropts.superuser.is_some() {
        become_owner(core, te)?;
    }
    Ok(())
}

/// Script line loading the external data file of `te`.
fn print_data_reference(core: &mut ArchiveCore, te: &TocEntry, file: &str) -> Result<(), Error> {
    let path = format!("{}/{}", TAR_PATH_PLACEHOLDER, file);

    if te.copy_stmt.is_empty() {
        return core.ahprintf(format_args!("\\i {}\n\n", path));
    }

    // COPY ... FROM stdin; becomes COPY ... FROM '$$PATH$$/<file>';
    let stmt = te.copy_stmt.trim_end();
    let lower = stmt.to_ascii_lowercase();
    let stmt = match lower.rfind("stdin") {
        Some(pos) => format!(
            "{}{}{}",
            &stmt[..pos],
            quote_literal(&path),
            &stmt[(pos + "stdin".len())..]
        ),
        None => bail!("unexpected COPY statement syntax: \"{}\"", stmt),
    };
    core.ahprintf(format_args!("{}\n\n", stmt))
}

/// Restore one entry. Returns the number of errors ignored on the way.
pub(crate) fn restore_toc_entry<P: TocDataPrinter + ?Sized>(
    core: &mut ArchiveCore,
    printer: &mut P,
    id: DumpId,
) -> Result<usize, Error> {
    let errors_before = core.n_errors;
    let te = core.entry(id)?.clone();

    let reqs = toc_entry_required(&te, &core.ropts);
    if reqs.is_empty() {
        return Ok(0);
    }

    let mut defn_dumped = false;

    if reqs.contains(Requirement::SCHEMA) {
        if te.section != Section::None {
            verbose_log(core, format!("creating {} \"{}\"", te.class, fmt_qualified(&te.namespace, &te.tag)));
        }
        print_toc_entry(core, printer, &te, false)?;
        core.flush_sql()?;
        defn_dumped = true;
    }

    if reqs.contains(Requirement::DATA) {
        if te.has_data() {
            verbose_log(core, format!("processing data for {}", te.describe()));
            print_toc_entry(core, printer, &te, true)?;
            core.flush_sql()?;

            if te.class == ObjectClass::Blobs {
                printer.print_toc_data(core, id)?;
            } else {
                let triggers = core.ropts.disable_triggers
                    && core.ropts.data_only
                    && te.class == ObjectClass::TableData;
                if triggers {
                    disable_triggers(core, &te)?;
                }

                match printer.data_file_reference(&te) {
                    Some(file) => print_data_reference(core, &te, &file)?,
                    None => {
                        let is_copy = !te.copy_stmt.is_empty();
                        if is_copy {
                            core.start_copy(&te.copy_stmt)?;
                        } else {
                            core.output_kind = OutputKind::OtherData;
                        }

                        let result = printer.print_toc_data(core, id);
                        core.writing_lo = None;
                        core.lo_failed = false;

                        if is_copy {
                            core.end_copy(&te.tag)?;
                        } else {
                            core.output_kind = OutputKind::SqlCmds;
                            core.flush_sql()?;
                        }
                        result?;
                    }
                }

                if triggers {
                    enable_triggers(core, &te)?;
                }
            }
        } else if !defn_dumped {
            print_toc_entry(core, printer, &te, false)?;
            core.flush_sql()?;
        }
    }

    core.entry_mut(id)?.printed = true;

    Ok(core.n_errors - errors_before)
}

/// Output replaced for the duration of a restore.
pub(crate) struct RestoreState {
    saved_output: Option<Option<CompressFileHandle>>,
}

/// Validate the options, open the output and print the script preamble
/// and the DROP commands.
pub(crate) fn begin_restore(core: &mut ArchiveCore, ropts: &RestoreOptions) -> Result<RestoreState, Error> {
    if ropts.data_only && ropts.schema_only {
        bail!("options -s/--schema-only and -a/--data-only cannot be used together");
    }
    if ropts.data_only && ropts.drop_schema {
        bail!("options -c/--clean and -a/--data-only cannot be used together");
    }
    if ropts.single_transaction && core.jobs > 1 {
        bail!("cannot specify both --single-transaction and multiple jobs");
    }

    core.ropts = ropts.clone();
    core.n_errors = 0;
    core.current_user = None;
    core.current_schema = None;
    core.output_kind = OutputKind::SqlCmds;
    core.restoring = true;

    for id in core.toc.ids() {
        core.entry_mut(id)?.printed = false;
    }

    if !core.ropts.data_only {
        let mut schema_wanted = false;
        let mut data_wanted = false;
        for te in core.toc.iter() {
            if always_printed(&te.class) {
                continue;
            }
            let reqs = toc_entry_required(te, &core.ropts);
            schema_wanted |= reqs.contains(Requirement::SCHEMA);
            data_wanted |= reqs.contains(Requirement::DATA);
        }
        if !schema_wanted && data_wanted {
            log::info!("implied data-only restore");
            core.ropts.data_only = true;
        }
    }

    let mut state = RestoreState { saved_output: None };
    if let Some(filename) = &ropts.filename {
        let previous =
            core.set_output_file(filename, ropts.compression.unwrap_or(CompressionSpec::NONE))?;
        state.saved_output = Some(previous);
    }

    if core.connection.is_none() {
        core.ahprintf(format_args!("--\n-- PostgreSQL database dump\n--\n\n"))?;
        if core.ropts.verbose {
            if !core.header.server_version.is_empty() {
                let version = core.header.server_version.clone();
                core.ahprintf(format_args!("-- Dumped from database version {}\n", version))?;
            }
            if !core.header.dumper_version.is_empty() {
                let version = core.header.dumper_version.clone();
                core.ahprintf(format_args!("-- Dumped by {}\n", version))?;
            }
            core.ahprintf(format_args!("\n"))?;
        }
    }

    if core.ropts.single_transaction {
        core.execute_or_print("BEGIN;")?;
    }

    if core.ropts.drop_schema {
        let mut ids = core.toc.ids();
        ids.reverse();
        for id in ids {
            let te = core.entry(id)?.clone();
            let reqs = toc_entry_required(&te, &core.ropts);
            if !reqs.contains(Requirement::SCHEMA) || te.drop_stmt.is_empty() {
                continue;
            }
            verbose_log(core, format!("dropping {} {}", te.class, te.tag));
            become_owner(core, &te)?;
            select_schema(core, &te.namespace)?;
            core.ahprintf(format_args!("{}", te.drop_stmt))?;
            core.flush_sql()?;
        }
    }

    Ok(state)
}

/// Print the trailer, restore the previous output and report errors.
pub(crate) fn end_restore(core: &mut ArchiveCore, state: RestoreState) -> Result<(), Error> {
    if core.ropts.single_transaction {
        core.execute_or_print("COMMIT;")?;
    }

    if core.connection.is_none() {
        core.ahprintf(format_args!("--\n-- PostgreSQL database dump complete\n--\n\n"))?;
    }
    core.flush_sql()?;

    match state.saved_output {
        Some(previous) => {
            core.close_output()?;
            core.output = previous;
        }
        None => core.flush_output()?,
    }

    core.restoring = false;
    core.script_printed = true;

    if core.n_errors > 0 {
        log::warn!("errors ignored on restore: {}", core.n_errors);
    }
    Ok(())
}

/// Restore every selected entry in TOC order.
pub(crate) fn restore_archive<P: TocDataPrinter + ?Sized>(
    core: &mut ArchiveCore,
    printer: &mut P,
    ropts: &RestoreOptions,
) -> Result<(), Error> {
    let state = begin_restore(core, ropts)?;

    for id in core.toc.ids() {
        if core.exit.is_aborting() {
            bail!("terminated by user");
        }
        restore_toc_entry(core, printer, id)?;
    }

    end_restore(core, state)
}
