//! TOC listings and list-file driven reordering.

use anyhow::{bail, format_err, Error};

use pgarch_api_types::{CompressionSpec, DumpId, RestoreOptions};
use pgarch_tools::compression::CompressFileHandle;

use crate::archive::ArchiveHandle;
use crate::restore::toc_entry_required;

lazy_static::lazy_static! {
    static ref LIST_LINE: regex::Regex = regex::Regex::new(r"^\s*(\d+)").unwrap();
}

/// Keep a TOC field on one line.
fn sanitize_line(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

/// Dump id of one list file line. `None` for blank and comment lines.
fn parse_list_line(line: &str) -> Result<Option<DumpId>, String> {
    let line = match line.find(';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    if line.trim().is_empty() {
        return Ok(None);
    }
    match LIST_LINE.captures(line).and_then(|caps| caps[1].parse::<DumpId>().ok()) {
        Some(id) => Ok(Some(id)),
        None => Err(line.trim_end().to_string()),
    }
}

impl ArchiveHandle {
    /// Print the archive header and one line per selected entry.
    ///
    /// The output can be edited and fed back through
    /// [`sort_toc_from_file`](Self::sort_toc_from_file).
    pub fn print_toc_summary(&mut self, ropts: &RestoreOptions) -> Result<(), Error> {
        let saved_output = match &ropts.filename {
            Some(filename) => Some(
                self.core
                    .set_output_file(filename, ropts.compression.unwrap_or(CompressionSpec::NONE))?,
            ),
            None => None,
        };

        let header = self.core.header.clone();
        let created = proxmox_time::strftime_local("%Y-%m-%d %H:%M:%S %Z", header.create_date)
            .unwrap_or_else(|_| header.create_date.to_string());

        let entries = self.core.toc.len();
        let core = &mut self.core;
        core.ahprintf(format_args!(";\n; Archive created at {}\n", created))?;
        core.ahprintf(format_args!(";     dbname: {}\n", sanitize_line(&header.dbname)))?;
        core.ahprintf(format_args!(";     TOC Entries: {}\n", entries))?;
        core.ahprintf(format_args!(";     Compression: {}\n", header.compression))?;
        core.ahprintf(format_args!(";     Dump Version: {}\n", header.version_string()))?;
        core.ahprintf(format_args!(";     Format: {}\n", header.format.summary_name()))?;
        core.ahprintf(format_args!(";     Integer: {} bytes\n", header.int_size))?;
        core.ahprintf(format_args!(";     Offset: {} bytes\n", header.off_size))?;
        if !header.server_version.is_empty() {
            core.ahprintf(format_args!(
                ";     Dumped from database version: {}\n",
                header.server_version
            ))?;
        }
        if !header.dumper_version.is_empty() {
            core.ahprintf(format_args!(";     Dumped by: {}\n", header.dumper_version))?;
        }
        core.ahprintf(format_args!(";\n;\n; Selected TOC Entries:\n;\n"))?;

        let mut lines = Vec::new();
        for te in core.toc.iter() {
            if !ropts.verbose && toc_entry_required(te, ropts).is_empty() {
                continue;
            }
            let schema = if te.namespace.is_empty() {
                "-".to_string()
            } else {
                sanitize_line(&te.namespace)
            };
            lines.push(format!(
                "{}; {} {} {} {} {}\n",
                te.dump_id,
                te.catalog_id,
                te.class,
                schema,
                sanitize_line(&te.tag),
                sanitize_line(&te.owner)
            ));
            if ropts.verbose && !te.deps.is_empty() {
                let deps: Vec<String> = te.deps.iter().map(|dep| dep.to_string()).collect();
                lines.push(format!(";\tdepends on: {}\n", deps.join(" ")));
            }
        }
        for line in lines {
            core.ahprintf(format_args!("{}", line))?;
        }

        match saved_output {
            Some(previous) => {
                core.close_output()?;
                core.output = previous;
            }
            None => core.flush_output()?,
        }
        Ok(())
    }

    /// Reorder the TOC as given by a list file.
    ///
    /// Listed entries move to the front in file order. Returns the listed
    /// ids, everything else is meant to be skipped.
    pub fn sort_toc_from_file(&mut self, path: &str) -> Result<Vec<DumpId>, Error> {
        let mut handle = CompressFileHandle::open_read(path)
            .map_err(|err| format_err!("could not open TOC file \"{}\": {}", path, err))?;

        let mut listed = Vec::new();
        let mut previous: Option<DumpId> = None;
        let mut line = String::new();

        while handle
            .gets(&mut line)
            .map_err(|err| format_err!("could not read TOC file \"{}\": {}", path, err))?
        {
            let id = match parse_list_line(&line) {
                Ok(Some(id)) => id,
                Ok(None) => continue,
                Err(text) => {
                    log::warn!("line ignored: {}", text);
                    continue;
                }
            };

            if !self.core.toc.contains(id) {
                bail!("could not find entry for ID {}", id);
            }
            if listed.contains(&id) {
                continue;
            }

            match previous {
                None => self.core.toc.move_to_front(id)?,
                Some(anchor) => self.core.toc.move_after(anchor, id)?,
            }
            previous = Some(id);
            listed.push(id);
        }

        Ok(listed)
    }

    /// Move all entries of kind `desc` to the front, keeping their order.
    pub fn move_to_start(&mut self, desc: &str) -> Result<(), Error> {
        let mut ids = self.matching_ids(desc);
        ids.reverse();
        for id in ids {
            self.core.toc.move_to_front(id)?;
        }
        Ok(())
    }

    /// Move all entries of kind `desc` to the end, keeping their order.
    pub fn move_to_end(&mut self, desc: &str) -> Result<(), Error> {
        for id in self.matching_ids(desc) {
            self.core.toc.move_to_back(id)?;
        }
        Ok(())
    }

    fn matching_ids(&self, desc: &str) -> Vec<DumpId> {
        self.core
            .toc
            .iter()
            .filter(|te| te.class.desc() == desc)
            .map(|te| te.dump_id)
            .collect()
    }

    pub fn sort_toc_by_catalog_id(&mut self) -> Result<(), Error> {
        let mut order: Vec<(_, DumpId)> = self
            .core
            .toc
            .iter()
            .map(|te| (te.catalog_id, te.dump_id))
            .collect();
        order.sort();
        let ids: Vec<DumpId> = order.into_iter().map(|(_, id)| id).collect();
        self.core.toc.reorder(&ids)
    }

    pub fn sort_toc_by_dump_id(&mut self) -> Result<(), Error> {
        let mut ids = self.core.toc.ids();
        ids.sort_unstable();
        self.core.toc.reorder(&ids)
    }
}
