use serde::{Deserialize, Serialize};

use crate::{CompressionSpec, DumpId, Section};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
/// Restore options.
///
/// Can be loaded from a JSON file and overridden from the command line.
pub struct RestoreOptions {
    /// Skip all entries whose payload is definition only.
    pub data_only: bool,
    /// Skip all entries whose payload is data only.
    pub schema_only: bool,
    /// Emit each entry's drop statement, in reverse order, before restoring.
    pub drop_schema: bool,
    /// Do not restore privileges.
    pub acls_skip: bool,
    /// Do not emit ownership changes.
    pub no_owner: bool,
    /// Use `SET SESSION AUTHORIZATION` instead of `\connect` for owner changes.
    pub use_setsessauth: bool,
    /// Disable triggers while reloading data (data-only restores).
    pub disable_triggers: bool,
    /// Role used to issue trigger disabling commands.
    pub superuser: Option<String>,
    /// Include diagnostic comments in the emitted SQL.
    pub verbose: bool,
    /// Abort on the first failing statement when restoring into a database.
    pub exit_on_error: bool,
    /// Wrap the whole restore in a single transaction.
    pub single_transaction: bool,

    /// Only restore entries of the selected kinds (see the `sel_*` flags).
    pub sel_types: bool,
    pub sel_table: bool,
    pub sel_index: bool,
    pub sel_function: bool,
    pub sel_trigger: bool,
    /// Table names to restore (with `sel_table`).
    pub table_names: Vec<String>,
    /// Index names to restore (with `sel_index`).
    pub index_names: Vec<String>,
    /// Function signatures to restore (with `sel_function`).
    pub function_names: Vec<String>,
    /// Trigger names to restore (with `sel_trigger`).
    pub trigger_names: Vec<String>,

    /// Restrict the restore to these sections (empty means all).
    pub sections: Vec<Section>,

    /// List file used to reorder and filter the TOC.
    pub toc_file: Option<String>,
    /// Redirect the script output to this file.
    pub filename: Option<String>,
    /// Compression of the script output.
    pub compression: Option<CompressionSpec>,

    /// Restrict the restore to these dump ids (filled from `toc_file`).
    #[serde(skip)]
    pub id_wanted: Option<Vec<DumpId>>,
}

impl RestoreOptions {
    pub fn section_wanted(&self, section: Section) -> bool {
        if self.sections.is_empty() {
            return true;
        }
        // entries without a section travel with the pre-data section
        let section = if section == Section::None {
            Section::PreData
        } else {
            section
        };
        self.sections.contains(&section)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
/// Options used when writing an archive.
pub struct DumpOptions {
    /// Compression of data blocks and files.
    pub compression: CompressionSpec,
    /// Number of parallel workers for the data phase.
    pub jobs: usize,
    /// Database name recorded in the header.
    pub dbname: String,
    /// Source server version recorded in the header.
    pub server_version: String,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            compression: CompressionSpec::NONE,
            jobs: 1,
            dbname: String::new(),
            server_version: String::new(),
        }
    }
}
