//! Objects feeding a dump.
//!
//! An [`ObjectSource`] yields already classified objects with their SQL
//! text, dependencies and an optional data producer. The archive engine
//! never inspects a database itself. [`ManifestSource`] reads the objects
//! from a JSON manifest.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use pgarch_api_types::{CatalogId, ObjectClass, Oid, Section};
use pgarch_archive::{ArchiveEntryOpts, DataDumper, DumpContext};

/// One object to archive.
pub struct SourceObject {
    /// Entry options, without dependencies.
    pub entry: ArchiveEntryOpts,
    /// Keys of the objects this one depends on.
    pub depends: Vec<String>,
    /// Key of the table, view or domain a constraint or rule belongs to.
    pub owning_object: Option<String>,
    /// Key of the shell type standing in for a base type.
    pub shell_type: Option<String>,
}

impl SourceObject {
    pub fn new(entry: ArchiveEntryOpts) -> Self {
        Self {
            entry,
            depends: Vec::new(),
            owning_object: None,
            shell_type: None,
        }
    }

    /// Key other objects use to reference this one, e.g.
    /// `TABLE public.orders`.
    pub fn key(&self) -> String {
        object_key(&self.entry.class, &self.entry.namespace, &self.entry.tag)
    }
}

pub fn object_key(class: &ObjectClass, schema: &str, name: &str) -> String {
    if schema.is_empty() {
        format!("{} {}", class.desc(), name)
    } else {
        format!("{} {}.{}", class.desc(), schema, name)
    }
}

/// Inventory of the objects of a database.
pub trait ObjectSource {
    /// Database name recorded in the archive header.
    fn dbname(&self) -> String {
        String::new()
    }

    /// Server version recorded in the archive header.
    fn server_version(&self) -> String {
        String::new()
    }

    /// All objects, in catalog order.
    fn objects(&self) -> Result<Vec<SourceObject>, Error>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
/// Large object of a manifest.
pub struct ManifestBlob {
    pub oid: Oid,
    /// Contents as hex string.
    pub data: String,
    /// Read the contents from this file instead.
    pub file: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Object of a manifest.
pub struct ManifestObject {
    pub class: ObjectClass,
    pub name: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub tablespace: String,
    #[serde(default)]
    pub section: Option<Section>,
    #[serde(default)]
    pub catalog_id: CatalogId,
    /// Creation SQL.
    #[serde(default)]
    pub create: String,
    /// Drop SQL.
    #[serde(default)]
    pub drop: String,
    /// COPY statement loading the data.
    #[serde(default)]
    pub copy: String,
    /// Keys of other objects, see [`object_key`].
    #[serde(default)]
    pub depends: Vec<String>,
    /// Inline data, one COPY row (or statement) per element.
    #[serde(default)]
    pub rows: Vec<String>,
    /// Data file, relative to the manifest.
    #[serde(default)]
    pub data_file: Option<String>,
    #[serde(default)]
    pub blobs: Vec<ManifestBlob>,
    #[serde(default)]
    pub owning_object: Option<String>,
    #[serde(default)]
    pub shell_type: Option<String>,
    #[serde(default)]
    pub on_select_rule: bool,
    #[serde(default)]
    pub reloptions: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
/// Database described by a JSON file.
pub struct Manifest {
    pub dbname: String,
    pub server_version: String,
    pub objects: Vec<ManifestObject>,
}

/// Writes inline rows.
struct RowsDumper {
    rows: Vec<String>,
}

impl DataDumper for RowsDumper {
    fn dump(&self, ctx: &mut DumpContext<'_>) -> Result<(), Error> {
        for row in &self.rows {
            if ctx.is_aborting() {
                bail!("terminated by user");
            }
            ctx.write_data(row.as_bytes())?;
            ctx.write_data(b"\n")?;
        }
        Ok(())
    }
}

/// Streams the contents of a file.
struct FileDumper {
    path: PathBuf,
}

impl DataDumper for FileDumper {
    fn dump(&self, ctx: &mut DumpContext<'_>) -> Result<(), Error> {
        let mut file = std::fs::File::open(&self.path).map_err(|err| {
            format_err!("could not open data file \"{}\": {}", self.path.display(), err)
        })?;
        std::io::copy(&mut file, ctx).map_err(|err| {
            format_err!("could not read data file \"{}\": {}", self.path.display(), err)
        })?;
        Ok(())
    }
}

/// Writes the large objects of a BLOBS entry.
struct BlobsDumper {
    blobs: Vec<(Oid, BlobData)>,
}

enum BlobData {
    Inline(Vec<u8>),
    File(PathBuf),
}

impl DataDumper for BlobsDumper {
    fn dump(&self, ctx: &mut DumpContext<'_>) -> Result<(), Error> {
        for (oid, data) in &self.blobs {
            ctx.start_lo(*oid)?;
            match data {
                BlobData::Inline(data) => ctx.write_all(data)?,
                BlobData::File(path) => {
                    let data = proxmox_sys::fs::file_get_contents(path)?;
                    ctx.write_all(&data)?;
                }
            }
            ctx.end_lo(*oid)?;
        }
        Ok(())
    }
}

/// Object source reading a [`Manifest`].
pub struct ManifestSource {
    manifest: Manifest,
    base_dir: PathBuf,
}

impl ManifestSource {
    /// `base_dir` resolves relative data file names.
    pub fn new(manifest: Manifest, base_dir: &Path) -> Self {
        Self {
            manifest,
            base_dir: base_dir.to_path_buf(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = proxmox_sys::fs::file_read_string(path)?;
        let manifest: Manifest = serde_json::from_str(&raw)
            .map_err(|err| format_err!("unable to parse manifest {:?} - {}", path, err))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self::new(manifest, base_dir))
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    fn data_dumper(&self, object: &ManifestObject) -> Result<Option<Arc<dyn DataDumper>>, Error> {
        if !object.blobs.is_empty() {
            if object.class != ObjectClass::Blobs {
                bail!("only BLOBS objects can carry large objects ({})", object.name);
            }
            let mut blobs = Vec::with_capacity(object.blobs.len());
            for blob in &object.blobs {
                let data = match &blob.file {
                    Some(file) => BlobData::File(self.resolve(file)),
                    None => BlobData::Inline(hex::decode(blob.data.trim()).map_err(|err| {
                        format_err!("invalid data of large object {}: {}", blob.oid, err)
                    })?),
                };
                blobs.push((blob.oid, data));
            }
            return Ok(Some(Arc::new(BlobsDumper { blobs })));
        }

        match (&object.data_file, object.rows.is_empty()) {
            (Some(_), false) => bail!("object {} has both rows and a data file", object.name),
            (Some(file), true) => Ok(Some(Arc::new(FileDumper {
                path: self.resolve(file),
            }))),
            (None, false) => Ok(Some(Arc::new(RowsDumper {
                rows: object.rows.clone(),
            }))),
            (None, true) => Ok(None),
        }
    }
}

impl ObjectSource for ManifestSource {
    fn dbname(&self) -> String {
        self.manifest.dbname.clone()
    }

    fn server_version(&self) -> String {
        self.manifest.server_version.clone()
    }

    fn objects(&self) -> Result<Vec<SourceObject>, Error> {
        let mut list = Vec::with_capacity(self.manifest.objects.len());

        for object in &self.manifest.objects {
            let mut entry = ArchiveEntryOpts::new(object.class.clone(), &object.name)
                .catalog_id(object.catalog_id)
                .namespace(&object.schema)
                .owner(&object.owner)
                .tablespace(&object.tablespace)
                .defn(&object.create)
                .drop_stmt(&object.drop)
                .copy_stmt(&object.copy);
            if let Some(section) = object.section {
                entry = entry.section(section);
            }
            if let Some(dumper) = self.data_dumper(object)? {
                entry = entry.shared_dumper(dumper);
            }
            entry.sort.on_select_rule = object.on_select_rule;
            entry.sort.reloptions = object.reloptions.clone();

            list.push(SourceObject {
                entry,
                depends: object.depends.clone(),
                owning_object: object.owning_object.clone(),
                shell_type: object.shell_type.clone(),
            });
        }

        Ok(list)
    }
}

/// Map object keys to the dump ids they will get, assigned in list
/// order starting at 1.
pub(crate) fn assign_dump_ids(objects: &[SourceObject]) -> Result<HashMap<String, i32>, Error> {
    let mut ids = HashMap::with_capacity(objects.len());
    for (i, object) in objects.iter().enumerate() {
        let key = object.key();
        if ids.insert(key.clone(), (i + 1) as i32).is_some() {
            bail!("duplicate object {}", key);
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn manifest_objects() -> Result<(), Error> {
        let manifest: Manifest = serde_json::from_value(serde_json::json!({
            "dbname": "shop",
            "objects": [
                {
                    "class": "TABLE",
                    "schema": "public",
                    "name": "orders",
                    "create": "CREATE TABLE public.orders (id integer);\n",
                },
                {
                    "class": "TABLE DATA",
                    "schema": "public",
                    "name": "orders",
                    "copy": "COPY public.orders (id) FROM stdin;\n",
                    "depends": ["TABLE public.orders"],
                    "rows": ["1", "2"],
                },
                {
                    "class": "BLOBS",
                    "name": "BLOBS",
                    "blobs": [{ "oid": 16401, "data": "00ff" }],
                },
            ],
        }))?;

        let source = ManifestSource::new(manifest, Path::new("."));
        assert_eq!(source.dbname(), "shop");

        let objects = source.objects()?;
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[1].key(), "TABLE DATA public.orders");
        assert!(objects[1].entry.dumper.is_some());
        assert!(objects[0].entry.dumper.is_none());
        assert_eq!(objects[0].entry.section, None);

        let ids = assign_dump_ids(&objects)?;
        assert_eq!(ids["TABLE public.orders"], 1);
        assert_eq!(ids["BLOBS BLOBS"], 3);
        Ok(())
    }

    #[test]
    fn rejects_rows_and_file() {
        let manifest = Manifest {
            objects: vec![ManifestObject {
                class: ObjectClass::TableData,
                name: "t".to_string(),
                schema: String::new(),
                owner: String::new(),
                tablespace: String::new(),
                section: None,
                catalog_id: CatalogId::default(),
                create: String::new(),
                drop: String::new(),
                copy: "COPY t FROM stdin;\n".to_string(),
                depends: Vec::new(),
                rows: vec!["1".to_string()],
                data_file: Some("t.dat".to_string()),
                blobs: Vec::new(),
                owning_object: None,
                shell_type: None,
                on_select_rule: false,
                reloptions: None,
            }],
            ..Default::default()
        };
        assert!(ManifestSource::new(manifest, Path::new(".")).objects().is_err());
    }
}
