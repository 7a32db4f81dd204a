//! Table of contents.
//!
//! The TOC is an ordered list of [`TocEntry`] values, one per object that
//! was dumped. Entries are owned by a [`Toc`] arena indexed by dump id,
//! the list order is kept as prev/next links so entries can be moved
//! without copying them.

use std::sync::Arc;

use anyhow::{bail, Error};

use pgarch_api_types::{CatalogId, DumpId, ObjectClass, Section};

use crate::archive::DumpContext;

/// Produces the data of one entry while the archive is written.
///
/// Dumpers are invoked once per entry, possibly from a worker thread.
pub trait DataDumper: Send + Sync {
    fn dump(&self, ctx: &mut DumpContext<'_>) -> Result<(), Error>;
}

impl<F> DataDumper for F
where
    F: Fn(&mut DumpContext<'_>) -> Result<(), Error> + Send + Sync,
{
    fn dump(&self, ctx: &mut DumpContext<'_>) -> Result<(), Error> {
        self(ctx)
    }
}

/// Per format bookkeeping attached to each entry.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum FormatExtra {
    #[default]
    None,
    /// Custom format: offset state and absolute file position of the
    /// data block.
    Offset { state: u8, pos: u64 },
    /// Directory and tar formats: name of the data file.
    File { filename: Option<String> },
}

/// Catalog facts used to repair dependency loops.
///
/// They are not stored in the archive, the dump side fills them in before
/// the TOC is sorted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SortInfo {
    /// Table, view or domain a constraint, default or rule belongs to.
    pub owning_object: Option<DumpId>,
    /// Shell type entry of a base type.
    pub shell_type: Option<DumpId>,
    /// Rule is the ON SELECT rule of its view.
    pub on_select_rule: bool,
    /// View options moved to the rule when the rule is dumped separately.
    pub reloptions: Option<String>,
    /// Constraint, default or rule is dumped as its own post-data command.
    pub separate: bool,
    /// Materialized view definition moved to post-data.
    pub postponed: bool,
}

#[derive(Clone)]
pub struct TocEntry {
    pub dump_id: DumpId,
    pub catalog_id: CatalogId,
    pub section: Section,
    pub class: ObjectClass,
    pub tag: String,
    pub namespace: String,
    pub tablespace: String,
    pub owner: String,
    pub defn: String,
    pub drop_stmt: String,
    pub copy_stmt: String,
    /// Entries this one requires, in the order given.
    pub deps: Vec<DumpId>,
    pub dumper: Option<Arc<dyn DataDumper>>,
    /// An entry read from an archive had a data dumper when it was
    /// written, so the archive carries data for it.
    pub had_dumper: bool,
    pub extra: FormatExtra,
    /// Estimated data size, used to schedule big jobs first.
    pub data_length: u64,
    pub sort: SortInfo,
    pub(crate) printed: bool,
}

impl std::fmt::Debug for TocEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TocEntry")
            .field("dump_id", &self.dump_id)
            .field("class", &self.class)
            .field("tag", &self.tag)
            .field("section", &self.section)
            .field("deps", &self.deps)
            .field("had_dumper", &self.had_dumper)
            .finish()
    }
}

impl TocEntry {
    /// Short description for messages, e.g. `TABLE public.t`.
    pub fn describe(&self) -> String {
        if self.namespace.is_empty() {
            format!("{} {}", self.class, self.tag)
        } else {
            format!("{} {}.{}", self.class, self.namespace, self.tag)
        }
    }

    pub fn has_data(&self) -> bool {
        self.dumper.is_some() || self.had_dumper
    }

    pub fn add_dependency(&mut self, id: DumpId) {
        if !self.deps.contains(&id) {
            self.deps.push(id);
        }
    }

    /// Returns true if the dependency existed.
    pub fn remove_dependency(&mut self, id: DumpId) -> bool {
        let len = self.deps.len();
        self.deps.retain(|dep| *dep != id);
        self.deps.len() != len
    }

    pub fn data_file(&self) -> Option<&str> {
        match &self.extra {
            FormatExtra::File { filename } => filename.as_deref(),
            _ => None,
        }
    }
}

/// Everything needed to create a new entry with
/// [`ArchiveHandle::archive_entry`](crate::ArchiveHandle::archive_entry).
#[derive(Clone)]
pub struct ArchiveEntryOpts {
    pub catalog_id: CatalogId,
    pub class: ObjectClass,
    pub section: Option<Section>,
    pub tag: String,
    pub namespace: String,
    pub tablespace: String,
    pub owner: String,
    pub defn: String,
    pub drop_stmt: String,
    pub copy_stmt: String,
    pub deps: Vec<DumpId>,
    pub dumper: Option<Arc<dyn DataDumper>>,
    pub sort: SortInfo,
}

impl ArchiveEntryOpts {
    pub fn new(class: ObjectClass, tag: &str) -> Self {
        Self {
            catalog_id: CatalogId::default(),
            class,
            section: None,
            tag: tag.to_string(),
            namespace: String::new(),
            tablespace: String::new(),
            owner: String::new(),
            defn: String::new(),
            drop_stmt: String::new(),
            copy_stmt: String::new(),
            deps: Vec::new(),
            dumper: None,
            sort: SortInfo::default(),
        }
    }

    pub fn catalog_id(mut self, catalog_id: CatalogId) -> Self {
        self.catalog_id = catalog_id;
        self
    }

    /// Override the section derived from the object class.
    pub fn section(mut self, section: Section) -> Self {
        self.section = Some(section);
        self
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn tablespace(mut self, tablespace: &str) -> Self {
        self.tablespace = tablespace.to_string();
        self
    }

    pub fn owner(mut self, owner: &str) -> Self {
        self.owner = owner.to_string();
        self
    }

    pub fn defn(mut self, defn: &str) -> Self {
        self.defn = defn.to_string();
        self
    }

    pub fn drop_stmt(mut self, drop_stmt: &str) -> Self {
        self.drop_stmt = drop_stmt.to_string();
        self
    }

    pub fn copy_stmt(mut self, copy_stmt: &str) -> Self {
        self.copy_stmt = copy_stmt.to_string();
        self
    }

    pub fn deps(mut self, deps: &[DumpId]) -> Self {
        self.deps = deps.to_vec();
        self
    }

    pub fn dumper<D: DataDumper + 'static>(mut self, dumper: D) -> Self {
        self.dumper = Some(Arc::new(dumper));
        self
    }

    pub fn shared_dumper(mut self, dumper: Arc<dyn DataDumper>) -> Self {
        self.dumper = Some(dumper);
        self
    }

    pub fn sort_info(mut self, sort: SortInfo) -> Self {
        self.sort = sort;
        self
    }

    pub(crate) fn into_entry(self, dump_id: DumpId) -> TocEntry {
        let section = self
            .section
            .unwrap_or_else(|| self.class.default_section());
        let mut deps: Vec<DumpId> = Vec::with_capacity(self.deps.len());
        for dep in self.deps {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        let had_dumper = self.dumper.is_some();
        TocEntry {
            dump_id,
            catalog_id: self.catalog_id,
            section,
            class: self.class,
            tag: self.tag,
            namespace: self.namespace,
            tablespace: self.tablespace,
            owner: self.owner,
            defn: self.defn,
            drop_stmt: self.drop_stmt,
            copy_stmt: self.copy_stmt,
            deps,
            dumper: self.dumper,
            had_dumper,
            extra: FormatExtra::None,
            data_length: 0,
            sort: self.sort,
            printed: false,
        }
    }
}

#[derive(Clone, Copy, Default, Debug)]
struct Link {
    prev: usize,
    next: usize,
}

/// Ordered list of entries, indexed by dump id.
///
/// Slot 0 of the link table is the list head.
#[derive(Clone)]
pub struct Toc {
    entries: Vec<Option<TocEntry>>,
    links: Vec<Link>,
    len: usize,
}

impl Default for Toc {
    fn default() -> Self {
        Self::new()
    }
}

impl Toc {
    pub fn new() -> Self {
        Self {
            entries: vec![None],
            links: vec![Link::default()],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Highest dump id ever stored.
    pub fn max_dump_id(&self) -> DumpId {
        (self.entries.len() - 1) as DumpId
    }

    fn slot(&self, id: DumpId) -> Option<usize> {
        if id <= 0 {
            return None;
        }
        let slot = id as usize;
        match self.entries.get(slot) {
            Some(Some(_)) => Some(slot),
            _ => None,
        }
    }

    pub fn contains(&self, id: DumpId) -> bool {
        self.slot(id).is_some()
    }

    pub fn get(&self, id: DumpId) -> Option<&TocEntry> {
        self.slot(id).and_then(|slot| self.entries[slot].as_ref())
    }

    pub fn get_mut(&mut self, id: DumpId) -> Option<&mut TocEntry> {
        match self.slot(id) {
            Some(slot) => self.entries[slot].as_mut(),
            None => None,
        }
    }

    /// Append `entry` at the end of the list.
    pub fn push(&mut self, entry: TocEntry) -> Result<(), Error> {
        let id = entry.dump_id;
        if id <= 0 {
            bail!("entry ID {} out of range -- perhaps a corrupt TOC", id);
        }
        if self.contains(id) {
            bail!("duplicate TOC entry ID {}", id);
        }
        let slot = id as usize;
        if slot >= self.entries.len() {
            self.entries.resize_with(slot + 1, || None);
            self.links.resize(slot + 1, Link::default());
        }
        self.entries[slot] = Some(entry);
        self.link_before(slot, 0);
        self.len += 1;
        Ok(())
    }

    fn unlink(&mut self, slot: usize) {
        let Link { prev, next } = self.links[slot];
        self.links[prev].next = next;
        self.links[next].prev = prev;
    }

    /// Insert `slot` in front of `before` (0 means at the end).
    fn link_before(&mut self, slot: usize, before: usize) {
        let prev = self.links[before].prev;
        self.links[slot] = Link { prev, next: before };
        self.links[prev].next = slot;
        self.links[before].prev = slot;
    }

    pub fn first(&self) -> Option<DumpId> {
        match self.links[0].next {
            0 => None,
            slot => Some(slot as DumpId),
        }
    }

    pub fn next(&self, id: DumpId) -> Option<DumpId> {
        let slot = self.slot(id)?;
        match self.links[slot].next {
            0 => None,
            next => Some(next as DumpId),
        }
    }

    /// Dump ids in list order.
    pub fn ids(&self) -> Vec<DumpId> {
        let mut ids = Vec::with_capacity(self.len);
        let mut slot = self.links[0].next;
        while slot != 0 {
            ids.push(slot as DumpId);
            slot = self.links[slot].next;
        }
        ids
    }

    pub fn iter(&self) -> TocIter<'_> {
        TocIter {
            toc: self,
            slot: self.links[0].next,
        }
    }

    pub fn move_to_front(&mut self, id: DumpId) -> Result<(), Error> {
        let slot = self.check_slot(id)?;
        self.unlink(slot);
        let first = self.links[0].next;
        self.link_before(slot, first);
        Ok(())
    }

    pub fn move_to_back(&mut self, id: DumpId) -> Result<(), Error> {
        let slot = self.check_slot(id)?;
        self.unlink(slot);
        self.link_before(slot, 0);
        Ok(())
    }

    /// Move `id` directly behind `anchor`.
    pub fn move_after(&mut self, anchor: DumpId, id: DumpId) -> Result<(), Error> {
        let anchor = self.check_slot(anchor)?;
        let slot = self.check_slot(id)?;
        if anchor == slot {
            return Ok(());
        }
        self.unlink(slot);
        let next = self.links[anchor].next;
        self.link_before(slot, next);
        Ok(())
    }

    /// Rebuild the list in the given order, which must be a permutation
    /// of the current entries.
    pub fn reorder(&mut self, order: &[DumpId]) -> Result<(), Error> {
        if order.len() != self.len {
            bail!(
                "reordering TOC needs {} entries, got {}",
                self.len,
                order.len()
            );
        }
        let mut seen = vec![false; self.entries.len()];
        for id in order {
            let slot = self.check_slot(*id)?;
            if seen[slot] {
                bail!("entry ID {} listed twice when reordering TOC", id);
            }
            seen[slot] = true;
        }
        self.links[0] = Link::default();
        for id in order {
            self.link_before(*id as usize, 0);
        }
        Ok(())
    }

    fn check_slot(&self, id: DumpId) -> Result<usize, Error> {
        match self.slot(id) {
            Some(slot) => Ok(slot),
            None => bail!("could not find entry for ID {}", id),
        }
    }
}

pub struct TocIter<'a> {
    toc: &'a Toc,
    slot: usize,
}

impl<'a> Iterator for TocIter<'a> {
    type Item = &'a TocEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.slot == 0 {
            return None;
        }
        let entry = self.toc.entries[self.slot].as_ref();
        self.slot = self.toc.links[self.slot].next;
        entry
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(id: DumpId, class: ObjectClass, tag: &str) -> TocEntry {
        ArchiveEntryOpts::new(class, tag).into_entry(id)
    }

    #[test]
    fn list_operations() -> Result<(), Error> {
        let mut toc = Toc::new();
        for (id, tag) in [(1, "a"), (2, "b"), (3, "c"), (5, "e")] {
            toc.push(entry(id, ObjectClass::Table, tag))?;
        }
        assert!(toc.push(entry(2, ObjectClass::Table, "dup")).is_err());
        assert!(toc.push(entry(0, ObjectClass::Table, "zero")).is_err());
        assert_eq!(toc.max_dump_id(), 5);
        assert!(!toc.contains(4));

        toc.move_to_front(3)?;
        assert_eq!(toc.ids(), vec![3, 1, 2, 5]);
        toc.move_to_back(1)?;
        assert_eq!(toc.ids(), vec![3, 2, 5, 1]);
        toc.move_after(3, 5)?;
        assert_eq!(toc.ids(), vec![3, 5, 2, 1]);
        assert_eq!(toc.next(5), Some(2));
        assert_eq!(toc.next(1), None);

        toc.reorder(&[1, 2, 3, 5])?;
        let tags: Vec<&str> = toc.iter().map(|te| te.tag.as_str()).collect();
        assert_eq!(tags, vec!["a", "b", "c", "e"]);
        assert!(toc.reorder(&[1, 2, 3]).is_err());
        assert!(toc.move_to_front(4).is_err());
        Ok(())
    }

    #[test]
    fn entry_defaults() {
        let te = ArchiveEntryOpts::new(ObjectClass::Index, "t_idx")
            .namespace("public")
            .deps(&[3, 3, 4])
            .into_entry(7);
        assert_eq!(te.section, Section::PostData);
        assert_eq!(te.deps, vec![3, 4]);
        assert_eq!(te.describe(), "INDEX public.t_idx");
        assert!(!te.has_data());
    }
}
