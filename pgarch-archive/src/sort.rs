//! Dependency ordering of the TOC.
//!
//! Entries are sorted topologically with a priority queue so that the
//! input order is kept wherever the dependencies allow it: among the
//! entries that are free to go, the one furthest back in the current list
//! is placed last. If the graph has cycles, each cycle is searched,
//! repaired by dropping or redirecting one of its edges, and the sort
//! restarts.

use std::collections::BinaryHeap;

use anyhow::{bail, Error};

use pgarch_api_types::{DumpId, ObjectClass, Section};

use crate::toc::Toc;

/// One repaired dependency loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopRepair {
    /// A function depended on a type whose I/O functions it is. It now
    /// depends on the shell type instead.
    TypeFunction {
        type_id: DumpId,
        function_id: DumpId,
    },
    /// A view and its ON SELECT rule.
    ViewRule {
        view_id: DumpId,
        rule_id: DumpId,
        separated: bool,
    },
    /// A materialized view inside the pre-data section depended on data.
    MatViewBoundary {
        boundary_id: DumpId,
        matview_id: DumpId,
    },
    /// A table or domain and one of its constraints or defaults.
    TableConstraint {
        owner_id: DumpId,
        constraint_id: DumpId,
        separated: bool,
    },
    /// Table data entries referencing each other through foreign keys.
    ForeignKeyRing { tables: Vec<String> },
    /// Any other loop, broken at its first edge.
    Arbitrary {
        from: DumpId,
        to: DumpId,
        items: Vec<String>,
    },
}

/// Loop repairs done while sorting.
#[derive(Clone, Debug, Default)]
pub struct SortReport {
    pub repairs: Vec<LoopRepair>,
}

impl SortReport {
    pub fn is_empty(&self) -> bool {
        self.repairs.is_empty()
    }

    pub fn has_foreign_key_ring(&self) -> bool {
        self.repairs
            .iter()
            .any(|repair| matches!(repair, LoopRepair::ForeignKeyRing { .. }))
    }
}

fn valid_dep(toc: &Toc, index_of: &[usize], dep: DumpId) -> Option<usize> {
    if dep <= 0 || dep as usize >= index_of.len() || !toc.contains(dep) {
        return None;
    }
    match index_of[dep as usize] {
        usize::MAX => None,
        index => Some(index),
    }
}

/// Sort `order` by the dependencies stored in `toc`.
///
/// Returns the entries which could not be placed if the graph has a
/// cycle. Dependencies on entries not in `order` are ignored.
fn topo_sort(toc: &Toc, order: &[DumpId]) -> Result<Vec<DumpId>, Vec<DumpId>> {
    let max_id = toc.max_dump_id().max(0) as usize;

    let mut index_of = vec![usize::MAX; max_id + 1];
    for (i, id) in order.iter().enumerate() {
        index_of[*id as usize] = i;
    }

    // number of entries that must come after each entry
    let mut before = vec![0usize; max_id + 1];
    for id in order {
        if let Some(te) = toc.get(*id) {
            for dep in te.deps.iter() {
                if valid_dep(toc, &index_of, *dep).is_some() {
                    before[*dep as usize] += 1;
                }
            }
        }
    }

    let mut ready: BinaryHeap<usize> = order
        .iter()
        .enumerate()
        .filter(|(_, id)| before[**id as usize] == 0)
        .map(|(i, _)| i)
        .collect();

    let mut sorted = vec![0; order.len()];
    let mut pos = order.len();

    while let Some(index) = ready.pop() {
        let id = order[index];
        pos -= 1;
        sorted[pos] = id;
        if let Some(te) = toc.get(id) {
            for dep in te.deps.iter() {
                if let Some(dep_index) = valid_dep(toc, &index_of, *dep) {
                    let count = &mut before[*dep as usize];
                    *count -= 1;
                    if *count == 0 {
                        ready.push(dep_index);
                    }
                }
            }
        }
    }

    if pos != 0 {
        let failing = order
            .iter()
            .copied()
            .filter(|id| before[*id as usize] > 0)
            .collect();
        return Err(failing);
    }

    Ok(sorted)
}

struct LoopSearch {
    processed: Vec<bool>,
    search_failed: Vec<DumpId>,
    on_path: Vec<bool>,
}

impl LoopSearch {
    fn new(max_id: usize) -> Self {
        Self {
            processed: vec![false; max_id + 1],
            search_failed: vec![0; max_id + 1],
            on_path: vec![false; max_id + 1],
        }
    }

    fn deps<'a>(toc: &'a Toc, id: DumpId) -> &'a [DumpId] {
        toc.get(id).map(|te| te.deps.as_slice()).unwrap_or(&[])
    }

    /// Find a cycle through `start`. The result lists the loop members
    /// so that each one depends on the next, and the last on `start`.
    fn find_loop(&mut self, toc: &Toc, start: DumpId) -> Option<Vec<DumpId>> {
        if self.processed[start as usize] {
            return None;
        }
        if Self::deps(toc, start).contains(&start) {
            return Some(vec![start]);
        }

        let mut path: Vec<(DumpId, usize)> = vec![(start, 0)];
        self.on_path[start as usize] = true;

        let result = loop {
            let (node, next_index) = match path.last_mut() {
                Some(top) => {
                    let current = *top;
                    top.1 += 1;
                    current
                }
                None => break None,
            };

            let deps = Self::deps(toc, node);
            if next_index >= deps.len() {
                // nothing below this node leads back to start
                self.search_failed[node as usize] = start;
                self.on_path[node as usize] = false;
                path.pop();
                continue;
            }

            let next = deps[next_index];
            if !toc.contains(next) {
                continue;
            }
            let slot = next as usize;
            if self.processed[slot] || self.search_failed[slot] == start || self.on_path[slot] {
                continue;
            }

            self.on_path[slot] = true;
            path.push((next, 0));

            if Self::deps(toc, next).contains(&start) {
                break Some(path.iter().map(|(id, _)| *id).collect::<Vec<_>>());
            }
        };

        for (id, _) in path {
            self.on_path[id as usize] = false;
        }
        result
    }
}

fn class_of(toc: &Toc, id: DumpId) -> Option<&ObjectClass> {
    toc.get(id).map(|te| &te.class)
}

fn is_view(toc: &Toc, id: DumpId) -> bool {
    matches!(
        class_of(toc, id),
        Some(ObjectClass::View) | Some(ObjectClass::MaterializedView)
    )
}

fn is_select_rule_of(toc: &Toc, rule: DumpId, view: DumpId) -> bool {
    match toc.get(rule) {
        Some(te) => {
            te.class == ObjectClass::Rule
                && te.sort.on_select_rule
                && te.sort.owning_object == Some(view)
        }
        None => false,
    }
}

fn is_constraint_of(toc: &Toc, constraint: DumpId, owner: DumpId) -> bool {
    let te = match toc.get(constraint) {
        Some(te) => te,
        None => return false,
    };
    if te.sort.owning_object != Some(owner) {
        return false;
    }
    match class_of(toc, owner) {
        Some(ObjectClass::Table) => matches!(
            te.class,
            ObjectClass::CheckConstraint | ObjectClass::ColumnDefault
        ),
        Some(ObjectClass::Domain) => te.class == ObjectClass::CheckConstraint,
        _ => false,
    }
}

fn remove_dependency(toc: &mut Toc, from: DumpId, to: DumpId) {
    if let Some(te) = toc.get_mut(from) {
        te.remove_dependency(to);
    }
}

fn add_dependency(toc: &mut Toc, from: DumpId, to: DumpId) {
    if let Some(te) = toc.get_mut(from) {
        te.add_dependency(to);
    }
}

fn describe(toc: &Toc, id: DumpId) -> String {
    match toc.get(id) {
        Some(te) => format!(
            "{} {}  (ID {} OID {})",
            te.class, te.tag, te.dump_id, te.catalog_id.oid
        ),
        None => format!("object {}", id),
    }
}

fn repair_type_function(toc: &mut Toc, type_id: DumpId, function_id: DumpId) -> LoopRepair {
    remove_dependency(toc, function_id, type_id);
    let shell = toc.get(type_id).and_then(|te| te.sort.shell_type);
    if let Some(shell) = shell {
        if toc.contains(shell) {
            add_dependency(toc, function_id, shell);
        }
    }
    LoopRepair::TypeFunction {
        type_id,
        function_id,
    }
}

/// Dump the ON SELECT rule separately, after the view, which is created
/// as a dummy first.
fn repair_view_rule_multi(toc: &mut Toc, view_id: DumpId, rule_id: DumpId) -> LoopRepair {
    remove_dependency(toc, view_id, rule_id);

    let reloptions = toc.get_mut(view_id).and_then(|te| te.sort.reloptions.take());
    if let Some(rule) = toc.get_mut(rule_id) {
        if !rule.sort.separate {
            rule.sort.separate = true;
            rule.section = Section::PostData;
        }
        rule.add_dependency(view_id);
        if reloptions.is_some() {
            rule.sort.reloptions = reloptions;
        }
    }

    // triggers on the view need the real view definition
    let triggers: Vec<DumpId> = toc
        .iter()
        .filter(|te| te.class == ObjectClass::Trigger && te.sort.owning_object == Some(view_id))
        .map(|te| te.dump_id)
        .collect();
    for trigger in triggers {
        add_dependency(toc, trigger, rule_id);
    }

    LoopRepair::ViewRule {
        view_id,
        rule_id,
        separated: true,
    }
}

/// Dump the constraint as its own post-data command after the owner.
fn repair_constraint_multi(toc: &mut Toc, owner_id: DumpId, constraint_id: DumpId) -> LoopRepair {
    remove_dependency(toc, owner_id, constraint_id);
    if let Some(constraint) = toc.get_mut(constraint_id) {
        if !constraint.sort.separate {
            constraint.sort.separate = true;
            constraint.section = Section::PostData;
        }
        constraint.add_dependency(owner_id);
    }
    LoopRepair::TableConstraint {
        owner_id,
        constraint_id,
        separated: true,
    }
}

fn repair_dependency_loop(toc: &mut Toc, lp: &[DumpId]) -> LoopRepair {
    let n = lp.len();

    if n == 2 {
        for (a, b) in [(lp[0], lp[1]), (lp[1], lp[0])] {
            if class_of(toc, a) == Some(&ObjectClass::Type)
                && class_of(toc, b) == Some(&ObjectClass::Function)
            {
                return repair_type_function(toc, a, b);
            }
        }

        for (view, rule) in [(lp[0], lp[1]), (lp[1], lp[0])] {
            if is_view(toc, view) && is_select_rule_of(toc, rule, view) {
                // the rule stays part of the view definition
                remove_dependency(toc, rule, view);
                return LoopRepair::ViewRule {
                    view_id: view,
                    rule_id: rule,
                    separated: false,
                };
            }
        }
    }

    if n > 2 {
        for view in lp.iter().copied() {
            if !is_view(toc, view) {
                continue;
            }
            if let Some(rule) = lp
                .iter()
                .copied()
                .find(|rule| is_select_rule_of(toc, *rule, view))
            {
                return repair_view_rule_multi(toc, view, rule);
            }
        }

        let has_matview = lp
            .iter()
            .any(|id| class_of(toc, *id) == Some(&ObjectClass::MaterializedView));
        if has_matview {
            for i in 0..n {
                if class_of(toc, lp[i]) != Some(&ObjectClass::PreDataBoundary) {
                    continue;
                }
                let next = lp[(i + 1) % n];
                remove_dependency(toc, lp[i], next);
                if let Some(te) = toc.get_mut(next) {
                    if te.class == ObjectClass::MaterializedView {
                        te.sort.postponed = true;
                        te.section = Section::PostData;
                    }
                }
                return LoopRepair::MatViewBoundary {
                    boundary_id: lp[i],
                    matview_id: next,
                };
            }
        }
    }

    if n == 2 {
        for (owner, constraint) in [(lp[0], lp[1]), (lp[1], lp[0])] {
            if is_constraint_of(toc, constraint, owner) {
                // the constraint is created after its table
                remove_dependency(toc, owner, constraint);
                return LoopRepair::TableConstraint {
                    owner_id: owner,
                    constraint_id: constraint,
                    separated: false,
                };
            }
        }
    }

    if n > 2 {
        for owner in lp.iter().copied() {
            if let Some(constraint) = lp
                .iter()
                .copied()
                .find(|constraint| is_constraint_of(toc, *constraint, owner))
            {
                return repair_constraint_multi(toc, owner, constraint);
            }
        }
    }

    if n > 1
        && lp
            .iter()
            .all(|id| class_of(toc, *id) == Some(&ObjectClass::TableData))
    {
        let tables: Vec<String> = lp
            .iter()
            .filter_map(|id| toc.get(*id).map(|te| te.tag.clone()))
            .collect();
        log::warn!("there are circular foreign-key constraints among these tables:");
        for table in tables.iter() {
            log::warn!("  {}", table);
        }
        log::warn!(
            "You might not be able to restore the dump without using --disable-triggers or temporarily dropping the constraints."
        );
        log::warn!("Consider using a full dump instead of a --data-only dump to avoid this problem.");
        remove_dependency(toc, lp[0], lp[1]);
        return LoopRepair::ForeignKeyRing { tables };
    }

    let items: Vec<String> = lp.iter().map(|id| describe(toc, *id)).collect();
    log::warn!("could not resolve dependency loop among these items:");
    for item in items.iter() {
        log::warn!("  {}", item);
    }
    let (from, to) = (lp[0], lp[1 % n]);
    remove_dependency(toc, from, to);
    LoopRepair::Arbitrary { from, to, items }
}

fn find_dependency_loops(toc: &mut Toc, failing: &[DumpId], report: &mut SortReport) -> Result<(), Error> {
    let mut search = LoopSearch::new(toc.max_dump_id().max(0) as usize);
    let mut fixed = false;

    for id in failing.iter().copied() {
        match search.find_loop(toc, id) {
            Some(lp) => {
                log::debug!("repairing dependency loop {:?}", lp);
                report.repairs.push(repair_dependency_loop(toc, &lp));
                for member in lp {
                    search.processed[member as usize] = true;
                }
                fixed = true;
            }
            None => {
                // not on a loop itself, only depends on one
                search.processed[id as usize] = true;
            }
        }
    }

    if !fixed {
        bail!("could not identify dependency loop");
    }
    Ok(())
}

/// Sort the TOC by dependencies, repairing loops. Stable: an already
/// valid order is kept as it is.
pub fn sort_toc(toc: &mut Toc) -> Result<SortReport, Error> {
    let mut report = SortReport::default();

    let edges: usize = toc.iter().map(|te| te.deps.len()).sum();
    let max_rounds = edges + toc.len() + 1;

    for _ in 0..max_rounds {
        let order = toc.ids();
        match topo_sort(toc, &order) {
            Ok(sorted) => {
                toc.reorder(&sorted)?;
                return Ok(report);
            }
            Err(failing) => find_dependency_loops(toc, &failing, &mut report)?,
        }
    }

    bail!("could not resolve dependency loops after {} attempts", max_rounds);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::toc::{ArchiveEntryOpts, SortInfo};

    fn add(toc: &mut Toc, id: DumpId, class: ObjectClass, tag: &str, deps: &[DumpId]) {
        let te = ArchiveEntryOpts::new(class, tag).deps(deps).into_entry(id);
        toc.push(te).unwrap();
    }

    fn owned(toc: &mut Toc, id: DumpId, owner: DumpId) {
        toc.get_mut(id).unwrap().sort.owning_object = Some(owner);
    }

    fn position(toc: &Toc, id: DumpId) -> usize {
        toc.ids().iter().position(|x| *x == id).unwrap()
    }

    fn assert_deps_respected(toc: &Toc) {
        for te in toc.iter() {
            for dep in te.deps.iter() {
                if toc.contains(*dep) {
                    assert!(
                        position(toc, *dep) < position(toc, te.dump_id),
                        "{} placed before its dependency {}",
                        te.dump_id,
                        dep
                    );
                }
            }
        }
    }

    fn edge_count(toc: &Toc, members: &[DumpId]) -> usize {
        members
            .iter()
            .filter_map(|id| toc.get(*id))
            .map(|te| te.deps.iter().filter(|dep| members.contains(dep)).count())
            .sum()
    }

    #[test]
    fn keeps_valid_order_and_ignores_missing() -> Result<(), Error> {
        let mut toc = Toc::new();
        add(&mut toc, 1, ObjectClass::Schema, "s", &[]);
        add(&mut toc, 2, ObjectClass::Table, "a", &[1, 99]);
        add(&mut toc, 3, ObjectClass::Table, "b", &[1]);
        add(&mut toc, 4, ObjectClass::Index, "a_idx", &[2]);

        let report = sort_toc(&mut toc)?;
        assert!(report.is_empty());
        assert_eq!(toc.ids(), vec![1, 2, 3, 4]);

        // sorting twice changes nothing
        sort_toc(&mut toc)?;
        assert_eq!(toc.ids(), vec![1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn moves_entries_behind_dependencies() -> Result<(), Error> {
        let mut toc = Toc::new();
        add(&mut toc, 1, ObjectClass::Index, "a_idx", &[3]);
        add(&mut toc, 2, ObjectClass::Schema, "s", &[]);
        add(&mut toc, 3, ObjectClass::Table, "a", &[2]);
        add(&mut toc, 4, ObjectClass::Table, "b", &[]);

        sort_toc(&mut toc)?;
        assert_deps_respected(&toc);
        // unconstrained entries keep their relative order
        assert!(position(&toc, 2) < position(&toc, 4));
        Ok(())
    }

    #[test]
    fn table_check_constraint_two_cycle() -> Result<(), Error> {
        let mut toc = Toc::new();
        add(&mut toc, 1, ObjectClass::Table, "t", &[2]);
        add(&mut toc, 2, ObjectClass::CheckConstraint, "t_check", &[1]);
        owned(&mut toc, 2, 1);

        let before = edge_count(&toc, &[1, 2]);
        let report = sort_toc(&mut toc)?;
        assert!(edge_count(&toc, &[1, 2]) < before);

        assert_eq!(toc.ids(), vec![1, 2]);
        assert_eq!(
            report.repairs,
            vec![LoopRepair::TableConstraint {
                owner_id: 1,
                constraint_id: 2,
                separated: false
            }]
        );
        Ok(())
    }

    #[test]
    fn table_check_constraint_longer_cycle() -> Result<(), Error> {
        let mut toc = Toc::new();
        add(&mut toc, 1, ObjectClass::Table, "t", &[3]);
        add(&mut toc, 2, ObjectClass::Function, "check_fn", &[1]);
        add(&mut toc, 3, ObjectClass::CheckConstraint, "t_check", &[2]);
        owned(&mut toc, 3, 1);

        let report = sort_toc(&mut toc)?;
        assert_deps_respected(&toc);
        let constraint = toc.get(3).unwrap();
        assert!(constraint.sort.separate);
        assert_eq!(constraint.section, Section::PostData);
        assert!(constraint.deps.contains(&1));
        assert!(matches!(
            report.repairs[0],
            LoopRepair::TableConstraint { separated: true, .. }
        ));
        Ok(())
    }

    #[test]
    fn foreign_key_ring() -> Result<(), Error> {
        let mut toc = Toc::new();
        add(&mut toc, 1, ObjectClass::TableData, "a", &[2]);
        add(&mut toc, 2, ObjectClass::TableData, "b", &[3]);
        add(&mut toc, 3, ObjectClass::TableData, "c", &[1]);

        let before = edge_count(&toc, &[1, 2, 3]);
        let report = sort_toc(&mut toc)?;
        assert_eq!(edge_count(&toc, &[1, 2, 3]), before - 1);
        assert!(report.has_foreign_key_ring());
        assert_eq!(toc.len(), 3);
        assert_deps_respected(&toc);
        Ok(())
    }

    #[test]
    fn type_function_uses_shell_type() -> Result<(), Error> {
        let mut toc = Toc::new();
        add(&mut toc, 1, ObjectClass::ShellType, "mytype", &[]);
        add(&mut toc, 2, ObjectClass::Type, "mytype", &[3]);
        add(&mut toc, 3, ObjectClass::Function, "mytype_in", &[2]);
        toc.get_mut(2).unwrap().sort = SortInfo {
            shell_type: Some(1),
            ..Default::default()
        };

        sort_toc(&mut toc)?;
        assert_eq!(toc.get(3).unwrap().deps, vec![1]);
        assert_eq!(toc.ids(), vec![1, 3, 2]);
        Ok(())
    }

    #[test]
    fn view_rule_loops() -> Result<(), Error> {
        // simple: view and its ON SELECT rule
        let mut toc = Toc::new();
        add(&mut toc, 1, ObjectClass::View, "v", &[2]);
        add(&mut toc, 2, ObjectClass::Rule, "_RETURN", &[1]);
        owned(&mut toc, 2, 1);
        toc.get_mut(2).unwrap().sort.on_select_rule = true;
        sort_toc(&mut toc)?;
        assert!(toc.get(2).unwrap().deps.is_empty());
        assert!(!toc.get(2).unwrap().sort.separate);

        // through a function: the rule is split off
        let mut toc = Toc::new();
        add(&mut toc, 1, ObjectClass::View, "v", &[3]);
        add(&mut toc, 2, ObjectClass::Function, "f", &[1]);
        add(&mut toc, 3, ObjectClass::Rule, "_RETURN", &[2]);
        add(&mut toc, 4, ObjectClass::Trigger, "v_trig", &[1]);
        owned(&mut toc, 3, 1);
        owned(&mut toc, 4, 1);
        toc.get_mut(3).unwrap().sort.on_select_rule = true;
        toc.get_mut(1).unwrap().sort.reloptions = Some("security_barrier=true".to_string());

        sort_toc(&mut toc)?;
        assert_deps_respected(&toc);
        let rule = toc.get(3).unwrap();
        assert!(rule.sort.separate);
        assert_eq!(rule.section, Section::PostData);
        assert_eq!(rule.sort.reloptions.as_deref(), Some("security_barrier=true"));
        assert!(toc.get(4).unwrap().deps.contains(&3));
        Ok(())
    }

    #[test]
    fn matview_boundary_loop() -> Result<(), Error> {
        let mut toc = Toc::new();
        add(&mut toc, 1, ObjectClass::Table, "t", &[]);
        add(&mut toc, 2, ObjectClass::TableData, "t", &[4]);
        add(&mut toc, 3, ObjectClass::MaterializedView, "mv", &[2]);
        add(&mut toc, 4, ObjectClass::PreDataBoundary, "PRE-DATA BOUNDARY", &[1, 3]);

        let report = sort_toc(&mut toc)?;
        assert_deps_respected(&toc);
        let mv = toc.get(3).unwrap();
        assert!(mv.sort.postponed);
        assert_eq!(mv.section, Section::PostData);
        assert_eq!(
            report.repairs,
            vec![LoopRepair::MatViewBoundary {
                boundary_id: 4,
                matview_id: 3
            }]
        );
        Ok(())
    }

    #[test]
    fn unknown_loop_is_broken_with_warning() -> Result<(), Error> {
        let mut toc = Toc::new();
        add(&mut toc, 1, ObjectClass::Function, "f", &[2]);
        add(&mut toc, 2, ObjectClass::Function, "g", &[1]);
        add(&mut toc, 3, ObjectClass::Function, "h", &[3]);

        let report = sort_toc(&mut toc)?;
        assert_eq!(report.repairs.len(), 2);
        assert!(report
            .repairs
            .iter()
            .all(|repair| matches!(repair, LoopRepair::Arbitrary { .. })));
        assert!(toc.get(3).unwrap().deps.is_empty());
        assert_deps_respected(&toc);
        Ok(())
    }
}
