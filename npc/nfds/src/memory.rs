//! An in-memory model of the kernel ruleset store.
//!
//! Applies batches with the kernel's atomicity and duplicate-detection
//! semantics, which makes it the oracle for the controller's property
//! tests: a batch either applies fully or not at all, duplicate elements
//! and missing objects are errors, and anonymous sets live and die with
//! the rules that reference them.

use crate::backend::{Applied, Backend, Batch, Op, TableRef};
use crate::conn::{ChainSpec, SetElem, SetSpec};
use crate::expr::{LoweredExpr, SetRef};
use crate::Family;
use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// A shared handle to the model; clones observe the same state.
#[derive(Clone, Default)]
pub struct MemoryBackend(Arc<Mutex<State>>);

#[derive(Clone, Default)]
struct State {
    tables: BTreeMap<(Family, String), Table>,
    next_handle: u64,
}

#[derive(Clone, Debug, Default)]
pub struct Table {
    pub chains: BTreeMap<String, Chain>,
    pub sets: BTreeMap<String, MemSet>,
}

#[derive(Clone, Debug)]
pub struct Chain {
    pub spec: ChainSpec,
    pub rules: Vec<MemRule>,
}

#[derive(Clone, Debug)]
pub struct MemRule {
    pub handle: u64,
    pub exprs: Vec<LoweredExpr>,
}

#[derive(Clone, Debug)]
pub struct MemSet {
    pub spec: SetSpec,
    pub elements: Vec<SetElem>,
}

// === impl Table ===

impl Table {
    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.get(name)
    }

    pub fn set(&self, name: &str) -> Option<&MemSet> {
        self.sets.get(name)
    }
}

// === impl MemSet ===

impl MemSet {
    /// Element keys in sorted order, for order-insensitive assertions.
    pub fn sorted_keys(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = self.elements.iter().map(|e| e.key.clone()).collect();
        keys.sort();
        keys
    }
}

// === impl MemoryBackend ===

impl MemoryBackend {
    pub fn table(&self, family: Family, name: &str) -> Option<Table> {
        self.0
            .lock()
            .unwrap()
            .tables
            .get(&(family, name.to_string()))
            .cloned()
    }

    /// A deterministic rendering of the full state, independent of rule
    /// handles and anonymous set names, for whole-state comparisons.
    pub fn dump(&self) -> String {
        use std::fmt::Write;

        let state = self.0.lock().unwrap();
        let mut out = String::new();
        for ((family, name), table) in &state.tables {
            writeln!(out, "table {} {}", family, name).unwrap();
            for (chain_name, chain) in &table.chains {
                writeln!(out, "  chain {} {:?}", chain_name, chain.spec.hook).unwrap();
                for rule in &chain.rules {
                    writeln!(out, "    rule {}", dump_exprs(&rule.exprs)).unwrap();
                }
            }
            for (set_name, set) in &table.sets {
                if set.spec.anonymous {
                    continue;
                }
                let mut elements: Vec<String> =
                    set.elements.iter().map(|e| format!("{:?}", e)).collect();
                elements.sort();
                writeln!(out, "  set {} {:?}", set_name, elements).unwrap();
            }
        }
        out
    }
}

fn dump_exprs(exprs: &[LoweredExpr]) -> String {
    exprs
        .iter()
        .map(|e| match e {
            LoweredExpr::Lookup {
                set,
                sreg,
                verdict_to,
                invert,
            } => {
                let target = if set.spec.anonymous {
                    let mut elements: Vec<String> =
                        set.elements.iter().map(|e| format!("{:?}", e)).collect();
                    elements.sort();
                    format!("anon{:?}", elements)
                } else {
                    format!("@{}", set.spec.name)
                };
                format!(
                    "lookup({target}, sreg={sreg}, verdict_to={verdict_to:?}, invert={invert})"
                )
            }
            other => format!("{:?}", other),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

impl Backend for MemoryBackend {
    fn list_tables(&mut self) -> Result<Vec<TableRef>> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .tables
            .keys()
            .map(|(family, name)| TableRef {
                family: *family,
                name: name.clone(),
            })
            .collect())
    }

    fn apply(&mut self, batch: &Batch) -> Result<Applied> {
        let mut state = self.0.lock().unwrap();
        // Work on a copy so a failing batch leaves no partial effects.
        let mut next = state.clone();
        let mut applied = Applied::default();

        for op in &batch.ops {
            next.apply_op(op, &mut applied)?;
        }
        next.collect_anonymous_sets();

        *state = next;
        Ok(applied)
    }
}

// === impl State ===

impl State {
    fn table_mut(&mut self, family: Family, name: &str) -> Result<&mut Table> {
        match self.tables.get_mut(&(family, name.to_string())) {
            Some(table) => Ok(table),
            None => bail!("table {} {} does not exist", family, name),
        }
    }

    fn apply_op(&mut self, op: &Op, applied: &mut Applied) -> Result<()> {
        match op {
            Op::DelTable { family, name } => {
                if self.tables.remove(&(*family, name.clone())).is_none() {
                    bail!("deleting missing table {} {}", family, name);
                }
            }
            Op::AddTable { family, name } => {
                if self
                    .tables
                    .insert((*family, name.clone()), Table::default())
                    .is_some()
                {
                    bail!("table {} {} already exists", family, name);
                }
            }
            Op::AddChain {
                family,
                table,
                chain,
            } => {
                let table = self.table_mut(*family, table)?;
                if table
                    .chains
                    .insert(
                        chain.name.clone(),
                        Chain {
                            spec: chain.clone(),
                            rules: Vec::new(),
                        },
                    )
                    .is_some()
                {
                    bail!("chain {} already exists", chain.name);
                }
            }
            Op::DelChain {
                family,
                table,
                name,
            } => {
                let table = self.table_mut(*family, table)?;
                if table.chains.remove(name).is_none() {
                    bail!("deleting missing chain {}", name);
                }
            }
            Op::AddSet {
                family,
                table,
                set,
                elements,
            } => {
                let table = self.table_mut(*family, table)?;
                if table
                    .sets
                    .insert(
                        set.name.clone(),
                        MemSet {
                            spec: set.clone(),
                            elements: Vec::new(),
                        },
                    )
                    .is_some()
                {
                    bail!("set {} already exists", set.name);
                }
                add_elements(table.sets.get_mut(&set.name).unwrap(), elements)?;
            }
            Op::DelSet {
                family,
                table,
                name,
            } => {
                let table = self.table_mut(*family, table)?;
                if table.sets.remove(name).is_none() {
                    bail!("deleting missing set {}", name);
                }
            }
            Op::AddElements {
                family,
                table,
                set,
                elements,
            } => {
                let table = self.table_mut(*family, table)?;
                let Some(target) = table.sets.get_mut(&set.name) else {
                    bail!("adding elements to missing set {}", set.name);
                };
                add_elements(target, elements)?;
            }
            Op::DelElements {
                family,
                table,
                set,
                elements,
            } => {
                let table = self.table_mut(*family, table)?;
                let Some(target) = table.sets.get_mut(&set.name) else {
                    bail!("deleting elements from missing set {}", set.name);
                };
                for elem in elements {
                    let found = target.elements.iter().position(|e| {
                        e.key == elem.key
                            && e.key_end == elem.key_end
                            && e.interval_end == elem.interval_end
                    });
                    match found {
                        Some(i) => {
                            target.elements.remove(i);
                        }
                        None => bail!("deleting missing element from set {}", set.name),
                    }
                }
            }
            Op::AddRule {
                family,
                table,
                chain,
                id,
                insert,
                exprs,
            } => {
                let handle = self.next_handle;
                self.next_handle += 1;
                let table = self.table_mut(*family, table)?;
                for expr in exprs {
                    if let LoweredExpr::Lookup { set, .. } = expr {
                        register_lookup_set(table, set)?;
                    }
                }
                let Some(target) = table.chains.get_mut(chain) else {
                    bail!("adding rule to missing chain {}", chain);
                };
                let rule = MemRule {
                    handle,
                    exprs: exprs.clone(),
                };
                if *insert {
                    target.rules.insert(0, rule);
                } else {
                    target.rules.push(rule);
                }
                applied.rule_handles.push((*id, *family, handle));
            }
            Op::DelRule {
                family,
                table,
                chain,
                handle,
            } => {
                let table = self.table_mut(*family, table)?;
                let Some(target) = table.chains.get_mut(chain) else {
                    bail!("deleting rule from missing chain {}", chain);
                };
                match target.rules.iter().position(|r| r.handle == *handle) {
                    Some(i) => {
                        target.rules.remove(i);
                    }
                    None => bail!("deleting missing rule handle {}", handle),
                }
            }
        }
        Ok(())
    }

    /// Drops anonymous sets no longer referenced by any rule, mirroring
    /// their kernel lifetime.
    fn collect_anonymous_sets(&mut self) {
        for table in self.tables.values_mut() {
            let referenced: ahash::AHashSet<String> = table
                .chains
                .values()
                .flat_map(|c| c.rules.iter())
                .flat_map(|r| r.exprs.iter())
                .filter_map(|e| match e {
                    LoweredExpr::Lookup { set, .. } => Some(set.spec.name.clone()),
                    _ => None,
                })
                .collect();
            table
                .sets
                .retain(|name, set| !set.spec.anonymous || referenced.contains(name));
        }
    }
}

fn register_lookup_set(table: &mut Table, set: &SetRef) -> Result<()> {
    if !set.spec.anonymous {
        if !table.sets.contains_key(&set.spec.name) {
            bail!("rule references missing set {}", set.spec.name);
        }
        return Ok(());
    }
    let target = table.sets.entry(set.spec.name.clone()).or_insert(MemSet {
        spec: set.spec.clone(),
        elements: Vec::new(),
    });
    if target.elements.is_empty() {
        target.elements = set.elements.clone();
    }
    Ok(())
}

fn add_elements(set: &mut MemSet, elements: &[SetElem]) -> Result<()> {
    for elem in elements {
        let duplicate = set.elements.iter().any(|e| {
            e.key == elem.key
                && e.key_end == elem.key_end
                && e.interval_end == elem.interval_end
        });
        if duplicate {
            bail!("duplicate element in set {}", set.spec.name);
        }
        set.elements.push(elem.clone());
    }
    Ok(())
}
