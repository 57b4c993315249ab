use crate::backend::{Applied, Backend, Batch, Op, TableRef};
use crate::expr::{Expr, SetRef, Verdict};
use crate::Family;
use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChainId(u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SetId(u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RuleId(u64);

/// Priority placing a chain after NAT/DNAT and IPVS rewriting.
pub const PRIORITY_SELINUX_LAST: i32 = 225;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainSpec {
    pub name: String,
    pub hook: Option<Hook>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Hook {
    pub hook: HookPoint,
    pub priority: i32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HookPoint {
    Forward,
}

// === impl ChainSpec ===

impl ChainSpec {
    /// A regular (non-base) filter chain.
    pub fn regular(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            hook: None,
        }
    }

    /// A base chain attached to the given hook.
    pub fn hooked(name: impl ToString, hook: HookPoint, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            hook: Some(Hook { hook, priority }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetSpec {
    /// Empty for anonymous sets; the connection assigns a placeholder name.
    pub name: String,
    pub anonymous: bool,
    pub constant: bool,
    pub interval: bool,
    pub is_map: bool,
    pub concatenation: bool,
    pub key: SetKey,
    pub data: Option<SetData>,
}

impl Default for SetSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            anonymous: false,
            constant: false,
            interval: false,
            is_map: false,
            concatenation: false,
            key: SetKey::Addr,
            data: None,
        }
    }
}

/// The key layout of a set, determining the per-family key byte length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetKey {
    /// An IP address: 4 bytes in v4, 16 in v6.
    Addr,
    /// (inet_proto, inet_service), each padded to 4 bytes: 8 bytes in both
    /// families.
    ProtoService,
    /// (inet_proto, inet_service, address): 12 bytes in v4, 24 in v6.
    ProtoServiceAddr,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetData {
    Verdict,
}

// === impl SetKey ===

impl SetKey {
    pub fn len(self, family: Family) -> usize {
        match (self, family) {
            (SetKey::Addr, Family::V4) => 4,
            (SetKey::Addr, Family::V6) => 16,
            (SetKey::ProtoService, _) => 8,
            (SetKey::ProtoServiceAddr, Family::V4) => 12,
            (SetKey::ProtoServiceAddr, Family::V6) => 24,
        }
    }

    /// Whether elements must be split between the families by key length.
    pub fn split(self) -> bool {
        self.len(Family::V4) != self.len(Family::V6)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetElem {
    pub key: Vec<u8>,
    /// Inclusive upper bound for range elements of concatenated interval
    /// sets.
    pub key_end: Option<Vec<u8>>,
    /// Marks the exclusive upper bound of an interval in plain interval
    /// sets.
    pub interval_end: bool,
    pub verdict: Option<Verdict>,
}

// === impl SetElem ===

impl SetElem {
    pub fn key(key: Vec<u8>) -> Self {
        Self {
            key,
            key_end: None,
            interval_end: false,
            verdict: None,
        }
    }

    pub fn interval_end(key: Vec<u8>) -> Self {
        Self {
            key,
            key_end: None,
            interval_end: true,
            verdict: None,
        }
    }

    pub fn range(key: Vec<u8>, key_end: Vec<u8>) -> Self {
        Self {
            key,
            key_end: Some(key_end),
            interval_end: false,
            verdict: None,
        }
    }

    pub fn verdict(key: Vec<u8>, verdict: Verdict) -> Self {
        Self {
            key,
            key_end: None,
            interval_end: false,
            verdict: Some(verdict),
        }
    }

    fn same_key(&self, other: &SetElem) -> bool {
        self.key == other.key
            && self.key_end == other.key_end
            && self.interval_end == other.interval_end
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Status {
    PendingAdd,
    Live,
    PendingDelete,
}

#[derive(Debug)]
struct ChainState {
    spec: ChainSpec,
    status: Status,
    rules: Vec<RuleId>,
}

#[derive(Debug)]
struct SetState {
    spec: SetSpec,
    status: Status,
    live: Vec<SetElem>,
    pending_add: Vec<SetElem>,
    pending_del: Vec<SetElem>,
}

#[derive(Debug)]
struct RuleState {
    chain: ChainId,
    exprs: Vec<Expr>,
    status: Status,
    inserted: bool,
    handles: [Option<u64>; 2],
}

/// Stages ruleset mutations for both families and commits them atomically.
///
/// The connection keeps the desired state of a single table pair. Mutations
/// accumulate until [`Conn::flush`], which emits one batch covering every
/// pending transition. On success the pending state becomes live; on failure
/// nothing changes, so the next flush re-emits the same transaction.
pub struct Conn {
    backend: Box<dyn Backend>,
    table: String,
    /// Same-named tables found at startup, deleted with the first commit so
    /// the replacement appears atomically.
    stale_tables: Vec<TableRef>,
    table_live: bool,
    chains: HashMap<ChainId, ChainState>,
    chain_order: Vec<ChainId>,
    sets: HashMap<SetId, SetState>,
    set_order: Vec<SetId>,
    rules: HashMap<RuleId, RuleState>,
    next_id: u64,
    next_anon: u64,
}

// === impl Conn ===

impl Conn {
    /// Opens a connection managing the named table pair. Any existing tables
    /// with that name are scheduled for deletion in the first commit.
    pub fn open(mut backend: Box<dyn Backend>, table: impl ToString) -> Result<Self> {
        let table = table.to_string();
        let stale_tables = backend
            .list_tables()
            .context("listing existing tables")?
            .into_iter()
            .filter(|t| t.name == table)
            .collect();
        Ok(Self {
            backend,
            table,
            stale_tables,
            table_live: false,
            chains: HashMap::default(),
            chain_order: Vec::new(),
            sets: HashMap::default(),
            set_order: Vec::new(),
            rules: HashMap::default(),
            next_id: 0,
            next_anon: 0,
        })
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn add_chain(&mut self, spec: ChainSpec) -> ChainId {
        let id = ChainId(self.next_id());
        self.chains.insert(
            id,
            ChainState {
                spec,
                status: Status::PendingAdd,
                rules: Vec::new(),
            },
        );
        self.chain_order.push(id);
        id
    }

    /// Deletes a chain and every rule still in it. Anonymous sets
    /// referenced only by those rules go with them.
    pub fn del_chain(&mut self, id: ChainId) {
        let Some(chain) = self.chains.get_mut(&id) else {
            panic!("deleting unknown chain");
        };
        for rule in chain.rules.drain(..) {
            self.rules.remove(&rule);
        }
        if chain.status == Status::PendingAdd {
            self.chains.remove(&id);
            self.chain_order.retain(|c| *c != id);
        } else {
            chain.status = Status::PendingDelete;
        }
        self.collect_anonymous_sets();
    }

    pub fn add_set(&mut self, mut spec: SetSpec, elements: Vec<SetElem>) -> SetId {
        if spec.anonymous {
            spec.name = format!("__set{}", self.next_anon);
            self.next_anon += 1;
        }
        for elem in &elements {
            self.check_elem_len(&spec, elem);
        }
        let id = SetId(self.next_id());
        self.sets.insert(
            id,
            SetState {
                spec,
                status: Status::PendingAdd,
                live: Vec::new(),
                pending_add: elements,
                pending_del: Vec::new(),
            },
        );
        self.set_order.push(id);
        id
    }

    pub fn del_set(&mut self, id: SetId) {
        let Some(set) = self.sets.get_mut(&id) else {
            panic!("deleting unknown set");
        };
        if set.status == Status::PendingAdd {
            self.sets.remove(&id);
            self.set_order.retain(|s| *s != id);
        } else {
            set.status = Status::PendingDelete;
        }
    }

    pub fn set_add_elements(&mut self, id: SetId, elements: Vec<SetElem>) {
        let Some(set) = self.sets.get_mut(&id) else {
            panic!("adding elements to unknown set");
        };
        for elem in &elements {
            Self::check_elem_len_of(&set.spec, elem);
        }
        set.pending_add.extend(elements);
    }

    /// Removes elements by key. An element that was staged but never
    /// committed is simply unstaged.
    pub fn set_delete_elements(&mut self, id: SetId, elements: Vec<SetElem>) {
        let Some(set) = self.sets.get_mut(&id) else {
            panic!("deleting elements from unknown set");
        };
        for elem in elements {
            if let Some(i) = set.pending_add.iter().position(|e| e.same_key(&elem)) {
                set.pending_add.remove(i);
            } else {
                set.pending_del.push(elem);
            }
        }
    }

    pub fn add_rule(&mut self, chain: ChainId, exprs: Vec<Expr>) -> RuleId {
        self.stage_rule(chain, exprs, false)
    }

    /// Adds a rule at the head of the chain.
    pub fn insert_rule(&mut self, chain: ChainId, exprs: Vec<Expr>) -> RuleId {
        self.stage_rule(chain, exprs, true)
    }

    fn stage_rule(&mut self, chain: ChainId, exprs: Vec<Expr>, inserted: bool) -> RuleId {
        let id = RuleId(self.next_id());
        let Some(ch) = self.chains.get_mut(&chain) else {
            panic!("adding rule to unknown chain");
        };
        if inserted {
            ch.rules.insert(0, id);
        } else {
            ch.rules.push(id);
        }
        self.rules.insert(
            id,
            RuleState {
                chain,
                exprs,
                status: Status::PendingAdd,
                inserted,
                handles: [None; 2],
            },
        );
        id
    }

    pub fn del_rule(&mut self, id: RuleId) {
        let Some(rule) = self.rules.get_mut(&id) else {
            panic!("deleting unknown rule");
        };
        if rule.status == Status::PendingAdd {
            let chain = rule.chain;
            self.rules.remove(&id);
            if let Some(ch) = self.chains.get_mut(&chain) {
                ch.rules.retain(|r| *r != id);
            }
            self.collect_anonymous_sets();
        } else {
            rule.status = Status::PendingDelete;
        }
    }

    /// Drops anonymous sets no longer referenced by any staged rule; their
    /// kernel-side lifetime is bound to the referencing rules.
    fn collect_anonymous_sets(&mut self) {
        let mut referenced: Vec<SetId> = Vec::new();
        for rule in self.rules.values() {
            for expr in &rule.exprs {
                if let Expr::Lookup { set, .. } = expr {
                    referenced.push(*set);
                }
            }
        }
        let dead: Vec<SetId> = self
            .sets
            .iter()
            .filter(|&(id, set)| set.spec.anonymous && !referenced.contains(id))
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            self.sets.remove(id);
        }
        self.set_order.retain(|id| !dead.contains(id));
    }

    /// Commits all staged operations atomically.
    pub fn flush(&mut self) -> Result<()> {
        let batch = self.build_batch()?;
        if batch.ops.is_empty() {
            return Ok(());
        }
        tracing::debug!(ops = batch.ops.len(), "Committing ruleset transaction");
        let applied = self
            .backend
            .apply(&batch)
            .context("committing ruleset transaction")?;
        self.commit(applied);
        Ok(())
    }

    fn check_elem_len(&self, spec: &SetSpec, elem: &SetElem) {
        Self::check_elem_len_of(spec, elem)
    }

    fn check_elem_len_of(spec: &SetSpec, elem: &SetElem) {
        let valid = Family::ALL
            .iter()
            .any(|f| elem.key.len() == spec.key.len(*f));
        if !valid {
            panic!(
                "set element key length {} fits neither family of {:?}",
                elem.key.len(),
                spec.key
            );
        }
        if let Some(end) = &elem.key_end {
            if end.len() != elem.key.len() {
                panic!("set element bounds differ in length");
            }
        }
    }

    /// The elements of `elems` belonging to `family`, splitting by key
    /// length where the families' key layouts differ.
    fn elems_for(spec: &SetSpec, elems: &[SetElem], family: Family) -> Vec<SetElem> {
        if !spec.key.split() {
            return elems.to_vec();
        }
        let len = spec.key.len(family);
        elems
            .iter()
            .filter(|e| e.key.len() == len)
            .cloned()
            .collect()
    }

    fn set_ref(&self, id: SetId, family: Family) -> SetRef {
        let set = self.sets.get(&id).expect("rule references unknown set");
        let elements = if set.spec.anonymous {
            let mut all = set.live.clone();
            all.extend(set.pending_add.iter().cloned());
            Self::elems_for(&set.spec, &all, family)
        } else {
            Vec::new()
        };
        SetRef {
            spec: set.spec.clone(),
            elements,
        }
    }

    /// Builds the batch covering every pending transition.
    ///
    /// All removals precede all additions: a torn-down-and-recompiled
    /// policy re-creates chains and sets under their old names within one
    /// transaction, so the old objects must be gone first. Within each
    /// phase, rules go before the elements referencing their chains, which
    /// go before the chains, which go before the sets their rules use.
    fn build_batch(&self) -> Result<Batch> {
        let mut ops = Vec::new();

        for stale in &self.stale_tables {
            ops.push(Op::DelTable {
                family: stale.family,
                name: stale.name.clone(),
            });
        }
        if !self.table_live {
            for family in Family::ALL {
                ops.push(Op::AddTable {
                    family,
                    name: self.table.clone(),
                });
            }
        }

        for (id, rule) in &self.rules {
            if rule.status != Status::PendingDelete {
                continue;
            }
            let chain = &self.chains[&rule.chain];
            if chain.status == Status::PendingDelete {
                // The chain deletion takes the rule with it.
                continue;
            }
            for family in Family::ALL {
                let handle = rule.handles[family.index()]
                    .with_context(|| format!("rule {:?} has no kernel handle", id))?;
                ops.push(Op::DelRule {
                    family,
                    table: self.table.clone(),
                    chain: chain.spec.name.clone(),
                    handle,
                });
            }
        }

        for id in &self.set_order {
            let set = &self.sets[id];
            if set.status != Status::Live || set.spec.anonymous {
                continue;
            }
            for family in Family::ALL {
                let del = Self::elems_for(&set.spec, &set.pending_del, family);
                if !del.is_empty() {
                    ops.push(Op::DelElements {
                        family,
                        table: self.table.clone(),
                        set: set.spec.clone(),
                        elements: del,
                    });
                }
            }
        }

        for id in &self.chain_order {
            let chain = &self.chains[id];
            if chain.status == Status::PendingDelete {
                for family in Family::ALL {
                    ops.push(Op::DelChain {
                        family,
                        table: self.table.clone(),
                        name: chain.spec.name.clone(),
                    });
                }
            }
        }

        for id in &self.set_order {
            let set = &self.sets[id];
            if set.status == Status::PendingDelete && !set.spec.anonymous {
                for family in Family::ALL {
                    ops.push(Op::DelSet {
                        family,
                        table: self.table.clone(),
                        name: set.spec.name.clone(),
                    });
                }
            }
        }

        for id in &self.chain_order {
            let chain = &self.chains[id];
            if chain.status == Status::PendingAdd {
                for family in Family::ALL {
                    ops.push(Op::AddChain {
                        family,
                        table: self.table.clone(),
                        chain: chain.spec.clone(),
                    });
                }
            }
        }

        for id in &self.set_order {
            let set = &self.sets[id];
            if set.status == Status::PendingAdd && !set.spec.anonymous {
                for family in Family::ALL {
                    ops.push(Op::AddSet {
                        family,
                        table: self.table.clone(),
                        set: set.spec.clone(),
                        elements: Self::elems_for(&set.spec, &set.pending_add, family),
                    });
                }
            }
        }

        for id in &self.set_order {
            let set = &self.sets[id];
            if set.status != Status::Live || set.spec.anonymous {
                continue;
            }
            for family in Family::ALL {
                let add = Self::elems_for(&set.spec, &set.pending_add, family);
                if !add.is_empty() {
                    ops.push(Op::AddElements {
                        family,
                        table: self.table.clone(),
                        set: set.spec.clone(),
                        elements: add,
                    });
                }
            }
        }

        for id in &self.chain_order {
            let chain = &self.chains[id];
            match chain.status {
                Status::PendingDelete => continue,
                Status::PendingAdd => {
                    for rule_id in &chain.rules {
                        self.push_rule_ops(&mut ops, chain, *rule_id, false);
                    }
                }
                Status::Live => {
                    // Inserted rules sit before live ones; emitting them in
                    // reverse restores their relative order under repeated
                    // head insertion.
                    let inserted: Vec<RuleId> = chain
                        .rules
                        .iter()
                        .copied()
                        .filter(|r| {
                            let rule = &self.rules[r];
                            rule.status == Status::PendingAdd && rule.inserted
                        })
                        .collect();
                    for rule_id in inserted.into_iter().rev() {
                        self.push_rule_ops(&mut ops, chain, rule_id, true);
                    }
                    for rule_id in &chain.rules {
                        let rule = &self.rules[rule_id];
                        if rule.status == Status::PendingAdd && !rule.inserted {
                            self.push_rule_ops(&mut ops, chain, *rule_id, false);
                        }
                    }
                }
            }
        }

        Ok(Batch { ops })
    }

    fn push_rule_ops(&self, ops: &mut Vec<Op>, chain: &ChainState, id: RuleId, insert: bool) {
        let rule = &self.rules[&id];
        for family in Family::ALL {
            let exprs = rule
                .exprs
                .iter()
                .map(|e| e.lower(family, &|set, family| self.set_ref(set, family)))
                .collect();
            ops.push(Op::AddRule {
                family,
                table: self.table.clone(),
                chain: chain.spec.name.clone(),
                id,
                insert,
                exprs,
            });
        }
    }

    fn commit(&mut self, applied: Applied) {
        for (id, family, handle) in applied.rule_handles {
            if let Some(rule) = self.rules.get_mut(&id) {
                rule.handles[family.index()] = Some(handle);
            }
        }

        self.stale_tables.clear();
        self.table_live = true;

        let dead_rules: Vec<RuleId> = self
            .rules
            .iter()
            .filter(|(_, r)| r.status == Status::PendingDelete)
            .map(|(id, _)| *id)
            .collect();
        for id in dead_rules {
            let rule = self.rules.remove(&id).unwrap();
            if let Some(chain) = self.chains.get_mut(&rule.chain) {
                chain.rules.retain(|r| *r != id);
            }
        }
        for rule in self.rules.values_mut() {
            rule.status = Status::Live;
        }

        let dead_chains: Vec<ChainId> = self
            .chains
            .iter()
            .filter(|(_, c)| c.status == Status::PendingDelete)
            .map(|(id, _)| *id)
            .collect();
        for id in dead_chains {
            self.chains.remove(&id);
            self.chain_order.retain(|c| *c != id);
        }
        for chain in self.chains.values_mut() {
            chain.status = Status::Live;
        }

        let dead_sets: Vec<SetId> = self
            .sets
            .iter()
            .filter(|(_, s)| s.status == Status::PendingDelete)
            .map(|(id, _)| *id)
            .collect();
        for id in dead_sets {
            self.sets.remove(&id);
            self.set_order.retain(|s| *s != id);
        }
        for set in self.sets.values_mut() {
            set.status = Status::Live;
            set.live.append(&mut set.pending_add);
            for del in set.pending_del.drain(..) {
                if let Some(i) = set.live.iter().position(|e| e.same_key(&del)) {
                    set.live.remove(i);
                }
            }
        }

        self.collect_anonymous_sets();
    }
}
