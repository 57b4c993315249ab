use crate::conn::{ChainSpec, RuleId, SetElem, SetSpec};
use crate::expr::LoweredExpr;
use crate::Family;
use anyhow::Result;

/// Commits staged transactions to a concrete ruleset store.
///
/// A batch is applied atomically: either every operation takes effect or
/// none does. Implementations receive fully family-resolved operations.
pub trait Backend: Send {
    /// Lists the tables currently present, across both families.
    fn list_tables(&mut self) -> Result<Vec<TableRef>>;

    /// Applies a batch atomically, returning the kernel handles assigned to
    /// newly created rules.
    fn apply(&mut self, batch: &Batch) -> Result<Applied>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableRef {
    pub family: Family,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct Batch {
    pub ops: Vec<Op>,
}

#[derive(Clone, Debug)]
pub enum Op {
    DelTable {
        family: Family,
        name: String,
    },
    AddTable {
        family: Family,
        name: String,
    },
    AddChain {
        family: Family,
        table: String,
        chain: ChainSpec,
    },
    /// Deletes a chain along with any rules still in it.
    DelChain {
        family: Family,
        table: String,
        name: String,
    },
    AddSet {
        family: Family,
        table: String,
        set: SetSpec,
        elements: Vec<SetElem>,
    },
    DelSet {
        family: Family,
        table: String,
        name: String,
    },
    AddElements {
        family: Family,
        table: String,
        set: SetSpec,
        elements: Vec<SetElem>,
    },
    DelElements {
        family: Family,
        table: String,
        set: SetSpec,
        elements: Vec<SetElem>,
    },
    AddRule {
        family: Family,
        table: String,
        chain: String,
        id: RuleId,
        /// Inserts at the head of the chain instead of appending.
        insert: bool,
        exprs: Vec<LoweredExpr>,
    },
    DelRule {
        family: Family,
        table: String,
        chain: String,
        handle: u64,
    },
}

/// The results of a successfully applied batch.
#[derive(Debug, Default)]
pub struct Applied {
    /// Kernel handles for the rules created by the batch.
    pub rule_handles: Vec<(RuleId, Family, u64)>,
}
