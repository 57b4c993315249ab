//! Dual-family nftables ruleset transactions.
//!
//! The controller's compiler works against a single logical ruleset; this
//! crate maintains that ruleset as a pair of identically-shaped tables, one
//! per IP family. Every chain, set, rule, and element operation is staged
//! for both families in lockstep, with set elements split between the
//! families by key length. Staged work is committed atomically by a
//! [`Backend`]; a failed commit leaves the stage untouched so a retry
//! re-emits the same transaction.
//!
//! Two backends ship with the crate: [`memory::MemoryBackend`], a kernel
//! model used as a test oracle, and [`nft::NftBackend`], which drives the
//! `nft` binary with libnftables-JSON batches.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod backend;
mod conn;
pub mod expr;
pub mod memory;
pub mod nft;

pub use self::backend::{Applied, Backend, Batch, Op, TableRef};
pub use self::conn::{
    ChainId, ChainSpec, Conn, Hook, HookPoint, RuleId, SetData, SetElem, SetId, SetKey, SetSpec,
    PRIORITY_SELINUX_LAST,
};
pub use self::expr::{CmpOp, CtKey, Expr, LoweredExpr, MetaKey, PayloadBase, SetRef, Verdict};

/// An IP family. The two families are maintained in lockstep.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}

// === impl Family ===

impl Family {
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    pub fn index(self) -> usize {
        match self {
            Family::V4 => 0,
            Family::V6 => 1,
        }
    }

    /// The nftables family name.
    pub fn name(self) -> &'static str {
        match self {
            Family::V4 => "ip",
            Family::V6 => "ip6",
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name().fmt(f)
    }
}

/// Transport protocol numbers used in set keys and compares.
pub mod proto {
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const SCTP: u8 = 132;
}

/// Conntrack state bits, as used by the established/related fast path.
pub mod ct_state {
    pub const ESTABLISHED: u32 = 0x2;
    pub const RELATED: u32 = 0x4;
}
