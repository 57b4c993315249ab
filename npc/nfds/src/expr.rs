//! The rule expression IR.
//!
//! Rules are staged family-agnostic: address loads and rejects carry only
//! their intent, and [`Expr::lower`] resolves them to concrete payload
//! offsets and ICMP codes per family. Both sequences must compile
//! identically for v4 and v6 apart from those resolved values.

use crate::conn::{SetElem, SetId, SetSpec};
use crate::Family;

/// A family-agnostic rule expression, as staged by the compiler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    /// Loads the packet's L3 source or destination address into `dreg`.
    LoadAddr { src: bool, dreg: u32 },
    /// Loads raw packet bytes into `dreg`. Offsets and lengths are in bytes.
    Payload {
        base: PayloadBase,
        offset: u32,
        len: u32,
        dreg: u32,
    },
    Meta { key: MetaKey, dreg: u32 },
    Cmp { op: CmpOp, sreg: u32, data: Vec<u8> },
    Bitwise {
        sreg: u32,
        dreg: u32,
        len: u32,
        mask: Vec<u8>,
        xor: Vec<u8>,
    },
    Ct { key: CtKey, dreg: u32 },
    /// Looks the key registers up in a set. With `verdict_to` set, the match
    /// extracts the element's verdict (a verdict-map lookup).
    Lookup {
        set: SetId,
        sreg: u32,
        verdict_to: Option<u32>,
        invert: bool,
    },
    Verdict(Verdict),
    /// ICMP destination-unreachable, administratively prohibited.
    RejectAdmin,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PayloadBase {
    Network,
    Transport,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MetaKey {
    L4Proto,
    IifGroup,
    OifGroup,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CtKey {
    State,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Jump(String),
}

/// A family-resolved expression, ready for a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoweredExpr {
    Payload {
        base: PayloadBase,
        offset: u32,
        len: u32,
        dreg: u32,
    },
    Meta { key: MetaKey, dreg: u32 },
    Cmp { op: CmpOp, sreg: u32, data: Vec<u8> },
    Bitwise {
        sreg: u32,
        dreg: u32,
        len: u32,
        mask: Vec<u8>,
        xor: Vec<u8>,
    },
    Ct { key: CtKey, dreg: u32 },
    Lookup {
        set: SetRef,
        sreg: u32,
        verdict_to: Option<u32>,
        invert: bool,
    },
    Verdict(Verdict),
    Reject { code: u8 },
}

/// A set as referenced by a lowered rule. Anonymous sets carry their
/// family-filtered contents inline since they have no standalone lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetRef {
    pub spec: SetSpec,
    pub elements: Vec<SetElem>,
}

// === impl Expr ===

impl Expr {
    /// Resolves the family-dependent parts of the expression. The `set`
    /// callback resolves a staged set id to its reference.
    pub(crate) fn lower(&self, family: Family, set: &impl Fn(SetId, Family) -> SetRef) -> LoweredExpr {
        match self {
            Expr::LoadAddr { src, dreg } => {
                let (offset, len) = match (family, src) {
                    (Family::V4, true) => (12, 4),
                    (Family::V4, false) => (16, 4),
                    (Family::V6, true) => (8, 16),
                    (Family::V6, false) => (24, 16),
                };
                LoweredExpr::Payload {
                    base: PayloadBase::Network,
                    offset,
                    len,
                    dreg: *dreg,
                }
            }
            Expr::Payload {
                base,
                offset,
                len,
                dreg,
            } => LoweredExpr::Payload {
                base: *base,
                offset: *offset,
                len: *len,
                dreg: *dreg,
            },
            Expr::Meta { key, dreg } => LoweredExpr::Meta {
                key: *key,
                dreg: *dreg,
            },
            Expr::Cmp { op, sreg, data } => LoweredExpr::Cmp {
                op: *op,
                sreg: *sreg,
                data: data.clone(),
            },
            Expr::Bitwise {
                sreg,
                dreg,
                len,
                mask,
                xor,
            } => LoweredExpr::Bitwise {
                sreg: *sreg,
                dreg: *dreg,
                len: *len,
                mask: mask.clone(),
                xor: xor.clone(),
            },
            Expr::Ct { key, dreg } => LoweredExpr::Ct {
                key: *key,
                dreg: *dreg,
            },
            Expr::Lookup {
                set: id,
                sreg,
                verdict_to,
                invert,
            } => LoweredExpr::Lookup {
                set: set(*id, family),
                sreg: *sreg,
                verdict_to: *verdict_to,
                invert: *invert,
            },
            Expr::Verdict(v) => LoweredExpr::Verdict(v.clone()),
            Expr::RejectAdmin => LoweredExpr::Reject {
                code: match family {
                    Family::V4 => 13,
                    Family::V6 => 1,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_loads_resolve_per_family() {
        let no_sets = |_: SetId, _: Family| unreachable!("no set lookups");
        for (family, src, offset, len) in [
            (Family::V4, true, 12, 4),
            (Family::V4, false, 16, 4),
            (Family::V6, true, 8, 16),
            (Family::V6, false, 24, 16),
        ] {
            let lowered = Expr::LoadAddr { src, dreg: 9 }.lower(family, &no_sets);
            assert_eq!(
                lowered,
                LoweredExpr::Payload {
                    base: PayloadBase::Network,
                    offset,
                    len,
                    dreg: 9
                }
            );
        }
    }

    #[test]
    fn reject_codes_resolve_per_family() {
        let no_sets = |_: SetId, _: Family| unreachable!("no set lookups");
        assert_eq!(
            Expr::RejectAdmin.lower(Family::V4, &no_sets),
            LoweredExpr::Reject { code: 13 }
        );
        assert_eq!(
            Expr::RejectAdmin.lower(Family::V6, &no_sets),
            LoweredExpr::Reject { code: 1 }
        );
    }
}
