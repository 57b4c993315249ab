//! Expression builders shared by the compiler and the engine.

use k8s_nft_npc_nfds::{Expr, SetId};

/// Base offset keeping our registers clear of any preserved ones.
pub(crate) const NEW_REG_OFFSET: u32 = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Ingress,
    Egress,
}

/// Loads the IP address in the relevant direction (source for ingress,
/// destination for egress) into the given register.
pub(crate) fn load_ip(dir: Direction, reg: u32) -> Expr {
    Expr::LoadAddr {
        src: dir == Direction::Ingress,
        dreg: NEW_REG_OFFSET + reg,
    }
}

/// Loads the 16-bit transport destination port into the given register.
pub(crate) fn load_dst_port(reg: u32) -> Expr {
    Expr::Payload {
        base: k8s_nft_npc_nfds::PayloadBase::Transport,
        offset: 2,
        len: 2,
        dreg: NEW_REG_OFFSET + reg,
    }
}

/// Loads the L4 protocol into the given register.
pub(crate) fn load_l4proto(reg: u32) -> Expr {
    Expr::Meta {
        key: k8s_nft_npc_nfds::MetaKey::L4Proto,
        dreg: NEW_REG_OFFSET + reg,
    }
}

/// ICMP destination-unreachable, communication administratively prohibited.
pub(crate) fn reject_administrative() -> Expr {
    Expr::RejectAdmin
}

/// Matches the key registers against a named or anonymous set.
pub(crate) fn lookup(set: SetId, reg: u32) -> Expr {
    Expr::Lookup {
        set,
        sreg: NEW_REG_OFFSET + reg,
        verdict_to: None,
        invert: false,
    }
}

/// Looks the key register up in a verdict map, executing the verdict.
pub(crate) fn lookup_vmap(set: SetId, reg: u32) -> Expr {
    Expr::Lookup {
        set,
        sreg: NEW_REG_OFFSET + reg,
        verdict_to: Some(0),
        invert: false,
    }
}
