//! The event coordinator and root ruleset layout.

use crate::events::EventSink;
use crate::exprs::{self, Direction, NEW_REG_OFFSET};
use crate::namespace::Namespace;
use crate::pod::Pod;
use crate::policy::{Policy, Rule, RuleKey};
use ahash::AHashMap as HashMap;
use anyhow::Result;
use k8s_nft_npc_k8s::{ObjectMeta, ObjectName};
use k8s_nft_npc_nfds::{
    ct_state, Backend, ChainSpec, CmpOp, Conn, CtKey, Expr, HookPoint, MetaKey, SetData, SetId,
    SetKey, SetSpec, Verdict, PRIORITY_SELINUX_LAST,
};

pub const TABLE_NAME: &str = "k8s-nft-npc";

/// Holds all indexing state: the reference graph between policies, rules,
/// pods, and namespaces, plus the staged ruleset transaction. Owned and
/// updated by a single worker loop; between events the caller commits the
/// staged transaction with [`Index::flush`].
pub struct Index {
    pub(crate) conn: Conn,
    pub(crate) vmap_ing: SetId,
    pub(crate) vmap_eg: SetId,

    pub(crate) nwps: HashMap<ObjectName, Policy>,
    pub(crate) rules: HashMap<RuleKey, Rule>,
    pub(crate) pods: HashMap<ObjectName, Pod>,
    pub(crate) namespaces: HashMap<String, Namespace>,

    pub(crate) events: Box<dyn EventSink + Send>,

    next_rule_key: u64,
}

// === impl Index ===

impl Index {
    /// Opens the backend and stages the root ruleset layout: both hook
    /// chains with their conntrack fast path, the verdict maps, and the
    /// replacement of any stale tables left over from a previous run.
    /// Nothing reaches the kernel until the first [`Index::flush`].
    pub fn new(
        backend: Box<dyn Backend>,
        events: Box<dyn EventSink + Send>,
        pod_iface_group: u32,
    ) -> Result<Self> {
        let mut conn = Conn::open(backend, TABLE_NAME)?;

        let hook_ing = conn.add_chain(ChainSpec::hooked(
            "filter_hook_ing",
            HookPoint::Forward,
            // Hook traffic after IPVS and other shenanigans.
            PRIORITY_SELINUX_LAST,
        ));
        conn.add_rule(hook_ing, ct_fast_path());
        let vmap_ing = conn.add_set(
            SetSpec {
                name: "vmap_ing".to_string(),
                is_map: true,
                key: SetKey::Addr,
                data: Some(SetData::Verdict),
                ..SetSpec::default()
            },
            Vec::new(),
        );
        let mut dispatch = Vec::new();
        if pod_iface_group != 0 {
            dispatch.extend(iface_group_match(MetaKey::OifGroup, pod_iface_group));
        }
        // Traffic into a pod is keyed by its destination address.
        dispatch.push(exprs::load_ip(Direction::Egress, 0));
        dispatch.push(exprs::lookup_vmap(vmap_ing, 0));
        conn.add_rule(hook_ing, dispatch);

        let hook_eg = conn.add_chain(ChainSpec::hooked(
            "filter_hook_eg",
            HookPoint::Forward,
            PRIORITY_SELINUX_LAST,
        ));
        conn.add_rule(hook_eg, ct_fast_path());
        let vmap_eg = conn.add_set(
            SetSpec {
                name: "vmap_eg".to_string(),
                is_map: true,
                key: SetKey::Addr,
                data: Some(SetData::Verdict),
                ..SetSpec::default()
            },
            Vec::new(),
        );
        let mut dispatch = Vec::new();
        if pod_iface_group != 0 {
            dispatch.extend(iface_group_match(MetaKey::IifGroup, pod_iface_group));
        }
        dispatch.push(exprs::load_ip(Direction::Ingress, 0));
        dispatch.push(exprs::lookup_vmap(vmap_eg, 0));
        conn.add_rule(hook_eg, dispatch);

        Ok(Self {
            conn,
            vmap_ing,
            vmap_eg,
            nwps: HashMap::default(),
            rules: HashMap::default(),
            pods: HashMap::default(),
            namespaces: HashMap::default(),
            events,
            next_rule_key: 0,
        })
    }

    /// Commits the staged ruleset transaction atomically.
    pub fn flush(&mut self) -> Result<()> {
        self.conn.flush()
    }

    pub(crate) fn next_rule_key(&mut self) -> RuleKey {
        let key = RuleKey(self.next_rule_key);
        self.next_rule_key += 1;
        key
    }
}

/// Accepts packets of established or related connections.
fn ct_fast_path() -> Vec<Expr> {
    let mask = ct_state::ESTABLISHED | ct_state::RELATED;
    vec![
        Expr::Ct {
            key: CtKey::State,
            dreg: NEW_REG_OFFSET + 1,
        },
        Expr::Bitwise {
            sreg: NEW_REG_OFFSET + 1,
            dreg: NEW_REG_OFFSET + 1,
            len: 4,
            mask: mask.to_ne_bytes().to_vec(),
            xor: 0u32.to_ne_bytes().to_vec(),
        },
        Expr::Cmp {
            op: CmpOp::Neq,
            sreg: NEW_REG_OFFSET + 1,
            data: 0u32.to_ne_bytes().to_vec(),
        },
        Expr::Verdict(Verdict::Accept),
    ]
}

/// Restricts a hook chain to the operator-configured pod-facing interface
/// group.
fn iface_group_match(key: MetaKey, group: u32) -> Vec<Expr> {
    vec![
        Expr::Meta {
            key,
            dreg: NEW_REG_OFFSET,
        },
        Expr::Cmp {
            op: CmpOp::Eq,
            sreg: NEW_REG_OFFSET,
            data: group.to_ne_bytes().to_vec(),
        },
    ]
}

/// An identifier for a Kubernetes object usable in chain and set names.
///
/// nftables names are limited to 256 bytes; when namespace and name
/// combined would no longer leave room, the object UID is used instead.
pub(crate) fn object_id(meta: &ObjectMeta) -> String {
    let namespace = meta.namespace.as_deref().unwrap_or_default();
    let name = meta.name.as_deref().unwrap_or_default();
    if namespace.len() + 1 + name.len() > 128 {
        return meta.uid.clone().unwrap_or_default();
    }
    format!("{}_{}", namespace, name)
}
