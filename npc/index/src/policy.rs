//! NetworkPolicy compilation.
//!
//! A policy compiles into up to two per-policy chains plus one [`Rule`] per
//! ingress/egress entry. Peer `ipBlock`s lower into anonymous constant
//! interval sets, numbered ports into compare expressions or an anonymous
//! (proto, service) interval set, and peer selectors into a named pod-IP
//! set that starts empty; the reference-tracking engine populates it as
//! pods come and go. Per-peer and per-port validation failures surface as
//! cluster events and never abort the rest of the policy.

use crate::events::{ClusterEvent, ObjectRef};
use crate::exprs::{self, Direction, NEW_REG_OFFSET};
use crate::index::{object_id, Index};
use crate::namespace::Namespace;
use crate::pod::{add_pod_nwp, add_pod_rule, ip_bytes, Pod};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ipnet::IpNet;
use k8s_nft_npc_k8s::{self as k8s, labels::Selector, IntOrString, ObjectName};
use k8s_nft_npc_nfds::{
    proto, ChainId, ChainSpec, CmpOp, Expr, SetElem, SetId, SetKey, SetSpec, Verdict,
};
use k8s_nft_npc_ranges::{Key, Range, RangeSet};
use std::net::IpAddr;

/// Stable identity of a compiled rule for the lifetime of its policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct RuleKey(pub(crate) u64);

/// A chain owned by a policy or pod, remembered by name for jump targets.
#[derive(Clone, Debug)]
pub(crate) struct OwnedChain {
    pub(crate) id: ChainId,
    pub(crate) name: String,
}

pub(crate) struct Policy {
    pub(crate) namespace: String,
    pub(crate) id: String,
    pub(crate) pod_selector: Selector,
    pub(crate) ingress_rules: Vec<RuleKey>,
    pub(crate) egress_rules: Vec<RuleKey>,
    pub(crate) ingress_chain: Option<OwnedChain>,
    pub(crate) egress_chain: Option<OwnedChain>,
    /// Pods currently selected by this policy.
    pub(crate) pod_refs: HashSet<ObjectName>,
}

pub(crate) struct Rule {
    pub(crate) namespace: String,
    pub(crate) peer_selectors: Vec<PeerSelector>,
    pub(crate) pod_ip_set: Option<SetId>,
    pub(crate) named_ports: Vec<NamedPortRequest>,
    pub(crate) named_port_set: Option<SetId>,
    /// Pods currently contributing elements to this rule's sets.
    pub(crate) pod_refs: HashSet<ObjectName>,
}

/// One peer population: a namespace selector (`None` meaning the policy's
/// own namespace) and a pod selector.
pub(crate) struct PeerSelector {
    pub(crate) namespace: Option<Selector>,
    pub(crate) pod: Selector,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct NamedPortRequest {
    pub(crate) name: String,
    pub(crate) protocol: u8,
}

#[derive(Copy, Clone, Debug)]
struct NumberedPortRange {
    protocol: u8,
    port: u16,
    end_port: u16,
}

// === impl Rule ===

impl Rule {
    pub(crate) fn selects(&self, pod: &Pod, namespaces: &HashMap<String, Namespace>) -> bool {
        for sel in &self.peer_selectors {
            if sel.matches(pod, &self.namespace, namespaces) {
                return true;
            }
        }
        // Rules with named ports but no peer restriction select all pods.
        self.peer_selectors.is_empty() && self.named_port_set.is_some()
    }
}

// === impl PeerSelector ===

impl PeerSelector {
    fn matches(
        &self,
        pod: &Pod,
        rule_namespace: &str,
        namespaces: &HashMap<String, Namespace>,
    ) -> bool {
        match &self.namespace {
            None => {
                if rule_namespace != pod.namespace {
                    return false;
                }
            }
            Some(ns_selector) => {
                let Some(ns) = namespaces.get(&pod.namespace) else {
                    return false;
                };
                if !ns_selector.matches(&ns.labels) {
                    return false;
                }
            }
        }
        self.pod.matches(&pod.labels)
    }
}

// === impl NumberedPortRange ===

impl NumberedPortRange {
    fn needs_interval(&self) -> bool {
        self.port != self.end_port && !(self.port == 0 && self.end_port == u16::MAX)
    }
}

pub(crate) fn parse_protocol(protocol: &str) -> Option<u8> {
    match protocol {
        "TCP" => Some(proto::TCP),
        "UDP" => Some(proto::UDP),
        "SCTP" => Some(proto::SCTP),
        _ => None,
    }
}

fn prefix_to_range(net: &IpNet) -> Range<IpAddr> {
    Range {
        start: net.network(),
        end: net.broadcast(),
    }
}

/// Lowers an inclusive address range to interval set elements: the start
/// key and the exclusive end marker.
fn range_to_interval(range: &Range<IpAddr>) -> [SetElem; 2] {
    [
        SetElem::key(ip_bytes(&range.start)),
        SetElem::interval_end(ip_bytes(&range.end.closest(false))),
    ]
}

/// The (proto, service) concatenation key: one protocol byte and a
/// big-endian port, each padded to four bytes.
fn proto_service_key(protocol: u8, port: u16) -> Vec<u8> {
    let mut key = vec![protocol, 0, 0, 0, 0, 0, 0, 0];
    key[4..6].copy_from_slice(&port.to_be_bytes());
    key
}

// === impl Index ===

impl Index {
    /// Compiles one ingress/egress entry into the policy chain.
    fn create_peers(
        &mut self,
        chain: ChainId,
        peers: &[k8s::NetworkPolicyPeer],
        ports: &[k8s::NetworkPolicyPort],
        prefix: &str,
        dir: Direction,
        obj: &ObjectRef,
        policy_namespace: &str,
    ) -> Rule {
        let mut meta = Rule {
            namespace: policy_namespace.to_string(),
            peer_selectors: Vec::new(),
            pod_ip_set: None,
            named_ports: Vec::new(),
            named_port_set: None,
            pod_refs: HashSet::new(),
        };

        let mut ip_ranges_permitted: RangeSet<IpAddr> = RangeSet::new();

        for peer in peers {
            if let Some(ip_block) = &peer.ip_block {
                if peer.namespace_selector.is_some() {
                    self.events.record(ClusterEvent::warning(
                        obj.clone(),
                        "InvalidPeer",
                        "ipBlock cannot be combined with namespaceSelector, ignoring".to_string(),
                    ));
                    continue;
                }
                if peer.pod_selector.is_some() {
                    self.events.record(ClusterEvent::warning(
                        obj.clone(),
                        "InvalidPeer",
                        "ipBlock cannot be combined with podSelector, ignoring".to_string(),
                    ));
                    continue;
                }
                let block: IpNet = match ip_block.cidr.parse() {
                    Ok(block) => block,
                    Err(error) => {
                        self.events.record(ClusterEvent::warning(
                            obj.clone(),
                            "InvalidPeer",
                            format!("ipBlock CIDR invalid: {}", error),
                        ));
                        continue;
                    }
                };
                let mut this_block: RangeSet<IpAddr> = RangeSet::new();
                this_block.add(prefix_to_range(&block));
                for except in ip_block.except.iter().flatten() {
                    let excluded: IpNet = match except.parse() {
                        Ok(excluded) => excluded,
                        Err(error) => {
                            self.events.record(ClusterEvent::warning(
                                obj.clone(),
                                "InvalidPeer",
                                format!("ipBlock except value {:?} invalid: {}", except, error),
                            ));
                            continue;
                        }
                    };
                    if !block.contains(&excluded.network()) || !block.contains(&excluded.broadcast())
                    {
                        self.events.record(ClusterEvent::normal(
                            obj.clone(),
                            "SuspiciousIPBlock",
                            format!("ipBlock except value {:?} is not contained in parent", except),
                        ));
                    }
                    this_block.subtract(prefix_to_range(&excluded));
                }
                for range in this_block.iter() {
                    ip_ranges_permitted.add(range);
                }
                continue;
            }

            let namespace_selector = match &peer.namespace_selector {
                None => None,
                Some(selector) => match Selector::from_label_selector(selector) {
                    Ok(selector) => Some(selector),
                    Err(error) => {
                        self.events.record(ClusterEvent::warning(
                            obj.clone(),
                            "InvalidPeer",
                            format!("namespaceSelector invalid: {}", error),
                        ));
                        continue;
                    }
                },
            };
            let pod_selector = match &peer.pod_selector {
                None => None,
                Some(selector) => match Selector::from_label_selector(selector) {
                    Ok(selector) => Some(selector),
                    Err(error) => {
                        self.events.record(ClusterEvent::warning(
                            obj.clone(),
                            "InvalidPeer",
                            format!("podSelector invalid: {}", error),
                        ));
                        continue;
                    }
                },
            };
            // Skip peers which match nothing. A namespace selector with no
            // pod selector matches all pods of the selected namespaces.
            match (namespace_selector, pod_selector) {
                (None, None) => {}
                (namespace, pod) => meta.peer_selectors.push(PeerSelector {
                    namespace,
                    pod: pod.unwrap_or_default(),
                }),
            }
        }

        let mut dyn_ports: Vec<NamedPortRequest> = Vec::new();
        let mut port_protos: Vec<NumberedPortRange> = Vec::new();
        for port in ports {
            // TCP is the default.
            let protocol = match port.protocol.as_deref() {
                None => proto::TCP,
                Some(protocol) => match parse_protocol(protocol) {
                    Some(protocol) => protocol,
                    None => {
                        self.events.record(ClusterEvent::warning(
                            obj.clone(),
                            "UnknownProtocol",
                            format!("port protocol {:?} unknown, ignoring port", protocol),
                        ));
                        continue;
                    }
                },
            };
            match &port.port {
                None => port_protos.push(NumberedPortRange {
                    protocol,
                    port: 0,
                    end_port: u16::MAX,
                }),
                Some(IntOrString::String(name)) => dyn_ports.push(NamedPortRequest {
                    name: name.clone(),
                    protocol,
                }),
                Some(IntOrString::Int(number)) => {
                    if *number < 0 || *number > u16::MAX as i32 {
                        self.events.record(ClusterEvent::warning(
                            obj.clone(),
                            "InvalidPort",
                            format!("port number {} is out of range, ignoring port", number),
                        ));
                        continue;
                    }
                    let start = *number as u16;
                    let mut end = start;
                    if let Some(end_port) = port.end_port {
                        if end_port < *number {
                            self.events.record(ClusterEvent::warning(
                                obj.clone(),
                                "InvalidPort",
                                format!(
                                    "end port {} is lower than start port {}, ignoring port range",
                                    end_port, number
                                ),
                            ));
                            continue;
                        }
                        if end_port > u16::MAX as i32 {
                            self.events.record(ClusterEvent::warning(
                                obj.clone(),
                                "InvalidPort",
                                format!("end port number {} is out of range, ignoring port", end_port),
                            ));
                            continue;
                        }
                        end = end_port as u16;
                    }
                    port_protos.push(NumberedPortRange {
                        protocol,
                        port: start,
                        end_port: end,
                    });
                }
            }
        }

        // Named ports first; they work differently from the rest of the
        // system, with membership maintained per pod.
        if !dyn_ports.is_empty() && (!meta.peer_selectors.is_empty() || peers.is_empty()) {
            let named_port_set = self.conn.add_set(
                SetSpec {
                    name: format!("{}_namedports", prefix),
                    concatenation: true,
                    key: SetKey::ProtoServiceAddr,
                    ..SetSpec::default()
                },
                Vec::new(),
            );
            meta.named_port_set = Some(named_port_set);
            meta.named_ports = dyn_ports;
            self.conn.add_rule(
                chain,
                vec![
                    exprs::load_l4proto(0),
                    exprs::load_dst_port(1),
                    exprs::load_ip(dir, 2),
                    exprs::lookup(named_port_set, 0),
                    Expr::Verdict(Verdict::Accept),
                ],
            );
        }

        if port_protos.is_empty() && !ports.is_empty() {
            // Only named ports were requested; numbered traffic handled by
            // the rest of this function has nothing to match.
            return meta;
        }

        let mut port_proto_exprs: Vec<Expr> = Vec::new();
        if !port_protos.is_empty() {
            if port_protos.len() == 1 && !port_protos[0].needs_interval() {
                // Shortcut for simple port restrictions.
                let p = port_protos[0];
                port_proto_exprs.push(exprs::load_l4proto(0));
                port_proto_exprs.push(Expr::Cmp {
                    op: CmpOp::Eq,
                    sreg: NEW_REG_OFFSET,
                    data: vec![p.protocol],
                });
                if p.port != 0 || p.end_port != u16::MAX {
                    port_proto_exprs.push(exprs::load_dst_port(1));
                    port_proto_exprs.push(Expr::Cmp {
                        op: CmpOp::Eq,
                        sreg: NEW_REG_OFFSET + 1,
                        data: p.port.to_be_bytes().to_vec(),
                    });
                }
            } else if !ip_ranges_permitted.is_empty()
                || !meta.peer_selectors.is_empty()
                || peers.is_empty()
            {
                // Set-based for complex port restrictions.
                let elements = port_protos
                    .iter()
                    .map(|p| {
                        SetElem::range(
                            proto_service_key(p.protocol, p.port),
                            proto_service_key(p.protocol, p.end_port),
                        )
                    })
                    .collect();
                let proto_port_set = self.conn.add_set(
                    SetSpec {
                        anonymous: true,
                        constant: true,
                        concatenation: true,
                        interval: true,
                        key: SetKey::ProtoService,
                        ..SetSpec::default()
                    },
                    elements,
                );
                port_proto_exprs = vec![
                    exprs::load_l4proto(0),
                    exprs::load_dst_port(1),
                    exprs::lookup(proto_port_set, 0),
                ];
            }
        }

        if !ip_ranges_permitted.is_empty() {
            let mut elements = Vec::new();
            for range in ip_ranges_permitted.iter() {
                elements.extend(range_to_interval(&range));
            }
            let ip_blocks_permitted_set = self.conn.add_set(
                SetSpec {
                    anonymous: true,
                    constant: true,
                    interval: true,
                    key: SetKey::Addr,
                    ..SetSpec::default()
                },
                elements,
            );
            let mut rule_exprs = vec![
                exprs::load_ip(dir, 0),
                exprs::lookup(ip_blocks_permitted_set, 0),
            ];
            rule_exprs.extend(port_proto_exprs.iter().cloned());
            rule_exprs.push(Expr::Verdict(Verdict::Accept));
            self.conn.add_rule(chain, rule_exprs);
        }

        if !meta.peer_selectors.is_empty() {
            let pod_ip_set = self.conn.add_set(
                SetSpec {
                    name: format!("{}_podips", prefix),
                    key: SetKey::Addr,
                    ..SetSpec::default()
                },
                Vec::new(),
            );
            meta.pod_ip_set = Some(pod_ip_set);
            let mut rule_exprs = vec![exprs::load_ip(dir, 0), exprs::lookup(pod_ip_set, 0)];
            rule_exprs.extend(port_proto_exprs.iter().cloned());
            rule_exprs.push(Expr::Verdict(Verdict::Accept));
            self.conn.add_rule(chain, rule_exprs);
        }

        if peers.is_empty() {
            // An empty peer list allows all sources/destinations.
            let mut rule_exprs = port_proto_exprs;
            rule_exprs.push(Expr::Verdict(Verdict::Accept));
            self.conn.add_rule(chain, rule_exprs);
        }

        meta
    }

    fn create_nwp(&mut self, name: &ObjectName, policy: &k8s::NetworkPolicy) {
        let obj = ObjectRef::network_policy(&policy.metadata);
        let Some(spec) = policy.spec.as_ref() else {
            return;
        };
        let pod_selector = match Selector::from_label_selector(&spec.pod_selector) {
            Ok(selector) => selector,
            Err(error) => {
                self.events.record(ClusterEvent::warning(
                    obj,
                    "InvalidPolicy",
                    format!("podSelector invalid: {}", error),
                ));
                return;
            }
        };

        let mut nwp = Policy {
            namespace: policy.metadata.namespace.clone().unwrap_or_default(),
            id: object_id(&policy.metadata),
            pod_selector,
            ingress_rules: Vec::new(),
            egress_rules: Vec::new(),
            ingress_chain: None,
            egress_chain: None,
            pod_refs: HashSet::new(),
        };

        let mut is_ingress = false;
        let mut is_egress = false;
        match spec.policy_types.as_deref() {
            None | Some([]) => {
                // The Kubernetes default when no policyTypes are present.
                is_ingress = true;
                if spec.egress.as_ref().map_or(false, |e| !e.is_empty()) {
                    is_egress = true;
                }
            }
            Some(types) => {
                for policy_type in types {
                    match policy_type.as_str() {
                        "Ingress" => is_ingress = true,
                        "Egress" => is_egress = true,
                        _ => {}
                    }
                }
            }
        }

        if is_ingress {
            let chain_name = format!("pol_{}_ing", nwp.id);
            let chain = self.conn.add_chain(ChainSpec::regular(&chain_name));
            for (i, entry) in spec.ingress.iter().flatten().enumerate() {
                let key = self.next_rule_key();
                let mut rule = self.create_peers(
                    chain,
                    entry.from.as_deref().unwrap_or(&[]),
                    entry.ports.as_deref().unwrap_or(&[]),
                    &format!("{}_{}", chain_name, i),
                    Direction::Ingress,
                    &obj,
                    &nwp.namespace,
                );
                for (pod_name, pod) in self.pods.iter_mut() {
                    add_pod_rule(&mut self.conn, &self.namespaces, key, &mut rule, pod_name, pod);
                }
                self.rules.insert(key, rule);
                nwp.ingress_rules.push(key);
            }
            nwp.ingress_chain = Some(OwnedChain {
                id: chain,
                name: chain_name,
            });
        }
        if is_egress {
            let chain_name = format!("pol_{}_eg", nwp.id);
            let chain = self.conn.add_chain(ChainSpec::regular(&chain_name));
            for (i, entry) in spec.egress.iter().flatten().enumerate() {
                let key = self.next_rule_key();
                let mut rule = self.create_peers(
                    chain,
                    entry.to.as_deref().unwrap_or(&[]),
                    entry.ports.as_deref().unwrap_or(&[]),
                    &format!("{}_{}", chain_name, i),
                    Direction::Egress,
                    &obj,
                    &nwp.namespace,
                );
                for (pod_name, pod) in self.pods.iter_mut() {
                    add_pod_rule(&mut self.conn, &self.namespaces, key, &mut rule, pod_name, pod);
                }
                self.rules.insert(key, rule);
                nwp.egress_rules.push(key);
            }
            nwp.egress_chain = Some(OwnedChain {
                id: chain,
                name: chain_name,
            });
        }

        for (pod_name, pod) in self.pods.iter_mut() {
            add_pod_nwp(
                &mut self.conn,
                pod_name,
                pod,
                name,
                &mut nwp,
                self.vmap_ing,
                self.vmap_eg,
            );
        }
        self.nwps.insert(name.clone(), nwp);
    }

    fn delete_rules(&mut self, keys: &[RuleKey]) {
        for key in keys {
            let Some(rule) = self.rules.remove(key) else {
                continue;
            };
            for pod_name in &rule.pod_refs {
                if let Some(pod) = self.pods.get_mut(pod_name) {
                    pod.rule_refs.remove(key);
                }
            }
            if let Some(set) = rule.named_port_set {
                self.conn.del_set(set);
            }
            if let Some(set) = rule.pod_ip_set {
                self.conn.del_set(set);
            }
        }
    }

    fn delete_nwp(&mut self, name: &ObjectName) {
        let Some(mut nwp) = self.nwps.remove(name) else {
            return;
        };
        for pod_name in std::mem::take(&mut nwp.pod_refs) {
            if let Some(pod) = self.pods.get_mut(&pod_name) {
                crate::pod::remove_pod_nwp(
                    &mut self.conn,
                    pod,
                    name,
                    self.vmap_ing,
                    self.vmap_eg,
                );
            }
        }
        if let Some(chain) = &nwp.ingress_chain {
            self.conn.del_chain(chain.id);
        }
        if let Some(chain) = &nwp.egress_chain {
            self.conn.del_chain(chain.id);
        }
        self.delete_rules(&nwp.ingress_rules);
        self.delete_rules(&nwp.egress_rules);
    }

    /// Applies a NetworkPolicy update. Policies are never compared for
    /// semantic equality; any update tears the old artifacts down and
    /// recompiles.
    pub fn set_network_policy(&mut self, name: &ObjectName, nwp: Option<&k8s::NetworkPolicy>) {
        match (self.nwps.contains_key(name), nwp) {
            (false, Some(nwp)) => self.create_nwp(name, nwp),
            (true, None) => self.delete_nwp(name),
            (true, Some(nwp)) => {
                self.delete_nwp(name);
                self.create_nwp(name, nwp);
            }
            (false, None) => {}
        }
    }
}
