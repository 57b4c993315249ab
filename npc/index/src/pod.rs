//! Pod normalization and the pod side of the reference graph.

use crate::events::{ClusterEvent, ObjectRef};
use crate::exprs;
use crate::index::{object_id, Index};
use crate::namespace::Namespace;
use crate::policy::{parse_protocol, NamedPortRequest, OwnedChain, Policy, Rule, RuleKey};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use k8s_nft_npc_k8s::{self as k8s, ObjectName};
use k8s_nft_npc_nfds::{proto, ChainSpec, Conn, Expr, SetElem, SetId, Verdict};
use std::net::IpAddr;

pub(crate) struct Pod {
    pub(crate) namespace: String,
    pub(crate) id: String,
    pub(crate) labels: k8s::Labels,
    pub(crate) ips: Vec<IpAddr>,
    pub(crate) named_ports: HashMap<String, NamedPort>,

    pub(crate) ingress_chain: Option<OwnedChain>,
    pub(crate) egress_chain: Option<OwnedChain>,

    /// Rules this pod contributes set elements to.
    pub(crate) rule_refs: HashSet<RuleKey>,

    /// Per selecting policy, the jump rule inserted into the dispatch chain.
    pub(crate) ingress_policy_refs: HashMap<ObjectName, k8s_nft_npc_nfds::RuleId>,
    pub(crate) egress_policy_refs: HashMap<ObjectName, k8s_nft_npc_nfds::RuleId>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct NamedPort {
    pub(crate) protocol: u8,
    pub(crate) port: u16,
}

pub(crate) fn ip_bytes(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(addr) => addr.octets().to_vec(),
        IpAddr::V6(addr) => addr.octets().to_vec(),
    }
}

// === impl Pod ===

impl Pod {
    pub(crate) fn vmap_elements(&self, chain: &str) -> Vec<SetElem> {
        self.ips
            .iter()
            .map(|ip| SetElem::verdict(ip_bytes(ip), Verdict::Jump(chain.to_string())))
            .collect()
    }

    pub(crate) fn ip_elements(&self) -> Vec<SetElem> {
        self.ips.iter().map(|ip| SetElem::key(ip_bytes(ip))).collect()
    }

    /// The (proto, port, address) tuples this pod contributes for the given
    /// named-port requests. A request only joins a pod port whose protocol
    /// matches.
    pub(crate) fn named_port_elements(&self, requests: &[NamedPortRequest]) -> Vec<SetElem> {
        let mut elements = Vec::new();
        for ip in &self.ips {
            for request in requests {
                let Some(port) = self.named_ports.get(&request.name) else {
                    continue;
                };
                if port.protocol != request.protocol {
                    continue;
                }
                let mut key = vec![request.protocol, 0, 0, 0, 0, 0, 0, 0];
                key[4..6].copy_from_slice(&port.port.to_be_bytes());
                key.extend_from_slice(&ip_bytes(ip));
                elements.push(SetElem::key(key));
            }
        }
        elements
    }

    pub(crate) fn semantically_equal(&self, other: &Pod) -> bool {
        if self.namespace != other.namespace
            || self.id != other.id
            || self.labels != other.labels
            || self.named_ports != other.named_ports
        {
            return false;
        }
        let mut ips = self.ips.clone();
        let mut other_ips = other.ips.clone();
        ips.sort();
        other_ips.sort();
        ips == other_ips
    }
}

/// Wires a pod into a policy that selects it: lazily creates the dispatch
/// chains (with their reject tail and verdict-map entries) and inserts a
/// jump into the policy's direction chains.
pub(crate) fn add_pod_nwp(
    conn: &mut Conn,
    pod_name: &ObjectName,
    pod: &mut Pod,
    nwp_name: &ObjectName,
    nwp: &mut Policy,
    vmap_ing: SetId,
    vmap_eg: SetId,
) {
    if nwp.namespace != pod.namespace || !nwp.pod_selector.matches(&pod.labels) {
        return;
    }
    if let Some(policy_chain) = &nwp.ingress_chain {
        if pod.ingress_chain.is_none() {
            let name = format!("pod_{}_ing", pod.id);
            let id = conn.add_chain(ChainSpec::regular(&name));
            // Reject everything not permitted directly by a network policy
            // or related to a connection permitted by one.
            conn.add_rule(id, vec![exprs::reject_administrative()]);
            conn.set_add_elements(vmap_ing, pod.vmap_elements(&name));
            pod.ingress_chain = Some(OwnedChain { id, name });
        }
        let dispatch = pod.ingress_chain.as_ref().expect("chain was just ensured");
        let jump = conn.insert_rule(
            dispatch.id,
            vec![Expr::Verdict(Verdict::Jump(policy_chain.name.clone()))],
        );
        pod.ingress_policy_refs.insert(nwp_name.clone(), jump);
        nwp.pod_refs.insert(pod_name.clone());
    }
    if let Some(policy_chain) = &nwp.egress_chain {
        if pod.egress_chain.is_none() {
            let name = format!("pod_{}_eg", pod.id);
            let id = conn.add_chain(ChainSpec::regular(&name));
            conn.add_rule(id, vec![exprs::reject_administrative()]);
            conn.set_add_elements(vmap_eg, pod.vmap_elements(&name));
            pod.egress_chain = Some(OwnedChain { id, name });
        }
        let dispatch = pod.egress_chain.as_ref().expect("chain was just ensured");
        let jump = conn.insert_rule(
            dispatch.id,
            vec![Expr::Verdict(Verdict::Jump(policy_chain.name.clone()))],
        );
        pod.egress_policy_refs.insert(nwp_name.clone(), jump);
        nwp.pod_refs.insert(pod_name.clone());
    }
}

/// Unwires a pod from a policy, tearing the dispatch chain down when the
/// last policy in that direction lets go.
pub(crate) fn remove_pod_nwp(
    conn: &mut Conn,
    pod: &mut Pod,
    nwp_name: &ObjectName,
    vmap_ing: SetId,
    vmap_eg: SetId,
) {
    if let Some(jump) = pod.ingress_policy_refs.remove(nwp_name) {
        conn.del_rule(jump);
    }
    if pod.ingress_policy_refs.is_empty() {
        if let Some(chain) = pod.ingress_chain.take() {
            conn.set_delete_elements(vmap_ing, pod.vmap_elements(&chain.name));
            conn.del_chain(chain.id);
        }
    }

    if let Some(jump) = pod.egress_policy_refs.remove(nwp_name) {
        conn.del_rule(jump);
    }
    if pod.egress_policy_refs.is_empty() {
        if let Some(chain) = pod.egress_chain.take() {
            conn.set_delete_elements(vmap_eg, pod.vmap_elements(&chain.name));
            conn.del_chain(chain.id);
        }
    }
}

/// Adds a pod's contributions to a rule's sets if the rule selects it.
pub(crate) fn add_pod_rule(
    conn: &mut Conn,
    namespaces: &HashMap<String, Namespace>,
    key: RuleKey,
    rule: &mut Rule,
    pod_name: &ObjectName,
    pod: &mut Pod,
) {
    if !rule.selects(pod, namespaces) {
        return;
    }
    pod.rule_refs.insert(key);
    rule.pod_refs.insert(pod_name.clone());
    if let Some(set) = rule.pod_ip_set {
        conn.set_add_elements(set, pod.ip_elements());
    }
    if let Some(set) = rule.named_port_set {
        conn.set_add_elements(set, pod.named_port_elements(&rule.named_ports));
    }
}

// === impl Index ===

impl Index {
    /// Applies a Pod update. A semantically unchanged pod is a no-op; any
    /// semantic change tears the pod's artifacts down and rebuilds them.
    pub fn set_pod(&mut self, name: &ObjectName, pod: Option<&k8s::Pod>) {
        match (self.pods.contains_key(name), pod) {
            (false, Some(pod)) => {
                let pod = self.normalize_pod(pod);
                self.wire_pod(name, pod);
            }
            (true, None) => {
                let pod = self.pods.remove(name).expect("pod is present");
                self.delete_pod(name, pod);
            }
            (true, Some(pod)) => {
                let pod = self.normalize_pod(pod);
                if pod.semantically_equal(&self.pods[name]) {
                    tracing::debug!(pod = %name, "no changes");
                    return;
                }
                // Recreate; we currently cannot intelligently update.
                let old = self.pods.remove(name).expect("pod is present");
                self.delete_pod(name, old);
                self.wire_pod(name, pod);
            }
            (false, None) => {}
        }
    }

    fn wire_pod(&mut self, name: &ObjectName, mut pod: Pod) {
        let nwp_names: Vec<ObjectName> = self.nwps.keys().cloned().collect();
        for nwp_name in nwp_names {
            let nwp = self.nwps.get_mut(&nwp_name).expect("policy is present");
            add_pod_nwp(
                &mut self.conn,
                name,
                &mut pod,
                &nwp_name,
                nwp,
                self.vmap_ing,
                self.vmap_eg,
            );
        }
        let rule_keys: Vec<RuleKey> = self.rules.keys().copied().collect();
        for key in rule_keys {
            let rule = self.rules.get_mut(&key).expect("rule is present");
            add_pod_rule(&mut self.conn, &self.namespaces, key, rule, name, &mut pod);
        }
        self.pods.insert(name.clone(), pod);
    }

    fn delete_pod(&mut self, name: &ObjectName, pod: Pod) {
        if let Some(chain) = &pod.ingress_chain {
            self.conn
                .set_delete_elements(self.vmap_ing, pod.vmap_elements(&chain.name));
            self.conn.del_chain(chain.id);
        }
        for nwp_name in pod.ingress_policy_refs.keys() {
            if let Some(nwp) = self.nwps.get_mut(nwp_name) {
                nwp.pod_refs.remove(name);
            }
        }

        if let Some(chain) = &pod.egress_chain {
            self.conn
                .set_delete_elements(self.vmap_eg, pod.vmap_elements(&chain.name));
            self.conn.del_chain(chain.id);
        }
        for nwp_name in pod.egress_policy_refs.keys() {
            if let Some(nwp) = self.nwps.get_mut(nwp_name) {
                nwp.pod_refs.remove(name);
            }
        }

        for key in &pod.rule_refs {
            let Some(rule) = self.rules.get_mut(key) else {
                continue;
            };
            rule.pod_refs.remove(name);
            if let Some(set) = rule.pod_ip_set {
                self.conn.set_delete_elements(set, pod.ip_elements());
            }
            if let Some(set) = rule.named_port_set {
                self.conn
                    .set_delete_elements(set, pod.named_port_elements(&rule.named_ports));
            }
        }
    }

    /// Normalizes a Kubernetes Pod into its indexed form. Pods outside the
    /// Running and Pending phases contribute no IPs.
    fn normalize_pod(&mut self, pod: &k8s::Pod) -> Pod {
        let meta = &pod.metadata;
        let id = object_id(meta);

        let mut ips = Vec::new();
        let status = pod.status.as_ref();
        let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("");
        if phase == "Running" || phase == "Pending" {
            for pod_ip in status.and_then(|s| s.pod_ips.as_ref()).into_iter().flatten() {
                let Some(ip) = pod_ip.ip.as_deref() else {
                    continue;
                };
                match ip.parse::<IpAddr>() {
                    Ok(ip) => ips.push(ip),
                    Err(error) => {
                        tracing::warn!(%error, ip, pod = %id, "Failed to parse pod IP");
                    }
                }
            }
        }

        let mut named_ports = HashMap::new();
        let spec = pod.spec.as_ref();
        let containers = spec.map(|s| s.containers.as_slice()).unwrap_or(&[]);
        let init_containers = spec.and_then(|s| s.init_containers.as_deref()).unwrap_or(&[]);
        for container in containers.iter().chain(init_containers) {
            for port in container.ports.iter().flatten() {
                let Some(name) = port.name.clone().filter(|n| !n.is_empty()) else {
                    continue;
                };
                if port.container_port < 0 || port.container_port > u16::MAX as i32 {
                    self.events.record(ClusterEvent::warning(
                        ObjectRef::pod(meta),
                        "InvalidPort",
                        format!(
                            "Container {} port {} is out of range, ignoring",
                            container.name, port.container_port
                        ),
                    ));
                    continue;
                }
                let protocol = match port.protocol.as_deref() {
                    None | Some("") => proto::TCP,
                    Some(protocol) => match parse_protocol(protocol) {
                        Some(protocol) => protocol,
                        // Unknown protocols are ignored without logging; as
                        // long as no policy mentions one, it cannot matter.
                        None => continue,
                    },
                };
                named_ports.insert(
                    name,
                    NamedPort {
                        protocol,
                        port: port.container_port as u16,
                    },
                );
            }
        }

        Pod {
            namespace: meta.namespace.clone().unwrap_or_default(),
            id,
            labels: k8s::Labels::from(meta.labels.clone()),
            ips,
            named_ports,
            ingress_chain: None,
            egress_chain: None,
            rule_refs: HashSet::new(),
            ingress_policy_refs: HashMap::new(),
            egress_policy_refs: HashMap::new(),
        }
    }
}
