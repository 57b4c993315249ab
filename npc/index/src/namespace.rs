//! Namespace tracking and the label-change fan-out.

use crate::index::Index;
use crate::policy::RuleKey;
use ahash::AHashSet as HashSet;
use k8s_nft_npc_k8s::{self as k8s, ObjectName};

#[derive(Clone, Debug)]
pub(crate) struct Namespace {
    pub(crate) name: String,
    pub(crate) labels: k8s::Labels,
}

// === impl Namespace ===

impl Namespace {
    fn semantically_equal(&self, other: &Namespace) -> bool {
        self.name == other.name && self.labels == other.labels
    }
}

// === impl Index ===

impl Index {
    /// Applies a Namespace update. Deletion does not touch rules: Kubernetes
    /// guarantees the namespace's children are deleted first.
    pub fn set_namespace(&mut self, name: &str, ns: Option<&k8s::Namespace>) {
        let existing = self.namespaces.get(name).cloned();
        match (existing, ns) {
            (None, Some(ns)) => {
                let new = Namespace {
                    name: name.to_string(),
                    labels: k8s::Labels::from(ns.metadata.labels.clone()),
                };
                self.namespaces.insert(name.to_string(), new.clone());
                self.update_ns(None, &new);
            }
            (Some(_), None) => {
                self.namespaces.remove(name);
            }
            (Some(old), Some(ns)) => {
                let new = Namespace {
                    name: name.to_string(),
                    labels: k8s::Labels::from(ns.metadata.labels.clone()),
                };
                if old.semantically_equal(&new) {
                    return;
                }
                self.namespaces.insert(name.to_string(), new.clone());
                self.update_ns(Some(&old), &new);
            }
            (None, None) => {}
        }
    }

    /// Re-evaluates exactly the rules whose peer namespace selectors change
    /// their verdict on the updated namespace, touching each affected pod
    /// once per rule.
    fn update_ns(&mut self, old: Option<&Namespace>, new: &Namespace) {
        let rule_keys: Vec<RuleKey> = self.rules.keys().copied().collect();
        for key in rule_keys {
            let mut reeval: HashSet<ObjectName> = HashSet::new();
            {
                let Some(rule) = self.rules.get(&key) else {
                    continue;
                };
                for selector in &rule.peer_selectors {
                    let Some(ns_selector) = selector.namespace.as_ref() else {
                        // Same-namespace selectors never observe labels.
                        continue;
                    };
                    let old_matches = old.map_or(false, |o| ns_selector.matches(&o.labels));
                    let new_matches = ns_selector.matches(&new.labels);
                    if old_matches == new_matches {
                        continue;
                    }
                    if old_matches {
                        // Only pods that contributed through this namespace
                        // can drop out.
                        for pod_name in &rule.pod_refs {
                            let in_namespace = self
                                .pods
                                .get(pod_name)
                                .map_or(false, |p| p.namespace == new.name);
                            if in_namespace {
                                reeval.insert(pod_name.clone());
                            }
                        }
                    } else {
                        for (pod_name, pod) in &self.pods {
                            if pod.namespace == new.name {
                                reeval.insert(pod_name.clone());
                            }
                        }
                    }
                }
            }
            for pod_name in reeval {
                self.reeval_pod_in_rule(&pod_name, key);
            }
        }
    }

    /// Reconciles one pod's membership in one rule's sets.
    pub(crate) fn reeval_pod_in_rule(&mut self, pod_name: &ObjectName, key: RuleKey) {
        let Some(rule) = self.rules.get_mut(&key) else {
            return;
        };
        let Some(pod) = self.pods.get_mut(pod_name) else {
            return;
        };
        let is_selected = rule.selects(pod, &self.namespaces);
        let was_selected = rule.pod_refs.contains(pod_name);
        if is_selected && !was_selected {
            pod.rule_refs.insert(key);
            rule.pod_refs.insert(pod_name.clone());
            if let Some(set) = rule.pod_ip_set {
                self.conn.set_add_elements(set, pod.ip_elements());
            }
            if let Some(set) = rule.named_port_set {
                self.conn
                    .set_add_elements(set, pod.named_port_elements(&rule.named_ports));
            }
        } else if !is_selected && was_selected {
            rule.pod_refs.remove(pod_name);
            pod.rule_refs.remove(&key);
            if let Some(set) = rule.pod_ip_set {
                self.conn.set_delete_elements(set, pod.ip_elements());
            }
            if let Some(set) = rule.named_port_set {
                self.conn
                    .set_delete_elements(set, pod.named_port_elements(&rule.named_ports));
            }
        }
    }
}
