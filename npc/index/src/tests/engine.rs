use super::*;

#[test]
fn pod_without_policy_gets_no_artifacts() {
    let mut t = TestIndex::new();
    t.index.set_namespace("a", Some(&mk_ns("a", &[])));
    t.index
        .set_pod(&name("a", "x"), Some(&mk_pod("a", "x", &[], &["10.0.0.1"])));
    t.flush();

    let table = t.table();
    assert!(table.chain("pod_a_x_ing").is_none());
    assert!(table.chain("pod_a_x_eg").is_none());
    assert!(table.set("vmap_ing").unwrap().elements.is_empty());
    assert!(table.set("vmap_eg").unwrap().elements.is_empty());
    t.assert_invariants();
}

#[test]
fn allow_all_within_namespace() {
    let mut t = TestIndex::new();
    t.index.set_namespace("a", Some(&mk_ns("a", &[])));
    t.index.set_network_policy(
        &name("a", "allow"),
        Some(&mk_policy(
            "a",
            "allow",
            selector(&[]),
            vec![ingress(vec![peer_pods(&[])], vec![])],
        )),
    );
    t.index
        .set_pod(&name("a", "x"), Some(&mk_pod("a", "x", &[], &["10.0.0.1"])));
    t.index
        .set_pod(&name("a", "y"), Some(&mk_pod("a", "y", &[], &["10.0.0.2"])));
    t.flush();

    let table = t.table();
    // Both pods carry an ingress dispatch chain: a jump into the policy
    // chain above the administrative-reject tail.
    for pod in ["pod_a_x_ing", "pod_a_y_ing"] {
        let chain = table.chain(pod).unwrap_or_else(|| panic!("{} exists", pod));
        assert_eq!(chain.rules.len(), 2);
        assert_eq!(
            chain.rules[0].exprs,
            vec![k8s_nft_npc_nfds::LoweredExpr::Verdict(Verdict::Jump(
                "pol_a_allow_ing".to_string()
            ))]
        );
        assert!(matches!(
            chain.rules[1].exprs[0],
            k8s_nft_npc_nfds::LoweredExpr::Reject { code: 13 }
        ));
    }

    let mut vmap: Vec<SetElem> = table.set("vmap_ing").unwrap().elements.clone();
    vmap.sort_by(|a, b| a.key.cmp(&b.key));
    assert_eq!(
        vmap,
        vec![
            SetElem::verdict(ip_key("10.0.0.1"), Verdict::Jump("pod_a_x_ing".into())),
            SetElem::verdict(ip_key("10.0.0.2"), Verdict::Jump("pod_a_y_ing".into())),
        ]
    );

    assert_eq!(
        t.set_keys("pol_a_allow_ing_0_podips"),
        vec![ip_key("10.0.0.1"), ip_key("10.0.0.2")]
    );
    t.assert_invariants();
}

#[test]
fn named_port_membership_follows_the_pod() {
    let mut t = TestIndex::new();
    t.index.set_namespace("a", Some(&mk_ns("a", &[])));
    t.index.set_network_policy(
        &name("a", "web"),
        Some(&mk_policy(
            "a",
            "web",
            selector(&[]),
            vec![ingress(vec![peer_pods(&[])], vec![port_named("TCP", "http")])],
        )),
    );
    t.index.set_pod(
        &name("a", "x"),
        Some(&mk_pod_with_ports(
            "a",
            "x",
            &[],
            &["10.0.0.9"],
            &[("http", "TCP", 8080)],
        )),
    );
    t.flush();

    let mut expected = vec![6u8, 0, 0, 0, 0, 0, 0, 0];
    expected[4..6].copy_from_slice(&8080u16.to_be_bytes());
    expected.extend(ip_key("10.0.0.9"));
    assert_eq!(t.set_keys("pol_a_web_ing_0_namedports"), vec![expected]);
    t.assert_invariants();

    // Removing the pod removes the tuple.
    t.index.set_pod(&name("a", "x"), None);
    t.flush();
    assert!(t.set_keys("pol_a_web_ing_0_namedports").is_empty());
    t.assert_invariants();
}

#[test]
fn named_port_requires_matching_protocol() {
    let mut t = TestIndex::new();
    t.index.set_namespace("a", Some(&mk_ns("a", &[])));
    t.index.set_network_policy(
        &name("a", "web"),
        Some(&mk_policy(
            "a",
            "web",
            selector(&[]),
            vec![ingress(vec![peer_pods(&[])], vec![port_named("UDP", "http")])],
        )),
    );
    t.index.set_pod(
        &name("a", "x"),
        Some(&mk_pod_with_ports(
            "a",
            "x",
            &[],
            &["10.0.0.9"],
            &[("http", "TCP", 8080)],
        )),
    );
    t.flush();
    assert!(t.set_keys("pol_a_web_ing_0_namedports").is_empty());
}

#[test]
fn namespace_label_flip_updates_only_observing_rules() {
    let mut t = TestIndex::new();
    t.index.set_namespace("a", Some(&mk_ns("a", &[])));
    t.index
        .set_namespace("b", Some(&mk_ns("b", &[("team", "red")])));
    t.index.set_network_policy(
        &name("a", "from-red"),
        Some(&mk_policy(
            "a",
            "from-red",
            selector(&[]),
            vec![ingress(vec![peer_namespaces(&[("team", "red")])], vec![])],
        )),
    );
    t.index.set_network_policy(
        &name("a", "local"),
        Some(&mk_policy(
            "a",
            "local",
            selector(&[]),
            vec![ingress(vec![peer_pods(&[])], vec![])],
        )),
    );
    t.index
        .set_pod(&name("a", "x"), Some(&mk_pod("a", "x", &[], &["10.0.0.1"])));
    t.index
        .set_pod(&name("b", "y"), Some(&mk_pod("b", "y", &[], &["10.0.0.7"])));
    t.flush();

    assert_eq!(
        t.set_keys("pol_a_from-red_ing_0_podips"),
        vec![ip_key("10.0.0.7")]
    );
    assert_eq!(
        t.set_keys("pol_a_local_ing_0_podips"),
        vec![ip_key("10.0.0.1")]
    );
    t.assert_invariants();

    // Toggling the label off removes the contribution; the same-namespace
    // rule is untouched.
    t.index.set_namespace("b", Some(&mk_ns("b", &[])));
    t.flush();
    assert!(t.set_keys("pol_a_from-red_ing_0_podips").is_empty());
    assert_eq!(
        t.set_keys("pol_a_local_ing_0_podips"),
        vec![ip_key("10.0.0.1")]
    );
    t.assert_invariants();

    // And toggling it back restores it.
    t.index
        .set_namespace("b", Some(&mk_ns("b", &[("team", "red")])));
    t.flush();
    assert_eq!(
        t.set_keys("pol_a_from-red_ing_0_podips"),
        vec![ip_key("10.0.0.7")]
    );
    t.assert_invariants();
}

#[test]
fn dispatch_chain_lives_until_the_last_policy() {
    let mut t = TestIndex::new();
    t.index.set_namespace("a", Some(&mk_ns("a", &[])));
    for policy in ["one", "two"] {
        t.index.set_network_policy(
            &name("a", policy),
            Some(&mk_policy(
                "a",
                policy,
                selector(&[]),
                vec![ingress(vec![peer_pods(&[])], vec![])],
            )),
        );
    }
    t.index
        .set_pod(&name("a", "x"), Some(&mk_pod("a", "x", &[], &["10.0.0.1"])));
    t.flush();

    assert_eq!(t.table().chain("pod_a_x_ing").unwrap().rules.len(), 3);
    t.assert_invariants();

    t.index.set_network_policy(&name("a", "one"), None);
    t.flush();
    let table = t.table();
    assert_eq!(table.chain("pod_a_x_ing").unwrap().rules.len(), 2);
    assert!(table.chain("pol_a_one_ing").is_none());
    assert!(table.set("pol_a_one_ing_0_podips").is_none());
    t.assert_invariants();

    t.index.set_network_policy(&name("a", "two"), None);
    t.flush();
    let table = t.table();
    assert!(table.chain("pod_a_x_ing").is_none());
    assert!(table.set("vmap_ing").unwrap().elements.is_empty());
    t.assert_invariants();
}

#[test]
fn egress_defaults_from_spec_shape() {
    let mut t = TestIndex::new();
    t.index.set_namespace("a", Some(&mk_ns("a", &[])));
    // No policyTypes, but an egress list: the policy is both directions.
    let mut policy = mk_policy("a", "p", selector(&[]), vec![ingress(vec![], vec![])]);
    policy.spec.as_mut().unwrap().egress = Some(vec![k8s::NetworkPolicyEgressRule {
        to: Some(vec![peer_pods(&[])]),
        ports: None,
    }]);
    t.index.set_network_policy(&name("a", "p"), Some(&policy));
    t.index
        .set_pod(&name("a", "x"), Some(&mk_pod("a", "x", &[], &["10.0.0.1"])));
    t.flush();

    let table = t.table();
    assert!(table.chain("pol_a_p_ing").is_some());
    assert!(table.chain("pol_a_p_eg").is_some());
    assert!(table.chain("pod_a_x_ing").is_some());
    assert!(table.chain("pod_a_x_eg").is_some());
    assert!(matches!(
        table.chain("pod_a_x_eg").unwrap().rules.last().unwrap().exprs[0],
        k8s_nft_npc_nfds::LoweredExpr::Reject { code: 13 }
    ));
    assert_eq!(
        t.set_keys("pol_a_p_eg_0_podips"),
        vec![ip_key("10.0.0.1")]
    );
    t.assert_invariants();
}

#[test]
fn pod_update_is_idempotent() {
    let mut t = TestIndex::new();
    t.index.set_namespace("a", Some(&mk_ns("a", &[])));
    t.index.set_network_policy(
        &name("a", "allow"),
        Some(&mk_policy(
            "a",
            "allow",
            selector(&[]),
            vec![ingress(vec![peer_pods(&[])], vec![])],
        )),
    );
    let pod = mk_pod("a", "x", &[("app", "web")], &["10.0.0.1"]);
    t.index.set_pod(&name("a", "x"), Some(&pod));
    t.flush();
    let before = t.backend.dump();

    t.index.set_pod(&name("a", "x"), Some(&pod));
    t.index.set_namespace("a", Some(&mk_ns("a", &[])));
    t.flush();
    assert_eq!(t.backend.dump(), before);
}

#[test]
fn policy_reapply_is_idempotent() {
    let mut t = TestIndex::new();
    t.index.set_namespace("a", Some(&mk_ns("a", &[])));
    let policy = mk_policy(
        "a",
        "allow",
        selector(&[]),
        vec![ingress(
            vec![peer_pods(&[]), peer_ip_block("10.0.0.0/24", &[])],
            vec![port_num("TCP", 80)],
        )],
    );
    t.index.set_network_policy(&name("a", "allow"), Some(&policy));
    t.index
        .set_pod(&name("a", "x"), Some(&mk_pod("a", "x", &[], &["10.0.0.1"])));
    t.flush();
    let before = t.backend.dump();

    // Policies are always torn down and recompiled; the result must be
    // byte-identical state.
    t.index.set_network_policy(&name("a", "allow"), Some(&policy));
    t.flush();
    assert_eq!(t.backend.dump(), before);
    t.assert_invariants();
}

#[test]
fn independent_events_commute() {
    let bundle_a = (
        mk_ns("a", &[]),
        mk_policy(
            "a",
            "pa",
            selector(&[]),
            vec![ingress(vec![peer_pods(&[])], vec![])],
        ),
        mk_pod("a", "x", &[], &["10.0.0.1"]),
    );
    let bundle_b = (
        mk_ns("b", &[]),
        mk_policy(
            "b",
            "pb",
            selector(&[]),
            vec![ingress(vec![peer_pods(&[])], vec![])],
        ),
        mk_pod("b", "y", &[], &["10.0.0.2"]),
    );

    let mut forward = TestIndex::new();
    forward.index.set_namespace("a", Some(&bundle_a.0));
    forward
        .index
        .set_network_policy(&name("a", "pa"), Some(&bundle_a.1));
    forward.index.set_pod(&name("a", "x"), Some(&bundle_a.2));
    forward.index.set_namespace("b", Some(&bundle_b.0));
    forward
        .index
        .set_network_policy(&name("b", "pb"), Some(&bundle_b.1));
    forward.index.set_pod(&name("b", "y"), Some(&bundle_b.2));
    forward.flush();

    let mut reverse = TestIndex::new();
    reverse.index.set_pod(&name("b", "y"), Some(&bundle_b.2));
    reverse
        .index
        .set_network_policy(&name("b", "pb"), Some(&bundle_b.1));
    reverse.index.set_namespace("b", Some(&bundle_b.0));
    reverse.index.set_pod(&name("a", "x"), Some(&bundle_a.2));
    reverse
        .index
        .set_network_policy(&name("a", "pa"), Some(&bundle_a.1));
    reverse.index.set_namespace("a", Some(&bundle_a.0));
    reverse.flush();

    assert_eq!(forward.backend.dump(), reverse.backend.dump());
}

#[test]
fn long_names_fall_back_to_the_uid() {
    let mut t = TestIndex::new();
    let ns = "n".repeat(80);
    t.index.set_namespace(&ns, Some(&mk_ns(&ns, &[])));

    let mut policy = mk_policy(
        &ns,
        &"p".repeat(80),
        selector(&[]),
        vec![ingress(vec![peer_pods(&[])], vec![])],
    );
    policy.metadata.uid = Some("7c9e0e7b-policy".to_string());
    t.index
        .set_network_policy(&name(&ns, &"p".repeat(80)), Some(&policy));

    let mut pod = mk_pod(&ns, &"x".repeat(80), &[], &["10.0.0.1"]);
    pod.metadata.uid = Some("7c9e0e7b-pod".to_string());
    t.index.set_pod(&name(&ns, &"x".repeat(80)), Some(&pod));
    t.flush();

    let table = t.table();
    assert!(table.chain("pol_7c9e0e7b-policy_ing").is_some());
    assert!(table.chain("pod_7c9e0e7b-pod_ing").is_some());
    for chain in table.chains.keys() {
        assert!(chain.len() <= 128, "chain name too long: {}", chain);
    }
    for set in table.sets.keys() {
        assert!(set.len() <= 160, "set name too long: {}", set);
    }
    t.assert_invariants();
}

#[test]
fn pods_outside_running_and_pending_contribute_no_ips() {
    let mut t = TestIndex::new();
    t.index.set_namespace("a", Some(&mk_ns("a", &[])));
    t.index.set_network_policy(
        &name("a", "allow"),
        Some(&mk_policy(
            "a",
            "allow",
            selector(&[]),
            vec![ingress(vec![peer_pods(&[])], vec![])],
        )),
    );
    let mut pod = mk_pod("a", "x", &[], &["10.0.0.1"]);
    pod.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
    t.index.set_pod(&name("a", "x"), Some(&pod));
    t.flush();

    assert!(t.set_keys("pol_a_allow_ing_0_podips").is_empty());
    assert!(t.table().set("vmap_ing").unwrap().elements.is_empty());
    t.assert_invariants();
}

#[test]
fn mixed_family_pod_ips_split_between_tables() {
    let mut t = TestIndex::new();
    t.index.set_namespace("a", Some(&mk_ns("a", &[])));
    t.index.set_network_policy(
        &name("a", "allow"),
        Some(&mk_policy(
            "a",
            "allow",
            selector(&[]),
            vec![ingress(vec![peer_pods(&[])], vec![])],
        )),
    );
    t.index.set_pod(
        &name("a", "x"),
        Some(&mk_pod("a", "x", &[], &["10.0.0.1", "fd00::1"])),
    );
    t.flush();

    assert_eq!(
        t.table()
            .set("pol_a_allow_ing_0_podips")
            .unwrap()
            .sorted_keys(),
        vec![ip_key("10.0.0.1")]
    );
    assert_eq!(
        t.table6()
            .set("pol_a_allow_ing_0_podips")
            .unwrap()
            .sorted_keys(),
        vec![ip_key("fd00::1")]
    );
    assert_eq!(t.table().set("vmap_ing").unwrap().elements.len(), 1);
    assert_eq!(t.table6().set("vmap_ing").unwrap().elements.len(), 1);
    t.assert_invariants();
}

#[test]
fn root_layout_matches_the_contract() {
    let mut t = TestIndex::with_iface_group(7);
    t.flush();

    for table in [t.table(), t.table6()] {
        for hook in ["filter_hook_ing", "filter_hook_eg"] {
            let chain = table.chain(hook).unwrap();
            let spec_hook = chain.spec.hook.expect("base chain has a hook");
            assert_eq!(spec_hook.priority, 225);
            // Conntrack fast path first, then the interface-group match and
            // the verdict-map dispatch.
            assert_eq!(chain.rules.len(), 2);
            assert!(matches!(
                chain.rules[0].exprs[0],
                k8s_nft_npc_nfds::LoweredExpr::Ct { .. }
            ));
            let dispatch = &chain.rules[1].exprs;
            assert!(matches!(
                dispatch[0],
                k8s_nft_npc_nfds::LoweredExpr::Meta { .. }
            ));
            assert!(matches!(
                dispatch.last().unwrap(),
                k8s_nft_npc_nfds::LoweredExpr::Lookup {
                    verdict_to: Some(_),
                    ..
                }
            ));
        }
        assert!(table.set("vmap_ing").is_some());
        assert!(table.set("vmap_eg").is_some());
    }

    // The ingress hook keys on the destination address, the egress hook on
    // the source address.
    let table = t.table();
    let ing_dispatch = &table.chain("filter_hook_ing").unwrap().rules[1].exprs;
    assert!(ing_dispatch.iter().any(|e| matches!(
        e,
        k8s_nft_npc_nfds::LoweredExpr::Payload { offset: 16, len: 4, .. }
    )));
    let eg_dispatch = &table.chain("filter_hook_eg").unwrap().rules[1].exprs;
    assert!(eg_dispatch.iter().any(|e| matches!(
        e,
        k8s_nft_npc_nfds::LoweredExpr::Payload { offset: 12, len: 4, .. }
    )));
}

#[test]
fn startup_replaces_stale_tables() {
    let mut old = TestIndex::new();
    old.index.set_namespace("a", Some(&mk_ns("a", &[])));
    old.flush();

    // A fresh index over the same backend replaces the leftover tables in
    // its first commit.
    let events = TestSink::default();
    let mut index = Index::new(
        Box::new(old.backend.clone()),
        Box::new(events),
        0,
    )
    .expect("index must initialize");
    index.flush().expect("flush");
    let table = old
        .backend
        .table(Family::V4, TABLE_NAME)
        .expect("table exists");
    assert!(table.chain("filter_hook_ing").is_some());
}
