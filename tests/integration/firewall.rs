use crate::*;

#[tokio::test(flavor = "multi_thread")]
async fn blocked_node_rejects_remote_traffic_only() {
    let rules = RuleSet {
        node_blocks: vec![(2, 1)],
        ..Default::default()
    };
    let mut fabric = launch(
        vec![
            vec![(1, vec![
                item(Addr::new(2, 1), b"kept out"),
                item(Addr::new(2, 2), b"waved through"),
            ])],
            vec![
                (1, vec![]),
                (2, vec![item(Addr::new(2, 1), b"neighborly")]),
            ],
        ],
        rules,
        no_faults(),
    );
    fabric.wait().await.unwrap();

    // The block applies to traffic from other networks; the neighbor's
    // frame still lands.
    assert_eq!(fabric.received(Addr::new(2, 1)).trim(), "2_2: neighborly");
    assert_eq!(fabric.received(Addr::new(2, 2)).trim(), "1_1: waved through");
}

#[tokio::test(flavor = "multi_thread")]
async fn blocked_network_rejects_inbound_but_sends_freely() {
    let rules = RuleSet {
        global_nets: [2].into_iter().collect(),
        ..Default::default()
    };
    let mut fabric = launch(
        vec![
            vec![(1, vec![item(Addr::new(2, 1), b"refused")])],
            vec![(1, vec![item(Addr::new(1, 1), b"outbound ok")])],
        ],
        rules,
        no_faults(),
    );
    fabric.wait().await.unwrap();

    // Nothing reaches the blocked network, but its own traffic (and the
    // acks coming back for it) pass the central switch untouched.
    assert_eq!(fabric.received(Addr::new(2, 1)), "");
    assert_eq!(fabric.received(Addr::new(1, 1)).trim(), "2_1: outbound ok");
}
