use crate::*;

#[tokio::test(flavor = "multi_thread")]
async fn cross_network_hello() {
    let mut fabric = launch(
        vec![
            vec![(1, vec![item(Addr::new(2, 1), b"hello over there")])],
            vec![(1, vec![item(Addr::new(1, 1), b"hello right back")])],
        ],
        RuleSet::default(),
        no_faults(),
    );
    fabric.wait().await.unwrap();

    assert_eq!(
        fabric.received(Addr::new(2, 1)).trim(),
        "1_1: hello over there"
    );
    assert_eq!(
        fabric.received(Addr::new(1, 1)).trim(),
        "2_1: hello right back"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn intra_network_switching() {
    let mut fabric = launch(
        vec![vec![
            (1, vec![item(Addr::new(1, 2), b"one to two")]),
            (2, vec![item(Addr::new(1, 3), b"two to three")]),
            (3, vec![item(Addr::new(1, 1), b"three to one")]),
        ]],
        RuleSet::default(),
        no_faults(),
    );
    fabric.wait().await.unwrap();

    assert_eq!(fabric.received(Addr::new(1, 2)).trim(), "1_1: one to two");
    assert_eq!(fabric.received(Addr::new(1, 3)).trim(), "1_2: two to three");
    assert_eq!(fabric.received(Addr::new(1, 1)).trim(), "1_3: three to one");
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_and_wait_preserves_order() {
    let mut fabric = launch(
        vec![
            vec![(1, vec![
                item(Addr::new(2, 1), b"first"),
                item(Addr::new(2, 1), b"second"),
                item(Addr::new(2, 1), b"third"),
            ])],
            vec![(1, vec![])],
        ],
        RuleSet::default(),
        no_faults(),
    );
    fabric.wait().await.unwrap();

    let received = fabric.received(Addr::new(2, 1));
    let lines: Vec<&str> = received.lines().collect();
    assert_eq!(lines, ["1_1: first", "1_1: second", "1_1: third"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_fabric_drains() {
    let mut fabric = launch(
        vec![vec![(1, vec![]), (2, vec![])], vec![(1, vec![])]],
        RuleSet::default(),
        no_faults(),
    );
    fabric.wait().await.unwrap();

    assert_eq!(fabric.received(Addr::new(1, 1)), "");
    assert_eq!(fabric.received(Addr::new(2, 1)), "");
}
