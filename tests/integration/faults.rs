use crate::*;

#[tokio::test(flavor = "multi_thread")]
async fn permanent_corruption_delivers_nothing_but_drains() {
    // Every transmitted copy is damaged; the receiver nacks, the sender
    // abandons, and the fabric still drains and shuts down cleanly.
    let corrupt = FaultConfig {
        corrupt_percent: 100,
        ack_drop_percent: 0,
    };
    let mut fabric = launch(
        vec![
            vec![(1, vec![item(Addr::new(2, 1), b"doomed")])],
            vec![(1, vec![])],
        ],
        RuleSet::default(),
        corrupt,
    );
    fabric.wait().await.unwrap();

    assert_eq!(fabric.received(Addr::new(2, 1)), "");
}

#[tokio::test(flavor = "multi_thread")]
async fn withheld_acks_deliver_exactly_once() {
    // The receiver accepts but never acks: the sender retransmits until
    // its budget runs out, and duplicate suppression keeps the log to a
    // single line.
    let drop_acks = FaultConfig {
        corrupt_percent: 0,
        ack_drop_percent: 100,
    };
    let mut fabric = launch(
        vec![
            vec![(1, vec![item(Addr::new(2, 1), b"persistent")])],
            vec![(1, vec![])],
        ],
        RuleSet::default(),
        drop_acks,
    );
    fabric.wait().await.unwrap();

    let received = fabric.received(Addr::new(2, 1));
    let lines: Vec<&str> = received.lines().collect();
    assert_eq!(lines, ["1_1: persistent"]);
}
