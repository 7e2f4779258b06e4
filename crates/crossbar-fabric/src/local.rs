//! Local-switch forwarding core — one instance per network.
//!
//! Owns the per-network dispatch queue, learning table, and node-link
//! registry. Forwards and floods frames among its attached nodes,
//! enforces the locally-blocked node set on traffic arriving from other
//! networks, and relays everything non-local up to the central switch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crossbar_core::config::TimingConfig;
use crossbar_core::frame::{read_frame, AckCode, Addr, Frame, FrameError};
use crossbar_core::net::connect_retry;

use crate::link::{self, new_registry, next_link_id, LinkHandle, LinkRegistry};
use crate::table::LearningTable;

type ReaderHandles = Arc<Mutex<Vec<JoinHandle<()>>>>;

pub struct LocalSwitch {
    net: u8,
    listen_port: u16,
    central_port: u16,
    timing: TimingConfig,
}

impl LocalSwitch {
    pub fn new(net: u8, listen_port: u16, central_port: u16, timing: TimingConfig) -> Self {
        Self {
            net,
            listen_port,
            central_port,
            timing,
        }
    }

    pub async fn run(self) -> Result<()> {
        let net = self.net;

        // Uplink to the central switch, retried until the root is up.
        let uplink = connect_retry(self.central_port, self.timing.connect_retry_ms).await;
        let (mut up_rd, up_wr) = uplink.into_split();
        tracing::debug!(net, "uplink connected");

        // Control phase: collect this network's firewall rules.
        let blocked = read_rules(net, &mut up_rd).await?;
        tracing::info!(net, blocked = ?blocked, "firewall rules received");

        // One writer owns the uplink socket; the dispatcher's relays and
        // the control acks share its channel, so upstream order holds.
        let uplink_id = next_link_id();
        let (uplink_tx, uplink_rx) = mpsc::unbounded_channel();
        tokio::spawn(link::writer_task(uplink_id, up_wr, uplink_rx));

        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<Frame>();
        let links = new_registry();
        let table: LearningTable<u8> = LearningTable::new();
        let completion = Arc::new(Notify::new());
        let readers: ReaderHandles = Arc::default();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        tokio::spawn(uplink_receiver(
            net,
            up_rd,
            dispatch_tx.clone(),
            uplink_tx.clone(),
            shutdown_tx.clone(),
        ));

        let listener = TcpListener::bind(("127.0.0.1", self.listen_port))
            .await
            .with_context(|| format!("network {net}: failed to bind port {}", self.listen_port))?;
        tokio::spawn(accept_loop(
            net,
            listener,
            links.clone(),
            table.clone(),
            dispatch_tx.clone(),
            completion.clone(),
            readers.clone(),
            shutdown_tx.subscribe(),
        ));

        tokio::spawn(watch_drain(
            net,
            links.clone(),
            completion,
            uplink_tx.clone(),
            Duration::from_millis(self.timing.drain_recheck_ms),
            shutdown_tx.subscribe(),
        ));

        // Dispatcher: single consumer, so queue order is delivery order.
        let dispatcher = Dispatcher {
            net,
            blocked,
            table,
            links: links.clone(),
            uplink_tx,
        };
        let mut shutdown_rx = shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                frame = dispatch_rx.recv() => {
                    match frame {
                        Some(frame) => dispatcher.handle(frame),
                        None => break,
                    }
                }
            }
        }

        // Teardown: shutdown handshake on every node link, bounded wait.
        tracing::debug!(net, "dispatcher stopped, terminating node links");
        for entry in links.iter() {
            entry.value().terminate();
        }
        let grace = Duration::from_millis(self.timing.shutdown_grace_ms);
        let handles = std::mem::take(&mut *readers.lock().await);
        for handle in handles {
            let _ = tokio::time::timeout(grace, handle).await;
        }
        tracing::info!(net, "local switch stopped");
        Ok(())
    }
}

// ── Forwarding ────────────────────────────────────────────────────────────────

/// Per-frame forwarding decisions; state is fixed once the control phase
/// ends, so this is plain shared-read data.
struct Dispatcher {
    net: u8,
    blocked: HashSet<u8>,
    table: LearningTable<u8>,
    links: LinkRegistry,
    uplink_tx: mpsc::UnboundedSender<Frame>,
}

impl Dispatcher {
    fn handle(&self, frame: Frame) {
        // Outbound relay: not our network's traffic.
        if frame.dst.net != self.net {
            tracing::debug!(net = self.net, frame = %frame, "relaying upstream");
            let _ = self.uplink_tx.send(frame);
            return;
        }

        // Firewall: only data frames from outside this network are
        // subject to it; acks and intra-network traffic pass.
        if self.firewall_blocks(&frame) {
            tracing::debug!(net = self.net, frame = %frame, "firewalled, bouncing nack");
            let nack = Frame::control(
                Addr::new(self.net, frame.dst.node),
                frame.src,
                frame.seq,
                AckCode::NackFirewall,
            );
            let _ = self.uplink_tx.send(nack);
            return;
        }

        match self.table.lookup(frame.dst.node) {
            Some(id) => match self.links.get(&id) {
                Some(entry) => {
                    tracing::debug!(net = self.net, link = id, frame = %frame, "switched");
                    entry.value().send(frame);
                }
                None => {
                    tracing::warn!(net = self.net, link = id, frame = %frame, "learned link gone, frame dropped");
                }
            },
            None => {
                // Destination not learned yet: flood, but never back out
                // the link the (local) source was learned on.
                let exclude = if frame.src.net == self.net {
                    self.table.lookup(frame.src.node)
                } else {
                    None
                };
                tracing::debug!(net = self.net, frame = %frame, "flooding");
                for entry in self.links.iter() {
                    if Some(*entry.key()) == exclude {
                        continue;
                    }
                    entry.value().send(frame.clone());
                }
            }
        }
    }

    fn firewall_blocks(&self, frame: &Frame) -> bool {
        frame.is_data() && frame.src.net != self.net && self.blocked.contains(&frame.dst.node)
    }
}

// ── Control phase ─────────────────────────────────────────────────────────────

/// Read firewall rule frames from the central switch until the broadcast
/// rules-complete control frame arrives. Rules for other networks flood
/// past and are ignored.
async fn read_rules<R>(net: u8, rd: &mut R) -> Result<HashSet<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut blocked = HashSet::new();
    loop {
        match read_frame(rd).await {
            Ok(frame) => {
                if frame.dst.net == 0 {
                    if frame.ack_code() == Some(AckCode::RulesDone) {
                        return Ok(blocked);
                    }
                    tracing::warn!(net, frame = %frame, "unexpected broadcast during rule setup");
                } else if frame.dst.net == net {
                    if let Some(payload) = frame.payload() {
                        blocked.insert(payload[0]);
                    }
                }
            }
            Err(e) if e.is_lost() => {
                tracing::warn!(net, error = %e, "frame lost during rule setup");
            }
            Err(e) => return Err(e).context("uplink failed during rule setup"),
        }
    }
}

// ── Uplink receiver ───────────────────────────────────────────────────────────

/// Decode frames arriving from the central switch. A shutdown control
/// frame is acknowledged and triggers local teardown; inter-network
/// flood noise is dropped; the rest is enqueued for dispatch.
async fn uplink_receiver<R>(
    net: u8,
    mut rd: R,
    dispatch_tx: mpsc::UnboundedSender<Frame>,
    uplink_tx: mpsc::UnboundedSender<Frame>,
    shutdown_tx: broadcast::Sender<()>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut rd).await {
            Ok(frame) => {
                if frame.ack_code() == Some(AckCode::Shutdown) {
                    tracing::info!(net, "shutdown received from central switch");
                    let _ = uplink_tx.send(Frame::control(
                        Addr::new(net, 0),
                        Addr::CONTROL,
                        0,
                        AckCode::Ok,
                    ));
                    let _ = shutdown_tx.send(());
                    return;
                }
                if frame.dst.net != net {
                    continue; // flooded for some other network
                }
                if dispatch_tx.send(frame).is_err() {
                    return;
                }
            }
            Err(e) if e.is_lost() => {
                tracing::warn!(net, error = %e, "frame lost on uplink");
            }
            Err(FrameError::Closed) => {
                tracing::debug!(net, "uplink closed");
                let _ = shutdown_tx.send(());
                return;
            }
            Err(e) => {
                tracing::warn!(net, error = %e, "uplink read failed");
                let _ = shutdown_tx.send(());
                return;
            }
        }
    }
}

// ── Acceptor ──────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    net: u8,
    listener: TcpListener,
    links: LinkRegistry,
    table: LearningTable<u8>,
    dispatch_tx: mpsc::UnboundedSender<Frame>,
    completion: Arc<Notify>,
    readers: ReaderHandles,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((init, peer)) => {
                        tracing::debug!(net, %peer, "node connected");
                        tokio::spawn(establish_node_link(
                            net,
                            init,
                            links.clone(),
                            table.clone(),
                            dispatch_tx.clone(),
                            completion.clone(),
                            readers.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(net, error = %e, "accept failed");
                    }
                }
            }
        }
    }
    tracing::debug!(net, "acceptor stopped");
}

/// Run the port handshake for one freshly-accepted node, then register
/// the data link and start its adapter tasks. Registration last: the
/// dispatcher only ever sees fully-established links.
async fn establish_node_link(
    net: u8,
    init: TcpStream,
    links: LinkRegistry,
    table: LearningTable<u8>,
    dispatch_tx: mpsc::UnboundedSender<Frame>,
    completion: Arc<Notify>,
    readers: ReaderHandles,
) {
    let stream = match node_handshake(init).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(net, error = %e, "node handshake failed, link dropped");
            return;
        }
    };

    let id = next_link_id();
    let (rd, wr) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = LinkHandle::new(id, tx);
    tokio::spawn(link::writer_task(id, wr, rx));
    links.insert(id, handle.clone());
    let reader = tokio::spawn(link::reader_task(
        handle,
        rd,
        table,
        |addr| addr.node,
        dispatch_tx,
        completion,
    ));
    readers.lock().await.push(reader);
    tracing::debug!(net, link = id, "node link established");
}

/// Offer the node an ephemeral data port over its initial connection,
/// wait for the ack, then accept the node on the data port.
async fn node_handshake(init: TcpStream) -> Result<TcpStream> {
    let data_listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("failed to bind data listener")?;
    let port = data_listener.local_addr()?.port();

    let (mut rd, mut wr) = init.into_split();
    let offer = Frame::data(
        Addr::CONTROL,
        Addr::CONTROL,
        0,
        Bytes::copy_from_slice(&port.to_le_bytes()),
    );
    wr.write_all(&offer.encode()).await.context("port offer failed")?;

    loop {
        match read_frame(&mut rd).await {
            Ok(frame) if frame.ack_code() == Some(AckCode::Ok) => break,
            Ok(frame) => {
                tracing::debug!(frame = %frame, "ignoring frame while awaiting port ack");
            }
            Err(e) if e.is_lost() => {
                tracing::warn!(error = %e, "frame lost during handshake");
            }
            Err(e) => return Err(e).context("init stream failed during handshake"),
        }
    }
    drop((rd, wr));

    let (data, _) = data_listener.accept().await.context("data accept failed")?;
    Ok(data)
}

// ── Drain detection ───────────────────────────────────────────────────────────

/// Debounced all-links-finished check. Two passes with a gap guard
/// against stragglers that are still mid-handshake; once both pass, the
/// drained report goes upstream and the watcher retires.
async fn watch_drain(
    net: u8,
    links: LinkRegistry,
    completion: Arc<Notify>,
    uplink_tx: mpsc::UnboundedSender<Frame>,
    recheck: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = completion.notified() => {}
        }
        if !all_finished(&links) {
            continue;
        }
        tokio::time::sleep(recheck).await;
        if !all_finished(&links) {
            continue;
        }
        tracing::info!(net, "all node links drained, reporting to central switch");
        let _ = uplink_tx.send(Frame::control(
            Addr::new(net, 0),
            Addr::CONTROL,
            0,
            AckCode::Done,
        ));
        return;
    }
}

fn all_finished(links: &LinkRegistry) -> bool {
    !links.is_empty() && links.iter().all(|entry| entry.value().is_finished())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn test_link(
        links: &LinkRegistry,
        table: &LearningTable<u8>,
        node: u8,
    ) -> (LinkHandle, mpsc::UnboundedReceiver<Frame>) {
        let id = next_link_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = LinkHandle::new(id, tx);
        links.insert(id, handle.clone());
        table.learn(node, id);
        (handle, rx)
    }

    fn dispatcher(net: u8, blocked: &[u8]) -> (Dispatcher, mpsc::UnboundedReceiver<Frame>) {
        let (uplink_tx, uplink_rx) = mpsc::unbounded_channel();
        (
            Dispatcher {
                net,
                blocked: blocked.iter().copied().collect(),
                table: LearningTable::new(),
                links: new_registry(),
                uplink_tx,
            },
            uplink_rx,
        )
    }

    #[tokio::test]
    async fn non_local_traffic_relays_upstream() {
        let (d, mut uplink) = dispatcher(1, &[]);
        let frame = Frame::data(Addr::new(1, 1), Addr::new(2, 1), 0, &b"out"[..]);
        d.handle(frame.clone());
        assert_eq!(uplink.recv().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn learned_destination_is_unicast() {
        let (d, mut uplink) = dispatcher(1, &[]);
        let (_h1, mut rx1) = test_link(&d.links, &d.table, 1);
        let (_h2, mut rx2) = test_link(&d.links, &d.table, 2);

        let frame = Frame::data(Addr::new(1, 1), Addr::new(1, 2), 0, &b"hi"[..]);
        d.handle(frame.clone());

        assert_eq!(rx2.recv().await.unwrap(), frame);
        assert!(matches!(rx1.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(uplink.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn unknown_destination_floods_except_source_link() {
        let (d, _uplink) = dispatcher(1, &[]);
        let (_h1, mut rx1) = test_link(&d.links, &d.table, 1);
        let (_h2, mut rx2) = test_link(&d.links, &d.table, 2);

        // Node 3 not learned: node 1's frame floods to node 2 only.
        let frame = Frame::data(Addr::new(1, 1), Addr::new(1, 3), 0, &b"who"[..]);
        d.handle(frame.clone());

        assert_eq!(rx2.recv().await.unwrap(), frame);
        assert!(matches!(rx1.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn remote_source_floods_to_every_link() {
        let (d, _uplink) = dispatcher(1, &[]);
        let (_h1, mut rx1) = test_link(&d.links, &d.table, 1);
        let (_h2, mut rx2) = test_link(&d.links, &d.table, 2);

        // Source 2:1 was never learned here, so nothing is excluded —
        // even though its node ID collides with local node 1.
        let frame = Frame::data(Addr::new(2, 1), Addr::new(1, 3), 0, &b"in"[..]);
        d.handle(frame.clone());

        assert_eq!(rx1.recv().await.unwrap(), frame);
        assert_eq!(rx2.recv().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn remote_data_to_blocked_node_bounces_nack() {
        let (d, mut uplink) = dispatcher(2, &[1]);
        let (_h1, mut rx1) = test_link(&d.links, &d.table, 1);

        let frame = Frame::data(Addr::new(1, 1), Addr::new(2, 1), 9, &b"blocked"[..]);
        d.handle(frame);

        let nack = uplink.recv().await.unwrap();
        assert_eq!(nack.ack_code(), Some(AckCode::NackFirewall));
        assert_eq!(nack.dst, Addr::new(1, 1));
        assert_eq!(nack.src, Addr::new(2, 1));
        assert_eq!(nack.seq, 9);
        assert!(matches!(rx1.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn intra_network_traffic_bypasses_firewall() {
        let (d, mut uplink) = dispatcher(2, &[1]);
        let (_h1, mut rx1) = test_link(&d.links, &d.table, 1);

        let frame = Frame::data(Addr::new(2, 2), Addr::new(2, 1), 0, &b"local"[..]);
        d.handle(frame.clone());

        assert_eq!(rx1.recv().await.unwrap(), frame);
        assert!(matches!(uplink.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn acks_bypass_firewall() {
        let (d, mut uplink) = dispatcher(2, &[1]);
        let (_h1, mut rx1) = test_link(&d.links, &d.table, 1);

        let ack = Frame::control(Addr::new(1, 1), Addr::new(2, 1), 0, AckCode::Ok);
        d.handle(ack.clone());

        assert_eq!(rx1.recv().await.unwrap(), ack);
        assert!(matches!(uplink.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn rule_frames_accumulate_until_rules_done() {
        let rule = |net, node| {
            Frame::data(Addr::CONTROL, Addr::new(net, 0), 0, Bytes::from(vec![node]))
        };
        let mut wire = rule(1, 3).encode().to_vec();
        wire.extend_from_slice(&rule(2, 7).encode()); // other network, ignored
        wire.extend_from_slice(&rule(1, 4).encode());
        wire.extend_from_slice(
            &Frame::control(Addr::CONTROL, Addr::CONTROL, 0, AckCode::RulesDone).encode(),
        );

        let mut reader = &wire[..];
        let blocked = read_rules(1, &mut reader).await.unwrap();
        assert_eq!(blocked, [3, 4].into_iter().collect());
    }
}
