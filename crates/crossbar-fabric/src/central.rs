//! Central-switch forwarding core — the root of the fabric.
//!
//! Accepts one link per local switch, pushes the firewall rule set down
//! each link as it comes up, then routes frames between networks. Whole
//! networks on the global block list are firewalled here; when every
//! local switch has reported drained, the central switch tears the
//! fabric down and exits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crossbar_core::config::TimingConfig;
use crossbar_core::frame::{AckCode, Addr, Frame};
use crossbar_core::rules::RuleSet;

use crate::link::{self, new_registry, next_link_id, LinkHandle, LinkRegistry};
use crate::table::LearningTable;

type ReaderHandles = Arc<Mutex<Vec<JoinHandle<()>>>>;

pub struct CentralSwitch {
    port: u16,
    rules: RuleSet,
    timing: TimingConfig,
}

impl CentralSwitch {
    pub fn new(port: u16, rules: RuleSet, timing: TimingConfig) -> Self {
        Self { port, rules, timing }
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", self.port))
            .await
            .with_context(|| format!("central switch: failed to bind port {}", self.port))?;
        tracing::info!(port = self.port, "central switch listening");

        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<Frame>();
        let links = new_registry();
        let table: LearningTable<u8> = LearningTable::new();
        let completion = Arc::new(Notify::new());
        let readers: ReaderHandles = Arc::default();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        tokio::spawn(accept_loop(
            listener,
            Arc::new(rule_frames(&self.rules)),
            links.clone(),
            table.clone(),
            dispatch_tx.clone(),
            completion.clone(),
            readers.clone(),
            shutdown_tx.subscribe(),
        ));

        tokio::spawn(watch_drain(
            links.clone(),
            completion,
            Duration::from_millis(self.timing.drain_recheck_ms),
            shutdown_tx.clone(),
        ));

        // Give the tree a moment to assemble. Inbound frames queue up in
        // the dispatch channel meanwhile, so nothing is lost; a switch
        // that connects after this window can still miss early floods.
        tokio::time::sleep(Duration::from_millis(self.timing.settle_ms)).await;
        tracing::debug!("settle window elapsed, dispatching");

        let dispatcher = Dispatcher {
            global_nets: self.rules.global_nets.clone(),
            table,
            links: links.clone(),
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

        tracing::info!("all networks drained, shutting the fabric down");
        for entry in links.iter() {
            entry.value().terminate();
        }
        let grace = Duration::from_millis(self.timing.shutdown_grace_ms);
        let handles = std::mem::take(&mut *readers.lock().await);
        for handle in handles {
            let _ = tokio::time::timeout(grace, handle).await;
        }
        tracing::info!("central switch stopped");
        Ok(())
    }
}

/// The control-phase preamble queued onto every switch link: one rule
/// frame per blocked node, then the rules-complete broadcast. Each local
/// switch keeps only the rules addressed to its own network.
fn rule_frames(rules: &RuleSet) -> Vec<Frame> {
    let mut frames: Vec<Frame> = rules
        .node_blocks
        .iter()
        .map(|&(net, node)| {
            Frame::data(Addr::CONTROL, Addr::new(net, 0), 0, Bytes::from(vec![node]))
        })
        .collect();
    frames.push(Frame::control(Addr::CONTROL, Addr::CONTROL, 0, AckCode::RulesDone));
    frames
}

// ── Forwarding ────────────────────────────────────────────────────────────────

struct Dispatcher {
    global_nets: HashSet<u8>,
    table: LearningTable<u8>,
    links: LinkRegistry,
}

impl Dispatcher {
    fn handle(&self, frame: Frame) {
        // Globally-blocked destination network: the frame itself is
        // replaced by the nack, which then routes back toward the
        // source like any other frame.
        let frame = if frame.is_data() && self.global_nets.contains(&frame.dst.net) {
            tracing::debug!(frame = %frame, "destination network firewalled, bouncing nack");
            Frame::control(frame.dst, frame.src, frame.seq, AckCode::NackFirewall)
        } else {
            frame
        };

        match self.table.lookup(frame.dst.net) {
            Some(id) => match self.links.get(&id) {
                Some(entry) => {
                    tracing::debug!(link = id, frame = %frame, "routed");
                    entry.value().send(frame);
                }
                None => {
                    tracing::warn!(link = id, frame = %frame, "learned link gone, frame dropped");
                }
            },
            None => {
                let exclude = self.table.lookup(frame.src.net);
                tracing::debug!(frame = %frame, "flooding");
                for entry in self.links.iter() {
                    if Some(*entry.key()) == exclude {
                        continue;
                    }
                    entry.value().send(frame.clone());
                }
            }
        }
    }
}

// ── Acceptor ──────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    preamble: Arc<Vec<Frame>>,
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
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let id = next_link_id();
                let (rd, wr) = stream.into_split();
                let (tx, rx) = mpsc::unbounded_channel();
                let handle = LinkHandle::new(id, tx);
                // Rule delivery rides the normal outbound path, queued
                // ahead of anything the dispatcher will ever route here.
                for frame in preamble.iter() {
                    handle.send(frame.clone());
                }
                tokio::spawn(link::writer_task(id, wr, rx));
                links.insert(id, handle.clone());
                let reader = tokio::spawn(link::reader_task(
                    handle,
                    rd,
                    table.clone(),
                    |addr| addr.net,
                    dispatch_tx.clone(),
                    completion.clone(),
                ));
                readers.lock().await.push(reader);
                tracing::debug!(link = id, %peer, "switch link established");
            }
        }
    }
    tracing::debug!("acceptor stopped");
}

// ── Drain detection ───────────────────────────────────────────────────────────

/// Debounced check that every local switch has reported drained; once
/// both passes agree, the fabric-wide shutdown begins.
async fn watch_drain(
    links: LinkRegistry,
    completion: Arc<Notify>,
    recheck: Duration,
    shutdown_tx: broadcast::Sender<()>,
) {
    loop {
        completion.notified().await;
        if !all_finished(&links) {
            continue;
        }
        tokio::time::sleep(recheck).await;
        if !all_finished(&links) {
            continue;
        }
        let _ = shutdown_tx.send(());
        return;
    }
}

fn all_finished(links: &LinkRegistry) -> bool {
    !links.is_empty() && links.iter().all(|entry| entry.value().is_finished())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
