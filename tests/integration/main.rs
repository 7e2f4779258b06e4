//! End-to-end fabric tests over loopback TCP.
//!
//! Each test assembles a miniature fabric — central switch, local
//! switches, nodes — inside the test process, lets it run to drain,
//! and inspects the received logs the nodes wrote.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crossbar_core::config::{FaultConfig, TimingConfig};
use crossbar_core::frame::Addr;
use crossbar_core::rules::RuleSet;
use crossbar_core::script::{output_path, WorkItem};
use crossbar_fabric::{CentralSwitch, LocalSwitch};
use crossbar_node::Node;

mod delivery;
mod faults;
mod firewall;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Production timings compressed so a full run drains in well under a
/// second of quiet time.
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        ack_timeout_ms: 300,
        retry_budget: 2,
        settle_ms: 300,
        drain_recheck_ms: 200,
        shutdown_grace_ms: 500,
        connect_retry_ms: 10,
        send_jitter_ms: 0,
    }
}

pub fn no_faults() -> FaultConfig {
    FaultConfig {
        corrupt_percent: 0,
        ack_drop_percent: 0,
    }
}

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind probe")
        .local_addr()
        .expect("probe addr")
        .port()
}

pub fn item(dest: Addr, payload: &'static [u8]) -> WorkItem {
    WorkItem {
        dest,
        payload: bytes::Bytes::from_static(payload),
    }
}

static RUN: AtomicU32 = AtomicU32::new(0);

pub struct Fabric {
    dir: PathBuf,
    central: Option<JoinHandle<Result<()>>>,
    workers: Vec<JoinHandle<Result<()>>>,
}

/// Spawn a whole fabric. `networks[i]` holds net `i + 1` as
/// `(node_id, work)` pairs; everything runs on ephemeral loopback ports
/// with a per-test work directory.
pub fn launch(
    networks: Vec<Vec<(u8, Vec<WorkItem>)>>,
    rules: RuleSet,
    fault: FaultConfig,
) -> Fabric {
    let dir = std::env::temp_dir().join(format!(
        "crossbar-it-{}-{}",
        std::process::id(),
        RUN.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).expect("create work dir");
    let timing = fast_timing();
    let central_port = free_port();
    let central = tokio::spawn(CentralSwitch::new(central_port, rules, timing.clone()).run());

    let mut workers = Vec::new();
    for (i, nodes) in networks.into_iter().enumerate() {
        let net = (i + 1) as u8;
        let port = free_port();
        workers.push(tokio::spawn(
            LocalSwitch::new(net, port, central_port, timing.clone()).run(),
        ));
        for (id, work) in nodes {
            let addr = Addr::new(net, id);
            workers.push(tokio::spawn(
                Node::new(
                    addr,
                    port,
                    work,
                    output_path(&dir, addr),
                    timing.clone(),
                    fault.clone(),
                )
                .run(),
            ));
        }
    }
    Fabric {
        dir,
        central: Some(central),
        workers,
    }
}

impl Fabric {
    /// Run to drain. The central switch exiting cleanly is the end of
    /// the run; everything beneath it unwinds from its shutdown.
    pub async fn wait(&mut self) -> Result<()> {
        let central = self.central.take().context("fabric already waited")?;
        tokio::time::timeout(Duration::from_secs(30), async {
            central.await.context("central switch panicked")??;
            for worker in std::mem::take(&mut self.workers) {
                let _ = worker.await;
            }
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("fabric did not drain in time")?
    }

    /// The received log a node wrote, empty if it never wrote one.
    pub fn received(&self, addr: Addr) -> String {
        std::fs::read_to_string(output_path(&self.dir, addr)).unwrap_or_default()
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}
