//! crossbard — two-tier switched internetwork simulator.
//!
//! Brings the whole fabric up in one process: the central switch, one
//! local switch per network, and every node, all as tokio tasks. The
//! run ends when the central switch observes the fabric drained and
//! tears it down.

use anyhow::{bail, Context, Result};
use rand::thread_rng;

use crossbar_core::config::CrossbarConfig;
use crossbar_core::rules::RuleSet;
use crossbar_core::script::{load_script, output_path};
use crossbar_fabric::{CentralSwitch, LocalSwitch};
use crossbar_node::Node;

mod scriptgen;
mod topology;

use topology::Topology;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CrossbarConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CrossbarConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CrossbarConfig::default()
    });

    let mut args = std::env::args().skip(1);
    let usage = "usage: crossbard <nodes> <networks>";
    let nodes: usize = args
        .next()
        .context(usage)?
        .parse()
        .context("node count must be a number")?;
    let networks: usize = args
        .next()
        .context(usage)?
        .parse()
        .context("network count must be a number")?;

    let topo = Topology::assign(nodes, networks, &config.topology, &mut thread_rng())?;
    tracing::info!(nodes, networks, "topology assigned");

    let work_dir = config.paths.work_dir.clone();
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("cannot create {}", work_dir.display()))?;
    scriptgen::generate(&work_dir, &topo, &mut thread_rng())
        .context("traffic script generation failed")?;

    // Firewall rules feed the central switch; a missing file is fatal
    // unless the config says to start with an empty one.
    let firewall = work_dir.join(&config.paths.firewall_file);
    if !firewall.exists() {
        if config.paths.create_missing_firewall {
            std::fs::write(&firewall, "")
                .with_context(|| format!("cannot create {}", firewall.display()))?;
            tracing::warn!(path = %firewall.display(), "firewall file missing, created empty");
        } else {
            bail!("firewall file {} not found", firewall.display());
        }
    }
    let rules = RuleSet::load(&firewall)
        .with_context(|| format!("cannot load {}", firewall.display()))?;
    tracing::info!(
        blocked_networks = rules.global_nets.len(),
        blocked_nodes = rules.node_blocks.len(),
        "firewall rules loaded"
    );

    // ── Spawn the fabric ─────────────────────────────────────────────────────

    let central = CentralSwitch::new(config.topology.central_port, rules, config.timing.clone());
    let central_task = tokio::spawn(central.run());

    let mut workers = Vec::new();
    for network in &topo.networks {
        let switch = LocalSwitch::new(
            network.net,
            network.listen_port,
            config.topology.central_port,
            config.timing.clone(),
        );
        workers.push(("switch", tokio::spawn(switch.run())));
    }

    for network in &topo.networks {
        for &addr in &network.nodes {
            let work = load_script(&work_dir, addr)
                .with_context(|| format!("cannot load script for node {addr}"))?;
            tracing::info!(node = %addr, items = work.len(), "node starting");
            let node = Node::new(
                addr,
                network.listen_port,
                work,
                output_path(&work_dir, addr),
                config.timing.clone(),
                config.fault.clone(),
            );
            workers.push(("node", tokio::spawn(node.run())));
        }
    }

    // The central switch exiting cleanly is the run completing; the
    // shutdown it broadcasts unwinds everything beneath it.
    central_task
        .await
        .context("central switch task panicked")??;

    for (kind, task) in workers {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(kind, error = %e, "worker exited with error"),
            Err(e) => tracing::warn!(kind, error = %e, "worker task panicked"),
        }
    }
    tracing::info!("fabric drained and shut down");
    Ok(())
}
