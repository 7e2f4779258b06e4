//! Random traffic-script generation.

use std::path::Path;

use anyhow::{Context, Result};
use rand::Rng;

use crossbar_core::frame::Addr;
use crossbar_core::script::script_path;

use crate::topology::Topology;

const WORDS: &[&str] = &[
    "ping", "hello", "greetings", "checking in", "status report", "over and out",
];

/// Write one traffic script per node: up to four messages, each to a
/// distinct random partner anywhere in the fabric. A node with no
/// partners gets an empty script and only answers traffic.
pub fn generate<R: Rng>(dir: &Path, topo: &Topology, rng: &mut R) -> Result<()> {
    let all: Vec<Addr> = topo.addrs().collect();
    for &addr in &all {
        let mut pool: Vec<Addr> = all.iter().copied().filter(|&a| a != addr).collect();
        let mut lines = String::new();
        if !pool.is_empty() {
            let count = rng.gen_range(1..=pool.len().min(4));
            for _ in 0..count {
                let dest = pool.swap_remove(rng.gen_range(0..pool.len()));
                let word = WORDS[rng.gen_range(0..WORDS.len())];
                lines.push_str(&format!(
                    "{}_{}: {} from {}_{}\n",
                    dest.net, dest.node, word, addr.net, addr.node
                ));
            }
        }
        let path = script_path(dir, addr);
        std::fs::write(&path, lines)
            .with_context(|| format!("cannot write {}", path.display()))?;
    }
    Ok(())
}
