//! Firewall rule file parsing.
//!
//! Line-oriented text, one rule per line: `<networkID>_<target>:<comment>`.
//! A target of `#` blocks the whole network fabric-wide; a numeric target
//! blocks that single node within the named network. Rules are loaded once
//! at central-switch startup and never change during a run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Parsed firewall configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    /// Networks blocked fabric-wide, enforced at the central switch.
    pub global_nets: HashSet<u8>,
    /// `(network, node)` blocks, delivered to the owning local switch
    /// as control-phase rule frames.
    pub node_blocks: Vec<(u8, u8)>,
}

impl RuleSet {
    pub fn is_empty(&self) -> bool {
        self.global_nets.is_empty() && self.node_blocks.is_empty()
    }

    /// Read and parse a rule file.
    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RuleError::ReadFailed(path.to_path_buf(), e))?;
        parse_rules(&text)
    }
}

/// Parse rule text. Blank lines are skipped; anything after the first `:`
/// on a line is ignored.
pub fn parse_rules(text: &str) -> Result<RuleSet, RuleError> {
    let mut rules = RuleSet::default();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let rule = trimmed.split(':').next().unwrap_or(trimmed);
        let (net_part, target) = rule
            .split_once('_')
            .ok_or_else(|| RuleError::BadLine { line })?;
        let net: u8 = net_part
            .trim()
            .parse()
            .map_err(|_| RuleError::BadLine { line })?;
        if net == 0 {
            return Err(RuleError::ReservedAddress { line });
        }
        let target = target.trim();
        if target == "#" {
            rules.global_nets.insert(net);
        } else {
            let node: u8 = target.parse().map_err(|_| RuleError::BadLine { line })?;
            if node == 0 {
                return Err(RuleError::ReservedAddress { line });
            }
            rules.node_blocks.push((net, node));
        }
    }
    Ok(rules)
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("rule line {line}: expected <net>_<node-or-#>:<comment>")]
    BadLine { line: usize },
    #[error("rule line {line}: address 0 is reserved for control traffic")]
    ReservedAddress { line: usize },
}
