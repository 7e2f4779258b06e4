//! Per-node traffic scripts and output logs.
//!
//! A node's outbound work is a line-oriented script, one item per line:
//! `<destNet>_<destNode>: <payload>`. Sequence numbers come from line
//! position (0-based). The node's received log uses the mirror format,
//! `<srcNet>_<srcNode>: <payload>`, one line per accepted frame.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;

use crate::frame::Addr;

/// One outbound work item. The sequence number is the item's position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub dest: Addr,
    pub payload: Bytes,
}

/// Parse a traffic script.
pub fn parse_script(text: &str) -> Result<Vec<WorkItem>, ScriptError> {
    let mut items = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }
        let (dest_part, payload) = raw
            .split_once(": ")
            .ok_or_else(|| ScriptError::BadLine { line })?;
        let (net_part, node_part) = dest_part
            .split_once('_')
            .ok_or_else(|| ScriptError::BadLine { line })?;
        let net: u8 = net_part
            .trim()
            .parse()
            .map_err(|_| ScriptError::BadLine { line })?;
        let node: u8 = node_part
            .trim()
            .parse()
            .map_err(|_| ScriptError::BadLine { line })?;
        let dest = Addr::new(net, node);
        if dest.is_reserved() {
            return Err(ScriptError::ReservedAddress { line });
        }
        if payload.is_empty() {
            return Err(ScriptError::EmptyPayload { line });
        }
        if payload.len() > u8::MAX as usize {
            return Err(ScriptError::PayloadTooLong {
                line,
                len: payload.len(),
            });
        }
        items.push(WorkItem {
            dest,
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        });
    }
    Ok(items)
}

/// Load a node's script from its conventional path under `dir`.
pub fn load_script(dir: &Path, addr: Addr) -> Result<Vec<WorkItem>, ScriptError> {
    let path = script_path(dir, addr);
    let text =
        std::fs::read_to_string(&path).map_err(|e| ScriptError::ReadFailed(path, e))?;
    parse_script(&text)
}

/// `node<net>_<node>.txt` — a node's outbound traffic script.
pub fn script_path(dir: &Path, addr: Addr) -> PathBuf {
    dir.join(format!("node{}_{}.txt", addr.net, addr.node))
}

/// `node<net>_<node>output.txt` — a node's received-message log.
pub fn output_path(dir: &Path, addr: Addr) -> PathBuf {
    dir.join(format!("node{}_{}output.txt", addr.net, addr.node))
}

/// One received-log line (without trailing newline).
pub fn output_line(src: Addr, payload: &[u8]) -> String {
    format!("{}_{}: {}", src.net, src.node, String::from_utf8_lossy(payload))
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("script line {line}: expected <net>_<node>: <payload>")]
    BadLine { line: usize },
    #[error("script line {line}: address 0 is reserved for control traffic")]
    ReservedAddress { line: usize },
    #[error("script line {line}: payload is empty")]
    EmptyPayload { line: usize },
    #[error("script line {line}: payload is {len} bytes, limit is 255")]
    PayloadTooLong { line: usize, len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_items_in_order() {
        let items = parse_script("2_1: hello\n1_3: second message\n").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].dest, Addr::new(2, 1));
        assert_eq!(items[0].payload, Bytes::from_static(b"hello"));
        assert_eq!(items[1].dest, Addr::new(1, 3));
    }

    #[test]
    fn payload_may_contain_separator() {
        let items = parse_script("2_1: a: b: c\n").unwrap();
        assert_eq!(items[0].payload, Bytes::from_static(b"a: b: c"));
    }

    #[test]
    fn rejects_reserved_destination() {
        assert!(matches!(
            parse_script("0_1: x").unwrap_err(),
            ScriptError::ReservedAddress { line: 1 }
        ));
        assert!(matches!(
            parse_script("1_0: x").unwrap_err(),
            ScriptError::ReservedAddress { line: 1 }
        ));
    }

    #[test]
    fn rejects_oversized_payload() {
        let line = format!("1_1: {}", "a".repeat(256));
        assert!(matches!(
            parse_script(&line).unwrap_err(),
            ScriptError::PayloadTooLong { line: 1, len: 256 }
        ));
    }

    #[test]
    fn conventional_paths() {
        let dir = Path::new("/tmp/run");
        assert_eq!(
            script_path(dir, Addr::new(1, 2)),
            Path::new("/tmp/run/node1_2.txt")
        );
        assert_eq!(
            output_path(dir, Addr::new(1, 2)),
            Path::new("/tmp/run/node1_2output.txt")
        );
    }

    #[test]
    fn output_line_format() {
        assert_eq!(output_line(Addr::new(1, 1), b"hello"), "1_1: hello");
    }
}
