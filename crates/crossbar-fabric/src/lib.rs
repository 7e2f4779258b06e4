//! The crossbar switching fabric: per-link adapters, learning tables, and
//! the local and central switch forwarding cores.

pub mod central;
pub mod link;
pub mod local;
pub mod table;

pub use central::CentralSwitch;
pub use link::{next_link_id, new_registry, LinkHandle, LinkId, LinkRegistry};
pub use local::LocalSwitch;
pub use table::LearningTable;
