//! The end-station: attaches to its local switch, plays a traffic script
//! over stop-and-wait ARQ with injected faults, and records everything
//! delivered to it.

pub mod fault;
pub mod node;

pub use fault::FaultInjector;
pub use node::Node;
