//! Garden Node Library
//!
//! This library provides the runtime of a garden mesh node: the authenticated
//! packet transport shared by every node, the encrypted command channel, the
//! command router that changes node configuration, and the broker bridge used
//! by the controller.

pub mod command;
pub mod config;
pub mod error;
pub mod mesh;
pub mod node;
pub mod platform;
pub mod testing;

pub use error::NodeError;
pub use node::{Node, NodeContext, NodeInputs, Shutdown};
