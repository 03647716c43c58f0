//! Load-balancer side of the cluster
//!
//! A [`StatelessForwarder`] sits in front of the clustered nodes, keeps
//! itself in the signalling path with Record-Route, and steers in-dialog
//! requests to whichever node an [`ActiveNodeResolver`] names.

pub mod forwarder;
pub mod resolver;

pub use forwarder::{ForwardDecision, StatelessForwarder};
pub use resolver::{ActiveNodeResolver, ClusterMember, LeaseNodeResolver, StaticNodeMap};
