//! dockyard-discovery — finding engine hosts that are ready to take work.
//!
//! A cloud either names a discovery label, in which case candidate hosts
//! come from online nodes in the [`NodePool`] carrying that label, or it
//! only has its static fallback. Every candidate is confirmed with a
//! [`ConnectivityProbe`] before it is handed out.

pub mod pool;
pub mod probe;
pub mod resolver;

pub use pool::{NodePool, NodeRegistry, NodeStatus, PoolNode};
pub use probe::{ConnectivityProbe, TcpProbe};
pub use resolver::{HostResolver, LabelHostResolver, StaticHostResolver, build_resolver};
