//! kelda-minion — the host-side half of the control plane.
//!
//! Each machine runs a minion: the RPC server the foreman configures it
//! through, the supervisor that keeps the host's infrastructure containers
//! converged, and (on the etcd leader) the network master loop that drives
//! OVN.

pub mod docker;
pub mod ipdef;
pub mod network;
pub mod ovsdb;
pub mod server;
pub mod supervisor;

pub use docker::{CachingRuntime, ContainerRuntime, DockerError, RunOptions, RunningContainer};
pub use ovsdb::{AclRule, LoadBalancerVip, OvsdbClient, RouterPort, SwitchPort};
pub use server::MinionRpc;
pub use supervisor::{ExecRunner, Supervisor};
