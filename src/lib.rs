// src/lib.rs
//! Distributed name registry.
//!
//! Each node runs one registrar task; registrars replicate their local
//! `name -> principal` bindings to every connected peer and converge
//! without coordination: concurrent registrations of the same name on
//! different nodes are resolved by a total order on node identities, and
//! failed principals or peers are cleaned out by liveness monitoring.
//!
//! Reads (`whereis_name`, the enumeration queries, `send`) are lock-free
//! lookups on a shared table; only mutations are serialized through the
//! registrar.

pub mod config;
pub mod error;
pub mod mailbox;
pub mod mesh;
pub mod monitor;
pub mod network;
pub mod node;
pub mod principal;
pub mod registrar;
pub mod registry;

pub use config::{NodeConfig, Priority};
pub use error::{Error, Result};
pub use mesh::{MeshNet, MeshTransport};
pub use monitor::{Down, DownSink, ExitReason, MonitorHandle};
pub use network::{MembershipEvent, TcpTransport, Transport, PROC_ENDPOINT, REGISTRAR_ENDPOINT};
pub use node::Node;
pub use principal::{NodeId, PrincipalRef};
pub use registrar::PeerMsg;
pub use registry::{Binding, Meta, Origin, RegistryTable};
