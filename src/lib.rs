//! netsteer: client core of a network interface lifecycle manager.
//!
//! One worker per managed interface or modem drives its device between
//! well-defined administrative states by invoking remote operations on a
//! system-bus object model. The core plans a transition path per interface,
//! resolves dependencies between interfaces (a bridge needs its ports, a
//! vlan its base device), binds abstract transitions to concrete service
//! methods through a schema engine, executes the calls cooperatively across
//! many workers, and matches the asynchronous completion events that arrive
//! out of order.
//!
//! The bus transport, the schema engine and the device discovery are
//! collaborators behind traits ([`rpc::RpcClient`], [`schema::SchemaEngine`],
//! and the [`inventory`] read model); everything else lives here.
//!
//! ```no_run
//! use std::sync::Arc;
//! use netsteer::{
//!     config::InterfaceConfig, exec::Scheduler, graph::WorkerGraph,
//!     inventory::Inventory, state::{IfState, TargetRange},
//! };
//! # async fn demo(rpc: Arc<dyn netsteer::rpc::RpcClient>,
//! #               schema: Arc<dyn netsteer::schema::SchemaEngine>) -> Result<(), netsteer::Error> {
//! let configs = InterfaceConfig::load_all_path("/etc/netsteer/ifconfig.xml")?;
//! let inventory = Inventory::new();
//! let graph = WorkerGraph::build(configs, &inventory)?;
//!
//! let mut scheduler = Scheduler::new(graph, inventory, rpc, schema);
//! scheduler.set_target("eth0", TargetRange::at_least(IfState::AddrconfUp))?;
//! let summary = scheduler.run().await;
//! assert!(summary.all_done());
//! # Ok(())
//! # }
//! ```

pub mod bind;
pub mod config;
pub mod error;
pub mod events;
pub mod exec;
pub mod graph;
pub mod inventory;
pub mod lease;
pub mod plan;
pub mod report;
pub mod require;
pub mod rpc;
pub mod schema;
pub mod state;
pub mod worker;

pub use error::{Error, FailureKind};
pub use exec::{Scheduler, DEFAULT_TIMEOUT_MS};
pub use report::{Disposition, RunSummary};
pub use state::{IfState, TargetRange};
