//! # snapferry
//!
//! Core replication-and-pruning engine for filesystem-snapshot
//! replication: a sender and a receiver move snapshot streams over a
//! framed connection, and each side independently destroys the snapshots
//! its retention rules no longer need.
//!
//! ## Architecture
//!
//! - **Transport**: a power-of-two [`bufpool`] feeds a [`frameconn`]
//!   carrying `(type: u32, payload)` frames; [`stream`] multiplexes a
//!   bulk byte stream plus an error trailer over it.
//! - **Protocol**: [`pdu`] defines the wire messages (listing, send,
//!   receive, destroy, cursor, replication status) and [`rpc`] binds them
//!   to the frame connection.
//! - **Pruning**: [`pruner`] plans destruction candidates from inventory
//!   and replication status, and executes destroys with retry for
//!   transient failures; [`pruning`] holds the retention rules.
//!
//! ## Example
//!
//! ```no_run
//! use snapferry::config::PruningPairConfig;
//! use snapferry::pruner::PrunerFactory;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(
//! #     local: impl snapferry::pruner::Target,
//! #     remote: impl snapferry::pruner::History,
//! # ) -> snapferry::Result<()> {
//! let config: PruningPairConfig = serde_json::from_str(
//!     r#"{"keep_sender": [{"type": "last_n", "count": 10}]}"#,
//! )
//! .unwrap();
//! let factory = PrunerFactory::from_config(&config)?;
//! let pruner = factory.build_sender_pruner(CancellationToken::new(), local, remote);
//! pruner.prune().await;
//! println!("{:?}", pruner.report());
//! # Ok(())
//! # }
//! ```

pub mod bufpool;
pub mod config;
pub mod error;
pub mod frameconn;
pub mod logging;
pub mod pdu;
pub mod pruner;
pub mod pruning;
pub mod rpc;
pub mod stream;

pub use error::{Result, SnapferryError};
pub use pruner::{Pruner, PrunerFactory, PrunerReport, State};
