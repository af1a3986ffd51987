//! # Scrim Coordinator Server
//!
//! Runs the map veto for scrim lobbies and brings up the match server once
//! a map is chosen.
//!
//! ## Concurrent actors
//!
//! Three tasks touch lobby state, and none of them holds a lock across a
//! veto transition:
//!
//! - **Network loop** (`network`): applies lobby and veto requests from UDP
//!   clients and pushes snapshots to subscribers.
//! - **Watchdog** (`watchdog`): bans for a team whose turn deadline passed.
//! - **Launch worker** (`launch`): drives the remote console of the bound
//!   game server after the veto completes.
//!
//! Veto writes are serialized by the compare-and-swap in `store`. A writer
//! that loses the race gets `Submission::Superseded` and nothing changes.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::Config;
//! use server::coordinator::VetoCoordinator;
//! use server::lobby::LobbyService;
//! use server::network::Server;
//! use server::store::MemoryStore;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let store = Arc::new(MemoryStore::new());
//!     let (launch_tx, _launch_rx) = mpsc::unbounded_channel();
//!     let coordinator = Arc::new(VetoCoordinator::new(
//!         store.clone(),
//!         config.turn_window,
//!         launch_tx,
//!     ));
//!     let (_notice_tx, notice_rx) = mpsc::unbounded_channel();
//!
//!     let mut server =
//!         Server::new(&config, coordinator, LobbyService::new(store), notice_rx).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod launch;
pub mod lobby;
pub mod network;
pub mod store;
pub mod watchdog;

pub use error::CoordinatorError;
