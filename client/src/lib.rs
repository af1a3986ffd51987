//! # Scrim Client Library
//!
//! Client-side pieces of the scrim coordinator:
//!
//! ### RCON (`rcon`, `packets`)
//! A Source-engine remote console client. [`packets`] owns the byte-exact
//! framing and a buffered decoder that reassembles packets split across TCP
//! reads; [`rcon`] drives an authenticated session that issues one command at
//! a time, with every connect, write and read bounded by a single timeout.
//!
//! ### Coordinator (`network`)
//! A UDP client speaking the coordinator's bincode [`shared::Packet`]
//! protocol: create and join lobbies, start the match, submit bans or votes,
//! and watch lobby updates.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::rcon;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let responses = rcon::execute(
//!         "127.0.0.1",
//!         27015,
//!         "rcon-password",
//!         &["status".to_string()],
//!         Duration::from_secs(5),
//!     )
//!     .await?;
//!     println!("{}", responses[0]);
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod packets;
pub mod rcon;

pub use rcon::{execute, RconError, RconSession};
