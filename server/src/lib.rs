//! # Position Synchronization Server
//!
//! This library implements a real-time relay for client-reported movement
//! state. Clients connect over TCP, periodically report where they are, and
//! the server redistributes a merged snapshot of every connected client to
//! everyone. The server relays; it does not validate or simulate movement.
//!
//! ## Core Responsibilities
//!
//! ### Connection Ownership
//! Every accepted connection is owned end-to-end by a client actor, which
//! assigns the client an identifier, gives it a random starting position and
//! translates between wire frames and the client's state.
//!
//! ### Membership
//! A single registry decides who is live. Joins, leaves and broadcast
//! requests are funnelled through one control loop so the membership map is
//! only ever touched by one logical thread of control.
//!
//! ### Fan-out
//! On every membership change or state update the registry snapshots all
//! clients and offers the snapshot to every client's bounded mailbox.
//!
//! ## Architecture Design
//!
//! ### Tasks
//! With N clients connected the server runs 2N + 1 tasks: a read loop and a
//! write loop per client, plus the registry's control loop. None of them
//! spin; each waits on a socket, a mailbox, an exit signal or a request.
//!
//! ### Back-pressure
//! Mailboxes are bounded and fan-out never waits for room. A client whose
//! mailbox is full is dropped, so one stalled consumer cannot slow anyone
//! else down or grow memory without bound.
//!
//! ### Failure Isolation
//! Transport failures, deadline expiry and malformed frames end only the
//! connection they happen on. The failing loop deregisters its client exactly
//! once and signals its sibling loop to exit.
//!
//! ## Module Organization
//!
//! ### Client Module (`client`)
//! The per-connection actor, its read and write loops, exit signals and the
//! [`client::ClientHandle`] the registry keeps.
//!
//! ### Registry Module (`registry`)
//! The control loop, its request messages and the broadcast fan-out.
//!
//! ### State Module (`state`)
//! The lock-guarded per-client state cell and the identifier generator.
//!
//! ### Config Module (`config`)
//! Timeouts, mailbox capacity and spawn area, with validation.
//!
//! ### Network Module (`network`)
//! The TCP acceptor that hands connections to new actors.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind("127.0.0.1:8080", ServerConfig::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod network;
pub mod registry;
pub mod state;
