//! # mcshard - A Sharding Proxy for the Memcached ASCII Protocol
//!
//! mcshard sits between many synchronous memcached clients and a fixed set
//! of memcached backends. It accepts `get` and `set` requests, optionally
//! shards multi-key `get` requests across all backends, replicates `set`
//! requests to every backend, and recombines the backend replies into one
//! coherent reply per client request.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              mcshard                                │
//! │                                                                     │
//! │  ┌─────────────┐   requests   ┌───────────┐   jobs   ┌───────────┐  │
//! │  │  Listener   │─────────────>│  Request  │─────────>│ Job Queue │  │
//! │  │ (accept +   │              │  Decoder  │          │  (MPMC)   │  │
//! │  │  readers)   │              └───────────┘          └─────┬─────┘  │
//! │  └─────────────┘                                          │        │
//! │                                                           ▼        │
//! │  ┌──────────────────────────────────────────────────────────────┐  │
//! │  │                        Worker pool                           │  │
//! │  │  each worker owns one persistent connection per backend      │  │
//! │  │                                                              │  │
//! │  │   direct get ──> one backend (round-robin)                   │  │
//! │  │   sharded get ─> key slices fanned out over all backends     │  │
//! │  │   set ─────────> replicated to every backend                 │  │
//! │  └───────┬──────────────────────────────────────────────────────┘  │
//! │          │ combined reply (written through the client handle)      │
//! │          ▼                                                         │
//! │      clients                         backends: mc0 mc1 ... mcN     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency model
//!
//! One listener task accepts connections and spawns a reader task per
//! client. The read side of a client socket is touched only by its reader
//! task; the write side only by the worker currently holding that client's
//! job. Backend connections belong to exactly one worker for the whole
//! process lifetime. The job queue is the only structure shared between
//! producers and consumers.
//!
//! Clients hold at most one outstanding request at a time and do not
//! disconnect voluntarily during a run; this relaxes flow control but not
//! parsing correctness.
//!
//! ## Module Overview
//!
//! - [`protocol`]: request/reply framing state machines for the ASCII protocol
//! - [`connection`]: backend/client socket wrappers and the compose-then-drain
//!   write buffer
//! - [`shard`]: precomputed key-range tables for sharded gets
//! - [`queue`]: the listener-to-worker job handoff
//! - [`job`]: per-request state, status taxonomy and timing
//! - [`listener`]: accept loop and client readers
//! - [`worker`]: backend orchestration and reply aggregation
//! - [`stats`]: the per-job instrumentation event stream
//! - [`lifecycle`]: two-phase shutdown coordination
//! - [`server`]: wiring it all together
//!
//! ## Quick Start
//!
//! ```ignore
//! use mcshard::config::ProxyConfig;
//! use mcshard::server::Proxy;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = ProxyConfig::default();
//!     config.backends = vec!["127.0.0.1:11211".into(), "127.0.0.1:11212".into()];
//!
//!     let proxy = Proxy::start(config).await?;
//!     tokio::signal::ctrl_c().await?;
//!     proxy.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod job;
pub mod lifecycle;
pub mod listener;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod shard;
pub mod stats;
pub mod worker;

// Re-export commonly used types for convenience
pub use config::ProxyConfig;
pub use job::{Job, JobKind, JobStatus};
pub use protocol::{ProtocolError, ReplyKind, Request, Verb};
pub use server::Proxy;
pub use shard::ShardTable;

/// The default port mcshard listens on
pub const DEFAULT_PORT: u16 = 11311;

/// The default host mcshard binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of mcshard
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
