//! Log storage for lobby sessions.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐   open(key)   ┌──────────────┐
//! │ ReplicatedFeed│ ────────────► │ LogProvider  │
//! └──────┬────────┘               └──────┬───────┘
//!        │ append / read_range           │
//!        ▼                               ▼
//! ┌───────────────┐   replicate   ┌──────────────┐
//! │ AppendLog     │ ◄───────────► │ peer replicas│
//! │ (signed seq)  │               │ (read-only)  │
//! └───────────────┘               └──────────────┘
//! ```
//!
//! [`append_log`] defines the interface; [`memory`] is the in-process
//! implementation used by tests and single-process setups.

pub mod append_log;
pub mod memory;

pub use append_log::{AppendLog, LogEntry, LogEvent, LogOptions, LogProvider};
pub use memory::{MemoryLog, MemoryNetwork, MemoryNode, NodeStats};
