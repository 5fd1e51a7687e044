//! Reliability and routing core for a distributed remote-execution hub.
//!
//! Wires together the session registry, dead-letter queue, and server
//! registry (`relay-core`), the retry/breaker middleware
//! (`relay-resilience`), the SSH command executor (`relay-ssh`), and the
//! chat channel abstraction (`relay-channels`) behind one HTTP gateway.

pub mod aggregator;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod recovery;
pub mod router;
pub mod state;

pub use errors::RelayError;
pub use state::AppState;
