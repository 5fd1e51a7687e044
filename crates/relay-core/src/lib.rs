//! Domain types and SQLite-backed stores for the relay hub's reliability
//! core: the session registry, the dead-letter queue, and the in-memory
//! server registry.
//!
//! Grounded on the teacher's `agent::memory::memory_db::MemoryDB`: a
//! short-lived `rusqlite::Connection` opened per call with WAL pragmas
//! applied on connect, rather than holding one connection behind a
//! mutex for the process lifetime. WAL mode is exactly what lets that
//! pattern scale to concurrent readers plus a single writer (spec §4.4).

pub mod dlq;
pub mod errors;
pub mod server;
pub mod session;

pub use dlq::{DeadLetterMessage, DlqStats, DeadLetterQueue, MAX_ATTEMPTS, RETRY_INTERVALS_SECS};
pub use errors::CoreError;
pub use server::{Server, ServerRegistry, ServerType};
pub use session::{Session, SessionRegistry, SessionStatus};
