//! Reply pipeline core for Relaybot.
//!
//! Per-user debounce, one supervised execution per user, incremental
//! extraction of reply fragments from a streamed JSON document, and
//! exactly-once dispatch of those fragments. Collaborators (history storage,
//! the completion stream, message delivery) are reached only through the
//! traits in [`traits`].

mod coordinator;
mod debounce;
mod dispatch;
mod error;
mod execution;
mod ingest;
mod supervisor;
#[cfg(test)]
mod testing;
pub mod traits;
mod types;

pub use coordinator::ReplyCoordinator;
pub use debounce::{DEFAULT_QUIET_WINDOW, DebounceCoalescer};
pub use dispatch::{AGGREGATE_SEPARATOR, DispatchRecord, DispatchReport, MessageDispatcher};
pub use error::{CoreError, Result};
pub use execution::{ExecutionOutcome, ReplyExecution};
pub use ingest::StreamIngestor;
pub use supervisor::{ExecutionSupervisor, ExecutionTicket};
pub use traits::{CompletionSource, DeltaStream, HistoryStore, ReplySink};
pub use types::{ChatTurn, Message, MessageKind, TurnRole, UserKey};
