//! Per-session dual-track memory.
//!
//! The full track archives every query, tool result and answer verbatim and
//! is never sent to the reasoning engine. The summarized track holds one
//! compressed entry per full entry, linked back through `ref`, and is the
//! only history the engine sees. The engine can ask for any full entry by id
//! through the `retrieve_full_context` tool.

pub mod entry;
pub mod session;
pub mod store;

pub use entry::{summary_id, Entry, EntryDraft, EntryKind, ToolTrace};
pub use session::Session;
pub use store::{HistoryStore, SessionHandle};
