//! Domain entities shared by sources, persistence, the queue and the API
//!
//! Everything here is plain data with serde derives. Persistence owns the
//! rows; sources build these values and hand them over by value.

mod context;
mod entry;
mod event;
pub mod json;
mod prompt;
mod terminal;
mod turn;

pub use context::{ContextSnapshot, Motif, Rung2EditScript, Workspace};
pub use entry::{Entry, EntrySource, EntryWithPrompt};
pub use event::{
    ChangeStats, CommandRun, Event, EventDetails, EventType, FileChange, FileChangeKind,
    PromptResponse,
};
pub use prompt::{Prompt, PromptStatus};
pub use terminal::{TerminalCommand, MAX_OUTPUT_BYTES};
pub use turn::{ConversationStats, ConversationTurn, TurnRole};

/// Fresh string id for rows that arrive without one
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
