//! Editor-extension ingestion (the `/mcp/*` endpoints)
//!
//! Each call produces one entry and one event. Code changes reported this way
//! go through the same attribution path as watcher-detected changes.

use serde::{Deserialize, Serialize};

use super::detector::diff_stats;
use super::Recorder;
use crate::error::{Error, Result};
use crate::model::{Entry, EntrySource, Event, EventDetails, EventType, PromptResponse};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PromptResponseInput {
    pub session_id: Option<String>,
    pub workspace_path: Option<String>,
    pub file_path: Option<String>,
    pub prompt: String,
    pub response: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CodeChangeInput {
    pub session_id: Option<String>,
    pub workspace_path: Option<String>,
    pub file_path: String,
    pub before_code: String,
    pub after_code: String,
}

/// Ids created by one ingestion call
#[derive(Debug, Clone, Serialize)]
pub struct Receipt {
    pub entry_id: String,
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<i64>,
}

pub fn log_prompt_response(recorder: &Recorder, input: PromptResponseInput) -> Result<Receipt> {
    if input.prompt.trim().is_empty() {
        return Err(Error::invalid("prompt is empty"));
    }
    let entry = Entry {
        session_id: input.session_id.clone(),
        workspace_path: input.workspace_path.clone(),
        file_path: input.file_path.clone(),
        source: EntrySource::Mcp,
        notes: Some(input.prompt.clone()),
        after_code: Some(input.response.clone()),
        entry_type: Some("prompt_response".to_string()),
        ..Entry::default()
    };
    let (entry, _) = recorder.record_entry(entry)?;

    let mut event = Event::new(
        EventType::PromptResponse,
        EventDetails::PromptResponse(PromptResponse {
            file_path: input.file_path,
            prompt: input.prompt,
            response: input.response,
            entry_id: None,
        }),
    );
    event.session_id = input.session_id;
    event.workspace_path = input.workspace_path;
    event.source = Some(EntrySource::Mcp.as_str().to_string());
    event.ai_generated = true;
    event.set_link(&entry.id, None);
    let (event, _) = recorder.record_event(event)?;

    Ok(Receipt {
        entry_id: entry.id,
        event_id: event.id,
        prompt_id: None,
    })
}

pub fn log_code_change(recorder: &Recorder, input: CodeChangeInput) -> Result<Receipt> {
    if input.file_path.trim().is_empty() {
        return Err(Error::invalid("file_path is required"));
    }
    let stats = diff_stats(&input.file_path, &input.before_code, &input.after_code);
    let mut entry = Entry::code_change(
        input.file_path,
        input.before_code,
        input.after_code,
        EntrySource::Mcp,
    );
    entry.session_id = input.session_id.clone();
    entry.workspace_path = input.workspace_path.clone();

    let mut event = Event::new(EventType::CodeChange, EventDetails::CodeChange(stats));
    event.session_id = input.session_id;
    event.workspace_path = input.workspace_path;
    event.source = Some(EntrySource::Mcp.as_str().to_string());

    let change = recorder.record_change(entry, event)?;
    Ok(Receipt {
        entry_id: change.entry.id,
        event_id: change.event.id,
        prompt_id: change.entry.prompt_id,
    })
}
