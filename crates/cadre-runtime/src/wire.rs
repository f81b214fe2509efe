// Framed JSON-over-stdio protocol
//
// Commands go to the backend as one JSON object per line; the backend
// answers with one render event per line. `Connected`/`Disconnected` are
// synthesized locally by the session and are never expected on the wire.

use serde::{Deserialize, Serialize};

use cadre_core::{CadreError, Result};
use cadre_types::RenderEvent;

/// Command sent to a backend process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireCommand {
    Prompt { id: String, text: String },
    Cancel { id: String },
    Shutdown,
}

/// Serialize a command into its single-line wire form.
pub fn encode_command(command: &WireCommand) -> Result<String> {
    let line = serde_json::to_string(command)?;
    Ok(line)
}

/// Decode one wire line into a render event.
pub fn decode_event(line: &str) -> Result<RenderEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(CadreError::Parse("empty wire line".to_string()));
    }
    serde_json::from_str(trimmed)
        .map_err(|e| CadreError::Parse(format!("bad wire event `{}`: {}", truncate(trimmed), e)))
}

/// Serialize a render event into its single-line wire form. Used by test
/// harnesses and in-process backends.
pub fn encode_event(event: &RenderEvent) -> Result<String> {
    let line = serde_json::to_string(event)?;
    Ok(line)
}

fn truncate(line: &str) -> &str {
    let max = 120.min(line.len());
    let mut end = max;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}
