//! Per-call transcript buffers.
//!
//! Final fragments append to an ordered log in arrival order. Each call keeps
//! at most one interim fragment, replaced wholesale by the next interim and
//! cleared by the next final. No reordering or deduplication happens here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Caller,
    Assistant,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Caller => "caller",
            Speaker::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFragment {
    pub call_id: String,
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallTranscript {
    entries: Vec<TranscriptEntry>,
    interim: Option<TranscriptEntry>,
    assistant_speaking: bool,
}

impl CallTranscript {
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn interim(&self) -> Option<&str> {
        self.interim.as_ref().map(|entry| entry.text.as_str())
    }

    pub fn interim_entry(&self) -> Option<&TranscriptEntry> {
        self.interim.as_ref()
    }

    pub fn is_assistant_speaking(&self) -> bool {
        self.assistant_speaking
    }
}

#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    calls: HashMap<String, CallTranscript>,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_fragment(&mut self, fragment: TranscriptFragment) {
        let TranscriptFragment {
            call_id,
            speaker,
            text,
            timestamp,
            is_final,
        } = fragment;
        let transcript = self.calls.entry(call_id).or_default();
        let entry = TranscriptEntry {
            speaker,
            text,
            timestamp,
        };

        // Assistant utterances have no interim phase.
        if is_final || speaker == Speaker::Assistant {
            transcript.entries.push(entry);
            transcript.interim = None;
        } else {
            transcript.interim = Some(entry);
        }
    }

    /// Records an assistant utterance and marks the assistant as speaking.
    pub fn assistant_started(&mut self, call_id: &str, text: String, timestamp: DateTime<Utc>) {
        self.on_fragment(TranscriptFragment {
            call_id: call_id.to_string(),
            speaker: Speaker::Assistant,
            text,
            timestamp,
            is_final: true,
        });
        if let Some(transcript) = self.calls.get_mut(call_id) {
            transcript.assistant_speaking = true;
        }
    }

    pub fn assistant_finished(&mut self, call_id: &str) {
        if let Some(transcript) = self.calls.get_mut(call_id) {
            transcript.assistant_speaking = false;
        }
    }

    /// Drops everything buffered for `call_id`.
    pub fn discard(&mut self, call_id: &str) -> bool {
        let removed = self.calls.remove(call_id).is_some();
        if removed {
            debug!(call_id, "Transcript discarded");
        }
        removed
    }

    pub fn transcript(&self, call_id: &str) -> Option<&CallTranscript> {
        self.calls.get(call_id)
    }

    pub fn tracked_calls(&self) -> usize {
        self.calls.len()
    }
}
