//! Live view onto one call.
//!
//! A [`CallMonitor`] installs its own handlers on the connection and sees
//! the call's pushes as they arrive, ahead of the engine's queued processing.
//! Closing the monitor removes exactly those handlers.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use callwatch_protocol::{
    parse_push_event, PushEvent, EVENT_CALL_ENDED, EVENT_STT_TRANSCRIPT, EVENT_TTS_COMPLETED,
    EVENT_TTS_STARTED,
};

use crate::connection::{ConnectionManager, HandlerId};

pub type MonitorCallback = Box<dyn FnMut(&PushEvent) + Send>;

/// Events a monitor listens to.
pub const MONITOR_EVENTS: [&str; 4] = [
    EVENT_STT_TRANSCRIPT,
    EVENT_TTS_STARTED,
    EVENT_TTS_COMPLETED,
    EVENT_CALL_ENDED,
];

#[derive(Debug)]
pub struct CallMonitor {
    call_id: String,
    handlers: Vec<(&'static str, HandlerId)>,
}

impl CallMonitor {
    pub(crate) fn attach(
        connection: &mut ConnectionManager,
        call_id: &str,
        callback: MonitorCallback,
    ) -> Self {
        let shared = Arc::new(Mutex::new(callback));
        let handlers = MONITOR_EVENTS
            .iter()
            .map(|&event| {
                let callback = Arc::clone(&shared);
                let watched = call_id.to_string();
                let id = connection.on(
                    event,
                    Box::new(move |data: &Value| {
                        if data.get("call_id").and_then(Value::as_str) != Some(watched.as_str()) {
                            return;
                        }
                        let parsed = match parse_push_event(event, data.clone()) {
                            Ok(parsed) => parsed,
                            Err(err) => {
                                debug!(event, error = %err, "Monitor skipped invalid payload");
                                return;
                            }
                        };
                        match callback.lock() {
                            Ok(mut callback) => (*callback)(&parsed),
                            Err(_) => warn!(event, "Monitor callback poisoned"),
                        }
                    }),
                );
                (event, id)
            })
            .collect();
        debug!(call_id, "Monitor attached");
        Self {
            call_id: call_id.to_string(),
            handlers,
        }
    }

    /// Deregisters the monitor's handlers and returns the watched call id.
    pub(crate) fn detach(self, connection: &mut ConnectionManager) -> String {
        for (event, id) in &self.handlers {
            connection.off(event, *id);
        }
        debug!(call_id = %self.call_id, "Monitor detached");
        self.call_id
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }
}
