use super::contract::ProgressSink;
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress { description: String },
    Output { text: String },
    Result { result: Value },
}

impl ProgressEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Output { .. } => "output",
            ProgressEvent::Result { .. } => "result",
        }
    }
}

/// Writes one JSON object per event, used by the one-shot CLI.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn emit(&self, event: &ProgressEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode progress event: {}", e);
                return;
            }
        };
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!("Failed to write progress event: {}", e);
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> ProgressSink for JsonLinesSink<W> {
    fn update_progress(&self, description: &str) {
        self.emit(&ProgressEvent::Progress {
            description: description.to_string(),
        });
    }

    fn append_intermediate_output(&self, text: &str) {
        self.emit(&ProgressEvent::Output {
            text: text.to_string(),
        });
    }
}

/// Forwards events to an SSE response.
pub struct ChannelSink {
    tx: UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn update_progress(&self, description: &str) {
        if self
            .tx
            .send(ProgressEvent::Progress {
                description: description.to_string(),
            })
            .is_err()
        {
            debug!("Progress receiver dropped; discarding update");
        }
    }

    fn append_intermediate_output(&self, text: &str) {
        if self
            .tx
            .send(ProgressEvent::Output {
                text: text.to_string(),
            })
            .is_err()
        {
            debug!("Progress receiver dropped; discarding output");
        }
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn outputs(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Output { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn progress(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Progress { description } => Some(description),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
impl ProgressSink for RecordingSink {
    fn update_progress(&self, description: &str) {
        self.events.lock().unwrap().push(ProgressEvent::Progress {
            description: description.to_string(),
        });
    }

    fn append_intermediate_output(&self, text: &str) {
        self.events.lock().unwrap().push(ProgressEvent::Output {
            text: text.to_string(),
        });
    }
}
