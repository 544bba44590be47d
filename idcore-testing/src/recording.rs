//! A handler that records deliveries and fails on cue.
//!
//! ```ignore
//! let handler = Arc::new(RecordingHandler::new("recording", ["user"]));
//! handler.fail_times(Sequence::new(2), 2);
//!
//! spooler.run_once(handler.as_ref()).await?;
//! assert_eq!(handler.attempts_of(Sequence::new(2)), 1);
//! ```

use async_trait::async_trait;
use idcore::{
    AggregateType, Event, Handler, HandlerError, HandlerResult, ReduceError, Sequence,
};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptedFailure {
    Times(u32),
    Always,
    Permanent,
}

#[derive(Debug, Default)]
struct Recording {
    attempts: Vec<Sequence>,
    applied: Vec<Sequence>,
    watermarks: Vec<Sequence>,
    script: HashMap<Sequence, ScriptedFailure>,
}

/// Handler storing every delivery, with failures scripted per sequence.
#[derive(Debug)]
pub struct RecordingHandler {
    name: String,
    aggregate_types: Vec<AggregateType>,
    recording: Mutex<Recording>,
}

impl RecordingHandler {
    /// A handler named `name` interested in `aggregate_types`.
    pub fn new<I, T>(name: impl Into<String>, aggregate_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            name: name.into(),
            aggregate_types: aggregate_types
                .into_iter()
                .map(AggregateType::new)
                .collect(),
            recording: Mutex::default(),
        }
    }

    /// The event at `sequence` fails `times` times, then succeeds.
    pub fn fail_times(&self, sequence: Sequence, times: u32) {
        let _ = self
            .recording
            .lock()
            .script
            .insert(sequence, ScriptedFailure::Times(times));
    }

    /// The event at `sequence` fails with a retryable error forever.
    pub fn fail_always(&self, sequence: Sequence) {
        let _ = self
            .recording
            .lock()
            .script
            .insert(sequence, ScriptedFailure::Always);
    }

    /// The event at `sequence` fails as an invalid event mapping.
    pub fn fail_permanently(&self, sequence: Sequence) {
        let _ = self
            .recording
            .lock()
            .script
            .insert(sequence, ScriptedFailure::Permanent);
    }

    /// Every delivery in order, failed ones included.
    pub fn attempts(&self) -> Vec<Sequence> {
        self.recording.lock().attempts.clone()
    }

    /// Number of deliveries of the event at `sequence`.
    pub fn attempts_of(&self, sequence: Sequence) -> usize {
        self.recording
            .lock()
            .attempts
            .iter()
            .filter(|attempt| **attempt == sequence)
            .count()
    }

    /// Successfully reduced events in order.
    pub fn applied(&self) -> Vec<Sequence> {
        self.recording.lock().applied.clone()
    }

    /// Watermarks reported after clean batches.
    pub fn watermarks(&self) -> Vec<Sequence> {
        self.recording.lock().watermarks.clone()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn aggregate_types(&self) -> Vec<AggregateType> {
        self.aggregate_types.clone()
    }

    async fn reduce(&self, event: &Event) -> HandlerResult<()> {
        let mut recording = self.recording.lock();
        recording.attempts.push(event.sequence);

        let failure = match recording.script.get_mut(&event.sequence) {
            Some(ScriptedFailure::Times(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Some(HandlerError::internal("scripted failure"))
            }
            Some(ScriptedFailure::Always) => Some(HandlerError::internal("scripted failure")),
            Some(ScriptedFailure::Permanent) => {
                Some(HandlerError::from(ReduceError::InvalidEventMapping {
                    event_type: event.event_type.clone(),
                    sequence: event.sequence,
                    detail: "scripted mapping failure".to_string(),
                }))
            }
            Some(ScriptedFailure::Times(_)) | None => None,
        };

        match failure {
            Some(error) => Err(error),
            None => {
                recording.applied.push(event.sequence);
                Ok(())
            }
        }
    }

    fn on_success(&self, watermark: Sequence) {
        self.recording.lock().watermarks.push(watermark);
    }
}
