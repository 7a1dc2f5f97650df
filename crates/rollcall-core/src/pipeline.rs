//! Recognition event pipeline.
//!
//! Turns classifier predictions into logged events. A prediction becomes an
//! event only when its confidence clears the threshold and no event for the
//! same label index was emitted within the cooldown window. Cooldown state
//! lives for one session and is never persisted.

use crate::eventlog::{EventLogError, EventSink, RecognitionEvent};
use crate::labels::LabelNames;
use crate::types::{LabelIndex, Prediction};
use chrono::{DateTime, Duration, Local};
use std::collections::HashMap;
use thiserror::Error;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_COOLDOWN_SECS: i64 = 5;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("classifier produced {actual} class probabilities but the label map has {expected} labels")]
    ClassCountMismatch { expected: usize, actual: usize },
    #[error("classifier produced no usable probability (empty or all NaN)")]
    EmptyPrediction,
    #[error(transparent)]
    Log(#[from] EventLogError),
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub confidence_threshold: f32,
    pub cooldown: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            cooldown: Duration::seconds(DEFAULT_COOLDOWN_SECS),
        }
    }
}

/// What the session shows for one face, whether or not it was logged.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub label_index: LabelIndex,
    pub display_name: String,
    pub confidence: f32,
    pub event: Option<RecognitionEvent>,
}

pub struct RecognitionEventPipeline<S: EventSink> {
    names: LabelNames,
    config: PipelineConfig,
    last_seen: HashMap<String, DateTime<Local>>,
    sink: S,
}

impl<S: EventSink> RecognitionEventPipeline<S> {
    pub fn new(names: LabelNames, config: PipelineConfig, sink: S) -> Self {
        Self {
            names,
            config,
            last_seen: HashMap::new(),
            sink,
        }
    }

    pub fn names(&self) -> &LabelNames {
        &self.names
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Display name for a label, `"Unknown"` when unresolved.
    pub fn resolve(&self, label_index: LabelIndex) -> &str {
        self.names.resolve(label_index)
    }

    /// Gate one prediction and log it if it passes.
    pub fn observe(
        &mut self,
        label_index: LabelIndex,
        confidence: f32,
        location: &str,
        now: DateTime<Local>,
    ) -> Result<Option<RecognitionEvent>, PipelineError> {
        let display_name = self.names.resolve(label_index).to_string();

        if confidence.is_nan() || confidence < self.config.confidence_threshold {
            tracing::trace!(label_index, confidence, "below threshold; not logged");
            return Ok(None);
        }

        let key = label_index.to_string();
        if let Some(last) = self.last_seen.get(&key) {
            if now.signed_duration_since(*last) <= self.config.cooldown {
                tracing::trace!(label_index, "within cooldown; not logged");
                return Ok(None);
            }
        }

        let event = RecognitionEvent {
            timestamp: now,
            person_id: key.clone(),
            display_name,
            confidence,
            location: location.to_string(),
        };
        self.sink.append(&event)?;
        self.last_seen.insert(key, now);

        tracing::info!(
            person_id = %event.person_id,
            name = %event.display_name,
            confidence,
            location,
            "recognition logged"
        );
        Ok(Some(event))
    }

    /// Validate a raw probability vector against the label map, take the
    /// top prediction and run it through [`observe`](Self::observe).
    pub fn observe_probabilities(
        &mut self,
        probabilities: &[f32],
        location: &str,
        now: DateTime<Local>,
    ) -> Result<Observation, PipelineError> {
        if probabilities.len() != self.names.len() {
            return Err(PipelineError::ClassCountMismatch {
                expected: self.names.len(),
                actual: probabilities.len(),
            });
        }
        let Prediction {
            label_index,
            confidence,
        } = Prediction::from_probabilities(probabilities).ok_or(PipelineError::EmptyPrediction)?;

        let event = self.observe(label_index, confidence, location, now)?;
        Ok(Observation {
            label_index,
            display_name: self.names.resolve(label_index).to_string(),
            confidence,
            event,
        })
    }
}
