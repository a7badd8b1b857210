use std::{collections::VecDeque, num::NonZeroUsize};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    domain::{ConsensusResult, PhotometricInput},
    protocol::PredictionPayload,
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRecord {
    pub input: PhotometricInput,
    pub consensus: ConsensusResult,
    pub payload: PredictionPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: PredictionRecord,
}

/// Session history of successful predictions, newest first.
#[derive(Debug, Default)]
pub struct PredictionLog {
    entries: VecDeque<LogEntry>,
    capacity: Option<NonZeroUsize>,
}

impl PredictionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `capacity` entries, dropping the oldest.
    pub fn with_capacity(capacity: Option<NonZeroUsize>) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub fn append(&mut self, record: PredictionRecord) -> Uuid {
        let id = Uuid::new_v4();
        self.entries.push_front(LogEntry {
            id,
            recorded_at: Utc::now(),
            record,
        });
        if let Some(capacity) = self.capacity {
            self.entries.truncate(capacity.get());
        }
        id
    }

    pub fn entries(&self) -> impl ExactSizeIterator<Item = &LogEntry> + '_ {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&LogEntry> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
