use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Replicated change for one queue, produced by the leader's side of the
/// cluster and applied on every node.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SyncQueueData {
    pub queue_name: String,
    pub operation: SyncOperation,
}

impl SyncQueueData {
    pub fn new(queue_name: impl Into<String>, operation: SyncOperation) -> Self {
        Self {
            queue_name: queue_name.into(),
            operation,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncOperation {
    Push { items: Vec<Value> },
    Pop { count: usize },
    Replace { items: Vec<Value> },
    Clear,
    /// Creates the queue when missing and leaves existing entries alone.
    Declare,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Queue {
    entries: VecDeque<Value>,
}

impl Queue {
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, item: Value) -> usize {
        self.entries.push_back(item);
        self.entries.len()
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.entries.pop_front()
    }

    #[cfg(test)]
    pub fn peek(&self) -> Option<&Value> {
        self.entries.front()
    }

    /// Applies a synchronization payload; the queue name inside `data` is not
    /// checked here, the manager routes by it.
    pub fn update(&mut self, data: &SyncQueueData) {
        match &data.operation {
            SyncOperation::Push { items } => self.entries.extend(items.iter().cloned()),
            SyncOperation::Pop { count } => {
                let count = (*count).min(self.entries.len());
                self.entries.drain(..count);
            }
            SyncOperation::Replace { items } => {
                self.entries = items.iter().cloned().collect();
            }
            SyncOperation::Clear => self.entries.clear(),
            SyncOperation::Declare => {}
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum QueueManagerError {
    InvalidQueueName { name: String },
}

impl fmt::Display for QueueManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidQueueName { name } => write!(f, "invalid queue name '{name}'"),
        }
    }
}

impl std::error::Error for QueueManagerError {}

/// Name-keyed registry of queues with get-or-create semantics.
#[derive(Debug, Default)]
pub struct QueueManager {
    queues: HashMap<String, Queue>,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Queue> {
        self.queues.get(name)
    }

    /// Returns the queue and whether it had to be created.
    pub fn get_or_create(&mut self, name: &str) -> Result<(&mut Queue, bool), QueueManagerError> {
        validate_queue_name(name)?;

        let created = !self.queues.contains_key(name);
        let queue = self
            .queues
            .entry(name.to_owned())
            .or_default();
        Ok((queue, created))
    }

    /// `(name, size)` for every queue, ordered by name.
    pub fn list(&self) -> Vec<(String, usize)> {
        let sorted: BTreeMap<&str, usize> = self
            .queues
            .iter()
            .map(|(name, queue)| (name.as_str(), queue.size()))
            .collect();
        sorted
            .into_iter()
            .map(|(name, size)| (name.to_owned(), size))
            .collect()
    }
}

fn validate_queue_name(name: &str) -> Result<(), QueueManagerError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(QueueManagerError::InvalidQueueName {
            name: name.to_owned(),
        })
    }
}
