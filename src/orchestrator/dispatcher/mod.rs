//! Minimal JSON request dispatcher over the queue manager.
//!
//! Requests are JSON objects with an `action` field. Results and errors are
//! written back into the same document, which is then sent to the client as
//! the response body.

use std::fmt;

use serde_json::{json, Map, Value};

use super::queues::{QueueManager, QueueManagerError};

pub const ACTION_PRODUCE: &str = "produce";
pub const ACTION_CONSUME: &str = "consume";
pub const ACTION_SIZE: &str = "size";
pub const ACTION_LIST: &str = "list";

pub const CODE_OK: i64 = 0;

#[derive(Debug, PartialEq)]
pub enum DispatchError {
    MalformedDocument { reason: String },
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
    UnknownAction { action: String },
    InvalidQueue(QueueManagerError),
    QueueEmpty { queue: String },
}

impl DispatchError {
    /// Non-zero status code reported to clients.
    pub fn code(&self) -> i64 {
        match self {
            Self::MalformedDocument { .. } => 1,
            Self::MissingField { .. } | Self::InvalidFieldType { .. } => 2,
            Self::UnknownAction { .. } => 3,
            Self::InvalidQueue(_) => 4,
            Self::QueueEmpty { .. } => 5,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedDocument { reason } => write!(f, "malformed request document: {reason}"),
            Self::MissingField { field } => write!(f, "missing request field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "request field '{field}' must be {expected}")
            }
            Self::UnknownAction { action } => write!(f, "unknown action '{action}'"),
            Self::InvalidQueue(source) => write!(f, "{source}"),
            Self::QueueEmpty { queue } => write!(f, "queue '{queue}' is empty"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<QueueManagerError> for DispatchError {
    fn from(value: QueueManagerError) -> Self {
        Self::InvalidQueue(value)
    }
}

/// Executes parsed request documents against the local queues.
pub trait RequestDispatcher {
    /// Fills `document` with a result. On error the document still carries
    /// `code` and `reason` so it can be returned to the client as-is.
    fn process(&self, document: &mut Value, queues: &mut QueueManager) -> Result<(), DispatchError>;
}

pub fn parse_request(raw: &str) -> Result<Value, DispatchError> {
    let document: Value = serde_json::from_str(raw).map_err(|error| {
        DispatchError::MalformedDocument {
            reason: error.to_string(),
        }
    })?;
    if !document.is_object() {
        return Err(DispatchError::MalformedDocument {
            reason: "request must be a JSON object".to_owned(),
        });
    }
    Ok(document)
}

/// Writes the error fields into `document`, replacing it with an object when it
/// is not one already.
pub fn fill_error(document: &mut Value, error: &DispatchError) {
    if !document.is_object() {
        *document = Value::Object(Map::new());
    }
    if let Value::Object(map) = document {
        map.insert("code".to_owned(), json!(error.code()));
        map.insert("reason".to_owned(), json!(error.to_string()));
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QueueProcessor;

impl QueueProcessor {
    pub fn new() -> Self {
        Self
    }

    fn execute(&self, document: &Value, queues: &mut QueueManager) -> Result<Map<String, Value>, DispatchError> {
        let action = str_field(document, "action")?;
        let mut result = Map::new();

        match action {
            ACTION_PRODUCE => {
                let name = str_field(document, "queue")?;
                let data = document
                    .get("data")
                    .cloned()
                    .ok_or(DispatchError::MissingField { field: "data" })?;
                let (queue, _) = queues.get_or_create(name)?;
                let size = queue.push(data);
                result.insert("size".to_owned(), json!(size));
            }
            ACTION_CONSUME => {
                let name = str_field(document, "queue")?;
                let (queue, _) = queues.get_or_create(name)?;
                let data = queue.pop().ok_or_else(|| DispatchError::QueueEmpty {
                    queue: name.to_owned(),
                })?;
                result.insert("data".to_owned(), data);
                result.insert("size".to_owned(), json!(queue.size()));
            }
            ACTION_SIZE => {
                let name = str_field(document, "queue")?;
                let size = queues.get(name).map_or(0, |queue| queue.size());
                result.insert("size".to_owned(), json!(size));
            }
            ACTION_LIST => {
                let listed = queues
                    .list()
                    .into_iter()
                    .map(|(name, size)| (name, json!(size)))
                    .collect::<Map<_, _>>();
                result.insert("queues".to_owned(), Value::Object(listed));
            }
            other => {
                return Err(DispatchError::UnknownAction {
                    action: other.to_owned(),
                })
            }
        }

        result.insert("code".to_owned(), json!(CODE_OK));
        Ok(result)
    }
}

impl RequestDispatcher for QueueProcessor {
    fn process(&self, document: &mut Value, queues: &mut QueueManager) -> Result<(), DispatchError> {
        match self.execute(document, queues) {
            Ok(result) => {
                if let Value::Object(map) = document {
                    map.extend(result);
                }
                Ok(())
            }
            Err(error) => {
                fill_error(document, &error);
                Err(error)
            }
        }
    }
}

fn str_field<'a>(document: &'a Value, field: &'static str) -> Result<&'a str, DispatchError> {
    match document.get(field) {
        Some(Value::String(value)) => Ok(value),
        Some(_) => Err(DispatchError::InvalidFieldType {
            field,
            expected: "a string",
        }),
        None => Err(DispatchError::MissingField { field }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::orchestrator::queues::QueueManager;

    use super::{parse_request, DispatchError, QueueProcessor, RequestDispatcher};

    #[test]
    fn produce_then_consume_round_trips_data() {
        let processor = QueueProcessor::new();
        let mut queues = QueueManager::new();

        let mut produce = json!({"action": "produce", "queue": "orders", "data": {"id": 1}});
        processor
            .process(&mut produce, &mut queues)
            .expect("produce should succeed");
        assert_eq!(produce["code"], json!(0));
        assert_eq!(produce["size"], json!(1));

        let mut consume = json!({"action": "consume", "queue": "orders"});
        processor
            .process(&mut consume, &mut queues)
            .expect("consume should succeed");
        assert_eq!(consume["data"], json!({"id": 1}));
        assert_eq!(consume["size"], json!(0));
    }

    #[test]
    fn errors_are_written_into_the_document() {
        let processor = QueueProcessor::new();
        let mut queues = QueueManager::new();

        let mut consume = json!({"action": "consume", "queue": "empty"});
        let err = processor
            .process(&mut consume, &mut queues)
            .expect_err("empty queue should fail");

        assert!(matches!(err, DispatchError::QueueEmpty { .. }));
        assert_eq!(consume["code"], json!(5));
        assert_eq!(consume["reason"], json!("queue 'empty' is empty"));
    }

    #[test]
    fn unknown_action_and_missing_fields_are_rejected() {
        let processor = QueueProcessor::new();
        let mut queues = QueueManager::new();

        let mut unknown = json!({"action": "explode"});
        assert_eq!(
            processor.process(&mut unknown, &mut queues),
            Err(DispatchError::UnknownAction {
                action: "explode".to_owned()
            })
        );

        let mut missing = json!({"action": "produce", "queue": "orders"});
        assert_eq!(
            processor.process(&mut missing, &mut queues),
            Err(DispatchError::MissingField { field: "data" })
        );
        assert!(queues.get("orders").is_none());
    }

    #[test]
    fn list_and_size_report_without_mutating() {
        let processor = QueueProcessor::new();
        let mut queues = QueueManager::new();
        queues.get_or_create("a").expect("valid name");

        let mut list = json!({"action": "list"});
        processor
            .process(&mut list, &mut queues)
            .expect("list should succeed");
        assert_eq!(list["queues"], json!({"a": 0}));
    }

    #[test]
    fn parse_request_requires_json_object() {
        assert!(parse_request(r#"{"action":"list"}"#).is_ok());
        assert!(matches!(
            parse_request("[1,2]"),
            Err(DispatchError::MalformedDocument { .. })
        ));
        assert!(matches!(
            parse_request("not json"),
            Err(DispatchError::MalformedDocument { .. })
        ));
    }
}
