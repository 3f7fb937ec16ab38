//! Shape checks for task submissions.
//!
//! Validation runs before a task record exists; a failure here means nothing
//! was created and no state changed.

use serde_json::{Map, Value};

use crate::types::TaskType;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("task type '{0}' requires a domainId")]
    MissingDomain(TaskType),
    #[error("task type '{0}' does not accept a domainId")]
    UnexpectedDomain(TaskType),
    #[error("inputPayload must be a JSON object")]
    PayloadNotObject,
    #[error("inputPayload.{field} {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
}

/// Validate a submission and return the normalised payload (`null` becomes `{}`).
pub fn validate_submission(
    task_type: TaskType,
    domain_id: Option<&str>,
    payload: &Value,
) -> Result<Value, ValidationError> {
    let domain = domain_id.map(str::trim).filter(|d| !d.is_empty());
    match (task_type.is_domain_scoped(), domain) {
        (true, None) => return Err(ValidationError::MissingDomain(task_type)),
        (false, Some(_)) => return Err(ValidationError::UnexpectedDomain(task_type)),
        _ => {}
    }

    let object = match payload {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        _ => return Err(ValidationError::PayloadNotObject),
    };

    if let Some(files) = object.get("files") {
        let ok = files
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string));
        if !ok {
            return Err(ValidationError::InvalidField {
                field: "files",
                expected: "must be an array of strings",
            });
        }
    }

    if let Some(ctx) = object.get("userContext") {
        if !ctx.is_string() {
            return Err(ValidationError::InvalidField {
                field: "userContext",
                expected: "must be a string",
            });
        }
    }

    if let Some(flag) = object.get("includeRequirements") {
        if !flag.is_boolean() {
            return Err(ValidationError::InvalidField {
                field: "includeRequirements",
                expected: "must be a boolean",
            });
        }
    }

    if task_type == TaskType::Chat {
        let has_message = object
            .get("message")
            .and_then(Value::as_str)
            .is_some_and(|m| !m.trim().is_empty());
        if !has_message {
            return Err(ValidationError::InvalidField {
                field: "message",
                expected: "must be a non-empty string",
            });
        }
    }

    Ok(Value::Object(object))
}
