//! Topic and client identifier validation
//!
//! Local checks applied before anything reaches the engine, so that a bad
//! will topic or identifier surfaces as a configuration error.

use thiserror::Error;

/// Client identifier limit mandated by MQTT 3.1
pub const MQTT_V31_CLIENT_ID_MAX: usize = 23;

/// Topic strings are length-prefixed with a u16 on the wire
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Validate a concrete topic name (publish or will topic)
pub fn validate_topic_name(topic: &str) -> Result<(), ValidationError> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(ValidationError::WildcardInTopicName(topic.to_string()));
    }
    Ok(())
}

/// Validate a subscription filter.
///
/// `+` must occupy a whole level, `#` must occupy the whole last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), ValidationError> {
    check_common(filter)?;
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != last) {
            return Err(ValidationError::MalformedFilter(filter.to_string()));
        }
        if level.contains('+') && *level != "+" {
            return Err(ValidationError::MalformedFilter(filter.to_string()));
        }
    }
    Ok(())
}

/// Validate a client identifier against an optional length limit
pub fn validate_client_id(client_id: &str, max_len: Option<usize>) -> Result<(), ValidationError> {
    if let Some(max) = max_len {
        let len = client_id.chars().count();
        if len > max {
            return Err(ValidationError::ClientIdTooLong { len, max });
        }
    }
    if client_id.contains('\0') {
        return Err(ValidationError::NulCharacter);
    }
    Ok(())
}

fn check_common(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(ValidationError::TopicTooLong(topic.len()));
    }
    if topic.contains('\0') {
        return Err(ValidationError::NulCharacter);
    }
    Ok(())
}

/// Validation errors for topics and identifiers
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic is {0} bytes, longer than the protocol allows")]
    TopicTooLong(usize),
    #[error("Topic name must not contain wildcards: '{0}'")]
    WildcardInTopicName(String),
    #[error("Malformed topic filter: '{0}'")]
    MalformedFilter(String),
    #[error("Client ID is {len} characters, limit is {max}")]
    ClientIdTooLong { len: usize, max: usize },
    #[error("NUL character is not allowed")]
    NulCharacter,
}
