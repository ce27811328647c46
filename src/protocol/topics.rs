//! Topic list handling and adapter name validation
//!
//! Subscribe and publish topics are configured as comma separated lists.
//! Publishing appends the message's topic metadata to each configured root.

use thiserror::Error;

/// Split a comma separated topic list, trimming whitespace and dropping empties
pub fn split_topic_list(topics: &str) -> Vec<String> {
    topics
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join a publish root with an optional suffix taken from message metadata
pub fn publish_topic(root: &str, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) if !suffix.is_empty() => {
            format!(
                "{}/{}",
                root.trim_end_matches('/'),
                suffix.trim_start_matches('/')
            )
        }
        _ => root.to_string(),
    }
}

/// Scheduler/queue identifier of an adapter's source side
pub fn source_id(adapter_name: &str) -> String {
    format!("{adapter_name}_adapter_source")
}

/// Scheduler/queue identifier of an adapter's MQTT side
pub fn mqtt_id(adapter_name: &str) -> String {
    format!("{adapter_name}_adapter_mqtt")
}

/// Prefix shared by every scheduler entry of one adapter
pub fn adapter_prefix(adapter_name: &str) -> String {
    format!("{adapter_name}_adapter_")
}

pub fn validate_adapter_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyAdapterName);
    }

    for ch in name.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidAdapterNameChar(ch));
        }
    }

    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Adapter name cannot be empty")]
    EmptyAdapterName,
    #[error("Adapter name contains invalid character: '{0}'")]
    InvalidAdapterNameChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn split_topic_list_never_yields_blank_entries(topics in "[a-z/ ,#+]*") {
            for topic in split_topic_list(&topics) {
                prop_assert!(!topic.is_empty());
                prop_assert_eq!(topic.trim(), topic.as_str());
            }
        }
    }

    #[test]
    fn test_split_topic_list() {
        assert_eq!(
            split_topic_list(" in/# , other/+/x,,"),
            vec!["in/#".to_string(), "other/+/x".to_string()]
        );
        assert!(split_topic_list("").is_empty());
        assert!(split_topic_list(" , ").is_empty());
    }

    #[test]
    fn test_publish_topic_with_suffix() {
        assert_eq!(publish_topic("out", Some("1/2/0/3/5")), "out/1/2/0/3/5");
        assert_eq!(publish_topic("out/", Some("/a")), "out/a");
    }

    #[test]
    fn test_publish_topic_without_suffix() {
        assert_eq!(publish_topic("out", None), "out");
        assert_eq!(publish_topic("out", Some("")), "out");
    }

    #[test]
    fn test_side_ids() {
        assert_eq!(source_id("garage"), "garage_adapter_source");
        assert_eq!(mqtt_id("garage"), "garage_adapter_mqtt");
        assert!(source_id("garage").starts_with(&adapter_prefix("garage")));
        assert!(mqtt_id("garage").starts_with(&adapter_prefix("garage")));
    }

    #[test]
    fn test_validate_adapter_name() {
        assert!(validate_adapter_name("serial-gw_1.main").is_ok());
        assert_eq!(
            validate_adapter_name(""),
            Err(ValidationError::EmptyAdapterName)
        );
        assert_eq!(
            validate_adapter_name("bad name"),
            Err(ValidationError::InvalidAdapterNameChar(' '))
        );
    }
}
