//! Destination classification and handler path patterns

use crate::error::{GatewayError, Result};

/// How a destination string is routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationKind {
    /// Handled by a bound application handler; carries the path after the prefix
    Application(String),
    /// A broker topic: subscribe target or direct broadcast target
    Topic,
    /// Neither prefix applies
    Unroutable,
}

/// Classifies destinations by the configured application and broker prefixes
#[derive(Debug, Clone)]
pub struct DestinationClassifier {
    app_prefix: String,
    broker_prefix: String,
}

impl DestinationClassifier {
    pub fn new(app_prefix: impl Into<String>, broker_prefix: impl Into<String>) -> Self {
        Self {
            app_prefix: app_prefix.into(),
            broker_prefix: broker_prefix.into(),
        }
    }

    pub fn app_prefix(&self) -> &str {
        &self.app_prefix
    }

    pub fn broker_prefix(&self) -> &str {
        &self.broker_prefix
    }

    pub fn classify(&self, destination: &str) -> DestinationKind {
        if let Some(path) = strip_segment_prefix(destination, &self.app_prefix) {
            return DestinationKind::Application(path.to_string());
        }
        if strip_segment_prefix(destination, &self.broker_prefix).is_some() {
            return DestinationKind::Topic;
        }
        DestinationKind::Unroutable
    }

    pub fn is_topic(&self, destination: &str) -> bool {
        self.classify(destination) == DestinationKind::Topic
    }
}

/// Strip `prefix` only on a segment boundary, leaving a non-empty `/...` path
fn strip_segment_prefix<'a>(destination: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = destination.strip_prefix(prefix)?;
    (rest.len() > 1 && rest.starts_with('/')).then_some(rest)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`: exactly one segment
    Any,
    /// `**`: any remainder, including nothing
    Rest,
}

/// Path pattern a handler is bound to, e.g. `/new-order`, `/orders/*/status`, `/audit/**`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationPattern {
    source: String,
    segments: Vec<Segment>,
}

impl DestinationPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let trimmed = pattern.trim_matches('/');
        if trimmed.is_empty() {
            return Err(GatewayError::Registration(
                "Handler pattern must not be empty".to_string(),
            ));
        }

        let parts: Vec<&str> = trimmed.split('/').collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (index, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => {
                    return Err(GatewayError::Registration(format!(
                        "Empty segment in handler pattern '{}'",
                        pattern
                    )))
                }
                "*" => Segment::Any,
                "**" if index + 1 == parts.len() => Segment::Rest,
                "**" => {
                    return Err(GatewayError::Registration(format!(
                        "'**' must be the last segment of '{}'",
                        pattern
                    )))
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            source: format!("/{}", trimmed),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let mut index = 0;
        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::Any => match parts.get(index) {
                    Some(part) if !part.is_empty() => index += 1,
                    _ => return false,
                },
                Segment::Literal(literal) => match parts.get(index) {
                    Some(part) if part == literal => index += 1,
                    _ => return false,
                },
            }
        }
        index == parts.len()
    }
}
