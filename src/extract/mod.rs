pub mod envelope;

pub use envelope::{DecodeError, Envelope, FieldMapping, LogLine};

use crate::config::types::MismatchStrategy;
use crate::config::Settings;
use regex::Regex;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Errors that stop the pipeline: the pattern and the data disagree.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("pattern does not match log line: {line:?}")]
    PatternMismatch { line: String },

    #[error("log field '{field}' holds a JSON {kind}, expected a string")]
    NotText { field: String, kind: &'static str },
}

/// Why a record was left out of every batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Undecodable(String),
    MissingLogField,
    /// Only reachable with `on-pattern-mismatch: drop`.
    PatternMismatch,
    InsufficientCaptures { expected: usize, found: usize },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Undecodable(e) => write!(f, "undecodable payload: {}", e),
            DropReason::MissingLogField => write!(f, "log field absent"),
            DropReason::PatternMismatch => write!(f, "pattern did not match"),
            DropReason::InsufficientCaptures { expected, found } => {
                write!(f, "captured {} of {} fields", found, expected)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Fields(FieldMapping),
    Dropped(DropReason),
}

/// Applies the configured pattern to the log line of one record.
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    pattern: Regex,
    pattern_index: Vec<String>,
    log_field: String,
    on_mismatch: MismatchStrategy,
}

impl FieldExtractor {
    pub fn new(
        pattern: Regex,
        pattern_index: Vec<String>,
        log_field: impl Into<String>,
        on_mismatch: MismatchStrategy,
    ) -> Self {
        Self {
            pattern,
            pattern_index,
            log_field: log_field.into(),
            on_mismatch,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.pattern.clone(),
            settings.pattern_index.clone(),
            settings.log_field.clone(),
            settings.on_pattern_mismatch,
        )
    }

    /// Decode `payload` and extract its fields.
    ///
    /// Captured groups are merged over the envelope's own top-level fields.
    pub fn extract(&self, payload: &[u8]) -> Result<Extraction, ExtractError> {
        let envelope = match Envelope::parse(payload) {
            Ok(envelope) => envelope,
            Err(e) => return Ok(Extraction::Dropped(DropReason::Undecodable(e.to_string()))),
        };

        let captured = match envelope.log_line(&self.log_field) {
            LogLine::Absent => return Ok(Extraction::Dropped(DropReason::MissingLogField)),
            LogLine::NotText(kind) => {
                return Err(ExtractError::NotText {
                    field: self.log_field.clone(),
                    kind,
                })
            }
            LogLine::Text(line) => match self.capture(line)? {
                Ok(captured) => captured,
                Err(reason) => return Ok(Extraction::Dropped(reason)),
            },
        };

        let mut fields = envelope.into_fields();
        fields.extend(captured);
        Ok(Extraction::Fields(fields))
    }

    fn capture(&self, line: &str) -> Result<Result<Vec<(String, String)>, DropReason>, ExtractError> {
        let Some(caps) = self.pattern.captures(line) else {
            return match self.on_mismatch {
                MismatchStrategy::Fail => Err(ExtractError::PatternMismatch {
                    line: line.to_string(),
                }),
                MismatchStrategy::Drop => {
                    warn!(line = %line, "Pattern did not match log line, dropping record");
                    Ok(Err(DropReason::PatternMismatch))
                }
            };
        };

        // Group 0 is the whole match
        let expected = self.pattern_index.len();
        let found = caps.len() - 1;
        if found < expected {
            return Ok(Err(DropReason::InsufficientCaptures { expected, found }));
        }

        // An optional group that did not participate maps to an empty value
        let captured = self
            .pattern_index
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let value = caps
                    .get(i + 1)
                    .map_or("", |group| group.as_str().trim_end_matches(['\n', '\r']));
                (name.clone(), value.to_string())
            })
            .collect();
        Ok(Ok(captured))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCESS_PATTERN: &str = r#"^(\S+) - - \[([^]]+)] "([^"]*)" (\d+) (\d+)"#;

    fn access_extractor(on_mismatch: MismatchStrategy) -> FieldExtractor {
        FieldExtractor::new(
            Regex::new(ACCESS_PATTERN).unwrap(),
            ["ip", "time", "request", "status", "bytes"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            "log",
            on_mismatch,
        )
    }

    fn envelope(log: &str) -> Vec<u8> {
        serde_json::json!({ "log": log, "stream": "stdout" })
            .to_string()
            .into_bytes()
    }

    fn fields(extraction: Extraction) -> FieldMapping {
        match extraction {
            Extraction::Fields(fields) => fields,
            Extraction::Dropped(reason) => panic!("record dropped: {reason}"),
        }
    }

    #[test]
    fn test_access_log_line_extracted() {
        let extractor = access_extractor(MismatchStrategy::Fail);
        let payload = envelope(
            r#"222.67.99.238 - - [04/Jan/2024:11:07:23 +0800] "GET / HTTP/1.1" 304 0"#,
        );

        let fields = fields(extractor.extract(&payload).unwrap());
        assert_eq!(fields["ip"], "222.67.99.238");
        assert_eq!(fields["time"], "04/Jan/2024:11:07:23 +0800");
        assert_eq!(fields["request"], "GET / HTTP/1.1");
        assert_eq!(fields["status"], "304");
        assert_eq!(fields["bytes"], "0");
        // Top-level envelope fields travel along
        assert_eq!(fields["stream"], "stdout");
    }

    #[test]
    fn test_trailing_newlines_trimmed_from_captures() {
        let extractor = FieldExtractor::new(
            Regex::new(r"(?s)^(\w+) (.*)$").unwrap(),
            vec!["level".to_string(), "message".to_string()],
            "log",
            MismatchStrategy::Fail,
        );

        let fields = fields(extractor.extract(&envelope("WARN disk almost full\r\n")).unwrap());
        assert_eq!(fields["level"], "WARN");
        assert_eq!(fields["message"], "disk almost full");
    }

    #[test]
    fn test_captures_override_envelope_fields() {
        let extractor = FieldExtractor::new(
            Regex::new(r"^(\w+)").unwrap(),
            vec!["level".to_string()],
            "log",
            MismatchStrategy::Fail,
        );
        let payload = br#"{"log":"ERROR boom","level":"INFO"}"#;

        let fields = fields(extractor.extract(payload).unwrap());
        assert_eq!(fields["level"], "ERROR");
    }

    #[test]
    fn test_missing_log_field_dropped() {
        let extractor = access_extractor(MismatchStrategy::Fail);
        let extraction = extractor.extract(br#"{"message":"no log here"}"#).unwrap();
        assert_eq!(extraction, Extraction::Dropped(DropReason::MissingLogField));
    }

    #[test]
    fn test_null_log_field_dropped() {
        let extractor = access_extractor(MismatchStrategy::Fail);
        let extraction = extractor.extract(br#"{"log":null}"#).unwrap();
        assert_eq!(extraction, Extraction::Dropped(DropReason::MissingLogField));
    }

    #[test]
    fn test_undecodable_payload_dropped() {
        let extractor = access_extractor(MismatchStrategy::Fail);
        let extraction = extractor.extract(b"\xff\xfe plain bytes").unwrap();
        assert!(matches!(
            extraction,
            Extraction::Dropped(DropReason::Undecodable(_))
        ));
    }

    #[test]
    fn test_non_string_log_field_is_fatal() {
        let extractor = access_extractor(MismatchStrategy::Fail);
        let err = extractor.extract(br#"{"log":{"nested":true}}"#).unwrap_err();
        assert!(matches!(err, ExtractError::NotText { kind: "object", .. }));
    }

    #[test]
    fn test_pattern_mismatch_is_fatal_by_default() {
        let extractor = access_extractor(MismatchStrategy::Fail);
        let err = extractor.extract(&envelope("garbage")).unwrap_err();
        match err {
            ExtractError::PatternMismatch { line } => assert_eq!(line, "garbage"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_pattern_mismatch_dropped_when_configured() {
        let extractor = access_extractor(MismatchStrategy::Drop);
        let extraction = extractor.extract(&envelope("garbage")).unwrap();
        assert_eq!(extraction, Extraction::Dropped(DropReason::PatternMismatch));
    }

    #[test]
    fn test_non_participating_group_maps_to_empty_value() {
        let extractor = FieldExtractor::new(
            Regex::new(r#"^(\S+) (\d+)(?: "([^"]*)")?"#).unwrap(),
            vec!["ip".to_string(), "status".to_string(), "referer".to_string()],
            "log",
            MismatchStrategy::Fail,
        );

        let fields = fields(extractor.extract(&envelope("10.0.0.1 200")).unwrap());
        assert_eq!(fields["ip"], "10.0.0.1");
        assert_eq!(fields["status"], "200");
        assert_eq!(fields["referer"], "");

        let fields = self::fields(
            extractor
                .extract(&envelope(r#"10.0.0.1 200 "https://example.com/""#))
                .unwrap(),
        );
        assert_eq!(fields["referer"], "https://example.com/");
    }

    #[test]
    fn test_insufficient_captures_dropped() {
        // Built directly, bypassing config validation of the group count
        let extractor = FieldExtractor::new(
            Regex::new(r"^(\w+)").unwrap(),
            vec!["action".to_string(), "user".to_string()],
            "log",
            MismatchStrategy::Fail,
        );

        let extraction = extractor.extract(&envelope("login")).unwrap();
        assert_eq!(
            extraction,
            Extraction::Dropped(DropReason::InsufficientCaptures {
                expected: 2,
                found: 1
            })
        );
    }
}
