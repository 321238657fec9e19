//!
//! Stateless classifier of raw device response lines into typed events.
//!

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use super::super::error::ParserError;
use super::events::{DeviceEvent, DeviceEventKind};

/// Matches a line number from a resend message.
static RE_LINE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"N?:?(\d+)").unwrap());

/// Matches a key-value pair from a feedback message.
static RE_PARAMETER: Lazy<Regex> = Lazy::new(|| Regex::new(r"([A-Za-z0-9@]+):([\d.,\-]+)").unwrap());

/// Axes order for position readings.
const ORDERED_AXES: [&str; 3] = ["X", "Y", "Z"];

/// Maps response prefixes to event kinds. Order matters: first match wins.
const PREFIX_TABLE: &[(&str, DeviceEventKind)] = &[
    ("!!", DeviceEventKind::Fault),
    ("[", DeviceEventKind::Feedback),
    ("//", DeviceEventKind::Debug),
    ("<", DeviceEventKind::Feedback),
    ("ALARM:", DeviceEventKind::Fault),
    ("busy:", DeviceEventKind::Busy),
    ("error:", DeviceEventKind::Error),
    ("Error:", DeviceEventKind::Error),
    ("fatal:", DeviceEventKind::Fault),
    ("Grbl", DeviceEventKind::Online),
    ("grbl", DeviceEventKind::Online),
    ("ok", DeviceEventKind::Ready),
    ("Resend:", DeviceEventKind::Resend),
    ("resend:", DeviceEventKind::Resend),
    ("rs:", DeviceEventKind::Resend),
    ("start", DeviceEventKind::Online),
    ("wait", DeviceEventKind::Wait),
];

///
/// Lightweight G-code response parser.
///
/// Parses raw string responses from a device into structured event objects, and
/// provides utility functions to extract specific data fields from status report
/// messages.
///
/// This parser is intentionally permissive to accommodate firmware variations. It
/// cannot reliably detect malformed messages that may result from serial
/// communication errors. For safety-critical applications, consider implementing
/// additional validation.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct EventParser;

impl EventParser {
    pub fn new() -> Self {
        EventParser
    }

    ///
    /// Parses a raw device response into a `DeviceEvent`.
    ///
    /// Matches the response prefix against the predefined prefix table. If a match
    /// is found, the event carries the corresponding kind; otherwise it carries
    /// `DeviceEventKind::Generic`.
    ///
    pub fn parse(&self, raw_response: &str) -> DeviceEvent {
        for (prefix, kind) in PREFIX_TABLE {
            if raw_response.starts_with(prefix) {
                return DeviceEvent::new(*kind, raw_response);
            }
        }

        DeviceEvent::new(DeviceEventKind::Generic, raw_response)
    }

    ///
    /// Extracts the line number from a resend message.
    ///
    /// Returns `-1` if no line number could be found.
    ///
    pub fn extract_line_number(raw_response: &str) -> i64 {
        RE_LINE_NUMBER
            .captures(raw_response)
            .and_then(|captures| captures.get(1))
            .and_then(|group| group.as_str().parse::<i64>().ok())
            .unwrap_or(-1)
    }

    ///
    /// Extracts parameter readings from a device message.
    ///
    /// Parses key-value pairs from status reports (e.g. Grbl status lines or
    /// RepRap M114/M105 responses). Handles `MPos`/`WPos`/`PRB` coordinates and
    /// `FS` (feed/speed) values specially; other uppercase or `@`-prefixed keys
    /// store their first numeric component directly. First occurrence wins.
    ///
    /// # Errors
    /// `ParserError::MalformedFeedback` if a numeric component fails to parse, or
    /// an `FS` field does not carry exactly two components.
    ///
    pub fn extract_fields(raw_response: &str) -> Result<BTreeMap<String, f64>, ParserError> {
        let mut fields = BTreeMap::new();

        for captures in RE_PARAMETER.captures_iter(raw_response) {
            let key = &captures[1];
            let value = &captures[2];

            let parts = value
                .split(',')
                .map(|part| part.parse::<f64>())
                .collect::<Result<Vec<f64>, _>>()
                .map_err(|_| ParserError::MalformedFeedback {
                    reason: format!("non-numeric component in '{key}:{value}'"),
                })?;

            if matches!(key, "MPos" | "WPos" | "PRB") {
                for (axis, coord) in ORDERED_AXES.iter().zip(parts.iter()) {
                    fields.entry((*axis).to_string()).or_insert(*coord);
                }
            } else if key == "FS" && raw_response.starts_with('<') {
                if parts.len() == 2 {
                    fields.entry("F".to_string()).or_insert(parts[0]);
                    fields.entry("S".to_string()).or_insert(parts[1]);
                } else {
                    return Err(ParserError::MalformedFeedback {
                        reason: "'FS' field must carry exactly two components".to_string(),
                    });
                }
            } else if key.starts_with('@') || key.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
                if let Some(first) = parts.first() {
                    fields.entry(key.to_string()).or_insert(*first);
                }
            }
        }

        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_matches_prefix_table() {
        let parser = EventParser::new();
        assert_eq!(parser.parse("!!").kind(), DeviceEventKind::Fault);
        assert_eq!(parser.parse("[MSG:Reset]").kind(), DeviceEventKind::Feedback);
        assert_eq!(parser.parse("// debug note").kind(), DeviceEventKind::Debug);
        assert_eq!(parser.parse("<Idle|MPos:0,0,0>").kind(), DeviceEventKind::Feedback);
        assert_eq!(parser.parse("ALARM: hard limit").kind(), DeviceEventKind::Fault);
        assert_eq!(parser.parse("busy:processing").kind(), DeviceEventKind::Busy);
        assert_eq!(parser.parse("error:9").kind(), DeviceEventKind::Error);
        assert_eq!(parser.parse("Error:9").kind(), DeviceEventKind::Error);
        assert_eq!(parser.parse("fatal: watchdog").kind(), DeviceEventKind::Fault);
        assert_eq!(parser.parse("Grbl 1.1h ['$' for help]").kind(), DeviceEventKind::Online);
        assert_eq!(parser.parse("grbl booting").kind(), DeviceEventKind::Online);
        assert_eq!(parser.parse("ok").kind(), DeviceEventKind::Ready);
        assert_eq!(parser.parse("Resend: 12").kind(), DeviceEventKind::Resend);
        assert_eq!(parser.parse("resend:12").kind(), DeviceEventKind::Resend);
        assert_eq!(parser.parse("rs:12").kind(), DeviceEventKind::Resend);
        assert_eq!(parser.parse("start").kind(), DeviceEventKind::Online);
        assert_eq!(parser.parse("wait").kind(), DeviceEventKind::Wait);
        assert_eq!(parser.parse("unrecognized line").kind(), DeviceEventKind::Generic);
    }

    #[test]
    fn ok_with_trailing_fields_is_still_ready() {
        let parser = EventParser::new();
        assert_eq!(parser.parse("ok T:210.0 /210.0").kind(), DeviceEventKind::Ready);
    }

    #[test]
    fn extract_line_number_variants() {
        assert_eq!(EventParser::extract_line_number("Resend: 5"), 5);
        assert_eq!(EventParser::extract_line_number("resend:12"), 12);
        assert_eq!(EventParser::extract_line_number("rs:N:42"), 42);
        assert_eq!(EventParser::extract_line_number("no digits here"), -1);
    }

    #[test]
    fn extract_fields_grbl_status() {
        let fields = EventParser::extract_fields("<Idle|MPos:10.0,20.0,30.0|FS:500,12000>").unwrap();
        assert_eq!(fields.get("X"), Some(&10.0));
        assert_eq!(fields.get("Y"), Some(&20.0));
        assert_eq!(fields.get("Z"), Some(&30.0));
        assert_eq!(fields.get("F"), Some(&500.0));
        assert_eq!(fields.get("S"), Some(&12000.0));
    }

    #[test]
    fn extract_fields_reprap_style() {
        let fields = EventParser::extract_fields("ok T:210.5 B:60.0").unwrap();
        assert_eq!(fields.get("T"), Some(&210.5));
        assert_eq!(fields.get("B"), Some(&60.0));
    }

    #[test]
    fn extract_fields_first_occurrence_wins() {
        let fields = EventParser::extract_fields("T:200 T:210").unwrap();
        assert_eq!(fields.get("T"), Some(&200.0));
    }

    #[test]
    fn extract_fields_ignores_lowercase_and_digit_leading_keys() {
        let fields = EventParser::extract_fields("feed:100 9x:5").unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn extract_fields_fs_outside_status_report_ignored() {
        let fields = EventParser::extract_fields("ok FS:500,12000").unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn extract_fields_fs_wrong_arity_fails() {
        let result = EventParser::extract_fields("<Idle|FS:500>");
        assert!(matches!(result, Err(ParserError::MalformedFeedback { .. })));
    }

    #[test]
    fn extract_fields_malformed_component_fails() {
        let result = EventParser::extract_fields("<Idle|MPos:10.0,,30.0>");
        assert!(matches!(result, Err(ParserError::MalformedFeedback { .. })));
    }
}
