//! Text side of the link: newline-terminated UTF-8 lines.
//!
//! Outbound, the host only ever sends JSON commands (`{"cmd": "...", ...}`) plus the
//! raw emergency stop byte. Inbound, the bench mixes free-form diagnostic text, JSON
//! objects that may carry an `"event"` field, the bare handshake line `READY`, and
//! progress lines of the form `Cycle finished: <n>`.

use std::fmt;
use std::num::ParseIntError;

use serde_json::{json, Map, Value};

use crate::errors::Result;

pub const LINE_TERMINATOR: u8 = b'\n';

/// Raw control byte stopping the bench immediately. Sent outside the JSON envelope.
pub const EMERGENCY_STOP_BYTE: u8 = 0xFF;

/// Exact line the bench prints once it is initialized.
pub const HANDSHAKE_LINE: &str = "READY";

const CYCLE_FINISHED_PREFIX: &str = "Cycle finished:";

/// Event tag carried by an inbound JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Event {
    Ready,
    Start,
    End,
    Idle,
    EmergencyStop,
    /// Answer to a weigh request.
    Read,
    Other(String),
}

impl Event {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "READY" => Event::Ready,
            "START" => Event::Start,
            "END" => Event::End,
            "IDLE" => Event::Idle,
            "EMERGENCY_STOP" => Event::EmergencyStop,
            "READ" => Event::Read,
            other => Event::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Event::Ready => "READY",
            Event::Start => "START",
            Event::End => "END",
            Event::Idle => "IDLE",
            Event::EmergencyStop => "EMERGENCY_STOP",
            Event::Read => "READ",
            Event::Other(tag) => tag,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    /// Free text: diagnostics, `READY`, `Cycle finished: n`.
    Plain,
    Json(Map<String, Value>),
    /// Looked like JSON but did not parse. Carries the parser message.
    MalformedJson(String),
}

/// One decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub struct TextLine {
    /// Trimmed line text, with invalid UTF-8 replaced.
    pub text: String,
    pub kind: LineKind,
}

impl TextLine {
    pub fn message(&self) -> Option<&Map<String, Value>> {
        match &self.kind {
            LineKind::Json(map) => Some(map),
            _ => None,
        }
    }

    /// The `event` field of a JSON line. Non-string values are kept as their JSON text.
    pub fn event(&self) -> Option<Event> {
        match self.message()?.get("event")? {
            Value::String(tag) => Some(Event::parse(tag)),
            Value::Null => None,
            other => Some(Event::Other(other.to_string())),
        }
    }

    pub fn is_handshake(&self) -> bool {
        self.kind == LineKind::Plain && self.text == HANDSHAKE_LINE
    }

    /// `Some` when the line is a cycle progress line, with the parse result of its count.
    pub fn cycle_finished(&self) -> Option<std::result::Result<u32, ParseIntError>> {
        match self.kind {
            LineKind::Plain => parse_cycle_finished(&self.text),
            _ => None,
        }
    }
}

/// Recognize `Cycle finished: <n>`.
pub fn parse_cycle_finished(line: &str) -> Option<std::result::Result<u32, ParseIntError>> {
    line.trim()
        .strip_prefix(CYCLE_FINISHED_PREFIX)
        .map(|count| count.trim().parse::<u32>())
}

/// Decode one line as received (terminator optional).
pub fn decode_line(raw: &[u8]) -> TextLine {
    let text = String::from_utf8_lossy(raw).trim().to_string();
    let kind = if text.starts_with('{') {
        match serde_json::from_str::<Map<String, Value>>(&text) {
            Ok(map) => LineKind::Json(map),
            Err(e) => LineKind::MalformedJson(e.to_string()),
        }
    } else {
        LineKind::Plain
    };
    TextLine { text, kind }
}

/// Motion parameters of a stiffness test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestParameters {
    /// mm/s
    pub speed: f64,
    /// Measured cycles, not counting a preparation cycle.
    pub cycles: u32,
    /// N
    pub max_force: f64,
    /// mm
    pub max_distance: f64,
}

impl Default for TestParameters {
    fn default() -> Self {
        Self {
            speed: 0.5,
            cycles: 5,
            max_force: 50.0,
            max_distance: 10.0,
        }
    }
}

/// Outbound JSON command: a `cmd` name plus free-form parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Command(Map<String, Value>);

impl Command {
    pub fn new(cmd: &str) -> Self {
        let mut map = Map::new();
        map.insert("cmd".to_string(), Value::String(cmd.to_string()));
        Command(map)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get("cmd").and_then(Value::as_str)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Start a test. The bench counts the preparation cycle as a regular one, so it is
    /// added to the requested count when enabled.
    pub fn start(params: &TestParameters, preparation_cycle: bool) -> Self {
        let cycles = params.cycles.saturating_add(u32::from(preparation_cycle));
        Command::new("start").with(
            "p",
            json!({
                "sp": params.speed,
                "cy": cycles,
                "ft": params.max_force,
                "dm": params.max_distance,
            }),
        )
    }

    pub fn up() -> Self {
        Command::new("up")
    }

    pub fn down() -> Self {
        Command::new("down")
    }

    pub fn stop() -> Self {
        Command::new("stop")
    }

    pub fn homing() -> Self {
        Command::new("homing")
    }

    /// Calibrate the load cell against a known weight in grams.
    pub fn calibrate(weight_g: f64) -> Self {
        Command::new("calibrate").with("weight", weight_g)
    }

    /// Ask the bench for a single weight reading.
    pub fn read_weight() -> Self {
        Command::new("read")
    }

    /// JSON text plus the line terminator.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(&self.0)?;
        bytes.push(LINE_TERMINATOR);
        Ok(bytes)
    }
}

impl From<Map<String, Value>> for Command {
    fn from(map: Map<String, Value>) -> Self {
        Command(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_line_is_trimmed() {
        let line = decode_line(b"  motor homed \r\n");
        assert_eq!(line.text, "motor homed");
        assert_eq!(line.kind, LineKind::Plain);
        assert_eq!(line.event(), None);
    }

    #[test]
    fn json_line_exposes_event() {
        let line = decode_line(br#"{"event":"START","t":0}"#);
        assert_eq!(line.event(), Some(Event::Start));
        assert_eq!(line.message().unwrap()["t"], json!(0));
    }

    #[test]
    fn json_without_event_has_no_event() {
        let line = decode_line(br#"{"f": 12.5}"#);
        assert!(line.message().is_some());
        assert_eq!(line.event(), None);
    }

    #[test]
    fn unknown_event_is_kept_verbatim() {
        let line = decode_line(br#"{"event":"OVERLOAD"}"#);
        assert_eq!(line.event(), Some(Event::Other("OVERLOAD".into())));
        let numeric = decode_line(br#"{"event":7}"#);
        assert_eq!(numeric.event(), Some(Event::Other("7".into())));
    }

    #[test]
    fn malformed_json_is_flagged_not_fatal() {
        let line = decode_line(br#"{"event": "START""#);
        assert!(matches!(line.kind, LineKind::MalformedJson(_)));
        assert_eq!(line.event(), None);
        assert_eq!(line.text, r#"{"event": "START""#);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let line = decode_line(&[b'o', b'k', 0xC3, b'!', b'\n']);
        assert!(line.text.starts_with("ok"));
        assert!(line.text.ends_with('!'));
        assert_eq!(line.kind, LineKind::Plain);
    }

    #[test]
    fn handshake_requires_exact_line() {
        assert!(decode_line(b"READY\r\n").is_handshake());
        assert!(!decode_line(b"READY!").is_handshake());
        assert!(!decode_line(br#"{"event":"READY"}"#).is_handshake());
    }

    #[test]
    fn cycle_finished_lines() {
        assert_eq!(parse_cycle_finished("Cycle finished: 3"), Some(Ok(3)));
        assert_eq!(parse_cycle_finished("Cycle finished:12  "), Some(Ok(12)));
        assert!(matches!(parse_cycle_finished("Cycle finished: x"), Some(Err(_))));
        assert_eq!(parse_cycle_finished("Cycle started: 3"), None);
        assert_eq!(decode_line(b"Cycle finished: 1\n").cycle_finished(), Some(Ok(1)));
    }

    #[test]
    fn event_names_round_trip() {
        for tag in ["READY", "START", "END", "IDLE", "EMERGENCY_STOP", "READ", "FOO"] {
            assert_eq!(Event::parse(tag).as_str(), tag);
        }
    }

    #[test]
    fn start_command_adds_preparation_cycle() {
        let params = TestParameters {
            speed: 0.5,
            cycles: 5,
            max_force: 50.0,
            max_distance: 10.0,
        };
        let with_prep = Command::start(&params, true);
        assert_eq!(with_prep.name(), Some("start"));
        assert_eq!(with_prep.fields()["p"]["cy"], json!(6));
        assert_eq!(Command::start(&params, false).fields()["p"]["cy"], json!(5));
    }

    #[test]
    fn encoded_command_is_one_json_line() {
        let bytes = Command::calibrate(1550.7).encode().unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 1);

        let parsed: Value = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(parsed, json!({"cmd": "calibrate", "weight": 1550.7}));
    }

    #[test]
    fn simple_commands_carry_only_their_name() {
        for (command, name) in [
            (Command::up(), "up"),
            (Command::down(), "down"),
            (Command::stop(), "stop"),
            (Command::homing(), "homing"),
            (Command::read_weight(), "read"),
        ] {
            assert_eq!(command.name(), Some(name));
            assert_eq!(command.fields().len(), 1);
        }
    }
}
