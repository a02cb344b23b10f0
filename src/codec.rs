//! Line framing, request parsing, and response formatting for the Remote In
//! wire protocol: `?REQ_ID COMMAND PARAM*\n` in, `!REQ_ID OK|Error:CODE ...\n` out.

use std::collections::HashMap;
use std::fmt;
use std::io::BufRead;

/// Largest accepted frame, including the terminator. Guards against an
/// unbounded `read_line` on a misbehaving or hostile client.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

pub const FALLBACK_REQ_ID: &str = "FFFF";

/// One parsed value from the `NUMBER | QUOTED_STRING | LIST | BARE_WORD` grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Word(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Word(w) => w.parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Word(w) => w.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Word(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Formats an `f64` with the shortest representation that round-trips,
/// guaranteeing a visible decimal point so the wire value is unambiguously a
/// float (matching the worked examples in the protocol spec, e.g. `400.0`).
pub fn format_float(v: f64) -> String {
    let s = format!("{v:?}");
    if s.contains(['.', 'e', 'E']) || s == "NaN" || s == "inf" || s == "-inf" {
        s
    } else {
        format!("{s}.0")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{}", format_float(*v)),
            Value::Str(s) => write!(f, "\"{s}\""),
            Value::Word(w) => write!(f, "{w}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

pub type Params = HashMap<String, Value>;

#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub command: String,
    pub params: Params,
}

impl Request {
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        self.param(key).and_then(Value::as_f64)
    }

    pub fn u32(&self, key: &str) -> Option<u32> {
        self.param(key).and_then(Value::as_i64).map(|v| v.max(0) as u32)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }

    pub fn list(&self, key: &str) -> Option<&[Value]> {
        self.param(key).and_then(Value::as_list)
    }
}

/// A malformed frame: carries whatever request id could be salvaged (or
/// `FFFF` if none) so the caller can still address the error response.
#[derive(Debug, Clone)]
pub struct FrameError {
    pub req_id: String,
    pub message: String,
}

/// Reads one LF-terminated frame from `reader`. Tolerates a CR before the LF.
/// Returns `Ok(None)` at end of stream. A line beyond [`MAX_FRAME_LEN`] is
/// truncated to that many bytes before parsing rather than allowed to grow
/// the buffer unbounded.
pub fn read_frame(reader: &mut impl BufRead) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    let mut chunk = reader.take(MAX_FRAME_LEN as u64);
    let n = chunk.read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else {
        // Frame exceeded MAX_FRAME_LEN without a terminator: drain the rest
        // of the oversized line so the next read starts at the next frame.
        let reader = chunk.into_inner();
        let mut discard = Vec::new();
        reader.read_until(b'\n', &mut discard)?;
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Splits a line into whitespace-separated tokens, treating a double-quoted
/// span (with `\"` escapes) as a single token even when it contains spaces.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push('"');
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn parse_scalar(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Float(f);
    }
    Value::Word(raw.to_string())
}

fn unquote(raw: &str) -> String {
    raw[1..raw.len() - 1].replace("\\\"", "\"")
}

fn parse_value(raw: &str) -> Value {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Value::Str(unquote(raw));
    }
    if raw.len() >= 2 && raw.starts_with('[') && raw.ends_with(']') {
        let inner = &raw[1..raw.len() - 1];
        if inner.trim().is_empty() {
            return Value::List(Vec::new());
        }
        let items = inner.split(',').map(|item| parse_value(item.trim())).collect();
        return Value::List(items);
    }
    parse_scalar(raw)
}

fn is_hex4(s: &str) -> bool {
    s.len() == 4 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parses one request frame. On malformed input, returns the most specific
/// request id that could be salvaged together with a human-readable message;
/// never panics and never requires a side-channel for framing errors.
pub fn parse_request(line: &str) -> Result<Request, FrameError> {
    let line = line.trim();
    if !line.starts_with('?') || line.len() < 5 {
        return Err(FrameError {
            req_id: FALLBACK_REQ_ID.to_string(),
            message: "Unknown message format.".to_string(),
        });
    }
    let req_id = &line[1..5];
    if !is_hex4(req_id) {
        return Err(FrameError {
            req_id: FALLBACK_REQ_ID.to_string(),
            message: "Unknown message format.".to_string(),
        });
    }

    let rest = line[5..].trim_start();
    let tokens = tokenize(rest);
    let Some((command, param_tokens)) = tokens.split_first() else {
        return Err(FrameError {
            req_id: req_id.to_string(),
            message: "Unknown message format.".to_string(),
        });
    };

    let mut params = Params::new();
    for token in param_tokens {
        if let Some((key, raw_value)) = token.split_once(':') {
            params.insert(key.to_string(), parse_value(raw_value));
        }
    }

    Ok(Request {
        id: req_id.to_string(),
        command: command.clone(),
        params,
    })
}

/// Builds `!REQ_ID OK` or `!REQ_ID OK: k1:v1 k2:v2 ...`.
pub fn format_ok(req_id: &str, params: &[(&str, Value)]) -> String {
    if params.is_empty() {
        format!("!{req_id} OK")
    } else {
        let body = params
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(" ");
        format!("!{req_id} OK: {body}")
    }
}

/// Builds `!REQ_ID Error:CODE message`.
pub fn format_error(req_id: &str, code: u16, message: &str) -> String {
    format!("!{req_id} Error:{code} {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Cursor;

    #[test]
    fn reads_lf_terminated_frame() {
        let mut cursor = Cursor::new(b"?0001 Connect\n?0002 Disconnect\n".to_vec());
        assert_eq!(
            read_frame(&mut cursor).unwrap(),
            Some("?0001 Connect".to_string())
        );
        assert_eq!(
            read_frame(&mut cursor).unwrap(),
            Some("?0002 Disconnect".to_string())
        );
        assert_eq!(read_frame(&mut cursor).unwrap(), None);
    }

    #[test]
    fn tolerates_crlf() {
        let mut cursor = Cursor::new(b"?0001 Connect\r\n".to_vec());
        assert_eq!(
            read_frame(&mut cursor).unwrap(),
            Some("?0001 Connect".to_string())
        );
    }

    #[test]
    fn parses_quoted_value_with_spaces() {
        let req = parse_request("?0001 SetAnalyzerParameterValue ParameterName:\"Detector Voltage\" Value:5").unwrap();
        assert_eq!(req.str("ParameterName"), Some("Detector Voltage"));
        assert_eq!(req.f64("Value"), Some(5.0));
    }

    #[test]
    fn parses_numbers_and_lists() {
        let req = parse_request("?0001 DefineSpectrumFE Energies:[1.0,2.5,3] DwellTime:0.01").unwrap();
        let list = req.list("Energies").unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].as_f64(), Some(1.0));
        assert_eq!(list[2].as_f64(), Some(3.0));
        assert_eq!(req.f64("DwellTime"), Some(0.01));
    }

    #[rstest]
    #[case("")]
    #[case("Connect")]
    #[case("?12gh")]
    #[case("?12")]
    fn malformed_frames_fall_back_to_ffff(#[case] line: &str) {
        let err = parse_request(line).unwrap_err();
        assert_eq!(err.req_id, FALLBACK_REQ_ID);
    }

    #[test]
    fn malformed_command_keeps_salvaged_id() {
        let err = parse_request("?0a1B ").unwrap_err();
        assert_eq!(err.req_id, "0a1B");
    }

    #[test]
    fn req_id_echoed_verbatim_preserves_case() {
        let req = parse_request("?0A1b Connect").unwrap();
        assert_eq!(req.id, "0A1b");
    }

    #[test]
    fn format_float_always_shows_decimal_point() {
        assert_eq!(format_float(400.0), "400.0");
        assert_eq!(format_float(0.5), "0.5");
    }

    #[test]
    fn format_ok_without_params() {
        assert_eq!(format_ok("0001", &[]), "!0001 OK");
    }

    #[test]
    fn format_ok_with_params_has_no_space_after_colon() {
        let out = format_ok("0001", &[("Samples", Value::Int(5))]);
        assert_eq!(out, "!0001 OK: Samples:5");
    }

    #[test]
    fn format_error_matches_protocol_examples() {
        assert_eq!(
            format_error("0003", 2, "Already connected to a TCP client."),
            "!0003 Error:2 Already connected to a TCP client."
        );
    }
}
