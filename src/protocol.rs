//! C2 — the Link daemon's line-oriented textual protocol: outbound
//! command encoding and inbound message decoding.
//!
//! Outbound commands are single LF-terminated ASCII lines (§4.1).
//! Inbound messages are `symbol <payload>` tokens, where `payload` is
//! either a brace-delimited map of `:key value` pairs (`status`,
//! `beat-at-time`, `phase-at-time`), a bare quoted string (`version
//! "1.1.0"`), or a bare symbol (`unsupported version`) — one TCP read
//! may coalesce several of these back to back, and a read may also
//! split one in half, so [`Decoder`] carries unconsumed bytes across
//! calls rather than assuming each read ends on a message boundary.

use std::fmt;

/// A command the engine can send to the Link daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Version,
    SetBpm(f64),
    BeatAtTime { time_us: i64, quantum: f64 },
    PhaseAtTime { time_us: i64, quantum: f64 },
    ForceBeatAtTime { beat: i64, time_us: i64, quantum: f64 },
    StartPlaying { time_us: i64 },
    StopPlaying { time_us: i64 },
    EnableStartStopSync,
    Status,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Version => write!(f, "version"),
            Command::SetBpm(bpm) => write!(f, "bpm {}", fmt_float(*bpm)),
            Command::BeatAtTime { time_us, quantum } => {
                write!(f, "beat-at-time {} {}", time_us, fmt_float(*quantum))
            }
            Command::PhaseAtTime { time_us, quantum } => {
                write!(f, "phase-at-time {} {}", time_us, fmt_float(*quantum))
            }
            Command::ForceBeatAtTime {
                beat,
                time_us,
                quantum,
            } => write!(
                f,
                "force-beat-at-time {} {} {}",
                beat,
                time_us,
                fmt_float(*quantum)
            ),
            Command::StartPlaying { time_us } => write!(f, "start-playing {}", time_us),
            Command::StopPlaying { time_us } => write!(f, "stop-playing {}", time_us),
            Command::EnableStartStopSync => write!(f, "enable-start-stop-sync"),
            Command::Status => write!(f, "status"),
        }
    }
}

/// Render `v` the way the daemon's own minimal-decimal float printer
/// does (spec §8 scenarios, e.g. `bpm 125.0`, quantum `4.0`): the
/// shortest representation that round-trips, with a guaranteed `.0`
/// rather than a bare integer.
fn fmt_float(v: f64) -> String {
    let s = format!("{v}");
    if s.contains('.') {
        s
    } else {
        format!("{s}.0")
    }
}

/// Number of beats per bar the engine always negotiates with the
/// daemon (spec §4.1: "the engine always fixes the quantum at 4.0").
pub const QUANTUM: f64 = 4.0;

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Status { bpm: f64, peers: u32 },
    BeatAtTime { beat: f64, when: i64 },
    PhaseAtTime { phase: f64, when: i64 },
    Version(String),
    Unsupported(String),
}

/// One `:key value` entry in a map payload.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

/// Streaming decoder for the daemon's inbound byte stream. Owns
/// whatever trailing partial message a previous call couldn't finish
/// parsing.
#[derive(Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed newly-read bytes in and pull out every complete message
    /// now available. Unknown top-level symbols are logged and
    /// skipped (their payload is still consumed so the stream stays
    /// in sync); malformed trailing data is held back for the next
    /// call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Event> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        loop {
            let text = match std::str::from_utf8(&self.buf) {
                Ok(t) => t,
                Err(e) if e.valid_up_to() == 0 => break,
                Err(e) => std::str::from_utf8(&self.buf[..e.valid_up_to()]).unwrap(),
            };
            match parse_one(text) {
                Some((symbol, payload, consumed)) => {
                    if let Some(event) = to_event(&symbol, payload) {
                        events.push(event);
                    } else {
                        log::warn!("link daemon: skipping unknown message symbol '{}'", symbol);
                    }
                    self.buf.drain(..consumed);
                }
                None => break,
            }
        }
        events
    }
}

enum Payload {
    Map(Vec<(String, Value)>),
    Str(String),
    Bare(String),
}

/// Parse exactly one `symbol <payload>` message off the front of
/// `text`, returning the symbol, its payload, and how many bytes of
/// the *original UTF-8 encoding* were consumed. Returns `None` if
/// `text` doesn't yet contain a complete message.
fn parse_one(text: &str) -> Option<(String, Payload, usize)> {
    let mut chars = text.char_indices().peekable();
    skip_ws(&mut chars);
    let sym_start = chars.peek()?.0;
    let mut sym_end = sym_start;
    while let Some(&(i, c)) = chars.peek() {
        if c.is_whitespace() {
            break;
        }
        sym_end = i + c.len_utf8();
        chars.next();
    }
    if sym_end == sym_start {
        return None;
    }
    let symbol = text[sym_start..sym_end].to_string();
    skip_ws(&mut chars);

    match chars.peek().copied() {
        None => None, // payload not arrived yet
        Some((i, '{')) => {
            let (map, end) = parse_map(text, i)?;
            Some((symbol, Payload::Map(map), end))
        }
        Some((i, '"')) => {
            let (s, end) = parse_string(text, i)?;
            Some((symbol, Payload::Str(s), end))
        }
        Some((i, _)) => {
            let mut end = i;
            for (j, c) in text[i..].char_indices() {
                if c.is_whitespace() {
                    break;
                }
                end = i + j + c.len_utf8();
            }
            Some((symbol, Payload::Bare(text[i..end].to_string()), end))
        }
    }
}

fn skip_ws(chars: &mut std::iter::Peekable<std::str::CharIndices>) {
    while let Some(&(_, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else {
            break;
        }
    }
}

fn parse_map(text: &str, open_brace: usize) -> Option<(Vec<(String, Value)>, usize)> {
    let close = find_matching_brace(text, open_brace)?;
    let inner = &text[open_brace + 1..close];
    let mut entries = Vec::new();
    let mut tokens = inner.split_whitespace().peekable();
    while let Some(tok) = tokens.next() {
        let key = tok.strip_prefix(':')?.to_string();
        let value_tok = tokens.next()?;
        entries.push((key, parse_value(value_tok)));
    }
    Some((entries, close + 1))
}

fn find_matching_brace(text: &str, open_brace: usize) -> Option<usize> {
    text[open_brace..]
        .find('}')
        .map(|rel| open_brace + rel)
}

fn parse_value(tok: &str) -> Value {
    if let Some(stripped) = tok.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Value::Str(stripped.to_string());
    }
    if let Ok(i) = tok.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = tok.parse::<f64>() {
        return Value::Float(f);
    }
    Value::Str(tok.to_string())
}

fn parse_string(text: &str, open_quote: usize) -> Option<(String, usize)> {
    let rest = &text[open_quote + 1..];
    let close_rel = rest.find('"')?;
    let s = rest[..close_rel].to_string();
    Some((s, open_quote + 1 + close_rel + 1))
}

fn to_event(symbol: &str, payload: Payload) -> Option<Event> {
    match (symbol, payload) {
        ("status", Payload::Map(map)) => {
            let bpm = find_f64(&map, "bpm")?;
            let peers = find_i64(&map, "peers")? as u32;
            Some(Event::Status { bpm, peers })
        }
        ("beat-at-time", Payload::Map(map)) => {
            let beat = find_f64(&map, "beat")?;
            let when = find_i64(&map, "when")?;
            Some(Event::BeatAtTime { beat, when })
        }
        ("phase-at-time", Payload::Map(map)) => {
            let phase = find_f64(&map, "phase")?;
            let when = find_i64(&map, "when")?;
            Some(Event::PhaseAtTime { phase, when })
        }
        ("version", Payload::Str(s)) => Some(Event::Version(s)),
        ("unsupported", Payload::Bare(what)) => Some(Event::Unsupported(what)),
        ("unsupported", Payload::Str(what)) => Some(Event::Unsupported(what)),
        _ => None,
    }
}

fn find_f64(map: &[(String, Value)], key: &str) -> Option<f64> {
    map.iter().find(|(k, _)| k == key).and_then(|(_, v)| match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Str(_) => None,
    })
}

fn find_i64(map: &[(String, Value)], key: &str) -> Option<i64> {
    map.iter().find(|(k, _)| k == key).and_then(|(_, v)| match v {
        Value::Int(i) => Some(*i),
        Value::Float(f) => Some(*f as i64),
        Value::Str(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_commands_as_single_lf_lines() {
        assert_eq!(Command::Version.to_string(), "version");
        assert_eq!(Command::Status.to_string(), "status");
        assert_eq!(
            Command::BeatAtTime {
                time_us: 1_000_000,
                quantum: 4.0
            }
            .to_string(),
            "beat-at-time 1000000 4.0"
        );
    }

    #[test]
    fn fmt_float_always_carries_a_decimal_point() {
        assert_eq!(Command::SetBpm(125.0).to_string(), "bpm 125.0");
        assert_eq!(Command::SetBpm(125.004).to_string(), "bpm 125.004");
        assert_eq!(
            Command::ForceBeatAtTime { beat: 10, time_us: 1_000_000, quantum: 4.0 }.to_string(),
            "force-beat-at-time 10 1000000 4.0"
        );
    }

    #[test]
    fn decodes_status_message() {
        let mut decoder = Decoder::new();
        let events = decoder.feed(b"status { :bpm 125.000000 :peers 2 }\n");
        assert_eq!(events, vec![Event::Status { bpm: 125.0, peers: 2 }]);
    }

    #[test]
    fn decodes_coalesced_messages_in_one_packet() {
        let mut decoder = Decoder::new();
        let events = decoder.feed(
            b"status { :bpm 120.0 :peers 1 }\nbeat-at-time { :beat 8.02 :when 42 }\n",
        );
        assert_eq!(
            events,
            vec![
                Event::Status { bpm: 120.0, peers: 1 },
                Event::BeatAtTime { beat: 8.02, when: 42 },
            ]
        );
    }

    #[test]
    fn tolerates_arbitrary_whitespace() {
        let mut decoder = Decoder::new();
        let events = decoder.feed(b"status   {   :bpm    120.0   :peers   1   }  \n");
        assert_eq!(events, vec![Event::Status { bpm: 120.0, peers: 1 }]);
    }

    #[test]
    fn carries_partial_message_across_feeds() {
        let mut decoder = Decoder::new();
        assert!(decoder.feed(b"status { :bpm 120.0 ").is_empty());
        let events = decoder.feed(b":peers 1 }\n");
        assert_eq!(events, vec![Event::Status { bpm: 120.0, peers: 1 }]);
    }

    #[test]
    fn decodes_bare_version_and_unsupported_payloads() {
        let mut decoder = Decoder::new();
        let events = decoder.feed(b"version \"1.1.0\"\nunsupported version\n");
        assert_eq!(
            events,
            vec![
                Event::Version("1.1.0".to_string()),
                Event::Unsupported("version".to_string()),
            ]
        );
    }

    #[test]
    fn unknown_symbol_is_skipped_without_blocking_the_stream() {
        let mut decoder = Decoder::new();
        let events = decoder.feed(b"mystery { :x 1 }\nstatus { :bpm 120.0 :peers 1 }\n");
        assert_eq!(events, vec![Event::Status { bpm: 120.0, peers: 1 }]);
    }

    #[test]
    fn round_trip_field_equality_not_byte_equality() {
        let cmd = Command::SetBpm(125.0);
        let line = cmd.to_string();
        assert_eq!(line, "bpm 125.0");
        // Re-parsing a status echo of that bpm should compare equal
        // on fields even though whitespace/formatting differs.
        let mut decoder = Decoder::new();
        let events = decoder.feed(format!("status {{ :bpm {} :peers 0 }}\n", 125.0).as_bytes());
        assert_eq!(events[0], Event::Status { bpm: 125.0, peers: 0 });
    }
}
