//! Bind-channel wire format.
//!
//! Outbound: command batches as indexed form fields.
//! Inbound: length-prefixed JSON chunks, each an array of `[array_id, [name, args...]]`.

use rand::Rng;
use serde_json::Value;

use crate::sequence::SequenceState;

pub type Result<T> = std::result::Result<T, DecodeError>;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Length line is not a decimal number.
    BadLength(String),
    /// Body ended in the middle of a chunk.
    Truncated { expected: usize, buffered: usize },
    /// Chunk content is not valid JSON / UTF-8.
    Json(String),
    /// JSON structure doesn't match the `[id, [name, ...]]` layout.
    Schema(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::BadLength(line) => write!(f, "bad chunk length prefix {line:?}"),
            DecodeError::Truncated { expected, buffered } => write!(
                f,
                "truncated chunk: expected {expected} units, stream ended with {buffered} bytes buffered"
            ),
            DecodeError::Json(msg) => write!(f, "chunk json: {msg}"),
            DecodeError::Schema(msg) => write!(f, "chunk schema: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A playback command sent to the screen.
///
/// `params` is ordered because the form body preserves insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub params: Vec<(String, String)>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.params.push((key.into(), val.into()));
        self
    }
}

/// One decoded inbound entry: `[array_id, [name, args...]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEvent {
    pub array_id: i64,
    pub name: String,
    pub args: Vec<Value>,
}

impl WireEvent {
    /// First argument, which carries the payload for every known event.
    pub fn payload(&self) -> &Value {
        self.args.first().unwrap_or(&Value::Null)
    }

    /// First argument as a string (`c`/`S` entries carry bare strings).
    pub fn payload_str(&self) -> Option<&str> {
        self.payload().as_str()
    }
}

// ---------------------------------------------------------------------------
// Outbound encoding
// ---------------------------------------------------------------------------

/// Build the form fields for a command batch.
///
/// ```text
/// count=N&ofs=O&req0__sc=name&req0_key=val&req1__sc=name2&...
/// ```
///
/// Array index is submission order. `seq` is only read; the caller commits the
/// `ofs` advance once the server acknowledged the batch.
pub fn encode_commands(commands: &[Command], seq: &SequenceState) -> Vec<(String, String)> {
    let mut fields = Vec::with_capacity(2 + commands.len() * 2);
    fields.push(("count".to_owned(), commands.len().to_string()));
    fields.push(("ofs".to_owned(), seq.ofs.to_string()));

    for (i, cmd) in commands.iter().enumerate() {
        fields.push((format!("req{i}__sc"), cmd.name.clone()));
        for (key, val) in &cmd.params {
            fields.push((format!("req{i}_{key}"), val.clone()));
        }
    }
    fields
}

// ---------------------------------------------------------------------------
// Inbound decoding
// ---------------------------------------------------------------------------

/// Decode a complete response body.
///
/// ```text
/// <decimal_length>\n
/// <JSON array spanning that many units>
/// ...
/// ```
///
/// A body that ends inside a chunk is a `Truncated` error.
pub fn decode_chunk_stream(data: &[u8]) -> Result<Vec<WireEvent>> {
    let mut decoder = ChunkDecoder::new();
    let mut events = decoder.feed(data)?;
    events.append(&mut decoder.finish()?);
    Ok(events)
}

/// Parse a single JSON chunk (one array of entries).
pub fn decode_entries(chunk: &str) -> Result<Vec<WireEvent>> {
    let value: Value =
        serde_json::from_str(chunk).map_err(|e| DecodeError::Json(e.to_string()))?;

    let outer = value
        .as_array()
        .ok_or_else(|| DecodeError::Schema("top-level JSON is not an array".into()))?;

    let mut events = Vec::with_capacity(outer.len());
    for entry in outer {
        let tuple = entry
            .as_array()
            .filter(|t| t.len() >= 2)
            .ok_or_else(|| DecodeError::Schema(format!("entry is not [id, payload]: {entry}")))?;

        let array_id = tuple[0]
            .as_i64()
            .ok_or_else(|| DecodeError::Schema(format!("array id is not a number: {}", tuple[0])))?;

        let inner = tuple[1]
            .as_array()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| DecodeError::Schema(format!("payload is not a non-empty array: {}", tuple[1])))?;

        let name = inner[0]
            .as_str()
            .ok_or_else(|| DecodeError::Schema(format!("event name is not a string: {}", inner[0])))?
            .to_owned();

        events.push(WireEvent {
            array_id,
            name,
            args: inner[1..].to_vec(),
        });
    }
    Ok(events)
}

/// Incremental decoder for streamed bodies.
///
/// Network reads can split a chunk (or its length line) at any byte. The
/// decoder buffers partial data and yields entries once a whole chunk is
/// present. Length prefixes count UTF-16 code units of the chunk text, the
/// way the server measures it.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    buf: Vec<u8>,
    /// Length of the chunk whose prefix has been consumed but whose body is incomplete.
    pending: Option<usize>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            pending: None,
        }
    }

    /// Feed raw bytes and return every entry completed by them, in order.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<WireEvent>> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            let chunk_len = match self.pending {
                Some(n) => n,
                None => {
                    let start = self
                        .buf
                        .iter()
                        .position(|b| !matches!(b, b'\n' | b'\r' | b' '));
                    match start {
                        Some(s) => {
                            self.buf.drain(..s);
                        }
                        None => {
                            self.buf.clear();
                            break;
                        }
                    }

                    let Some(newline) = self.buf.iter().position(|&b| b == b'\n') else {
                        if self.buf.iter().any(|b| !b.is_ascii_digit() && *b != b'\r') {
                            return Err(DecodeError::BadLength(
                                String::from_utf8_lossy(&self.buf).into_owned(),
                            ));
                        }
                        break;
                    };

                    let line = String::from_utf8_lossy(&self.buf[..newline]).into_owned();
                    let n: usize = line
                        .trim()
                        .parse()
                        .map_err(|_| DecodeError::BadLength(line.clone()))?;
                    self.buf.drain(..=newline);
                    self.pending = Some(n);
                    n
                }
            };

            let Some(end) = utf16_prefix_end(&self.buf, chunk_len)? else {
                break;
            };

            let chunk = std::str::from_utf8(&self.buf[..end])
                .map_err(|e| DecodeError::Json(format!("invalid UTF-8 in chunk: {e}")))?;
            events.append(&mut decode_entries(chunk)?);

            self.buf.drain(..end);
            self.pending = None;
        }

        Ok(events)
    }

    /// Signal the end of the body. Anything still buffered is a truncated chunk.
    pub fn finish(&mut self) -> Result<Vec<WireEvent>> {
        let trailing = self.buf.iter().all(|b| matches!(b, b'\n' | b'\r' | b' '));
        if self.pending.is_none() && trailing {
            self.buf.clear();
            return Ok(Vec::new());
        }
        let err = DecodeError::Truncated {
            expected: self.pending.unwrap_or(0),
            buffered: self.buf.len(),
        };
        self.buf.clear();
        self.pending = None;
        Err(err)
    }
}

/// Byte offset at which `units` UTF-16 code units of text end, or `None`
/// if the buffer does not hold that many yet.
fn utf16_prefix_end(buf: &[u8], units: usize) -> Result<Option<usize>> {
    if units == 0 {
        return Ok(Some(0));
    }
    let valid = match std::str::from_utf8(buf) {
        Ok(s) => s,
        Err(e) if e.error_len().is_none() => {
            // Incomplete multi-byte sequence at the end: more data will follow.
            std::str::from_utf8(&buf[..e.valid_up_to()]).unwrap_or_default()
        }
        Err(e) => return Err(DecodeError::Json(format!("invalid UTF-8 in chunk: {e}"))),
    };

    let mut counted = 0;
    for (idx, ch) in valid.char_indices() {
        counted += ch.len_utf16();
        if counted == units {
            return Ok(Some(idx + ch.len_utf8()));
        }
        if counted > units {
            return Err(DecodeError::BadLength(format!(
                "length {units} ends inside a surrogate pair"
            )));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Random 12-character lowercase string for the `zx` cache-buster parameter.
pub fn zx() -> String {
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| (b'a' + rng.gen_range(0..26)) as char)
        .collect()
}

/// Format a time value the way the screen reports it: `"191"`, `"42.5"`.
pub fn fmt_time(val: f64) -> String {
    if val.fract() == 0.0 {
        format!("{}", val as i64)
    } else {
        format!("{}", val)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(json: &str) -> String {
        format!("{}\n{}", json.encode_utf16().count(), json)
    }

    #[test]
    fn decode_session_chunk() {
        let wire = frame(r#"[[0,["c","SID_VALUE","",8]],[1,["S","GSID_VALUE"]]]"#);

        let events = decode_chunk_stream(wire.as_bytes()).expect("decode");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].array_id, 0);
        assert_eq!(events[0].name, "c");
        assert_eq!(events[0].payload_str(), Some("SID_VALUE"));
        assert_eq!(events[1].name, "S");
        assert_eq!(events[1].payload_str(), Some("GSID_VALUE"));
    }

    #[test]
    fn decode_object_payload() {
        let wire = frame(r#"[[4,["onStateChange",{"currentTime":"5","state":"1"}]]]"#);
        let events = decode_chunk_stream(wire.as_bytes()).unwrap();
        assert_eq!(events[0].payload()["currentTime"], "5");
    }

    #[test]
    fn decode_payloadless_entry() {
        let wire = frame(r#"[[7,["noop"]]]"#);
        let events = decode_chunk_stream(wire.as_bytes()).unwrap();
        assert_eq!(events[0].name, "noop");
        assert!(events[0].payload().is_null());
    }

    #[test]
    fn decode_multiple_chunks() {
        let wire = format!(
            "{}\n{}",
            frame(r#"[[0,["noop"]]]"#),
            frame(r#"[[1,["c","ABC"]]]"#)
        );
        let events = decode_chunk_stream(wire.as_bytes()).unwrap();
        let ids: Vec<i64> = events.iter().map(|e| e.array_id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn length_counts_utf16_units() {
        let wire = frame(r#"[[3,["loungeStatus",{"name":"Télé 📺"}]]]"#);
        let events = decode_chunk_stream(wire.as_bytes()).unwrap();
        assert_eq!(events[0].payload()["name"], "Télé 📺");
    }

    #[test]
    fn split_anywhere_matches_unsplit() {
        let wire = format!(
            "{}{}",
            frame("[[1,[\"onStateChange\",{\"currentTime\":\"5\"}]],\n[2,[\"noop\"]]]\n"),
            frame(r#"[[3,["nowPlaying",{"videoId":"é"}]]]"#)
        );
        let bytes = wire.as_bytes();
        let whole = decode_chunk_stream(bytes).unwrap();
        assert_eq!(whole.len(), 3);

        for cut in 0..=bytes.len() {
            let mut decoder = ChunkDecoder::new();
            let mut events = decoder.feed(&bytes[..cut]).unwrap();
            events.append(&mut decoder.feed(&bytes[cut..]).unwrap());
            events.append(&mut decoder.finish().unwrap());
            assert_eq!(events, whole, "split at byte {cut}");
        }
    }

    #[test]
    fn bad_length_prefix_is_an_error() {
        let err = decode_chunk_stream(b"xyz\n[]").unwrap_err();
        assert!(matches!(err, DecodeError::BadLength(_)));
    }

    #[test]
    fn truncated_chunk_is_an_error() {
        let err = decode_chunk_stream(b"40\n[[1,[\"noop\"]]").unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { expected: 40, .. }));
    }

    #[test]
    fn malformed_entry_is_a_schema_error() {
        let err = decode_chunk_stream(frame(r#"[["x",["noop"]]]"#).as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::Schema(_)));
    }

    #[test]
    fn partial_chunk_waits_for_more_data() {
        let wire = frame(r#"[[9,["noop"]]]"#);
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed(&wire.as_bytes()[..5]).unwrap().is_empty());
        assert!(matches!(decoder.finish(), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn encode_empty_batch() {
        let fields = encode_commands(&[], &SequenceState::default());
        assert_eq!(
            fields,
            vec![("count".into(), "0".into()), ("ofs".into(), "0".into())]
        );
    }

    #[test]
    fn encode_batch_preserves_order() {
        let seq = SequenceState {
            rid: 10,
            aid: 4,
            ofs: 3,
        };
        let cmds = vec![
            Command::new("seekTo").with_param("newTime", "42.5"),
            Command::new("play"),
        ];
        let fields = encode_commands(&cmds, &seq);
        let keys: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["count", "ofs", "req0__sc", "req0_newTime", "req1__sc"]);
        assert_eq!(fields[0].1, "2");
        assert_eq!(fields[1].1, "3");
        assert_eq!(fields[4].1, "play");
    }

    #[test]
    fn zx_length_and_chars() {
        let val = zx();
        assert_eq!(val.len(), 12);
        assert!(val.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn fmt_time_drops_trailing_zeroes() {
        assert_eq!(fmt_time(191.0), "191");
        assert_eq!(fmt_time(42.5), "42.5");
    }
}
