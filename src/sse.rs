use std::{borrow::Cow, fmt, mem::take};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Line<'a> {
    Comment { text: &'a str },
    Field { name: &'a str, value: &'a str },
    Empty,
}

impl<'a> Line<'a> {
    /// `line` must not contain '\r' or '\n'.
    pub fn from_str(line: &'a str) -> Self {
        match line.split_once(":") {
            Some((name, value)) => {
                if !name.is_empty() {
                    Self::Field {
                        name,
                        value: value.strip_prefix(' ').unwrap_or(value),
                    }
                } else {
                    Self::Comment { text: value }
                }
            }
            None => {
                if !line.is_empty() {
                    Self::Field {
                        name: line,
                        value: "",
                    }
                } else {
                    Self::Empty
                }
            }
        }
    }

    /// Payload of a `data` field, `None` for any other kind of line.
    pub fn data(&self) -> Option<&'a str> {
        match *self {
            Self::Field {
                name: "data",
                value,
            } => Some(value),
            _ => None,
        }
    }
}

/// `data`-only event, a multi-line payload is written as several `data` fields.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Event<'a> {
    pub data: Cow<'a, str>,
}

impl<'a> Event<'a> {
    pub fn data(data: impl Into<Cow<'a, str>>) -> Self {
        Self { data: data.into() }
    }

    pub fn write_to(&self, out: &mut impl fmt::Write) -> Result<(), fmt::Error> {
        for value in self.data.split('\n') {
            out.write_str("data: ")?;
            out.write_str(value)?;
            out.write_char('\n')?;
        }
        out.write_char('\n')?;
        Ok(())
    }
}

impl fmt::Display for Event<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_to(f)
    }
}

/// Reassembles newline-delimited lines from arbitrarily fragmented byte chunks.
///
/// Bytes after the last newline are kept until the next chunk arrives. Splitting happens on
/// raw bytes, so a multibyte character cut between chunks is rejoined before decoding.
#[derive(Default, Debug)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    /// Appends `bytes` and returns every line completed by them, in order.
    ///
    /// A trailing '\r' is stripped from each line. Lines that are not valid UTF-8 are logged
    /// and skipped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(i) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + i;
            lines.extend(decode(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Flushes the incomplete tail at end of stream.
    ///
    /// Returns nothing when the tail is empty or whitespace only.
    pub fn finish(&mut self) -> Option<String> {
        let rest = take(&mut self.pending);
        if rest.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        decode(&rest)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn decode(line: &[u8]) -> Option<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    match std::str::from_utf8(line) {
        Ok(line) => Some(line.to_owned()),
        Err(e) => {
            log::warn!(
                "Skipping line with invalid UTF-8 ({e}): {}",
                String::from_utf8_lossy(line)
            );
            None
        }
    }
}

#[test]
fn classify_lines() {
    assert_eq!(Line::from_str("data: {\"a\":1}").data(), Some("{\"a\":1}"));
    assert_eq!(Line::from_str("data:[DONE]").data(), Some("[DONE]"));
    assert_eq!(Line::from_str(": keep-alive").data(), None);
    assert_eq!(Line::from_str("event: ping").data(), None);
    assert_eq!(Line::from_str(""), Line::Empty);
}

#[test]
fn write_data_event() {
    assert_eq!(Event::data("{\"a\":1}").to_string(), "data: {\"a\":1}\n\n");
    assert_eq!(Event::data("[DONE]").to_string(), "data: [DONE]\n\n");
}

#[test]
fn multiline_data_event() {
    assert_eq!(
        Event::data("YHOO\n+2").to_string(),
        "data: YHOO\ndata: +2\n\n"
    );
}

#[test]
fn split_record() {
    let input = b"data: {\"a\":1}\ndata: {\"a\":2}\n";

    let mut whole = LineDecoder::default();
    let expected = whole.push(input);
    assert_eq!(expected, ["data: {\"a\":1}", "data: {\"a\":2}"]);

    for offset in 0..=input.len() {
        let mut decoder = LineDecoder::default();
        let mut lines = decoder.push(&input[..offset]);
        lines.extend(decoder.push(&input[offset..]));
        assert_eq!(lines, expected, "split at byte {offset}");
        assert!(decoder.is_empty());
        assert_eq!(decoder.finish(), None);
    }
}

#[test]
fn many_lines_in_one_chunk() {
    let mut decoder = LineDecoder::default();
    assert_eq!(
        decoder.push(b"data: 1\n\ndata: 2\r\n\r\ndata: 3"),
        ["data: 1", "", "data: 2", ""]
    );
    assert_eq!(decoder.push(b"\n"), ["data: 3"]);
}

#[test]
fn split_char() {
    let chunks = [&b"data: \xd0\x90\xd0"[..], &b"\x91\xd0\x92\n\n"[..]];

    let mut decoder = LineDecoder::default();
    assert!(decoder.push(chunks[0]).is_empty());
    assert_eq!(decoder.push(chunks[1]), ["data: АБВ", ""]);
}

#[test]
fn flush_tail() {
    let mut decoder = LineDecoder::default();
    assert_eq!(decoder.push(b"data: 1\ndata: [DO"), ["data: 1"]);
    assert_eq!(decoder.push(b"NE]"), Vec::<String>::new());
    assert_eq!(decoder.finish().as_deref(), Some("data: [DONE]"));
    assert_eq!(decoder.finish(), None);

    let mut decoder = LineDecoder::default();
    decoder.push(b"data: 1\n \r\t");
    assert_eq!(decoder.finish(), None);
}

#[test]
fn invalid_utf8_line() {
    let mut decoder = LineDecoder::default();
    assert_eq!(decoder.push(b"data: \xff\ndata: ok\n"), ["data: ok"]);
}
