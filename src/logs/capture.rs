use std::fmt;

/// Which output stream of a child a chunk or line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// A complete line of child output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Bytes of one stream not yet terminated by a line break
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

fn is_line_break(b: &u8) -> bool {
    *b == b'\n' || *b == b'\r'
}

impl LineBuffer {
    /// Append a chunk and return every segment completed by it.
    ///
    /// Runs of `\n`/`\r` count as a single separator, so empty segments are
    /// never returned. Line breaks are ASCII, so a multi-byte character is
    /// never cut at a split point.
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);

        let Some(last_break) = self.pending.iter().rposition(is_line_break) else {
            return Vec::new();
        };

        let complete: Vec<u8> = self.pending.drain(..=last_break).collect();
        complete
            .split(is_line_break)
            .filter(|segment| !segment.is_empty())
            .map(<[u8]>::to_vec)
            .collect()
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

/// Line-buffered capture of a child's stdout and stderr
#[derive(Debug)]
pub struct OutputCapture {
    stdout: LineBuffer,
    stderr: LineBuffer,
    strip_escape_codes: bool,
}

impl OutputCapture {
    pub fn new(strip_escape_codes: bool) -> Self {
        Self {
            stdout: LineBuffer::default(),
            stderr: LineBuffer::default(),
            strip_escape_codes,
        }
    }

    /// Feed a raw chunk from `stream`, returning the lines it completed in order
    pub fn push(&mut self, stream: OutputStream, chunk: &[u8]) -> Vec<CapturedLine> {
        let segments = self.buffer_mut(stream).push(chunk);

        segments
            .into_iter()
            .filter_map(|segment| {
                let text = self.sanitize(&segment);
                (!text.is_empty()).then_some(CapturedLine { stream, text })
            })
            .collect()
    }

    /// Emit the trimmed remainder of both streams as final lines and clear them
    pub fn flush(&mut self) -> Vec<CapturedLine> {
        let mut lines = Vec::new();

        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let remainder = self.buffer_mut(stream).take();
            let text = self.sanitize(&remainder);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(CapturedLine {
                    stream,
                    text: trimmed.to_string(),
                });
            }
        }

        lines
    }

    /// Bytes still waiting for a line break on `stream`
    pub fn pending(&self, stream: OutputStream) -> &[u8] {
        match stream {
            OutputStream::Stdout => &self.stdout.pending,
            OutputStream::Stderr => &self.stderr.pending,
        }
    }

    fn buffer_mut(&mut self, stream: OutputStream) -> &mut LineBuffer {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }

    fn sanitize(&self, bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        if self.strip_escape_codes {
            strip_escape_codes(&text)
        } else {
            text.into_owned()
        }
    }
}

/// Remove ANSI escape sequences (CSI, OSC and two-byte ESC forms) from `input`
pub fn strip_escape_codes(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => match chars.next() {
                Some('[') => skip_csi(&mut chars),
                Some(']') => skip_osc(&mut chars),
                // Two-byte sequence (or a dangling ESC)
                _ => {}
            },
            '\u{9b}' => skip_csi(&mut chars),
            _ => output.push(c),
        }
    }

    output
}

fn skip_csi<I: Iterator<Item = char>>(chars: &mut I) {
    // Parameter and intermediate bytes run until a final byte in @..~
    for c in chars.by_ref() {
        if ('\u{40}'..='\u{7e}').contains(&c) {
            break;
        }
    }
}

fn skip_osc<I: Iterator<Item = char>>(chars: &mut std::iter::Peekable<I>) {
    while let Some(c) = chars.next() {
        match c {
            '\u{07}' => break,
            '\u{1b}' => {
                if chars.peek() == Some(&'\\') {
                    chars.next();
                }
                break;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(lines: &[CapturedLine]) -> Vec<&str> {
        lines.iter().map(|l| l.text.as_str()).collect()
    }

    #[test]
    fn test_complete_lines_are_emitted() {
        let mut capture = OutputCapture::new(false);
        let lines = capture.push(OutputStream::Stdout, b"one\ntwo\n");
        assert_eq!(texts(&lines), vec!["one", "two"]);
        assert!(capture.pending(OutputStream::Stdout).is_empty());
    }

    #[test]
    fn test_partial_line_is_held_until_terminator() {
        let mut capture = OutputCapture::new(false);

        assert!(capture.push(OutputStream::Stdout, b"hel").is_empty());
        assert!(capture.push(OutputStream::Stdout, b"lo wor").is_empty());
        assert_eq!(capture.pending(OutputStream::Stdout), b"hello wor");

        let lines = capture.push(OutputStream::Stdout, b"ld\npart");
        assert_eq!(texts(&lines), vec!["hello world"]);
        assert_eq!(capture.pending(OutputStream::Stdout), b"part");
    }

    #[test]
    fn test_runs_of_line_breaks_collapse() {
        let mut capture = OutputCapture::new(false);
        let lines = capture.push(OutputStream::Stdout, b"a\r\n\r\nb\n\n\nc\r");
        assert_eq!(texts(&lines), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_crlf_split_across_chunks() {
        let mut capture = OutputCapture::new(false);
        assert_eq!(texts(&capture.push(OutputStream::Stdout, b"first\r")), vec!["first"]);
        assert_eq!(texts(&capture.push(OutputStream::Stdout, b"\nsecond\n")), vec!["second"]);
    }

    #[test]
    fn test_streams_are_buffered_independently() {
        let mut capture = OutputCapture::new(false);

        assert!(capture.push(OutputStream::Stdout, b"out-").is_empty());
        let err = capture.push(OutputStream::Stderr, b"err\n");
        assert_eq!(err[0].stream, OutputStream::Stderr);
        assert_eq!(err[0].text, "err");

        let out = capture.push(OutputStream::Stdout, b"line\n");
        assert_eq!(out[0].stream, OutputStream::Stdout);
        assert_eq!(out[0].text, "out-line");
    }

    #[test]
    fn test_flush_emits_trimmed_remainders_once() {
        let mut capture = OutputCapture::new(false);
        capture.push(OutputStream::Stdout, b"  tail  ");
        capture.push(OutputStream::Stderr, b"oops");

        let lines = capture.flush();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].stream, OutputStream::Stdout);
        assert_eq!(lines[0].text, "tail");
        assert_eq!(lines[1].stream, OutputStream::Stderr);
        assert_eq!(lines[1].text, "oops");

        assert!(capture.flush().is_empty());
    }

    #[test]
    fn test_flush_skips_whitespace_only_remainder() {
        let mut capture = OutputCapture::new(false);
        capture.push(OutputStream::Stdout, b"done\n   ");
        assert!(capture.flush().is_empty());
    }

    #[test]
    fn test_escape_code_split_across_chunks_is_stripped() {
        let mut capture = OutputCapture::new(true);
        assert!(capture.push(OutputStream::Stdout, b"\x1b[3").is_empty());
        let lines = capture.push(OutputStream::Stdout, b"1mred\x1b[0m\n");
        assert_eq!(texts(&lines), vec!["red"]);
    }

    #[test]
    fn test_escape_codes_kept_when_disabled() {
        let mut capture = OutputCapture::new(false);
        let lines = capture.push(OutputStream::Stdout, b"\x1b[1mbold\n");
        assert_eq!(lines[0].text, "\u{1b}[1mbold");
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let mut capture = OutputCapture::new(false);
        let bytes = "caf\u{e9}\n".as_bytes();
        assert!(capture.push(OutputStream::Stdout, &bytes[..4]).is_empty());
        let lines = capture.push(OutputStream::Stdout, &bytes[4..]);
        assert_eq!(texts(&lines), vec!["caf\u{e9}"]);
    }

    #[test]
    fn test_rejoined_lines_reconstruct_input() {
        let input = b"alpha\nbeta\ngamma\ndelta";
        let mut capture = OutputCapture::new(false);

        let mut emitted = Vec::new();
        for chunk in input.chunks(3) {
            emitted.extend(capture.push(OutputStream::Stdout, chunk));
        }

        let mut rebuilt: Vec<u8> = emitted
            .iter()
            .flat_map(|l| format!("{}\n", l.text).into_bytes())
            .collect();
        rebuilt.extend_from_slice(capture.pending(OutputStream::Stdout));

        assert_eq!(rebuilt, input.to_vec());
        assert_eq!(texts(&emitted), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_strip_escape_codes_variants() {
        assert_eq!(strip_escape_codes("\x1b[31;1mred\x1b[0m"), "red");
        assert_eq!(strip_escape_codes("\x1b]0;title\x07text"), "text");
        assert_eq!(strip_escape_codes("\x1b]8;;http://x\x1b\\link"), "link");
        assert_eq!(strip_escape_codes("a\x1bMb"), "ab");
        assert_eq!(strip_escape_codes("plain"), "plain");
        assert_eq!(strip_escape_codes("dangling\x1b"), "dangling");
    }
}
