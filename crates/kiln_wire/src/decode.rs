//! Resumable frame decoding.
//!
//! [`FrameDecoder`] buffers raw bytes from a pipe and yields fully decoded
//! events/commands. A partially received frame is never consumed: the decoder
//! answers [`DecodeOutcome::NeedMoreBytes`] and retries from the same
//! position on the next feed, so read-boundary splits lose nothing and
//! duplicate nothing.
//!
//! Malformed input is non-fatal. Bytes that cannot be part of a frame
//! (unknown opcode, unsupported charset, impossible length, invalid UTF-8,
//! or plain console noise between frames) are handed back verbatim in a
//! [`MalformedFrame`] and decoding resynchronizes at the next magic marker.

use crate::command::{Command, ShutdownMode};
use crate::event::{ConsoleLevel, Event, EventData, ReportEntry, RunMode, StackTrace};
use crate::{CHARSET, MAGIC_COMMAND, MAGIC_EVENT, NULL_FIELD};

/// Longest accepted opcode/run-mode/charset token, in bytes.
const MAX_TOKEN: usize = 32;

/// Upper bound for one payload field; larger prefixes are treated as
/// corruption rather than an allocation request.
const MAX_FIELD: i32 = 16 * 1024 * 1024;

/// A fully decoded frame, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Event(Event),
    Command(Command),
}

/// Raw bytes that could not be interpreted as a frame, preserved for
/// diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedFrame {
    pub raw: Vec<u8>,
    pub reason: String,
}

/// Result of one [`FrameDecoder::next`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Item(Decoded),
    Malformed(MalformedFrame),
    NeedMoreBytes,
}

#[derive(Debug)]
enum Interrupt {
    Need,
    Bad(String),
}

/// Streaming decoder over an internal byte buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    /// Append raw bytes read from the channel.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode the next item from the buffer.
    pub fn next(&mut self) -> DecodeOutcome {
        if self.buf.is_empty() {
            return DecodeOutcome::NeedMoreBytes;
        }

        let magic = if self.buf.starts_with(MAGIC_EVENT) {
            Some(MAGIC_EVENT)
        } else if self.buf.starts_with(MAGIC_COMMAND) {
            Some(MAGIC_COMMAND)
        } else {
            None
        };

        let Some(magic) = magic else {
            return self.skip_to_frame_start();
        };

        let is_event = magic == MAGIC_EVENT;
        let (parsed, consumed) = {
            let mut parser = Parser {
                buf: &self.buf,
                pos: magic.len(),
            };
            let parsed = if is_event {
                parse_event(&mut parser).map(Decoded::Event)
            } else {
                parse_command(&mut parser).map(Decoded::Command)
            };
            (parsed, parser.pos)
        };

        match parsed {
            Ok(item) => {
                self.buf.drain(..consumed);
                DecodeOutcome::Item(item)
            }
            Err(Interrupt::Need) => DecodeOutcome::NeedMoreBytes,
            Err(Interrupt::Bad(reason)) => self.resync(reason),
        }
    }

    /// The buffer does not start with a magic marker: everything up to the
    /// next (possibly partial) marker is unframed noise.
    fn skip_to_frame_start(&mut self) -> DecodeOutcome {
        match frame_boundary(&self.buf, 0) {
            Some(0) => DecodeOutcome::NeedMoreBytes,
            Some(at) => self.take_malformed(at, "bytes outside any frame"),
            None => {
                let len = self.buf.len();
                self.take_malformed(len, "bytes outside any frame")
            }
        }
    }

    /// A frame started but its content is invalid: discard up to the next
    /// marker so decoding can resume.
    fn resync(&mut self, reason: String) -> DecodeOutcome {
        match frame_boundary(&self.buf, 1) {
            Some(at) => self.take_malformed(at, &reason),
            None => {
                let len = self.buf.len();
                self.take_malformed(len, &reason)
            }
        }
    }

    fn take_malformed(&mut self, upto: usize, reason: &str) -> DecodeOutcome {
        let raw: Vec<u8> = self.buf.drain(..upto).collect();
        tracing::warn!(bytes = raw.len(), %reason, "discarding malformed input");
        DecodeOutcome::Malformed(MalformedFrame {
            raw,
            reason: reason.to_string(),
        })
    }
}

/// Earliest index `>= from` where a frame could begin: a full magic marker,
/// or a marker prefix running off the end of the buffer (which must be kept
/// for the next feed).
fn frame_boundary(buf: &[u8], from: usize) -> Option<usize> {
    let mut best: Option<usize> = None;
    for magic in [MAGIC_EVENT, MAGIC_COMMAND] {
        for i in from..buf.len() {
            let tail = &buf[i..];
            let full = tail.len() >= magic.len() && tail.starts_with(magic);
            let partial = tail.len() < magic.len() && magic.starts_with(tail);
            if full || partial {
                best = Some(best.map_or(i, |b| b.min(i)));
                break;
            }
        }
    }
    best
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    /// Read an ASCII token terminated by `:`.
    fn token(&mut self) -> Result<&'a str, Interrupt> {
        let limit = (self.pos + MAX_TOKEN + 1).min(self.buf.len());
        for end in self.pos..limit {
            if self.buf[end] == b':' {
                let token = std::str::from_utf8(&self.buf[self.pos..end])
                    .map_err(|_| Interrupt::Bad("non-ASCII header token".to_string()))?;
                self.pos = end + 1;
                return Ok(token);
            }
        }
        if limit == self.buf.len() {
            Err(Interrupt::Need)
        } else {
            Err(Interrupt::Bad("unterminated header token".to_string()))
        }
    }

    /// Read one length-prefixed payload field.
    fn field(&mut self) -> Result<Option<String>, Interrupt> {
        if self.buf.len() < self.pos + 4 {
            return Err(Interrupt::Need);
        }
        let len = i32::from_be_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        if len == NULL_FIELD {
            return Ok(None);
        }
        if len < 0 || len > MAX_FIELD {
            return Err(Interrupt::Bad(format!("impossible field length {len}")));
        }
        let len = len as usize;
        if self.buf.len() < self.pos + len {
            return Err(Interrupt::Need);
        }
        let text = std::str::from_utf8(&self.buf[self.pos..self.pos + len])
            .map_err(|_| Interrupt::Bad("payload is not valid UTF-8".to_string()))?
            .to_string();
        self.pos += len;
        Ok(Some(text))
    }

    fn required_field(&mut self, what: &str) -> Result<String, Interrupt> {
        self.field()?
            .ok_or_else(|| Interrupt::Bad(format!("missing required field: {what}")))
    }

    fn charset(&mut self) -> Result<(), Interrupt> {
        let token = self.token()?;
        if token == CHARSET {
            Ok(())
        } else {
            Err(Interrupt::Bad(format!("unsupported charset '{token}'")))
        }
    }

    fn stack_trace(&mut self) -> Result<Option<StackTrace>, Interrupt> {
        let trace = StackTrace {
            message: self.field()?,
            smart_trimmed: self.field()?,
            full: self.field()?,
            trimmed: self.field()?,
        };
        Ok(trace.normalized())
    }

    fn report_entry(&mut self) -> Result<ReportEntry, Interrupt> {
        let source = self.required_field("source")?;
        let display_name = self.field()?;
        let group = self.field()?;
        let elapsed_ms = match self.field()? {
            Some(text) => Some(
                text.parse::<u32>()
                    .map_err(|_| Interrupt::Bad(format!("bad elapsed-millis field '{text}'")))?,
            ),
            None => None,
        };
        let stack_trace = self.stack_trace()?;
        Ok(ReportEntry {
            source,
            display_name,
            group,
            elapsed_ms,
            stack_trace,
        })
    }
}

fn parse_event(p: &mut Parser<'_>) -> Result<Event, Interrupt> {
    let opcode = p.token()?.to_string();
    let run_mode_token = p.token()?;
    let run_mode = RunMode::from_token(run_mode_token)
        .ok_or_else(|| Interrupt::Bad(format!("unknown run mode '{run_mode_token}'")))?;
    p.charset()?;

    let data = match opcode.as_str() {
        "testset-starting" => EventData::SuiteStarting(p.report_entry()?),
        "testset-completed" => EventData::SuiteCompleted(p.report_entry()?),
        "test-starting" => EventData::TestStarting(p.report_entry()?),
        "test-succeeded" => EventData::TestSucceeded(p.report_entry()?),
        "test-failed" => EventData::TestFailed(p.report_entry()?),
        "test-error" => EventData::TestError(p.report_entry()?),
        "test-skipped" => EventData::TestSkipped(p.report_entry()?),
        "test-assumption-failure" => EventData::AssumptionFailure(p.report_entry()?),
        "console-debug" => console(p, ConsoleLevel::Debug)?,
        "console-info" => console(p, ConsoleLevel::Info)?,
        "console-warning" => console(p, ConsoleLevel::Warning)?,
        "console-error" => console(p, ConsoleLevel::Error)?,
        "std-out" => EventData::StdOut {
            text: p.field()?,
            newline: false,
        },
        "std-out-line" => EventData::StdOut {
            text: p.field()?,
            newline: true,
        },
        "std-err" => EventData::StdErr {
            text: p.field()?,
            newline: false,
        },
        "std-err-line" => EventData::StdErr {
            text: p.field()?,
            newline: true,
        },
        "sys-prop" => EventData::SystemProperty {
            key: p.required_field("key")?,
            value: p.required_field("value")?,
        },
        "exit-error" => EventData::ExitError {
            trace: p.stack_trace()?,
        },
        "stop-on-next-test" => EventData::StopOnNextTest,
        "next-test" => EventData::AcquireNextTest,
        "bye" => EventData::Bye,
        other => return Err(Interrupt::Bad(format!("unknown event opcode '{other}'"))),
    };
    Ok(Event { run_mode, data })
}

fn console(p: &mut Parser<'_>, level: ConsoleLevel) -> Result<EventData, Interrupt> {
    Ok(EventData::Console {
        level,
        text: p.required_field("console text")?,
    })
}

fn parse_command(p: &mut Parser<'_>) -> Result<Command, Interrupt> {
    let opcode = p.token()?.to_string();
    p.charset()?;

    match opcode.as_str() {
        "run-class" => Ok(Command::RunClass(p.required_field("class name")?)),
        "testset-finished" => Ok(Command::TestSetFinished),
        "shutdown" => {
            let mode = p.required_field("shutdown mode")?;
            ShutdownMode::from_token(&mode)
                .map(Command::Shutdown)
                .ok_or_else(|| Interrupt::Bad(format!("unknown shutdown mode '{mode}'")))
        }
        "bye-ack" => Ok(Command::ByeAck),
        other => Err(Interrupt::Bad(format!("unknown command opcode '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{encode_command, encode_event};

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<DecodeOutcome> {
        let mut out = Vec::new();
        loop {
            match decoder.next() {
                DecodeOutcome::NeedMoreBytes => break,
                other => out.push(other),
            }
        }
        out
    }

    #[test]
    fn byte_at_a_time_feed_yields_one_event() {
        let event = Event::normal(EventData::SystemProperty {
            key: "user.dir".to_string(),
            value: "/tmp".to_string(),
        });
        let frame = encode_event(&event);

        let mut decoder = FrameDecoder::new();
        let mut seen = Vec::new();
        for byte in &frame {
            decoder.feed(std::slice::from_ref(byte));
            seen.extend(decode_all(&mut decoder));
        }
        assert_eq!(seen, vec![DecodeOutcome::Item(Decoded::Event(event))]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn two_frames_in_one_feed() {
        let first = Event::normal(EventData::Bye);
        let second = Command::TestSetFinished;
        let mut bytes = encode_event(&first);
        bytes.extend_from_slice(&encode_command(&second));

        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        assert_eq!(
            decode_all(&mut decoder),
            vec![
                DecodeOutcome::Item(Decoded::Event(first)),
                DecodeOutcome::Item(Decoded::Command(second)),
            ]
        );
    }

    #[test]
    fn garbage_before_frame_is_surfaced_then_skipped() {
        let event = Event::normal(EventData::Bye);
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"println noise\n");
        decoder.feed(&encode_event(&event));

        match decoder.next() {
            DecodeOutcome::Malformed(m) => assert_eq!(m.raw, b"println noise\n"),
            other => panic!("expected malformed, got {other:?}"),
        }
        assert_eq!(
            decoder.next(),
            DecodeOutcome::Item(Decoded::Event(event))
        );
    }

    #[test]
    fn unknown_opcode_resyncs_at_next_marker() {
        let good = Event::normal(EventData::Bye);
        let mut decoder = FrameDecoder::new();
        decoder.feed(b":kiln-event:frobnicate:normal-run:UTF-8:");
        decoder.feed(&encode_event(&good));

        match decoder.next() {
            DecodeOutcome::Malformed(m) => {
                assert!(m.reason.contains("frobnicate"), "reason: {}", m.reason)
            }
            other => panic!("expected malformed, got {other:?}"),
        }
        assert_eq!(decoder.next(), DecodeOutcome::Item(Decoded::Event(good)));
    }

    #[test]
    fn unsupported_charset_is_malformed() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b":kiln-event:bye:normal-run:EBCDIC:");
        match decoder.next() {
            DecodeOutcome::Malformed(m) => assert!(m.reason.contains("EBCDIC")),
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn partial_magic_at_buffer_tail_is_kept() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"noise:kiln-ev");
        match decoder.next() {
            DecodeOutcome::Malformed(m) => assert_eq!(m.raw, b"noise"),
            other => panic!("expected malformed, got {other:?}"),
        }
        // The marker prefix stays buffered until the rest arrives.
        assert_eq!(decoder.next(), DecodeOutcome::NeedMoreBytes);
        decoder.feed(b"ent:bye:normal-run:UTF-8:");
        assert_eq!(
            decoder.next(),
            DecodeOutcome::Item(Decoded::Event(Event::normal(EventData::Bye)))
        );
    }

    #[test]
    fn shutdown_modes_round_trip() {
        for mode in [ShutdownMode::Default, ShutdownMode::Exit, ShutdownMode::Kill] {
            let cmd = Command::Shutdown(mode);
            let mut decoder = FrameDecoder::new();
            decoder.feed(&encode_command(&cmd));
            assert_eq!(decoder.next(), DecodeOutcome::Item(Decoded::Command(cmd)));
        }
    }

    #[test]
    fn negative_length_other_than_null_is_malformed() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b":kiln-command:run-class:UTF-8:");
        decoder.feed(&(-7i32).to_be_bytes());
        match decoder.next() {
            DecodeOutcome::Malformed(m) => assert!(m.reason.contains("-7")),
            other => panic!("expected malformed, got {other:?}"),
        }
    }
}
