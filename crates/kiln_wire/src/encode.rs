//! Frame encoding.
//!
//! Frame layout, both directions:
//!
//! ```text
//! MAGIC  opcode ":"  [run-mode ":"]  charset ":"  field*
//! ```
//!
//! The magic marker begins and ends with `:`; opcode, run-mode, and charset
//! are small fixed enumerations emitted as raw ASCII terminated by `:`. Only
//! event frames carry the run-mode token. Each payload field is a 4-byte
//! big-endian signed length followed by that many bytes of UTF-8; length
//! [`NULL_FIELD`](crate::NULL_FIELD) marks an absent field. The opcode fixes
//! the field count, so frames need no terminator.

use crate::command::Command;
use crate::event::{Event, EventData, ReportEntry, StackTrace};
use crate::{CHARSET, MAGIC_COMMAND, MAGIC_EVENT, NULL_FIELD};

/// Encode one event into a self-delimiting frame.
pub fn encode_event(event: &Event) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(MAGIC_EVENT);
    put_token(&mut out, event.opcode());
    put_token(&mut out, event.run_mode.token());
    put_token(&mut out, CHARSET);

    match &event.data {
        EventData::SuiteStarting(re)
        | EventData::SuiteCompleted(re)
        | EventData::TestStarting(re)
        | EventData::TestSucceeded(re)
        | EventData::TestFailed(re)
        | EventData::TestError(re)
        | EventData::TestSkipped(re)
        | EventData::AssumptionFailure(re) => put_report_entry(&mut out, re),
        EventData::Console { text, .. } => put_field(&mut out, Some(text)),
        EventData::StdOut { text, .. } | EventData::StdErr { text, .. } => {
            put_field(&mut out, text.as_deref());
        }
        EventData::SystemProperty { key, value } => {
            put_field(&mut out, Some(key));
            put_field(&mut out, Some(value));
        }
        EventData::ExitError { trace } => put_stack_trace(&mut out, trace.as_ref()),
        EventData::StopOnNextTest | EventData::AcquireNextTest | EventData::Bye => {}
    }
    out
}

/// Encode one command into a self-delimiting frame.
pub fn encode_command(command: &Command) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(MAGIC_COMMAND);
    put_token(&mut out, command.opcode());
    put_token(&mut out, CHARSET);

    match command {
        Command::RunClass(class) => put_field(&mut out, Some(class)),
        Command::Shutdown(mode) => put_field(&mut out, Some(mode.token())),
        Command::TestSetFinished | Command::ByeAck => {}
    }
    out
}

fn put_token(out: &mut Vec<u8>, token: &str) {
    out.extend_from_slice(token.as_bytes());
    out.push(b':');
}

fn put_field(out: &mut Vec<u8>, field: Option<&str>) {
    match field {
        Some(text) => {
            let bytes = text.as_bytes();
            out.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
            out.extend_from_slice(bytes);
        }
        None => out.extend_from_slice(&NULL_FIELD.to_be_bytes()),
    }
}

fn put_report_entry(out: &mut Vec<u8>, re: &ReportEntry) {
    put_field(out, Some(&re.source));
    put_field(out, re.display_name.as_deref());
    put_field(out, re.group.as_deref());
    // Elapsed millis travels as an ASCII decimal field so that every
    // variable field follows the one length-prefix rule.
    let elapsed = re.elapsed_ms.map(|ms| ms.to_string());
    put_field(out, elapsed.as_deref());
    put_stack_trace(out, re.stack_trace.as_ref());
}

fn put_stack_trace(out: &mut Vec<u8>, trace: Option<&StackTrace>) {
    let (message, smart, full, trimmed) = match trace {
        Some(st) => (
            st.message.as_deref(),
            st.smart_trimmed.as_deref(),
            st.full.as_deref(),
            st.trimmed.as_deref(),
        ),
        None => (None, None, None, None),
    };
    put_field(out, message);
    put_field(out, smart);
    put_field(out, full);
    put_field(out, trimmed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RunMode;

    #[test]
    fn bye_frame_is_header_only() {
        let frame = encode_event(&Event::normal(EventData::Bye));
        assert_eq!(frame, b":kiln-event:bye:normal-run:UTF-8:");
    }

    #[test]
    fn null_field_encodes_as_minus_one() {
        let frame = encode_event(&Event::normal(EventData::StdOut {
            text: None,
            newline: true,
        }));
        let header = b":kiln-event:std-out-line:normal-run:UTF-8:";
        assert_eq!(&frame[..header.len()], header);
        assert_eq!(frame[header.len()..], (-1i32).to_be_bytes());
    }

    #[test]
    fn rerun_token_rides_in_header() {
        let frame = encode_event(&Event::new(RunMode::Rerun, EventData::Bye));
        assert_eq!(frame, b":kiln-event:bye:rerun:UTF-8:");
    }

    #[test]
    fn run_class_carries_length_prefixed_name() {
        let frame = encode_command(&Command::RunClass("com.example.MapTest".to_string()));
        let header = b":kiln-command:run-class:UTF-8:";
        assert_eq!(&frame[..header.len()], header);
        assert_eq!(frame[header.len()..header.len() + 4], 19i32.to_be_bytes());
        assert_eq!(&frame[header.len() + 4..], b"com.example.MapTest");
    }
}
