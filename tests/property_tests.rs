//! Property-based tests for the kiln engine
//!
//! These tests use proptest to verify invariants across many randomly
//! generated inputs, catching edge cases that hand-written tests might miss.

use proptest::prelude::*;

use kiln_wire::{
    encode_command, encode_event, Command, ConsoleLevel, DecodeOutcome, Decoded, Event, EventData,
    FrameDecoder, ReportEntry, RunMode, ShutdownMode, StackTrace,
};

// =============================================================================
// Generators
// =============================================================================

fn run_mode() -> impl Strategy<Value = RunMode> {
    prop_oneof![Just(RunMode::Normal), Just(RunMode::Rerun)]
}

fn console_level() -> impl Strategy<Value = ConsoleLevel> {
    prop_oneof![
        Just(ConsoleLevel::Debug),
        Just(ConsoleLevel::Info),
        Just(ConsoleLevel::Warning),
        Just(ConsoleLevel::Error),
    ]
}

/// Text including colons, newlines, and non-ASCII, since payload fields are
/// length-prefixed and must never confuse the tokenizer.
fn payload_text() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9:×Ω \\n-]{0,40}"
}

fn stack_trace() -> impl Strategy<Value = Option<StackTrace>> {
    (
        proptest::option::of(payload_text()),
        proptest::option::of(payload_text()),
        proptest::option::of(payload_text()),
        proptest::option::of(payload_text()),
    )
        .prop_map(|(message, smart_trimmed, full, trimmed)| {
            StackTrace {
                message,
                smart_trimmed,
                full,
                trimmed,
            }
            .normalized()
        })
}

fn report_entry() -> impl Strategy<Value = ReportEntry> {
    (
        "[a-zA-Z][a-zA-Z0-9_.]{0,24}",
        proptest::option::of(payload_text()),
        proptest::option::of(payload_text()),
        proptest::option::of(0u32..900_000),
        stack_trace(),
    )
        .prop_map(|(source, display_name, group, elapsed_ms, trace)| ReportEntry {
            source,
            display_name,
            group,
            elapsed_ms,
            stack_trace: trace,
        })
}

fn report_event() -> impl Strategy<Value = EventData> {
    (0u8..8, report_entry()).prop_map(|(kind, re)| match kind {
        0 => EventData::SuiteStarting(re),
        1 => EventData::SuiteCompleted(re),
        2 => EventData::TestStarting(re),
        3 => EventData::TestSucceeded(re),
        4 => EventData::TestFailed(re),
        5 => EventData::TestError(re),
        6 => EventData::TestSkipped(re),
        _ => EventData::AssumptionFailure(re),
    })
}

fn message_event() -> impl Strategy<Value = EventData> {
    prop_oneof![
        (console_level(), payload_text())
            .prop_map(|(level, text)| EventData::Console { level, text }),
        (proptest::option::of(payload_text()), any::<bool>())
            .prop_map(|(text, newline)| EventData::StdOut { text, newline }),
        (proptest::option::of(payload_text()), any::<bool>())
            .prop_map(|(text, newline)| EventData::StdErr { text, newline }),
        ("[a-z][a-z.]{0,16}", payload_text())
            .prop_map(|(key, value)| EventData::SystemProperty { key, value }),
    ]
}

fn control_event() -> impl Strategy<Value = EventData> {
    prop_oneof![
        Just(EventData::StopOnNextTest),
        Just(EventData::AcquireNextTest),
        stack_trace().prop_map(|trace| EventData::ExitError { trace }),
        Just(EventData::Bye),
    ]
}

fn event_data() -> impl Strategy<Value = EventData> {
    prop_oneof![report_event(), message_event(), control_event()]
}

fn event() -> impl Strategy<Value = Event> {
    (run_mode(), event_data()).prop_map(|(run_mode, data)| Event { run_mode, data })
}

fn command() -> impl Strategy<Value = Command> {
    prop_oneof![
        payload_text().prop_map(Command::RunClass),
        Just(Command::TestSetFinished),
        prop_oneof![
            Just(ShutdownMode::Default),
            Just(ShutdownMode::Exit),
            Just(ShutdownMode::Kill)
        ]
        .prop_map(Command::Shutdown),
        Just(Command::ByeAck),
    ]
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    /// Property: decode(encode(e)) == e for every event variant, including
    /// null/absent optional fields.
    #[test]
    fn event_roundtrip(original in event()) {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encode_event(&original));
        prop_assert_eq!(
            decoder.next(),
            DecodeOutcome::Item(Decoded::Event(original))
        );
        prop_assert_eq!(decoder.next(), DecodeOutcome::NeedMoreBytes);
        prop_assert_eq!(decoder.buffered(), 0);
    }

    /// Property: decode(encode(c)) == c for every command variant.
    #[test]
    fn command_roundtrip(original in command()) {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encode_command(&original));
        prop_assert_eq!(
            decoder.next(),
            DecodeOutcome::Item(Decoded::Command(original))
        );
        prop_assert_eq!(decoder.buffered(), 0);
    }

    /// Property: arbitrary read-boundary splits lose nothing and duplicate
    /// nothing.
    #[test]
    fn chunked_feeding_is_lossless(
        events in proptest::collection::vec(event(), 1..8),
        chunk in 1usize..23,
    ) {
        let mut bytes = Vec::new();
        for event in &events {
            bytes.extend_from_slice(&encode_event(event));
        }

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for piece in bytes.chunks(chunk) {
            decoder.feed(piece);
            loop {
                match decoder.next() {
                    DecodeOutcome::Item(Decoded::Event(e)) => decoded.push(e),
                    DecodeOutcome::Item(Decoded::Command(c)) => {
                        prop_assert!(false, "unexpected command {c:?}");
                    }
                    DecodeOutcome::Malformed(m) => {
                        prop_assert!(false, "unexpected malformed: {}", m.reason);
                    }
                    DecodeOutcome::NeedMoreBytes => break,
                }
            }
        }
        prop_assert_eq!(decoded, events);
    }

    /// Property: garbage injected between frames is surfaced as malformed
    /// and every frame still decodes.
    #[test]
    fn garbage_between_frames_never_hides_events(
        events in proptest::collection::vec(event(), 1..5),
        noise in "[a-zA-Z0-9 \\n]{1,30}",
    ) {
        let mut bytes = Vec::new();
        for event in &events {
            bytes.extend_from_slice(noise.as_bytes());
            bytes.extend_from_slice(&encode_event(event));
        }

        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let mut decoded = Vec::new();
        let mut malformed = 0;
        loop {
            match decoder.next() {
                DecodeOutcome::Item(Decoded::Event(e)) => decoded.push(e),
                DecodeOutcome::Item(Decoded::Command(_)) => {}
                DecodeOutcome::Malformed(_) => malformed += 1,
                DecodeOutcome::NeedMoreBytes => break,
            }
        }
        prop_assert_eq!(decoded, events.clone());
        prop_assert_eq!(malformed, events.len());
    }
}

// =============================================================================
// Balancer Properties
// =============================================================================

mod balancer_properties {
    use super::*;
    use kiln::exec::{Balancer, Scheduler, SchedulingStrategy};
    use kiln::exec::pool::ThreadPool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        /// Property: with n permits, at most n instrumented tasks scheduled
        /// through a Scheduler are running at any instant.
        #[test]
        fn scheduler_never_exceeds_permit_ceiling(
            permits in 1usize..5,
            tasks in 1usize..24,
        ) {
            let node = Scheduler::new(
                Some("bounded"),
                SchedulingStrategy::private_pool(ThreadPool::fixed("prop", 8)),
                Balancer::new(permits),
            );
            let running = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            for _ in 0..tasks {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                node.schedule(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(2));
                    running.fetch_sub(1, Ordering::SeqCst);
                });
            }
            node.finished();
            node.shutdown_pools();
            prop_assert!(peak.load(Ordering::SeqCst) <= permits);
        }
    }
}
