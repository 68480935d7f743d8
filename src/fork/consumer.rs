//! Per-channel event consumer threads.
//!
//! Each worker output channel (stdout, stderr) gets one dedicated blocking
//! reader that feeds the resumable frame decoder and hands every decoded
//! event to the shared handler, preserving the channel's emission order.
//! The thread ends on channel EOF or on an explicit `bye`, dropping its
//! WaitGroup token so the launcher knows all output has been drained.

use std::io::Read;
use std::thread::{self, JoinHandle};

use crossbeam_utils::sync::WaitGroup;

use kiln_wire::{DecodeOutcome, Decoded, Event, EventData, FrameDecoder, MalformedFrame};

use std::sync::Arc;

/// Receives everything a consumer thread decodes.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);

    /// Bytes that were not a valid frame; dumped once per distinct failure.
    fn on_malformed(&self, frame: MalformedFrame);
}

/// Spawn the consumer thread for one channel. Returns the join handle; the
/// thread's result is the number of bytes it consumed, kept for the worker
/// handle's diagnostics.
pub fn spawn_consumer(
    channel_name: &str,
    mut reader: impl Read + Send + 'static,
    handler: Arc<dyn EventHandler>,
    drained: WaitGroup,
) -> std::io::Result<JoinHandle<u64>> {
    let builder = thread::Builder::new().name(format!("kiln-consume-{channel_name}"));
    builder.spawn(move || {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 8192];
        let mut consumed: u64 = 0;
        'reading: loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break 'reading,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "worker channel read failed");
                    break 'reading;
                }
            };
            consumed += n as u64;
            decoder.feed(&buf[..n]);
            loop {
                match decoder.next() {
                    DecodeOutcome::Item(Decoded::Event(event)) => {
                        let is_bye = matches!(event.data, EventData::Bye);
                        handler.on_event(event);
                        if is_bye {
                            break 'reading;
                        }
                    }
                    DecodeOutcome::Item(Decoded::Command(command)) => {
                        // Commands belong on the other direction entirely.
                        handler.on_malformed(MalformedFrame {
                            raw: kiln_wire::encode_command(&command),
                            reason: format!(
                                "command '{}' on an event channel",
                                command.opcode()
                            ),
                        });
                    }
                    DecodeOutcome::Malformed(frame) => handler.on_malformed(frame),
                    DecodeOutcome::NeedMoreBytes => break,
                }
            }
        }
        drop(drained);
        consumed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_wire::{encode_event, ReportEntry, RunMode};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<Event>>,
        malformed: Mutex<Vec<MalformedFrame>>,
    }

    impl EventHandler for Recording {
        fn on_event(&self, event: Event) {
            self.events.lock().push(event);
        }

        fn on_malformed(&self, frame: MalformedFrame) {
            self.malformed.lock().push(frame);
        }
    }

    #[test]
    fn consumer_preserves_emission_order_and_stops_on_bye() {
        let mut bytes = Vec::new();
        for i in 0..5 {
            bytes.extend_from_slice(&encode_event(&Event::normal(EventData::TestStarting(
                ReportEntry::named(format!("T{i}")),
            ))));
        }
        bytes.extend_from_slice(&encode_event(&Event::normal(EventData::Bye)));
        // Anything after bye is never consumed.
        bytes.extend_from_slice(b"trailing noise");

        let handler = Arc::new(Recording::default());
        let wg = WaitGroup::new();
        let handle = spawn_consumer(
            "stdout",
            std::io::Cursor::new(bytes),
            Arc::clone(&handler) as Arc<dyn EventHandler>,
            wg.clone(),
        )
        .expect("spawn");
        wg.wait();
        handle.join().expect("join");

        let events = handler.events.lock();
        assert_eq!(events.len(), 6);
        for (i, event) in events.iter().take(5).enumerate() {
            let re = event.report().expect("report entry");
            assert_eq!(re.source, format!("T{i}"));
            assert_eq!(event.run_mode, RunMode::Normal);
        }
        assert!(matches!(events[5].data, EventData::Bye));
        assert!(handler.malformed.lock().is_empty());
    }

    #[test]
    fn garbage_between_frames_is_reported_not_fatal() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"println from a test\n");
        bytes.extend_from_slice(&encode_event(&Event::normal(EventData::Bye)));

        let handler = Arc::new(Recording::default());
        let wg = WaitGroup::new();
        let handle = spawn_consumer(
            "stderr",
            std::io::Cursor::new(bytes),
            Arc::clone(&handler) as Arc<dyn EventHandler>,
            wg.clone(),
        )
        .expect("spawn");
        wg.wait();
        handle.join().expect("join");

        assert_eq!(handler.malformed.lock().len(), 1);
        assert_eq!(handler.events.lock().len(), 1);
    }
}
