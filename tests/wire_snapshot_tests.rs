//! Snapshot tests pinning the bit-exact wire format and command-line
//! assembly
//!
//! These exist to catch accidental frame-layout changes: the protocol has
//! backward-compatibility constraints, so any diff here is a breaking
//! change, not a refactor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_wire::{encode_command, encode_event, Command, Event, EventData, ShutdownMode};

fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).escape_debug().to_string()
}

#[test]
fn bye_frame_layout() {
    let frame = encode_event(&Event::normal(EventData::Bye));
    insta::assert_snapshot!(printable(&frame), @":kiln-event:bye:normal-run:UTF-8:");
}

#[test]
fn stop_on_next_test_frame_layout() {
    let frame = encode_event(&Event::normal(EventData::StopOnNextTest));
    insta::assert_snapshot!(printable(&frame), @":kiln-event:stop-on-next-test:normal-run:UTF-8:");
}

#[test]
fn shutdown_kill_frame_layout() {
    let frame = encode_command(&Command::Shutdown(ShutdownMode::Kill));
    insta::assert_snapshot!(
        printable(&frame),
        @r":kiln-command:shutdown:UTF-8:\u{0}\u{0}\u{0}\u{4}kill"
    );
}

#[test]
fn testset_finished_frame_layout() {
    let frame = encode_command(&Command::TestSetFinished);
    insta::assert_snapshot!(printable(&frame), @":kiln-command:testset-finished:UTF-8:");
}

#[test]
fn assembled_command_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = kiln::ForkConfiguration {
        entry: PathBuf::from("/opt/kiln/kiln-worker"),
        boot_paths: vec![PathBuf::from("/opt/boot"), PathBuf::from("/opt/extra")],
        working_dir: dir.path().to_path_buf(),
        arg_line: Some("--tag fork-{fork.index}".to_string()),
        env: BTreeMap::new(),
        debug: false,
        fork_count: 1,
        reuse_forks: true,
        timeout: None,
        delivery: kiln::fork::PathDelivery::Auto,
        modular: false,
        reports_dir: dir.path().join("reports"),
    };
    let cmd = config
        .command(2, Path::new("settings-2.json"), dir.path())
        .expect("command");
    insta::assert_snapshot!(
        kiln::fork::config::preview(&cmd),
        @"/opt/kiln/kiln-worker settings-2.json --boot-path /opt/boot:/opt/extra -- --tag fork-2"
    );
}
