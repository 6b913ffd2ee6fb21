//! CLI Integration Tests
//!
//! These tests verify the CLI commands work correctly end-to-end.
//! They test the "wiring" between the CLI and the core library.

use std::io::Read;
use std::net::TcpListener;
use std::thread::{self, JoinHandle};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("whisper").expect("Failed to find whisper binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

/// Value after `prefix` on the first line that starts with it
fn extract_field(output: &str, prefix: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix(prefix))
        .map(|value| value.trim().to_string())
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// A neighbor that never says hello and records every byte it is sent
fn silent_neighbor() -> (String, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        let _ = stream.read_to_end(&mut received);
        received
    });
    (addr, handle)
}

/// Send one message to `to` through a silent neighbor
fn send_via_neighbor(data_dir: &TempDir, to: &str, text: &str) -> Vec<u8> {
    let (addr, neighbor) = silent_neighbor();
    cli_cmd(data_dir)
        .args(["send", "--connect", &addr, "--wait", "1", to, text])
        .assert()
        .success()
        .stdout(predicate::str::contains("Sent message"));
    neighbor.join().unwrap()
}

// ============================================================================
// Info Command Tests
// ============================================================================

#[test]
fn test_info_command() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Whisper v"))
        .stdout(predicate::str::contains("Identity:"))
        .stdout(predicate::str::contains("Public key:"))
        .stdout(predicate::str::contains("Default TTL: 4"));
}

#[test]
fn test_info_shows_data_directory() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Data directory:"));
}

#[test]
fn test_info_with_sealed_cipher() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["--cipher", "sealed", "info"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cipher:"));
}

// ============================================================================
// Identity Command Tests
// ============================================================================

#[test]
fn test_identity_show() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["identity", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Identity:"))
        .stdout(predicate::str::contains("ID:"))
        .stdout(predicate::str::contains("Name:"));
}

#[test]
fn test_identity_persists() {
    let data_dir = TempDir::new().unwrap();

    let first = stdout_of(cli_cmd(&data_dir).args(["identity", "show"]));
    let second = stdout_of(cli_cmd(&data_dir).args(["identity", "show"]));

    assert_eq!(
        extract_field(&first, "  ID: "),
        extract_field(&second, "  ID: ")
    );
}

#[test]
fn test_identity_reset_requires_force() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["identity", "reset"])
        .assert()
        .success()
        .stdout(predicate::str::contains("WARNING"))
        .stdout(predicate::str::contains("--force"));
}

#[test]
fn test_identity_reset_with_force() {
    let data_dir = TempDir::new().unwrap();

    let before = stdout_of(cli_cmd(&data_dir).args(["identity", "show"]));
    let initial_id = extract_field(&before, "  ID: ").unwrap();

    cli_cmd(&data_dir)
        .args(["identity", "reset", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Identity reset."))
        .stdout(predicate::str::contains("New ID:"));

    let after = stdout_of(cli_cmd(&data_dir).args(["identity", "show"]));
    assert_ne!(extract_field(&after, "  ID: ").unwrap(), initial_id);
}

// ============================================================================
// Keys Command Tests
// ============================================================================

#[test]
fn test_keys_show_before_first_use() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["keys", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No key pair stored."));
}

#[test]
fn test_keys_created_by_node_start() {
    let data_dir = TempDir::new().unwrap();

    let info = stdout_of(cli_cmd(&data_dir).arg("info"));
    let public_key = extract_field(&info, "  Public key: ").unwrap();

    cli_cmd(&data_dir)
        .args(["keys", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains(public_key));
}

#[test]
fn test_keys_rotate_requires_force() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["keys", "rotate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("WARNING"))
        .stdout(predicate::str::contains("--force"));
}

#[test]
fn test_keys_rotate_with_force() {
    let data_dir = TempDir::new().unwrap();

    let info = stdout_of(cli_cmd(&data_dir).arg("info"));
    let old_key = extract_field(&info, "  Public key: ").unwrap();

    let rotated = stdout_of(cli_cmd(&data_dir).args(["keys", "rotate", "--force"]));
    let new_key = extract_field(&rotated, "  New public key: ").unwrap();
    assert_ne!(new_key, old_key);

    cli_cmd(&data_dir)
        .args(["keys", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains(new_key));
}

#[test]
fn test_keys_delete_with_force() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir).arg("info").assert().success();

    cli_cmd(&data_dir)
        .args(["keys", "delete", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Keys deleted."));

    cli_cmd(&data_dir)
        .args(["keys", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No key pair stored."));
}

// ============================================================================
// Conversation Command Tests
// ============================================================================

#[test]
fn test_conversations_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("conversations")
        .assert()
        .success()
        .stdout(predicate::str::contains("No conversations."));
}

#[test]
fn test_messages_unknown_peer() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["messages", "bbb222"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No messages with bbb222."));
}

#[test]
fn test_read_nonexistent_conversation() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["read", "bbb222"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Conversation not found"));
}

#[test]
fn test_clear_all_requires_force() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("clear-all")
        .assert()
        .success()
        .stdout(predicate::str::contains("WARNING"))
        .stdout(predicate::str::contains("--force"));
}

// ============================================================================
// Send Command Tests
// ============================================================================

#[test]
fn test_send_writes_hello_and_packet() {
    let data_dir = TempDir::new().unwrap();

    let received = send_via_neighbor(&data_dir, "bbb222", "meet at the ridge");
    let wire = String::from_utf8_lossy(&received);

    // no hello came back, so the key is unknown and the text is plain
    assert!(wire.contains("whisper/1"));
    assert!(wire.contains("meet at the ridge"));
    assert!(wire.contains("bbb222"));
}

#[test]
fn test_send_unreachable_neighbor_fails() {
    let data_dir = TempDir::new().unwrap();

    // bind then drop to get a port nobody listens on
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };

    cli_cmd(&data_dir)
        .args(["send", "--connect", &addr, "bbb222", "hello?"])
        .assert()
        .failure();
}

#[test]
fn test_sent_message_workflow() {
    let data_dir = TempDir::new().unwrap();

    send_via_neighbor(&data_dir, "bbb222", "first words");

    cli_cmd(&data_dir)
        .arg("conversations")
        .assert()
        .success()
        .stdout(predicate::str::contains("Conversations (1):"))
        .stdout(predicate::str::contains("Peer: bbb222"))
        .stdout(predicate::str::contains("You: first words"));

    cli_cmd(&data_dir)
        .args(["messages", "bbb222"])
        .assert()
        .success()
        .stdout(predicate::str::contains("You: first words"));

    cli_cmd(&data_dir)
        .args(["conversations", "--only", "ccc333"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No conversations."));

    cli_cmd(&data_dir)
        .args(["read", "bbb222"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Marked conversation"));

    cli_cmd(&data_dir)
        .args(["clear", "bbb222"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared conversation"));

    cli_cmd(&data_dir)
        .args(["messages", "bbb222"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No messages with bbb222."));
}

#[test]
fn test_broadcasts_share_one_conversation() {
    let data_dir = TempDir::new().unwrap();

    send_via_neighbor(&data_dir, "*", "anyone out there?");
    send_via_neighbor(&data_dir, "*", "still here");

    cli_cmd(&data_dir)
        .arg("conversations")
        .assert()
        .success()
        .stdout(predicate::str::contains("Conversations (1):"))
        .stdout(predicate::str::contains("(broadcast)"));

    cli_cmd(&data_dir)
        .args(["messages", "*"])
        .assert()
        .success()
        .stdout(predicate::str::contains("anyone out there?"))
        .stdout(predicate::str::contains("still here"));
}

#[test]
fn test_clear_all_with_force() {
    let data_dir = TempDir::new().unwrap();

    send_via_neighbor(&data_dir, "bbb222", "soon gone");

    cli_cmd(&data_dir)
        .args(["clear-all", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared all conversations."));

    cli_cmd(&data_dir)
        .arg("conversations")
        .assert()
        .success()
        .stdout(predicate::str::contains("No conversations."));
}

// ============================================================================
// Simulate Command Tests
// ============================================================================

#[test]
fn test_simulate_chain_ttl_bound() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["simulate", "--nodes", "4", "--topology", "chain", "--ttl", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Reached: 1, 2"))
        .stdout(predicate::str::contains("Missed: 3"));
}

#[test]
fn test_simulate_addressed_full_mesh() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["simulate", "--nodes", "3", "--topology", "full", "--to", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Flood from node 0 to node 2:"))
        .stdout(predicate::str::contains("Reached: 2"))
        .stdout(predicate::str::contains("Missed: (none)"));
}

#[test]
fn test_simulate_does_not_touch_data_dir() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["simulate", "--nodes", "2"])
        .assert()
        .success();

    assert!(!data_dir.path().join("whisper.redb").exists());
}

#[test]
fn test_simulate_invalid_topology() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["simulate", "--topology", "hypercube"])
        .assert()
        .failure();
}

#[test]
fn test_simulate_target_out_of_range() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["simulate", "--nodes", "3", "--to", "5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--to must be between"));
}

// ============================================================================
// Error Handling Tests
// ============================================================================

#[test]
fn test_invalid_subcommand() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir).arg("teleport").assert().failure();
}

#[test]
fn test_missing_required_args() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir).arg("messages").assert().failure();

    cli_cmd(&data_dir)
        .args(["send", "bbb222", "no neighbor given"])
        .assert()
        .failure();
}

#[test]
fn test_invalid_cipher() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["--cipher", "rot13", "info"])
        .assert()
        .failure();
}

#[test]
fn test_help_works() {
    Command::cargo_bin("whisper")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("conversations"));
}

#[test]
fn test_version() {
    Command::cargo_bin("whisper")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("whisper"));
}
