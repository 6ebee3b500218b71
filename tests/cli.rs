//! CLI test cases.
//!
//! Queue-backed subcommands run against a throwaway SQLite database in a
//! temp directory, so the tests never touch a real deployment. Anything
//! that needs a live repository or OCR provider is exercised by the unit
//! tests against mocks instead.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("ocr-relay").unwrap()
}

/// A `Command` wired to a throwaway queue database under `dir`.
fn cmd_with_queue(dir: &tempfile::TempDir) -> Command {
    let db = dir.path().join("queue.db");
    let mut cmd = cmd();
    cmd.env(
        "OCR_RELAY_QUEUE_DB",
        format!("sqlite://{}", db.display()),
    );
    cmd
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_enqueue_prints_job_ids() {
    let dir = tempfile::TempDir::with_prefix("ocr-relay").unwrap();
    cmd_with_queue(&dir)
        .arg("enqueue")
        .arg("newsletters/RSNLVHZZ002/page1.jpg")
        .arg("--collection")
        .arg("c1")
        .assert()
        .success()
        .stdout(predicate::str::contains("job_id"))
        .stdout(predicate::str::contains(
            "newsletters/RSNLVHZZ002/page1.jpg",
        ));
}

#[test]
fn test_enqueued_tasks_show_as_pending() {
    let dir = tempfile::TempDir::with_prefix("ocr-relay").unwrap();
    cmd_with_queue(&dir)
        .arg("enqueue")
        .arg("books/a.pdf")
        .arg("books/b.pdf")
        .assert()
        .success();
    cmd_with_queue(&dir)
        .arg("tasks")
        .arg("pending")
        .assert()
        .success()
        .stdout(predicate::str::contains("2"));
}

#[test]
fn test_enqueue_from_listing_file() {
    let dir = tempfile::TempDir::with_prefix("ocr-relay").unwrap();
    let listing = dir.path().join("listing.txt");
    std::fs::write(&listing, "books/a.pdf\n\n  books/b.pdf\n").unwrap();
    cmd_with_queue(&dir)
        .arg("enqueue")
        .arg("--from-file")
        .arg(&listing)
        .assert()
        .success();
    cmd_with_queue(&dir)
        .arg("tasks")
        .arg("pending")
        .assert()
        .success()
        .stdout(predicate::str::contains("2"));
}

#[test]
fn test_cancel_of_unknown_task_fails() {
    let dir = tempfile::TempDir::with_prefix("ocr-relay").unwrap();
    cmd_with_queue(&dir)
        .arg("tasks")
        .arg("cancel")
        .arg("00000000-0000-0000-0000-000000000000")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no task"));
}

#[test]
fn test_dead_letters_start_empty() {
    let dir = tempfile::TempDir::with_prefix("ocr-relay").unwrap();
    cmd_with_queue(&dir)
        .arg("tasks")
        .arg("dead")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}
