//! CLI test cases.
//!
//! Everything here runs in a temporary directory. Tests which need poppler,
//! tesseract and a live LLM are ignored by default; run them with
//! `cargo test -- --ignored` on a machine with all three.

use std::{fs, path::Path, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use serde_json::{Value, json};

/// Create a new `Command` with our binary, running in `dir` with no log
/// files and no API keys from the environment.
fn cmd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("resume-ingest").unwrap();
    cmd.current_dir(dir)
        .env_remove("OPENAI_API_KEY")
        .env_remove("OPENROUTER_API_KEY")
        .env_remove("RESUME_INGEST_INPUT_DIR")
        .env_remove("RESUME_INGEST_WORK_DIR")
        .env_remove("RESUME_INGEST_OUTPUT_DIR")
        .arg("--no-log-file");
    cmd
}

/// Write a failed job whose stored raw response is now acceptable, as if a
/// parser bug had been fixed since it ran.
fn write_fixable_job(dir: &Path, job_id: &str) {
    let job_dir = dir.join("work/jobs").join(job_id);
    fs::create_dir_all(&job_dir).unwrap();
    let failed_dir = dir.join("work/archive/failed");
    fs::create_dir_all(&failed_dir).unwrap();
    let archived = failed_dir.join(format!("{job_id}.pdf"));
    fs::write(&archived, b"%PDF-1.4\n").unwrap();

    let raw_response = job_dir.join("raw_response.json");
    let content = json!({
        "personal_info": { "name": "Jane Doe", "email": "jane@example.com" },
        "skills": ["Rust", "SQL"],
    });
    fs::write(
        &raw_response,
        serde_json::to_vec(&json!({
            "model": "test-model",
            "mode": "json",
            "content": content.to_string(),
            "duration_secs": 1.5,
        }))
        .unwrap(),
    )
    .unwrap();

    let job = json!({
        "id": job_id,
        "original_name": "jane.pdf",
        "source_path": "input/jane.pdf",
        "stage": "validate",
        "status": "failed",
        "artifacts": {
            "raw_response": raw_response,
            "archived_source": archived,
        },
        "error": {
            "stage": "validate",
            "kind": "validation",
            "message": "personal_info.email is missing",
        },
        "attempts": 1,
        "created_at": "2025-01-01T00:00:00Z",
        "updated_at": "2025-01-01T00:00:00Z",
    });
    fs::write(job_dir.join("job.json"), serde_json::to_vec(&job).unwrap()).unwrap();
}

fn read_json(path: &Path) -> Value {
    serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
}

#[test]
fn test_help() {
    let dir = tempfile::tempdir().unwrap();
    cmd(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("OPENROUTER_API_KEY"));
}

#[test]
fn test_version() {
    let dir = tempfile::tempdir().unwrap();
    cmd(dir.path()).arg("--version").assert().success();
}

#[test]
fn test_schema_parsed_resume() {
    let dir = tempfile::tempdir().unwrap();
    cmd(dir.path())
        .args(["schema", "ParsedResume"])
        .assert()
        .success()
        .stdout(predicate::str::contains("personal_info"));
}

#[test]
fn test_schema_to_file() {
    let dir = tempfile::tempdir().unwrap();
    cmd(dir.path())
        .args(["schema", "ResumeJob", "-o", "job.schema.json"])
        .assert()
        .success();
    let schema = read_json(&dir.path().join("job.schema.json"));
    assert!(schema["properties"]["stage"].is_object(), "{schema}");
}

#[test]
fn test_run_with_nothing_to_do() {
    let dir = tempfile::tempdir().unwrap();
    cmd(dir.path()).arg("run").assert().success();
    assert!(dir.path().join("input").is_dir());
    assert!(dir.path().join("work/archive/done").is_dir());
    assert!(dir.path().join("output").is_dir());
}

#[test]
fn test_status_with_no_jobs() {
    let dir = tempfile::tempdir().unwrap();
    cmd(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_reparse_unknown_job_fails() {
    let dir = tempfile::tempdir().unwrap();
    cmd(dir.path())
        .args(["reparse", "nobody-12345678"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("could not be re-parsed"));
}

#[test]
fn test_reparse_publishes_fixed_response() {
    let dir = tempfile::tempdir().unwrap();
    write_fixable_job(dir.path(), "jane-00000000");

    cmd(dir.path())
        .args(["status", "--failed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("jane-00000000"));

    // No LLM is configured, so this only works if nothing calls it.
    cmd(dir.path()).arg("reparse").assert().success();

    let output = read_json(&dir.path().join("output/jane-00000000.json"));
    assert_eq!(output["personal_info"]["name"], "Jane Doe");
    assert_eq!(output["skills"], json!({ "items": ["Rust", "SQL"] }));
    assert!(dir.path().join("work/archive/done/jane-00000000.pdf").exists());
    assert!(!dir.path().join("work/archive/failed/jane-00000000.pdf").exists());

    let job = read_json(&dir.path().join("work/jobs/jane-00000000/job.json"));
    assert_eq!(job["status"], "done");
    assert_eq!(job["stage"], "archive");
    assert!(job.get("error").is_none(), "{job}");

    cmd(dir.path())
        .args(["status", "--failed"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
#[ignore = "Needs poppler, tesseract and an LLM API key"]
fn test_run_real_resume() {
    let dir = tempfile::tempdir().unwrap();
    let input_dir = dir.path().join("input");
    fs::create_dir_all(&input_dir).unwrap();
    let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/resume.pdf");
    fs::copy(fixture, input_dir.join("resume.pdf")).unwrap();

    Command::cargo_bin("resume-ingest")
        .unwrap()
        .current_dir(dir.path())
        .args(["--no-log-file", "run", "--allowed-failure-rate", "0"])
        .assert()
        .success();

    let outputs = fs::read_dir(dir.path().join("output")).unwrap().count();
    assert_eq!(outputs, 1);
    assert!(!input_dir.join("resume.pdf").exists());
}
