use anyhow::Result;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Run the docket binary inside `temp_dir` with its data kept there too.
fn run_cli(temp_dir: &TempDir, args: &[&str]) -> Result<Output> {
    let output = Command::new(env!("CARGO_BIN_EXE_docket"))
        .current_dir(temp_dir.path())
        .arg("--data-dir")
        .arg(temp_dir.path().join("data"))
        .args(args)
        .env("RUST_LOG", "error")
        .output()?;
    Ok(output)
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn json(output: &Output) -> Result<serde_json::Value> {
    Ok(serde_json::from_slice(&output.stdout)?)
}

fn write_doc(temp_dir: &TempDir, name: &str, text: &str) -> Result<String> {
    let path = temp_dir.path().join(name);
    std::fs::write(&path, text)?;
    Ok(path.to_string_lossy().into_owned())
}

#[test]
fn test_init_creates_stores_and_config() -> Result<()> {
    let temp_dir = TempDir::new()?;

    let output = run_cli(&temp_dir, &["init"])?;
    assert!(output.status.success(), "init failed: {output:?}");
    assert!(stdout(&output).contains("Initialized docket data"));
    assert!(temp_dir.path().join("docket.toml").exists());
    assert!(temp_dir.path().join("data").join("registry.db").exists());
    assert!(temp_dir.path().join("data").join("vectors.db").exists());
    Ok(())
}

#[test]
fn test_upload_work_query_roundtrip() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = write_doc(
        &temp_dir,
        "sky.txt",
        "The sky is blue on a clear day. Grass is green in spring.",
    )?;

    let output = run_cli(&temp_dir, &["--format", "json", "upload", &path, "--owner", "alice"])?;
    assert!(output.status.success(), "upload failed: {output:?}");
    let receipts = json(&output)?;
    let document_id = receipts[0]["document_id"]
        .as_str()
        .expect("document id")
        .to_string();
    assert_eq!(receipts[0]["status"], "PENDING");

    // A separate process picks up the upload
    let output = run_cli(&temp_dir, &["--format", "json", "work"])?;
    assert!(output.status.success(), "work failed: {output:?}");
    assert_eq!(json(&output)?["indexed"], 1);

    let output = run_cli(&temp_dir, &["--format", "json", "status", &document_id])?;
    let status = json(&output)?;
    assert_eq!(status["status"], "INDEXED");
    assert_eq!(status["chunk_count"], 1);

    let output = run_cli(
        &temp_dir,
        &["--format", "json", "query", "blue sky", "--owner", "alice"],
    )?;
    assert!(output.status.success(), "query failed: {output:?}");
    let result = json(&output)?;
    assert_eq!(result["passages"][0]["document_id"], document_id.as_str());

    let output = run_cli(&temp_dir, &["query", "blue sky", "--owner", "bob"])?;
    assert!(stdout(&output).contains("No matching passages"));

    let output = run_cli(&temp_dir, &["summary", "--owner", "alice"])?;
    assert!(stdout(&output).contains("INDEXED=1"));
    Ok(())
}

#[test]
fn test_errors_exit_nonzero() -> Result<()> {
    let temp_dir = TempDir::new()?;

    let output = run_cli(&temp_dir, &["status", "does-not-exist"])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Document not found"));

    let path = write_doc(&temp_dir, "binary.exe", "MZ")?;
    let output = run_cli(&temp_dir, &["upload", &path, "--owner", "alice"])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unsupported file type"));
    Ok(())
}

#[test]
fn test_delete_removes_document() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = write_doc(&temp_dir, "notes.md", "# Notes\nShort note.")?;

    let output = run_cli(
        &temp_dir,
        &["--format", "json", "upload", &path, "--owner", "alice", "--process"],
    )?;
    let document_id = json(&output)?[0]["document_id"]
        .as_str()
        .expect("document id")
        .to_string();

    let output = run_cli(&temp_dir, &["delete", &document_id, "--owner", "bob"])?;
    assert!(!output.status.success());

    let output = run_cli(&temp_dir, &["delete", &document_id, "--owner", "alice"])?;
    assert!(output.status.success(), "delete failed: {output:?}");

    let output = run_cli(&temp_dir, &["--format", "json", "list", "--owner", "alice"])?;
    assert_eq!(json(&output)?.as_array().map(Vec::len), Some(0));
    Ok(())
}
