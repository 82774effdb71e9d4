use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docsync_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_docsync"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("policies")).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("policies/enrollment.md"),
        "+++\ntitle = \"Enrollment policy\"\nlast_reviewed_at = 2024-05-01\n+++\nEnrollment opens in May for returning families.",
    )
    .unwrap();
    fs::write(
        files_dir.join("partners.txt"),
        "+++\ncore = false\naudience = [\"partners\"]\n+++\nPartner onboarding checklist and voucher process.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/docsync.sqlite"

[chunking]
max_tokens = 120
overlap_tokens = 20

[source]
kind = "filesystem"

[source.filesystem]
root = "{root}/files"
include_globs = ["**/*.md", "**/*.txt"]
default_core = true
"#,
        root = root.display()
    );

    let config_path = config_dir.join("docsync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docsync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docsync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docsync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

/// Value of a `label: value` line in a sync report.
fn report_value(stdout: &str, label: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        line.trim()
            .strip_prefix(&format!("{}:", label))
            .map(|rest| rest.trim().to_string())
    })
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_docsync(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully."));
    assert!(tmp.path().join("data/docsync.sqlite").exists());

    let (_, stderr, ok) = run_docsync(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_bootstrap_indexes_and_rerun_is_unchanged() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_docsync(&config, &["bootstrap"]);
    assert!(ok, "bootstrap failed: {}", stderr);
    assert_eq!(report_value(&stdout, "indexed").as_deref(), Some("3"));
    assert_eq!(report_value(&stdout, "cursor").as_deref(), Some("advanced"));

    let (stdout, stderr, ok) = run_docsync(&config, &["bootstrap"]);
    assert!(ok, "second bootstrap failed: {}", stderr);
    assert_eq!(report_value(&stdout, "indexed").as_deref(), Some("0"));
    assert_eq!(report_value(&stdout, "unchanged").as_deref(), Some("3"));
}

#[test]
fn test_search_respects_audience() {
    let (_tmp, config) = setup_test_env();
    run_docsync(&config, &["bootstrap"]);

    let (stdout, _, ok) = run_docsync(&config, &["search", "enrollment"]);
    assert!(ok);
    assert!(stdout.contains("policies / Enrollment policy"));
    assert!(stdout.contains("reviewed: 2024-05-01"));

    let (stdout, _, ok) = run_docsync(&config, &["search", "voucher"]);
    assert!(ok);
    assert!(stdout.contains("No results."));

    let (stdout, _, ok) = run_docsync(
        &config,
        &["search", "voucher", "--audience", "partners", "--explain"],
    );
    assert!(ok);
    assert!(stdout.contains("partners.txt"));
    assert!(stdout.contains("explain: semantic="));
}

#[test]
fn test_search_empty_query() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, ok) = run_docsync(&config, &["search", ""]);
    assert!(ok);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_poll_picks_up_modified_file() {
    let (tmp, config) = setup_test_env();
    run_docsync(&config, &["bootstrap"]);

    fs::write(
        tmp.path().join("files/alpha.md"),
        "# Alpha Document\n\nRewritten to cover deployment pipelines and release trains in detail.",
    )
    .unwrap();

    let (stdout, stderr, ok) = run_docsync(&config, &["poll"]);
    assert!(ok, "poll failed: {}", stderr);
    assert_eq!(report_value(&stdout, "indexed").as_deref(), Some("1"));

    let (stdout, _, _) = run_docsync(&config, &["search", "release trains"]);
    assert!(stdout.contains("alpha.md"));
}

#[test]
fn test_bootstrap_tombstones_removed_file() {
    let (tmp, config) = setup_test_env();
    run_docsync(&config, &["bootstrap"]);

    fs::remove_file(tmp.path().join("files/alpha.md")).unwrap();
    let (stdout, _, ok) = run_docsync(&config, &["bootstrap"]);
    assert!(ok);
    assert_eq!(report_value(&stdout, "deleted").as_deref(), Some("1"));

    let (stdout, _, ok) = run_docsync(&config, &["status", "alpha.md"]);
    assert!(ok);
    assert!(stdout.contains("status:      deleted"));
}

#[test]
fn test_status_and_reindex() {
    let (_tmp, config) = setup_test_env();
    run_docsync(&config, &["bootstrap"]);

    let (stdout, _, ok) = run_docsync(&config, &["status", "policies/enrollment.md"]);
    assert!(ok);
    assert!(stdout.contains("status:      indexed"));
    assert!(stdout.contains("Enrollment policy"));

    let (stdout, stderr, ok) = run_docsync(&config, &["reindex", "policies/enrollment.md"]);
    assert!(ok, "reindex failed: {}", stderr);
    assert!(stdout.contains("Re-indexed policies/enrollment.md"));

    let (_, stderr, ok) = run_docsync(&config, &["status", "missing.md"]);
    assert!(!ok);
    assert!(stderr.contains("Document not found"));

    let (_, stderr, ok) = run_docsync(&config, &["reindex", "missing.md"]);
    assert!(!ok);
    assert!(stderr.contains("Document not found"));
}

#[test]
fn test_cursor_show_and_reset() {
    let (_tmp, config) = setup_test_env();
    run_docsync(&config, &["init"]);

    let (stdout, _, ok) = run_docsync(&config, &["cursor", "show"]);
    assert!(ok);
    assert!(stdout.contains("No cursor"));

    run_docsync(&config, &["bootstrap"]);
    let (stdout, _, _) = run_docsync(&config, &["cursor", "show"]);
    assert!(stdout.contains("applied"));

    let (stdout, _, ok) = run_docsync(&config, &["cursor", "reset"]);
    assert!(ok);
    assert!(stdout.contains("Cursor reset."));
    let (stdout, _, _) = run_docsync(&config, &["cursor", "show"]);
    assert!(stdout.contains("No cursor"));
}

#[test]
fn test_stats() {
    let (_tmp, config) = setup_test_env();
    run_docsync(&config, &["bootstrap"]);
    let (stdout, _, ok) = run_docsync(&config, &["stats"]);
    assert!(ok);
    assert!(stdout.contains("Documents:   3"));
    assert!(stdout.contains("indexed"));
    assert!(stdout.contains("Embedded:    0 / 3"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(
        &bad,
        "[db]\npath = \"x.sqlite\"\n\n[source]\nkind = \"ftp\"\n",
    )
    .unwrap();
    let (_, stderr, ok) = run_docsync(&bad, &["stats"]);
    assert!(!ok);
    assert!(stderr.contains("Unknown source kind"));
}
