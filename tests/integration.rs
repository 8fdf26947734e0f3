use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ctxb_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ctxb");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Corpus layout: <root>/<project>/<document_type>/<file>
    let resumes = root.join("corpus/apollo/resume");
    fs::create_dir_all(&resumes).unwrap();
    fs::write(
        resumes.join("alice.md"),
        "# Alice\n\nLed the Rust rewrite of the claims pipeline for the agency.",
    )
    .unwrap();
    fs::write(
        resumes.join("alice.md.meta.toml"),
        "agency_match = true\ntechnologies = [\"rust\"]\ndate = 2024-05-01\n",
    )
    .unwrap();
    fs::write(
        resumes.join("bob.md"),
        "# Bob\n\nBuilt data platforms in Python and Spark.",
    )
    .unwrap();
    fs::write(resumes.join("bob.md.meta.toml"), "date = 2024-05-01\n").unwrap();
    fs::write(resumes.join("carol.txt"), "Carol. ".repeat(400)).unwrap();
    fs::write(resumes.join("carol.txt.meta.toml"), "date = 2024-05-01\n").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/ctxb.sqlite"

[documents]
root = "{root}/corpus"

[cache]
debounce_ms = 50
build_timeout_secs = 10

[models]
default = "small"

[models.categories.small]
max_tokens = 500

[models.categories.large]
max_tokens = 100000

[scoring]
technologies = ["rust"]
"#,
        root = root.display()
    );

    let config_path = config_dir.join("ctxb.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ctxb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ctxb_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ctxb binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ctxb(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/ctxb.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_ctxb(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_ctxb(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_get_builds_and_prints_bundle() {
    let (_tmp, config_path) = setup_test_env();
    run_ctxb(&config_path, &["init"]);

    let (stdout, stderr, success) = run_ctxb(&config_path, &["get", "apollo", "resume"]);
    assert!(success, "get failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("# Alice"));
    assert!(stdout.contains("# Bob"));
    // carol is larger than the budget
    assert!(!stdout.contains("Carol."));

    // Alice ranks first
    let alice = stdout.find("# Alice").unwrap();
    let bob = stdout.find("# Bob").unwrap();
    assert!(alice < bob);
}

#[test]
fn test_get_json_is_deterministic() {
    let (_tmp, config_path) = setup_test_env();
    run_ctxb(&config_path, &["init"]);

    let (first, _, success) = run_ctxb(&config_path, &["get", "apollo", "resume", "--json"]);
    assert!(success);
    let (second, _, _) = run_ctxb(&config_path, &["get", "apollo", "resume", "--json"]);
    assert_eq!(first, second, "cached bundle should not change between reads");

    let value: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert_eq!(value["status"], "READY");
    assert_eq!(value["bundle"]["included_ids"][0], "alice.md");
    assert_eq!(value["bundle"]["excluded_ids"][0], "carol.txt");
}

#[test]
fn test_build_now_and_status() {
    let (_tmp, config_path) = setup_test_env();
    run_ctxb(&config_path, &["init"]);

    let (stdout, stderr, success) =
        run_ctxb(&config_path, &["build", "apollo", "resume", "--now"]);
    assert!(success, "build failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("READY"));
    assert!(stdout.contains("2 included, 1 excluded"));

    let (stdout, _, success) = run_ctxb(&config_path, &["status", "apollo", "resume"]);
    assert!(success);
    assert!(stdout.contains("apollo/resume: READY"));
    assert!(stdout.contains("model: small (budget 300 tokens)"));
    assert!(stdout.contains("oversized: carol.txt"));
}

#[test]
fn test_debounced_build_waits_for_result() {
    let (_tmp, config_path) = setup_test_env();
    run_ctxb(&config_path, &["init"]);

    let (stdout, stderr, success) = run_ctxb(&config_path, &["build", "apollo", "resume"]);
    assert!(success, "build failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("apollo/resume: READY"));
}

#[test]
fn test_status_of_unknown_key_is_none() {
    let (_tmp, config_path) = setup_test_env();
    run_ctxb(&config_path, &["init"]);

    let (stdout, _, success) = run_ctxb(&config_path, &["status", "gemini", "resume"]);
    assert!(success);
    assert!(stdout.contains("gemini/resume: NONE"));
}

#[test]
fn test_overflow_json() {
    let (_tmp, config_path) = setup_test_env();
    run_ctxb(&config_path, &["init"]);

    let (stdout, stderr, success) =
        run_ctxb(&config_path, &["overflow", "apollo", "resume", "--json"]);
    assert!(success, "overflow failed: stdout={}, stderr={}", stdout, stderr);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["model_category"], "small");
    assert_eq!(report["max_context_tokens"], 300);
    assert_eq!(report["will_overflow"], true);
    assert_eq!(report["oversized_ids"][0], "carol.txt");

    let (stdout, _, success) = run_ctxb(
        &config_path,
        &["overflow", "apollo", "resume", "--model", "large", "--json"],
    );
    assert!(success);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["will_overflow"], false);
}

#[test]
fn test_overflow_unknown_model_errors() {
    let (_tmp, config_path) = setup_test_env();
    run_ctxb(&config_path, &["init"]);

    let (_, stderr, success) = run_ctxb(
        &config_path,
        &["overflow", "apollo", "resume", "--model", "huge"],
    );
    assert!(!success);
    assert!(stderr.contains("huge"), "stderr: {}", stderr);
}

#[test]
fn test_select_then_get() {
    let (_tmp, config_path) = setup_test_env();
    run_ctxb(&config_path, &["init"]);

    let (stdout, stderr, success) = run_ctxb(
        &config_path,
        &["select", "apollo", "resume", "--id", "bob.md"],
    );
    assert!(success, "select failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("apollo/resume: 1 documents"));
    assert!(stdout.contains("+ bob.md"));

    let (stdout, _, success) = run_ctxb(&config_path, &["get", "apollo", "resume"]);
    assert!(success);
    assert!(stdout.contains("# Bob"));
    assert!(!stdout.contains("# Alice"));

    let (stdout, _, _) = run_ctxb(&config_path, &["status", "apollo", "resume"]);
    assert!(stdout.contains("manual selection"));
}

#[test]
fn test_select_unknown_id_errors() {
    let (_tmp, config_path) = setup_test_env();
    run_ctxb(&config_path, &["init"]);

    let (_, stderr, success) = run_ctxb(
        &config_path,
        &["select", "apollo", "resume", "--id", "nobody.md"],
    );
    assert!(!success);
    assert!(stderr.contains("not found"), "stderr: {}", stderr);
}

#[test]
fn test_clear_marks_entry_cleared() {
    let (_tmp, config_path) = setup_test_env();
    run_ctxb(&config_path, &["init"]);
    run_ctxb(&config_path, &["build", "apollo", "resume", "--now"]);

    let (stdout, _, success) = run_ctxb(&config_path, &["clear", "apollo", "resume"]);
    assert!(success);
    assert!(stdout.contains("apollo/resume: cleared"));

    let (stdout, _, _) = run_ctxb(&config_path, &["status", "apollo", "resume"]);
    assert!(stdout.contains("FAILED"));
    assert!(stdout.contains("cache cleared"));

    // The next read rebuilds
    let (stdout, _, success) = run_ctxb(&config_path, &["get", "apollo", "resume"]);
    assert!(success);
    assert!(stdout.contains("# Alice"));
}

#[test]
fn test_cleanup() {
    let (_tmp, config_path) = setup_test_env();
    run_ctxb(&config_path, &["init"]);
    run_ctxb(&config_path, &["build", "apollo", "resume", "--now"]);

    let (stdout, stderr, success) = run_ctxb(&config_path, &["cleanup"]);
    assert!(success, "cleanup failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Purged 0 entries older than 168h."));

    let (stdout, _, _) = run_ctxb(&config_path, &["status", "apollo", "resume"]);
    assert!(stdout.contains("READY"));
}

#[test]
fn test_invalid_key_errors() {
    let (_tmp, config_path) = setup_test_env();
    run_ctxb(&config_path, &["init"]);

    let (_, stderr, success) = run_ctxb(&config_path, &["get", "..", "resume"]);
    assert!(!success);
    assert!(stderr.contains("validation error"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_config_errors() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(
        &bad,
        "[db]\npath = \"./x.sqlite\"\n\n[models]\ndefault = \"small\"\n\n[models.categories.large]\nmax_tokens = 1000\n",
    )
    .unwrap();

    let (_, stderr, success) = run_ctxb(&bad, &["init"]);
    assert!(!success);
    assert!(
        stderr.contains("models.default 'small' is not a configured category"),
        "stderr: {}",
        stderr
    );
}

#[test]
fn test_completions_need_no_config() {
    let (stdout, _, success) =
        run_ctxb(Path::new("/nonexistent/ctxb.toml"), &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("ctxb"));
}
