//! HTTP API tests: a real server over SQLite and a filesystem corpus.

use context_bundler::config::{load_config, Config};
use context_bundler::server::run_server;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

// ─── Helpers ────────────────────────────────────────────────────────

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Three resumes for `apollo`: alice (100 tokens, agency and rust match),
/// bob (200 tokens) and carol (1000 tokens, larger than the small budget).
fn write_corpus(root: &Path) {
    write(root, "apollo/resume/alice.md", &"a".repeat(400));
    write(
        root,
        "apollo/resume/alice.md.meta.toml",
        "agency_match = true\ntechnologies = [\"rust\"]\ndate = 2024-01-01\n",
    );
    write(root, "apollo/resume/bob.md", &"b".repeat(800));
    write(root, "apollo/resume/bob.md.meta.toml", "date = 2024-01-01\n");
    write(root, "apollo/resume/carol.md", &"c".repeat(4000));
    write(root, "apollo/resume/carol.md.meta.toml", "date = \"2024-01-01\"\n");
}

fn test_config(tmp: &TempDir, port: u16) -> Config {
    let root = tmp.path();
    write_corpus(&root.join("corpus"));

    let config_content = format!(
        r#"[db]
path = "{root}/data/ctxb.sqlite"

[documents]
root = "{root}/corpus"

[cache]
debounce_ms = 100
build_timeout_secs = 10

[models]
default = "small"

[models.categories.small]
max_tokens = 1000

[models.categories.large]
max_tokens = 100000

[scoring]
technologies = ["rust"]

[server]
bind = "127.0.0.1:{port}"
"#,
        root = root.display(),
        port = port
    );
    let path = root.join("ctxb.toml");
    fs::write(&path, config_content).unwrap();
    load_config(&path).unwrap()
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

struct TestServer {
    _tmp: TempDir,
    base: String,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let port = find_free_port();
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(&tmp, port);

        let handle = tokio::spawn(async move {
            run_server(&cfg).await.ok();
        });
        wait_for_server(port).await;

        Self {
            _tmp: tmp,
            base: format!("http://127.0.0.1:{}", port),
            client: reqwest::Client::new(),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn delete(&self, path: &str) -> (u16, Value) {
        let resp = self.client.delete(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    /// Polls the status endpoint until the build leaves PENDING/BUILDING.
    async fn wait_settled(&self, path: &str) -> Value {
        for _ in 0..100 {
            let (_, body) = self.get(&format!("{}/status", path)).await;
            let status = body["status"].as_str().unwrap().to_string();
            if status != "PENDING" && status != "BUILDING" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("build for {} did not settle", path);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn ids(value: &Value) -> Vec<String> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_reports_version() {
    let server = TestServer::start().await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_get_context_builds_then_serves_bundle() {
    let server = TestServer::start().await;

    let (status, body) = server.get("/context/apollo/resume").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "PENDING");
    assert!(body.get("bundle").is_none());

    let settled = server.wait_settled("/context/apollo/resume").await;
    assert_eq!(settled["status"], "READY");
    assert_eq!(settled["meta"]["model_category"], "small");
    assert_eq!(settled["meta"]["token_budget"], 600);
    assert_eq!(ids(&settled["meta"]["oversized_ids"]), vec!["carol.md"]);

    let (status, body) = server.get("/context/apollo/resume").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "READY");
    let bundle = &body["bundle"];
    assert_eq!(ids(&bundle["included_ids"]), vec!["alice.md", "bob.md"]);
    assert_eq!(ids(&bundle["excluded_ids"]), vec!["carol.md"]);
    assert_eq!(bundle["total_tokens"], 300);
    assert_eq!(bundle["chunks"][0]["document_id"], "alice.md");

    // A second read is served from the cache unchanged
    let (_, again) = server.get("/context/apollo/resume").await;
    assert_eq!(again, body);
}

#[tokio::test]
async fn test_immediate_build_returns_summary() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post("/context/apollo/resume/build", json!({ "immediate": true }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "READY");
    assert_eq!(body["scheduled"], false);
    assert_eq!(body["build"]["total_tokens"], 300);
    assert_eq!(ids(&body["build"]["included_ids"]), vec!["alice.md", "bob.md"]);
}

#[tokio::test]
async fn test_debounced_build_and_cancel() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post("/context/apollo/past_performance/build", json!({}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["scheduled"], true);

    let (status, body) = server
        .post("/context/apollo/past_performance/cancel", json!({}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["cancelled"], true);

    let (_, status_body) = server.get("/context/apollo/past_performance/status").await;
    assert_eq!(status_body["status"], "NONE");
    assert_eq!(status_body["timer_pending"], false);

    // Left alone, the debounce elapses and the build runs
    server
        .post("/context/apollo/resume/build", json!({}))
        .await;
    let settled = server.wait_settled("/context/apollo/resume").await;
    assert_eq!(settled["status"], "READY");
}

#[tokio::test]
async fn test_overflow_report_and_selection() {
    let server = TestServer::start().await;

    let (status, report) = server.get("/context/apollo/resume/overflow").await;
    assert_eq!(status, 200);
    assert_eq!(report["model_category"], "small");
    assert_eq!(report["will_overflow"], true);
    assert_eq!(report["total_tokens"], 1300);
    assert_eq!(report["max_context_tokens"], 600);
    assert_eq!(ids(&report["included_ids"]), vec!["alice.md", "bob.md"]);
    assert_eq!(ids(&report["excluded_ids"]), vec!["carol.md"]);
    assert_eq!(ids(&report["oversized_ids"]), vec!["carol.md"]);
    assert_eq!(report["documents"][0]["rank"], 1);

    let (_, large) = server
        .get("/context/apollo/resume/overflow?model=large")
        .await;
    assert_eq!(large["will_overflow"], false);

    let (status, bundle) = server
        .post(
            "/context/apollo/resume/selection",
            json!({ "ids": ["bob.md", "alice.md"] }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(ids(&bundle["included_ids"]), vec!["alice.md", "bob.md"]);
    assert_eq!(bundle["total_tokens"], 300);

    let (_, status_body) = server.get("/context/apollo/resume/status").await;
    assert_eq!(status_body["status"], "READY");
    assert_eq!(status_body["meta"]["is_override"], true);

    let (_, served) = server.get("/context/apollo/resume").await;
    assert_eq!(served["status"], "READY");
    assert_eq!(served["bundle"]["included_ids"], bundle["included_ids"]);
    assert_eq!(served["bundle"]["built_at"], bundle["built_at"]);
}

#[tokio::test]
async fn test_clear_then_read_rebuilds() {
    let server = TestServer::start().await;
    server
        .post("/context/apollo/resume/build", json!({ "immediate": true }))
        .await;

    let (status, body) = server.delete("/context/apollo/resume").await;
    assert_eq!(status, 200);
    assert_eq!(body["cleared"], true);

    let (_, status_body) = server.get("/context/apollo/resume/status").await;
    assert_eq!(status_body["status"], "FAILED");
    assert_eq!(status_body["failure_cause"], "cleared");

    let (_, body) = server.get("/context/apollo/resume").await;
    assert_eq!(body["status"], "PENDING");
    let settled = server.wait_settled("/context/apollo/resume").await;
    assert_eq!(settled["status"], "READY");
}

#[tokio::test]
async fn test_cleanup_endpoint() {
    let server = TestServer::start().await;
    server
        .post("/context/apollo/resume/build", json!({ "immediate": true }))
        .await;

    // Fresh entries survive the default age
    let (status, body) = server.post("/cleanup", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["purged"], 0);

    let (_, body) = server.post("/cleanup", json!({ "max_age_hours": 1 })).await;
    assert_eq!(body["purged"], 0);
    let (_, status_body) = server.get("/context/apollo/resume/status").await;
    assert_eq!(status_body["status"], "READY");
}

#[tokio::test]
async fn test_error_contract() {
    let server = TestServer::start().await;

    let (status, body) = server.get("/context/%20/resume").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("project"));

    let (status, body) = server
        .get("/context/apollo/resume/overflow?model=huge")
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = server
        .post("/context/apollo/resume/selection", json!({ "ids": [] }))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = server
        .post(
            "/context/apollo/resume/selection",
            json!({ "ids": ["nobody.md"] }),
        )
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, body) = server
        .post(
            "/context/gemini/resume/selection",
            json!({ "ids": ["alice.md"] }),
        )
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");
}
