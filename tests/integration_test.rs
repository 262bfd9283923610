use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use tempfile::TempDir;
use test_bin::get_test_bin;
use tokio::process::{Child, Command};

fn wait_for<F>(mut predicate: F, timeout: Duration) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if predicate() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    bail!("timeout after {:?}", timeout)
}

async fn wait_for_async<F, Fut>(mut predicate: F, timeout: Duration) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if predicate().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("timeout after {:?}", timeout)
}

// Ports are handed out sequentially so that tests in this file (which all run
// in the same process, possibly concurrently) never fight over a bind address.
static NEXT_PORT: AtomicU16 = AtomicU16::new(46100);

fn claim_port_pair() -> (u16, u16) {
    let base = NEXT_PORT.fetch_add(2, Ordering::SeqCst);
    (base, base + 1)
}

// A running instance of the ct-server binary, torn down (SIGKILL via
// kill_on_drop) when dropped.
struct ServerChild {
    _root: TempDir,
    child: Child,
    port: u16,
}

impl ServerChild {
    async fn spawn(extra_args: &[&str]) -> anyhow::Result<Self> {
        let root = TempDir::new()?;
        let (port, quick_port) = claim_port_pair();

        let mut cmd: Command = get_test_bin("ct-server").into();
        cmd.args([
            "--root",
            root.path().to_str().unwrap(),
            "--port",
            &port.to_string(),
            "--quick-port",
            &quick_port.to_string(),
            "--local-count",
            "0",
            "--no-snapshot",
        ])
        .args(extra_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

        let child = cmd.spawn().context("spawning ct-server")?;
        let server = Self { _root: root, child, port };

        wait_for_async(|| server.is_listening(), Duration::from_secs(5))
            .await
            .context("ct-server never started listening")?;
        Ok(server)
    }

    async fn is_listening(&self) -> bool {
        reqwest::get(self.url("/healthz")).await.map(|r| r.status().is_success()).unwrap_or(false)
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    async fn get_json(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let resp = reqwest::get(self.url(path)).await.context("request failed")?;
        anyhow::ensure!(resp.status().is_success(), "unexpected status: {}", resp.status());
        Ok(resp.json().await.context("parsing response body")?)
    }
}

impl Drop for ServerChild {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

#[tokio::test]
async fn empty_server_next_test_returns_literal_empty_dispatch() {
    let server = ServerChild::spawn(&[]).await.unwrap();
    let body = server.get_json("/aquaserver/next-test?old=false").await.unwrap();
    assert_eq!(body["snapshotName"], serde_json::Value::Null);
    assert_eq!(body["test"], serde_json::Value::Null);
    assert_eq!(body["url"], "no-test.html");
}

#[tokio::test]
async fn status_endpoint_reports_running_and_startup_timestamp() {
    let server = ServerChild::spawn(&[]).await.unwrap();
    let body = server.get_json("/aquaserver/status").await.unwrap();
    assert!(body["startupTimestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn report_endpoint_serves_empty_report_before_any_snapshot() {
    let server = ServerChild::spawn(&[]).await.unwrap();
    let body = server.get_json("/aquaserver/report").await.unwrap();
    assert_eq!(body["snapshotNames"], serde_json::json!([]));
    assert_eq!(body["testNames"], serde_json::json!([]));
}

#[tokio::test]
async fn quickserver_status_is_served_even_with_no_cycle_run_yet() {
    let server = ServerChild::spawn(&[]).await.unwrap();
    let body = server.get_json("/quickserver/status").await.unwrap();
    assert_eq!(body["tests"], serde_json::json!({}));
}

#[tokio::test]
async fn malformed_test_result_keeps_server_alive_and_is_reflected_in_status() {
    let server = ServerChild::spawn(&[]).await.unwrap();
    let client = reqwest::Client::new();
    let resp = client
        .post(server.url("/aquaserver/test-result"))
        .header("content-type", "application/json")
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    // The process is still up and reporting its own error rather than having
    // crashed the connection or the server loop.
    let status = server.get_json("/aquaserver/status").await.unwrap();
    assert!(status["lastErrorString"].as_str().unwrap().contains("test-result"));
}

#[tokio::test]
async fn server_stays_reachable_for_the_lifetime_of_the_test() {
    let server = ServerChild::spawn(&[]).await.unwrap();
    wait_for(|| server.child.id().is_some(), Duration::from_secs(1)).unwrap();
    let healthz = reqwest::get(server.url("/healthz")).await.unwrap();
    assert!(healthz.status().is_success());
}
