//! End-to-end tests for ssr-bridge-server.
//!
//! These tests run a real server on an ephemeral port and talk to it over
//! HTTP:
//! - Streaming of chunks as the render produces them
//! - Client disconnect cancelling the render
//! - Admin API control of in-flight renders

use std::time::Duration;

use tempfile::TempDir;

use ssr_bridge_common::{BridgeConfig, WorkerConfig};
use ssr_bridge_server::{AdminRouterConfig, BridgeServer, TestHandle};

// ============================================================================
// Helpers
// ============================================================================

const TOKEN: &str = "e2e-token";

/// Streams `tick-N` chunks every 20ms until cancelled, recording the cancel.
const TICKER: &str = r"
globalThis.cancelled = 'no';

export default (request) => {
  if (request.url.endsWith('/plain')) {
    return new Response('plain body', { headers: { 'content-type': 'text/plain' } });
  }

  const limit = request.url.endsWith('/three') ? 3 : Infinity;
  let n = 0;
  const body = new ReadableStream({
    pull(controller) {
      return new Promise((resolve) => {
        setTimeout(() => {
          n += 1;
          controller.enqueue('tick-' + n + ';');
          if (n >= limit) controller.close();
          resolve();
        }, 20);
      });
    },
    cancel(reason) {
      globalThis.cancelled = String(reason);
    },
  });
  return new Response(body, { headers: { 'content-type': 'text/plain' } });
};
";

async fn start() -> (TempDir, TestHandle) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.js"), TICKER).unwrap();
    let config = BridgeConfig {
        worker: WorkerConfig {
            entry_module: "./index.js".to_string(),
            ..WorkerConfig::for_root(dir.path())
        },
        ..Default::default()
    };

    let server = BridgeServer::start_test_with_admin(
        &config,
        Some(AdminRouterConfig {
            prefix: "/admin".to_string(),
            token: TOKEN.to_string(),
        }),
    )
    .await
    .unwrap();
    (dir, server)
}

async fn cancelled_reason(server: &TestHandle) -> String {
    server
        .state()
        .worker()
        .run(|cx| cx.engine().eval_to_string("globalThis.cancelled"))
        .await
        .unwrap()
        .unwrap()
}

async fn wait_until_cancelled(server: &TestHandle) -> String {
    for _ in 0..100 {
        let reason = cancelled_reason(server).await;
        if reason != "no" {
            return reason;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("render was never cancelled");
}

// ============================================================================
// Test: Streaming
// ============================================================================

#[tokio::test]
async fn test_plain_render() {
    let (_dir, server) = start().await;

    let response = reqwest::get(format!("{}/plain", server.url())).await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.text().await.unwrap(), "plain body");

    server.shutdown().await;
}

#[tokio::test]
async fn test_streams_chunks() {
    let (_dir, server) = start().await;

    let mut response = reqwest::get(format!("{}/three", server.url())).await.unwrap();
    assert_eq!(response.status(), 200);

    let mut body = String::new();
    let mut chunks = 0;
    while let Some(chunk) = response.chunk().await.unwrap() {
        body.push_str(std::str::from_utf8(&chunk).unwrap());
        chunks += 1;
    }

    assert_eq!(body, "tick-1;tick-2;tick-3;");
    assert!(chunks >= 1);
    assert!(server.state().list_renders().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_server_without_admin() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.js"), TICKER).unwrap();
    let config = BridgeConfig {
        worker: WorkerConfig {
            entry_module: "./index.js".to_string(),
            ..WorkerConfig::for_root(dir.path())
        },
        ..Default::default()
    };
    let server = BridgeServer::start_test(&config).await.unwrap();

    let health = reqwest::get(format!("{}/health", server.url())).await.unwrap();
    assert_eq!(health.status(), 200);

    let page = reqwest::get(format!("{}/plain", server.url())).await.unwrap();
    assert_eq!(page.text().await.unwrap(), "plain body");

    server.shutdown().await;
}

// ============================================================================
// Test: Cancellation
// ============================================================================

#[tokio::test]
async fn test_client_disconnect_cancels_render() {
    let (_dir, server) = start().await;

    let mut response = reqwest::get(format!("{}/forever", server.url())).await.unwrap();
    let first = response.chunk().await.unwrap().unwrap();
    assert!(first.starts_with(b"tick-1;"));
    drop(response);

    assert_eq!(wait_until_cancelled(&server).await, "request cancelled");
    assert_eq!(server.state().worker().buffer_pool().outstanding(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_admin_cancels_in_flight_render() {
    let (_dir, server) = start().await;
    let client = reqwest::Client::new();

    let mut response = client
        .get(format!("{}/forever", server.url()))
        .header("x-request-id", "long-render")
        .send()
        .await
        .unwrap();
    response.chunk().await.unwrap().unwrap();

    let renders: serde_json::Value = client
        .get(format!("{}/admin/renders", server.url()))
        .header("X-Admin-Token", TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(renders["count"], 1);
    assert_eq!(renders["renders"][0]["id"], "long-render");

    let cancelled = client
        .delete(format!("{}/admin/renders/long-render", server.url()))
        .header("X-Admin-Token", TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(cancelled.status(), 200);

    // The body ends once the render stops.
    while response.chunk().await.unwrap_or(None).is_some() {}

    assert_eq!(wait_until_cancelled(&server).await, "request cancelled");

    server.shutdown().await;
}
