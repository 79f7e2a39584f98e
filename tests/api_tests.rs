use serde_json::{Value, json};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::sleep;

struct TestServer {
    child: Child,
    nodes_path: std::path::PathBuf,
}

impl TestServer {
    fn start(port: u16, nodes: &Value) -> Self {
        let nodes_path = std::env::temp_dir().join(format!("scriptmock_nodes_{}.json", port));
        std::fs::write(&nodes_path, nodes.to_string()).expect("Failed to write node file");

        let child = Command::new(env!("CARGO_BIN_EXE_scriptmock"))
            .arg("--port")
            .arg(port.to_string())
            .arg("--nodes")
            .arg(&nodes_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to start scriptmock server");

        Self { child, nodes_path }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_file(&self.nodes_path);
    }
}

async fn wait_for_server(base_url: &str) {
    let client = reqwest::Client::new();
    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(30);

    while start.elapsed() < timeout {
        if let Ok(res) = client
            .get(format!("{}/_admin/nodes", base_url))
            .send()
            .await
        {
            if res.status() == 200 {
                return;
            }
        }
        sleep(Duration::from_millis(200)).await;
    }
    panic!(
        "Server at {} did not become ready within {:?}",
        base_url, timeout
    );
}

#[tokio::test]
async fn test_full_node_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
    let port = 3910;
    let _server = TestServer::start(port, &json!([]));
    let base_url = format!("http://127.0.0.1:{}", port);
    wait_for_server(&base_url).await;

    let client = reqwest::Client::new();
    let node_url = format!("{}/_admin/nodes/orders", base_url);

    // 1. Unknown node
    let res = client.get(format!("{}/status", node_url)).send().await?;
    assert_eq!(res.status(), 404);

    // 2. Configure
    let config = json!({
        "port": 19184,
        "pathPattern": "/mock/orders/:id",
        "method": "GET",
        "variants": [
            {
                "id": "big",
                "order": 1,
                "conditionScript": "console.log('checking', request.params.id); return Number(request.params.id) > 100;",
                "statusCode": 200,
                "body": "{\"size\":\"big\",\"id\":\"{{params.id}}\"}",
                "contentType": "application/json"
            },
            {
                "id": "small",
                "order": 2,
                "statusCode": 200,
                "body": "{\"size\":\"small\"}",
                "contentType": "application/json"
            }
        ]
    });
    let res = client.put(&node_url).json(&config).send().await?;
    assert_eq!(res.status(), 200);
    let status: Value = res.json().await?;
    assert_eq!(status["state"], "stopped");

    // 3. Start, twice
    let res = client.post(format!("{}/start", node_url)).send().await?;
    assert_eq!(res.status(), 200);
    let status: Value = res.json().await?;
    assert_eq!(status["state"], "running");
    assert_eq!(status["port"], 19184);
    let res = client.post(format!("{}/start", node_url)).send().await?;
    assert_eq!(res.status(), 200);

    // 4. Hit the mock
    let res = client.get("http://127.0.0.1:19184/mock/orders/500").send().await?;
    assert_eq!(res.status(), 200);
    let body: Value = res.json().await?;
    assert_eq!(body, json!({ "size": "big", "id": "500" }));

    let res = client.get("http://127.0.0.1:19184/mock/orders/5?src=test").send().await?;
    let body: Value = res.json().await?;
    assert_eq!(body["size"], "small");

    // 5. Logs, with and without keyword
    let res = client.get(format!("{}/logs", node_url)).send().await?;
    let logs: Vec<Value> = res.json().await?;
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0]["matchedVariantId"], "big");
    assert_eq!(logs[0]["consoleOutput"], json!(["checking 500"]));

    let res = client
        .get(format!("{}/logs", node_url))
        .query(&[("keyword", "src=test")])
        .send()
        .await?;
    let logs: Vec<Value> = res.json().await?;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["matchedVariantId"], "small");

    // 6. Delete one entry, then clear
    let id = logs[0]["id"].as_u64().unwrap();
    let res = client.delete(format!("{}/logs/{}", node_url, id)).send().await?;
    assert_eq!(res.status(), 204);
    let res = client.delete(format!("{}/logs/{}", node_url, id)).send().await?;
    assert_eq!(res.status(), 404);

    let res = client.delete(format!("{}/logs", node_url)).send().await?;
    assert_eq!(res.status(), 204);
    let logs: Vec<Value> = client.get(format!("{}/logs", node_url)).send().await?.json().await?;
    assert!(logs.is_empty());

    // 7. Stop
    let res = client.post(format!("{}/stop", node_url)).send().await?;
    let status: Value = res.json().await?;
    assert_eq!(status["state"], "stopped");
    assert!(client.get("http://127.0.0.1:19184/mock/orders/1").send().await.is_err());

    // 8. Remove
    let res = client.delete(&node_url).send().await?;
    assert_eq!(res.status(), 204);
    let nodes: Vec<Value> = client.get(format!("{}/_admin/nodes", base_url)).send().await?.json().await?;
    assert!(nodes.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_enabled_nodes_start_at_boot_and_conflicts_surface() -> Result<(), Box<dyn std::error::Error>> {
    let port = 3911;
    let nodes = json!([
        {
            "nodeId": "boot",
            "enabled": true,
            "config": {
                "port": 19185,
                "pathPattern": "/mock/boot",
                "variants": [{ "id": "v", "order": 1, "body": "booted" }]
            }
        },
        {
            "nodeId": "clash",
            "enabled": false,
            "config": {
                "port": 19185,
                "pathPattern": "/mock/clash",
                "variants": [{ "id": "v", "order": 1, "body": "clash" }]
            }
        }
    ]);
    let _server = TestServer::start(port, &nodes);
    let base_url = format!("http://127.0.0.1:{}", port);
    wait_for_server(&base_url).await;

    let client = reqwest::Client::new();
    let res = client.get("http://127.0.0.1:19185/mock/boot").send().await?;
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await?, "booted");

    let res = client
        .post(format!("{}/_admin/nodes/clash/start", base_url))
        .send()
        .await?;
    assert_eq!(res.status(), 409);
    let err: Value = res.json().await?;
    assert_eq!(err["error"], "port_bind_error");

    let status: Value = client
        .get(format!("{}/_admin/nodes/clash/status", base_url))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(status["state"], "error");
    assert!(status["error"].is_string());

    // Invalid configuration is rejected
    let res = client
        .put(format!("{}/_admin/nodes/bad", base_url))
        .json(&json!({ "port": 19186, "pathPattern": "no-slash" }))
        .send()
        .await?;
    assert_eq!(res.status(), 400);

    let metrics = client
        .get(format!("{}/_admin/metrics", base_url))
        .send()
        .await?
        .text()
        .await?;
    assert!(metrics.contains("scriptmock_requests_total"));

    Ok(())
}
