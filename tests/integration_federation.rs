//! Federation integration tests
//!
//! Real TCP listener on an ephemeral port, tool hosts connecting to it, and
//! agent sessions over in-memory pipes, both direct and through a relay.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use toolmux::config::Config;
use toolmux::host::{FnHandler, ToolHost};
use toolmux::ipc::{ToolDefinition, ToolResult};
use toolmux::service::{Service, ServiceRole};

struct Agent {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
    session: JoinHandle<()>,
}

impl Agent {
    fn attach(service: &Arc<Service>) -> Self {
        let (ours, theirs) = tokio::io::duplex(256 * 1024);
        let (server_read, server_write) = tokio::io::split(theirs);
        let service = Arc::clone(service);
        let session = tokio::spawn(async move {
            service.serve_agent(server_read, server_write).await.unwrap();
        });
        let (read, writer) = tokio::io::split(ours);
        Self {
            lines: BufReader::new(read).lines(),
            writer,
            session,
        }
    }

    /// Send a request and return the raw response line.
    async fn request(&mut self, id: i64, method: &str, params: Value) -> String {
        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let mut line = serde_json::to_vec(&request).unwrap();
        line.push(b'\n');
        self.writer.write_all(&line).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), self.lines.next_line())
            .await
            .expect("response within deadline")
            .unwrap()
            .unwrap()
    }

    async fn call(&mut self, id: i64, name: &str, arguments: Value) -> Value {
        let raw = self
            .request(id, "tools/call", json!({"name": name, "arguments": arguments}))
            .await;
        serde_json::from_str(&raw).unwrap()
    }

    async fn close(self) {
        drop(self.writer);
        drop(self.lines);
        self.session.await.unwrap();
    }
}

fn ephemeral_config() -> Config {
    Config::default().with_overrides(Some("127.0.0.1:0".into()), None, None)
}

async fn start_primary() -> (Arc<Service>, String) {
    let service = Service::start(&ephemeral_config(), CancellationToken::new())
        .await
        .unwrap();
    let ServiceRole::Primary(addr) = service.role().clone() else {
        panic!("expected primary role");
    };
    (Arc::new(service), addr.to_string())
}

fn writer_host() -> Arc<ToolHost> {
    let host = ToolHost::new("Writer");
    host.register_tool(
        ToolDefinition::new("SaveFile", "Save a document").with_schema(json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })),
        FnHandler::new(|_: Value| async { ToolResult::success(json!({"bytesWritten": 12})) }),
    );
    host.register_tool(
        ToolDefinition::new("Hang", "Never answers"),
        FnHandler::new(|_: Value| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ToolResult::success(json!(null))
        }),
    );
    Arc::new(host)
}

/// Connect `host` to the router and wait until the router sees it.
async fn connect_host(host: Arc<ToolHost>, address: &str, primary: &Service) -> CancellationToken {
    let token = CancellationToken::new();
    {
        let token = token.clone();
        let address = address.to_string();
        tokio::spawn(async move { host.run(&address, Duration::from_millis(50), token).await });
    }
    let registry = Arc::clone(primary.router().unwrap().registry());
    for _ in 0..500 {
        if registry.connected_count() > 0 {
            return token;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("tool host did not register");
}

async fn stop(service: Arc<Service>) {
    let service = Arc::try_unwrap(service).ok().expect("sessions closed");
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_writer_save_file_round_trip() {
    let (primary, address) = start_primary().await;
    let _host = connect_host(writer_host(), &address, &primary).await;
    let mut agent = Agent::attach(&primary);

    let init: Value = serde_json::from_str(&agent.request(1, "initialize", json!({})).await).unwrap();
    assert_eq!(init["result"]["protocolVersion"], "2024-11-05");

    let list: Value = serde_json::from_str(&agent.request(2, "tools/list", json!({})).await).unwrap();
    let names: Vec<_> = list["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["Writer:Hang", "Writer:SaveFile"]);
    assert_eq!(list["result"]["tools"][1]["inputSchema"]["required"], json!(["path"]));

    let call = agent.call(3, "Writer:SaveFile", json!({"path": "a.txt"})).await;
    assert_eq!(call["id"], 3);
    assert_eq!(call["result"]["isError"], false);
    let text = call["result"]["content"][0]["text"].as_str().unwrap();
    let data: Value = serde_json::from_str(text).unwrap();
    assert_eq!(data["bytesWritten"], 12);

    agent.close().await;
    stop(primary).await;
}

#[tokio::test]
async fn test_ghost_tool_not_found() {
    let (primary, address) = start_primary().await;
    let _host = connect_host(writer_host(), &address, &primary).await;
    let mut agent = Agent::attach(&primary);

    let call = agent.call(1, "Ghost:Anything", json!({})).await;
    assert_eq!(call["result"]["isError"], true);
    assert_eq!(call["result"]["content"][0]["text"], "Tool not found: Ghost:Anything");
    assert_eq!(primary.router().unwrap().pending_count(), 0);

    agent.close().await;
    stop(primary).await;
}

#[tokio::test]
async fn test_disconnect_fails_call_promptly() {
    let (primary, address) = start_primary().await;
    let host_token = connect_host(writer_host(), &address, &primary).await;
    let mut agent = Agent::attach(&primary);

    let router = Arc::clone(primary.router().unwrap());
    let killer = tokio::spawn(async move {
        while router.pending_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        host_token.cancel();
    });

    let started = tokio::time::Instant::now();
    let call = agent.call(1, "Writer:Hang", json!({})).await;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(call["result"]["isError"], true);
    assert!(call["result"]["content"][0]["text"].as_str().unwrap().contains("disconnected"));
    killer.await.unwrap();

    let list: Value = serde_json::from_str(&agent.request(2, "tools/list", json!({})).await).unwrap();
    assert_eq!(list["result"]["tools"], json!([]));

    agent.close().await;
    stop(primary).await;
}

#[tokio::test]
async fn test_relay_is_transparent() {
    let (primary, address) = start_primary().await;
    let _host = connect_host(writer_host(), &address, &primary).await;

    let secondary_config = Config::default().with_overrides(Some(address.clone()), None, None);
    let secondary = Arc::new(
        Service::start(&secondary_config, CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(secondary.role(), &ServiceRole::Relay(address.clone()));

    let mut direct = Agent::attach(&primary);
    let mut relayed = Agent::attach(&secondary);

    let script: Vec<(i64, &str, Value)> = vec![
        (1, "initialize", json!({"protocolVersion": "2024-11-05"})),
        (2, "tools/list", json!({})),
        (3, "tools/call", json!({"name": "Writer:SaveFile", "arguments": {"path": "a.txt"}})),
        (4, "tools/call", json!({"name": "Ghost:Anything", "arguments": {}})),
        (5, "resources/list", json!({})),
    ];
    for (id, method, params) in script {
        let a = direct.request(id, method, params.clone()).await;
        let b = relayed.request(id, method, params).await;
        assert_eq!(a, b, "responses differ for {}", method);
    }

    relayed.close().await;
    direct.close().await;
    stop(secondary).await;
    stop(primary).await;
}

#[tokio::test]
async fn test_reconnected_host_reregisters() {
    let (primary, address) = start_primary().await;
    let host = writer_host();
    let token = connect_host(Arc::clone(&host), &address, &primary).await;
    token.cancel();

    let registry = Arc::clone(primary.router().unwrap().registry());
    while registry.connected_count() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let _again = connect_host(host, &address, &primary).await;
    let apps = registry.applications();
    assert_eq!(apps.len(), 2);
    assert_eq!(apps.iter().filter(|a| a.is_connected()).count(), 1);
    assert_ne!(apps[0].connection_id, apps[1].connection_id);

    stop(primary).await;
}
