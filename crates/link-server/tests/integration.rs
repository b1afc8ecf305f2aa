//! End-to-end tests: real listener, simulated backends, WebSocket client.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use link_core::RpcError;
use link_device::AdapterState;
use link_device::sim::{SimulatedBle, SimulatedBt};
use link_server::{GatewayConfig, ServerHandle, SessionManager};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const TIMEOUT: Duration = Duration::from_secs(5);
const MICROBIT_RX: &str = "5261da02-fa7e-42ab-850b-7c80220097cc";

struct Gateway {
    ble: SimulatedBle,
    bt: SimulatedBt,
    handle: ServerHandle<SimulatedBle, SimulatedBt>,
}

impl Gateway {
    async fn start() -> Self {
        Self::with_config(GatewayConfig::default()).await
    }

    async fn with_config(config: GatewayConfig) -> Self {
        let ble = SimulatedBle::demo();
        let bt = SimulatedBt::demo();
        let manager = SessionManager::new(Arc::new(ble.clone()), Arc::new(bt.clone()), config);
        let handle = link_server::start(manager).await.unwrap();
        Self { ble, bt, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.handle.addr())
    }

    async fn connect(&self, path: &str) -> Client {
        let (ws, _) = connect_async(self.url(path)).await.unwrap();
        Client {
            ws,
            next_id: 1,
            notifications: VecDeque::new(),
        }
    }
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: i64,
    notifications: VecDeque<Value>,
}

impl Client {
    async fn send_text(&mut self, text: String) {
        self.ws.send(Message::text(text)).await.unwrap();
    }

    /// Next JSON frame, or `None` once the server closed the socket.
    async fn next_json(&mut self) -> Option<Value> {
        loop {
            let frame = tokio::time::timeout(TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a frame")?;
            match frame {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(text.as_str()).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Send a Request and wait for its Response, stashing anything else.
    async fn request(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.send_text(request.to_string()).await;
        loop {
            let frame = self.next_json().await.expect("socket closed before the response");
            if frame["id"] == id {
                return frame;
            }
            self.notifications.push_back(frame);
        }
    }

    async fn result(&mut self, method: &str, params: Value) -> Value {
        let response = self.request(method, params).await;
        assert!(response.get("error").is_none(), "{method} failed: {response}");
        response.get("result").cloned().unwrap_or(Value::Null)
    }

    async fn notification(&mut self, method: &str) -> Value {
        if let Some(pos) = self.notifications.iter().position(|n| n["method"] == method) {
            if let Some(found) = self.notifications.remove(pos) {
                return found["params"].clone();
            }
        }
        loop {
            let frame = self.next_json().await.expect("socket closed before the notification");
            if frame["method"] == method {
                return frame["params"].clone();
            }
            self.notifications.push_back(frame);
        }
    }

    async fn discover_id(&mut self, params: Value, name: &str) -> String {
        let _ = self.result("discover", params).await;
        loop {
            let found = self.notification("didDiscoverPeripheral").await;
            if found["name"] == name {
                return found["peripheralId"].as_str().unwrap().to_owned();
            }
        }
    }
}

async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn get_version_on_every_path() {
    let gateway = Gateway::start().await;
    for path in ["/scratch/ble", "/scratch/bt", "/"] {
        let mut client = gateway.connect(path).await;
        assert_eq!(client.result("getVersion", json!({})).await, json!({"protocol": "1.3"}));
    }
}

#[tokio::test]
async fn unknown_path_is_a_diagnostic_session() {
    let gateway = Gateway::start().await;
    let mut client = gateway.connect("/scratch/usb").await;

    assert_eq!(client.result("echo", json!({"x": 1})).await, json!({"x": 1}));
    let response = client.request("discover", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn malformed_and_notification_frames() {
    let gateway = Gateway::start().await;
    let mut client = gateway.connect("/").await;

    client.send_text("{not json".into()).await;
    let response = client.next_json().await.unwrap();
    assert_eq!(response["error"]["code"], -32700);

    // A Notification never produces a Response, so the next frame answers id 1.
    client
        .send_text(json!({"jsonrpc": "2.0", "method": "keepalive"}).to_string())
        .await;
    let response = client.request("keepalive", json!({})).await;
    assert_eq!(response["id"], 1);
    assert!(client.notifications.is_empty());
}

#[tokio::test]
async fn ble_discover_connect_write() {
    let gateway = Gateway::start().await;
    let mut client = gateway.connect("/scratch/ble").await;

    let id = client
        .discover_id(json!({"filters": [{"services": [0xf005]}]}), "BBC micro:bit [demo]")
        .await;
    let _ = client.result("connect", json!({"peripheralId": id})).await;

    let written = client
        .result(
            "write",
            json!({"serviceId": 0xf005, "characteristicId": MICROBIT_RX, "message": "aGk=", "encoding": "base64"}),
        )
        .await;
    assert_eq!(written, 2);

    let writes = gateway.ble.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].value, b"hi");
    assert!(writes[0].with_response);

    let services = client.result("getServices", json!({})).await;
    assert_eq!(services, json!(["0000f005-0000-1000-8000-00805f9b34fb"]));
}

#[tokio::test]
async fn ble_connect_unknown_peripheral_is_invalid_request() {
    let gateway = Gateway::start().await;
    let mut client = gateway.connect("/scratch/ble").await;
    let _ = client.result("discover", json!({"filters": [{"namePrefix": "BBC"}]})).await;
    let response = client.request("connect", json!({"peripheralId": "nope"})).await;
    assert_eq!(response["error"]["code"], -32600);
    assert_eq!(gateway.ble.connect_count(), 0);
}

#[tokio::test]
async fn bt_discover_connect_send_and_close() {
    let gateway = Gateway::start().await;
    let mut client = gateway.connect("/scratch/bt").await;

    let id = client
        .discover_id(json!({"majorDeviceClass": 8, "minorDeviceClass": 1}), "EV3 [demo]")
        .await;
    let _ = client.result("connect", json!({"peripheralId": id, "pin": "1234"})).await;
    assert_eq!(gateway.bt.pairings(), vec![("00:16:53:00:00:01".to_owned(), "1234".to_owned())]);

    assert_eq!(client.result("send", json!({"message": "hello"})).await, 5);
    assert_eq!(gateway.bt.writes(), vec![b"hello".to_vec()]);

    gateway.bt.emit_data("00:16:53:00:00:01", vec![1, 2, 3]);
    let inbound = client.notification("didReceiveMessage").await;
    assert_eq!(inbound, json!({"message": "AQID", "encoding": "base64"}));

    let _ = client.result("close", json!({})).await;
    assert!(client.next_json().await.is_none());
    let bt = gateway.bt.clone();
    eventually(move || bt.channels_closed() == 1).await;
}

#[tokio::test]
async fn oversized_frame_is_rejected_without_dispatch() {
    let mut config = GatewayConfig::default();
    config.server.transport.max_message_size = 64;
    let gateway = Gateway::with_config(config).await;
    let mut client = gateway.connect("/").await;

    let padding = "x".repeat(40);
    let request = json!({"jsonrpc": "2.0", "id": 9, "method": "echo", "params": padding});
    client.send_text(request.to_string()).await;
    let response = client.next_json().await.unwrap();
    assert_eq!(response["error"]["code"], -32001);
    assert_ne!(response["id"], 9);

    assert_eq!(client.result("getVersion", json!({})).await["protocol"], "1.3");
}

#[tokio::test]
async fn connections_beyond_the_limit_get_503() {
    let mut config = GatewayConfig::default();
    config.server.max_connections = 1;
    let gateway = Gateway::with_config(config).await;

    let mut first = gateway.connect("/").await;
    let _ = first.result("keepalive", json!({})).await;

    match connect_async(gateway.url("/")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 503),
        other => panic!("expected 503, got {:?}", other.map(|_| ())),
    }

    let _ = first.result("close", json!({})).await;
    let manager = Arc::clone(gateway.handle.manager());
    eventually(move || manager.available_slots() == 1).await;
    let mut again = gateway.connect("/").await;
    let _ = again.result("keepalive", json!({})).await;
}

#[tokio::test]
async fn graceful_shutdown_releases_every_backend_once() {
    let gateway = Gateway::start().await;

    let mut ble_client = gateway.connect("/scratch/ble").await;
    let id = ble_client
        .discover_id(json!({"filters": [{"namePrefix": "BBC"}], "optionalServices": [0xf005]}), "BBC micro:bit [demo]")
        .await;
    let _ = ble_client.result("connect", json!({"peripheralId": id})).await;

    let mut bt_client = gateway.connect("/scratch/bt").await;
    let id = bt_client
        .discover_id(json!({"majorDeviceClass": 8, "minorDeviceClass": 1}), "Paired EV3 [demo]")
        .await;
    let _ = bt_client.result("connect", json!({"peripheralId": id})).await;
    assert!(gateway.bt.pairings().is_empty());

    assert_eq!(gateway.handle.manager().session_count(), 2);
    let Gateway { ble, bt, handle } = gateway;
    assert!(handle.shutdown(Some(TIMEOUT)).await);

    assert_eq!(ble.disconnect_count(), 1);
    assert_eq!(bt.channels_closed(), 1);
    assert!(ble_client.next_json().await.is_none());
    assert!(bt_client.next_json().await.is_none());
}

#[tokio::test]
async fn client_close_racing_backend_failure_releases_once() {
    let gateway = Gateway::start().await;
    let mut client = gateway.connect("/scratch/ble").await;
    let id = client
        .discover_id(json!({"filters": [{"services": [0xf005]}]}), "BBC micro:bit [demo]")
        .await;
    let _ = client.result("connect", json!({"peripheralId": id})).await;

    let sessions = gateway.handle.manager().live_sessions();
    assert_eq!(sessions.len(), 1);
    let session = Arc::clone(&sessions[0]);
    let pings: Vec<_> = (0..3)
        .map(|_| {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.send_request("ping", None).await })
        })
        .collect();
    let waiting = Arc::clone(&session);
    eventually(move || waiting.pending_requests() == 3).await;

    let ble = gateway.ble.clone();
    let (_, ()) = tokio::join!(client.ws.close(None), async move {
        ble.set_adapter_state(AdapterState::Unavailable);
    });

    for ping in pings {
        assert_eq!(ping.await.unwrap(), Err(RpcError::session_closed()));
    }
    assert!(session.is_closed());
    assert_eq!(session.pending_requests(), 0);

    let manager = Arc::clone(gateway.handle.manager());
    eventually(move || manager.session_count() == 0).await;
    assert_eq!(gateway.ble.disconnect_count(), 1);
}
