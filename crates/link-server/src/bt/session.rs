//! Bluetooth Classic (RFCOMM) session state machine.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use link_core::encoding::{EncodedMessage, MessageEncoding, decode_message};
use link_core::{PeripheralId, RpcError};
use link_device::{AdapterState, BackendError, BtBackend, BtChannel, BtChannelEvent, BtInquiryResult, wait_settled};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BtSessionConfig;
use crate::rpc::MethodRegistry;
use crate::session::{DeviceSession, Session};

type Inquiry<B> = BtInquiryResult<<B as BtBackend>::Device, <B as BtBackend>::DeviceId>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Discovering,
    Connecting,
    Connected,
    Closed,
}

struct Discovered<D> {
    device: D,
    paired: bool,
}

/// A buffer queued for the channel writer.
struct WriteJob {
    data: Vec<u8>,
    reply: oneshot::Sender<Result<usize, BackendError>>,
}

struct BtState<B: BtBackend> {
    phase: Phase,
    discovered: HashMap<PeripheralId, Discovered<B::Device>>,
    ids: HashMap<B::DeviceId, PeripheralId>,
    inquiry: Option<B::Inquiry>,
    channel: Option<Arc<B::Channel>>,
    writer: Option<mpsc::UnboundedSender<WriteJob>>,
    generation: u64,
}

impl<B: BtBackend> BtState<B> {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            discovered: HashMap::new(),
            ids: HashMap::new(),
            inquiry: None,
            channel: None,
            writer: None,
            generation: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscoverParams {
    major_device_class: u32,
    minor_device_class: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    peripheral_id: PeripheralId,
    #[serde(default)]
    pin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendParams {
    message: String,
    #[serde(default)]
    encoding: Option<MessageEncoding>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiscoveredDevice {
    peripheral_id: PeripheralId,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rssi: Option<i16>,
}

/// Device half of a `/scratch/bt` session, over any [`BtBackend`].
///
/// Writes to the open channel go through a single writer task, so
/// concurrent `send` calls reach the backend one whole buffer at a time, in
/// the order they were issued.
pub struct BtSession<B: BtBackend> {
    backend: Arc<B>,
    session: Arc<Session>,
    config: BtSessionConfig,
    state: Mutex<BtState<B>>,
    inquiries: mpsc::UnboundedSender<Inquiry<B>>,
    channel_events: mpsc::UnboundedSender<BtChannelEvent>,
}

impl<B: BtBackend> BtSession<B> {
    /// Create the session and start its event pump. The pump stops when
    /// `session` closes.
    pub fn start(backend: Arc<B>, session: Arc<Session>, config: BtSessionConfig) -> Arc<Self> {
        let (inquiry_tx, inquiry_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let adapter = backend.adapter_state();
        let this = Arc::new(Self {
            backend,
            session,
            config,
            state: Mutex::new(BtState::new()),
            inquiries: inquiry_tx,
            channel_events: event_tx,
        });
        let _ = tokio::spawn(Arc::clone(&this).pump(inquiry_rx, event_rx, adapter));
        this
    }

    async fn pump(
        self: Arc<Self>,
        mut inquiries: mpsc::UnboundedReceiver<Inquiry<B>>,
        mut events: mpsc::UnboundedReceiver<BtChannelEvent>,
        mut adapter: watch::Receiver<AdapterState>,
    ) {
        let cancel = self.session.cancellation();
        let mut adapter_live = true;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(event) = events.recv() => self.on_channel_event(event),
                Some(found) = inquiries.recv() => self.on_inquiry(found),
                changed = adapter.changed(), if adapter_live => match changed {
                    Ok(()) => {
                        let state = *adapter.borrow_and_update();
                        self.on_adapter(state);
                    }
                    Err(_) => adapter_live = false,
                },
            }
        }
        debug!(session_id = %self.session.id(), "bt pump stopped");
    }

    fn on_inquiry(&self, found: Inquiry<B>) {
        let report = {
            let mut state = self.state.lock();
            if state.phase != Phase::Discovering {
                return;
            }
            let id = state
                .ids
                .entry(found.device_id)
                .or_insert_with(PeripheralId::generate)
                .clone();
            let _ = state.discovered.insert(
                id.clone(),
                Discovered {
                    device: found.device,
                    paired: found.paired,
                },
            );
            DiscoveredDevice {
                peripheral_id: id,
                name: found.name.unwrap_or_default(),
                rssi: found.rssi,
            }
        };
        let _ = self.session.send_notification("didDiscoverPeripheral", report);
    }

    fn on_channel_event(&self, event: BtChannelEvent) {
        match event {
            BtChannelEvent::Data(data) => {
                let _ = self
                    .session
                    .send_notification("didReceiveMessage", EncodedMessage::base64(&data));
            }
            BtChannelEvent::Closed { reason } => {
                if self.state.lock().phase == Phase::Connected {
                    self.fail(&RpcError::application(format!("RFCOMM channel closed: {reason}")));
                }
            }
        }
    }

    fn on_adapter(&self, adapter: AdapterState) {
        if adapter != AdapterState::Unavailable {
            return;
        }
        let phase = self.state.lock().phase;
        if !matches!(phase, Phase::Idle | Phase::Closed) {
            self.fail(&RpcError::application("Bluetooth adapter became unavailable"));
        }
    }

    fn fail(&self, error: &RpcError) {
        warn!(session_id = %self.session.id(), error = %error, "bt session failed");
        let _ = self.session.send_error(error);
        let _ = self.session.close("bt backend failure");
    }

    async fn discover(&self, params: DiscoverParams) -> Result<Value, RpcError> {
        match self.state.lock().phase {
            Phase::Idle | Phase::Discovering => {}
            Phase::Connecting | Phase::Connected => {
                return Err(RpcError::invalid_request("cannot discover while connected"));
            }
            Phase::Closed => return Err(RpcError::invalid_request("session is closed")),
        }
        match wait_settled(self.backend.adapter_state(), self.config.adapter_settle_timeout).await {
            None => return Err(RpcError::timeout("Bluetooth adapter did not settle")),
            Some(AdapterState::Available) => {}
            Some(_) => return Err(RpcError::application("Bluetooth is unavailable")),
        }

        let (generation, previous) = {
            let mut state = self.state.lock();
            if !matches!(state.phase, Phase::Idle | Phase::Discovering) {
                return Err(RpcError::invalid_request("cannot discover while connected"));
            }
            state.phase = Phase::Discovering;
            state.discovered.clear();
            state.generation += 1;
            (state.generation, state.inquiry.take())
        };
        drop(previous);

        let started = self
            .backend
            .start_inquiry(params.major_device_class, params.minor_device_class, self.inquiries.clone())
            .await;
        let mut state = self.state.lock();
        let current = state.generation == generation && state.phase == Phase::Discovering;
        match started {
            Ok(inquiry) => {
                if current {
                    state.inquiry = Some(inquiry);
                }
                info!(
                    session_id = %self.session.id(),
                    major = params.major_device_class,
                    minor = params.minor_device_class,
                    "bt inquiry started"
                );
                Ok(Value::Null)
            }
            Err(e) => {
                if current {
                    state.phase = Phase::Idle;
                }
                Err(e.into())
            }
        }
    }

    async fn connect(&self, params: ConnectParams) -> Result<Value, RpcError> {
        let id = params.peripheral_id;
        let (device, paired, inquiry) = {
            let mut state = self.state.lock();
            let Some(found) = state.discovered.get(&id) else {
                return Err(RpcError::invalid_request(format!("unknown peripheral id: {id}")));
            };
            let (device, paired) = (found.device.clone(), found.paired);
            if state.phase != Phase::Discovering {
                return Err(RpcError::invalid_request("connect requires an active discovery"));
            }
            state.phase = Phase::Connecting;
            (device, paired, state.inquiry.take())
        };
        drop(inquiry);

        match self.pair_and_open(&id, &device, paired, params.pin).await {
            Ok(channel) => {
                let channel = Arc::new(channel);
                {
                    let mut state = self.state.lock();
                    if state.phase == Phase::Connecting && !self.session.is_closed() {
                        let (tx, rx) = mpsc::unbounded_channel();
                        let _ = tokio::spawn(write_loop(Arc::clone(&channel), rx, self.session.cancellation()));
                        state.phase = Phase::Connected;
                        state.channel = Some(channel);
                        state.writer = Some(tx);
                        info!(session_id = %self.session.id(), peripheral_id = %id, "rfcomm channel open");
                        return Ok(Value::Null);
                    }
                }
                let _ = tokio::spawn(async move { channel.close().await });
                Err(RpcError::session_closed())
            }
            Err(e) => {
                let mut state = self.state.lock();
                if state.phase == Phase::Connecting {
                    state.phase = Phase::Discovering;
                }
                debug!(session_id = %self.session.id(), peripheral_id = %id, error = %e, "bt connect failed");
                Err(e.into())
            }
        }
    }

    async fn pair_and_open(
        &self,
        id: &PeripheralId,
        device: &B::Device,
        paired: bool,
        pin: Option<String>,
    ) -> Result<B::Channel, BackendError> {
        if !paired {
            let pin = pin.unwrap_or_else(|| self.config.default_pin.clone());
            self.backend.pair(device, &pin).await?;
            if let Some(found) = self.state.lock().discovered.get_mut(id) {
                found.paired = true;
            }
            debug!(session_id = %self.session.id(), peripheral_id = %id, "paired");
        }
        self.backend.open_channel(device, self.channel_events.clone()).await
    }

    /// Queue `params.message` on the writer. The job is queued before the
    /// first suspension point, which fixes the write order.
    async fn send(&self, params: SendParams) -> Result<usize, RpcError> {
        let reply = {
            let state = self.state.lock();
            let (Phase::Connected, Some(writer)) = (state.phase, state.writer.as_ref()) else {
                return Err(RpcError::invalid_request("no device connected"));
            };
            let data = decode_message(&params.message, params.encoding)?;
            let (reply, rx) = oneshot::channel();
            writer
                .send(WriteJob { data, reply })
                .map_err(|_| RpcError::invalid_request("no device connected"))?;
            rx
        };
        match reply.await {
            Ok(written) => Ok(written?),
            Err(_) => Err(RpcError::session_closed()),
        }
    }
}

async fn write_loop<C: BtChannel>(channel: Arc<C>, mut jobs: mpsc::UnboundedReceiver<WriteJob>, cancel: CancellationToken) {
    loop {
        let job = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let written = channel.write(&job.data).await;
        let _ = job.reply.send(written);
    }
}

#[async_trait]
impl<B: BtBackend> DeviceSession for BtSession<B> {
    fn register_methods(self: Arc<Self>, registry: &mut MethodRegistry) {
        registry.register_bound("discover", &self, |this, p: DiscoverParams| async move { this.discover(p).await });
        registry.register_bound("connect", &self, |this, p: ConnectParams| async move { this.connect(p).await });
        registry.register_bound("send", &self, |this, p: SendParams| async move { this.send(p).await });
    }

    async fn shutdown(&self) {
        let (channel, writer, inquiry) = {
            let mut state = self.state.lock();
            state.phase = Phase::Closed;
            state.discovered.clear();
            (state.channel.take(), state.writer.take(), state.inquiry.take())
        };
        drop(writer);
        drop(inquiry);
        if let Some(channel) = channel {
            channel.close().await;
            info!(session_id = %self.session.id(), "rfcomm channel released");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::{SessionKind, register_builtin_methods};
    use assert_matches::assert_matches;
    use link_core::SessionId;
    use link_device::sim::{SimBtDevice, SimulatedBt};
    use serde_json::json;

    const EV3: &str = "00:16:53:00:00:01";
    const PAIRED_EV3: &str = "00:16:53:00:00:02";

    struct Harness {
        sim: SimulatedBt,
        session: Arc<Session>,
        rx: mpsc::Receiver<String>,
        registry: Arc<MethodRegistry>,
        bt: Arc<BtSession<SimulatedBt>>,
    }

    impl Harness {
        fn new(sim: SimulatedBt) -> Self {
            let (session, rx) = Session::new(SessionId::generate(), SessionKind::Bt, 64);
            let bt = BtSession::start(Arc::new(sim.clone()), Arc::clone(&session), BtSessionConfig::default());
            let mut registry = MethodRegistry::new();
            register_builtin_methods(&mut registry);
            Arc::clone(&bt).register_methods(&mut registry);
            Self {
                sim,
                session,
                rx,
                registry: Arc::new(registry),
                bt,
            }
        }

        async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
            self.registry.call(method, Some(params), &self.session).await
        }

        async fn next_frame(&mut self) -> Value {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("queue closed");
            serde_json::from_str(&frame).unwrap()
        }

        async fn next_notification(&mut self, method: &str) -> Value {
            loop {
                let frame = self.next_frame().await;
                if frame["method"] == method {
                    return frame["params"].clone();
                }
            }
        }

        async fn discover_id(&mut self, name: &str) -> String {
            self.call("discover", json!({"majorDeviceClass": 8, "minorDeviceClass": 1}))
                .await
                .unwrap();
            loop {
                let found = self.next_notification("didDiscoverPeripheral").await;
                if found["name"] == name {
                    return found["peripheralId"].as_str().unwrap().to_owned();
                }
            }
        }

        async fn connect(&mut self, name: &str, params: Value) {
            let id = self.discover_id(name).await;
            let mut params = params;
            params["peripheralId"] = json!(id);
            self.call("connect", params).await.unwrap();
        }
    }

    #[tokio::test]
    async fn discover_requires_both_classes() {
        let h = Harness::new(SimulatedBt::demo());
        let err = h.call("discover", json!({"majorDeviceClass": 8})).await.unwrap_err();
        assert_matches!(err, RpcError::InvalidParams { .. });
        let err = h.call("discover", json!({"minorDeviceClass": 1})).await.unwrap_err();
        assert_matches!(err, RpcError::InvalidParams { .. });
        let err = h
            .call("discover", json!({"majorDeviceClass": "robot", "minorDeviceClass": 1}))
            .await
            .unwrap_err();
        assert_matches!(err, RpcError::InvalidParams { .. });
    }

    #[tokio::test]
    async fn inquiry_reports_only_the_requested_class() {
        let mut h = Harness::new(SimulatedBt::demo());
        h.call("discover", json!({"majorDeviceClass": 4, "minorDeviceClass": 1}))
            .await
            .unwrap();
        let found = h.next_notification("didDiscoverPeripheral").await;
        assert_eq!(found["name"], "Headset [demo]");
        assert_eq!(found["rssi"], -55);
    }

    #[tokio::test]
    async fn ids_are_stable_across_rediscovery() {
        let mut h = Harness::new(SimulatedBt::demo());
        let first = h.discover_id("EV3 [demo]").await;
        let second = h.discover_id("EV3 [demo]").await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unpaired_device_is_paired_with_supplied_or_default_pin() {
        let mut h = Harness::new(SimulatedBt::demo());
        h.connect("EV3 [demo]", json!({"pin": "1234"})).await;
        assert_eq!(h.sim.pairings(), vec![(EV3.to_owned(), "1234".to_owned())]);
        assert_eq!(h.sim.channels_opened(), 1);

        let mut h = Harness::new(SimulatedBt::demo());
        h.connect("EV3 [demo]", json!({})).await;
        assert_eq!(h.sim.pairings(), vec![(EV3.to_owned(), "0000".to_owned())]);
    }

    #[tokio::test]
    async fn paired_device_skips_pairing() {
        let mut h = Harness::new(SimulatedBt::demo());
        h.connect("Paired EV3 [demo]", json!({})).await;
        assert!(h.sim.pairings().is_empty());
        assert_eq!(h.sim.channels_opened(), 1);
    }

    #[tokio::test]
    async fn unknown_peripheral_is_invalid_request() {
        let mut h = Harness::new(SimulatedBt::demo());
        let _ = h.discover_id("EV3 [demo]").await;
        let err = h.call("connect", json!({"peripheralId": "nope"})).await.unwrap_err();
        assert_matches!(err, RpcError::InvalidRequest { .. });
        assert_eq!(h.sim.channels_opened(), 0);
    }

    #[tokio::test]
    async fn pairing_failure_is_application_error_and_retryable() {
        let mut h = Harness::new(SimulatedBt::demo());
        let id = h.discover_id("EV3 [demo]").await;
        h.sim.fail_next_pair(BackendError::Pairing("wrong pin".into()));
        let err = h.call("connect", json!({"peripheralId": id})).await.unwrap_err();
        assert_matches!(err, RpcError::Application { ref message, .. } if message.contains("wrong pin"));
        assert!(!h.session.is_closed());
        h.call("connect", json!({"peripheralId": id})).await.unwrap();
    }

    #[tokio::test]
    async fn channel_failure_is_application_error() {
        let mut h = Harness::new(SimulatedBt::demo());
        let id = h.discover_id("Paired EV3 [demo]").await;
        h.sim.fail_next_channel(BackendError::Channel("refused".into()));
        let err = h.call("connect", json!({"peripheralId": id})).await.unwrap_err();
        assert_matches!(err, RpcError::Application { .. });
    }

    #[tokio::test]
    async fn send_before_connect_is_invalid_request() {
        let h = Harness::new(SimulatedBt::demo());
        let err = h.call("send", json!({"message": "hi"})).await.unwrap_err();
        assert_matches!(err, RpcError::InvalidRequest { .. });
    }

    #[tokio::test]
    async fn send_returns_bytes_written() {
        let mut h = Harness::new(SimulatedBt::demo());
        h.connect("Paired EV3 [demo]", json!({})).await;
        let written = h.call("send", json!({"message": "AQID", "encoding": "base64"})).await.unwrap();
        assert_eq!(written, 3);
        let written = h.call("send", json!({"message": "héllo"})).await.unwrap();
        assert_eq!(written, 6);
        assert_eq!(h.sim.writes(), vec![vec![1, 2, 3], "héllo".as_bytes().to_vec()]);
        let err = h.call("send", json!({"message": "***", "encoding": "base64"})).await.unwrap_err();
        assert_matches!(err, RpcError::InvalidParams { .. });
    }

    #[tokio::test]
    async fn concurrent_sends_never_interleave() {
        let mut h = Harness::new(SimulatedBt::demo());
        h.connect("Paired EV3 [demo]", json!({})).await;
        h.sim.set_write_delay(Some(Duration::from_millis(5)));

        let calls: Vec<_> = (0u8..8)
            .map(|i| {
                let registry = Arc::clone(&h.registry);
                let session = Arc::clone(&h.session);
                let message = EncodedMessage::base64(&[i; 16]).message;
                async move {
                    registry
                        .call("send", Some(json!({"message": message, "encoding": "base64"})), &session)
                        .await
                }
            })
            .collect();
        for result in futures::future::join_all(calls).await {
            assert_eq!(result.unwrap(), 16);
        }

        assert_eq!(h.sim.overlapping_writes(), 0);
        let expected: Vec<Vec<u8>> = (0u8..8).map(|i| vec![i; 16]).collect();
        assert_eq!(h.sim.writes(), expected);
    }

    #[tokio::test]
    async fn inbound_data_is_forwarded_as_base64() {
        let mut h = Harness::new(SimulatedBt::demo());
        h.connect("Paired EV3 [demo]", json!({})).await;
        h.sim.emit_data(PAIRED_EV3, vec![0xde, 0xad]);
        let received = h.next_notification("didReceiveMessage").await;
        assert_eq!(received, json!({"message": "3q0=", "encoding": "base64"}));
    }

    #[tokio::test]
    async fn remote_close_notifies_and_closes_once() {
        let mut h = Harness::new(SimulatedBt::demo());
        h.connect("Paired EV3 [demo]", json!({})).await;
        h.sim.close_remote(PAIRED_EV3, "robot powered off");
        let frame = loop {
            let frame = h.next_frame().await;
            if frame.get("error").is_some() {
                break frame;
            }
        };
        assert!(frame.get("id").is_none());
        assert_eq!(frame["error"]["code"], -32500);
        assert!(h.session.is_closed());

        h.bt.shutdown().await;
        h.bt.shutdown().await;
        assert_eq!(h.sim.channels_closed(), 1);

        let err = h.call("send", json!({"message": "hi"})).await.unwrap_err();
        assert_matches!(err, RpcError::InvalidRequest { .. });
    }

    #[tokio::test]
    async fn adapter_loss_while_connected_closes_the_session() {
        let mut h = Harness::new(SimulatedBt::demo());
        h.connect("Paired EV3 [demo]", json!({})).await;
        h.sim.set_adapter_state(AdapterState::Unavailable);
        let frame = loop {
            let frame = h.next_frame().await;
            if frame.get("error").is_some() {
                break frame;
            }
        };
        assert_eq!(frame["error"]["code"], -32500);
        assert!(h.session.is_closed());
    }

    #[tokio::test]
    async fn announced_devices_are_reported_during_inquiry() {
        let mut h = Harness::new(SimulatedBt::new());
        h.call("discover", json!({"majorDeviceClass": 8, "minorDeviceClass": 1}))
            .await
            .unwrap();
        h.sim.announce(SimBtDevice::new("00:16:53:00:00:09", Some("Late EV3"), 8, 1));
        let found = h.next_notification("didDiscoverPeripheral").await;
        assert_eq!(found["name"], "Late EV3");
    }
}
