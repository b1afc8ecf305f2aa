use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{ActiveSink, emit_from_thread, send_from_thread};
use crate::adapter::AdapterState;
use crate::bt::{BtBackend, BtChannel, BtChannelEvent, BtInquiryResult};
use crate::error::BackendError;

type Inquiry = BtInquiryResult<String, String>;

/// A simulated Bluetooth Classic device.
#[derive(Clone, Debug)]
pub struct SimBtDevice {
    /// Address; both the device handle and its stable id.
    pub address: String,
    /// Friendly name.
    pub name: Option<String>,
    /// Major class of device.
    pub major_device_class: u32,
    /// Minor class of device.
    pub minor_device_class: u32,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Whether the host is paired with it.
    pub paired: bool,
}

impl SimBtDevice {
    /// An unpaired device of the given class.
    pub fn new(address: impl Into<String>, name: Option<&str>, major: u32, minor: u32) -> Self {
        Self {
            address: address.into(),
            name: name.map(str::to_owned),
            major_device_class: major,
            minor_device_class: minor,
            rssi: Some(-55),
            paired: false,
        }
    }

    /// Mark as already paired.
    #[must_use]
    pub fn paired(mut self) -> Self {
        self.paired = true;
        self
    }

    fn matches_class(&self, major: u32, minor: u32) -> bool {
        self.major_device_class == major && self.minor_device_class == minor
    }

    fn inquiry_result(&self) -> Inquiry {
        BtInquiryResult {
            device: self.address.clone(),
            device_id: self.address.clone(),
            name: self.name.clone(),
            rssi: self.rssi,
            paired: self.paired,
        }
    }
}

struct InquiryEntry {
    major: u32,
    minor: u32,
    target: ActiveSink<Inquiry>,
}

struct ChannelEntry {
    id: u64,
    address: String,
    events: mpsc::UnboundedSender<BtChannelEvent>,
}

#[derive(Default)]
struct Faults {
    inquiry: Option<BackendError>,
    pair: Option<BackendError>,
    channel: Option<BackendError>,
    write: Option<BackendError>,
}

struct Inner {
    adapter: watch::Sender<AdapterState>,
    devices: Mutex<BTreeMap<String, SimBtDevice>>,
    inquiries: Mutex<Vec<InquiryEntry>>,
    channels: Mutex<Vec<ChannelEntry>>,
    faults: Mutex<Faults>,
    pairings: Mutex<Vec<(String, String)>>,
    writes: Mutex<Vec<Vec<u8>>>,
    write_delay: Mutex<Option<Duration>>,
    writes_in_flight: AtomicUsize,
    overlapping_writes: AtomicUsize,
    next_channel: AtomicU64,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
}

/// Scriptable Bluetooth Classic backend.
#[derive(Clone)]
pub struct SimulatedBt {
    inner: Arc<Inner>,
}

impl Default for SimulatedBt {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBt {
    /// Empty backend with an available adapter.
    pub fn new() -> Self {
        let (adapter, _) = watch::channel(AdapterState::Available);
        Self {
            inner: Arc::new(Inner {
                adapter,
                devices: Mutex::new(BTreeMap::new()),
                inquiries: Mutex::new(Vec::new()),
                channels: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
                pairings: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
                write_delay: Mutex::new(None),
                writes_in_flight: AtomicUsize::new(0),
                overlapping_writes: AtomicUsize::new(0),
                next_channel: AtomicU64::new(1),
                channels_opened: AtomicUsize::new(0),
                channels_closed: AtomicUsize::new(0),
            }),
        }
    }

    /// Backend pre-populated with demo robots (class 8/1).
    pub fn demo() -> Self {
        let sim = Self::new();
        sim.add_device(SimBtDevice::new("00:16:53:00:00:01", Some("EV3 [demo]"), 8, 1));
        sim.add_device(SimBtDevice::new("00:16:53:00:00:02", Some("Paired EV3 [demo]"), 8, 1).paired());
        sim.add_device(SimBtDevice::new("00:1A:7D:00:00:03", Some("Headset [demo]"), 4, 1));
        sim
    }

    /// Change the adapter state seen by every session.
    pub fn set_adapter_state(&self, state: AdapterState) {
        let _ = self.inner.adapter.send_replace(state);
    }

    /// Add or replace a device without announcing it.
    pub fn add_device(&self, device: SimBtDevice) {
        let _ = self.inner.devices.lock().insert(device.address.clone(), device);
    }

    /// Add or replace a device and report it to matching inquiries.
    pub fn announce(&self, device: SimBtDevice) {
        let result = device.inquiry_result();
        let targets: Vec<_> = {
            let mut inquiries = self.inner.inquiries.lock();
            inquiries.retain(|i| i.target.is_live());
            inquiries
                .iter()
                .filter(|i| device.matches_class(i.major, i.minor))
                .map(|i| i.target.clone())
                .collect()
        };
        self.add_device(device);
        emit_from_thread(targets, vec![result]);
    }

    /// Deliver inbound bytes on every channel to `address`.
    pub fn emit_data(&self, address: &str, data: Vec<u8>) {
        send_from_thread(self.channel_sinks(address), BtChannelEvent::Data(data));
    }

    /// Close every channel to `address` from the device side.
    pub fn close_remote(&self, address: &str, reason: &str) {
        send_from_thread(
            self.channel_sinks(address),
            BtChannelEvent::Closed {
                reason: reason.to_owned(),
            },
        );
    }

    /// Fail the next `start_inquiry` with `err`.
    pub fn fail_next_inquiry(&self, err: BackendError) {
        self.inner.faults.lock().inquiry = Some(err);
    }

    /// Fail the next `pair` with `err`.
    pub fn fail_next_pair(&self, err: BackendError) {
        self.inner.faults.lock().pair = Some(err);
    }

    /// Fail the next `open_channel` with `err`.
    pub fn fail_next_channel(&self, err: BackendError) {
        self.inner.faults.lock().channel = Some(err);
    }

    /// Fail the next channel write with `err`.
    pub fn fail_next_write(&self, err: BackendError) {
        self.inner.faults.lock().write = Some(err);
    }

    /// Make every write take `delay`.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.inner.write_delay.lock() = delay;
    }

    /// `(address, pin)` of every pairing attempt that reached the device.
    pub fn pairings(&self) -> Vec<(String, String)> {
        self.inner.pairings.lock().clone()
    }

    /// Every buffer written, in the order the writes completed.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.writes.lock().clone()
    }

    /// Writes that started while another write was still in progress.
    pub fn overlapping_writes(&self) -> usize {
        self.inner.overlapping_writes.load(Ordering::Acquire)
    }

    /// Channels opened so far.
    pub fn channels_opened(&self) -> usize {
        self.inner.channels_opened.load(Ordering::Acquire)
    }

    /// `close` calls so far.
    pub fn channels_closed(&self) -> usize {
        self.inner.channels_closed.load(Ordering::Acquire)
    }

    /// Inquiries whose guard is still alive.
    pub fn active_inquiry_count(&self) -> usize {
        let mut inquiries = self.inner.inquiries.lock();
        inquiries.retain(|i| i.target.is_live());
        inquiries.len()
    }

    fn channel_sinks(&self, address: &str) -> Vec<mpsc::UnboundedSender<BtChannelEvent>> {
        self.inner
            .channels
            .lock()
            .iter()
            .filter(|c| c.address == address)
            .map(|c| c.events.clone())
            .collect()
    }

    fn ensure_available(&self) -> Result<(), BackendError> {
        if *self.inner.adapter.borrow() == AdapterState::Available {
            Ok(())
        } else {
            Err(BackendError::Unavailable)
        }
    }
}

/// Inquiry guard; dropping it stops delivery.
pub struct SimInquiry {
    active: Arc<AtomicBool>,
}

impl Drop for SimInquiry {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

#[async_trait]
impl BtBackend for SimulatedBt {
    type Device = String;
    type DeviceId = String;
    type Inquiry = SimInquiry;
    type Channel = SimBtChannel;

    fn adapter_state(&self) -> watch::Receiver<AdapterState> {
        self.inner.adapter.subscribe()
    }

    async fn start_inquiry(
        &self,
        major_device_class: u32,
        minor_device_class: u32,
        sink: mpsc::UnboundedSender<Inquiry>,
    ) -> Result<SimInquiry, BackendError> {
        self.ensure_available()?;
        if let Some(err) = self.inner.faults.lock().inquiry.take() {
            return Err(err);
        }

        let active = Arc::new(AtomicBool::new(true));
        let target = ActiveSink {
            active: Arc::clone(&active),
            sink,
        };
        self.inner.inquiries.lock().push(InquiryEntry {
            major: major_device_class,
            minor: minor_device_class,
            target: target.clone(),
        });

        let found: Vec<_> = self
            .inner
            .devices
            .lock()
            .values()
            .filter(|d| d.matches_class(major_device_class, minor_device_class))
            .map(SimBtDevice::inquiry_result)
            .collect();
        emit_from_thread(vec![target], found);
        Ok(SimInquiry { active })
    }

    async fn pair(&self, device: &String, pin: &str) -> Result<(), BackendError> {
        self.ensure_available()?;
        if let Some(err) = self.inner.faults.lock().pair.take() {
            return Err(err);
        }
        let mut devices = self.inner.devices.lock();
        let entry = devices
            .get_mut(device)
            .ok_or_else(|| BackendError::NotFound(device.clone()))?;
        self.inner.pairings.lock().push((device.clone(), pin.to_owned()));
        entry.paired = true;
        Ok(())
    }

    async fn open_channel(
        &self,
        device: &String,
        events: mpsc::UnboundedSender<BtChannelEvent>,
    ) -> Result<SimBtChannel, BackendError> {
        self.ensure_available()?;
        if let Some(err) = self.inner.faults.lock().channel.take() {
            return Err(err);
        }
        let paired = self.inner.devices.lock().get(device).map(|d| d.paired);
        match paired {
            None => return Err(BackendError::NotFound(device.clone())),
            Some(false) => return Err(BackendError::Channel("device is not paired".into())),
            Some(true) => {}
        }

        let id = self.inner.next_channel.fetch_add(1, Ordering::AcqRel);
        self.inner.channels.lock().push(ChannelEntry {
            id,
            address: device.clone(),
            events,
        });
        let _ = self.inner.channels_opened.fetch_add(1, Ordering::AcqRel);
        Ok(SimBtChannel {
            inner: Arc::clone(&self.inner),
            id,
        })
    }
}

/// RFCOMM channel to a [`SimBtDevice`].
pub struct SimBtChannel {
    inner: Arc<Inner>,
    id: u64,
}

impl fmt::Debug for SimBtChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimBtChannel").field("id", &self.id).finish_non_exhaustive()
    }
}

#[async_trait]
impl BtChannel for SimBtChannel {
    async fn write(&self, data: &[u8]) -> Result<usize, BackendError> {
        if !self.inner.channels.lock().iter().any(|c| c.id == self.id) {
            return Err(BackendError::Disconnected);
        }
        if let Some(err) = self.inner.faults.lock().write.take() {
            return Err(err);
        }

        if self.inner.writes_in_flight.fetch_add(1, Ordering::AcqRel) > 0 {
            let _ = self.inner.overlapping_writes.fetch_add(1, Ordering::AcqRel);
        }
        let delay = *self.inner.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.writes.lock().push(data.to_vec());
        let _ = self.inner.writes_in_flight.fetch_sub(1, Ordering::AcqRel);
        Ok(data.len())
    }

    async fn close(&self) {
        let _ = self.inner.channels_closed.fetch_add(1, Ordering::AcqRel);
        self.inner.channels.lock().retain(|c| c.id != self.id);
    }
}
