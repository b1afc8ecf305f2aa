//! In-memory backends.
//!
//! [`SimulatedBle`] and [`SimulatedBt`] implement the backend traits against
//! scriptable state: tests (and the demo binary) add devices, flip adapter
//! state, inject failures, and push events. Events are delivered from plain
//! OS threads, the way platform stacks call back from their own threads, so
//! sessions are exercised against genuinely foreign-thread producers.

mod ble;
mod bt;

pub use ble::{SimBleConnection, SimCharacteristic, SimPeripheral, SimScan, SimWrite, SimulatedBle};
pub use bt::{SimBtChannel, SimBtDevice, SimInquiry, SimulatedBt};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

/// Sink registered by a scan or inquiry, live until its guard drops.
pub(crate) struct ActiveSink<T> {
    pub(crate) active: Arc<AtomicBool>,
    pub(crate) sink: mpsc::UnboundedSender<T>,
}

impl<T> ActiveSink<T> {
    pub(crate) fn is_live(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.sink.is_closed()
    }
}

impl<T> Clone for ActiveSink<T> {
    fn clone(&self) -> Self {
        Self {
            active: Arc::clone(&self.active),
            sink: self.sink.clone(),
        }
    }
}

/// Deliver `items` to every sink from a freshly spawned OS thread.
pub(crate) fn emit_from_thread<T>(sinks: Vec<ActiveSink<T>>, items: Vec<T>)
where
    T: Clone + Send + 'static,
{
    if sinks.is_empty() || items.is_empty() {
        return;
    }
    let _ = std::thread::spawn(move || {
        for item in items {
            for target in &sinks {
                if target.is_live() {
                    let _ = target.sink.send(item.clone());
                }
            }
        }
    });
}

/// Deliver `item` to plain senders from an OS thread.
pub(crate) fn send_from_thread<T>(sinks: Vec<mpsc::UnboundedSender<T>>, item: T)
where
    T: Clone + Send + 'static,
{
    if sinks.is_empty() {
        return;
    }
    let _ = std::thread::spawn(move || {
        for sink in &sinks {
            let _ = sink.send(item.clone());
        }
    });
}
