//! DeviceSource: responsibility and boundaries
//!
//! This module and its submodules are responsible ONLY for talking to input
//! devices: enumerating them, acquiring/releasing them, and handing out raw key
//! transitions. They MUST NOT touch queue tables or timestamps. All recording
//! decisions are made exclusively by the collector in `crate::queue`.

mod device_finder;
mod evdev_source;
mod simulated;

pub use device_finder::DeviceFinder;
pub use evdev_source::EvdevDeviceSource;
pub use simulated::SimulatedDeviceSource;

use crate::config::Config;
use crate::error::Result;
use crate::events::RawKeyEvent;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Класс устройства по результатам перечисления
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceKind {
    Keyboard,
    Pointer,
    Other,
}

impl DeviceKind {
    pub fn usage_name(&self) -> &'static str {
        match self {
            DeviceKind::Keyboard => "slave keyboard",
            DeviceKind::Pointer => "slave pointer",
            DeviceKind::Other => "other",
        }
    }

    /// HID usage page / usage (Generic Desktop: 1/6 клавиатура, 1/2 мышь)
    pub fn hid_usage(&self) -> (u16, u16) {
        match self {
            DeviceKind::Keyboard => (1, 6),
            DeviceKind::Pointer => (1, 2),
            DeviceKind::Other => (0, 0),
        }
    }
}

/// Описание перечисленного устройства. `index` совпадает со слотом очереди.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub transport: String,
    pub kind: DeviceKind,
    pub usage_page: u16,
    pub usage: u16,
}

impl DeviceInfo {
    pub fn new(index: usize, name: impl Into<String>, transport: impl Into<String>, kind: DeviceKind) -> Self {
        let (usage_page, usage) = kind.hid_usage();
        Self {
            index,
            name: name.into(),
            transport: transport.into(),
            kind,
            usage_page,
            usage,
        }
    }

    pub fn is_keyboard(&self) -> bool {
        self.kind == DeviceKind::Keyboard
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}, {})",
            self.index,
            self.name,
            self.kind.usage_name(),
            self.transport
        )
    }
}

/// Contract the queue core needs from the platform input layer.
///
/// Slots are the indices returned by `enumerate`. Implementations guard their
/// own state; the queue registry may call `fetch_next_raw_event` while holding
/// its lock, so implementations must never call back into the registry.
pub trait DeviceSource: Send + Sync {
    /// Enumerate devices in stable slot order
    fn enumerate(&self) -> Result<Vec<DeviceInfo>>;

    /// Exclusively acquire the device behind `slot`
    fn acquire(&self, slot: usize) -> Result<()>;

    /// Give the device back to the system
    fn release(&self, slot: usize) -> Result<()>;

    /// Include `slot` in change notifications seen by `wait_for_any_change`
    fn subscribe(&self, slot: usize) -> Result<()>;

    fn unsubscribe(&self, slot: usize) -> Result<()>;

    /// Non-blocking: `Ok(None)` once nothing is buffered for `slot`
    fn fetch_next_raw_event(&self, slot: usize) -> Result<Option<RawKeyEvent>>;

    /// Block until any subscribed device has data or `timeout` expires
    fn wait_for_any_change(&self, timeout: Duration);

    /// Raw device code to logical key code; `None` means "no translation"
    fn translate_raw_code_to_logical(&self, raw_code: u16) -> Option<u8>;
}

/// Factory function to create an appropriate device source based on the dry_run flag
pub fn create_device_source(config: &Config, dry_run: bool) -> Result<Arc<dyn DeviceSource>> {
    if dry_run {
        Ok(Arc::new(SimulatedDeviceSource::from_config(config)))
    } else {
        Ok(Arc::new(EvdevDeviceSource::new(config)?))
    }
}
