use super::{DeviceInfo, DeviceKind, DeviceSource};
use crate::config::Config;
use crate::error::Result;
use crate::events::{RawKeyEvent, KEY_COUNT};
use crate::{debug_if_enabled, kbq_error};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::info;

#[derive(Default)]
struct SimState {
    buffers: HashMap<usize, VecDeque<RawKeyEvent>>,
    acquired: HashSet<usize>,
    subscribed: HashSet<usize>,
    fail_acquire: HashSet<usize>,
    fail_subscribe: HashSet<usize>,
    fail_fetch: HashSet<usize>,
    acquire_count: usize,
}

/// In-memory device source used for dry-run mode and tests.
///
/// Injected events are buffered per slot and handed out by
/// `fetch_next_raw_event` regardless of acquisition state; the collector only
/// ever asks for slots it has started.
pub struct SimulatedDeviceSource {
    devices: Vec<DeviceInfo>,
    state: Mutex<SimState>,
    changed: Condvar,
}

impl SimulatedDeviceSource {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            state: Mutex::new(SimState::default()),
            changed: Condvar::new(),
        }
    }

    /// `count` клавиатур со слотами 0..count
    pub fn with_keyboards(count: usize) -> Self {
        let devices = (0..count)
            .map(|i| {
                DeviceInfo::new(
                    i,
                    format!("Simulated Keyboard {}", i),
                    format!("sim://keyboard/{}", i),
                    DeviceKind::Keyboard,
                )
            })
            .collect();
        Self::new(devices)
    }

    pub fn from_config(config: &Config) -> Self {
        info!(
            "Dry-run режим - используется эмулятор с {} клавиатурами",
            config.input.simulated_keyboards
        );
        let count = config
            .input
            .simulated_keyboards
            .min(config.collector.max_devices);
        Self::with_keyboards(count)
    }

    pub fn inject(&self, slot: usize, event: RawKeyEvent) {
        let mut state = self.state.lock();
        debug_if_enabled!("Эмулятор: слот {} <- {}", slot, event);
        state.buffers.entry(slot).or_default().push_back(event);
        if state.subscribed.contains(&slot) {
            self.changed.notify_all();
        }
    }

    pub fn inject_press(&self, slot: usize, raw_code: u16) {
        self.inject(slot, RawKeyEvent::press(raw_code));
    }

    pub fn inject_release(&self, slot: usize, raw_code: u16) {
        self.inject(slot, RawKeyEvent::release(raw_code));
    }

    pub fn pending_events(&self, slot: usize) -> usize {
        self.state
            .lock()
            .buffers
            .get(&slot)
            .map_or(0, |buffer| buffer.len())
    }

    pub fn is_acquired(&self, slot: usize) -> bool {
        self.state.lock().acquired.contains(&slot)
    }

    pub fn is_subscribed(&self, slot: usize) -> bool {
        self.state.lock().subscribed.contains(&slot)
    }

    /// Сколько раз успешно вызывался `acquire`
    pub fn acquire_count(&self) -> usize {
        self.state.lock().acquire_count
    }

    pub fn set_fail_acquire(&self, slot: usize, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.fail_acquire.insert(slot);
        } else {
            state.fail_acquire.remove(&slot);
        }
    }

    pub fn set_fail_subscribe(&self, slot: usize, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.fail_subscribe.insert(slot);
        } else {
            state.fail_subscribe.remove(&slot);
        }
    }

    pub fn set_fail_fetch(&self, slot: usize, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.fail_fetch.insert(slot);
        } else {
            state.fail_fetch.remove(&slot);
        }
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot < self.devices.len() {
            Ok(())
        } else {
            Err(kbq_error!(invalid_argument, "Нет устройства в слоте {}", slot))
        }
    }
}

impl DeviceSource for SimulatedDeviceSource {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.clone())
    }

    fn acquire(&self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        let mut state = self.state.lock();
        if state.fail_acquire.contains(&slot) {
            return Err(kbq_error!(acquisition, "Эмулятор: захват слота {} отклонён", slot));
        }
        if state.acquired.insert(slot) {
            state.acquire_count += 1;
        }
        Ok(())
    }

    fn release(&self, slot: usize) -> Result<()> {
        self.state.lock().acquired.remove(&slot);
        Ok(())
    }

    fn subscribe(&self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        let mut state = self.state.lock();
        if !state.acquired.contains(&slot) {
            return Err(kbq_error!(acquisition, "Слот {} не захвачен, подписка невозможна", slot));
        }
        if state.fail_subscribe.contains(&slot) {
            return Err(kbq_error!(acquisition, "Эмулятор: подписка на слот {} отклонена", slot));
        }
        state.subscribed.insert(slot);
        Ok(())
    }

    fn unsubscribe(&self, slot: usize) -> Result<()> {
        self.state.lock().subscribed.remove(&slot);
        Ok(())
    }

    fn fetch_next_raw_event(&self, slot: usize) -> Result<Option<RawKeyEvent>> {
        let mut state = self.state.lock();
        if state.fail_fetch.contains(&slot) {
            return Err(kbq_error!(acquisition, "Эмулятор: ошибка чтения слота {}", slot));
        }
        Ok(state.buffers.get_mut(&slot).and_then(|buffer| buffer.pop_front()))
    }

    fn wait_for_any_change(&self, timeout: Duration) {
        let mut state = self.state.lock();
        let has_data = |state: &SimState| {
            state
                .subscribed
                .iter()
                .any(|slot| state.buffers.get(slot).map_or(false, |b| !b.is_empty()))
        };
        if has_data(&state) {
            return;
        }
        // Одно ожидание: ложное пробуждение равносильно таймауту
        let _ = self.changed.wait_for(&mut state, timeout);
    }

    fn translate_raw_code_to_logical(&self, raw_code: u16) -> Option<u8> {
        if (raw_code as usize) < KEY_COUNT {
            Some(raw_code as u8)
        } else {
            None
        }
    }
}
