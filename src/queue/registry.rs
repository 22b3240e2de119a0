use super::collector;
use super::timeline::{DeviceQueue, QueueCheck, ScanMask};
use super::DeviceSelector;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{CollectorConfig, Config};
use crate::error::{KbQueueError, Result};
use crate::events::{KeyCode, Timestamp};
use crate::source::{self, DeviceInfo, DeviceSource};
use crate::{debug_if_enabled, kbq_error};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub(crate) type SpawnCollector = fn(Arc<Shared>, u64) -> std::io::Result<JoinHandle<()>>;

/// Состояние, защищённое единственной блокировкой реестра
pub(crate) struct RegistryState {
    /// `None` - очереди нет, `Some` - создана (активна или нет)
    pub queues: Vec<Option<DeviceQueue>>,
    /// Ошибки чтения подряд по слотам, для ограничения логов сборщика
    pub fetch_failures: Vec<u32>,
    /// Запрошена отмена текущего или следующего trigger_wait слота
    pub cancel_requested: Vec<bool>,
    pub next_queue_id: u64,
    pub active_count: usize,
    /// Эпоха текущего сборщика. Меняется при запуске и при отставке сборщика.
    pub epoch: u64,
    pub collectors_spawned: u64,
    pub collector: Option<JoinHandle<()>>,
}

impl RegistryState {
    fn new(slots: usize) -> Self {
        Self {
            queues: (0..slots).map(|_| None).collect(),
            fetch_failures: vec![0; slots],
            cancel_requested: vec![false; slots],
            next_queue_id: 0,
            active_count: 0,
            epoch: 0,
            collectors_spawned: 0,
            collector: None,
        }
    }

    fn new_queue(&mut self, mask: ScanMask) -> DeviceQueue {
        self.next_queue_id += 1;
        DeviceQueue::with_id(self.next_queue_id, mask)
    }
}

/// Общие данные реестра и сборщика
pub(crate) struct Shared {
    pub state: Mutex<RegistryState>,
    /// Сигнал "таблицы изменились", связан с `state`
    pub changed: Condvar,
    pub source: Arc<dyn DeviceSource>,
    pub clock: Arc<dyn Clock>,
    pub poll_timeout: Duration,
    pub realtime_priority: u8,
    pub spawn: SpawnCollector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Absent,
    Inactive,
    Active,
}

/// Registry of per-device key queues sharing one background collector.
///
/// All tables, masks, active flags and the collector handle live behind one
/// mutex. The collector blocks on the device source outside that mutex and
/// broadcasts `changed` after every wake cycle that recorded something.
pub struct KbQueueRegistry {
    shared: Arc<Shared>,
    devices: Vec<DeviceInfo>,
}

impl KbQueueRegistry {
    pub fn new(source: Arc<dyn DeviceSource>, clock: Arc<dyn Clock>, config: &CollectorConfig) -> Result<Self> {
        let mut devices = source.enumerate()?;
        if devices.len() > config.max_devices {
            warn!(
                "Найдено {} устройств, используются первые {}",
                devices.len(),
                config.max_devices
            );
            devices.truncate(config.max_devices);
        }

        info!("Реестр очередей: {} устройств", devices.len());
        for device in &devices {
            debug!("  {}", device);
        }

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RegistryState::new(devices.len())),
                changed: Condvar::new(),
                source,
                clock,
                poll_timeout: config.poll_timeout(),
                realtime_priority: config.realtime_priority,
                spawn: collector::spawn,
            }),
            devices,
        })
    }

    /// Реестр поверх evdev (или эмулятора при `dry_run`) с монотонными часами
    pub fn from_config(config: &Config, dry_run: bool) -> Result<Self> {
        let source = source::create_device_source(config, dry_run)?;
        Self::new(source, Arc::new(MonotonicClock::new()), &config.collector)
    }

    #[cfg(test)]
    fn with_spawner(mut self, spawn: SpawnCollector) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.spawn = spawn;
        }
        self
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn now(&self) -> Timestamp {
        self.shared.clock.now()
    }

    fn resolve(&self, device: DeviceSelector) -> Result<usize> {
        match device {
            DeviceSelector::Default if self.devices.is_empty() => Err(KbQueueError::NoDeviceAvailable),
            DeviceSelector::Default => Ok(0),
            DeviceSelector::Slot(slot) if slot < self.devices.len() => Ok(slot),
            DeviceSelector::Slot(slot) => Err(kbq_error!(
                invalid_argument,
                "Неверный индекс устройства {}: доступно {} устройств",
                slot,
                self.devices.len()
            )),
        }
    }

    fn resolve_keyboard(&self, device: DeviceSelector) -> Result<usize> {
        let slot = self.resolve(device)?;
        let info = &self.devices[slot];
        if !info.is_keyboard() {
            return KbQueueError::invalid_argument(format!(
                "Устройство {} не является клавиатурой ({})",
                slot,
                info.kind.usage_name()
            ));
        }
        Ok(slot)
    }

    /// Создать очередь для клавиатуры. Существующая очередь слота
    /// предварительно освобождается. Сбор событий не начинается.
    pub fn create(&self, device: impl Into<DeviceSelector>, mask: Option<&[bool]>) -> Result<()> {
        let mask = match mask {
            Some(mask) => ScanMask::from_slice(mask)?,
            None => ScanMask::all(),
        };
        let slot = self.resolve_keyboard(device.into())?;
        self.install_queue(slot, mask);
        Ok(())
    }

    fn install_queue(&self, slot: usize, mask: ScanMask) {
        loop {
            self.release_slot(slot);

            let mut state = self.shared.state.lock();
            // Другой поток успел создать и запустить очередь между release и lock
            if state.queues[slot].as_ref().map_or(false, |queue| queue.active) {
                continue;
            }
            debug!("Очередь слота {} создана ({} клавиш в маске)", slot, mask.enabled_count());
            let queue = state.new_queue(mask);
            state.queues[slot] = Some(queue);
            return;
        }
    }

    /// Начать сбор событий: захватить устройство и при необходимости
    /// запустить сборщик.
    pub fn start(&self, device: impl Into<DeviceSelector>) -> Result<()> {
        let slot = self.resolve(device.into())?;
        let source = self.shared.source.as_ref();

        let mut state = self.shared.state.lock();
        let Some(queue) = state.queues[slot].as_mut() else {
            return KbQueueError::not_found(format!("Для устройства {} не создана очередь", slot));
        };
        if queue.active {
            return Ok(());
        }

        queue.timeline.clear();

        source.acquire(slot).map_err(as_acquisition_error)?;
        if let Err(e) = source.subscribe(slot) {
            release_quietly(source, slot);
            return Err(as_acquisition_error(e));
        }

        queue.active = true;
        state.active_count += 1;
        state.fetch_failures[slot] = 0;
        info!("Сбор событий для устройства {} запущен", slot);

        if state.active_count == 1 {
            state.epoch += 1;
            match (self.shared.spawn)(Arc::clone(&self.shared), state.epoch) {
                Ok(handle) => {
                    state.collectors_spawned += 1;
                    state.collector = Some(handle);
                }
                Err(e) => {
                    error!("Не удалось запустить поток сборщика: {}", e);
                    state.epoch += 1;
                    state.active_count -= 1;
                    if let Some(queue) = state.queues[slot].as_mut() {
                        queue.active = false;
                    }
                    unsubscribe_quietly(source, slot);
                    release_quietly(source, slot);
                    return Err(kbq_error!(fatal, "Не удалось запустить поток сборщика: {}", e));
                }
            }
        }

        Ok(())
    }

    /// Остановить сбор событий. Если устройство было последним активным,
    /// дожидается завершения сборщика.
    pub fn stop(&self, device: impl Into<DeviceSelector>) -> Result<()> {
        let slot = self.resolve(device.into())?;
        let handle = {
            let mut state = self.shared.state.lock();
            self.deactivate_locked(&mut state, slot)
        };
        join_collector(handle);
        Ok(())
    }

    fn deactivate_locked(&self, state: &mut RegistryState, slot: usize) -> Option<JoinHandle<()>> {
        match state.queues[slot].as_mut() {
            Some(queue) if queue.active => queue.active = false,
            _ => return None,
        }

        let source = self.shared.source.as_ref();
        unsubscribe_quietly(source, slot);
        release_quietly(source, slot);

        state.active_count -= 1;
        info!("Сбор событий для устройства {} остановлен", slot);

        // Ожидающие trigger_wait должны заметить остановку
        self.shared.changed.notify_all();

        if state.active_count == 0 {
            state.epoch += 1;
            return state.collector.take();
        }
        None
    }

    fn remove_locked(&self, state: &mut RegistryState, slot: usize) -> Option<JoinHandle<()>> {
        let handle = self.deactivate_locked(state, slot);
        if state.queues[slot].take().is_some() {
            debug!("Очередь слота {} удалена", slot);
            self.shared.changed.notify_all();
        }
        handle
    }

    /// Остановить и удалить очередь. Отсутствие очереди не ошибка.
    pub fn release(&self, device: impl Into<DeviceSelector>) -> Result<()> {
        let slot = self.resolve(device.into())?;
        self.release_slot(slot);
        Ok(())
    }

    fn release_slot(&self, slot: usize) {
        let handle = {
            let mut state = self.shared.state.lock();
            self.remove_locked(&mut state, slot)
        };
        join_collector(handle);
    }

    /// Удалить очередь, только если в слоте всё ещё очередь `id`
    fn release_queue(&self, slot: usize, id: u64) {
        let handle = {
            let mut state = self.shared.state.lock();
            if state.queues[slot].as_ref().map_or(false, |queue| queue.id == id) {
                self.remove_locked(&mut state, slot)
            } else {
                None
            }
        };
        join_collector(handle);
    }

    /// Отбросить буферизованные события устройства и очистить таблицы
    pub fn flush(&self, device: impl Into<DeviceSelector>) -> Result<()> {
        let slot = self.resolve(device.into())?;
        let source = self.shared.source.as_ref();

        let mut state = self.shared.state.lock();
        let Some(queue) = state.queues[slot].as_mut() else {
            return KbQueueError::not_found(format!("Для устройства {} не создана очередь", slot));
        };

        let mut discarded = 0usize;
        loop {
            match source.fetch_next_raw_event(slot) {
                Ok(Some(_)) => discarded += 1,
                Ok(None) => break,
                Err(e) => {
                    warn!("Ошибка при сбросе событий устройства {}: {}", slot, e);
                    break;
                }
            }
        }
        queue.timeline.clear();

        debug_if_enabled!("Слот {}: отброшено {} событий", slot, discarded);
        Ok(())
    }

    /// Прочитать и обнулить таблицы очереди
    pub fn check(&self, device: impl Into<DeviceSelector>) -> Result<QueueCheck> {
        let slot = self.resolve(device.into())?;
        let mut state = self.shared.state.lock();
        match state.queues[slot].as_mut() {
            Some(queue) => Ok(queue.timeline.take()),
            None => KbQueueError::not_found(format!("Для устройства {} не создана очередь", slot)),
        }
    }

    /// Ждать первого нажатия любой из `keys` (коды с единицы) и вернуть
    /// момент пробуждения. Временная очередь удаляется перед возвратом
    /// при любом исходе, если её не заменили другой.
    pub fn trigger_wait(&self, device: impl Into<DeviceSelector>, keys: &[u16]) -> Result<Timestamp> {
        let slot = self.resolve_keyboard(device.into())?;
        let (mask, codes) = ScanMask::from_trigger_keys(keys)?;

        let id = {
            let mut state = self.shared.state.lock();
            if std::mem::take(&mut state.cancel_requested[slot]) {
                info!("Ожидание триггера на устройстве {} отменено до начала", slot);
                return Err(KbQueueError::Cancelled(slot));
            }
            if state.queues[slot].is_some() {
                return KbQueueError::invalid_argument(format!(
                    "Для устройства {} уже существует очередь, её нужно освободить перед ожиданием",
                    slot
                ));
            }
            let queue = state.new_queue(mask);
            let id = queue.id;
            state.queues[slot] = Some(queue);
            id
        };

        if let Err(e) = self.start(DeviceSelector::Slot(slot)) {
            self.release_queue(slot, id);
            return Err(e);
        }

        debug!("Ожидание клавиш {:?} на устройстве {}", codes.as_slice(), slot);
        let outcome = self.wait_for_press(slot, id, &codes);

        self.release_queue(slot, id);
        outcome
    }

    fn wait_for_press(&self, slot: usize, id: u64, codes: &[KeyCode]) -> Result<Timestamp> {
        let mut state = self.shared.state.lock();
        loop {
            if std::mem::take(&mut state.cancel_requested[slot]) {
                info!("Ожидание триггера на устройстве {} отменено", slot);
                return Err(KbQueueError::Cancelled(slot));
            }
            match state.queues[slot].as_ref() {
                Some(queue) if queue.id == id && queue.active => {
                    if queue.timeline.any_pressed(codes) {
                        return Ok(self.shared.clock.now());
                    }
                }
                Some(queue) if queue.id == id => {
                    return Err(kbq_error!(
                        not_found,
                        "Очередь устройства {} была остановлена во время ожидания",
                        slot
                    ))
                }
                _ => {
                    return Err(kbq_error!(
                        not_found,
                        "Очередь устройства {} была освобождена во время ожидания",
                        slot
                    ))
                }
            }
            self.shared.changed.wait(&mut state);
        }
    }

    /// Отменить `trigger_wait` на устройстве. Если ожидание ещё не
    /// началось, отменяется следующий вызов для этого устройства.
    pub fn cancel_trigger_wait(&self, device: impl Into<DeviceSelector>) -> Result<()> {
        let slot = self.resolve(device.into())?;
        let mut state = self.shared.state.lock();
        state.cancel_requested[slot] = true;
        self.shared.changed.notify_all();
        Ok(())
    }

    pub fn queue_state(&self, device: impl Into<DeviceSelector>) -> Result<QueueState> {
        let slot = self.resolve(device.into())?;
        let state = self.shared.state.lock();
        Ok(match state.queues[slot].as_ref() {
            None => QueueState::Absent,
            Some(queue) if queue.active => QueueState::Active,
            Some(_) => QueueState::Inactive,
        })
    }

    pub fn is_any_active(&self) -> bool {
        self.shared.state.lock().active_count > 0
    }

    pub fn is_collector_running(&self) -> bool {
        self.shared.state.lock().collector.is_some()
    }

    /// Сколько раз запускался поток сборщика за время жизни реестра
    pub fn collectors_spawned(&self) -> u64 {
        self.shared.state.lock().collectors_spawned
    }

    /// Освободить все очереди и дождаться сборщика
    pub fn shutdown(&self) {
        for slot in 0..self.devices.len() {
            self.release_slot(slot);
        }
    }
}

impl Drop for KbQueueRegistry {
    fn drop(&mut self) {
        if self.is_any_active() {
            info!("Остановка всех очередей при завершении");
        }
        self.shutdown();
    }
}

fn as_acquisition_error(e: KbQueueError) -> KbQueueError {
    match e {
        e @ KbQueueError::DeviceAcquisitionFailed(_) => e,
        other => KbQueueError::DeviceAcquisitionFailed(other.to_string()),
    }
}

fn unsubscribe_quietly(source: &dyn DeviceSource, slot: usize) {
    if let Err(e) = source.unsubscribe(slot) {
        warn!("Не удалось отписаться от устройства {}: {}", slot, e);
    }
}

fn release_quietly(source: &dyn DeviceSource, slot: usize) {
    if let Err(e) = source.release(slot) {
        warn!("Не удалось освободить устройство {}: {}", slot, e);
    }
}

fn join_collector(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            error!("Поток сборщика завершился паникой");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::source::{DeviceKind, SimulatedDeviceSource};
    use std::time::Instant;

    const FAST: CollectorConfig = CollectorConfig {
        poll_timeout_ms: 10,
        max_devices: 64,
        realtime_priority: 0,
    };

    fn registry_with(source: &Arc<SimulatedDeviceSource>) -> KbQueueRegistry {
        let clock = Arc::new(MonotonicClock::new());
        KbQueueRegistry::new(Arc::clone(source) as Arc<dyn DeviceSource>, clock, &FAST).unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "условие не выполнено за 5 секунд");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn wait_drained(source: &SimulatedDeviceSource, slot: usize) {
        wait_until(|| source.pending_events(slot) == 0);
    }

    #[test]
    fn test_press_release_then_consume() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(2));
        let registry = registry_with(&source);

        registry.create(0, None).unwrap();
        registry.start(0).unwrap();

        source.inject_press(0, 44);
        wait_drained(&source, 0);
        source.inject_release(0, 44);
        wait_drained(&source, 0);

        let check = registry.check(0).unwrap();
        assert!(check.has_key_been_down);
        let pressed = check.first_press[44].unwrap();
        let released = check.first_release[44].unwrap();
        assert_eq!(check.last_press[44], Some(pressed));
        assert_eq!(check.last_release[44], Some(released));
        assert!(released >= pressed);
        assert_eq!(check.pressed_keys().count(), 1);

        let again = registry.check(0).unwrap();
        assert!(!again.has_key_been_down);
        assert!(again.is_empty());
    }

    #[test]
    fn test_second_press_updates_only_last() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = registry_with(&source);
        registry.create(0, None).unwrap();
        registry.start(0).unwrap();

        source.inject_press(0, 44);
        wait_drained(&source, 0);
        std::thread::sleep(Duration::from_millis(20));
        source.inject_press(0, 44);
        wait_drained(&source, 0);

        let check = registry.check(0).unwrap();
        let first = check.first_press[44].unwrap();
        let last = check.last_press[44].unwrap();
        assert!(last > first);
    }

    #[test]
    fn test_masked_key_never_recorded() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = registry_with(&source);

        let mut mask = vec![true; 256];
        mask[44] = false;
        registry.create(0, Some(&mask)).unwrap();
        registry.start(0).unwrap();

        source.inject_press(0, 44);
        source.inject_release(0, 44);
        source.inject_press(0, 30);
        wait_drained(&source, 0);

        let check = registry.check(0).unwrap();
        assert_eq!(check.first_press[44], None);
        assert_eq!(check.last_release[44], None);
        assert!(check.first_press[30].is_some());
    }

    #[test]
    fn test_flush_discards_pending_events() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = registry_with(&source);
        registry.create(0, None).unwrap();

        source.inject_press(0, 30);
        source.inject_release(0, 30);
        registry.flush(0).unwrap();
        assert_eq!(source.pending_events(0), 0);

        let check = registry.check(0).unwrap();
        assert!(!check.has_key_been_down);
        assert!(check.is_empty());
    }

    #[test]
    fn test_flush_clears_recorded_events() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = registry_with(&source);
        registry.create(0, None).unwrap();
        registry.start(0).unwrap();

        source.inject_press(0, 30);
        wait_drained(&source, 0);
        registry.flush(0).unwrap();

        assert!(registry.check(0).unwrap().is_empty());
    }

    #[test]
    fn test_stop_last_device_joins_collector() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = registry_with(&source);
        registry.create(0, None).unwrap();
        registry.start(0).unwrap();
        assert!(registry.is_collector_running());

        registry.stop(0).unwrap();
        assert!(!registry.is_any_active());
        assert!(!registry.is_collector_running());
        assert!(!source.is_acquired(0));
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Inactive);

        source.inject_press(0, 30);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(source.pending_events(0), 1);
        assert!(registry.check(0).unwrap().is_empty());
    }

    #[test]
    fn test_one_collector_for_many_devices() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(2));
        let registry = registry_with(&source);
        registry.create(0, None).unwrap();
        registry.create(1, None).unwrap();
        registry.start(0).unwrap();
        registry.start(1).unwrap();
        assert_eq!(registry.collectors_spawned(), 1);

        registry.stop(0).unwrap();
        assert!(registry.is_collector_running());

        source.inject_press(1, 44);
        wait_drained(&source, 1);
        assert!(registry.check(1).unwrap().first_press[44].is_some());

        registry.stop(1).unwrap();
        assert!(!registry.is_collector_running());

        registry.start(0).unwrap();
        assert_eq!(registry.collectors_spawned(), 2);
    }

    #[test]
    fn test_concurrent_starts_spawn_single_collector() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(4));
        let registry = Arc::new(registry_with(&source));
        for slot in 0..4 {
            registry.create(slot, None).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|slot| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.start(slot).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.collectors_spawned(), 1);
        registry.shutdown();
        assert!(!registry.is_collector_running());
    }

    #[test]
    fn test_start_is_idempotent_and_clears_tables() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = registry_with(&source);
        registry.create(0, None).unwrap();
        registry.start(0).unwrap();
        registry.start(0).unwrap();
        assert_eq!(source.acquire_count(), 1);

        source.inject_press(0, 30);
        wait_drained(&source, 0);
        registry.stop(0).unwrap();
        registry.start(0).unwrap();
        assert!(registry.check(0).unwrap().is_empty());
    }

    #[test]
    fn test_trigger_wait_returns_on_requested_key() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = Arc::new(registry_with(&source));
        let started = registry.now();

        let waiter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.trigger_wait(0, &[45]))
        };

        wait_until(|| registry.queue_state(0).unwrap() == QueueState::Active);
        source.inject_press(0, 30);
        wait_drained(&source, 0);
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Active);

        source.inject_press(0, 44);
        let fired = waiter.join().unwrap().unwrap();
        assert!(fired >= started);
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Absent);
        assert!(!registry.is_collector_running());
    }

    #[test]
    fn test_trigger_wait_rejects_bad_arguments() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = registry_with(&source);

        assert!(matches!(registry.trigger_wait(0, &[]), Err(KbQueueError::InvalidArgument(_))));
        assert!(matches!(registry.trigger_wait(0, &[0]), Err(KbQueueError::InvalidArgument(_))));
        assert!(matches!(registry.trigger_wait(0, &[257]), Err(KbQueueError::InvalidArgument(_))));

        registry.create(0, None).unwrap();
        assert!(matches!(registry.trigger_wait(0, &[45]), Err(KbQueueError::InvalidArgument(_))));
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Inactive);
    }

    #[test]
    fn test_trigger_wait_ends_when_queue_released() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = Arc::new(registry_with(&source));

        let waiter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.trigger_wait(0, &[45]))
        };
        wait_until(|| registry.queue_state(0).unwrap() == QueueState::Active);
        registry.release(0).unwrap();

        assert!(matches!(waiter.join().unwrap(), Err(KbQueueError::NotFound(_))));
    }

    #[test]
    fn test_trigger_wait_stopped_externally_leaves_slot_absent() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = Arc::new(registry_with(&source));

        let waiter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.trigger_wait(0, &[45]))
        };
        wait_until(|| registry.queue_state(0).unwrap() == QueueState::Active);
        registry.stop(0).unwrap();

        assert!(matches!(waiter.join().unwrap(), Err(KbQueueError::NotFound(_))));
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Absent);

        // Слот снова пригоден для ожидания
        let waiter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.trigger_wait(0, &[45]))
        };
        wait_until(|| registry.queue_state(0).unwrap() == QueueState::Active);
        source.inject_press(0, 44);
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Absent);
    }

    #[test]
    fn test_trigger_wait_keeps_queue_that_replaced_it() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = Arc::new(registry_with(&source));

        let waiter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.trigger_wait(0, &[45]))
        };
        wait_until(|| registry.queue_state(0).unwrap() == QueueState::Active);
        registry.create(0, None).unwrap();

        assert!(matches!(waiter.join().unwrap(), Err(KbQueueError::NotFound(_))));
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Inactive);
        registry.start(0).unwrap();
        source.inject_press(0, 30);
        wait_drained(&source, 0);
        assert!(registry.check(0).unwrap().first_press[30].is_some());
    }

    #[test]
    fn test_cancel_before_trigger_wait_starts() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = registry_with(&source);

        registry.cancel_trigger_wait(0).unwrap();
        assert!(matches!(registry.trigger_wait(0, &[45]), Err(KbQueueError::Cancelled(0))));
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Absent);
        assert_eq!(source.acquire_count(), 0);
    }

    #[test]
    fn test_cancel_running_trigger_wait() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = Arc::new(registry_with(&source));

        let waiter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.trigger_wait(-1, &[45]))
        };
        wait_until(|| registry.queue_state(0).unwrap() == QueueState::Active);
        registry.cancel_trigger_wait(-1).unwrap();

        assert!(matches!(waiter.join().unwrap(), Err(KbQueueError::Cancelled(0))));
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Absent);
        assert!(!registry.is_collector_running());
        assert!(!source.is_acquired(0));
    }

    #[test]
    fn test_trigger_wait_releases_queue_on_start_failure() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = registry_with(&source);
        source.set_fail_acquire(0, true);

        assert!(matches!(
            registry.trigger_wait(0, &[45]),
            Err(KbQueueError::DeviceAcquisitionFailed(_))
        ));
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Absent);
    }

    #[test]
    fn test_acquisition_failure_leaves_slot_inactive() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = registry_with(&source);
        registry.create(0, None).unwrap();
        source.set_fail_acquire(0, true);

        assert!(matches!(registry.start(0), Err(KbQueueError::DeviceAcquisitionFailed(_))));
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Inactive);
        assert!(!registry.is_any_active());
        assert!(!registry.is_collector_running());
    }

    #[test]
    fn test_subscribe_failure_releases_device() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = registry_with(&source);
        registry.create(0, None).unwrap();
        source.set_fail_subscribe(0, true);

        assert!(matches!(registry.start(0), Err(KbQueueError::DeviceAcquisitionFailed(_))));
        assert!(!source.is_acquired(0));
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Inactive);
        assert!(!registry.is_collector_running());

        source.set_fail_subscribe(0, false);
        registry.start(0).unwrap();
        assert!(source.is_subscribed(0));
    }

    fn failing_spawn(_: Arc<Shared>, _: u64) -> std::io::Result<JoinHandle<()>> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "нет ресурсов для потока"))
    }

    #[test]
    fn test_spawn_failure_rolls_back() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = registry_with(&source).with_spawner(failing_spawn);
        registry.create(0, None).unwrap();

        assert!(matches!(registry.start(0), Err(KbQueueError::SystemFatal(_))));
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Inactive);
        assert!(!registry.is_any_active());
        assert!(!registry.is_collector_running());
        assert_eq!(registry.collectors_spawned(), 0);
        assert!(!source.is_acquired(0));
        assert!(!source.is_subscribed(0));
    }

    #[test]
    fn test_fetch_error_does_not_stop_other_devices() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(2));
        let registry = registry_with(&source);
        registry.create(0, None).unwrap();
        registry.create(1, None).unwrap();
        registry.start(0).unwrap();
        registry.start(1).unwrap();

        source.set_fail_fetch(0, true);
        source.inject_press(0, 30);
        source.inject_press(1, 31);
        wait_drained(&source, 1);

        assert!(registry.check(1).unwrap().first_press[31].is_some());
        assert!(registry.check(0).unwrap().is_empty());
        assert!(registry.is_collector_running());
    }

    #[test]
    fn test_missing_queue_and_bad_index() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = registry_with(&source);

        assert!(matches!(registry.start(0), Err(KbQueueError::NotFound(_))));
        assert!(matches!(registry.check(0), Err(KbQueueError::NotFound(_))));
        assert!(matches!(registry.flush(0), Err(KbQueueError::NotFound(_))));
        assert!(registry.stop(0).is_ok());
        assert!(registry.release(0).is_ok());

        assert!(matches!(registry.create(7, None), Err(KbQueueError::InvalidArgument(_))));
        assert!(matches!(
            registry.create(0, Some(&[true; 10])),
            Err(KbQueueError::InvalidArgument(_))
        ));
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Absent);
    }

    #[test]
    fn test_default_device_resolution() {
        let empty = Arc::new(SimulatedDeviceSource::with_keyboards(0));
        let registry = registry_with(&empty);
        assert!(matches!(registry.create(-1, None), Err(KbQueueError::NoDeviceAvailable)));

        let source = Arc::new(SimulatedDeviceSource::with_keyboards(2));
        let registry = registry_with(&source);
        registry.create(-1, None).unwrap();
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Inactive);
        assert_eq!(registry.queue_state(1).unwrap(), QueueState::Absent);
    }

    #[test]
    fn test_pointer_device_rejected() {
        let source = Arc::new(SimulatedDeviceSource::new(vec![
            DeviceInfo::new(0, "kbd", "sim://0", DeviceKind::Keyboard),
            DeviceInfo::new(1, "mouse", "sim://1", DeviceKind::Pointer),
        ]));
        let registry = registry_with(&source);
        assert!(matches!(registry.create(1, None), Err(KbQueueError::InvalidArgument(_))));
        assert!(matches!(registry.trigger_wait(1, &[45]), Err(KbQueueError::InvalidArgument(_))));
    }

    #[test]
    fn test_create_replaces_active_queue() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(1));
        let registry = registry_with(&source);
        registry.create(0, None).unwrap();
        registry.start(0).unwrap();

        registry.create(0, None).unwrap();
        assert_eq!(registry.queue_state(0).unwrap(), QueueState::Inactive);
        assert!(!registry.is_collector_running());
        assert!(!source.is_acquired(0));
    }

    #[test]
    fn test_max_devices_truncates_enumeration() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(5));
        let config = CollectorConfig {
            poll_timeout_ms: 10,
            max_devices: 3,
            realtime_priority: 0,
        };
        let registry = KbQueueRegistry::new(source, Arc::new(ManualClock::new(0.0)), &config).unwrap();
        assert_eq!(registry.devices().len(), 3);
        assert!(matches!(registry.create(3, None), Err(KbQueueError::InvalidArgument(_))));
    }

    #[test]
    fn test_drop_releases_devices() {
        let source = Arc::new(SimulatedDeviceSource::with_keyboards(2));
        {
            let registry = registry_with(&source);
            registry.create(0, None).unwrap();
            registry.create(1, None).unwrap();
            registry.start(0).unwrap();
            registry.start(1).unwrap();
        }
        assert!(!source.is_acquired(0));
        assert!(!source.is_acquired(1));
        assert!(!source.is_subscribed(0));
    }
}
