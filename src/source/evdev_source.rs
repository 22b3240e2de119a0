use super::device_finder::{DeviceFinder, FoundDevice};
use super::{DeviceInfo, DeviceSource};
use crate::config::Config;
use crate::error::{KbQueueError, Result};
use crate::events::{KeyState, RawKeyEvent, KEY_COUNT};
use crate::{kbq_error, trace_if_enabled};
use evdev::{Device, EventType};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Открытое устройство. Закрывается только вместе с источником,
/// поэтому его дескриптор остаётся валидным для poll(2).
struct OpenDevice {
    device: Device,
    pending: VecDeque<RawKeyEvent>,
    grabbed: bool,
    subscribed: bool,
    /// Устройство отключено: дескриптор больше не опрашивается
    gone: bool,
}

/// Источник событий на базе Linux evdev
pub struct EvdevDeviceSource {
    found: Vec<FoundDevice>,
    open: Mutex<HashMap<usize, OpenDevice>>,
}

impl EvdevDeviceSource {
    pub fn new(config: &Config) -> Result<Self> {
        info!("Инициализация EvdevDeviceSource");
        let found = DeviceFinder::find_devices(config)?;

        Ok(Self {
            found,
            open: Mutex::new(HashMap::new()),
        })
    }

    fn found_device(&self, slot: usize) -> Result<&FoundDevice> {
        self.found
            .get(slot)
            .ok_or_else(|| kbq_error!(invalid_argument, "Нет устройства в слоте {}", slot))
    }

    fn open_device(&self, slot: usize) -> Result<Device> {
        let found = self.found_device(slot)?;
        let device = Device::open(&found.path).map_err(|e| {
            kbq_error!(acquisition, "Не удалось открыть устройство {:?}: {}", found.path, e)
        })?;

        set_nonblocking(&device).map_err(|e| {
            kbq_error!(acquisition, "Не удалось перевести {:?} в неблокирующий режим: {}", found.path, e)
        })?;

        debug!("Устройство {:?} открыто в неблокирующем режиме", found.path);
        Ok(device)
    }

    /// Прочитать всё, что накопилось в буфере ядра, в очередь `pending`
    fn read_into_pending(open: &mut OpenDevice) -> std::io::Result<()> {
        match open.device.fetch_events() {
            Ok(events) => {
                for event in events {
                    if event.event_type() != EventType::KEY {
                        continue;
                    }
                    if let Some(raw) = key_transition(event.code(), event.value()) {
                        open.pending.push_back(raw);
                    }
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn mark_gone(slot: usize, open: &mut OpenDevice) {
        if !open.gone {
            warn!("Устройство в слоте {} отключено, опрос прекращён", slot);
        }
        open.gone = true;
        open.subscribed = false;
        open.grabbed = false;
        open.pending.clear();
    }

    fn drain_stale(open: &mut OpenDevice) {
        if let Err(e) = Self::read_into_pending(open) {
            debug!("Ошибка при сбросе устаревших событий: {}", e);
        }
        open.pending.clear();
    }
}

impl DeviceSource for EvdevDeviceSource {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .found
            .iter()
            .enumerate()
            .map(|(index, found)| {
                DeviceInfo::new(index, found.name.clone(), found.path.display().to_string(), found.kind)
            })
            .collect())
    }

    fn acquire(&self, slot: usize) -> Result<()> {
        let mut open = self.open.lock();

        // После отключения дескриптор мёртв, устройство открывается заново
        if open.get(&slot).map_or(false, |entry| entry.gone) {
            open.remove(&slot);
        }

        if !open.contains_key(&slot) {
            let device = self.open_device(slot)?;
            open.insert(
                slot,
                OpenDevice {
                    device,
                    pending: VecDeque::new(),
                    grabbed: false,
                    subscribed: false,
                    gone: false,
                },
            );
        }

        let Some(entry) = open.get_mut(&slot) else {
            return Err(kbq_error!(fatal, "Слот {} пропал во время захвата", slot));
        };

        if entry.grabbed {
            return Ok(());
        }

        // События, накопленные пока устройство не было захвачено, не относятся к новой сессии
        Self::drain_stale(entry);

        entry.device.grab().map_err(|e| {
            warn!("Не удалось захватить устройство в слоте {}: {}", slot, e);
            warn!("Попробуйте добавить пользователя в группу input: sudo usermod -a -G input $USER");
            kbq_error!(acquisition, "Не удалось захватить устройство эксклюзивно: {}", e)
        })?;
        entry.grabbed = true;

        info!(
            "Устройство {} захвачено эксклюзивно",
            entry.device.name().unwrap_or("Unknown")
        );
        Ok(())
    }

    fn release(&self, slot: usize) -> Result<()> {
        let mut open = self.open.lock();
        let Some(entry) = open.get_mut(&slot) else {
            return Ok(());
        };

        if entry.grabbed && !entry.gone {
            entry.device.ungrab().map_err(|e| {
                kbq_error!(acquisition, "Не удалось освободить устройство в слоте {}: {}", slot, e)
            })?;
            entry.grabbed = false;
            info!("Устройство в слоте {} освобождено", slot);
        }
        entry.pending.clear();
        Ok(())
    }

    fn subscribe(&self, slot: usize) -> Result<()> {
        let mut open = self.open.lock();
        match open.get_mut(&slot) {
            Some(entry) => {
                entry.subscribed = true;
                Ok(())
            }
            None => Err(kbq_error!(acquisition, "Слот {} не захвачен, подписка невозможна", slot)),
        }
    }

    fn unsubscribe(&self, slot: usize) -> Result<()> {
        if let Some(entry) = self.open.lock().get_mut(&slot) {
            entry.subscribed = false;
        }
        Ok(())
    }

    fn fetch_next_raw_event(&self, slot: usize) -> Result<Option<RawKeyEvent>> {
        let mut open = self.open.lock();
        let Some(entry) = open.get_mut(&slot) else {
            return Ok(None);
        };
        if entry.gone {
            return Ok(None);
        }

        if entry.pending.is_empty() {
            if let Err(e) = Self::read_into_pending(entry) {
                if is_device_gone(&e) {
                    Self::mark_gone(slot, entry);
                    return Ok(None);
                }
                return Err(KbQueueError::Io(e));
            }
        }

        let event = entry.pending.pop_front();
        if let Some(event) = event {
            trace_if_enabled!("evdev слот {}: {}", slot, event);
        }
        Ok(event)
    }

    fn wait_for_any_change(&self, timeout: Duration) {
        let (slots, mut fds): (Vec<usize>, Vec<libc::pollfd>) = {
            let open = self.open.lock();
            if open
                .values()
                .any(|entry| entry.subscribed && !entry.gone && !entry.pending.is_empty())
            {
                return;
            }
            open.iter()
                .filter(|(_, entry)| entry.subscribed && !entry.gone)
                .map(|(&slot, entry)| {
                    let fd = libc::pollfd {
                        fd: entry.device.as_raw_fd(),
                        events: libc::POLLIN,
                        revents: 0,
                    };
                    (slot, fd)
                })
                .unzip()
        };

        if fds.is_empty() {
            std::thread::sleep(timeout);
            return;
        }

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                warn!("poll(2) завершился с ошибкой: {}", err);
                std::thread::sleep(timeout);
            }
            return;
        }

        // POLLHUP/POLLERR повторяются на каждом вызове, такие устройства исключаются
        if fds.iter().any(|fd| revents_mean_gone(fd.revents)) {
            let mut open = self.open.lock();
            for (slot, fd) in slots.iter().zip(&fds) {
                if revents_mean_gone(fd.revents) {
                    if let Some(entry) = open.get_mut(slot) {
                        Self::mark_gone(*slot, entry);
                    }
                }
            }
        }
    }

    fn translate_raw_code_to_logical(&self, raw_code: u16) -> Option<u8> {
        // Коды клавиш evdev уже платформенно-независимы в пределах таблицы
        if (raw_code as usize) < KEY_COUNT {
            Some(raw_code as u8)
        } else {
            None
        }
    }
}

impl Drop for EvdevDeviceSource {
    fn drop(&mut self) {
        for (slot, entry) in self.open.get_mut().iter_mut() {
            if entry.grabbed && !entry.gone {
                info!("Освобождение захваченного устройства в слоте {}", slot);
                if let Err(e) = entry.device.ungrab() {
                    warn!("Не удалось освободить устройство: {}", e);
                }
            }
        }
    }
}

/// Переход клавиши evdev. Автоповтор и коды вне таблицы отбрасываются,
/// чтобы старшие коды (KEY_FN и т.п.) не совпадали с обычными клавишами.
fn key_transition(code: u16, value: i32) -> Option<RawKeyEvent> {
    if code as usize >= KEY_COUNT {
        return None;
    }
    KeyState::from_evdev_value(value).map(|state| RawKeyEvent::new(code, state))
}

fn is_device_gone(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENODEV)
}

fn revents_mean_gone(revents: libc::c_short) -> bool {
    revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
}

fn set_nonblocking(device: &Device) -> std::io::Result<()> {
    let raw_fd = device.as_raw_fd();

    // Сохраняем существующие флаги, добавляем O_NONBLOCK
    let current = unsafe { libc::fcntl(raw_fd, libc::F_GETFL) };
    if current < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let rc = unsafe { libc::fcntl(raw_fd, libc::F_SETFL, current | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_source() -> EvdevDeviceSource {
        EvdevDeviceSource {
            found: Vec::new(),
            open: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn test_translation_keeps_table_codes() {
        let source = empty_source();
        assert_eq!(source.translate_raw_code_to_logical(30), Some(30));
        assert_eq!(source.translate_raw_code_to_logical(255), Some(255));
        assert_eq!(source.translate_raw_code_to_logical(0x110), None);
    }

    #[test]
    fn test_unknown_slot_is_rejected() {
        let source = empty_source();
        assert!(matches!(source.acquire(0), Err(KbQueueError::InvalidArgument(_))));
        assert!(source.release(0).is_ok());
        assert!(matches!(source.fetch_next_raw_event(0), Ok(None)));
    }

    #[test]
    fn test_high_codes_and_autorepeat_are_dropped() {
        assert_eq!(key_transition(30, 1), Some(RawKeyEvent::press(30)));
        assert_eq!(key_transition(30, 0), Some(RawKeyEvent::release(30)));
        assert_eq!(key_transition(30, 2), None);
        // KEY_FN не должен превращаться в код 208
        assert_eq!(key_transition(0x1d0, 1), None);
    }

    #[test]
    fn test_unplug_detection() {
        assert!(is_device_gone(&std::io::Error::from_raw_os_error(libc::ENODEV)));
        assert!(!is_device_gone(&std::io::Error::from(ErrorKind::WouldBlock)));

        assert!(revents_mean_gone(libc::POLLHUP));
        assert!(revents_mean_gone(libc::POLLIN | libc::POLLERR));
        assert!(!revents_mean_gone(libc::POLLIN));
        assert!(!revents_mean_gone(0));
    }

    #[test]
    fn test_wait_without_subscriptions_sleeps_for_timeout() {
        let source = empty_source();
        let start = std::time::Instant::now();
        source.wait_for_any_change(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
