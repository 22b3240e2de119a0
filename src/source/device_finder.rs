use crate::config::Config;
use crate::error::Result;
use crate::kbq_error;
use crate::source::DeviceKind;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Устройство, найденное при перечислении
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: PathBuf,
    pub name: String,
    pub kind: DeviceKind,
}

pub struct DeviceFinder;

impl DeviceFinder {
    /// Найти все устройства ввода. Клавиатуры идут первыми, чтобы слот 0
    /// всегда указывал на первую пригодную клавиатуру.
    pub fn find_devices(config: &Config) -> Result<Vec<FoundDevice>> {
        let candidates = if config.input.devices.is_empty() {
            Self::scan_event_devices(Path::new("/dev/input"))?
        } else {
            Self::explicit_devices(&config.input.devices)
        };

        let mut found: Vec<FoundDevice> = candidates
            .into_iter()
            .filter_map(|path| Self::classify(&path, config))
            .collect();

        // Стабильная сортировка: сначала клавиатуры, внутри класса порядок event-номеров
        found.sort_by_key(|device| device.kind != DeviceKind::Keyboard);

        let max = config.collector.max_devices;
        if found.len() > max {
            warn!(
                "Найдено {} устройств, что больше максимума {}. Лишние устройства пропущены",
                found.len(),
                max
            );
            found.truncate(max);
        }

        info!(
            "Перечислено устройств: {} (клавиатур: {})",
            found.len(),
            found.iter().filter(|d| d.kind == DeviceKind::Keyboard).count()
        );

        Ok(found)
    }

    fn explicit_devices(paths: &[String]) -> Vec<PathBuf> {
        paths
            .iter()
            .map(PathBuf::from)
            .filter(|path| {
                let exists = path.exists();
                if !exists {
                    warn!("Указанное устройство не найдено: {:?}", path);
                }
                exists
            })
            .collect()
    }

    fn scan_event_devices(input_dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(input_dir).map_err(|e| {
            kbq_error!(permission, "Нет доступа к {}: {}", input_dir.display(), e)
        })?;

        let mut event_devices = Vec::new();

        for entry in entries {
            let path = entry?.path();
            if let Some(number) = Self::event_number(&path) {
                event_devices.push((number, path));
            }
        }

        // Сортируем по номеру, а не лексикографически (event10 после event9)
        event_devices.sort_by_key(|(number, _)| *number);

        Ok(event_devices.into_iter().map(|(_, path)| path).collect())
    }

    /// Номер из имени вида `eventN`
    pub fn event_number(path: &Path) -> Option<u32> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(|name| name.strip_prefix("event"))
            .and_then(|digits| digits.parse().ok())
    }

    fn classify(path: &Path, config: &Config) -> Option<FoundDevice> {
        let device = match evdev::Device::open(path) {
            Ok(device) => device,
            Err(e) => {
                debug!("Не удалось открыть устройство {:?}: {}", path, e);
                return None;
            }
        };

        let name = device.name().unwrap_or("Unknown").to_string();

        let kind = if config.is_excluded_name(&name) {
            debug!("Исключаем устройство по имени: {:?} ({})", path, name);
            if device.supported_relative_axes().is_some() {
                DeviceKind::Pointer
            } else {
                DeviceKind::Other
            }
        } else if Self::looks_like_keyboard(&device) {
            DeviceKind::Keyboard
        } else if device.supported_relative_axes().is_some() {
            DeviceKind::Pointer
        } else {
            DeviceKind::Other
        };

        debug!("Устройство {:?} ({}) классифицировано как {:?}", path, name, kind);

        Some(FoundDevice {
            path: path.to_path_buf(),
            name,
            kind,
        })
    }

    fn looks_like_keyboard(device: &evdev::Device) -> bool {
        device.supported_keys().map_or(false, |keys| {
            // Проверяем наличие основных клавиш для клавиатуры
            let basic_keys = keys.contains(evdev::KeyCode::KEY_A)
                && keys.contains(evdev::KeyCode::KEY_SPACE)
                && keys.contains(evdev::KeyCode::KEY_ENTER);

            // У настоящей клавиатуры много клавиш
            basic_keys && keys.iter().count() > 20
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_number_parsing() {
        assert_eq!(DeviceFinder::event_number(Path::new("/dev/input/event12")), Some(12));
        assert_eq!(DeviceFinder::event_number(Path::new("/dev/input/mouse0")), None);
        assert_eq!(DeviceFinder::event_number(Path::new("/dev/input/eventX")), None);
    }

    #[test]
    fn test_explicit_missing_paths_are_skipped() {
        let paths = DeviceFinder::explicit_devices(&["/non/existent/event0".to_string()]);
        assert!(paths.is_empty());
    }

    #[test]
    fn test_scan_of_missing_directory_fails() {
        let result = DeviceFinder::scan_event_devices(Path::new("/non/existent/input"));
        assert!(matches!(result, Err(crate::error::KbQueueError::Permission(_))));
    }
}
