//! Таблицы нажатий/отпусканий одного устройства и маска сканируемых клавиш.

use crate::error::{KbQueueError, Result};
use crate::events::{KeyCode, KeyState, Timestamp, KEY_COUNT};
use smallvec::SmallVec;

/// Маска клавиш: события для выключенных кодов игнорируются
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanMask {
    enabled: [bool; KEY_COUNT],
}

impl ScanMask {
    pub fn all() -> Self {
        Self {
            enabled: [true; KEY_COUNT],
        }
    }

    pub fn none() -> Self {
        Self {
            enabled: [false; KEY_COUNT],
        }
    }

    /// Маска из вектора ровно в 256 элементов
    pub fn from_slice(mask: &[bool]) -> Result<Self> {
        if mask.len() != KEY_COUNT {
            return KbQueueError::invalid_argument(format!(
                "Маска клавиш должна содержать {} элементов, получено {}",
                KEY_COUNT,
                mask.len()
            ));
        }
        let mut enabled = [false; KEY_COUNT];
        enabled.copy_from_slice(mask);
        Ok(Self { enabled })
    }

    /// Маска из набора триггер-клавиш в нумерации с единицы (1..=256)
    pub fn from_trigger_keys(keys: &[u16]) -> Result<(Self, SmallVec<[KeyCode; 8]>)> {
        if keys.is_empty() {
            return KbQueueError::invalid_argument("Набор триггер-клавиш пуст");
        }

        let mut mask = Self::none();
        let mut codes: SmallVec<[KeyCode; 8]> = SmallVec::new();
        for &key in keys {
            let code = KeyCode::from_one_based(key).ok_or_else(|| {
                KbQueueError::InvalidArgument(format!(
                    "Неверная триггер-клавиша {}: допустимый диапазон 1 - {}",
                    key, KEY_COUNT
                ))
            })?;
            mask.set(code, true);
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
        Ok((mask, codes))
    }

    pub fn is_enabled(&self, code: KeyCode) -> bool {
        self.enabled[code.index()]
    }

    pub fn set(&mut self, code: KeyCode, enabled: bool) {
        self.enabled[code.index()] = enabled;
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled.iter().filter(|&&e| e).count()
    }
}

impl Default for ScanMask {
    fn default() -> Self {
        Self::all()
    }
}

type Table = [Option<Timestamp>; KEY_COUNT];

/// Четыре таблицы меток времени, индексированные логическим кодом клавиши
#[derive(Debug, Clone, PartialEq)]
pub struct KeyTimeline {
    first_press: Table,
    first_release: Table,
    last_press: Table,
    last_release: Table,
}

impl KeyTimeline {
    pub fn new() -> Self {
        Self {
            first_press: [None; KEY_COUNT],
            first_release: [None; KEY_COUNT],
            last_press: [None; KEY_COUNT],
            last_release: [None; KEY_COUNT],
        }
    }

    /// Записать переход: `last_*` перезаписывается всегда,
    /// `first_*` только если ещё пусто.
    pub fn record(&mut self, code: KeyCode, state: KeyState, at: Timestamp) {
        let i = code.index();
        let (first, last) = match state {
            KeyState::Pressed => (&mut self.first_press, &mut self.last_press),
            KeyState::Released => (&mut self.first_release, &mut self.last_release),
        };
        if first[i].is_none() {
            first[i] = Some(at);
        }
        last[i] = Some(at);
    }

    pub fn first_press(&self, code: KeyCode) -> Option<Timestamp> {
        self.first_press[code.index()]
    }

    pub fn last_press(&self, code: KeyCode) -> Option<Timestamp> {
        self.last_press[code.index()]
    }

    pub fn first_release(&self, code: KeyCode) -> Option<Timestamp> {
        self.first_release[code.index()]
    }

    pub fn last_release(&self, code: KeyCode) -> Option<Timestamp> {
        self.last_release[code.index()]
    }

    pub fn any_pressed(&self, codes: &[KeyCode]) -> bool {
        codes.iter().any(|code| self.first_press[code.index()].is_some())
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn is_empty(&self) -> bool {
        [&self.first_press, &self.first_release, &self.last_press, &self.last_release]
            .iter()
            .all(|table| table.iter().all(Option::is_none))
    }

    /// Прочитать и обнулить все четыре таблицы
    pub fn take(&mut self) -> QueueCheck {
        let taken = std::mem::take(self);
        QueueCheck {
            has_key_been_down: taken.first_press.iter().any(Option::is_some),
            first_press: taken.first_press,
            first_release: taken.first_release,
            last_press: taken.last_press,
            last_release: taken.last_release,
        }
    }
}

impl Default for KeyTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Результат проверки очереди: потребленные таблицы
#[derive(Debug, Clone, PartialEq)]
pub struct QueueCheck {
    pub has_key_been_down: bool,
    pub first_press: Table,
    pub first_release: Table,
    pub last_press: Table,
    pub last_release: Table,
}

impl QueueCheck {
    /// Коды клавиш, нажатых с момента прошлой проверки, по возрастанию
    pub fn pressed_keys(&self) -> impl Iterator<Item = (KeyCode, Timestamp)> + '_ {
        self.first_press
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.map(|t| (KeyCode(i as u8), t)))
    }

    pub fn is_empty(&self) -> bool {
        !self.has_key_been_down
            && self.first_release.iter().all(Option::is_none)
            && self.last_press.iter().all(Option::is_none)
            && self.last_release.iter().all(Option::is_none)
    }
}

/// Состояние очереди одного слота
#[derive(Debug, Clone)]
pub struct DeviceQueue {
    /// Уникален в пределах реестра, различает пересозданные очереди слота
    pub id: u64,
    pub timeline: KeyTimeline,
    pub mask: ScanMask,
    pub active: bool,
}

impl DeviceQueue {
    pub fn new(mask: ScanMask) -> Self {
        Self::with_id(0, mask)
    }

    pub fn with_id(id: u64, mask: ScanMask) -> Self {
        Self {
            id,
            timeline: KeyTimeline::new(),
            mask,
            active: false,
        }
    }

    /// Записать переход, если маска пропускает клавишу
    pub fn apply(&mut self, code: KeyCode, state: KeyState, at: Timestamp) -> bool {
        if !self.mask.is_enabled(code) {
            return false;
        }
        self.timeline.record(code, state, at);
        true
    }
}
