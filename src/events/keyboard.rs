use serde::{Deserialize, Serialize};
use std::fmt;

/// Количество логических кодов клавиш в таблицах очереди
pub const KEY_COUNT: usize = 256;

/// Состояние клавиши в сыром переходе
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyState {
    Pressed,
    Released,
}

impl KeyState {
    /// Значение evdev: 1 = нажатие, 0 = отпускание.
    /// Автоповтор (2) не является переходом и отбрасывается.
    pub fn from_evdev_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(KeyState::Pressed),
            0 => Some(KeyState::Released),
            _ => None,
        }
    }

    pub fn is_pressed(&self) -> bool {
        matches!(self, KeyState::Pressed)
    }
}

/// Логический код клавиши (0..=255), индекс в таблицах очереди
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyCode(pub u8);

impl KeyCode {
    pub fn new(code: u8) -> Self {
        Self(code)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// Код триггер-клавиши в нумерации с единицы (1..=256)
    pub fn from_one_based(code: u16) -> Option<Self> {
        if (1..=KEY_COUNT as u16).contains(&code) {
            Some(Self((code - 1) as u8))
        } else {
            None
        }
    }

    pub fn to_one_based(&self) -> u16 {
        self.0 as u16 + 1
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KEY_{}", self.0)
    }
}

/// Сырой переход клавиши от источника устройств
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawKeyEvent {
    pub raw_code: u16,
    pub state: KeyState,
}

impl RawKeyEvent {
    pub fn new(raw_code: u16, state: KeyState) -> Self {
        Self { raw_code, state }
    }

    pub fn press(raw_code: u16) -> Self {
        Self::new(raw_code, KeyState::Pressed)
    }

    pub fn release(raw_code: u16) -> Self {
        Self::new(raw_code, KeyState::Released)
    }
}

impl fmt::Display for RawKeyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "raw={} {:?}", self.raw_code, self.state)
    }
}
