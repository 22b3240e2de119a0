pub mod keyboard;

pub use keyboard::{KeyCode, KeyState, RawKeyEvent, KEY_COUNT};

/// Метка времени в секундах монотонных часов
pub type Timestamp = f64;
