//! Очереди клавиатурных событий для нескольких устройств.
//!
//! Каждое устройство получает собственные таблицы первых и последних
//! нажатий/отпусканий. Один фоновый поток собирает события всех активных
//! устройств, а `KbQueueRegistry::trigger_wait` блокирует вызывающего до
//! нажатия одной из заданных клавиш.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod keycode_map;
pub mod queue;
pub mod source;
pub mod utils;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::Config;
pub use error::{KbQueueError, Result};
pub use events::{KeyCode, KeyState, RawKeyEvent, Timestamp};
pub use queue::{DeviceSelector, KbQueueRegistry, QueueCheck, QueueState, ScanMask};
pub use source::{DeviceInfo, DeviceKind, DeviceSource};
