//! Очереди клавиатурных событий по устройствам: общий реестр, фоновый
//! сборщик и ожидание триггер-клавиши.

mod collector;
mod registry;
pub mod timeline;

pub use registry::{KbQueueRegistry, QueueState};
pub use timeline::{DeviceQueue, KeyTimeline, QueueCheck, ScanMask};

use std::fmt;

/// Какое устройство имеет в виду вызывающий
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceSelector {
    /// Первое перечисленное устройство (слот 0)
    Default,
    Slot(usize),
}

impl From<i32> for DeviceSelector {
    /// Отрицательный индекс означает устройство по умолчанию
    fn from(index: i32) -> Self {
        if index < 0 {
            DeviceSelector::Default
        } else {
            DeviceSelector::Slot(index as usize)
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Default => write!(f, "default"),
            DeviceSelector::Slot(slot) => write!(f, "{}", slot),
        }
    }
}
