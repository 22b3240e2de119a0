use thiserror::Error;

#[derive(Error, Debug)]
pub enum KbQueueError {
    #[error("Неверный аргумент: {0}")]
    InvalidArgument(String),

    #[error("Очередь не найдена: {0}")]
    NotFound(String),

    #[error("Не найдено ни одного пригодного клавиатурного устройства")]
    NoDeviceAvailable,

    #[error("Не удалось захватить устройство: {0}")]
    DeviceAcquisitionFailed(String),

    #[error("Фатальная системная ошибка: {0}")]
    SystemFatal(String),

    #[error("Ожидание триггера отменено для устройства {0}")]
    Cancelled(usize),

    #[error("Ошибка ввода-вывода: {0}")]
    Io(#[from] std::io::Error),

    #[error("Недостаточно прав доступа: {0}")]
    Permission(String),
}

impl KbQueueError {
    pub fn invalid_argument<T>(msg: impl Into<String>) -> Result<T> {
        Err(KbQueueError::InvalidArgument(msg.into()))
    }

    pub fn not_found<T>(msg: impl Into<String>) -> Result<T> {
        Err(KbQueueError::NotFound(msg.into()))
    }
}

pub type Result<T> = std::result::Result<T, KbQueueError>;

// Удобные макросы для создания ошибок
#[macro_export]
macro_rules! kbq_error {
    (invalid_argument, $($arg:tt)*) => {
        $crate::error::KbQueueError::InvalidArgument(format!($($arg)*))
    };
    (not_found, $($arg:tt)*) => {
        $crate::error::KbQueueError::NotFound(format!($($arg)*))
    };
    (acquisition, $($arg:tt)*) => {
        $crate::error::KbQueueError::DeviceAcquisitionFailed(format!($($arg)*))
    };
    (fatal, $($arg:tt)*) => {
        $crate::error::KbQueueError::SystemFatal(format!($($arg)*))
    };
    (permission, $($arg:tt)*) => {
        $crate::error::KbQueueError::Permission(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_build_expected_variants() {
        let err = KbQueueError::invalid_argument::<()>("mask").unwrap_err();
        assert!(matches!(err, KbQueueError::InvalidArgument(ref m) if m == "mask"));

        let err = KbQueueError::not_found::<()>("slot 3").unwrap_err();
        assert!(matches!(err, KbQueueError::NotFound(_)));
    }

    #[test]
    fn test_macro_formats_message() {
        let err = kbq_error!(acquisition, "grab {} failed", 2);
        assert_eq!(
            err.to_string(),
            "Не удалось захватить устройство: grab 2 failed"
        );

        let err = kbq_error!(not_found, "slot {}", 4);
        assert!(matches!(err, KbQueueError::NotFound(ref m) if m == "slot 4"));

        let err = kbq_error!(permission, "{} закрыт", "/dev/input");
        assert!(matches!(err, KbQueueError::Permission(_)));
    }

    #[test]
    fn test_cancelled_names_slot() {
        assert_eq!(
            KbQueueError::Cancelled(2).to_string(),
            "Ожидание триггера отменено для устройства 2"
        );
    }
}
