use crate::error::Result;
use crate::kbq_error;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

const INPUT_DIR: &str = "/dev/input";

/// Проверить права доступа к устройствам ввода
pub fn check_permissions() -> Result<()> {
    info!("Проверка прав доступа...");

    check_input_devices_access(Path::new(INPUT_DIR))?;

    // Проверка, что не запущен от root (рекомендация безопасности)
    check_not_root();

    info!("Проверка прав доступа завершена успешно");
    Ok(())
}

fn check_input_devices_access(input_dir: &Path) -> Result<()> {
    if !input_dir.exists() {
        return Err(kbq_error!(permission, "Директория {} не существует", input_dir.display()));
    }

    // Проверяем возможность чтения директории
    match fs::read_dir(input_dir) {
        Ok(_) => {
            info!("Доступ к {} подтвержден", input_dir.display());
            Ok(())
        }
        Err(e) => Err(kbq_error!(
            permission,
            "Нет доступа к {}: {}. Добавьте пользователя в группу 'input'",
            input_dir.display(),
            e
        )),
    }
}

fn check_not_root() {
    // Проверяем переменную окружения USER
    match std::env::var("USER") {
        Ok(user) if user == "root" => {
            warn!("⚠️  Приложение запущено от имени root!");
            warn!("   Рекомендуется добавить пользователя в группу 'input'");
            warn!("   и запускать приложение от имени обычного пользователя:");
            for command in setup_commands() {
                warn!("   {}", command);
            }
        }
        Ok(user) => {
            info!("Приложение запущено от имени пользователя: {}", user);
        }
        Err(_) => {
            warn!("Не удалось определить пользователя");
        }
    }
}

/// Рекомендуемые команды для настройки прав доступа
pub fn setup_commands() -> Vec<String> {
    vec![
        "sudo usermod -a -G input $USER".to_string(),
        "(затем перезайдите в систему)".to_string(),
    ]
}
