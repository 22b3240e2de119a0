use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kbqueue::config::{Config, LoggingConfig};
use kbqueue::error::KbQueueError;
use kbqueue::keycode_map::KeycodeMap;
use kbqueue::events::KEY_COUNT;
use kbqueue::queue::{DeviceSelector, KbQueueRegistry, QueueCheck};
use kbqueue::utils;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kbqueue")]
#[command(about = "Очереди событий клавиатуры: наблюдение за нажатиями и ожидание триггер-клавиши")]
struct Args {
    /// Путь к файлу конфигурации
    #[arg(short, long, default_value = "kbqueue.toml")]
    config: String,

    /// Режим сухого запуска (эмулятор вместо реальных устройств)
    #[arg(long)]
    dry_run: bool,

    /// Уровень логирования (перекрывает конфигурацию)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Показать найденные устройства ввода
    List,

    /// Периодически печатать нажатия, накопленные в очереди
    Watch {
        /// Индекс устройства (по умолчанию первое)
        #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
        device: i32,

        /// Отслеживать только эти клавиши (имена или коды)
        #[arg(short, long, num_args = 1..)]
        keys: Vec<String>,

        /// Интервал проверки очереди, мс
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
    },

    /// Дождаться нажатия любой из клавиш и напечатать момент
    Wait {
        #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
        device: i32,

        /// Триггер-клавиши (имена или коды)
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Загрузка конфигурации
    let config = Config::load(&args.config)?;

    // Инициализация системы логирования
    init_tracing(&config.logging, args.log_level.as_deref())?;

    info!("Запуск kbqueue v{}", env!("CARGO_PKG_VERSION"));
    info!("Конфигурация загружена из: {}", args.config);

    if args.dry_run {
        warn!("Режим сухого запуска - используется эмулятор устройств");
    } else {
        // Проверка прав доступа
        utils::permissions::check_permissions()?;
    }

    let registry = Arc::new(
        KbQueueRegistry::from_config(&config, args.dry_run).context("Не удалось инициализировать реестр очередей")?,
    );

    match args.command {
        Command::List => list_devices(&registry),
        Command::Watch {
            device,
            keys,
            interval_ms,
        } => watch(registry, DeviceSelector::from(device), &keys, interval_ms).await?,
        Command::Wait { device, keys } => wait(registry, DeviceSelector::from(device), &keys).await?,
    }

    info!("kbqueue завершил работу");
    Ok(())
}

fn list_devices(registry: &KbQueueRegistry) {
    let devices = registry.devices();
    if devices.is_empty() {
        println!("Устройства ввода не найдены");
        return;
    }
    for device in devices {
        println!("{}", device);
    }
}

async fn watch(registry: Arc<KbQueueRegistry>, device: DeviceSelector, keys: &[String], interval_ms: u64) -> Result<()> {
    let mask = if keys.is_empty() {
        None
    } else {
        let mut mask = vec![false; KEY_COUNT];
        for key in keys {
            mask[KeycodeMap::parse_key(key)?.index()] = true;
        }
        Some(mask)
    };

    registry.create(device, mask.as_deref())?;
    registry.start(device)?;
    info!("Наблюдение за устройством {} (Ctrl+C для выхода)", device);

    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let check = registry.check(device)?;
                print_check(&check);
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Получен сигнал завершения (Ctrl+C)"),
                    Err(err) => error!("Ошибка при ожидании сигнала завершения: {}", err),
                }
                break;
            }
        }
    }

    registry.release(device)?;
    Ok(())
}

fn print_check(check: &QueueCheck) {
    for (code, pressed_at) in check.pressed_keys() {
        let released = check.last_release[code.index()]
            .map(|t| format!(", отпущена {:.3}", t))
            .unwrap_or_default();
        println!("{:>10.3}  {}{}", pressed_at, KeycodeMap::describe(code), released);
    }
}

async fn wait(registry: Arc<KbQueueRegistry>, device: DeviceSelector, keys: &[String]) -> Result<()> {
    let trigger_keys = KeycodeMap::trigger_keys(keys)?;
    let started = registry.now();

    let waiter = {
        let registry = Arc::clone(&registry);
        tokio::task::spawn_blocking(move || registry.trigger_wait(device, &trigger_keys))
    };
    tokio::pin!(waiter);

    tokio::select! {
        joined = &mut waiter => {
            let fired = joined.context("Поток ожидания завершился аварийно")??;
            println!("{:.6}", fired);
            info!("Триггер сработал через {:.3} с", fired - started);
        }
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                error!("Ошибка при ожидании сигнала завершения: {}", err);
            }
            info!("Ожидание прервано (Ctrl+C)");
            // Отмена срабатывает и если поток ещё не успел создать очередь
            registry.cancel_trigger_wait(device)?;
            match waiter.await {
                Ok(Ok(fired)) => println!("{:.6}", fired),
                Ok(Err(KbQueueError::Cancelled(_))) => info!("Ожидание отменено"),
                Ok(Err(e)) => info!("Ожидание завершено: {}", e),
                Err(e) => error!("Поток ожидания завершился аварийно: {}", e),
            }
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig, level_override: Option<&str>) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let directive = match level_override {
        Some(level) => level.to_string(),
        None => logging.directive(),
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&directive))?;

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    }

    Ok(())
}
