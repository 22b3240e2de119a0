use super::registry::{RegistryState, Shared};
use crate::events::{KeyCode, Timestamp};
use crate::source::DeviceSource;
use crate::trace_if_enabled;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

const THREAD_NAME: &str = "kbqueue-collector";

/// Повторяющаяся ошибка чтения логируется на первом и каждом N-м цикле
const FAILURE_LOG_EVERY: u32 = 100;

/// Запустить сборщик. Он работает, пока эпоха в состоянии реестра
/// совпадает с `epoch`.
pub(crate) fn spawn(shared: Arc<Shared>, epoch: u64) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || run(shared, epoch))
}

fn run(shared: Arc<Shared>, epoch: u64) {
    info!("Сборщик событий запущен (эпоха {})", epoch);

    let priority = shared.realtime_priority;
    match raise_priority(priority) {
        Ok(()) if priority > 0 => info!("Поток сборщика переведён в SCHED_FIFO с приоритетом {}", priority),
        Ok(()) => {}
        Err(e) => warn!(
            "Не удалось перевести поток сборщика в SCHED_FIFO ({}): {}. Метки времени могут быть менее точными",
            priority, e
        ),
    }

    loop {
        if shared.state.lock().epoch != epoch {
            break;
        }

        // Ожидание вне блокировки: остальные вызовы не ждут ввода-вывода
        shared.source.wait_for_any_change(shared.poll_timeout);

        // Одна метка времени на весь цикл пробуждения
        let now = shared.clock.now();

        let mut state = shared.state.lock();
        if state.epoch != epoch {
            break;
        }

        let recorded = process_cycle(shared.source.as_ref(), &mut state, now);
        if recorded > 0 {
            shared.changed.notify_all();
        }
    }

    info!("Сборщик событий остановлен (эпоха {})", epoch);
}

/// Перевести текущий поток в SCHED_FIFO. Приоритет 0 ничего не меняет.
fn raise_priority(priority: u8) -> std::io::Result<()> {
    if priority == 0 {
        return Ok(());
    }

    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority as libc::c_int;

    // pthread_setschedparam возвращает код ошибки, errno не используется
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc != 0 {
        return Err(std::io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

/// Выбрать все буферизованные события активных слотов и записать их.
/// Возвращает число записанных (прошедших маску) событий.
pub(crate) fn process_cycle(source: &dyn DeviceSource, state: &mut RegistryState, now: Timestamp) -> usize {
    let mut recorded = 0;

    let slots = state.queues.iter_mut().zip(state.fetch_failures.iter_mut());
    for (slot, (entry, failures)) in slots.enumerate() {
        let Some(queue) = entry.as_mut().filter(|queue| queue.active) else {
            continue;
        };

        loop {
            match source.fetch_next_raw_event(slot) {
                Ok(Some(event)) => {
                    let code = source
                        .translate_raw_code_to_logical(event.raw_code)
                        .unwrap_or((event.raw_code & 0xff) as u8);
                    let code = KeyCode(code);

                    if queue.apply(code, event.state, now) {
                        recorded += 1;
                        trace_if_enabled!("Слот {}: {} {:?} в {:.6}", slot, code, event.state, now);
                    }
                }
                Ok(None) => {
                    if *failures > 0 {
                        info!("Чтение слота {} восстановлено после {} ошибок", slot, failures);
                        *failures = 0;
                    }
                    break;
                }
                Err(e) => {
                    // Ошибка одного устройства не останавливает сборщик
                    *failures += 1;
                    if *failures == 1 || *failures % FAILURE_LOG_EVERY == 0 {
                        warn!(
                            "Ошибка чтения событий слота {} (подряд: {}): {}. Пропускаем до следующего цикла",
                            slot, failures, e
                        );
                    }
                    break;
                }
            }
        }
    }

    recorded
}
