use crate::error::{KbQueueError, Result};
use crate::events::{KeyCode, KEY_COUNT};
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Маппинг между именами клавиш и логическими кодами (коды evdev < 256)
pub struct KeycodeMap;

// Статическая карта основных клавиш
static KEY_NAME_TO_CODE: Lazy<HashMap<&'static str, u8>> = Lazy::new(|| {
    let mut map = HashMap::new();

    // Буквенные клавиши
    map.insert("a", 30); // KEY_A
    map.insert("b", 48); // KEY_B
    map.insert("c", 46); // KEY_C
    map.insert("d", 32); // KEY_D
    map.insert("e", 18); // KEY_E
    map.insert("f", 33); // KEY_F
    map.insert("g", 34); // KEY_G
    map.insert("h", 35); // KEY_H
    map.insert("i", 23); // KEY_I
    map.insert("j", 36); // KEY_J
    map.insert("k", 37); // KEY_K
    map.insert("l", 38); // KEY_L
    map.insert("m", 50); // KEY_M
    map.insert("n", 49); // KEY_N
    map.insert("o", 24); // KEY_O
    map.insert("p", 25); // KEY_P
    map.insert("q", 16); // KEY_Q
    map.insert("r", 19); // KEY_R
    map.insert("s", 31); // KEY_S
    map.insert("t", 20); // KEY_T
    map.insert("u", 22); // KEY_U
    map.insert("v", 47); // KEY_V
    map.insert("w", 17); // KEY_W
    map.insert("x", 45); // KEY_X
    map.insert("y", 21); // KEY_Y
    map.insert("z", 44); // KEY_Z

    // Цифровые клавиши (верхний ряд)
    map.insert("1", 2); // KEY_1
    map.insert("2", 3); // KEY_2
    map.insert("3", 4); // KEY_3
    map.insert("4", 5); // KEY_4
    map.insert("5", 6); // KEY_5
    map.insert("6", 7); // KEY_6
    map.insert("7", 8); // KEY_7
    map.insert("8", 9); // KEY_8
    map.insert("9", 10); // KEY_9
    map.insert("0", 11); // KEY_0

    // Специальные клавиши
    map.insert("space", 57); // KEY_SPACE
    map.insert("enter", 28); // KEY_ENTER
    map.insert("escape", 1); // KEY_ESC
    map.insert("backspace", 14); // KEY_BACKSPACE
    map.insert("tab", 15); // KEY_TAB

    // Модификаторы
    map.insert("ctrl", 29); // KEY_LEFTCTRL
    map.insert("alt", 56); // KEY_LEFTALT
    map.insert("shift", 42); // KEY_LEFTSHIFT
    map.insert("super", 125); // KEY_LEFTMETA

    // Стрелки
    map.insert("up", 103); // KEY_UP
    map.insert("down", 108); // KEY_DOWN
    map.insert("left", 105); // KEY_LEFT
    map.insert("right", 106); // KEY_RIGHT

    // Функциональные
    let f_names = ["f1", "f2", "f3", "f4", "f5", "f6", "f7", "f8", "f9", "f10", "f11", "f12"];
    let f_codes = [59, 60, 61, 62, 63, 64, 65, 66, 67, 68, 87, 88]; // KEY_F1..KEY_F12
    map.extend(f_names.into_iter().zip(f_codes));

    map
});

static CODE_TO_KEY_NAME: Lazy<HashMap<u8, &'static str>> =
    Lazy::new(|| KEY_NAME_TO_CODE.iter().map(|(&name, &code)| (code, name)).collect());

impl KeycodeMap {
    /// Получить логический код клавиши по её имени
    pub fn get_keycode(key_name: &str) -> Option<KeyCode> {
        let normalized = key_name.to_lowercase();
        KEY_NAME_TO_CODE.get(normalized.as_str()).copied().map(KeyCode)
    }

    /// Получить имя клавиши по её коду
    pub fn get_key_name(code: KeyCode) -> Option<&'static str> {
        CODE_TO_KEY_NAME.get(&code.value()).copied()
    }

    /// Разобрать клавишу из командной строки: имя или логический код 0..=255.
    /// Одиночные цифры считаются именами клавиш верхнего ряда.
    pub fn parse_key(input: &str) -> Result<KeyCode> {
        let input = input.trim();
        if let Some(code) = Self::get_keycode(input) {
            return Ok(code);
        }
        match input.parse::<u16>() {
            Ok(code) if (code as usize) < KEY_COUNT => Ok(KeyCode(code as u8)),
            _ => KbQueueError::invalid_argument(format!("Неизвестная клавиша: {}", input)),
        }
    }

    /// Набор клавиш для ожидания триггера в нумерации с единицы
    pub fn trigger_keys<S: AsRef<str>>(keys: &[S]) -> Result<Vec<u16>> {
        keys
            .iter()
            .map(|key| Self::parse_key(key.as_ref()).map(|code| code.to_one_based()))
            .collect()
    }

    /// Человекочитаемое имя для вывода
    pub fn describe(code: KeyCode) -> String {
        match Self::get_key_name(code) {
            Some(name) => format!("{} ({})", name, code.value()),
            None => code.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_key_mapping() {
        assert_eq!(KeycodeMap::get_keycode("a"), Some(KeyCode(30)));
        assert_eq!(KeycodeMap::get_keycode("space"), Some(KeyCode(57)));
        assert_eq!(KeycodeMap::get_keycode("f12"), Some(KeyCode(88)));
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(KeycodeMap::get_keycode("A"), Some(KeyCode(30)));
        assert_eq!(KeycodeMap::get_keycode("SPACE"), Some(KeyCode(57)));
    }

    #[test]
    fn test_reverse_mapping() {
        assert_eq!(KeycodeMap::get_key_name(KeyCode(44)), Some("z"));
        assert_eq!(KeycodeMap::describe(KeyCode(57)), "space (57)");
        assert_eq!(KeycodeMap::describe(KeyCode(240)), "KEY_240");
    }

    #[test]
    fn test_parse_names_and_numbers() {
        assert_eq!(KeycodeMap::parse_key("z").unwrap(), KeyCode(44));
        assert_eq!(KeycodeMap::parse_key(" 200 ").unwrap(), KeyCode(200));
        assert!(KeycodeMap::parse_key("256").is_err());
        assert!(KeycodeMap::parse_key("invalid_key").is_err());
    }

    #[test]
    fn test_trigger_keys_are_one_based() {
        assert_eq!(KeycodeMap::trigger_keys(&["z", "0", "30"]).unwrap(), vec![45, 12, 31]);
        assert!(KeycodeMap::trigger_keys(&["nope"]).is_err());
    }
}
