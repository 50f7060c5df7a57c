/// String helpers shared by configuration parsing and artifact layout.
pub struct StringUtil;

impl StringUtil {
    /// Convert a string to a boolean.
    ///
    /// Valid true values: `"1"`, `"true"`, `"yes"`, `"on"` (case-insensitive).
    /// Valid false values: `"0"`, `"false"`, `"no"`, `"off"` (case-insensitive).
    /// Returns `None` for unrecognized values.
    pub fn convert_to_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }

    /// Replace characters that are invalid in file names with `_`.
    ///
    /// Covers `< > : " / \ | ? *`, ASCII control characters, and whitespace so
    /// that job display names such as `test (3.10)` become directory names.
    pub fn format_into_safe_filename(name: &str) -> String {
        const INVALID: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '(', ')', ','];
        let mut result = String::with_capacity(name.len());
        let mut last_was_sep = false;
        for ch in name.trim().chars() {
            let replace = INVALID.contains(&ch) || ch.is_whitespace() || (ch as u32) < 0x20;
            if replace {
                if !last_was_sep {
                    result.push('_');
                }
                last_was_sep = true;
            } else {
                result.push(ch);
                last_was_sep = false;
            }
        }
        result.trim_matches('_').to_string()
    }

    /// Truncate `input` to at most `max_chars` characters, appending `...` when cut.
    pub fn truncate(input: &str, max_chars: usize) -> String {
        if input.chars().count() <= max_chars {
            return input.to_string();
        }
        let kept: String = input.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
