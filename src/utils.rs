use crate::constants::MAX_DISPLAY_NAME_CHARS;

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub fn sanitize_name(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "Player".to_string();
    }
    trimmed.chars().take(MAX_DISPLAY_NAME_CHARS).collect()
}

/// Match ids are case-insensitive slugs of ASCII letters, digits, `-` and
/// `_`. Anything else is rejected.
pub fn normalize_match_id(raw: Option<&str>) -> Option<String> {
    let normalized = raw?.trim().to_ascii_lowercase();
    if normalized.is_empty() || normalized.len() > 64 {
        return None;
    }
    normalized
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        .then_some(normalized)
}

pub fn normalize_player_id(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    (!trimmed.is_empty() && trimmed.len() <= 64).then(|| trimmed.to_string())
}
