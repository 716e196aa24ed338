fn parse_env_bool(var: &str) -> Option<bool> {
    std::env::var(var).ok().and_then(|value| parse_bool_word(&value))
}

fn parse_bool_word(value: &str) -> Option<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" | "enable" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disable" | "disabled" => Some(false),
        _ => None,
    }
}

pub fn api_url_override() -> Option<String> {
    std::env::var("AI_STUDIO_API_URL")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn device_poll_enabled() -> bool {
    parse_env_bool("AI_STUDIO_SKIP_DEVICE_POLL")
        .map(|skip| !skip)
        .unwrap_or(true)
}
