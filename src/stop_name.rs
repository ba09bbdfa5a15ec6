use regex::Regex;
use std::sync::LazyLock;

// Trailing platform / bay code, e.g. "Central (PA1)".
static PLATFORM_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+\([A-Za-z0-9]+\)\s*$").expect("valid platform regex"));

/// Collapses cosmetic variants of a stop name into one display key.
///
/// Stacked annotations are removed as well, which keeps the function
/// idempotent.
pub fn normalize(raw_name: &str) -> String {
    let mut name = raw_name;
    while let Some(m) = PLATFORM_SUFFIX.find(name) {
        name = &name[..m.start()];
    }
    name.trim().to_string()
}
