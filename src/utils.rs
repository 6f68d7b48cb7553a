use crate::error::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::path::Path;

/// Which bound, if any, a value was pinned to by [`clamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clamped {
    None,
    Floor,
    Ceil,
}

pub fn clamp(value: f64, floor: Option<f64>, ceil: Option<f64>) -> (f64, Clamped) {
    match (floor, ceil) {
        (Some(floor), _) if value < floor => (floor, Clamped::Floor),
        (_, Some(ceil)) if value > ceil => (ceil, Clamped::Ceil),
        _ => (value, Clamped::None),
    }
}

/// Formats a ratio as a percentage, `0.873` -> `87.3%` at precision 1.
pub fn percent(ratio: f64, precision: usize) -> String {
    format!("{:.*}%", precision, ratio * 100.0)
}

pub fn base64_to_bytes(base64: &str) -> Result<Vec<u8>> {
    Ok(BASE64.decode(base64.trim())?)
}

pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

/// Endpoints are joined relative to the base URL, which therefore needs a
/// trailing slash to keep any path prefix.
pub fn normalize_api_url(url: &str) -> String {
    let url = url.trim();
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}
