use crate::error::{Error, Result};
use crate::utils::{clamp, format_timestamp, percent, Clamped};
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Rate-limit snapshot taken from the headers of a single response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    /// Unix timestamp, in seconds.
    pub reset: i64,
}

impl RateLimitInfo {
    /// Missing or unparsable headers count as zero.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            limit: header_number(headers, RATE_LIMIT_LIMIT),
            remaining: header_number(headers, RATE_LIMIT_REMAINING),
            reset: header_number(headers, RATE_LIMIT_RESET),
        }
    }

    pub fn reset_datetime(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(self.reset, 0).unwrap_or_default()
    }

    /// Time left until the window resets, measured from now. Negative once
    /// the reset time has passed.
    pub fn reset_timedelta(&self) -> TimeDelta {
        self.reset_datetime() - Utc::now()
    }
}

fn header_number<T>(headers: &HeaderMap, name: &str) -> T
where
    T: std::str::FromStr + Default,
{
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or_default()
}

/// Anilist entry as returned when `anilistInfo` is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnilistInfo {
    pub id: u64,
    #[serde(rename = "idMal", default)]
    pub id_mal: Option<u64>,
    /// Keyed by language: `native`, `romaji`, `english`, ...
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: BTreeMap<String, Option<String>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub synonyms: Vec<String>,
    #[serde(rename = "isAdult", default)]
    pub is_adult: bool,
}

impl AnilistInfo {
    pub fn mal_url(&self) -> Option<String> {
        self.id_mal
            .map(|id| format!("https://myanimelist.net/anime/{}", id))
    }

    pub fn title(&self, language: &str) -> Option<&str> {
        self.title.get(language).and_then(|t| t.as_deref())
    }

    pub fn preferred_title(&self) -> Option<&str> {
        self.title("english")
            .or_else(|| self.title("romaji"))
            .or_else(|| self.title("native"))
    }
}

/// The `anilist` field of a match: a bare id unless Anilist info was asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnilistRef {
    Id(u64),
    Info(AnilistInfo),
}

impl AnilistRef {
    pub fn id(&self) -> u64 {
        match self {
            AnilistRef::Id(id) => *id,
            AnilistRef::Info(info) => info.id,
        }
    }

    pub fn info(&self) -> Option<&AnilistInfo> {
        match self {
            AnilistRef::Id(_) => None,
            AnilistRef::Info(info) => Some(info),
        }
    }

    pub fn is_adult(&self) -> Option<bool> {
        self.info().map(|info| info.is_adult)
    }

    pub fn mal_url(&self) -> Option<String> {
        self.info().and_then(AnilistInfo::mal_url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EpisodeValue {
    Number(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for EpisodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpisodeValue::Number(n) => write!(f, "{}", n),
            EpisodeValue::Float(n) => write!(f, "{}", n),
            EpisodeValue::Text(s) => f.write_str(s),
        }
    }
}

/// Episode guess parsed from the filename. Batches can yield several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Episode {
    Single(EpisodeValue),
    List(Vec<EpisodeValue>),
}

impl fmt::Display for Episode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Episode::Single(value) => value.fmt(f),
            Episode::List(values) => {
                let joined: Vec<String> = values.iter().map(ToString::to_string).collect();
                f.write_str(&joined.join(", "))
            }
        }
    }
}

/// Formatting for [`SearchMatch::short_similarity_with`].
///
/// A clamped value is prefixed with a token telling how the shown figure
/// relates to the real one: pinned down to `ceil` gives `<`, pinned up to
/// `floor` gives `>`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityFormat {
    pub precision: usize,
    pub floor: Option<f64>,
    pub ceil: Option<f64>,
    pub floor_token: String,
    pub ceil_token: String,
}

impl Default for SimilarityFormat {
    fn default() -> Self {
        Self {
            precision: 1,
            floor: None,
            ceil: None,
            floor_token: ">".to_string(),
            ceil_token: "<".to_string(),
        }
    }
}

impl SimilarityFormat {
    pub fn floor(mut self, floor: f64) -> Self {
        self.floor = Some(floor);
        self
    }

    pub fn ceil(mut self, ceil: f64) -> Self {
        self.ceil = Some(ceil);
        self
    }

    pub fn precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    pub fn tokens(mut self, floor_token: &str, ceil_token: &str) -> Self {
        self.floor_token = floor_token.to_string();
        self.ceil_token = ceil_token.to_string();
        self
    }

    pub fn format(&self, ratio: f64) -> String {
        let (value, clamped) = clamp(ratio, self.floor, self.ceil);
        let token = match clamped {
            Clamped::None => "",
            Clamped::Floor => self.floor_token.as_str(),
            Clamped::Ceil => self.ceil_token.as_str(),
        };
        format!("{}{}", token, percent(value, self.precision))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub anilist: AnilistRef,
    pub filename: String,
    #[serde(default)]
    pub episode: Option<Episode>,
    /// Start of the matched scene, in seconds.
    #[serde(rename = "from")]
    pub anime_from: f64,
    /// End of the matched scene, in seconds.
    #[serde(rename = "to")]
    pub anime_to: f64,
    /// Between 0 and 1.
    pub similarity: f64,
    pub video: String,
    pub image: String,
}

impl SearchMatch {
    pub fn short_similarity(&self) -> String {
        self.short_similarity_with(&SimilarityFormat::default())
    }

    pub fn short_similarity_with(&self, format: &SimilarityFormat) -> String {
        format.format(self.similarity)
    }

    pub fn scene_start(&self) -> Duration {
        seconds_to_duration(self.anime_from)
    }

    pub fn scene_end(&self) -> Duration {
        seconds_to_duration(self.anime_to)
    }

    /// `H:MM:SS - H:MM:SS`
    pub fn timestamp(&self) -> String {
        format!(
            "{} - {}",
            format_timestamp(self.anime_from),
            format_timestamp(self.anime_to)
        )
    }
}

/// Negative values become zero, values past `Duration::MAX` saturate.
fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(rename = "frameCount", default)]
    pub frame_count: Option<u64>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub error: Option<String>,
    #[serde(rename = "result", default, deserialize_with = "null_as_default")]
    pub matches: Vec<SearchMatch>,
    #[serde(skip)]
    pub limits: RateLimitInfo,
}

impl SearchResult {
    pub fn best_match(&self) -> Option<&SearchMatch> {
        self.matches.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    /// IP address or account email.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub priority: i64,
    pub concurrency: i64,
    pub quota: i64,
    #[serde(rename = "quotaUsed")]
    pub quota_used: i64,
    #[serde(skip)]
    pub limits: RateLimitInfo,
}

impl QuotaStatus {
    pub fn quota_remaining(&self) -> i64 {
        self.quota.saturating_sub(self.quota_used).max(0)
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Restrict the search to one Anilist entry; 0 searches everything.
    pub anilist_id: u64,
    pub cut_borders: bool,
    pub anilist_info: bool,
    /// Treat a text `path` as an image URL rather than a local file.
    pub is_url: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            anilist_id: 0,
            cut_borders: true,
            anilist_info: true,
            is_url: false,
        }
    }
}

impl SearchOptions {
    /// `cutBorders` and `anilistInfo` are switched on by their presence, so
    /// they are sent with an empty value or left out entirely.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("anilistID", self.anilist_id.to_string())];
        if self.cut_borders {
            params.push(("cutBorders", String::new()));
        }
        if self.anilist_info {
            params.push(("anilistInfo", String::new()));
        }
        params
    }
}

/// What the caller hands to `search`: text (URL or file path) or raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageInput {
    Text(String),
    Buffer(Bytes),
}

impl ImageInput {
    pub fn kind(&self) -> &'static str {
        match self {
            ImageInput::Text(_) => "text",
            ImageInput::Buffer(_) => "byte buffer",
        }
    }

    pub fn resolve(self, is_url: bool) -> Result<ImageSource> {
        match (self, is_url) {
            (ImageInput::Text(url), true) => Ok(ImageSource::Url(url)),
            (input @ ImageInput::Buffer(_), true) => Err(Error::InvalidArgument(format!(
                "image URL must be text, not a {}",
                input.kind()
            ))),
            (ImageInput::Text(path), false) => Ok(ImageSource::File(PathBuf::from(path))),
            (ImageInput::Buffer(bytes), false) => Ok(ImageSource::Buffer(bytes)),
        }
    }
}

impl From<&str> for ImageInput {
    fn from(value: &str) -> Self {
        ImageInput::Text(value.to_string())
    }
}

impl From<String> for ImageInput {
    fn from(value: String) -> Self {
        ImageInput::Text(value)
    }
}

impl From<&Path> for ImageInput {
    fn from(value: &Path) -> Self {
        ImageInput::Text(value.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for ImageInput {
    fn from(value: PathBuf) -> Self {
        ImageInput::from(value.as_path())
    }
}

impl From<Bytes> for ImageInput {
    fn from(value: Bytes) -> Self {
        ImageInput::Buffer(value)
    }
}

impl From<Vec<u8>> for ImageInput {
    fn from(value: Vec<u8>) -> Self {
        ImageInput::Buffer(Bytes::from(value))
    }
}

impl From<&[u8]> for ImageInput {
    fn from(value: &[u8]) -> Self {
        ImageInput::Buffer(Bytes::copy_from_slice(value))
    }
}

/// A resolved request body source.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Url(String),
    Buffer(Bytes),
    File(PathBuf),
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}
