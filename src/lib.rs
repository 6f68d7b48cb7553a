pub mod client;
pub mod config;
pub mod error;
pub mod mapper;
pub mod network;
pub mod types;
pub mod utils;

pub use client::{TraceMoe, TraceMoeBuilder};
pub use config::Config;
pub use error::{ApiError, ApiErrorKind, Error, Result};
pub use network::{HttpRequest, HttpResponse, Network, Transport, Upload};
pub use types::{
    AnilistInfo, AnilistRef, Episode, EpisodeValue, ImageInput, ImageSource, QuotaStatus,
    RateLimitInfo, SearchMatch, SearchOptions, SearchResult, SimilarityFormat,
};
