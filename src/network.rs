use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;

const DEFAULT_USER_AGENT: &str = concat!("tracemoe-rs/", env!("CARGO_PKG_VERSION"));
pub const API_KEY_HEADER: &str = "x-trace-key";

/// A file sent as a multipart form field.
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub field: &'static str,
    pub file_name: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub params: Vec<(&'static str, String)>,
    pub upload: Option<Upload>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            params: Vec::new(),
            upload: None,
        }
    }

    /// Full URL with the query string, for logging.
    pub fn full_url(&self) -> Result<String> {
        if self.params.is_empty() {
            return Ok(self.url.clone());
        }
        Ok(format!("{}?{}", self.url, serde_urlencoded::to_string(&self.params)?))
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Sends one request and returns the status, headers and the whole body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

#[derive(Clone)]
pub struct Network {
    client: Client,
    timeout: Duration,
    api_key: Option<HeaderValue>,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("timeout", &self.timeout)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Network {
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .user_agent(DEFAULT_USER_AGENT);

        if let Some(ref proxy) = config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        let network = Self::with_client(builder.build()?, config.timeout);
        match config.api_key {
            Some(ref api_key) => network.with_api_key(api_key),
            None => Ok(network),
        }
    }

    /// Wraps a caller-built client. `timeout` is only used to report
    /// timeouts; the client's own setting is what enforces it.
    pub fn with_client(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            api_key: None,
        }
    }

    /// Sends `api_key` as `x-trace-key` on every request.
    pub fn with_api_key(mut self, api_key: &str) -> Result<Self> {
        let mut value = HeaderValue::from_str(api_key).map_err(|_| {
            Error::InvalidArgument("API key contains invalid header characters".to_string())
        })?;
        value.set_sensitive(true);
        self.api_key = Some(value);
        Ok(self)
    }

    fn map_error(&self, error: reqwest::Error) -> Error {
        if error.is_timeout() {
            Error::Timeout(self.timeout)
        } else {
            Error::Request(error)
        }
    }
}

#[async_trait]
impl Transport for Network {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!("{} request to: {}", request.method, request.full_url()?);

        let mut builder = self
            .client
            .request(request.method, &request.url)
            .query(&request.params);

        if let Some(ref api_key) = self.api_key {
            builder = builder.header(API_KEY_HEADER, api_key.clone());
        }

        if let Some(upload) = request.upload {
            debug!(
                "uploading {} ({} bytes) as multipart field {:?}",
                upload.file_name,
                upload.data.len(),
                upload.field
            );
            let part = Part::bytes(upload.data.to_vec())
                .file_name(upload.file_name)
                .mime_str("application/octet-stream")?;
            builder = builder.multipart(Form::new().part(upload.field, part));
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;
        debug!("{} responded with {} ({} bytes)", request.url, status, body.len());

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
