use crate::config::Config;
use crate::error::{ApiError, ApiErrorKind, Error, Result};
use crate::mapper::{to_quota_status, to_search_result};
use crate::network::{HttpRequest, HttpResponse, Network, Transport, Upload};
use crate::types::{
    ImageInput, ImageSource, QuotaStatus, RateLimitInfo, SearchOptions, SearchResult,
};
use crate::utils::{base64_to_bytes, file_name_of, normalize_api_url};
use bytes::Bytes;
use log::{debug, warn};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const IMAGE_FIELD: &str = "image";
const BUFFER_FILE_NAME: &str = "image";

/// Async client for the trace.moe API.
///
/// Cheap to clone; clones share the underlying connection pool, which is
/// released when the last one is dropped.
#[derive(Clone)]
pub struct TraceMoe {
    transport: Arc<dyn Transport>,
    api_url: Url,
}

impl std::fmt::Debug for TraceMoe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceMoe")
            .field("api_url", &self.api_url.as_str())
            .finish()
    }
}

impl TraceMoe {
    pub fn new(api_key: Option<String>) -> Result<Self> {
        Self::builder()
            .config(Config {
                api_key,
                ..Config::default()
            })
            .build()
    }

    pub fn from_config(config: Config) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> TraceMoeBuilder {
        TraceMoeBuilder::default()
    }

    /// Uses `transport` in place of the built-in reqwest client.
    pub fn with_transport<T>(transport: T, api_url: &str) -> Result<Self>
    where
        T: Transport + 'static,
    {
        Ok(Self {
            transport: Arc::new(transport),
            api_url: Url::parse(&normalize_api_url(api_url))?,
        })
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    fn endpoint(&self, name: &str) -> Result<Url> {
        Ok(self.api_url.join(name)?)
    }

    /// Quota and rate limit of the caller, identified by API key or IP.
    pub async fn me(&self) -> Result<QuotaStatus> {
        let url = self.endpoint("me")?;
        let (body, limits) = self.make_request(Method::GET, &url, Vec::new(), None).await?;
        to_quota_status(body, limits)
    }

    /// Searches for the scene an image comes from.
    ///
    /// Text is an image URL when `options.is_url` is set and a local file
    /// path otherwise; bytes are uploaded as they are.
    pub async fn search(
        &self,
        path: impl Into<ImageInput>,
        options: &SearchOptions,
    ) -> Result<SearchResult> {
        let source = path.into().resolve(options.is_url)?;
        self.search_source(source, options).await
    }

    pub async fn search_url(&self, url: &str, options: &SearchOptions) -> Result<SearchResult> {
        self.search_source(ImageSource::Url(url.to_string()), options)
            .await
    }

    pub async fn search_bytes(
        &self,
        bytes: impl Into<Bytes>,
        options: &SearchOptions,
    ) -> Result<SearchResult> {
        self.search_source(ImageSource::Buffer(bytes.into()), options)
            .await
    }

    pub async fn search_file(
        &self,
        path: impl AsRef<Path>,
        options: &SearchOptions,
    ) -> Result<SearchResult> {
        self.search_source(ImageSource::File(path.as_ref().to_path_buf()), options)
            .await
    }

    pub async fn search_base64(
        &self,
        base64: &str,
        options: &SearchOptions,
    ) -> Result<SearchResult> {
        let bytes = base64_to_bytes(base64)?;
        self.search_bytes(bytes, options).await
    }

    pub async fn search_source(
        &self,
        source: ImageSource,
        options: &SearchOptions,
    ) -> Result<SearchResult> {
        let url = self.endpoint("search")?;
        let mut params = options.query_params();

        let (method, upload) = match source {
            ImageSource::Url(image_url) => {
                params.push(("url", image_url));
                (Method::GET, None)
            }
            ImageSource::Buffer(data) => (
                Method::POST,
                Some(Upload {
                    field: IMAGE_FIELD,
                    file_name: BUFFER_FILE_NAME.to_string(),
                    data,
                }),
            ),
            ImageSource::File(path) => {
                let is_file = tokio::fs::metadata(&path)
                    .await
                    .map(|meta| meta.is_file())
                    .unwrap_or(false);
                if !is_file {
                    return Err(Error::InvalidArgument(format!(
                        "{} is not a file; pass an image URL with is_url set, a file path or a byte buffer",
                        path.display()
                    )));
                }
                let data = tokio::fs::read(&path).await?;
                (
                    Method::POST,
                    Some(Upload {
                        field: IMAGE_FIELD,
                        file_name: file_name_of(&path),
                        data: Bytes::from(data),
                    }),
                )
            }
        };

        let (body, limits) = self
            .make_request(method, &url, params, upload)
            .await
            .map_err(attach_search_result)?;
        let result = to_search_result(body.clone(), limits)?;
        check_search_result(result, body, &url)
    }

    /// Sends one request and returns the decoded JSON body together with the
    /// rate-limit snapshot. Anything but 200 becomes an [`ApiError`] picked
    /// from the status code.
    pub async fn make_request(
        &self,
        method: Method,
        url: &Url,
        params: Vec<(&'static str, String)>,
        upload: Option<Upload>,
    ) -> Result<(Value, RateLimitInfo)> {
        let response = self
            .transport
            .execute(HttpRequest {
                method,
                url: url.to_string(),
                params,
                upload,
            })
            .await?;
        process_response(response, url)
    }
}

fn process_response(response: HttpResponse, url: &Url) -> Result<(Value, RateLimitInfo)> {
    let limits = RateLimitInfo::from_headers(&response.headers);

    if response.status == StatusCode::OK {
        return Ok((serde_json::from_slice(&response.body)?, limits));
    }

    let status = response.status.as_u16();
    let body: Option<Value> = serde_json::from_slice(&response.body).ok();
    let text = body
        .as_ref()
        .and_then(|b| b.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| String::from_utf8_lossy(&response.body).into_owned());

    let kind = ApiErrorKind::from_status(status);
    debug!("{} failed with status {}: {:?}", url, status, kind);

    Err(Error::Api(ApiError {
        kind,
        url: url.to_string(),
        message: format!("{} (Status: {})", text, status),
        status: Some(status),
        limits,
        body,
        response: None,
    }))
}

/// Adds whatever search result can be built from the body of a failed
/// `/search` response.
fn attach_search_result(error: Error) -> Error {
    match error {
        Error::Api(mut api) => {
            if let Some(body) = api.body.clone() {
                api.response = to_search_result(body, api.limits).ok().map(Box::new);
            }
            Error::Api(api)
        }
        other => other,
    }
}

/// trace.moe reports many failures inside a 200 body, so a search result is
/// only handed out once its `error` field is known to be empty.
fn check_search_result(result: SearchResult, body: Value, url: &Url) -> Result<SearchResult> {
    let Some(message) = result.error.clone() else {
        return Ok(result);
    };

    let kind = ApiErrorKind::from_message(&message);
    warn!("{} reported an error: {} ({:?})", url, message, kind);

    Err(Error::Api(ApiError {
        kind,
        url: url.to_string(),
        message,
        status: None,
        limits: result.limits,
        body: Some(body),
        response: Some(Box::new(result)),
    }))
}

#[derive(Debug, Default)]
pub struct TraceMoeBuilder {
    config: Config,
    client: Option<reqwest::Client>,
}

impl TraceMoeBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config.api_key = Some(api_key.into());
        self
    }

    pub fn api_url(mut self, api_url: impl Into<String>) -> Self {
        self.config.api_url = api_url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy = Some(proxy.into());
        self
    }

    /// Sends requests through `client`. The builder's API key is still sent
    /// with every request; its timeout and proxy are not applied.
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<TraceMoe> {
        let network = match self.client {
            Some(client) => {
                let network = Network::with_client(client, self.config.timeout);
                match self.config.api_key {
                    Some(ref api_key) => network.with_api_key(api_key)?,
                    None => network,
                }
            }
            None => Network::new(&self.config)?,
        };
        TraceMoe::with_transport(network, &self.config.api_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnilistRef;
    use async_trait::async_trait;
    use reqwest::header::{HeaderMap, HeaderValue};
    use serde_json::json;
    use std::io::Write;
    use std::sync::Mutex;

    /// Replies with one canned response and records what was sent.
    #[derive(Clone)]
    struct FakeTransport {
        status: u16,
        headers: HeaderMap,
        body: String,
        sent: Arc<Mutex<Vec<HttpRequest>>>,
    }

    impl FakeTransport {
        fn new(status: u16, body: impl Into<String>) -> Self {
            Self {
                status,
                headers: HeaderMap::new(),
                body: body.into(),
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn with_limits(
            mut self,
            limit: &'static str,
            remaining: &'static str,
            reset: &'static str,
        ) -> Self {
            let headers = &mut self.headers;
            headers.insert("x-ratelimit-limit", HeaderValue::from_static(limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from_static(remaining));
            headers.insert("x-ratelimit-reset", HeaderValue::from_static(reset));
            self
        }

        fn requests(&self) -> Vec<HttpRequest> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.sent.lock().unwrap().push(request);
            Ok(HttpResponse {
                status: StatusCode::from_u16(self.status).unwrap(),
                headers: self.headers.clone(),
                body: Bytes::from(self.body.clone()),
            })
        }
    }

    fn client(transport: &FakeTransport) -> TraceMoe {
        TraceMoe::with_transport(transport.clone(), "https://api.trace.moe").unwrap()
    }

    fn url_options() -> SearchOptions {
        SearchOptions {
            is_url: true,
            ..Default::default()
        }
    }

    const MATCH_BODY: &str = r#"{
        "frameCount": 745506,
        "error": "",
        "result": [{
            "anilist": 99939,
            "filename": "Nekopara - OVA (BD 1280x720 x264 AAC).mp4",
            "episode": null,
            "from": 97.75,
            "to": 98.92,
            "similarity": 0.9440424588727485,
            "video": "https://media.trace.moe/video/99939/x.mp4",
            "image": "https://media.trace.moe/image/99939/x.jpg"
        }]
    }"#;

    fn expect_api_error(result: Result<SearchResult>) -> ApiError {
        match result {
            Err(Error::Api(e)) => e,
            other => panic!("expected an API error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_search_url_builds_get_request() {
        let transport = FakeTransport::new(200, MATCH_BODY).with_limits("100", "99", "1700000000");
        let result = client(&transport)
            .search("https://example.com/shot.jpg", &url_options())
            .await
            .unwrap();

        assert_eq!(result.frame_count, Some(745506));
        assert_eq!(result.limits.remaining, 99);
        let best = result.best_match().unwrap();
        assert_eq!(best.anilist, AnilistRef::Id(99939));
        assert!(best.episode.is_none());

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, Method::GET);
        assert_eq!(sent[0].url, "https://api.trace.moe/search");
        assert!(sent[0].upload.is_none());
        assert_eq!(
            sent[0].params,
            vec![
                ("anilistID", "0".to_string()),
                ("cutBorders", String::new()),
                ("anilistInfo", String::new()),
                ("url", "https://example.com/shot.jpg".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_flags_are_omitted_when_off() {
        let transport = FakeTransport::new(200, MATCH_BODY);
        let options = SearchOptions {
            anilist_id: 99939,
            cut_borders: false,
            anilist_info: false,
            is_url: true,
        };
        client(&transport)
            .search("https://example.com/shot.jpg", &options)
            .await
            .unwrap();

        let params = &transport.requests()[0].params;
        assert_eq!(
            params,
            &vec![
                ("anilistID", "99939".to_string()),
                ("url", "https://example.com/shot.jpg".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_search_buffer_uploads_image_field() {
        let transport = FakeTransport::new(200, MATCH_BODY);
        client(&transport)
            .search(vec![0xffu8, 0xd8, 0xff], &SearchOptions::default())
            .await
            .unwrap();

        let sent = transport.requests();
        assert_eq!(sent[0].method, Method::POST);
        let upload = sent[0].upload.as_ref().unwrap();
        assert_eq!(upload.field, "image");
        assert_eq!(upload.data, Bytes::from_static(&[0xff, 0xd8, 0xff]));
        assert!(sent[0].params.iter().all(|(name, _)| *name != "url"));
    }

    #[tokio::test]
    async fn test_search_file_reads_contents() {
        let mut file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
        file.write_all(b"not really a png").unwrap();

        let transport = FakeTransport::new(200, MATCH_BODY);
        client(&transport)
            .search(file.path(), &SearchOptions::default())
            .await
            .unwrap();

        let sent = transport.requests();
        assert_eq!(sent[0].method, Method::POST);
        let upload = sent[0].upload.as_ref().unwrap();
        assert_eq!(upload.field, "image");
        assert_eq!(upload.data, Bytes::from_static(b"not really a png"));
        assert!(upload.file_name.ends_with(".png"));
    }

    #[tokio::test]
    async fn test_search_base64() {
        let transport = FakeTransport::new(200, MATCH_BODY);
        client(&transport)
            .search_base64("aGVsbG8=", &SearchOptions::default())
            .await
            .unwrap();
        let sent = transport.requests();
        assert_eq!(sent[0].upload.as_ref().unwrap().data, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_hit_the_network() {
        let transport = FakeTransport::new(200, MATCH_BODY);
        let api = client(&transport);

        let err = api
            .search(vec![1u8, 2, 3], &url_options())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = api
            .search("/definitely/not/here.jpg", &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let dir = tempfile::tempdir().unwrap();
        let err = api
            .search(dir.path(), &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_status_error_with_empty_message() {
        let transport = FakeTransport::new(503, r#"{"error":""}"#);
        let err = expect_api_error(
            client(&transport)
                .search("https://example.com/a.jpg", &url_options())
                .await,
        );
        assert_eq!(err.kind, ApiErrorKind::ServiceUnavailable);
        assert_eq!(err.status, Some(503));
        assert_eq!(err.message, " (Status: 503)");
        assert_eq!(err.url, "https://api.trace.moe/search");
        // the body still maps to an (empty) search result
        assert!(err.search_result().unwrap().matches.is_empty());
    }

    #[tokio::test]
    async fn test_status_error_uses_body_error_text() {
        let transport = FakeTransport::new(402, r#"{"error":"Search quota depleted"}"#)
            .with_limits("10", "0", "1700000000");
        let err = expect_api_error(
            client(&transport)
                .search("https://example.com/a.jpg", &url_options())
                .await,
        );
        assert_eq!(err.kind, ApiErrorKind::SearchQuotaDepleted);
        assert_eq!(err.message, "Search quota depleted (Status: 402)");
        assert_eq!(err.limits.remaining, 0);
        assert_eq!(err.limits.limit, 10);
    }

    #[tokio::test]
    async fn test_status_error_with_plain_text_body() {
        let transport = FakeTransport::new(502, "Bad Gateway");
        let err = expect_api_error(
            client(&transport)
                .search("https://example.com/a.jpg", &url_options())
                .await,
        );
        assert_eq!(err.kind, ApiErrorKind::Other);
        assert_eq!(err.message, "Bad Gateway (Status: 502)");
        assert!(err.body.is_none());
        assert!(err.response.is_none());
    }

    #[tokio::test]
    async fn test_every_mapped_status() {
        let table = [
            (400, ApiErrorKind::BadRequest),
            (402, ApiErrorKind::SearchQuotaDepleted),
            (403, ApiErrorKind::Forbidden),
            (405, ApiErrorKind::MethodNotAllowed),
            (413, ApiErrorKind::PayloadTooLarge),
            (429, ApiErrorKind::TooManyRequests),
            (500, ApiErrorKind::InternalServerError),
            (503, ApiErrorKind::ServiceUnavailable),
            (504, ApiErrorKind::GatewayTimeout),
            (404, ApiErrorKind::Other),
        ];
        for (status, kind) in table {
            let transport = FakeTransport::new(status, r#"{"error":"nope"}"#);
            let err = client(&transport).me().await.unwrap_err();
            assert_eq!(err.api_kind(), Some(kind), "status {}", status);
            match err {
                Error::Api(api) => {
                    // partial results only come with /search
                    assert!(api.response.is_none(), "status {}", status);
                    assert_eq!(api.body, Some(json!({"error": "nope"})));
                }
                other => panic!("expected an API error, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_embedded_errors_are_raised() {
        let cases = [
            ("Invalid API key", ApiErrorKind::InvalidApiKey),
            ("Search quota depleted", ApiErrorKind::SearchQuotaDepleted),
            ("Concurrency limit exceeded", ApiErrorKind::ConcurrencyLimitExceeded),
            ("Error: Search queue is full", ApiErrorKind::SearchQueueFull),
            ("Invalid image url", ApiErrorKind::InvalidImageUrl),
            ("Failed to fetch image: timeout", ApiErrorKind::FailedFetchImage),
            ("Failed to process image", ApiErrorKind::FailedProcessImage),
            (
                "OpenCV: Failed to detect and cut borders",
                ApiErrorKind::FailedDetectAndCutBorders,
            ),
            ("Something unexpected", ApiErrorKind::Other),
        ];
        for (message, kind) in cases {
            let body = json!({"error": message, "result": []}).to_string();
            let transport = FakeTransport::new(200, body);
            let err = expect_api_error(
                client(&transport)
                    .search("https://example.com/a.jpg", &url_options())
                    .await,
            );
            assert_eq!(err.kind, kind, "message {:?}", message);
            assert_eq!(err.message, message);
            assert!(err.status.is_none());
            let partial = err.search_result().unwrap();
            assert_eq!(partial.error.as_deref(), Some(message));
            assert_eq!(err.body, Some(json!({"error": message, "result": []})));
        }
    }

    #[tokio::test]
    async fn test_non_json_success_body() {
        let transport = FakeTransport::new(200, "<html>oops</html>");
        let err = client(&transport)
            .search("https://example.com/a.jpg", &url_options())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[tokio::test]
    async fn test_me() {
        let body = r#"{"id":"127.0.0.1","priority":0,"concurrency":1,"quota":1000,"quotaUsed":12}"#;
        let transport = FakeTransport::new(200, body).with_limits("60", "59", "1700000000");
        let me = client(&transport).me().await.unwrap();

        assert_eq!(me.id, "127.0.0.1");
        assert_eq!(me.quota_used, 12);
        assert_eq!(me.limits.limit, 60);

        let sent = transport.requests();
        assert_eq!(sent[0].method, Method::GET);
        assert_eq!(sent[0].url, "https://api.trace.moe/me");
        assert!(sent[0].params.is_empty());
    }

    #[tokio::test]
    async fn test_me_ignores_error_field() {
        // /me has no embedded-error convention
        let body = r#"{"id":"1.2.3.4","priority":0,"concurrency":1,"quota":10,"quotaUsed":0,"error":"x"}"#;
        let transport = FakeTransport::new(200, body);
        assert_eq!(client(&transport).me().await.unwrap().id, "1.2.3.4");
    }

    #[test]
    fn test_base_url_keeps_path_prefix() {
        let transport = FakeTransport::new(200, "{}");
        let api = TraceMoe::with_transport(transport, "http://localhost:8080/trace").unwrap();
        assert_eq!(
            api.endpoint("search").unwrap().as_str(),
            "http://localhost:8080/trace/search"
        );
    }

    #[tokio::test]
    async fn test_builder_client_still_sends_api_key() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let body = r#"{"id":"a@b.c","priority":2,"concurrency":2,"quota":5000,"quotaUsed":1}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf).to_lowercase()
        });

        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        let api = TraceMoe::builder()
            .client(http)
            .api_key("secret")
            .api_url(format!("http://{}", addr))
            .build()
            .unwrap();
        assert_eq!(api.me().await.unwrap().id, "a@b.c");

        let request = server.await.unwrap();
        assert!(request.contains("x-trace-key: secret"));
    }

    #[test]
    fn test_builder_client_rejects_bad_api_key() {
        let err = TraceMoe::builder()
            .client(reqwest::Client::new())
            .api_key("bad\nkey")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_builder() {
        let api = TraceMoe::builder()
            .api_key("secret")
            .api_url("http://localhost:3311")
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        assert_eq!(api.api_url().as_str(), "http://localhost:3311/");
        assert!(TraceMoe::builder().api_url("not a url").build().is_err());
    }
}
