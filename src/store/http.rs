use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap};
use reqwest::{Body, Client, RequestBuilder, StatusCode, Url};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{CHECKSUM_HEADER, PutRequest, RemoteObject, RemoteStore, StoreError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for an S3-style HTTP object gateway.
///
/// Objects live at `{endpoint}/{bucket}/{key}`. Requests authenticate with
/// a bearer token when one is configured.
pub struct HttpStore {
    client: Client,
    endpoint: Url,
    bucket: String,
    token: Option<String>,
}

impl HttpStore {
    pub fn new(endpoint: &str, bucket: &str, token: Option<String>) -> Result<Self, StoreError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| StoreError::Permanent(format!("invalid endpoint `{endpoint}`: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(StoreError::Permanent(format!(
                "endpoint `{endpoint}` cannot hold object paths"
            )));
        }

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Fatal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            bucket: bucket.to_string(),
            token,
        })
    }

    fn bucket_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&self.bucket);
        }
        url
    }

    /// Each `/`-separated part of the key becomes one percent-encoded path
    /// segment.
    fn object_url(&self, key: &str) -> Url {
        let mut url = self.bucket_url();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.extend(key.split('/'));
        }
        url
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn check_access(&self) -> Result<(), StoreError> {
        let url = self.bucket_url();
        let response = self
            .authorized(self.client.head(url.clone()))
            .send()
            .await
            .map_err(|e| StoreError::Fatal(format!("cannot reach {url}: {e}")))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(StoreError::Fatal(format!(
                "bucket `{}` not found",
                self.bucket
            ))),
            s => Err(StoreError::Fatal(format!(
                "bucket `{}` check failed: {}",
                self.bucket,
                classify_status(s)
            ))),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<RemoteObject>, StoreError> {
        let response = self
            .authorized(self.client.head(self.object_url(key)))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let headers = response.headers();
        Ok(Some(RemoteObject {
            etag: header_str(headers, ETAG.as_str()).unwrap_or_default(),
            checksum: header_str(headers, CHECKSUM_HEADER),
            size: header_str(headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok()),
        }))
    }

    async fn put(&self, req: &PutRequest) -> Result<String, StoreError> {
        let file = open_body(req).await?;

        debug!(remote_key = %req.key, size = req.size, "PUT object");

        let response = self
            .authorized(self.client.put(self.object_url(&req.key)))
            .header(CONTENT_TYPE, &req.content_type)
            .header(CACHE_CONTROL, &req.cache_control)
            .header(CONTENT_LENGTH, req.size)
            .header(CHECKSUM_HEADER, &req.checksum)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        header_str(response.headers(), ETAG.as_str()).ok_or_else(|| {
            StoreError::Permanent(format!(
                "upload of `{}` succeeded but no ETag was returned",
                req.key
            ))
        })
    }
}

/// Open the upload body, refusing files whose size no longer matches the
/// declared `Content-Length`.
async fn open_body(req: &PutRequest) -> Result<tokio::fs::File, StoreError> {
    let cannot_open = |e: std::io::Error| {
        StoreError::Permanent(format!("cannot open {}: {e}", req.path.display()))
    };
    let file = tokio::fs::File::open(&req.path).await.map_err(cannot_open)?;
    let len = file.metadata().await.map_err(cannot_open)?.len();
    if len != req.size {
        return Err(StoreError::Permanent(format!(
            "content of {} changed since discovery ({} bytes, expected {})",
            req.path.display(),
            len,
            req.size
        )));
    }
    Ok(file)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub(super) fn classify_status(status: StatusCode) -> StoreError {
    let msg = format!("store responded {status}");
    match status.as_u16() {
        401 | 403 => StoreError::Fatal(msg),
        408 | 429 => StoreError::Transient(msg),
        s if s >= 500 => StoreError::Transient(msg),
        _ => StoreError::Permanent(msg),
    }
}

fn classify_transport(err: reqwest::Error) -> StoreError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        StoreError::Transient(format!("network error: {err}"))
    } else {
        StoreError::Permanent(format!("request failed: {err}"))
    }
}
