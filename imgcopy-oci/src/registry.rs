use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE,
    WWW_AUTHENTICATE,
};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::digest::{Digest, DigestAlgorithm};
use crate::error::{OciError, Result};
use crate::manifest::guess_mime_type;
use crate::reference::ImageRef;

/// A blob body as an async byte stream.
pub type BlobStream = Pin<Box<dyn AsyncRead + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Upper bound on reconnects for one blob body.
const MAX_BODY_RECONNECTS: u32 = 5;
/// Size of each PATCH during a blob upload.
const UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Registry login.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    pub credentials: Option<Credentials>,
    /// Use plain HTTP for every registry.
    pub insecure: bool,
    pub user_agent: Option<String>,
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// Low-level OCI Distribution HTTP client. Cheap to clone.
#[derive(Clone)]
pub struct RegistryClient {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    options: RegistryOptions,
    /// `Authorization` header values keyed by host and scope.
    auth: Mutex<HashMap<String, String>>,
}

/// Return the base URL scheme for a registry host.
/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
fn registry_scheme(registry: &str, insecure: bool) -> &'static str {
    if insecure {
        return "http";
    }
    let host = match registry.strip_prefix('[') {
        Some(v6) => v6.split(']').next().unwrap_or(v6),
        None => registry.split(':').next().unwrap_or(registry),
    };
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

impl RegistryClient {
    pub fn new(options: RegistryOptions) -> Result<Self> {
        let user_agent = options
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("imgcopy/{}", env!("CARGO_PKG_VERSION")));
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                options,
                auth: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn repo_url(&self, image_ref: &ImageRef) -> String {
        let host = image_ref.registry_host();
        format!(
            "{}://{}/v2/{}",
            registry_scheme(host, self.inner.options.insecure),
            host,
            image_ref.repository
        )
    }

    // -- manifests ----------------------------------------------------------

    /// Fetch the manifest at `reference` (tag or digest). Returns the raw
    /// bytes and their MIME type.
    pub async fn get_manifest(
        &self,
        image_ref: &ImageRef,
        reference: &str,
        accept: &[&str],
    ) -> Result<(Vec<u8>, String)> {
        let url = format!("{}/manifests/{}", self.repo_url(image_ref), reference);
        let accept = accept.join(", ");
        let resp = self
            .send(image_ref, "pull", |c| c.get(&url).header(ACCEPT, &accept))
            .await?;
        let resp = check_status(resp, &url).await?;
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let body = resp.bytes().await?.to_vec();
        let mime_type = match content_type {
            Some(ct) if !ct.is_empty() && ct != "application/json" && ct != "text/plain" => ct,
            _ => guess_mime_type(&body),
        };
        Ok((body, mime_type))
    }

    /// Upload a manifest under `reference`. A registry refusing the manifest
    /// type is reported as [`OciError::ManifestTypeRejected`].
    pub async fn put_manifest(
        &self,
        image_ref: &ImageRef,
        reference: &str,
        manifest: &[u8],
        mime_type: &str,
    ) -> Result<Digest> {
        let url = format!("{}/manifests/{}", self.repo_url(image_ref), reference);
        let body = Bytes::copy_from_slice(manifest);
        let resp = self
            .send(image_ref, "pull,push", |c| {
                c.put(&url).header(CONTENT_TYPE, mime_type).body(body.clone())
            })
            .await?;
        let status = resp.status();
        if status.is_success() {
            debug!(%url, %mime_type, "manifest uploaded");
            return Ok(Digest::from_bytes(manifest));
        }
        let text = resp.text().await.unwrap_or_default();
        if is_manifest_rejection(status, &text) {
            return Err(OciError::ManifestTypeRejected {
                media_type: mime_type.to_string(),
                reason: registry_error_message(&text).unwrap_or_else(|| status.to_string()),
            });
        }
        Err(OciError::Registry(format!(
            "PUT {} returned {}: {}",
            url, status, text
        )))
    }

    // -- blobs --------------------------------------------------------------

    /// `Some(size)` if the blob exists in the repository.
    pub async fn blob_exists(&self, image_ref: &ImageRef, digest: &Digest) -> Result<Option<u64>> {
        let url = format!("{}/blobs/{}", self.repo_url(image_ref), digest);
        let resp = self.send(image_ref, "pull", |c| c.head(&url)).await?;
        match resp.status() {
            s if s.is_success() => Ok(Some(content_length(&resp).unwrap_or(0))),
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(OciError::Registry(format!("HEAD {} returned {}", url, s))),
        }
    }

    /// Download a small blob into memory.
    pub async fn fetch_blob(&self, image_ref: &ImageRef, digest: &Digest) -> Result<Vec<u8>> {
        let url = format!("{}/blobs/{}", self.repo_url(image_ref), digest);
        let resp = self.send(image_ref, "pull", |c| c.get(&url)).await?;
        let resp = check_status(resp, &url).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Open a blob for streaming. A body cut short by the server is resumed
    /// from the last received offset with a range request.
    pub async fn get_blob(
        &self,
        image_ref: &ImageRef,
        digest: &Digest,
    ) -> Result<(BlobStream, Option<u64>)> {
        let url = format!("{}/blobs/{}", self.repo_url(image_ref), digest);
        let resp = self.send(image_ref, "pull", |c| c.get(&url)).await?;
        let resp = check_status(resp, &url).await?;
        let total = content_length(&resp);
        let state = BodyState {
            client: self.clone(),
            image_ref: image_ref.clone(),
            url,
            body: byte_stream(resp),
            offset: 0,
            total,
            progressed: false,
            reconnects: 0,
        };
        let stream = futures_util::stream::try_unfold(state, next_body_chunk);
        Ok((Box::pin(StreamReader::new(stream)), total))
    }

    /// Fetch `length` bytes (or the rest of the blob) starting at `offset`.
    pub async fn get_blob_range(
        &self,
        image_ref: &ImageRef,
        digest: &Digest,
        offset: u64,
        length: Option<u64>,
    ) -> Result<BlobStream> {
        let url = format!("{}/blobs/{}", self.repo_url(image_ref), digest);
        let resp = self.get_range(image_ref, &url, offset, length).await?;
        Ok(Box::pin(StreamReader::new(byte_stream(resp))))
    }

    async fn get_range(
        &self,
        image_ref: &ImageRef,
        url: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Response> {
        let range = match length {
            Some(0) => {
                return Err(OciError::Registry(format!(
                    "empty range requested from {}",
                    url
                )))
            }
            Some(len) => format!("bytes={}-{}", offset, offset + len - 1),
            None => format!("bytes={}-", offset),
        };
        let resp = self
            .send(image_ref, "pull", |c| c.get(url).header(RANGE, &range))
            .await?;
        match resp.status() {
            StatusCode::PARTIAL_CONTENT => Ok(resp),
            StatusCode::OK => Err(OciError::Registry(format!(
                "{} does not support range requests",
                url
            ))),
            _ => check_status(resp, url).await,
        }
    }

    /// Upload a blob read from `reader` and return its digest and size.
    pub async fn upload_blob(
        &self,
        image_ref: &ImageRef,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(Digest, u64)> {
        let start = format!("{}/blobs/uploads/", self.repo_url(image_ref));
        let resp = self.send(image_ref, "pull,push", |c| c.post(&start)).await?;
        let resp = check_status(resp, &start).await?;
        let mut location = upload_location(&start, &resp)?;

        let mut digester = DigestAlgorithm::CANONICAL.digester();
        let mut total = 0u64;
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
        loop {
            let n = read_full(reader, &mut buf).await?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            let range = format!("{}-{}", total, total + n as u64 - 1);
            total += n as u64;
            let target = location.clone();
            let resp = self
                .send(image_ref, "pull,push", |c| {
                    c.patch(target.clone())
                        .header(CONTENT_TYPE, "application/octet-stream")
                        .header(CONTENT_RANGE, &range)
                        .body(chunk.clone())
                })
                .await?;
            let resp = check_status(resp, location.as_str()).await?;
            location = upload_location(location.as_str(), &resp)?;
            if n < buf.len() {
                break;
            }
        }

        let digest = digester.finish();
        location.query_pairs_mut().append_pair("digest", digest.as_str());
        let resp = self
            .send(image_ref, "pull,push", |c| {
                c.put(location.clone()).header(CONTENT_LENGTH, 0)
            })
            .await?;
        check_status(resp, location.as_str()).await?;
        debug!(digest = %digest, size = total, "blob uploaded");
        Ok((digest, total))
    }

    // -- internals ----------------------------------------------------------

    /// Send a request, answering a 401 challenge once. `build` must produce
    /// an equivalent request each time it is called.
    async fn send<F>(&self, image_ref: &ImageRef, actions: &str, build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let scope = format!("repository:{}:{}", image_ref.repository, actions);
        let key = format!("{}/{}", image_ref.registry_host(), scope);
        let resp = self.authorize(build(&self.inner.client), &key).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        // Extract www-authenticate and fetch a token.
        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let header = self.authenticate(&challenge, &scope).await?;
        self.lock_auth().insert(key.clone(), header);

        // Retry with token.
        Ok(self.authorize(build(&self.inner.client), &key).send().await?)
    }

    fn lock_auth(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.inner
            .auth
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn authorize(&self, req: RequestBuilder, key: &str) -> RequestBuilder {
        match self.lock_auth().get(key) {
            Some(value) => req.header(AUTHORIZATION, value.as_str()),
            None => req,
        }
    }

    /// Answer a `WWW-Authenticate` challenge, returning the `Authorization`
    /// header value to use from now on.
    async fn authenticate(&self, challenge: &str, default_scope: &str) -> Result<String> {
        let credentials = self.inner.options.credentials.as_ref();
        if challenge.to_ascii_lowercase().starts_with("basic") {
            let creds = credentials.ok_or_else(|| {
                OciError::Registry("registry requires basic auth but no credentials are set".into())
            })?;
            use base64::Engine as _;
            let raw = format!("{}:{}", creds.username, creds.password.expose_secret());
            return Ok(format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(raw)
            ));
        }

        let realm = extract_param(challenge, "realm").unwrap_or_default();
        let service = extract_param(challenge, "service").unwrap_or_default();
        let scope = extract_param(challenge, "scope").unwrap_or_else(|| default_scope.to_string());

        if realm.is_empty() {
            return Err(OciError::Registry(
                "www-authenticate header missing realm".to_string(),
            ));
        }

        debug!(%realm, %service, %scope, "fetching bearer token");
        let mut req = self
            .inner
            .client
            .get(&realm)
            .query(&[("service", service.as_str()), ("scope", scope.as_str())]);
        if let Some(creds) = credentials {
            req = req.basic_auth(&creds.username, Some(creds.password.expose_secret()));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(OciError::Registry(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| OciError::Registry("token response missing token field".to_string()))?;

        Ok(format!("Bearer {}", token))
    }
}

// ---------------------------------------------------------------------------
// Resumable body
// ---------------------------------------------------------------------------

struct BodyState {
    client: RegistryClient,
    image_ref: ImageRef,
    url: String,
    body: ByteStream,
    offset: u64,
    total: Option<u64>,
    /// Bytes arrived since the last (re)connect.
    progressed: bool,
    reconnects: u32,
}

async fn next_body_chunk(mut st: BodyState) -> std::io::Result<Option<(Bytes, BodyState)>> {
    loop {
        let failure = match st.body.next().await {
            Some(Ok(chunk)) => {
                st.offset += chunk.len() as u64;
                st.progressed |= !chunk.is_empty();
                return Ok(Some((chunk, st)));
            }
            None => match st.total {
                Some(total) if st.offset < total => std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("body ended after {} of {} bytes", st.offset, total),
                ),
                _ => return Ok(None),
            },
            Some(Err(e)) => e,
        };

        if !st.progressed || st.reconnects >= MAX_BODY_RECONNECTS {
            return Err(failure);
        }
        st.reconnects += 1;
        st.progressed = false;
        warn!(
            url = %st.url,
            offset = st.offset,
            attempt = st.reconnects,
            error = %failure,
            "blob body interrupted, resuming"
        );
        let resp = st
            .client
            .get_range(&st.image_ref, &st.url, st.offset, None)
            .await
            .map_err(|e| std::io::Error::other(format!("{} (resuming after: {})", e, failure)))?;
        st.body = byte_stream(resp);
    }
}

fn byte_stream(resp: Response) -> ByteStream {
    Box::pin(resp.bytes_stream().map_err(std::io::Error::other))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RegistryErrors {
    #[serde(default)]
    errors: Vec<RegistryErrorEntry>,
}

#[derive(Deserialize)]
struct RegistryErrorEntry {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn is_manifest_rejection(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::UNSUPPORTED_MEDIA_TYPE {
        return true;
    }
    if status != StatusCode::BAD_REQUEST {
        return false;
    }
    serde_json::from_str::<RegistryErrors>(body).is_ok_and(|e| {
        e.errors
            .iter()
            .any(|e| matches!(e.code.as_str(), "MANIFEST_INVALID" | "UNSUPPORTED"))
    })
}

fn registry_error_message(body: &str) -> Option<String> {
    let parsed: RegistryErrors = serde_json::from_str(body).ok()?;
    let messages: Vec<String> = parsed
        .errors
        .into_iter()
        .map(|e| {
            if e.message.is_empty() {
                e.code
            } else {
                format!("{}: {}", e.code, e.message)
            }
        })
        .collect();
    (!messages.is_empty()).then(|| messages.join("; "))
}

async fn check_status(resp: Response, url: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else if status == StatusCode::NOT_FOUND {
        Err(OciError::NotFound(url.to_string()))
    } else {
        let body = resp.text().await.unwrap_or_default();
        Err(OciError::Registry(format!(
            "{} returned {}: {}",
            url, status, body
        )))
    }
}

fn content_length(resp: &Response) -> Option<u64> {
    resp.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn upload_location(base: &str, resp: &Response) -> Result<Url> {
    let location = resp
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| OciError::Registry("upload response has no Location header".into()))?;
    Url::parse(base)
        .and_then(|b| b.join(location))
        .map_err(|e| OciError::Registry(format!("invalid upload location {:?}: {}", location, e)))
}

async fn read_full(reader: &mut (dyn AsyncRead + Send + Unpin), buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Extract a parameter value from a `www-authenticate` header.
/// E.g. `extract_param(header, "realm")` returns the value of `realm="…"`.
fn extract_param(header: &str, param: &str) -> Option<String> {
    let search = format!("{}=\"", param);
    if let Some(start) = header.find(&search) {
        let value_start = start + search.len();
        if let Some(end) = header[value_start..].find('"') {
            return Some(header[value_start..value_start + end].to_string());
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
