use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::debug;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode, Url};
use tokio::task::JoinHandle;

use crate::progress::{Progress, ProgressTracker};
use crate::limiter::SpeedLimiter;
use crate::transfer::adapters::{ByteRange, ProbeInfo, RangedReader, Transport};
use crate::transfer::auth::{Credentials, DigestChallenge};
use crate::transfer::filesync::FileSync;
use crate::transfer::session::Session;
use crate::transfer::{TransferError, TransferRequest};

/// HTTP(S) implementation of the transport seam: a streaming GET probe
/// for metadata and ranged GETs for the segment readers.
pub struct HttpTransport {
    client: Client,
    url: Url,
    auth: Option<Credentials>,
}

impl HttpTransport {
    pub fn new(client: Client, url: Url, auth: Option<Credentials>) -> Self {
        Self { client, url, auth }
    }

    fn request(&self, range: Option<ByteRange>, authorization: Option<String>) -> RequestBuilder {
        let mut builder = self.client.get(self.url.clone());
        if let Some(ByteRange { start, end }) = range {
            builder = builder.header(header::RANGE, format!("bytes={start}-{end}"));
        }
        match (&self.auth, authorization) {
            (_, Some(value)) => builder = builder.header(header::AUTHORIZATION, value),
            (Some(Credentials::Basic { username, password }), None) => {
                builder = builder.basic_auth(username, Some(password));
            }
            _ => {}
        }
        builder
    }

    /// Sends the request, answering a digest challenge once when digest
    /// credentials are configured.
    async fn send(&self, range: Option<ByteRange>) -> Result<Response, TransferError> {
        let response = self.request(range, None).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(Credentials::Digest { username, password }) = &self.auth {
                let challenge = response
                    .headers()
                    .get(header::WWW_AUTHENTICATE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(DigestChallenge::parse);
                if let Some(challenge) = challenge {
                    debug!("answering digest challenge from {}", self.url);
                    let authorization =
                        challenge.respond(username, password, "GET", &request_uri(&self.url));
                    let retried = self.request(range, Some(authorization)).send().await?;
                    return Ok(retried);
                }
            }
        }

        Ok(response)
    }
}

impl Transport for HttpTransport {
    type Reader = HttpReader;

    async fn probe(&self) -> Result<ProbeInfo, TransferError> {
        let response = self.send(None).await?;
        if !response.status().is_success() {
            return Err(TransferError::Status(response.status()));
        }

        let size = parse_content_length(response.headers().get(header::CONTENT_LENGTH));
        let filename = filename_from_headers(&response);
        // dropping the response closes it without consuming the body
        Ok(ProbeInfo { size, filename })
    }

    async fn open(&self, range: Option<ByteRange>) -> Result<HttpReader, TransferError> {
        let response = self.send(range).await?;
        // Any 2xx is accepted: a 200 from a range-ignoring server must
        // flow into the worker's overflow guard, not fail the attempt.
        if !response.status().is_success() {
            return Err(TransferError::Status(response.status()));
        }
        Ok(HttpReader::new(response))
    }
}

/// Pull-based adapter over a streaming response body. The network hands
/// us chunks of its own size; a carry-over buffer re-cuts them to the
/// caller's requested granularity so the limiter's grant governs
/// consumption.
pub struct HttpReader {
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: Bytes,
    exhausted: bool,
}

impl HttpReader {
    fn new(response: Response) -> Self {
        Self {
            stream: response.bytes_stream().boxed(),
            buffer: Bytes::new(),
            exhausted: false,
        }
    }
}

impl RangedReader for HttpReader {
    async fn read(&mut self, nbytes: usize) -> io::Result<Bytes> {
        while self.buffer.is_empty() && !self.exhausted {
            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer = chunk,
                Some(Err(err)) => return Err(io::Error::new(io::ErrorKind::Other, err)),
                None => self.exhausted = true,
            }
        }

        if self.buffer.is_empty() {
            return Ok(Bytes::new());
        }
        let take = nbytes.min(self.buffer.len()).max(1);
        Ok(self.buffer.split_to(take))
    }
}

/// Builds the client every transfer of a session shares, or a dedicated
/// one for transfers opting out of connection reuse.
pub fn build_client(
    verify_tls: bool,
    connect_timeout: Option<Duration>,
) -> Result<Client, TransferError> {
    let mut builder = Client::builder()
        .user_agent(concat!("parget/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_nodelay(true)
        .danger_accept_invalid_certs(!verify_tls);
    if let Some(timeout) = connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    Ok(builder.build()?)
}

fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn parse_content_length(value: Option<&header::HeaderValue>) -> Option<u64> {
    value
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

fn filename_from_headers(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_content_disposition)
}

fn parse_content_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename=") {
            let trimmed = rest.trim_matches('"');
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Connection manager for HTTP transfers: owns the shared client and the
/// scheduling session, and turns [`TransferRequest`]s into queued
/// coordinators.
pub struct HttpSession {
    session: Arc<Session<HttpTransport>>,
    client: Client,
}

impl HttpSession {
    pub fn new(concurrent: usize, speed_limit: Option<u64>) -> Result<Self, TransferError> {
        Ok(Self {
            session: Arc::new(Session::new(concurrent, speed_limit)),
            client: build_client(true, None)?,
        })
    }

    /// Queues a download. The returned coordinator can be held to inspect
    /// the transfer later; the session keeps its own handle either way.
    pub fn get(
        &self,
        request: TransferRequest,
    ) -> Result<Arc<FileSync<HttpTransport>>, TransferError> {
        let client = if request.persist_connection && request.verify_tls {
            self.client.clone()
        } else {
            build_client(request.verify_tls, Some(request.timeout))?
        };

        let transport = Arc::new(HttpTransport::new(
            client,
            request.url.clone(),
            request.auth.clone(),
        ));
        let sync = Arc::new(FileSync::new(
            transport,
            &request,
            Some(self.session.tracker()),
            Some(self.session.limiter()),
        ));
        self.session.enqueue(Arc::clone(&sync));
        Ok(sync)
    }

    pub fn run(&self, forever: bool) -> Option<JoinHandle<()>> {
        Arc::clone(&self.session).run(forever)
    }

    pub fn stop(&self) {
        self.session.stop();
    }

    pub fn pause(&self) {
        self.session.pause();
    }

    pub fn resume(&self) {
        self.session.resume();
    }

    pub fn is_running(&self) -> bool {
        self.session.is_running()
    }

    pub fn get_progress(&self) -> Progress {
        self.session.get_progress()
    }

    pub fn tracker(&self) -> Arc<ProgressTracker> {
        self.session.tracker()
    }

    pub fn limiter(&self) -> Arc<SpeedLimiter> {
        self.session.limiter()
    }

    pub fn finished(&self) -> Vec<Arc<FileSync<HttpTransport>>> {
        self.session.finished()
    }

    pub fn errors(&self) -> Vec<Arc<FileSync<HttpTransport>>> {
        self.session.errors()
    }
}
