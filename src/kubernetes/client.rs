//! A minimal API-server client: list and watch, which is all service
//! discovery needs to keep its caches warm.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use headers::{Authorization, HeaderMapExt};
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use serde::Deserialize;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

use super::resource::{ObjectList, Resource};

const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";

// Credential files mounted into every pod running with a service account.
const SERVICE_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_CA_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

// https://github.com/kubernetes/kubernetes/issues/6513
const WATCH_TIMEOUT_SECONDS: u32 = 290;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("build http request failed, {0}")]
    BuildRequest(#[from] http::Error),

    #[error(transparent)]
    Http(hyper_util::client::legacy::Error),

    #[error("read http response failed, {0}")]
    ReadResponse(#[from] hyper::Error),

    #[error("api server error, status: {}, reason: {}, message: {}", .0.status, .0.reason, .0.message)]
    Api(ErrorResponse),

    #[error("deserialize response failed, {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("read watch event failed, {0}")]
    ReadEvents(std::io::Error),

    #[error("chunk line is too large")]
    LineTooLong,

    #[error("refresh token failed, {0}")]
    RefreshToken(std::io::Error),

    #[error("in-cluster environment variable {0} is not set")]
    NotInCluster(&'static str),

    #[error("invalid cluster url, {0}")]
    InvalidClusterUrl(#[from] http::uri::InvalidUri),

    #[error("read file {1:?} failed, {0}")]
    ReadFile(#[source] std::io::Error, PathBuf),

    #[error("parse PEM-encoded certificates failed, {0}")]
    ParseCertificates(#[source] pem::PemError),

    #[error("build root cert store failed, {0}")]
    BuildRootStore(#[source] rustls::Error),
}

/// An error response from the API.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ErrorResponse {
    pub status: String,
    pub message: String,
    pub reason: String,
    pub code: u16,
}

/// The slimmed-down object carried by BOOKMARK events. Can only be relied
/// upon to have a resource version.
#[derive(Debug, Deserialize)]
pub struct Bookmark {
    pub metadata: BookmarkMeta,
}

#[derive(Debug, Deserialize)]
pub struct BookmarkMeta {
    #[serde(rename = "resourceVersion")]
    pub resource_version: String,
}

/// A raw event returned from a watch query. A watch response body carries
/// many of these as newline-separated JSON.
#[derive(Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<R> {
    Added(R),
    Modified(R),
    Deleted(R),
    Bookmark(Bookmark),
    Error(ErrorResponse),
}

/// A bearer token re-read from disk when it goes stale, the way kubelet
/// rotates projected service-account tokens.
#[derive(Clone)]
pub struct RefreshableToken {
    path: PathBuf,
    inner: Arc<Mutex<(String, Instant)>>,
}

impl RefreshableToken {
    const EXPIRY: Duration = Duration::from_secs(60);

    pub fn new(path: PathBuf) -> std::io::Result<Self> {
        let token = std::fs::read_to_string(&path)?;
        let inner = Arc::new(Mutex::new((token, Instant::now() + Self::EXPIRY)));

        Ok(Self { path, inner })
    }

    fn token(&self) -> std::io::Result<String> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if now > inner.1 {
            inner.0 = std::fs::read_to_string(&self.path)?;
            inner.1 = now + Self::EXPIRY;
        }

        Ok(inner.0.clone())
    }
}

/// Tells the cluster who we are.
#[derive(Clone)]
pub enum Auth {
    None,
    Bearer(String),
    BearerFile(RefreshableToken),
}

impl Auth {
    fn apply<T>(&self, req: &mut Request<T>) -> std::io::Result<()> {
        let token = match self {
            Auth::None => return Ok(()),
            Auth::Bearer(token) => token.clone(),
            Auth::BearerFile(refreshable) => refreshable.token()?,
        };

        if let Ok(header) = Authorization::bearer(token.trim()) {
            req.headers_mut().typed_insert(header);
        }

        Ok(())
    }
}

/// Connection settings for the API server.
pub struct ClientConfig {
    /// `https://host:port` of the API server.
    pub cluster_url: String,

    pub auth: Auth,

    /// PEM bundle to trust when verifying the server certificate. Native
    /// roots are used when unset.
    pub ca_file: Option<PathBuf>,
}

impl ClientConfig {
    /// Connection settings from the in-cluster service-account environment
    /// and mount.
    pub fn in_cluster() -> Result<Self, Error> {
        let host =
            env::var(SERVICE_HOST_ENV).map_err(|_| Error::NotInCluster(SERVICE_HOST_ENV))?;
        let port =
            env::var(SERVICE_PORT_ENV).map_err(|_| Error::NotInCluster(SERVICE_PORT_ENV))?;

        // Ensure IPv6 hosts are properly bracketed.
        let cluster_url = if host.contains(':') {
            format!("https://[{host}]:{port}")
        } else {
            format!("https://{host}:{port}")
        };

        let token = RefreshableToken::new(SERVICE_TOKEN_FILE.into())
            .map_err(Error::RefreshToken)?;

        Ok(Self {
            cluster_url,
            auth: Auth::BearerFile(token),
            ca_file: Some(SERVICE_CA_FILE.into()),
        })
    }
}

type HttpClient =
    hyper_util::client::legacy::Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

#[derive(Clone)]
pub struct Client {
    http: HttpClient,
    auth: Auth,
    endpoint: String,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        // Validate the url early, requests embed it as a plain string.
        config.cluster_url.parse::<http::Uri>()?;

        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(root_store(config.ca_file.as_ref())?)
            .with_no_client_auth();

        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);

        let http =
            hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(connector);

        let endpoint = config
            .cluster_url
            .strip_suffix('/')
            .unwrap_or(&config.cluster_url)
            .to_string();

        Ok(Self {
            http,
            auth: config.auth,
            endpoint,
        })
    }

    /// List a collection of a resource. `resourceVersion=0` lets the API
    /// server answer from its own cache, which is what a cache-priming
    /// client wants.
    pub async fn list<R: Resource>(
        &self,
        namespace: Option<&str>,
    ) -> Result<ObjectList<R>, Error> {
        let uri = format!(
            "{}{}?resourceVersion=0",
            self.endpoint,
            R::url_path(namespace)
        );

        let mut req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::<Bytes>::default())?;
        self.auth.apply(&mut req).map_err(Error::RefreshToken)?;

        let resp = self.http.request(req).await.map_err(Error::Http)?;
        let (parts, incoming) = resp.into_parts();
        let body = incoming.collect().await?.to_bytes();

        if !parts.status.is_success() {
            let err = serde_json::from_slice::<ErrorResponse>(&body)?;
            return Err(Error::Api(err));
        }

        serde_json::from_slice::<ObjectList<R>>(&body).map_err(Error::Deserialize)
    }

    /// Start a watch at `resource_version`. The returned stream ends when
    /// the server closes the connection; the caller is expected to watch
    /// again from the last observed version.
    pub async fn watch<R: Resource>(
        &self,
        namespace: Option<&str>,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<R>, Error>>, Error> {
        let query = {
            let mut builder = form_urlencoded::Serializer::new(String::new());
            builder.append_pair("watch", "true");
            builder.append_pair("resourceVersion", resource_version);
            builder.append_pair("timeoutSeconds", &WATCH_TIMEOUT_SECONDS.to_string());
            builder.append_pair("allowWatchBookmarks", "true");
            builder.finish()
        };
        let uri = format!("{}{}?{}", self.endpoint, R::url_path(namespace), query);

        trace!(message = "starting watch request", uri);

        let mut req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::<Bytes>::default())?;
        self.auth.apply(&mut req).map_err(Error::RefreshToken)?;

        let resp = self.http.request(req).await.map_err(Error::Http)?;
        let (parts, incoming) = resp.into_parts();
        if !parts.status.is_success() {
            let body = incoming.collect().await?.to_bytes();
            let err = serde_json::from_slice::<ErrorResponse>(&body)?;
            return Err(Error::Api(err));
        }

        let reader = StreamReader::new(
            incoming
                .into_data_stream()
                .map_err(std::io::Error::other),
        );
        let lines = FramedRead::new(reader, LinesCodec::new());

        Ok(Box::pin(lines.filter_map(|result| async {
            match result {
                Ok(line) => match serde_json::from_str::<WatchEvent<R>>(&line) {
                    Ok(event) => Some(Ok(event)),
                    Err(err) => {
                        // Incomplete trailing line from `decode_eof`.
                        if err.is_eof() {
                            return None;
                        }

                        if let Ok(resp) = serde_json::from_str::<ErrorResponse>(&line) {
                            return Some(Err(Error::Api(resp)));
                        }

                        Some(Err(Error::Deserialize(err)))
                    }
                },
                Err(LinesCodecError::Io(err)) => match err.kind() {
                    // The chunked decoder tends to report an unexpected EOF
                    // when a long-lived watch expires server side.
                    std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::TimedOut => {
                        debug!(message = "watch body ended", %err);
                        None
                    }
                    _ => Some(Err(Error::ReadEvents(err))),
                },
                Err(LinesCodecError::MaxLineLengthExceeded) => Some(Err(Error::LineTooLong)),
            }
        })))
    }
}

fn root_store(ca_file: Option<&PathBuf>) -> Result<RootCertStore, Error> {
    let mut store = RootCertStore::empty();

    match ca_file {
        Some(path) => {
            let data =
                std::fs::read(path).map_err(|err| Error::ReadFile(err, path.clone()))?;
            let certs = pem::parse_many(data)
                .map_err(Error::ParseCertificates)?
                .into_iter()
                .filter(|p| p.tag() == "CERTIFICATE")
                .map(|p| p.into_contents());

            for cert in certs {
                store
                    .add(CertificateDer::from(cert))
                    .map_err(Error::BuildRootStore)?;
            }
        }
        None => {
            let result = rustls_native_certs::load_native_certs();
            for err in &result.errors {
                debug!(message = "loading a native certificate failed", %err);
            }

            for cert in result.certs {
                if let Err(err) = store.add(cert) {
                    debug!(message = "native certificate rejected", %err);
                }
            }

            if store.is_empty() {
                debug!(message = "no valid native root CA certificates found");
            }
        }
    }

    Ok(store)
}
