use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

pub const FIGMA_API_BASE_URL: &str = "https://api.figma.com/v1";

const TOKEN_HEADER: &str = "X-Figma-Token";

/// Errors returned by the design host.
///
/// `RateLimited` is kept apart from other upstream failures because callers
/// prefer to continue with cached baselines rather than abort.
#[derive(Debug, Error)]
pub enum FigmaError {
    #[error("Figma API rate limit exceeded{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<u64> },

    #[error("Figma API error: {status} for {url}")]
    Http { status: StatusCode, url: String },

    #[error("Figma API error: {0}")]
    Api(String),

    #[error("failed to send request to {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to parse response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

fn retry_hint(retry_after: &Option<u64>) -> String {
    match retry_after {
        Some(secs) => format!(" (retry after {secs}s)"),
        None => String::new(),
    }
}

impl FigmaError {
    /// Whether a retry of the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Http { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    err: Option<String>,
    #[serde(default)]
    images: HashMap<String, Option<String>>,
}

/// Blocking client for the Figma REST API.
#[derive(Clone)]
pub struct FigmaClient {
    client: Client,
    token: String,
    base_url: String,
}

impl FigmaClient {
    /// Create a client against the public Figma API.
    pub fn new(token: impl Into<String>) -> Result<Self, FigmaError> {
        Self::with_base_url(token, FIGMA_API_BASE_URL)
    }

    /// Create a client against another host, e.g. a mock server in tests.
    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, FigmaError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(FigmaError::Client)?;
        Ok(Self {
            client,
            token: token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn images_url(&self, file_key: &str, node_ids: &[&str]) -> String {
        format!(
            "{}/images/{}?ids={}&format=png&scale=1",
            self.base_url,
            file_key,
            node_ids.join(",")
        )
    }

    /// Ask the host to render `node_ids` and return their raster URLs.
    ///
    /// Nodes the host could not render (null URL) are left out of the map.
    #[tracing::instrument(skip(self, node_ids), fields(nodes = node_ids.len()))]
    pub fn get_image_urls(
        &self,
        file_key: &str,
        node_ids: &[&str],
    ) -> Result<BTreeMap<String, String>, FigmaError> {
        let url = self.images_url(file_key, node_ids);

        let resp = self
            .client
            .get(&url)
            .header(TOKEN_HEADER, &self.token)
            .send()
            .map_err(|source| FigmaError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            return Err(FigmaError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(FigmaError::Http { status, url });
        }

        let body: ImagesResponse = resp.json().map_err(|source| FigmaError::Decode {
            url: url.clone(),
            source,
        })?;

        if let Some(err) = body.err {
            return Err(FigmaError::Api(err));
        }

        let images: BTreeMap<String, String> = body
            .images
            .into_iter()
            .filter_map(|(node_id, url)| url.map(|u| (node_id, u)))
            .collect();

        tracing::debug!(resolved = images.len(), "Resolved image URLs");
        Ok(images)
    }

    /// Download a rendered raster.
    pub fn download_image(&self, url: &str) -> Result<Vec<u8>, FigmaError> {
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|source| FigmaError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FigmaError::Http {
                status,
                url: url.to_string(),
            });
        }

        let bytes = resp.bytes().map_err(|source| FigmaError::Decode {
            url: url.to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }

    /// Download with up to `retries` extra attempts on transient failures.
    pub fn download_image_with_retry(
        &self,
        url: &str,
        retries: u32,
    ) -> Result<Vec<u8>, FigmaError> {
        let mut attempt = 0;
        loop {
            match self.download_image(url) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    tracing::warn!(url, attempt, error = %e, "Download failed, retrying");
                    std::thread::sleep(Duration::from_millis(250 * attempt as u64));
                }
                Err(e) => return Err(e),
            }
        }
    }
}
