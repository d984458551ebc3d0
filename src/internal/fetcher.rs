use anyhow::Result;
use tracing::{error, info, warn};

use super::models::Frame;
use super::store::ImageStore;
use crate::api::{FigmaClient, FigmaError};

/// Error raised when the fetch step cannot produce any usable baseline.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(
        "Figma token is required to fetch {missing} frame(s) that are not cached. \
         Set FIGMA_ACCESS_TOKEN (or FIGMA_TOKEN), or run with --skip-fetch"
    )]
    MissingCredential { missing: usize },

    #[error(
        "{source}; no cached baselines are available. Retry later, or place exports manually at {example_path}"
    )]
    RateLimitedWithoutCache {
        #[source]
        source: FigmaError,
        example_path: String,
    },

    #[error(
        "failed to resolve image URLs: {source}. Run with --skip-fetch to reuse cached baselines, \
         or place exports manually at {example_path}"
    )]
    Upstream {
        #[source]
        source: FigmaError,
        example_path: String,
    },
}

/// What happened to each configured frame during a fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    pub fetched: Vec<String>,
    pub cached: Vec<String>,
    pub failed: Vec<String>,
    /// True when the host refused the batch and cached baselines were used instead.
    pub used_cache_fallback: bool,
}

impl FetchOutcome {
    /// Frames that now have a usable baseline.
    pub fn available(&self) -> usize {
        self.fetched.len() + self.cached.len()
    }
}

/// Settings shared by every fetch.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    pub force_refresh: bool,
    pub download_retries: u32,
}

/// Bring the baseline store up to date for `frames`.
///
/// Frames already present in `store` are reused unless `force_refresh` is set.
/// The remaining frames are resolved with one batched request and downloaded one by one.
///
/// When the batched request fails, cached baselines are used if there are any. A rate
/// limit always allows that fallback; any other failure only does without `force_refresh`.
pub fn fetch_references(
    client: Option<&FigmaClient>,
    file_key: &str,
    frames: &[Frame],
    store: &dyn ImageStore,
    options: FetchOptions,
) -> Result<FetchOutcome, FetchError> {
    let mut outcome = FetchOutcome::default();

    let (cached, to_fetch): (Vec<&Frame>, Vec<&Frame>) = frames
        .iter()
        .partition(|f| !options.force_refresh && store.has(&f.name));

    for frame in &cached {
        info!(frame = %frame.name, "Using cached baseline");
        outcome.cached.push(frame.name.clone());
    }

    if to_fetch.is_empty() {
        info!(cached = outcome.cached.len(), "All baselines cached, skipping Figma API");
        return Ok(outcome);
    }

    let example_path = store.location(&to_fetch[0].name);

    let Some(client) = client else {
        if options.force_refresh || outcome.cached.is_empty() {
            return Err(FetchError::MissingCredential {
                missing: to_fetch.len(),
            });
        }
        for frame in &to_fetch {
            warn!(frame = %frame.name, "No Figma token, baseline not fetched");
            outcome.failed.push(frame.name.clone());
        }
        outcome.used_cache_fallback = true;
        return Ok(outcome);
    };

    let node_ids: Vec<&str> = to_fetch.iter().map(|f| f.node_id.as_str()).collect();
    info!(file_key, count = node_ids.len(), "Fetching images from Figma API");

    let urls = match client.get_image_urls(file_key, &node_ids) {
        Ok(urls) => urls,
        Err(e) => {
            let any_cached = frames.iter().any(|f| store.has(&f.name));
            let rate_limited = matches!(e, FigmaError::RateLimited { .. });

            if rate_limited && any_cached {
                warn!(error = %e, "Figma API rate limited, continuing with cached baselines");
            } else if !rate_limited && any_cached && !options.force_refresh {
                error!(error = %e, "Figma API request failed, continuing with cached baselines");
            } else if rate_limited {
                return Err(FetchError::RateLimitedWithoutCache {
                    source: e,
                    example_path,
                });
            } else {
                return Err(FetchError::Upstream {
                    source: e,
                    example_path,
                });
            }

            fall_back_to_cache(&to_fetch, store, &mut outcome);
            return Ok(outcome);
        }
    };

    for frame in to_fetch {
        let Some(url) = urls.get(&frame.node_id) else {
            warn!(frame = %frame.name, node_id = %frame.node_id, "No image URL returned");
            outcome.failed.push(frame.name.clone());
            continue;
        };

        let saved = client
            .download_image_with_retry(url, options.download_retries)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| store.put(&frame.name, &bytes));

        match saved {
            Ok(()) => {
                info!(frame = %frame.name, location = %store.location(&frame.name), "Downloaded baseline");
                outcome.fetched.push(frame.name.clone());
            }
            Err(e) => {
                warn!(frame = %frame.name, error = %format!("{e:#}"), "Failed to download baseline");
                outcome.failed.push(frame.name.clone());
            }
        }
    }

    Ok(outcome)
}

fn fall_back_to_cache(to_fetch: &[&Frame], store: &dyn ImageStore, outcome: &mut FetchOutcome) {
    for frame in to_fetch {
        if store.has(&frame.name) {
            outcome.cached.push(frame.name.clone());
        } else {
            outcome.failed.push(frame.name.clone());
        }
    }
    outcome.used_cache_fallback = true;
}
