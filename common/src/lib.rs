#![warn(clippy::nursery, clippy::pedantic)]

//! Contains the wire types and helpers shared by the server and the CLI.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use headers::{Header, HeaderName, HeaderValue};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use url::Url;

pub const PASTES_ENDPOINT: &str = "/api/pastes";
pub const HEALTH_ENDPOINT: &str = "/api/healthz";

/// Path segment under which pastes are linked for humans.
pub const PASTE_PATH_SEGMENT: &str = "p";

/// Body of a paste creation request.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct CreatePasteRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_views: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CreatePasteResponse {
    pub id: String,
    pub url: String,
}

/// What a reader gets back for a single successful view.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PasteView {
    pub content: String,
    pub remaining_views: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HealthResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

lazy_static! {
    pub static ref TEST_NOW_HEADER_NAME: HeaderName = HeaderName::from_static("x-test-now-ms");
}

/// Overrides the server's notion of "now" with a unix timestamp in
/// milliseconds. Only honored when the server runs in test mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TestNow(pub DateTime<Utc>);

impl Header for TestNow {
    fn name() -> &'static HeaderName {
        &*TEST_NOW_HEADER_NAME
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        Self: Sized,
        I: Iterator<Item = &'i HeaderValue>,
    {
        values
            .next()
            .ok_or_else(headers::Error::invalid)?
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .map(Self)
            .ok_or_else(headers::Error::invalid)
    }

    fn encode<E: Extend<HeaderValue>>(&self, container: &mut E) {
        container.extend(std::iter::once(HeaderValue::from(
            self.0.timestamp_millis(),
        )));
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseUrlError {
    #[error("The provided url was bad")]
    BadUrl,
    #[error("The url cannot have path segments")]
    CannotBeABase,
    #[error("The url does not point at a paste")]
    NotAPaste,
}

/// Builds the human-facing link for a paste, `<base>/p/<id>`.
///
/// # Errors
///
/// Returns an error if `base` cannot carry a path, such as a `mailto:` url.
pub fn paste_url(base: &Url, id: &str) -> Result<Url, ParseUrlError> {
    let mut url = base.clone();
    url.set_fragment(None);
    url.set_query(None);
    url.path_segments_mut()
        .map_err(|_| ParseUrlError::CannotBeABase)?
        .pop_if_empty()
        .extend([PASTE_PATH_SEGMENT, id]);
    Ok(url)
}

/// A paste link split into the server it lives on and its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PasteLocator {
    pub base: Url,
    pub id: String,
}

impl PasteLocator {
    /// The API endpoint that serves this paste.
    ///
    /// # Errors
    ///
    /// Returns an error if the base url cannot carry a path.
    pub fn api_url(&self) -> Result<Url, ParseUrlError> {
        api_url(&self.base, &self.id)
    }
}

/// Builds `<base>/api/pastes/<id>`.
///
/// # Errors
///
/// Returns an error if `base` cannot carry a path.
pub fn api_url(base: &Url, id: &str) -> Result<Url, ParseUrlError> {
    let mut url = base.clone();
    url.set_fragment(None);
    url.set_query(None);
    url.path_segments_mut()
        .map_err(|_| ParseUrlError::CannotBeABase)?
        .pop_if_empty()
        .extend(PASTES_ENDPOINT.trim_start_matches('/').split('/'))
        .push(id);
    Ok(url)
}

impl FromStr for PasteLocator {
    type Err = ParseUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut url = Url::from_str(s).map_err(|_| ParseUrlError::BadUrl)?;
        url.set_fragment(None);
        url.set_query(None);

        let segments: Vec<String> = url
            .path_segments()
            .ok_or(ParseUrlError::CannotBeABase)?
            .filter(|segment| !segment.is_empty())
            .map(ToOwned::to_owned)
            .collect();

        let (id, prefix) = match segments.as_slice() {
            [prefix @ .., marker, id] if marker == PASTE_PATH_SEGMENT => (id.clone(), prefix),
            _ => return Err(ParseUrlError::NotAPaste),
        };

        url.path_segments_mut()
            .map_err(|_| ParseUrlError::CannotBeABase)?
            .clear()
            .extend(prefix);

        Ok(Self { base: url, id })
    }
}
