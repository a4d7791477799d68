//! Tile providers: where raw tile bytes come from
//!
//! A provider is described by a serializable [`ProviderSpec`] and fetches
//! bytes through the async [`TileProvider`] trait. [`HttpTileProvider`]
//! covers the usual `{z}/{x}/{y}` URL template servers.

use crate::core::geo::{PixelSize, TileKey};
use crate::projection::{Projection, ProjectionKind};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_USER_AGENT: &str = concat!("tilepyramid/", env!("CARGO_PKG_VERSION"));

/// Shared async HTTP client for every provider of the process
pub(crate) static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent(DEFAULT_USER_AGENT)
        .tcp_keepalive(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(16)
        .build()
        .unwrap_or_else(|err| {
            log::warn!("falling back to default HTTP client: {}", err);
            reqwest::Client::new()
        })
});

/// Why one tile fetch did not produce an image
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Network hiccup, timeout, throttling or server-side error; retried
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// Provider reports that the tile does not exist
    #[error("tile does not exist on the provider")]
    NotFound,

    #[error("zoom {zoom} is outside the provider range {min}..={max}")]
    ZoomOutOfRange { zoom: u8, min: u8, max: u8 },

    /// Any other non-success status
    #[error("provider answered with HTTP {0}")]
    Status(u16),

    #[error("could not decode tile bytes: {0}")]
    Decode(String),

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Terminal errors are recorded once and never retried automatically
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::ZoomOutOfRange { .. } | Self::Status(_) | Self::Decode(_)
        )
    }

    /// Classifies a non-success HTTP status
    pub fn from_status(status: u16) -> Self {
        match status {
            404 | 410 => Self::NotFound,
            408 | 429 | 500..=599 => Self::Transient(format!("HTTP {}", status)),
            other => Self::Status(other),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::from_status(status.as_u16()),
            None => Self::Transient(err.to_string()),
        }
    }
}

/// Identifies one tile source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Stable identifier, also the disk store namespace
    pub id: String,
    pub name: String,
    /// URL with `{z}`, `{x}`, `{y}`, `{-y}`, `{s}` and `{q}` placeholders
    pub url_template: String,
    #[serde(default)]
    pub projection: ProjectionKind,
    #[serde(default)]
    pub min_zoom: u8,
    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,
    #[serde(default)]
    pub copyright: String,
    /// Rotated through `{s}`
    #[serde(default)]
    pub subdomains: Vec<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub referer: Option<String>,
    /// Layers painted over this provider's imagery
    #[serde(default)]
    pub overlays: Vec<ProviderSpec>,
}

fn default_max_zoom() -> u8 {
    19
}

impl ProviderSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url_template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url_template: url_template.into(),
            projection: ProjectionKind::default(),
            min_zoom: 0,
            max_zoom: default_max_zoom(),
            copyright: String::new(),
            subdomains: Vec::new(),
            user_agent: None,
            referer: None,
            overlays: Vec::new(),
        }
    }

    pub fn openstreetmap() -> Self {
        Self::new(
            "osm",
            "OpenStreetMap",
            "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png",
        )
        .with_subdomains(["a", "b", "c"])
        .with_copyright("© OpenStreetMap contributors")
    }

    pub fn with_projection(mut self, projection: ProjectionKind) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_zoom_range(mut self, min_zoom: u8, max_zoom: u8) -> Self {
        self.min_zoom = min_zoom;
        self.max_zoom = max_zoom;
        self
    }

    pub fn with_copyright(mut self, copyright: impl Into<String>) -> Self {
        self.copyright = copyright.into();
        self
    }

    pub fn with_subdomains<I, S>(mut self, subdomains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subdomains = subdomains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_overlay(mut self, overlay: ProviderSpec) -> Self {
        self.overlays.push(overlay);
        self
    }

    pub fn supports_zoom(&self, zoom: u8) -> bool {
        (self.min_zoom..=self.max_zoom).contains(&zoom)
    }

    pub fn check_zoom(&self, zoom: u8) -> Result<(), FetchError> {
        if self.supports_zoom(zoom) {
            Ok(())
        } else {
            Err(FetchError::ZoomOutOfRange {
                zoom,
                min: self.min_zoom,
                max: self.max_zoom,
            })
        }
    }

    pub fn tile_size(&self) -> PixelSize {
        self.projection.build().tile_size()
    }

    /// Expands the URL template for `key`
    pub fn tile_url(&self, key: &TileKey) -> String {
        let (_, rows) = self.projection.build().tile_matrix_size_xy(key.zoom);
        let mut url = self
            .url_template
            .replace("{z}", &key.zoom.to_string())
            .replace("{x}", &key.pos.x.to_string())
            .replace("{-y}", &(rows - 1 - key.pos.y).to_string())
            .replace("{y}", &key.pos.y.to_string());

        if url.contains("{q}") {
            url = url.replace("{q}", &key.quadkey());
        }
        if url.contains("{s}") {
            let sub = if self.subdomains.is_empty() {
                ""
            } else {
                let idx = (key.pos.x + key.pos.y).rem_euclid(self.subdomains.len() as i64);
                self.subdomains[idx as usize].as_str()
            };
            url = url.replace("{s}", sub);
        }
        url
    }
}

/// Source of raw tile bytes.
///
/// An empty byte vector means the provider resolved the tile as blank (no
/// imagery for that cell), which is not an error.
#[async_trait]
pub trait TileProvider: Send + Sync + Debug {
    fn spec(&self) -> &ProviderSpec;

    async fn fetch_tile_bytes(&self, key: TileKey) -> Result<Vec<u8>, FetchError>;

    fn id(&self) -> &str {
        &self.spec().id
    }

    fn projection(&self) -> Arc<dyn Projection> {
        self.spec().projection.build()
    }

    /// Providers whose layers are composited over this one, in paint order
    fn overlays(&self) -> Vec<Arc<dyn TileProvider>> {
        Vec::new()
    }
}

/// Template-URL provider over HTTP(S)
#[derive(Debug)]
pub struct HttpTileProvider {
    spec: ProviderSpec,
    projection: Arc<dyn Projection>,
    overlays: Vec<Arc<dyn TileProvider>>,
}

impl HttpTileProvider {
    pub fn new(spec: ProviderSpec) -> Self {
        let overlays = spec
            .overlays
            .iter()
            .cloned()
            .map(|overlay| Arc::new(HttpTileProvider::new(overlay)) as Arc<dyn TileProvider>)
            .collect();
        Self {
            projection: spec.projection.build(),
            spec,
            overlays,
        }
    }

    pub fn openstreetmap() -> Self {
        Self::new(ProviderSpec::openstreetmap())
    }
}

#[async_trait]
impl TileProvider for HttpTileProvider {
    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    async fn fetch_tile_bytes(&self, key: TileKey) -> Result<Vec<u8>, FetchError> {
        self.spec.check_zoom(key.zoom)?;

        let url = self.spec.tile_url(&key);
        log::debug!("fetching tile {} from {}", key, url);

        let mut request = HTTP_CLIENT.get(&url);
        if let Some(user_agent) = &self.spec.user_agent {
            request = request.header(reqwest::header::USER_AGENT, user_agent);
        }
        if let Some(referer) = &self.spec.referer {
            request = request.header(reqwest::header::REFERER, referer);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(FetchError::from_status(status.as_u16()));
        }

        Ok(response.bytes().await?.to_vec())
    }

    fn projection(&self) -> Arc<dyn Projection> {
        self.projection.clone()
    }

    fn overlays(&self) -> Vec<Arc<dyn TileProvider>> {
        self.overlays.clone()
    }
}
