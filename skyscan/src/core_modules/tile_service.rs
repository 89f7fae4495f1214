// THEORY:
// Web imagery comes from XYZ tile services: square 256-pixel tiles in spherical
// web mercator (EPSG:3857), addressed by zoom level and column / row counted from
// the north-west corner of the world.
//
// The module has three layers:
// 1.  **Tile math**: resolution per zoom and the tile range covering a projected
//     box.
// 2.  **Fetching**: `TileFetcher` downloads one encoded tile. `HttpTileFetcher`
//     does so with reqwest from a `{z}/{x}/{y}` URL template; tests plug in an
//     in-memory fetcher.
// 3.  **Mosaic**: `MapServiceImage` presents the covering tile range as one
//     `GeoImage` whose blocks are tiles, so the rest of the engine reads web
//     imagery exactly like a local raster.
//
// `TileClient` knows how each supported service turns user options (map id,
// token, TileJSON document, explicit template) into a URL template.

use crate::core_modules::geometry::GeoBox;
use crate::core_modules::raster::GeoImage;
use crate::core_modules::transform::{AffineTransform, EARTH_RADIUS, SpatialReference};
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use image::{RgbImage, imageops};
use serde::Deserialize;
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::{debug, info};

pub const TILE_SIZE: u32 = 256;
pub const MAX_ZOOM: u32 = 24;
const MAPS_API_TEMPLATE: &str = "https://api.mapbox.com/v4/{map_id}/{z}/{x}/{y}.jpg?access_token={token}";

/// Half the width of the web mercator world in metres.
fn half_world() -> f64 {
    PI * EARTH_RADIUS
}

/// Metres per pixel at `zoom`.
pub fn resolution(zoom: u32) -> f64 {
    2.0 * half_world() / (TILE_SIZE as f64 * 2f64.powi(zoom as i32))
}

/// Inclusive range of tiles at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub zoom: u32,
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl TileRange {
    /// Tiles covering `bbox` (EPSG:3857 metres), clamped to the world.
    pub fn covering(zoom: u32, bbox: &GeoBox) -> Result<Self> {
        if zoom > MAX_ZOOM {
            return Err(Error::invalid(format!("zoom {zoom} is above the maximum of {MAX_ZOOM}")));
        }
        if !bbox.is_valid() {
            return Err(Error::invalid("the bounding box is empty"));
        }
        let tile_span = TILE_SIZE as f64 * resolution(zoom);
        let last = (1u32 << zoom) - 1;
        let tile = |v: f64| (v.floor().max(0.0) as u32).min(last);
        Ok(Self {
            zoom,
            min_x: tile((bbox.west + half_world()) / tile_span),
            max_x: tile((bbox.east + half_world()) / tile_span),
            min_y: tile((half_world() - bbox.north) / tile_span),
            max_y: tile((half_world() - bbox.south) / tile_span),
        })
    }

    pub fn columns(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn rows(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    /// Geotransform placing pixel (0, 0) at the north-west corner of the first tile.
    pub fn pixel_to_proj(&self) -> AffineTransform {
        let res = resolution(self.zoom);
        let tile_span = TILE_SIZE as f64 * res;
        AffineTransform::new([
            -half_world() + self.min_x as f64 * tile_span,
            res,
            0.0,
            half_world() - self.min_y as f64 * tile_span,
            0.0,
            -res,
        ])
    }
}

pub trait TileFetcher: Send + Sync {
    /// Downloads the encoded image of tile (`x`, `y`) at `zoom`.
    fn fetch(&self, zoom: u32, x: u32, y: u32) -> BoxFuture<'_, Result<Vec<u8>>>;
}

/// HTTP basic credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Splits `user:pass`. The password may itself contain colons.
    pub fn parse(text: &str) -> Option<Self> {
        let (username, password) = text.split_once(':')?;
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Substitutes `{z}`, `{x}` and `{y}` in `template`.
pub fn expand_template(template: &str, zoom: u32, x: u32, y: u32) -> String {
    template
        .replace("{z}", &zoom.to_string())
        .replace("{x}", &x.to_string())
        .replace("{y}", &y.to_string())
}

pub struct HttpTileFetcher {
    client: reqwest::Client,
    template: String,
    credentials: Option<Credentials>,
}

impl HttpTileFetcher {
    pub fn with_client(
        client: reqwest::Client,
        template: impl Into<String>,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            client,
            template: template.into(),
            credentials,
        }
    }
}

impl TileFetcher for HttpTileFetcher {
    fn fetch(&self, zoom: u32, x: u32, y: u32) -> BoxFuture<'_, Result<Vec<u8>>> {
        let url = expand_template(&self.template, zoom, x, y);
        Box::pin(async move {
            let body = get(&self.client, &url, self.credentials.as_ref()).await?;
            Ok(body)
        })
    }
}

async fn get(client: &reqwest::Client, url: &str, credentials: Option<&Credentials>) -> Result<Vec<u8>> {
    let mut request = client.get(url);
    if let Some(c) = credentials {
        request = request.basic_auth(&c.username, Some(&c.password));
    }
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::TileService(format!("{url} returned {status}")));
    }
    Ok(response.bytes().await?.to_vec())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    MapsApi,
    TileJson,
    Xyz,
}

impl ServiceKind {
    pub const fn name(&self) -> &'static str {
        match self {
            ServiceKind::MapsApi => "maps-api",
            ServiceKind::TileJson => "tile-json",
            ServiceKind::Xyz => "xyz",
        }
    }
}

/// The parts of a TileJSON document the engine uses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TileJson {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tiles: Vec<String>,
    #[serde(default)]
    pub minzoom: Option<u32>,
    #[serde(default)]
    pub maxzoom: Option<u32>,
    #[serde(default)]
    pub bounds: Option<[f64; 4]>,
}

impl TileJson {
    fn check_zoom(&self, zoom: u32) -> Result<()> {
        let min = self.minzoom.unwrap_or(0);
        let max = self.maxzoom.unwrap_or(MAX_ZOOM);
        if zoom < min || zoom > max {
            return Err(Error::invalid(format!(
                "Zoom level {zoom} is outside the service's range {min}..{max}"
            )));
        }
        Ok(())
    }

    /// Template for this document, fetched from `doc_url`.
    ///
    /// With `use_tiles` the first `tiles` entry is used as is; otherwise the last
    /// path segment of `doc_url` is replaced by `{z}/{x}/{y}.<ext>`.
    pub fn template(&self, doc_url: &str, use_tiles: bool, zoom: u32) -> Result<String> {
        self.check_zoom(zoom)?;
        if use_tiles {
            return self
                .tiles
                .first()
                .cloned()
                .ok_or_else(|| Error::TileService("TileJSON document lists no tiles".to_string()));
        }
        let ext = self
            .tiles
            .first()
            .and_then(|t| template_extension(t))
            .unwrap_or("png");
        let (base, query) = match doc_url.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (doc_url, None),
        };
        let dir = base
            .rfind('/')
            .map(|idx| &base[..idx])
            .ok_or_else(|| Error::invalid(format!("invalid TileJSON url: {doc_url}")))?;
        let mut template = format!("{dir}/{{z}}/{{x}}/{{y}}.{ext}");
        if let Some(query) = query {
            template.push('?');
            template.push_str(query);
        }
        Ok(template)
    }
}

/// Extension of the last path segment of a URL template, ignoring the query.
fn template_extension(template: &str) -> Option<&str> {
    let path = template.split('?').next()?;
    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    (!ext.is_empty()).then_some(ext)
}

/// How to reach a tile service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileClient {
    MapsApi { map_id: String, token: String },
    TileJson { url: String, use_tiles: bool },
    Xyz { url: String },
}

impl TileClient {
    pub fn kind(&self) -> ServiceKind {
        match self {
            TileClient::MapsApi { .. } => ServiceKind::MapsApi,
            TileClient::TileJson { .. } => ServiceKind::TileJson,
            TileClient::Xyz { .. } => ServiceKind::Xyz,
        }
    }

    /// Resolves the URL template and builds an HTTP fetcher for it.
    pub async fn connect(&self, credentials: Option<Credentials>, zoom: u32) -> Result<HttpTileFetcher> {
        if zoom > MAX_ZOOM {
            return Err(Error::invalid(format!("zoom {zoom} is above the maximum of {MAX_ZOOM}")));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("skyscan/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let template = match self {
            TileClient::MapsApi { map_id, token } => MAPS_API_TEMPLATE
                .replace("{map_id}", map_id)
                .replace("{token}", token),
            TileClient::TileJson { url, use_tiles } => {
                info!(url = %url, "Reading TileJSON document...");
                let body = get(&client, url, credentials.as_ref()).await?;
                let doc: TileJson = serde_json::from_slice(&body)?;
                info!(
                    name = doc.name.as_deref().unwrap_or("unnamed"),
                    bounds = ?doc.bounds,
                    "TileJSON document read"
                );
                doc.template(url, *use_tiles, zoom)?
            }
            TileClient::Xyz { url } => url.clone(),
        };
        debug!(service = self.kind().name(), template = %template, "tile template resolved");
        Ok(HttpTileFetcher::with_client(client, template, credentials))
    }
}

/// A mosaic of web map tiles covering an area, read as a `GeoImage`.
pub struct MapServiceImage {
    fetcher: Arc<dyn TileFetcher>,
    range: TileRange,
    size: (u32, u32),
}

impl MapServiceImage {
    /// Covers `projected` (EPSG:3857 metres) with tiles at `zoom`.
    pub fn from_area(fetcher: Arc<dyn TileFetcher>, zoom: u32, projected: &GeoBox) -> Result<Self> {
        let range = TileRange::covering(zoom, projected)?;
        let size = match (
            range.columns().checked_mul(TILE_SIZE),
            range.rows().checked_mul(TILE_SIZE),
        ) {
            (Some(width), Some(height)) => (width, height),
            _ => {
                return Err(Error::invalid(format!(
                    "{} x {} tiles at zoom {zoom} are too large for one image; reduce the zoom or the bounding box",
                    range.columns(),
                    range.rows()
                )));
            }
        };
        debug!(?range, "tile mosaic");
        Ok(Self { fetcher, range, size })
    }

    pub fn range(&self) -> TileRange {
        self.range
    }
}

impl GeoImage for MapServiceImage {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn block_size(&self) -> (u32, u32) {
        (TILE_SIZE, TILE_SIZE)
    }

    fn pixel_to_proj(&self) -> AffineTransform {
        self.range.pixel_to_proj()
    }

    fn spatial_reference(&self) -> SpatialReference {
        SpatialReference::WebMercator
    }

    fn read_block(&self, col: u32, row: u32) -> BoxFuture<'_, Result<RgbImage>> {
        Box::pin(async move {
            if col >= self.range.columns() || row >= self.range.rows() {
                return Err(Error::invalid(format!("tile ({col}, {row}) is outside the mosaic")));
            }
            let (x, y) = (self.range.min_x + col, self.range.min_y + row);
            let bytes = self.fetcher.fetch(self.range.zoom, x, y).await?;
            let tile = image::load_from_memory(&bytes)
                .map_err(|e| Error::TileService(format!("tile {}/{x}/{y}: {e}", self.range.zoom)))?
                .to_rgb8();
            if tile.dimensions() == (TILE_SIZE, TILE_SIZE) {
                Ok(tile)
            } else {
                Ok(imageops::resize(&tile, TILE_SIZE, TILE_SIZE, imageops::FilterType::Triangle))
            }
        })
    }
}
