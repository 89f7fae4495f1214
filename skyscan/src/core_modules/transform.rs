// THEORY:
// The `transform` module moves coordinates between the three spaces the engine
// works in: image pixels, the image's projected space, and WGS84 longitude /
// latitude, which is what the output is written in.
//
// A conversion is a `TransformChain`: an ordered list of steps, each either an
// affine map (a GDAL-style geotransform, a translation, ...) or a spherical web
// mercator projection step. Chains can be inverted, extended at either end, and
// compacted so that a long chain built up during setup costs only a couple of
// multiplications per vertex in the hot output path.

use crate::core_modules::geometry::{GeoBox, PixelRect, Point2};
use crate::error::{Error, Result};
use std::f64::consts::PI;

/// Radius of the sphere used by EPSG:3857.
pub const EARTH_RADIUS: f64 = 6_378_137.0;
/// Latitude limit of the web mercator square.
pub const MAX_MERCATOR_LATITUDE: f64 = 85.051_128_78;

const SINGULAR_EPSILON: f64 = 1e-12;

/// An affine map with GDAL geotransform coefficients:
/// `X = c[0] + c[1]*x + c[2]*y`, `Y = c[3] + c[4]*x + c[5]*y`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    pub c: [f64; 6],
}

impl AffineTransform {
    pub const fn new(c: [f64; 6]) -> Self {
        Self { c }
    }

    pub const fn identity() -> Self {
        Self::new([0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }

    pub const fn translation(dx: f64, dy: f64) -> Self {
        Self::new([dx, 1.0, 0.0, dy, 0.0, 1.0])
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    pub fn apply(&self, p: Point2) -> Point2 {
        let c = &self.c;
        Point2::new(c[0] + c[1] * p.x + c[2] * p.y, c[3] + c[4] * p.x + c[5] * p.y)
    }

    pub fn inverse(&self) -> Result<AffineTransform> {
        let c = &self.c;
        let det = c[1] * c[5] - c[2] * c[4];
        if det.abs() < SINGULAR_EPSILON {
            return Err(Error::Transform(format!(
                "affine transformation {c:?} is not invertible"
            )));
        }
        let i1 = c[5] / det;
        let i2 = -c[2] / det;
        let i4 = -c[4] / det;
        let i5 = c[1] / det;
        let i0 = -(c[0] * i1 + c[3] * i2);
        let i3 = -(c[0] * i4 + c[3] * i5);
        Ok(AffineTransform::new([i0, i1, i2, i3, i4, i5]))
    }

    /// The map that applies `self` first and `next` second.
    pub fn then(&self, next: &AffineTransform) -> AffineTransform {
        let a = &self.c;
        let b = &next.c;
        AffineTransform::new([
            b[0] + b[1] * a[0] + b[2] * a[3],
            b[1] * a[1] + b[2] * a[4],
            b[1] * a[2] + b[2] * a[5],
            b[3] + b[4] * a[0] + b[5] * a[3],
            b[4] * a[1] + b[5] * a[4],
            b[4] * a[2] + b[5] * a[5],
        ])
    }
}

pub fn lon_lat_to_mercator(p: Point2) -> Point2 {
    let lat = p.y.clamp(-MAX_MERCATOR_LATITUDE, MAX_MERCATOR_LATITUDE);
    let x = EARTH_RADIUS * p.x.to_radians();
    let y = EARTH_RADIUS * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln();
    Point2::new(x, y)
}

pub fn mercator_to_lon_lat(p: Point2) -> Point2 {
    let lon = (p.x / EARTH_RADIUS).to_degrees();
    let lat = (2.0 * (p.y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees();
    Point2::new(lon, lat)
}

/// A single step of a chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    Affine(AffineTransform),
    LonLatToMercator,
    MercatorToLonLat,
}

impl Transform {
    pub fn apply(&self, p: Point2) -> Point2 {
        match self {
            Transform::Affine(a) => a.apply(p),
            Transform::LonLatToMercator => lon_lat_to_mercator(p),
            Transform::MercatorToLonLat => mercator_to_lon_lat(p),
        }
    }

    pub fn inverse(&self) -> Result<Transform> {
        Ok(match self {
            Transform::Affine(a) => Transform::Affine(a.inverse()?),
            Transform::LonLatToMercator => Transform::MercatorToLonLat,
            Transform::MercatorToLonLat => Transform::LonLatToMercator,
        })
    }
}

/// An ordered sequence of transformation steps; the first step is applied first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransformChain {
    pub steps: Vec<Transform>,
}

impl TransformChain {
    pub fn new(steps: Vec<Transform>) -> Self {
        Self { steps }
    }

    pub fn identity() -> Self {
        Self::default()
    }

    pub fn from_affine(affine: AffineTransform) -> Self {
        Self::new(vec![Transform::Affine(affine)])
    }

    pub fn push_front(&mut self, step: Transform) {
        self.steps.insert(0, step);
    }

    pub fn push_back(&mut self, step: Transform) {
        self.steps.push(step);
    }

    /// Appends every step of `other` after the steps of `self`.
    pub fn append(&mut self, other: &TransformChain) {
        self.steps.extend(other.steps.iter().copied());
    }

    pub fn apply(&self, p: Point2) -> Point2 {
        self.steps.iter().fold(p, |acc, step| step.apply(acc))
    }

    pub fn inverse(&self) -> Result<TransformChain> {
        let steps = self
            .steps
            .iter()
            .rev()
            .map(Transform::inverse)
            .collect::<Result<Vec<_>>>()?;
        Ok(TransformChain { steps })
    }

    /// Folds adjacent affine steps together, cancels projection round trips and
    /// drops identities.
    pub fn compact(&mut self) {
        let mut out: Vec<Transform> = Vec::with_capacity(self.steps.len());
        for step in self.steps.drain(..) {
            match (out.last().copied(), step) {
                (Some(Transform::Affine(prev)), Transform::Affine(next)) => {
                    out.pop();
                    out.push(Transform::Affine(prev.then(&next)));
                }
                (Some(Transform::LonLatToMercator), Transform::MercatorToLonLat)
                | (Some(Transform::MercatorToLonLat), Transform::LonLatToMercator) => {
                    out.pop();
                }
                _ => out.push(step),
            }
            if let Some(Transform::Affine(a)) = out.last() {
                if a.is_identity() {
                    out.pop();
                }
            }
        }
        self.steps = out;
    }

    /// Bounding box `(min, max)` of the transformed corners.
    pub fn transform_corners(&self, corners: &[Point2]) -> (Point2, Point2) {
        let mut lo = Point2::new(f64::INFINITY, f64::INFINITY);
        let mut hi = Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for corner in corners {
            let p = self.apply(*corner);
            lo = Point2::new(lo.x.min(p.x), lo.y.min(p.y));
            hi = Point2::new(hi.x.max(p.x), hi.y.max(p.y));
        }
        (lo, hi)
    }

    /// Transforms a geographic box and returns its bounding box in the target space.
    pub fn transform_geo_box(&self, bbox: &GeoBox) -> GeoBox {
        let (lo, hi) = self.transform_corners(&bbox.corners());
        GeoBox::new(lo.x, lo.y, hi.x, hi.y)
    }

    /// Transforms a box into pixel space: minimums are floored, maximums ceiled.
    pub fn transform_to_pixel_rect(&self, bbox: &GeoBox) -> PixelRect {
        let (lo, hi) = self.transform_corners(&bbox.corners());
        let x0 = lo.x.floor() as i32;
        let y0 = lo.y.floor() as i32;
        let x1 = hi.x.ceil() as i32;
        let y1 = hi.y.ceil() as i32;
        PixelRect::new(x0, y0, x1 - x0, y1 - y0)
    }

    /// Transforms a pixel rectangle and returns the bounding box of the result.
    pub fn transform_pixel_rect(&self, rect: &PixelRect) -> GeoBox {
        let (lo, hi) = self.transform_corners(&rect.corners());
        GeoBox::new(lo.x, lo.y, hi.x, hi.y)
    }
}

/// The coordinate reference systems the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SpatialReference {
    /// EPSG:4326, longitude / latitude in degrees.
    #[default]
    Wgs84,
    /// EPSG:3857, spherical web mercator in metres.
    WebMercator,
    /// No geographic meaning, coordinates are pixels.
    Local,
}

impl SpatialReference {
    pub const fn is_local(&self) -> bool {
        matches!(self, SpatialReference::Local)
    }

    pub const fn epsg(&self) -> Option<u32> {
        match self {
            SpatialReference::Wgs84 => Some(4326),
            SpatialReference::WebMercator => Some(3857),
            SpatialReference::Local => None,
        }
    }

    /// Chain converting WGS84 longitude / latitude into this reference.
    pub fn from_lat_lon(&self) -> Result<TransformChain> {
        match self {
            SpatialReference::Wgs84 => Ok(TransformChain::identity()),
            SpatialReference::WebMercator => {
                Ok(TransformChain::new(vec![Transform::LonLatToMercator]))
            }
            SpatialReference::Local => Err(Error::Transform(
                "a local coordinate system has no conversion from WGS84".to_string(),
            )),
        }
    }

    /// Chain converting this reference into WGS84 longitude / latitude.
    pub fn to_lat_lon(&self) -> Result<TransformChain> {
        self.from_lat_lon()?.inverse()
    }
}
