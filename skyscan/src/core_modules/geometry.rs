// THEORY:
// The `geometry` module holds the plain shapes every other layer speaks in.
// Pixel space uses integer rectangles (`PixelRect`): image blocks, processing
// boxes and detection windows are all pixel rectangles. Geographic and projected
// space uses floating-point points and polygons (`Point2`, `Polygon`), which is
// what ends up in the vector output after a `TransformChain` has been applied.
//
// Like the `Pixel` and `Chunk` containers of a vision pipeline, these are "dumb"
// data types: they know how to measure and compare themselves, never how they
// were produced.

/// A 2D point in any coordinate space (pixels, degrees or metres).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle in pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl PixelRect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// A rectangle anchored at the origin.
    pub const fn from_size(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub const fn right(&self) -> i32 {
        self.x + self.width
    }

    pub const fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub const fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub const fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    /// The overlapping part of two rectangles; empty rectangles collapse to the default.
    pub fn intersect(&self, other: &PixelRect) -> PixelRect {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return PixelRect::default();
        }
        PixelRect::new(x0, y0, x1 - x0, y1 - y0)
    }

    pub fn intersects(&self, other: &PixelRect) -> bool {
        !self.intersect(other).is_empty()
    }

    pub const fn contains_rect(&self, other: &PixelRect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub const fn translate(&self, dx: i32, dy: i32) -> PixelRect {
        PixelRect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Corners in ring order, starting at the top-left and going clockwise in image space.
    pub fn corners(&self) -> [Point2; 4] {
        let (x0, y0) = (self.x as f64, self.y as f64);
        let (x1, y1) = (self.right() as f64, self.bottom() as f64);
        [
            Point2::new(x0, y0),
            Point2::new(x1, y0),
            Point2::new(x1, y1),
            Point2::new(x0, y1),
        ]
    }
}

/// Intersection area divided by union area, 0.0 for disjoint or empty rectangles.
pub fn intersection_over_union(a: &PixelRect, b: &PixelRect) -> f64 {
    let inter = a.intersect(b).area();
    if inter == 0 {
        return 0.0;
    }
    let union = a.area() + b.area() - inter;
    inter as f64 / union as f64
}

/// A geographic bounding box in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl GeoBox {
    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self { west, south, east, north }
    }

    pub fn corners(&self) -> [Point2; 4] {
        [
            Point2::new(self.west, self.north),
            Point2::new(self.east, self.north),
            Point2::new(self.east, self.south),
            Point2::new(self.west, self.south),
        ]
    }

    pub fn is_valid(&self) -> bool {
        self.west < self.east && self.south < self.north
    }
}

/// A simple polygon described by its exterior ring. The ring is implicitly closed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Polygon {
    pub exterior: Vec<Point2>,
}

impl Polygon {
    pub fn new(exterior: Vec<Point2>) -> Self {
        let mut exterior = exterior;
        // Drop an explicit closing vertex, the ring is closed by convention.
        if exterior.len() > 1 && exterior.first() == exterior.last() {
            exterior.pop();
        }
        Self { exterior }
    }

    pub fn from_rect(rect: &PixelRect) -> Self {
        Self::new(rect.corners().to_vec())
    }

    /// Signed area from the shoelace formula, returned as an absolute value.
    pub fn area(&self) -> f64 {
        self.signed_area().abs()
    }

    fn signed_area(&self) -> f64 {
        let n = self.exterior.len();
        if n < 3 {
            return 0.0;
        }
        let mut sum = 0.0;
        for i in 0..n {
            let p = self.exterior[i];
            let q = self.exterior[(i + 1) % n];
            sum += p.x * q.y - q.x * p.y;
        }
        sum / 2.0
    }

    /// Area-weighted centroid. Degenerate rings fall back to the vertex mean.
    pub fn centroid(&self) -> Point2 {
        let n = self.exterior.len();
        if n == 0 {
            return Point2::default();
        }
        let a = self.signed_area();
        if a.abs() < f64::EPSILON {
            let (sx, sy) = self
                .exterior
                .iter()
                .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
            return Point2::new(sx / n as f64, sy / n as f64);
        }
        let mut cx = 0.0;
        let mut cy = 0.0;
        for i in 0..n {
            let p = self.exterior[i];
            let q = self.exterior[(i + 1) % n];
            let cross = p.x * q.y - q.x * p.y;
            cx += (p.x + q.x) * cross;
            cy += (p.y + q.y) * cross;
        }
        Point2::new(cx / (6.0 * a), cy / (6.0 * a))
    }

    /// (min, max) corners of the ring.
    pub fn bounds(&self) -> Option<(Point2, Point2)> {
        let first = *self.exterior.first()?;
        Some(self.exterior.iter().fold((first, first), |(lo, hi), p| {
            (
                Point2::new(lo.x.min(p.x), lo.y.min(p.y)),
                Point2::new(hi.x.max(p.x), hi.y.max(p.y)),
            )
        }))
    }

    /// Even-odd point in polygon test.
    pub fn contains_point(&self, point: Point2) -> bool {
        let n = self.exterior.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let pi = self.exterior[i];
            let pj = self.exterior[j];
            if (pi.y > point.y) != (pj.y > point.y)
                && point.x < (pj.x - pi.x) * (point.y - pi.y) / (pj.y - pi.y) + pi.x
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Applies `f` to every vertex, e.g. a coordinate transformation.
    pub fn map_points<E>(&self, mut f: impl FnMut(Point2) -> Result<Point2, E>) -> Result<Polygon, E> {
        let exterior = self
            .exterior
            .iter()
            .map(|p| f(*p))
            .collect::<Result<Vec<_>, E>>()?;
        Ok(Polygon { exterior })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_intersection_and_containment() {
        let a = PixelRect::new(0, 0, 10, 10);
        let b = PixelRect::new(5, 5, 10, 10);
        assert_eq!(a.intersect(&b), PixelRect::new(5, 5, 5, 5));
        assert!(a.intersects(&b));
        assert!(!a.contains_rect(&b));
        assert!(a.contains_rect(&PixelRect::new(2, 2, 3, 3)));

        let far = PixelRect::new(20, 20, 5, 5);
        assert!(a.intersect(&far).is_empty());
        assert_eq!(a.intersect(&far).area(), 0);
    }

    #[test]
    fn iou_of_half_overlapping_boxes() {
        let a = PixelRect::new(0, 0, 10, 10);
        let b = PixelRect::new(5, 0, 10, 10);
        let iou = intersection_over_union(&a, &b);
        assert!((iou - 50.0 / 150.0).abs() < 1e-9);
        assert_eq!(intersection_over_union(&a, &PixelRect::new(50, 50, 1, 1)), 0.0);
    }

    #[test]
    fn polygon_area_and_centroid_of_rect() {
        let poly = Polygon::from_rect(&PixelRect::new(2, 4, 10, 20));
        assert!((poly.area() - 200.0).abs() < 1e-9);
        let c = poly.centroid();
        assert!((c.x - 7.0).abs() < 1e-9);
        assert!((c.y - 14.0).abs() < 1e-9);
    }

    #[test]
    fn explicit_closing_vertex_is_dropped() {
        let ring = vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(0.0, 0.0),
        ];
        assert_eq!(Polygon::new(ring).exterior.len(), 3);
    }

    #[test]
    fn point_in_triangle() {
        let tri = Polygon::new(vec![
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 0.0),
            Point2::new(0.0, 10.0),
        ]);
        assert!(tri.contains_point(Point2::new(2.0, 2.0)));
        assert!(!tri.contains_point(Point2::new(8.0, 8.0)));
        let (lo, hi) = tri.bounds().unwrap();
        assert_eq!(lo, Point2::new(0.0, 0.0));
        assert_eq!(hi, Point2::new(10.0, 10.0));
    }
}
