// THEORY:
// A region filter decides which parts of the processing box are worth looking
// at. It is asked about rectangles (image blocks before reading, detection
// windows before classifying) and answers yes or no.
//
// `MaskedRegionFilter` rasterises include / exclude polygons onto a coarse grid
// whose cell is one window step. Polygons are applied in the order given, so
// "include A, exclude B, include C" behaves like painting and erasing on the
// grid. Asking about a rectangle then only touches the handful of cells under it.

use crate::core_modules::geometry::{PixelRect, Point2, Polygon};

pub trait RegionFilter: Send + Sync {
    /// Whether `rect` (in processing-box pixels) should be processed.
    fn contains(&self, rect: &PixelRect) -> bool;
    fn clone_box(&self) -> Box<dyn RegionFilter>;
}

/// Accepts every rectangle.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRegionFilter;

impl RegionFilter for PassthroughRegionFilter {
    fn contains(&self, _rect: &PixelRect) -> bool {
        true
    }

    fn clone_box(&self) -> Box<dyn RegionFilter> {
        Box::new(*self)
    }
}

#[derive(Debug, Clone)]
pub struct MaskedRegionFilter {
    bounds: PixelRect,
    cell_width: u32,
    cell_height: u32,
    cols: u32,
    rows: u32,
    mask: Vec<bool>,
}

impl MaskedRegionFilter {
    /// An empty mask over `bounds` with cells of `cell` = (width, height) pixels.
    pub fn new(bounds: PixelRect, cell: (u32, u32)) -> Self {
        let cell_width = cell.0.max(1);
        let cell_height = cell.1.max(1);
        let cols = (bounds.width.max(0) as u32).div_ceil(cell_width);
        let rows = (bounds.height.max(0) as u32).div_ceil(cell_height);
        Self {
            bounds,
            cell_width,
            cell_height,
            cols,
            rows,
            mask: vec![false; (cols * rows) as usize],
        }
    }

    pub fn bounds(&self) -> PixelRect {
        self.bounds
    }

    /// Marks every cell whose centre lies inside any of `polygons`.
    pub fn add(&mut self, polygons: &[Polygon]) {
        self.paint(polygons, true);
    }

    /// Clears every cell whose centre lies inside any of `polygons`.
    pub fn subtract(&mut self, polygons: &[Polygon]) {
        self.paint(polygons, false);
    }

    fn cell_center(&self, col: u32, row: u32) -> Point2 {
        Point2::new(
            self.bounds.x as f64 + (col as f64 + 0.5) * self.cell_width as f64,
            self.bounds.y as f64 + (row as f64 + 0.5) * self.cell_height as f64,
        )
    }

    fn paint(&mut self, polygons: &[Polygon], value: bool) {
        for polygon in polygons {
            let Some((lo, hi)) = polygon.bounds() else {
                continue;
            };
            let (c0, r0) = self.cell_of(lo);
            let (c1, r1) = self.cell_of(hi);
            for row in r0..=r1 {
                for col in c0..=c1 {
                    if polygon.contains_point(self.cell_center(col, row)) {
                        self.mask[(row * self.cols + col) as usize] = value;
                    }
                }
            }
        }
    }

    /// Grid cell holding `p`, clamped to the grid.
    fn cell_of(&self, p: Point2) -> (u32, u32) {
        let col = ((p.x - self.bounds.x as f64) / self.cell_width as f64).floor();
        let row = ((p.y - self.bounds.y as f64) / self.cell_height as f64).floor();
        let clamp = |v: f64, n: u32| v.clamp(0.0, n.saturating_sub(1) as f64) as u32;
        (clamp(col, self.cols), clamp(row, self.rows))
    }
}

impl RegionFilter for MaskedRegionFilter {
    fn contains(&self, rect: &PixelRect) -> bool {
        let clipped = rect.intersect(&self.bounds);
        if clipped.is_empty() || self.mask.is_empty() {
            return false;
        }
        let x = (clipped.x - self.bounds.x) as u32;
        let y = (clipped.y - self.bounds.y) as u32;
        let c0 = x / self.cell_width;
        let r0 = y / self.cell_height;
        let c1 = ((x + clipped.width as u32).div_ceil(self.cell_width)).min(self.cols);
        let r1 = ((y + clipped.height as u32).div_ceil(self.cell_height)).min(self.rows);

        // A rectangle passes when any cell under it is set.
        (r0..r1)
            .flat_map(|row| (c0..c1).map(move |col| (row, col)))
            .any(|(row, col)| self.mask[(row * self.cols + col) as usize])
    }

    fn clone_box(&self) -> Box<dyn RegionFilter> {
        Box::new(self.clone())
    }
}
