// THEORY:
// The `raster` module is the image input layer. Every source of pixels, whether
// a file on disk or a mosaic of web map tiles, is a `GeoImage`: a grid of
// blocks plus a geotransform that places pixel (0, 0) in a projected coordinate
// system.
//
// Key architectural principles:
// 1.  **Block Access**: Sources are read block by block. For a local raster a
//     block is a crop of the decoded image, for a tile service it is one tile
//     download. Reading is asynchronous so that network-backed blocks can be
//     fetched concurrently.
// 2.  **Region Assembly**: `read_region` turns a pixel rectangle into a single
//     RGB canvas, skipping blocks the region filter rejects and reporting
//     progress (with cancellation) as blocks arrive.
// 3.  **Georeferencing**: A local raster is georeferenced through a world file
//     sidecar. Without one the image is treated as living in its own pixel
//     space (`SpatialReference::Local`).

use crate::core_modules::geometry::PixelRect;
use crate::core_modules::region_filter::RegionFilter;
use crate::core_modules::transform::{AffineTransform, SpatialReference};
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use image::{RgbImage, imageops};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Block edge used for local rasters.
pub const LOCAL_BLOCK_SIZE: u32 = 512;

pub trait GeoImage: Send + Sync {
    /// (width, height) in pixels.
    fn size(&self) -> (u32, u32);
    /// (width, height) of a full block in pixels.
    fn block_size(&self) -> (u32, u32);
    /// Geotransform from pixel coordinates to the image's projected space.
    fn pixel_to_proj(&self) -> AffineTransform;
    fn spatial_reference(&self) -> SpatialReference;
    /// Reads one block. Edge blocks are clipped to the image.
    fn read_block(&self, col: u32, row: u32) -> BoxFuture<'_, Result<RgbImage>>;

    /// (columns, rows) of the block grid.
    fn num_blocks(&self) -> (u32, u32) {
        let (w, h) = self.size();
        let (bw, bh) = self.block_size();
        (w.div_ceil(bw.max(1)), h.div_ceil(bh.max(1)))
    }

    fn bounds(&self) -> PixelRect {
        let (w, h) = self.size();
        PixelRect::from_size(w as i32, h as i32)
    }

    /// Pixel rectangle covered by a block, clipped to the image.
    fn block_rect(&self, col: u32, row: u32) -> PixelRect {
        let (bw, bh) = self.block_size();
        PixelRect::new((col * bw) as i32, (row * bh) as i32, bw as i32, bh as i32)
            .intersect(&self.bounds())
    }
}

/// A block that takes part in reading `area`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub col: u32,
    pub row: u32,
    /// Pixel rectangle of the block in image coordinates.
    pub rect: PixelRect,
}

/// Blocks that overlap `area` and whose overlap (relative to `area`) passes the filter.
pub fn blocks_intersecting(
    image: &dyn GeoImage,
    area: &PixelRect,
    filter: &dyn RegionFilter,
) -> Vec<BlockRef> {
    let (cols, rows) = image.num_blocks();
    let mut blocks = Vec::new();
    for row in 0..rows {
        for col in 0..cols {
            let rect = image.block_rect(col, row);
            let overlap = rect.intersect(area);
            if overlap.is_empty() {
                continue;
            }
            if !filter.contains(&overlap.translate(-area.x, -area.y)) {
                continue;
            }
            blocks.push(BlockRef { col, row, rect });
        }
    }
    blocks
}

/// Reads `area` into a single canvas. Blocks rejected by `filter` stay black.
///
/// `progress` receives the fraction of blocks read and returns `false` to cancel.
pub async fn read_region(
    image: &dyn GeoImage,
    area: PixelRect,
    filter: &dyn RegionFilter,
    max_concurrency: usize,
    mut progress: impl FnMut(f32) -> bool,
) -> Result<RgbImage> {
    if area.is_empty() {
        return Err(Error::invalid("cannot read an empty image region"));
    }
    let mut canvas = RgbImage::new(area.width as u32, area.height as u32);
    let blocks = blocks_intersecting(image, &area, filter);
    let total = blocks.len();
    debug!(blocks = total, ?area, "reading image region");
    if total == 0 {
        return Ok(canvas);
    }

    let mut reads = stream::iter(blocks)
        .map(|block| async move {
            let pixels = image.read_block(block.col, block.row).await?;
            Ok::<_, Error>((block, pixels))
        })
        .buffer_unordered(max_concurrency.max(1));

    let mut done = 0usize;
    while let Some((block, pixels)) = reads.try_next().await? {
        paste_block(&mut canvas, &area, &block.rect, &pixels);
        done += 1;
        if !progress(done as f32 / total as f32) {
            return Err(Error::Cancelled);
        }
    }
    Ok(canvas)
}

/// Copies the part of `block` (located at `block_rect`) that overlaps `area` into `canvas`.
pub(crate) fn paste_block(canvas: &mut RgbImage, area: &PixelRect, block_rect: &PixelRect, block: &RgbImage) {
    let overlap = block_rect.intersect(area);
    if overlap.is_empty() {
        return;
    }
    let src = imageops::crop_imm(
        block,
        (overlap.x - block_rect.x) as u32,
        (overlap.y - block_rect.y) as u32,
        overlap.width as u32,
        overlap.height as u32,
    )
    .to_image();
    imageops::replace(
        canvas,
        &src,
        (overlap.x - area.x) as i64,
        (overlap.y - area.y) as i64,
    );
}

/// A raster file decoded into memory and georeferenced by an optional world file.
pub struct LocalImage {
    path: PathBuf,
    pixels: RgbImage,
    pixel_to_proj: AffineTransform,
    spatial_reference: SpatialReference,
}

impl LocalImage {
    /// Opens `path`. When a world file is found its coordinates are interpreted in `srs`.
    pub fn open(path: impl AsRef<Path>, srs: SpatialReference) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let pixels = image::open(&path)?.to_rgb8();
        let (pixel_to_proj, spatial_reference) = match find_world_file(&path) {
            Some(world) => {
                let text = std::fs::read_to_string(&world)?;
                debug!(world_file = %world.display(), "georeferencing from world file");
                (parse_world_file(&text)?, srs)
            }
            None => (AffineTransform::identity(), SpatialReference::Local),
        };
        Ok(Self::from_pixels(path, pixels, pixel_to_proj, spatial_reference))
    }

    pub fn from_pixels(
        path: PathBuf,
        pixels: RgbImage,
        pixel_to_proj: AffineTransform,
        spatial_reference: SpatialReference,
    ) -> Self {
        Self {
            path,
            pixels,
            pixel_to_proj,
            spatial_reference,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl GeoImage for LocalImage {
    fn size(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    fn block_size(&self) -> (u32, u32) {
        (LOCAL_BLOCK_SIZE, LOCAL_BLOCK_SIZE)
    }

    fn pixel_to_proj(&self) -> AffineTransform {
        self.pixel_to_proj
    }

    fn spatial_reference(&self) -> SpatialReference {
        self.spatial_reference
    }

    fn read_block(&self, col: u32, row: u32) -> BoxFuture<'_, Result<RgbImage>> {
        let rect = self.block_rect(col, row);
        Box::pin(async move {
            if rect.is_empty() {
                return Err(Error::invalid(format!("block ({col}, {row}) is outside the image")));
            }
            Ok(imageops::crop_imm(
                &self.pixels,
                rect.x as u32,
                rect.y as u32,
                rect.width as u32,
                rect.height as u32,
            )
            .to_image())
        })
    }
}

/// Sidecar candidates in lookup order: `<e1><en>w`, `<ext>w`, `wld`.
fn find_world_file(image: &Path) -> Option<PathBuf> {
    let ext = image.extension()?.to_str()?.to_ascii_lowercase();
    let mut candidates = Vec::new();
    if let (Some(first), Some(last)) = (ext.chars().next(), ext.chars().last()) {
        candidates.push(format!("{first}{last}w"));
    }
    candidates.push(format!("{ext}w"));
    candidates.push("wld".to_string());
    candidates
        .into_iter()
        .map(|candidate| image.with_extension(candidate))
        .find(|candidate| candidate.is_file())
}

/// Parses the six lines `A D B E C F` of a world file into a geotransform.
/// `C` and `F` locate the centre of the upper-left pixel.
pub fn parse_world_file(text: &str) -> Result<AffineTransform> {
    let values = text
        .split_whitespace()
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|_| Error::invalid(format!("invalid world file value: {token}")))
        })
        .collect::<Result<Vec<_>>>()?;
    let &[a, d, b, e, c, f] = values.as_slice() else {
        return Err(Error::invalid(format!(
            "a world file needs 6 values, found {}",
            values.len()
        )));
    };
    Ok(AffineTransform::new([
        c - a / 2.0 - b / 2.0,
        a,
        b,
        f - d / 2.0 - e / 2.0,
        d,
        e,
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::region_filter::{MaskedRegionFilter, PassthroughRegionFilter};
    use crate::core_modules::geometry::{Point2, Polygon};
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 7]))
    }

    fn local(width: u32, height: u32) -> LocalImage {
        LocalImage::from_pixels(
            PathBuf::from("memory.png"),
            gradient(width, height),
            AffineTransform::identity(),
            SpatialReference::Local,
        )
    }

    #[test]
    fn world_file_shifts_to_pixel_corner() {
        let gt = parse_world_file("0.5\n0\n0\n-0.5\n100.25\n49.75\n").unwrap();
        assert_eq!(gt.c, [100.0, 0.5, 0.0, 50.0, 0.0, -0.5]);
        assert!(parse_world_file("1 2 3").is_err());
        assert!(parse_world_file("1 0 0 -1 a b").is_err());
    }

    #[test]
    fn edge_blocks_are_clipped() {
        let image = local(700, 600);
        assert_eq!(image.num_blocks(), (2, 2));
        assert_eq!(image.block_rect(1, 1), PixelRect::new(512, 512, 188, 88));
    }

    #[tokio::test]
    async fn read_region_spans_blocks() {
        let image = local(700, 600);
        let area = PixelRect::new(500, 500, 30, 20);
        let region = read_region(&image, area, &PassthroughRegionFilter, 4, |_| true)
            .await
            .unwrap();
        assert_eq!(region.dimensions(), (30, 20));
        assert_eq!(region.get_pixel(0, 0), &Rgb([244, 244, 7]));
        assert_eq!(region.get_pixel(29, 19), &Rgb([(529 % 256) as u8, (519 % 256) as u8, 7]));
    }

    #[tokio::test]
    async fn filtered_blocks_are_not_read() {
        let image = local(1024, 512);
        let area = image.bounds();
        let mut filter = MaskedRegionFilter::new(area, (64, 64));
        filter.add(&[Polygon::new(vec![
            Point2::new(0.0, 0.0),
            Point2::new(100.0, 0.0),
            Point2::new(100.0, 100.0),
            Point2::new(0.0, 100.0),
        ])]);
        assert_eq!(blocks_intersecting(&image, &area, &filter).len(), 1);
        let region = read_region(&image, area, &filter, 2, |_| true).await.unwrap();
        assert_eq!(region.get_pixel(600, 10), &Rgb([0, 0, 0]));
        assert_eq!(region.get_pixel(10, 10), &Rgb([10, 10, 7]));
    }

    #[tokio::test]
    async fn progress_callback_can_cancel() {
        let image = local(1024, 1024);
        let result = read_region(&image, image.bounds(), &PassthroughRegionFilter, 1, |_| false).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn open_reads_world_file_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("scene.png");
        gradient(16, 8).save(&png).unwrap();
        std::fs::write(dir.path().join("scene.pgw"), "1\n0\n0\n-1\n10.5\n20.5\n").unwrap();

        let image = LocalImage::open(&png, SpatialReference::Wgs84).unwrap();
        assert_eq!(image.size(), (16, 8));
        assert_eq!(image.spatial_reference(), SpatialReference::Wgs84);
        assert_eq!(image.pixel_to_proj().c, [10.0, 1.0, 0.0, 21.0, 0.0, -1.0]);

        let bare = dir.path().join("bare.png");
        gradient(4, 4).save(&bare).unwrap();
        let image = LocalImage::open(&bare, SpatialReference::Wgs84).unwrap();
        assert!(image.spatial_reference().is_local());
    }
}
