// THEORY:
// Detection slides a window over the processing box and classifies what is under
// it. A `WindowSpec` pairs a window size with the step between windows; several
// specs can be scanned in one pass (multi-scale detection). Window heights follow
// the model's aspect ratio, so users only ever give widths.
//
// The `Chipper` turns windows into model-ready chips:
// 1.  windows rejected by the region filter are skipped (and counted, so progress
//     still reaches 100%),
// 2.  the window is cropped and, when a resampled size is requested, resized,
// 3.  the result is padded into a black canvas of the model size, or shrunk to
//     it when the window is larger (pyramid levels).

use crate::core_modules::geometry::PixelRect;
use crate::core_modules::region_filter::RegionFilter;
use crate::error::{Error, Result};
use image::{RgbImage, imageops};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    /// (width, height)
    pub size: (u32, u32),
    /// (x, y)
    pub step: (u32, u32),
}

impl WindowSpec {
    pub const fn new(size: (u32, u32), step: (u32, u32)) -> Self {
        Self { size, step }
    }
}

/// Height / width of the model input.
pub fn aspect_ratio(model_size: (u32, u32)) -> f32 {
    model_size.1 as f32 / model_size.0.max(1) as f32
}

/// `(value, round(aspect * value))`
pub fn scaled(value: u32, aspect: f32) -> (u32, u32) {
    (value, (aspect * value as f32).round() as u32)
}

/// The requested window sizes and steps, widths only.
#[derive(Debug, Clone, Copy)]
pub struct WindowRequest<'a> {
    pub model_size: (u32, u32),
    pub default_step: (u32, u32),
    pub sizes: &'a [u32],
    pub steps: &'a [u32],
}

impl WindowRequest<'_> {
    fn aspect(&self) -> f32 {
        aspect_ratio(self.model_size)
    }

    /// The first requested size, or the model size.
    pub fn primary_size(&self) -> (u32, u32) {
        self.sizes
            .first()
            .map_or(self.model_size, |&s| scaled(s, self.aspect()))
    }

    /// The first requested step, or the model's default step.
    pub fn primary_step(&self) -> (u32, u32) {
        self.steps
            .first()
            .map_or(self.default_step, |&s| scaled(s, self.aspect()))
    }

    pub fn primary(&self) -> WindowSpec {
        WindowSpec::new(self.primary_size(), self.primary_step())
    }
}

/// Expands a window request into the specs to scan.
///
/// Landcover tiles the box: one spec whose step equals its size.
pub fn calc_windows(request: &WindowRequest<'_>, landcover: bool) -> Result<Vec<WindowSpec>> {
    let (sizes, steps) = (request.sizes, request.steps);
    if !landcover && sizes.len() > 1 && steps.len() > 1 && sizes.len() != steps.len() {
        return Err(Error::invalid("Number of window sizes and window steps must match."));
    }

    let aspect = request.aspect();
    let specs = if landcover {
        let size = request.primary_size();
        vec![WindowSpec::new(size, size)]
    } else if !steps.is_empty() && sizes.len() == steps.len() {
        sizes
            .iter()
            .zip(steps)
            .map(|(&size, &step)| WindowSpec::new(scaled(size, aspect), scaled(step, aspect)))
            .collect()
    } else if sizes.len() > 1 {
        let step = request.primary_step();
        sizes
            .iter()
            .map(|&size| WindowSpec::new(scaled(size, aspect), step))
            .collect()
    } else if steps.len() > 1 {
        let size = request.primary_size();
        steps
            .iter()
            .map(|&step| WindowSpec::new(size, scaled(step, aspect)))
            .collect()
    } else {
        vec![request.primary()]
    };
    if let Some(spec) = specs
        .iter()
        .find(|spec| spec.size.0 == 0 || spec.size.1 == 0 || spec.step.0 == 0 || spec.step.1 == 0)
    {
        return Err(Error::invalid(format!(
            "Window size {}x{} with step {}x{} is empty.",
            spec.size.0, spec.size.1, spec.step.0, spec.step.1
        )));
    }
    Ok(specs)
}

/// The primary spec and its successive doublings while the window fits in `region`.
pub fn pyramid_windows(primary: WindowSpec, region: (u32, u32)) -> Vec<WindowSpec> {
    let mut specs = vec![primary];
    let mut current = primary;
    while current.size.0 > 0 && current.size.1 > 0 {
        let doubled = |(a, b): (u32, u32)| Some((a.checked_mul(2)?, b.checked_mul(2)?));
        let (Some(size), Some(step)) = (doubled(current.size), doubled(current.step)) else {
            break;
        };
        if size.0 > region.0 || size.1 > region.1 {
            break;
        }
        current = WindowSpec::new(size, step);
        specs.push(current);
    }
    specs
}

/// Windows of every spec over a region, row-major per spec.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    region: (u32, u32),
    specs: Vec<WindowSpec>,
}

impl SlidingWindow {
    pub fn new(region: (u32, u32), specs: Vec<WindowSpec>) -> Self {
        Self { region, specs }
    }

    pub fn specs(&self) -> &[WindowSpec] {
        &self.specs
    }

    fn positions(extent: u32, size: u32, step: u32) -> u32 {
        if size == 0 || size > extent {
            0
        } else {
            (extent - size) / step.max(1) + 1
        }
    }

    pub fn total_windows(&self) -> usize {
        self.specs
            .iter()
            .map(|spec| {
                Self::positions(self.region.0, spec.size.0, spec.step.0) as usize
                    * Self::positions(self.region.1, spec.size.1, spec.step.1) as usize
            })
            .sum()
    }

    pub fn windows(&self) -> impl Iterator<Item = PixelRect> + '_ {
        self.specs.iter().flat_map(move |spec| {
            let cols = Self::positions(self.region.0, spec.size.0, spec.step.0);
            let rows = Self::positions(self.region.1, spec.size.1, spec.step.1);
            let (sx, sy) = (spec.step.0.max(1), spec.step.1.max(1));
            (0..rows).flat_map(move |row| {
                (0..cols).map(move |col| {
                    PixelRect::new(
                        (col * sx) as i32,
                        (row * sy) as i32,
                        spec.size.0 as i32,
                        spec.size.1 as i32,
                    )
                })
            })
        })
    }
}

/// A window and its model-ready pixels.
#[derive(Debug, Clone)]
pub struct Chip {
    pub window: PixelRect,
    pub image: RgbImage,
}

pub struct Chipper<'a> {
    image: &'a RgbImage,
    sliding_window: SlidingWindow,
    resampled_size: Option<(u32, u32)>,
    model_size: (u32, u32),
    filter: Box<dyn RegionFilter>,
}

impl<'a> Chipper<'a> {
    pub fn new(
        image: &'a RgbImage,
        specs: Vec<WindowSpec>,
        resampled_size: Option<(u32, u32)>,
        model_size: (u32, u32),
        filter: Box<dyn RegionFilter>,
    ) -> Self {
        Self {
            image,
            sliding_window: SlidingWindow::new(image.dimensions(), specs),
            resampled_size,
            model_size,
            filter,
        }
    }

    pub fn sliding_window(&self) -> &SlidingWindow {
        &self.sliding_window
    }

    pub fn iter(&self) -> ChipIter<'_, 'a> {
        ChipIter {
            chipper: self,
            windows: Box::new(self.sliding_window.windows()),
            skipped: 0,
        }
    }

    fn make_chip(&self, window: PixelRect) -> Chip {
        let mut pixels = imageops::crop_imm(
            self.image,
            window.x as u32,
            window.y as u32,
            window.width as u32,
            window.height as u32,
        )
        .to_image();
        if let Some((rw, rh)) = self.resampled_size {
            if pixels.dimensions() != (rw, rh) {
                pixels = imageops::resize(&pixels, rw, rh, imageops::FilterType::Triangle);
            }
        }
        Chip {
            window,
            image: fit_to_model(pixels, self.model_size),
        }
    }
}

/// Pads `pixels` into a black model-sized canvas, or resizes when it does not fit.
pub fn fit_to_model(pixels: RgbImage, model_size: (u32, u32)) -> RgbImage {
    let (w, h) = pixels.dimensions();
    if (w, h) == model_size {
        return pixels;
    }
    if w > model_size.0 || h > model_size.1 {
        return imageops::resize(&pixels, model_size.0, model_size.1, imageops::FilterType::Triangle);
    }
    let mut canvas = RgbImage::new(model_size.0, model_size.1);
    imageops::replace(&mut canvas, &pixels, 0, 0);
    canvas
}

pub struct ChipIter<'c, 'a> {
    chipper: &'c Chipper<'a>,
    windows: Box<dyn Iterator<Item = PixelRect> + Send + 'c>,
    skipped: usize,
}

impl ChipIter<'_, '_> {
    /// Windows rejected by the region filter so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for ChipIter<'_, '_> {
    type Item = Chip;

    fn next(&mut self) -> Option<Chip> {
        for window in self.windows.by_ref() {
            if self.chipper.filter.contains(&window) {
                return Some(self.chipper.make_chip(window));
            }
            self.skipped += 1;
        }
        None
    }
}
