// THEORY:
// The `pipeline` module is the top-level API of the detection engine. A
// `Detector` takes one `DetectionConfig` and runs it end to end:
//
// 1.  **Source**: open the image (local raster or a tile mosaic), work out the
//     pixel processing box from the optional WGS84 bounding box, and build the
//     transform from box pixels to output coordinates.
// 2.  **Model**: load the package, pick the confidence threshold and decide
//     whether landcover can run block-parallel (windows tile the blocks exactly).
// 3.  **Filter**: rasterise include / exclude regions into a mask over the box.
// 4.  **Output**: open the feature set and its layer.
// 5.  **Processing**: either read the whole box and slide windows over it
//     (serial), or stream blocks through the worker pool (`parallel_pipeline`).
//     Predictions are label-filtered, optionally thinned by NMS, and written as
//     point or polygon features.

use crate::core_modules::feature::{Feature, Field, FieldDefinition, FieldType, Fields, Geometry, GeometryType};
use crate::core_modules::feature_set::{FileFeatureSet, Layer, OutputFormat, VectorOpenMode};
use crate::core_modules::geometry::{GeoBox, PixelRect, Polygon};
use crate::core_modules::label_filter::{LabelFilterType, filter_labels};
use crate::core_modules::model::{Model, ModelMetadata, Prediction, PredictionBox, load_model};
use crate::core_modules::nms::non_max_suppression;
use crate::core_modules::progress::{ProgressCategory, ProgressDisplay};
use crate::core_modules::raster::{GeoImage, LocalImage, read_region};
use crate::core_modules::region_filter::{MaskedRegionFilter, PassthroughRegionFilter, RegionFilter};
use crate::core_modules::sliding_window::{
    Chip, Chipper, WindowRequest, aspect_ratio, calc_windows, pyramid_windows, scaled,
};
use crate::core_modules::tile_service::{Credentials, MapServiceImage, TileClient, TileFetcher};
use crate::core_modules::transform::{AffineTransform, SpatialReference, Transform, TransformChain};
use crate::error::{Error, Result};
use crate::parallel_pipeline::{BlockJob, BlockProcessor, BlockProgress};
use chrono::Utc;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const APP_NAME: &str = "skyscan";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const READING_CATEGORY: &str = "Reading";
const TOP_N: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Find objects with overlapping windows.
    Detect,
    /// Classify every tile of a non-overlapping grid.
    Landcover,
}

impl Action {
    pub const fn name(&self) -> &'static str {
        match self {
            Action::Detect => "detect",
            Action::Landcover => "landcover",
        }
    }

    fn progress_category(&self) -> ProgressCategory {
        match self {
            Action::Detect => ProgressCategory::new("Detecting", "Detecting the object(s)"),
            Action::Landcover => ProgressCategory::new("Classifying", "Classifying the image"),
        }
    }
}

/// Tile service connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WebOptions {
    pub client: TileClient,
    pub credentials: Option<Credentials>,
    pub zoom: u32,
    /// Concurrent tile downloads.
    pub max_connections: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Image {
        path: PathBuf,
        /// Reference system of the world file coordinates.
        srs: SpatialReference,
    },
    Service(WebOptions),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputOptions {
    pub path: PathBuf,
    pub format: OutputFormat,
    /// Defaults to the output file stem.
    pub layer: Option<String>,
    pub geometry_type: GeometryType,
    /// Adds `username`, `app` and `app_ver` fields.
    pub producer_info: bool,
    pub append: bool,
}

impl OutputOptions {
    pub fn layer_name(&self) -> String {
        self.layer.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| APP_NAME.to_string())
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingOptions {
    pub model: PathBuf,
    pub window_sizes: Vec<u32>,
    pub window_steps: Vec<u32>,
    pub resampled_size: Option<u32>,
    pub pyramid: bool,
    /// Minimum confidence in percent.
    pub confidence: f32,
    /// Maximum overlap in percent; `None` disables non-maximum suppression.
    pub nms: Option<f64>,
    pub include_labels: Vec<String>,
    pub exclude_labels: Vec<String>,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            model: PathBuf::new(),
            window_sizes: Vec::new(),
            window_steps: Vec::new(),
            resampled_size: None,
            pyramid: false,
            confidence: 95.0,
            nms: None,
            include_labels: Vec::new(),
            exclude_labels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionActionKind {
    Include,
    Exclude,
}

/// Region files applied in order to the region filter.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionAction {
    pub kind: RegionActionKind,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionConfig {
    pub action: Action,
    pub source: Source,
    /// WGS84 area of interest.
    pub bbox: Option<GeoBox>,
    pub output: OutputOptions,
    pub processing: ProcessingOptions,
    pub regions: Vec<RegionAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSummary {
    pub layer: String,
    pub features: usize,
    /// Pixel rectangle of the image that was processed.
    pub processed_box: PixelRect,
    pub windows_classified: usize,
    pub windows_skipped: usize,
    pub block_parallel: bool,
}

/// The opened image and where its pixels land.
struct Scene {
    image: Box<dyn GeoImage>,
    bbox: PixelRect,
    /// Image pixels to output coordinates.
    pixel_to_out: TransformChain,
    output_sr: SpatialReference,
    max_connections: usize,
}

pub struct Detector {
    config: DetectionConfig,
    progress: Option<Arc<dyn ProgressDisplay>>,
    tile_fetcher: Option<Arc<dyn TileFetcher>>,
}

impl Detector {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            progress: None,
            tile_fetcher: None,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn set_progress_display(&mut self, display: Arc<dyn ProgressDisplay>) {
        self.progress = Some(display);
    }

    /// Uses `fetcher` for tiles instead of connecting to the configured service.
    pub fn with_tile_fetcher(mut self, fetcher: Arc<dyn TileFetcher>) -> Self {
        self.tile_fetcher = Some(fetcher);
        self
    }

    pub async fn process(&self) -> Result<DetectionSummary> {
        let mut scene = match &self.config.source {
            Source::Image { path, srs } => self.open_local_image(path, *srs)?,
            Source::Service(web) => self.open_map_service(web).await?,
        };

        let processing = &self.config.processing;
        let landcover = self.config.action == Action::Landcover;
        info!("Reading model...");
        let mut model = load_model(&processing.model)?;
        print_model(model.metadata());

        let model_size = model.metadata().model_size;
        let request = WindowRequest {
            model_size,
            default_step: model.default_step(),
            sizes: &processing.window_sizes,
            steps: &processing.window_steps,
        };

        let block_parallel = landcover && processing.window_sizes.len() < 2 && {
            let (bw, bh) = scene.image.block_size();
            let (ww, wh) = request.primary_size();
            ww > 0 && wh > 0 && bw % ww == 0 && bh % wh == 0
        };
        if block_parallel {
            scene.bbox = scene.image.bounds();
        }
        scene
            .pixel_to_out
            .push_front(Transform::Affine(AffineTransform::translation(
                scene.bbox.x as f64,
                scene.bbox.y as f64,
            )));
        scene.pixel_to_out.compact();

        model.set_confidence(match self.config.action {
            Action::Detect => processing.confidence / 100.0,
            Action::Landcover => 0.0,
        });
        check_sizes(processing, model_size.0)?;

        let filter = self.build_region_filter(&scene, request.primary_step())?;
        let mut layer = self.open_layer(scene.output_sr)?;
        let fields = FeatureFields::new(self.config.output.producer_info);

        let model: Arc<dyn Model> = Arc::from(model);
        self.start_progress();
        let outcome = if block_parallel {
            self.process_blocks(&scene, &request, model, filter.as_ref()).await
        } else {
            self.process_serial(&scene, &request, model, filter.as_ref()).await
        };
        self.stop_progress();
        let outcome = outcome?;

        let mut written = 0usize;
        for prediction_box in &outcome.boxes {
            if let Some(feature) = fields.to_feature(
                prediction_box,
                &scene.pixel_to_out,
                self.config.output.geometry_type,
            )? {
                layer.add_feature(feature)?;
                written += 1;
            }
        }
        info!("Saving feature set...");
        let layer_name = layer.name().to_string();
        layer.close()?;

        Ok(DetectionSummary {
            layer: layer_name,
            features: written,
            processed_box: scene.bbox,
            windows_classified: outcome.classified,
            windows_skipped: outcome.skipped,
            block_parallel,
        })
    }

    fn open_local_image(&self, path: &Path, srs: SpatialReference) -> Result<Scene> {
        info!("Opening image...");
        let image = LocalImage::open(path, srs)?;
        let bounds = image.bounds();
        debug!(
            path = %image.path().display(),
            width = bounds.width,
            height = bounds.height,
            "image decoded"
        );
        let cpus = num_cpus::get();

        if image.spatial_reference().is_local() {
            warn!(
                "Image has no georeferencing that can be converted to WGS84. \
                 Output will be in pixel space."
            );
            if self.config.bbox.is_some() {
                warn!(
                    "Supplying a bounding box requests a conversion from WGS84 to pixel space, \
                     which this image does not have. Ignoring user-supplied bounding box"
                );
            }
            return Ok(Scene {
                image: Box::new(image),
                bbox: bounds,
                pixel_to_out: TransformChain::identity(),
                output_sr: SpatialReference::Local,
                max_connections: cpus,
            });
        }

        let mut pixel_to_ll = TransformChain::from_affine(image.pixel_to_proj());
        pixel_to_ll.append(&image.spatial_reference().to_lat_lon()?);
        pixel_to_ll.compact();

        let mut bbox = bounds;
        if let Some(geo) = &self.config.bbox {
            let requested = pixel_to_ll.inverse()?.transform_to_pixel_rect(geo);
            let intersect = bounds.intersect(&requested);
            if intersect.is_empty() {
                return Err(Error::invalid(
                    "Input image and the provided bounding box do not intersect",
                ));
            }
            if intersect != requested {
                let adjusted = pixel_to_ll.transform_pixel_rect(&intersect);
                info!(
                    "Bounding box adjusted to ({}, {}) : ({}, {})",
                    adjusted.west, adjusted.north, adjusted.east, adjusted.south
                );
            }
            bbox = intersect;
        }

        Ok(Scene {
            image: Box::new(image),
            bbox,
            pixel_to_out: pixel_to_ll,
            output_sr: SpatialReference::Wgs84,
            max_connections: cpus,
        })
    }

    async fn open_map_service(&self, web: &WebOptions) -> Result<Scene> {
        let geo = self
            .config
            .bbox
            .ok_or_else(|| Error::invalid("Bounding box must be specified"))?;
        info!(service = web.client.kind().name(), "Connecting to tile service...");
        let fetcher: Arc<dyn TileFetcher> = match &self.tile_fetcher {
            Some(fetcher) => fetcher.clone(),
            None => Arc::new(web.client.connect(web.credentials.clone(), web.zoom).await?),
        };

        let ll_to_proj = SpatialReference::WebMercator.from_lat_lon()?;
        let proj_box = ll_to_proj.transform_geo_box(&geo);
        let image = MapServiceImage::from_area(fetcher, web.zoom, &proj_box)?;

        let pixel_to_proj = TransformChain::from_affine(image.pixel_to_proj());
        let bbox = pixel_to_proj
            .inverse()?
            .transform_to_pixel_rect(&proj_box)
            .intersect(&image.bounds());
        if bbox.is_empty() {
            return Err(Error::invalid("The bounding box is empty at this zoom level"));
        }

        let mut pixel_to_ll = pixel_to_proj;
        pixel_to_ll.append(&ll_to_proj.inverse()?);
        pixel_to_ll.compact();
        debug!(?bbox, tiles = ?image.range(), "tile mosaic opened");

        Ok(Scene {
            image: Box::new(image),
            bbox,
            pixel_to_out: pixel_to_ll,
            output_sr: SpatialReference::Wgs84,
            max_connections: web.max_connections,
        })
    }

    /// Mask over the processing box built from the region actions, in order.
    fn build_region_filter(&self, scene: &Scene, step: (u32, u32)) -> Result<Box<dyn RegionFilter>> {
        if self.config.regions.is_empty() {
            return Ok(Box::new(PassthroughRegionFilter));
        }
        info!("Initializing the region filter...");
        let bounds = PixelRect::from_size(scene.bbox.width, scene.bbox.height);
        let mut filter = MaskedRegionFilter::new(bounds, step);
        let out_to_pixel = scene.pixel_to_out.inverse()?;

        let mut first_action = true;
        for action in &self.config.regions {
            let mut polygons = Vec::new();
            for path in &action.paths {
                polygons.extend(read_region_polygons(path, scene.output_sr, &out_to_pixel)?);
            }
            match action.kind {
                RegionActionKind::Include => filter.add(&polygons),
                RegionActionKind::Exclude => {
                    if first_action {
                        info!("User excluded regions first...automatically including the bounding box...");
                        filter.add(&[Polygon::from_rect(&bounds)]);
                    }
                    filter.subtract(&polygons);
                }
            }
            first_action = false;
        }
        Ok(Box::new(filter))
    }

    fn open_layer(&self, output_sr: SpatialReference) -> Result<Layer> {
        info!("Initializing the output feature set...");
        let output = &self.config.output;
        let mode = if output.append {
            VectorOpenMode::Append
        } else {
            VectorOpenMode::Overwrite
        };
        let set = FileFeatureSet::open(&output.path, output.format, mode)?;
        let name = output.layer_name();
        let definitions = FeatureFields::definitions(output.producer_info);
        if output.append && set.has_layer(&name) {
            set.layer(&name, definitions)
        } else {
            set.create_layer(&name, output_sr, output.geometry_type, definitions)
        }
    }

    fn start_progress(&self) {
        if let Some(display) = &self.progress {
            display.set_categories(vec![
                ProgressCategory::new(READING_CATEGORY, "Reading the image"),
                self.config.action.progress_category(),
            ]);
            display.start();
        }
    }

    fn stop_progress(&self) {
        if let Some(display) = &self.progress {
            display.stop();
        }
    }

    /// Reports progress; fails once the display has been cancelled.
    fn report(&self, category: &str, progress: f32) -> Result<()> {
        if let Some(display) = &self.progress {
            display.update(category, progress);
            if display.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }
        Ok(())
    }

    fn resampled_size(&self, model_size: (u32, u32)) -> Option<(u32, u32)> {
        self.config
            .processing
            .resampled_size
            .map(|size| scaled(size, aspect_ratio(model_size)))
    }

    async fn process_serial(
        &self,
        scene: &Scene,
        request: &WindowRequest<'_>,
        model: Arc<dyn Model>,
        filter: &dyn RegionFilter,
    ) -> Result<Outcome> {
        info!("Processing...");
        let read_start = Instant::now();
        let pixels = read_region(
            scene.image.as_ref(),
            scene.bbox,
            filter,
            scene.max_connections,
            |progress| self.report(READING_CATEGORY, progress).is_ok(),
        )
        .await?;
        let read_time = read_start.elapsed();

        let processing = &self.config.processing;
        let detect = self.config.action == Action::Detect;
        let specs = if detect && processing.pyramid {
            pyramid_windows(request.primary(), pixels.dimensions())
        } else {
            calc_windows(request, !detect)?
        };
        debug!(?specs, "sliding windows");

        let model_size = model.metadata().model_size;
        let chipper = Chipper::new(
            &pixels,
            specs,
            self.resampled_size(model_size),
            model_size,
            filter.clone_box(),
        );
        let total = chipper.sliding_window().total_windows().max(1);
        let category = self.config.action.progress_category().name;
        let batch_size = model.batch_size().max(1);

        let detect_start = Instant::now();
        let mut chips = chipper.iter();
        let mut boxes = Vec::new();
        let mut classified = 0usize;
        loop {
            let batch: Vec<Chip> = chips.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            classified += batch.len();
            let worker_model = model.clone();
            let batch_boxes =
                tokio::task::spawn_blocking(move || classify_chips(worker_model.as_ref(), batch)).await??;
            boxes.extend(batch_boxes);
            self.report(&category, (classified + chips.skipped()) as f32 / total as f32)?;
        }
        let skipped = chips.skipped();
        info!(
            "Reading time {:.3} s, detection time {:.3} s",
            read_time.as_secs_f64(),
            detect_start.elapsed().as_secs_f64()
        );

        let mut boxes = self.filter_labels(boxes);
        if detect {
            if let Some(overlap) = processing.nms {
                info!("Performing non-maximum suppression...");
                boxes = non_max_suppression(boxes, overlap / 100.0);
            }
        }
        info!("{} features detected.", boxes.len());
        Ok(Outcome { boxes, classified, skipped })
    }

    async fn process_blocks(
        &self,
        scene: &Scene,
        request: &WindowRequest<'_>,
        model: Arc<dyn Model>,
        filter: &dyn RegionFilter,
    ) -> Result<Outcome> {
        info!("Processing image blocks in parallel...");
        let model_size = model.metadata().model_size;
        let job = BlockJob {
            windows: calc_windows(request, true)?,
            resampled_size: self.resampled_size(model_size),
            model,
        };
        let category = self.config.action.progress_category().name;
        let progress = BlockProgress {
            display: self.progress.as_deref(),
            reading: READING_CATEGORY,
            classifying: &category,
        };
        let run = BlockProcessor::new(job, scene.max_connections)
            .run(scene.image.as_ref(), filter, progress)
            .await?;
        let classified = run.boxes.len();
        let boxes = self.filter_labels(run.boxes);
        info!("{} features detected.", boxes.len());
        Ok(Outcome { boxes, classified, skipped: 0 })
    }

    fn filter_labels(&self, mut boxes: Vec<PredictionBox>) -> Vec<PredictionBox> {
        let processing = &self.config.processing;
        if !processing.exclude_labels.is_empty() {
            info!("Performing category filtering...");
            boxes = filter_labels(boxes, LabelFilterType::Exclude, &processing.exclude_labels);
        }
        if !processing.include_labels.is_empty() {
            info!("Performing category filtering...");
            boxes = filter_labels(boxes, LabelFilterType::Include, &processing.include_labels);
        }
        boxes
    }
}

struct Outcome {
    boxes: Vec<PredictionBox>,
    classified: usize,
    skipped: usize,
}

fn print_model(metadata: &ModelMetadata) {
    let created = metadata
        .time_created
        .map_or_else(|| "unknown".to_string(), |t| t.format("%Y-%b-%d %H:%M:%S").to_string());
    info!(
        "Model Name: {}; Version: {}; Created: {}",
        metadata.name, metadata.version, created
    );
    info!("Description: {}", metadata.description);
    info!(
        "Dimensions (pixels): {}x{}; Color Mode: {}",
        metadata.model_size.0, metadata.model_size.1, metadata.color_mode
    );
    if let Some([west, south, east, north]) = metadata.bounding_box {
        info!("Bounding box (lat/lon): ({west}, {north}) : ({east}, {south})");
    }
    info!("Labels: {}", metadata.labels.join(", "));
}

fn check_sizes(processing: &ProcessingOptions, model_width: u32) -> Result<()> {
    let empty = [
        ("window-size", processing.window_sizes.contains(&0)),
        ("window-step", processing.window_steps.contains(&0)),
        ("resampled-size", processing.resampled_size == Some(0)),
    ];
    if let Some((name, _)) = empty.iter().find(|(_, zero)| *zero) {
        return Err(Error::invalid(format!("Argument --{name} must be greater than zero.")));
    }
    if let Some(resampled) = processing.resampled_size {
        if resampled > model_width {
            return Err(Error::invalid(format!(
                "Argument --resampled-size (size: {resampled}) does not fit within the model (width: {model_width})."
            )));
        }
    } else if processing.window_sizes.iter().any(|&size| size > model_width) {
        return Err(Error::invalid(format!(
            "Argument --window-size contains a size that does not fit within the model (width: {model_width})."
        )));
    }
    Ok(())
}

/// Polygons of a region file in processing-box pixels.
fn read_region_polygons(
    path: &Path,
    image_sr: SpatialReference,
    out_to_pixel: &TransformChain,
) -> Result<Vec<Polygon>> {
    let set = FileFeatureSet::read(path)?;
    let mut polygons = Vec::new();
    for layer in set.layers() {
        if layer.spatial_reference.is_local() != image_sr.is_local() {
            return Err(Error::invalid(if layer.spatial_reference.is_local() {
                format!(
                    "Error applying region filter: {} doesn't have a spatial reference, but the input image does",
                    path.display()
                )
            } else {
                format!(
                    "Error applying region filter: Input image doesn't have a spatial reference, but {} does",
                    path.display()
                )
            }));
        }
        for feature in layer.iter() {
            let Geometry::Polygon(polygon) = &feature.geometry else {
                return Err(Error::invalid(format!(
                    "Filter from file \"{}\" contains a geometry that is not a POLYGON",
                    path.display()
                )));
            };
            polygons.push(polygon.map_points(|p| Ok::<_, Error>(out_to_pixel.apply(p)))?);
        }
    }
    Ok(polygons)
}

/// Batches chips through the model. Windows without predictions are dropped.
pub(crate) fn classify_chips(model: &dyn Model, chips: Vec<Chip>) -> Result<Vec<PredictionBox>> {
    let (windows, images): (Vec<_>, Vec<_>) = chips
        .into_iter()
        .map(|chip| (chip.window, chip.image))
        .unzip();
    let predictions = model.classify(&images)?;
    Ok(windows
        .into_iter()
        .zip(predictions)
        .filter(|(_, predictions)| !predictions.is_empty())
        .map(|(window, predictions)| PredictionBox::new(window, predictions))
        .collect())
}

/// Builds the attribute set written for every detection.
struct FeatureFields {
    extra: Fields,
}

impl FeatureFields {
    fn new(producer_info: bool) -> Self {
        let mut extra = Fields::new();
        extra.insert("date".to_string(), Field::date(Utc::now().date_naive()));
        if producer_info {
            extra.insert("username".to_string(), Field::string(login_user()));
            extra.insert("app".to_string(), Field::string(APP_NAME));
            extra.insert("app_ver".to_string(), Field::string(APP_VERSION));
        }
        Self { extra }
    }

    fn definitions(producer_info: bool) -> Vec<FieldDefinition> {
        let mut definitions = vec![
            FieldDefinition::with_width(FieldType::String, "top_cat", 50),
            FieldDefinition::new(FieldType::Real, "top_score"),
            FieldDefinition::new(FieldType::Date, "date"),
            FieldDefinition::with_width(FieldType::String, "top_five", 254),
        ];
        if producer_info {
            definitions.push(FieldDefinition::with_width(FieldType::String, "username", 50));
            definitions.push(FieldDefinition::with_width(FieldType::String, "app", 50));
            definitions.push(FieldDefinition::with_width(FieldType::String, "app_ver", 50));
        }
        definitions
    }

    fn fields(&self, predictions: &[Prediction]) -> Result<Fields> {
        let mut fields = self.extra.clone();
        let Some(top) = predictions.first() else {
            return Ok(fields);
        };
        fields.insert("top_cat".to_string(), Field::string(top.label.clone()));
        fields.insert("top_score".to_string(), Field::real(top.confidence as f64));
        let top_five: Map<String, Value> = predictions
            .iter()
            .take(TOP_N)
            .map(|p| (p.label.clone(), Value::from(p.confidence as f64)))
            .collect();
        fields.insert(
            "top_five".to_string(),
            Field::string(serde_json::to_string(&top_five)?),
        );
        Ok(fields)
    }

    fn to_feature(
        &self,
        prediction_box: &PredictionBox,
        pixel_to_out: &TransformChain,
        geometry_type: GeometryType,
    ) -> Result<Option<Feature>> {
        if prediction_box.predictions.is_empty() {
            return Ok(None);
        }
        let polygon = Polygon::from_rect(&prediction_box.window);
        let geometry = match geometry_type {
            GeometryType::Point => Geometry::Point(pixel_to_out.apply(polygon.centroid())),
            GeometryType::Polygon => {
                Geometry::Polygon(polygon.map_points(|p| Ok::<_, Error>(pixel_to_out.apply(p)))?)
            }
            GeometryType::Unknown => return Err(Error::invalid("Invalid output type")),
        };
        Ok(Some(Feature::new(geometry, self.fields(&prediction_box.predictions)?)))
    }
}

fn login_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::model::{LinearModel, ModelPackage, tests::water_field_json};
    use image::{Rgb, RgbImage};

    #[test]
    fn top_five_lists_the_best_labels() {
        let fields = FeatureFields::new(true);
        let predictions: Vec<Prediction> = (0..7)
            .map(|i| Prediction::new(format!("l{i}"), 0.9 - i as f32 * 0.1))
            .collect();
        let out = fields.fields(&predictions).unwrap();
        assert_eq!(out["top_cat"], Field::string("l0"));
        assert_eq!(out["app"], Field::string(APP_NAME));
        let crate::core_modules::feature::FieldValue::String(json) = &out["top_five"].value else {
            panic!("top_five is not a string");
        };
        let parsed: Map<String, Value> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.len(), 5);
        assert!(parsed.contains_key("l4"));
        assert!(!parsed.contains_key("l5"));
    }

    #[test]
    fn point_features_use_the_window_centroid() {
        let fields = FeatureFields::new(false);
        let mut chain = TransformChain::identity();
        chain.push_front(Transform::Affine(AffineTransform::translation(100.0, 50.0)));
        let prediction_box = PredictionBox::new(
            PixelRect::new(0, 0, 10, 20),
            vec![Prediction::new("car", 0.9)],
        );
        let feature = fields
            .to_feature(&prediction_box, &chain, GeometryType::Point)
            .unwrap()
            .unwrap();
        let Geometry::Point(p) = feature.geometry else {
            panic!("expected a point");
        };
        assert_eq!((p.x, p.y), (105.0, 60.0));
        assert!(!feature.fields.contains_key("username"));

        let empty = PredictionBox::new(PixelRect::new(0, 0, 1, 1), Vec::new());
        assert!(fields.to_feature(&empty, &chain, GeometryType::Point).unwrap().is_none());
    }

    #[test]
    fn window_sizes_must_fit_the_model() {
        let mut processing = ProcessingOptions {
            window_sizes: vec![32, 80],
            ..ProcessingOptions::default()
        };
        assert!(check_sizes(&processing, 64).is_err());
        processing.resampled_size = Some(64);
        assert!(check_sizes(&processing, 64).is_ok());
        processing.resampled_size = Some(65);
        assert!(check_sizes(&processing, 64).is_err());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let cases = [
            ProcessingOptions {
                window_sizes: vec![0],
                ..ProcessingOptions::default()
            },
            ProcessingOptions {
                window_steps: vec![16, 0],
                ..ProcessingOptions::default()
            },
            ProcessingOptions {
                resampled_size: Some(0),
                ..ProcessingOptions::default()
            },
        ];
        for processing in &cases {
            assert!(matches!(check_sizes(processing, 64), Err(Error::InvalidArgument(_))));
        }
    }

    #[test]
    fn classify_chips_drops_empty_windows() {
        let mut model = LinearModel::new(ModelPackage::from_json(&water_field_json(4)).unwrap()).unwrap();
        model.set_confidence(0.99);
        let chips = vec![
            Chip {
                window: PixelRect::new(0, 0, 4, 4),
                image: RgbImage::from_pixel(4, 4, Rgb([10, 20, 200])),
            },
            Chip {
                window: PixelRect::new(4, 0, 4, 4),
                image: RgbImage::from_pixel(4, 4, Rgb([50, 50, 100])),
            },
        ];
        let boxes = classify_chips(&model, chips).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].window, PixelRect::new(0, 0, 4, 4));
    }

    #[test]
    fn layer_name_defaults_to_file_stem() {
        let output = OutputOptions {
            path: PathBuf::from("/tmp/run/cars.geojson"),
            format: OutputFormat::GeoJson,
            layer: None,
            geometry_type: GeometryType::Point,
            producer_info: false,
            append: false,
        };
        assert_eq!(output.layer_name(), "cars");
    }
}
