use futures::future::BoxFuture;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use skyscan::core_modules::feature::GeometryType;
use skyscan::core_modules::feature_set::OutputFormat;
use skyscan::core_modules::geometry::GeoBox;
use skyscan::core_modules::progress::{ConsoleProgressDisplay, ProgressDisplay};
use skyscan::core_modules::tile_service::{TILE_SIZE, TileClient, TileFetcher};
use skyscan::core_modules::transform::SpatialReference;
use skyscan::{
    Action, DetectionConfig, Detector, Error, OutputOptions, ProcessingOptions, RegionAction,
    RegionActionKind, Source, WebOptions,
};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const WATER: Rgb<u8> = Rgb([10, 20, 200]);
const FIELD: Rgb<u8> = Rgb([200, 220, 40]);

fn write_model(dir: &Path, size: u32) -> PathBuf {
    let path = dir.join("model.json");
    let json = format!(
        r#"{{
            "metadata": {{
                "name": "water-field",
                "version": "1.0",
                "description": "water versus fields",
                "category": "landcover",
                "labels": ["water", "field"],
                "model_size": [{size}, {size}],
                "color_mode": "rgb"
            }},
            "batch_size": 16,
            "weights": {{
                "water": {{"bias": 0.0, "coefficients": [-8.0, -8.0, 12.0, 0.0, 0.0, 0.0]}},
                "field": {{"bias": 0.0, "coefficients": [8.0, 8.0, -4.0, 0.0, 0.0, 0.0]}}
            }}
        }}"#
    );
    std::fs::write(&path, json).unwrap();
    path
}

/// Water west of `split`, fields east of it.
fn write_image(dir: &Path, width: u32, height: u32, split: u32) -> PathBuf {
    let path = dir.join("scene.png");
    let image = RgbImage::from_fn(width, height, |x, _| if x < split { WATER } else { FIELD });
    image.save(&path).unwrap();
    path
}

fn output(path: PathBuf, geometry_type: GeometryType) -> OutputOptions {
    OutputOptions {
        format: OutputFormat::from_path(&path).unwrap(),
        path,
        layer: None,
        geometry_type,
        producer_info: false,
        append: false,
    }
}

fn read_features(path: &Path) -> Vec<Value> {
    let root: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    root["features"].as_array().unwrap().clone()
}

#[tokio::test]
async fn landcover_on_georeferenced_image_runs_block_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path(), 1024, 512, 512);
    std::fs::write(dir.path().join("scene.pgw"), "0.001\n0\n0\n-0.001\n10.0005\n49.9995\n").unwrap();
    let out = dir.path().join("landcover.geojson");

    let config = DetectionConfig {
        action: Action::Landcover,
        source: Source::Image {
            path: image,
            srs: SpatialReference::Wgs84,
        },
        bbox: None,
        output: output(out.clone(), GeometryType::Polygon),
        processing: ProcessingOptions {
            model: write_model(dir.path(), 64),
            ..ProcessingOptions::default()
        },
        regions: Vec::new(),
    };
    let summary = Detector::new(config).process().await.unwrap();
    assert!(summary.block_parallel);
    assert_eq!(summary.features, 16 * 8);
    assert_eq!(summary.layer, "landcover");

    let features = read_features(&out);
    assert_eq!(features.len(), 128);
    for feature in &features {
        let ring = feature["geometry"]["coordinates"][0].as_array().unwrap();
        // Mean of the four corners; the closing vertex repeats the first.
        let corners = &ring[..4];
        let lon = corners.iter().map(|p| p[0].as_f64().unwrap()).sum::<f64>() / 4.0;
        let lat = corners.iter().map(|p| p[1].as_f64().unwrap()).sum::<f64>() / 4.0;
        assert!((10.0..=11.024).contains(&lon));
        assert!((49.488..=50.0).contains(&lat));
        let expected = if lon < 10.512 { "water" } else { "field" };
        assert_eq!(feature["properties"]["top_cat"], expected);
    }
}

fn detect_config(dir: &Path, out: PathBuf) -> DetectionConfig {
    DetectionConfig {
        action: Action::Detect,
        source: Source::Image {
            path: write_image(dir, 256, 128, 128),
            srs: SpatialReference::Wgs84,
        },
        bbox: Some(GeoBox::new(1.0, 1.0, 2.0, 2.0)),
        output: output(out, GeometryType::Point),
        processing: ProcessingOptions {
            model: write_model(dir, 32),
            window_steps: vec![32],
            confidence: 90.0,
            nms: Some(30.0),
            include_labels: vec!["water".to_string()],
            ..ProcessingOptions::default()
        },
        regions: Vec::new(),
    }
}

#[tokio::test]
async fn detect_in_pixel_space_ignores_bbox_and_filters_labels() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("cars.geojson");
    let summary = Detector::new(detect_config(dir.path(), out.clone()))
        .process()
        .await
        .unwrap();
    assert!(!summary.block_parallel);
    assert_eq!(summary.processed_box.width, 256);
    assert_eq!(summary.windows_classified, 32);
    assert_eq!(summary.features, 16);

    let root: Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(root["crs"]["properties"]["name"], "local");
    for feature in root["features"].as_array().unwrap() {
        assert_eq!(feature["geometry"]["type"], "Point");
        assert!(feature["geometry"]["coordinates"][0].as_f64().unwrap() < 128.0);
    }
}

#[tokio::test]
async fn exclude_region_skips_windows() {
    let dir = tempfile::tempdir().unwrap();
    let region = dir.path().join("exclude.geojson");
    std::fs::write(
        &region,
        r#"{"type":"FeatureCollection","name":"exclude",
            "crs":{"type":"name","properties":{"name":"local"}},
            "features":[{"type":"Feature","properties":{},
              "geometry":{"type":"Polygon","coordinates":[[[0,0],[64,0],[64,128],[0,128],[0,0]]]}}]}"#,
    )
    .unwrap();

    let mut config = detect_config(dir.path(), dir.path().join("out.geojson"));
    config.regions = vec![RegionAction {
        kind: RegionActionKind::Exclude,
        paths: vec![region],
    }];
    let summary = Detector::new(config).process().await.unwrap();
    assert_eq!(summary.windows_skipped, 8);
    assert_eq!(summary.features, 8);
}

#[tokio::test]
async fn region_files_must_match_the_image_reference() {
    let dir = tempfile::tempdir().unwrap();
    let region = dir.path().join("include.geojson");
    std::fs::write(
        &region,
        r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]}"#,
    )
    .unwrap();
    let mut config = detect_config(dir.path(), dir.path().join("out.geojson"));
    config.regions = vec![RegionAction {
        kind: RegionActionKind::Include,
        paths: vec![region],
    }];
    assert!(matches!(
        Detector::new(config).process().await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn zero_window_size_fails_instead_of_looping() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = detect_config(dir.path(), dir.path().join("out.geojson"));
    config.processing.window_sizes = vec![0];
    config.processing.pyramid = true;
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        Detector::new(config).process(),
    )
    .await
    .expect("processing finished");
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    let mut config = detect_config(dir.path(), dir.path().join("out.geojson"));
    config.processing.resampled_size = Some(0);
    assert!(matches!(
        Detector::new(config).process().await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn cancelled_display_stops_processing() {
    let dir = tempfile::tempdir().unwrap();
    let display = Arc::new(ConsoleProgressDisplay::new());
    display.cancel();
    let mut detector = Detector::new(detect_config(dir.path(), dir.path().join("out.geojson")));
    detector.set_progress_display(display);
    assert!(matches!(detector.process().await, Err(Error::Cancelled)));
}

/// Serves water tiles and counts requests.
#[derive(Default)]
struct WaterTiles {
    requests: AtomicUsize,
}

impl TileFetcher for WaterTiles {
    fn fetch(&self, _zoom: u32, _x: u32, _y: u32) -> BoxFuture<'_, skyscan::Result<Vec<u8>>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let mut bytes = Vec::new();
            RgbImage::from_pixel(TILE_SIZE, TILE_SIZE, WATER)
                .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
            Ok(bytes)
        })
    }
}

fn service_config(out: PathBuf, model: PathBuf) -> DetectionConfig {
    DetectionConfig {
        action: Action::Detect,
        source: Source::Service(WebOptions {
            client: TileClient::Xyz {
                url: "http://tiles.invalid/{z}/{x}/{y}.png".to_string(),
            },
            credentials: None,
            zoom: 16,
            max_connections: 4,
        }),
        bbox: Some(GeoBox::new(0.01, 0.01, 0.015, 0.015)),
        output: OutputOptions {
            append: true,
            producer_info: true,
            ..output(out, GeometryType::Polygon)
        },
        processing: ProcessingOptions {
            model,
            window_steps: vec![64],
            confidence: 50.0,
            ..ProcessingOptions::default()
        },
        regions: Vec::new(),
    }
}

#[tokio::test]
async fn tile_service_detections_append_to_sequence_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("tiles.geojsonl");
    let model = write_model(dir.path(), 64);
    let tiles = Arc::new(WaterTiles::default());

    let first = Detector::new(service_config(out.clone(), model.clone()))
        .with_tile_fetcher(tiles.clone())
        .process()
        .await
        .unwrap();
    assert!(first.features > 0);
    assert!(tiles.requests.load(Ordering::SeqCst) > 0);

    let second = Detector::new(service_config(out.clone(), model))
        .with_tile_fetcher(tiles)
        .process()
        .await
        .unwrap();
    assert_eq!(first.features, second.features);

    let text = std::fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), first.features * 2);
    let feature: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(feature["properties"]["top_cat"], "water");
    assert_eq!(feature["properties"]["app"], "skyscan");
    let lon = feature["geometry"]["coordinates"][0][0][0].as_f64().unwrap();
    assert!((0.009..0.016).contains(&lon));
}

#[tokio::test]
async fn tile_service_requires_a_bbox() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = service_config(dir.path().join("out.geojson"), write_model(dir.path(), 64));
    config.bbox = None;
    let result = Detector::new(config)
        .with_tile_fetcher(Arc::new(WaterTiles::default()))
        .process()
        .await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}
