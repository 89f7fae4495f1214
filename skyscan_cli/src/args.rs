// THEORY:
// Every option lives on one `RunArgs` struct that is both a clap `Args` and a
// serde `Deserialize` target, so the same names work on the command line, in
// `SKYSCAN_*` environment variables and as keys in TOML config files.
//
// All fields are optional or empty collections. Defaults are applied only after
// the command line has been merged over the config files, which is what lets a
// later source override an earlier one without clap's defaults getting in the way.

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "skyscan", version, about = "Runs an image classifier over georeferenced imagery")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Detect objects with an overlapping sliding window.
    Detect(RunArgs),
    /// Classify every tile of a non-overlapping grid.
    Landcover(RunArgs),
}

impl Command {
    pub fn into_parts(self) -> (skyscan::Action, RunArgs) {
        match self {
            Command::Detect(args) => (skyscan::Action::Detect, args),
            Command::Landcover(args) => (skyscan::Action::Landcover, args),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageSrs {
    Wgs84,
    WebMercator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceArg {
    MapsApi,
    TileJson,
    Xyz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeometryArg {
    Point,
    Polygon,
}

#[derive(Debug, Clone, Default, PartialEq, Args, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RunArgs {
    // Input
    /// Georeferenced image; a world file next to it supplies the geotransform.
    #[arg(long, env = "SKYSCAN_IMAGE", help_heading = "Input")]
    pub image: Option<PathBuf>,

    /// Reference system of the image's world file.
    #[arg(long, value_enum, env = "SKYSCAN_IMAGE_SRS", help_heading = "Input")]
    pub image_srs: Option<ImageSrs>,

    /// Tile service to read imagery from.
    #[arg(long, value_enum, env = "SKYSCAN_SERVICE", help_heading = "Input")]
    pub service: Option<ServiceArg>,

    /// Access token for maps-api.
    #[arg(long, env = "SKYSCAN_TOKEN", help_heading = "Input")]
    pub token: Option<String>,

    /// USER[:PASS]; the password is prompted for when missing.
    #[arg(long, env = "SKYSCAN_CREDENTIALS", help_heading = "Input")]
    pub credentials: Option<String>,

    /// TileJSON document or XYZ URL template.
    #[arg(long, env = "SKYSCAN_URL", help_heading = "Input")]
    pub url: Option<String>,

    /// Use the `tiles` template of the TileJSON document instead of deriving one.
    #[arg(long, env = "SKYSCAN_USE_TILES", help_heading = "Input")]
    pub use_tiles: bool,

    /// Tile zoom level [default: 18]
    #[arg(long, env = "SKYSCAN_ZOOM", help_heading = "Input")]
    pub zoom: Option<u32>,

    #[arg(long, env = "SKYSCAN_MAP_ID", help_heading = "Input")]
    pub map_id: Option<String>,

    /// Concurrent tile downloads [default: 10]
    #[arg(long, env = "SKYSCAN_MAX_CONNECTIONS", help_heading = "Input")]
    pub max_connections: Option<usize>,

    /// WGS84 area of interest.
    #[arg(
        long,
        num_args = 4,
        value_names = ["WEST", "SOUTH", "EAST", "NORTH"],
        allow_negative_numbers = true,
        value_delimiter = ',',
        env = "SKYSCAN_BBOX",
        help_heading = "Input"
    )]
    pub bbox: Option<Vec<f64>>,

    // Output
    /// Output format [default: geojson]
    #[arg(long, env = "SKYSCAN_FORMAT", help_heading = "Output")]
    pub format: Option<String>,

    #[arg(long, env = "SKYSCAN_OUTPUT", help_heading = "Output")]
    pub output: Option<PathBuf>,

    /// Layer name [default: output file stem]
    #[arg(long, env = "SKYSCAN_OUTPUT_LAYER", help_heading = "Output")]
    pub output_layer: Option<String>,

    /// Output geometry [default: polygon]
    #[arg(long = "type", value_enum, env = "SKYSCAN_TYPE", help_heading = "Output")]
    #[serde(rename = "type")]
    pub geometry_type: Option<GeometryArg>,

    /// Add username, app and app_ver fields.
    #[arg(long, env = "SKYSCAN_PRODUCER_INFO", help_heading = "Output")]
    pub producer_info: bool,

    /// Append to an existing output layer.
    #[arg(long, env = "SKYSCAN_APPEND", help_heading = "Output")]
    pub append: bool,

    // Processing
    /// Model package.
    #[arg(long, env = "SKYSCAN_MODEL", help_heading = "Processing")]
    pub model: Option<PathBuf>,

    #[arg(
        long,
        num_args = 1..,
        value_delimiter = ',',
        env = "SKYSCAN_WINDOW_SIZE",
        help_heading = "Processing"
    )]
    pub window_size: Vec<u32>,

    #[arg(
        long,
        num_args = 1..,
        value_delimiter = ',',
        env = "SKYSCAN_WINDOW_STEP",
        help_heading = "Processing"
    )]
    pub window_step: Vec<u32>,

    /// Resize chips to this size before classification.
    #[arg(long, env = "SKYSCAN_RESAMPLED_SIZE", help_heading = "Processing")]
    pub resampled_size: Option<u32>,

    /// Double the window up to the size of the processing box.
    #[arg(long, env = "SKYSCAN_PYRAMID", help_heading = "Processing")]
    pub pyramid: bool,

    // Detection
    /// Minimum confidence in percent [default: 95]
    #[arg(long, env = "SKYSCAN_CONFIDENCE", help_heading = "Detection")]
    pub confidence: Option<f32>,

    /// Non-maximum suppression with the given overlap in percent.
    #[arg(
        long,
        num_args = 0..=1,
        default_missing_value = "30",
        value_name = "PERCENT",
        env = "SKYSCAN_NMS",
        help_heading = "Detection"
    )]
    pub nms: Option<f64>,

    #[arg(
        long,
        num_args = 1..,
        value_delimiter = ',',
        env = "SKYSCAN_INCLUDE_LABELS",
        help_heading = "Detection"
    )]
    pub include_labels: Vec<String>,

    #[arg(
        long,
        num_args = 1..,
        value_delimiter = ',',
        env = "SKYSCAN_EXCLUDE_LABELS",
        help_heading = "Detection"
    )]
    pub exclude_labels: Vec<String>,

    // Filtering
    #[arg(
        long,
        num_args = 1..,
        value_name = "PATH",
        value_delimiter = ',',
        env = "SKYSCAN_INCLUDE_REGION",
        help_heading = "Filtering"
    )]
    pub include_region: Vec<PathBuf>,

    #[arg(
        long,
        num_args = 1..,
        value_name = "PATH",
        value_delimiter = ',',
        env = "SKYSCAN_EXCLUDE_REGION",
        help_heading = "Filtering"
    )]
    pub exclude_region: Vec<PathBuf>,

    /// (include|exclude) PATH... [(include|exclude) PATH...]...
    #[arg(
        long,
        num_args = 2..,
        value_name = "ACTION PATH",
        value_delimiter = ',',
        env = "SKYSCAN_REGION",
        help_heading = "Filtering"
    )]
    pub region: Vec<String>,

    // Logging
    /// [LEVEL] PATH: also log to a file, at debug level by default.
    #[arg(
        long,
        num_args = 1..=2,
        value_names = ["LEVEL", "PATH"],
        value_delimiter = ',',
        env = "SKYSCAN_LOG",
        help_heading = "Logging"
    )]
    pub log: Vec<String>,

    /// Only report errors on the console.
    #[arg(long, env = "SKYSCAN_QUIET", help_heading = "Logging")]
    pub quiet: bool,

    #[arg(long, env = "SKYSCAN_DEBUG", help_heading = "Logging")]
    pub debug: bool,

    #[arg(long, env = "SKYSCAN_TRACE", help_heading = "Logging")]
    pub trace: bool,

    /// TOML files with default option values; later files win.
    #[arg(
        long,
        num_args = 1..,
        value_name = "PATH",
        value_delimiter = ',',
        env = "SKYSCAN_CONFIG"
    )]
    #[serde(skip)]
    pub config: Vec<PathBuf>,
}

fn or_vec<T>(primary: Vec<T>, fallback: Vec<T>) -> Vec<T> {
    if primary.is_empty() { fallback } else { primary }
}

impl RunArgs {
    /// Fills everything `self` leaves unset from `fallback`.
    pub fn merge(self, fallback: RunArgs) -> RunArgs {
        RunArgs {
            image: self.image.or(fallback.image),
            image_srs: self.image_srs.or(fallback.image_srs),
            service: self.service.or(fallback.service),
            token: self.token.or(fallback.token),
            credentials: self.credentials.or(fallback.credentials),
            url: self.url.or(fallback.url),
            use_tiles: self.use_tiles || fallback.use_tiles,
            zoom: self.zoom.or(fallback.zoom),
            map_id: self.map_id.or(fallback.map_id),
            max_connections: self.max_connections.or(fallback.max_connections),
            bbox: self.bbox.or(fallback.bbox),
            format: self.format.or(fallback.format),
            output: self.output.or(fallback.output),
            output_layer: self.output_layer.or(fallback.output_layer),
            geometry_type: self.geometry_type.or(fallback.geometry_type),
            producer_info: self.producer_info || fallback.producer_info,
            append: self.append || fallback.append,
            model: self.model.or(fallback.model),
            window_size: or_vec(self.window_size, fallback.window_size),
            window_step: or_vec(self.window_step, fallback.window_step),
            resampled_size: self.resampled_size.or(fallback.resampled_size),
            pyramid: self.pyramid || fallback.pyramid,
            confidence: self.confidence.or(fallback.confidence),
            nms: self.nms.or(fallback.nms),
            include_labels: or_vec(self.include_labels, fallback.include_labels),
            exclude_labels: or_vec(self.exclude_labels, fallback.exclude_labels),
            include_region: or_vec(self.include_region, fallback.include_region),
            exclude_region: or_vec(self.exclude_region, fallback.exclude_region),
            region: or_vec(self.region, fallback.region),
            log: or_vec(self.log, fallback.log),
            quiet: self.quiet || fallback.quiet,
            debug: self.debug || fallback.debug,
            trace: self.trace || fallback.trace,
            config: self.config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> (skyscan::Action, RunArgs) {
        let mut argv = vec!["skyscan"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().command.into_parts()
    }

    #[test]
    fn parses_detect_options() {
        let (action, args) = parse(&[
            "detect",
            "--image",
            "scene.tif",
            "--bbox",
            "-10.5",
            "20",
            "-10",
            "20.5",
            "--window-size",
            "64",
            "128",
            "--type",
            "point",
            "--nms",
        ]);
        assert_eq!(action, skyscan::Action::Detect);
        assert_eq!(args.image, Some(PathBuf::from("scene.tif")));
        assert_eq!(args.bbox, Some(vec![-10.5, 20.0, -10.0, 20.5]));
        assert_eq!(args.window_size, vec![64, 128]);
        assert_eq!(args.geometry_type, Some(GeometryArg::Point));
        assert_eq!(args.nms, Some(30.0));
    }

    #[test]
    fn nms_takes_an_optional_percentage() {
        let (_, args) = parse(&["landcover", "--nms", "45", "--model", "m.json"]);
        assert_eq!(args.nms, Some(45.0));
        let (action, args) = parse(&["landcover", "--model", "m.json"]);
        assert_eq!(action, skyscan::Action::Landcover);
        assert_eq!(args.nms, None);
    }

    #[test]
    fn log_accepts_level_and_path() {
        let (_, args) = parse(&["detect", "--log", "trace", "run.log"]);
        assert_eq!(args.log, vec!["trace", "run.log"]);
        let (_, args) = parse(&["detect", "--log", "run.log"]);
        assert_eq!(args.log, vec!["run.log"]);
    }

    #[test]
    fn unknown_service_is_rejected() {
        assert!(Cli::try_parse_from(["skyscan", "detect", "--service", "wmts"]).is_err());
    }

    #[test]
    fn merge_prefers_self_and_fills_gaps() {
        let cli = RunArgs {
            zoom: Some(17),
            window_size: vec![32],
            ..RunArgs::default()
        };
        let file = RunArgs {
            zoom: Some(15),
            model: Some(PathBuf::from("model.json")),
            window_size: vec![64, 128],
            append: true,
            ..RunArgs::default()
        };
        let merged = cli.merge(file);
        assert_eq!(merged.zoom, Some(17));
        assert_eq!(merged.model, Some(PathBuf::from("model.json")));
        assert_eq!(merged.window_size, vec![32]);
        assert!(merged.append);
    }
}
