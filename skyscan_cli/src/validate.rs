// THEORY:
// Turns merged `RunArgs` into a `DetectionConfig`. Which options matter depends
// on the action and on the image source, so every option is checked against its
// use in the current mode: a missing required option is an error, an option the
// mode ignores is a warning, and a list where only the first value is used warns
// about the rest. Defaults are filled in here, after all sources were merged.

use crate::args::{GeometryArg, ImageSrs, RunArgs, ServiceArg};
use anyhow::{Context, Result, bail, ensure};
use skyscan::core_modules::feature::GeometryType;
use skyscan::core_modules::feature_set::{OutputFormat, supported_formats};
use skyscan::core_modules::geometry::GeoBox;
use skyscan::core_modules::tile_service::{Credentials, TileClient};
use skyscan::core_modules::transform::SpatialReference;
use skyscan::{
    Action, DetectionConfig, OutputOptions, ProcessingOptions, RegionAction, RegionActionKind,
    Source, WebOptions,
};
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_ZOOM: u32 = 18;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub const DEFAULT_CONFIDENCE: f32 = 95.0;
pub const DEFAULT_MAP_ID: &str = "mapbox.satellite";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ArgUse {
    Ignored,
    MayUseOne,
    Optional,
    Required,
}

fn check(name: &str, usage: ArgUse, set: bool, cause: &str) -> Result<()> {
    match usage {
        ArgUse::Required if !set => bail!("Argument --{name} is required when {cause}"),
        ArgUse::Ignored if set => warn!("Argument --{name} is ignored when {cause}"),
        _ => {}
    }
    Ok(())
}

fn check_list(name: &str, usage: ArgUse, len: usize, cause: &str) -> Result<()> {
    match usage {
        ArgUse::Required if len == 0 => bail!("Argument --{name} is required when {cause}"),
        ArgUse::MayUseOne if len > 1 => {
            warn!("Argument --{name} has ignored additional parameters when {cause}")
        }
        ArgUse::Ignored if len > 0 => warn!("Argument --{name} is ignored when {cause}"),
        _ => {}
    }
    Ok(())
}

/// How the action uses the processing options.
struct ActionUse {
    window_step: ArgUse,
    window_size: ArgUse,
    nms: ArgUse,
    pyramid: ArgUse,
    confidence: ArgUse,
    cause: &'static str,
}

impl ActionUse {
    fn of(action: Action) -> Self {
        match action {
            Action::Detect => Self {
                window_step: ArgUse::Optional,
                window_size: ArgUse::Optional,
                nms: ArgUse::Optional,
                pyramid: ArgUse::Optional,
                confidence: ArgUse::Optional,
                cause: "the action is detect",
            },
            Action::Landcover => Self {
                window_step: ArgUse::Ignored,
                window_size: ArgUse::MayUseOne,
                nms: ArgUse::Ignored,
                pyramid: ArgUse::Ignored,
                confidence: ArgUse::Ignored,
                cause: "the action is landcover",
            },
        }
    }
}

/// How the image source uses the input options.
struct SourceUse {
    image_srs: ArgUse,
    token: ArgUse,
    credentials: ArgUse,
    map_id: ArgUse,
    zoom: ArgUse,
    bbox: ArgUse,
    max_connections: ArgUse,
    url: ArgUse,
    use_tiles: ArgUse,
    cause: &'static str,
}

impl SourceUse {
    fn of(service: Option<ServiceArg>) -> Self {
        let ignored = Self {
            image_srs: ArgUse::Ignored,
            token: ArgUse::Ignored,
            credentials: ArgUse::Ignored,
            map_id: ArgUse::Ignored,
            zoom: ArgUse::Ignored,
            bbox: ArgUse::Ignored,
            max_connections: ArgUse::Ignored,
            url: ArgUse::Ignored,
            use_tiles: ArgUse::Ignored,
            cause: "processing",
        };
        match service {
            None => Self {
                image_srs: ArgUse::Optional,
                bbox: ArgUse::Optional,
                cause: "using a local image",
                ..ignored
            },
            Some(ServiceArg::MapsApi) => Self {
                token: ArgUse::Required,
                map_id: ArgUse::Optional,
                zoom: ArgUse::Optional,
                bbox: ArgUse::Required,
                max_connections: ArgUse::Optional,
                cause: "using maps-api",
                ..ignored
            },
            Some(ServiceArg::TileJson) => Self {
                credentials: ArgUse::Optional,
                zoom: ArgUse::Optional,
                bbox: ArgUse::Required,
                max_connections: ArgUse::Optional,
                url: ArgUse::Required,
                use_tiles: ArgUse::Optional,
                cause: "using tile-json",
                ..ignored
            },
            Some(ServiceArg::Xyz) => Self {
                credentials: ArgUse::Optional,
                zoom: ArgUse::Optional,
                bbox: ArgUse::Required,
                max_connections: ArgUse::Optional,
                url: ArgUse::Required,
                cause: "using xyz",
                ..ignored
            },
        }
    }
}

/// Splits `--region` values into `(include|exclude) PATH...` groups.
pub fn parse_region_groups(values: &[String]) -> Result<Vec<RegionAction>> {
    let mut groups: Vec<RegionAction> = Vec::new();
    for value in values {
        let kind = match value.as_str() {
            "include" => Some(RegionActionKind::Include),
            "exclude" => Some(RegionActionKind::Exclude),
            _ => None,
        };
        if let Some(kind) = kind {
            if let Some(last) = groups.last() {
                ensure!(!last.paths.is_empty(), "Argument to {} region without file input", kind_name(last.kind));
            }
            groups.push(RegionAction { kind, paths: Vec::new() });
            continue;
        }
        match groups.last_mut() {
            Some(group) => group.paths.push(PathBuf::from(value)),
            None => bail!("Region file \"{value}\" must follow include or exclude"),
        }
    }
    if let Some(last) = groups.last() {
        ensure!(!last.paths.is_empty(), "Argument to {} region without file input", kind_name(last.kind));
    }
    Ok(groups)
}

fn kind_name(kind: RegionActionKind) -> &'static str {
    match kind {
        RegionActionKind::Include => "include",
        RegionActionKind::Exclude => "exclude",
    }
}

/// Region actions in application order: `--include-region`, `--exclude-region`,
/// then the `--region` groups.
fn region_actions(args: &RunArgs) -> Result<Vec<RegionAction>> {
    let mut actions = Vec::new();
    if !args.include_region.is_empty() {
        actions.push(RegionAction {
            kind: RegionActionKind::Include,
            paths: args.include_region.clone(),
        });
    }
    if !args.exclude_region.is_empty() {
        actions.push(RegionAction {
            kind: RegionActionKind::Exclude,
            paths: args.exclude_region.clone(),
        });
    }
    actions.extend(parse_region_groups(&args.region)?);

    for action in &actions {
        let name = kind_name(action.kind);
        for path in &action.paths {
            ensure!(
                path.exists(),
                "Argument to {name} region using file \"{}\" invalid, file does not exist",
                path.display()
            );
            ensure!(
                OutputFormat::from_path(path).is_some(),
                "Argument to {name} region using file \"{}\" invalid, format \"{}\" is unsupported",
                path.display(),
                path.extension().map(|e| e.to_string_lossy()).unwrap_or_default()
            );
        }
    }
    Ok(actions)
}

fn parse_bbox(values: &[f64]) -> Result<GeoBox> {
    let [west, south, east, north] = values else {
        bail!("Argument --bbox takes four values: WEST SOUTH EAST NORTH");
    };
    let bbox = GeoBox::new(*west, *south, *east, *north);
    ensure!(bbox.is_valid(), "Argument --bbox is empty: {west} {south} {east} {north}");
    Ok(bbox)
}

fn output_format(args: &RunArgs, output: &std::path::Path) -> Result<OutputFormat> {
    match &args.format {
        Some(name) => OutputFormat::parse(name).with_context(|| {
            format!("Supported formats are: {}", supported_formats().join(", "))
        }),
        None => Ok(OutputFormat::from_path(output).unwrap_or(OutputFormat::GeoJson)),
    }
}

/// Builds the run configuration. `prompt_password` is asked for the password when
/// the credentials carry only a user name.
pub fn build_config(
    action: Action,
    args: RunArgs,
    prompt_password: impl FnOnce(&str) -> Result<String>,
) -> Result<DetectionConfig> {
    let action_use = ActionUse::of(action);
    check_list("window-step", action_use.window_step, args.window_step.len(), action_use.cause)?;
    check_list("window-size", action_use.window_size, args.window_size.len(), action_use.cause)?;
    check("nms", action_use.nms, args.nms.is_some(), action_use.cause)?;
    check("pyramid", action_use.pyramid, args.pyramid, action_use.cause)?;
    check("confidence", action_use.confidence, args.confidence.is_some(), action_use.cause)?;
    ensure!(!args.window_size.contains(&0), "Argument --window-size must be greater than zero");
    ensure!(!args.window_step.contains(&0), "Argument --window-step must be greater than zero");
    ensure!(args.resampled_size != Some(0), "Argument --resampled-size must be greater than zero");

    ensure!(
        args.image.is_none() || args.service.is_none(),
        "Arguments --image and --service may not be specified at the same time"
    );
    ensure!(
        args.image.is_some() || args.service.is_some(),
        "Either --image or --service must be specified"
    );
    let source_use = SourceUse::of(args.service);
    let cause = source_use.cause;
    check("image-srs", source_use.image_srs, args.image_srs.is_some(), cause)?;
    check("token", source_use.token, args.token.is_some(), cause)?;
    check("credentials", source_use.credentials, args.credentials.is_some(), cause)?;
    check("map-id", source_use.map_id, args.map_id.is_some(), cause)?;
    check("zoom", source_use.zoom, args.zoom.is_some(), cause)?;
    check("bbox", source_use.bbox, args.bbox.is_some(), cause)?;
    check("max-connections", source_use.max_connections, args.max_connections.is_some(), cause)?;
    check("url", source_use.url, args.url.is_some(), cause)?;
    check("use-tiles", source_use.use_tiles, args.use_tiles, cause)?;

    check("model", ArgUse::Required, args.model.is_some(), "processing")?;
    ensure!(
        args.include_labels.is_empty() || args.exclude_labels.is_empty(),
        "Arguments --include-labels and --exclude-labels may not be specified at the same time"
    );

    let pyramid = action_use.pyramid > ArgUse::Ignored && args.pyramid;
    let mut window_sizes = args.window_size.clone();
    let mut window_steps = args.window_step.clone();
    if pyramid {
        check_list("window-size", ArgUse::MayUseOne, window_sizes.len(), "--pyramid is specified")?;
        check_list("window-step", ArgUse::MayUseOne, window_steps.len(), "--pyramid is specified")?;
        window_sizes.truncate(1);
        window_steps.truncate(1);
    } else if action_use.window_size > ArgUse::MayUseOne || action_use.window_step > ArgUse::MayUseOne {
        ensure!(
            window_sizes.len() < 2 || window_steps.len() < 2 || window_sizes.len() == window_steps.len(),
            "Arguments --window-size and --window-step must match in length"
        );
    }
    if action_use.window_size == ArgUse::MayUseOne {
        window_sizes.truncate(1);
    }
    if action_use.window_step == ArgUse::Ignored {
        window_steps.clear();
    }

    let output = match &args.output {
        Some(output) => output.clone(),
        None => bail!("Argument --output is required when processing"),
    };
    let format = output_format(&args, &output)?;
    let regions = region_actions(&args)?;

    let bbox = match (&args.bbox, source_use.bbox) {
        (Some(values), usage) if usage > ArgUse::Ignored => Some(parse_bbox(values)?),
        _ => None,
    };

    let source = match (args.image, args.service) {
        (Some(path), _) => Source::Image {
            path,
            srs: match args.image_srs {
                Some(ImageSrs::WebMercator) => SpatialReference::WebMercator,
                Some(ImageSrs::Wgs84) | None => SpatialReference::Wgs84,
            },
        },
        (None, Some(service)) => {
            let client = match service {
                ServiceArg::MapsApi => TileClient::MapsApi {
                    map_id: args.map_id.unwrap_or_else(|| DEFAULT_MAP_ID.to_string()),
                    token: args.token.unwrap_or_default(),
                },
                ServiceArg::TileJson => TileClient::TileJson {
                    url: args.url.unwrap_or_default(),
                    use_tiles: args.use_tiles,
                },
                ServiceArg::Xyz => TileClient::Xyz {
                    url: args.url.unwrap_or_default(),
                },
            };
            let credentials = match args.credentials {
                Some(text) if source_use.credentials > ArgUse::Ignored => {
                    Some(complete_credentials(&text, prompt_password)?)
                }
                _ => None,
            };
            Source::Service(WebOptions {
                client,
                credentials,
                zoom: args.zoom.unwrap_or(DEFAULT_ZOOM),
                max_connections: args.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            })
        }
        (None, None) => bail!("Either --image or --service must be specified"),
    };

    let processing = ProcessingOptions {
        model: args.model.unwrap_or_default(),
        window_sizes,
        window_steps,
        resampled_size: args.resampled_size,
        pyramid,
        confidence: match action_use.confidence {
            ArgUse::Ignored => DEFAULT_CONFIDENCE,
            _ => args.confidence.unwrap_or(DEFAULT_CONFIDENCE),
        },
        nms: args.nms.filter(|_| action_use.nms > ArgUse::Ignored),
        include_labels: args.include_labels,
        exclude_labels: args.exclude_labels,
    };

    Ok(DetectionConfig {
        action,
        source,
        bbox,
        output: OutputOptions {
            path: output,
            format,
            layer: args.output_layer,
            geometry_type: match args.geometry_type {
                Some(GeometryArg::Point) => GeometryType::Point,
                Some(GeometryArg::Polygon) | None => GeometryType::Polygon,
            },
            producer_info: args.producer_info,
            append: args.append,
        },
        processing,
        regions,
    })
}

fn complete_credentials(text: &str, prompt_password: impl FnOnce(&str) -> Result<String>) -> Result<Credentials> {
    if let Some(credentials) = Credentials::parse(text) {
        return Ok(credentials);
    }
    let password = prompt_password(text)?;
    Ok(Credentials {
        username: text.to_string(),
        password,
    })
}

/// Asks for the web service password. A terminal gets a prompt without echo; piped
/// input is read as one line.
pub fn prompt_password(username: &str) -> Result<String> {
    let prompt = format!("Enter the web service password for {username}: ");
    if std::io::stdin().is_terminal() {
        return rpassword::prompt_password(prompt).context("Failed to read the password");
    }
    eprint!("{prompt}");
    std::io::stderr().flush()?;
    read_password_line(std::io::stdin().lock())
}

fn read_password_line(mut input: impl BufRead) -> Result<String> {
    let mut line = String::new();
    input.read_line(&mut line).context("Failed to read the password")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
