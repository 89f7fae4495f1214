// THEORY:
// `FileFeatureSet` is the vector I/O layer: it reads region files (filters) and
// writes detection layers. Two file formats are supported, both built on
// serde_json:
//
// - `geojson`: a single `FeatureCollection` per file, named after the layer.
// - `geojsonseq`: newline-delimited GeoJSON features, one per line.
//
// Writing is buffered. A `Layer` collects features and flushes them to disk in
// batches; closing the layer (or dropping it) flushes what is left and writes
// the closing bracket of a FeatureCollection. Appending to an existing GeoJSON
// file re-emits its features ahead of the new ones, appending to a sequence file
// simply opens it for append.
//
// Both formats hold exactly one layer, so the layer name is informational for
// `geojson` (stored in the `name` member) and implied by the file stem for
// `geojsonseq`.

use crate::core_modules::feature::{
    Feature, FieldDefinition, FieldType, FieldValue, Fields, Field, Geometry, GeometryType,
};
use crate::core_modules::geometry::{Point2, Polygon};
use crate::core_modules::transform::SpatialReference;
use crate::error::{Error, Result};
use serde_json::{Map, Value, json};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Number of buffered features that triggers a write.
const FLUSH_THRESHOLD: usize = 256;
const LOCAL_CRS_NAME: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    GeoJson,
    GeoJsonSeq,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 2] = [OutputFormat::GeoJson, OutputFormat::GeoJsonSeq];

    pub fn parse(name: &str) -> Result<Self> {
        let lower = name.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.name() == lower)
            .ok_or_else(|| Error::invalid(format!("Invalid output format: {name}.")))
    }

    pub const fn name(&self) -> &'static str {
        match self {
            OutputFormat::GeoJson => "geojson",
            OutputFormat::GeoJsonSeq => "geojsonseq",
        }
    }

    pub const fn extensions(&self) -> &'static [&'static str] {
        match self {
            OutputFormat::GeoJson => &["geojson", "json"],
            OutputFormat::GeoJsonSeq => &["geojsons", "geojsonl", "geojsonseq"],
        }
    }

    /// Format implied by a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.extensions().contains(&ext.as_str()))
    }
}

/// Names accepted by `--format`.
pub fn supported_formats() -> Vec<&'static str> {
    OutputFormat::ALL.iter().map(OutputFormat::name).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOpenMode {
    Read,
    Overwrite,
    Append,
}

/// A layer as read from disk.
#[derive(Debug, Clone)]
pub struct LayerContents {
    pub name: String,
    pub spatial_reference: SpatialReference,
    pub features: Vec<Feature>,
    /// Features as stored, re-emitted verbatim when appending to a FeatureCollection.
    raw: Vec<Value>,
}

impl LayerContents {
    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }
}

pub struct FileFeatureSet {
    path: PathBuf,
    format: OutputFormat,
    mode: VectorOpenMode,
    layers: Vec<LayerContents>,
}

impl FileFeatureSet {
    pub fn open(path: impl AsRef<Path>, format: OutputFormat, mode: VectorOpenMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let layers = match mode {
            VectorOpenMode::Read => read_layers(&path, format)?,
            VectorOpenMode::Append if path.exists() => read_layers(&path, format)?,
            _ => Vec::new(),
        };
        Ok(Self { path, format, mode, layers })
    }

    /// Opens a file for reading, guessing the format from its extension.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = OutputFormat::from_path(path).ok_or_else(|| {
            Error::Vector(format!("unsupported vector file extension: {}", path.display()))
        })?;
        Self::open(path, format, VectorOpenMode::Read)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layers(&self) -> &[LayerContents] {
        &self.layers
    }

    pub fn has_layer(&self, name: &str) -> bool {
        self.find_layer(name).is_some()
    }

    /// Sequence files hold one unnamed layer, which answers to any name.
    fn find_layer(&self, name: &str) -> Option<&LayerContents> {
        match self.format {
            OutputFormat::GeoJson => self.layers.iter().find(|layer| layer.name == name),
            OutputFormat::GeoJsonSeq => self.layers.first(),
        }
    }

    /// Opens an existing layer for appending. New features are written with `definitions`.
    pub fn layer(&self, name: &str, definitions: Vec<FieldDefinition>) -> Result<Layer> {
        if self.mode != VectorOpenMode::Append {
            return Err(Error::Vector("layers can only be reopened in append mode".to_string()));
        }
        let existing = self
            .find_layer(name)
            .ok_or_else(|| Error::Vector(format!("layer {name} does not exist")))?;
        let geometry_type = existing
            .features
            .first()
            .map(Feature::geometry_type)
            .unwrap_or(GeometryType::Unknown);
        Layer::start(
            &self.path,
            self.format,
            name,
            existing.spatial_reference,
            geometry_type,
            definitions,
            existing.raw.clone(),
            true,
        )
    }

    /// Creates a new layer, replacing the file unless it is opened for append.
    pub fn create_layer(
        &self,
        name: &str,
        spatial_reference: SpatialReference,
        geometry_type: GeometryType,
        definitions: Vec<FieldDefinition>,
    ) -> Result<Layer> {
        match self.mode {
            VectorOpenMode::Read => {
                Err(Error::Vector("cannot create a layer in a file opened for reading".to_string()))
            }
            VectorOpenMode::Append if !self.layers.is_empty() => Err(Error::Vector(format!(
                "{} already holds layer {}; {} files hold a single layer",
                self.path.display(),
                self.layers[0].name,
                self.format.name()
            ))),
            _ => Layer::start(
                &self.path,
                self.format,
                name,
                spatial_reference,
                geometry_type,
                definitions,
                Vec::new(),
                false,
            ),
        }
    }
}

/// A layer being written.
pub struct Layer {
    name: String,
    geometry_type: GeometryType,
    definitions: Vec<FieldDefinition>,
    format: OutputFormat,
    writer: Option<BufWriter<File>>,
    pending: Vec<Value>,
    written: usize,
}

impl Layer {
    #[allow(clippy::too_many_arguments)]
    fn start(
        path: &Path,
        format: OutputFormat,
        name: &str,
        spatial_reference: SpatialReference,
        geometry_type: GeometryType,
        definitions: Vec<FieldDefinition>,
        prior: Vec<Value>,
        append: bool,
    ) -> Result<Layer> {
        let mut layer = Layer {
            name: name.to_string(),
            geometry_type,
            definitions,
            format,
            writer: None,
            pending: Vec::new(),
            written: 0,
        };
        match format {
            OutputFormat::GeoJson => {
                let mut writer = BufWriter::new(File::create(path)?);
                let mut header = Map::new();
                header.insert("type".to_string(), json!("FeatureCollection"));
                header.insert("name".to_string(), json!(name));
                if spatial_reference.is_local() {
                    header.insert(
                        "crs".to_string(),
                        json!({"type": "name", "properties": {"name": LOCAL_CRS_NAME}}),
                    );
                }
                let header = serde_json::to_string(&Value::Object(header))?;
                // Reopen the object to stream the features member.
                write!(writer, "{},\"features\":[", &header[..header.len() - 1])?;
                layer.writer = Some(writer);
                layer.pending = prior;
                layer.flush()?;
            }
            OutputFormat::GeoJsonSeq => {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(append)
                    .truncate(!append)
                    .open(path)?;
                layer.writer = Some(BufWriter::new(file));
            }
        }
        debug!(layer = name, format = format.name(), "layer opened");
        Ok(layer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry_type(&self) -> GeometryType {
        self.geometry_type
    }

    pub fn definitions(&self) -> &[FieldDefinition] {
        &self.definitions
    }

    /// Features written so far, including flushed and pending ones.
    pub fn len(&self) -> usize {
        self.written + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_feature(&mut self, feature: Feature) -> Result<()> {
        if self.geometry_type != GeometryType::Unknown && feature.geometry_type() != self.geometry_type {
            return Err(Error::Vector(format!(
                "layer {} holds {} geometries, got a {}",
                self.name,
                self.geometry_type,
                feature.geometry_type()
            )));
        }
        self.pending.push(feature_to_json(&feature, &self.definitions)?);
        if self.pending.len() >= FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(Error::Vector(format!("layer {} is already closed", self.name)));
        };
        for value in self.pending.drain(..) {
            match self.format {
                OutputFormat::GeoJson => {
                    if self.written > 0 {
                        writer.write_all(b",")?;
                    }
                    writer.write_all(b"\n")?;
                    serde_json::to_writer(&mut *writer, &value)?;
                }
                OutputFormat::GeoJsonSeq => {
                    serde_json::to_writer(&mut *writer, &value)?;
                    writer.write_all(b"\n")?;
                }
            }
            self.written += 1;
        }
        writer.flush()?;
        Ok(())
    }

    /// Flushes pending features and finishes the file.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.writer.is_none() {
            return Ok(());
        }
        self.flush()?;
        if let Some(mut writer) = self.writer.take() {
            if self.format == OutputFormat::GeoJson {
                writer.write_all(b"\n]}\n")?;
            }
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for Layer {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(layer = %self.name, error = %e, "failed to finish layer");
        }
    }
}

fn truncate_chars(value: &str, width: usize) -> &str {
    if width == 0 {
        return value;
    }
    match value.char_indices().nth(width) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

fn field_to_json(field: &Field, definition: &FieldDefinition) -> Result<Value> {
    if field.value != FieldValue::Null && field.field_type != definition.field_type {
        return Err(Error::Vector(format!(
            "field {} is declared as {} but the value is {}",
            definition.name, definition.field_type, field.field_type
        )));
    }
    Ok(match &field.value {
        FieldValue::Null => Value::Null,
        FieldValue::Integer(v) => json!(v),
        FieldValue::Real(v) => serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number),
        FieldValue::String(v) => json!(truncate_chars(v, definition.width)),
        FieldValue::Date(v) => json!(v.format("%Y-%m-%d").to_string()),
        FieldValue::Time(v) => json!(v.format("%H:%M:%S").to_string()),
    })
}

fn ring_to_json(polygon: &Polygon) -> Value {
    let mut ring: Vec<Value> = polygon.exterior.iter().map(|p| json!([p.x, p.y])).collect();
    if let Some(first) = polygon.exterior.first() {
        ring.push(json!([first.x, first.y]));
    }
    Value::Array(ring)
}

fn geometry_to_json(geometry: &Geometry) -> Value {
    match geometry {
        Geometry::Point(p) => json!({"type": "Point", "coordinates": [p.x, p.y]}),
        Geometry::Polygon(polygon) => {
            json!({"type": "Polygon", "coordinates": [ring_to_json(polygon)]})
        }
    }
}

/// Serialises a feature; only fields with a definition are written.
pub fn feature_to_json(feature: &Feature, definitions: &[FieldDefinition]) -> Result<Value> {
    let mut properties = Map::new();
    for definition in definitions {
        let value = match feature.fields.get(&definition.name) {
            Some(field) => field_to_json(field, definition)?,
            None => Value::Null,
        };
        properties.insert(definition.name.clone(), value);
    }
    Ok(json!({
        "type": "Feature",
        "geometry": geometry_to_json(&feature.geometry),
        "properties": Value::Object(properties),
    }))
}

fn read_layers(path: &Path, format: OutputFormat) -> Result<Vec<LayerContents>> {
    let text = std::fs::read_to_string(path)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match format {
        OutputFormat::GeoJson => {
            let root: Value = serde_json::from_str(&text)?;
            let name = root
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(stem);
            let spatial_reference = if is_local_crs(&root) {
                SpatialReference::Local
            } else {
                SpatialReference::Wgs84
            };
            let raw = match root.get("type").and_then(Value::as_str) {
                Some("FeatureCollection") => root
                    .get("features")
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| Error::Vector("FeatureCollection without features".to_string()))?,
                _ => vec![root],
            };
            let mut features = Vec::with_capacity(raw.len());
            for member in &raw {
                features.extend(parse_feature(member)?);
            }
            Ok(vec![LayerContents { name, spatial_reference, features, raw }])
        }
        OutputFormat::GeoJsonSeq => {
            let mut features = Vec::new();
            for line in text.lines() {
                let line = line.trim_start_matches('\u{1e}').trim();
                if line.is_empty() {
                    continue;
                }
                features.extend(parse_feature(&serde_json::from_str(line)?)?);
            }
            Ok(vec![LayerContents {
                name: stem,
                spatial_reference: SpatialReference::Wgs84,
                features,
                raw: Vec::new(),
            }])
        }
    }
}

fn is_local_crs(root: &Value) -> bool {
    root.pointer("/crs/properties/name").and_then(Value::as_str) == Some(LOCAL_CRS_NAME)
}

/// Parses a Feature or a bare geometry. Multi-polygons expand into one feature per polygon.
fn parse_feature(value: &Value) -> Result<Vec<Feature>> {
    let (geometry, fields) = match value.get("type").and_then(Value::as_str) {
        Some("Feature") => (
            value.get("geometry").unwrap_or(&Value::Null),
            parse_properties(value.get("properties")),
        ),
        _ => (value, Fields::new()),
    };
    Ok(parse_geometry(geometry)?
        .into_iter()
        .map(|geometry| Feature::new(geometry, fields.clone()))
        .collect())
}

fn parse_properties(properties: Option<&Value>) -> Fields {
    let mut fields = Fields::new();
    let Some(Value::Object(map)) = properties else {
        return fields;
    };
    for (name, value) in map {
        let field = match value {
            Value::Null => Field::null(FieldType::Unknown),
            Value::Bool(b) => Field::integer(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Field::integer(i),
                None => Field::real(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Field::string(s.clone()),
            _ => continue,
        };
        fields.insert(name.clone(), field);
    }
    fields
}

fn parse_position(value: &Value) -> Result<Point2> {
    match value.as_array().map(Vec::as_slice) {
        Some([x, y, ..]) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => Ok(Point2::new(x, y)),
            _ => Err(Error::Vector(format!("invalid coordinate: {value}"))),
        },
        _ => Err(Error::Vector(format!("invalid coordinate: {value}"))),
    }
}

fn parse_polygon(value: &Value) -> Result<Polygon> {
    let ring = value
        .as_array()
        .and_then(|rings| rings.first())
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Vector("polygon without an exterior ring".to_string()))?;
    Ok(Polygon::new(ring.iter().map(parse_position).collect::<Result<Vec<_>>>()?))
}

fn parse_geometry(value: &Value) -> Result<Vec<Geometry>> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Vector("geometry without a type".to_string()))?;
    let coordinates = value.get("coordinates").unwrap_or(&Value::Null);
    match kind {
        "Point" => Ok(vec![Geometry::Point(parse_position(coordinates)?)]),
        "Polygon" => Ok(vec![Geometry::Polygon(parse_polygon(coordinates)?)]),
        "MultiPolygon" => coordinates
            .as_array()
            .ok_or_else(|| Error::Vector("invalid MultiPolygon".to_string()))?
            .iter()
            .map(|polygon| parse_polygon(polygon).map(Geometry::Polygon))
            .collect(),
        other => Err(Error::Vector(format!("unsupported geometry type {other}"))),
    }
}
