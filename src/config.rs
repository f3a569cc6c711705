//! Experiment configuration.
//!
//! A [`Config`] is assembled from three files in a configuration directory:
//!
//! - `Experiment.json` (required): acquisition metadata with 1-based indexes
//! - `processingOptions.json` (optional): processing settings merged on top
//! - `channelNames.txt` (required): one channel name per non-blank line
//!
//! The layers are merged key by key (later layers win), the merged document is
//! interpreted according to a schema version, and every invariant is checked
//! before a `Config` is handed out. All coordinates exposed by `Config` are
//! 0-based.

use crate::error::ConfigError;
use crate::index::{tiling_by_name, TileDims, TilingStrategy, WorkUnit};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const EXPERIMENT_CONFIG_FILE: &str = "Experiment.json";
pub const PROCESSING_OPTIONS_FILE: &str = "processingOptions.json";
pub const CHANNEL_NAMES_FILE: &str = "channelNames.txt";

/// Key under which the channel-name list is merged into the document.
const ALL_CHANNEL_NAMES_KEY: &str = "all_channel_names";

/// Schema version used when the caller does not pick one.
pub const DEFAULT_SCHEMA_VERSION: SchemaVersion = SchemaVersion::V0_1;

/// Supported configuration schema versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    #[serde(rename = "v0.1")]
    V0_1,
}

impl SchemaVersion {
    pub const ALL: &'static [SchemaVersion] = &[SchemaVersion::V0_1];

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::V0_1 => "v0.1",
        }
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        DEFAULT_SCHEMA_VERSION
    }
}

impl FromStr for SchemaVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SchemaVersion::ALL
            .iter()
            .copied()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| {
                ConfigError::UnsupportedVersion(
                    s.to_string(),
                    SchemaVersion::ALL.iter().map(|v| v.as_str().to_string()).collect(),
                )
            })
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 0-based (cycle, channel) coordinate of one acquired image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelCoordinate {
    pub cycle: usize,
    pub channel: usize,
}

/// Channels and free-form parameters used for segmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CytometryReference {
    pub nuclei: ChannelCoordinate,
    pub membrane: Option<ChannelCoordinate>,
    pub params: Option<Value>,
}

/// Optics of the acquiring microscope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroscopeParams {
    pub magnification: f64,
    pub numerical_aperture: f64,
    /// Axial resolution (z pitch) in nanometers
    pub res_axial_nm: f64,
    /// Lateral resolution per pixel in nanometers
    pub res_lateral_nm: f64,
    pub objective_type: String,
    pub emission_wavelengths_nm: Vec<f64>,
}

/// Validated experiment configuration.
#[derive(Debug, Clone)]
pub struct Config {
    version: SchemaVersion,
    channel_names: Vec<String>,
    n_cycles: usize,
    n_z_planes: usize,
    n_channels_per_cycle: usize,
    tile_width: usize,
    tile_height: usize,
    overlap_x: usize,
    overlap_y: usize,
    region_width: usize,
    region_height: usize,
    tiling_mode: String,
    tiling: &'static dyn TilingStrategy,
    region_indexes: Vec<usize>,
    drift_compensation_reference: ChannelCoordinate,
    best_focus_reference: ChannelCoordinate,
    cytometry_reference: CytometryReference,
    microscope_params: MicroscopeParams,
    document: Map<String, Value>,
}

/// Load the configuration in `config_dir` using the default schema version.
pub fn load(config_dir: &Path) -> Result<Config, ConfigError> {
    load_with(config_dir, DEFAULT_SCHEMA_VERSION, None)
}

/// Load the configuration in `config_dir`.
///
/// `overrides` are merged last and replace any key set by the files.
pub fn load_with(
    config_dir: &Path,
    version: SchemaVersion,
    overrides: Option<&Map<String, Value>>,
) -> Result<Config, ConfigError> {
    let mut document = read_json_object(&config_dir.join(EXPERIMENT_CONFIG_FILE), true)?;
    document.extend(read_json_object(&config_dir.join(PROCESSING_OPTIONS_FILE), false)?);

    let channel_names = read_channel_names(&config_dir.join(CHANNEL_NAMES_FILE))?;
    document.insert(
        ALL_CHANNEL_NAMES_KEY.to_string(),
        Value::Array(channel_names.into_iter().map(Value::String).collect()),
    );

    if let Some(overrides) = overrides {
        document.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    let config = Config::from_document(document, version)?;
    tracing::debug!("Loaded configuration from {}: {}", config_dir.display(), config);
    Ok(config)
}

fn read_json_object(path: &Path, required: bool) -> Result<Map<String, Value>, ConfigError> {
    if !path.exists() {
        if required {
            return Err(ConfigError::MissingConfig {
                path: path.to_path_buf(),
            });
        }
        tracing::debug!("Optional configuration file {} not found", path.display());
        return Ok(Map::new());
    }

    let contents = read_file(path)?;
    let value: Value = serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(ConfigError::validation(
            file_label(path),
            format!("expected a JSON object at the top level, found {other}"),
        )),
    }
}

fn read_channel_names(path: &Path) -> Result<Vec<String>, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::MissingConfig {
            path: path.to_path_buf(),
        });
    }
    Ok(read_file(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Merged document as understood by schema v0.1.
///
/// 1-based index fields stay raw JSON so that they can be checked with the
/// field name in the error.
#[derive(Debug, Deserialize)]
struct DocumentV0_1 {
    all_channel_names: Vec<String>,
    num_cycles: usize,
    num_z_planes: usize,
    /// Channel names of a single cycle
    channel_names: Vec<String>,
    tile_width: usize,
    tile_height: usize,
    #[serde(rename = "tile_overlap_X")]
    overlap_x: usize,
    #[serde(rename = "tile_overlap_Y")]
    overlap_y: usize,
    region_width: usize,
    region_height: usize,
    tiling_mode: String,
    #[serde(rename = "regIdx")]
    region_indexes: Vec<Value>,
    #[serde(rename = "driftCompReferenceCycle")]
    drift_comp_reference_cycle: Value,
    drift_comp_channel: Value,
    #[serde(rename = "bestFocusReferenceCycle")]
    best_focus_reference_cycle: Value,
    best_focus_channel: Value,
    cytometry_nuclei_channel_name: String,
    #[serde(default)]
    cytometry_membrane_channel_name: Option<String>,
    #[serde(default)]
    cytometry_params: Option<Value>,
    magnification: f64,
    numerical_aperture: f64,
    z_pitch: f64,
    #[serde(rename = "per_pixel_XY_resolution")]
    per_pixel_xy_resolution: f64,
    #[serde(rename = "objectiveType")]
    objective_type: String,
    emission_wavelengths: Vec<f64>,
}

/// Drop repeated indexes, keeping the first occurrence of each.
fn first_seen(indexes: impl IntoIterator<Item = usize>) -> Vec<usize> {
    let mut seen = BTreeSet::new();
    indexes.into_iter().filter(|&i| seen.insert(i)).collect()
}

/// Convert a 1-based index to 0-based, rejecting anything but integers > 0.
fn one_based_index(field: &str, value: &Value) -> Result<usize, ConfigError> {
    match value.as_u64() {
        Some(v) if v > 0 => Ok(v as usize - 1),
        _ => Err(ConfigError::validation(
            field,
            format!("expected 1-based index to be an integer > 0 but found value {value}"),
        )),
    }
}

impl Config {
    /// Interpret and validate a merged configuration document.
    pub fn from_document(
        document: Map<String, Value>,
        version: SchemaVersion,
    ) -> Result<Self, ConfigError> {
        match version {
            SchemaVersion::V0_1 => Self::from_v0_1(document),
        }
    }

    fn from_v0_1(document: Map<String, Value>) -> Result<Self, ConfigError> {
        let doc: DocumentV0_1 = serde_json::from_value(Value::Object(document.clone()))
            .map_err(|e| ConfigError::validation("<document>", e.to_string()))?;

        for (field, value) in [
            ("num_cycles", doc.num_cycles),
            ("num_z_planes", doc.num_z_planes),
            ("tile_width", doc.tile_width),
            ("tile_height", doc.tile_height),
        ] {
            if value == 0 {
                return Err(ConfigError::validation(field, "expected an integer > 0 but found 0"));
            }
        }
        if doc.region_width.checked_mul(doc.region_height).is_none() {
            return Err(ConfigError::validation(
                "region_width",
                format!(
                    "region grid {}x{} has more tiles than can be indexed",
                    doc.region_width, doc.region_height
                ),
            ));
        }

        let n_channels_per_cycle = doc.channel_names.len();
        let n_expected = doc
            .num_cycles
            .checked_mul(n_channels_per_cycle)
            .ok_or_else(|| {
                ConfigError::validation(
                    "num_cycles",
                    format!(
                        "num_cycles * n_channels_per_cycle overflows ({} * {})",
                        doc.num_cycles, n_channels_per_cycle
                    ),
                )
            })?;
        if doc.all_channel_names.len() != n_expected {
            return Err(ConfigError::validation(
                ALL_CHANNEL_NAMES_KEY,
                format!(
                    "full list of channel names does not have length equal to \
                     num_cycles * n_channels_per_cycle; n expected channel names = {}, \
                     n actual channel names = {}",
                    n_expected,
                    doc.all_channel_names.len()
                ),
            ));
        }

        let drift_compensation_reference = ChannelCoordinate {
            cycle: one_based_index("driftCompReferenceCycle", &doc.drift_comp_reference_cycle)?,
            channel: one_based_index("drift_comp_channel", &doc.drift_comp_channel)?,
        };
        let best_focus_reference = ChannelCoordinate {
            cycle: one_based_index("bestFocusReferenceCycle", &doc.best_focus_reference_cycle)?,
            channel: one_based_index("best_focus_channel", &doc.best_focus_channel)?,
        };
        let region_indexes = doc
            .region_indexes
            .iter()
            .map(|v| one_based_index("regIdx", v))
            .collect::<Result<Vec<_>, _>>()?;

        let tiling = tiling_by_name(&doc.tiling_mode)?;

        let dims = TileDims {
            cycles: doc.num_cycles,
            z: doc.num_z_planes,
            channels: n_channels_per_cycle,
            height: doc.tile_height,
            width: doc.tile_width,
        };
        if dims.checked_size_bytes().is_none() {
            return Err(ConfigError::validation(
                "tile_width",
                format!("tile of shape {:?} is too large to address", dims.shape()),
            ));
        }

        let mut config = Config {
            version: SchemaVersion::V0_1,
            channel_names: doc.all_channel_names,
            n_cycles: doc.num_cycles,
            n_z_planes: doc.num_z_planes,
            n_channels_per_cycle,
            tile_width: doc.tile_width,
            tile_height: doc.tile_height,
            overlap_x: doc.overlap_x,
            overlap_y: doc.overlap_y,
            region_width: doc.region_width,
            region_height: doc.region_height,
            tiling_mode: doc.tiling_mode,
            tiling,
            region_indexes,
            drift_compensation_reference,
            best_focus_reference,
            // Resolved below once channel lookups are available.
            cytometry_reference: CytometryReference {
                nuclei: ChannelCoordinate { cycle: 0, channel: 0 },
                membrane: None,
                params: None,
            },
            microscope_params: MicroscopeParams {
                magnification: doc.magnification,
                numerical_aperture: doc.numerical_aperture,
                res_axial_nm: doc.z_pitch,
                res_lateral_nm: doc.per_pixel_xy_resolution,
                objective_type: doc.objective_type,
                emission_wavelengths_nm: doc.emission_wavelengths,
            },
            document,
        };

        let nuclei = config.get_channel_coordinates(&doc.cytometry_nuclei_channel_name)?;
        let membrane = doc
            .cytometry_membrane_channel_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .map(|name| config.get_channel_coordinates(name))
            .transpose()?;
        config.cytometry_reference = CytometryReference {
            nuclei,
            membrane,
            params: doc.cytometry_params,
        };

        Ok(config)
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Every channel name, in acquisition order.
    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    pub fn n_cycles(&self) -> usize {
        self.n_cycles
    }

    pub fn n_z_planes(&self) -> usize {
        self.n_z_planes
    }

    pub fn n_channels_per_cycle(&self) -> usize {
        self.n_channels_per_cycle
    }

    pub fn tile_width(&self) -> usize {
        self.tile_width
    }

    pub fn tile_height(&self) -> usize {
        self.tile_height
    }

    pub fn overlap_x(&self) -> usize {
        self.overlap_x
    }

    pub fn overlap_y(&self) -> usize {
        self.overlap_y
    }

    pub fn region_width(&self) -> usize {
        self.region_width
    }

    pub fn region_height(&self) -> usize {
        self.region_height
    }

    pub fn tiling_mode(&self) -> &str {
        &self.tiling_mode
    }

    /// 0-based region indexes configured for the experiment.
    pub fn region_indexes(&self) -> &[usize] {
        &self.region_indexes
    }

    pub fn n_tiles_per_region(&self) -> usize {
        self.region_width * self.region_height
    }

    /// Raw tile shape as (cycles, z, channels, height, width).
    pub fn tile_dims(&self) -> TileDims {
        TileDims {
            cycles: self.n_cycles,
            z: self.n_z_planes,
            channels: self.n_channels_per_cycle,
            height: self.tile_height,
            width: self.tile_width,
        }
    }

    pub fn drift_compensation_reference(&self) -> ChannelCoordinate {
        self.drift_compensation_reference
    }

    pub fn best_focus_reference(&self) -> ChannelCoordinate {
        self.best_focus_reference
    }

    pub fn cytometry_reference(&self) -> &CytometryReference {
        &self.cytometry_reference
    }

    pub fn microscope_params(&self) -> &MicroscopeParams {
        &self.microscope_params
    }

    /// Merged source document, as read from disk plus overrides.
    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    /// 0-based (x, y) of a tile within its region.
    pub fn get_tile_coordinates(&self, tile_index: usize) -> Result<(usize, usize), ConfigError> {
        if tile_index >= self.n_tiles_per_region() {
            return Err(ConfigError::Range {
                index: tile_index,
                n_tiles: self.n_tiles_per_region(),
                width: self.region_width,
                height: self.region_height,
            });
        }
        Ok(self
            .tiling
            .coordinates_from_index(tile_index, self.region_width, self.region_height))
    }

    /// Work units for every tile of every configured region.
    ///
    /// Ordered region-major, then by tile index. A region listed more than
    /// once contributes its tiles only once.
    pub fn get_tile_indices(&self) -> Vec<WorkUnit> {
        first_seen(self.region_indexes.iter().copied())
            .into_iter()
            .flat_map(|region_index| {
                (0..self.n_tiles_per_region()).map(move |tile_index| {
                    let (tile_x, tile_y) = self.tiling.coordinates_from_index(
                        tile_index,
                        self.region_width,
                        self.region_height,
                    );
                    WorkUnit {
                        region_index,
                        tile_index,
                        tile_x,
                        tile_y,
                    }
                })
            })
            .collect()
    }

    /// Work units for a run-level selection of 1-based region and tile indexes.
    ///
    /// `None` selects the configured regions or every tile of a region.
    /// Repeated indexes are dropped, keeping the first occurrence, so each
    /// unit appears once.
    pub fn work_units(
        &self,
        regions: Option<&[i64]>,
        tiles: Option<&[i64]>,
    ) -> Result<Vec<WorkUnit>, ConfigError> {
        let regions = match regions {
            Some(values) => values
                .iter()
                .map(|&v| one_based_index("region_indexes", &Value::from(v)))
                .collect::<Result<Vec<_>, _>>()?,
            None => self.region_indexes.clone(),
        };
        let tiles = match tiles {
            Some(values) => values
                .iter()
                .map(|&v| one_based_index("tile_indexes", &Value::from(v)))
                .collect::<Result<Vec<_>, _>>()?,
            None => (0..self.n_tiles_per_region()).collect(),
        };
        let regions = first_seen(regions);
        let tiles = first_seen(tiles);

        let mut units = Vec::with_capacity(regions.len() * tiles.len());
        for &region_index in &regions {
            for &tile_index in &tiles {
                let (tile_x, tile_y) = self.get_tile_coordinates(tile_index)?;
                units.push(WorkUnit {
                    region_index,
                    tile_index,
                    tile_x,
                    tile_y,
                });
            }
        }
        Ok(units)
    }

    /// 0-based (cycle, channel) of a channel name.
    ///
    /// The cycle is the list position divided by the number of cycles and the
    /// channel is the remainder.
    pub fn get_channel_coordinates(&self, name: &str) -> Result<ChannelCoordinate, ConfigError> {
        let position = self
            .channel_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| ConfigError::Lookup {
                name: name.to_string(),
                available: self.channel_names.clone(),
            })?;
        Ok(ChannelCoordinate {
            cycle: position / self.n_cycles,
            channel: position % self.n_cycles,
        })
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "schema {}, {} cycles x {} channels, {} z planes, tile {}x{} (overlap {}x{}), \
             region grid {}x{} ({}), regions {:?}",
            self.version,
            self.n_cycles,
            self.n_channels_per_cycle,
            self.n_z_planes,
            self.tile_width,
            self.tile_height,
            self.overlap_x,
            self.overlap_y,
            self.region_width,
            self.region_height,
            self.tiling_mode,
            self.region_indexes,
        )
    }
}
