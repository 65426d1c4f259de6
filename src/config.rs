//! Parameters of a temporal percentile run.
//!
//! Keys are camelCase in JSON and match the operator parameter names, e.g.
//!
//! ```json
//! {
//!   "sourceProductPaths": ["/data/2013/**/*.xml"],
//!   "startDate": "2013-01-01 00:00:00",
//!   "endDate": "2013-12-31 23:59:59",
//!   "sourceBandName": "chl",
//!   "percentiles": [10, 90],
//!   "gapFillingMethod": "gapFillingSplineInterpolation"
//! }
//! ```

use crate::core::crs;
use crate::core::interpolation::GapFillingMethod;
use crate::core::operator::available_memory;
use crate::core::reproject::ResamplingMethod;
use crate::io::product::{BandSource, ALWAYS_VALID_EXPRESSION};
use crate::io::store::MetadataEntry;
use crate::types::{BoundingBox, PercentileError, PercentileResult, TargetGrid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CRS: &str = "EPSG:4326";

/// Date parameters are given as `yyyy-MM-dd HH:mm:ss`, UTC
pub mod date_format {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn parse(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        NaiveDateTime::parse_from_str(value.trim(), FORMAT).map(|naive| Utc.from_utc_datetime(&naive))
    }

    pub fn serialize<S: Serializer>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
        match date {
            Some(date) => serializer.serialize_str(&date.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => parse(s).map(Some).map_err(|e| {
                serde::de::Error::custom(format!("invalid date '{}', expected yyyy-MM-dd HH:mm:ss: {}", s, e))
            }),
        }
    }
}

/// Configuration of a temporal percentile run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TemporalPercentileParams {
    /// Source product path patterns; `**`, `*` and `?` are expanded
    pub source_product_paths: Vec<String>,

    /// Products ending before this date are ignored; also the first day of the series
    #[serde(with = "date_format", skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,

    /// Products starting after this date are ignored; also the last day of the series
    #[serde(with = "date_format", skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,

    pub keep_intermediate_time_series_product: bool,

    /// Where the intermediate time series product is written, the working directory if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_series_output_dir: Option<PathBuf>,

    pub crs: String,

    pub resampling: ResamplingMethod,

    pub west_bound: f64,
    pub north_bound: f64,
    pub east_bound: f64,
    pub south_bound: f64,

    /// Pixel size in CRS units
    pub pixel_size_x: f64,
    pub pixel_size_y: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_band_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub band_maths_expression: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentile_band_name_prefix: Option<String>,

    pub valid_pixel_expression: String,

    pub percentiles: Vec<u8>,

    pub gap_filling_method: GapFillingMethod,

    /// Used for the first day of a pixel series that has no valid sample there
    pub start_value_fallback: f64,

    /// Used for the last day of a pixel series that has no valid sample there
    pub end_value_fallback: f64,

    /// Memory the run may use, checked against the output grid size at start-up.
    /// Defaults to the memory currently available on the machine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,

    /// Edge length of the square output tiles
    pub tile_size: usize,
}

impl Default for TemporalPercentileParams {
    fn default() -> Self {
        Self {
            source_product_paths: Vec::new(),
            start_date: None,
            end_date: None,
            keep_intermediate_time_series_product: true,
            time_series_output_dir: None,
            crs: DEFAULT_CRS.to_string(),
            resampling: ResamplingMethod::Nearest,
            west_bound: -15.0,
            north_bound: 75.0,
            east_bound: 30.0,
            south_bound: 35.0,
            pixel_size_x: 0.05,
            pixel_size_y: 0.05,
            source_band_name: None,
            band_maths_expression: None,
            percentile_band_name_prefix: None,
            valid_pixel_expression: ALWAYS_VALID_EXPRESSION.to_string(),
            percentiles: vec![90],
            gap_filling_method: GapFillingMethod::LinearInterpolation,
            start_value_fallback: 0.0,
            end_value_fallback: 0.0,
            memory_limit_bytes: None,
            tile_size: 512,
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl TemporalPercentileParams {
    pub fn from_json_str(json: &str) -> PercentileResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> PercentileResult<Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PercentileError::Config(format!("Unable to read parameters '{}': {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Reject inconsistent parameters before any product is touched
    pub fn validate(&self) -> PercentileResult<()> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end < start {
                return Err(PercentileError::Config(format!(
                    "End date '{}' before start date '{}'",
                    end.format(date_format::FORMAT),
                    start.format(date_format::FORMAT)
                )));
            }
        }
        if self.source_product_paths.iter().all(|p| p.trim().is_empty()) {
            return Err(PercentileError::Config(
                "The parameter 'sourceProductPaths' must be specified".to_string(),
            ));
        }
        if non_blank(&self.source_band_name).is_some() == non_blank(&self.band_maths_expression).is_some() {
            return Err(PercentileError::Config(
                "Either parameter 'sourceBandName' or 'bandMathsExpression' must be specified.".to_string(),
            ));
        }
        if let Some(dir) = &self.time_series_output_dir {
            if !dir.is_dir() {
                return Err(PercentileError::Config(format!(
                    "The output dir '{}' does not exist.",
                    dir.display()
                )));
            }
        }
        if self.west_bound == self.east_bound {
            return Err(PercentileError::Config(
                "Most western longitude must be different from most eastern longitude.".to_string(),
            ));
        }
        if self.north_bound <= self.south_bound {
            return Err(PercentileError::Config(
                "Most northern latitude must be larger than most southern latitude.".to_string(),
            ));
        }
        if !(self.pixel_size_x > 0.0 && self.pixel_size_y > 0.0) {
            return Err(PercentileError::Config("Pixel sizes must be positive.".to_string()));
        }
        crs::spatial_ref(&self.crs)?;
        if self.percentiles.is_empty() {
            return Err(PercentileError::Config("At least one percentile must be requested.".to_string()));
        }
        if let Some(p) = self.percentiles.iter().find(|&&p| p > 100) {
            return Err(PercentileError::Config(format!("Percentile {} is outside 0..100", p)));
        }
        if self.tile_size == 0 {
            return Err(PercentileError::Config("tileSize must be > 0".to_string()));
        }
        Ok(())
    }

    /// The band or expression feeding the computation
    pub fn band_source(&self) -> PercentileResult<BandSource> {
        match (non_blank(&self.source_band_name), non_blank(&self.band_maths_expression)) {
            (Some(band), None) => Ok(BandSource::Band(band.to_string())),
            (None, Some(expression)) => Ok(BandSource::Expression(expression.to_string())),
            _ => Err(PercentileError::Config(
                "Either parameter 'sourceBandName' or 'bandMathsExpression' must be specified.".to_string(),
            )),
        }
    }

    /// Prefix of the output and time series band names
    pub fn band_name_prefix(&self) -> String {
        if let Some(prefix) = non_blank(&self.percentile_band_name_prefix) {
            return prefix.to_string();
        }
        match (non_blank(&self.source_band_name), non_blank(&self.band_maths_expression)) {
            (Some(band), _) => band.to_string(),
            (None, Some(expression)) => expression.replace(' ', "_"),
            (None, None) => "percentile".to_string(),
        }
    }

    /// The valid pixel expression, unless it accepts every pixel
    pub fn valid_expression(&self) -> Option<&str> {
        crate::io::product::is_effective_valid_expression(Some(&self.valid_pixel_expression))
    }

    /// Configured target area in geographic coordinates
    pub fn target_area(&self) -> BoundingBox {
        BoundingBox::from_diagonal(self.west_bound, self.north_bound, self.east_bound, self.south_bound)
    }

    /// The configured memory limit, or the memory available right now
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit_bytes.unwrap_or_else(available_memory)
    }

    pub fn target_grid(&self) -> PercentileResult<TargetGrid> {
        TargetGrid::from_bounds(&self.crs, &self.target_area(), self.pixel_size_x, self.pixel_size_y)
    }

    /// Metadata describing the band configuration of a run
    pub fn band_configuration_metadata(&self) -> Vec<MetadataEntry> {
        let mut entries = Vec::new();
        let mut push = |key: &str, value: String| {
            entries.push(MetadataEntry {
                key: format!("BandConfiguration/{}", key),
                value,
            })
        };
        if let Some(band) = &self.source_band_name {
            push("sourceBandName", band.clone());
        }
        if let Some(expression) = &self.band_maths_expression {
            push("bandMathsExpression", expression.clone());
        }
        if let Some(prefix) = &self.percentile_band_name_prefix {
            push("percentileBandNamePrefix", prefix.clone());
        }
        push("gapFillingMethod", self.gap_filling_method.to_string());
        push("validPixelExpression", self.valid_pixel_expression.clone());
        push(
            "percentiles",
            self.percentiles.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(","),
        );
        push("endValueFallback", self.end_value_fallback.to_string());
        push("startValueFallback", self.start_value_fallback.to_string());
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TemporalPercentileParams {
        TemporalPercentileParams {
            source_product_paths: vec!["/data/*.xml".to_string()],
            source_band_name: Some("chl".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let p = TemporalPercentileParams::default();
        assert!(p.keep_intermediate_time_series_product);
        assert_eq!(p.percentiles, vec![90]);
        assert_eq!(p.gap_filling_method, GapFillingMethod::LinearInterpolation);
        assert_eq!(p.valid_expression(), None);
        let grid = p.target_grid().unwrap();
        assert_eq!((grid.width, grid.height), (900, 800));
    }

    #[test]
    fn test_json_keys_and_dates() {
        let p = TemporalPercentileParams::from_json_str(
            r#"{
                "sourceProductPaths": ["a/**/*.xml"],
                "startDate": "2013-06-01 00:00:00",
                "endDate": "2013-06-30 23:59:59",
                "bandMathsExpression": "chl * 2",
                "percentiles": [10, 50, 90],
                "gapFillingMethod": "gapFillingQuadraticInterpolation",
                "resampling": "Bilinear"
            }"#,
        )
        .unwrap();
        assert_eq!(p.start_date.unwrap().to_rfc3339(), "2013-06-01T00:00:00+00:00");
        assert_eq!(p.gap_filling_method, GapFillingMethod::QuadraticInterpolation);
        assert_eq!(p.resampling, ResamplingMethod::Bilinear);
        assert_eq!(p.band_source().unwrap(), BandSource::Expression("chl * 2".to_string()));
        assert_eq!(p.band_name_prefix(), "chl_*_2");
        assert!(p.validate().is_ok());

        let bad = TemporalPercentileParams::from_json_str(r#"{"startDate": "2013-06-01"}"#);
        assert!(matches!(bad, Err(PercentileError::Json(_))));
    }

    #[test]
    fn test_validation_rules() {
        assert!(params().validate().is_ok());

        let mut p = params();
        p.start_date = Some(date_format::parse("2013-06-02 00:00:00").unwrap());
        p.end_date = Some(date_format::parse("2013-06-01 00:00:00").unwrap());
        assert!(p.validate().is_err());

        let mut p = params();
        p.source_product_paths.clear();
        assert!(p.validate().is_err());

        let mut p = params();
        p.band_maths_expression = Some("chl + 1".to_string());
        assert!(p.validate().is_err());

        let mut p = params();
        p.source_band_name = None;
        assert!(p.validate().is_err());

        let mut p = params();
        p.east_bound = p.west_bound;
        assert!(p.validate().is_err());

        let mut p = params();
        p.south_bound = p.north_bound;
        assert!(p.validate().is_err());

        let mut p = params();
        p.time_series_output_dir = Some(PathBuf::from("/definitely/not/here"));
        assert!(p.validate().is_err());

        let mut p = params();
        p.percentiles = vec![50, 101];
        assert!(p.validate().is_err());

        let mut p = params();
        p.crs = "EPSG:no-such-code".to_string();
        assert!(matches!(p.validate(), Err(PercentileError::Config(_))));
    }

    #[test]
    fn test_crs_definitions() {
        let mut p = params();
        p.crs = "EPSG:32633".to_string();
        assert!(p.validate().is_ok());
        p.crs = "+proj=utm +zone=33 +datum=WGS84 +units=m +no_defs".to_string();
        assert!(p.validate().is_ok());

        p.crs = "EPSG:3857".to_string();
        p.pixel_size_x = 10_000.0;
        p.pixel_size_y = 10_000.0;
        let grid = p.target_grid().unwrap();
        assert_eq!(grid.crs, "EPSG:3857");
        assert!(!grid.is_geographic());
        assert_eq!(grid.area(), p.target_area());
    }

    #[test]
    fn test_memory_limit_override() {
        let mut p = params();
        assert_eq!(p.memory_limit_bytes, None);
        assert!(p.memory_limit() > 0);
        p.memory_limit_bytes = Some(1024);
        assert_eq!(p.memory_limit(), 1024);

        let json = r#"{"sourceProductPaths": ["a.xml"], "sourceBandName": "chl", "memoryLimitBytes": 2048}"#;
        let parsed = TemporalPercentileParams::from_json_str(json).unwrap();
        assert_eq!(parsed.memory_limit(), 2048);
    }

    #[test]
    fn test_prefix_and_band_configuration() {
        let mut p = params();
        assert_eq!(p.band_name_prefix(), "chl");
        p.percentile_band_name_prefix = Some("CHL".to_string());
        assert_eq!(p.band_name_prefix(), "CHL");

        let metadata = p.band_configuration_metadata();
        let value = |key: &str| {
            metadata
                .iter()
                .find(|m| m.key == format!("BandConfiguration/{}", key))
                .map(|m| m.value.clone())
        };
        assert_eq!(value("sourceBandName").as_deref(), Some("chl"));
        assert_eq!(value("gapFillingMethod").as_deref(), Some("gapFillingLinearInterpolation"));
        assert_eq!(value("percentiles").as_deref(), Some("90"));
        assert_eq!(value("bandMathsExpression"), None);
    }
}
