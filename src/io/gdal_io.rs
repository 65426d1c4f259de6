//! GDAL backed source products and GeoTIFF output.
//!
//! Source bands are exposed as `band_1`, `band_2`, ... and the acquisition time
//! range is taken from the `start_time` / `end_time` metadata items (RFC 3339).

use crate::core::crs;
use crate::io::product::{BandInfo, BandSource, ProductReader, RasterProduct, ALWAYS_VALID_EXPRESSION};
use crate::io::sink::{OutputLayout, PercentileSink, PercentileTile, VALUES_COUNT_BAND_NAME};
use crate::types::{GeoCoding, GeoTransform, PercentileError, PercentileResult, RasterBuffer, Window};
use chrono::{DateTime, Utc};
use gdal::raster::Buffer;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use std::path::{Path, PathBuf};

const START_TIME_ITEM: &str = "start_time";
const END_TIME_ITEM: &str = "end_time";

fn band_name(index: usize) -> String {
    format!("band_{}", index)
}

fn time_item(dataset: &Dataset, key: &str) -> Option<DateTime<Utc>> {
    let value = dataset.metadata_item(key, "")?;
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

/// A raster file opened through GDAL
pub struct GdalProduct {
    name: String,
    location: PathBuf,
    dataset: Dataset,
    width: usize,
    height: usize,
    geo_transform: Option<GeoTransform>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    bands: Vec<BandInfo>,
}

impl GdalProduct {
    pub fn open<P: AsRef<Path>>(path: P) -> PercentileResult<Self> {
        let path = path.as_ref();
        let dataset = Dataset::open(path)?;
        let (width, height) = dataset.raster_size();
        let geo_transform = dataset.geo_transform().ok().map(GeoTransform::from_gdal);

        let mut bands = Vec::new();
        for index in 1..=dataset.raster_count() {
            let rasterband = dataset.rasterband(index)?;
            let mut info = BandInfo::new(&band_name(index as usize));
            info.no_data_value = rasterband.no_data_value();
            bands.push(info);
        }

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        log::debug!("Opened {} with GDAL ({}x{}, {} bands)", path.display(), width, height, bands.len());
        Ok(Self {
            name,
            location: path.to_path_buf(),
            start_time: time_item(&dataset, START_TIME_ITEM),
            end_time: time_item(&dataset, END_TIME_ITEM),
            dataset,
            width,
            height,
            geo_transform,
            bands,
        })
    }

    fn read_band(&self, name: &str, window: Window) -> PercentileResult<RasterBuffer> {
        if !window.fits_in(self.width, self.height) {
            return Err(PercentileError::Processing(format!(
                "Window {} exceeds product '{}' of size {}x{}",
                window, self.name, self.width, self.height
            )));
        }
        let index = self
            .bands
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| PercentileError::Processing(format!("Product '{}' has no band '{}'", self.name, name)))?;
        let rasterband = self.dataset.rasterband(index as isize + 1)?;
        let size = (window.width, window.height);
        let buffer = rasterband.read_as::<f32>((window.x as isize, window.y as isize), size, size, None)?;
        let mut samples = Array2::from_shape_vec(window.shape(), buffer.data)
            .map_err(|e| PercentileError::Processing(format!("Failed to reshape band data: {}", e)))?;
        if let Some(no_data) = self.bands[index].no_data_value {
            if !no_data.is_nan() {
                samples.mapv_inplace(|v| if v as f64 == no_data { f32::NAN } else { v });
            }
        }
        Ok(samples)
    }
}

impl RasterProduct for GdalProduct {
    fn name(&self) -> &str {
        &self.name
    }

    fn file_location(&self) -> Option<&Path> {
        Some(&self.location)
    }

    fn scene_size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn geo_coding(&self) -> Option<&dyn GeoCoding> {
        self.geo_transform.as_ref().map(|g| g as &dyn GeoCoding)
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    fn band(&self, name: &str) -> Option<&BandInfo> {
        self.bands.iter().find(|b| b.name == name)
    }

    /// Only bare band names are understood as expressions
    fn supports_expression(&self, expression: &str) -> bool {
        let expression = expression.trim();
        expression == ALWAYS_VALID_EXPRESSION || self.band(expression).is_some()
    }

    fn read_samples(&self, source: &BandSource, window: Window) -> PercentileResult<RasterBuffer> {
        match source {
            BandSource::Band(name) => self.read_band(name, window),
            BandSource::Expression(expression) => self.read_band(expression.trim(), window),
        }
    }

    fn read_valid_mask(&self, expression: &str, window: Window) -> PercentileResult<Array2<bool>> {
        let expression = expression.trim();
        if expression == ALWAYS_VALID_EXPRESSION {
            return Ok(Array2::from_elem(window.shape(), true));
        }
        Ok(self.read_band(expression, window)?.mapv(|v| !v.is_nan() && v != 0.0))
    }
}

/// Opens any raster GDAL can read
#[derive(Debug, Default)]
pub struct GdalProductReader;

impl ProductReader for GdalProductReader {
    fn open_product(&self, path: &Path) -> PercentileResult<Box<dyn RasterProduct>> {
        Ok(Box::new(GdalProduct::open(path)?))
    }
}

/// Writes the percentile bands to `<name>.tif` and the valid sample counts to
/// `<name>_values_count.tif`
pub struct GeoTiffSink {
    dir: PathBuf,
    thresholds: Option<Dataset>,
    counts: Option<Dataset>,
    band_count: usize,
    output_paths: Vec<PathBuf>,
}

impl GeoTiffSink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            thresholds: None,
            counts: None,
            band_count: 0,
            output_paths: Vec::new(),
        }
    }

    pub fn output_paths(&self) -> &[PathBuf] {
        &self.output_paths
    }

    fn prepare(dataset: &mut Dataset, layout: &OutputLayout) -> PercentileResult<()> {
        dataset.set_geo_transform(&layout.grid.transform.to_gdal())?;
        dataset.set_spatial_ref(&crs::spatial_ref(&layout.grid.crs)?)?;
        if let (Some(start), Some(end)) = (layout.start_time, layout.end_time) {
            dataset.set_metadata_item(START_TIME_ITEM, &start.to_rfc3339(), "")?;
            dataset.set_metadata_item(END_TIME_ITEM, &end.to_rfc3339(), "")?;
        }
        for entry in &layout.metadata {
            dataset.set_metadata_item(&entry.key.replace(' ', "_"), &entry.value, "")?;
        }
        Ok(())
    }
}

impl PercentileSink for GeoTiffSink {
    fn begin(&mut self, layout: &OutputLayout) -> PercentileResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let (width, height) = (layout.grid.width as isize, layout.grid.height as isize);

        let thresholds_path = self.dir.join(format!("{}.tif", layout.name));
        let mut thresholds = driver.create_with_band_type::<f32, _>(
            &thresholds_path,
            width,
            height,
            layout.threshold_bands.len() as isize,
        )?;
        Self::prepare(&mut thresholds, layout)?;
        for (index, name) in layout.threshold_bands.iter().enumerate() {
            thresholds.set_metadata_item(&format!("band_{}", index + 1), name, "")?;
            let mut rasterband = thresholds.rasterband(index as isize + 1)?;
            rasterband.set_no_data_value(Some(f32::NAN as f64))?;
        }

        let counts_path = self.dir.join(format!("{}_{}.tif", layout.name, VALUES_COUNT_BAND_NAME));
        let mut counts = driver.create_with_band_type::<u16, _>(&counts_path, width, height, 1)?;
        Self::prepare(&mut counts, layout)?;

        log::info!("Writing GeoTIFF output to {}", self.dir.display());
        self.band_count = layout.threshold_bands.len();
        self.thresholds = Some(thresholds);
        self.counts = Some(counts);
        self.output_paths = vec![thresholds_path, counts_path];
        Ok(())
    }

    fn write_tile(&mut self, tile: &PercentileTile) -> PercentileResult<()> {
        let (thresholds, counts) = match (self.thresholds.as_ref(), self.counts.as_ref()) {
            (Some(thresholds), Some(counts)) => (thresholds, counts),
            _ => return Err(PercentileError::Processing("Output sink was not started".to_string())),
        };
        if tile.thresholds.len() != self.band_count {
            return Err(PercentileError::Processing(format!(
                "Tile carries {} threshold rasters, expected {}",
                tile.thresholds.len(),
                self.band_count
            )));
        }
        let w = tile.window;
        let origin = (w.x as isize, w.y as isize);
        let size = (w.width, w.height);
        for (index, data) in tile.thresholds.iter().enumerate() {
            let mut rasterband = thresholds.rasterband(index as isize + 1)?;
            let buffer = Buffer::new(size, data.iter().cloned().collect::<Vec<f32>>());
            rasterband.write(origin, size, &buffer)?;
        }
        let mut rasterband = counts.rasterband(1)?;
        let buffer = Buffer::new(size, tile.counts.iter().cloned().collect::<Vec<u16>>());
        rasterband.write(origin, size, &buffer)?;
        Ok(())
    }

    fn finish(&mut self) -> PercentileResult<()> {
        // datasets are flushed and closed on drop
        self.thresholds = None;
        self.counts = None;
        for path in &self.output_paths {
            log::info!("Wrote {}", path.display());
        }
        Ok(())
    }
}
