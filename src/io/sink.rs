use crate::io::store::{BandHeader, MetadataEntry, RasterStoreWriter, SampleType, StoreHeader};
use crate::types::{PercentileError, PercentileResult, RasterBuffer, TargetGrid, Window};
use chrono::{DateTime, Utc};
use ndarray::{s, Array2};
use std::path::{Path, PathBuf};

pub const OUTPUT_PRODUCT_NAME: &str = "Percentile";
pub const OUTPUT_PRODUCT_TYPE: &str = "TemporalPercentile";
pub const VALUES_COUNT_BAND_NAME: &str = "values_count";

/// Name of the threshold band of a percentile
pub fn percentile_band_name(prefix: &str, percentile: u8) -> String {
    format!("{}_p{}_threshold", prefix, percentile)
}

/// Shape and naming of the percentile output product
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub name: String,
    pub product_type: String,
    pub grid: TargetGrid,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub percentiles: Vec<u8>,
    /// One threshold band name per percentile, same order
    pub threshold_bands: Vec<String>,
    pub metadata: Vec<MetadataEntry>,
}

impl OutputLayout {
    pub fn new(prefix: &str, grid: TargetGrid, percentiles: &[u8]) -> Self {
        Self {
            name: OUTPUT_PRODUCT_NAME.to_string(),
            product_type: OUTPUT_PRODUCT_TYPE.to_string(),
            grid,
            start_time: None,
            end_time: None,
            percentiles: percentiles.to_vec(),
            threshold_bands: percentiles.iter().map(|&p| percentile_band_name(prefix, p)).collect(),
            metadata: Vec::new(),
        }
    }

    fn store_header(&self) -> StoreHeader {
        let mut header = StoreHeader::new(
            &self.name,
            &self.product_type,
            self.grid.width,
            self.grid.height,
            &self.grid.crs,
            self.grid.transform.clone(),
        );
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            header.set_time_range(start, end);
        }
        for band in &self.threshold_bands {
            header.bands.push(BandHeader::new(band, SampleType::Float32).with_no_data(f64::NAN));
        }
        header.bands.push(BandHeader::new(VALUES_COUNT_BAND_NAME, SampleType::UInt16));
        header.metadata = self.metadata.clone();
        header
    }
}

/// Computed thresholds and counts of one output tile
#[derive(Debug, Clone)]
pub struct PercentileTile {
    pub window: Window,
    /// One raster per percentile, NaN where no threshold exists
    pub thresholds: Vec<RasterBuffer>,
    pub counts: Array2<u16>,
}

/// Receives the output product tile by tile
pub trait PercentileSink {
    fn begin(&mut self, layout: &OutputLayout) -> PercentileResult<()>;

    fn write_tile(&mut self, tile: &PercentileTile) -> PercentileResult<()>;

    fn finish(&mut self) -> PercentileResult<()>;
}

/// Percentile output held in memory
#[derive(Debug, Clone)]
pub struct PercentileProduct {
    pub layout: OutputLayout,
    pub thresholds: Vec<RasterBuffer>,
    pub counts: Array2<u16>,
}

impl PercentileProduct {
    /// Threshold raster of a requested percentile
    pub fn percentile(&self, percentile: u8) -> Option<&RasterBuffer> {
        let index = self.layout.percentiles.iter().position(|&p| p == percentile)?;
        self.thresholds.get(index)
    }

    /// Threshold raster by band name
    pub fn band(&self, name: &str) -> Option<&RasterBuffer> {
        let index = self.layout.threshold_bands.iter().position(|b| b == name)?;
        self.thresholds.get(index)
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.layout
            .metadata
            .iter()
            .find(|m| m.key == key)
            .map(|m| m.value.as_str())
    }
}

/// Collects the output product in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    product: Option<PercentileProduct>,
    finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The collected product, once the run finished
    pub fn into_product(self) -> Option<PercentileProduct> {
        if self.finished {
            self.product
        } else {
            None
        }
    }
}

fn tile_mismatch(tile: &PercentileTile, layout: &OutputLayout) -> Option<String> {
    if !tile.window.fits_in(layout.grid.width, layout.grid.height) {
        return Some(format!("Tile {} exceeds the output grid", tile.window));
    }
    if tile.thresholds.len() != layout.threshold_bands.len() {
        return Some(format!(
            "Tile carries {} threshold rasters, expected {}",
            tile.thresholds.len(),
            layout.threshold_bands.len()
        ));
    }
    let shape = tile.window.shape();
    if tile.counts.dim() != shape || tile.thresholds.iter().any(|t| t.dim() != shape) {
        return Some(format!("Tile data does not match window {}", tile.window));
    }
    None
}

impl PercentileSink for MemorySink {
    fn begin(&mut self, layout: &OutputLayout) -> PercentileResult<()> {
        let shape = (layout.grid.height, layout.grid.width);
        self.product = Some(PercentileProduct {
            layout: layout.clone(),
            thresholds: vec![Array2::from_elem(shape, f32::NAN); layout.threshold_bands.len()],
            counts: Array2::zeros(shape),
        });
        self.finished = false;
        Ok(())
    }

    fn write_tile(&mut self, tile: &PercentileTile) -> PercentileResult<()> {
        let product = self
            .product
            .as_mut()
            .ok_or_else(|| PercentileError::Processing("Output sink was not started".to_string()))?;
        if let Some(problem) = tile_mismatch(tile, &product.layout) {
            return Err(PercentileError::Processing(problem));
        }
        let w = tile.window;
        for (target, source) in product.thresholds.iter_mut().zip(&tile.thresholds) {
            target.slice_mut(s![w.y..w.y + w.height, w.x..w.x + w.width]).assign(source);
        }
        product
            .counts
            .slice_mut(s![w.y..w.y + w.height, w.x..w.x + w.width])
            .assign(&tile.counts);
        Ok(())
    }

    fn finish(&mut self) -> PercentileResult<()> {
        self.finished = true;
        Ok(())
    }
}

/// Writes the output product as a raster store
pub struct StoreSink {
    dir: PathBuf,
    writer: Option<RasterStoreWriter>,
    layout: Option<OutputLayout>,
    output_path: Option<PathBuf>,
}

impl StoreSink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            writer: None,
            layout: None,
            output_path: None,
        }
    }

    /// Header of the written product, once finished
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }
}

impl PercentileSink for StoreSink {
    fn begin(&mut self, layout: &OutputLayout) -> PercentileResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        self.writer = Some(RasterStoreWriter::create(&self.dir, layout.store_header())?);
        self.layout = Some(layout.clone());
        Ok(())
    }

    fn write_tile(&mut self, tile: &PercentileTile) -> PercentileResult<()> {
        let (writer, layout) = match (self.writer.as_mut(), self.layout.as_ref()) {
            (Some(writer), Some(layout)) => (writer, layout),
            _ => return Err(PercentileError::Processing("Output sink was not started".to_string())),
        };
        if let Some(problem) = tile_mismatch(tile, layout) {
            return Err(PercentileError::Processing(problem));
        }
        for (band, data) in layout.threshold_bands.iter().zip(&tile.thresholds) {
            writer.write_window(band, tile.window, data)?;
        }
        writer.write_window(VALUES_COUNT_BAND_NAME, tile.window, &tile.counts)
    }

    fn finish(&mut self) -> PercentileResult<()> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| PercentileError::Processing("Output sink was not started".to_string()))?;
        let path = writer.finish()?;
        log::info!("Wrote percentile product {}", path.display());
        self.output_path = Some(path);
        Ok(())
    }
}
