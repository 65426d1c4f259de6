//! Persisted raster store.
//!
//! A store is an XML header `<name>.xml` next to a directory `<name>.data/` holding
//! one single-band ENVI raster (`.hdr` plus `.img`) per band, written and read
//! through GDAL. Bands can be written in any order, one window at a time, and read
//! back through random-access windows. Samples never written read as zero.

use crate::core::crs;
use crate::io::product::{BandInfo, BandSource, RasterProduct, ALWAYS_VALID_EXPRESSION};
use crate::types::{GeoCoding, GeoTransform, PercentileError, PercentileResult, RasterBuffer, Window};
use chrono::{DateTime, Utc};
use gdal::raster::{Buffer, GdalType};
use gdal::{Dataset, Driver, DriverManager};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const HEADER_EXTENSION: &str = "xml";
pub const DATA_DIR_EXTENSION: &str = "data";
pub const BAND_FILE_EXTENSION: &str = "img";
const BAND_DRIVER: &str = "ENVI";

/// Sample types a store band can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Float32,
    UInt16,
}

impl SampleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleType::Float32 => "float32",
            SampleType::UInt16 => "uint16",
        }
    }

    pub fn parse(s: &str) -> PercentileResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "float32" => Ok(SampleType::Float32),
            "uint16" => Ok(SampleType::UInt16),
            other => Err(PercentileError::InvalidFormat(format!("Unknown sample type '{}'", other))),
        }
    }
}

/// Rust sample types matching a store band type
pub trait StoreSample: GdalType + Copy + 'static {
    const SAMPLE_TYPE: SampleType;
}

impl StoreSample for f32 {
    const SAMPLE_TYPE: SampleType = SampleType::Float32;
}

impl StoreSample for u16 {
    const SAMPLE_TYPE: SampleType = SampleType::UInt16;
}

/// Band entry of a store header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandHeader {
    pub name: String,
    pub sample_type: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_data_value: Option<f64>,
}

impl BandHeader {
    pub fn new(name: &str, sample_type: SampleType) -> Self {
        Self {
            name: name.to_string(),
            sample_type: sample_type.as_str().to_string(),
            file: format!("{}.{}", sanitize_file_stem(name), BAND_FILE_EXTENSION),
            unit: None,
            description: None,
            no_data_value: None,
        }
    }

    pub fn with_no_data(mut self, value: f64) -> Self {
        self.no_data_value = Some(value);
        self
    }

    pub fn sample_type(&self) -> PercentileResult<SampleType> {
        SampleType::parse(&self.sample_type)
    }

    fn info(&self) -> BandInfo {
        BandInfo {
            name: self.name.clone(),
            unit: self.unit.clone(),
            description: self.description.clone(),
            no_data_value: self.no_data_value,
        }
    }
}

/// Free-form metadata attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Store header serialised as `<name>.xml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "RasterProduct")]
pub struct StoreHeader {
    pub name: String,
    pub product_type: String,
    pub width: usize,
    pub height: usize,
    pub crs: String,
    pub geo_transform: GeoTransform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, rename = "band")]
    pub bands: Vec<BandHeader>,
    #[serde(default, rename = "metadata")]
    pub metadata: Vec<MetadataEntry>,
}

impl StoreHeader {
    pub fn new(name: &str, product_type: &str, width: usize, height: usize, crs: &str, geo_transform: GeoTransform) -> Self {
        Self {
            name: name.to_string(),
            product_type: product_type.to_string(),
            width,
            height,
            crs: crs.to_string(),
            geo_transform,
            start_time: None,
            end_time: None,
            bands: Vec::new(),
            metadata: Vec::new(),
        }
    }

    pub fn set_time_range(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.start_time = Some(start.to_rfc3339());
        self.end_time = Some(end.to_rfc3339());
    }

    pub fn add_metadata(&mut self, key: &str, value: &str) {
        self.metadata.push(MetadataEntry {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.iter().find(|m| m.key == key).map(|m| m.value.as_str())
    }

    pub fn band(&self, name: &str) -> Option<&BandHeader> {
        self.bands.iter().find(|b| b.name == name)
    }

    /// Raster size as GDAL dimensions, rejecting sizes GDAL cannot address
    pub fn raster_size(&self) -> PercentileResult<(isize, isize)> {
        let too_large = || {
            PercentileError::InvalidFormat(format!(
                "Store '{}' has an unsupported size of {}x{} pixels",
                self.name, self.width, self.height
            ))
        };
        let limit = i32::MAX as usize;
        if self.width > limit || self.height > limit {
            return Err(too_large());
        }
        self.width.checked_mul(self.height).ok_or_else(too_large)?;
        Ok((self.width as isize, self.height as isize))
    }

    pub fn to_xml(&self) -> PercentileResult<String> {
        quick_xml::se::to_string(self)
            .map_err(|e| PercentileError::InvalidFormat(format!("Failed to serialise header of '{}': {}", self.name, e)))
    }

    pub fn from_xml(xml: &str) -> PercentileResult<Self> {
        let header: StoreHeader = quick_xml::de::from_str(xml)
            .map_err(|e| PercentileError::InvalidFormat(format!("Failed to parse store header: {}", e)))?;
        header.raster_size()?;
        for band in &header.bands {
            band.sample_type()?;
        }
        Ok(header)
    }
}

/// Location of the header file for a store named `name` inside `dir`
pub fn header_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, HEADER_EXTENSION))
}

fn data_dir_for(header_path: &Path) -> PathBuf {
    header_path.with_extension(DATA_DIR_EXTENSION)
}

fn sanitize_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Delete a store's header and data directory
pub fn remove_store(header_path: &Path) -> PercentileResult<()> {
    let data_dir = data_dir_for(header_path);
    if data_dir.exists() {
        fs::remove_dir_all(&data_dir)?;
    }
    if header_path.exists() {
        fs::remove_file(header_path)?;
    }
    log::debug!("Removed raster store {}", header_path.display());
    Ok(())
}

fn create_band(driver: &Driver, path: &Path, sample_type: SampleType, size: (isize, isize)) -> PercentileResult<Dataset> {
    let dataset = match sample_type {
        SampleType::Float32 => driver.create_with_band_type::<f32, _>(path, size.0, size.1, 1)?,
        SampleType::UInt16 => driver.create_with_band_type::<u16, _>(path, size.0, size.1, 1)?,
    };
    Ok(dataset)
}

fn check_window(header: &StoreHeader, window: Window) -> PercentileResult<()> {
    if !window.fits_in(header.width, header.height) {
        return Err(PercentileError::Processing(format!(
            "Window {} exceeds store '{}' of size {}x{}",
            window, header.name, header.width, header.height
        )));
    }
    Ok(())
}

/// Incremental writer of a raster store
pub struct RasterStoreWriter {
    header_path: PathBuf,
    header: StoreHeader,
    bands: HashMap<String, (SampleType, Dataset)>,
}

impl RasterStoreWriter {
    /// Write the header and create one ENVI dataset per band
    pub fn create(dir: &Path, header: StoreHeader) -> PercentileResult<Self> {
        let size = header.raster_size()?;
        let header_path = header_path(dir, &header.name);
        let data_dir = data_dir_for(&header_path);
        fs::create_dir_all(&data_dir)?;

        let driver = DriverManager::get_driver_by_name(BAND_DRIVER)?;
        let spatial_ref = crs::spatial_ref(&header.crs)?;
        let mut bands = HashMap::new();
        for band in &header.bands {
            let sample_type = band.sample_type()?;
            let mut dataset = create_band(&driver, &data_dir.join(&band.file), sample_type, size)?;
            dataset.set_geo_transform(&header.geo_transform.to_gdal())?;
            dataset.set_spatial_ref(&spatial_ref)?;
            bands.insert(band.name.clone(), (sample_type, dataset));
        }

        let mut writer = BufWriter::new(File::create(&header_path)?);
        writer.write_all(header.to_xml()?.as_bytes())?;
        writer.flush()?;

        log::debug!(
            "Created raster store {} with {} bands ({}x{})",
            header_path.display(),
            header.bands.len(),
            header.width,
            header.height
        );
        Ok(Self {
            header_path,
            header,
            bands,
        })
    }

    pub fn header(&self) -> &StoreHeader {
        &self.header
    }

    pub fn header_path(&self) -> &Path {
        &self.header_path
    }

    /// Write a window of samples into a band
    pub fn write_window<T: StoreSample>(&mut self, band: &str, window: Window, data: &Array2<T>) -> PercentileResult<()> {
        check_window(&self.header, window)?;
        if data.dim() != window.shape() {
            return Err(PercentileError::Processing(format!(
                "Data of shape {:?} does not match window {}",
                data.dim(),
                window
            )));
        }
        let (sample_type, dataset) = self
            .bands
            .get(band)
            .ok_or_else(|| PercentileError::Processing(format!("Store has no band '{}'", band)))?;
        if *sample_type != T::SAMPLE_TYPE {
            return Err(PercentileError::Processing(format!(
                "Band '{}' holds {:?} samples, got {:?}",
                band,
                sample_type,
                T::SAMPLE_TYPE
            )));
        }

        let mut rasterband = dataset.rasterband(1)?;
        let size = (window.width, window.height);
        let buffer = Buffer::new(size, data.iter().copied().collect::<Vec<T>>());
        rasterband.write((window.x as isize, window.y as isize), size, &buffer)?;
        Ok(())
    }

    /// Close every band dataset and return the header location
    pub fn finish(self) -> PercentileResult<PathBuf> {
        let band_count = self.bands.len();
        // datasets are flushed and closed on drop
        drop(self.bands);
        log::debug!("Finished raster store {} ({} bands)", self.header_path.display(), band_count);
        Ok(self.header_path)
    }
}

/// Random-access reader of a raster store
#[derive(Debug)]
pub struct RasterStoreReader {
    header_path: PathBuf,
    data_dir: PathBuf,
    header: StoreHeader,
    band_infos: Vec<BandInfo>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl RasterStoreReader {
    pub fn open<P: AsRef<Path>>(header_path: P) -> PercentileResult<Self> {
        let header_path = header_path.as_ref().to_path_buf();
        let xml = fs::read_to_string(&header_path)?;
        let header = StoreHeader::from_xml(&xml)?;
        let data_dir = data_dir_for(&header_path);

        for band in &header.bands {
            let dataset = Dataset::open(data_dir.join(&band.file))?;
            let size = dataset.raster_size();
            if size != (header.width, header.height) || dataset.raster_count() != 1 {
                return Err(PercentileError::InvalidFormat(format!(
                    "Band '{}' is a {}x{} raster with {} bands, expected {}x{} with one band",
                    band.name,
                    size.0,
                    size.1,
                    dataset.raster_count(),
                    header.width,
                    header.height
                )));
            }
        }

        let start_time = parse_time(header.start_time.as_deref())?;
        let end_time = parse_time(header.end_time.as_deref())?;
        let band_infos = header.bands.iter().map(BandHeader::info).collect();
        log::debug!("Opened raster store {} with {} bands", header_path.display(), header.bands.len());

        Ok(Self {
            header_path,
            data_dir,
            header,
            band_infos,
            start_time,
            end_time,
        })
    }

    pub fn header(&self) -> &StoreHeader {
        &self.header
    }

    pub fn header_path(&self) -> &Path {
        &self.header_path
    }

    pub fn band_names(&self) -> Vec<&str> {
        self.header.bands.iter().map(|b| b.name.as_str()).collect()
    }

    /// Read a window of a band in its stored sample type
    pub fn read_window<T: StoreSample>(&self, band: &str, window: Window) -> PercentileResult<Array2<T>> {
        let sample_type = self.band_header(band)?.sample_type()?;
        if sample_type != T::SAMPLE_TYPE {
            return Err(PercentileError::Processing(format!(
                "Band '{}' holds {:?} samples, requested {:?}",
                band,
                sample_type,
                T::SAMPLE_TYPE
            )));
        }
        self.read_as(band, window)
    }

    /// Read a window of any band as f32
    pub fn read_window_f32(&self, band: &str, window: Window) -> PercentileResult<RasterBuffer> {
        self.read_as(band, window)
    }

    fn band_header(&self, band: &str) -> PercentileResult<&BandHeader> {
        self.header
            .band(band)
            .ok_or_else(|| PercentileError::Processing(format!("Store '{}' has no band '{}'", self.header.name, band)))
    }

    fn read_as<T: GdalType + Copy>(&self, band: &str, window: Window) -> PercentileResult<Array2<T>> {
        check_window(&self.header, window)?;
        let band_header = self.band_header(band)?;
        let dataset = Dataset::open(self.data_dir.join(&band_header.file))?;
        let rasterband = dataset.rasterband(1)?;
        let size = (window.width, window.height);
        let buffer = rasterband.read_as::<T>((window.x as isize, window.y as isize), size, size, None)?;
        Array2::from_shape_vec(window.shape(), buffer.data)
            .map_err(|e| PercentileError::Processing(format!("Failed to reshape band data: {}", e)))
    }
}

fn parse_time(value: Option<&str>) -> PercentileResult<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(s.trim())
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| PercentileError::InvalidFormat(format!("Invalid time '{}': {}", s, e)))
        })
        .transpose()
}

impl RasterProduct for RasterStoreReader {
    fn name(&self) -> &str {
        &self.header.name
    }

    fn file_location(&self) -> Option<&Path> {
        Some(&self.header_path)
    }

    fn scene_size(&self) -> (usize, usize) {
        (self.header.width, self.header.height)
    }

    fn geo_coding(&self) -> Option<&dyn GeoCoding> {
        Some(&self.header.geo_transform as &dyn GeoCoding)
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    fn band(&self, name: &str) -> Option<&BandInfo> {
        self.band_infos.iter().find(|b| b.name == name)
    }

    /// Only bare band names are understood as expressions
    fn supports_expression(&self, expression: &str) -> bool {
        let expression = expression.trim();
        expression == ALWAYS_VALID_EXPRESSION || self.header.band(expression).is_some()
    }

    fn read_samples(&self, source: &BandSource, window: Window) -> PercentileResult<RasterBuffer> {
        let name = match source {
            BandSource::Band(name) => name.as_str(),
            BandSource::Expression(expression) => expression.trim(),
        };
        let mut samples = self.read_window_f32(name, window)?;
        if let Some(no_data) = self.band(name).and_then(|b| b.no_data_value) {
            if !no_data.is_nan() {
                samples.mapv_inplace(|v| if v as f64 == no_data { f32::NAN } else { v });
            }
        }
        Ok(samples)
    }

    fn read_valid_mask(&self, expression: &str, window: Window) -> PercentileResult<Array2<bool>> {
        let expression = expression.trim();
        if expression == ALWAYS_VALID_EXPRESSION {
            return Ok(Array2::from_elem(window.shape(), true));
        }
        let samples = self.read_samples(&BandSource::Band(expression.to_string()), window)?;
        Ok(samples.mapv(|v| !v.is_nan() && v != 0.0))
    }
}

/// Opens raster stores by their `.xml` header
#[derive(Debug, Default)]
pub struct RasterStoreProductReader;

impl crate::io::product::ProductReader for RasterStoreProductReader {
    fn open_product(&self, path: &Path) -> PercentileResult<Box<dyn RasterProduct>> {
        if path.extension().and_then(|e| e.to_str()) != Some(HEADER_EXTENSION) {
            return Err(PercentileError::InvalidFormat(format!(
                "'{}' is not a raster store header",
                path.display()
            )));
        }
        Ok(Box::new(RasterStoreReader::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    fn test_header() -> StoreHeader {
        let mut header = StoreHeader::new("store", "test", 4, 3, "EPSG:4326", GeoTransform::north_up(0.0, 3.0, 1.0, 1.0));
        header.bands.push(BandHeader::new("a/b", SampleType::Float32).with_no_data(f64::NAN));
        header.bands.push(BandHeader::new("count", SampleType::UInt16));
        header.add_metadata("percentiles", "10,90");
        header
    }

    #[test]
    fn test_header_xml_round_trip() {
        let mut header = test_header();
        header.bands[0].unit = Some("mg/m^3".to_string());
        let xml = header.to_xml().unwrap();
        let parsed = StoreHeader::from_xml(&xml).unwrap();
        assert_eq!(parsed.name, "store");
        assert_eq!(parsed.bands.len(), 2);
        assert_eq!(parsed.bands[0].file, "a_b.img");
        assert_eq!(parsed.bands[0].unit.as_deref(), Some("mg/m^3"));
        assert!(parsed.bands[0].no_data_value.unwrap().is_nan());
        assert_eq!(parsed.metadata_value("percentiles"), Some("10,90"));
        assert_eq!(parsed.geo_transform, header.geo_transform);
    }

    #[test]
    fn test_windowed_write_and_read() {
        let dir = TempDir::new().unwrap();
        let mut writer = RasterStoreWriter::create(dir.path(), test_header()).unwrap();
        writer
            .write_window("a/b", Window::new(0, 0, 4, 2), &array![[1.0f32, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]])
            .unwrap();
        writer
            .write_window("a/b", Window::new(0, 2, 4, 1), &array![[9.0f32, 10.0, 11.0, 12.0]])
            .unwrap();
        writer.write_window("count", Window::new(1, 1, 2, 1), &array![[3u16, 4]]).unwrap();
        assert!(writer.write_window("count", Window::new(0, 0, 1, 1), &array![[1.0f32]]).is_err());
        assert!(writer.write_window("a/b", Window::new(3, 0, 2, 1), &array![[1.0f32, 2.0]]).is_err());
        let path = writer.finish().unwrap();

        let reader = RasterStoreReader::open(&path).unwrap();
        let middle = reader.read_window::<f32>("a/b", Window::new(1, 1, 2, 2)).unwrap();
        assert_eq!(middle, array![[6.0, 7.0], [10.0, 11.0]]);
        let counts = reader.read_window::<u16>("count", Window::new(0, 1, 4, 1)).unwrap();
        assert_eq!(counts, array![[0, 3, 4, 0]]);
        assert_eq!(reader.read_window_f32("count", Window::new(1, 1, 1, 1)).unwrap(), array![[3.0f32]]);
        assert!(reader.read_window::<u16>("a/b", Window::new(0, 0, 1, 1)).is_err());
        assert!(reader.read_window::<f32>("a/b", Window::new(3, 2, 2, 1)).is_err());

        remove_store(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_band_files_are_envi_rasters() {
        let dir = TempDir::new().unwrap();
        let mut writer = RasterStoreWriter::create(dir.path(), test_header()).unwrap();
        let data = Array2::from_shape_fn((3, 4), |(r, c)| (r * 4 + c) as f32);
        writer.write_window("a/b", Window::full(4, 3), &data).unwrap();
        let path = writer.finish().unwrap();

        let band_path = path.with_extension(DATA_DIR_EXTENSION).join("a_b.img");
        assert!(band_path.with_extension("hdr").exists());
        let dataset = Dataset::open(&band_path).unwrap();
        assert_eq!(dataset.driver().short_name(), "ENVI");
        assert_eq!(dataset.raster_size(), (4, 3));
        assert_eq!(GeoTransform::from_gdal(dataset.geo_transform().unwrap()), test_header().geo_transform);
        let rasterband = dataset.rasterband(1).unwrap();
        let buffer = rasterband.read_as::<f32>((2, 1), (1, 1), (1, 1), None).unwrap();
        assert_eq!(buffer.data, vec![6.0]);
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut header = StoreHeader::new("huge", "test", 1 << 32, 1 << 32, "EPSG:4326", GeoTransform::north_up(0.0, 1.0, 1.0, 1.0));
        assert!(matches!(header.raster_size(), Err(PercentileError::InvalidFormat(_))));
        let path = header_path(dir.path(), "huge");
        fs::write(&path, header.to_xml().unwrap()).unwrap();

        assert!(matches!(RasterStoreReader::open(&path), Err(PercentileError::InvalidFormat(_))));
        assert!(crate::io::product::ProductReader::open_product(&RasterStoreProductReader, &path).is_err());

        header.bands.push(BandHeader::new("a", SampleType::Float32));
        assert!(matches!(
            RasterStoreWriter::create(dir.path(), header),
            Err(PercentileError::InvalidFormat(_))
        ));
        assert!(!path.with_extension(DATA_DIR_EXTENSION).exists());
    }
}
