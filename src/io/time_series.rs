//! Intermediate time series product.
//!
//! One float band per retained day, all on the target grid. The product is written
//! strip by strip while the daily means are synthesised, finished, and then read
//! back tile by tile. Unless it is kept, its files are removed once the reader is
//! dropped.

use crate::core::grouping::{mjd_to_utc, modified_julian_day};
use crate::core::mean::StripSink;
use crate::io::product::RasterProduct;
use crate::io::store::{
    remove_store, BandHeader, MetadataEntry, RasterStoreReader, RasterStoreWriter, SampleType, StoreHeader,
};
use crate::types::{PercentileError, PercentileResult, RasterBuffer, TargetGrid, Window};
use chrono::{Datelike, NaiveDateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const TIME_SERIES_PRODUCT_TYPE: &str = "org.esa.snap.glob.timeseries";
/// Metadata root read by time series viewers
pub const TIME_SERIES_METADATA_ROOT: &str = "TIME_SERIES";
const PRODUCT_LOCATIONS: &str = "PRODUCT_LOCATIONS";
const VARIABLES: &str = "VARIABLES";
const PRODUCT_NAME_SUFFIX: &str = "_PercentileOpDataProduct";
const BAND_DATE_FORMAT: &str = "%Y%m%d.%H%M%S%.3f";
const BAND_DATE_LENGTH: usize = 19;

/// Name of the time series product covering a series starting in `year`
pub fn time_series_product_name(year: i32, prefix: &str) -> String {
    format!("{}_{}{}", year, prefix, PRODUCT_NAME_SUFFIX)
}

/// Name of the mean band of day `mjd`
pub fn day_band_name(prefix: &str, mjd: i64) -> PercentileResult<String> {
    Ok(format!("{}_{}", prefix, mjd_to_utc(mjd)?.format(BAND_DATE_FORMAT)))
}

fn day_of_band_name(name: &str) -> Option<i64> {
    let date = name.get(name.len().checked_sub(BAND_DATE_LENGTH)?..)?;
    let naive = NaiveDateTime::parse_from_str(date, BAND_DATE_FORMAT).ok()?;
    Some(modified_julian_day(Utc.from_utc_datetime(&naive)))
}

/// A day band of the time series
#[derive(Debug, Clone, PartialEq)]
pub struct DayBand {
    pub day: i64,
    pub unit: Option<String>,
    pub description: Option<String>,
}

impl DayBand {
    pub fn new(day: i64) -> Self {
        Self {
            day,
            unit: None,
            description: None,
        }
    }
}

/// Everything needed to lay out a time series product
#[derive(Debug, Clone)]
pub struct TimeSeriesLayout {
    pub prefix: String,
    pub grid: TargetGrid,
    /// First day of the series, inclusive
    pub start_day: i64,
    /// Last day of the series, inclusive
    pub end_day: i64,
    /// Days with data, ascending
    pub days: Vec<DayBand>,
    pub metadata: Vec<MetadataEntry>,
}

impl TimeSeriesLayout {
    pub fn series_length(&self) -> usize {
        (self.end_day - self.start_day + 1).max(0) as usize
    }

    fn header(&self) -> PercentileResult<StoreHeader> {
        if self.end_day < self.start_day {
            return Err(PercentileError::Config(format!(
                "Time series ends (MJD {}) before it starts (MJD {})",
                self.end_day, self.start_day
            )));
        }
        let start = mjd_to_utc(self.start_day)?;
        let mut header = StoreHeader::new(
            &time_series_product_name(start.year(), &self.prefix),
            TIME_SERIES_PRODUCT_TYPE,
            self.grid.width,
            self.grid.height,
            &self.grid.crs,
            self.grid.transform.clone(),
        );
        header.set_time_range(start, mjd_to_utc(self.end_day)?);

        let mut previous = None;
        for day in &self.days {
            if day.day < self.start_day || day.day > self.end_day {
                return Err(PercentileError::Processing(format!(
                    "Day {} lies outside the time series [{}, {}]",
                    day.day, self.start_day, self.end_day
                )));
            }
            if previous.map_or(false, |p| p >= day.day) {
                return Err(PercentileError::Processing(
                    "Time series days must be strictly ascending".to_string(),
                ));
            }
            previous = Some(day.day);

            let mut band = BandHeader::new(&day_band_name(&self.prefix, day.day)?, SampleType::Float32).with_no_data(f64::NAN);
            band.unit = day.unit.clone();
            band.description = day.description.clone();
            header.bands.push(band);
        }
        header.metadata = self.metadata.clone();
        self.add_time_series_metadata(&mut header);
        Ok(header)
    }

    /// One selected variable named after the band prefix, no product locations
    fn add_time_series_metadata(&self, header: &mut StoreHeader) {
        let root = TIME_SERIES_METADATA_ROOT;
        let variable = format!("{}/{}/{}.0", root, VARIABLES, VARIABLES);
        header.add_metadata(&format!("{}/{}", root, PRODUCT_LOCATIONS), "");
        header.add_metadata(&format!("{}/NAME", variable), &self.prefix);
        header.add_metadata(&format!("{}/SELECTION", variable), "true");
    }
}

/// Writes the daily mean bands of the time series product
pub struct TimeSeriesWriter {
    store: Option<RasterStoreWriter>,
    header_path: PathBuf,
    band_names: BTreeMap<i64, String>,
    start_day: i64,
    series_length: usize,
    keep: bool,
}

impl TimeSeriesWriter {
    /// Lay out the product in `dir`; `keep` decides whether it outlives the run
    pub fn create(dir: &Path, layout: &TimeSeriesLayout, keep: bool) -> PercentileResult<Self> {
        let header = layout.header()?;
        let band_names = layout
            .days
            .iter()
            .zip(&header.bands)
            .map(|(day, band)| (day.day, band.name.clone()))
            .collect();
        let store = RasterStoreWriter::create(dir, header)?;
        log::info!(
            "Writing time series product {} with {} day bands over {} days",
            store.header_path().display(),
            layout.days.len(),
            layout.series_length()
        );
        Ok(Self {
            header_path: store.header_path().to_path_buf(),
            store: Some(store),
            band_names,
            start_day: layout.start_day,
            series_length: layout.series_length(),
            keep,
        })
    }

    pub fn header_path(&self) -> &Path {
        &self.header_path
    }

    /// Close the product and reopen it for reading.
    /// A discarded product is removed if this fails.
    pub fn finish(mut self) -> PercentileResult<TimeSeriesReader> {
        let store = self
            .store
            .take()
            .ok_or_else(|| PercentileError::Processing("Time series product already finished".to_string()))?;
        let reader = match store.finish().and_then(RasterStoreReader::open) {
            Ok(reader) => reader,
            Err(e) => {
                self.discard();
                return Err(e);
            }
        };
        let day_bands = self
            .band_names
            .iter()
            .map(|(&day, name)| ((day - self.start_day) as usize, name.clone()))
            .collect();
        Ok(TimeSeriesReader {
            store: reader,
            day_bands,
            start_day: self.start_day,
            series_length: self.series_length,
            keep: self.keep,
        })
    }
}

impl StripSink for TimeSeriesWriter {
    fn write_strip(&mut self, day: i64, window: Window, data: &RasterBuffer) -> PercentileResult<()> {
        let band = self
            .band_names
            .get(&day)
            .ok_or_else(|| PercentileError::Processing(format!("Time series has no band for day {}", day)))?;
        let store = self
            .store
            .as_mut()
            .ok_or_else(|| PercentileError::Processing("Time series product already finished".to_string()))?;
        store.write_window(band, window, data)
    }
}

impl TimeSeriesWriter {
    fn discard(&self) {
        if self.keep {
            return;
        }
        if let Err(e) = remove_store(&self.header_path) {
            log::warn!("Unable to remove time series product {}: {}", self.header_path.display(), e);
        }
    }
}

impl Drop for TimeSeriesWriter {
    fn drop(&mut self) {
        // an unfinished, discarded product is removed right away
        if self.store.is_some() {
            self.discard();
        }
    }
}

/// Read access to a finished time series product
#[derive(Debug)]
pub struct TimeSeriesReader {
    store: RasterStoreReader,
    /// Day index within the series and band name, ascending
    day_bands: Vec<(usize, String)>,
    start_day: i64,
    series_length: usize,
    keep: bool,
}

impl TimeSeriesReader {
    /// Open a persisted time series product; the day indices are recovered from the band names
    pub fn open<P: AsRef<Path>>(header_path: P, keep: bool) -> PercentileResult<Self> {
        let store = RasterStoreReader::open(header_path)?;
        let (start, end) = match (store.start_time(), store.end_time()) {
            (Some(start), Some(end)) => (modified_julian_day(start), modified_julian_day(end)),
            _ => {
                return Err(PercentileError::InvalidFormat(format!(
                    "Time series product '{}' has no time range",
                    store.header().name
                )))
            }
        };

        let mut day_bands = Vec::with_capacity(store.header().bands.len());
        for band in &store.header().bands {
            let day = day_of_band_name(&band.name).ok_or_else(|| {
                PercentileError::InvalidFormat(format!("'{}' is not a time series day band", band.name))
            })?;
            if day < start || day > end {
                return Err(PercentileError::InvalidFormat(format!(
                    "Day band '{}' lies outside the series time range",
                    band.name
                )));
            }
            day_bands.push(((day - start) as usize, band.name.clone()));
        }
        day_bands.sort_by_key(|(index, _)| *index);

        Ok(Self {
            store,
            day_bands,
            start_day: start,
            series_length: (end - start + 1) as usize,
            keep,
        })
    }

    pub fn name(&self) -> &str {
        &self.store.header().name
    }

    pub fn header_path(&self) -> &Path {
        self.store.header_path()
    }

    pub fn scene_size(&self) -> (usize, usize) {
        (self.store.header().width, self.store.header().height)
    }

    pub fn header(&self) -> &StoreHeader {
        self.store.header()
    }

    pub fn start_day(&self) -> i64 {
        self.start_day
    }

    /// Number of days from the first to the last day of the series, inclusive
    pub fn series_length(&self) -> usize {
        self.series_length
    }

    pub fn band_count(&self) -> usize {
        self.day_bands.len()
    }

    /// Day indices holding a band, ascending
    pub fn day_indices(&self) -> Vec<usize> {
        self.day_bands.iter().map(|(index, _)| *index).collect()
    }

    /// Read a window of every day. Days without a band are `None`.
    pub fn read_day_windows(&self, window: Window) -> PercentileResult<Vec<Option<RasterBuffer>>> {
        let mut days = vec![None; self.series_length];
        for (index, band) in &self.day_bands {
            days[*index] = Some(self.store.read_window::<f32>(band, window)?);
        }
        Ok(days)
    }
}

impl Drop for TimeSeriesReader {
    fn drop(&mut self) {
        if !self.keep {
            if let Err(e) = remove_store(self.store.header_path()) {
                log::warn!(
                    "Unable to remove time series product {}: {}",
                    self.store.header_path().display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use ndarray::array;
    use tempfile::TempDir;

    fn layout() -> TimeSeriesLayout {
        let grid = TargetGrid::from_bounds("EPSG:4326", &BoundingBox::from_diagonal(0.0, 2.0, 3.0, 0.0), 1.0, 1.0).unwrap();
        TimeSeriesLayout {
            prefix: "chl".to_string(),
            grid,
            start_day: 56444,
            end_day: 56447,
            days: vec![DayBand::new(56444), DayBand::new(56446)],
            metadata: Vec::new(),
        }
    }

    #[test]
    fn test_names() {
        assert_eq!(time_series_product_name(2013, "chl"), "2013_chl_PercentileOpDataProduct");
        let name = day_band_name("chl", 56444).unwrap();
        assert_eq!(name, "chl_20130601.000000.000");
        assert_eq!(day_of_band_name(&name), Some(56444));
        assert_eq!(day_of_band_name("chl"), None);
    }

    #[test]
    fn test_write_then_read_days() {
        let dir = TempDir::new().unwrap();
        let mut writer = TimeSeriesWriter::create(dir.path(), &layout(), true).unwrap();
        writer
            .write_strip(56444, Window::new(0, 0, 3, 2), &array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]])
            .unwrap();
        writer
            .write_strip(56446, Window::new(0, 1, 3, 1), &array![[7.0, f32::NAN, 9.0]])
            .unwrap();
        assert!(writer.write_strip(56445, Window::new(0, 0, 3, 1), &array![[0.0, 0.0, 0.0]]).is_err());

        let reader = writer.finish().unwrap();
        assert_eq!(reader.name(), "2013_chl_PercentileOpDataProduct");
        assert_eq!(reader.series_length(), 4);
        assert_eq!(reader.day_indices(), vec![0, 2]);

        let days = reader.read_day_windows(Window::new(1, 1, 2, 1)).unwrap();
        assert_eq!(days.len(), 4);
        assert_eq!(days[0].as_ref().unwrap(), &array![[5.0, 6.0]]);
        assert!(days[1].is_none());
        assert!(days[2].as_ref().unwrap()[[0, 0]].is_nan());
        assert!(days[3].is_none());
    }

    #[test]
    fn test_discarded_product_is_removed() {
        let dir = TempDir::new().unwrap();
        let writer = TimeSeriesWriter::create(dir.path(), &layout(), false).unwrap();
        let path = writer.header_path().to_path_buf();
        let reader = writer.finish().unwrap();
        assert!(path.exists());
        drop(reader);
        assert!(!path.exists());
        assert!(!path.with_extension("data").exists());
    }

    #[test]
    fn test_failed_finish_removes_discarded_product() {
        let dir = TempDir::new().unwrap();
        let writer = TimeSeriesWriter::create(dir.path(), &layout(), false).unwrap();
        let path = writer.header_path().to_path_buf();
        // the product cannot be reopened with a corrupt header
        std::fs::write(&path, b"<RasterProduct>").unwrap();
        assert!(writer.finish().is_err());
        assert!(!path.exists());
        assert!(!path.with_extension("data").exists());

        let writer = TimeSeriesWriter::create(dir.path(), &layout(), true).unwrap();
        let path = writer.header_path().to_path_buf();
        std::fs::write(&path, b"<RasterProduct>").unwrap();
        assert!(writer.finish().is_err());
        assert!(path.exists());
    }

    #[test]
    fn test_time_series_metadata() {
        let dir = TempDir::new().unwrap();
        let mut layout = layout();
        layout.metadata.push(MetadataEntry {
            key: "BandConfiguration/sourceBandName".to_string(),
            value: "chl".to_string(),
        });
        let reader = TimeSeriesWriter::create(dir.path(), &layout, false).unwrap().finish().unwrap();
        let header = reader.header();
        assert_eq!(header.product_type, TIME_SERIES_PRODUCT_TYPE);
        assert_eq!(header.metadata_value("BandConfiguration/sourceBandName"), Some("chl"));
        assert_eq!(header.metadata_value("TIME_SERIES/PRODUCT_LOCATIONS"), Some(""));
        assert_eq!(header.metadata_value("TIME_SERIES/VARIABLES/VARIABLES.0/NAME"), Some("chl"));
        assert_eq!(header.metadata_value("TIME_SERIES/VARIABLES/VARIABLES.0/SELECTION"), Some("true"));
    }

    #[test]
    fn test_days_outside_series_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut bad = layout();
        bad.days.push(DayBand::new(56500));
        assert!(TimeSeriesWriter::create(dir.path(), &bad, false).is_err());
    }
}
