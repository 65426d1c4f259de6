use crate::types::{GeoCoding, GeoTransform, PercentileError, PercentileResult, RasterBuffer, Window};
use chrono::{DateTime, Utc};
use ndarray::{s, Array2};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Name of the working band created for a band maths expression
pub const BAND_MATH_EXPRESSION_BAND_NAME: &str = "bandMathExpressionBandName";

/// Valid pixel expression accepting every pixel
pub const ALWAYS_VALID_EXPRESSION: &str = "true";

/// Which samples of a product feed the percentile computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BandSource {
    /// A band of the product, by name
    Band(String),
    /// A band maths expression resolved by the product
    Expression(String),
}

impl BandSource {
    /// Name of the band holding the samples once the source is materialised
    pub fn working_band_name(&self) -> &str {
        match self {
            BandSource::Band(name) => name,
            BandSource::Expression(_) => BAND_MATH_EXPRESSION_BAND_NAME,
        }
    }
}

/// Band metadata
#[derive(Debug, Clone, PartialEq)]
pub struct BandInfo {
    pub name: String,
    pub unit: Option<String>,
    pub description: Option<String>,
    pub no_data_value: Option<f64>,
}

impl BandInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            unit: None,
            description: None,
            no_data_value: None,
        }
    }
}

/// A geo-referenced 2-D raster product with lazily readable bands.
///
/// Dropping a product releases everything it holds.
pub trait RasterProduct {
    fn name(&self) -> &str;

    /// File the product was opened from, if any
    fn file_location(&self) -> Option<&Path>;

    /// Scene size as `(width, height)`
    fn scene_size(&self) -> (usize, usize);

    fn geo_coding(&self) -> Option<&dyn GeoCoding>;

    fn start_time(&self) -> Option<DateTime<Utc>>;

    fn end_time(&self) -> Option<DateTime<Utc>>;

    fn band(&self, name: &str) -> Option<&BandInfo>;

    /// Whether a band maths expression can be resolved against this product
    fn supports_expression(&self, expression: &str) -> bool;

    /// Read geophysical samples of a band or expression; no-data samples become NaN
    fn read_samples(&self, source: &BandSource, window: Window) -> PercentileResult<RasterBuffer>;

    /// Evaluate a valid pixel expression over a window
    fn read_valid_mask(&self, expression: &str, window: Window) -> PercentileResult<Array2<bool>>;

    /// Whether the band source can be read from this product
    fn can_read(&self, source: &BandSource) -> bool {
        match source {
            BandSource::Band(name) => self.band(name).is_some(),
            BandSource::Expression(expression) => self.supports_expression(expression),
        }
    }
}

/// Whether a valid pixel expression needs evaluating at all
pub fn is_effective_valid_expression(expression: Option<&str>) -> Option<&str> {
    expression
        .map(str::trim)
        .filter(|e| !e.is_empty() && *e != ALWAYS_VALID_EXPRESSION)
}

/// Read samples and set every pixel rejected by the valid pixel expression to NaN
pub fn read_masked_samples(
    product: &dyn RasterProduct,
    source: &BandSource,
    valid_expression: Option<&str>,
    window: Window,
) -> PercentileResult<RasterBuffer> {
    let mut samples = product.read_samples(source, window)?;
    if let Some(expression) = is_effective_valid_expression(valid_expression) {
        let mask = product.read_valid_mask(expression, window)?;
        if mask.dim() != samples.dim() {
            return Err(PercentileError::Processing(format!(
                "Valid pixel mask {:?} does not match sample window {:?} of product '{}'",
                mask.dim(),
                samples.dim(),
                product.name()
            )));
        }
        ndarray::Zip::from(&mut samples).and(&mask).for_each(|v, &valid| {
            if !valid {
                *v = f32::NAN;
            }
        });
    }
    Ok(samples)
}

/// Opens raster products from files
pub trait ProductReader {
    fn open_product(&self, path: &Path) -> PercentileResult<Box<dyn RasterProduct>>;
}

/// In-memory product, used to embed the engine and in tests
#[derive(Debug, Clone)]
pub struct MemoryProduct {
    name: String,
    location: Option<PathBuf>,
    width: usize,
    height: usize,
    geo_coding: Option<GeoTransform>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    bands: Vec<(BandInfo, Array2<f32>)>,
    expressions: HashMap<String, Array2<f32>>,
    masks: HashMap<String, Array2<bool>>,
}

impl MemoryProduct {
    pub fn new(name: &str, width: usize, height: usize) -> Self {
        Self {
            name: name.to_string(),
            location: None,
            width,
            height,
            geo_coding: None,
            start_time: None,
            end_time: None,
            bands: Vec::new(),
            expressions: HashMap::new(),
            masks: HashMap::new(),
        }
    }

    pub fn with_location<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.location = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_geo_coding(mut self, transform: GeoTransform) -> Self {
        self.geo_coding = Some(transform);
        self
    }

    pub fn with_time_range(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn with_band(mut self, info: BandInfo, data: Array2<f32>) -> PercentileResult<Self> {
        self.check_shape(&info.name, data.dim())?;
        self.bands.retain(|(b, _)| b.name != info.name);
        self.bands.push((info, data));
        Ok(self)
    }

    /// Register the evaluated result of a band maths expression
    pub fn with_expression(mut self, expression: &str, data: Array2<f32>) -> PercentileResult<Self> {
        self.check_shape(expression, data.dim())?;
        self.expressions.insert(expression.trim().to_string(), data);
        Ok(self)
    }

    /// Register the evaluated result of a valid pixel expression
    pub fn with_valid_mask(mut self, expression: &str, mask: Array2<bool>) -> PercentileResult<Self> {
        self.check_shape(expression, mask.dim())?;
        self.masks.insert(expression.trim().to_string(), mask);
        Ok(self)
    }

    fn check_shape(&self, what: &str, dim: (usize, usize)) -> PercentileResult<()> {
        if dim != (self.height, self.width) {
            return Err(PercentileError::InvalidFormat(format!(
                "'{}' has shape {:?}, product '{}' is {}x{}",
                what, dim, self.name, self.width, self.height
            )));
        }
        Ok(())
    }

    fn check_window(&self, window: Window) -> PercentileResult<()> {
        if !window.fits_in(self.width, self.height) {
            return Err(PercentileError::Processing(format!(
                "Window {} exceeds product '{}' of size {}x{}",
                window, self.name, self.width, self.height
            )));
        }
        Ok(())
    }

    fn cut<T: Clone>(data: &Array2<T>, window: Window) -> Array2<T> {
        data.slice(s![window.y..window.y + window.height, window.x..window.x + window.width])
            .to_owned()
    }
}

impl RasterProduct for MemoryProduct {
    fn name(&self) -> &str {
        &self.name
    }

    fn file_location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    fn scene_size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn geo_coding(&self) -> Option<&dyn GeoCoding> {
        self.geo_coding.as_ref().map(|g| g as &dyn GeoCoding)
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    fn band(&self, name: &str) -> Option<&BandInfo> {
        self.bands.iter().map(|(info, _)| info).find(|info| info.name == name)
    }

    fn supports_expression(&self, expression: &str) -> bool {
        let expression = expression.trim();
        expression == ALWAYS_VALID_EXPRESSION
            || self.expressions.contains_key(expression)
            || self.masks.contains_key(expression)
    }

    fn read_samples(&self, source: &BandSource, window: Window) -> PercentileResult<RasterBuffer> {
        self.check_window(window)?;
        match source {
            BandSource::Band(name) => {
                let (info, data) = self
                    .bands
                    .iter()
                    .find(|(info, _)| &info.name == name)
                    .ok_or_else(|| {
                        PercentileError::Processing(format!("Product '{}' has no band '{}'", self.name, name))
                    })?;
                let mut samples = Self::cut(data, window);
                if let Some(no_data) = info.no_data_value {
                    samples.mapv_inplace(|v| if v as f64 == no_data { f32::NAN } else { v });
                }
                Ok(samples)
            }
            BandSource::Expression(expression) => self
                .expressions
                .get(expression.trim())
                .map(|data| Self::cut(data, window))
                .ok_or_else(|| {
                    PercentileError::Processing(format!(
                        "Expression '{}' cannot be resolved against product '{}'",
                        expression, self.name
                    ))
                }),
        }
    }

    fn read_valid_mask(&self, expression: &str, window: Window) -> PercentileResult<Array2<bool>> {
        self.check_window(window)?;
        let expression = expression.trim();
        if expression == ALWAYS_VALID_EXPRESSION {
            return Ok(Array2::from_elem(window.shape(), true));
        }
        if let Some(mask) = self.masks.get(expression) {
            return Ok(Self::cut(mask, window));
        }
        // numeric expressions double as masks: non-zero and not NaN is valid
        self.expressions
            .get(expression)
            .map(|data| Self::cut(data, window).mapv(|v| !v.is_nan() && v != 0.0))
            .ok_or_else(|| {
                PercentileError::Processing(format!(
                    "Valid pixel expression '{}' cannot be resolved against product '{}'",
                    expression, self.name
                ))
            })
    }
}

/// Serves clones of registered in-memory products by path
#[derive(Debug, Default)]
pub struct MemoryProductReader {
    products: HashMap<PathBuf, MemoryProduct>,
}

impl MemoryProductReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: AsRef<Path>>(&mut self, path: P, product: MemoryProduct) {
        let path = path.as_ref().to_path_buf();
        let product = product.with_location(&path);
        self.products.insert(path, product);
    }
}

impl ProductReader for MemoryProductReader {
    fn open_product(&self, path: &Path) -> PercentileResult<Box<dyn RasterProduct>> {
        self.products
            .get(path)
            .cloned()
            .map(|p| Box::new(p) as Box<dyn RasterProduct>)
            .ok_or_else(|| {
                PercentileError::InvalidFormat(format!("No reader found for '{}'", path.display()))
            })
    }
}

/// Tries a list of readers in order and returns the first product that opens
pub struct ChainedProductReader {
    readers: Vec<Box<dyn ProductReader>>,
}

impl ChainedProductReader {
    pub fn new(readers: Vec<Box<dyn ProductReader>>) -> Self {
        Self { readers }
    }
}

impl ProductReader for ChainedProductReader {
    fn open_product(&self, path: &Path) -> PercentileResult<Box<dyn RasterProduct>> {
        let mut last_error = None;
        for reader in &self.readers {
            match reader.open_product(path) {
                Ok(product) => return Ok(product),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            PercentileError::InvalidFormat(format!("No reader found for '{}'", path.display()))
        }))
    }
}
