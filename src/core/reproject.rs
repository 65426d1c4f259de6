use crate::core::crs::CrsTransform;
use crate::io::product::{BandInfo, BandSource, RasterProduct};
use crate::types::{GeoCoding, PercentileError, PercentileResult, RasterBuffer, TargetGrid, Window};
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Resampling used when collocating a source onto the target grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResamplingMethod {
    #[default]
    Nearest,
    Bilinear,
    Bicubic,
}

impl fmt::Display for ResamplingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResamplingMethod::Nearest => write!(f, "Nearest"),
            ResamplingMethod::Bilinear => write!(f, "Bilinear"),
            ResamplingMethod::Bicubic => write!(f, "Bicubic"),
        }
    }
}

impl FromStr for ResamplingMethod {
    type Err = PercentileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nearest" => Ok(ResamplingMethod::Nearest),
            "bilinear" => Ok(ResamplingMethod::Bilinear),
            "bicubic" => Ok(ResamplingMethod::Bicubic),
            other => Err(PercentileError::Config(format!(
                "Unknown resampling method '{}', expected Nearest, Bilinear or Bicubic",
                other
            ))),
        }
    }
}

/// Collocates a product onto the target grid.
///
/// The returned product must have exactly the grid's size and geocoding.
pub trait Reprojector {
    fn reproject<'a>(
        &self,
        source: &'a dyn RasterProduct,
        grid: &TargetGrid,
        resampling: ResamplingMethod,
    ) -> PercentileResult<Box<dyn RasterProduct + 'a>>;
}

/// Reprojects through the geocodings of source and target, resampling lazily per read window
#[derive(Debug, Clone, Copy, Default)]
pub struct GridResampler;

impl Reprojector for GridResampler {
    fn reproject<'a>(
        &self,
        source: &'a dyn RasterProduct,
        grid: &TargetGrid,
        resampling: ResamplingMethod,
    ) -> PercentileResult<Box<dyn RasterProduct + 'a>> {
        match source.geo_coding() {
            Some(geo_coding) if geo_coding.can_get_pixel_pos() => {}
            _ => {
                return Err(PercentileError::Processing(format!(
                    "Product '{}' has no invertible geocoding and cannot be collocated",
                    source.name()
                )))
            }
        }
        let to_geographic = if grid.is_geographic() {
            None
        } else {
            Some(CrsTransform::to_geographic(&grid.crs)?)
        };
        log::debug!(
            "Collocating '{}' onto {}x{} grid in {} using {} resampling",
            source.name(),
            grid.width,
            grid.height,
            grid.crs,
            resampling
        );
        Ok(Box::new(CollocatedProduct {
            source,
            grid: grid.clone(),
            to_geographic,
            resampling,
        }))
    }
}

/// A source product seen through the target grid
pub struct CollocatedProduct<'a> {
    source: &'a dyn RasterProduct,
    grid: TargetGrid,
    /// Set when the grid is not in geographic WGS84
    to_geographic: Option<CrsTransform>,
    resampling: ResamplingMethod,
}

/// Source pixel-centre positions of the target pixels of a window, plus the
/// source window enclosing everything the resampling kernels may touch
struct SourceFootprint {
    positions: Vec<Option<(f64, f64)>>,
    window: Option<Window>,
}

impl<'a> CollocatedProduct<'a> {
    /// Geographic positions of the target pixel centres of a window, row major
    fn geographic_centres(&self, window: Window) -> Vec<Option<(f64, f64)>> {
        let mut centres = Vec::with_capacity(window.pixel_count());
        for y in window.y..window.y + window.height {
            for x in window.x..window.x + window.width {
                centres.push(self.grid.pixel_center(x, y));
            }
        }
        match &self.to_geographic {
            Some(transform) => transform.transform_points(&centres),
            None => centres.into_iter().map(Some).collect(),
        }
    }

    fn source_footprint(&self, window: Window) -> PercentileResult<SourceFootprint> {
        let geo_coding = self.source.geo_coding().ok_or_else(|| {
            PercentileError::Processing(format!("Product '{}' lost its geocoding", self.source.name()))
        })?;
        let (source_width, source_height) = self.source.scene_size();
        let (sw, sh) = (source_width as f64, source_height as f64);

        let mut positions = Vec::with_capacity(window.pixel_count());
        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for centre in self.geographic_centres(window) {
            // shift to centre-based coordinates: pixel i spans [i - 0.5, i + 0.5)
            let position = centre
                .and_then(|(lon, lat)| geo_coding.pixel_pos(lon, lat))
                .map(|(px, py)| (px - 0.5, py - 0.5))
                .filter(|&(fx, fy)| fx >= -0.5 && fx < sw - 0.5 && fy >= -0.5 && fy < sh - 0.5);
            if let Some((fx, fy)) = position {
                min_x = min_x.min(fx);
                min_y = min_y.min(fy);
                max_x = max_x.max(fx);
                max_y = max_y.max(fy);
            }
            positions.push(position);
        }

        let source_window = if min_x.is_finite() {
            let clamp = |v: f64, size: usize| (v.max(0.0) as usize).min(size - 1);
            let x0 = clamp(min_x.floor() - 1.0, source_width);
            let y0 = clamp(min_y.floor() - 1.0, source_height);
            let x1 = clamp(max_x.floor() + 2.0, source_width);
            let y1 = clamp(max_y.floor() + 2.0, source_height);
            Some(Window::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1))
        } else {
            None
        };

        Ok(SourceFootprint {
            positions,
            window: source_window,
        })
    }

    fn resample<T: Copy>(
        &self,
        window: Window,
        footprint: &SourceFootprint,
        data: &Array2<T>,
        fill: T,
        sample: impl Fn(&Array2<T>, Window, (f64, f64), (usize, usize)) -> T,
    ) -> Array2<T> {
        let source_size = self.source.scene_size();
        let source_window = match footprint.window {
            Some(w) => w,
            None => return Array2::from_elem(window.shape(), fill),
        };
        let values = footprint
            .positions
            .iter()
            .map(|p| match p {
                Some(position) => sample(data, source_window, *position, source_size),
                None => fill,
            })
            .collect();
        // positions hold exactly one entry per window pixel
        Array2::from_shape_vec(window.shape(), values).unwrap_or_else(|_| Array2::from_elem(window.shape(), fill))
    }

    fn check_window(&self, window: Window) -> PercentileResult<()> {
        if !window.fits_in(self.grid.width, self.grid.height) {
            return Err(PercentileError::Processing(format!(
                "Window {} exceeds target grid {}x{}",
                window, self.grid.width, self.grid.height
            )));
        }
        Ok(())
    }
}

fn local(data_index: i64, size: usize, origin: usize) -> usize {
    (data_index.clamp(0, size as i64 - 1) as usize) - origin
}

fn sample_nearest<T: Copy>(data: &Array2<T>, w: Window, (fx, fy): (f64, f64), size: (usize, usize)) -> T {
    let x = local(fx.round() as i64, size.0, w.x);
    let y = local(fy.round() as i64, size.1, w.y);
    data[[y, x]]
}

fn sample_bilinear(data: &RasterBuffer, w: Window, (fx, fy): (f64, f64), size: (usize, usize)) -> f32 {
    let bx = fx.floor();
    let by = fy.floor();
    let x0 = local(bx as i64, size.0, w.x);
    let x1 = local(bx as i64 + 1, size.0, w.x);
    let y0 = local(by as i64, size.1, w.y);
    let y1 = local(by as i64 + 1, size.1, w.y);
    let xf = (fx - bx) as f32;
    let yf = (fy - by) as f32;

    let v00 = data[[y0, x0]];
    let v10 = data[[y0, x1]];
    let v01 = data[[y1, x0]];
    let v11 = data[[y1, x1]];
    if v00.is_nan() || v10.is_nan() || v01.is_nan() || v11.is_nan() {
        return f32::NAN;
    }
    let top = v00 * (1.0 - xf) + v10 * xf;
    let bottom = v01 * (1.0 - xf) + v11 * xf;
    top * (1.0 - yf) + bottom * yf
}

fn catmull_rom(p: [f32; 4], t: f32) -> f32 {
    let t2 = t * t;
    let t3 = t2 * t;
    0.5 * ((2.0 * p[1])
        + (-p[0] + p[2]) * t
        + (2.0 * p[0] - 5.0 * p[1] + 4.0 * p[2] - p[3]) * t2
        + (-p[0] + 3.0 * p[1] - 3.0 * p[2] + p[3]) * t3)
}

fn sample_bicubic(data: &RasterBuffer, w: Window, (fx, fy): (f64, f64), size: (usize, usize)) -> f32 {
    let bx = fx.floor() as i64;
    let by = fy.floor() as i64;
    let tx = (fx - bx as f64) as f32;
    let ty = (fy - by as f64) as f32;

    let mut rows = [0.0f32; 4];
    for (j, row) in rows.iter_mut().enumerate() {
        let y = local(by - 1 + j as i64, size.1, w.y);
        let mut p = [0.0f32; 4];
        for (i, v) in p.iter_mut().enumerate() {
            *v = data[[y, local(bx - 1 + i as i64, size.0, w.x)]];
        }
        if p.iter().any(|v| v.is_nan()) {
            return f32::NAN;
        }
        *row = catmull_rom(p, tx);
    }
    catmull_rom(rows, ty)
}

impl<'a> RasterProduct for CollocatedProduct<'a> {
    fn name(&self) -> &str {
        self.source.name()
    }

    fn file_location(&self) -> Option<&Path> {
        self.source.file_location()
    }

    fn scene_size(&self) -> (usize, usize) {
        (self.grid.width, self.grid.height)
    }

    fn geo_coding(&self) -> Option<&dyn GeoCoding> {
        Some(&self.grid.transform as &dyn GeoCoding)
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        self.source.start_time()
    }

    fn end_time(&self) -> Option<DateTime<Utc>> {
        self.source.end_time()
    }

    fn band(&self, name: &str) -> Option<&BandInfo> {
        self.source.band(name)
    }

    fn supports_expression(&self, expression: &str) -> bool {
        self.source.supports_expression(expression)
    }

    fn read_samples(&self, source: &BandSource, window: Window) -> PercentileResult<RasterBuffer> {
        self.check_window(window)?;
        let footprint = self.source_footprint(window)?;
        let data = match footprint.window {
            Some(w) => self.source.read_samples(source, w)?,
            None => return Ok(Array2::from_elem(window.shape(), f32::NAN)),
        };
        let resampled = match self.resampling {
            ResamplingMethod::Nearest => self.resample(window, &footprint, &data, f32::NAN, sample_nearest),
            ResamplingMethod::Bilinear => self.resample(window, &footprint, &data, f32::NAN, sample_bilinear),
            ResamplingMethod::Bicubic => self.resample(window, &footprint, &data, f32::NAN, sample_bicubic),
        };
        Ok(resampled)
    }

    /// Masks are always resampled with nearest neighbour
    fn read_valid_mask(&self, expression: &str, window: Window) -> PercentileResult<Array2<bool>> {
        self.check_window(window)?;
        let footprint = self.source_footprint(window)?;
        let mask = match footprint.window {
            Some(w) => self.source.read_valid_mask(expression, w)?,
            None => return Ok(Array2::from_elem(window.shape(), false)),
        };
        Ok(self.resample(window, &footprint, &mask, false, sample_nearest))
    }
}
