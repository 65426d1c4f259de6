//! Coordinate reference systems of the target grid.
//!
//! Target bounds are always given in geographic WGS84. A grid in any other CRS
//! GDAL understands (authority codes, WKT, PROJ strings) is laid out over the
//! transformed bounds, and its pixel centres are transformed back to geographic
//! coordinates when sources are collocated onto it.

use crate::types::{BoundingBox, PercentileError, PercentileResult};
use gdal::spatial_ref::{CoordTransform, SpatialRef};

/// Geographic WGS84, the CRS of the target bounds and of source geocodings
pub const WGS84: &str = "EPSG:4326";

/// Points sampled along each edge when an envelope is transformed
const ENVELOPE_EDGE_STEPS: usize = 20;

pub fn is_wgs84(crs: &str) -> bool {
    crs.trim().eq_ignore_ascii_case(WGS84)
}

/// Parse a CRS definition. Axes are always ordered easting (longitude) first.
pub fn spatial_ref(definition: &str) -> PercentileResult<SpatialRef> {
    let srs = SpatialRef::from_definition(definition.trim())
        .map_err(|e| PercentileError::Config(format!("Unable to parse CRS '{}': {}", definition, e)))?;
    srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    Ok(srs)
}

/// Point transformation between two coordinate reference systems
pub struct CrsTransform {
    inner: CoordTransform,
    description: String,
}

impl CrsTransform {
    pub fn new(from: &str, to: &str) -> PercentileResult<Self> {
        let description = format!("{} to {}", from.trim(), to.trim());
        let inner = CoordTransform::new(&spatial_ref(from)?, &spatial_ref(to)?)
            .map_err(|e| PercentileError::Config(format!("No transformation from {}: {}", description, e)))?;
        Ok(Self { inner, description })
    }

    /// Transformation from `crs` into geographic WGS84
    pub fn to_geographic(crs: &str) -> PercentileResult<Self> {
        Self::new(crs, WGS84)
    }

    /// Transformation from geographic WGS84 into `crs`
    pub fn from_geographic(crs: &str) -> PercentileResult<Self> {
        Self::new(WGS84, crs)
    }

    pub fn transform_point(&self, (x, y): (f64, f64)) -> Option<(f64, f64)> {
        let (mut xs, mut ys, mut zs) = ([x], [y], [0.0]);
        self.inner.transform_coords(&mut xs, &mut ys, &mut zs).ok()?;
        Some((xs[0], ys[0])).filter(|(x, y)| x.is_finite() && y.is_finite())
    }

    /// Transform a batch of points. Points outside the domain of the
    /// transformation come back as `None`.
    pub fn transform_points(&self, points: &[(f64, f64)]) -> Vec<Option<(f64, f64)>> {
        let mut xs: Vec<f64> = points.iter().map(|p| p.0).collect();
        let mut ys: Vec<f64> = points.iter().map(|p| p.1).collect();
        let mut zs = vec![0.0; points.len()];
        if self.inner.transform_coords(&mut xs, &mut ys, &mut zs).is_ok() {
            return xs
                .into_iter()
                .zip(ys)
                .map(|(x, y)| Some((x, y)).filter(|(x, y)| x.is_finite() && y.is_finite()))
                .collect();
        }
        // one failing point fails the whole batch
        points.iter().map(|&p| self.transform_point(p)).collect()
    }

    /// Envelope of a box after transformation, densified along its edges
    pub fn transform_envelope(&self, bounds: &BoundingBox) -> PercentileResult<BoundingBox> {
        let steps = ENVELOPE_EDGE_STEPS;
        let mut points = Vec::with_capacity(4 * (steps + 1));
        for i in 0..=steps {
            let t = i as f64 / steps as f64;
            let x = bounds.min_lon + t * bounds.width();
            let y = bounds.min_lat + t * bounds.height();
            points.push((x, bounds.min_lat));
            points.push((x, bounds.max_lat));
            points.push((bounds.min_lon, y));
            points.push((bounds.max_lon, y));
        }
        BoundingBox::enclosing(self.transform_points(&points).into_iter().flatten()).ok_or_else(|| {
            PercentileError::Config(format!("Bounds {:?} cannot be transformed from {}", bounds, self.description))
        })
    }
}
