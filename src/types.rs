use crate::core::crs;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Real-valued raster window (rows x columns)
pub type RasterBuffer = Array2<f32>;

/// Rectangular pixel window inside a raster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self { x, y, width, height }
    }

    /// Window covering a whole scene
    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Shape in ndarray order (rows, columns)
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the window lies completely inside a `width` x `height` scene
    pub fn fits_in(&self, width: usize, height: usize) -> bool {
        self.x + self.width <= width && self.y + self.height <= height
    }

    /// Split a scene into tiles of at most `tile_width` x `tile_height`, row major
    pub fn tiles(width: usize, height: usize, tile_width: usize, tile_height: usize) -> Vec<Window> {
        let tile_width = tile_width.max(1);
        let tile_height = tile_height.max(1);
        let mut tiles = Vec::new();
        let mut y = 0;
        while y < height {
            let h = tile_height.min(height - y);
            let mut x = 0;
            while x < width {
                let w = tile_width.min(width - x);
                tiles.push(Window::new(x, y, w, h));
                x += w;
            }
            y += h;
        }
        tiles
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[x={}, y={}, {}x{}]", self.x, self.y, self.width, self.height)
    }
}

/// Geospatial bounding box
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Build a box from two diagonal corners given in any order
    pub fn from_diagonal(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> Self {
        Self {
            min_lon: lon1.min(lon2),
            max_lon: lon1.max(lon2),
            min_lat: lat1.min(lat2),
            max_lat: lat1.max(lat2),
        }
    }

    /// Smallest box enclosing all points, `None` for an empty input
    pub fn enclosing<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Option<Self> {
        let mut bbox: Option<BoundingBox> = None;
        for (lon, lat) in points {
            if !lon.is_finite() || !lat.is_finite() {
                continue;
            }
            bbox = Some(match bbox {
                None => BoundingBox::from_diagonal(lon, lat, lon, lat),
                Some(b) => BoundingBox {
                    min_lon: b.min_lon.min(lon),
                    max_lon: b.max_lon.max(lon),
                    min_lat: b.min_lat.min(lat),
                    max_lat: b.max_lat.max(lat),
                },
            });
        }
        bbox
    }

    /// Area overlap test. Touching edges do not count as an intersection.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon < other.max_lon
            && other.min_lon < self.max_lon
            && self.min_lat < other.max_lat
            && other.min_lat < self.max_lat
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }
}

/// Mapping between pixel and geographic coordinates of a raster
pub trait GeoCoding {
    /// Whether geographic positions can be derived from pixel positions
    fn can_get_geo_pos(&self) -> bool;

    /// Whether pixel positions can be derived from geographic positions
    fn can_get_pixel_pos(&self) -> bool;

    /// Geographic position `(lon, lat)` of a (sub-)pixel position
    fn geo_pos(&self, pixel_x: f64, pixel_y: f64) -> Option<(f64, f64)>;

    /// Pixel position `(x, y)` of a geographic position
    fn pixel_pos(&self, lon: f64, lat: f64) -> Option<(f64, f64)>;

    /// Geographic footprint of a `width` x `height` scene, sampled along its border
    fn footprint(&self, width: usize, height: usize) -> Option<BoundingBox> {
        if width == 0 || height == 0 || !self.can_get_geo_pos() {
            return None;
        }
        let w = width as f64;
        let h = height as f64;
        let steps = 16;
        let mut points = Vec::with_capacity(4 * (steps + 1));
        for i in 0..=steps {
            let t = i as f64 / steps as f64;
            points.push((t * w, 0.0));
            points.push((t * w, h));
            points.push((0.0, t * h));
            points.push((w, t * h));
        }
        BoundingBox::enclosing(points.into_iter().filter_map(|(x, y)| self.geo_pos(x, y)))
    }
}

/// Geospatial transformation parameters (GDAL affine order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform without rotation
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_size_x: f64, pixel_size_y: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: pixel_size_x,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_size_y,
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    fn determinant(&self) -> f64 {
        self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y
    }
}

impl GeoCoding for GeoTransform {
    fn can_get_geo_pos(&self) -> bool {
        self.to_gdal().iter().all(|v| v.is_finite())
    }

    fn can_get_pixel_pos(&self) -> bool {
        let det = self.determinant();
        self.can_get_geo_pos() && det.is_finite() && det != 0.0
    }

    fn geo_pos(&self, pixel_x: f64, pixel_y: f64) -> Option<(f64, f64)> {
        if !self.can_get_geo_pos() {
            return None;
        }
        let lon = self.top_left_x + pixel_x * self.pixel_width + pixel_y * self.rotation_x;
        let lat = self.top_left_y + pixel_x * self.rotation_y + pixel_y * self.pixel_height;
        Some((lon, lat))
    }

    fn pixel_pos(&self, lon: f64, lat: f64) -> Option<(f64, f64)> {
        if !self.can_get_pixel_pos() {
            return None;
        }
        let det = self.determinant();
        let dx = lon - self.top_left_x;
        let dy = lat - self.top_left_y;
        let x = (dx * self.pixel_height - dy * self.rotation_x) / det;
        let y = (dy * self.pixel_width - dx * self.rotation_y) / det;
        Some((x, y))
    }
}

/// The shared output grid every participating raster is collocated onto
#[derive(Debug, Clone, PartialEq)]
pub struct TargetGrid {
    pub crs: String,
    pub width: usize,
    pub height: usize,
    /// Affine transform in the units of `crs`
    pub transform: GeoTransform,
    /// Geographic WGS84 area the grid was laid out for
    pub geographic_area: BoundingBox,
}

impl TargetGrid {
    /// Build a north-up grid in `crs` over geographic bounds.
    ///
    /// For other CRSs than geographic WGS84 the bounds are transformed first and the
    /// grid covers their envelope. Width and height are the floored number of whole
    /// pixels fitting the envelope.
    pub fn from_bounds(
        crs: &str,
        bounds: &BoundingBox,
        pixel_size_x: f64,
        pixel_size_y: f64,
    ) -> PercentileResult<Self> {
        if !(pixel_size_x > 0.0 && pixel_size_y > 0.0) {
            return Err(PercentileError::Config(format!(
                "Pixel sizes must be positive, got {} x {}",
                pixel_size_x, pixel_size_y
            )));
        }
        let geographic = crs::is_wgs84(crs);
        let envelope = if geographic {
            bounds.clone()
        } else {
            crs::CrsTransform::from_geographic(crs)?.transform_envelope(bounds)?
        };
        let width = (envelope.width() / pixel_size_x).floor();
        let height = (envelope.height() / pixel_size_y).floor();
        if width < 1.0 || height < 1.0 {
            return Err(PercentileError::Config(format!(
                "Spatial bounds {:?} with pixel size {} x {} result in an empty grid",
                bounds, pixel_size_x, pixel_size_y
            )));
        }
        let (width, height) = (width as usize, height as usize);
        let transform = GeoTransform::north_up(envelope.min_lon, envelope.max_lat, pixel_size_x, pixel_size_y);
        let geographic_area = if geographic {
            grid_extent(&transform, width, height)
        } else {
            bounds.clone()
        };
        Ok(Self {
            crs: crs.trim().to_string(),
            width,
            height,
            transform,
            geographic_area,
        })
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_geographic(&self) -> bool {
        crs::is_wgs84(&self.crs)
    }

    /// Geographic area covered by the grid
    pub fn area(&self) -> BoundingBox {
        self.geographic_area.clone()
    }

    /// Centre of a target pixel in grid CRS coordinates
    pub fn pixel_center(&self, x: usize, y: usize) -> (f64, f64) {
        let cx = self.transform.top_left_x + (x as f64 + 0.5) * self.transform.pixel_width;
        let cy = self.transform.top_left_y + (y as f64 + 0.5) * self.transform.pixel_height;
        (cx, cy)
    }
}

fn grid_extent(transform: &GeoTransform, width: usize, height: usize) -> BoundingBox {
    let (west, north) = (transform.top_left_x, transform.top_left_y);
    let east = west + width as f64 * transform.pixel_width;
    let south = north + height as f64 * transform.pixel_height;
    BoundingBox::from_diagonal(west, north, east, south)
}

/// Pipeline stage named by fatal errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// Reading source or collocated product data
    SourceRead,
    /// Writing the intermediate time series product
    TimeSeriesWrite,
    /// Reading the intermediate time series product back
    TimeSeriesRead,
    /// Writing percentile tiles to the output sink
    TileWrite,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::SourceRead => write!(f, "Unable to load source tiles"),
            PipelineStage::TimeSeriesWrite => write!(f, "Unable to write timeseries data product"),
            PipelineStage::TimeSeriesRead => write!(f, "Unable to read timeseries data product"),
            PipelineStage::TileWrite => write!(f, "Unable to write percentile tiles"),
        }
    }
}

/// Error types for temporal percentile processing
#[derive(Debug, thiserror::Error)]
pub enum PercentileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("{stage}: {source}")]
    Stage {
        stage: PipelineStage,
        #[source]
        source: Box<PercentileError>,
    },

    #[error("Processing cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

impl PercentileError {
    /// Wrap an error as fatal failure of a pipeline stage
    pub fn in_stage(self, stage: PipelineStage) -> Self {
        match self {
            PercentileError::Stage { .. } | PercentileError::Cancelled => self,
            other => PercentileError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }
}

/// Result type for percentile operations
pub type PercentileResult<T> = Result<T, PercentileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_transform_round_trip() {
        let gt = GeoTransform::north_up(10.0, 50.0, 0.1, 0.1);
        let (lon, lat) = gt.geo_pos(5.0, 2.0).unwrap();
        assert!((lon - 10.5).abs() < 1e-12);
        assert!((lat - 49.8).abs() < 1e-12);

        let (x, y) = gt.pixel_pos(lon, lat).unwrap();
        assert!((x - 5.0).abs() < 1e-9);
        assert!((y - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_singular_transform_is_not_invertible() {
        let gt = GeoTransform {
            top_left_x: 0.0,
            pixel_width: 0.0,
            rotation_x: 0.0,
            top_left_y: 0.0,
            rotation_y: 0.0,
            pixel_height: -1.0,
        };
        assert!(gt.can_get_geo_pos());
        assert!(!gt.can_get_pixel_pos());
        assert!(gt.pixel_pos(1.0, 1.0).is_none());
    }

    #[test]
    fn test_target_grid_from_bounds() {
        let bounds = BoundingBox::from_diagonal(-15.0, 75.0, 30.0, 35.0);
        let grid = TargetGrid::from_bounds("EPSG:4326", &bounds, 0.05, 0.05).unwrap();
        assert_eq!(grid.width, 900);
        assert_eq!(grid.height, 800);
        assert_eq!(grid.area(), bounds);

        let empty = BoundingBox::from_diagonal(0.0, 1.0, 0.01, 0.0);
        assert!(TargetGrid::from_bounds("EPSG:4326", &empty, 0.05, 0.05).is_err());
    }

    #[test]
    fn test_projected_target_grid_covers_transformed_bounds() {
        let bounds = BoundingBox::from_diagonal(0.0, 2.0, 2.0, 0.0);
        let grid = TargetGrid::from_bounds("EPSG:3857", &bounds, 50_000.0, 50_000.0).unwrap();
        assert!(!grid.is_geographic());
        // 222639 m wide and 222684 m high
        assert_eq!((grid.width, grid.height), (4, 4));
        assert!((grid.transform.top_left_x - 0.0).abs() < 1e-6);
        assert!((grid.transform.top_left_y - 222_684.208_506).abs() < 1e-3);
        assert_eq!(grid.area(), bounds);

        assert!(matches!(
            TargetGrid::from_bounds("EPSG:no-such-code", &bounds, 1.0, 1.0),
            Err(PercentileError::Config(_))
        ));
    }

    #[test]
    fn test_tiles_cover_scene() {
        let tiles = Window::tiles(10, 7, 4, 3);
        assert_eq!(tiles.len(), 9);
        let covered: usize = tiles.iter().map(|t| t.pixel_count()).sum();
        assert_eq!(covered, 70);
        assert_eq!(tiles[8], Window::new(8, 6, 2, 1));
    }

    #[test]
    fn test_footprint_and_intersection() {
        let gt = GeoTransform::north_up(0.0, 10.0, 1.0, 1.0);
        let footprint = gt.footprint(10, 10).unwrap();
        assert_eq!(footprint, BoundingBox::from_diagonal(0.0, 10.0, 10.0, 0.0));

        let inside = BoundingBox::from_diagonal(5.0, 5.0, 15.0, 15.0);
        let touching = BoundingBox::from_diagonal(10.0, 0.0, 20.0, 10.0);
        assert!(footprint.intersects(&inside));
        assert!(!footprint.intersects(&touching));
    }
}
