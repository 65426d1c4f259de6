//! temporal-percentile: gap-filled per-pixel temporal percentiles
//!
//! Reads a time series of georeferenced raster products, averages the products of
//! each day onto a common target grid, fills the days without data by temporal
//! interpolation and derives per-pixel percentile thresholds plus a count of valid
//! observations.
//!
//! The pipeline runs in two phases. The daily means are written band by band into
//! an intermediate time series store, which is then read back tile by tile to
//! compute the percentiles:
//!
//! ```no_run
//! use temporal_percentile::{
//!     LogProgress, RasterStoreProductReader, StoreSink, TemporalPercentileOp, TemporalPercentileParams,
//! };
//!
//! let params = TemporalPercentileParams::from_json_file("params.json")?;
//! let reader = RasterStoreProductReader;
//! let op = TemporalPercentileOp::new(params, &reader)?;
//! let mut sink = StoreSink::new("out");
//! op.run(&mut sink, &mut LogProgress::new())?;
//! # Ok::<(), temporal_percentile::PercentileError>(())
//! ```

pub mod config;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use config::TemporalPercentileParams;
pub use types::{BoundingBox, GeoCoding, GeoTransform, PercentileError, PercentileResult, PipelineStage, TargetGrid, Window};

pub use core::{
    GapFillingMethod, LogProgress, NullProgress, PercentileComputer, ProgressMonitor, ResamplingMethod, RunSummary,
    TemporalPercentileOp,
};
pub use io::{
    BandSource, ChainedProductReader, GdalProductReader, GeoTiffSink, MemoryProduct, MemoryProductReader, MemorySink,
    PercentileProduct, PercentileSink, ProductLoader, ProductReader, RasterProduct, RasterStoreProductReader,
    RasterStoreReader, StoreSink,
};
