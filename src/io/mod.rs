//! Product model, file discovery and persisted rasters

pub mod gdal_io;
pub mod loader;
pub mod product;
pub mod sink;
pub mod store;
pub mod time_series;

pub use gdal_io::{GdalProduct, GdalProductReader, GeoTiffSink};
pub use loader::{expand_pattern, ProductLoader};
pub use product::{
    BandInfo, BandSource, ChainedProductReader, MemoryProduct, MemoryProductReader, ProductReader, RasterProduct,
};
pub use sink::{MemorySink, OutputLayout, PercentileProduct, PercentileSink, PercentileTile, StoreSink};
pub use store::{RasterStoreProductReader, RasterStoreReader, RasterStoreWriter, StoreHeader};
pub use time_series::{TimeSeriesLayout, TimeSeriesReader, TimeSeriesWriter};
