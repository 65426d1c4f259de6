//! Core temporal percentile processing modules

pub mod crs;
pub mod gap_filler;
pub mod grouping;
pub mod interpolation;
pub mod mean;
pub mod operator;
pub mod percentile;
pub mod progress;
pub mod reproject;
pub mod tile_stack;
pub mod validator;

// Re-export main types
pub use crs::{CrsTransform, WGS84};
pub use grouping::{modified_julian_day, DailyGroups};
pub use interpolation::{GapFillingMethod, Interpolator};
pub use mean::{DailyMeanSynthesizer, MeanSynthesisParams};
pub use operator::{check_memory_needs, RunSummary, TemporalPercentileOp};
pub use percentile::{PercentileComputer, PixelStatistics};
pub use progress::{LogProgress, NullProgress, ProgressMonitor};
pub use reproject::{GridResampler, Reprojector, ResamplingMethod};
pub use tile_stack::{DaySource, TileStackParams, TileStackProcessor};
pub use validator::{ProductValidator, RejectReason};
