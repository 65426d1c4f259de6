use crate::core::percentile::PercentileComputer;
use crate::core::progress::{check_cancelled, ProgressMonitor};
use crate::io::sink::{PercentileSink, PercentileTile};
use crate::io::time_series::TimeSeriesReader;
use crate::types::{PercentileResult, PipelineStage, RasterBuffer, Window};
use ndarray::Array2;

/// Per-day rasters on the target grid, read window by window
pub trait DaySource {
    /// Scene size as `(width, height)`
    fn scene_size(&self) -> (usize, usize);

    /// Number of days in the series, with or without data
    fn series_length(&self) -> usize;

    /// One entry per day of the series, `None` for days without data
    fn read_day_windows(&self, window: Window) -> PercentileResult<Vec<Option<RasterBuffer>>>;
}

impl DaySource for TimeSeriesReader {
    fn scene_size(&self) -> (usize, usize) {
        TimeSeriesReader::scene_size(self)
    }

    fn series_length(&self) -> usize {
        TimeSeriesReader::series_length(self)
    }

    fn read_day_windows(&self, window: Window) -> PercentileResult<Vec<Option<RasterBuffer>>> {
        TimeSeriesReader::read_day_windows(self, window)
    }
}

/// Tiling parameters
#[derive(Debug, Clone)]
pub struct TileStackParams {
    pub tile_width: usize,
    pub tile_height: usize,
}

impl Default for TileStackParams {
    fn default() -> Self {
        Self {
            tile_width: 512,
            tile_height: 512,
        }
    }
}

/// Drives gap filling and percentile computation over the output tiles
pub struct TileStackProcessor<'a> {
    days: &'a dyn DaySource,
    computer: &'a PercentileComputer,
    percentiles: &'a [u8],
    params: TileStackParams,
}

impl<'a> TileStackProcessor<'a> {
    pub fn new(days: &'a dyn DaySource, computer: &'a PercentileComputer, percentiles: &'a [u8]) -> Self {
        Self::with_params(days, computer, percentiles, TileStackParams::default())
    }

    pub fn with_params(
        days: &'a dyn DaySource,
        computer: &'a PercentileComputer,
        percentiles: &'a [u8],
        params: TileStackParams,
    ) -> Self {
        Self {
            days,
            computer,
            percentiles,
            params,
        }
    }

    pub fn tiles(&self) -> Vec<Window> {
        let (width, height) = self.days.scene_size();
        Window::tiles(width, height, self.params.tile_width, self.params.tile_height)
    }

    /// Thresholds and counts of every pixel in `window`
    pub fn compute_tile(&self, window: Window) -> PercentileResult<PercentileTile> {
        let days = self
            .days
            .read_day_windows(window)
            .map_err(|e| e.in_stage(PipelineStage::TimeSeriesRead))?;

        let shape = window.shape();
        let mut thresholds = vec![Array2::from_elem(shape, f32::NAN); self.percentiles.len()];
        let mut counts = Array2::<u16>::zeros(shape);
        let mut series: Vec<Option<f32>> = vec![None; days.len()];

        for row in 0..window.height {
            for col in 0..window.width {
                for (sample, day) in series.iter_mut().zip(&days) {
                    *sample = day.as_ref().map(|d| d[[row, col]]).filter(|v| v.is_finite());
                }
                let stats = self.computer.compute(self.percentiles, &mut series)?;
                for (band, threshold) in thresholds.iter_mut().zip(&stats.thresholds) {
                    if let Some(value) = threshold {
                        band[[row, col]] = *value;
                    }
                }
                counts[[row, col]] = stats.count.min(u16::MAX as usize) as u16;
            }
        }
        Ok(PercentileTile {
            window,
            thresholds,
            counts,
        })
    }

    /// Compute every tile and hand it to `sink`. The sink must already be started.
    pub fn run(&self, sink: &mut dyn PercentileSink, progress: &mut dyn ProgressMonitor) -> PercentileResult<()> {
        let tiles = self.tiles();
        log::info!(
            "Computing {} percentiles over {} days in {} tiles",
            self.percentiles.len(),
            self.days.series_length(),
            tiles.len()
        );
        progress.begin_task("Computing percentiles", tiles.len());
        for window in tiles {
            check_cancelled(progress)?;
            let tile = self.compute_tile(window)?;
            sink.write_tile(&tile)
                .map_err(|e| e.in_stage(PipelineStage::TileWrite))?;
            progress.worked(1);
        }
        progress.done();
        Ok(())
    }
}
