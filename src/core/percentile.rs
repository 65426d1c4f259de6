use crate::core::gap_filler::fill_gaps;
use crate::core::interpolation::{GapFillingMethod, Interpolator};
use crate::types::PercentileResult;

/// Percentile thresholds and valid sample count of one pixel
#[derive(Debug, Clone, PartialEq)]
pub struct PixelStatistics {
    /// One threshold per requested percentile, `None` where no value could be derived
    pub thresholds: Vec<Option<f32>>,
    /// Number of originally valid samples in the series
    pub count: usize,
}

impl PixelStatistics {
    fn empty(percentile_count: usize, count: usize) -> Self {
        Self {
            thresholds: vec![None; percentile_count],
            count,
        }
    }
}

/// Nearest-rank percentile of an ascending sorted slice.
///
/// The rank is `floor(p / 100 * n)`, clamped to the last element so that the
/// 100th percentile is the maximum.
pub fn nearest_rank(sorted: &[f32], percentile: u8) -> Option<f32> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (percentile as f32 / 100.0 * sorted.len() as f32).floor() as usize;
    Some(sorted[rank.min(sorted.len() - 1)])
}

/// Thresholds for every requested percentile of an unsorted sample set
pub fn percentile_thresholds(mut values: Vec<f32>, percentiles: &[u8]) -> Vec<Option<f32>> {
    values.sort_by(|a, b| a.total_cmp(b));
    percentiles.iter().map(|&p| nearest_rank(&values, p)).collect()
}

/// Per-pixel percentile computation, selected once from the gap filling policy
pub enum PercentileComputer {
    /// Percentiles over the literal valid samples only
    ValidSamplesOnly,
    /// Percentiles over the complete gap-filled series
    GapFilled {
        interpolator: Box<dyn Interpolator>,
        start_fallback: f32,
        end_fallback: f32,
    },
}

impl PercentileComputer {
    pub fn new(method: GapFillingMethod, start_fallback: f32, end_fallback: f32) -> Self {
        match method.create_interpolator() {
            None => PercentileComputer::ValidSamplesOnly,
            Some(interpolator) => PercentileComputer::GapFilled {
                interpolator,
                start_fallback,
                end_fallback,
            },
        }
    }

    /// Minimum number of valid samples a pixel needs to get thresholds
    pub fn min_points(&self) -> usize {
        match self {
            PercentileComputer::ValidSamplesOnly => 1,
            PercentileComputer::GapFilled { interpolator, .. } => interpolator.min_points(),
        }
    }

    /// Compute thresholds and count for one pixel series. Gap filling mutates `series`.
    ///
    /// Non-finite samples count as missing. A series the interpolator cannot fit
    /// gets no thresholds; that is never an error for the whole run.
    pub fn compute(&self, percentiles: &[u8], series: &mut [Option<f32>]) -> PercentileResult<PixelStatistics> {
        for sample in series.iter_mut() {
            if sample.map_or(false, |v| !v.is_finite()) {
                *sample = None;
            }
        }
        let count = series.iter().filter(|v| v.is_some()).count();
        if count < self.min_points() {
            return Ok(PixelStatistics::empty(percentiles.len(), count));
        }

        let thresholds = match self {
            PercentileComputer::ValidSamplesOnly => {
                percentile_thresholds(series.iter().flatten().copied().collect(), percentiles)
            }
            PercentileComputer::GapFilled {
                interpolator,
                start_fallback,
                end_fallback,
            } => {
                if let Err(e) = fill_gaps(series, interpolator.as_ref(), *start_fallback, *end_fallback) {
                    log::debug!("Gap filling failed, pixel left without thresholds: {}", e);
                    return Ok(PixelStatistics::empty(percentiles.len(), count));
                }
                percentile_thresholds(series.iter().flatten().copied().collect(), percentiles)
            }
        };
        Ok(PixelStatistics { thresholds, count })
    }
}
