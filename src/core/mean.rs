use crate::io::product::{read_masked_samples, BandSource, RasterProduct};
use crate::types::{PercentileError, PercentileResult, PipelineStage, RasterBuffer, Window};
use ndarray::{Array2, ArrayView2, Zip};
use num_traits::Float;

/// Receives the mean strips of a day, in top-to-bottom order
pub trait StripSink {
    fn write_strip(&mut self, day: i64, window: Window, data: &RasterBuffer) -> PercentileResult<()>;
}

/// Daily mean synthesis parameters
#[derive(Debug, Clone)]
pub struct MeanSynthesisParams {
    /// Upper bound of pixels held per strip and source
    pub strip_pixel_budget: usize,
}

impl Default for MeanSynthesisParams {
    fn default() -> Self {
        Self {
            strip_pixel_budget: 5_000_000,
        }
    }
}

/// Height of the horizontal strips a `width` x `height` raster is processed in
pub fn strip_height(width: usize, height: usize, pixel_budget: usize) -> usize {
    (pixel_budget / width.max(1)).min(height).max(1)
}

/// Element-wise mean over rasters of identical shape, ignoring NaN samples.
///
/// A pixel is NaN only if every contribution is NaN.
pub fn nan_mean<T: Float>(sources: &[ArrayView2<T>]) -> PercentileResult<Array2<T>> {
    let first = sources
        .first()
        .ok_or_else(|| PercentileError::Processing("Mean of zero rasters requested".to_string()))?;
    let shape = first.dim();
    if let Some(other) = sources.iter().find(|s| s.dim() != shape) {
        return Err(PercentileError::Processing(format!(
            "Cannot average rasters of shapes {:?} and {:?}",
            shape,
            other.dim()
        )));
    }

    let mut sum = Array2::<T>::zeros(shape);
    let mut count = Array2::<u32>::zeros(shape);
    for source in sources {
        Zip::from(&mut sum).and(&mut count).and(source).for_each(|s, c, &v| {
            if !v.is_nan() {
                *s = *s + v;
                *c += 1;
            }
        });
    }

    let mut mean = sum;
    Zip::from(&mut mean).and(&count).for_each(|m, &c| {
        *m = if c == 0 {
            T::nan()
        } else {
            *m / T::from(c).unwrap_or_else(T::nan)
        };
    });
    Ok(mean)
}

/// Computes the collocated mean band of one day, strip by strip
pub struct DailyMeanSynthesizer<'a> {
    source: &'a BandSource,
    valid_expression: Option<&'a str>,
    params: MeanSynthesisParams,
}

impl<'a> DailyMeanSynthesizer<'a> {
    pub fn new(source: &'a BandSource, valid_expression: Option<&'a str>) -> Self {
        Self::with_params(source, valid_expression, MeanSynthesisParams::default())
    }

    pub fn with_params(source: &'a BandSource, valid_expression: Option<&'a str>, params: MeanSynthesisParams) -> Self {
        Self {
            source,
            valid_expression,
            params,
        }
    }

    /// Average the collocated products of `day` and hand every strip to `sink`.
    ///
    /// Only one strip per product is held in memory at a time.
    pub fn synthesize(
        &self,
        day: i64,
        collocated: &[Box<dyn RasterProduct + '_>],
        sink: &mut dyn StripSink,
    ) -> PercentileResult<()> {
        let first = collocated.first().ok_or_else(|| {
            PercentileError::Processing(format!("Day {} has no collocated products", day))
        })?;
        let (width, height) = first.scene_size();
        if let Some(p) = collocated.iter().find(|p| p.scene_size() != (width, height)) {
            return Err(PercentileError::Processing(format!(
                "Collocated product '{}' is {:?}, expected {}x{}",
                p.name(),
                p.scene_size(),
                width,
                height
            )));
        }

        let strip = strip_height(width, height, self.params.strip_pixel_budget);
        log::debug!(
            "Computing mean of {} products for day {} in strips of {} rows",
            collocated.len(),
            day,
            strip
        );

        let mut y = 0;
        while y < height {
            let window = Window::new(0, y, width, strip.min(height - y));
            let strips = collocated
                .iter()
                .map(|p| read_masked_samples(p.as_ref(), self.source, self.valid_expression, window))
                .collect::<PercentileResult<Vec<_>>>()
                .map_err(|e| e.in_stage(PipelineStage::SourceRead))?;
            let views: Vec<_> = strips.iter().map(|s| s.view()).collect();
            let mean = nan_mean(&views)?;
            drop(views);
            drop(strips);

            sink.write_strip(day, window, &mean)
                .map_err(|e| e.in_stage(PipelineStage::TimeSeriesWrite))?;
            y += window.height;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::product::{BandInfo, MemoryProduct};
    use ndarray::array;

    struct CollectingSink {
        strips: Vec<(i64, Window, RasterBuffer)>,
    }

    impl StripSink for CollectingSink {
        fn write_strip(&mut self, day: i64, window: Window, data: &RasterBuffer) -> PercentileResult<()> {
            self.strips.push((day, window, data.clone()));
            Ok(())
        }
    }

    #[test]
    fn test_nan_mean_ignores_missing_samples() {
        let a = array![[1.0f32, f32::NAN], [f32::NAN, 4.0]];
        let b = array![[3.0f32, 2.0], [f32::NAN, f32::NAN]];
        let mean = nan_mean(&[a.view(), b.view()]).unwrap();
        assert_eq!(mean[[0, 0]], 2.0);
        assert_eq!(mean[[0, 1]], 2.0);
        assert!(mean[[1, 0]].is_nan());
        assert_eq!(mean[[1, 1]], 4.0);
    }

    #[test]
    fn test_nan_mean_is_generic_over_precision() {
        let a = array![[1.0f64, 2.0]];
        let b = array![[2.0f64, f64::NAN]];
        let mean = nan_mean(&[a.view(), b.view()]).unwrap();
        assert_eq!(mean, array![[1.5, 2.0]]);
    }

    #[test]
    fn test_nan_mean_rejects_mismatched_shapes() {
        let a = Array2::<f32>::zeros((2, 2));
        let b = Array2::<f32>::zeros((2, 3));
        assert!(nan_mean(&[a.view(), b.view()]).is_err());
        assert!(nan_mean::<f32>(&[]).is_err());
    }

    #[test]
    fn test_strip_height() {
        assert_eq!(strip_height(1000, 20000, 5_000_000), 5000);
        assert_eq!(strip_height(1000, 300, 5_000_000), 300);
        assert_eq!(strip_height(10_000_000, 300, 5_000_000), 1);
    }

    #[test]
    fn test_synthesize_streams_strips() {
        let band = BandSource::Band("b".to_string());
        let p1 = MemoryProduct::new("p1", 2, 3)
            .with_band(BandInfo::new("b"), array![[1.0, 2.0], [3.0, f32::NAN], [5.0, 6.0]])
            .unwrap();
        let p2 = MemoryProduct::new("p2", 2, 3)
            .with_band(BandInfo::new("b"), array![[3.0, f32::NAN], [5.0, f32::NAN], [7.0, 8.0]])
            .unwrap();
        let products: Vec<Box<dyn RasterProduct>> = vec![Box::new(p1), Box::new(p2)];

        let synthesizer = DailyMeanSynthesizer::with_params(&band, None, MeanSynthesisParams { strip_pixel_budget: 4 });
        let mut sink = CollectingSink { strips: Vec::new() };
        synthesizer.synthesize(58000, &products, &mut sink).unwrap();

        assert_eq!(sink.strips.len(), 2);
        assert_eq!(sink.strips[0].1, Window::new(0, 0, 2, 2));
        assert_eq!(sink.strips[1].1, Window::new(0, 2, 2, 1));
        assert_eq!(sink.strips[0].2[[0, 0]], 2.0);
        assert_eq!(sink.strips[0].2[[0, 1]], 2.0);
        assert!(sink.strips[0].2[[1, 1]].is_nan());
        assert_eq!(sink.strips[1].2, array![[6.0, 7.0]]);
    }
}
