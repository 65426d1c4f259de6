use crate::core::interpolation::Interpolator;
use crate::types::{PercentileError, PercentileResult};

/// Fill the gaps of a per-pixel time series in place.
///
/// Missing boundary samples are set to their fallback values first. The
/// interpolator is then fitted through every present sample and the whole
/// series, originally valid samples included, is replaced by the fitted curve.
pub fn fill_gaps(
    series: &mut [Option<f32>],
    interpolator: &dyn Interpolator,
    start_fallback: f32,
    end_fallback: f32,
) -> PercentileResult<()> {
    if series.is_empty() {
        return Err(PercentileError::Processing("Cannot fill gaps of an empty time series".to_string()));
    }
    let last = series.len() - 1;
    if series[0].is_none() {
        series[0] = Some(start_fallback);
    }
    if series[last].is_none() {
        series[last] = Some(end_fallback);
    }

    let (x, y): (Vec<f64>, Vec<f64>) = series
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|v| (i as f64, v as f64)))
        .unzip();

    let curve = interpolator.interpolate(&x, &y)?;
    for (i, sample) in series.iter_mut().enumerate() {
        *sample = Some(curve.value(i as f64) as f32);
    }
    Ok(())
}
