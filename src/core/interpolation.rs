use crate::types::{PercentileError, PercentileResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Gap filling policy for per-pixel time series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GapFillingMethod {
    /// Only literal samples feed the percentile computation
    #[serde(rename = "noGapFilling")]
    NoGapFilling,
    /// Piecewise linear interpolation
    #[default]
    #[serde(rename = "gapFillingLinearInterpolation")]
    LinearInterpolation,
    /// Natural cubic spline interpolation
    #[serde(rename = "gapFillingSplineInterpolation")]
    SplineInterpolation,
    /// Piecewise quadratic interpolation
    #[serde(rename = "gapFillingQuadraticInterpolation")]
    QuadraticInterpolation,
}

impl GapFillingMethod {
    pub const ALL: [GapFillingMethod; 4] = [
        GapFillingMethod::NoGapFilling,
        GapFillingMethod::LinearInterpolation,
        GapFillingMethod::SplineInterpolation,
        GapFillingMethod::QuadraticInterpolation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            GapFillingMethod::NoGapFilling => "noGapFilling",
            GapFillingMethod::LinearInterpolation => "gapFillingLinearInterpolation",
            GapFillingMethod::SplineInterpolation => "gapFillingSplineInterpolation",
            GapFillingMethod::QuadraticInterpolation => "gapFillingQuadraticInterpolation",
        }
    }

    /// Minimum number of valid samples a pixel needs for this policy
    pub fn min_points(&self) -> usize {
        match self.create_interpolator() {
            Some(interpolator) => interpolator.min_points(),
            None => 1,
        }
    }

    /// Spline and quadratic fits need at least three knots
    pub fn is_non_linear(&self) -> bool {
        matches!(
            self,
            GapFillingMethod::SplineInterpolation | GapFillingMethod::QuadraticInterpolation
        )
    }

    /// Interpolator backing the policy, `None` when gaps are not filled
    pub fn create_interpolator(&self) -> Option<Box<dyn Interpolator>> {
        match self {
            GapFillingMethod::NoGapFilling => None,
            GapFillingMethod::LinearInterpolation => Some(Box::new(LinearInterpolator)),
            GapFillingMethod::SplineInterpolation => Some(Box::new(SplineInterpolator)),
            GapFillingMethod::QuadraticInterpolation => Some(Box::new(QuadraticInterpolator)),
        }
    }
}

impl fmt::Display for GapFillingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for GapFillingMethod {
    type Err = PercentileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        GapFillingMethod::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                PercentileError::Config(format!(
                    "Unknown gap filling method '{}', expected one of: {}",
                    s,
                    GapFillingMethod::ALL.map(|m| m.name()).join(", ")
                ))
            })
    }
}

/// A fitted univariate function
pub trait Curve {
    fn value(&self, x: f64) -> f64;
}

/// Fits a curve through a set of knots
pub trait Interpolator {
    fn name(&self) -> &'static str;

    /// Minimum number of knots the fit needs
    fn min_points(&self) -> usize;

    /// Fit a curve through `(x[i], y[i])`; `x` must be strictly increasing
    fn interpolate(&self, x: &[f64], y: &[f64]) -> PercentileResult<Box<dyn Curve>>;
}

fn check_knots(name: &str, min_points: usize, x: &[f64], y: &[f64]) -> PercentileResult<()> {
    if x.len() != y.len() {
        return Err(PercentileError::Processing(format!(
            "{}: {} abscissae but {} ordinates",
            name,
            x.len(),
            y.len()
        )));
    }
    if x.len() < min_points {
        return Err(PercentileError::Processing(format!(
            "{} needs at least {} points, got {}",
            name,
            min_points,
            x.len()
        )));
    }
    if x.windows(2).any(|w| !(w[1] > w[0])) {
        return Err(PercentileError::Processing(format!(
            "{}: abscissae must be strictly increasing",
            name
        )));
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(PercentileError::Processing(format!("{}: knots must be finite", name)));
    }
    Ok(())
}

/// Index of the segment `[x[i], x[i+1]]` holding `v`, clamped to the outermost segments
fn segment_index(x: &[f64], v: f64) -> usize {
    let upper = x.partition_point(|&k| k <= v);
    upper.saturating_sub(1).min(x.len() - 2)
}

/// Piecewise linear interpolation
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearInterpolator;

struct PiecewiseLinear {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl Curve for PiecewiseLinear {
    fn value(&self, v: f64) -> f64 {
        let i = segment_index(&self.x, v);
        let t = (v - self.x[i]) / (self.x[i + 1] - self.x[i]);
        self.y[i] + t * (self.y[i + 1] - self.y[i])
    }
}

impl Interpolator for LinearInterpolator {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn min_points(&self) -> usize {
        2
    }

    fn interpolate(&self, x: &[f64], y: &[f64]) -> PercentileResult<Box<dyn Curve>> {
        check_knots(self.name(), self.min_points(), x, y)?;
        Ok(Box::new(PiecewiseLinear {
            x: x.to_vec(),
            y: y.to_vec(),
        }))
    }
}

/// Natural cubic spline interpolation
#[derive(Debug, Clone, Copy, Default)]
pub struct SplineInterpolator;

struct CubicSpline {
    x: Vec<f64>,
    // per segment: y, b, c, d of y + b*t + c*t^2 + d*t^3
    coefficients: Vec<[f64; 4]>,
}

impl Curve for CubicSpline {
    fn value(&self, v: f64) -> f64 {
        let i = segment_index(&self.x, v);
        let t = v - self.x[i];
        let [a, b, c, d] = self.coefficients[i];
        a + t * (b + t * (c + t * d))
    }
}

impl Interpolator for SplineInterpolator {
    fn name(&self) -> &'static str {
        "spline"
    }

    fn min_points(&self) -> usize {
        3
    }

    fn interpolate(&self, x: &[f64], y: &[f64]) -> PercentileResult<Box<dyn Curve>> {
        check_knots(self.name(), self.min_points(), x, y)?;
        let n = x.len() - 1;

        let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
        let mut mu = vec![0.0; n];
        let mut z = vec![0.0; n + 1];
        for i in 1..n {
            let g = 2.0 * (x[i + 1] - x[i - 1]) - h[i - 1] * mu[i - 1];
            mu[i] = h[i] / g;
            z[i] = (3.0 * (y[i + 1] * h[i - 1] - y[i] * (x[i + 1] - x[i - 1]) + y[i - 1] * h[i])
                / (h[i - 1] * h[i])
                - h[i - 1] * z[i - 1])
                / g;
        }

        let mut c = vec![0.0; n + 1];
        let mut coefficients = vec![[0.0; 4]; n];
        for j in (0..n).rev() {
            c[j] = z[j] - mu[j] * c[j + 1];
            let b = (y[j + 1] - y[j]) / h[j] - h[j] * (c[j + 1] + 2.0 * c[j]) / 3.0;
            let d = (c[j + 1] - c[j]) / (3.0 * h[j]);
            coefficients[j] = [y[j], b, c[j], d];
        }

        Ok(Box::new(CubicSpline {
            x: x.to_vec(),
            coefficients,
        }))
    }
}

/// Piecewise quadratic interpolation: each segment follows the parabola through
/// its own two knots and the next one (the previous one on the last segment)
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadraticInterpolator;

struct PiecewiseQuadratic {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl Curve for PiecewiseQuadratic {
    fn value(&self, v: f64) -> f64 {
        let k = segment_index(&self.x, v).min(self.x.len() - 3);
        let (x0, x1, x2) = (self.x[k], self.x[k + 1], self.x[k + 2]);
        let (y0, y1, y2) = (self.y[k], self.y[k + 1], self.y[k + 2]);
        y0 * (v - x1) * (v - x2) / ((x0 - x1) * (x0 - x2))
            + y1 * (v - x0) * (v - x2) / ((x1 - x0) * (x1 - x2))
            + y2 * (v - x0) * (v - x1) / ((x2 - x0) * (x2 - x1))
    }
}

impl Interpolator for QuadraticInterpolator {
    fn name(&self) -> &'static str {
        "quadratic"
    }

    fn min_points(&self) -> usize {
        3
    }

    fn interpolate(&self, x: &[f64], y: &[f64]) -> PercentileResult<Box<dyn Curve>> {
        check_knots(self.name(), self.min_points(), x, y)?;
        Ok(Box::new(PiecewiseQuadratic {
            x: x.to_vec(),
            y: y.to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_interpolation() {
        let curve = LinearInterpolator.interpolate(&[0.0, 2.0, 4.0], &[2.0, 6.0, 2.0]).unwrap();
        assert_relative_eq!(curve.value(1.0), 4.0);
        assert_relative_eq!(curve.value(2.0), 6.0);
        assert_relative_eq!(curve.value(3.5), 3.0);
        assert_relative_eq!(curve.value(4.0), 2.0);
    }

    #[test]
    fn test_spline_passes_through_knots() {
        let x = [0.0, 1.0, 3.0, 4.0, 7.0];
        let y = [1.0, 3.0, -2.0, 0.5, 4.0];
        let curve = SplineInterpolator.interpolate(&x, &y).unwrap();
        for (xi, yi) in x.iter().zip(y.iter()) {
            assert_relative_eq!(curve.value(*xi), *yi, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_spline_reproduces_straight_line() {
        let curve = SplineInterpolator.interpolate(&[0.0, 1.0, 2.0], &[2.0, 4.0, 6.0]).unwrap();
        assert_relative_eq!(curve.value(0.5), 3.0, epsilon = 1e-12);
        assert_relative_eq!(curve.value(1.5), 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_quadratic_reproduces_parabola() {
        let x = [0.0, 1.0, 2.0, 4.0];
        let y: Vec<f64> = x.iter().map(|v| v * v).collect();
        let curve = QuadraticInterpolator.interpolate(&x, &y).unwrap();
        assert_relative_eq!(curve.value(0.5), 0.25, epsilon = 1e-12);
        assert_relative_eq!(curve.value(3.0), 9.0, epsilon = 1e-12);
        assert_relative_eq!(curve.value(4.0), 16.0, epsilon = 1e-12);
    }

    #[test]
    fn test_too_few_or_unordered_knots() {
        assert!(LinearInterpolator.interpolate(&[0.0], &[1.0]).is_err());
        assert!(SplineInterpolator.interpolate(&[0.0, 1.0], &[1.0, 2.0]).is_err());
        assert!(QuadraticInterpolator.interpolate(&[0.0, 2.0, 1.0], &[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_method_names_and_factory() {
        for method in GapFillingMethod::ALL {
            assert_eq!(method.name().parse::<GapFillingMethod>().unwrap(), method);
        }
        assert_eq!(
            "NOGAPFILLING".parse::<GapFillingMethod>().unwrap(),
            GapFillingMethod::NoGapFilling
        );
        assert!("cubic".parse::<GapFillingMethod>().is_err());

        assert!(GapFillingMethod::NoGapFilling.create_interpolator().is_none());
        assert_eq!(GapFillingMethod::NoGapFilling.min_points(), 1);
        assert_eq!(GapFillingMethod::LinearInterpolation.min_points(), 2);
        assert_eq!(GapFillingMethod::SplineInterpolation.min_points(), 3);
        assert_eq!(GapFillingMethod::QuadraticInterpolation.min_points(), 3);
        assert_eq!(GapFillingMethod::default(), GapFillingMethod::LinearInterpolation);
    }
}
