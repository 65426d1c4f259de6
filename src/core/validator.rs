use crate::io::product::{is_effective_valid_expression, BandSource, RasterProduct};
use crate::types::BoundingBox;
use chrono::{DateTime, Duration, Utc};

/// Longest acquisition a product may span
const MAX_TIME_SPAN_DAYS: i64 = 367;

/// Why a candidate product was excluded
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RejectReason {
    #[error("the product has no geo-coding")]
    MissingGeoCoding,

    #[error("the geo-coding cannot determine pixel positions")]
    GeoCodingNotInvertible,

    #[error("the product has no start time")]
    MissingStartTime,

    #[error("the product has no end time")]
    MissingEndTime,

    #[error("the start time {start} is not before the end time {end}")]
    StartTimeNotBeforeEnd { start: DateTime<Utc>, end: DateTime<Utc> },

    #[error("the acquisition spans {days} days, more than {} allowed", MAX_TIME_SPAN_DAYS - 1)]
    TimeSpanTooLong { days: i64 },

    #[error("the acquisition ends before the start date {0}")]
    BeforeStartDate(DateTime<Utc>),

    #[error("the acquisition starts after the end date {0}")]
    AfterEndDate(DateTime<Utc>),

    #[error("the product does not contain the band '{0}'")]
    MissingBand(String),

    #[error("the expression '{0}' cannot be used with the product")]
    IncompatibleExpression(String),

    #[error("the valid pixel expression '{0}' cannot be used with the product")]
    IncompatibleValidExpression(String),

    #[error("the product does not intersect the target area")]
    NoIntersection,
}

/// Decides whether a candidate product takes part in the percentile computation.
///
/// The checks run cheapest first; the footprint intersection comes last.
#[derive(Debug, Clone)]
pub struct ProductValidator {
    source: BandSource,
    valid_expression: Option<String>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    target_area: BoundingBox,
}

impl ProductValidator {
    pub fn new(
        source: BandSource,
        valid_expression: Option<&str>,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
        target_area: BoundingBox,
    ) -> Self {
        Self {
            source,
            valid_expression: is_effective_valid_expression(valid_expression).map(str::to_string),
            start_date,
            end_date,
            target_area,
        }
    }

    /// Run every check in order and report the first failure
    pub fn check(&self, product: &dyn RasterProduct) -> Result<(), RejectReason> {
        let geo_coding = product.geo_coding().ok_or(RejectReason::MissingGeoCoding)?;
        if !geo_coding.can_get_pixel_pos() {
            return Err(RejectReason::GeoCodingNotInvertible);
        }

        let start = product.start_time().ok_or(RejectReason::MissingStartTime)?;
        let end = product.end_time().ok_or(RejectReason::MissingEndTime)?;
        if start >= end {
            return Err(RejectReason::StartTimeNotBeforeEnd { start, end });
        }
        if end - start >= Duration::days(MAX_TIME_SPAN_DAYS) {
            return Err(RejectReason::TimeSpanTooLong {
                days: (end - start).num_days(),
            });
        }
        if let Some(start_date) = self.start_date {
            if end < start_date {
                return Err(RejectReason::BeforeStartDate(start_date));
            }
        }
        if let Some(end_date) = self.end_date {
            if start > end_date {
                return Err(RejectReason::AfterEndDate(end_date));
            }
        }

        if !product.can_read(&self.source) {
            return Err(match &self.source {
                BandSource::Band(name) => RejectReason::MissingBand(name.clone()),
                BandSource::Expression(expression) => RejectReason::IncompatibleExpression(expression.clone()),
            });
        }
        if let Some(expression) = &self.valid_expression {
            if !product.supports_expression(expression) {
                return Err(RejectReason::IncompatibleValidExpression(expression.clone()));
            }
        }

        let (width, height) = product.scene_size();
        match geo_coding.footprint(width, height) {
            Some(footprint) if footprint.intersects(&self.target_area) => Ok(()),
            _ => Err(RejectReason::NoIntersection),
        }
    }

    /// Whether the product qualifies; a rejection is logged with its reason
    pub fn is_valid(&self, product: &dyn RasterProduct) -> bool {
        match self.check(product) {
            Ok(()) => true,
            Err(reason) => {
                log::info!("Product '{}' is skipped because {}", product.name(), reason);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::product::{BandInfo, MemoryProduct};
    use crate::types::GeoTransform;
    use ndarray::Array2;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn validator() -> ProductValidator {
        ProductValidator::new(
            BandSource::Band("chl".to_string()),
            Some("true"),
            Some(utc("2013-01-01T00:00:00Z")),
            Some(utc("2013-12-31T23:59:59Z")),
            BoundingBox::from_diagonal(-15.0, 75.0, 30.0, 35.0),
        )
    }

    fn good_product() -> MemoryProduct {
        MemoryProduct::new("good", 10, 10)
            .with_geo_coding(GeoTransform::north_up(0.0, 50.0, 0.1, 0.1))
            .with_time_range(Some(utc("2013-06-01T10:00:00Z")), Some(utc("2013-06-01T10:05:00Z")))
            .with_band(BandInfo::new("chl"), Array2::zeros((10, 10)))
            .unwrap()
    }

    #[test]
    fn test_accepts_good_product() {
        assert_eq!(validator().check(&good_product()), Ok(()));
        assert!(validator().is_valid(&good_product()));
    }

    #[test]
    fn test_rejects_equal_start_and_end() {
        let time = utc("2013-06-01T10:00:00Z");
        let product = good_product().with_time_range(Some(time), Some(time));
        assert!(matches!(
            validator().check(&product),
            Err(RejectReason::StartTimeNotBeforeEnd { .. })
        ));
    }

    #[test]
    fn test_check_order() {
        // no geo-coding wins over a missing time range
        let product = MemoryProduct::new("bare", 10, 10);
        assert_eq!(validator().check(&product), Err(RejectReason::MissingGeoCoding));

        let product = MemoryProduct::new("no-time", 10, 10).with_geo_coding(GeoTransform::north_up(0.0, 50.0, 0.1, 0.1));
        assert_eq!(validator().check(&product), Err(RejectReason::MissingStartTime));
    }

    #[test]
    fn test_rejects_long_time_span() {
        let product = good_product().with_time_range(Some(utc("2013-01-01T00:00:00Z")), Some(utc("2014-01-03T00:00:00Z")));
        assert!(matches!(validator().check(&product), Err(RejectReason::TimeSpanTooLong { .. })));
    }

    #[test]
    fn test_rejects_outside_date_range() {
        let product = good_product().with_time_range(Some(utc("2012-06-01T10:00:00Z")), Some(utc("2012-06-01T11:00:00Z")));
        assert!(matches!(validator().check(&product), Err(RejectReason::BeforeStartDate(_))));
    }

    #[test]
    fn test_rejects_missing_band_and_expressions() {
        let product = good_product();
        let by_expression = ProductValidator::new(
            BandSource::Expression("chl * 2".to_string()),
            None,
            None,
            None,
            BoundingBox::from_diagonal(-15.0, 75.0, 30.0, 35.0),
        );
        assert_eq!(
            by_expression.check(&product),
            Err(RejectReason::IncompatibleExpression("chl * 2".to_string()))
        );

        let with_mask = ProductValidator::new(
            BandSource::Band("chl".to_string()),
            Some("chl > 0"),
            None,
            None,
            BoundingBox::from_diagonal(-15.0, 75.0, 30.0, 35.0),
        );
        assert_eq!(
            with_mask.check(&product),
            Err(RejectReason::IncompatibleValidExpression("chl > 0".to_string()))
        );

        let other_band = good_product().with_band(BandInfo::new("tsm"), Array2::zeros((10, 10))).unwrap();
        let by_tsm = ProductValidator::new(
            BandSource::Band("kd".to_string()),
            None,
            None,
            None,
            BoundingBox::from_diagonal(-15.0, 75.0, 30.0, 35.0),
        );
        assert_eq!(by_tsm.check(&other_band), Err(RejectReason::MissingBand("kd".to_string())));
    }

    #[test]
    fn test_rejects_product_outside_target_area() {
        let product = good_product().with_geo_coding(GeoTransform::north_up(100.0, -20.0, 0.1, 0.1));
        assert_eq!(validator().check(&product), Err(RejectReason::NoIntersection));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let v = validator();
        let good = good_product();
        let bad = MemoryProduct::new("bare", 1, 1);
        for _ in 0..3 {
            assert!(v.is_valid(&good));
            assert!(!v.is_valid(&bad));
        }
    }
}
