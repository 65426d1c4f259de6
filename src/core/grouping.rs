use crate::core::interpolation::GapFillingMethod;
use crate::io::product::RasterProduct;
use crate::types::{PercentileError, PercentileResult};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;

/// Modified Julian Day of the Unix epoch
const MJD_OF_UNIX_EPOCH: i64 = 40_587;
const SECONDS_PER_DAY: i64 = 86_400;

/// Integer Modified Julian Day containing `time`
pub fn modified_julian_day(time: DateTime<Utc>) -> i64 {
    time.timestamp().div_euclid(SECONDS_PER_DAY) + MJD_OF_UNIX_EPOCH
}

/// Midnight UTC starting the Modified Julian Day `mjd`
pub fn mjd_to_utc(mjd: i64) -> PercentileResult<DateTime<Utc>> {
    Utc.timestamp_opt((mjd - MJD_OF_UNIX_EPOCH) * SECONDS_PER_DAY, 0)
        .single()
        .ok_or_else(|| PercentileError::Processing(format!("MJD {} is out of the supported time range", mjd)))
}

/// Temporal midpoint of an acquisition
pub fn center_time(start: DateTime<Utc>, end: DateTime<Utc>) -> DateTime<Utc> {
    start + (end - start) / 2
}

/// Day key of a product: the MJD of its temporal centre
pub fn day_key(product: &dyn RasterProduct) -> Option<i64> {
    match (product.start_time(), product.end_time()) {
        (Some(start), Some(end)) => Some(modified_julian_day(center_time(start, end))),
        _ => None,
    }
}

/// Products bucketed by day key, in chronological order.
///
/// Built once from the loaded products and consumed once by [`DailyGroups::take_days`].
#[derive(Default)]
pub struct DailyGroups {
    groups: BTreeMap<i64, Vec<Box<dyn RasterProduct>>>,
}

impl DailyGroups {
    pub fn group(products: Vec<Box<dyn RasterProduct>>) -> Self {
        let mut groups: BTreeMap<i64, Vec<Box<dyn RasterProduct>>> = BTreeMap::new();
        for product in products {
            match day_key(product.as_ref()) {
                Some(day) => groups.entry(day).or_default().push(product),
                None => log::warn!(
                    "Product '{}' has no acquisition time range and is not considered",
                    product.name()
                ),
            }
        }
        log::info!("Grouped source products into {} days", groups.len());
        Self { groups }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn product_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    /// Day keys in ascending order
    pub fn days(&self) -> Vec<i64> {
        self.groups.keys().copied().collect()
    }

    pub fn first_day(&self) -> Option<i64> {
        self.groups.keys().next().copied()
    }

    pub fn last_day(&self) -> Option<i64> {
        self.groups.keys().next_back().copied()
    }

    pub fn products(&self, day: i64) -> Option<&[Box<dyn RasterProduct>]> {
        self.groups.get(&day).map(Vec::as_slice)
    }

    /// File locations of every grouped product, chronologically
    pub fn product_locations(&self) -> Vec<String> {
        self.groups
            .values()
            .flatten()
            .map(|p| match p.file_location() {
                Some(path) => path.display().to_string(),
                None => p.name().to_string(),
            })
            .collect()
    }

    /// Drop the days outside `[first, last]` and return how many products went with them
    pub fn retain_range(&mut self, first: i64, last: i64) -> usize {
        let mut dropped = 0;
        self.groups.retain(|&day, products| {
            let keep = day >= first && day <= last;
            if !keep {
                log::warn!(
                    "Skipping {} products of day {} outside the time series [{}, {}]",
                    products.len(),
                    day,
                    first,
                    last
                );
                dropped += products.len();
            }
            keep
        });
        dropped
    }

    /// Fail unless enough distinct days exist for the gap filling method
    pub fn ensure_temporal_spread(&self, method: GapFillingMethod) -> PercentileResult<()> {
        if self.groups.len() < 2 {
            return Err(PercentileError::Config(
                "For temporal percentile calculation at least two days must contain valid input products."
                    .to_string(),
            ));
        }
        if self.groups.len() == 2 && method.is_non_linear() {
            return Err(PercentileError::Config(format!(
                "For temporal percentile calculation with gapFillingMethod='{}' \
                 at least three days must contain valid input products.",
                method
            )));
        }
        Ok(())
    }

    /// Hand out every day group in chronological order, leaving this object empty
    pub fn take_days(&mut self) -> impl Iterator<Item = (i64, Vec<Box<dyn RasterProduct>>)> {
        std::mem::take(&mut self.groups).into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::product::MemoryProduct;
    use chrono::Duration;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn product(name: &str, start: &str, end: &str) -> Box<dyn RasterProduct> {
        Box::new(MemoryProduct::new(name, 1, 1).with_time_range(Some(utc(start)), Some(utc(end))))
    }

    #[test]
    fn test_modified_julian_day() {
        assert_eq!(modified_julian_day(utc("1970-01-01T00:00:00Z")), 40587);
        assert_eq!(modified_julian_day(utc("1858-11-17T00:00:00Z")), 0);
        assert_eq!(modified_julian_day(utc("2000-01-01T12:00:00Z")), 51544);
        assert_eq!(modified_julian_day(utc("1969-12-31T23:59:59Z")), 40586);
        assert_eq!(mjd_to_utc(51544).unwrap(), utc("2000-01-01T00:00:00Z"));
    }

    #[test]
    fn test_center_time_decides_the_day() {
        let start = utc("2013-06-01T22:00:00Z");
        let p = product("late", "2013-06-01T22:00:00Z", "2013-06-02T04:00:00Z");
        assert_eq!(center_time(start, start + Duration::hours(6)), utc("2013-06-02T01:00:00Z"));
        assert_eq!(day_key(p.as_ref()), Some(modified_julian_day(utc("2013-06-02T00:00:00Z"))));
    }

    #[test]
    fn test_every_product_lands_in_exactly_one_ascending_bucket() {
        let products = vec![
            product("c", "2013-06-03T10:00:00Z", "2013-06-03T10:05:00Z"),
            product("a1", "2013-06-01T10:00:00Z", "2013-06-01T10:05:00Z"),
            product("b", "2013-06-02T10:00:00Z", "2013-06-02T10:05:00Z"),
            product("a2", "2013-06-01T14:00:00Z", "2013-06-01T14:05:00Z"),
        ];
        let mut groups = DailyGroups::group(products);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups.product_count(), 4);
        let days = groups.days();
        assert!(days.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(groups.products(days[0]).unwrap().len(), 2);

        let taken: Vec<_> = groups.take_days().map(|(day, products)| (day, products.len())).collect();
        assert_eq!(taken, vec![(days[0], 2), (days[1], 1), (days[2], 1)]);
        assert!(groups.is_empty());
    }

    #[test]
    fn test_retain_range() {
        let mut groups = DailyGroups::group(vec![
            product("a", "2013-05-31T10:00:00Z", "2013-05-31T11:00:00Z"),
            product("b", "2013-06-01T10:00:00Z", "2013-06-01T11:00:00Z"),
            product("c", "2013-06-02T10:00:00Z", "2013-06-02T11:00:00Z"),
        ]);
        let first = modified_julian_day(utc("2013-06-01T00:00:00Z"));
        assert_eq!(groups.retain_range(first, first + 5), 1);
        assert_eq!(groups.days(), vec![first, first + 1]);
    }

    #[test]
    fn test_temporal_spread() {
        let one_day = DailyGroups::group(vec![product("a", "2013-06-01T10:00:00Z", "2013-06-01T11:00:00Z")]);
        assert!(one_day.ensure_temporal_spread(GapFillingMethod::NoGapFilling).is_err());

        let two_days = DailyGroups::group(vec![
            product("a", "2013-06-01T10:00:00Z", "2013-06-01T11:00:00Z"),
            product("b", "2013-06-05T10:00:00Z", "2013-06-05T11:00:00Z"),
        ]);
        assert!(two_days.ensure_temporal_spread(GapFillingMethod::LinearInterpolation).is_ok());
        let err = two_days
            .ensure_temporal_spread(GapFillingMethod::SplineInterpolation)
            .unwrap_err();
        assert!(err.to_string().contains("at least three days"));
        assert!(two_days.ensure_temporal_spread(GapFillingMethod::QuadraticInterpolation).is_err());
    }
}
