use crate::config::TemporalPercentileParams;
use crate::core::grouping::{mjd_to_utc, modified_julian_day, DailyGroups};
use crate::core::mean::{DailyMeanSynthesizer, MeanSynthesisParams};
use crate::core::percentile::PercentileComputer;
use crate::core::progress::{check_cancelled, ProgressMonitor};
use crate::core::reproject::{GridResampler, Reprojector};
use crate::core::tile_stack::{TileStackParams, TileStackProcessor};
use crate::core::validator::ProductValidator;
use crate::io::loader::ProductLoader;
use crate::io::product::{BandSource, ProductReader};
use crate::io::sink::{OutputLayout, PercentileSink};
use crate::io::store::MetadataEntry;
use crate::io::time_series::{DayBand, TimeSeriesLayout, TimeSeriesWriter};
use crate::types::{PercentileError, PercentileResult, PipelineStage, TargetGrid};
use std::path::{Path, PathBuf};

const GIGABYTE: u64 = 1024 * 1024 * 1024;

/// Memory the run needs besides one mean band of the output grid
pub const BASE_MEMORY_REQUIREMENT: u64 = GIGABYTE;

/// Memory currently available on the machine, in bytes
pub fn available_memory() -> u64 {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory()
}

/// Fail fast if one float band of the output grid does not fit the memory limit
pub fn check_memory_needs(grid: &TargetGrid, memory_limit: u64) -> PercentileResult<()> {
    let pixels = grid.pixel_count();
    let needed = pixels.saturating_mul(4).saturating_add(BASE_MEMORY_REQUIREMENT);
    if needed <= memory_limit {
        return Ok(());
    }
    if pixels >= i32::MAX as u64 {
        return Err(PercentileError::Config(format!(
            "The CRS settings result in a too large product ({} * {} pixels). Please choose a smaller scene.",
            grid.width, grid.height
        )));
    }
    Err(PercentileError::Config(format!(
        "The CRS settings result in a too large product ({} * {} pixels). \
         The memory needed to compute such a product is {} GB. \
         Please choose a smaller scene or increase the memory limit accordingly.",
        grid.width,
        grid.height,
        (needed + GIGABYTE - 1) / GIGABYTE
    )))
}

/// Outcome of a finished run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub product_count: usize,
    pub day_count: usize,
    pub start_day: i64,
    pub end_day: i64,
    pub series_length: usize,
    /// The kept intermediate time series product
    pub time_series_path: Option<PathBuf>,
}

/// Temporal percentile pipeline: load, group, collocate and average the source
/// products per day, then gap fill and compute percentiles per output tile
pub struct TemporalPercentileOp<'a> {
    params: TemporalPercentileParams,
    reader: &'a dyn ProductReader,
    reprojector: Box<dyn Reprojector>,
    mean_params: MeanSynthesisParams,
}

impl<'a> TemporalPercentileOp<'a> {
    /// Validate the parameters; nothing is read yet
    pub fn new(params: TemporalPercentileParams, reader: &'a dyn ProductReader) -> PercentileResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            reader,
            reprojector: Box::new(GridResampler),
            mean_params: MeanSynthesisParams::default(),
        })
    }

    pub fn with_reprojector(mut self, reprojector: Box<dyn Reprojector>) -> Self {
        self.reprojector = reprojector;
        self
    }

    pub fn with_mean_params(mut self, mean_params: MeanSynthesisParams) -> Self {
        self.mean_params = mean_params;
        self
    }

    pub fn params(&self) -> &TemporalPercentileParams {
        &self.params
    }

    pub fn run(&self, sink: &mut dyn PercentileSink, progress: &mut dyn ProgressMonitor) -> PercentileResult<RunSummary> {
        let params = &self.params;
        let source = params.band_source()?;
        let computer = PercentileComputer::new(
            params.gap_filling_method,
            params.start_value_fallback as f32,
            params.end_value_fallback as f32,
        );

        let grid = params.target_grid()?;
        let memory_limit = params.memory_limit();
        log::debug!(
            "Memory limit {} MB ({})",
            memory_limit / (1024 * 1024),
            if params.memory_limit_bytes.is_some() { "configured" } else { "available" }
        );
        check_memory_needs(&grid, memory_limit)?;
        log::info!(
            "Target grid {}x{} ({}), gap filling: {}",
            grid.width,
            grid.height,
            grid.crs,
            params.gap_filling_method
        );

        let validator = ProductValidator::new(
            source.clone(),
            params.valid_expression(),
            params.start_date,
            params.end_date,
            grid.area(),
        );
        let products = ProductLoader::new(&params.source_product_paths, &validator, self.reader).load_products()?;
        let product_count = products.len();

        let mut groups = DailyGroups::group(products);
        groups.ensure_temporal_spread(params.gap_filling_method)?;
        let (oldest, newest) = match (groups.first_day(), groups.last_day()) {
            (Some(oldest), Some(newest)) => (oldest, newest),
            _ => return Err(PercentileError::Processing("No day groups to process".to_string())),
        };
        let start_day = params.start_date.map_or(oldest, modified_julian_day);
        let end_day = params.end_date.map_or(newest, modified_julian_day);
        if groups.retain_range(start_day, end_day) > 0 {
            groups.ensure_temporal_spread(params.gap_filling_method)?;
        }

        let prefix = params.band_name_prefix();
        let mut metadata = input_products_metadata(&groups);
        metadata.extend(params.band_configuration_metadata());
        let layout = TimeSeriesLayout {
            prefix: prefix.clone(),
            grid: grid.clone(),
            start_day,
            end_day,
            days: day_bands(&groups, &source),
            metadata: metadata.clone(),
        };
        let day_count = layout.days.len();
        let series_length = layout.series_length();
        log::info!(
            "Time series covers {} days from MJD {} to {}, {} of them with data",
            series_length,
            start_day,
            end_day,
            day_count
        );

        let dir = params
            .time_series_output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let keep = params.keep_intermediate_time_series_product;
        let mut writer =
            TimeSeriesWriter::create(&dir, &layout, keep).map_err(|e| e.in_stage(PipelineStage::TimeSeriesWrite))?;

        let synthesizer = DailyMeanSynthesizer::with_params(&source, params.valid_expression(), self.mean_params.clone());
        progress.begin_task("Computing daily means", day_count);
        for (day, day_products) in groups.take_days() {
            check_cancelled(progress)?;
            log::info!(
                "Day {} (MJD {}): {}",
                mjd_to_utc(day)?.format("%Y-%m-%d"),
                day,
                day_products.iter().map(|p| p.name()).collect::<Vec<_>>().join(", ")
            );
            let collocated = day_products
                .iter()
                .map(|p| self.reprojector.reproject(p.as_ref(), &grid, params.resampling))
                .collect::<PercentileResult<Vec<_>>>()
                .map_err(|e| e.in_stage(PipelineStage::SourceRead))?;
            synthesizer.synthesize(day, &collocated, &mut writer)?;
            // release the collocated views before their sources
            drop(collocated);
            drop(day_products);
            progress.worked(1);
        }
        progress.done();

        let time_series = writer
            .finish()
            .map_err(|e| e.in_stage(PipelineStage::TimeSeriesWrite))?;

        let mut output = OutputLayout::new(&prefix, grid, &params.percentiles);
        output.start_time = Some(mjd_to_utc(start_day)?);
        output.end_time = Some(mjd_to_utc(end_day)?);
        output.metadata = metadata;

        sink.begin(&output).map_err(|e| e.in_stage(PipelineStage::TileWrite))?;
        let tiling = TileStackParams {
            tile_width: params.tile_size,
            tile_height: params.tile_size,
        };
        TileStackProcessor::with_params(&time_series, &computer, &params.percentiles, tiling).run(sink, progress)?;
        sink.finish().map_err(|e| e.in_stage(PipelineStage::TileWrite))?;

        let time_series_path = keep.then(|| absolute(time_series.header_path()));
        drop(time_series);

        Ok(RunSummary {
            product_count,
            day_count,
            start_day,
            end_day,
            series_length,
            time_series_path,
        })
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn input_products_metadata(groups: &DailyGroups) -> Vec<MetadataEntry> {
    groups
        .product_locations()
        .into_iter()
        .enumerate()
        .map(|(i, location)| MetadataEntry {
            key: format!("Input products/product_{}", i),
            value: absolute(Path::new(&location)).display().to_string(),
        })
        .collect()
}

/// One band per day; unit and description follow the first product of the day
fn day_bands(groups: &DailyGroups, source: &BandSource) -> Vec<DayBand> {
    groups
        .days()
        .into_iter()
        .map(|day| {
            let mut band = DayBand::new(day);
            if let BandSource::Band(name) = source {
                let info = groups
                    .products(day)
                    .and_then(|products| products.first())
                    .and_then(|product| product.band(name));
                if let Some(info) = info {
                    band.unit = info.unit.clone();
                    band.description = info.description.clone();
                }
            }
            band
        })
        .collect()
}
