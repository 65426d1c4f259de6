//! Command line front end of the temporal percentile operator.
//!
//! Reads the run parameters from a JSON file and writes the percentile product
//! into the output directory.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};

use temporal_percentile::io::product::ProductReader;
use temporal_percentile::{
    ChainedProductReader, GdalProductReader, GeoTiffSink, LogProgress, PercentileSink, RasterStoreProductReader,
    StoreSink, TemporalPercentileOp, TemporalPercentileParams,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Raster store: XML header plus one ENVI raster per band
    Store,
    /// GeoTIFF
    Geotiff,
}

#[derive(Parser, Debug)]
#[command(name = "temporal_percentile")]
#[command(about = "Gap-filled temporal percentiles over a time series of raster products")]
struct Args {
    /// JSON parameter file
    #[arg(short, long)]
    config: PathBuf,

    /// Directory receiving the percentile product
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Store)]
    format: OutputFormat,

    /// Source product pattern, replaces the configured ones (repeatable)
    #[arg(short, long)]
    source: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info", env = "TEMPORAL_PERCENTILE_LOG")]
    log_level: String,
}

fn product_reader() -> ChainedProductReader {
    let readers: Vec<Box<dyn ProductReader>> = vec![Box::new(RasterStoreProductReader), Box::new(GdalProductReader)];
    ChainedProductReader::new(readers)
}

fn output_sink(format: OutputFormat, output: &Path) -> Box<dyn PercentileSink> {
    match format {
        OutputFormat::Store => Box::new(StoreSink::new(output)),
        OutputFormat::Geotiff => Box::new(GeoTiffSink::new(output)),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .parse_filters(&args.log_level)
        .format_timestamp_secs()
        .init();

    let mut params = TemporalPercentileParams::from_json_file(&args.config)
        .with_context(|| format!("Failed to load parameters from {}", args.config.display()))?;
    if !args.source.is_empty() {
        params.source_product_paths = args.source.clone();
    }

    if !args.output.is_dir() {
        std::fs::create_dir_all(&args.output)
            .with_context(|| format!("Failed to create output directory {}", args.output.display()))?;
    }

    log::info!("Starting temporal percentile computation");
    log::info!("   Sources: {:?}", params.source_product_paths);
    log::info!("   Percentiles: {:?}, gap filling: {}", params.percentiles, params.gap_filling_method);

    let reader = product_reader();
    let op = TemporalPercentileOp::new(params, &reader)?;
    let mut sink = output_sink(args.format, &args.output);
    let summary = op.run(sink.as_mut(), &mut LogProgress::new())?;

    log::info!(
        "Finished: {} products over {} days (MJD {} to {})",
        summary.product_count,
        summary.day_count,
        summary.start_day,
        summary.end_day
    );
    if let Some(path) = &summary.time_series_path {
        log::info!("Time series product kept at {}", path.display());
    }
    Ok(())
}
