use chrono::{Duration, TimeZone, Utc};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use temporal_percentile::core::grouping::DailyGroups;
use temporal_percentile::core::validator::{ProductValidator, RejectReason};
use temporal_percentile::io::store::{BandHeader, RasterStoreWriter, SampleType, StoreHeader};
use temporal_percentile::{
    BandSource, BoundingBox, ChainedProductReader, GeoTransform, MemoryProduct, MemoryProductReader, ProductLoader,
    ProductReader, RasterStoreProductReader, Window,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write_store(dir: &Path, name: &str, top_left_lon: f64, start: chrono::DateTime<Utc>, end: chrono::DateTime<Utc>) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let mut header = StoreHeader::new(
        name,
        "CHL_L3",
        2,
        2,
        "EPSG:4326",
        GeoTransform::north_up(top_left_lon, 50.0, 0.5, 0.5),
    );
    header.set_time_range(start, end);
    header.bands.push(BandHeader::new("chl", SampleType::Float32).with_no_data(-999.0));
    let mut writer = RasterStoreWriter::create(dir, header).unwrap();
    let data = Array2::from_shape_vec((2, 2), vec![1.0, -999.0, 3.0, 4.0]).unwrap();
    writer.write_window("chl", Window::full(2, 2), &data).unwrap();
    writer.finish().unwrap()
}

fn june(day: u32, hour: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2013, 6, day, hour, 0, 0).unwrap()
}

fn validator() -> ProductValidator {
    ProductValidator::new(
        BandSource::Band("chl".to_string()),
        None,
        None,
        None,
        BoundingBox::from_diagonal(0.0, 55.0, 10.0, 45.0),
    )
}

#[test]
fn test_recursive_patterns_select_valid_products() {
    init_logging();
    let root = TempDir::new().expect("Failed to create temp directory");
    let base = root.path();

    println!("📁 Laying out source products");
    write_store(&base.join("2013/06/01"), "L3_a", 1.0, june(1, 10), june(1, 11));
    write_store(&base.join("2013/06/02"), "L3_b", 1.0, june(2, 10), june(2, 11));
    // outside the target area
    write_store(&base.join("2013/06/02"), "L3_far", 120.0, june(2, 12), june(2, 13));
    // empty acquisition interval
    write_store(&base.join("2013/06/03"), "L3_instant", 1.0, june(3, 10), june(3, 10));
    std::fs::write(base.join("2013/06/README.txt"), b"not a product").unwrap();
    std::fs::write(base.join("2013/06/broken.xml"), b"<RasterProduct>").unwrap();

    let patterns = vec![
        format!("{}/2013/**/*.xml", base.display()),
        // overlaps the first pattern; duplicates are opened once
        format!("{}/2013/06/0?/L3_a.xml", base.display()),
    ];
    let validator = validator();
    let reader = RasterStoreProductReader;
    let loader = ProductLoader::new(&patterns, &validator, &reader);

    let paths = loader.resolve_paths().unwrap();
    println!("   🔍 {} candidate files", paths.len());
    assert_eq!(paths.len(), 5);

    let products = loader.load_products().unwrap();
    let mut names: Vec<_> = products.iter().map(|p| p.name().to_string()).collect();
    names.sort();
    assert_eq!(names, vec!["L3_a", "L3_b"]);

    let groups = DailyGroups::group(products);
    assert_eq!(groups.len(), 2);
    println!("   ✅ Loader kept {} products", groups.product_count());
}

#[test]
fn test_no_data_samples_read_as_nan() {
    let root = TempDir::new().unwrap();
    let path = write_store(root.path(), "L3_a", 1.0, june(1, 10), june(1, 11));
    let product = RasterStoreProductReader.open_product(&path).unwrap();
    let samples = product
        .read_samples(&BandSource::Band("chl".to_string()), Window::full(2, 2))
        .unwrap();
    assert_eq!(samples[[0, 0]], 1.0);
    assert!(samples[[0, 1]].is_nan());
}

#[test]
fn test_equal_start_and_end_time_is_rejected() {
    let root = TempDir::new().unwrap();
    let path = write_store(root.path(), "L3_instant", 1.0, june(3, 10), june(3, 10));
    let product = RasterStoreProductReader.open_product(&path).unwrap();
    assert!(matches!(
        validator().check(product.as_ref()),
        Err(RejectReason::StartTimeNotBeforeEnd { .. })
    ));
}

#[test]
fn test_chained_reader_falls_back() {
    let root = TempDir::new().unwrap();
    let store = write_store(root.path(), "L3_store", 1.0, june(1, 10), june(1, 11));
    let memory_path = root.path().join("L3_memory.nc");
    std::fs::write(&memory_path, b"").unwrap();

    let mut memory = MemoryProductReader::new();
    memory.register(
        &memory_path,
        MemoryProduct::new("L3_memory", 1, 1)
            .with_geo_coding(GeoTransform::north_up(2.0, 50.0, 1.0, 1.0))
            .with_time_range(Some(june(2, 10)), Some(june(2, 10) + Duration::hours(1))),
    );
    let reader = ChainedProductReader::new(vec![Box::new(RasterStoreProductReader), Box::new(memory)]);

    assert_eq!(reader.open_product(&store).unwrap().name(), "L3_store");
    assert_eq!(reader.open_product(&memory_path).unwrap().name(), "L3_memory");
    assert!(reader.open_product(&root.path().join("missing.xml")).is_err());
}
