//! End-to-end retrieval pipeline tests.
//!
//! These drive the full chain on synthetic sources: catalog resolution,
//! fixing (rename, decumulation, unit conversion), regridding onto a
//! coarser grid, streaming access and the post-processing statistics.

use std::path::PathBuf;

use tempfile::TempDir;

use cda_common::Frequency;
use cda_fixer::FixCatalog;
use cda_regrid::GridRegistry;
use cda_reader::testdata;
use cda_reader::{
    Catalog, CatalogStack, FldmeanOptions, Reader, ReaderConfig, ReaderError, StreamStep,
    TimmeanOptions,
};

const FIXES: &str = r#"
defaults:
  dst_datamodel: cf
models:
  IFS:
    historical:
      hourly:
        deltat: 3600
        jump: month
        vars:
          tprate:
            source: tp
            units: "mm/day"
            decumulate: true
"#;

struct Env {
    _data: TempDir,
    _cache: TempDir,
    catalogs: CatalogStack,
    fixes: FixCatalog,
    cache_dir: PathBuf,
}

/// A file-glob source of hourly surface data starting at `start`.
fn file_env(start: &str, ntime: usize) -> Env {
    let data = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    testdata::write_file_source(data.path(), start, ntime, 3).unwrap();
    let yaml = format!(
        r#"
name: main
models:
  IFS:
    historical:
      hourly:
        driver: file_glob
        path: {}
        grid: r8x4
"#,
        data.path().display()
    );
    Env {
        cache_dir: cache.path().to_path_buf(),
        _data: data,
        _cache: cache,
        catalogs: CatalogStack::new(vec![Catalog::from_str(&yaml).unwrap()]),
        fixes: FixCatalog::from_str(FIXES).unwrap(),
    }
}

fn reader(env: &Env, config: ReaderConfig) -> Reader {
    let config = ReaderConfig {
        cache_dir: Some(env.cache_dir.clone()),
        ..config
    };
    Reader::new(
        &env.catalogs,
        &env.fixes,
        GridRegistry::default(),
        "IFS",
        "historical",
        config,
    )
    .expect("reader construction failed")
}

#[test]
fn test_fix_regrid_timmean_fldmean_chain() {
    // Two full days of hourly data, regridded from r8x4 onto r4x2
    let env = file_env("2020-05-01T00:00:00", 48);
    let r = reader(
        &env,
        ReaderConfig {
            regrid: Some("r4x2".to_string()),
            ..ReaderConfig::default()
        },
    );

    let vars = ["tprate".to_string(), "t2m".to_string()];
    let ds = r.retrieve(Some(&vars)).unwrap().materialize().unwrap();

    // The source accumulates 1 mm per hour, so the decumulated rate is a
    // constant 24 mm/day, which conservative regridding preserves
    let tprate = ds.var("tprate").unwrap();
    assert_eq!(tprate.shape, vec![48, 2, 4]);
    assert_eq!(tprate.attrs.units.as_deref(), Some("mm/day"));
    assert!(tprate.values[..8].iter().all(|v| v.is_nan()));
    assert!(tprate.values[8..].iter().all(|v| (v - 24.0).abs() < 1e-6));

    // Daily means: the NaN first step is skipped, not propagated
    let daily = r
        .timmean(
            &ds,
            Frequency::Daily,
            &TimmeanOptions {
                exclude_incomplete: true,
                ..TimmeanOptions::default()
            },
        )
        .unwrap();
    assert_eq!(daily.time.as_ref().unwrap().times.len(), 2);
    let day0 = daily.var("tprate").unwrap().values[0];
    assert!((day0 - 24.0).abs() < 1e-6);

    // Spatial mean on the regridded field uses the target grid's areas
    let fld = r.fldmean(&daily, &FldmeanOptions::default()).unwrap();
    assert_eq!(fld.var("t2m").unwrap().shape, vec![2]);
    assert!((fld.var("t2m").unwrap().values[0] - 285.0).abs() < 1e-9);
}

#[test]
fn test_month_boundary_decumulation() {
    // Six hours of April followed by all of May 1st: the accumulation
    // counter resets at the month boundary and must not produce a
    // negative rate there
    let env = file_env("2020-04-30T18:00:00", 30);
    let r = reader(&env, ReaderConfig::default());
    let ds = r
        .retrieve(Some(&["tprate".to_string()]))
        .unwrap()
        .materialize()
        .unwrap();
    let tprate = ds.var("tprate").unwrap();
    let cell = testdata::NLAT * testdata::NLON;
    for t in 1..30 {
        let v = tprate.values[t * cell];
        assert!(v.is_finite(), "step {t} is not finite");
        assert!((v - 24.0).abs() < 1e-6, "step {t}: {v}");
    }
}

#[test]
fn test_streaming_three_day_windows() {
    // Seven days of hourly data streamed in 3-day calendar windows
    let env = file_env("2020-05-01T00:00:00", 7 * 24);
    let mut r = reader(
        &env,
        ReaderConfig {
            stream: Some(StreamStep::Calendar(3, cda_common::TimeUnit::Days)),
            ..ReaderConfig::default()
        },
    );
    let vars = ["t2m".to_string()];
    let lens: Vec<usize> = std::iter::from_fn(|| match r.retrieve_next(Some(&vars)) {
        Ok(ds) => Some(ds.time.as_ref().unwrap().times.len()),
        Err(ReaderError::StreamExhausted) => None,
        Err(e) => panic!("{e}"),
    })
    .collect();
    assert_eq!(lens, vec![72, 72, 24]);

    // A fresh pass after reset yields the same first window
    r.reset_stream();
    let first = r.retrieve_next(Some(&vars)).unwrap();
    assert_eq!(
        first.time.as_ref().unwrap().times[0],
        cda_common::parse_date("2020-05-01").unwrap()
    );
}

#[test]
fn test_chunked_iteration_covers_range() {
    let env = file_env("2020-05-01T00:00:00", 10);
    let r = reader(
        &env,
        ReaderConfig {
            stream: Some(StreamStep::Samples(4)),
            ..ReaderConfig::default()
        },
    );
    let total: usize = r
        .chunks(Some(&["t2m".to_string()]))
        .unwrap()
        .map(|chunk| chunk.unwrap().time.unwrap().times.len())
        .sum();
    assert_eq!(total, 10);
}

#[test]
fn test_archive_source_requires_variables() {
    let data = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    testdata::write_archive_source(data.path(), "2020-05-01T00:00:00", 4).unwrap();
    let yaml = format!(
        r#"
name: obs
models:
  ERA5:
    reanalysis:
      archive:
        driver: archive
        path: {}
        grid: r8x4
        fixable: false
"#,
        data.path().display()
    );
    let catalogs = CatalogStack::new(vec![Catalog::from_str(&yaml).unwrap()]);
    let r = Reader::new(
        &catalogs,
        &FixCatalog::default(),
        GridRegistry::default(),
        "ERA5",
        "reanalysis",
        ReaderConfig {
            cache_dir: Some(cache.path().to_path_buf()),
            ..ReaderConfig::default()
        },
    )
    .unwrap();

    let err = r.retrieve(None).unwrap().materialize().unwrap_err();
    assert!(matches!(err, ReaderError::VarsRequired(_)));

    let ds = r
        .retrieve(Some(&["t2m".to_string()]))
        .unwrap()
        .materialize()
        .unwrap();
    assert_eq!(ds.var_names(), vec!["t2m".to_string()]);
}

#[test]
fn test_info_reports_binding() {
    let env = file_env("2020-05-01T00:00:00", 2);
    let r = reader(
        &env,
        ReaderConfig {
            regrid: Some("r4x2".to_string()),
            ..ReaderConfig::default()
        },
    );
    let info = r.info();
    assert!(info.contains("IFS/historical/hourly"));
    assert!(info.contains("catalog 'main'"));
    assert!(info.contains("fixes: on"));
    assert!(info.contains("regrid: r4x2"));
}
