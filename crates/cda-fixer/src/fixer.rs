//! The fixer pipeline.
//!
//! A `Fixer` is resolved once per (model, experiment, source) triplet and
//! then applied to every dataset retrieved from that source. Application
//! runs in a fixed order: rename source variables, derive formula
//! variables, decumulate accumulated ones, prepare or apply unit
//! conversions, normalize coordinates, then delete what the spec says to
//! drop. Unit conversion failures are logged and leave the variable
//! untouched; they never fail the pipeline.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use cda_common::Dataset;

use crate::coords::DataModel;
use crate::decumulate::{decumulate, Jump};
use crate::error::{FixerError, Result};
use crate::formula::Expr;
use crate::spec::{FixCatalog, FixSpec};
use crate::units::{convert_units, normalize_units, parse_unit, Conversion};

/// Default accumulation timestep when a spec flags decumulation but does
/// not say how often the model writes, in seconds.
const DEFAULT_DELTAT: f64 = 3600.0;

/// A resolved fixer for one source.
#[derive(Debug, Clone)]
pub struct Fixer {
    spec: FixSpec,
    data_model: DataModel,
    unit_table: BTreeMap<String, String>,
    deltat: f64,
    jump: Jump,
}

impl Fixer {
    /// Resolve the fixer for a triplet. Returns None when the catalog has
    /// no fixes for it, which disables fixing entirely.
    pub fn new(catalog: &FixCatalog, model: &str, exp: &str, source: &str) -> Result<Option<Self>> {
        let Some(spec) = catalog.lookup(model, exp, source)? else {
            return Ok(None);
        };
        let model_name = spec
            .data_model
            .clone()
            .or_else(|| catalog.defaults.dst_datamodel.clone())
            .unwrap_or_default();
        let deltat = spec.deltat.unwrap_or(DEFAULT_DELTAT);
        let jump = Jump::parse(spec.jump.as_deref());
        debug!("resolved fixer for {model}/{exp}/{source}: {} vars", spec.vars.len());
        Ok(Some(Self {
            spec,
            data_model: DataModel::by_name(&model_name),
            unit_table: catalog.defaults.units.clone(),
            deltat,
            jump,
        }))
    }

    /// The resolved spec, mostly for inspection and reporting.
    pub fn spec(&self) -> &FixSpec {
        &self.spec
    }

    /// Map requested canonical variable names to the source names that
    /// must be read to produce them.
    ///
    /// For renamed variables this is the `source` name; for derived ones,
    /// the variables the formula references. A formula referencing names
    /// that are themselves fixer targets cannot be resolved by selection.
    pub fn source_vars_for(&self, requested: &[String]) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        for name in requested {
            match self.spec.vars.get(name) {
                Some(fix) => {
                    if let Some(formula) = &fix.derived {
                        let refs = Expr::parse(formula)?.variables();
                        let recursive: Vec<String> = refs
                            .iter()
                            .filter(|r| self.spec.vars.contains_key(*r))
                            .cloned()
                            .collect();
                        if !recursive.is_empty() {
                            return Err(FixerError::RecursiveDerivation {
                                var: name.clone(),
                                refs: recursive,
                            });
                        }
                        for r in refs {
                            if !out.contains(&r) {
                                out.push(r);
                            }
                        }
                    } else if let Some(source) = &fix.source {
                        if !out.contains(source) {
                            out.push(source.clone());
                        }
                    } else if !out.contains(name) {
                        out.push(name.clone());
                    }
                }
                None => {
                    if !out.contains(name) {
                        out.push(name.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    /// Run the full pipeline on a dataset.
    ///
    /// When `apply_unit_fix` is false, unit conversions are computed and
    /// recorded on the variable attributes (`tgt_units`, `factor`,
    /// `offset`) but the values are left untouched; `apply_unit_fix` on
    /// the dataset performs them later.
    pub fn apply(&self, mut ds: Dataset, apply_unit_fix: bool) -> Result<Dataset> {
        self.rename_vars(&mut ds);
        self.derive_vars(&mut ds)?;
        self.decumulate_vars(&mut ds)?;
        self.prepare_units(&mut ds)?;
        if apply_unit_fix {
            apply_unit_fixes(&mut ds);
        }
        self.data_model.normalize(&mut ds, &self.spec.coords)?;
        for name in &self.spec.delete {
            ds.drop_var(name);
        }
        Ok(ds)
    }

    /// Normalize only coordinates, used for auxiliary datasets such as
    /// cell areas that carry no fixable variables.
    pub fn fix_coords(&self, ds: &mut Dataset) -> Result<()> {
        self.data_model.normalize(ds, &self.spec.coords)
    }

    fn rename_vars(&self, ds: &mut Dataset) {
        for (canonical, fix) in &self.spec.vars {
            let Some(source) = &fix.source else { continue };
            if source == canonical || ds.vars.contains_key(canonical) {
                continue;
            }
            if ds.rename_var(source, canonical).is_ok() {
                debug!("renamed variable '{source}' to '{canonical}'");
            }
        }
    }

    fn derive_vars(&self, ds: &mut Dataset) -> Result<()> {
        for (canonical, fix) in &self.spec.vars {
            let Some(formula) = &fix.derived else { continue };
            if ds.vars.contains_key(canonical) {
                continue;
            }
            let expr = Expr::parse(formula)?;
            // Only derive when every referenced variable was retrieved.
            let available = expr
                .variables()
                .iter()
                .all(|v| ds.vars.contains_key(v));
            if !available {
                debug!("skipping derivation of '{canonical}': inputs not retrieved");
                continue;
            }
            let mut arr = expr.eval(ds, canonical, formula)?;
            arr.attrs.derived = Some(formula.clone());
            // Units of the first input carry over until a unit fix runs.
            if let Some(first) = expr.variables().first() {
                if let Ok(src) = ds.var(first) {
                    arr.attrs.units = src.attrs.units.clone();
                }
            }
            info!("derived '{canonical}' = {formula}");
            ds.insert_var(arr);
        }
        Ok(())
    }

    fn decumulate_vars(&self, ds: &mut Dataset) -> Result<()> {
        for (canonical, fix) in &self.spec.vars {
            if fix.decumulate != Some(true) {
                continue;
            }
            if !ds.vars.contains_key(canonical) {
                continue;
            }
            let Some(time) = ds.time.clone() else {
                warn!("cannot decumulate '{canonical}': dataset has no time axis");
                continue;
            };
            let keep_first = fix.keep_first.unwrap_or(false);
            let nan_window = match (
                fix.nanfirst_startdate.as_deref(),
                fix.nanfirst_enddate.as_deref(),
            ) {
                (Some(start), Some(end)) => {
                    match (cda_common::parse_date(start), cda_common::parse_date(end)) {
                        (Ok(s), Ok(e)) => Some((s, e)),
                        _ => {
                            warn!("'{canonical}': unparsable nanfirst window, ignoring");
                            None
                        }
                    }
                }
                _ => None,
            };
            let arr = ds.var(canonical)?;
            let fixed = decumulate(arr, &time, self.jump, keep_first, nan_window)?;
            ds.insert_var(fixed);
        }
        Ok(())
    }

    /// Record (or stage) unit conversions on each fixed variable.
    fn prepare_units(&self, ds: &mut Dataset) -> Result<()> {
        for (canonical, fix) in &self.spec.vars {
            let Ok(arr) = ds.var_mut(canonical) else { continue };
            let declared = fix
                .src_units
                .clone()
                .or_else(|| arr.attrs.units.clone());
            for (key, value) in &fix.attributes {
                arr.attrs.extra.insert(key.clone(), value.clone());
            }
            let Some(tgt) = &fix.units else { continue };
            let Some(declared) = declared else {
                warn!("'{canonical}': no source units declared, skipping conversion");
                continue;
            };
            let src_norm = normalize_units(&declared, &self.unit_table);
            let tgt_norm = normalize_units(tgt, &self.unit_table);
            if src_norm == tgt_norm {
                arr.attrs.units = Some(tgt_norm);
                continue;
            }
            let (src_spec, tgt_spec) = match (parse_unit(&src_norm), parse_unit(&tgt_norm)) {
                (Ok(s), Ok(t)) => (s, t),
                _ => {
                    warn!("'{canonical}': cannot parse units '{src_norm}' -> '{tgt_norm}', keeping original");
                    continue;
                }
            };
            match convert_units(&src_spec, &tgt_spec, self.deltat, canonical) {
                Conversion::Linear { factor, offset } => {
                    arr.attrs.src_units = Some(src_norm);
                    arr.attrs.tgt_units = Some(tgt_norm);
                    arr.attrs.factor = Some(factor);
                    arr.attrs.offset = Some(offset);
                }
                Conversion::NotConvertible => {
                    // Logged inside convert_units; keep original units.
                }
            }
        }
        Ok(())
    }
}

/// Apply pending unit conversions recorded on variable attributes.
///
/// Safe to call more than once: the pending fields are cleared as they
/// are consumed.
pub fn apply_unit_fixes(ds: &mut Dataset) {
    for arr in ds.vars.values_mut() {
        let (Some(factor), Some(tgt)) = (arr.attrs.factor, arr.attrs.tgt_units.clone()) else {
            continue;
        };
        let offset = arr.attrs.offset.unwrap_or(0.0);
        info!(
            "'{}': converting to {tgt} (factor {factor}, offset {offset})",
            arr.name
        );
        for v in arr.values.iter_mut() {
            *v = *v * factor + offset;
        }
        arr.attrs.units = Some(tgt);
        arr.attrs.factor = None;
        arr.attrs.offset = None;
        arr.attrs.tgt_units = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cda_common::{parse_date, Coordinate, DataArray, TimeAxis};

    const CATALOG: &str = r#"
defaults:
  dst_datamodel: cf
models:
  IFS:
    default:
      default:
        deltat: 3600
        jump: month
        vars:
          tprate:
            source: tp
            units: "mm/day"
            decumulate: true
            keep_first: true
          net:
            derived: "ssr-str"
            units: "W m-2"
          t2m:
            source: "167"
            units: degC
"#;

    fn fixer() -> Fixer {
        let catalog = FixCatalog::from_str(CATALOG).unwrap();
        Fixer::new(&catalog, "IFS", "historical", "hourly")
            .unwrap()
            .unwrap()
    }

    fn dataset() -> Dataset {
        let mut ds = Dataset::new();
        let t0 = parse_date("2020-01-01T00:00:00").unwrap();
        ds.time = Some(TimeAxis {
            times: (0..3)
                .map(|i| t0 + chrono::Duration::hours(i))
                .collect(),
        });
        ds.insert_coord(Coordinate::new("cell", vec![0.0, 1.0]));
        // Accumulated precipitation in meters of water
        let tp = DataArray::new(
            "tp",
            vec!["time".to_string(), "cell".to_string()],
            vec![3, 2],
            vec![0.001, 0.001, 0.003, 0.003, 0.006, 0.006],
        )
        .unwrap()
        .with_units("m");
        ds.insert_var(tp);
        ds
    }

    #[test]
    fn test_no_fixes_disables() {
        let catalog = FixCatalog::from_str(CATALOG).unwrap();
        assert!(Fixer::new(&catalog, "NEMO", "x", "y").unwrap().is_none());
    }

    #[test]
    fn test_rename_decumulate_convert() {
        let ds = fixer().apply(dataset(), true).unwrap();
        assert!(ds.vars.contains_key("tprate"));
        assert!(!ds.vars.contains_key("tp"));
        let tprate = ds.var("tprate").unwrap();
        assert_eq!(tprate.attrs.units.as_deref(), Some("mm/day"));
        assert!(tprate.attrs.decumulated);
        // 1 mm accumulated per hour -> 24 mm/day after decumulation and
        // the density-free depth-to-rate correction
        assert!((tprate.values[0] - 24.0).abs() < 1e-9);
        assert!((tprate.values[2] - 48.0).abs() < 1e-9);
    }

    #[test]
    fn test_deferred_unit_fix() {
        let ds = fixer().apply(dataset(), false).unwrap();
        let tprate = ds.var("tprate").unwrap();
        // Values still raw differences in meters
        assert!((tprate.values[2] - 0.002).abs() < 1e-12);
        assert_eq!(tprate.attrs.tgt_units.as_deref(), Some("mm/day"));
        assert!((tprate.attrs.factor.unwrap() - 24000.0).abs() < 1e-6);

        let mut ds = ds;
        apply_unit_fixes(&mut ds);
        let tprate = ds.var("tprate").unwrap();
        assert!((tprate.values[2] - 48.0).abs() < 1e-9);
        assert_eq!(tprate.attrs.units.as_deref(), Some("mm/day"));
        assert!(tprate.attrs.factor.is_none());
    }

    #[test]
    fn test_derived_variable() {
        let mut ds = dataset();
        let mk = |name: &str, v: f64| {
            DataArray::new(
                name,
                vec!["time".to_string(), "cell".to_string()],
                vec![3, 2],
                vec![v; 6],
            )
            .unwrap()
            .with_units("W m-2")
        };
        ds.insert_var(mk("ssr", 300.0));
        ds.insert_var(mk("str", 100.0));
        let ds = fixer().apply(ds, true).unwrap();
        let net = ds.var("net").unwrap();
        assert_eq!(net.values[0], 200.0);
        assert_eq!(net.attrs.derived.as_deref(), Some("ssr-str"));
        assert_eq!(net.attrs.units.as_deref(), Some("W m-2"));
    }

    #[test]
    fn test_derivation_skipped_when_inputs_missing() {
        let ds = fixer().apply(dataset(), true).unwrap();
        assert!(!ds.vars.contains_key("net"));
    }

    #[test]
    fn test_source_vars_for() {
        let f = fixer();
        let srcs = f
            .source_vars_for(&["tprate".to_string(), "net".to_string()])
            .unwrap();
        assert_eq!(srcs, vec!["tp", "ssr", "str"]);
        // Unfixed variables pass through
        let srcs = f.source_vars_for(&["sst".to_string()]).unwrap();
        assert_eq!(srcs, vec!["sst"]);
    }

    #[test]
    fn test_recursive_derivation_rejected() {
        let catalog = FixCatalog::from_str(
            r#"
models:
  M:
    e:
      s:
        vars:
          a:
            source: raw_a
          b:
            derived: "2*a"
"#,
        )
        .unwrap();
        let f = Fixer::new(&catalog, "M", "e", "s").unwrap().unwrap();
        let err = f.source_vars_for(&["b".to_string()]).unwrap_err();
        assert!(matches!(err, FixerError::RecursiveDerivation { .. }));
    }

    #[test]
    fn test_temperature_conversion_offset() {
        let mut ds = dataset();
        let t = DataArray::new(
            "167",
            vec!["time".to_string(), "cell".to_string()],
            vec![3, 2],
            vec![273.15; 6],
        )
        .unwrap()
        .with_units("K");
        ds.insert_var(t);
        let ds = fixer().apply(ds, true).unwrap();
        let t2m = ds.var("t2m").unwrap();
        assert!((t2m.values[0] - 0.0).abs() < 1e-9);
        assert_eq!(t2m.attrs.units.as_deref(), Some("degC"));
    }
}
