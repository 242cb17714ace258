//! Fix specification catalog.
//!
//! Fixes are declared in YAML, organized as model -> experiment -> source.
//! A lookup walks that hierarchy falling back to `default` entries at each
//! level, so a model-wide fix applies to every experiment and source that
//! does not declare its own. Specs may also name an explicit parent spec
//! and a merge method controlling how child and parent combine.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FixerError, Result};

/// How a child spec combines with its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    /// Use the child spec alone, ignoring the parent.
    Replace,
    /// Union of both; the child wins on conflicts, variable entries are
    /// merged field by field.
    #[default]
    Merge,
    /// The parent wins; the child only fills keys the parent leaves unset.
    Default,
}

/// Fix rules for a single variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarFix {
    /// Source variable to rename from, e.g. a grib short name or code.
    pub source: Option<String>,
    /// Formula deriving this variable from others, e.g. "2*tp-e".
    pub derived: Option<String>,
    /// Target units to convert to.
    pub units: Option<String>,
    /// Override for the units declared in the source metadata.
    pub src_units: Option<String>,
    /// Whether the variable is accumulated and must be decumulated.
    pub decumulate: Option<bool>,
    /// Keep the first timestep raw when decumulating.
    pub keep_first: Option<bool>,
    /// Start of the date window in which the first timestep is forced to
    /// NaN regardless of `keep_first` (spin-up artifacts).
    pub nanfirst_startdate: Option<String>,
    /// End of that window.
    pub nanfirst_enddate: Option<String>,
    /// Extra attributes to set verbatim.
    pub attributes: BTreeMap<String, String>,
}

impl VarFix {
    /// Merge `other` underneath `self`: fields set here win.
    fn or(&self, other: &VarFix) -> VarFix {
        let mut attributes = other.attributes.clone();
        attributes.extend(self.attributes.clone());
        VarFix {
            source: self.source.clone().or_else(|| other.source.clone()),
            derived: self.derived.clone().or_else(|| other.derived.clone()),
            units: self.units.clone().or_else(|| other.units.clone()),
            src_units: self.src_units.clone().or_else(|| other.src_units.clone()),
            decumulate: self.decumulate.or(other.decumulate),
            keep_first: self.keep_first.or(other.keep_first),
            nanfirst_startdate: self
                .nanfirst_startdate
                .clone()
                .or_else(|| other.nanfirst_startdate.clone()),
            nanfirst_enddate: self
                .nanfirst_enddate
                .clone()
                .or_else(|| other.nanfirst_enddate.clone()),
            attributes,
        }
    }
}

/// A fix specification for one source (or a shared parent).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixSpec {
    /// Name of another spec to inherit from, as "model-exp-source".
    pub parent: Option<String>,
    /// How to combine with the parent.
    pub method: MergeMethod,
    /// Target data model for coordinate normalization; None keeps the
    /// catalog default.
    pub data_model: Option<String>,
    /// Accumulation timestep in seconds for unit corrections.
    pub deltat: Option<f64>,
    /// Decumulation boundary where the counter resets ("month" or "day").
    pub jump: Option<String>,
    /// Per-variable rules, keyed by canonical variable name.
    pub vars: BTreeMap<String, VarFix>,
    /// Variables to delete after fixing.
    pub delete: Vec<String>,
    /// Coordinate renames, source name -> canonical name.
    pub coords: BTreeMap<String, String>,
}

impl FixSpec {
    /// Combine this spec with its parent according to `method`.
    fn merged_with(&self, parent: &FixSpec) -> FixSpec {
        match self.method {
            MergeMethod::Replace => self.clone(),
            MergeMethod::Merge => merge_specs(self, parent),
            MergeMethod::Default => {
                let mut out = merge_specs(parent, self);
                // Keep the child's own linkage fields.
                out.parent = self.parent.clone();
                out.method = self.method;
                out
            }
        }
    }
}

/// Union of two specs where `child` takes precedence key by key.
fn merge_specs(child: &FixSpec, parent: &FixSpec) -> FixSpec {
    let mut vars = parent.vars.clone();
    for (name, fix) in &child.vars {
        let merged = match vars.get(name) {
            Some(existing) => fix.or(existing),
            None => fix.clone(),
        };
        vars.insert(name.clone(), merged);
    }
    let mut coords = parent.coords.clone();
    coords.extend(child.coords.clone());
    let mut delete = parent.delete.clone();
    for d in &child.delete {
        if !delete.contains(d) {
            delete.push(d.clone());
        }
    }
    FixSpec {
        parent: child.parent.clone(),
        method: child.method,
        data_model: child.data_model.clone().or_else(|| parent.data_model.clone()),
        deltat: child.deltat.or(parent.deltat),
        jump: child.jump.clone().or_else(|| parent.jump.clone()),
        vars,
        delete,
        coords,
    }
}

/// Catalog-wide defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FixDefaults {
    /// Data model applied when a spec does not name one.
    pub dst_datamodel: Option<String>,
    /// Replacement table for non-standard unit spellings.
    pub units: BTreeMap<String, String>,
}

/// The full fix catalog: defaults plus the model/exp/source hierarchy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FixCatalog {
    pub defaults: FixDefaults,
    /// model -> experiment -> source -> spec.
    pub models: BTreeMap<String, BTreeMap<String, BTreeMap<String, FixSpec>>>,
}

impl FixCatalog {
    /// Parse a catalog from YAML text.
    pub fn from_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load a catalog from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| FixerError::SpecLoad(format!("{}: {e}", path.display())))?;
        Self::from_str(&text)
    }

    /// Merge another catalog into this one; existing entries win.
    pub fn extend_with(&mut self, other: FixCatalog) {
        if self.defaults.dst_datamodel.is_none() {
            self.defaults.dst_datamodel = other.defaults.dst_datamodel;
        }
        for (k, v) in other.defaults.units {
            self.defaults.units.entry(k).or_insert(v);
        }
        for (model, exps) in other.models {
            let model_entry = self.models.entry(model).or_default();
            for (exp, sources) in exps {
                let exp_entry = model_entry.entry(exp).or_default();
                for (source, spec) in sources {
                    exp_entry.entry(source).or_insert(spec);
                }
            }
        }
    }

    /// Look up the spec for a triplet, falling back to `default` entries
    /// at the source, experiment and model levels. Returns None when no
    /// fixes are defined at all, which disables fixing.
    pub fn lookup(&self, model: &str, exp: &str, source: &str) -> Result<Option<FixSpec>> {
        let raw = self.lookup_raw(model, exp, source);
        let Some(spec) = raw else {
            debug!("no fixes found for {model}/{exp}/{source}");
            return Ok(None);
        };
        Ok(Some(self.resolve_parents(spec.clone())?))
    }

    fn lookup_raw(&self, model: &str, exp: &str, source: &str) -> Option<&FixSpec> {
        let exps = self
            .models
            .get(model)
            .or_else(|| self.models.get("default"))?;
        let sources = exps.get(exp).or_else(|| exps.get("default"))?;
        sources.get(source).or_else(|| sources.get("default"))
    }

    /// Find a spec by its explicit "model-exp-source" name.
    fn by_name(&self, name: &str) -> Option<&FixSpec> {
        let mut parts = name.splitn(3, '-');
        let model = parts.next()?;
        let exp = parts.next()?;
        let source = parts.next()?;
        self.models.get(model)?.get(exp)?.get(source)
    }

    /// Walk the parent chain, merging at each step. Cycles and missing
    /// parents are hard errors.
    fn resolve_parents(&self, spec: FixSpec) -> Result<FixSpec> {
        let mut resolved = spec;
        let mut seen: Vec<String> = Vec::new();
        while let Some(parent_name) = resolved.parent.clone() {
            if seen.contains(&parent_name) {
                return Err(FixerError::ParentCycle(parent_name));
            }
            seen.push(parent_name.clone());
            let parent = self
                .by_name(&parent_name)
                .ok_or_else(|| FixerError::MissingParent(parent_name.clone()))?;
            if resolved.method == MergeMethod::Replace {
                warn!("fix spec names parent '{parent_name}' but method is replace");
                resolved.parent = None;
                break;
            }
            let mut merged = resolved.merged_with(parent);
            merged.parent = parent.parent.clone();
            resolved = merged;
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
defaults:
  dst_datamodel: cf
  units:
    "~": dimensionless
models:
  IFS:
    default:
      default:
        deltat: 3600
        jump: month
        vars:
          "2t":
            source: "167"
            units: K
          tp:
            source: "228"
            units: "mm/day"
            decumulate: true
    historical:
      hourly:
        parent: "IFS-default-default"
        method: merge
        vars:
          tp:
            keep_first: true
          tcc:
            source: "164"
            units: frac
    coupled:
      monthly:
        parent: "IFS-default-default"
        method: replace
        vars:
          "2t":
            source: stl1
      daily:
        parent: "IFS-default-default"
        method: default
        deltat: 86400
        jump: day
        vars:
          "2t":
            units: degC
"#;

    fn catalog() -> FixCatalog {
        FixCatalog::from_str(CATALOG).unwrap()
    }

    #[test]
    fn test_default_fallback() {
        let spec = catalog().lookup("IFS", "ssp585", "whatever").unwrap().unwrap();
        assert_eq!(spec.deltat, Some(3600.0));
        assert_eq!(spec.vars["tp"].source.as_deref(), Some("228"));
    }

    #[test]
    fn test_no_fixes_defined() {
        assert!(catalog().lookup("NEMO", "x", "y").unwrap().is_none());
    }

    #[test]
    fn test_merge_inherits_and_overrides() {
        let spec = catalog().lookup("IFS", "historical", "hourly").unwrap().unwrap();
        // Inherited from parent
        assert_eq!(spec.deltat, Some(3600.0));
        assert_eq!(spec.vars["2t"].source.as_deref(), Some("167"));
        // Child addition merged into inherited entry
        assert_eq!(spec.vars["tp"].keep_first, Some(true));
        assert_eq!(spec.vars["tp"].source.as_deref(), Some("228"));
        // Child-only variable
        assert_eq!(spec.vars["tcc"].units.as_deref(), Some("frac"));
    }

    #[test]
    fn test_replace_ignores_parent() {
        let spec = catalog().lookup("IFS", "coupled", "monthly").unwrap().unwrap();
        assert_eq!(spec.vars["2t"].source.as_deref(), Some("stl1"));
        assert!(spec.deltat.is_none());
        assert!(!spec.vars.contains_key("tp"));
    }

    #[test]
    fn test_default_method_parent_wins() {
        let spec = catalog().lookup("IFS", "coupled", "daily").unwrap().unwrap();
        // Parent keeps its values where set
        assert_eq!(spec.deltat, Some(3600.0));
        assert_eq!(spec.jump.as_deref(), Some("month"));
        assert_eq!(spec.vars["2t"].units.as_deref(), Some("K"));
        // Parent is silent on keep_first, child could supply it (here unset)
        assert!(spec.vars["2t"].source.is_some());
    }

    #[test]
    fn test_missing_parent_error() {
        let yaml = r#"
models:
  M:
    e:
      s:
        parent: "no-such-spec"
"#;
        let cat = FixCatalog::from_str(yaml).unwrap();
        assert!(matches!(
            cat.lookup("M", "e", "s"),
            Err(FixerError::MissingParent(_))
        ));
    }

    #[test]
    fn test_parent_cycle_error() {
        let yaml = r#"
models:
  M:
    e:
      a:
        parent: "M-e-b"
      b:
        parent: "M-e-a"
"#;
        let cat = FixCatalog::from_str(yaml).unwrap();
        assert!(matches!(
            cat.lookup("M", "e", "a"),
            Err(FixerError::ParentCycle(_))
        ));
    }

    #[test]
    fn test_catalog_extend_existing_wins() {
        let mut cat = catalog();
        let extra = FixCatalog::from_str(
            r#"
defaults:
  dst_datamodel: other
models:
  IFS:
    default:
      default:
        deltat: 1
  NEW:
    e:
      s:
        deltat: 2
"#,
        )
        .unwrap();
        cat.extend_with(extra);
        assert_eq!(cat.defaults.dst_datamodel.as_deref(), Some("cf"));
        let spec = cat.lookup("IFS", "x", "y").unwrap().unwrap();
        assert_eq!(spec.deltat, Some(3600.0));
        assert!(cat.lookup("NEW", "e", "s").unwrap().is_some());
    }
}
