//! Physical unit parsing and conversion.
//!
//! Units are reduced to a scale factor over SI base dimensions
//! (mass, length, time, temperature). Conversion between two units of the
//! same dimension yields a multiplicative factor (plus an offset for
//! temperatures). When dimensions differ, a small set of compound
//! corrections common in climate model output is attempted: a missing
//! water-density factor (mass flux declared as length flux) and a missing
//! accumulation time (accumulated depth instead of rate). Anything else
//! is incommensurate and reported as not convertible.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::error::{FixerError, Result};

/// Density of water used for mass-flux/length-flux corrections, kg/m3.
const WATER_DENSITY: f64 = 1000.0;

/// Exponents over [mass, length, time, temperature].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dims([i8; 4]);

impl Dims {
    fn sub(self, other: Self) -> Self {
        let mut out = [0i8; 4];
        for i in 0..4 {
            out[i] = self.0[i] - other.0[i];
        }
        Dims(out)
    }

    fn is_dimensionless(self) -> bool {
        self.0 == [0; 4]
    }

    fn of(mass: i8, length: i8, time: i8, temp: i8) -> Self {
        Dims([mass, length, time, temp])
    }
}

/// A unit reduced to base dimensions: value_in_si = value * scale + offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitSpec {
    pub scale: f64,
    pub offset: f64,
    dims: Dims,
}

/// The outcome of a conversion request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Conversion {
    /// Multiply by factor and add offset.
    Linear { factor: f64, offset: f64 },
    /// No conversion could be determined; keep original units.
    NotConvertible,
}

/// Normalize non-standard unit spellings found in model output.
///
/// Applies the configured replacement table first, then a few builtin
/// cleanups ("m of water equivalent", bare "1").
pub fn normalize_units(src: &str, fix_table: &BTreeMap<String, String>) -> String {
    let mut s = src.trim().to_string();
    if let Some(replacement) = fix_table.get(&s) {
        debug!("replacing non-standard unit '{s}' with '{replacement}'");
        return replacement.clone();
    }
    for word in ["of", "water", "equivalent"] {
        s = s.replace(word, "");
    }
    let s = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if s == "1" || s.is_empty() {
        return "dimensionless".to_string();
    }
    s
}

/// Parse a unit string such as "kg m-2 s-1", "mm/day", "W/m2" or "degC".
pub fn parse_unit(unit: &str) -> Result<UnitSpec> {
    let cleaned = unit.trim().replace("**", "^");
    if cleaned.is_empty() {
        return Err(FixerError::UnitParse(unit.to_string()));
    }

    // Temperature units carry an offset and cannot appear in compounds.
    if let Some(spec) = parse_temperature(&cleaned) {
        return Ok(spec);
    }

    let mut scale = 1.0;
    let mut dims = Dims::default();
    let mut denominator = false;
    let mut token = String::new();
    let mut pending: Vec<(String, bool)> = Vec::new();
    for c in cleaned.chars() {
        match c {
            ' ' | '*' | '/' => {
                if !token.is_empty() {
                    pending.push((std::mem::take(&mut token), denominator));
                }
                if c == '/' {
                    denominator = true;
                }
            }
            _ => token.push(c),
        }
    }
    if !token.is_empty() {
        pending.push((token, denominator));
    }
    if pending.is_empty() {
        return Err(FixerError::UnitParse(unit.to_string()));
    }

    for (tok, denom) in pending {
        let (base, exp) = split_exponent(&tok).ok_or_else(|| FixerError::UnitParse(unit.to_string()))?;
        let (base_scale, base_dims) =
            base_unit(&base).ok_or_else(|| FixerError::UnitParse(unit.to_string()))?;
        let exp = if denom { -exp } else { exp };
        scale *= base_scale.powi(exp as i32);
        let mut d = dims.0;
        for i in 0..4 {
            d[i] += base_dims.0[i] * exp;
        }
        dims = Dims(d);
    }

    Ok(UnitSpec {
        scale,
        offset: 0.0,
        dims,
    })
}

fn parse_temperature(s: &str) -> Option<UnitSpec> {
    let temp = |scale: f64, offset: f64| {
        Some(UnitSpec {
            scale,
            offset,
            dims: Dims::of(0, 0, 0, 1),
        })
    };
    match s {
        "K" | "kelvin" | "Kelvin" => temp(1.0, 0.0),
        "degC" | "C" | "celsius" | "Celsius" | "deg_C" => temp(1.0, 273.15),
        _ => None,
    }
}

/// Split "m2" / "s-1" / "m^2" / "kg" into (base, exponent).
fn split_exponent(tok: &str) -> Option<(String, i8)> {
    let tok = tok.replace('^', "");
    let split = tok
        .char_indices()
        .find(|(_, c)| c.is_ascii_digit() || *c == '-')
        .map(|(i, _)| i);
    match split {
        Some(0) => None, // bare number is not a unit token
        Some(i) => {
            let exp: i8 = tok[i..].parse().ok()?;
            Some((tok[..i].to_string(), exp))
        }
        None => Some((tok, 1)),
    }
}

/// Scale and dimensions for a base or derived unit token.
fn base_unit(name: &str) -> Option<(f64, Dims)> {
    let u = |scale: f64, mass: i8, length: i8, time: i8, temp: i8| {
        Some((scale, Dims::of(mass, length, time, temp)))
    };
    match name {
        // length
        "m" | "meter" | "metre" => u(1.0, 0, 1, 0, 0),
        "cm" => u(0.01, 0, 1, 0, 0),
        "mm" => u(0.001, 0, 1, 0, 0),
        "km" => u(1000.0, 0, 1, 0, 0),
        // mass
        "kg" => u(1.0, 1, 0, 0, 0),
        "g" => u(0.001, 1, 0, 0, 0),
        // time
        "s" | "sec" | "second" | "seconds" => u(1.0, 0, 0, 1, 0),
        "min" | "minute" | "minutes" => u(60.0, 0, 0, 1, 0),
        "h" | "hr" | "hour" | "hours" => u(3600.0, 0, 0, 1, 0),
        "d" | "day" | "days" => u(86400.0, 0, 0, 1, 0),
        // temperature without offset (valid inside compounds)
        "K" => u(1.0, 0, 0, 0, 1),
        // derived
        "N" => u(1.0, 1, 1, -2, 0),
        "Pa" => u(1.0, 1, -1, -2, 0),
        "hPa" => u(100.0, 1, -1, -2, 0),
        "J" => u(1.0, 1, 2, -2, 0),
        "W" => u(1.0, 1, 2, -3, 0),
        // dimensionless family
        "dimensionless" | "frac" | "fraction" | "Fraction" => u(1.0, 0, 0, 0, 0),
        "%" | "percent" => u(0.01, 0, 0, 0, 0),
        "psu" | "PSU" => u(1e-3, 0, 0, 0, 0),
        // volume transport
        "Sv" => u(1e6, 0, 3, -1, 0),
        _ => None,
    }
}

/// Compute the conversion from `src` to `dst`.
///
/// `deltat` is the accumulation timestep in seconds, used when the ratio
/// of the two units leaves a bare time dimension (accumulated quantity
/// converted to a rate). Returns `NotConvertible` when no correction
/// applies; the caller is expected to keep the original units and log.
pub fn convert_units(src: &UnitSpec, dst: &UnitSpec, deltat: f64, var: &str) -> Conversion {
    let residual = src.dims.sub(dst.dims);

    if residual.is_dimensionless() {
        let factor = src.scale / dst.scale;
        let offset = (src.offset - dst.offset) / dst.scale;
        return Conversion::Linear { factor, offset };
    }

    // Offsets only exist for plain temperatures, which always share dims.
    let factor = src.scale / dst.scale;
    let corrected = if residual == Dims::of(-1, 3, 0, 0) {
        info!("{var}: corrected multiplying by density of water {WATER_DENSITY} kg m-3");
        Some(factor * WATER_DENSITY)
    } else if residual == Dims::of(-1, 3, 1, 0) {
        info!("{var}: corrected multiplying by density of water {WATER_DENSITY} kg m-3");
        info!("{var}: corrected dividing by accumulation time {deltat} s");
        Some(factor * WATER_DENSITY / deltat)
    } else if residual == Dims::of(0, 0, 1, 0) {
        info!("{var}: corrected dividing by accumulation time {deltat} s");
        Some(factor / deltat)
    } else if residual == Dims::of(1, -3, 0, 0) {
        info!("{var}: corrected dividing by density of water {WATER_DENSITY} kg m-3");
        Some(factor / WATER_DENSITY)
    } else {
        None
    };

    match corrected {
        Some(factor) => Conversion::Linear {
            factor,
            offset: 0.0,
        },
        None => {
            info!("{var}: incommensurate units, no conversion applied");
            Conversion::NotConvertible
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factor(src: &str, dst: &str, deltat: f64) -> f64 {
        let s = parse_unit(src).unwrap();
        let d = parse_unit(dst).unwrap();
        match convert_units(&s, &d, deltat, "test") {
            Conversion::Linear { factor, .. } => factor,
            Conversion::NotConvertible => panic!("expected conversion {src} -> {dst}"),
        }
    }

    #[test]
    fn test_simple_scaling() {
        assert!((factor("m", "mm", 1.0) - 1000.0).abs() < 1e-9);
        assert!((factor("hPa", "Pa", 1.0) - 100.0).abs() < 1e-9);
        assert!((factor("km", "m", 1.0) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_temperature_offset() {
        let s = parse_unit("degC").unwrap();
        let d = parse_unit("K").unwrap();
        match convert_units(&s, &d, 1.0, "t2m") {
            Conversion::Linear { factor, offset } => {
                assert!((factor - 1.0).abs() < 1e-12);
                assert!((offset - 273.15).abs() < 1e-12);
            }
            _ => panic!("expected linear conversion"),
        }
    }

    #[test]
    fn test_compound_units() {
        assert!((factor("kg m-2 s-1", "mm/day", 1.0) - 86400.0).abs() < 1e-6);
        assert!((factor("W/m2", "W m-2", 1.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_accumulated_depth_to_rate() {
        // Accumulated meters over one hour to mm/day: 1 m/h = 24000 mm/day
        assert!((factor("m", "mm/day", 3600.0) - 24000.0).abs() < 1e-6);
    }

    #[test]
    fn test_density_correction() {
        // Length flux declared where a mass flux is wanted
        let f = factor("m s-1", "kg m-2 s-1", 1.0);
        assert!((f - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_incommensurate() {
        let s = parse_unit("K").unwrap();
        let d = parse_unit("m").unwrap();
        assert_eq!(convert_units(&s, &d, 1.0, "x"), Conversion::NotConvertible);
    }

    #[test]
    fn test_normalize_units() {
        let mut table = BTreeMap::new();
        table.insert("~".to_string(), "dimensionless".to_string());
        assert_eq!(normalize_units("m of water equivalent", &table), "m");
        assert_eq!(normalize_units("1", &table), "dimensionless");
        assert_eq!(normalize_units("~", &table), "dimensionless");
        assert_eq!(normalize_units("kg m-2", &table), "kg m-2");
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_unit("furlongs").is_err());
        assert!(parse_unit("").is_err());
    }
}
