//! Output variables and their unit conversions.
//!
//! Each variable names the summary fields it reads and a pure conversion
//! function. Arity is part of the [`Conversion`] variant, so a variable can
//! never be evaluated with the wrong number of inputs. A missing input or a
//! conversion that cannot apply (a number where a date is expected) yields
//! the nodata value.

use std::collections::BTreeMap;

use chrono::Datelike;

use crate::sim::{Summary, SummaryValue};

type Unary = fn(&SummaryValue) -> Option<f64>;
type Binary = fn(&SummaryValue, &SummaryValue) -> Option<f64>;
type Ternary = fn(&SummaryValue, &SummaryValue, &SummaryValue) -> Option<f64>;
type Quaternary = fn(&SummaryValue, &SummaryValue, &SummaryValue, &SummaryValue) -> Option<f64>;

/// Source fields and conversion function of one variable.
#[derive(Debug, Clone)]
pub enum Conversion {
    Unary { source: String, f: Unary },
    Binary { sources: [String; 2], f: Binary },
    Ternary { sources: [String; 3], f: Ternary },
    Quaternary { sources: [String; 4], f: Quaternary },
}

impl Conversion {
    pub fn unary(source: &str, f: Unary) -> Self {
        Self::Unary {
            source: source.to_string(),
            f,
        }
    }

    pub fn binary(sources: [&str; 2], f: Binary) -> Self {
        Self::Binary {
            sources: sources.map(str::to_string),
            f,
        }
    }

    pub fn ternary(sources: [&str; 3], f: Ternary) -> Self {
        Self::Ternary {
            sources: sources.map(str::to_string),
            f,
        }
    }

    pub fn quaternary(sources: [&str; 4], f: Quaternary) -> Self {
        Self::Quaternary {
            sources: sources.map(str::to_string),
            f,
        }
    }

    /// Evaluate against a summary; `None` if an input is missing or unusable.
    pub fn evaluate(&self, summary: &Summary) -> Option<f64> {
        let value = match self {
            Self::Unary { source, f } => f(summary.get(source)?),
            Self::Binary { sources: [a, b], f } => f(summary.get(a)?, summary.get(b)?),
            Self::Ternary {
                sources: [a, b, c],
                f,
            } => f(summary.get(a)?, summary.get(b)?, summary.get(c)?),
            Self::Quaternary {
                sources: [a, b, c, d],
                f,
            } => f(
                summary.get(a)?,
                summary.get(b)?,
                summary.get(c)?,
                summary.get(d)?,
            ),
        }?;
        value.is_finite().then_some(value)
    }
}

/// An output variable.
#[derive(Debug, Clone)]
pub struct VariableSpec {
    pub name: String,
    pub long_name: String,
    pub units: String,
    pub conversion: Conversion,
}

impl VariableSpec {
    pub fn new(name: &str, long_name: &str, units: &str, conversion: Conversion) -> Self {
        Self {
            name: name.to_string(),
            long_name: long_name.to_string(),
            units: units.to_string(),
            conversion,
        }
    }
}

/// Ordered set of output variables.
#[derive(Debug, Clone)]
pub struct ConversionRegistry {
    variables: Vec<VariableSpec>,
    nodata: f64,
}

impl ConversionRegistry {
    /// Empty registry.
    pub fn new(nodata: f64) -> Self {
        Self {
            variables: Vec::new(),
            nodata,
        }
    }

    /// Registry with the standard crop output variables.
    pub fn with_defaults(nodata: f64) -> Self {
        let mut registry = Self::new(nodata);
        registry.register(VariableSpec::new(
            "yield",
            "Crop yield (dry matter)",
            "t ha-1 yr-1",
            Conversion::unary("TWSO", kg_ha_to_t_ha),
        ));
        registry.register(VariableSpec::new(
            "biom",
            "Total above ground biomass yield",
            "t ha-1 yr-1",
            Conversion::unary("TAGP", kg_ha_to_t_ha),
        ));
        registry.register(VariableSpec::new(
            "aet",
            "Actual growing season evapotranspiration",
            "mm yr-1",
            Conversion::binary(["EVST", "CTRAT"], cm_sum_to_mm),
        ));
        registry.register(VariableSpec::new(
            "plant-day",
            "Actual planting date",
            "day of year",
            Conversion::unary("DOS", day_of_year),
        ));
        registry.register(VariableSpec::new(
            "anth-day",
            "Days from planting to anthesis",
            "days",
            Conversion::binary(["DOS", "DOA"], days_between),
        ));
        registry.register(VariableSpec::new(
            "maty-day",
            "Days from planting to maturity",
            "days",
            Conversion::binary(["DOS", "DOM"], days_between),
        ));
        registry.register(VariableSpec::new(
            "smt",
            "Sum of daily mean temps, planting to harvest",
            "deg C-days yr-1",
            Conversion::ternary(["GSTEMPAVG", "DOS", "DOM"], rate_times_days),
        ));
        registry
    }

    /// Add a variable, replacing one of the same name in place.
    pub fn register(&mut self, spec: VariableSpec) {
        match self.variables.iter_mut().find(|v| v.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.variables.push(spec),
        }
    }

    pub fn get(&self, name: &str) -> Option<&VariableSpec> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Variables in registration order.
    pub fn variables(&self) -> impl Iterator<Item = &VariableSpec> {
        self.variables.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.variables.iter().map(|v| v.name.as_str()).collect()
    }

    /// Convert one variable; nodata if it is unknown or cannot be computed.
    pub fn convert(&self, name: &str, summary: &Summary) -> f64 {
        self.get(name)
            .and_then(|spec| spec.conversion.evaluate(summary))
            .unwrap_or(self.nodata)
    }

    /// Convert every variable.
    pub fn convert_all(&self, summary: &Summary) -> BTreeMap<String, f64> {
        self.variables
            .iter()
            .map(|spec| {
                let value = spec.conversion.evaluate(summary).unwrap_or(self.nodata);
                (spec.name.clone(), value)
            })
            .collect()
    }
}

// ── Conversion functions ────────────────────────────────────────────

/// Identity on numbers.
pub fn identity(v: &SummaryValue) -> Option<f64> {
    v.as_f64()
}

/// kg/ha → t/ha.
pub fn kg_ha_to_t_ha(v: &SummaryValue) -> Option<f64> {
    v.as_f64().map(|x| x * 0.001)
}

/// Sum of two cm amounts, in mm.
pub fn cm_sum_to_mm(a: &SummaryValue, b: &SummaryValue) -> Option<f64> {
    Some(10.0 * (a.as_f64()? + b.as_f64()?))
}

/// Day of year of a date.
pub fn day_of_year(v: &SummaryValue) -> Option<f64> {
    v.as_date().map(|d| d.ordinal() as f64)
}

/// Days from the first date to the second.
pub fn days_between(start: &SummaryValue, end: &SummaryValue) -> Option<f64> {
    Some((end.as_date()? - start.as_date()?).num_days() as f64)
}

/// Daily rate multiplied by the number of days between two dates.
pub fn rate_times_days(rate: &SummaryValue, start: &SummaryValue, end: &SummaryValue) -> Option<f64> {
    Some(rate.as_f64()? * days_between(start, end)?)
}

/// Plain sum of four numbers.
pub fn sum4(a: &SummaryValue, b: &SummaryValue, c: &SummaryValue, d: &SummaryValue) -> Option<f64> {
    Some(a.as_f64()? + b.as_f64()? + c.as_f64()? + d.as_f64()?)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    const NODATA: f64 = 1e20;

    fn summary(pairs: &[(&str, SummaryValue)]) -> Summary {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn date(m: u32, d: u32) -> SummaryValue {
        SummaryValue::Date(NaiveDate::from_ymd_opt(2001, m, d).unwrap())
    }

    #[test]
    fn yield_scales_kg_to_tonnes() {
        let registry = ConversionRegistry::with_defaults(NODATA);
        let s = summary(&[("TWSO", SummaryValue::Number(5000.0))]);
        assert_eq!(registry.convert("yield", &s), 5.0);
    }

    #[test]
    fn missing_input_gives_nodata() {
        let registry = ConversionRegistry::with_defaults(NODATA);
        let s = summary(&[("EVST", SummaryValue::Number(1.0))]);
        assert_eq!(registry.convert("aet", &s), NODATA);
        assert_eq!(registry.convert("no-such-variable", &s), NODATA);
    }

    #[test]
    fn wrong_kind_gives_nodata() {
        let registry = ConversionRegistry::with_defaults(NODATA);
        let s = summary(&[("DOS", SummaryValue::Number(120.0))]);
        assert_eq!(registry.convert("plant-day", &s), NODATA);
    }

    #[test]
    fn date_conversions() {
        let registry = ConversionRegistry::with_defaults(NODATA);
        let s = summary(&[
            ("DOS", date(4, 1)),
            ("DOA", date(6, 10)),
            ("DOM", date(8, 9)),
            ("GSTEMPAVG", SummaryValue::Number(20.0)),
            ("EVST", SummaryValue::Number(5.0)),
            ("CTRAT", SummaryValue::Number(25.0)),
        ]);
        let out = registry.convert_all(&s);
        assert_eq!(out["plant-day"], 91.0);
        assert_eq!(out["anth-day"], 70.0);
        assert_eq!(out["maty-day"], 130.0);
        assert_eq!(out["smt"], 2600.0);
        assert_eq!(out["aet"], 300.0);
        assert_eq!(out["yield"], NODATA);
    }

    #[test]
    fn custom_quaternary_registration() {
        let mut registry = ConversionRegistry::new(NODATA);
        registry.register(VariableSpec::new(
            "total",
            "Sum of four fields",
            "-",
            Conversion::quaternary(["A", "B", "C", "D"], sum4),
        ));
        let full = summary(&[
            ("A", SummaryValue::Number(1.0)),
            ("B", SummaryValue::Number(2.0)),
            ("C", SummaryValue::Number(3.0)),
            ("D", SummaryValue::Number(4.0)),
        ]);
        assert_eq!(registry.convert("total", &full), 10.0);

        let partial = summary(&[("A", SummaryValue::Number(1.0))]);
        assert_eq!(registry.convert("total", &partial), NODATA);
    }

    #[test]
    fn register_replaces_in_place() {
        let mut registry = ConversionRegistry::with_defaults(NODATA);
        let before = registry.names().len();
        registry.register(VariableSpec::new(
            "yield",
            "Raw yield",
            "kg ha-1",
            Conversion::unary("TWSO", identity),
        ));
        assert_eq!(registry.names().len(), before);
        assert_eq!(registry.names()[0], "yield");
        let s = summary(&[("TWSO", SummaryValue::Number(5000.0))]);
        assert_eq!(registry.convert("yield", &s), 5000.0);
    }
}
