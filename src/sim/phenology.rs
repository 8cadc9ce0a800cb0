//! Thermal-time crop model.
//!
//! Development runs on daily mean temperature above `tbase`: anthesis when
//! the temperature sum since sowing reaches TSUM1, maturity after a further
//! TSUM2. Water comes from a single soil bucket refilled by rain. Growth is
//! transpiration times a fixed water-use efficiency; grain fills only after
//! anthesis. Crude by intent: it produces the fields the output pipeline
//! consumes, not agronomic accuracy.

use std::collections::BTreeMap;

use chrono::Duration;

use crate::error::SimulationError;
use crate::sim::{SimulationInput, SimulationOutput, Simulator, StepRecord, SummaryValue};

/// Reference evapotranspiration per °C of mean temperature, mm/d.
const ET_PER_DEGREE: f64 = 0.15;
/// Above-ground biomass per mm transpired, kg/ha.
const WATER_USE_EFFICIENCY: f64 = 40.0;
/// Share of post-anthesis growth allocated to storage organs.
const GRAIN_PARTITION: f64 = 0.6;

/// The bundled [`Simulator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PhenologyModel;

impl Simulator for PhenologyModel {
    fn run(&self, input: &SimulationInput) -> Result<SimulationOutput, SimulationError> {
        let crop = &input.crop;
        if !(crop.tsum1 > 0.0 && crop.tsum2 > 0.0) {
            return Err(SimulationError::MissingCropParameter(format!(
                "TSUM1={} TSUM2={}",
                crop.tsum1, crop.tsum2
            )));
        }

        let start = input.timer.crop_start_date;
        let end = input.timer.crop_end_date;
        let mut water = input.soil.max_water;
        let mut tsum = 0.0;
        let mut tagp = 0.0;
        let mut twso = 0.0;
        let mut evst = 0.0;
        let mut ctrat = 0.0;
        let mut temp_total = 0.0;
        let mut days = 0u32;
        let mut anthesis = None;
        let mut maturity = None;
        let mut steps = Vec::new();

        let mut day = start;
        while day <= end {
            let Some(w) = input.weather.day(day) else {
                return Err(SimulationError::Model(format!("weather gap on {day}")));
            };
            let tavg = w.tavg();
            temp_total += tavg;
            days += 1;
            tsum += (tavg - crop.tbase).max(0.0);

            let dvs = if tsum < crop.tsum1 {
                tsum / crop.tsum1
            } else {
                (1.0 + (tsum - crop.tsum1) / crop.tsum2).min(2.0)
            };
            if anthesis.is_none() && dvs >= 1.0 {
                anthesis = Some(day);
            }

            // Canopy cover grows with development until anthesis.
            let cover = dvs.min(1.0);
            water = (water + w.rain).min(input.soil.max_water);
            let demand = ET_PER_DEGREE * tavg.max(0.0);
            let actual = demand.min(water);
            water -= actual;
            let transpiration = actual * cover;
            evst += actual - transpiration;
            ctrat += transpiration;

            let growth = transpiration * WATER_USE_EFFICIENCY;
            tagp += growth;
            if anthesis.is_some() {
                twso += growth * GRAIN_PARTITION;
            }

            let mut values = BTreeMap::new();
            values.insert("DVS".to_string(), dvs);
            values.insert("TSUM".to_string(), tsum);
            values.insert("TAGP".to_string(), tagp);
            values.insert("TWSO".to_string(), twso);
            values.insert("SM".to_string(), water);
            steps.push(StepRecord { day, values });

            if dvs >= 2.0 {
                maturity = Some(day);
                break;
            }
            day += Duration::days(1);
        }

        let mut summary = BTreeMap::new();
        let number = |v: f64| SummaryValue::Number(v);
        summary.insert("TSUM".to_string(), number(tsum));
        summary.insert("TAGP".to_string(), number(tagp));
        summary.insert("TWSO".to_string(), number(twso));
        // mm to cm
        summary.insert("EVST".to_string(), number(evst / 10.0));
        summary.insert("CTRAT".to_string(), number(ctrat / 10.0));
        summary.insert("DOS".to_string(), SummaryValue::Date(start));
        if let Some(doa) = anthesis {
            summary.insert("DOA".to_string(), SummaryValue::Date(doa));
        }
        if let Some(dom) = maturity {
            summary.insert("DOM".to_string(), SummaryValue::Date(dom));
        }
        if days > 0 {
            summary.insert("GSTEMPAVG".to_string(), number(temp_total / days as f64));
        }
        if let Some(last) = steps.last() {
            summary.insert(
                "DVS".to_string(),
                number(last.values.get("DVS").copied().unwrap_or(0.0)),
            );
        }

        Ok(SimulationOutput { steps, summary })
    }
}
