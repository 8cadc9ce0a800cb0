//! Simulation result records and their on-disk encoding.
//!
//! Results are stored as JSON inside a small envelope carrying a format
//! version, so readers reject layouts they do not understand instead of
//! misreading them.

use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;
use crate::sim::{StepRecord, Summary};

/// Envelope version written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Output of one successful task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub task_id: i64,
    pub crop_no: i64,
    pub longitude: f64,
    pub latitude: f64,
    #[serde(rename = "allresults")]
    pub years: Vec<YearResult>,
}

/// One simulated campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearResult {
    pub year: i32,
    pub summary: Summary,
    #[serde(rename = "results")]
    pub series: Vec<StepRecord>,
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    format_version: u32,
    result: &'a SimulationResult,
}

#[derive(Deserialize)]
struct VersionHeader {
    format_version: u32,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    result: SimulationResult,
}

impl SimulationResult {
    /// Encode with the current envelope version.
    pub fn encode(&self) -> Result<Vec<u8>, ArtifactError> {
        Ok(serde_json::to_vec(&EnvelopeOut {
            format_version: FORMAT_VERSION,
            result: self,
        })?)
    }

    /// Decode, rejecting unknown envelope versions.
    pub fn decode(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let header: VersionHeader = serde_json::from_slice(bytes)?;
        if header.format_version != FORMAT_VERSION {
            return Err(ArtifactError::UnsupportedVersion {
                found: header.format_version,
                expected: FORMAT_VERSION,
            });
        }
        let envelope: EnvelopeIn = serde_json::from_slice(bytes)?;
        Ok(envelope.result)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;

    use super::*;
    use crate::sim::SummaryValue;

    fn sample() -> SimulationResult {
        let day = NaiveDate::from_ymd_opt(1990, 5, 1).unwrap();
        let mut summary = Summary::new();
        summary.insert("TWSO".into(), SummaryValue::Number(5000.0));
        summary.insert("DOS".into(), SummaryValue::Date(day));
        let mut values = BTreeMap::new();
        values.insert("DVS".to_string(), 0.1);
        SimulationResult {
            task_id: 7,
            crop_no: 3,
            longitude: 0.25,
            latitude: 10.25,
            years: vec![YearResult {
                year: 1990,
                summary,
                series: vec![StepRecord { day, values }],
            }],
        }
    }

    #[test]
    fn encoded_layout_uses_envelope() {
        let bytes = sample().encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["format_version"], 1);
        assert_eq!(json["result"]["task_id"], 7);
        assert_eq!(json["result"]["allresults"][0]["year"], 1990);
        assert_eq!(json["result"]["allresults"][0]["results"][0]["DVS"], 0.1);
        assert_eq!(SimulationResult::decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn rejects_other_versions() {
        let bytes = br#"{"format_version": 2, "result": {}}"#;
        assert!(matches!(
            SimulationResult::decode(bytes),
            Err(ArtifactError::UnsupportedVersion { found: 2, expected: 1 })
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            SimulationResult::decode(b"not json"),
            Err(ArtifactError::Encoding(_))
        ));
    }
}
