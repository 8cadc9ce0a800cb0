//! Output naming templates.
//!
//! Raster outputs follow the GGCMI-style pattern
//! `{model}_{climate}_{clim_scenario}_{sim_scenario}_{irr}_{variable}_{crop}_{timestep}_{start}_{end}.asc`.
//! Artifact keys are the task id as a fixed-width decimal string.

/// Naming parameters shared by every output of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNaming {
    pub model: String,
    pub climate: String,
    pub clim_scenario: String,
    pub sim_scenario: String,
    pub timestep: String,
    pub start_year: i32,
    pub end_year: i32,
}

impl Default for OutputNaming {
    fn default() -> Self {
        Self {
            model: "gridbatch".to_string(),
            climate: "WFDEI".to_string(),
            clim_scenario: "hist".to_string(),
            sim_scenario: "default".to_string(),
            timestep: "annual".to_string(),
            start_year: 1979,
            end_year: 2012,
        }
    }
}

/// Placeholder replaced by the variable name in a raster file pattern.
pub const VARIABLE_PLACEHOLDER: &str = "*";

impl OutputNaming {
    /// Number of years covered by the output rasters.
    pub fn nyears(&self) -> usize {
        (self.end_year - self.start_year + 1).max(0) as usize
    }

    /// Raster file pattern for a crop; `*` stands in for the variable.
    pub fn raster_pattern(&self, crop_label: &str, mgmt_code: &str) -> String {
        let irrigation = if mgmt_code == "rf" { "noirr" } else { "firr" };
        format!(
            "{model}_{climate}_{clim_scenario}_{sim_scenario}_{irrigation}_{var}_{crop}_{timestep}_{start}_{end}.asc",
            model = self.model,
            climate = self.climate.to_lowercase(),
            clim_scenario = self.clim_scenario,
            sim_scenario = self.sim_scenario,
            var = VARIABLE_PLACEHOLDER,
            crop = crop_label,
            timestep = self.timestep,
            start = self.start_year,
            end = self.end_year,
        )
    }

    /// Concrete raster file name for one variable.
    pub fn raster_file_name(&self, variable: &str, crop_label: &str, mgmt_code: &str) -> String {
        self.raster_pattern(crop_label, mgmt_code)
            .replacen(VARIABLE_PLACEHOLDER, variable, 1)
    }
}

/// Artifact store key for a task id.
pub fn artifact_key(task_id: i64) -> String {
    format!("{task_id:010}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_zero_padded() {
        assert_eq!(artifact_key(42), "0000000042");
        assert_eq!(artifact_key(1_234_567_890), "1234567890");
    }

    #[test]
    fn raster_names_follow_template() {
        let naming = OutputNaming {
            model: "cgms-wofost".into(),
            climate: "WFDEI".into(),
            clim_scenario: "hist".into(),
            sim_scenario: "default".into(),
            timestep: "annual".into(),
            start_year: 1979,
            end_year: 2012,
        };
        assert_eq!(
            naming.raster_file_name("yield", "mai", "rf"),
            "cgms-wofost_wfdei_hist_default_noirr_yield_mai_annual_1979_2012.asc"
        );
        assert_eq!(
            naming.raster_pattern("whe", "ir"),
            "cgms-wofost_wfdei_hist_default_firr_*_whe_annual_1979_2012.asc"
        );
        assert_eq!(naming.nyears(), 34);
    }
}
