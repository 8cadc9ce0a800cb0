//! Crop calendar backed by the `crop_calendar` table.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::sim::{CropCalendar, CropSeason};
use crate::store::catalog::Catalog;

/// [`CropCalendar`] reading seasons from the task database.
#[derive(Clone)]
pub struct SqlCropCalendar {
    catalog: Catalog,
}

impl SqlCropCalendar {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl CropCalendar for SqlCropCalendar {
    async fn season(
        &self,
        crop_no: i64,
        longitude: f64,
        latitude: f64,
    ) -> Result<Option<CropSeason>, DatabaseError> {
        self.catalog.season(crop_no, longitude, latitude).await
    }
}
