//! Crop metadata, per-cell aggregates and the crop calendar table.

use std::sync::Arc;

use libsql::params;
use tracing::debug;

use crate::error::DatabaseError;
use crate::sim::CropSeason;
use crate::store::db::{Db, opt_real, real, real_or_null, retry_busy, snap};
use crate::store::model::{CropInfo, ResumptionPoint, TsumRecord};

/// Half-width of the coordinate window used for cell lookups.
const CELL_EPS: f64 = 1e-6;

/// Read/write access to the crop tables.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<Db>,
}

impl Catalog {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Crop name, label and management code.
    pub async fn crop_info(&self, crop_no: i64) -> Result<CropInfo, DatabaseError> {
        let conn = self.db.conn();
        let found = retry_busy("crop_info", || async move {
            let mut rows = conn
                .query(
                    "SELECT c.crop_no, c.crop_name, i.label, c.mgmt_code
                     FROM crop c JOIN cropinfo i ON i.crop_no = c.crop_no
                     WHERE c.crop_no = ?1",
                    params![crop_no],
                )
                .await?;
            match rows.next().await? {
                Some(row) => Ok(Some(CropInfo {
                    crop_no: row.get(0)?,
                    crop_name: row.get(1)?,
                    label: row.get(2)?,
                    mgmt_code: row.get(3)?,
                })),
                None => Ok(None),
            }
        })
        .await?;
        found.ok_or_else(|| DatabaseError::NotFound {
            entity: "crop".into(),
            id: crop_no.to_string(),
        })
    }

    /// Insert or replace a crop in both crop tables.
    pub async fn put_crop(&self, info: &CropInfo) -> Result<(), DatabaseError> {
        let tx = self
            .db
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("put_crop begin: {e}")))?;
        tx.execute(
            "INSERT OR REPLACE INTO crop (crop_no, crop_name, mgmt_code) VALUES (?1, ?2, ?3)",
            params![info.crop_no, info.crop_name.clone(), info.mgmt_code.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("put_crop: {e}")))?;
        tx.execute(
            "INSERT OR REPLACE INTO cropinfo (crop_no, label) VALUES (?1, ?2)",
            params![info.crop_no, info.label.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("put_cropinfo: {e}")))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("put_crop commit: {e}")))
    }

    /// Where a grid scan for the crop should resume, `None` if nothing was
    /// persisted yet.
    pub async fn resumption_point(&self, crop_no: i64) -> Result<Option<ResumptionPoint>, DatabaseError> {
        let conn = self.db.conn();
        let min_lat = retry_busy("resumption_min_lat", || async move {
            let mut rows = conn
                .query(
                    "SELECT MIN(latitude) FROM tsum WHERE crop_no = ?1",
                    params![crop_no],
                )
                .await?;
            match rows.next().await? {
                Some(row) => opt_real(&row, 0),
                None => Ok(None),
            }
        })
        .await?;
        let Some(min_lat) = min_lat else {
            return Ok(None);
        };

        let max_lon = retry_busy("resumption_max_lon", || async move {
            let mut rows = conn
                .query(
                    "SELECT MAX(longitude) FROM tsum
                     WHERE crop_no = ?1 AND latitude BETWEEN ?2 AND ?3",
                    params![
                        crop_no,
                        min_lat - ResumptionPoint::EPS,
                        min_lat + ResumptionPoint::EPS
                    ],
                )
                .await?;
            match rows.next().await? {
                Some(row) => opt_real(&row, 0),
                None => Ok(None),
            }
        })
        .await?;

        let point = max_lon.map(|max_lon| ResumptionPoint { min_lat, max_lon });
        debug!(crop_no, ?point, "Resumption point");
        Ok(point)
    }

    /// Insert or overwrite the aggregate of a cell.
    pub async fn upsert_tsum(&self, record: &TsumRecord) -> Result<(), DatabaseError> {
        let conn = self.db.conn();
        retry_busy("upsert_tsum", || {
            conn.execute(
                "INSERT INTO tsum
                   (crop_no, latitude, longitude, average, stdev, minimum, maximum, numobs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (crop_no, latitude, longitude) DO UPDATE SET
                   average = excluded.average, stdev = excluded.stdev,
                   minimum = excluded.minimum, maximum = excluded.maximum,
                   numobs = excluded.numobs",
                params![
                    record.crop_no,
                    snap(record.latitude),
                    snap(record.longitude),
                    real_or_null(record.average),
                    real_or_null(record.stdev),
                    real_or_null(record.minimum),
                    real_or_null(record.maximum),
                    record.numobs
                ],
            )
        })
        .await?;
        Ok(())
    }

    /// Aggregate stored for a cell.
    pub async fn tsum(&self, crop_no: i64, longitude: f64, latitude: f64) -> Result<Option<TsumRecord>, DatabaseError> {
        let conn = self.db.conn();
        retry_busy("tsum", || async move {
            let mut rows = conn
                .query(
                    "SELECT crop_no, latitude, longitude, average, stdev, minimum, maximum, numobs
                     FROM tsum
                     WHERE crop_no = ?1 AND latitude BETWEEN ?2 AND ?3 AND longitude BETWEEN ?4 AND ?5",
                    params![
                        crop_no,
                        latitude - CELL_EPS,
                        latitude + CELL_EPS,
                        longitude - CELL_EPS,
                        longitude + CELL_EPS
                    ],
                )
                .await?;
            match rows.next().await? {
                Some(row) => Ok(Some(TsumRecord {
                    crop_no: row.get(0)?,
                    latitude: real(&row, 1)?,
                    longitude: real(&row, 2)?,
                    average: opt_real(&row, 3)?,
                    stdev: opt_real(&row, 4)?,
                    minimum: opt_real(&row, 5)?,
                    maximum: opt_real(&row, 6)?,
                    numobs: row.get(7)?,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    /// Number of aggregates stored for a crop.
    pub async fn tsum_count(&self, crop_no: i64) -> Result<i64, DatabaseError> {
        let conn = self.db.conn();
        retry_busy("tsum_count", || async move {
            let mut rows = conn
                .query("SELECT COUNT(*) FROM tsum WHERE crop_no = ?1", params![crop_no])
                .await?;
            match rows.next().await? {
                Some(row) => row.get::<i64>(0),
                None => Ok(0),
            }
        })
        .await
    }

    /// Set the growing season of a crop at a cell. A row marks the cell as land.
    pub async fn put_season(
        &self,
        crop_no: i64,
        longitude: f64,
        latitude: f64,
        season: CropSeason,
    ) -> Result<(), DatabaseError> {
        let conn = self.db.conn();
        retry_busy("put_season", || {
            conn.execute(
                "INSERT OR REPLACE INTO crop_calendar (crop_no, longitude, latitude, start_doy, end_doy)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    crop_no,
                    snap(longitude),
                    snap(latitude),
                    season.start_doy as i64,
                    season.end_doy as i64
                ],
            )
        })
        .await?;
        Ok(())
    }

    /// Growing season at a cell, `None` off the land mask.
    pub async fn season(&self, crop_no: i64, longitude: f64, latitude: f64) -> Result<Option<CropSeason>, DatabaseError> {
        let conn = self.db.conn();
        retry_busy("season", || async move {
            let mut rows = conn
                .query(
                    "SELECT start_doy, end_doy FROM crop_calendar
                     WHERE crop_no = ?1 AND longitude BETWEEN ?2 AND ?3 AND latitude BETWEEN ?4 AND ?5",
                    params![
                        crop_no,
                        longitude - CELL_EPS,
                        longitude + CELL_EPS,
                        latitude - CELL_EPS,
                        latitude + CELL_EPS
                    ],
                )
                .await?;
            match rows.next().await? {
                Some(row) => Ok(Some(CropSeason {
                    start_doy: row.get::<i64>(0)? as i32,
                    end_doy: row.get::<i64>(1)? as i32,
                })),
                None => Ok(None),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn catalog() -> Catalog {
        Catalog::new(Arc::new(Db::open_memory().await.unwrap()))
    }

    fn maize() -> CropInfo {
        CropInfo {
            crop_no: 3,
            crop_name: "maize".into(),
            label: "mai".into(),
            mgmt_code: "rf".into(),
        }
    }

    #[tokio::test]
    async fn crop_info_joins_tables() {
        let cat = catalog().await;
        cat.put_crop(&maize()).await.unwrap();
        assert_eq!(cat.crop_info(3).await.unwrap(), maize());
        assert!(matches!(
            cat.crop_info(4).await.unwrap_err(),
            DatabaseError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn no_results_means_no_resumption_point() {
        let cat = catalog().await;
        assert_eq!(cat.resumption_point(3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn resumption_point_is_southernmost_row() {
        let cat = catalog().await;
        for (lon, lat) in [(1.0, 12.0), (9.0, 12.0), (3.0, 10.0), (5.0, 10.0), (7.0, 11.0)] {
            cat.upsert_tsum(&TsumRecord::from_observations(3, lon, lat, &[1.0]))
                .await
                .unwrap();
        }
        // another crop must not interfere
        cat.upsert_tsum(&TsumRecord::from_observations(4, 50.0, -40.0, &[1.0]))
            .await
            .unwrap();

        assert_eq!(
            cat.resumption_point(3).await.unwrap(),
            Some(ResumptionPoint {
                min_lat: 10.0,
                max_lon: 5.0
            })
        );
    }

    #[tokio::test]
    async fn upsert_overwrites_duplicates() {
        let cat = catalog().await;
        cat.upsert_tsum(&TsumRecord::from_observations(3, 0.25, 0.25, &[1.0]))
            .await
            .unwrap();
        cat.upsert_tsum(&TsumRecord::from_observations(3, 0.25, 0.25, &[2.0, 4.0]))
            .await
            .unwrap();
        assert_eq!(cat.tsum_count(3).await.unwrap(), 1);
        let stored = cat.tsum(3, 0.25, 0.25).await.unwrap().unwrap();
        assert_eq!(stored.average, Some(3.0));
        assert_eq!(stored.numobs, 2);
    }

    #[tokio::test]
    async fn seasons_and_land_mask() {
        let cat = catalog().await;
        let season = CropSeason {
            start_doy: 100,
            end_doy: 250,
        };
        cat.put_season(3, 0.25, 0.25, season).await.unwrap();
        assert_eq!(cat.season(3, 0.25, 0.25).await.unwrap(), Some(season));
        assert_eq!(cat.season(3, 0.75, 0.25).await.unwrap(), None);
        assert_eq!(cat.season(4, 0.25, 0.25).await.unwrap(), None);
    }
}
