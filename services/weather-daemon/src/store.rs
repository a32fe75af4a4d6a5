//! Airport/METAR persistence using SQLite with sqlx.
//!
//! One table holds the station catalogue and the freshest report per
//! airport. The worker and the UDP dispatcher share the pool; report
//! updates are monotone in observation timestamp so replays and overlapping
//! downloads can never regress a row.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use metar_parse::Station;
use wx_common::{WxError, WxResult};

/// One airport row.
#[derive(Debug, Clone, PartialEq)]
pub struct AirportRow {
    pub icao: String,
    pub lat: f64,
    pub lon: f64,
    pub elevation_m: f64,
    /// Decimal `YYYYMMDDHHMM`; 0 means no report yet.
    pub timestamp: i64,
    pub metar: Option<String>,
}

type AirportTuple = (String, f64, f64, f64, i64, Option<String>);

impl From<AirportTuple> for AirportRow {
    fn from(row: AirportTuple) -> Self {
        AirportRow {
            icao: row.0,
            lat: row.1,
            lon: row.2,
            elevation_m: row.3,
            timestamp: row.4,
            metar: row.5,
        }
    }
}

const SELECT_COLUMNS: &str = "icao, lat, lon, elevation, timestamp, metar";

/// Shared handle to the metar database.
#[derive(Clone)]
pub struct MetarStore {
    pool: SqlitePool,
}

impl MetarStore {
    /// Open or create the database at the given path.
    pub async fn open(path: &Path) -> WxResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| WxError::Database(e.to_string()))?;

        Self::create_schema(&pool).await?;

        info!(path = %path.display(), "Opened metar database");
        Ok(Self { pool })
    }

    /// In-memory database for tests.
    pub async fn open_memory() -> WxResult<Self> {
        let options = SqliteConnectOptions::new().filename(":memory:").create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| WxError::Database(e.to_string()))?;

        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_schema(pool: &SqlitePool) -> WxResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS airports (
                icao TEXT PRIMARY KEY,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                elevation REAL NOT NULL DEFAULT 0,
                timestamp INTEGER NOT NULL DEFAULT 0,
                metar TEXT
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| WxError::Database(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_airports_timestamp ON airports(timestamp)")
            .execute(pool)
            .await
            .map_err(|e| WxError::Database(e.to_string()))?;

        Ok(())
    }

    /// Upsert station rows, keeping any stored report and its timestamp.
    pub async fn upsert_stations(&self, stations: &[Station]) -> WxResult<u64> {
        let mut tx = self.pool.begin().await.map_err(|e| WxError::Database(e.to_string()))?;
        let mut count = 0u64;

        for station in stations {
            sqlx::query(
                r#"
                INSERT INTO airports (icao, lat, lon, elevation, timestamp, metar)
                VALUES (?, ?, ?, ?, 0, NULL)
                ON CONFLICT(icao) DO UPDATE SET
                    lat = excluded.lat,
                    lon = excluded.lon,
                    elevation = excluded.elevation
                "#,
            )
            .bind(&station.icao)
            .bind(station.lat)
            .bind(station.lon)
            .bind(station.elevation_m)
            .execute(&mut *tx)
            .await
            .map_err(|e| WxError::Database(e.to_string()))?;
            count += 1;
        }

        tx.commit().await.map_err(|e| WxError::Database(e.to_string()))?;
        debug!(count = count, "Upserted stations");
        Ok(count)
    }

    /// Store a report for a known station, only when strictly fresher than
    /// what is already there. Returns whether the row changed.
    pub async fn apply_report(&self, icao: &str, timestamp: i64, metar: &str) -> WxResult<bool> {
        let result =
            sqlx::query("UPDATE airports SET timestamp = ?, metar = ? WHERE icao = ? AND timestamp < ?")
                .bind(timestamp)
                .bind(metar)
                .bind(icao)
                .bind(timestamp)
                .execute(&self.pool)
                .await
                .map_err(|e| WxError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Closest station currently carrying a report, with an optional
    /// ignore list. Distance ordering uses a `cos²(lat)` longitude fudge.
    pub async fn nearest_station(
        &self,
        lat: f64,
        lon: f64,
        ignore: &[String],
    ) -> WxResult<Option<AirportRow>> {
        let fudge = lat.to_radians().cos().powi(2);

        let mut sql = format!(
            "SELECT {} FROM airports WHERE metar IS NOT NULL",
            SELECT_COLUMNS
        );
        if !ignore.is_empty() {
            let placeholders = vec!["?"; ignore.len()].join(", ");
            sql.push_str(&format!(" AND icao NOT IN ({})", placeholders));
        }
        sql.push_str(" ORDER BY ((? - lat) * (? - lat) + (? - lon) * (? - lon) * ?) LIMIT 1");

        let mut query = sqlx::query_as::<_, AirportTuple>(&sql);
        for icao in ignore {
            query = query.bind(icao);
        }
        query = query.bind(lat).bind(lat).bind(lon).bind(lon).bind(fudge);

        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WxError::Database(e.to_string()))?;

        Ok(row.map(AirportRow::from))
    }

    /// Look one station up by ICAO, reports only.
    pub async fn by_icao(&self, icao: &str) -> WxResult<Option<AirportRow>> {
        let sql = format!(
            "SELECT {} FROM airports WHERE icao = ? AND metar IS NOT NULL LIMIT 1",
            SELECT_COLUMNS
        );
        let row = sqlx::query_as::<_, AirportTuple>(&sql)
            .bind(icao)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WxError::Database(e.to_string()))?;

        Ok(row.map(AirportRow::from))
    }

    /// Drop every stored report, keeping the station catalogue.
    pub async fn reset_reports(&self) -> WxResult<u64> {
        let result = sqlx::query("UPDATE airports SET timestamp = 0, metar = NULL")
            .execute(&self.pool)
            .await
            .map_err(|e| WxError::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }

    /// All `(icao, metar)` pairs with a report, for the METAR.rwx dump.
    pub async fn all_reports(&self) -> WxResult<Vec<(String, String)>> {
        sqlx::query_as::<_, (String, String)>(
            "SELECT icao, metar FROM airports WHERE metar IS NOT NULL ORDER BY icao",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| WxError::Database(e.to_string()))
    }

    /// Number of catalogued stations.
    pub async fn station_count(&self) -> WxResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM airports")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| WxError::Database(e.to_string()))?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(icao: &str, lat: f64, lon: f64) -> Station {
        Station { icao: icao.into(), lat, lon, elevation_m: 10.0 }
    }

    async fn seeded_store() -> MetarStore {
        let store = MetarStore::open_memory().await.unwrap();
        store
            .upsert_stations(&[
                station("LEBL", 41.297, 2.078),
                station("LEGE", 41.901, 2.760),
                station("EGLL", 51.470, -0.461),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn report_updates_are_monotone() {
        let store = seeded_store().await;

        assert!(store.apply_report("LEBL", 202401121651, "121651Z 23010KT CAVOK").await.unwrap());

        // An older observation never overwrites
        assert!(!store.apply_report("LEBL", 202401121551, "121551Z old").await.unwrap());
        let row = store.by_icao("LEBL").await.unwrap().unwrap();
        assert_eq!(row.timestamp, 202401121651);

        // Equal timestamps do not overwrite either
        assert!(!store.apply_report("LEBL", 202401121651, "dup").await.unwrap());

        // Strictly newer wins
        assert!(store.apply_report("LEBL", 202401121751, "121751Z newer").await.unwrap());
        let row = store.by_icao("LEBL").await.unwrap().unwrap();
        assert_eq!(row.timestamp, 202401121751);
        assert_eq!(row.metar.as_deref(), Some("121751Z newer"));
    }

    #[tokio::test]
    async fn unknown_station_reports_are_dropped() {
        let store = seeded_store().await;
        assert!(!store.apply_report("XXXX", 202401121651, "121651Z").await.unwrap());
    }

    #[tokio::test]
    async fn nearest_requires_a_report() {
        let store = seeded_store().await;

        // No reports stored yet
        assert!(store.nearest_station(41.38, 2.18, &[]).await.unwrap().is_none());

        store.apply_report("EGLL", 202401121650, "121650Z 23015KT 9999").await.unwrap();
        let row = store.nearest_station(41.38, 2.18, &[]).await.unwrap().unwrap();
        // Heathrow is the only candidate even though Barcelona is closer
        assert_eq!(row.icao, "EGLL");
    }

    #[tokio::test]
    async fn nearest_picks_closest_and_honors_ignore_list() {
        let store = seeded_store().await;
        for icao in ["LEBL", "LEGE", "EGLL"] {
            store.apply_report(icao, 202401121650, "121650Z 00000KT CAVOK").await.unwrap();
        }

        let row = store.nearest_station(41.38, 2.18, &[]).await.unwrap().unwrap();
        assert_eq!(row.icao, "LEBL");

        let ignore = vec!["LEBL".to_string()];
        let row = store.nearest_station(41.38, 2.18, &ignore).await.unwrap().unwrap();
        assert_eq!(row.icao, "LEGE");
    }

    #[tokio::test]
    async fn station_upsert_preserves_reports() {
        let store = seeded_store().await;
        store.apply_report("LEBL", 202401121651, "121651Z report").await.unwrap();

        // A station refresh must not clobber the stored report
        store.upsert_stations(&[station("LEBL", 41.298, 2.079)]).await.unwrap();
        let row = store.by_icao("LEBL").await.unwrap().unwrap();
        assert_eq!(row.timestamp, 202401121651);
        assert_eq!(row.metar.as_deref(), Some("121651Z report"));
        assert!((row.lat - 41.298).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reset_clears_reports_keeps_stations() {
        let store = seeded_store().await;
        store.apply_report("LEBL", 202401121651, "121651Z report").await.unwrap();

        store.reset_reports().await.unwrap();
        assert_eq!(store.station_count().await.unwrap(), 3);
        assert!(store.by_icao("LEBL").await.unwrap().is_none());
        assert!(store.all_reports().await.unwrap().is_empty());

        // And a redownload of the same observation lands again
        assert!(store.apply_report("LEBL", 202401121651, "121651Z report").await.unwrap());
    }

    #[tokio::test]
    async fn all_reports_lists_only_reporting_stations() {
        let store = seeded_store().await;
        store.apply_report("LEBL", 202401121651, "121651Z a").await.unwrap();
        store.apply_report("EGLL", 202401121650, "121650Z b").await.unwrap();

        let reports = store.all_reports().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].0, "EGLL");
        assert_eq!(reports[1].0, "LEBL");
    }
}
