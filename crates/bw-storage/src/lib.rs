use bw_core::{ReadingStatus, SensorReading};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

pub const BEDWATCH_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// A tracked bed. `room` is None while the bed is unassigned; only the
/// engine's commit step ever mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bed {
    pub id: i64,
    pub mac_address: String,
    pub name: String,
    pub beacon_mac: Option<String>,
    pub room: Option<String>,
}

/// Static mapping from a reporting device to the room a sighting from it
/// implies. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistration {
    pub id: i64,
    pub esp_id: String,
    pub room: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorEventRecord {
    pub id: i64,
    pub esp_id: String,
    pub bed_name: String,
    pub status: String,
    pub rssi: i32,
    pub link_quality: i32,
    pub origin_ts: DateTime<Utc>,
}

pub struct BedStore {
    conn: Connection,
}

impl BedStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > BEDWATCH_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: BEDWATCH_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_bedwatch_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn insert_bed(
        &self,
        mac_address: &str,
        name: &str,
        beacon_mac: Option<&str>,
    ) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO beds (mac_address, name, beacon_mac) VALUES (?1, ?2, ?3)",
            params![mac_address, name, beacon_mac],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn bed_by_name(&self, name: &str) -> Result<Option<Bed>, StorageError> {
        let bed = self
            .conn
            .query_row(
                "SELECT id, mac_address, name, beacon_mac, room FROM beds WHERE name = ?1",
                [name],
                map_bed_row,
            )
            .optional()?;
        Ok(bed)
    }

    pub fn bed_by_mac(&self, mac_address: &str) -> Result<Option<Bed>, StorageError> {
        let bed = self
            .conn
            .query_row(
                "SELECT id, mac_address, name, beacon_mac, room FROM beds WHERE mac_address = ?1",
                [mac_address],
                map_bed_row,
            )
            .optional()?;
        Ok(bed)
    }

    pub fn list_beds(&self) -> Result<Vec<Bed>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, mac_address, name, beacon_mac, room FROM beds ORDER BY name")?;
        let rows = stmt.query_map([], map_bed_row)?;
        let mut beds = Vec::new();
        for row in rows {
            beds.push(row?);
        }
        Ok(beds)
    }

    /// The single mutation the engine performs. Returns false when no bed
    /// carries that name, so a vanished bed surfaces at the call site.
    pub fn set_room(&self, bed_name: &str, room: Option<&str>) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "UPDATE beds SET room = ?1 WHERE name = ?2",
            params![room, bed_name],
        )?;
        Ok(changed > 0)
    }

    pub fn insert_registration(&self, esp_id: &str, room: &str) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO device_registrations (esp_id, room) VALUES (?1, ?2)",
            params![esp_id, room],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn registration_by_esp(
        &self,
        esp_id: &str,
    ) -> Result<Option<DeviceRegistration>, StorageError> {
        let registration = self
            .conn
            .query_row(
                "SELECT id, esp_id, room FROM device_registrations WHERE esp_id = ?1",
                [esp_id],
                |row| {
                    Ok(DeviceRegistration {
                        id: row.get(0)?,
                        esp_id: row.get(1)?,
                        room: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(registration)
    }

    pub fn list_registrations(&self) -> Result<Vec<DeviceRegistration>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, esp_id, room FROM device_registrations ORDER BY esp_id")?;
        let rows = stmt.query_map([], |row| {
            Ok(DeviceRegistration {
                id: row.get(0)?,
                esp_id: row.get(1)?,
                room: row.get(2)?,
            })
        })?;
        let mut registrations = Vec::new();
        for row in rows {
            registrations.push(row?);
        }
        Ok(registrations)
    }

    pub fn record_event(&self, reading: &SensorReading, raw: &str) -> Result<i64, StorageError> {
        let status = match reading.status {
            ReadingStatus::Sighting => "GET",
            ReadingStatus::Departed => "OUT",
        };
        let origin_ts = reading.origin_ts.unwrap_or_else(Utc::now);
        self.conn.execute(
            "
            INSERT INTO sensor_events (
                esp_id,
                bed_name,
                status,
                rssi,
                link_quality,
                origin_ts,
                raw_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                reading.esp_id,
                reading.bed_name,
                status,
                reading.rssi,
                reading.link_quality,
                origin_ts.to_rfc3339(),
                raw,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let deleted = self.conn.execute(
            "DELETE FROM sensor_events WHERE origin_ts < ?1",
            [cutoff.to_rfc3339()],
        )?;
        Ok(deleted)
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<SensorEventRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, esp_id, bed_name, status, rssi, link_quality, origin_ts
            FROM sensor_events
            ORDER BY origin_ts DESC
            LIMIT ?1
            ",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let origin_ts: String = row.get(6)?;
            let origin_ts = DateTime::parse_from_rfc3339(&origin_ts)
                .map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        6,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?
                .with_timezone(&Utc);
            Ok(SensorEventRecord {
                id: row.get(0)?,
                esp_id: row.get(1)?,
                bed_name: row.get(2)?,
                status: row.get(3)?,
                rssi: row.get(4)?,
                link_quality: row.get(5)?,
                origin_ts,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

fn map_bed_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bed> {
    Ok(Bed {
        id: row.get(0)?,
        mac_address: row.get(1)?,
        name: row.get(2)?,
        beacon_mac: row.get(3)?,
        room: row.get(4)?,
    })
}
