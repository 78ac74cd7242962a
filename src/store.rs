use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params,
};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    CanonicalAddress, CanonicalCode, CountryPrefix, NewObservation, Properties, RawObservation,
    RegionCode, SourceKey,
};
use crate::error::ParcelError;
use crate::geometry::{self, STORAGE_SRID};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS raw_observations (
    raw_id      TEXT PRIMARY KEY,
    source      TEXT NOT NULL,
    source_key  TEXT NOT NULL,
    properties  TEXT NOT NULL,
    geometry    TEXT,
    footprint   TEXT,
    srid        INTEGER NOT NULL,
    fetched_at  TEXT NOT NULL,
    UNIQUE (source, source_key)
);
CREATE TABLE IF NOT EXISTS canonical_addresses (
    address_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    raw_id          TEXT NOT NULL UNIQUE REFERENCES raw_observations (raw_id),
    region_code     TEXT NOT NULL,
    sequence        INTEGER NOT NULL,
    canonical_code  TEXT NOT NULL UNIQUE,
    geometry        TEXT,
    created_at      TEXT NOT NULL,
    UNIQUE (region_code, sequence)
);
CREATE TABLE IF NOT EXISTS region_sequences (
    region_code    TEXT PRIMARY KEY,
    last_sequence  INTEGER NOT NULL
);
";

const OBSERVATION_COLUMNS: &str =
    "raw_id, source, source_key, properties, geometry, footprint, srid, fetched_at";

const ADDRESS_COLUMNS: &str =
    "address_id, raw_id, region_code, canonical_code, geometry, created_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
}

impl StoreLocation {
    /// Accepts `sqlite://<path>`, `sqlite:<path>`, `:memory:` or a bare file path.
    pub fn parse(conn: &str) -> Result<Self, ParcelError> {
        let trimmed = conn.trim();
        let rest = trimmed
            .strip_prefix("sqlite://")
            .or_else(|| trimmed.strip_prefix("sqlite:"))
            .unwrap_or(trimmed);
        if rest.is_empty() || (rest.contains("://") && !trimmed.starts_with("sqlite:")) {
            return Err(ParcelError::InvalidConnectionString(conn.to_string()));
        }
        if rest == ":memory:" {
            return Ok(StoreLocation::Memory);
        }
        Ok(StoreLocation::File(PathBuf::from(rest)))
    }
}

/// Result of writing one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Written(Uuid),
    Duplicate,
}

/// Result of claiming a code for one observation.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Created(CanonicalAddress),
    AlreadyCanonical,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionSequence {
    pub region_code: String,
    pub last_sequence: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreCounts {
    pub raw_observations: u64,
    pub canonical_addresses: u64,
    pub regions: Vec<RegionSequence>,
}

#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(conn: &str) -> Result<Self, ParcelError> {
        let location = StoreLocation::parse(conn)?;
        let connection = match &location {
            StoreLocation::Memory => Connection::open_in_memory(),
            StoreLocation::File(path) => Connection::open(path),
        }
        .map_err(|err| ParcelError::StoreOpen(format!("{conn}: {err}")))?;

        connection
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(|err| ParcelError::StoreOpen(err.to_string()))?;
        if matches!(location, StoreLocation::File(_)) {
            connection
                .query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
                .map_err(|err| ParcelError::StoreOpen(err.to_string()))?;
        }
        connection
            .execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|err| ParcelError::StoreOpen(err.to_string()))?;
        connection
            .execute_batch(SCHEMA)
            .map_err(|err| ParcelError::StoreOpen(err.to_string()))?;
        debug!(location = ?location, "store opened");

        Ok(Self {
            conn: Mutex::new(connection),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ParcelError> {
        self.conn
            .lock()
            .map_err(|_| ParcelError::Storage("store connection lock poisoned".to_string()))
    }

    /// Runs `f` inside one write transaction. The transaction takes the write
    /// lock up front, commits when `f` succeeds and rolls back otherwise.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&mut WriteTx<'_>) -> Result<T, ParcelError>,
    ) -> Result<T, ParcelError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut write = WriteTx { tx };
        let value = f(&mut write)?;
        write.tx.commit()?;
        Ok(value)
    }

    pub fn observation(&self, raw_id: Uuid) -> Result<Option<RawObservation>, ParcelError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {OBSERVATION_COLUMNS} FROM raw_observations WHERE raw_id = ?1"),
                [raw_id.to_string()],
                read_observation_row,
            )
            .optional()?;
        row.map(ObservationRow::decode).transpose()
    }

    pub fn observation_by_key(
        &self,
        source: &str,
        source_key: &SourceKey,
    ) -> Result<Option<RawObservation>, ParcelError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {OBSERVATION_COLUMNS} FROM raw_observations \
                     WHERE source = ?1 AND source_key = ?2"
                ),
                params![source, source_key.as_str()],
                read_observation_row,
            )
            .optional()?;
        row.map(ObservationRow::decode).transpose()
    }

    pub fn observations(&self) -> Result<Vec<RawObservation>, ParcelError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM raw_observations ORDER BY fetched_at, rowid"
        ))?;
        let rows = stmt
            .query_map([], read_observation_row)?
            .map(|row| row.map_err(ParcelError::from).and_then(ObservationRow::decode))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn address_by_code(
        &self,
        code: &CanonicalCode,
    ) -> Result<Option<CanonicalAddress>, ParcelError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {ADDRESS_COLUMNS} FROM canonical_addresses WHERE canonical_code = ?1"
                ),
                [code.as_str()],
                read_address_row,
            )
            .optional()?;
        row.map(AddressRow::decode).transpose()
    }

    pub fn addresses(&self) -> Result<Vec<CanonicalAddress>, ParcelError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ADDRESS_COLUMNS} FROM canonical_addresses ORDER BY address_id"
        ))?;
        let rows = stmt
            .query_map([], read_address_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(AddressRow::decode).collect()
    }

    pub fn counts(&self) -> Result<StoreCounts, ParcelError> {
        let conn = self.lock()?;
        let raw_observations: i64 =
            conn.query_row("SELECT COUNT(*) FROM raw_observations", [], |row| row.get(0))?;
        let canonical_addresses: i64 =
            conn.query_row("SELECT COUNT(*) FROM canonical_addresses", [], |row| row.get(0))?;
        let mut stmt = conn.prepare(
            "SELECT region_code, last_sequence FROM region_sequences ORDER BY region_code",
        )?;
        let regions = stmt
            .query_map([], |row| {
                Ok(RegionSequence {
                    region_code: row.get(0)?,
                    last_sequence: row.get::<_, i64>(1)?.max(0) as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StoreCounts {
            raw_observations: raw_observations.max(0) as u64,
            canonical_addresses: canonical_addresses.max(0) as u64,
            regions,
        })
    }
}

/// An open write transaction. Each record-level operation runs inside its own
/// savepoint so a failing record leaves earlier work in the batch intact.
pub struct WriteTx<'conn> {
    tx: Transaction<'conn>,
}

impl WriteTx<'_> {
    /// Inserts an observation unless `(source, source_key)` already exists.
    /// Geometry and footprint are normalized to the storage CRS first.
    pub fn insert_observation(
        &mut self,
        observation: &NewObservation,
        fetched_at: DateTime<Utc>,
    ) -> Result<InsertOutcome, ParcelError> {
        let geometry = observation
            .geometry
            .as_ref()
            .map(|input| input.resolve().map(|shape| geometry::to_wkt(&shape)))
            .transpose()?;
        let footprint = observation
            .footprint
            .as_ref()
            .map(|input| input.resolve().map(|shape| geometry::to_geojson(&shape).to_string()))
            .transpose()?;
        let properties = serde_json::to_string(&observation.properties)
            .map_err(|err| ParcelError::Storage(err.to_string()))?;

        let raw_id = Uuid::new_v4();
        let savepoint = self.tx.savepoint()?;
        let inserted = savepoint.execute(
            "INSERT INTO raw_observations \
             (raw_id, source, source_key, properties, geometry, footprint, srid, fetched_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT (source, source_key) DO NOTHING",
            params![
                raw_id.to_string(),
                observation.source,
                observation.source_key.as_str(),
                properties,
                geometry,
                footprint,
                STORAGE_SRID,
                format_timestamp(fetched_at),
            ],
        )?;
        savepoint.commit()?;

        Ok(if inserted == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Written(raw_id)
        })
    }

    /// Observations without a canonical address, oldest first. Each row
    /// decodes on its own so one unreadable row does not hide the others.
    pub fn pending_observations(
        &self,
    ) -> Result<Vec<Result<RawObservation, ParcelError>>, ParcelError> {
        let mut stmt = self.tx.prepare(
            "SELECT r.raw_id, r.source, r.source_key, r.properties, r.geometry, r.footprint, \
                    r.srid, r.fetched_at \
             FROM raw_observations r \
             LEFT JOIN canonical_addresses c ON c.raw_id = r.raw_id \
             WHERE c.raw_id IS NULL \
             ORDER BY r.fetched_at, r.rowid",
        )?;
        let rows = stmt
            .query_map([], read_observation_row)?
            .map(|row| row.map_err(ParcelError::from).and_then(ObservationRow::decode))
            .collect::<Vec<_>>();
        Ok(rows)
    }

    /// Assigns the next sequence of `region` to `observation`. The region
    /// counter only advances when the address row is actually created.
    pub fn claim_address(
        &mut self,
        observation: &RawObservation,
        region: &RegionCode,
        prefix: &CountryPrefix,
        created_at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, ParcelError> {
        let savepoint = self.tx.savepoint()?;
        let last: i64 = savepoint
            .query_row(
                "SELECT last_sequence FROM region_sequences WHERE region_code = ?1",
                [region.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        let sequence = last + 1;
        let code = CanonicalCode::new(prefix, region, sequence as u64);

        let inserted = savepoint.execute(
            "INSERT INTO canonical_addresses \
             (raw_id, region_code, sequence, canonical_code, geometry, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (raw_id) DO NOTHING",
            params![
                observation.raw_id.to_string(),
                region.as_str(),
                sequence,
                code.as_str(),
                observation.geometry,
                format_timestamp(created_at),
            ],
        )?;
        if inserted == 0 {
            return Ok(ClaimOutcome::AlreadyCanonical);
        }
        let address_id = savepoint.last_insert_rowid();

        savepoint.execute(
            "INSERT INTO region_sequences (region_code, last_sequence) VALUES (?1, ?2) \
             ON CONFLICT (region_code) DO UPDATE SET last_sequence = excluded.last_sequence",
            params![region.as_str(), sequence],
        )?;
        savepoint.commit()?;

        Ok(ClaimOutcome::Created(CanonicalAddress {
            address_id,
            raw_id: observation.raw_id,
            region_code: region.clone(),
            canonical_code: code,
            geometry: observation.geometry.clone(),
            created_at,
        }))
    }
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ParcelError> {
    DateTime::parse_from_rfc3339(value)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| ParcelError::Storage(format!("invalid timestamp {value}: {err}")))
}

fn parse_uuid(value: &str) -> Result<Uuid, ParcelError> {
    Uuid::parse_str(value)
        .map_err(|err| ParcelError::Storage(format!("invalid raw_id {value}: {err}")))
}

struct ObservationRow {
    raw_id: String,
    source: String,
    source_key: String,
    properties: String,
    geometry: Option<String>,
    footprint: Option<String>,
    srid: i64,
    fetched_at: String,
}

fn read_observation_row(row: &Row<'_>) -> rusqlite::Result<ObservationRow> {
    Ok(ObservationRow {
        raw_id: row.get(0)?,
        source: row.get(1)?,
        source_key: row.get(2)?,
        properties: row.get(3)?,
        geometry: row.get(4)?,
        footprint: row.get(5)?,
        srid: row.get(6)?,
        fetched_at: row.get(7)?,
    })
}

impl ObservationRow {
    fn decode(self) -> Result<RawObservation, ParcelError> {
        let properties: Properties = serde_json::from_str(&self.properties)
            .map_err(|err| ParcelError::Storage(format!("invalid properties: {err}")))?;
        let footprint = self
            .footprint
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(|err| ParcelError::Storage(format!("invalid footprint: {err}")))?;
        Ok(RawObservation {
            raw_id: parse_uuid(&self.raw_id)?,
            source: self.source,
            source_key: SourceKey::new(self.source_key),
            properties,
            geometry: self.geometry,
            footprint,
            srid: u32::try_from(self.srid)
                .map_err(|_| ParcelError::Storage(format!("invalid srid {}", self.srid)))?,
            fetched_at: parse_timestamp(&self.fetched_at)?,
        })
    }
}

struct AddressRow {
    address_id: i64,
    raw_id: String,
    region_code: String,
    canonical_code: String,
    geometry: Option<String>,
    created_at: String,
}

fn read_address_row(row: &Row<'_>) -> rusqlite::Result<AddressRow> {
    Ok(AddressRow {
        address_id: row.get(0)?,
        raw_id: row.get(1)?,
        region_code: row.get(2)?,
        canonical_code: row.get(3)?,
        geometry: row.get(4)?,
        created_at: row.get(5)?,
    })
}

impl AddressRow {
    fn decode(self) -> Result<CanonicalAddress, ParcelError> {
        Ok(CanonicalAddress {
            address_id: self.address_id,
            raw_id: parse_uuid(&self.raw_id)?,
            region_code: self.region_code.parse()?,
            canonical_code: self.canonical_code.parse()?,
            geometry: self.geometry,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}
