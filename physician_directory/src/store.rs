use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::{
    common::now_unix_seconds,
    models::{Coordinates, GeocodeEntry, PhysicianKey, PhysicianRecord},
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS physicians (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        specialty TEXT,
        address TEXT NOT NULL,
        phone TEXT,
        status TEXT,
        registration_number TEXT,
        postal_prefix TEXT,
        enrichment TEXT,
        enrichment_status TEXT,
        enrichment_checked_at_unix INTEGER,
        created_at_unix INTEGER NOT NULL,
        updated_at_unix INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_physicians_registration
        ON physicians(registration_number) WHERE registration_number IS NOT NULL;
    CREATE UNIQUE INDEX IF NOT EXISTS idx_physicians_name_address
        ON physicians(name, address) WHERE registration_number IS NULL;
    CREATE INDEX IF NOT EXISTS idx_physicians_address ON physicians(address);
    CREATE INDEX IF NOT EXISTS idx_physicians_postal_prefix ON physicians(postal_prefix);
    CREATE INDEX IF NOT EXISTS idx_physicians_enrichment_status ON physicians(enrichment_status);

    CREATE TABLE IF NOT EXISTS geocoded_addresses (
        address TEXT PRIMARY KEY,
        lat REAL NOT NULL,
        lng REAL NOT NULL,
        source TEXT NOT NULL,
        geocoded_at_unix INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS area_searches (
        prefix TEXT NOT NULL,
        filters_key TEXT NOT NULL,
        complete INTEGER NOT NULL,
        searched_at_unix INTEGER NOT NULL,
        PRIMARY KEY (prefix, filters_key)
    );
    CREATE TABLE IF NOT EXISTS area_search_members (
        filters_key TEXT NOT NULL,
        physician_id INTEGER NOT NULL REFERENCES physicians(id),
        PRIMARY KEY (filters_key, physician_id)
    );
";

const PHYSICIAN_COLUMNS: &str = "p.id, p.name, p.specialty, p.address, p.phone, p.status, \
     p.registration_number, p.postal_prefix, p.enrichment, p.created_at_unix, p.updated_at_unix";

/// Keeps `IN (...)` lists well below SQLite's bound-parameter limit.
const LOOKUP_CHUNK: usize = 500;

/// Terminal outcome of the last enrichment attempt for a physician.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Ok,
    NotFound,
    NoMatch,
    Error,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Ok => "ok",
            EnrichmentStatus::NotFound => "not_found",
            EnrichmentStatus::NoMatch => "no_match",
            EnrichmentStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// A stored physician joined with the cached geocode of its address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredPhysician {
    #[serde(flatten)]
    pub record: PhysicianRecord,
    pub coordinates: Option<Coordinates>,
    pub geocode_source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub physicians: u64,
    pub with_registration_number: u64,
    pub geocoded_addresses: u64,
    pub enriched: u64,
    pub enrichment_pending: u64,
    pub enrichment_not_found: u64,
    pub enrichment_no_match: u64,
    pub enrichment_errors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentState {
    pub registration_number: String,
    pub enrichment: Option<String>,
    pub status: Option<String>,
    pub checked_at_unix: Option<i64>,
}

/// Durable physician and geocode tables behind one SQLite connection.
///
/// Every method runs to completion under the connection lock, so
/// transactions are serialized and never interleave.
pub struct DirectoryStore {
    conn: Mutex<Connection>,
}

impl DirectoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating store dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening store DB {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("Failed enabling WAL mode")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed opening in-memory store")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed initializing directory schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn close(self) -> Result<()> {
        let conn = match self.conn.into_inner() {
            Ok(conn) => conn,
            Err(poisoned) => poisoned.into_inner(),
        };
        conn.close()
            .map_err(|(_, err)| err)
            .context("Failed closing store DB")
    }

    /// Reconciles a batch of records in one transaction.
    ///
    /// Existing rows are loaded in bulk, each incoming record is classified
    /// as new, changed or unchanged, and only the first two are written.
    /// Enrichment is only ever overwritten by a non-empty value. A record
    /// carrying a registration number that matches a stored row without one
    /// (same name and address) fills the number into that row.
    pub fn upsert_batch(&self, records: &[PhysicianRecord]) -> Result<UpsertSummary> {
        let started = Instant::now();
        let incoming = collapse_batch(records);
        let mut conn = self.conn();
        let existing = load_existing(&conn, &incoming)?;

        let mut summary = UpsertSummary::default();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut adopted = HashSet::new();
        for record in &incoming {
            let key = record.key();
            if let Some((id, current)) = existing.get(&key) {
                if differs(current, record) {
                    updates.push((*id, record));
                } else {
                    summary.unchanged += 1;
                }
                continue;
            }
            let unnumbered = PhysicianKey::NameAddress(record.name.clone(), record.address.clone());
            match existing.get(&unnumbered) {
                Some((id, _))
                    if matches!(key, PhysicianKey::Registration(_)) && adopted.insert(*id) =>
                {
                    updates.push((*id, record))
                }
                _ => inserts.push(record),
            }
        }

        let now = now_unix_seconds();
        let tx = conn
            .transaction()
            .context("Failed starting upsert transaction")?;
        {
            let mut insert = tx
                .prepare(
                    "
                    INSERT INTO physicians (
                        name, specialty, address, phone, status, registration_number,
                        postal_prefix, enrichment, enrichment_status, enrichment_checked_at_unix,
                        created_at_unix, updated_at_unix
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULLIF(?8, ''),
                            CASE WHEN NULLIF(?8, '') IS NULL THEN NULL ELSE 'ok' END,
                            CASE WHEN NULLIF(?8, '') IS NULL THEN NULL ELSE ?9 END,
                            ?9, ?9)
                    ",
                )
                .context("Failed preparing physician insert")?;
            for record in &inserts {
                insert
                    .execute(params![
                        record.name,
                        record.specialty,
                        record.address,
                        record.phone,
                        record.status,
                        record.registration_number,
                        record.postal_prefix,
                        record.enrichment,
                        now,
                    ])
                    .with_context(|| format!("Failed inserting physician {}", record.name))?;
            }

            let mut update = tx
                .prepare(
                    "
                    UPDATE physicians SET
                        name = ?2,
                        specialty = ?3,
                        address = ?4,
                        phone = ?5,
                        status = ?6,
                        postal_prefix = ?7,
                        enrichment = COALESCE(NULLIF(?8, ''), enrichment),
                        enrichment_status = CASE
                            WHEN NULLIF(?8, '') IS NULL THEN enrichment_status ELSE 'ok' END,
                        updated_at_unix = ?9,
                        registration_number = COALESCE(?10, registration_number)
                    WHERE id = ?1
                    ",
                )
                .context("Failed preparing physician update")?;
            for (id, record) in &updates {
                update
                    .execute(params![
                        id,
                        record.name,
                        record.specialty,
                        record.address,
                        record.phone,
                        record.status,
                        record.postal_prefix,
                        record.enrichment,
                        now,
                        record.registration_number,
                    ])
                    .with_context(|| format!("Failed updating physician {}", record.name))?;
            }
        }
        tx.commit().context("Failed committing upsert batch")?;

        summary.inserted = inserts.len();
        summary.updated = updates.len();
        summary.elapsed = started.elapsed();
        tracing::debug!(
            "upsert batch: {} inserted, {} updated, {} unchanged in {}ms",
            summary.inserted,
            summary.updated,
            summary.unchanged,
            summary.elapsed.as_millis()
        );
        Ok(summary)
    }

    pub fn get_geocode(&self, address: &str) -> Result<Option<GeocodeEntry>> {
        self.conn()
            .query_row(
                "SELECT address, lat, lng, source, geocoded_at_unix
                 FROM geocoded_addresses WHERE address = ?1",
                [address],
                |row| {
                    Ok(GeocodeEntry {
                        address: row.get(0)?,
                        coordinates: Coordinates::new(row.get(1)?, row.get(2)?),
                        source: row.get(3)?,
                        geocoded_at_unix: row.get(4)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("Failed geocode lookup for {address}"))
    }

    pub fn put_geocode(&self, entry: &GeocodeEntry) -> Result<()> {
        self.conn()
            .execute(
                "
                INSERT INTO geocoded_addresses (address, lat, lng, source, geocoded_at_unix)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(address) DO UPDATE SET
                    lat = excluded.lat,
                    lng = excluded.lng,
                    source = excluded.source,
                    geocoded_at_unix = excluded.geocoded_at_unix
                ",
                params![
                    entry.address,
                    entry.coordinates.lat,
                    entry.coordinates.lng,
                    entry.source,
                    entry.geocoded_at_unix
                ],
            )
            .with_context(|| format!("Failed storing geocode for {}", entry.address))?;
        Ok(())
    }

    /// Registration numbers still lacking enrichment, oldest rows first.
    ///
    /// Rows whose last attempt ended in `not_found` or `no_match` are skipped.
    pub fn pending_enrichment(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "
                SELECT registration_number FROM physicians
                WHERE registration_number IS NOT NULL
                  AND COALESCE(enrichment, '') = ''
                  AND (enrichment_status IS NULL OR enrichment_status = 'error')
                ORDER BY id
                LIMIT ?1
                ",
            )
            .context("Failed preparing pending enrichment query")?;
        let rows = stmt
            .query_map([limit as i64], |row| row.get(0))
            .context("Failed querying pending enrichment")?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .context("Failed reading pending enrichment rows")
    }

    /// Records the outcome of one enrichment fetch.
    ///
    /// A stored non-empty value is never cleared, and once present its
    /// status stays `ok`. Returns whether a row was touched.
    pub fn record_enrichment(
        &self,
        registration_number: &str,
        status: EnrichmentStatus,
        value: Option<&str>,
    ) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "
                UPDATE physicians SET
                    enrichment = COALESCE(NULLIF(?2, ''), enrichment),
                    enrichment_status = CASE
                        WHEN NULLIF(?2, '') IS NOT NULL THEN 'ok'
                        WHEN COALESCE(enrichment, '') <> '' THEN 'ok'
                        ELSE ?3 END,
                    enrichment_checked_at_unix = ?4
                WHERE registration_number = ?1
                ",
                params![
                    registration_number,
                    value,
                    status.as_str(),
                    now_unix_seconds()
                ],
            )
            .with_context(|| format!("Failed recording enrichment for {registration_number}"))?;
        Ok(changed > 0)
    }

    pub fn enrichment_state(&self, registration_numbers: &[String]) -> Result<Vec<EnrichmentState>> {
        let conn = self.conn();
        let mut out = Vec::with_capacity(registration_numbers.len());
        for chunk in registration_numbers.chunks(LOOKUP_CHUNK) {
            let sql = format!(
                "SELECT registration_number, enrichment, enrichment_status, enrichment_checked_at_unix
                 FROM physicians WHERE registration_number IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = conn
                .prepare(&sql)
                .context("Failed preparing enrichment state query")?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), |row| {
                    Ok(EnrichmentState {
                        registration_number: row.get(0)?,
                        enrichment: row.get(1)?,
                        status: row.get(2)?,
                        checked_at_unix: row.get(3)?,
                    })
                })
                .context("Failed querying enrichment state")?;
            for row in rows {
                out.push(row.context("Failed reading enrichment state row")?);
            }
        }
        Ok(out)
    }

    /// Records the outcome of one registry search under `filters_key`.
    ///
    /// Every returned physician becomes a member of the search; each area in
    /// `areas` is marked complete unless it is listed in `incomplete`.
    pub fn record_area_search(
        &self,
        filters_key: &str,
        areas: &[String],
        incomplete: &HashSet<String>,
        records: &[PhysicianRecord],
    ) -> Result<()> {
        let now = now_unix_seconds();
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .context("Failed starting area search transaction")?;
        {
            let mut by_registration = tx
                .prepare("SELECT id FROM physicians WHERE registration_number = ?1")
                .context("Failed preparing member lookup")?;
            let mut by_name_address = tx
                .prepare(
                    "SELECT id FROM physicians
                     WHERE registration_number IS NULL AND name = ?1 AND address = ?2",
                )
                .context("Failed preparing member lookup")?;
            let mut member = tx
                .prepare(
                    "INSERT OR IGNORE INTO area_search_members (filters_key, physician_id)
                     VALUES (?1, ?2)",
                )
                .context("Failed preparing member insert")?;
            for record in records {
                let id: Option<i64> = match record.key() {
                    PhysicianKey::Registration(reg) => by_registration
                        .query_row([&reg], |row| row.get(0))
                        .optional(),
                    PhysicianKey::NameAddress(name, address) => by_name_address
                        .query_row([&name, &address], |row| row.get(0))
                        .optional(),
                }
                .with_context(|| format!("Failed resolving searched physician {}", record.name))?;
                if let Some(id) = id {
                    member
                        .execute(params![filters_key, id])
                        .context("Failed recording search member")?;
                }
            }

            let mut area = tx
                .prepare(
                    "
                    INSERT INTO area_searches (prefix, filters_key, complete, searched_at_unix)
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(prefix, filters_key) DO UPDATE SET
                        complete = excluded.complete,
                        searched_at_unix = excluded.searched_at_unix
                    ",
                )
                .context("Failed preparing area search upsert")?;
            for prefix in areas {
                area.execute(params![prefix, filters_key, !incomplete.contains(prefix), now])
                    .with_context(|| format!("Failed recording area search {prefix}"))?;
            }
        }
        tx.commit().context("Failed committing area search")?;
        Ok(())
    }

    /// Areas among `prefixes` whose last search under `filters_key` completed
    /// without failures or partial coverage.
    pub fn completed_areas(&self, prefixes: &[String], filters_key: &str) -> Result<HashSet<String>> {
        let conn = self.conn();
        let mut out = HashSet::new();
        for chunk in prefixes.chunks(LOOKUP_CHUNK) {
            let sql = format!(
                "SELECT prefix FROM area_searches
                 WHERE complete = 1 AND filters_key = ? AND prefix IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = conn
                .prepare(&sql)
                .context("Failed preparing area search lookup")?;
            let values = std::iter::once(filters_key).chain(chunk.iter().map(String::as_str));
            let rows = stmt
                .query_map(params_from_iter(values), |row| row.get::<_, String>(0))
                .context("Failed querying searched areas")?;
            for row in rows {
                out.insert(row.context("Failed reading searched area")?);
            }
        }
        Ok(out)
    }

    /// Physicians returned by searches under `filters_key` in the given area
    /// prefixes, joined with their address geocodes.
    pub fn physicians_in_searched_areas(
        &self,
        prefixes: &[String],
        filters_key: &str,
    ) -> Result<Vec<StoredPhysician>> {
        let conn = self.conn();
        let mut out = Vec::new();
        for chunk in prefixes.chunks(LOOKUP_CHUNK) {
            let sql = format!(
                "SELECT {PHYSICIAN_COLUMNS}, g.lat, g.lng, g.source
                 FROM physicians p
                 JOIN area_search_members m ON m.physician_id = p.id AND m.filters_key = ?
                 LEFT JOIN geocoded_addresses g ON g.address = p.address
                 WHERE p.postal_prefix IN ({})
                 ORDER BY p.id",
                placeholders(chunk.len())
            );
            let mut stmt = conn
                .prepare(&sql)
                .context("Failed preparing area physician query")?;
            let values = std::iter::once(filters_key).chain(chunk.iter().map(String::as_str));
            let rows = stmt
                .query_map(params_from_iter(values), |row| {
                    let (_, record) = physician_from_row(row)?;
                    let lat: Option<f64> = row.get(11)?;
                    let lng: Option<f64> = row.get(12)?;
                    Ok(StoredPhysician {
                        record,
                        coordinates: lat.zip(lng).map(|(lat, lng)| Coordinates::new(lat, lng)),
                        geocode_source: row.get(13)?,
                    })
                })
                .context("Failed querying area physicians")?;
            for row in rows {
                out.push(row.context("Failed reading area physician row")?);
            }
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn();
        let stats = conn
            .query_row(
                "
                SELECT
                    COUNT(*),
                    COUNT(registration_number),
                    COALESCE(SUM(COALESCE(enrichment, '') <> ''), 0),
                    COALESCE(SUM(registration_number IS NOT NULL AND COALESCE(enrichment, '') = ''
                        AND (enrichment_status IS NULL OR enrichment_status = 'error')), 0),
                    COALESCE(SUM(enrichment_status = 'not_found'), 0),
                    COALESCE(SUM(enrichment_status = 'no_match'), 0),
                    COALESCE(SUM(enrichment_status = 'error'), 0)
                FROM physicians
                ",
                [],
                |row| {
                    Ok(StoreStats {
                        physicians: row.get::<_, i64>(0)? as u64,
                        with_registration_number: row.get::<_, i64>(1)? as u64,
                        geocoded_addresses: 0,
                        enriched: row.get::<_, i64>(2)? as u64,
                        enrichment_pending: row.get::<_, i64>(3)? as u64,
                        enrichment_not_found: row.get::<_, i64>(4)? as u64,
                        enrichment_no_match: row.get::<_, i64>(5)? as u64,
                        enrichment_errors: row.get::<_, i64>(6)? as u64,
                    })
                },
            )
            .context("Failed computing physician stats")?;
        let geocoded: i64 = conn
            .query_row("SELECT COUNT(*) FROM geocoded_addresses", [], |row| row.get(0))
            .context("Failed counting geocoded addresses")?;
        Ok(StoreStats {
            geocoded_addresses: geocoded as u64,
            ..stats
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn physician_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, PhysicianRecord)> {
    Ok((
        row.get(0)?,
        PhysicianRecord {
            name: row.get(1)?,
            specialty: row.get(2)?,
            address: row.get(3)?,
            phone: row.get(4)?,
            status: row.get(5)?,
            registration_number: row.get(6)?,
            postal_prefix: row.get(7)?,
            enrichment: row.get(8)?,
            created_at_unix: row.get(9)?,
            updated_at_unix: row.get(10)?,
        },
    ))
}

/// Normalizes registration numbers and folds duplicate identities within one
/// batch; the later record wins but keeps an earlier non-empty enrichment.
fn collapse_batch(records: &[PhysicianRecord]) -> Vec<PhysicianRecord> {
    let mut index: HashMap<PhysicianKey, usize> = HashMap::new();
    let mut out: Vec<PhysicianRecord> = Vec::with_capacity(records.len());
    for record in records {
        let record = record.clone().normalized();
        match index.get(&record.key()) {
            Some(&i) => {
                let previous = std::mem::replace(&mut out[i], record);
                if !out[i].has_enrichment() && previous.has_enrichment() {
                    out[i].enrichment = previous.enrichment;
                }
            }
            None => {
                index.insert(record.key(), out.len());
                out.push(record);
            }
        }
    }
    out
}

/// Loads stored rows for every identity in the batch with one query per chunk.
///
/// Unnumbered rows are looked up by every incoming address so that a
/// numbered record can adopt one.
fn load_existing(
    conn: &Connection,
    incoming: &[PhysicianRecord],
) -> Result<HashMap<PhysicianKey, (i64, PhysicianRecord)>> {
    let mut registrations = Vec::new();
    let mut addresses = Vec::new();
    for record in incoming {
        if let PhysicianKey::Registration(reg) = record.key() {
            registrations.push(reg);
        }
        addresses.push(record.address.clone());
    }
    addresses.sort();
    addresses.dedup();

    let mut existing = HashMap::new();
    for chunk in registrations.chunks(LOOKUP_CHUNK) {
        let sql = format!(
            "SELECT {PHYSICIAN_COLUMNS} FROM physicians p WHERE p.registration_number IN ({})",
            placeholders(chunk.len())
        );
        collect_existing(conn, &sql, chunk, &mut existing)?;
    }
    for chunk in addresses.chunks(LOOKUP_CHUNK) {
        let sql = format!(
            "SELECT {PHYSICIAN_COLUMNS} FROM physicians p
             WHERE p.registration_number IS NULL AND p.address IN ({})",
            placeholders(chunk.len())
        );
        collect_existing(conn, &sql, chunk, &mut existing)?;
    }
    Ok(existing)
}

fn collect_existing(
    conn: &Connection,
    sql: &str,
    values: &[String],
    existing: &mut HashMap<PhysicianKey, (i64, PhysicianRecord)>,
) -> Result<()> {
    let mut stmt = conn
        .prepare(sql)
        .context("Failed preparing existing-record lookup")?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), physician_from_row)
        .context("Failed querying existing records")?;
    for row in rows {
        let (id, record) = row.context("Failed reading existing record")?;
        existing.insert(record.key(), (id, record));
    }
    Ok(())
}

fn differs(current: &PhysicianRecord, incoming: &PhysicianRecord) -> bool {
    current.name != incoming.name
        || current.specialty != incoming.specialty
        || current.address != incoming.address
        || current.phone != incoming.phone
        || current.status != incoming.status
        || current.postal_prefix != incoming.postal_prefix
        || (incoming.has_enrichment() && current.enrichment != incoming.enrichment)
}
