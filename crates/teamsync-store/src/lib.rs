use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use teamsync_core::{
    format_row_time, parse_flexible_bool, parse_flexible_i64, parse_row_time, parse_weekday_set,
    unique_key, AutomationTopic, Clock, FullConfig, Record, RecordKind, RecordPayload, TeamEntry,
    VotingPollTemplate, STATUS_ACTIVE,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("sheet `{0}` not found")]
    MissingSheet(String),
    #[error("row index {index} out of range for sheet `{sheet}`")]
    RowOutOfRange { sheet: String, index: usize },
}

/// Capability over a remote spreadsheet-shaped store. No transactions: every
/// call is a separate round trip and can fail independently, so all
/// higher-level guarantees (dedup, idempotence) live above this trait.
pub trait TableBackend {
    /// # Errors
    /// Returns [`BackendError`] when the sheet cannot be read.
    fn get_all_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, BackendError>;

    /// # Errors
    /// Returns [`BackendError`] when the row cannot be written.
    fn append_row(&self, sheet: &str, row: Vec<String>) -> Result<(), BackendError>;

    /// Insert one row so that existing rows at `index` and below shift down.
    ///
    /// # Errors
    /// Returns [`BackendError`] when the row cannot be written.
    fn insert_row(&self, sheet: &str, index: usize, row: Vec<String>) -> Result<(), BackendError>;

    /// Rewrite a contiguous row range starting at `start_row`.
    ///
    /// # Errors
    /// Returns [`BackendError`] when the range cannot be written.
    fn update_range(
        &self,
        sheet: &str,
        start_row: usize,
        rows: Vec<Vec<String>>,
    ) -> Result<(), BackendError>;

    /// # Errors
    /// Returns [`BackendError`] when the row cannot be deleted.
    fn delete_row(&self, sheet: &str, index: usize) -> Result<(), BackendError>;

    /// Locate the named sheet, creating it with the given header row when it
    /// does not exist yet.
    ///
    /// # Errors
    /// Returns [`BackendError`] when the sheet cannot be created.
    fn ensure_sheet(&self, sheet: &str, header: &[&str]) -> Result<(), BackendError>;
}

impl<T: TableBackend + ?Sized> TableBackend for &T {
    fn get_all_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, BackendError> {
        (**self).get_all_rows(sheet)
    }

    fn append_row(&self, sheet: &str, row: Vec<String>) -> Result<(), BackendError> {
        (**self).append_row(sheet, row)
    }

    fn insert_row(&self, sheet: &str, index: usize, row: Vec<String>) -> Result<(), BackendError> {
        (**self).insert_row(sheet, index, row)
    }

    fn update_range(
        &self,
        sheet: &str,
        start_row: usize,
        rows: Vec<Vec<String>>,
    ) -> Result<(), BackendError> {
        (**self).update_range(sheet, start_row, rows)
    }

    fn delete_row(&self, sheet: &str, index: usize) -> Result<(), BackendError> {
        (**self).delete_row(sheet, index)
    }

    fn ensure_sheet(&self, sheet: &str, header: &[&str]) -> Result<(), BackendError> {
        (**self).ensure_sheet(sheet, header)
    }
}

/// In-memory backend for tests and embedding. The `set_unavailable` switch
/// makes every call fail so callers' retry-next-schedule paths can be
/// exercised.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    sheets: RefCell<BTreeMap<String, Vec<Vec<String>>>>,
    unavailable: Cell<bool>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.set(unavailable);
    }

    pub fn seed(&self, sheet: &str, rows: Vec<Vec<String>>) {
        self.sheets.borrow_mut().insert(sheet.to_string(), rows);
    }

    #[must_use]
    pub fn rows(&self, sheet: &str) -> Vec<Vec<String>> {
        self.sheets.borrow().get(sheet).cloned().unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.unavailable.get() {
            return Err(BackendError::Unavailable("memory backend marked unavailable".to_string()));
        }
        Ok(())
    }

    fn with_sheet<R>(
        &self,
        sheet: &str,
        op: impl FnOnce(&mut Vec<Vec<String>>) -> Result<R, BackendError>,
    ) -> Result<R, BackendError> {
        self.check_available()?;
        let mut sheets = self.sheets.borrow_mut();
        let rows = sheets.get_mut(sheet).ok_or_else(|| BackendError::MissingSheet(sheet.to_string()))?;
        op(rows)
    }
}

impl TableBackend for MemoryBackend {
    fn get_all_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, BackendError> {
        self.check_available()?;
        self.sheets
            .borrow()
            .get(sheet)
            .cloned()
            .ok_or_else(|| BackendError::MissingSheet(sheet.to_string()))
    }

    fn append_row(&self, sheet: &str, row: Vec<String>) -> Result<(), BackendError> {
        self.with_sheet(sheet, |rows| {
            rows.push(row);
            Ok(())
        })
    }

    fn insert_row(&self, sheet: &str, index: usize, row: Vec<String>) -> Result<(), BackendError> {
        let sheet_name = sheet.to_string();
        self.with_sheet(sheet, move |rows| {
            if index > rows.len() {
                return Err(BackendError::RowOutOfRange { sheet: sheet_name, index });
            }
            rows.insert(index, row);
            Ok(())
        })
    }

    fn update_range(
        &self,
        sheet: &str,
        start_row: usize,
        new_rows: Vec<Vec<String>>,
    ) -> Result<(), BackendError> {
        let sheet_name = sheet.to_string();
        self.with_sheet(sheet, move |rows| {
            let end = start_row + new_rows.len();
            if end > rows.len() {
                return Err(BackendError::RowOutOfRange { sheet: sheet_name, index: end });
            }
            for (offset, row) in new_rows.into_iter().enumerate() {
                rows[start_row + offset] = row;
            }
            Ok(())
        })
    }

    fn delete_row(&self, sheet: &str, index: usize) -> Result<(), BackendError> {
        let sheet_name = sheet.to_string();
        self.with_sheet(sheet, move |rows| {
            if index >= rows.len() {
                return Err(BackendError::RowOutOfRange { sheet: sheet_name, index });
            }
            rows.remove(index);
            Ok(())
        })
    }

    fn ensure_sheet(&self, sheet: &str, header: &[&str]) -> Result<(), BackendError> {
        self.check_available()?;
        let mut sheets = self.sheets.borrow_mut();
        sheets.entry(sheet.to_string()).or_insert_with(|| {
            vec![header.iter().map(|cell| (*cell).to_string()).collect()]
        });
        Ok(())
    }
}

/// File-durable backend: the whole store is one JSON document mapping sheet
/// names to row grids, rewritten on every mutation. Stands in for the hosted
/// spreadsheet client, which is an external collaborator.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    sheets: RefCell<BTreeMap<String, Vec<Vec<String>>>>,
}

impl JsonFileBackend {
    /// Open the backing file, creating an empty store when it is absent.
    ///
    /// # Errors
    /// Returns [`BackendError::Unavailable`] when the file exists but cannot
    /// be read or parsed.
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        let sheets = if path.exists() {
            let body = fs::read_to_string(path).map_err(|err| {
                BackendError::Unavailable(format!("failed to read {}: {err}", path.display()))
            })?;
            serde_json::from_str(&body).map_err(|err| {
                BackendError::Unavailable(format!("failed to parse {}: {err}", path.display()))
            })?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path: path.to_path_buf(), sheets: RefCell::new(sheets) })
    }

    fn persist(&self) -> Result<(), BackendError> {
        let body = serde_json::to_string_pretty(&*self.sheets.borrow()).map_err(|err| {
            BackendError::Unavailable(format!("failed to serialize backend state: {err}"))
        })?;
        fs::write(&self.path, body).map_err(|err| {
            BackendError::Unavailable(format!("failed to write {}: {err}", self.path.display()))
        })
    }

    fn mutate<R>(
        &self,
        sheet: &str,
        op: impl FnOnce(&mut Vec<Vec<String>>) -> Result<R, BackendError>,
    ) -> Result<R, BackendError> {
        let result = {
            let mut sheets = self.sheets.borrow_mut();
            let rows = sheets
                .get_mut(sheet)
                .ok_or_else(|| BackendError::MissingSheet(sheet.to_string()))?;
            op(rows)?
        };
        self.persist()?;
        Ok(result)
    }
}

impl TableBackend for JsonFileBackend {
    fn get_all_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, BackendError> {
        self.sheets
            .borrow()
            .get(sheet)
            .cloned()
            .ok_or_else(|| BackendError::MissingSheet(sheet.to_string()))
    }

    fn append_row(&self, sheet: &str, row: Vec<String>) -> Result<(), BackendError> {
        self.mutate(sheet, |rows| {
            rows.push(row);
            Ok(())
        })
    }

    fn insert_row(&self, sheet: &str, index: usize, row: Vec<String>) -> Result<(), BackendError> {
        let sheet_name = sheet.to_string();
        self.mutate(sheet, move |rows| {
            if index > rows.len() {
                return Err(BackendError::RowOutOfRange { sheet: sheet_name, index });
            }
            rows.insert(index, row);
            Ok(())
        })
    }

    fn update_range(
        &self,
        sheet: &str,
        start_row: usize,
        new_rows: Vec<Vec<String>>,
    ) -> Result<(), BackendError> {
        let sheet_name = sheet.to_string();
        self.mutate(sheet, move |rows| {
            let end = start_row + new_rows.len();
            if end > rows.len() {
                return Err(BackendError::RowOutOfRange { sheet: sheet_name, index: end });
            }
            for (offset, row) in new_rows.into_iter().enumerate() {
                rows[start_row + offset] = row;
            }
            Ok(())
        })
    }

    fn delete_row(&self, sheet: &str, index: usize) -> Result<(), BackendError> {
        let sheet_name = sheet.to_string();
        self.mutate(sheet, move |rows| {
            if index >= rows.len() {
                return Err(BackendError::RowOutOfRange { sheet: sheet_name, index });
            }
            rows.remove(index);
            Ok(())
        })
    }

    fn ensure_sheet(&self, sheet: &str, header: &[&str]) -> Result<(), BackendError> {
        {
            let mut sheets = self.sheets.borrow_mut();
            sheets.entry(sheet.to_string()).or_insert_with(|| {
                vec![header.iter().map(|cell| (*cell).to_string()).collect()]
            });
        }
        self.persist()
    }
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

pub const RECORD_SHEET: &str = "records";

/// Fixed 16-column header of the record sheet.
pub const RECORD_HEADER: [&str; 16] = [
    "type", "timestamp", "key", "status", "text", "link", "game_id", "season_id", "team_id",
    "opponent_id", "game_date", "game_time", "arena", "poll_id", "topic_id", "extra",
];

const COL_KIND: usize = 0;
const COL_CREATED: usize = 1;
const COL_KEY: usize = 2;
const COL_STATUS: usize = 3;
const COL_TEXT: usize = 4;
const COL_LINK: usize = 5;
const COL_GAME_ID: usize = 6;
const COL_SEASON_ID: usize = 7;
const COL_TEAM_ID: usize = 8;
const COL_OPPONENT_ID: usize = 9;
const COL_GAME_DATE: usize = 10;
const COL_GAME_TIME: usize = 11;
const COL_ARENA: usize = 12;
const COL_POLL_ID: usize = 13;
const COL_TOPIC_ID: usize = 14;
const COL_EXTRA: usize = 15;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateCheck {
    pub exists: bool,
    pub unique_key: String,
    pub row_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddOutcome {
    pub inserted: bool,
    pub unique_key: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Inserted,
    Updated,
}

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map_or("", String::as_str)
}

fn opt_cell(row: &[String], index: usize) -> Option<String> {
    let value = cell(row, index).trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn opt_i64_cell(row: &[String], index: usize) -> Option<i64> {
    parse_flexible_i64(cell(row, index))
}

/// Deduplicated, typed, append-mostly record log on top of a [`TableBackend`].
/// The backend offers no constraints, so at-most-once semantics are enforced
/// here by scanning before every write.
pub struct RecordStore<B: TableBackend, C: Clock> {
    backend: B,
    clock: C,
    sheet: String,
}

impl<B: TableBackend, C: Clock> RecordStore<B, C> {
    /// Open the store on the default record sheet, creating it with the fixed
    /// header when absent.
    ///
    /// # Errors
    /// Returns an error when the sheet cannot be located or created.
    pub fn open(backend: B, clock: C) -> Result<Self> {
        Self::with_sheet(backend, clock, RECORD_SHEET)
    }

    /// # Errors
    /// Returns an error when the sheet cannot be located or created.
    pub fn with_sheet(backend: B, clock: C, sheet: &str) -> Result<Self> {
        backend
            .ensure_sheet(sheet, &RECORD_HEADER)
            .with_context(|| format!("failed to ensure record sheet `{sheet}`"))?;
        Ok(Self { backend, clock, sheet: sheet.to_string() })
    }

    fn rows(&self) -> Result<Vec<Vec<String>>> {
        self.backend
            .get_all_rows(&self.sheet)
            .with_context(|| format!("failed to read record sheet `{}`", self.sheet))
    }

    fn row_matches_kind(row: &[String], kind: RecordKind) -> bool {
        RecordKind::parse(cell(row, COL_KIND)) == Some(kind)
    }

    /// Check whether a record with the deterministic key already exists.
    /// Exact `(kind, key)` match first; then a looser match where the
    /// identifier is a substring of an existing key of the same kind, which
    /// covers legacy keys created before a qualifier was added.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read.
    pub fn check_duplicate(
        &self,
        kind: RecordKind,
        identifier: &str,
        qualifiers: &[&str],
    ) -> Result<DuplicateCheck> {
        let key = unique_key(kind, identifier, qualifiers);
        let rows = self.rows()?;

        for (index, row) in rows.iter().enumerate().skip(1) {
            if Self::row_matches_kind(row, kind) && cell(row, COL_KEY) == key {
                return Ok(DuplicateCheck { exists: true, unique_key: key, row_index: Some(index) });
            }
        }

        let identifier = identifier.trim();
        if !identifier.is_empty() {
            for (index, row) in rows.iter().enumerate().skip(1) {
                if Self::row_matches_kind(row, kind) && cell(row, COL_KEY).contains(identifier) {
                    tracing::debug!(
                        matched_key = cell(row, COL_KEY),
                        wanted_key = key,
                        "duplicate check matched via substring fallback"
                    );
                    return Ok(DuplicateCheck {
                        exists: true,
                        unique_key: key,
                        row_index: Some(index),
                    });
                }
            }
        }

        Ok(DuplicateCheck { exists: false, unique_key: key, row_index: None })
    }

    /// Insert a new record unless its key already exists. New rows go
    /// directly below the header so most-recent-first holds without sorting.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read or written.
    pub fn add_record(
        &self,
        kind: RecordKind,
        identifier: &str,
        status: &str,
        payload: &RecordPayload,
        qualifiers: &[&str],
    ) -> Result<AddOutcome> {
        let check = self.check_duplicate(kind, identifier, qualifiers)?;
        if check.exists {
            return Ok(AddOutcome { inserted: false, unique_key: check.unique_key });
        }

        let record = Record {
            kind,
            created_at: self.clock.now(),
            unique_key: check.unique_key.clone(),
            status: status.to_string(),
            payload: payload.clone(),
        };
        let row = record_to_row(&record)?;
        self.backend
            .insert_row(&self.sheet, 1, row)
            .with_context(|| format!("failed to insert record `{}`", check.unique_key))?;
        Ok(AddOutcome { inserted: true, unique_key: check.unique_key })
    }

    /// Rewrite the status cell of the record with the given key. Returns
    /// `false` when no such key exists; callers never treat that as fatal.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read or written.
    pub fn update_record_status(&self, record_key: &str, new_status: &str) -> Result<bool> {
        let rows = self.rows()?;
        for (index, row) in rows.iter().enumerate().skip(1) {
            if cell(row, COL_KEY) != record_key {
                continue;
            }
            let mut updated = row.clone();
            if updated.len() <= COL_STATUS {
                updated.resize(RECORD_HEADER.len(), String::new());
            }
            updated[COL_STATUS] = new_status.to_string();
            self.backend
                .update_range(&self.sheet, index, vec![updated])
                .with_context(|| format!("failed to update status of `{record_key}`"))?;
            return Ok(true);
        }
        tracing::debug!(record_key, "status update found no matching record");
        Ok(false)
    }

    /// Insert or rewrite a record addressed by its upstream game id. Game ids
    /// come from an external source and may repeat across kinds, so the
    /// lookup is scoped to `(kind, game_id)` on the dedicated game-id column
    /// rather than on the dedup key.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read or written.
    pub fn upsert_by_game_id(
        &self,
        kind: RecordKind,
        game_id: i64,
        status: &str,
        payload: &RecordPayload,
        qualifiers: &[&str],
    ) -> Result<UpsertAction> {
        let rows = self.rows()?;
        let wanted = game_id.to_string();

        for (index, row) in rows.iter().enumerate().skip(1) {
            if !Self::row_matches_kind(row, kind) || cell(row, COL_GAME_ID).trim() != wanted {
                continue;
            }
            let mut updated_payload = payload.clone();
            updated_payload.game_id = Some(game_id);
            let record = Record {
                kind,
                created_at: self.row_created_at(row),
                unique_key: cell(row, COL_KEY).to_string(),
                status: status.to_string(),
                payload: updated_payload,
            };
            let updated = record_to_row(&record)?;
            self.backend
                .update_range(&self.sheet, index, vec![updated])
                .with_context(|| format!("failed to rewrite record for game {game_id}"))?;
            return Ok(UpsertAction::Updated);
        }

        let mut new_payload = payload.clone();
        new_payload.game_id = Some(game_id);
        self.add_record(kind, &wanted, status, &new_payload, qualifiers)?;
        Ok(UpsertAction::Inserted)
    }

    fn row_created_at(&self, row: &[String]) -> time::OffsetDateTime {
        let offset = self.clock.now().offset();
        parse_row_time(cell(row, COL_CREATED), offset).unwrap_or_else(|_| self.clock.now())
    }

    /// # Errors
    /// Returns an error when the backend cannot be read.
    pub fn get_records_by_kind(&self, kind: RecordKind) -> Result<Vec<Record>> {
        let offset = self.clock.now().offset();
        Ok(self
            .rows()?
            .iter()
            .skip(1)
            .filter(|row| Self::row_matches_kind(row, kind))
            .filter_map(|row| record_from_row(row, offset))
            .collect())
    }

    /// Records of the given kind whose status marks them active, most recent
    /// first (the insert position maintains that order).
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read.
    pub fn get_active_records(&self, kind: RecordKind) -> Result<Vec<Record>> {
        Ok(self
            .get_records_by_kind(kind)?
            .into_iter()
            .filter(|record| record.status == STATUS_ACTIVE)
            .collect())
    }

    /// Delete rows of one kind whose age strictly exceeds `max_age_days`.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read or written.
    pub fn cleanup_old_records(&self, kind: RecordKind, max_age_days: i64) -> Result<usize> {
        self.cleanup_where(max_age_days, |row| Self::row_matches_kind(row, kind))
    }

    /// Delete rows of any kind whose age strictly exceeds `max_age_days`.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read or written.
    pub fn cleanup_expired_records(&self, max_age_days: i64) -> Result<usize> {
        self.cleanup_where(max_age_days, |_| true)
    }

    fn cleanup_where(
        &self,
        max_age_days: i64,
        matches: impl Fn(&[String]) -> bool,
    ) -> Result<usize> {
        let now = self.clock.now();
        let offset = now.offset();
        let rows = self.rows()?;

        let mut expired: Vec<usize> = Vec::new();
        for (index, row) in rows.iter().enumerate().skip(1) {
            if !matches(row) {
                continue;
            }
            // Unparsable timestamps are skipped, never deleted.
            let Ok(created_at) = parse_row_time(cell(row, COL_CREATED), offset) else {
                continue;
            };
            if (now - created_at).whole_days() > max_age_days {
                expired.push(index);
            }
        }

        // Bottom-up so earlier deletions never invalidate pending indices.
        for index in expired.iter().rev() {
            self.backend
                .delete_row(&self.sheet, *index)
                .with_context(|| format!("failed to delete expired row {index}"))?;
        }
        Ok(expired.len())
    }
}

fn record_to_row(record: &Record) -> Result<Vec<String>> {
    let timestamp = format_row_time(record.created_at)
        .with_context(|| format!("failed to format timestamp for `{}`", record.unique_key))?;
    let payload = &record.payload;
    let extra = match &payload.extra {
        Some(value) => serde_json::to_string(value).context("failed to serialize extra bag")?,
        None => String::new(),
    };
    let opt_string = |value: &Option<String>| value.clone().unwrap_or_default();
    let opt_number = |value: &Option<i64>| value.map(|id| id.to_string()).unwrap_or_default();

    Ok(vec![
        record.kind.as_str().to_string(),
        timestamp,
        record.unique_key.clone(),
        record.status.clone(),
        opt_string(&payload.text),
        opt_string(&payload.link),
        opt_number(&payload.game_id),
        opt_number(&payload.season_id),
        opt_number(&payload.team_id),
        opt_number(&payload.opponent_id),
        opt_string(&payload.game_date),
        opt_string(&payload.game_time),
        opt_string(&payload.arena),
        opt_string(&payload.poll_id),
        opt_number(&payload.topic_id),
        extra,
    ])
}

fn record_from_row(row: &[String], offset: time::UtcOffset) -> Option<Record> {
    let kind = RecordKind::parse(cell(row, COL_KIND))?;
    let created_at = parse_row_time(cell(row, COL_CREATED), offset).ok()?;
    Some(Record {
        kind,
        created_at,
        unique_key: cell(row, COL_KEY).to_string(),
        status: cell(row, COL_STATUS).to_string(),
        payload: RecordPayload {
            text: opt_cell(row, COL_TEXT),
            link: opt_cell(row, COL_LINK),
            game_id: opt_i64_cell(row, COL_GAME_ID),
            season_id: opt_i64_cell(row, COL_SEASON_ID),
            team_id: opt_i64_cell(row, COL_TEAM_ID),
            opponent_id: opt_i64_cell(row, COL_OPPONENT_ID),
            game_date: opt_cell(row, COL_GAME_DATE),
            game_time: opt_cell(row, COL_GAME_TIME),
            arena: opt_cell(row, COL_ARENA),
            poll_id: opt_cell(row, COL_POLL_ID),
            topic_id: opt_i64_cell(row, COL_TOPIC_ID),
            extra: opt_cell(row, COL_EXTRA)
                .and_then(|body| serde_json::from_str(&body).ok()),
        },
    })
}

// ---------------------------------------------------------------------------
// Config reader
// ---------------------------------------------------------------------------

pub const CONFIG_SHEET: &str = "config";
pub const CONFIG_END_MARKER: &str = "CONFIG_END";
pub const VOTING_END_MARKER: &str = "VOTING_END";
pub const AUTOMATION_HEADER: &str = "AUTOMATION_TOPICS";
const AUTOMATION_LEGACY_PREFIX: &str = "AUTOMATION";

const VOTE_COL_POLL: usize = 0;
const VOTE_COL_QUESTION: usize = 1;
const VOTE_COL_OPTION: usize = 2;
const VOTE_COL_WEEKDAYS: usize = 3;
const VOTE_COL_ANONYMOUS: usize = 4;
const VOTE_COL_MULTIPLE: usize = 5;
const VOTE_COL_OPEN_HOURS: usize = 6;
const VOTE_COL_CLOSE_DATE: usize = 7;
const VOTE_COL_TOPIC: usize = 8;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ConfigSection {
    Legacy,
    Voting,
    AwaitingAutomationHeader,
    Automation,
}

/// Reads the human-edited config region of the backend. Always reads fresh:
/// correctness under concurrent human edits beats latency here.
pub struct ConfigReader<B: TableBackend> {
    backend: B,
    config_sheet: String,
    record_sheet: String,
}

impl<B: TableBackend> ConfigReader<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config_sheet: CONFIG_SHEET.to_string(),
            record_sheet: RECORD_SHEET.to_string(),
        }
    }

    #[must_use]
    pub fn with_sheets(backend: B, config_sheet: &str, record_sheet: &str) -> Self {
        Self {
            backend,
            config_sheet: config_sheet.to_string(),
            record_sheet: record_sheet.to_string(),
        }
    }

    /// Parse the whole config region into structured configuration. When the
    /// region is empty, the same shapes are reconstructed from record rows,
    /// which carried config before the dedicated region existed.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be read. Malformed cells are
    /// skipped, never fatal.
    pub fn get_full_config(&self) -> Result<FullConfig> {
        let rows = self
            .backend
            .get_all_rows(&self.config_sheet)
            .with_context(|| format!("failed to read config sheet `{}`", self.config_sheet))?;

        let mut config = FullConfig::default();
        let mut section = ConfigSection::Legacy;

        for row in &rows {
            let first = cell(row, 0).trim();
            match section {
                ConfigSection::Legacy => {
                    if first.eq_ignore_ascii_case(CONFIG_END_MARKER) {
                        section = ConfigSection::Voting;
                    } else {
                        parse_legacy_row(row, &mut config);
                    }
                }
                ConfigSection::Voting => {
                    if first.eq_ignore_ascii_case(VOTING_END_MARKER) {
                        section = ConfigSection::AwaitingAutomationHeader;
                    } else {
                        parse_voting_row(row, &mut config);
                    }
                }
                ConfigSection::AwaitingAutomationHeader => {
                    if first.eq_ignore_ascii_case(AUTOMATION_HEADER)
                        || first.to_ascii_uppercase().starts_with(AUTOMATION_LEGACY_PREFIX)
                    {
                        section = ConfigSection::Automation;
                    }
                    // Anything else here is a human-readable hint row.
                }
                ConfigSection::Automation => parse_automation_row(row, &mut config),
            }
        }

        if config_region_is_empty(&config) {
            tracing::debug!("config region empty, reconstructing from record rows");
            return self.fallback_from_records();
        }
        Ok(config)
    }

    /// Backward-compatibility path for data created before the dedicated
    /// config region: record rows double as config entries, matched by a
    /// looser kind-name comparison.
    fn fallback_from_records(&self) -> Result<FullConfig> {
        let rows = self
            .backend
            .get_all_rows(&self.record_sheet)
            .with_context(|| format!("failed to read record sheet `{}`", self.record_sheet))?;

        let mut config = FullConfig::default();
        for row in rows.iter().skip(1) {
            let kind_cell = cell(row, COL_KIND).trim().to_ascii_lowercase();
            let name = opt_cell(row, COL_TEXT);
            let id = opt_i64_cell(row, COL_TEAM_ID);

            if kind_cell.contains("comp") {
                if let Some(id) = id {
                    config.comp_ids.push(id);
                }
            } else if kind_cell.contains("team") {
                if let (Some(id), Some(name)) = (id, name) {
                    config.team_ids.push(id);
                    config.teams.push(TeamEntry {
                        id,
                        name,
                        alt_name: None,
                        aliases: Vec::new(),
                        metadata: None,
                    });
                }
            } else if kind_cell.contains("training") {
                if let Some(name) = name {
                    config.training_polls.push(name);
                }
            } else if kind_cell.contains("fallback") {
                if let Some(name) = name.or_else(|| opt_cell(row, COL_LINK)) {
                    config.fallback_sources.push(name);
                }
            }
        }
        Ok(config)
    }
}

fn config_region_is_empty(config: &FullConfig) -> bool {
    config.comp_ids.is_empty()
        && config.teams.is_empty()
        && config.training_polls.is_empty()
        && config.fallback_sources.is_empty()
        && config.voting_polls.is_empty()
        && config.automation_topics.is_empty()
}

fn looks_like_header(first: &str) -> bool {
    matches!(first.to_ascii_lowercase().as_str(), "type" | "record_type" | "kind")
}

fn parse_legacy_row(row: &[String], config: &mut FullConfig) {
    let first = cell(row, 0).trim();
    if looks_like_header(first) {
        return;
    }

    let id = opt_i64_cell(row, 1);
    let name = opt_cell(row, 2);

    match RecordKind::parse(first) {
        Some(RecordKind::Competition) => {
            if let Some(id) = id {
                config.comp_ids.push(id);
            }
        }
        Some(RecordKind::Team) => push_team_row(row, config),
        Some(RecordKind::TrainingPoll) => {
            if let Some(value) = name.or_else(|| opt_cell(row, 1)) {
                config.training_polls.push(value);
            }
        }
        Some(RecordKind::Fallback) => {
            if let Some(value) = name.or_else(|| opt_cell(row, 1)) {
                config.fallback_sources.push(value);
            }
        }
        _ => {
            // Unlabeled row: a populated numeric id plus a name is read as a
            // team row, the known legacy shape. Everything else is ignored.
            if first.is_empty() && id.is_some() && name.is_some() {
                tracing::debug!(?id, "inferred unlabeled config row as team entry");
                push_team_row(row, config);
            }
        }
    }
}

fn push_team_row(row: &[String], config: &mut FullConfig) {
    let Some(id) = opt_i64_cell(row, 1) else {
        return;
    };
    let Some(name) = opt_cell(row, 2) else {
        return;
    };
    let aliases = cell(row, 4)
        .split(',')
        .map(str::trim)
        .filter(|alias| !alias.is_empty())
        .map(ToString::to_string)
        .collect();
    config.team_ids.push(id);
    config.teams.push(TeamEntry {
        id,
        name,
        alt_name: opt_cell(row, 3),
        aliases,
        // Bad JSON loses the cell, not the row.
        metadata: opt_cell(row, 5).and_then(|body| serde_json::from_str(&body).ok()),
    });
}

fn parse_voting_row(row: &[String], config: &mut FullConfig) {
    let poll_key = cell(row, VOTE_COL_POLL).trim();
    if poll_key.is_empty() || matches!(poll_key.to_ascii_lowercase().as_str(), "poll" | "poll_id" | "poll_key") {
        return;
    }

    let entry = config
        .voting_polls
        .entry(poll_key.to_string())
        .or_insert_with(|| VotingPollTemplate::new(poll_key));

    if entry.question.is_empty() {
        if let Some(question) = opt_cell(row, VOTE_COL_QUESTION) {
            entry.question = question;
        }
    }
    if let Some(option) = opt_cell(row, VOTE_COL_OPTION) {
        entry.options.push(option);
    }
    entry.weekdays.extend(parse_weekday_set(cell(row, VOTE_COL_WEEKDAYS)));
    if let Some(anonymous) = parse_flexible_bool(cell(row, VOTE_COL_ANONYMOUS)) {
        entry.anonymous = anonymous;
    }
    if let Some(multiple) = parse_flexible_bool(cell(row, VOTE_COL_MULTIPLE)) {
        entry.multiple_choice = multiple;
    }
    if let Some(open_hours) = parse_flexible_i64(cell(row, VOTE_COL_OPEN_HOURS)) {
        entry.open_hours = Some(open_hours);
    }
    if let Some(close_date) = opt_cell(row, VOTE_COL_CLOSE_DATE) {
        entry.close_date = Some(close_date);
    }
    if let Some(topic_id) = parse_flexible_i64(cell(row, VOTE_COL_TOPIC)) {
        entry.topic_id = Some(topic_id);
    }
}

fn parse_automation_row(row: &[String], config: &mut FullConfig) {
    let name = cell(row, 0).trim();
    if name.is_empty() || name.eq_ignore_ascii_case("name") {
        return;
    }
    let Some(topic_id) = opt_i64_cell(row, 1) else {
        return;
    };
    config.automation_topics.insert(
        name.to_string(),
        AutomationTopic {
            name: name.to_string(),
            topic_id,
            anonymous: parse_flexible_bool(cell(row, 2)).unwrap_or(false),
            multiple_choice: parse_flexible_bool(cell(row, 3)).unwrap_or(true),
            comment: opt_cell(row, 4),
        },
    );
}

#[cfg(test)]
mod tests {
    use teamsync_core::{FixedOffsetClock, Weekday};
    use time::macros::{datetime, offset};
    use time::{Duration, OffsetDateTime};

    use super::*;

    #[derive(Debug, Clone, Copy)]
    struct TestClock(OffsetDateTime);

    impl Clock for TestClock {
        fn now(&self) -> OffsetDateTime {
            self.0
        }
    }

    fn fixture_clock() -> TestClock {
        TestClock(datetime!(2026-08-20 12:00:00 +3))
    }

    fn open_store(backend: &MemoryBackend) -> Result<RecordStore<&MemoryBackend, TestClock>> {
        RecordStore::open(backend, fixture_clock())
    }

    fn seeded_row(kind: &str, created_at: OffsetDateTime, key: &str, status: &str) -> Vec<String> {
        let mut row = vec![String::new(); RECORD_HEADER.len()];
        row[COL_KIND] = kind.to_string();
        row[COL_CREATED] = match format_row_time(created_at) {
            Ok(cell) => cell,
            Err(err) => panic!("failed to format fixture timestamp: {err}"),
        };
        row[COL_KEY] = key.to_string();
        row[COL_STATUS] = status.to_string();
        row
    }

    #[test]
    fn add_record_is_idempotent_per_key() -> Result<()> {
        let backend = MemoryBackend::new();
        let store = open_store(&backend)?;

        let first = store.add_record(
            RecordKind::GameResult,
            "4711",
            "sent",
            &RecordPayload::default(),
            &["2026"],
        )?;
        let second = store.add_record(
            RecordKind::GameResult,
            "4711",
            "sent",
            &RecordPayload::default(),
            &["2026"],
        )?;

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.unique_key, "game_result:4711:2026");
        assert_eq!(backend.rows(RECORD_SHEET).len(), 2);
        Ok(())
    }

    #[test]
    fn new_records_land_directly_below_the_header() -> Result<()> {
        let backend = MemoryBackend::new();
        let store = open_store(&backend)?;

        store.add_record(RecordKind::GameResult, "1", "sent", &RecordPayload::default(), &[])?;
        store.add_record(RecordKind::GameResult, "2", "sent", &RecordPayload::default(), &[])?;

        let rows = backend.rows(RECORD_SHEET);
        assert_eq!(rows[1][COL_KEY], "game_result:2");
        assert_eq!(rows[2][COL_KEY], "game_result:1");
        Ok(())
    }

    #[test]
    fn duplicate_check_falls_back_to_substring_match() -> Result<()> {
        let backend = MemoryBackend::new();
        let store = open_store(&backend)?;
        backend.seed(
            RECORD_SHEET,
            vec![
                RECORD_HEADER.iter().map(ToString::to_string).collect(),
                seeded_row("game_result", fixture_clock().now(), "game_result:4711", "sent"),
            ],
        );

        let check = store.check_duplicate(RecordKind::GameResult, "4711", &["2026"])?;
        assert!(check.exists);
        assert_eq!(check.unique_key, "game_result:4711:2026");

        let miss = store.check_duplicate(RecordKind::Birthday, "4711", &[])?;
        assert!(!miss.exists);
        Ok(())
    }

    #[test]
    fn status_update_reports_missing_keys_without_failing() -> Result<()> {
        let backend = MemoryBackend::new();
        let store = open_store(&backend)?;
        store.add_record(RecordKind::VotingPoll, "p1", "active", &RecordPayload::default(), &[])?;

        assert!(store.update_record_status("voting_poll:p1", "sent")?);
        assert!(!store.update_record_status("voting_poll:missing", "sent")?);
        assert_eq!(backend.rows(RECORD_SHEET)[1][COL_STATUS], "sent");
        Ok(())
    }

    #[test]
    fn upsert_rewrites_existing_game_row_in_place() -> Result<()> {
        let backend = MemoryBackend::new();
        let store = open_store(&backend)?;

        let payload = RecordPayload { arena: Some("Ice Hall".to_string()), ..Default::default() };
        let first = store.upsert_by_game_id(RecordKind::GameResult, 42, "scheduled", &payload, &[])?;
        let updated_payload =
            RecordPayload { arena: Some("Main Arena".to_string()), ..Default::default() };
        let second =
            store.upsert_by_game_id(RecordKind::GameResult, 42, "final", &updated_payload, &[])?;

        assert_eq!(first, UpsertAction::Inserted);
        assert_eq!(second, UpsertAction::Updated);
        let rows = backend.rows(RECORD_SHEET);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][COL_STATUS], "final");
        assert_eq!(rows[1][COL_ARENA], "Main Arena");
        Ok(())
    }

    #[test]
    fn same_game_id_under_another_kind_inserts_a_new_row() -> Result<()> {
        let backend = MemoryBackend::new();
        let store = open_store(&backend)?;

        store.upsert_by_game_id(RecordKind::GameResult, 42, "final", &RecordPayload::default(), &[])?;
        let action = store.upsert_by_game_id(
            RecordKind::VotingPoll,
            42,
            "active",
            &RecordPayload::default(),
            &[],
        )?;

        assert_eq!(action, UpsertAction::Inserted);
        assert_eq!(backend.rows(RECORD_SHEET).len(), 3);
        Ok(())
    }

    #[test]
    fn cleanup_removes_only_strictly_older_rows_of_the_kind() -> Result<()> {
        let backend = MemoryBackend::new();
        let store = open_store(&backend)?;
        let now = fixture_clock().now();
        backend.seed(
            RECORD_SHEET,
            vec![
                RECORD_HEADER.iter().map(ToString::to_string).collect(),
                seeded_row("game_result", now - Duration::days(40), "game_result:old", "sent"),
                seeded_row("game_result", now - Duration::days(30), "game_result:edge", "sent"),
                seeded_row("game_result", now - Duration::days(5), "game_result:new", "sent"),
                seeded_row("birthday", now - Duration::days(40), "birthday:other", "sent"),
            ],
        );

        let cleaned = store.cleanup_old_records(RecordKind::GameResult, 30)?;

        assert_eq!(cleaned, 1);
        let keys: Vec<String> =
            backend.rows(RECORD_SHEET).iter().skip(1).map(|row| row[COL_KEY].clone()).collect();
        assert_eq!(keys, vec!["game_result:edge", "game_result:new", "birthday:other"]);
        Ok(())
    }

    #[test]
    fn expired_cleanup_spans_all_kinds_and_skips_unparsable_rows() -> Result<()> {
        let backend = MemoryBackend::new();
        let store = open_store(&backend)?;
        let now = fixture_clock().now();
        let mut unparsable =
            seeded_row("game_result", now - Duration::days(90), "game_result:odd", "sent");
        unparsable[COL_CREATED] = "not a timestamp".to_string();
        backend.seed(
            RECORD_SHEET,
            vec![
                RECORD_HEADER.iter().map(ToString::to_string).collect(),
                seeded_row("game_result", now - Duration::days(40), "game_result:old", "sent"),
                seeded_row("birthday", now - Duration::days(35), "birthday:old", "sent"),
                unparsable,
            ],
        );

        let cleaned = store.cleanup_expired_records(30)?;

        assert_eq!(cleaned, 2);
        let keys: Vec<String> =
            backend.rows(RECORD_SHEET).iter().skip(1).map(|row| row[COL_KEY].clone()).collect();
        assert_eq!(keys, vec!["game_result:odd"]);
        Ok(())
    }

    #[test]
    fn backend_outage_surfaces_as_error_not_panic() -> Result<()> {
        let backend = MemoryBackend::new();
        let store = open_store(&backend)?;
        backend.set_unavailable(true);

        let result =
            store.add_record(RecordKind::GameResult, "1", "sent", &RecordPayload::default(), &[]);
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn records_round_trip_through_rows() -> Result<()> {
        let backend = MemoryBackend::new();
        let store = open_store(&backend)?;
        let payload = RecordPayload {
            text: Some("5:2 win".to_string()),
            link: Some("https://example.org/game/42".to_string()),
            game_id: Some(42),
            team_id: Some(7),
            arena: Some("Ice Hall".to_string()),
            extra: Some(serde_json::json!({"period_scores": ["2:0", "1:1", "2:1"]})),
            ..Default::default()
        };
        store.add_record(RecordKind::GameResult, "42", "sent", &payload, &["2026"])?;

        let records = store.get_records_by_kind(RecordKind::GameResult)?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, payload);
        assert_eq!(records[0].created_at, fixture_clock().now());
        Ok(())
    }

    fn config_fixture_rows() -> Vec<Vec<String>> {
        let row = |cells: &[&str]| cells.iter().map(ToString::to_string).collect::<Vec<_>>();
        vec![
            row(&["Type", "ID", "Name", "Alt name", "Aliases", "Metadata"]),
            row(&["comp", "100"]),
            row(&["competition", "200"]),
            row(&["team", "7", "IceCats", "Cats", "IC, Kitties", r#"{"city":"Tampere"}"#]),
            row(&["", "8", "Penguins", "", "", "{broken json"]),
            row(&["training", "", "tuesday_training"]),
            row(&["fallback", "", "https://backup.example.org"]),
            row(&["CONFIG_END"]),
            row(&["weekly", "Training [weekday]?", "Tuesday 19:00", "tue", "no", "yes", "48", "", "55"]),
            row(&["weekly", "", "Friday 20:00", "fri", "", "", "", "", ""]),
            row(&["VOTING_END"]),
            row(&["pick the automation topics below"]),
            row(&["AUTOMATION topics v2"]),
            row(&["name", "topic", "anon", "multi", "comment"]),
            row(&["game_results", "12", "no", "yes", "posted after final whistle"]),
            row(&["birthdays", "13"]),
        ]
    }

    #[test]
    fn full_config_parses_all_three_sections() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.seed(CONFIG_SHEET, config_fixture_rows());
        let reader = ConfigReader::new(&backend);

        let config = reader.get_full_config()?;

        assert_eq!(config.comp_ids, vec![100, 200]);
        assert_eq!(config.team_ids, vec![7, 8]);
        assert_eq!(config.teams[0].aliases, vec!["IC", "Kitties"]);
        assert_eq!(
            config.teams[0].metadata,
            Some(serde_json::json!({"city": "Tampere"}))
        );
        // Unlabeled row inferred as a team; its broken metadata cell is dropped.
        assert_eq!(config.teams[1].name, "Penguins");
        assert_eq!(config.teams[1].metadata, None);
        assert_eq!(config.training_polls, vec!["tuesday_training"]);
        assert_eq!(config.fallback_sources, vec!["https://backup.example.org"]);

        let weekly = &config.voting_polls["weekly"];
        assert_eq!(weekly.question, "Training [weekday]?");
        assert_eq!(weekly.options, vec!["Tuesday 19:00", "Friday 20:00"]);
        assert_eq!(
            weekly.weekdays.iter().copied().collect::<Vec<_>>(),
            vec![Weekday::Tuesday, Weekday::Friday]
        );
        assert!(!weekly.anonymous);
        assert!(weekly.multiple_choice);
        assert_eq!(weekly.open_hours, Some(48));
        assert_eq!(weekly.topic_id, Some(55));

        assert_eq!(config.automation_topics.len(), 2);
        assert_eq!(config.automation_topics["game_results"].topic_id, 12);
        assert!(config.automation_topics["birthdays"].multiple_choice);
        Ok(())
    }

    #[test]
    fn full_config_is_deterministic_without_backend_changes() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.seed(CONFIG_SHEET, config_fixture_rows());
        let reader = ConfigReader::new(&backend);

        assert_eq!(reader.get_full_config()?, reader.get_full_config()?);
        Ok(())
    }

    #[test]
    fn empty_config_region_reconstructs_from_record_rows() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.seed(CONFIG_SHEET, vec![vec!["CONFIG_END".to_string()]]);
        let now = fixture_clock().now();
        let mut team_row = seeded_row("team", now, "team:7", "active");
        team_row[COL_TEXT] = "IceCats".to_string();
        team_row[COL_TEAM_ID] = "7".to_string();
        let mut comp_row = seeded_row("comp", now, "competition:100", "active");
        comp_row[COL_TEAM_ID] = "100".to_string();
        backend.seed(
            RECORD_SHEET,
            vec![RECORD_HEADER.iter().map(ToString::to_string).collect(), team_row, comp_row],
        );

        let config = ConfigReader::new(&backend).get_full_config()?;

        assert_eq!(config.comp_ids, vec![100]);
        assert_eq!(config.teams.len(), 1);
        assert_eq!(config.teams[0].name, "IceCats");
        Ok(())
    }

    #[test]
    fn json_file_backend_survives_reopen() -> Result<()> {
        let dir = std::env::temp_dir().join(format!(
            "teamsync-store-test-{}",
            fixture_clock().now().unix_timestamp_nanos()
        ));
        fs::create_dir_all(&dir)?;
        let path = dir.join("backend.json");

        {
            let backend = JsonFileBackend::open(&path)?;
            let store = RecordStore::open(&backend, fixture_clock())?;
            store.add_record(RecordKind::GameResult, "42", "sent", &RecordPayload::default(), &[])?;
        }

        let reopened = JsonFileBackend::open(&path)?;
        let store = RecordStore::open(&reopened, fixture_clock())?;
        let check = store.check_duplicate(RecordKind::GameResult, "42", &[])?;
        assert!(check.exists);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn fixed_offset_clock_reports_configured_offset() {
        let clock = FixedOffsetClock::new(offset!(+3));
        assert_eq!(clock.now().offset(), offset!(+3));
    }
}
