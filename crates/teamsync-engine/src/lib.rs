use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use teamsync_core::{
    detect_changes, should_apply_changes, ChangeSet, Clock, FalsePositiveHistory, RecordKind,
    VoteSnapshot, VoterEntry, VoterId, VotingPollTemplate, Weekday, HISTORY_RETENTION_DAYS,
};
use teamsync_store::{ConfigReader, RecordStore, TableBackend};
use time::macros::format_description;
use time::Date;

pub const ATTENDANCE_SHEET: &str = "attendance";
const ATTENDANCE_HEADER: [&str; 2] = ["name", "handle"];
const VOTING_POLL_KEY_PREFIX: &str = "voting_poll:";
const FALSE_POSITIVE_FILE: &str = "false-positives.json";

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

fn day_key(day: Date) -> Result<String> {
    day.format(format_description!("[year]-[month]-[day]"))
        .context("failed to format history day key")
}

fn parse_day_key(value: &str) -> Option<Date> {
    Date::parse(value, format_description!("[year]-[month]-[day]")).ok()
}

// ---------------------------------------------------------------------------
// Snapshot store
// ---------------------------------------------------------------------------

/// Persists the last-seen vote snapshot per poll so passes can diff across
/// runs. One JSON file per poll id; snapshots are replaced wholesale, never
/// merged.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// # Errors
    /// Returns an error when the snapshot directory cannot be created.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    fn path_for(&self, poll_id: &str) -> PathBuf {
        self.dir.join(format!("snapshot-{}.json", sanitize_id(poll_id)))
    }

    /// # Errors
    /// Returns an error when an existing snapshot file cannot be read or parsed.
    pub fn load(&self, poll_id: &str) -> Result<Option<VoteSnapshot>> {
        let path = self.path_for(poll_id);
        if !path.exists() {
            return Ok(None);
        }
        let body = fs::read_to_string(&path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        let snapshot = serde_json::from_str(&body)
            .with_context(|| format!("failed to parse snapshot {}", path.display()))?;
        Ok(Some(snapshot))
    }

    /// # Errors
    /// Returns an error when the snapshot cannot be serialized or written.
    pub fn save(&self, snapshot: &VoteSnapshot) -> Result<()> {
        let path = self.path_for(&snapshot.poll_id);
        let body =
            serde_json::to_string_pretty(snapshot).context("failed to serialize snapshot")?;
        fs::write(&path, body)
            .with_context(|| format!("failed to write snapshot {}", path.display()))
    }
}

// ---------------------------------------------------------------------------
// History log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub poll_id: String,
    pub date: Date,
    pub added: usize,
    pub removed: usize,
    pub confidence: f32,
    pub applied: bool,
    pub false_positive: bool,
}

/// Day-keyed change history plus the separate false-positive index the
/// detector consults. Both logs are pruned to a rolling window on every
/// write.
#[derive(Debug)]
pub struct HistoryLog {
    dir: PathBuf,
}

impl HistoryLog {
    /// # Errors
    /// Returns an error when the history directory cannot be created.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create history dir {}", dir.display()))?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    fn day_file(&self, day: Date) -> Result<PathBuf> {
        Ok(self.dir.join(format!("changes-{}.json", day_key(day)?)))
    }

    fn false_positive_file(&self) -> PathBuf {
        self.dir.join(FALSE_POSITIVE_FILE)
    }

    /// Append one change-set outcome to today's history file and, when the
    /// change was judged a likely false positive, to the false-positive
    /// index as well.
    ///
    /// # Errors
    /// Returns an error when either log cannot be read or written.
    pub fn log_changes(&self, changes: &ChangeSet, applied: bool, today: Date) -> Result<()> {
        let shape = changes.shape();
        let entry = HistoryEntry {
            poll_id: changes.poll_id.clone(),
            date: today,
            added: shape.added,
            removed: shape.removed,
            confidence: changes.confidence,
            applied,
            false_positive: changes.is_likely_false_positive,
        };

        let path = self.day_file(today)?;
        let mut entries: Vec<HistoryEntry> = if path.exists() {
            let body = fs::read_to_string(&path)
                .with_context(|| format!("failed to read history {}", path.display()))?;
            serde_json::from_str(&body).unwrap_or_default()
        } else {
            Vec::new()
        };
        entries.push(entry);
        let body = serde_json::to_string_pretty(&entries).context("failed to serialize history")?;
        fs::write(&path, body)
            .with_context(|| format!("failed to write history {}", path.display()))?;

        let mut history = self.false_positive_history()?;
        if changes.is_likely_false_positive {
            history.entries.push((today, shape));
        }
        // Rewritten on every log call so stale index entries age out even
        // when no new false positive arrives.
        self.write_false_positives(&history, today)?;

        self.prune_day_files(today)
    }

    /// # Errors
    /// Returns an error when the false-positive index cannot be read.
    pub fn false_positive_history(&self) -> Result<FalsePositiveHistory> {
        let path = self.false_positive_file();
        if !path.exists() {
            return Ok(FalsePositiveHistory::default());
        }
        let body = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(serde_json::from_str(&body).unwrap_or_default())
    }

    fn write_false_positives(&self, history: &FalsePositiveHistory, today: Date) -> Result<()> {
        let cutoff = today - time::Duration::days(HISTORY_RETENTION_DAYS);
        let pruned = FalsePositiveHistory {
            entries: history
                .entries
                .iter()
                .filter(|(day, _)| *day >= cutoff)
                .copied()
                .collect(),
        };
        let body = serde_json::to_string_pretty(&pruned)
            .context("failed to serialize false-positive index")?;
        fs::write(self.false_positive_file(), body)
            .context("failed to write false-positive index")
    }

    fn prune_day_files(&self, today: Date) -> Result<()> {
        let cutoff = today - time::Duration::days(HISTORY_RETENTION_DAYS);
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list history dir {}", self.dir.display()))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(day) = name
                .strip_prefix("changes-")
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(parse_day_key)
            else {
                continue;
            };
            if day < cutoff {
                if let Err(err) = fs::remove_file(entry.path()) {
                    tracing::warn!(file = name, %err, "failed to prune history file");
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterEntry {
    pub name: String,
    pub handle: Option<String>,
}

fn normalize_identity(value: &str) -> String {
    value.trim().trim_start_matches('@').to_ascii_lowercase()
}

/// Pre-loaded voter roster, passed in at construction with an explicit
/// reload entry point so staleness is visible in the API rather than hidden
/// in a process-global cache.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: BTreeMap<String, RosterEntry>,
}

impl Roster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_entries(entries: Vec<RosterEntry>) -> Self {
        let mut roster = Self::new();
        roster.reload(entries);
        roster
    }

    /// Replace the roster contents wholesale.
    pub fn reload(&mut self, entries: Vec<RosterEntry>) {
        self.entries.clear();
        for entry in entries {
            if let Some(handle) = &entry.handle {
                self.entries.insert(handle.clone(), entry.clone());
            }
            self.entries.insert(entry.name.clone(), entry);
        }
    }

    /// Load roster entries from a JSON file; an absent file is an empty
    /// roster, not an error.
    ///
    /// # Errors
    /// Returns an error when an existing file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read roster {}", path.display()))?;
        let entries: Vec<RosterEntry> = serde_json::from_str(&body)
            .with_context(|| format!("failed to parse roster {}", path.display()))?;
        Ok(Self::from_entries(entries))
    }

    /// Resolve an external identity: exact key, then normalized casing with
    /// at-signs stripped, then substring in either direction.
    #[must_use]
    pub fn resolve(&self, raw: &str) -> Option<&RosterEntry> {
        if let Some(entry) = self.entries.get(raw) {
            return Some(entry);
        }
        let wanted = normalize_identity(raw);
        if wanted.is_empty() {
            return None;
        }
        for (key, entry) in &self.entries {
            if normalize_identity(key) == wanted {
                return Some(entry);
            }
        }
        for (key, entry) in &self.entries {
            let known = normalize_identity(key);
            if known.contains(&wanted) || wanted.contains(&known) {
                return Some(entry);
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Poll source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollAnswer {
    pub voter_id: i64,
    pub display_name: String,
    pub handle: Option<String>,
    pub chosen_options: Vec<usize>,
    pub revision: i64,
}

/// Read side of the live poll. Reads are noisy and partial; the change
/// detector exists because this trait cannot be trusted blindly.
pub trait PollSource {
    /// # Errors
    /// Returns an error when the poll source cannot be reached.
    fn recent_answers(&self, poll_id: &str) -> Result<Vec<PollAnswer>>;
}

/// Poll source backed by per-poll JSON files dropped by the scraper, which
/// is an external collaborator.
#[derive(Debug)]
pub struct FilePollSource {
    dir: PathBuf,
}

impl FilePollSource {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }
}

impl PollSource for FilePollSource {
    fn recent_answers(&self, poll_id: &str) -> Result<Vec<PollAnswer>> {
        let path = self.dir.join(format!("answers-{}.json", sanitize_id(poll_id)));
        if !path.exists() {
            return Ok(Vec::new());
        }
        let body = fs::read_to_string(&path)
            .with_context(|| format!("failed to read answers {}", path.display()))?;
        serde_json::from_str(&body)
            .with_context(|| format!("failed to parse answers {}", path.display()))
    }
}

// ---------------------------------------------------------------------------
// Sync engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PassOutcome {
    pub poll_id: Option<String>,
    pub has_changes: bool,
    pub applied: bool,
    pub confidence: f32,
    pub added_rows: usize,
    pub removed_rows: usize,
    pub failures: Vec<String>,
}

impl PassOutcome {
    fn idle() -> Self {
        Self {
            poll_id: None,
            has_changes: false,
            applied: false,
            confidence: 0.0,
            added_rows: 0,
            removed_rows: 0,
            failures: Vec::new(),
        }
    }
}

fn split_poll_key(record_key: &str) -> Option<(String, Option<String>)> {
    let rest = record_key.strip_prefix(VOTING_POLL_KEY_PREFIX)?;
    match rest.split_once(':') {
        Some((poll_id, template_key)) => {
            Some((poll_id.to_string(), Some(template_key.to_string())))
        }
        None => Some((rest.to_string(), None)),
    }
}

fn is_day_header(row: &[String], day: Weekday) -> bool {
    let first = row.first().map_or("", String::as_str);
    Weekday::parse_token(first) == Some(day) && row.iter().skip(1).all(|c| c.trim().is_empty())
}

fn is_any_day_header(row: &[String]) -> bool {
    let first = row.first().map_or("", String::as_str);
    Weekday::parse_token(first).is_some() && row.iter().skip(1).all(|c| c.trim().is_empty())
}

fn is_blank(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}

fn row_matches_voter(row: &[String], entry: &VoterEntry) -> bool {
    let name = row.first().map_or("", String::as_str).trim();
    if !name.is_empty() && name == entry.display_name {
        return true;
    }
    let handle = row.get(1).map_or("", String::as_str);
    if let Some(voter_handle) = &entry.handle {
        if !handle.trim().is_empty()
            && normalize_identity(handle) == normalize_identity(voter_handle)
        {
            return true;
        }
    }
    false
}

fn voter_row(entry: &VoterEntry) -> Vec<String> {
    vec![entry.display_name.clone(), entry.handle.clone().unwrap_or_default()]
}

/// One reconciliation pass per invocation:
/// find active poll → fetch → load previous → diff → gate → apply → persist
/// → log. No in-process state survives between passes; everything re-derives
/// from the backend and the snapshot store.
pub struct SyncEngine<B: TableBackend, P: PollSource, C: Clock + Copy> {
    backend: B,
    source: P,
    clock: C,
    snapshots: SnapshotStore,
    history: HistoryLog,
    roster: Roster,
}

impl<B: TableBackend, P: PollSource, C: Clock + Copy> SyncEngine<B, P, C> {
    /// # Errors
    /// Returns an error when the data directory or the presentation sheet
    /// cannot be prepared.
    pub fn new(backend: B, source: P, clock: C, data_dir: &Path, roster: Roster) -> Result<Self> {
        let snapshots = SnapshotStore::new(&data_dir.join("snapshots"))?;
        let history = HistoryLog::new(&data_dir.join("history"))?;
        backend
            .ensure_sheet(ATTENDANCE_SHEET, &ATTENDANCE_HEADER)
            .context("failed to ensure attendance sheet")?;
        Ok(Self { backend, source, clock, snapshots, history, roster })
    }

    /// Replace the roster cache wholesale.
    pub fn reload_roster(&mut self, roster: Roster) {
        self.roster = roster;
    }

    /// Run one reconciliation pass.
    ///
    /// # Errors
    /// Returns an error only when a step that the whole pass depends on
    /// fails (backend read, poll fetch, snapshot I/O). Per-weekday apply
    /// failures are collected into the outcome instead, because partial
    /// progress beats none when there are no transactions.
    pub fn run_pass(&self) -> Result<PassOutcome> {
        let store =
            RecordStore::open(&self.backend, self.clock).context("failed to open record store")?;
        let active = store
            .get_active_records(RecordKind::VotingPoll)
            .context("failed to scan for the active poll")?;
        let Some(record) = active.into_iter().next() else {
            tracing::info!("no active poll, pass ends with nothing to do");
            return Ok(PassOutcome::idle());
        };
        let Some((poll_id, template_key)) = split_poll_key(&record.unique_key) else {
            tracing::warn!(record_key = record.unique_key, "active poll record has no poll id");
            return Ok(PassOutcome::idle());
        };

        let config = ConfigReader::new(&self.backend)
            .get_full_config()
            .context("failed to read config for the active poll")?;
        let template = template_key
            .as_deref()
            .and_then(|key| config.voting_polls.get(key))
            .or_else(|| {
                if config.voting_polls.len() == 1 {
                    config.voting_polls.values().next()
                } else {
                    None
                }
            });

        let answers = self
            .source
            .recent_answers(&poll_id)
            .with_context(|| format!("failed to fetch answers for poll {poll_id}"))?;
        let current = self.build_snapshot(&poll_id, template, answers);
        let previous = self
            .snapshots
            .load(&poll_id)?
            .unwrap_or_else(|| VoteSnapshot::new(&poll_id));

        let today = self.clock.now().date();
        let fp_history = self.history.false_positive_history()?;
        let changes = detect_changes(&previous, &current, &fp_history, today);

        if !changes.has_changes {
            tracing::info!(poll_id, "no vote changes detected");
            return Ok(PassOutcome { poll_id: Some(poll_id), ..PassOutcome::idle() });
        }

        let apply = should_apply_changes(&changes);
        let mut outcome = PassOutcome {
            poll_id: Some(poll_id.clone()),
            has_changes: true,
            applied: apply,
            confidence: changes.confidence,
            added_rows: 0,
            removed_rows: 0,
            failures: Vec::new(),
        };

        if apply {
            let (added_rows, removed_rows, failures) =
                self.apply_changes(&changes, &current, &previous);
            outcome.added_rows = added_rows;
            outcome.removed_rows = removed_rows;
            outcome.failures = failures;
            self.snapshots
                .save(&current)
                .with_context(|| format!("failed to persist snapshot for poll {poll_id}"))?;
        } else {
            tracing::info!(
                poll_id,
                confidence = changes.confidence,
                false_positive = changes.is_likely_false_positive,
                "change rejected by the confidence gate"
            );
        }

        self.history.log_changes(&changes, apply, today)?;
        tracing::info!(
            poll_id,
            applied = apply,
            added_rows = outcome.added_rows,
            removed_rows = outcome.removed_rows,
            failed_steps = outcome.failures.len(),
            "reconciliation pass finished"
        );
        Ok(outcome)
    }

    fn build_snapshot(
        &self,
        poll_id: &str,
        template: Option<&VotingPollTemplate>,
        answers: Vec<PollAnswer>,
    ) -> VoteSnapshot {
        let mut snapshot = VoteSnapshot::new(poll_id);
        for answer in answers {
            let raw = answer.handle.as_deref().unwrap_or(&answer.display_name);
            let (display_name, handle) = match self.roster.resolve(raw) {
                Some(entry) => (entry.name.clone(), entry.handle.clone()),
                // Unresolved identities keep their raw external name; a vote
                // is never dropped over a roster miss.
                None => (answer.display_name.clone(), answer.handle.clone()),
            };
            if display_name.trim().is_empty() && handle.is_none() {
                tracing::warn!(voter_id = answer.voter_id, "skipping voter with empty identity");
                continue;
            }
            let choices = answer
                .chosen_options
                .iter()
                .filter_map(|index| weekday_for_option(template, *index))
                .collect();
            snapshot.voters.insert(
                VoterId(answer.voter_id),
                VoterEntry { display_name, handle, choices, revision: answer.revision },
            );
        }
        snapshot
    }

    fn apply_changes(
        &self,
        changes: &ChangeSet,
        current: &VoteSnapshot,
        previous: &VoteSnapshot,
    ) -> (usize, usize, Vec<String>) {
        let mut added_rows = 0;
        let mut removed_rows = 0;
        let mut failures = Vec::new();

        for (day, delta) in &changes.per_day {
            for voter_id in &delta.added {
                let Some(entry) = current.voters.get(voter_id) else {
                    continue;
                };
                match self.apply_addition(*day, entry) {
                    Ok(true) => added_rows += 1,
                    Ok(false) => {
                        tracing::debug!(%voter_id, day = %day, "voter already listed, skipping");
                    }
                    Err(err) => {
                        tracing::warn!(%voter_id, day = %day, %err, "failed to add voter row");
                        failures.push(format!("add {voter_id} on {day}: {err}"));
                    }
                }
            }
            for voter_id in &delta.removed {
                let Some(entry) = previous.voters.get(voter_id) else {
                    continue;
                };
                match self.apply_removal(*day, entry) {
                    Ok(true) => removed_rows += 1,
                    Ok(false) => {
                        tracing::debug!(%voter_id, day = %day, "voter row already absent");
                    }
                    Err(err) => {
                        tracing::warn!(%voter_id, day = %day, %err, "failed to remove voter row");
                        failures.push(format!("remove {voter_id} on {day}: {err}"));
                    }
                }
            }
        }

        (added_rows, removed_rows, failures)
    }

    /// Insert one voter row into the weekday's block unless it is already
    /// there. The pre-check makes re-running an Apply after a crash between
    /// Apply and PersistSnapshot a no-op.
    fn apply_addition(&self, day: Weekday, entry: &VoterEntry) -> Result<bool> {
        let rows = self
            .backend
            .get_all_rows(ATTENDANCE_SHEET)
            .context("failed to read attendance sheet")?;

        let Some(header_index) = rows.iter().position(|row| is_day_header(row, day)) else {
            self.backend
                .append_row(ATTENDANCE_SHEET, vec![day.as_str().to_string(), String::new()])
                .context("failed to append weekday header")?;
            self.backend
                .append_row(ATTENDANCE_SHEET, voter_row(entry))
                .context("failed to append voter row")?;
            return Ok(true);
        };

        let block_end = rows
            .iter()
            .enumerate()
            .skip(header_index + 1)
            .find(|(_, row)| is_any_day_header(row))
            .map_or(rows.len(), |(index, _)| index);

        for row in &rows[header_index + 1..block_end] {
            if row_matches_voter(row, entry) {
                return Ok(false);
            }
        }

        let blank = (header_index + 1..block_end).find(|index| is_blank(&rows[*index]));
        match blank {
            Some(index) => self
                .backend
                .update_range(ATTENDANCE_SHEET, index, vec![voter_row(entry)])
                .context("failed to fill blank attendance row")?,
            None => self
                .backend
                .insert_row(ATTENDANCE_SHEET, block_end, voter_row(entry))
                .context("failed to insert attendance row")?,
        }
        Ok(true)
    }

    /// Delete the first row in the weekday's block matching the voter by
    /// name or handle; an already-absent row is a no-op, not an error.
    fn apply_removal(&self, day: Weekday, entry: &VoterEntry) -> Result<bool> {
        let rows = self
            .backend
            .get_all_rows(ATTENDANCE_SHEET)
            .context("failed to read attendance sheet")?;

        let Some(header_index) = rows.iter().position(|row| is_day_header(row, day)) else {
            return Ok(false);
        };
        let block_end = rows
            .iter()
            .enumerate()
            .skip(header_index + 1)
            .find(|(_, row)| is_any_day_header(row))
            .map_or(rows.len(), |(index, _)| index);

        for index in header_index + 1..block_end {
            if row_matches_voter(&rows[index], entry) {
                self.backend
                    .delete_row(ATTENDANCE_SHEET, index)
                    .context("failed to delete attendance row")?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn weekday_for_option(template: Option<&VotingPollTemplate>, index: usize) -> Option<Weekday> {
    match template {
        Some(template) => template.weekday_for_option(index),
        None => Weekday::ALL.get(index).copied(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use teamsync_core::{ChangeShape, RecordPayload};
    use teamsync_store::{MemoryBackend, CONFIG_SHEET};
    use time::macros::datetime;
    use time::OffsetDateTime;

    use super::*;

    #[derive(Debug, Clone, Copy)]
    struct TestClock(OffsetDateTime);

    impl Clock for TestClock {
        fn now(&self) -> OffsetDateTime {
            self.0
        }
    }

    #[derive(Debug, Default)]
    struct StubPollSource {
        answers: Vec<PollAnswer>,
    }

    impl PollSource for StubPollSource {
        fn recent_answers(&self, _poll_id: &str) -> Result<Vec<PollAnswer>> {
            Ok(self.answers.clone())
        }
    }

    fn fixture_clock() -> TestClock {
        TestClock(datetime!(2026-08-20 12:00:00 +3))
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        let now = match OffsetDateTime::now_utc().unix_timestamp_nanos().try_into() {
            Ok(value) => value,
            Err(_) => 0_u128,
        };
        let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
        if let Err(err) = fs::create_dir_all(&dir) {
            panic!("failed to create temp dir {}: {err}", dir.display());
        }
        dir
    }

    fn answer(id: i64, name: &str, handle: Option<&str>, options: &[usize]) -> PollAnswer {
        PollAnswer {
            voter_id: id,
            display_name: name.to_string(),
            handle: handle.map(ToString::to_string),
            chosen_options: options.to_vec(),
            revision: 1,
        }
    }

    fn voter(name: &str, handle: Option<&str>, days: &[Weekday]) -> VoterEntry {
        VoterEntry {
            display_name: name.to_string(),
            handle: handle.map(ToString::to_string),
            choices: days.iter().copied().collect(),
            revision: 1,
        }
    }

    fn seed_active_poll(backend: &MemoryBackend) -> Result<()> {
        let store = RecordStore::open(backend, fixture_clock())?;
        let payload = RecordPayload { poll_id: Some("555".to_string()), ..Default::default() };
        store.add_record(RecordKind::VotingPoll, "555", "active", &payload, &["weekly"])?;
        Ok(())
    }

    fn seed_config(backend: &MemoryBackend) {
        let row = |cells: &[&str]| cells.iter().map(ToString::to_string).collect::<Vec<_>>();
        backend.seed(
            CONFIG_SHEET,
            vec![
                row(&["CONFIG_END"]),
                row(&["weekly", "Training [weekday]?", "Tuesday 19:00", "tue"]),
                row(&["weekly", "", "Friday 20:00", "fri"]),
                row(&["VOTING_END"]),
            ],
        );
    }

    fn seed_attendance(backend: &MemoryBackend, rows: &[&[&str]]) {
        let grid = rows
            .iter()
            .map(|cells| cells.iter().map(ToString::to_string).collect::<Vec<_>>())
            .collect();
        backend.seed(ATTENDANCE_SHEET, grid);
    }

    fn engine<'a>(
        backend: &'a MemoryBackend,
        source: StubPollSource,
        data_dir: &Path,
    ) -> Result<SyncEngine<&'a MemoryBackend, StubPollSource, TestClock>> {
        SyncEngine::new(backend, source, fixture_clock(), data_dir, Roster::new())
    }

    #[test]
    fn snapshot_store_round_trips_per_poll() -> Result<()> {
        let dir = temp_dir("teamsync-snapshots");
        let store = SnapshotStore::new(&dir)?;

        assert_eq!(store.load("555")?, None);
        let mut snapshot = VoteSnapshot::new("555");
        snapshot
            .voters
            .insert(VoterId(1), voter("Alice", None, &[Weekday::Tuesday]));
        store.save(&snapshot)?;
        assert_eq!(store.load("555")?, Some(snapshot));

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn history_log_indexes_false_positives_and_prunes_old_days() -> Result<()> {
        let dir = temp_dir("teamsync-history");
        let log = HistoryLog::new(&dir)?;
        let today = fixture_clock().now().date();
        let stale = dir.join("changes-2026-01-01.json");
        fs::write(&stale, "[]")?;

        let mut changes = ChangeSet::unchanged("555");
        changes.has_changes = true;
        changes.per_day.insert(
            Weekday::Tuesday,
            teamsync_core::CategoryDelta {
                added: BTreeSet::new(),
                removed: [VoterId(2)].into_iter().collect(),
            },
        );
        changes.confidence = 0.0;
        changes.is_likely_false_positive = true;
        log.log_changes(&changes, false, today)?;

        let history = log.false_positive_history()?;
        assert_eq!(history.entries.len(), 1);
        assert_eq!(history.entries[0].1, ChangeShape { added: 0, removed: 1 });
        assert!(!stale.exists());

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn false_positive_index_ages_out_on_any_log_write() -> Result<()> {
        let dir = temp_dir("teamsync-history-age");
        let log = HistoryLog::new(&dir)?;
        let today = fixture_clock().now().date();
        let stale_history = FalsePositiveHistory {
            entries: vec![(
                today - time::Duration::days(HISTORY_RETENTION_DAYS + 5),
                ChangeShape { added: 0, removed: 1 },
            )],
        };
        fs::write(dir.join("false-positives.json"), serde_json::to_string(&stale_history)?)?;

        // A genuine, applied change: nothing gets appended to the index.
        let mut changes = ChangeSet::unchanged("555");
        changes.has_changes = true;
        changes.per_day.insert(
            Weekday::Tuesday,
            teamsync_core::CategoryDelta {
                added: [VoterId(1), VoterId(2), VoterId(3)].into_iter().collect(),
                removed: BTreeSet::new(),
            },
        );
        changes.confidence = 0.9;
        log.log_changes(&changes, true, today)?;

        let history = log.false_positive_history()?;
        assert!(history.entries.is_empty());

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn roster_resolution_falls_back_progressively() {
        let roster = Roster::from_entries(vec![
            RosterEntry { name: "Robert".to_string(), handle: Some("@bob".to_string()) },
            RosterEntry { name: "Alice".to_string(), handle: None },
        ]);

        let exact = roster.resolve("@bob").map(|entry| entry.name.as_str());
        let normalized = roster.resolve("BOB").map(|entry| entry.name.as_str());
        let substring = roster.resolve("obe").map(|entry| entry.name.as_str());

        assert_eq!(exact, Some("Robert"));
        assert_eq!(normalized, Some("Robert"));
        assert_eq!(substring, Some("Robert"));
        assert_eq!(roster.resolve("nobody-here"), None);
    }

    #[test]
    fn pass_with_no_active_poll_is_a_successful_no_op() -> Result<()> {
        let dir = temp_dir("teamsync-idle");
        let backend = MemoryBackend::new();
        RecordStore::open(&backend, fixture_clock())?;
        seed_config(&backend);
        let engine = engine(&backend, StubPollSource::default(), &dir)?;

        let outcome = engine.run_pass()?;
        assert_eq!(outcome.poll_id, None);
        assert!(!outcome.applied);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn two_day_addition_is_applied_to_both_blocks() -> Result<()> {
        let dir = temp_dir("teamsync-apply");
        let backend = MemoryBackend::new();
        seed_active_poll(&backend)?;
        seed_config(&backend);
        seed_attendance(&backend, &[&["tuesday"], &["Alice", ""], &["friday"]]);
        let source = StubPollSource {
            answers: vec![
                answer(1, "Alice", None, &[0]),
                answer(2, "Bob", Some("@bob"), &[0, 1]),
            ],
        };
        let engine = engine(&backend, source, &dir)?;
        let mut previous = VoteSnapshot::new("555");
        previous.voters.insert(VoterId(1), voter("Alice", None, &[Weekday::Tuesday]));
        SnapshotStore::new(&dir.join("snapshots"))?.save(&previous)?;

        let outcome = engine.run_pass()?;

        assert!(outcome.applied);
        assert_eq!(outcome.added_rows, 2);
        assert_eq!(outcome.removed_rows, 0);
        assert!(outcome.failures.is_empty());
        let rows = backend.rows(ATTENDANCE_SHEET);
        let bobs = rows.iter().filter(|row| row.first().map(String::as_str) == Some("Bob")).count();
        assert_eq!(bobs, 2);
        // Bob lands inside the tuesday block, before the friday header.
        assert_eq!(rows[2], vec!["Bob".to_string(), "@bob".to_string()]);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn reapplying_the_same_changes_is_a_no_op() -> Result<()> {
        let dir = temp_dir("teamsync-idempotent");
        let backend = MemoryBackend::new();
        seed_active_poll(&backend)?;
        seed_config(&backend);
        seed_attendance(&backend, &[&["tuesday"], &["Alice", ""], &["friday"]]);
        let source = StubPollSource {
            answers: vec![
                answer(1, "Alice", None, &[0]),
                answer(2, "Bob", Some("@bob"), &[0, 1]),
            ],
        };
        let engine = engine(&backend, source, &dir)?;
        let snapshots = SnapshotStore::new(&dir.join("snapshots"))?;
        let mut previous = VoteSnapshot::new("555");
        previous.voters.insert(VoterId(1), voter("Alice", None, &[Weekday::Tuesday]));
        snapshots.save(&previous)?;

        let first = engine.run_pass()?;
        assert_eq!(first.added_rows, 2);
        let rows_after_first = backend.rows(ATTENDANCE_SHEET);

        // Simulate a crash between Apply and PersistSnapshot: restore the
        // stale previous snapshot and run the pass again.
        snapshots.save(&previous)?;
        let second = engine.run_pass()?;

        assert!(second.applied);
        assert_eq!(second.added_rows, 0);
        assert_eq!(backend.rows(ATTENDANCE_SHEET), rows_after_first);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn single_vanishing_voter_is_rejected_and_shape_logged() -> Result<()> {
        let dir = temp_dir("teamsync-reject");
        let backend = MemoryBackend::new();
        seed_active_poll(&backend)?;
        seed_config(&backend);
        seed_attendance(&backend, &[&["tuesday"], &["Alice", ""], &["Bob", "@bob"]]);
        let source = StubPollSource { answers: vec![answer(1, "Alice", None, &[0])] };
        let engine = engine(&backend, source, &dir)?;
        let snapshots = SnapshotStore::new(&dir.join("snapshots"))?;
        let mut previous = VoteSnapshot::new("555");
        previous.voters.insert(VoterId(1), voter("Alice", None, &[Weekday::Tuesday]));
        previous
            .voters
            .insert(VoterId(2), voter("Bob", Some("@bob"), &[Weekday::Tuesday]));
        snapshots.save(&previous)?;
        let attendance_before = backend.rows(ATTENDANCE_SHEET);

        let outcome = engine.run_pass()?;

        assert!(outcome.has_changes);
        assert!(!outcome.applied);
        assert_eq!(backend.rows(ATTENDANCE_SHEET), attendance_before);
        let history = HistoryLog::new(&dir.join("history"))?.false_positive_history()?;
        assert_eq!(history.entries.len(), 1);
        assert_eq!(history.entries[0].1, ChangeShape { added: 0, removed: 1 });
        // The stale snapshot stays so the next pass re-evaluates the change.
        assert_eq!(snapshots.load("555")?, Some(previous));

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn removal_deletes_the_matching_row_only_once() -> Result<()> {
        let dir = temp_dir("teamsync-removal");
        let backend = MemoryBackend::new();
        seed_attendance(
            &backend,
            &[&["tuesday"], &["Alice", ""], &["Bob", "@bob"], &["friday"], &["Bob", "@bob"]],
        );
        let engine = engine(&backend, StubPollSource::default(), &dir)?;
        let bob = voter("Bob", Some("@bob"), &[Weekday::Tuesday]);

        assert!(engine.apply_removal(Weekday::Tuesday, &bob)?);
        assert!(!engine.apply_removal(Weekday::Tuesday, &bob)?);

        let rows = backend.rows(ATTENDANCE_SHEET);
        // The friday copy is untouched.
        assert_eq!(rows[3], vec!["Bob".to_string(), "@bob".to_string()]);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn addition_fills_the_first_blank_row_in_the_block() -> Result<()> {
        let dir = temp_dir("teamsync-blank");
        let backend = MemoryBackend::new();
        seed_attendance(&backend, &[&["tuesday"], &["", ""], &["Alice", ""], &["friday"]]);
        let engine = engine(&backend, StubPollSource::default(), &dir)?;
        let bob = voter("Bob", Some("@bob"), &[Weekday::Tuesday]);

        assert!(engine.apply_addition(Weekday::Tuesday, &bob)?);

        let rows = backend.rows(ATTENDANCE_SHEET);
        assert_eq!(rows[1], vec!["Bob".to_string(), "@bob".to_string()]);
        assert_eq!(rows.len(), 4);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn file_poll_source_treats_missing_file_as_empty() -> Result<()> {
        let dir = temp_dir("teamsync-source");
        let source = FilePollSource::new(&dir);
        assert!(source.recent_answers("555")?.is_empty());

        let answers = vec![answer(1, "Alice", None, &[0])];
        fs::write(dir.join("answers-555.json"), serde_json::to_string(&answers)?)?;
        assert_eq!(source.recent_answers("555")?, answers);

        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
