use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
}

/// Source of "now" for everything that stamps or ages rows. The store clock
/// runs at a fixed UTC offset, not the system-local zone.
pub trait Clock {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy)]
pub struct FixedOffsetClock {
    offset: UtcOffset,
}

impl FixedOffsetClock {
    #[must_use]
    pub const fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn offset(&self) -> UtcOffset {
        self.offset
    }
}

impl Clock for FixedOffsetClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

/// Format one row timestamp with the fixed sheet format (`DD.MM.YYYY HH:MM:SS`).
///
/// # Errors
/// Returns [`CoreError::Timestamp`] when the value cannot be formatted.
pub fn format_row_time(value: OffsetDateTime) -> Result<String, CoreError> {
    value
        .format(format_description!("[day].[month].[year] [hour]:[minute]:[second]"))
        .map_err(|err| CoreError::Timestamp(err.to_string()))
}

/// Parse one row timestamp written with [`format_row_time`], assuming the
/// store's fixed offset.
///
/// # Errors
/// Returns [`CoreError::Timestamp`] when the cell does not match the format.
pub fn parse_row_time(value: &str, offset: UtcOffset) -> Result<OffsetDateTime, CoreError> {
    PrimitiveDateTime::parse(
        value.trim(),
        format_description!("[day].[month].[year] [hour]:[minute]:[second]"),
    )
    .map(|parsed| parsed.assume_offset(offset))
    .map_err(|err| CoreError::Timestamp(err.to_string()))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    GameResult,
    Birthday,
    VotingPoll,
    TrainingPoll,
    Team,
    Competition,
    Fallback,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GameResult => "game_result",
            Self::Birthday => "birthday",
            Self::VotingPoll => "voting_poll",
            Self::TrainingPoll => "training_poll",
            Self::Team => "team",
            Self::Competition => "competition",
            Self::Fallback => "fallback",
        }
    }

    /// Parse a kind cell, accepting the legacy spellings that survive in
    /// human-edited sheets.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "game_result" | "game" | "result" => Some(Self::GameResult),
            "birthday" | "bday" => Some(Self::Birthday),
            "voting_poll" | "voting" | "poll" => Some(Self::VotingPoll),
            "training_poll" | "training" => Some(Self::TrainingPoll),
            "team" | "club" => Some(Self::Team),
            "competition" | "comp" | "league" => Some(Self::Competition),
            "fallback" | "fallback_source" => Some(Self::Fallback),
            _ => None,
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deterministic dedup key: `kind:identifier[:qualifier]*`. Empty qualifiers
/// are dropped so a missing optional field never changes the key shape.
#[must_use]
pub fn unique_key(kind: RecordKind, identifier: &str, qualifiers: &[&str]) -> String {
    let mut key = format!("{}:{}", kind.as_str(), identifier.trim());
    for qualifier in qualifiers {
        let qualifier = qualifier.trim();
        if !qualifier.is_empty() {
            key.push(':');
            key.push_str(qualifier);
        }
    }
    key
}

/// The ten typed payload columns of a record row, all optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordPayload {
    pub text: Option<String>,
    pub link: Option<String>,
    pub game_id: Option<i64>,
    pub season_id: Option<i64>,
    pub team_id: Option<i64>,
    pub opponent_id: Option<i64>,
    pub game_date: Option<String>,
    pub game_time: Option<String>,
    pub arena: Option<String>,
    pub poll_id: Option<String>,
    pub topic_id: Option<i64>,
    pub extra: Option<serde_json::Value>,
}

/// One typed, keyed row of the record sheet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub kind: RecordKind,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub unique_key: String,
    pub status: String,
    #[serde(flatten)]
    pub payload: RecordPayload,
}

pub const STATUS_ACTIVE: &str = "active";

// ---------------------------------------------------------------------------
// Configuration entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamEntry {
    pub id: i64,
    pub name: String,
    pub alt_name: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VotingPollTemplate {
    pub poll_key: String,
    /// Question template with bracketed placeholders, e.g. `Training [weekday]?`.
    pub question: String,
    pub options: Vec<String>,
    pub weekdays: BTreeSet<Weekday>,
    pub anonymous: bool,
    pub multiple_choice: bool,
    pub open_hours: Option<i64>,
    pub close_date: Option<String>,
    pub topic_id: Option<i64>,
}

impl VotingPollTemplate {
    #[must_use]
    pub fn new(poll_key: &str) -> Self {
        Self {
            poll_key: poll_key.to_string(),
            question: String::new(),
            options: Vec::new(),
            weekdays: BTreeSet::new(),
            anonymous: false,
            multiple_choice: true,
            open_hours: None,
            close_date: None,
            topic_id: None,
        }
    }

    /// Map a chosen option index onto a weekday: first by a weekday token in
    /// the option text, else positionally onto the eligible set in order.
    #[must_use]
    pub fn weekday_for_option(&self, index: usize) -> Option<Weekday> {
        if let Some(option) = self.options.get(index) {
            if let Some(day) = Weekday::find_in(option) {
                return Some(day);
            }
        }
        self.weekdays.iter().nth(index).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutomationTopic {
    pub name: String,
    pub topic_id: i64,
    pub anonymous: bool,
    pub multiple_choice: bool,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FullConfig {
    pub comp_ids: Vec<i64>,
    pub team_ids: Vec<i64>,
    pub teams: Vec<TeamEntry>,
    pub training_polls: Vec<String>,
    pub fallback_sources: Vec<String>,
    pub voting_polls: BTreeMap<String, VotingPollTemplate>,
    pub automation_topics: BTreeMap<String, AutomationTopic>,
}

/// Parse a boolean cell permissively. Humans edit these.
#[must_use]
pub fn parse_flexible_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "n" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

#[must_use]
pub fn parse_flexible_i64(value: &str) -> Option<i64> {
    value.trim().parse::<i64>().ok()
}

// ---------------------------------------------------------------------------
// Weekdays
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    pub const ALL: [Self; 7] = [
        Self::Monday,
        Self::Tuesday,
        Self::Wednesday,
        Self::Thursday,
        Self::Friday,
        Self::Saturday,
        Self::Sunday,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monday => "monday",
            Self::Tuesday => "tuesday",
            Self::Wednesday => "wednesday",
            Self::Thursday => "thursday",
            Self::Friday => "friday",
            Self::Saturday => "saturday",
            Self::Sunday => "sunday",
        }
    }

    /// Parse one weekday token, accepting common abbreviations.
    #[must_use]
    pub fn parse_token(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "monday" | "mon" | "mo" => Some(Self::Monday),
            "tuesday" | "tues" | "tue" | "tu" => Some(Self::Tuesday),
            "wednesday" | "wed" | "we" => Some(Self::Wednesday),
            "thursday" | "thurs" | "thur" | "thu" | "th" => Some(Self::Thursday),
            "friday" | "fri" | "fr" => Some(Self::Friday),
            "saturday" | "sat" | "sa" => Some(Self::Saturday),
            "sunday" | "sun" | "su" => Some(Self::Sunday),
            _ => None,
        }
    }

    /// First weekday token found in free text, if any.
    #[must_use]
    pub fn find_in(text: &str) -> Option<Self> {
        text.split(|ch: char| !ch.is_ascii_alphanumeric()).find_map(Self::parse_token)
    }
}

impl Display for Weekday {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parse a delimited weekday cell (`"tue, fri"`) into a set. Unknown tokens
/// are ignored rather than rejected.
#[must_use]
pub fn parse_weekday_set(value: &str) -> BTreeSet<Weekday> {
    value
        .split(|ch: char| matches!(ch, ',' | ';' | '/' | ' ' | '\t'))
        .filter_map(Weekday::parse_token)
        .collect()
}

// ---------------------------------------------------------------------------
// Vote snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VoterId(pub i64);

impl Display for VoterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoterEntry {
    pub display_name: String,
    pub handle: Option<String>,
    pub choices: BTreeSet<Weekday>,
    /// Source-side revision marker for the voter's latest answer event.
    pub revision: i64,
}

/// Full voter→choice mapping of one poll at one point in time. Persisted as
/// "previous" between passes and always replaced wholesale, never merged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteSnapshot {
    pub poll_id: String,
    pub voters: BTreeMap<VoterId, VoterEntry>,
}

impl VoteSnapshot {
    #[must_use]
    pub fn new(poll_id: &str) -> Self {
        Self { poll_id: poll_id.to_string(), voters: BTreeMap::new() }
    }

    /// Validate voter entries before the snapshot is diffed or persisted.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when a voter has neither a display
    /// name nor a handle to match presentation rows against.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (voter_id, entry) in &self.voters {
            let has_handle =
                entry.handle.as_deref().is_some_and(|handle| !handle.trim().is_empty());
            if entry.display_name.trim().is_empty() && !has_handle {
                return Err(CoreError::Validation(format!(
                    "voter {voter_id} has neither display name nor handle"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn voters_for(&self, day: Weekday) -> BTreeSet<VoterId> {
        self.voters
            .iter()
            .filter(|(_, entry)| entry.choices.contains(&day))
            .map(|(voter_id, _)| *voter_id)
            .collect()
    }

    #[must_use]
    pub fn days(&self) -> BTreeSet<Weekday> {
        self.voters.values().flat_map(|entry| entry.choices.iter().copied()).collect()
    }

    /// Structural fingerprint: total voter count plus the sorted voter-id set
    /// of every weekday. Order independent; names and revisions excluded so
    /// cosmetic edits never register as a vote change.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("voters={};", self.voters.len()));
        for day in Weekday::ALL {
            let ids = self.voters_for(day);
            if ids.is_empty() {
                continue;
            }
            hasher.update(day.as_str());
            hasher.update(":");
            for voter_id in ids {
                hasher.update(format!("{voter_id},"));
            }
            hasher.update(";");
        }
        let digest = hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Change detection
// ---------------------------------------------------------------------------

/// Confidence weights. Removals weigh more than additions: spurious
/// "removal" reads are the dominant failure mode of the noisy poll source.
pub const ADDITION_WEIGHT: f32 = 0.15;
pub const ADDITION_CAP: f32 = 0.45;
pub const REMOVAL_WEIGHT: f32 = 0.25;
pub const REMOVAL_CAP: f32 = 0.50;
/// Reward for touching more than one weekday at once; bulk updates are more
/// likely genuine than single-cell noise.
pub const MULTI_DAY_BONUS: f32 = 0.20;
/// Penalty for the two empirically most common false-positive shapes:
/// exactly one addition or exactly one removal with nothing else.
pub const SMALL_CHANGE_PENALTY: f32 = 0.25;

/// At or above this, a change is applied unconditionally.
pub const ACCEPT_CONFIDENCE: f32 = 0.7;
/// Below this, a change is treated as a likely false positive.
pub const SUSPECT_CONFIDENCE: f32 = 0.5;

pub const FALSE_POSITIVE_WINDOW_DAYS: i64 = 3;
pub const FALSE_POSITIVE_NOISE_LIMIT: usize = 5;
pub const HISTORY_RETENTION_DAYS: i64 = 30;

/// Per-weekday additions and removals between two snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryDelta {
    pub added: BTreeSet<VoterId>,
    pub removed: BTreeSet<VoterId>,
}

impl CategoryDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The (added, removed) totals of a change, counted per weekday entry. The
/// same voter appearing on two weekdays counts twice; the false-positive
/// shape lookup works on these totals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChangeShape {
    pub added: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeSet {
    pub poll_id: String,
    pub has_changes: bool,
    pub per_day: BTreeMap<Weekday, CategoryDelta>,
    pub added: BTreeSet<VoterId>,
    pub removed: BTreeSet<VoterId>,
    pub confidence: f32,
    pub is_likely_false_positive: bool,
}

impl ChangeSet {
    #[must_use]
    pub fn unchanged(poll_id: &str) -> Self {
        Self {
            poll_id: poll_id.to_string(),
            has_changes: false,
            per_day: BTreeMap::new(),
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
            confidence: 0.0,
            is_likely_false_positive: false,
        }
    }

    #[must_use]
    pub fn shape(&self) -> ChangeShape {
        let added = self.per_day.values().map(|delta| delta.added.len()).sum();
        let removed = self.per_day.values().map(|delta| delta.removed.len()).sum();
        ChangeShape { added, removed }
    }

    #[must_use]
    pub fn days_touched(&self) -> usize {
        self.per_day.values().filter(|delta| !delta.is_empty()).count()
    }
}

/// Bounded window of previously logged false positives, as (day, shape)
/// pairs. Built by the history log, consumed by the detector.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FalsePositiveHistory {
    pub entries: Vec<(Date, ChangeShape)>,
}

impl FalsePositiveHistory {
    #[must_use]
    pub fn count_since(&self, cutoff: Date) -> usize {
        self.entries.iter().filter(|(day, _)| *day >= cutoff).count()
    }

    #[must_use]
    pub fn contains_shape_since(&self, shape: ChangeShape, cutoff: Date) -> bool {
        self.entries.iter().any(|(day, logged)| *day >= cutoff && *logged == shape)
    }
}

/// Heuristic confidence in [0, 1] that a detected change is genuine. Kept as
/// a named pure function so the weights can be retuned without touching the
/// gate or the apply logic.
#[must_use]
pub fn confidence(shape: ChangeShape, days_touched: usize) -> f32 {
    let additions = (shape.added as f32 * ADDITION_WEIGHT).min(ADDITION_CAP);
    let removals = (shape.removed as f32 * REMOVAL_WEIGHT).min(REMOVAL_CAP);
    let bonus = if days_touched > 1 { MULTI_DAY_BONUS } else { 0.0 };
    let penalty = if matches!(
        shape,
        ChangeShape { added: 1, removed: 0 } | ChangeShape { added: 0, removed: 1 }
    ) {
        SMALL_CHANGE_PENALTY
    } else {
        0.0
    };
    (additions + removals + bonus - penalty).clamp(0.0, 1.0)
}

/// A change is suspect when its confidence is low, when the recent window is
/// already full of false positives (systemic noise), or when its exact shape
/// was recently logged as a false positive.
#[must_use]
pub fn is_likely_false_positive(
    score: f32,
    shape: ChangeShape,
    history: &FalsePositiveHistory,
    today: Date,
) -> bool {
    let cutoff = today - Duration::days(FALSE_POSITIVE_WINDOW_DAYS);
    score < SUSPECT_CONFIDENCE
        || history.count_since(cutoff) > FALSE_POSITIVE_NOISE_LIMIT
        || history.contains_shape_since(shape, cutoff)
}

/// Diff two snapshots of the same poll into a scored change-set.
#[must_use]
pub fn detect_changes(
    old: &VoteSnapshot,
    new: &VoteSnapshot,
    history: &FalsePositiveHistory,
    today: Date,
) -> ChangeSet {
    if old.fingerprint() == new.fingerprint() {
        return ChangeSet::unchanged(&new.poll_id);
    }

    let mut per_day: BTreeMap<Weekday, CategoryDelta> = BTreeMap::new();
    let mut added_global = BTreeSet::new();
    let mut removed_global = BTreeSet::new();
    let mut days = old.days();
    days.extend(new.days());

    for day in days {
        let old_ids = old.voters_for(day);
        let new_ids = new.voters_for(day);
        let delta = CategoryDelta {
            added: new_ids.difference(&old_ids).copied().collect(),
            removed: old_ids.difference(&new_ids).copied().collect(),
        };
        if delta.is_empty() {
            continue;
        }
        added_global.extend(delta.added.iter().copied());
        removed_global.extend(delta.removed.iter().copied());
        per_day.insert(day, delta);
    }

    if per_day.is_empty() {
        // Fingerprints differed but no weekday membership moved (e.g. a voter
        // with an empty choice set appeared). Nothing to apply.
        return ChangeSet::unchanged(&new.poll_id);
    }

    let mut changes = ChangeSet {
        poll_id: new.poll_id.clone(),
        has_changes: true,
        per_day,
        added: added_global,
        removed: removed_global,
        confidence: 0.0,
        is_likely_false_positive: false,
    };
    let shape = changes.shape();
    changes.confidence = confidence(shape, changes.days_touched());
    changes.is_likely_false_positive =
        is_likely_false_positive(changes.confidence, shape, history, today);
    changes
}

/// The decision gate. High-confidence changes pass unconditionally;
/// medium-confidence changes need corroboration by breadth or volume.
#[must_use]
pub fn should_apply_changes(changes: &ChangeSet) -> bool {
    if !changes.has_changes || changes.is_likely_false_positive {
        return false;
    }
    if changes.confidence >= ACCEPT_CONFIDENCE {
        return true;
    }
    if changes.confidence >= SUSPECT_CONFIDENCE {
        let shape = changes.shape();
        return changes.days_touched() > 1 || shape.added + shape.removed > 2;
    }
    false
}
