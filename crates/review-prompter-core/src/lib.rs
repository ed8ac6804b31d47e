use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};

/// Prefix shared by every condition key; listing keys under it enumerates registrations.
pub const CONDITION_KEY_PREFIX: &str = "event_tracker.condition.";
const COUNT_KEY_PREFIX: &str = "event_tracker.count.";

/// Fixed key holding the ordered list of successful prompt request dates.
pub const PROMPT_DATES_KEY: &str = "review_prompter.prompt_dates";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TrackerError {
    #[error("invalid condition {condition} for event `{identifier}`: condition MUST be >= 1")]
    InvalidCondition { identifier: String, condition: u32 },
    #[error("event `{0}` is not registered")]
    UnregisteredIdentifier(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("validation error: {0}")]
    Validation(String),
}

fn persistence_error(context: &str, err: &anyhow::Error) -> TrackerError {
    TrackerError::Persistence(format!("{context}: {err:#}"))
}

/// A value held by a [`KeyValueStore`].
///
/// Absence of a key is distinct from `Integer(0)` or an empty `Timestamps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Integer(i64),
    Timestamps(Vec<OffsetDateTime>),
}

impl StoredValue {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Timestamps(_) => "timestamps",
        }
    }

    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Timestamps(_) => None,
        }
    }

    #[must_use]
    pub fn as_timestamps(&self) -> Option<&[OffsetDateTime]> {
        match self {
            Self::Timestamps(values) => Some(values),
            Self::Integer(_) => None,
        }
    }
}

/// Durable key-value capability backing counters, conditions and prompt history.
///
/// Implementations make no atomicity promise across a read-modify-write
/// sequence; callers sharing a store across threads must serialize access.
pub trait KeyValueStore {
    #[allow(clippy::missing_errors_doc)]
    fn get(&self, key: &str) -> anyhow::Result<Option<StoredValue>>;

    #[allow(clippy::missing_errors_doc)]
    fn set(&mut self, key: &str, value: StoredValue) -> anyhow::Result<()>;

    /// Removing a missing key is not an error.
    #[allow(clippy::missing_errors_doc)]
    fn remove(&mut self, key: &str) -> anyhow::Result<()>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for &mut S {
    fn get(&self, key: &str) -> anyhow::Result<Option<StoredValue>> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: StoredValue) -> anyhow::Result<()> {
        (**self).set(key, value)
    }

    fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        (**self).remove(key)
    }
}

/// Process-local store, mostly useful for tests and ephemeral hosts.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    entries: BTreeMap<String, StoredValue>,
    fail_reads: bool,
    fail_writes: bool,
    write_budget: Option<usize>,
    failing_keys: BTreeSet<String>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `get` fail until cleared.
    pub fn set_fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    /// Makes every subsequent `set`/`remove` fail. Passing `false` also clears
    /// [`InMemoryStore::fail_writes_after`] and [`InMemoryStore::fail_writes_for_key`].
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
        if !fail {
            self.write_budget = None;
            self.failing_keys.clear();
        }
    }

    /// Lets `successful_writes` more writes through, then fails the rest.
    pub fn fail_writes_after(&mut self, successful_writes: usize) {
        self.write_budget = Some(successful_writes);
    }

    /// Fails writes to `key` only.
    pub fn fail_writes_for_key(&mut self, key: &str) {
        self.failing_keys.insert(key.to_string());
    }

    fn check_write(&mut self, key: &str) -> anyhow::Result<()> {
        if self.fail_writes || self.failing_keys.contains(key) {
            return Err(anyhow!("injected write failure for key {key}"));
        }
        if let Some(remaining) = self.write_budget.as_mut() {
            if *remaining == 0 {
                return Err(anyhow!("injected write failure for key {key}"));
            }
            *remaining -= 1;
        }
        Ok(())
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<StoredValue>> {
        if self.fail_reads {
            return Err(anyhow!("injected read failure for key {key}"));
        }
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: StoredValue) -> anyhow::Result<()> {
        self.check_write(key)?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        self.check_write(key)?;
        self.entries.remove(key);
        Ok(())
    }
}

pub trait Clock {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        now_utc()
    }
}

/// Clock pinned to a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock(pub OffsetDateTime);

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}

/// The externally visible effect requested when the gate opens.
///
/// The environment may decline silently; the gate only records that it asked.
pub trait TriggerAction {
    fn trigger(&mut self);
}

impl<F: FnMut()> TriggerAction for F {
    fn trigger(&mut self) {
        (self)();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventRecord {
    pub identifier: String,
    pub condition: u32,
    pub count: u64,
}

impl EventRecord {
    #[must_use]
    pub fn has_met_condition(&self) -> bool {
        self.count >= u64::from(self.condition)
    }
}

#[must_use]
pub fn condition_key(identifier: &str) -> String {
    format!("{CONDITION_KEY_PREFIX}{identifier}")
}

#[must_use]
pub fn count_key(identifier: &str) -> String {
    format!("{COUNT_KEY_PREFIX}{identifier}")
}

/// Recovers the identifier from a condition key, if `key` is one.
#[must_use]
pub fn identifier_from_condition_key(key: &str) -> Option<&str> {
    key.strip_prefix(CONDITION_KEY_PREFIX)
}

/// Per-identifier event counters with registration thresholds.
pub struct EventCounterStore<S> {
    store: S,
}

impl<S: KeyValueStore> EventCounterStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    /// Starts tracking `identifier`, replacing any previous registration and
    /// resetting its count to zero.
    ///
    /// When the condition write fails the previous count is put back, so a
    /// failed registration leaves the old one as it was (restoring is best
    /// effort and only logged if it fails too).
    ///
    /// # Errors
    /// Returns [`TrackerError::InvalidCondition`] when `condition` is zero and
    /// [`TrackerError::Persistence`] when the store rejects a read or write.
    pub fn register(&mut self, identifier: &str, condition: u32) -> Result<(), TrackerError> {
        if condition == 0 {
            return Err(TrackerError::InvalidCondition {
                identifier: identifier.to_string(),
                condition,
            });
        }

        let key = count_key(identifier);
        let previous_count = self
            .store
            .get(&key)
            .map_err(|err| persistence_error("failed to read event count", &err))?;
        self.store
            .set(&key, StoredValue::Integer(0))
            .map_err(|err| persistence_error("failed to reset event count", &err))?;
        if let Err(err) = self.store.set(
            &condition_key(identifier),
            StoredValue::Integer(i64::from(condition)),
        ) {
            let restored = match previous_count {
                Some(value) => self.store.set(&key, value),
                None => self.store.remove(&key),
            };
            if let Err(restore_err) = restored {
                let error = format!("{restore_err:#}");
                warn!(identifier, %error, "failed to restore event count");
            }
            return Err(persistence_error("failed to store event condition", &err));
        }

        debug!(identifier, condition, "registered event");
        Ok(())
    }

    /// Adds one to the stored count.
    ///
    /// # Errors
    /// Returns [`TrackerError::UnregisteredIdentifier`] when `identifier` has no
    /// registration and [`TrackerError::Persistence`] on store failures.
    pub fn increment(&mut self, identifier: &str) -> Result<u64, TrackerError> {
        self.require_registered(identifier)?;
        let next = self.load_count(identifier)?.saturating_add(1);
        self.write_count(identifier, next)?;
        debug!(identifier, count = next, "increased event count");
        Ok(next)
    }

    /// # Errors
    /// Same as [`EventCounterStore::increment`].
    pub fn reset(&mut self, identifier: &str) -> Result<(), TrackerError> {
        self.require_registered(identifier)?;
        self.write_count(identifier, 0)?;
        debug!(identifier, "reset event count");
        Ok(())
    }

    /// Forgets both the count and the condition. Unknown identifiers are a no-op.
    ///
    /// # Errors
    /// Returns [`TrackerError::Persistence`] when the store rejects a removal.
    pub fn stop_tracking(&mut self, identifier: &str) -> Result<(), TrackerError> {
        self.store
            .remove(&condition_key(identifier))
            .map_err(|err| persistence_error("failed to remove event condition", &err))?;
        self.store
            .remove(&count_key(identifier))
            .map_err(|err| persistence_error("failed to remove event count", &err))?;
        debug!(identifier, "stopped tracking event");
        Ok(())
    }

    /// Stored count, or `0` when unregistered or unreadable.
    pub fn count(&self, identifier: &str) -> u64 {
        match self.load_count(identifier) {
            Ok(count) => count,
            Err(err) => {
                warn!(identifier, error = %err, "event count unreadable; reporting 0");
                0
            }
        }
    }

    /// `true` iff the identifier is registered and `count >= condition`.
    pub fn has_met_condition(&self, identifier: &str) -> bool {
        match self.record(identifier) {
            Ok(Some(record)) => record.has_met_condition(),
            Ok(None) => false,
            Err(err) => {
                warn!(identifier, error = %err, "event record unreadable; condition not met");
                false
            }
        }
    }

    /// # Errors
    /// Returns [`TrackerError::Persistence`] when stored values cannot be read
    /// or decoded.
    pub fn record(&self, identifier: &str) -> Result<Option<EventRecord>, TrackerError> {
        let Some(condition) = self.load_condition(identifier)? else {
            return Ok(None);
        };
        Ok(Some(EventRecord {
            identifier: identifier.to_string(),
            condition,
            count: self.load_count(identifier)?,
        }))
    }

    fn require_registered(&self, identifier: &str) -> Result<u32, TrackerError> {
        self.load_condition(identifier)?
            .ok_or_else(|| TrackerError::UnregisteredIdentifier(identifier.to_string()))
    }

    fn load_condition(&self, identifier: &str) -> Result<Option<u32>, TrackerError> {
        let key = condition_key(identifier);
        let Some(value) = self
            .store
            .get(&key)
            .map_err(|err| persistence_error("failed to read event condition", &err))?
        else {
            return Ok(None);
        };

        let raw = value.as_integer().ok_or_else(|| {
            TrackerError::Persistence(format!(
                "corrupt value at {key}: expected integer, found {}",
                value.kind()
            ))
        })?;
        match u32::try_from(raw) {
            Ok(condition) if condition > 0 => Ok(Some(condition)),
            _ => Err(TrackerError::Persistence(format!(
                "corrupt condition at {key}: {raw}"
            ))),
        }
    }

    fn load_count(&self, identifier: &str) -> Result<u64, TrackerError> {
        let key = count_key(identifier);
        let Some(value) = self
            .store
            .get(&key)
            .map_err(|err| persistence_error("failed to read event count", &err))?
        else {
            return Ok(0);
        };

        let raw = value.as_integer().ok_or_else(|| {
            TrackerError::Persistence(format!(
                "corrupt value at {key}: expected integer, found {}",
                value.kind()
            ))
        })?;
        u64::try_from(raw)
            .map_err(|_| TrackerError::Persistence(format!("corrupt count at {key}: {raw}")))
    }

    fn write_count(&mut self, identifier: &str, count: u64) -> Result<(), TrackerError> {
        let stored = i64::try_from(count).map_err(|_| {
            TrackerError::Persistence(format!("event count for `{identifier}` overflows storage"))
        })?;
        self.store
            .set(&count_key(identifier), StoredValue::Integer(stored))
            .map_err(|err| persistence_error("failed to write event count", &err))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    pub minimum_interval_seconds: i64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            minimum_interval_seconds: 86_400,
        }
    }
}

impl GateConfig {
    /// # Errors
    /// Returns [`TrackerError::Configuration`] for a negative interval.
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.minimum_interval_seconds < 0 {
            return Err(TrackerError::Configuration(
                "minimum_interval_seconds MUST be >= 0".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn minimum_interval(&self) -> Duration {
        Duration::seconds(self.minimum_interval_seconds)
    }

    /// Decodes and validates a gate configuration from JSON.
    ///
    /// # Errors
    /// Returns [`TrackerError::Configuration`] when JSON decoding fails or the
    /// decoded values are out of bounds.
    pub fn from_json(value: &Value) -> Result<Self, TrackerError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            TrackerError::Configuration(format!("invalid gate config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PromptOutcome {
    ThresholdNotMet,
    Triggered,
    DeniedByCooldown,
}

impl PromptOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ThresholdNotMet => "threshold_not_met",
            Self::Triggered => "triggered",
            Self::DeniedByCooldown => "denied_by_cooldown",
        }
    }

    /// Whether the trigger action was requested.
    #[must_use]
    pub fn triggered(self) -> bool {
        matches!(self, Self::Triggered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownStatus {
    pub permitted: bool,
    pub now: OffsetDateTime,
    pub last_prompt_at: Option<OffsetDateTime>,
    /// Signed; negative when the clock reads earlier than the last prompt.
    pub elapsed: Option<Duration>,
    pub minimum_interval: Duration,
}

/// Decides whether a prompt may be requested at `now`.
///
/// An empty history always permits. Elapsed time is never clamped, so a last
/// prompt in the future denies.
#[must_use]
pub fn evaluate_cooldown(
    last_prompt_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
    minimum_interval: Duration,
) -> CooldownStatus {
    let elapsed = last_prompt_at.map(|last| now - last);
    let permitted = match elapsed {
        None => true,
        Some(elapsed) => elapsed >= minimum_interval,
    };

    CooldownStatus {
        permitted,
        now,
        last_prompt_at,
        elapsed,
        minimum_interval,
    }
}

/// Cooldown-gated review prompting on top of an [`EventCounterStore`].
pub struct PromptGate<S, C, A> {
    counters: EventCounterStore<S>,
    clock: C,
    action: A,
    minimum_interval: Duration,
}

impl<S: KeyValueStore, C: Clock, A: TriggerAction> PromptGate<S, C, A> {
    /// # Errors
    /// Returns [`TrackerError::Configuration`] for a negative interval.
    pub fn new(
        counters: EventCounterStore<S>,
        minimum_interval: Duration,
        clock: C,
        action: A,
    ) -> Result<Self, TrackerError> {
        if minimum_interval.is_negative() {
            return Err(TrackerError::Configuration(
                "minimum prompt interval MUST NOT be negative".to_string(),
            ));
        }

        Ok(Self {
            counters,
            clock,
            action,
            minimum_interval,
        })
    }

    /// # Errors
    /// Returns [`TrackerError::Configuration`] when `config` is invalid.
    pub fn from_config(
        counters: EventCounterStore<S>,
        config: &GateConfig,
        clock: C,
        action: A,
    ) -> Result<Self, TrackerError> {
        config.validate()?;
        Self::new(counters, config.minimum_interval(), clock, action)
    }

    #[must_use]
    pub fn minimum_interval(&self) -> Duration {
        self.minimum_interval
    }

    pub fn counters(&self) -> &EventCounterStore<S> {
        &self.counters
    }

    pub fn counters_mut(&mut self) -> &mut EventCounterStore<S> {
        &mut self.counters
    }

    pub fn into_counters(self) -> EventCounterStore<S> {
        self.counters
    }

    /// Dates of every successful prompt request, oldest first.
    ///
    /// # Errors
    /// Returns [`TrackerError::Persistence`] when history cannot be read or
    /// holds a non-timestamp value.
    pub fn history(&self) -> Result<Vec<OffsetDateTime>, TrackerError> {
        let Some(value) = self
            .counters
            .store()
            .get(PROMPT_DATES_KEY)
            .map_err(|err| persistence_error("failed to read prompt history", &err))?
        else {
            return Ok(Vec::new());
        };

        match value {
            StoredValue::Timestamps(dates) => Ok(dates),
            StoredValue::Integer(_) => Err(TrackerError::Persistence(format!(
                "corrupt value at {PROMPT_DATES_KEY}: expected timestamps, found integer"
            ))),
        }
    }

    /// # Errors
    /// Same as [`PromptGate::history`].
    pub fn last_prompt_at(&self) -> Result<Option<OffsetDateTime>, TrackerError> {
        Ok(self.history()?.last().copied())
    }

    /// Evaluates the cooldown without requesting anything.
    ///
    /// # Errors
    /// Same as [`PromptGate::history`].
    pub fn cooldown_status(&self) -> Result<CooldownStatus, TrackerError> {
        let last = self.last_prompt_at()?;
        Ok(evaluate_cooldown(last, self.clock.now(), self.minimum_interval))
    }

    /// Requests the trigger action if the cooldown allows, ignoring counters.
    ///
    /// Returns whether the action was requested. Unreadable or corrupt
    /// history counts as empty, and the append after the action replaces it.
    /// A failed append is logged and still reported as `true`.
    pub fn request_trigger(&mut self) -> bool {
        let now = self.clock.now();
        let mut history = match self.history() {
            Ok(history) => history,
            Err(err) => {
                warn!(error = %err, "prompt history unreadable; treating it as empty");
                Vec::new()
            }
        };

        let status = evaluate_cooldown(history.last().copied(), now, self.minimum_interval);
        let elapsed_seconds = status.elapsed.map(|elapsed| elapsed.as_seconds_f64());
        let minimum_interval_seconds = self.minimum_interval.as_seconds_f64();
        if !status.permitted {
            info!(
                ?elapsed_seconds,
                minimum_interval_seconds, "will not request review prompt"
            );
            return false;
        }

        info!(
            ?elapsed_seconds,
            minimum_interval_seconds, "requesting review prompt"
        );
        self.action.trigger();

        history.push(now);
        if let Err(err) = self
            .counters
            .store_mut()
            .set(PROMPT_DATES_KEY, StoredValue::Timestamps(history))
        {
            let error = format!("{err:#}");
            warn!(%error, "failed to record review prompt date");
        }
        true
    }

    /// Increments `identifier` and, once its condition is met, requests the
    /// trigger action and resets the count on success.
    ///
    /// # Errors
    /// Propagates errors from [`EventCounterStore::increment`] and
    /// [`EventCounterStore::reset`].
    pub fn increment_and_maybe_trigger(
        &mut self,
        identifier: &str,
    ) -> Result<PromptOutcome, TrackerError> {
        self.counters.increment(identifier)?;
        if !self.counters.has_met_condition(identifier) {
            return Ok(PromptOutcome::ThresholdNotMet);
        }

        if !self.request_trigger() {
            return Ok(PromptOutcome::DeniedByCooldown);
        }

        self.counters.reset(identifier)?;
        Ok(PromptOutcome::Triggered)
    }

    /// Deletes every stored prompt date. Store failures are only logged.
    pub fn clear_history(&mut self) {
        if let Err(err) = self.counters.store_mut().remove(PROMPT_DATES_KEY) {
            let error = format!("{err:#}");
            warn!(%error, "failed to delete prompt history");
            return;
        }
        debug!("deleted prompt history");
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`TrackerError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, TrackerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| TrackerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(TrackerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`TrackerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, TrackerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            TrackerError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
