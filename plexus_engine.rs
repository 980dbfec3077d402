//! # Plexus Engine - Telemetry Delivery Core
//!
//! The buffering, flush-scheduling, retry/backoff and crash-safe persistence
//! engine behind the Plexus telemetry client. It sits between "an application
//! queues a measurement" and "bytes successfully leave the device".
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              PLEXUS ENGINE                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  caller → SyncClient (optional) → Client ─┬─ MeasurementQueue               │
//! │                                           └─ flush: ring drain → serialize  │
//! │                                              → Transport (retry + backoff)  │
//! │                                              → PersistenceRing on failure   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Bounded**: fixed-capacity queue and payload buffer, allocated once
//! - **Cooperative**: no background thread, time-based flushing via [`Client::tick`]
//! - **Crash-safe**: failed payloads survive reboots in an integrity-checked ring
//! - **Wraparound-safe**: every tick comparison uses signed wrapping arithmetic
//!
//! The engine never talks to the network or to flash itself. Platforms plug in a
//! [`Transport`], a [`Clock`] and optionally a [`Storage`] through [`Hal`].

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::io::{self, Write};
use std::mem::{self, MaybeUninit};
use std::ops::DerefMut;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Concurrency Primitives - Parking Lot
// ----------------------------------------------------------------------------
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::ser::{SerializeMap, SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::ser::{CharEscape, CompactFormatter, Formatter as JsonFormatter};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::{format_compact, CompactString};
use heapless::String as InlineString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, prelude::*, EnvFilter};

// ----------------------------------------------------------------------------
// Time
// ----------------------------------------------------------------------------
use chrono::Utc;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::providers::{Env, Format, Toml};
use figment::Figment;

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults and hard limits. Every default is also a configuration field in
// SECTION 5; the hard limits size inline storage and are not configurable.
// ============================================================================

/// SDK version - follows semantic versioning
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SDK_NAME: &str = "plexus-engine";

/// Value of the payload's top-level `"sdk"` field
pub const SDK_TAG: &str = concat!("rust/", env!("CARGO_PKG_VERSION"));

/// User-Agent sent with every ingest request
pub const USER_AGENT: &str = concat!("plexus-rust-sdk/", env!("CARGO_PKG_VERSION"));

// ----------------------------------------------------------------------------
// Queue & Buffer Sizes
// ----------------------------------------------------------------------------

/// Maximum measurements held in the live queue
pub const DEFAULT_MAX_METRICS: usize = 32;

/// Metric names must be strictly shorter than this
pub const DEFAULT_MAX_METRIC_NAME_LEN: usize = 64;

/// String values must be strictly shorter than this
pub const DEFAULT_MAX_STRING_VALUE_LEN: usize = 128;

/// Inline capacity of a measurement name. Configured limits may not exceed it.
pub const METRIC_NAME_CAPACITY: usize = 64;

/// Inline capacity of a string value. Configured limits may not exceed it.
pub const STRING_VALUE_CAPACITY: usize = 128;

/// Size of the serialized payload buffer (bytes)
pub const DEFAULT_JSON_BUFFER_SIZE: usize = 2048;

/// Smallest payload buffer accepted by configuration validation
pub const MIN_JSON_BUFFER_SIZE: usize = 64;

// ----------------------------------------------------------------------------
// Identity Limits
// ----------------------------------------------------------------------------

/// Source ids and session ids must be strictly shorter than this
pub const MAX_SOURCE_ID_LEN: usize = 64;

/// API keys must be strictly shorter than this
pub const MAX_API_KEY_LEN: usize = 128;

/// Endpoints must be strictly shorter than this
pub const MAX_ENDPOINT_LEN: usize = 256;

/// Maximum tags per measurement
pub const MAX_TAGS: usize = 4;

/// Tag keys and values must be strictly shorter than this
pub const MAX_TAG_LEN: usize = 32;

// ----------------------------------------------------------------------------
// Network & Timing
// ----------------------------------------------------------------------------

pub const DEFAULT_ENDPOINT: &str = "https://app.plexus.company/api/ingest";

/// Request timeout handed to transports (milliseconds)
pub const DEFAULT_HTTP_TIMEOUT_MS: u32 = 10_000;

/// Delivery attempts per flush
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// First retry delay (milliseconds)
pub const DEFAULT_RETRY_BASE_MS: u32 = 500;

/// Retry delay ceiling (milliseconds)
pub const DEFAULT_RETRY_MAX_MS: u32 = 8_000;

/// Queue length that triggers a flush from inside enqueue (0 disables)
pub const DEFAULT_AUTO_FLUSH_COUNT: usize = 16;

/// Time since the last successful flush that triggers a flush (0 disables)
pub const DEFAULT_AUTO_FLUSH_INTERVAL_MS: u32 = 5_000;

/// Window during which flushes are suppressed after a 429
pub const DEFAULT_RATE_LIMIT_COOLDOWN_MS: u32 = 30_000;

// ----------------------------------------------------------------------------
// Persistence
// ----------------------------------------------------------------------------

/// Number of slots in the persistence ring (0 disables persistence)
pub const DEFAULT_RING_CAPACITY: usize = 8;

/// Prefix of every storage key the ring writes
pub const DEFAULT_RING_NAMESPACE: &str = "plexus";

/// Maximum length of the ring namespace
pub const MAX_RING_NAMESPACE_LEN: usize = 32;

/// Integrity code + payload length prefix of a persisted batch
pub const BATCH_HEADER_LEN: usize = 8;

/// head + tail + count + integrity code
pub const RING_META_LEN: usize = 10;

// ----------------------------------------------------------------------------
// Wire Format
// ----------------------------------------------------------------------------

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const API_KEY_HEADER: &str = "x-api-key";

/// Integral values below this magnitude are rendered without a fraction
pub const INTEGER_RENDER_LIMIT: f64 = 1e15;

/// Returns the SDK version string.
pub fn version() -> &'static str {
    SDK_VERSION
}

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Measurements, their values and tags, plus the input validation shared by
// every enqueue path.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Metric Values
// ----------------------------------------------------------------------------

/// The value carried by a measurement.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// Floating point number. NaN and infinities go on the wire as `null`.
    Number(f64),
    /// Free-form text, stored inline
    String(StringValue),
    /// Boolean flag
    Bool(bool),
}

/// Measurement name storage
pub type MetricName = InlineString<METRIC_NAME_CAPACITY>;

/// String value storage
pub type StringValue = InlineString<STRING_VALUE_CAPACITY>;

/// Copy `s` into fixed-capacity storage. Overflow is `StringTooLong`.
fn inline_str<const N: usize>(s: &str) -> PlexusResult<InlineString<N>> {
    let mut out = InlineString::new();
    out.push_str(s).map_err(|()| PlexusError::StringTooLong)?;
    Ok(out)
}

impl MetricValue {
    /// Build a string value. Text longer than [`STRING_VALUE_CAPACITY`] is refused.
    pub fn text(value: &str) -> PlexusResult<Self> {
        inline_str(value).map(MetricValue::String)
    }

    /// Get as f64 if this is a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as string slice if this is a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetricValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get as bool if this is a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetricValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            MetricValue::Number(_) => "number",
            MetricValue::String(_) => "string",
            MetricValue::Bool(_) => "bool",
        }
    }
}

impl Serialize for MetricValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MetricValue::Number(v) => serializer.serialize_f64(*v),
            MetricValue::String(s) => serializer.serialize_str(s),
            MetricValue::Bool(b) => serializer.serialize_bool(*b),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

impl From<f32> for MetricValue {
    fn from(v: f32) -> Self {
        MetricValue::Number(v as f64)
    }
}

impl From<i32> for MetricValue {
    fn from(v: i32) -> Self {
        MetricValue::Number(v as f64)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Number(v as f64)
    }
}

impl From<u32> for MetricValue {
    fn from(v: u32) -> Self {
        MetricValue::Number(v as f64)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Number(v as f64)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}

impl From<StringValue> for MetricValue {
    fn from(v: StringValue) -> Self {
        MetricValue::String(v)
    }
}

impl TryFrom<&str> for MetricValue {
    type Error = PlexusError;

    fn try_from(v: &str) -> PlexusResult<Self> {
        MetricValue::text(v)
    }
}

impl TryFrom<String> for MetricValue {
    type Error = PlexusError;

    fn try_from(v: String) -> PlexusResult<Self> {
        MetricValue::text(&v)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Tags
// ----------------------------------------------------------------------------

pub type TagText = InlineString<MAX_TAG_LEN>;

/// A key-value pair attached to a measurement
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    pub key: TagText,
    pub value: TagText,
}

impl Tag {
    /// Build a tag. The key must be non-empty and both halves shorter than
    /// [`MAX_TAG_LEN`].
    pub fn new(key: &str, value: &str) -> PlexusResult<Self> {
        validate_tag(key, value)?;
        Ok(Self {
            key: inline_str(key)?,
            value: inline_str(value)?,
        })
    }
}

/// Tags in insertion order. Insertion order is wire order.
pub type Tags = SmallVec<[Tag; MAX_TAGS]>;

// ----------------------------------------------------------------------------
// 3.3 Measurement
// ----------------------------------------------------------------------------

/// A single pending data point.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: MetricName,
    pub value: MetricValue,
    /// Epoch milliseconds; 0 leaves the timestamp to the receiver
    pub timestamp_ms: u64,
    pub tags: Tags,
}

impl Measurement {
    /// Names longer than [`METRIC_NAME_CAPACITY`] and string values longer
    /// than [`STRING_VALUE_CAPACITY`] fail with `StringTooLong`.
    pub fn new<V>(name: impl AsRef<str>, value: V) -> PlexusResult<Self>
    where
        V: TryInto<MetricValue>,
        PlexusError: From<V::Error>,
    {
        Ok(Self {
            name: inline_str(name.as_ref())?,
            value: value.try_into()?,
            timestamp_ms: 0,
            tags: Tags::new(),
        })
    }

    /// Builder: set an explicit timestamp
    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Builder: append a tag. A fifth tag is `InvalidArgument`.
    pub fn with_tag(mut self, key: &str, value: &str) -> PlexusResult<Self> {
        if self.tags.len() >= MAX_TAGS {
            return Err(PlexusError::InvalidArgument);
        }
        self.tags.push(Tag::new(key, value)?);
        Ok(self)
    }

    #[inline]
    pub fn has_timestamp(&self) -> bool {
        self.timestamp_ms != 0
    }

    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key.as_str() == key)
            .map(|t| t.value.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.4 Measurement Queue
// ----------------------------------------------------------------------------

/// Fixed-capacity, insertion-ordered queue of pending measurements.
///
/// Storage is reserved once at construction; pushes within capacity never
/// reallocate.
#[derive(Debug, Clone)]
pub struct MeasurementQueue {
    items: Vec<Measurement>,
    capacity: usize,
}

impl MeasurementQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a measurement. A full queue is left untouched.
    pub fn push(&mut self, measurement: Measurement) -> PlexusResult<()> {
        if self.items.len() >= self.capacity {
            return Err(PlexusError::BufferFull);
        }
        self.items.push(measurement);
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn as_slice(&self) -> &[Measurement] {
        &self.items
    }
}

// ----------------------------------------------------------------------------
// 3.5 Input Validation
// ----------------------------------------------------------------------------

/// Characters allowed in source ids, session ids and ring namespaces.
///
/// Values passing this check are embedded in URLs and storage keys without
/// escaping.
#[inline]
pub fn is_identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-'
}

#[inline]
fn is_printable_ascii(b: u8) -> bool {
    (0x20..=0x7e).contains(&b)
}

/// Metric names: non-empty printable ASCII (spaces, `/` and `[` allowed),
/// strictly shorter than `max_len`.
pub fn validate_metric_name(name: &str, max_len: usize) -> PlexusResult<()> {
    if name.is_empty() {
        return Err(PlexusError::InvalidArgument);
    }
    if !name.bytes().all(is_printable_ascii) {
        return Err(PlexusError::InvalidArgument);
    }
    if name.len() >= max_len {
        return Err(PlexusError::StringTooLong);
    }
    Ok(())
}

/// Source ids: non-empty, shorter than [`MAX_SOURCE_ID_LEN`], `[A-Za-z0-9._-]`.
pub fn validate_source_id(source_id: &str) -> PlexusResult<()> {
    if source_id.is_empty() {
        return Err(PlexusError::NullArgument);
    }
    if source_id.len() >= MAX_SOURCE_ID_LEN {
        return Err(PlexusError::StringTooLong);
    }
    if !source_id.bytes().all(is_identifier_byte) {
        return Err(PlexusError::InvalidArgument);
    }
    Ok(())
}

/// API keys travel in a request header, so control characters are refused.
pub fn validate_api_key(api_key: &str) -> PlexusResult<()> {
    if api_key.is_empty() {
        return Err(PlexusError::NullArgument);
    }
    if api_key.len() >= MAX_API_KEY_LEN {
        return Err(PlexusError::StringTooLong);
    }
    if !api_key.bytes().all(is_printable_ascii) {
        return Err(PlexusError::InvalidArgument);
    }
    Ok(())
}

pub fn validate_endpoint(endpoint: &str) -> PlexusResult<()> {
    if endpoint.is_empty() {
        return Err(PlexusError::NullArgument);
    }
    if endpoint.len() >= MAX_ENDPOINT_LEN {
        return Err(PlexusError::StringTooLong);
    }
    if !endpoint.bytes().all(is_printable_ascii) {
        return Err(PlexusError::InvalidArgument);
    }
    Ok(())
}

pub fn validate_tag(key: &str, value: &str) -> PlexusResult<()> {
    if key.is_empty() {
        return Err(PlexusError::InvalidArgument);
    }
    if key.len() >= MAX_TAG_LEN || value.len() >= MAX_TAG_LEN {
        return Err(PlexusError::StringTooLong);
    }
    Ok(())
}

pub fn validate_tags(tags: &[Tag]) -> PlexusResult<()> {
    if tags.len() > MAX_TAGS {
        return Err(PlexusError::InvalidArgument);
    }
    tags.iter().try_for_each(|tag| validate_tag(&tag.key, &tag.value))
}

// ----------------------------------------------------------------------------
// 3.6 Tick Arithmetic
// ----------------------------------------------------------------------------
// The millisecond tick is a u32 that wraps roughly every 49.7 days.
// ----------------------------------------------------------------------------

/// Milliseconds from `since` to `now`, correct across one wrap of the counter.
#[inline]
pub fn ticks_elapsed(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Typed outcomes for every public operation:
// - One variant per failure class, mirroring the historical strerror table
// - Retry classification used by the flush engine
// - Recovery hints for callers
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Client Errors
// ----------------------------------------------------------------------------

/// The error type returned by every client operation.
///
/// Details (which field, which limit) are reported through `tracing`; the
/// variant itself stays `Copy` so callers can compare and store it freely.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlexusError {
    // ---- Input Errors ----
    #[error("Null pointer")]
    NullArgument,

    #[error("Buffer full")]
    BufferFull,

    #[error("String too long")]
    StringTooLong,

    #[error("Invalid argument")]
    InvalidArgument,

    // ---- Flush Outcomes ----
    #[error("No data to flush")]
    NoData,

    #[error("Network error")]
    Network,

    #[error("Authentication failed")]
    Auth,

    #[error("Billing error")]
    Billing,

    #[error("Forbidden")]
    Forbidden,

    #[error("Rate limited")]
    RateLimit,

    #[error("Server error")]
    Server,

    #[error("JSON serialization error")]
    Serialization,

    // ---- Lifecycle & Platform ----
    #[error("Client not initialized")]
    NotInitialized,

    #[error("HAL error")]
    Transport,
}

/// Result alias used throughout the engine
pub type PlexusResult<T> = Result<T, PlexusError>;

impl From<Infallible> for PlexusError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

impl PlexusError {
    /// Stable numeric code, matching the C SDK's error enum where one exists
    pub fn code(&self) -> i32 {
        match self {
            PlexusError::NullArgument => 1,
            PlexusError::BufferFull => 2,
            PlexusError::StringTooLong => 3,
            PlexusError::NoData => 4,
            PlexusError::Network => 5,
            PlexusError::Auth => 6,
            PlexusError::RateLimit => 7,
            PlexusError::Server => 8,
            PlexusError::Serialization => 9,
            PlexusError::NotInitialized => 10,
            PlexusError::Transport => 11,
            PlexusError::InvalidArgument => 12,
            PlexusError::Billing => 13,
            PlexusError::Forbidden => 14,
        }
    }

    /// Whether the flush engine retries this failure inside one flush
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlexusError::Network | PlexusError::Server | PlexusError::Serialization
        )
    }

    /// Whether new credentials or account action are needed before delivery can succeed
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            PlexusError::Auth | PlexusError::Billing | PlexusError::Forbidden
        )
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            PlexusError::NullArgument
            | PlexusError::StringTooLong
            | PlexusError::InvalidArgument => "validation",
            PlexusError::BufferFull | PlexusError::NoData => "queue",
            PlexusError::Network | PlexusError::Server => "network",
            PlexusError::Auth | PlexusError::Billing | PlexusError::Forbidden => "credentials",
            PlexusError::RateLimit => "rate_limit",
            PlexusError::Serialization => "serialization",
            PlexusError::NotInitialized => "lifecycle",
            PlexusError::Transport => "hal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            PlexusError::NullArgument
            | PlexusError::StringTooLong
            | PlexusError::InvalidArgument => RecoveryHint::FixInput,
            PlexusError::BufferFull => RecoveryHint::FlushQueue,
            PlexusError::NoData => RecoveryHint::None,
            PlexusError::Network | PlexusError::Server | PlexusError::Transport => {
                RecoveryHint::RetryWithBackoff
            }
            PlexusError::Auth | PlexusError::Billing | PlexusError::Forbidden => {
                RecoveryHint::FixCredentials
            }
            PlexusError::RateLimit => RecoveryHint::WaitForCooldown,
            PlexusError::Serialization => RecoveryHint::FixConfiguration,
            PlexusError::NotInitialized => RecoveryHint::Reinitialize,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Nothing to do
    None,
    /// Correct the arguments and call again
    FixInput,
    /// Flush or clear the queue before enqueueing more
    FlushQueue,
    /// Call flush again later
    RetryWithBackoff,
    /// Wait until the rate-limit cooldown has elapsed
    WaitForCooldown,
    /// Replace the API key or resolve the account issue
    FixCredentials,
    /// Increase the payload buffer or shrink the batch
    FixConfiguration,
    /// Create a new client
    Reinitialize,
}

// ----------------------------------------------------------------------------
// 4.2 Storage Errors
// ----------------------------------------------------------------------------

/// Errors reported by a [`Storage`] implementation
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Stored value for '{key}' is {len} bytes, buffer holds {capacity}")]
    TooLarge {
        key: String,
        len: usize,
        capacity: usize,
    },

    #[error("Invalid storage key: {key}")]
    InvalidKey { key: String },
}

impl From<StorageError> for PlexusError {
    fn from(_: StorageError) -> Self {
        PlexusError::Transport
    }
}

// ----------------------------------------------------------------------------
// 4.3 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Failed to initialize logging: {message}")]
    LoggingInit { message: String },
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (PLEXUS_ prefix, `__` nesting)
// - Validation
// - Defaults matching SECTION 2
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for a Plexus client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlexusConfig {
    /// Identity-independent client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Flush scheduling and retry policy
    #[serde(default)]
    pub flush: FlushConfig,

    /// Persistence ring settings
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PlexusConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PLEXUS_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let client = &self.client;
        let flush = &self.flush;
        let persistence = &self.persistence;

        if client.max_metrics == 0 {
            return Err(invalid("client.max_metrics", "Queue must hold at least one measurement"));
        }
        if client.max_metric_name_len < 2 {
            return Err(invalid(
                "client.max_metric_name_len",
                "Name limit must allow at least one character",
            ));
        }
        if client.max_metric_name_len > METRIC_NAME_CAPACITY {
            return Err(invalid(
                "client.max_metric_name_len",
                format!("Name limit cannot exceed {} bytes", METRIC_NAME_CAPACITY),
            ));
        }
        if client.max_string_value_len > STRING_VALUE_CAPACITY {
            return Err(invalid(
                "client.max_string_value_len",
                format!("String value limit cannot exceed {} bytes", STRING_VALUE_CAPACITY),
            ));
        }
        if client.json_buffer_size < MIN_JSON_BUFFER_SIZE {
            return Err(invalid(
                "client.json_buffer_size",
                format!("Payload buffer must be at least {} bytes", MIN_JSON_BUFFER_SIZE),
            ));
        }
        if let Err(err) = validate_endpoint(&client.endpoint) {
            return Err(invalid("client.endpoint", err.to_string()));
        }

        if flush.max_retries == 0 {
            return Err(invalid("flush.max_retries", "At least one delivery attempt is required"));
        }
        if flush.retry_base_ms > flush.retry_max_ms {
            return Err(invalid(
                "flush.retry_base_ms",
                format!(
                    "Base delay {}ms exceeds ceiling {}ms",
                    flush.retry_base_ms, flush.retry_max_ms
                ),
            ));
        }
        if flush.rate_limit_cooldown_ms > i32::MAX as u32 {
            return Err(invalid(
                "flush.rate_limit_cooldown_ms",
                "Cooldown must be shorter than half the tick range",
            ));
        }

        if persistence.ring_capacity > u16::MAX as usize {
            return Err(invalid(
                "persistence.ring_capacity",
                format!("Ring cannot exceed {} slots", u16::MAX),
            ));
        }
        if persistence.namespace.is_empty()
            || persistence.namespace.len() > MAX_RING_NAMESPACE_LEN
            || !persistence.namespace.bytes().all(is_identifier_byte)
        {
            return Err(invalid(
                "persistence.namespace",
                format!(
                    "Namespace must be 1-{} characters of [A-Za-z0-9._-]",
                    MAX_RING_NAMESPACE_LEN
                ),
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
}

// ----------------------------------------------------------------------------
// 5.2 Client Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Ingest endpoint URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Maximum queued measurements
    #[serde(default = "default_max_metrics")]
    pub max_metrics: usize,

    /// Metric names must be strictly shorter than this
    #[serde(default = "default_max_metric_name_len")]
    pub max_metric_name_len: usize,

    /// String values must be strictly shorter than this
    #[serde(default = "default_max_string_value_len")]
    pub max_string_value_len: usize,

    /// Serialized payload buffer size (bytes)
    #[serde(default = "default_json_buffer_size")]
    pub json_buffer_size: usize,

    /// Request timeout for transports (milliseconds)
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            max_metrics: default_max_metrics(),
            max_metric_name_len: default_max_metric_name_len(),
            max_string_value_len: default_max_string_value_len(),
            json_buffer_size: default_json_buffer_size(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.into()
}

fn default_max_metrics() -> usize {
    DEFAULT_MAX_METRICS
}

fn default_max_metric_name_len() -> usize {
    DEFAULT_MAX_METRIC_NAME_LEN
}

fn default_max_string_value_len() -> usize {
    DEFAULT_MAX_STRING_VALUE_LEN
}

fn default_json_buffer_size() -> usize {
    DEFAULT_JSON_BUFFER_SIZE
}

fn default_http_timeout_ms() -> u32 {
    DEFAULT_HTTP_TIMEOUT_MS
}

// ----------------------------------------------------------------------------
// 5.3 Flush Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushConfig {
    /// Queue length that triggers a flush from enqueue (0 disables)
    #[serde(default = "default_auto_flush_count")]
    pub auto_flush_count: usize,

    /// Interval since the last successful flush that triggers a flush (0 disables)
    #[serde(default = "default_auto_flush_interval_ms")]
    pub auto_flush_interval_ms: u32,

    /// Delivery attempts per flush
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay (milliseconds)
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u32,

    /// Retry delay ceiling (milliseconds)
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u32,

    /// Suppression window after a rate-limit response (milliseconds)
    #[serde(default = "default_rate_limit_cooldown_ms")]
    pub rate_limit_cooldown_ms: u32,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            auto_flush_count: default_auto_flush_count(),
            auto_flush_interval_ms: default_auto_flush_interval_ms(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            rate_limit_cooldown_ms: default_rate_limit_cooldown_ms(),
        }
    }
}

fn default_auto_flush_count() -> usize {
    DEFAULT_AUTO_FLUSH_COUNT
}

fn default_auto_flush_interval_ms() -> u32 {
    DEFAULT_AUTO_FLUSH_INTERVAL_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_base_ms() -> u32 {
    DEFAULT_RETRY_BASE_MS
}

fn default_retry_max_ms() -> u32 {
    DEFAULT_RETRY_MAX_MS
}

fn default_rate_limit_cooldown_ms() -> u32 {
    DEFAULT_RATE_LIMIT_COOLDOWN_MS
}

// ----------------------------------------------------------------------------
// 5.4 Persistence Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Slots in the ring (0 disables persistence)
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Storage key prefix: slots are `<namespace>_b<N>`, metadata `<namespace>_meta`
    #[serde(default = "default_ring_namespace")]
    pub namespace: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            namespace: default_ring_namespace(),
        }
    }
}

impl PersistenceConfig {
    pub fn is_enabled(&self) -> bool {
        self.ring_capacity > 0
    }
}

fn default_ring_capacity() -> usize {
    DEFAULT_RING_CAPACITY
}

fn default_ring_namespace() -> String {
    DEFAULT_RING_NAMESPACE.into()
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// The engine only emits `tracing` events; installing a subscriber is left to
// the application. Targets:
// - plexus::client   lifecycle and status transitions
// - plexus::queue    enqueue and validation
// - plexus::flush    delivery attempts and outcomes
// - plexus::backoff  retry delays and cooldowns
// - plexus::ring     persistence, eviction and corruption
// ============================================================================

impl LoggingConfig {
    /// Convert the configured level to a tracing filter
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            "off" => LevelFilter::OFF,
            _ => LevelFilter::INFO,
        }
    }
}

/// Install a global `tracing` subscriber for applications embedding the engine
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.level_filter().into())
        .from_env_lossy();

    let installed = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "pretty" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };

    installed.map_err(|e| ConfigError::LoggingInit {
        message: e.to_string(),
    })?;

    info!(
        target: "plexus::init",
        level = %config.level,
        format = %config.format,
        version = SDK_VERSION,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: PLATFORM COLLABORATORS
// ============================================================================
// The engine's only contact with the outside world:
// - Transport: send one payload, classify the response
// - Storage: durable key/value primitives for the persistence ring
// - Clock: wrapping millisecond tick, wall clock, blocking delay
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Transport
// ----------------------------------------------------------------------------

/// Classified result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeClass {
    Success,
    Auth,
    Billing,
    Forbidden,
    RateLimit,
    Server,
    Network,
}

impl OutcomeClass {
    /// Map an HTTP status code: 2xx success, 401/402/403/429 by name,
    /// 5xx server, everything else network.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => OutcomeClass::Success,
            401 => OutcomeClass::Auth,
            402 => OutcomeClass::Billing,
            403 => OutcomeClass::Forbidden,
            429 => OutcomeClass::RateLimit,
            500..=599 => OutcomeClass::Server,
            _ => OutcomeClass::Network,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeClass::Success)
    }

    /// The error reported to callers, `None` for success
    pub fn error(&self) -> Option<PlexusError> {
        match self {
            OutcomeClass::Success => None,
            OutcomeClass::Auth => Some(PlexusError::Auth),
            OutcomeClass::Billing => Some(PlexusError::Billing),
            OutcomeClass::Forbidden => Some(PlexusError::Forbidden),
            OutcomeClass::RateLimit => Some(PlexusError::RateLimit),
            OutcomeClass::Server => Some(PlexusError::Server),
            OutcomeClass::Network => Some(PlexusError::Network),
        }
    }
}

/// Synchronous delivery of one payload to the collector.
///
/// Implementations POST `body` to `endpoint` with the headers returned by
/// [`ingest_headers`] and classify the response with
/// [`OutcomeClass::from_status`]. Connection failures are `Network`.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    fn send(&mut self, endpoint: &str, api_key: &str, user_agent: &str, body: &[u8]) -> OutcomeClass;
}

/// Headers every ingest request carries.
pub fn ingest_headers<'a>(api_key: &'a str, user_agent: &'a str) -> [(&'static str, &'a str); 3] {
    [
        ("Content-Type", CONTENT_TYPE_JSON),
        (API_KEY_HEADER, api_key),
        ("User-Agent", user_agent),
    ]
}

// ----------------------------------------------------------------------------
// 7.2 Storage
// ----------------------------------------------------------------------------

/// Durable key/value storage that survives power loss.
///
/// A missing key is not an error: `read` returns `Ok(0)` and `clear`
/// returns `Ok(())`.
pub trait Storage: Send {
    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Copy the value stored under `key` into `buf`, returning its length.
    fn read(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, StorageError>;

    fn clear(&mut self, key: &str) -> Result<(), StorageError>;
}

/// RAM-backed storage. Clones share the same entries, so a test or a
/// diagnostics task can inspect what the ring wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    operations: Arc<AtomicU64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(key).cloned()
    }

    /// Overwrite an entry directly, bypassing the operation counter
    pub fn insert(&self, key: &str, data: &[u8]) {
        self.entries.lock().insert(key.to_string(), data.to_vec());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of write/read/clear calls made through the [`Storage`] trait
    pub fn operation_count(&self) -> u64 {
        self.operations.load(AtomicOrdering::Relaxed)
    }
}

impl Storage for MemoryStorage {
    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.operations.fetch_add(1, AtomicOrdering::Relaxed);
        self.entries.lock().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn read(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.operations.fetch_add(1, AtomicOrdering::Relaxed);
        let entries = self.entries.lock();
        let Some(value) = entries.get(key) else {
            return Ok(0);
        };
        if value.len() > buf.len() {
            return Err(StorageError::TooLarge {
                key: key.to_string(),
                len: value.len(),
                capacity: buf.len(),
            });
        }
        buf[..value.len()].copy_from_slice(value);
        Ok(value.len())
    }

    fn clear(&mut self, key: &str) -> Result<(), StorageError> {
        self.operations.fetch_add(1, AtomicOrdering::Relaxed);
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One file per key inside a directory.
///
/// Writes go to `<key>.tmp` first and are renamed into place, so a power cut
/// leaves either the old value or the new one.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (and create if needed) a storage directory
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || !key.bytes().all(is_identifier_byte) || key.starts_with('.') {
            return Err(StorageError::InvalidKey { key: key.to_string() });
        }
        Ok(self.dir.join(key))
    }
}

impl Storage for FileStorage {
    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let tmp = self.dir.join(format!("{}.tmp", key));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        // Flush the directory entry the rename created
        #[cfg(unix)]
        fs::File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    fn read(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let path = self.path_for(key)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        if data.len() > buf.len() {
            return Err(StorageError::TooLarge {
                key: key.to_string(),
                len: data.len(),
                capacity: buf.len(),
            });
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    fn clear(&mut self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ----------------------------------------------------------------------------
// 7.3 Clock
// ----------------------------------------------------------------------------

/// Time source for scheduling and backoff.
pub trait Clock: Send {
    /// Monotonic milliseconds, wrapping at `u32::MAX`
    fn tick_ms(&self) -> u32;

    /// Wall-clock epoch milliseconds, 0 when the time is unknown
    fn epoch_ms(&self) -> u64;

    /// Block the calling thread
    fn delay_ms(&self, ms: u32);
}

/// Host clock: `quanta` for the tick, `chrono` for wall time.
pub struct SystemClock {
    clock: quanta::Clock,
    origin: quanta::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let clock = quanta::Clock::new();
        let origin = clock.now();
        Self { clock, origin }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for SystemClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemClock")
            .field("tick_ms", &self.tick_ms())
            .finish()
    }
}

impl Clock for SystemClock {
    fn tick_ms(&self) -> u32 {
        // Truncation is the wrap.
        self.clock.now().duration_since(self.origin).as_millis() as u32
    }

    fn epoch_ms(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }

    fn delay_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

// ----------------------------------------------------------------------------
// 7.4 Platform Bundle
// ----------------------------------------------------------------------------

/// The collaborators a client is built with.
pub struct Hal {
    pub transport: Box<dyn Transport>,
    pub clock: Box<dyn Clock>,
    /// Without storage the persistence ring is disabled
    pub storage: Option<Box<dyn Storage>>,
}

impl Hal {
    pub fn new(transport: impl Transport + 'static, clock: impl Clock + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            clock: Box::new(clock),
            storage: None,
        }
    }

    /// Builder: attach durable storage for the persistence ring
    pub fn with_storage(mut self, storage: impl Storage + 'static) -> Self {
        self.storage = Some(Box::new(storage));
        self
    }
}

impl Debug for Hal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hal")
            .field("has_storage", &self.storage.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION 8: INTEGRITY CODE
// ============================================================================
// CRC-32 (IEEE 802.3, reflected polynomial 0xEDB88320) over persisted bytes.
// ============================================================================

/// CRC-32 as used for ring metadata and persisted batches.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0xFFFFFFFF;
    for byte in data {
        hash ^= *byte as u32;
        for _ in 0..8 {
            if hash & 1 != 0 {
                hash = (hash >> 1) ^ 0xEDB88320;
            } else {
                hash >>= 1;
            }
        }
    }
    !hash
}

// ============================================================================
// SECTION 9: WIRE SERIALIZER
// ============================================================================
// Renders queued measurements as
//   {"sdk":"rust/x.y.z","points":[{"metric":..,"value":..,"timestamp":..,
//    "source_id":..,"session_id":..,"tags":{..}}, ...]}
// - `timestamp` omitted when 0, `session_id` when no session, `tags` when empty
// - integral numbers below 1e15 print without a fraction, others shortest
//   round-trip; NaN and infinities print `null`
// - control characters other than \b \f \n \r \t become a space
// - output is bounded by the destination slice; overflow is an error
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Formatter
// ----------------------------------------------------------------------------

/// `serde_json` formatter implementing the wire number and escape rules
#[derive(Debug, Clone, Copy, Default)]
pub struct WireFormatter;

impl JsonFormatter for WireFormatter {
    fn write_f64<W: ?Sized + io::Write>(&mut self, writer: &mut W, value: f64) -> io::Result<()> {
        if value.fract() == 0.0 && value.abs() < INTEGER_RENDER_LIMIT {
            write!(writer, "{}", value as i64)
        } else {
            CompactFormatter.write_f64(writer, value)
        }
    }

    fn write_char_escape<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        char_escape: CharEscape,
    ) -> io::Result<()> {
        match char_escape {
            CharEscape::AsciiControl(_) => writer.write_all(b" "),
            other => CompactFormatter.write_char_escape(writer, other),
        }
    }
}

// ----------------------------------------------------------------------------
// 9.2 Bounded Writer
// ----------------------------------------------------------------------------

/// `io::Write` over a fixed slice that refuses writes past its end.
#[derive(Debug)]
struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> SliceWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn written(&self) -> usize {
        self.pos
    }
}

impl io::Write for SliceWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let remaining = self.buf.len() - self.pos;
        if data.len() > remaining {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "payload buffer exhausted",
            ));
        }
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 9.3 Payload Views
// ----------------------------------------------------------------------------

/// Borrowed view of one batch in wire shape
#[derive(Debug, Clone, Copy)]
pub struct WireBatch<'a> {
    pub points: &'a [Measurement],
    pub source_id: &'a str,
    pub session_id: Option<&'a str>,
}

impl Serialize for WireBatch<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("WireBatch", 2)?;
        state.serialize_field("sdk", SDK_TAG)?;
        state.serialize_field("points", &WirePoints(self))?;
        state.end()
    }
}

struct WirePoints<'a>(&'a WireBatch<'a>);

impl Serialize for WirePoints<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let batch = self.0;
        serializer.collect_seq(batch.points.iter().map(|measurement| WirePoint {
            measurement,
            source_id: batch.source_id,
            session_id: batch.session_id,
        }))
    }
}

struct WirePoint<'a> {
    measurement: &'a Measurement,
    source_id: &'a str,
    session_id: Option<&'a str>,
}

impl Serialize for WirePoint<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let m = self.measurement;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("metric", m.name.as_str())?;
        map.serialize_entry("value", &m.value)?;
        if m.has_timestamp() {
            map.serialize_entry("timestamp", &m.timestamp_ms)?;
        }
        map.serialize_entry("source_id", self.source_id)?;
        if let Some(session_id) = self.session_id {
            map.serialize_entry("session_id", session_id)?;
        }
        if !m.tags.is_empty() {
            map.serialize_entry("tags", &WireTags(&m.tags))?;
        }
        map.end()
    }
}

struct WireTags<'a>(&'a [Tag]);

impl Serialize for WireTags<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|t| (t.key.as_str(), t.value.as_str())))
    }
}

// ----------------------------------------------------------------------------
// 9.4 Entry Point
// ----------------------------------------------------------------------------

/// Serialize `batch` into `out`, returning the number of bytes written.
///
/// Fails with [`PlexusError::Serialization`] rather than producing a partial
/// payload when `out` is too small. Nothing is written past `out.len()`.
pub fn serialize_batch(batch: &WireBatch<'_>, out: &mut [u8]) -> PlexusResult<usize> {
    let capacity = out.len();
    let mut writer = SliceWriter::new(out);
    {
        let mut serializer = serde_json::Serializer::with_formatter(&mut writer, WireFormatter);
        batch.serialize(&mut serializer).map_err(|e| {
            debug!(
                target: "plexus::flush",
                points = batch.points.len(),
                capacity,
                error = %e,
                "Payload does not fit the wire buffer"
            );
            PlexusError::Serialization
        })?;
    }
    Ok(writer.written())
}

// ============================================================================
// SECTION 10: BACKOFF CONTROLLER & CONNECTION STATUS
// ============================================================================
// Retry delays grow from a base by doubling up to a ceiling, each jittered by
// ±25% from an xorshift32 generator reseeded with the current tick. A single
// absolute tick deadline implements the rate-limit cooldown.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Backoff Controller
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BackoffController {
    base_ms: u32,
    max_ms: u32,
    /// Un-jittered delay of the last retry; 0 = no backoff yet
    current_delay: u32,
    /// Tick at which the cooldown ends; 0 = no active cooldown
    rate_limit_deadline: u32,
    /// Ticks from arming to the deadline
    cooldown_span: u32,
    rng_state: u32,
}

impl BackoffController {
    pub fn new(base_ms: u32, max_ms: u32) -> Self {
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            current_delay: 0,
            rate_limit_deadline: 0,
            cooldown_span: 0,
            rng_state: 0,
        }
    }

    #[inline]
    pub fn current_delay(&self) -> u32 {
        self.current_delay
    }

    /// Advance the exponential schedule and return the jittered delay to sleep.
    pub fn next_delay(&mut self, tick: u32) -> u32 {
        self.current_delay = if self.current_delay == 0 {
            self.base_ms
        } else {
            self.current_delay.saturating_mul(2).min(self.max_ms)
        };
        self.jitter(self.current_delay, tick)
    }

    /// Forget the exponential schedule after a successful send
    pub fn reset(&mut self) {
        self.current_delay = 0;
    }

    /// Start a cooldown of `window_ms` from `now`
    pub fn arm_cooldown(&mut self, now: u32, window_ms: u32) {
        let deadline = now.wrapping_add(window_ms);
        // 0 means "no cooldown"; land one tick later instead.
        self.rate_limit_deadline = if deadline == 0 { 1 } else { deadline };
        self.cooldown_span = self.rate_limit_deadline.wrapping_sub(now);
        debug!(
            target: "plexus::backoff",
            now,
            window_ms,
            deadline = self.rate_limit_deadline,
            "Rate-limit cooldown armed"
        );
    }

    /// Whether a cooldown is still running at `now`. An elapsed cooldown is
    /// cleared.
    ///
    /// Running means the deadline lies ahead of `now` by no more than the
    /// armed window. Anything else, including a counter that has wrapped past
    /// the deadline, counts as elapsed.
    pub fn cooldown_active(&mut self, now: u32) -> bool {
        if self.rate_limit_deadline == 0 {
            return false;
        }
        let remaining = self.rate_limit_deadline.wrapping_sub(now);
        if remaining == 0 || remaining > self.cooldown_span {
            self.rate_limit_deadline = 0;
            return false;
        }
        true
    }

    pub fn cooldown_deadline(&self) -> Option<u32> {
        (self.rate_limit_deadline != 0).then_some(self.rate_limit_deadline)
    }

    fn jitter(&mut self, delay: u32, tick: u32) -> u32 {
        let mut x = self.rng_state ^ tick;
        if x == 0 {
            x = 0x9E37_79B9;
        }
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng_state = x;

        let quarter = (delay / 4) as u64;
        let offset = x as u64 % (quarter * 2 + 1);
        let jittered = delay as u64 - quarter + offset;
        jittered.min(u32::MAX as u64) as u32
    }
}

// ----------------------------------------------------------------------------
// 10.2 Connection Status
// ----------------------------------------------------------------------------

/// Connection state derived from delivery outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
    AuthFailed,
    RateLimited,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::AuthFailed => "auth_failed",
            ConnectionStatus::RateLimited => "rate_limited",
        }
    }
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called with the new status on every status change
pub type StatusCallback = Box<dyn FnMut(ConnectionStatus) + Send>;

/// Status state machine; notifies only on actual changes.
struct StatusTracker {
    current: ConnectionStatus,
    callback: Option<StatusCallback>,
}

impl StatusTracker {
    fn new() -> Self {
        Self {
            current: ConnectionStatus::default(),
            callback: None,
        }
    }

    fn transition(&mut self, next: ConnectionStatus) {
        if next == self.current {
            return;
        }
        let previous = self.current;
        self.current = next;
        info!(
            target: "plexus::client",
            from = %previous,
            to = %next,
            "Connection status changed"
        );
        if let Some(callback) = self.callback.as_mut() {
            callback(next);
        }
    }
}

impl Debug for StatusTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTracker")
            .field("current", &self.current)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

// ============================================================================
// SECTION 11: PERSISTENCE RING
// ============================================================================
// Failed payloads in durable storage, oldest first:
// - slot keys `<ns>_b<index>`, metadata key `<ns>_meta`
// - metadata record: head u16 | tail u16 | count u16 | crc32 of those 6 bytes
// - batch record:    crc32 of payload | payload length u32 | payload
// - all integers little-endian
// - a full ring overwrites its oldest slot
// - a slot failing validation reads as absent and is discarded
// The slot is written before the metadata that references it, so a power cut
// in between loses at most the newest batch and never corrupts the ring.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Records
// ----------------------------------------------------------------------------

/// Ring position metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingMeta {
    pub head: u16,
    pub tail: u16,
    pub count: u16,
}

impl RingMeta {
    pub fn encode(&self) -> [u8; RING_META_LEN] {
        let mut bytes = [0u8; RING_META_LEN];
        bytes[0..2].copy_from_slice(&self.head.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.tail.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.count.to_le_bytes());
        let crc = crc32(&bytes[..6]);
        bytes[6..10].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Decode and check against `capacity`; `None` for anything inconsistent
    pub fn decode(bytes: &[u8], capacity: u16) -> Option<Self> {
        if bytes.len() != RING_META_LEN || capacity == 0 {
            return None;
        }
        let stored_crc = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        if crc32(&bytes[..6]) != stored_crc {
            return None;
        }
        let meta = Self {
            head: u16::from_le_bytes([bytes[0], bytes[1]]),
            tail: u16::from_le_bytes([bytes[2], bytes[3]]),
            count: u16::from_le_bytes([bytes[4], bytes[5]]),
        };
        if meta.head >= capacity || meta.tail >= capacity || meta.count > capacity {
            return None;
        }
        let expected_head = (meta.tail as u32 + meta.count as u32) % capacity as u32;
        if expected_head != meta.head as u32 {
            return None;
        }
        Some(meta)
    }
}

/// Write `crc | len | payload` into `out`, returning the record length.
fn encode_batch(payload: &[u8], out: &mut [u8]) -> usize {
    let len = BATCH_HEADER_LEN + payload.len();
    out[0..4].copy_from_slice(&crc32(payload).to_le_bytes());
    out[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    out[BATCH_HEADER_LEN..len].copy_from_slice(payload);
    len
}

/// Validate a stored batch record and return its payload.
fn decode_batch(record: &[u8], max_payload: usize) -> Option<&[u8]> {
    if record.len() < BATCH_HEADER_LEN {
        return None;
    }
    let crc = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
    let len = u32::from_le_bytes([record[4], record[5], record[6], record[7]]) as usize;
    if len > max_payload || BATCH_HEADER_LEN + len != record.len() {
        return None;
    }
    let payload = &record[BATCH_HEADER_LEN..];
    (crc32(payload) == crc).then_some(payload)
}

// ----------------------------------------------------------------------------
// 11.2 Ring
// ----------------------------------------------------------------------------

/// Summary of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Batches delivered and removed
    pub sent: u16,
    /// Corrupt batches removed
    pub discarded: u16,
    /// Outcome that stopped the pass, if any
    pub stopped_on: Option<OutcomeClass>,
}

pub struct PersistenceRing {
    storage: Box<dyn Storage>,
    namespace: CompactString,
    capacity: u16,
    meta: RingMeta,
    max_payload: usize,
    /// Holds one batch record while writing or reading a slot
    scratch: Vec<u8>,
    evicted: u64,
    discarded: u64,
}

impl PersistenceRing {
    /// Attach to the ring stored under `namespace`, loading its metadata.
    ///
    /// Missing or invalid metadata starts an empty ring.
    pub fn open(
        storage: Box<dyn Storage>,
        namespace: &str,
        capacity: u16,
        max_payload: usize,
    ) -> Self {
        let mut ring = Self {
            storage,
            namespace: CompactString::new(namespace),
            capacity: capacity.max(1),
            meta: RingMeta::default(),
            max_payload,
            scratch: vec![0; BATCH_HEADER_LEN + max_payload],
            evicted: 0,
            discarded: 0,
        };
        ring.meta = ring.load_meta();
        debug!(
            target: "plexus::ring",
            namespace,
            capacity = ring.capacity,
            pending = ring.meta.count,
            "Persistence ring opened"
        );
        ring
    }

    pub fn slot_key(&self, index: u16) -> CompactString {
        format_compact!("{}_b{}", self.namespace, index)
    }

    pub fn meta_key(&self) -> CompactString {
        format_compact!("{}_meta", self.namespace)
    }

    #[inline]
    pub fn len(&self) -> u16 {
        self.meta.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.meta.count == 0
    }

    #[inline]
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn meta(&self) -> RingMeta {
        self.meta
    }

    /// Batches overwritten because the ring was full
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Batches dropped because they failed validation
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Store `payload` at the head, evicting the oldest batch when full.
    pub fn push(&mut self, payload: &[u8]) -> PlexusResult<()> {
        if payload.is_empty() || payload.len() > self.max_payload {
            return Err(PlexusError::InvalidArgument);
        }

        let mut next = self.meta;
        let evicting = next.count == self.capacity;
        if evicting {
            next.tail = self.advance(next.tail);
            next.count -= 1;
        }

        let index = next.head;
        let key = self.slot_key(index);
        let record_len = encode_batch(payload, &mut self.scratch);
        if let Err(e) = self.storage.write(&key, &self.scratch[..record_len]) {
            warn!(target: "plexus::ring", key = %key, error = %e, "Failed to persist batch");
            return Err(e.into());
        }

        next.head = self.advance(next.head);
        next.count += 1;
        self.meta = next;
        if evicting {
            self.evicted += 1;
            warn!(
                target: "plexus::ring",
                slot = index,
                capacity = self.capacity,
                "Ring full, oldest batch overwritten"
            );
        }
        self.save_meta();

        info!(
            target: "plexus::ring",
            slot = index,
            bytes = payload.len(),
            pending = self.meta.count,
            "Batch persisted"
        );
        Ok(())
    }

    /// Send stored batches oldest first until one fails.
    ///
    /// Corrupt slots are dropped as they are reached and never stop the pass.
    pub fn drain<F>(&mut self, mut send: F) -> DrainReport
    where
        F: FnMut(&[u8]) -> OutcomeClass,
    {
        let mut report = DrainReport::default();
        while self.meta.count > 0 {
            let index = self.meta.tail;
            let Some(len) = self.read_slot(index) else {
                warn!(target: "plexus::ring", slot = index, "Discarding corrupt batch");
                self.discarded += 1;
                report.discarded += 1;
                self.pop_tail();
                continue;
            };

            let outcome = send(&self.scratch[BATCH_HEADER_LEN..BATCH_HEADER_LEN + len]);
            if !outcome.is_success() {
                debug!(
                    target: "plexus::ring",
                    slot = index,
                    outcome = ?outcome,
                    remaining = self.meta.count,
                    "Drain stopped"
                );
                report.stopped_on = Some(outcome);
                break;
            }
            debug!(target: "plexus::ring", slot = index, bytes = len, "Persisted batch delivered");
            report.sent += 1;
            self.pop_tail();
        }
        report
    }

    /// Read and validate a slot into the scratch buffer, returning the
    /// payload length. Storage errors and corruption both read as `None`.
    fn read_slot(&mut self, index: u16) -> Option<usize> {
        let key = self.slot_key(index);
        let n = match self.storage.read(&key, &mut self.scratch) {
            Ok(n) => n,
            Err(e) => {
                debug!(target: "plexus::ring", key = %key, error = %e, "Slot unreadable");
                return None;
            }
        };
        decode_batch(&self.scratch[..n], self.max_payload).map(|payload| payload.len())
    }

    fn pop_tail(&mut self) {
        let key = self.slot_key(self.meta.tail);
        if let Err(e) = self.storage.clear(&key) {
            warn!(target: "plexus::ring", key = %key, error = %e, "Failed to clear slot");
        }
        self.meta.tail = self.advance(self.meta.tail);
        self.meta.count -= 1;
        self.save_meta();
    }

    #[inline]
    fn advance(&self, index: u16) -> u16 {
        ((index as u32 + 1) % self.capacity as u32) as u16
    }

    fn load_meta(&mut self) -> RingMeta {
        let key = self.meta_key();
        let mut buf = [0u8; RING_META_LEN];
        match self.storage.read(&key, &mut buf) {
            Ok(0) => RingMeta::default(),
            Ok(n) => RingMeta::decode(&buf[..n], self.capacity).unwrap_or_else(|| {
                warn!(target: "plexus::ring", key = %key, "Ring metadata invalid, starting empty");
                RingMeta::default()
            }),
            Err(e) => {
                warn!(target: "plexus::ring", key = %key, error = %e, "Ring metadata unreadable, starting empty");
                RingMeta::default()
            }
        }
    }

    fn save_meta(&mut self) {
        let key = self.meta_key();
        if let Err(e) = self.storage.write(&key, &self.meta.encode()) {
            warn!(target: "plexus::ring", key = %key, error = %e, "Failed to save ring metadata");
        }
    }
}

impl Debug for PersistenceRing {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceRing")
            .field("namespace", &self.namespace)
            .field("capacity", &self.capacity)
            .field("meta", &self.meta)
            .field("evicted", &self.evicted)
            .field("discarded", &self.discarded)
            .finish()
    }
}

// ============================================================================
// SECTION 12: CLIENT & FLUSH ENGINE
// ============================================================================
// The aggregate root. Every public method checks initialization once and then
// works on plain `&mut self` helpers; nested work (enqueue → auto-flush →
// flush) calls `flush_inner` directly, so an outer lock is never re-entered.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Client State
// ----------------------------------------------------------------------------

/// How the client's memory was provided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Returned boxed by [`Client::init`]; dropping the box releases it
    Owned,
    /// Constructed inside caller-supplied memory; [`Client::free`] only
    /// marks it uninitialized
    InPlace,
}

/// Limits applied at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueLimits {
    max_metric_name_len: usize,
    max_string_value_len: usize,
}

/// Flush triggers and retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlushPolicy {
    flush_count: usize,
    flush_interval_ms: u32,
    max_retries: u32,
    rate_limit_cooldown_ms: u32,
}

/// Transport and clock, dropped together by [`Client::free`]
struct Link {
    transport: Box<dyn Transport>,
    clock: Box<dyn Clock>,
}

pub struct Client {
    initialized: bool,
    allocation: Allocation,

    // ---- Identity ----
    api_key: InlineString<MAX_API_KEY_LEN>,
    source_id: InlineString<MAX_SOURCE_ID_LEN>,
    endpoint: String,
    session_id: Option<InlineString<MAX_SOURCE_ID_LEN>>,

    // ---- Queue & Payload ----
    queue: MeasurementQueue,
    limits: QueueLimits,
    payload: Vec<u8>,

    // ---- Delivery ----
    policy: FlushPolicy,
    backoff: BackoffController,
    status: StatusTracker,
    ring: Option<PersistenceRing>,
    link: Option<Link>,
    last_flush_tick: u32,

    // ---- Lifetime Counters ----
    total_sent: u64,
    total_errors: u64,
}

// ----------------------------------------------------------------------------
// 12.2 Lifecycle
// ----------------------------------------------------------------------------

impl Client {
    /// Create a heap-allocated client with the default configuration
    pub fn init(api_key: &str, source_id: &str, hal: Hal) -> PlexusResult<Box<Self>> {
        Self::init_with_config(api_key, source_id, &PlexusConfig::default(), hal)
    }

    /// Create a heap-allocated client
    pub fn init_with_config(
        api_key: &str,
        source_id: &str,
        config: &PlexusConfig,
        hal: Hal,
    ) -> PlexusResult<Box<Self>> {
        Self::build(api_key, source_id, config, hal, Allocation::Owned).map(Box::new)
    }

    /// Construct a client inside a caller-owned slot (static or stack memory).
    pub fn init_in_place<'a>(
        slot: &'a mut MaybeUninit<Client>,
        api_key: &str,
        source_id: &str,
        config: &PlexusConfig,
        hal: Hal,
    ) -> PlexusResult<&'a mut Client> {
        let client = Self::build(api_key, source_id, config, hal, Allocation::InPlace)?;
        Ok(slot.write(client))
    }

    /// Construct a client inside a raw byte region.
    ///
    /// The region must hold at least [`Client::static_size`] bytes starting at
    /// an address aligned to [`Client::static_align`]. On any error the region
    /// is left untouched. Call [`Client::free`] before reusing the memory.
    pub fn init_in_buffer<'a>(
        buf: &'a mut [MaybeUninit<u8>],
        api_key: &str,
        source_id: &str,
        config: &PlexusConfig,
        hal: Hal,
    ) -> PlexusResult<&'a mut Client> {
        if buf.len() < Self::static_size() {
            warn!(
                target: "plexus::client",
                provided = buf.len(),
                required = Self::static_size(),
                "Client buffer too small"
            );
            return Err(PlexusError::InvalidArgument);
        }
        let ptr = buf.as_mut_ptr();
        if (ptr as usize) % Self::static_align() != 0 {
            warn!(
                target: "plexus::client",
                required = Self::static_align(),
                "Client buffer misaligned"
            );
            return Err(PlexusError::InvalidArgument);
        }

        let client = Self::build(api_key, source_id, config, hal, Allocation::InPlace)?;
        let slot = ptr.cast::<Client>();
        // SAFETY: `buf` is exclusively borrowed for 'a, spans at least
        // size_of::<Client>() bytes and starts at an address aligned for Client.
        unsafe {
            slot.write(client);
            Ok(&mut *slot)
        }
    }

    /// Bytes required by [`Client::init_in_buffer`]
    pub const fn static_size() -> usize {
        mem::size_of::<Client>()
    }

    /// Alignment required by [`Client::init_in_buffer`]
    pub const fn static_align() -> usize {
        mem::align_of::<Client>()
    }

    fn build(
        api_key: &str,
        source_id: &str,
        config: &PlexusConfig,
        hal: Hal,
        allocation: Allocation,
    ) -> PlexusResult<Self> {
        validate_api_key(api_key)?;
        validate_source_id(source_id)?;
        if let Err(e) = config.validate() {
            warn!(target: "plexus::client", error = %e, "Rejecting client configuration");
            return Err(PlexusError::InvalidArgument);
        }

        let Hal {
            transport,
            clock,
            storage,
        } = hal;

        let json_buffer_size = config.client.json_buffer_size;
        let ring = match storage {
            Some(storage) if config.persistence.is_enabled() => Some(PersistenceRing::open(
                storage,
                &config.persistence.namespace,
                config.persistence.ring_capacity as u16,
                json_buffer_size,
            )),
            _ => None,
        };

        let last_flush_tick = clock.tick_ms();

        info!(
            target: "plexus::client",
            source_id,
            endpoint = %config.client.endpoint,
            allocation = ?allocation,
            persistence = ring.is_some(),
            version = SDK_VERSION,
            "Client initialized"
        );

        Ok(Self {
            initialized: true,
            allocation,
            api_key: inline_str(api_key)?,
            source_id: inline_str(source_id)?,
            endpoint: config.client.endpoint.clone(),
            session_id: None,
            queue: MeasurementQueue::with_capacity(config.client.max_metrics),
            limits: QueueLimits {
                max_metric_name_len: config.client.max_metric_name_len,
                max_string_value_len: config.client.max_string_value_len,
            },
            payload: vec![0; json_buffer_size],
            policy: FlushPolicy {
                flush_count: config.flush.auto_flush_count,
                flush_interval_ms: config.flush.auto_flush_interval_ms,
                max_retries: config.flush.max_retries,
                rate_limit_cooldown_ms: config.flush.rate_limit_cooldown_ms,
            },
            backoff: BackoffController::new(config.flush.retry_base_ms, config.flush.retry_max_ms),
            status: StatusTracker::new(),
            ring,
            link: Some(Link { transport, clock }),
            last_flush_tick,
            total_sent: 0,
            total_errors: 0,
        })
    }

    /// Tear the client down without flushing.
    ///
    /// Pending measurements are discarded and the collaborators dropped; every
    /// later operation fails with [`PlexusError::NotInitialized`]. An owned
    /// client's memory is released when its `Box` is dropped.
    pub fn free(&mut self) {
        if !self.initialized {
            return;
        }
        let discarded = self.queue.len();
        self.initialized = false;
        self.queue = MeasurementQueue::with_capacity(0);
        self.payload = Vec::new();
        self.session_id = None;
        self.status.callback = None;
        self.ring = None;
        self.link = None;
        self.api_key.clear();
        self.endpoint = String::new();
        let source_id = mem::take(&mut self.source_id);
        info!(
            target: "plexus::client",
            source_id = %source_id,
            allocation = ?self.allocation,
            discarded,
            "Client freed"
        );
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn allocation(&self) -> Allocation {
        self.allocation
    }

    #[inline]
    fn ensure_initialized(&self) -> PlexusResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(PlexusError::NotInitialized)
        }
    }
}

// ----------------------------------------------------------------------------
// 12.3 Configuration Overrides & Accessors
// ----------------------------------------------------------------------------

impl Client {
    pub fn set_endpoint(&mut self, endpoint: &str) -> PlexusResult<()> {
        self.ensure_initialized()?;
        validate_endpoint(endpoint)?;
        self.endpoint.clear();
        self.endpoint.push_str(endpoint);
        debug!(target: "plexus::client", endpoint, "Endpoint updated");
        Ok(())
    }

    /// Interval-triggered flushing; 0 disables it
    pub fn set_flush_interval(&mut self, interval_ms: u32) -> PlexusResult<()> {
        self.ensure_initialized()?;
        self.policy.flush_interval_ms = interval_ms;
        Ok(())
    }

    /// Count-triggered flushing; 0 disables it
    pub fn set_flush_count(&mut self, count: usize) -> PlexusResult<()> {
        self.ensure_initialized()?;
        self.policy.flush_count = count;
        Ok(())
    }

    /// Register the status-change callback, replacing any previous one
    pub fn on_status_change<F>(&mut self, callback: F) -> PlexusResult<()>
    where
        F: FnMut(ConnectionStatus) + Send + 'static,
    {
        self.ensure_initialized()?;
        self.status.callback = Some(Box::new(callback));
        Ok(())
    }

    /// Queued measurements; 0 once freed
    pub fn pending_count(&self) -> usize {
        if self.initialized {
            self.queue.len()
        } else {
            0
        }
    }

    pub fn pending(&self) -> &[Measurement] {
        self.queue.as_slice()
    }

    /// Points delivered from the live queue
    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    /// Flushes that ended in a delivery or serialization failure
    pub fn total_errors(&self) -> u64 {
        self.total_errors
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.current
    }

    /// Batches waiting in the persistence ring
    pub fn ring_len(&self) -> usize {
        self.ring.as_ref().map_or(0, |r| r.len() as usize)
    }

    pub fn ring(&self) -> Option<&PersistenceRing> {
        self.ring.as_ref()
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn backoff(&self) -> &BackoffController {
        &self.backoff
    }
}

// ----------------------------------------------------------------------------
// 12.4 Measurement Queue Operations
// ----------------------------------------------------------------------------

impl Client {
    /// Queue a measurement.
    ///
    /// Rejected input leaves the queue unchanged. When the queue reaches the
    /// flush count, or the flush interval has passed, this flushes before
    /// returning and reports the flush result; the measurement stays queued
    /// if that flush fails.
    pub fn enqueue(&mut self, mut measurement: Measurement) -> PlexusResult<()> {
        self.ensure_initialized()?;
        self.validate_measurement(&measurement)?;

        if self.queue.is_full() {
            debug!(
                target: "plexus::queue",
                metric = %measurement.name,
                capacity = self.queue.capacity(),
                "Queue full, measurement rejected"
            );
            return Err(PlexusError::BufferFull);
        }

        let Some(link) = self.link.as_ref() else {
            return Err(PlexusError::NotInitialized);
        };
        if measurement.timestamp_ms == 0 {
            measurement.timestamp_ms = link.clock.epoch_ms();
        }
        let now = link.clock.tick_ms();

        trace!(
            target: "plexus::queue",
            metric = %measurement.name,
            kind = measurement.value.type_name(),
            pending = self.queue.len() + 1,
            "Measurement queued"
        );
        self.queue.push(measurement)?;

        let count_due = self.policy.flush_count > 0 && self.queue.len() >= self.policy.flush_count;
        let interval_due = self.policy.flush_interval_ms > 0
            && ticks_elapsed(now, self.last_flush_tick) >= self.policy.flush_interval_ms;
        if count_due || interval_due {
            debug!(
                target: "plexus::queue",
                pending = self.queue.len(),
                count_due,
                interval_due,
                "Auto-flush triggered"
            );
            return self.flush_inner();
        }
        Ok(())
    }

    pub fn send_number(&mut self, name: &str, value: f64) -> PlexusResult<()> {
        self.check_name(name)?;
        self.enqueue(Measurement::new(name, value)?)
    }

    pub fn send_number_ts(&mut self, name: &str, value: f64, timestamp_ms: u64) -> PlexusResult<()> {
        self.check_name(name)?;
        self.enqueue(Measurement::new(name, value)?.at(timestamp_ms))
    }

    pub fn send_string(&mut self, name: &str, value: &str) -> PlexusResult<()> {
        self.check_name(name)?;
        if value.len() >= self.limits.max_string_value_len {
            return Err(self.rejected(name, PlexusError::StringTooLong));
        }
        self.enqueue(Measurement::new(name, value)?)
    }

    pub fn send_bool(&mut self, name: &str, value: bool) -> PlexusResult<()> {
        self.check_name(name)?;
        self.enqueue(Measurement::new(name, value)?)
    }

    pub fn send_number_tagged(
        &mut self,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
    ) -> PlexusResult<()> {
        self.check_name(name)?;
        if tags.len() > MAX_TAGS {
            return Err(self.rejected(name, PlexusError::InvalidArgument));
        }
        let mut measurement = Measurement::new(name, value)?;
        for (key, val) in tags {
            let tag = Tag::new(key, val).map_err(|e| self.rejected(name, e))?;
            measurement.tags.push(tag);
        }
        self.enqueue(measurement)
    }

    /// Discard every pending measurement without sending
    pub fn clear(&mut self) -> PlexusResult<()> {
        self.ensure_initialized()?;
        let dropped = self.queue.len();
        self.queue.clear();
        debug!(target: "plexus::queue", dropped, "Queue cleared");
        Ok(())
    }

    /// Runs before any inline storage is filled
    fn check_name(&self, name: &str) -> PlexusResult<()> {
        self.ensure_initialized()?;
        validate_metric_name(name, self.limits.max_metric_name_len)
            .map_err(|e| self.rejected(name, e))
    }

    fn validate_measurement(&self, m: &Measurement) -> PlexusResult<()> {
        validate_metric_name(&m.name, self.limits.max_metric_name_len)
            .and_then(|()| match &m.value {
                MetricValue::String(s) if s.len() >= self.limits.max_string_value_len => {
                    Err(PlexusError::StringTooLong)
                }
                _ => Ok(()),
            })
            .and_then(|()| validate_tags(&m.tags))
            .map_err(|e| self.rejected(&m.name, e))
    }

    fn rejected(&self, name: &str, error: PlexusError) -> PlexusError {
        debug!(
            target: "plexus::queue",
            metric = %name.escape_debug(),
            error = %error,
            "Measurement rejected"
        );
        error
    }
}

// ----------------------------------------------------------------------------
// 12.5 Sessions
// ----------------------------------------------------------------------------

impl Client {
    /// Tag every following point with `session_id` until [`Client::session_end`]
    pub fn session_start(&mut self, session_id: &str) -> PlexusResult<()> {
        self.ensure_initialized()?;
        validate_source_id(session_id)?;
        self.session_id = Some(inline_str(session_id)?);
        info!(target: "plexus::client", session_id, "Session started");
        Ok(())
    }

    pub fn session_end(&mut self) -> PlexusResult<()> {
        self.ensure_initialized()?;
        if let Some(session_id) = self.session_id.take() {
            info!(target: "plexus::client", session_id = %session_id, "Session ended");
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 12.6 Flush Engine
// ----------------------------------------------------------------------------

impl Client {
    /// Render the live queue into the payload buffer
    pub fn serialize(&mut self) -> PlexusResult<&[u8]> {
        self.ensure_initialized()?;
        let batch = WireBatch {
            points: self.queue.as_slice(),
            source_id: &self.source_id,
            session_id: self.session_id.as_deref(),
        };
        let len = serialize_batch(&batch, &mut self.payload)?;
        Ok(&self.payload[..len])
    }

    /// Deliver persisted batches, then the live queue.
    ///
    /// Blocks for the retry delays between attempts, at most
    /// `(max_retries - 1)` delays of up to 1.25 × the retry ceiling.
    pub fn flush(&mut self) -> PlexusResult<()> {
        self.ensure_initialized()?;
        self.flush_inner()
    }

    /// Periodic entry point: flushes when the queue is non-empty and the flush
    /// interval has passed since the last successful flush. Idle is `Ok`.
    ///
    /// Every call also retires an elapsed rate-limit cooldown, so a client
    /// ticked while idle never sees a stale deadline come back into range.
    pub fn tick(&mut self) -> PlexusResult<()> {
        self.ensure_initialized()?;
        let Some(link) = self.link.as_ref() else {
            return Err(PlexusError::NotInitialized);
        };
        let now = link.clock.tick_ms();
        self.backoff.cooldown_active(now);
        if self.queue.is_empty() || self.policy.flush_interval_ms == 0 {
            return Ok(());
        }
        let elapsed = ticks_elapsed(now, self.last_flush_tick);
        if elapsed < self.policy.flush_interval_ms {
            return Ok(());
        }
        trace!(target: "plexus::flush", elapsed_ms = elapsed, "Flush interval elapsed");
        self.flush_inner()
    }

    fn flush_inner(&mut self) -> PlexusResult<()> {
        let Some(link) = self.link.as_mut() else {
            return Err(PlexusError::NotInitialized);
        };

        // 1. Cooldown short-circuit
        if self.backoff.cooldown_active(link.clock.tick_ms()) {
            debug!(
                target: "plexus::flush",
                pending = self.queue.len(),
                deadline = ?self.backoff.cooldown_deadline(),
                "Rate-limit cooldown active, flush skipped"
            );
            return Err(PlexusError::RateLimit);
        }

        // 2. Persisted batches first
        if let Some(ring) = self.ring.as_mut().filter(|r| !r.is_empty()) {
            let endpoint = self.endpoint.as_str();
            let api_key = self.api_key.as_str();
            let transport = &mut link.transport;
            let report = ring.drain(|body| transport.send(endpoint, api_key, USER_AGENT, body));

            if report.sent > 0 {
                self.backoff.reset();
                self.status.transition(ConnectionStatus::Connected);
            }
            if report.stopped_on == Some(OutcomeClass::RateLimit) {
                self.backoff
                    .arm_cooldown(link.clock.tick_ms(), self.policy.rate_limit_cooldown_ms);
                self.total_errors += 1;
                self.status.transition(ConnectionStatus::RateLimited);
                warn!(
                    target: "plexus::flush",
                    remaining = ring.len(),
                    "Rate limited while draining persisted batches"
                );
                return Err(PlexusError::RateLimit);
            }
        }

        // 3. Nothing live to send
        if self.queue.is_empty() {
            return Err(PlexusError::NoData);
        }

        // 4. Serialize
        let points = self.queue.len();
        let batch = WireBatch {
            points: self.queue.as_slice(),
            source_id: &self.source_id,
            session_id: self.session_id.as_deref(),
        };
        let len = match serialize_batch(&batch, &mut self.payload) {
            Ok(len) => len,
            Err(e) => {
                self.total_errors += 1;
                warn!(
                    target: "plexus::flush",
                    points,
                    buffer = self.payload.len(),
                    "Queue does not fit the payload buffer"
                );
                return Err(e);
            }
        };
        let body = &self.payload[..len];

        // 5-6. Deliver with bounded retries
        let mut outcome = OutcomeClass::Network;
        for attempt in 0..self.policy.max_retries {
            if attempt > 0 {
                let delay = self.backoff.next_delay(link.clock.tick_ms());
                debug!(
                    target: "plexus::backoff",
                    attempt = attempt + 1,
                    max_attempts = self.policy.max_retries,
                    delay_ms = delay,
                    last = ?outcome,
                    "Retrying after backoff"
                );
                link.clock.delay_ms(delay);
            }

            outcome = link
                .transport
                .send(&self.endpoint, &self.api_key, USER_AGENT, body);

            match outcome {
                OutcomeClass::Success => {
                    self.total_sent += points as u64;
                    self.queue.clear();
                    self.last_flush_tick = link.clock.tick_ms();
                    self.backoff.reset();
                    self.status.transition(ConnectionStatus::Connected);
                    debug!(
                        target: "plexus::flush",
                        points,
                        bytes = len,
                        attempts = attempt + 1,
                        "Flush delivered"
                    );
                    return Ok(());
                }
                OutcomeClass::RateLimit => {
                    self.backoff
                        .arm_cooldown(link.clock.tick_ms(), self.policy.rate_limit_cooldown_ms);
                    break;
                }
                OutcomeClass::Auth | OutcomeClass::Billing | OutcomeClass::Forbidden => break,
                OutcomeClass::Server | OutcomeClass::Network => {}
            }
        }

        // 7. Terminal failure
        self.total_errors += 1;
        let error = outcome.error().unwrap_or(PlexusError::Network);
        match outcome {
            OutcomeClass::RateLimit => {
                self.status.transition(ConnectionStatus::RateLimited);
            }
            OutcomeClass::Auth | OutcomeClass::Billing | OutcomeClass::Forbidden => {
                self.status.transition(ConnectionStatus::AuthFailed);
            }
            _ => {
                self.status.transition(ConnectionStatus::Disconnected);
                if let Some(ring) = self.ring.as_mut() {
                    if ring.push(body).is_ok() {
                        self.queue.clear();
                    }
                }
            }
        }
        warn!(
            target: "plexus::flush",
            points,
            error = %error,
            pending = self.queue.len(),
            persisted = self.ring.as_ref().map_or(0, |r| r.len()),
            "Flush failed"
        );
        Err(error)
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("initialized", &self.initialized)
            .field("allocation", &self.allocation)
            .field("source_id", &self.source_id)
            .field("endpoint", &self.endpoint)
            .field("session_id", &self.session_id)
            .field("pending", &self.queue.len())
            .field("status", &self.status.current)
            .field("total_sent", &self.total_sent)
            .field("total_errors", &self.total_errors)
            .field("ring", &self.ring)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION 13: CONCURRENCY GUARD
// ============================================================================
// Optional thread-safe wrapper. Each method takes the lock exactly once; the
// wrapped client never calls back into the guard, so auto-flush from inside
// enqueue runs under the same acquisition.
// ============================================================================

/// A client shared between threads.
///
/// Works for owned clients (`Box<Client>`) and in-place ones (`&mut Client`).
/// Status callbacks run while the lock is held and must not call back into
/// the same guard.
#[derive(Debug)]
pub struct SyncClient<C = Box<Client>>
where
    C: DerefMut<Target = Client>,
{
    inner: Mutex<C>,
}

impl<C> SyncClient<C>
where
    C: DerefMut<Target = Client> + Send,
{
    pub fn new(client: C) -> Self {
        Self {
            inner: Mutex::new(client),
        }
    }

    pub fn enqueue(&self, measurement: Measurement) -> PlexusResult<()> {
        self.inner.lock().enqueue(measurement)
    }

    pub fn send_number(&self, name: &str, value: f64) -> PlexusResult<()> {
        self.inner.lock().send_number(name, value)
    }

    pub fn send_number_ts(&self, name: &str, value: f64, timestamp_ms: u64) -> PlexusResult<()> {
        self.inner.lock().send_number_ts(name, value, timestamp_ms)
    }

    pub fn send_string(&self, name: &str, value: &str) -> PlexusResult<()> {
        self.inner.lock().send_string(name, value)
    }

    pub fn send_bool(&self, name: &str, value: bool) -> PlexusResult<()> {
        self.inner.lock().send_bool(name, value)
    }

    pub fn send_number_tagged(&self, name: &str, value: f64, tags: &[(&str, &str)]) -> PlexusResult<()> {
        self.inner.lock().send_number_tagged(name, value, tags)
    }

    pub fn flush(&self) -> PlexusResult<()> {
        self.inner.lock().flush()
    }

    pub fn tick(&self) -> PlexusResult<()> {
        self.inner.lock().tick()
    }

    pub fn clear(&self) -> PlexusResult<()> {
        self.inner.lock().clear()
    }

    pub fn session_start(&self, session_id: &str) -> PlexusResult<()> {
        self.inner.lock().session_start(session_id)
    }

    pub fn session_end(&self) -> PlexusResult<()> {
        self.inner.lock().session_end()
    }

    pub fn set_endpoint(&self, endpoint: &str) -> PlexusResult<()> {
        self.inner.lock().set_endpoint(endpoint)
    }

    pub fn set_flush_interval(&self, interval_ms: u32) -> PlexusResult<()> {
        self.inner.lock().set_flush_interval(interval_ms)
    }

    pub fn set_flush_count(&self, count: usize) -> PlexusResult<()> {
        self.inner.lock().set_flush_count(count)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending_count()
    }

    pub fn total_sent(&self) -> u64 {
        self.inner.lock().total_sent()
    }

    pub fn total_errors(&self) -> u64 {
        self.inner.lock().total_errors()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().status()
    }

    /// Run several operations under one acquisition
    pub fn with_client<R>(&self, f: impl FnOnce(&mut Client) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Tear down the wrapped client without flushing
    pub fn free(&self) {
        self.inner.lock().free();
    }

    pub fn into_inner(self) -> C {
        self.inner.into_inner()
    }
}

// ============================================================================
// SECTION 14: TEST SUPPORT
// ============================================================================
// Scripted transport, manual clock and client rigs shared by the test suites.
// ============================================================================

#[cfg(test)]
mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    /// One recorded call to [`ScriptedTransport::send`]
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SentRequest {
        pub endpoint: String,
        pub api_key: String,
        pub user_agent: String,
        pub body: Vec<u8>,
    }

    impl SentRequest {
        pub fn json(&self) -> serde_json::Value {
            serde_json::from_slice(&self.body).expect("payload is valid JSON")
        }
    }

    #[derive(Debug, Default)]
    struct Script {
        queued: VecDeque<OutcomeClass>,
        fallback: Option<OutcomeClass>,
        sent: Vec<SentRequest>,
    }

    /// Replays queued outcomes, then a fallback (success unless set)
    #[derive(Debug, Clone, Default)]
    pub struct ScriptedTransport {
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedTransport {
        pub fn always(outcome: OutcomeClass) -> Self {
            let transport = Self::default();
            transport.set_always(outcome);
            transport
        }

        pub fn sequence(outcomes: impl IntoIterator<Item = OutcomeClass>) -> Self {
            let transport = Self::default();
            transport.queue(outcomes);
            transport
        }

        pub fn set_always(&self, outcome: OutcomeClass) {
            let mut script = self.script.lock();
            script.queued.clear();
            script.fallback = Some(outcome);
        }

        /// Replay `outcomes` before falling back
        pub fn queue(&self, outcomes: impl IntoIterator<Item = OutcomeClass>) {
            self.script.lock().queued.extend(outcomes);
        }

        pub fn calls(&self) -> usize {
            self.script.lock().sent.len()
        }

        pub fn requests(&self) -> Vec<SentRequest> {
            self.script.lock().sent.clone()
        }

        pub fn last(&self) -> Option<SentRequest> {
            self.script.lock().sent.last().cloned()
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&mut self, endpoint: &str, api_key: &str, user_agent: &str, body: &[u8]) -> OutcomeClass {
            let mut script = self.script.lock();
            script.sent.push(SentRequest {
                endpoint: endpoint.to_string(),
                api_key: api_key.to_string(),
                user_agent: user_agent.to_string(),
                body: body.to_vec(),
            });
            script
                .queued
                .pop_front()
                .or(script.fallback)
                .unwrap_or(OutcomeClass::Success)
        }
    }

    /// Clock driven by the test; `delay_ms` records the delay and advances the tick
    #[derive(Debug, Clone, Default)]
    pub struct ManualClock {
        tick: Arc<AtomicU32>,
        epoch: Arc<AtomicU64>,
        delays: Arc<Mutex<Vec<u32>>>,
    }

    impl ManualClock {
        pub fn at(tick: u32) -> Self {
            let clock = Self::default();
            clock.set(tick);
            clock
        }

        pub fn set(&self, tick: u32) {
            self.tick.store(tick, AtomicOrdering::SeqCst);
        }

        pub fn advance(&self, ms: u32) {
            self.tick.fetch_add(ms, AtomicOrdering::SeqCst);
        }

        pub fn set_epoch(&self, epoch_ms: u64) {
            self.epoch.store(epoch_ms, AtomicOrdering::SeqCst);
        }

        pub fn delays(&self) -> Vec<u32> {
            self.delays.lock().clone()
        }
    }

    impl Clock for ManualClock {
        fn tick_ms(&self) -> u32 {
            self.tick.load(AtomicOrdering::SeqCst)
        }

        fn epoch_ms(&self) -> u64 {
            self.epoch.load(AtomicOrdering::SeqCst)
        }

        fn delay_ms(&self, ms: u32) {
            self.delays.lock().push(ms);
            self.advance(ms);
        }
    }

    /// Default configuration with both auto-flush triggers and persistence off
    pub fn quiet_config() -> PlexusConfig {
        let mut config = PlexusConfig::default();
        config.flush.auto_flush_count = 0;
        config.flush.auto_flush_interval_ms = 0;
        config.persistence.ring_capacity = 0;
        config
    }

    pub fn persistent_config(capacity: usize) -> PlexusConfig {
        let mut config = quiet_config();
        config.persistence.ring_capacity = capacity;
        config
    }

    #[derive(Debug)]
    pub struct Rig {
        pub client: Box<Client>,
        pub transport: ScriptedTransport,
        pub clock: ManualClock,
        pub storage: MemoryStorage,
    }

    pub const TEST_API_KEY: &str = "plx_test_key";
    pub const TEST_SOURCE_ID: &str = "device-01";

    pub fn rig(config: &PlexusConfig, transport: ScriptedTransport) -> Rig {
        rig_at(config, transport, 1_000)
    }

    pub fn rig_at(config: &PlexusConfig, transport: ScriptedTransport, start_tick: u32) -> Rig {
        let clock = ManualClock::at(start_tick);
        let storage = MemoryStorage::new();
        let hal = Hal::new(transport.clone(), clock.clone()).with_storage(storage.clone());
        let client = Client::init_with_config(TEST_API_KEY, TEST_SOURCE_ID, config, hal)
            .expect("valid test client");
        Rig {
            client,
            transport,
            clock,
            storage,
        }
    }
}

// ============================================================================
// SECTION 15: CORE TESTS
// ============================================================================


// ============================================================================
// SECTION 16: SERIALIZER TESTS
// ============================================================================


// ============================================================================
// SECTION 17: PERSISTENCE RING TESTS
// ============================================================================

#[cfg(test)]
mod ring_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MAX_PAYLOAD: usize = 256;

    fn ring_on(storage: &MemoryStorage, capacity: u16) -> PersistenceRing {
        PersistenceRing::open(Box::new(storage.clone()), DEFAULT_RING_NAMESPACE, capacity, MAX_PAYLOAD)
    }

    fn drain_all(ring: &mut PersistenceRing) -> (Vec<Vec<u8>>, DrainReport) {
        let mut seen = Vec::new();
        let report = ring.drain(|body| {
            seen.push(body.to_vec());
            OutcomeClass::Success
        });
        (seen, report)
    }

    #[test]
    fn test_crc32_reference_vectors() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_storage_keys() {
        let storage = MemoryStorage::new();
        let ring = ring_on(&storage, 8);
        assert_eq!(ring.slot_key(0).as_str(), "plexus_b0");
        assert_eq!(ring.slot_key(7).as_str(), "plexus_b7");
        assert_eq!(ring.meta_key().as_str(), "plexus_meta");
    }

    #[test]
    fn test_fifo_drain() {
        let storage = MemoryStorage::new();
        let mut ring = ring_on(&storage, 4);
        ring.push(b"first").unwrap();
        ring.push(b"second").unwrap();
        assert_eq!(ring.len(), 2);
        assert!(storage.contains("plexus_b0"));
        assert!(storage.contains("plexus_meta"));

        let (seen, report) = drain_all(&mut ring);

        assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(
            report,
            DrainReport {
                sent: 2,
                discarded: 0,
                stopped_on: None
            }
        );
        assert!(ring.is_empty());
        assert!(!storage.contains("plexus_b0"));
        assert!(!storage.contains("plexus_b1"));
    }

    #[test]
    fn test_drain_stops_at_first_failure() {
        let storage = MemoryStorage::new();
        let mut ring = ring_on(&storage, 4);
        for payload in [&b"a"[..], b"b", b"c"] {
            ring.push(payload).unwrap();
        }

        let mut calls = 0;
        let report = ring.drain(|_| {
            calls += 1;
            if calls == 2 {
                OutcomeClass::Network
            } else {
                OutcomeClass::Success
            }
        });

        assert_eq!(report.sent, 1);
        assert_eq!(report.stopped_on, Some(OutcomeClass::Network));
        assert_eq!(ring.len(), 2);
        let (seen, _) = drain_all(&mut ring);
        assert_eq!(seen, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_full_ring_overwrites_oldest() {
        let storage = MemoryStorage::new();
        let mut ring = ring_on(&storage, 3);
        for payload in [&b"a"[..], b"b", b"c", b"d"] {
            ring.push(payload).unwrap();
        }

        assert_eq!(ring.len(), 3);
        assert_eq!(ring.evicted(), 1);
        assert_eq!(ring.meta(), RingMeta { head: 1, tail: 1, count: 3 });

        let (seen, _) = drain_all(&mut ring);
        assert_eq!(seen, vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_corrupt_slot_discarded() {
        let storage = MemoryStorage::new();
        let mut ring = ring_on(&storage, 4);
        ring.push(b"one").unwrap();
        ring.push(b"two").unwrap();
        let mut record = storage.get("plexus_b0").unwrap();
        record[BATCH_HEADER_LEN] ^= 0xFF;
        storage.insert("plexus_b0", &record);

        let (seen, report) = drain_all(&mut ring);

        assert_eq!(seen, vec![b"two".to_vec()]);
        assert_eq!(report.sent, 1);
        assert_eq!(report.discarded, 1);
        assert_eq!(ring.discarded(), 1);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_corrupt_slot_discarded_even_when_send_fails() {
        let storage = MemoryStorage::new();
        let mut ring = ring_on(&storage, 4);
        ring.push(b"one").unwrap();
        ring.push(b"two").unwrap();
        storage.insert("plexus_b0", &[1, 2, 3]);

        let report = ring.drain(|_| OutcomeClass::Network);

        assert_eq!(report.discarded, 1);
        assert_eq!(report.sent, 0);
        assert_eq!(report.stopped_on, Some(OutcomeClass::Network));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_missing_and_oversized_slots_discarded() {
        let storage = MemoryStorage::new();
        let mut ring = ring_on(&storage, 4);
        ring.push(b"one").unwrap();
        ring.push(b"two").unwrap();
        ring.push(b"three").unwrap();
        storage.insert("plexus_b0", &vec![0u8; BATCH_HEADER_LEN + MAX_PAYLOAD + 1]);
        let mut storage_handle = storage.clone();
        Storage::clear(&mut storage_handle, "plexus_b1").unwrap();

        let (seen, report) = drain_all(&mut ring);

        assert_eq!(seen, vec![b"three".to_vec()]);
        assert_eq!(report.discarded, 2);
    }

    #[test]
    fn test_length_field_mismatch_discarded() {
        let storage = MemoryStorage::new();
        let mut ring = ring_on(&storage, 2);
        ring.push(b"payload").unwrap();
        let mut record = storage.get("plexus_b0").unwrap();
        record[4] = record[4].wrapping_add(1);
        storage.insert("plexus_b0", &record);

        let (seen, report) = drain_all(&mut ring);
        assert!(seen.is_empty());
        assert_eq!(report.discarded, 1);
    }

    #[test]
    fn test_push_rejects_empty_and_oversized_payloads() {
        let storage = MemoryStorage::new();
        let mut ring = ring_on(&storage, 2);
        assert_eq!(ring.push(b""), Err(PlexusError::InvalidArgument));
        assert_eq!(ring.push(&[b'x'; MAX_PAYLOAD + 1]), Err(PlexusError::InvalidArgument));
        assert_eq!(ring.push(&[b'x'; MAX_PAYLOAD]), Ok(()));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_reopen_restores_pending_batches() {
        let storage = MemoryStorage::new();
        {
            let mut ring = ring_on(&storage, 4);
            ring.push(b"persisted-1").unwrap();
            ring.push(b"persisted-2").unwrap();
            ring.drain(|_| OutcomeClass::Success);
            ring.push(b"persisted-3").unwrap();
        }

        let mut reopened = ring_on(&storage, 4);
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.meta(), RingMeta { head: 3, tail: 2, count: 1 });
        let (seen, _) = drain_all(&mut reopened);
        assert_eq!(seen, vec![b"persisted-3".to_vec()]);
    }

    #[test]
    fn test_invalid_metadata_starts_empty() {
        let storage = MemoryStorage::new();
        let mut ring = ring_on(&storage, 4);
        ring.push(b"a").unwrap();
        ring.push(b"b").unwrap();

        let mut meta = storage.get("plexus_meta").unwrap();
        meta[0] ^= 0x01;
        storage.insert("plexus_meta", &meta);
        assert!(ring_on(&storage, 4).is_empty());

        storage.insert("plexus_meta", b"short");
        assert!(ring_on(&storage, 4).is_empty());
    }

    #[test]
    fn test_metadata_checked_against_capacity() {
        let meta = RingMeta { head: 2, tail: 0, count: 2 };
        let bytes = meta.encode();
        assert_eq!(RingMeta::decode(&bytes, 4), Some(meta));
        assert_eq!(RingMeta::decode(&bytes, 2), None);

        let inconsistent = RingMeta { head: 1, tail: 0, count: 3 };
        assert_eq!(RingMeta::decode(&inconsistent.encode(), 4), None);

        let full = RingMeta { head: 1, tail: 1, count: 4 };
        assert_eq!(RingMeta::decode(&full.encode(), 4), Some(full));
    }

    #[test]
    fn test_file_storage_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path().join("plexus")).unwrap();
        let mut buf = [0u8; 16];

        assert_eq!(storage.read("plexus_b0", &mut buf).unwrap(), 0);
        storage.write("plexus_b0", b"hello").unwrap();
        assert_eq!(storage.read("plexus_b0", &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        storage.write("plexus_b0", &[7u8; 32]).unwrap();
        assert!(matches!(
            storage.read("plexus_b0", &mut buf),
            Err(StorageError::TooLarge { len: 32, capacity: 16, .. })
        ));

        storage.clear("plexus_b0").unwrap();
        storage.clear("plexus_b0").unwrap();
        assert_eq!(storage.read("plexus_b0", &mut buf).unwrap(), 0);

        for key in ["", "../escape", ".hidden", "a/b"] {
            assert!(matches!(
                storage.write(key, b"x"),
                Err(StorageError::InvalidKey { .. })
            ));
        }
    }

    #[test]
    fn test_file_storage_write_commits_through_rename() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path()).unwrap();
        storage.write("plexus_meta", b"first").unwrap();
        storage.write("plexus_meta", b"second").unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["plexus_meta".to_string()]);
        assert_eq!(fs::read(dir.path().join("plexus_meta")).unwrap(), b"second");
    }

    #[test]
    fn test_ring_survives_restart_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::open(dir.path()).unwrap();
            let mut ring = PersistenceRing::open(Box::new(storage), "plexus", 4, MAX_PAYLOAD);
            ring.push(br#"{"sdk":"rust","points":[]}"#).unwrap();
        }

        let storage = FileStorage::open(dir.path()).unwrap();
        let mut ring = PersistenceRing::open(Box::new(storage), "plexus", 4, MAX_PAYLOAD);
        assert_eq!(ring.len(), 1);
        let (seen, report) = drain_all(&mut ring);
        assert_eq!(seen, vec![br#"{"sdk":"rust","points":[]}"#.to_vec()]);
        assert_eq!(report.sent, 1);
        assert!(!dir.path().join("plexus_b0").exists());
    }
}

// ============================================================================
// SECTION 18: FLUSH ENGINE TESTS
// ============================================================================


// ============================================================================
// SECTION 19: CONCURRENCY TESTS
// ============================================================================

#[cfg(test)]
mod concurrency_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use std::thread;

    #[test]
    fn test_shared_client_loses_nothing() {
        let mut config = quiet_config();
        config.client.max_metrics = 64;
        config.flush.auto_flush_count = 16;
        let rig = rig(&config, ScriptedTransport::default());
        let transport = rig.transport.clone();
        let client = Arc::new(SyncClient::new(rig.client));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let client = Arc::clone(&client);
                thread::spawn(move || {
                    for i in 0..8 {
                        client
                            .send_number(&format!("thread{}.metric{}", t, i), i as f64)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(client.total_sent(), 32);
        assert_eq!(client.pending_count(), 0);
        assert_eq!(transport.calls(), 2);
        let delivered: usize = transport
            .requests()
            .iter()
            .map(|r| r.json()["points"].as_array().unwrap().len())
            .sum();
        assert_eq!(delivered, 32);
    }

    #[test]
    fn test_concurrent_enqueue_and_flush() {
        let mut config = quiet_config();
        config.client.max_metrics = 64;
        let rig = rig(&config, ScriptedTransport::default());
        let client = Arc::new(SyncClient::new(rig.client));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let client = Arc::clone(&client);
                thread::spawn(move || {
                    for i in 0..10 {
                        client.send_number(&format!("t{}.m{}", t, i), 1.0).unwrap();
                        if i % 5 == 4 {
                            match client.flush() {
                                Ok(()) | Err(PlexusError::NoData) => {}
                                Err(e) => panic!("unexpected flush error: {}", e),
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(client.total_sent() as usize + client.pending_count(), 40);
        assert_eq!(client.total_errors(), 0);
    }

    #[test]
    fn test_in_place_client_behind_guard() {
        let transport = ScriptedTransport::default();
        let mut slot = MaybeUninit::<Client>::uninit();
        let client = Client::init_in_place(
            &mut slot,
            TEST_API_KEY,
            TEST_SOURCE_ID,
            &quiet_config(),
            Hal::new(transport.clone(), ManualClock::default()),
        )
        .unwrap();
        let guard = SyncClient::new(client);

        thread::scope(|scope| {
            for t in 0..2 {
                let guard = &guard;
                scope.spawn(move || {
                    for i in 0..5 {
                        guard.send_number(&format!("t{}.m{}", t, i), 1.0).unwrap();
                    }
                });
            }
        });

        assert_eq!(guard.pending_count(), 10);
        guard.with_client(|client| {
            assert_eq!(client.allocation(), Allocation::InPlace);
            assert_eq!(client.flush(), Ok(()));
        });
        assert_eq!(transport.calls(), 1);

        guard.free();
        assert_eq!(guard.pending_count(), 0);
        assert_eq!(guard.send_number("late", 1.0), Err(PlexusError::NotInitialized));
    }

    #[test]
    fn test_auto_flush_under_lock() {
        let mut config = quiet_config();
        config.flush.auto_flush_count = 2;
        let rig = rig(&config, ScriptedTransport::default());
        let transport = rig.transport.clone();
        let guard = SyncClient::new(rig.client);

        guard.send_number("a", 1.0).unwrap();
        guard.send_number("b", 1.0).unwrap();

        assert_eq!(transport.calls(), 1);
        assert_eq!(guard.status(), ConnectionStatus::Connected);
        let client = guard.into_inner();
        assert_eq!(client.total_sent(), 2);
    }
}

// ============================================================================
// SECTION 20: ALLOCATION TESTS
// ============================================================================
// Counts heap allocations made by the test thread itself, so tests running in
// parallel on other threads do not disturb the numbers.
// ============================================================================

#[cfg(test)]
mod allocation_tests {
    use super::test_support::*;
    use super::*;
    use std::alloc::{GlobalAlloc, Layout, System};
    use std::cell::Cell;

    thread_local! {
        static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
    }

    struct CountingAllocator;

    fn note_allocation() {
        let _ = ALLOCATIONS.try_with(|count| count.set(count.get() + 1));
    }

    unsafe impl GlobalAlloc for CountingAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            note_allocation();
            System.alloc(layout)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            System.dealloc(ptr, layout)
        }

        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            note_allocation();
            System.realloc(ptr, layout, new_size)
        }
    }

    #[global_allocator]
    static GLOBAL: CountingAllocator = CountingAllocator;

    fn allocations_during(f: impl FnOnce()) -> usize {
        let before = ALLOCATIONS.with(Cell::get);
        f();
        ALLOCATIONS.with(Cell::get) - before
    }

    /// Accepts everything without recording bodies
    #[derive(Debug, Clone, Default)]
    struct CountingTransport {
        calls: Arc<AtomicU64>,
    }

    impl Transport for CountingTransport {
        fn send(&mut self, _endpoint: &str, _api_key: &str, _user_agent: &str, body: &[u8]) -> OutcomeClass {
            assert!(!body.is_empty());
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            OutcomeClass::Success
        }
    }

    fn send_round(client: &mut Client, status: &str) {
        for i in 0..10 {
            client
                .send_number("sensors.bme280.ambient_temperature_c", 20.0 + i as f64)
                .unwrap();
        }
        for _ in 0..10 {
            client.send_string("s", status).unwrap();
        }
        client.send_number_tagged("m", 1.0, &[("zone", "north"), ("rack", "r7")]).unwrap();
        client.send_bool("door.open", true).unwrap();
        client.flush().unwrap();
    }

    #[test]
    fn test_send_and_flush_do_not_allocate() {
        let transport = CountingTransport::default();
        let calls = transport.calls.clone();
        let hal = Hal::new(transport, ManualClock::at(1_000));
        let mut client =
            Client::init_with_config(TEST_API_KEY, TEST_SOURCE_ID, &quiet_config(), hal).unwrap();
        let status = "x".repeat(40);

        tracing::subscriber::with_default(tracing::subscriber::NoSubscriber::default(), || {
            // First round registers tracing callsites
            send_round(&mut client, &status);

            let allocations = allocations_during(|| send_round(&mut client, &status));
            assert_eq!(allocations, 0);
        });

        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(client.total_sent(), 44);
    }

    #[test]
    fn test_oversized_input_fails_without_allocating() {
        let mut client = Client::init_with_config(
            TEST_API_KEY,
            TEST_SOURCE_ID,
            &quiet_config(),
            Hal::new(CountingTransport::default(), ManualClock::at(1_000)),
        )
        .unwrap();
        let long_name = "n".repeat(METRIC_NAME_CAPACITY + 10);
        let long_value = "v".repeat(STRING_VALUE_CAPACITY + 10);

        tracing::subscriber::with_default(tracing::subscriber::NoSubscriber::default(), || {
            let _ = client.send_number(&long_name, 1.0);
            let _ = client.send_string("s", &long_value);

            let allocations = allocations_during(|| {
                assert_eq!(client.send_number(&long_name, 1.0), Err(PlexusError::StringTooLong));
                assert_eq!(client.send_string("s", &long_value), Err(PlexusError::StringTooLong));
                assert_eq!(
                    Measurement::new(&long_name, 1.0).unwrap_err(),
                    PlexusError::StringTooLong
                );
            });
            assert_eq!(allocations, 0);
        });
        assert_eq!(client.pending_count(), 0);
    }
}
