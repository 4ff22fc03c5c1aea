//! Process configuration, read once from the environment (and `.env`) at startup.
//!
//! Deserialization follows the approach of the [`envy`] crate: variables are fed through a
//! `serde` map deserializer whose values parse themselves into whatever primitive the target
//! field asks for.
//!
//! [`envy`]: https://github.com/softprops/envy

use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::de::value::MapDeserializer;
use serde::de::{self, IntoDeserializer};
use thiserror::Error;

pub const DEFAULT_HELIX_URL: &str = "https://api.twitch.tv/helix";
pub const DEFAULT_TMI_URL: &str = "https://tmi.twitch.tv";
pub const DEFAULT_LOG_FILTER: &str = "chatter_overlap=debug,sqlx=info,info";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    pub client_id: String,
    pub app_token: String,
    pub database_url: Option<String>,

    #[serde(default = "default_helix_url")]
    pub helix_url: String,
    #[serde(default = "default_tmi_url")]
    pub tmi_url: String,

    #[serde(default = "default_min_viewers")]
    pub min_viewers: u32,
    #[serde(default = "default_min_chatters")]
    pub min_chatters: u32,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    pub worker_threads: Option<usize>,
    pub engine_deadline_secs: Option<u64>,
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_fetch_per_second")]
    pub fetch_per_second: usize,
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,

    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Config {
    /// Loads `.env` (if present), then any extra dotenv file, then deserializes the process
    /// environment.
    pub fn from_env(extra_env_file: Option<&Path>) -> EnvResult<Self> {
        // a missing `.env` is fine; a malformed one is not
        match dotenvy::dotenv() {
            Ok(_) => (),
            Err(e) if e.not_found() => (),
            Err(e) => return Err(e.into()),
        }

        if let Some(path) = extra_env_file {
            dotenvy::from_path(path)?;
        }

        Ok(from_iter(dotenvy::vars())?)
    }

    pub fn workers(&self) -> NonZeroUsize {
        self.worker_threads
            .and_then(NonZeroUsize::new)
            .or_else(|| std::thread::available_parallelism().ok())
            .unwrap_or(NonZeroUsize::MIN)
    }

    pub fn engine_deadline(&self) -> Option<Duration> {
        self.engine_deadline_secs.map(Duration::from_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs.max(1))
    }
}

#[inline]
fn default_helix_url() -> String {
    DEFAULT_HELIX_URL.to_string()
}

#[inline]
fn default_tmi_url() -> String {
    DEFAULT_TMI_URL.to_string()
}

#[inline]
const fn default_min_viewers() -> u32 {
    1500
}

#[inline]
const fn default_min_chatters() -> u32 {
    100
}

#[inline]
const fn default_retention_days() -> u32 {
    14
}

#[inline]
const fn default_fetch_concurrency() -> usize {
    25
}

#[inline]
const fn default_fetch_per_second() -> usize {
    50
}

#[inline]
const fn default_cycle_interval_secs() -> u64 {
    600
}

#[inline]
fn default_service_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

#[inline]
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

// ---
//  Deserializer implementation
// ---

/// A single variable's value, tagged with its name for error messages.
struct Val(String, String);

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for Val {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

macro_rules! forward_parsed_vals {
    ($($ty:ident => $method:ident,)*) => {
        $(
            fn $method<V>(self, visitor: V) -> Result<V::Value, EnvDeserializeError>
            where
                V: de::Visitor<'de>
            {
                match self.1.trim().parse::<$ty>() {
                    Ok(val) => val.into_deserializer().$method(visitor),
                    Err(e) => Err(de::Error::custom(format_args!(
                        "{}: while parsing '{}' (variable: {})",
                        e, self.1, self.0
                    ))),
                }
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for Val {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.1.into_deserializer().deserialize_any(visitor)
    }

    /// Empty variables read as unset.
    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        if self.1.trim().is_empty() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_newtype_struct<V>(
        self,
        _: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    forward_parsed_vals! {
        bool => deserialize_bool,
        u8 => deserialize_u8,
        u16 => deserialize_u16,
        u32 => deserialize_u32,
        u64 => deserialize_u64,
        i8 => deserialize_i8,
        i16 => deserialize_i16,
        i32 => deserialize_i32,
        i64 => deserialize_i64,
        f32 => deserialize_f32,
        f64 => deserialize_f64,
    }

    serde::forward_to_deserialize_any! {
        char str string unit bytes byte_buf map seq enum
        unit_struct tuple_struct identifier tuple
        ignored_any struct
    }
}

/// Deserializes `T` from an explicit set of `(name, value)` pairs.
pub fn from_iter<Iter, T>(iter: Iter) -> Result<T, EnvDeserializeError>
where
    T: de::DeserializeOwned,
    Iter: IntoIterator<Item = (String, String)>,
{
    let vars = iter.into_iter().map(|(k, v)| (k.clone(), Val(k, v)));
    T::deserialize(MapDeserializer::new(vars))
}

impl de::Error for EnvDeserializeError {
    fn custom<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        EnvDeserializeError::Custom(msg.to_string())
    }

    fn missing_field(field: &'static str) -> Self {
        EnvDeserializeError::MissingValue(field.into())
    }
}

pub type EnvResult<T> = core::result::Result<T, EnvErr>;

#[derive(Debug, Error)]
pub enum EnvErr {
    #[error(transparent)]
    Dotenvy(#[from] dotenvy::Error),

    #[error(transparent)]
    DeserializationError(#[from] EnvDeserializeError),
}

#[derive(Debug, Error)]
pub enum EnvDeserializeError {
    #[error("env deserialization error: {0}")]
    Custom(String),

    #[error("missing required variable: {0}")]
    MissingValue(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_applied() {
        let config: Config =
            from_iter(vars(&[("CLIENT_ID", "abc"), ("APP_TOKEN", "def"), ("HOME", "/root")]))
                .unwrap();

        assert_eq!(config.client_id, "abc");
        assert_eq!(config.helix_url, DEFAULT_HELIX_URL);
        assert_eq!(config.min_viewers, 1500);
        assert_eq!(config.min_chatters, 100);
        assert_eq!(config.retention(), chrono::Duration::days(14));
        assert!(config.database_url.is_none());
        assert!(config.engine_deadline().is_none());
    }

    #[test]
    fn test_numeric_and_optional_values() {
        let config: Config = from_iter(vars(&[
            ("CLIENT_ID", "abc"),
            ("APP_TOKEN", "def"),
            ("MIN_CHATTERS", "500"),
            ("WORKER_THREADS", "3"),
            ("ENGINE_DEADLINE_SECS", " 30 "),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", ""),
            ("DATABASE_URL", "postgres://localhost/overlap"),
        ]))
        .unwrap();

        assert_eq!(config.min_chatters, 500);
        assert_eq!(config.workers().get(), 3);
        assert_eq!(config.engine_deadline(), Some(Duration::from_secs(30)));
        assert!(config.otel_exporter_otlp_endpoint.is_none());
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/overlap"));
    }

    #[test]
    fn test_missing_required_variable() {
        let err = from_iter::<_, Config>(vars(&[("CLIENT_ID", "abc")])).unwrap_err();
        assert!(matches!(err, EnvDeserializeError::MissingValue(ref v) if v == "APP_TOKEN"));
    }

    #[test]
    fn test_bad_number_names_variable() {
        let err = from_iter::<_, Config>(vars(&[
            ("CLIENT_ID", "abc"),
            ("APP_TOKEN", "def"),
            ("MIN_VIEWERS", "lots"),
        ]))
        .unwrap_err();

        assert!(err.to_string().contains("MIN_VIEWERS"));
    }
}
