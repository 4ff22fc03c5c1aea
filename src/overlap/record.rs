use core::fmt;

use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::{Decode, Encode, Postgres, Type};

use super::identity::IdentitySet;

/// Lower-cased channel login, used as the channel's identity within a batch.
///
/// Every way of building one (including deserialization and database decoding) goes through
/// [`ChannelId::new`], so two ids compare equal exactly when their normalised logins do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct ChannelId(String);

impl ChannelId {
    /// Lower-cases the login. Surrounding whitespace is also stripped, since chatter lists
    /// occasionally carry padded entries.
    pub fn new(login: &str) -> Self {
        Self(login.trim().to_lowercase())
    }

    #[cfg(test)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Type<Postgres> for ChannelId {
    fn type_info() -> PgTypeInfo {
        <String as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <String as Type<Postgres>>::compatible(ty)
    }
}

impl<'q> Encode<'q, Postgres> for ChannelId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        <String as Encode<'q, Postgres>>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> Decode<'r, Postgres> for ChannelId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let login = <String as Decode<'r, Postgres>>::decode(value)?;
        Ok(ChannelId::new(&login))
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        ChannelId::new(&value)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        ChannelId::new(value)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live metadata for a channel, as produced by discovery and enrichment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMeta {
    pub display_name: String,
    pub avatar: Option<String>,
    pub game: String,
    pub viewers: u32,
    pub chatters: u32,
}

/// A sampled channel together with its audience for the current cycle.
#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub id: ChannelId,
    pub meta: ChannelMeta,
    pub identities: IdentitySet,
}

impl ChannelRecord {
    pub fn new(id: impl Into<ChannelId>, meta: ChannelMeta, identities: IdentitySet) -> Self {
        Self {
            id: id.into(),
            meta,
            identities,
        }
    }
}

/// Implements equality, hashing and ordering on a struct using only its id field, so that
/// mutable metadata never takes part in map keys or sort order.
#[macro_export]
macro_rules! impl_keyed_by_id {
    ($struct:ty, $id:ident) => {
        impl PartialEq for $struct {
            fn eq(&self, other: &Self) -> bool {
                self.$id == other.$id
            }
        }

        impl Eq for $struct {}

        impl std::hash::Hash for $struct {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                self.$id.hash(state);
            }
        }

        impl PartialOrd for $struct {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $struct {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.$id.cmp(&other.$id)
            }
        }
    };
}

impl_keyed_by_id!(ChannelRecord, id);

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_identity_is_id_only() {
        let a = ChannelRecord::new("Foo", ChannelMeta::default(), IdentitySet::default());
        let mut b = a.clone();
        b.meta.viewers = 9001;
        b.meta.game = "Just Chatting".into();

        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_id_normalized() {
        assert_eq!(ChannelId::from("  SomeChannel ").as_str(), "somechannel");
    }

    #[test]
    fn test_deserialized_id_normalized() {
        let id: ChannelId = serde_json::from_str(r#""SomeChannel""#).unwrap();
        assert_eq!(id, ChannelId::from("somechannel"));

        let shared: std::collections::BTreeMap<ChannelId, i32> =
            serde_json::from_str(r#"{ "Foo": 1, "bar": 2 }"#).unwrap();
        assert!(shared.contains_key(&ChannelId::from("foo")));
    }
}
