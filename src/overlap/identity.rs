use std::collections::HashSet;
use std::collections::hash_set;

/// Suffix used to weed out bot accounts from a chatter list.
///
/// This is a heuristic: `abbot` is dropped and a bot named `nightbot_` is not, and we are fine
/// with both.
pub const BOT_SUFFIX: &str = "bot";

/// Lower-cased chatter logins for a single channel, with bot-suffixed entries removed.
///
/// Built once per collection cycle and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentitySet {
    inner: HashSet<String>,
}

impl IdentitySet {
    /// Builds a set from a raw chatter list.
    ///
    /// `reported` is the authoritative chatter count returned alongside the list (not the length
    /// of the filtered set); if it falls below `min_population` the channel is excluded and `None`
    /// is returned. Absent or empty entries are skipped.
    pub fn build<I, S>(raw: I, reported: u32, min_population: u32) -> Option<Self>
    where
        I: IntoIterator<Item = Option<S>>,
        S: AsRef<str>,
    {
        if reported < min_population {
            return None;
        }

        let inner = raw
            .into_iter()
            .flatten()
            .filter_map(|identity| normalize(identity.as_ref()))
            .collect();

        Some(Self { inner })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.inner.contains(identity)
    }

    pub fn iter(&self) -> hash_set::Iter<'_, String> {
        self.inner.iter()
    }
}

impl<'a> IntoIterator for &'a IdentitySet {
    type Item = &'a String;
    type IntoIter = hash_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

fn normalize(identity: &str) -> Option<String> {
    let identity = identity.trim().to_lowercase();
    if identity.is_empty() || identity.ends_with(BOT_SUFFIX) {
        return None;
    }

    Some(identity)
}
