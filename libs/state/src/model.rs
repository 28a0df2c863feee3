//! Desired and actual attribute state.
//!
//! An *attribute* is one managed resource instance on the node (a deployed
//! stack, the agent binary itself, a shell command), identified by an opaque
//! string id plus an [`AttributeKind`]. The control plane describes what each
//! attribute should look like ([`DesiredAttribute`]); the achiever records
//! what was last achieved ([`ActualAttribute`]).
//!
//! Snapshots ([`DesiredState`], [`ActualState`]) are plain values: cloning is
//! a deep copy and equality is structural, so a snapshot handed to another
//! task can never be aliased by the producer.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Coded enums
// =============================================================================

/// Wire form accepted for coded enums: a variant name or its raw integer.
#[derive(Deserialize)]
#[serde(untagged)]
enum NameOrCode {
    Code(u32),
    Name(String),
}

/// Implements code-based equality and name-or-integer serde for a coded enum.
///
/// Equality and hashing go through `code()`, so `Other(n)` for a named code
/// is the same value as the named variant. Known variants serialize by name.
/// Codes without a name serialize as the bare integer so documents written by
/// a newer agent survive a round-trip.
macro_rules! impl_coded_serde {
    ($ty:ident, $what:literal) => {
        impl PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                self.code() == other.code()
            }
        }

        impl Eq for $ty {}

        impl std::hash::Hash for $ty {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                self.code().hash(state);
            }
        }

        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                match self.name() {
                    Some(name) => serializer.serialize_str(name),
                    None => serializer.serialize_u32(self.code()),
                }
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                match NameOrCode::deserialize(deserializer)? {
                    NameOrCode::Code(code) => Ok(Self::from_code(code)),
                    NameOrCode::Name(name) => Self::from_name(&name).ok_or_else(|| {
                        serde::de::Error::custom(format!(concat!("unknown ", $what, " {:?}"), name))
                    }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.name() {
                    Some(name) => f.write_str(name),
                    None => write!(f, "{}({})", stringify!($ty), self.code()),
                }
            }
        }
    };
}

/// What a managed attribute represents.
///
/// Selects the microcontroller factory that handles the attribute.
#[derive(Debug, Clone, Copy)]
pub enum AttributeKind {
    /// A deployed docker stack.
    DockerStack,
    /// The agent's own binary.
    AgentBinary,
    /// A shell command.
    Shell,
    /// A code this build has no name for.
    Other(u32),
}

impl AttributeKind {
    /// Numeric code of the kind.
    pub const fn code(self) -> u32 {
        match self {
            Self::DockerStack => 0,
            Self::AgentBinary => 1,
            Self::Shell => 2,
            Self::Other(code) => code,
        }
    }

    /// Kind for a numeric code; unnamed codes map to [`AttributeKind::Other`].
    pub const fn from_code(code: u32) -> Self {
        match code {
            0 => Self::DockerStack,
            1 => Self::AgentBinary,
            2 => Self::Shell,
            other => Self::Other(other),
        }
    }

    /// Variant name, `None` for unnamed codes.
    pub const fn name(self) -> Option<&'static str> {
        match Self::from_code(self.code()) {
            Self::DockerStack => Some("DockerStack"),
            Self::AgentBinary => Some("AgentBinary"),
            Self::Shell => Some("Shell"),
            Self::Other(_) => None,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "DockerStack" => Some(Self::DockerStack),
            "AgentBinary" => Some(Self::AgentBinary),
            "Shell" => Some(Self::Shell),
            _ => None,
        }
    }
}

impl_coded_serde!(AttributeKind, "attribute kind");

/// Progress of an actual attribute, ordered from `Undefined` to `Finished`.
#[derive(Debug, Clone, Copy, Default)]
pub enum ActualStatus {
    #[default]
    Undefined,
    Pending,
    InProgress,
    Finished,
    /// A code this build has no name for.
    Other(u32),
}

impl ActualStatus {
    /// Numeric code of the status.
    pub const fn code(self) -> u32 {
        match self {
            Self::Undefined => 0,
            Self::Pending => 1,
            Self::InProgress => 2,
            Self::Finished => 3,
            Self::Other(code) => code,
        }
    }

    /// Status for a numeric code; unnamed codes map to [`ActualStatus::Other`].
    pub const fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Undefined,
            1 => Self::Pending,
            2 => Self::InProgress,
            3 => Self::Finished,
            other => Self::Other(other),
        }
    }

    /// Variant name, `None` for unnamed codes.
    pub const fn name(self) -> Option<&'static str> {
        match Self::from_code(self.code()) {
            Self::Undefined => Some("Undefined"),
            Self::Pending => Some("Pending"),
            Self::InProgress => Some("InProgress"),
            Self::Finished => Some("Finished"),
            Self::Other(_) => None,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Undefined" => Some(Self::Undefined),
            "Pending" => Some(Self::Pending),
            "InProgress" => Some(Self::InProgress),
            "Finished" => Some(Self::Finished),
            _ => None,
        }
    }
}

impl PartialOrd for ActualStatus {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ActualStatus {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.code().cmp(&other.code())
    }
}

impl_coded_serde!(ActualStatus, "actual status");

// =============================================================================
// Attributes
// =============================================================================

/// Generation number of one attribute's desired configuration.
///
/// Offsets are only ever compared for equality: a different offset means a
/// new work item. Zero means "nothing desired".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttrOffset(pub u64);

impl AttrOffset {
    /// The "no desired configuration" sentinel.
    pub const UNSET: Self = Self(0);

    /// Returns true for the zero sentinel.
    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for AttrOffset {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for AttrOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Desired configuration of one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DesiredAttribute {
    pub kind: AttributeKind,
    #[serde(default)]
    pub offset: AttrOffset,
    /// Earliest time the attribute may be reconciled; `None` means now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl DesiredAttribute {
    /// Create an attribute that is due immediately and has no args.
    pub fn new(kind: AttributeKind, offset: impl Into<AttrOffset>, value: impl Into<String>) -> Self {
        Self {
            kind,
            offset: offset.into(),
            schedule_time: None,
            value: value.into(),
            args: Vec::new(),
        }
    }

    /// Set the args.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the schedule time.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule_time = Some(at);
        self
    }

    /// Returns true once the schedule time has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.schedule_time.map_or(true, |at| at <= now)
    }
}

/// Last achieved state of one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActualAttribute {
    pub kind: AttributeKind,
    #[serde(default)]
    pub offset: AttrOffset,
    /// Unix milliseconds of the last attempt.
    #[serde(default)]
    pub time_ms: i64,
    #[serde(default)]
    pub attempt_num: u32,
    #[serde(default)]
    pub status: ActualStatus,
    /// Non-empty when the last attempt failed, whatever the status says.
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub info: String,
}

impl ActualAttribute {
    /// Zero-value attribute carrying only a kind.
    pub fn empty(kind: AttributeKind) -> Self {
        Self {
            kind,
            offset: AttrOffset::UNSET,
            time_ms: 0,
            attempt_num: 0,
            status: ActualStatus::Undefined,
            error: String::new(),
            info: String::new(),
        }
    }

    /// Returns true if the last attempt recorded an error.
    pub fn failed(&self) -> bool {
        !self.error.is_empty()
    }

    /// Convergence predicate: does this actual attribute achieve `desired`?
    pub fn achieves(&self, desired: &DesiredAttribute) -> bool {
        if desired.offset.is_unset() {
            return true;
        }
        self.kind == desired.kind
            && self.offset == desired.offset
            && self.status == ActualStatus::Finished
            && !self.failed()
    }
}

// =============================================================================
// State snapshots
// =============================================================================

/// Defines an id-keyed snapshot map over an attribute type.
macro_rules! define_state {
    ($(#[$meta:meta])* $name:ident, $attr:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(BTreeMap<String, $attr>);

        impl $name {
            /// Create an empty snapshot.
            pub fn new() -> Self {
                Self::default()
            }

            /// Insert or replace the attribute for `id`.
            pub fn insert(&mut self, id: impl Into<String>, attr: $attr) -> Option<$attr> {
                self.0.insert(id.into(), attr)
            }

            /// Remove the attribute for `id`.
            pub fn remove(&mut self, id: &str) -> Option<$attr> {
                self.0.remove(id)
            }

            pub fn get(&self, id: &str) -> Option<&$attr> {
                self.0.get(id)
            }

            pub fn get_mut(&mut self, id: &str) -> Option<&mut $attr> {
                self.0.get_mut(id)
            }

            /// Iterate over `(id, attribute)` pairs in id order.
            pub fn iter(&self) -> impl Iterator<Item = (&str, &$attr)> {
                self.0.iter().map(|(id, attr)| (id.as_str(), attr))
            }

            pub fn len(&self) -> usize {
                self.0.len()
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl<K: Into<String>> FromIterator<(K, $attr)> for $name {
            fn from_iter<I: IntoIterator<Item = (K, $attr)>>(iter: I) -> Self {
                Self(iter.into_iter().map(|(id, attr)| (id.into(), attr)).collect())
            }
        }

        impl IntoIterator for $name {
            type Item = (String, $attr);
            type IntoIter = std::collections::btree_map::IntoIter<String, $attr>;

            fn into_iter(self) -> Self::IntoIter {
                self.0.into_iter()
            }
        }
    };
}

define_state!(
    /// Desired configuration of every managed attribute, keyed by id.
    DesiredState,
    DesiredAttribute
);

define_state!(
    /// Last achieved state of every managed attribute, keyed by id.
    ActualState,
    ActualAttribute
);

impl ActualState {
    /// State-level convergence: every desired attribute with a non-zero
    /// offset has an achieving actual entry.
    pub fn achieves(&self, desired: &DesiredState) -> bool {
        desired.iter().all(|(id, want)| {
            want.offset.is_unset() || self.get(id).is_some_and(|have| have.achieves(want))
        })
    }
}
