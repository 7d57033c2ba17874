//! Macro for defining typed UIDs.

/// Defines a ULID-backed UID newtype with a fixed prefix.
///
/// The generated type is `Copy`, ordered by creation time, renders as
/// `{prefix}_{ulid}` and parses only that form.
///
/// ```ignore
/// define_uid!(FleetUid, "flt");
///
/// let uid = FleetUid::new();
/// let parsed: FleetUid = uid.to_string().parse()?;
/// ```
#[macro_export]
macro_rules! define_uid {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// The prefix for this UID type.
            pub const PREFIX: &'static str = $prefix;

            /// Mints a fresh UID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            #[must_use]
            pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            #[must_use]
            pub const fn ulid(&self) -> $crate::Ulid {
                self.0
            }

            /// Lowercase tail of the ULID, `len` characters long.
            ///
            /// The tail comes from the random half of the ULID, which makes it
            /// suitable as a collision-resistant object name suffix.
            #[must_use]
            pub fn suffix(&self, len: usize) -> String {
                let encoded = self.0.to_string().to_ascii_lowercase();
                let start = encoded.len().saturating_sub(len);
                encoded[start..].to_string()
            }

            /// Parses a UID of the form `{prefix}_{ulid}`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                use $crate::{IdError, IdProblem};

                if s.is_empty() {
                    return Err(IdError::new(Self::PREFIX, s, IdProblem::Empty));
                }
                let Some((prefix, ulid_str)) = s.split_once('_') else {
                    return Err(IdError::new(Self::PREFIX, s, IdProblem::MissingSeparator));
                };
                if prefix != Self::PREFIX {
                    let problem = IdProblem::ForeignPrefix(prefix.to_string());
                    return Err(IdError::new(Self::PREFIX, s, problem));
                }

                ulid_str.parse::<$crate::Ulid>().map(Self).map_err(|e| {
                    IdError::new(Self::PREFIX, s, IdProblem::BadUlid(e.to_string()))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
