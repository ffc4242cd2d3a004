pub mod event;
pub mod filter;
pub mod graph;
pub mod id;
pub mod post;
pub mod source;
pub mod time;

pub use self::event::{EventLogEntry, EventMeta, EventSeq, PostEvent, SourceKind};
pub use self::filter::{FilterExpr, FilterHash, OnErrorPolicy};
pub use self::id::{Cid, Did, Handle, Hashtag, PostUri, StoreName};
pub use self::post::Post;
pub use self::source::DataSource;
pub use self::time::Timestamp;

/// Defines a validated, string-backed identifier type.
///
/// The inner `String` is only ever constructed through the named validation
/// function, so holding a value of the type is proof the invariant held at
/// parse time. Serde round-trips through the string form and re-validates on
/// deserialization.
#[macro_export]
macro_rules! define_str_id {
    (
        $(#[$outer:meta])*
        struct $t:tt, $validate:path
    ) => {
        $(#[$outer])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
        pub struct $t(String);

        impl $t {
            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.0.as_str())
            }
        }

        impl std::str::FromStr for $t {
            type Err = $crate::id::IdParseError;

            fn from_str(s: &str) -> Result<$t, Self::Err> {
                $validate(s).map(Self)
            }
        }

        impl ::serde::Serialize for $t {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: ::serde::Serializer,
            {
                serializer.serialize_str(self.0.as_str())
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $t {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: ::serde::Deserializer<'de>,
            {
                let s = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(::serde::de::Error::custom)
            }
        }
    };
}
