//! Validated identifier primitives.
//!
//! Every identifier that crosses a storage or wire boundary is a branded
//! newtype constructed through validation, so the rest of the codebase can
//! take well-formedness for granted.

use snafu::Snafu;

use crate::define_str_id;

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[snafu(display("invalid DID `{input}`: {reason}"))]
    InvalidDid { input: String, reason: &'static str },
    #[snafu(display("invalid handle `{input}`: {reason}"))]
    InvalidHandle { input: String, reason: &'static str },
    #[snafu(display("invalid post URI `{input}`: {reason}"))]
    InvalidPostUri { input: String, reason: &'static str },
    #[snafu(display("invalid CID `{input}`: {reason}"))]
    InvalidCid { input: String, reason: &'static str },
    #[snafu(display("invalid hashtag `{input}`: {reason}"))]
    InvalidHashtag { input: String, reason: &'static str },
    #[snafu(display("invalid store name `{input}`: {reason}"))]
    InvalidStoreName { input: String, reason: &'static str },
}

pub type IdParseResult<T> = Result<T, IdParseError>;

define_str_id!(
    /// Decentralized identifier, e.g. `did:plc:ewvi7nxzyoun6zhxrhs64oiz`.
    struct Did, validate_did
);

define_str_id!(
    /// Account handle in domain form, e.g. `alice.bsky.social`.
    ///
    /// Stored lowercased; a leading `@` is stripped on parse.
    struct Handle, validate_handle
);

define_str_id!(
    /// Record URI of the form `at://<did>/<collection>/<rkey>`.
    struct PostUri, validate_post_uri
);

define_str_id!(
    /// Content identifier of a record revision.
    struct Cid, validate_cid
);

define_str_id!(
    /// Normalized hashtag: lowercased, no leading `#`.
    struct Hashtag, validate_hashtag
);

define_str_id!(
    /// Store name slug: `[a-z0-9][a-z0-9_-]*`, at most 64 characters.
    struct StoreName, validate_store_name
);

fn validate_did(s: &str) -> IdParseResult<String> {
    let err = |reason| {
        Err(IdParseError::InvalidDid {
            input: s.to_owned(),
            reason,
        })
    };
    let Some(rest) = s.strip_prefix("did:") else {
        return err("missing `did:` prefix");
    };
    let Some((method, identifier)) = rest.split_once(':') else {
        return err("missing method separator");
    };
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_lowercase()) {
        return err("method must be non-empty lowercase ascii");
    }
    if identifier.is_empty() {
        return err("empty method-specific identifier");
    }
    if !identifier
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b':' | b'%'))
    {
        return err("identifier contains forbidden characters");
    }
    Ok(s.to_owned())
}

fn validate_handle(s: &str) -> IdParseResult<String> {
    let stripped = s.strip_prefix('@').unwrap_or(s);
    let normalized = stripped.to_ascii_lowercase();
    let err = |reason| {
        Err(IdParseError::InvalidHandle {
            input: s.to_owned(),
            reason,
        })
    };
    if normalized.is_empty() {
        return err("empty");
    }
    if 253 < normalized.len() {
        return err("longer than 253 characters");
    }
    let labels: Vec<&str> = normalized.split('.').collect();
    if labels.len() < 2 {
        return err("must contain at least two dot-separated labels");
    }
    for label in labels {
        if label.is_empty() || 63 < label.len() {
            return err("label must be 1..=63 characters");
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return err("label contains forbidden characters");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return err("label must not start or end with `-`");
        }
    }
    Ok(normalized)
}

fn validate_post_uri(s: &str) -> IdParseResult<String> {
    let err = |reason| {
        Err(IdParseError::InvalidPostUri {
            input: s.to_owned(),
            reason,
        })
    };
    let Some(rest) = s.strip_prefix("at://") else {
        return err("missing `at://` scheme");
    };
    let mut parts = rest.splitn(3, '/');
    let (Some(authority), Some(collection), Some(rkey)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return err("expected `at://<authority>/<collection>/<rkey>`");
    };
    validate_did(authority).map_err(|_| IdParseError::InvalidPostUri {
        input: s.to_owned(),
        reason: "authority is not a valid DID",
    })?;
    if collection.is_empty()
        || !collection
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.')
    {
        return err("collection must be a dotted NSID");
    }
    if rkey.is_empty()
        || !rkey
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b'~' | b':'))
    {
        return err("record key contains forbidden characters");
    }
    Ok(s.to_owned())
}

fn validate_cid(s: &str) -> IdParseResult<String> {
    let err = |reason| {
        Err(IdParseError::InvalidCid {
            input: s.to_owned(),
            reason,
        })
    };
    if s.len() < 8 {
        return err("too short");
    }
    if !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return err("must be ascii alphanumeric");
    }
    Ok(s.to_owned())
}

fn validate_hashtag(s: &str) -> IdParseResult<String> {
    let stripped = s.strip_prefix('#').unwrap_or(s);
    let normalized: String = stripped.to_lowercase();
    let err = |reason| {
        Err(IdParseError::InvalidHashtag {
            input: s.to_owned(),
            reason,
        })
    };
    if normalized.is_empty() {
        return err("empty");
    }
    if normalized.chars().any(|c| c.is_whitespace() || c == '#') {
        return err("must not contain whitespace or `#`");
    }
    Ok(normalized)
}

fn validate_store_name(s: &str) -> IdParseResult<String> {
    let err = |reason| {
        Err(IdParseError::InvalidStoreName {
            input: s.to_owned(),
            reason,
        })
    };
    if s.is_empty() {
        return err("empty");
    }
    if 64 < s.len() {
        return err("longer than 64 characters");
    }
    let mut bytes = s.bytes();
    let first = bytes.next().expect("non-empty");
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return err("must start with a lowercase letter or digit");
    }
    if !s
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_'))
    {
        return err("allowed characters are a-z, 0-9, `-`, `_`");
    }
    Ok(s.to_owned())
}

impl PostUri {
    /// Builds a URI from its parts, skipping re-validation of the pieces the
    /// type system already vouches for.
    pub fn from_parts(authority: &Did, collection: &str, rkey: &str) -> IdParseResult<Self> {
        format!("at://{authority}/{collection}/{rkey}").parse()
    }

    pub fn authority(&self) -> Did {
        let rest = &self.as_str()["at://".len()..];
        let authority = rest.split('/').next().expect("validated on construction");
        Did(authority.to_owned())
    }

    pub fn collection(&self) -> &str {
        self.part(1)
    }

    pub fn rkey(&self) -> &str {
        self.part(2)
    }

    fn part(&self, idx: usize) -> &str {
        self.as_str()["at://".len()..]
            .split('/')
            .nth(idx)
            .expect("validated on construction")
    }
}
