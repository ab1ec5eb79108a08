//! `PresentationId`: UTF-8 string of at least 16 printable ASCII characters
//! (spec §3). `make_presentation_id` resolves the §9 Open Question on how a
//! controller should mint one (see `DESIGN.md`).

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

const MIN_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresentationIdError {
    #[error("presentation id too short: {0} chars, need at least {MIN_LEN}")]
    TooShort(usize),
    #[error("presentation id contains non-printable-ASCII byte {0:#04x}")]
    NotPrintableAscii(u8),
}

/// A validated presentation identifier (spec §3: "UTF-8 string ≥ 16
/// printable ASCII").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PresentationId(String);

impl PresentationId {
    pub fn new(id: impl Into<String>) -> Result<Self, PresentationIdError> {
        let id = id.into();
        if id.len() < MIN_LEN {
            return Err(PresentationIdError::TooShort(id.len()));
        }
        for &byte in id.as_bytes() {
            if !(0x20..=0x7e).contains(&byte) {
                return Err(PresentationIdError::NotPrintableAscii(byte));
            }
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PresentationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PresentationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Mint a new globally-unique presentation id.
///
/// Resolves spec.md §9's Open Question: the original source's placeholder
/// (`service_id + ":" + url`, unprintable characters rewritten to `.`) is
/// not carried forward. Instead: `"p-"` followed by a v4 UUID's simple
/// (hyphen-free hex) form — 38 printable-ASCII characters, well over the
/// 16-character floor, unique with UUIDv4's collision probability, and
/// independent of the URL or service id so it carries no information an
/// observer could use to correlate presentations across receivers.
#[must_use]
pub fn make_presentation_id() -> PresentationId {
    let id = format!("p-{}", Uuid::new_v4().simple());
    PresentationId::new(id).expect("uuid-derived id always satisfies the length/charset rules")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_ids() {
        assert_eq!(
            PresentationId::new("short").unwrap_err(),
            PresentationIdError::TooShort(5)
        );
    }

    #[test]
    fn rejects_non_printable_ascii() {
        let err = PresentationId::new("abcdefghijklmno\u{0}").unwrap_err();
        assert!(matches!(err, PresentationIdError::NotPrintableAscii(0)));
    }

    #[test]
    fn accepts_minimum_length_printable_ascii() {
        assert!(PresentationId::new("0123456789abcdef").is_ok());
    }

    #[test]
    fn make_presentation_id_is_unique_and_valid() {
        let a = make_presentation_id();
        let b = make_presentation_id();
        assert_ne!(a, b);
        assert!(a.as_str().len() >= MIN_LEN);
    }
}
