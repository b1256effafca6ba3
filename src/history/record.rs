//! History entry records.
//!
//! One entry per line: `<id>\t<received> <expires>\t<body>`. The body is
//! a space-separated list of `group/number` locations for an article we
//! hold, a list of `<`-prefixed message-IDs for a reference placeholder
//! (children waiting for a parent that has not arrived), the literal
//! `cancelled`, or empty for an article that has expired everywhere.

use std::fmt;
use std::str::FromStr;

use crate::error::{NewsError, Result};
use crate::model::ArtNo;

/// Derived status of a history lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStatus {
    Valid,
    Expired,
    Cancelled,
    Reference,
    Garbled,
}

/// A location as stored in the history file, not yet resolved against
/// the active table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLocation {
    pub group: String,
    pub article: ArtNo,
}

impl RawLocation {
    pub fn new(group: impl Into<String>, article: ArtNo) -> Self {
        Self {
            group: group.into(),
            article,
        }
    }
}

impl fmt::Display for RawLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.article)
    }
}

impl FromStr for RawLocation {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        let (group, art) = s.rsplit_once('/').ok_or(())?;
        if group.is_empty() {
            return Err(());
        }
        let article = art.parse().map_err(|_| ())?;
        Ok(Self::new(group, article))
    }
}

/// Entry body. Exactly one of these shapes, never a sentinel value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBody {
    /// Article held locally at these places.
    Places(Vec<RawLocation>),
    /// Placeholder for an absent parent; holds the IDs of children that
    /// cited it.
    Refs(Vec<String>),
    Cancelled,
    Expired,
}

impl EntryBody {
    pub fn status(&self) -> HistoryStatus {
        match self {
            EntryBody::Places(_) => HistoryStatus::Valid,
            EntryBody::Refs(_) => HistoryStatus::Reference,
            EntryBody::Cancelled => HistoryStatus::Cancelled,
            EntryBody::Expired => HistoryStatus::Expired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: String,
    pub received: i64,
    pub expires: i64,
    pub body: EntryBody,
}

impl HistoryEntry {
    pub fn status(&self) -> HistoryStatus {
        self.body.status()
    }

    /// Parse a history line. Failure means the line is garbled; the
    /// caller decides whether that is fatal.
    pub fn parse(line: &str, line_no: u64) -> Result<Self> {
        Self::parse_inner(line).ok_or(NewsError::Garbled { line: line_no })
    }

    fn parse_inner(line: &str) -> Option<Self> {
        let mut fields = line.splitn(3, '\t');
        let id = fields.next()?;
        if id.is_empty() {
            return None;
        }
        let dates = fields.next()?;
        let body_text = fields.next().unwrap_or("");

        let (received, expires) = match dates.split_once(' ') {
            Some((r, e)) => (r.parse().ok()?, e.parse().ok()?),
            // a lone receipt date means no recorded expiry
            None => (dates.parse().ok()?, 0),
        };

        let body = if body_text.is_empty() {
            EntryBody::Expired
        } else if body_text == "cancelled" {
            EntryBody::Cancelled
        } else if body_text.starts_with('<') {
            let refs: Vec<String> = body_text
                .split_whitespace()
                .map(str::to_string)
                .collect();
            if refs.iter().any(|r| !r.starts_with('<')) {
                return None;
            }
            EntryBody::Refs(refs)
        } else {
            let mut places = Vec::new();
            for tok in body_text.split_whitespace() {
                places.push(tok.parse().ok()?);
            }
            EntryBody::Places(places)
        };

        Some(Self {
            id: id.to_string(),
            received,
            expires,
            body,
        })
    }
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{} {}\t", self.id, self.received, self.expires)?;
        match &self.body {
            EntryBody::Places(places) => {
                for (i, p) in places.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{p}")?;
                }
            }
            EntryBody::Refs(refs) => {
                for (i, r) in refs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{r}")?;
                }
            }
            EntryBody::Cancelled => write!(f, "cancelled")?,
            EntryBody::Expired => {}
        }
        Ok(())
    }
}
