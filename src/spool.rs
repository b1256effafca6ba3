//! Article storage: one file per article, one directory per group.
//!
//! `comp.lang.rust` article 42 lives at `<spool>/comp/lang/rust/42`.
//! Decoded articles are kept in an LRU cache so thread walking, which
//! revisits parents constantly, does not re-parse the same files.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use mail_parser::MessageParser;
use tracing::{debug, warn};

use crate::error::{NewsError, Result};
use crate::model::ArtNo;

/// Default number of decoded articles to keep in the LRU cache.
const DEFAULT_CACHE_SIZE: usize = 50;

/// A parsed article, headers of interest pre-extracted.
#[derive(Debug, Clone, Default)]
pub struct Article {
    pub id: String,
    pub subject: String,
    /// Ancestor chain from the References header, oldest first.
    pub references: Vec<String>,
    /// Children recorded by back-reference splicing.
    pub back_refs: Vec<String>,
    pub date: i64,
    pub body: String,
}

/// Where articles come from. The session layer only talks to this.
pub trait ArticleSource {
    /// Cheap existence probe, used by traversal to skip expiry gaps.
    fn exists(&self, group: &str, article: ArtNo) -> bool;

    fn fetch(&mut self, group: &str, article: ArtNo) -> Result<Article>;

    /// Splice a child's message-ID into an article's back-reference
    /// list, in place, so later readers can walk the thread downward.
    fn append_backref(&mut self, group: &str, article: ArtNo, child_id: &str) -> Result<()>;
}

/// Filesystem spool.
pub struct SpoolStore {
    root: PathBuf,
    cache: LruCache<(String, ArtNo), Article>,
}

impl SpoolStore {
    pub fn open(root: impl AsRef<Path>, cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size)
            .or(NonZeroUsize::new(DEFAULT_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            root: root.as_ref().to_path_buf(),
            cache: LruCache::new(cache_size),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of an article.
    pub fn article_path(&self, group: &str, article: ArtNo) -> PathBuf {
        let mut path = self.root.clone();
        for part in group.split('.') {
            path.push(part);
        }
        path.push(article.to_string());
        path
    }

    fn parse(&self, place: &str, raw: &str) -> Article {
        let parsed = MessageParser::default().parse(raw.as_bytes());

        let mut art = Article {
            id: header_value(raw, "Message-ID")
                .as_deref()
                .map(first_angle_id)
                .unwrap_or_default(),
            subject: String::new(),
            references: header_value(raw, "References")
                .as_deref()
                .map(angle_ids)
                .unwrap_or_default(),
            back_refs: header_value(raw, "Back-References")
                .as_deref()
                .map(angle_ids)
                .unwrap_or_default(),
            date: 0,
            body: String::new(),
        };

        match parsed {
            Some(msg) => {
                art.subject = msg.subject().unwrap_or_default().to_string();
                if art.id.is_empty() {
                    art.id = msg
                        .message_id()
                        .map(|id| format!("<{id}>"))
                        .unwrap_or_default();
                }
                art.date = msg.date().map(|d| d.to_timestamp()).unwrap_or(0);
                art.body = msg
                    .body_text(0)
                    .map(|s| s.into_owned())
                    .unwrap_or_default();
            }
            None => {
                // header-only fallback; keep what the scanner found
                warn!(place, "article did not parse as a message");
                art.subject = header_value(raw, "Subject").unwrap_or_default();
                art.body = raw
                    .split_once("\n\n")
                    .map(|(_, b)| b.to_string())
                    .unwrap_or_default();
            }
        }
        art
    }
}

impl ArticleSource for SpoolStore {
    fn exists(&self, group: &str, article: ArtNo) -> bool {
        self.article_path(group, article).is_file()
    }

    fn fetch(&mut self, group: &str, article: ArtNo) -> Result<Article> {
        let key = (group.to_string(), article);
        if let Some(art) = self.cache.get(&key) {
            return Ok(art.clone());
        }

        let path = self.article_path(group, article);
        let place = format!("{group}/{article}");
        debug!(path = %path.display(), "reading article");
        let raw = fs::read_to_string(&path).map_err(|e| NewsError::Fetch {
            place: place.clone(),
            reason: e.to_string(),
        })?;
        let art = self.parse(&place, &raw);
        self.cache.put(key, art.clone());
        Ok(art)
    }

    fn append_backref(&mut self, group: &str, article: ArtNo, child_id: &str) -> Result<()> {
        let path = self.article_path(group, article);
        let raw = fs::read_to_string(&path).map_err(|e| NewsError::io(&path, e))?;

        let mut out = String::with_capacity(raw.len() + child_id.len() + 24);
        let mut done = false;
        let mut in_headers = true;
        for line in raw.split_inclusive('\n') {
            if in_headers && !done {
                if line.trim_start().to_ascii_lowercase().starts_with("back-references:") {
                    // extend the existing header
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    out.push_str(trimmed);
                    out.push(' ');
                    out.push_str(child_id);
                    out.push('\n');
                    done = true;
                    continue;
                }
                if line == "\n" || line == "\r\n" {
                    // end of headers; add the header before the blank line
                    out.push_str("Back-References: ");
                    out.push_str(child_id);
                    out.push('\n');
                    done = true;
                    in_headers = false;
                }
            }
            out.push_str(line);
        }
        if !done {
            // no body separator at all
            out.push_str("Back-References: ");
            out.push_str(child_id);
            out.push('\n');
        }

        let tmp = path.with_extension("new");
        fs::write(&tmp, out).map_err(|e| NewsError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| NewsError::io(&path, e))?;
        self.cache.pop(&(group.to_string(), article));
        debug!(group, article, child = child_id, "back-reference spliced");
        Ok(())
    }
}

/// Case-insensitive header lookup over raw text, unfolding continuation
/// lines. mail-parser covers the common headers; this handles the ones
/// it has no accessor for.
fn header_value(raw: &str, name: &str) -> Option<String> {
    let mut value: Option<String> = None;
    for line in raw.lines() {
        if line.is_empty() {
            break;
        }
        if let Some(v) = &mut value {
            if line.starts_with([' ', '\t']) {
                v.push(' ');
                v.push_str(line.trim());
                continue;
            }
            break;
        }
        if let Some((key, rest)) = line.split_once(':') {
            if key.eq_ignore_ascii_case(name) {
                value = Some(rest.trim().to_string());
            }
        }
    }
    value
}

/// All `<...>` tokens in a header value, in order.
fn angle_ids(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        out.push(rest[start..start + len + 1].to_string());
        rest = &rest[start + len + 1..];
    }
    out
}

fn first_angle_id(value: &str) -> String {
    angle_ids(value).into_iter().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Path: site!reader\n\
        From: someone@example.org\n\
        Message-ID: <art1@example.org>\n\
        Subject: testing the spool\n\
        References: <root@example.org> <mid@example.org>\n\
        Date: Tue, 14 Feb 1989 10:00:00 +0000\n\
        \n\
        Hello there.\n";

    fn spool_with(articles: &[(&str, ArtNo, &str)]) -> (tempfile::TempDir, SpoolStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SpoolStore::open(dir.path(), 8);
        for (group, art, text) in articles {
            let path = store.article_path(group, *art);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        }
        (dir, store)
    }

    #[test]
    fn test_article_path_layout() {
        let store = SpoolStore::open("/spool", 8);
        assert_eq!(
            store.article_path("comp.lang.rust", 42),
            PathBuf::from("/spool/comp/lang/rust/42")
        );
    }

    #[test]
    fn test_fetch_parses_headers() {
        let (_d, mut store) = spool_with(&[("alt.test", 5, SAMPLE)]);
        assert!(store.exists("alt.test", 5));
        assert!(!store.exists("alt.test", 6));

        let art = store.fetch("alt.test", 5).unwrap();
        assert_eq!(art.id, "<art1@example.org>");
        assert_eq!(art.subject, "testing the spool");
        assert_eq!(
            art.references,
            vec!["<root@example.org>", "<mid@example.org>"]
        );
        assert!(art.back_refs.is_empty());
        assert!(art.body.contains("Hello there."));
    }

    #[test]
    fn test_fetch_missing_degrades() {
        let (_d, mut store) = spool_with(&[]);
        let err = store.fetch("alt.test", 1).unwrap_err();
        assert!(matches!(err, NewsError::Fetch { .. }));
    }

    #[test]
    fn test_append_backref_creates_header() {
        let (_d, mut store) = spool_with(&[("alt.test", 5, SAMPLE)]);
        store.append_backref("alt.test", 5, "<kid@x>").unwrap();
        store.append_backref("alt.test", 5, "<kid2@y>").unwrap();

        let art = store.fetch("alt.test", 5).unwrap();
        assert_eq!(art.back_refs, vec!["<kid@x>", "<kid2@y>"]);
        // body untouched
        assert!(art.body.contains("Hello there."));
    }

    #[test]
    fn test_fetch_is_cached() {
        let (_d, mut store) = spool_with(&[("alt.test", 5, SAMPLE)]);
        store.fetch("alt.test", 5).unwrap();
        // remove the file; the cache still answers
        fs::remove_file(store.article_path("alt.test", 5)).unwrap();
        assert!(store.fetch("alt.test", 5).is_ok());
    }

    #[test]
    fn test_header_folding() {
        let folded = "References: <a@x>\n\t<b@y>\nSubject: x\n\nbody\n";
        assert_eq!(
            header_value(folded, "references").unwrap(),
            "<a@x> <b@y>"
        );
        assert_eq!(angle_ids("<a@x> junk <b@y>"), vec!["<a@x>", "<b@y>"]);
    }
}
