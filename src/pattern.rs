//! Newsgroup name patterns.
//!
//! A specification is a comma-separated list of dotted patterns checked
//! left to right; the last pattern that matches wins. The segment `all`
//! matches any single name component, a trailing `all` matches any tail,
//! and a leading `!` turns a pattern into an exclusion. So
//! `comp.all,!comp.lang.all,comp.lang.rust` admits all of comp except
//! the language groups, then readmits comp.lang.rust.

/// Match one dotted pattern (no commas, no `!`) against a group name.
fn one_match(name: &str, pat: &str) -> bool {
    let mut name_parts = name.split('.');
    let mut pat_parts = pat.split('.').peekable();

    loop {
        match (name_parts.next(), pat_parts.next()) {
            (None, None) => return true,
            // a trailing "all" swallows the rest of the name
            (Some(_), Some("all")) if pat_parts.peek().is_none() => return true,
            (Some(n), Some(p)) if p == "all" || p == n => continue,
            _ => return false,
        }
    }
}

/// Does `name` fall inside the pattern specification `spec`?
pub fn matches(name: &str, spec: &str) -> bool {
    let mut verdict = false;
    for pat in spec.split(',') {
        let pat = pat.trim();
        if pat.is_empty() {
            continue;
        }
        let (pat, sense) = match pat.strip_prefix('!') {
            Some(rest) => (rest, false),
            None => (pat, true),
        };
        if one_match(name, pat) {
            verdict = sense;
        }
    }
    verdict
}
