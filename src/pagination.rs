use std::collections::HashSet;

use reqwest::header::{self, HeaderMap};
use url::Url;

use crate::{ResilientHttpError, Result};

/// Returns the target of the first `Link` entry whose `rel` includes `rel`.
///
/// Handles multiple `Link` headers, several comma separated entries per
/// header and quoted or bare `rel` values (`rel="prev next"`, `rel=next`).
pub fn find_link(headers: &HeaderMap, rel: &str) -> Option<String> {
    headers
        .get_all(header::LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| find_rel_in(value, rel))
}

fn find_rel_in(value: &str, rel: &str) -> Option<String> {
    let mut rest = value;
    loop {
        let open = rest.find('<')?;
        let after_open = &rest[open + 1..];
        let close = after_open.find('>')?;
        let target = after_open[..close].trim();
        let tail = &after_open[close + 1..];

        let params_end = next_entry_start(tail);
        let params = &tail[..params_end];
        if params.split(';').any(|param| rel_matches(param, rel)) {
            return Some(target.to_owned());
        }
        rest = &tail[params_end..];
    }
}

/// Offset of the comma that starts the next `<...>` entry, or the end of input.
fn next_entry_start(tail: &str) -> usize {
    let mut in_quotes = false;
    for (idx, ch) in tail.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes && tail[idx + 1..].trim_start().starts_with('<') => return idx,
            _ => {}
        }
    }
    tail.len()
}

fn rel_matches(param: &str, rel: &str) -> bool {
    let Some((name, value)) = param.split_once('=') else {
        return false;
    };
    if !name.trim().eq_ignore_ascii_case("rel") {
        return false;
    }
    value
        .trim()
        .trim_matches('"')
        .split_ascii_whitespace()
        .any(|candidate| candidate.eq_ignore_ascii_case(rel))
}

/// Resolves the `rel="next"` target of a page against that page's URL.
pub fn next_page_url(current: &Url, headers: &HeaderMap) -> Result<Option<Url>> {
    let Some(target) = find_link(headers, "next") else {
        return Ok(None);
    };
    current.join(&target).map(Some).map_err(|err| {
        ResilientHttpError::Decode(format!("invalid Link next target '{target}': {err}"))
    })
}

/// Pages already fetched by one logical paginated call.
#[derive(Debug)]
pub struct PaginationState {
    visited: HashSet<String>,
    max_pages: usize,
}

impl PaginationState {
    /// Tracks one paginated call. `max_pages` must be at least 1.
    pub fn new(max_pages: usize) -> Result<Self> {
        if max_pages < 1 {
            return Err(ResilientHttpError::Configuration(
                "max_pages must be >= 1".to_owned(),
            ));
        }
        Ok(Self {
            visited: HashSet::new(),
            max_pages,
        })
    }

    /// Marks `url` as fetched, failing if it was fetched before.
    pub fn visit(&mut self, url: &Url) -> Result<()> {
        if !self.visited.insert(url.as_str().to_owned()) {
            return Err(ResilientHttpError::PaginationCycle {
                url: url.to_string(),
            });
        }
        Ok(())
    }

    /// Pages visited so far.
    pub fn pages(&self) -> usize {
        self.visited.len()
    }

    /// Whether the page limit has been reached.
    pub fn limit_reached(&self) -> bool {
        self.visited.len() >= self.max_pages
    }
}
