use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use super::console::ConsoleEntry;
use super::network::{is_textual_mime, NetworkEntry};

/// Validation failures raised before any browser traffic happens.
#[derive(Debug)]
pub enum QueryError {
    BadRange(String),
    BadRegex(String),
    BadStatus(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::BadRange(msg) => write!(f, "invalid range: {msg}"),
            QueryError::BadRegex(msg) => write!(f, "invalid url regex: {msg}"),
            QueryError::BadStatus(msg) => write!(f, "invalid status pattern: {msg}"),
        }
    }
}

impl std::error::Error for QueryError {}

/// Which slice of the (already filtered) chronological sequence to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSel {
    Head(usize),
    Tail(usize),
    /// Inclusive 0-based indices.
    Range(usize, usize),
    All,
}

/// Wire shape of the range selector; exactly one selector may be set.
#[derive(Debug, Default, Deserialize)]
pub struct RangeSpec {
    pub head: Option<usize>,
    pub tail: Option<usize>,
    pub range: Option<[usize; 2]>,
    pub all: Option<bool>,
}

impl RangeSel {
    /// An unset spec selects everything.
    pub fn from_spec(spec: &RangeSpec) -> Result<Self, QueryError> {
        let mut selected = Vec::new();
        if let Some(n) = spec.head {
            selected.push(RangeSel::Head(n));
        }
        if let Some(n) = spec.tail {
            selected.push(RangeSel::Tail(n));
        }
        if let Some([i, j]) = spec.range {
            if i > j {
                return Err(QueryError::BadRange(format!(
                    "start {i} is past end {j}"
                )));
            }
            selected.push(RangeSel::Range(i, j));
        }
        if spec.all == Some(true) {
            selected.push(RangeSel::All);
        }
        match selected.len() {
            0 => Ok(RangeSel::All),
            1 => Ok(selected[0]),
            n => Err(QueryError::BadRange(format!(
                "{n} selectors given, expected exactly one of head, tail, range, all"
            ))),
        }
    }

    /// Slice `items`, preserving chronological order.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let len = items.len();
        match *self {
            RangeSel::All => items,
            RangeSel::Head(n) => items.into_iter().take(n).collect(),
            RangeSel::Tail(n) => items.into_iter().skip(len.saturating_sub(n)).collect(),
            RangeSel::Range(i, j) => items
                .into_iter()
                .skip(i)
                .take(j.saturating_sub(i) + 1)
                .collect(),
        }
    }
}

/// A status matcher: exact `NNN`, decade shorthand `Nxx`, or `NNN-NNN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPattern {
    Exact(u16),
    /// `2xx` matches 200..=299.
    Class(u16),
    Range(u16, u16),
}

impl StatusPattern {
    pub fn matches(&self, status: i64) -> bool {
        match *self {
            StatusPattern::Exact(code) => status == i64::from(code),
            StatusPattern::Class(class) => {
                let lo = i64::from(class) * 100;
                status >= lo && status < lo + 100
            }
            StatusPattern::Range(lo, hi) => status >= i64::from(lo) && status <= i64::from(hi),
        }
    }
}

impl FromStr for StatusPattern {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad = || QueryError::BadStatus(format!("'{s}' is not NNN, Nxx or NNN-NNN"));

        if let Some((lo, hi)) = s.split_once('-') {
            let lo: u16 = lo.parse().map_err(|_| bad())?;
            let hi: u16 = hi.parse().map_err(|_| bad())?;
            if lo > hi || lo < 100 || hi > 999 {
                return Err(bad());
            }
            return Ok(StatusPattern::Range(lo, hi));
        }
        if let Some(class) = s.strip_suffix("xx").or_else(|| s.strip_suffix("XX")) {
            let class: u16 = class.parse().map_err(|_| bad())?;
            if !(1..=5).contains(&class) {
                return Err(bad());
            }
            return Ok(StatusPattern::Class(class));
        }
        let code: u16 = s.parse().map_err(|_| bad())?;
        if !(100..=999).contains(&code) {
            return Err(bad());
        }
        Ok(StatusPattern::Exact(code))
    }
}

fn lowered_set(items: &Option<Vec<String>>) -> Option<HashSet<String>> {
    items.as_ref().map(|items| {
        items
            .iter()
            .map(|s| s.trim().to_ascii_lowercase())
            .collect()
    })
}

/// Console query filters; all conditions AND-combined.
#[derive(Default)]
pub struct ConsoleFilter {
    types: Option<HashSet<String>>,
    find: Option<String>,
}

impl ConsoleFilter {
    pub fn new(types: Option<Vec<String>>, find: Option<String>) -> Self {
        Self {
            types: lowered_set(&types),
            find: find.map(|s| s.to_lowercase()),
        }
    }

    pub fn matches(&self, entry: &ConsoleEntry) -> bool {
        if let Some(types) = &self.types {
            if !types.contains(&entry.kind.to_ascii_lowercase()) {
                return false;
            }
        }
        if let Some(needle) = &self.find {
            let mut haystack = entry.text.to_lowercase();
            for arg in &entry.args {
                haystack.push(' ');
                haystack.push_str(&arg.to_string().to_lowercase());
            }
            if let Some(url) = &entry.source_url {
                haystack.push(' ');
                haystack.push_str(&url.to_lowercase());
            }
            if !haystack.contains(needle) {
                return false;
            }
        }
        true
    }
}

/// Network query filters; all conditions AND-combined.
#[derive(Default)]
pub struct NetworkFilter {
    types: Option<HashSet<String>>,
    methods: Option<HashSet<String>>,
    status_patterns: Option<Vec<StatusPattern>>,
    url_regex: Option<regex::Regex>,
    mimes: Option<HashSet<String>>,
    min_duration: Option<f64>,
    min_size: Option<u64>,
    only_failed: bool,
    find: Option<String>,
}

impl NetworkFilter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        types: Option<Vec<String>>,
        methods: Option<Vec<String>>,
        status_patterns: Option<Vec<String>>,
        url_regex: Option<String>,
        mimes: Option<Vec<String>>,
        min_duration: Option<f64>,
        min_size: Option<u64>,
        only_failed: bool,
        find: Option<String>,
    ) -> Result<Self, QueryError> {
        let status_patterns = status_patterns
            .map(|patterns| {
                patterns
                    .iter()
                    .map(|p| p.parse::<StatusPattern>())
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        // Compiled once per query, reused across every entry.
        let url_regex = url_regex
            .map(|pattern| {
                regex::Regex::new(&pattern).map_err(|e| QueryError::BadRegex(e.to_string()))
            })
            .transpose()?;

        Ok(Self {
            types: lowered_set(&types),
            methods: lowered_set(&methods),
            status_patterns,
            url_regex,
            mimes: lowered_set(&mimes),
            min_duration,
            min_size,
            only_failed,
            find: find.map(|s| s.to_lowercase()),
        })
    }

    pub fn matches(&self, entry: &NetworkEntry) -> bool {
        if self.only_failed && !entry.failed {
            return false;
        }
        if let Some(types) = &self.types {
            let kind = entry
                .resource_type
                .as_deref()
                .unwrap_or_default()
                .to_ascii_lowercase();
            if !types.contains(&kind) {
                return false;
            }
        }
        if let Some(methods) = &self.methods {
            if !methods.contains(&entry.method.to_ascii_lowercase()) {
                return false;
            }
        }
        if let Some(patterns) = &self.status_patterns {
            let Some(status) = entry.status else {
                return false;
            };
            if !patterns.iter().any(|p| p.matches(status)) {
                return false;
            }
        }
        if let Some(regex) = &self.url_regex {
            if !regex.is_match(&entry.url) {
                return false;
            }
        }
        if let Some(mimes) = &self.mimes {
            let mime = entry
                .mime_type
                .as_deref()
                .unwrap_or_default()
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            if !mimes.contains(&mime) {
                return false;
            }
        }
        if let Some(min) = self.min_duration {
            if entry.duration_sec.unwrap_or(0.0) < min {
                return false;
            }
        }
        if let Some(min) = self.min_size {
            if entry.size.unwrap_or(0) < min {
                return false;
            }
        }
        if let Some(needle) = &self.find {
            let mut haystack = format!("{} {}", entry.url, entry.method).to_lowercase();
            let textual = entry
                .mime_type
                .as_deref()
                .map(is_textual_mime)
                .unwrap_or(false);
            if textual {
                if let Some(body) = &entry.body {
                    haystack.push(' ');
                    haystack.push_str(&body.to_lowercase());
                }
            }
            if !haystack.contains(needle) {
                return false;
            }
        }
        true
    }
}
