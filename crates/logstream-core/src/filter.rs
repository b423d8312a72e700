use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;

use logstream_types::{LogEvent, LogLevel, UnknownLevel};

/// Level predicate of a filter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LevelFilter {
    #[default]
    All,
    Only(LogLevel),
}

impl FromStr for LevelFilter {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(Self::All)
        } else {
            s.parse().map(Self::Only)
        }
    }
}

impl fmt::Display for LevelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("ALL"),
            Self::Only(level) => f.write_str(level.as_str()),
        }
    }
}

/// User-facing filter settings; absent fields match everything
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterSpec {
    pub text: Option<String>,
    pub level: LevelFilter,
    pub source: Option<String>,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Compiled filter for log events
#[derive(Clone)]
pub struct CompiledFilter {
    /// Case-insensitive literal matcher for the text term
    text: Option<Regex>,

    level: LevelFilter,

    source: Option<String>,

    /// Spec this filter was built from
    spec: FilterSpec,
}

impl CompiledFilter {
    /// Compile a filter spec; empty strings count as absent
    pub fn new(spec: &FilterSpec) -> Result<Self, regex::Error> {
        let text = match spec.text.as_deref() {
            Some(text) if !text.is_empty() => {
                Some(Regex::new(&format!("(?i){}", regex::escape(text)))?)
            }
            _ => None,
        };

        let source = spec.source.clone().filter(|s| !s.is_empty());

        Ok(Self {
            text,
            level: spec.level,
            source,
            spec: spec.clone(),
        })
    }

    /// Check if a log event passes every predicate
    pub fn matches(&self, event: &LogEvent) -> bool {
        if let LevelFilter::Only(level) = self.level {
            if event.level != level {
                return false;
            }
        }

        if let Some(source) = &self.source {
            if event.source != *source {
                return false;
            }
        }

        match &self.text {
            Some(re) => re.is_match(&event.message) || re.is_match(&event.source),
            None => true,
        }
    }

    /// Matching subsequence of `entries`, order preserved
    pub fn apply(&self, entries: &[Arc<LogEvent>]) -> Vec<Arc<LogEvent>> {
        if self.is_empty() {
            return entries.to_vec();
        }
        entries
            .iter()
            .filter(|e| self.matches(e))
            .cloned()
            .collect()
    }

    /// Find all match positions of the text term (for highlighting)
    pub fn find_matches(&self, text: &str) -> Vec<(usize, usize)> {
        match &self.text {
            Some(re) => re.find_iter(text).map(|m| (m.start(), m.end())).collect(),
            None => Vec::new(),
        }
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    /// Check if filter is empty (matches everything)
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.level == LevelFilter::All && self.source.is_none()
    }
}

impl Default for CompiledFilter {
    fn default() -> Self {
        Self {
            text: None,
            level: LevelFilter::All,
            source: None,
            spec: FilterSpec::default(),
        }
    }
}

impl fmt::Debug for CompiledFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFilter")
            .field("spec", &self.spec)
            .finish()
    }
}

/// Sorted distinct sources present in `entries`
pub fn distinct_sources(entries: &[Arc<LogEvent>]) -> Vec<String> {
    entries
        .iter()
        .map(|e| e.source.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Filtered read of a buffer snapshot
#[derive(Clone, Debug, Default)]
pub struct FilteredView {
    /// Matching events in arrival order
    pub entries: Vec<Arc<LogEvent>>,

    /// Sources present in the whole snapshot, for a source selector
    pub sources: Vec<String>,

    /// Size of the snapshot the view was computed from
    pub total: usize,
}

impl FilteredView {
    pub fn compute(snapshot: &[Arc<LogEvent>], filter: &CompiledFilter) -> Self {
        Self {
            entries: filter.apply(snapshot),
            sources: distinct_sources(snapshot),
            total: snapshot.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, level: LogLevel, source: &str, message: &str) -> Arc<LogEvent> {
        Arc::new(LogEvent::new(id, level, source, message))
    }

    fn sample() -> Vec<Arc<LogEvent>> {
        vec![
            event("1", LogLevel::Info, "api", "request served"),
            event("2", LogLevel::Error, "db", "Connection refused"),
            event("3", LogLevel::Warn, "api", "slow query"),
        ]
    }

    fn ids(entries: &[Arc<LogEvent>]) -> Vec<&str> {
        entries.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_level_filter() {
        let filter =
            CompiledFilter::new(&FilterSpec::new().with_level(LevelFilter::Only(LogLevel::Error)))
                .unwrap();
        assert_eq!(ids(&filter.apply(&sample())), vec!["2"]);
    }

    #[test]
    fn test_text_matches_message_or_source_case_insensitively() {
        let filter = CompiledFilter::new(&FilterSpec::new().with_text("CONNECTION")).unwrap();
        assert_eq!(ids(&filter.apply(&sample())), vec!["2"]);

        let filter = CompiledFilter::new(&FilterSpec::new().with_text("Ap")).unwrap();
        assert_eq!(ids(&filter.apply(&sample())), vec!["1", "3"]);
    }

    #[test]
    fn test_text_is_literal_not_regex() {
        let entries = vec![event("1", LogLevel::Info, "api", "cost is $5 (approx)")];
        let filter = CompiledFilter::new(&FilterSpec::new().with_text("$5 (")).unwrap();
        assert_eq!(filter.apply(&entries).len(), 1);
    }

    #[test]
    fn test_all_predicates_must_pass() {
        let spec = FilterSpec::new()
            .with_text("query")
            .with_level(LevelFilter::Only(LogLevel::Warn))
            .with_source("api");
        let filter = CompiledFilter::new(&spec).unwrap();
        assert_eq!(ids(&filter.apply(&sample())), vec!["3"]);

        let filter = CompiledFilter::new(&spec.with_source("db")).unwrap();
        assert!(filter.apply(&sample()).is_empty());
    }

    #[test]
    fn test_filtering_is_pure() {
        let entries = sample();
        let filter = CompiledFilter::new(&FilterSpec::new().with_source("api")).unwrap();
        let first = filter.apply(&entries);
        let second = filter.apply(&entries);

        assert_eq!(ids(&first), ids(&second));
        assert_eq!(ids(&entries), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_empty_strings_are_absent() {
        let filter = CompiledFilter::new(&FilterSpec::new().with_text("").with_source("")).unwrap();
        assert!(filter.is_empty());
        assert_eq!(filter.apply(&sample()).len(), 3);
    }

    #[test]
    fn test_distinct_sources_from_snapshot() {
        let filter = CompiledFilter::new(&FilterSpec::new().with_source("db")).unwrap();
        let view = FilteredView::compute(&sample(), &filter);
        assert_eq!(view.sources, vec!["api", "db"]);
        assert_eq!(view.entries.len(), 1);
        assert_eq!(view.total, 3);
    }

    #[test]
    fn test_find_matches() {
        let filter = CompiledFilter::new(&FilterSpec::new().with_text("error")).unwrap();
        let matches = filter.find_matches("an Error occurred, another error here");
        assert_eq!(matches, vec![(3, 8), (27, 32)]);
    }

    #[test]
    fn test_level_filter_parse() {
        assert_eq!("all".parse::<LevelFilter>(), Ok(LevelFilter::All));
        assert_eq!(
            "error".parse::<LevelFilter>(),
            Ok(LevelFilter::Only(LogLevel::Error))
        );
        assert!("loud".parse::<LevelFilter>().is_err());
    }
}
