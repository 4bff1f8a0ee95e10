//! Structured signals scraped from process output.
//!
//! Some readiness facts are only ever announced on a process' output (an
//! artifact directory, a port, "connected to ..."). Extraction sits behind the
//! `SignalExtractor` capability so that the matching strategy can change
//! without touching the supervisor or the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Extracts one named signal from a stream of output lines.
///
/// Implementations are stateless: the supervisor hands in the previous line
/// of the same stream, which is enough for "value on the line after the
/// marker" formats.
pub trait SignalExtractor: Send + Sync {
    /// Name under which the captured value is stored on the `SignalBoard`.
    fn name(&self) -> &str;

    /// Returns the signal value if `line` carries it.
    fn extract(&self, line: &str, previous: Option<&str>) -> Option<String>;
}

/// Which part of the output holds the value once the marker is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// The whole (trimmed) line containing the marker
    Line,
    /// Text following the marker on the same line
    Remainder,
    /// The next line of the same stream
    NextLine,
}

/// Marker-based extractor, plain substring matching.
#[derive(Debug, Clone)]
pub struct MarkerExtractor {
    name: String,
    marker: String,
    capture: Capture,
}

impl MarkerExtractor {
    pub fn new(name: impl Into<String>, marker: impl Into<String>, capture: Capture) -> Self {
        Self {
            name: name.into(),
            marker: marker.into(),
            capture,
        }
    }

    pub fn line(name: impl Into<String>, marker: impl Into<String>) -> Self {
        Self::new(name, marker, Capture::Line)
    }

    pub fn remainder(name: impl Into<String>, marker: impl Into<String>) -> Self {
        Self::new(name, marker, Capture::Remainder)
    }

    pub fn next_line(name: impl Into<String>, marker: impl Into<String>) -> Self {
        Self::new(name, marker, Capture::NextLine)
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }
}

impl SignalExtractor for MarkerExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract(&self, line: &str, previous: Option<&str>) -> Option<String> {
        match self.capture {
            Capture::Line => line.contains(&self.marker).then(|| line.trim().to_string()),
            Capture::Remainder => line.find(&self.marker).map(|idx| {
                line[idx + self.marker.len()..]
                    .trim_start_matches(':')
                    .trim()
                    .to_string()
            }),
            Capture::NextLine => {
                let value = line.trim();
                (previous?.contains(&self.marker) && !value.is_empty()).then(|| value.to_string())
            }
        }
    }
}

/// Signals captured from one process run. First capture wins.
#[derive(Debug, Clone, Default)]
pub struct SignalBoard {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl SignalBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.inner.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    /// Stores `value` unless the signal was already captured.
    /// Returns whether the value was stored.
    pub fn insert_once(&self, name: &str, value: String) -> bool {
        let mut signals = self.inner.write();
        if signals.contains_key(name) {
            return false;
        }
        signals.insert(name.to_string(), value);
        true
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_line_capture() {
        let extractor = MarkerExtractor::next_line("artifacts", "Your contract artifacts are ready");
        assert_eq!(extractor.extract("Your contract artifacts are ready. You can find them in:", None), None);
        assert_eq!(
            extractor.extract(
                "  /tmp/flipper/target/ink  ",
                Some("Your contract artifacts are ready. You can find them in:")
            ),
            Some("/tmp/flipper/target/ink".to_string())
        );
        assert_eq!(extractor.extract("/somewhere", Some("unrelated")), None);
    }

    #[test]
    fn test_next_line_ignores_blank_line() {
        let extractor = MarkerExtractor::next_line("dir", "ready");
        assert_eq!(extractor.extract("   ", Some("ready")), None);
    }

    #[test]
    fn test_remainder_capture() {
        let extractor = MarkerExtractor::remainder("port", "Listening on port");
        assert_eq!(
            extractor.extract("INFO Listening on port: 8000", None),
            Some("8000".to_string())
        );
        assert_eq!(extractor.extract("INFO starting", None), None);
    }

    #[test]
    fn test_line_capture() {
        let extractor = MarkerExtractor::line("connected", "Connected to substrate");
        assert_eq!(
            extractor.extract(" Connected to substrate at ws://localhost:9944 ", None),
            Some("Connected to substrate at ws://localhost:9944".to_string())
        );
    }

    #[test]
    fn test_board_keeps_first_value() {
        let board = SignalBoard::new();
        assert!(board.insert_once("port", "8000".to_string()));
        assert!(!board.insert_once("port", "9000".to_string()));
        assert_eq!(board.get("port").as_deref(), Some("8000"));
        assert!(board.contains("port"));
        assert!(!board.contains("dir"));
        assert_eq!(board.snapshot().len(), 1);
    }

    #[test]
    fn test_board_clones_share_state() {
        let board = SignalBoard::new();
        let view = board.clone();
        board.insert_once("dir", "/tmp".to_string());
        assert_eq!(view.get("dir").as_deref(), Some("/tmp"));
    }
}
