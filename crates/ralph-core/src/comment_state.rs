//! CI-debug and merge-conflict comment markers: a JSON payload embedded
//! in an HTML comment inside a GitHub issue/PR comment body, so recovery
//! state survives process restarts without a side channel. Spec §4.8.2
//! ("CI-debug state is persisted in a dedicated marker-tagged issue
//! comment") and §4.9 ("comment-marker-based lease").

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CI_DEBUG_MARKER: &str = "ralph:ci-debug:v1";
pub const MERGE_CONFLICT_MARKER: &str = "ralph:merge-conflict:v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkerPayload {
    pub attempts: i32,
    pub last_signature: Option<String>,
    pub history: Vec<Value>,
}

/// Render a marker comment body: `<!-- ralph:<kind>:v1 {json} -->` followed
/// by a short human-readable summary.
pub fn render(kind: &str, payload: &MarkerPayload, summary: &str) -> String {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    format!("<!-- {kind} {json} -->\n\n{summary}")
}

/// Parse a marker out of a comment body, if present. Tolerant of
/// surrounding text — only the first matching marker of `kind` is used.
pub fn parse(kind: &str, body: &str) -> Option<MarkerPayload> {
    let needle = format!("<!-- {kind} ");
    let start = body.find(&needle)? + needle.len();
    let end = body[start..].find(" -->")? + start;
    serde_json::from_str(&body[start..end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_render_and_parse() {
        let payload = MarkerPayload {
            attempts: 2,
            last_signature: Some("sig-1".to_string()),
            history: vec![serde_json::json!({"attempt": 1, "result": "no-progress"})],
        };
        let body = render(CI_DEBUG_MARKER, &payload, "CI debug attempt 2 in progress.");
        let parsed = parse(CI_DEBUG_MARKER, &body).expect("marker should parse");
        assert_eq!(parsed, payload);
    }

    #[test]
    fn parse_returns_none_when_marker_absent() {
        assert!(parse(CI_DEBUG_MARKER, "just a regular comment").is_none());
    }

    #[test]
    fn parse_does_not_confuse_different_markers() {
        let payload = MarkerPayload { attempts: 1, last_signature: None, history: vec![] };
        let body = render(MERGE_CONFLICT_MARKER, &payload, "attempt 1");
        assert!(parse(CI_DEBUG_MARKER, &body).is_none());
        assert!(parse(MERGE_CONFLICT_MARKER, &body).is_some());
    }
}
