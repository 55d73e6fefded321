//! Parsing the remote build provider's submission output.

use serde::Deserialize;

/// Handle returned by a fire-and-forget remote build submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBuildHandle {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHandle {
    id: Option<String>,
    #[serde(rename = "buildUrl", alias = "build_url")]
    build_url: Option<String>,
}

/// The provider prints either a JSON object or an array of them, possibly
/// mixed with progress chatter.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawOutput {
    One(RawHandle),
    Many(Vec<RawHandle>),
}

impl RawOutput {
    fn into_handle(self) -> Option<RemoteBuildHandle> {
        let raw = match self {
            Self::One(raw) => raw,
            Self::Many(list) => list.into_iter().find(|r| r.id.is_some())?,
        };
        let id = raw.id.filter(|id| !id.trim().is_empty())?;
        Some(RemoteBuildHandle {
            id,
            url: raw.build_url,
        })
    }
}

fn parse(text: &str) -> Option<RemoteBuildHandle> {
    serde_json::from_str::<RawOutput>(text.trim())
        .ok()
        .and_then(RawOutput::into_handle)
}

/// Extract the build handle from an output tail.
///
/// Tries each line from the end, then the whole tail as one document, then
/// the tail starting at the first line that opens a JSON value.
pub fn parse_build_handle(tail: &[String]) -> Option<RemoteBuildHandle> {
    if let Some(handle) = tail.iter().rev().find_map(|line| parse(line)) {
        return Some(handle);
    }
    let joined = tail.join("\n");
    if let Some(handle) = parse(&joined) {
        return Some(handle);
    }
    let start = tail
        .iter()
        .position(|line| matches!(line.trim_start().chars().next(), Some('{' | '[')))?;
    parse(&tail[start..].join("\n"))
}
