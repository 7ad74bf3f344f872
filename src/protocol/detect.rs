//! Protocol version detection.
//!
//! Response headers win over the metadata document. A document may declare
//! its version as an EDMX `Version` attribute, raised by the legacy
//! `m:MaxDataServiceVersion` / `m:DataServiceVersion` attributes, or as the
//! `version` field of a JSON model.

use smallvec::SmallVec;
use tracing::debug;

use crate::protocol::ProtocolVersion;
use crate::types::{ProtocolError, Result};

/// Header names carrying version tokens, matched case-insensitively.
pub const VERSION_HEADERS: [&str; 2] = ["OData-Version", "DataServiceVersion"];

/// Version tokens found in `headers`, in header order.
pub fn header_tokens<'a, I>(headers: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .filter(|(name, _)| {
            VERSION_HEADERS
                .iter()
                .any(|header| header.eq_ignore_ascii_case(name.trim()))
        })
        .flat_map(|(_, value)| value.split(';'))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Version tokens declared by a metadata document, most specific first.
pub fn document_tokens(document: &str) -> Vec<String> {
    let trimmed = document.trim_start();
    if trimmed.starts_with('{') {
        return json_tokens(trimmed);
    }
    let mut tokens: SmallVec<[String; 3]> = SmallVec::new();
    for name in ["m:MaxDataServiceVersion", "m:DataServiceVersion"] {
        if let Some(value) = attribute(document, name) {
            tokens.push(value.to_owned());
        }
    }
    if let Some(edmx) = element_start(document, "Edmx") {
        if let Some(value) = attribute(edmx, "Version") {
            // EDMX 1.0 documents describe legacy services; their protocol
            // version is carried by the DataServices attributes above.
            if tokens.is_empty() || !value.starts_with('1') {
                tokens.push(value.to_owned());
            }
        }
    }
    tokens.into_vec()
}

fn json_tokens(document: &str) -> Vec<String> {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(document) else {
        return Vec::new();
    };
    ["version", "$Version"]
        .iter()
        .filter_map(|field| json.get(*field).and_then(serde_json::Value::as_str))
        .map(str::to_owned)
        .collect()
}

/// Slice of the first start tag whose local name is `local`.
fn element_start<'a>(document: &'a str, local: &str) -> Option<&'a str> {
    let mut rest = document;
    while let Some(open) = rest.find('<') {
        let tag = &rest[open + 1..];
        let end = tag.find('>')?;
        let head = &tag[..end];
        let name = head.split_whitespace().next().unwrap_or_default();
        let name = name.rsplit(':').next().unwrap_or(name);
        if name == local {
            return Some(head);
        }
        rest = &tag[end..];
    }
    None
}

/// Value of attribute `name` anywhere in `text`. The name must start after
/// whitespace so `Version` does not match inside `DataServiceVersion`.
fn attribute<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let mut search = 0;
    while let Some(found) = text[search..].find(name) {
        let start = search + found;
        search = start + name.len();
        let preceded = text[..start]
            .chars()
            .next_back()
            .map_or(false, char::is_whitespace);
        let rest = text[search..].trim_start();
        let Some(rest) = rest.strip_prefix('=') else {
            continue;
        };
        let rest = rest.trim_start();
        let Some(quote) = rest.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            continue;
        };
        if !preceded {
            continue;
        }
        let value = &rest[1..];
        return value.find(quote).map(|end| &value[..end]);
    }
    None
}

/// Picks the protocol version from headers, falling back to the document.
///
/// The first supported token wins. When nothing is supported the error lists
/// every token that was seen.
pub fn detect_version<'a, I>(headers: I, document: Option<&str>) -> Result<ProtocolVersion>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    resolve_version(header_tokens(headers), document)
}

/// Same as [`detect_version`] for header tokens that were already extracted.
pub fn resolve_version(mut seen: Vec<String>, document: Option<&str>) -> Result<ProtocolVersion> {
    if let Some(version) = seen.iter().find_map(|token| ProtocolVersion::parse(token)) {
        debug!(version = %version, "protocol version from response headers");
        return Ok(version);
    }
    if let Some(document) = document {
        let declared = document_tokens(document);
        if let Some(version) = declared.iter().find_map(|token| ProtocolVersion::parse(token)) {
            debug!(version = %version, "protocol version from metadata document");
            return Ok(version);
        }
        seen.extend(declared);
    }
    if seen.is_empty() {
        Err(ProtocolError::UndetectableVersion.into())
    } else {
        Err(ProtocolError::UnsupportedVersion { seen }.into())
    }
}
