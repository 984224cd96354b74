//! DIAL lookup: find a screen's lounge id from its UPnP description URL.
//!
//! Flow: GET the device description (found via SSDP by the caller), read
//! `friendlyName` and the `Application-URL` header, then GET
//! `<Application-URL>YouTube` and read `additionalData/screenId`. The result
//! feeds `link()`.

use crate::error::Result;
use crate::transport::{HttpRequest, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialScreen {
    pub screen_id: String,
    pub screen_name: String,
}

/// Resolve a DIAL device into a screen id. `Ok(None)` when the device does
/// not answer with 200 or does not expose a YouTube app with a screen id.
pub async fn resolve(transport: &dyn Transport, dial_url: &str) -> Result<Option<DialScreen>> {
    let resp = transport.send(HttpRequest::get(dial_url)).await?;
    if resp.status != 200 {
        tracing::debug!("DIAL {dial_url} returned {}", resp.status);
        return Ok(None);
    }
    let Some(app_url) = resp.header("Application-URL").map(str::to_owned) else {
        tracing::debug!("DIAL {dial_url}: no Application-URL header");
        return Ok(None);
    };
    let description = resp.text().await?;
    let screen_name = xml_text(&description, "friendlyName").unwrap_or_default();

    let youtube_url = format!("{}YouTube", with_trailing_slash(&app_url));
    let resp = transport.send(HttpRequest::get(&youtube_url)).await?;
    if resp.status != 200 {
        tracing::debug!("DIAL {youtube_url} returned {}", resp.status);
        return Ok(None);
    }
    let service = resp.text().await?;
    let screen_id = xml_section(&service, "additionalData")
        .and_then(|data| xml_text(data, "screenId"))
        .filter(|id| !id.is_empty());

    Ok(screen_id.map(|screen_id| {
        tracing::info!("DIAL resolved {screen_name:?} -> screen {screen_id}");
        DialScreen {
            screen_id,
            screen_name,
        }
    }))
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_owned()
    } else {
        format!("{url}/")
    }
}

/// Inner markup of the first `<tag ...>...</tag>`.
fn xml_section<'a>(doc: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut from = 0;
    while let Some(rel) = doc[from..].find(&open) {
        let start = from + rel;
        let after_name = start + open.len();
        // Skip longer tag names sharing the prefix.
        match doc[after_name..].chars().next() {
            Some('>' | ' ' | '\t' | '\r' | '\n') => {
                let body_start = after_name + doc[after_name..].find('>')? + 1;
                let body_end = body_start + doc[body_start..].find(&close)?;
                return Some(&doc[body_start..body_end]);
            }
            _ => from = after_name,
        }
    }
    None
}

/// Trimmed, entity-decoded text of the first `<tag>`.
fn xml_text(doc: &str, tag: &str) -> Option<String> {
    let raw = xml_section(doc, tag)?.trim();
    Some(
        raw.replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&amp;", "&"),
    )
}
