//! Streaming M3U parser
//!
//! Bytes become lines through a buffered reader over the response body and
//! one [`M3uEntry`] is yielded per `#EXTINF` + URL pair, so playlists with
//! hundreds of thousands of entries are never held in memory.

use async_stream::try_stream;
use futures::Stream;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tracing::{info, warn};

// Limits for streamed parsing
const MAX_LINE_BYTES: usize = 32 * 1024; // protect against maliciously long lines
const READ_LINE_TIMEOUT: Duration = Duration::from_secs(10);

lazy_static! {
    /// Regex to parse EXTINF attributes (tvg-id="...", group-title="...", etc)
    static ref ATTR_REGEX: Regex = Regex::new(r#"([\w-]+)="([^"]*)""#).unwrap();

    /// Regex to extract duration from EXTINF line
    static ref DURATION_REGEX: Regex = Regex::new(r"^-?\d+").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum M3uError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP error: {0}")]
    Http(u16),
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out while reading playlist line")]
    Timeout,
    #[error("playlist line exceeds max length of {0} bytes")]
    LineTooLong(usize),
}

/// Parsed EXTINF line data
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExtinfData {
    pub duration: i32,
    pub attributes: HashMap<String, String>,
    pub title: String,
}

/// One playlist entry
#[derive(Debug, Clone, PartialEq)]
pub struct M3uEntry {
    /// Zero-based position among emitted entries
    pub index: usize,
    pub title: String,
    pub attributes: HashMap<String, String>,
    /// Group from a preceding `#EXTGRP:` line
    pub group_hint: Option<String>,
    pub url: String,
}

/// Position of the comma separating attributes from the title, ignoring
/// commas inside quoted attribute values
fn title_separator(content: &str) -> Option<usize> {
    let mut in_quotes = false;
    for (i, c) in content.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

/// Parse an EXTINF line
/// Format: #EXTINF:duration tvg-id="..." tvg-name="..." tvg-logo="..." group-title="...",Title
pub fn parse_extinf(line: &str) -> Option<ExtinfData> {
    let content = line.strip_prefix("#EXTINF:")?;

    let (header, title) = match title_separator(content) {
        Some(pos) => (&content[..pos], content[pos + 1..].trim()),
        None => (content, ""),
    };

    let duration = DURATION_REGEX
        .find(header.trim_start())
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(-1);

    let attributes = ATTR_REGEX
        .captures_iter(header)
        .map(|caps| (caps[1].to_lowercase(), caps[2].trim().to_string()))
        .collect();

    Some(ExtinfData {
        duration,
        attributes,
        title: title.to_string(),
    })
}

/// Open a playlist URL as a buffered line reader over the response stream
pub async fn fetch(
    client: &Client,
    url: &str,
    user_agent: &str,
    timeout: Duration,
) -> Result<impl AsyncBufRead + Unpin + Send, M3uError> {
    let response = client
        .get(url)
        .timeout(timeout)
        .header("User-Agent", user_agent)
        .send()
        .await
        .map_err(|e| M3uError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(M3uError::Http(status.as_u16()));
    }

    if let Some(len) = response.content_length() {
        info!("Playlist size: {:.2} MB", len as f64 / 1024.0 / 1024.0);
    }

    let bytes_stream = response
        .bytes_stream()
        .map(|result| result.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));

    Ok(BufReader::new(StreamReader::new(Box::pin(bytes_stream))))
}

/// Yield entries from a line reader as they are parsed
pub fn entries<R>(reader: R) -> impl Stream<Item = Result<M3uEntry, M3uError>>
where
    R: AsyncBufRead + Unpin,
{
    try_stream! {
        let mut reader = reader;
        let mut buf: Vec<u8> = Vec::new();
        let mut pending: Option<ExtinfData> = None;
        let mut group_hint: Option<String> = None;
        let mut index = 0usize;
        let mut first_line = true;

        loop {
            buf.clear();

            // never buffer more than one line's worth
            let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64 + 1);
            let bytes_read = tokio::time::timeout(READ_LINE_TIMEOUT, limited.read_until(b'\n', &mut buf))
                .await
                .map_err(|_| M3uError::Timeout)??;
            if bytes_read == 0 {
                break;
            }

            let content_len = buf.len() - usize::from(buf.ends_with(b"\n"));
            if content_len > MAX_LINE_BYTES {
                Err::<(), _>(M3uError::LineTooLong(MAX_LINE_BYTES))?;
            }

            // Latin-1 names are common; undecodable bytes become U+FFFD
            let line = String::from_utf8_lossy(&buf);
            let trimmed = line.trim().trim_start_matches('\u{feff}');
            if trimmed.is_empty() {
                continue;
            }

            if first_line {
                first_line = false;
                if trimmed.starts_with("#EXTM3U") {
                    continue;
                }
                warn!("Playlist has no #EXTM3U header, parsing anyway");
            }

            if trimmed.starts_with("#EXTINF:") {
                pending = parse_extinf(trimmed);
                continue;
            }

            if let Some(group) = trimmed.strip_prefix("#EXTGRP:") {
                group_hint = Some(group.trim().to_string()).filter(|g| !g.is_empty());
                continue;
            }

            // Other directives (#EXTVLCOPT, #KODIPROP, ...)
            if trimmed.starts_with('#') {
                continue;
            }

            // URL line; a URL without a preceding EXTINF is skipped
            let extinf = match pending.take() {
                Some(extinf) => extinf,
                None => continue,
            };

            yield M3uEntry {
                index,
                title: extinf.title,
                attributes: extinf.attributes,
                group_hint: group_hint.take(),
                url: trimmed.to_string(),
            };
            index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn parse_all(text: &str) -> Result<Vec<M3uEntry>, M3uError> {
        entries(text.as_bytes()).try_collect().await
    }

    #[test]
    fn test_parse_extinf() {
        let line = r#"#EXTINF:-1 tvg-id="globo" tvg-name="Globo HD" tvg-logo="http://logo.com/globo.png" group-title="TV",Globo HD"#;
        let extinf = parse_extinf(line).unwrap();

        assert_eq!(extinf.title, "Globo HD");
        assert_eq!(extinf.duration, -1);
        assert_eq!(extinf.attributes.get("tvg-id"), Some(&"globo".to_string()));
        assert_eq!(extinf.attributes.get("group-title"), Some(&"TV".to_string()));
    }

    #[test]
    fn test_parse_extinf_minimal() {
        let extinf = parse_extinf("#EXTINF:-1,Canal Teste").unwrap();

        assert_eq!(extinf.title, "Canal Teste");
        assert_eq!(extinf.duration, -1);
        assert!(extinf.attributes.is_empty());
    }

    #[test]
    fn test_parse_extinf_comma_in_attribute() {
        let line = r#"#EXTINF:-1 tvg-name="News, Weather" group-title="Local, Regional",News, Weather & Traffic"#;
        let extinf = parse_extinf(line).unwrap();

        assert_eq!(extinf.attributes["tvg-name"], "News, Weather");
        assert_eq!(extinf.attributes["group-title"], "Local, Regional");
        assert_eq!(extinf.title, "News, Weather & Traffic");
    }

    #[tokio::test]
    async fn test_single_entry_with_attributes() {
        let text = "#EXTM3U\n#EXTINF:-1 tvg-id=\"1\" group-title=\"News\",CNN\nhttp://x/1.ts\n";
        let entries = parse_all(text).await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "CNN");
        assert_eq!(entries[0].attributes["tvg-id"], "1");
        assert_eq!(entries[0].attributes["group-title"], "News");
        assert_eq!(entries[0].url, "http://x/1.ts");
        assert_eq!(entries[0].index, 0);
    }

    #[tokio::test]
    async fn test_directives_and_group_hint() {
        let text = "#EXTM3U\r\n\
            #EXTINF:-1,First\r\n\
            #EXTVLCOPT:http-user-agent=Foo\r\n\
            #EXTGRP:Movies\r\n\
            http://x/a.ts\r\n\
            \r\n\
            http://x/orphan.ts\r\n\
            #EXTINF:-1,Second\r\n\
            http://x/b.ts\r\n";
        let entries = parse_all(text).await.unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].group_hint.as_deref(), Some("Movies"));
        assert_eq!(entries[1].group_hint, None);
        assert_eq!(entries[1].url, "http://x/b.ts");
        assert_eq!(entries[1].index, 1);
    }

    #[tokio::test]
    async fn test_missing_header_tolerated() {
        let entries = parse_all("#EXTINF:-1,Only\nhttp://x/only.ts").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Only");
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let text = format!("#EXTM3U\n#EXTINF:-1,{}\nhttp://x/1.ts\n", "a".repeat(MAX_LINE_BYTES + 1));
        assert!(matches!(parse_all(&text).await, Err(M3uError::LineTooLong(_))));
    }

    #[tokio::test]
    async fn test_unbroken_body_is_bounded() {
        let endless = BufReader::new(tokio::io::repeat(b'a'));
        let stream = entries(endless);
        tokio::pin!(stream);

        let first = tokio::time::timeout(Duration::from_secs(5), futures::StreamExt::next(&mut stream))
            .await
            .expect("oversized line should be rejected without reading to EOF");
        assert!(matches!(first, Some(Err(M3uError::LineTooLong(_)))));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let mut body = b"#EXTM3U\n#EXTINF:-1,One\nhttp://x/1.ts\n#EXTINF:-1 group-title=\"Caf".to_vec();
        body.extend_from_slice(b"\xe9\",Caf\xe9 TV\nhttp://x/2.ts\n#EXTINF:-1,Three\nhttp://x/3.ts\n");

        let parsed: Vec<M3uEntry> = entries(&body[..]).try_collect().await.unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1].title, "Caf\u{fffd} TV");
        assert_eq!(parsed[1].attributes["group-title"], "Caf\u{fffd}");
        assert_eq!(parsed[2].url, "http://x/3.ts");
    }

    #[tokio::test]
    async fn test_large_playlist_streams() {
        let mut text = String::from("#EXTM3U\n");
        for i in 0..100_000 {
            text.push_str(&format!("#EXTINF:-1 tvg-id=\"c{i}\",Channel {i}\nhttp://x/{i}.ts\n"));
        }

        let stream = entries(text.as_bytes());
        tokio::pin!(stream);
        let mut count = 0usize;
        while let Some(entry) = futures::StreamExt::next(&mut stream).await {
            let entry = entry.unwrap();
            assert_eq!(entry.index, count);
            count += 1;
        }
        assert_eq!(count, 100_000);
    }
}
