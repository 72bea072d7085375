//! M3U8 playlist resolution and parsing
//!
//! Fetches an HLS playlist over HTTP(S) and parses the line-oriented tag
//! format into an ordered segment list plus encryption metadata. Relative
//! segment/key URIs are resolved against the playlist's *final* URL (after
//! redirects), never against the page that linked to it. Master playlists
//! are handled by selecting the highest-bandwidth variant and recursing
//! exactly one level.

use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::core::error_handling::{DownloadError, RetryPolicy};
use crate::core::models::ControlFlags;

/// One media segment of a playlist.
#[derive(Debug, Clone)]
pub struct MediaSegment {
    pub uri: Url,
    /// Duration in seconds from `#EXTINF`
    pub duration: f64,
    /// Media-sequence number: `#EXT-X-MEDIA-SEQUENCE` base plus position.
    /// Feeds the default IV derivation for AES-128 segments.
    pub sequence: u64,
    /// Index into [`MediaPlaylist::keys`] of the key governing this segment.
    /// Multi-KEY manifests get last-seen-wins semantics.
    pub key: Option<usize>,
}

/// An `#EXT-X-KEY` tag with `METHOD=AES-128`.
#[derive(Debug, Clone)]
pub struct KeyTag {
    pub uri: Url,
    /// Explicit IV from the tag, when present
    pub iv: Option<[u8; 16]>,
}

/// A fully resolved media playlist, rebuilt per download attempt.
#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    /// Final post-redirect playlist URL (the base for all resolution)
    pub url: Url,
    pub media_sequence: u64,
    pub segments: Vec<MediaSegment>,
    pub keys: Vec<KeyTag>,
}

impl MediaPlaylist {
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    pub fn is_encrypted(&self) -> bool {
        !self.keys.is_empty()
    }
}

/// A variant entry of a master playlist.
#[derive(Debug, Clone)]
pub struct Variant {
    pub uri: Url,
    pub bandwidth: u64,
}

/// Parse result: a media playlist or a master playlist's variant list.
#[derive(Debug)]
pub enum Parsed {
    Media(MediaPlaylist),
    Master(Vec<Variant>),
}

/// Fetch and parse a playlist URL into a media playlist.
///
/// Master playlists recurse one level into the best variant; a master that
/// points at another master is a parse error.
pub async fn fetch_media_playlist(
    client: &Client,
    url: &str,
    policy: &RetryPolicy,
    flags: &ControlFlags,
) -> Result<MediaPlaylist, DownloadError> {
    let (base, body) = fetch_playlist_text(client, url, policy, flags).await?;

    match parse_playlist(&base, &body)? {
        Parsed::Media(playlist) => Ok(playlist),
        Parsed::Master(variants) => {
            let best = select_variant(&variants).ok_or_else(|| DownloadError::ManifestParse {
                message: "master playlist has no variants".to_string(),
            })?;
            debug!(variant = %best.uri, bandwidth = best.bandwidth, "selected master variant");

            let (base, body) =
                fetch_playlist_text(client, best.uri.as_str(), policy, flags).await?;
            match parse_playlist(&base, &body)? {
                Parsed::Media(playlist) => Ok(playlist),
                Parsed::Master(_) => Err(DownloadError::ManifestParse {
                    message: "variant playlist is itself a master playlist".to_string(),
                }),
            }
        }
    }
}

/// GET the playlist body with bounded retries. Returns the final URL after
/// redirects together with the text, so relative URIs resolve correctly.
async fn fetch_playlist_text(
    client: &Client,
    url: &str,
    policy: &RetryPolicy,
    flags: &ControlFlags,
) -> Result<(Url, String), DownloadError> {
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts {
        flags.check()?;

        match try_fetch_text(client, url).await {
            Ok(ok) => return Ok(ok),
            Err(message) => {
                last_error = message;
                if attempt < policy.max_attempts {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(url, attempt, error = %last_error, "manifest fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(DownloadError::ManifestFetch {
        message: format!("{} ({} attempts)", last_error, policy.max_attempts),
    })
}

async fn try_fetch_text(client: &Client, url: &str) -> Result<(Url, String), String> {
    let response = client.get(url).send().await.map_err(|e| e.to_string())?;
    // Base URL must be the redirect target, not the requested URL
    let final_url = response.url().clone();

    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }

    let body = response.text().await.map_err(|e| e.to_string())?;
    Ok((final_url, body))
}

/// Highest bandwidth wins; the first listed wins ties.
pub fn select_variant(variants: &[Variant]) -> Option<&Variant> {
    let mut best: Option<&Variant> = None;
    for variant in variants {
        match best {
            Some(current) if variant.bandwidth <= current.bandwidth => {}
            _ => best = Some(variant),
        }
    }
    best
}

/// Parse playlist text against its (final) base URL.
pub fn parse_playlist(base: &Url, body: &str) -> Result<Parsed, DownloadError> {
    let mut lines = body.lines().map(str::trim);

    match lines.next() {
        Some(first) if first.starts_with("#EXTM3U") => {}
        _ => {
            return Err(DownloadError::ManifestParse {
                message: "missing #EXTM3U header".to_string(),
            })
        }
    }

    if body.contains("#EXT-X-STREAM-INF") {
        return parse_master(base, body).map(Parsed::Master);
    }

    parse_media(base, body).map(Parsed::Media)
}

fn parse_master(base: &Url, body: &str) -> Result<Vec<Variant>, DownloadError> {
    let mut variants = Vec::new();
    let mut pending_bandwidth: Option<u64> = None;

    for line in body.lines().map(str::trim) {
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            // Missing BANDWIDTH sorts lowest, so the first variant wins then
            let bandwidth = attribute_value(attrs, "BANDWIDTH")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            pending_bandwidth = Some(bandwidth);
        } else if !line.is_empty() && !line.starts_with('#') {
            if let Some(bandwidth) = pending_bandwidth.take() {
                variants.push(Variant {
                    uri: resolve(base, line)?,
                    bandwidth,
                });
            }
        }
    }

    if variants.is_empty() {
        return Err(DownloadError::ManifestParse {
            message: "master playlist has no usable variants".to_string(),
        });
    }
    Ok(variants)
}

fn parse_media(base: &Url, body: &str) -> Result<MediaPlaylist, DownloadError> {
    let mut media_sequence: u64 = 0;
    let mut keys: Vec<KeyTag> = Vec::new();
    let mut current_key: Option<usize> = None;
    let mut pending_duration: f64 = 0.0;
    let mut segments: Vec<MediaSegment> = Vec::new();

    for line in body.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = rest.trim().parse().map_err(|_| DownloadError::ManifestParse {
                message: format!("bad media sequence: {rest:?}"),
            })?;
        } else if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let duration_str = rest.split(',').next().unwrap_or("0").trim();
            pending_duration = duration_str.parse().unwrap_or(0.0);
        } else if let Some(attrs) = line.strip_prefix("#EXT-X-KEY:") {
            current_key = parse_key_tag(base, attrs, &mut keys)?;
        } else if line.starts_with('#') {
            // Unknown or irrelevant tag (VERSION, TARGETDURATION, ENDLIST...)
            continue;
        } else {
            let sequence = media_sequence + segments.len() as u64;
            segments.push(MediaSegment {
                uri: resolve(base, line)?,
                duration: pending_duration,
                sequence,
                key: current_key,
            });
            pending_duration = 0.0;
        }
    }

    if segments.is_empty() {
        return Err(DownloadError::ManifestParse {
            message: "playlist contains no segments".to_string(),
        });
    }

    Ok(MediaPlaylist {
        url: base.clone(),
        media_sequence,
        segments,
        keys,
    })
}

/// Parse one `#EXT-X-KEY` tag. Returns the key index subsequent segments
/// should reference, or `None` for `METHOD=NONE`.
fn parse_key_tag(
    base: &Url,
    attrs: &str,
    keys: &mut Vec<KeyTag>,
) -> Result<Option<usize>, DownloadError> {
    let method = attribute_value(attrs, "METHOD").unwrap_or_default();

    match method.as_str() {
        "NONE" => Ok(None),
        "AES-128" => {
            let uri = attribute_value(attrs, "URI").ok_or_else(|| DownloadError::ManifestParse {
                message: "AES-128 key tag without URI".to_string(),
            })?;
            let iv = match attribute_value(attrs, "IV") {
                Some(raw) => Some(parse_iv_hex(&raw)?),
                None => None,
            };
            keys.push(KeyTag {
                uri: resolve(base, &uri)?,
                iv,
            });
            Ok(Some(keys.len() - 1))
        }
        other => Err(DownloadError::ManifestParse {
            message: format!("unsupported key method {other:?}"),
        }),
    }
}

/// Parse a hex IV attribute (with or without `0x` prefix) into 16 bytes.
pub fn parse_iv_hex(raw: &str) -> Result<[u8; 16], DownloadError> {
    let trimmed = raw
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");

    let decoded = hex::decode(trimmed).map_err(|_| DownloadError::ManifestParse {
        message: format!("bad IV hex: {raw:?}"),
    })?;
    if decoded.len() != 16 {
        return Err(DownloadError::ManifestParse {
            message: format!("IV must be 16 bytes, got {}", decoded.len()),
        });
    }

    let mut iv = [0u8; 16];
    iv.copy_from_slice(&decoded);
    Ok(iv)
}

/// Quote-aware lookup of one attribute in a `KEY=VALUE,...` list.
fn attribute_value(attrs: &str, wanted: &str) -> Option<String> {
    for part in split_attributes(attrs) {
        if let Some((key, value)) = part.split_once('=') {
            if key.trim() == wanted {
                return Some(value.trim().trim_matches('"').to_string());
            }
        }
    }
    None
}

/// Split an attribute list on commas, ignoring commas inside quotes
/// (key URIs routinely carry query strings with commas).
fn split_attributes(attrs: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in attrs.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn resolve(base: &Url, uri: &str) -> Result<Url, DownloadError> {
    base.join(uri).map_err(|e| DownloadError::ManifestParse {
        message: format!("cannot resolve {uri:?}: {e}"),
    })
}
