//! M3U playlist rendering and filtering
//!
//! Renders the channel snapshot into an extended M3U document. Amps
//! carries its extra hints on `#EXTREM:AMP-*` lines so stock players
//! ignore them while Amps-aware clients get programme, variant and
//! region metadata.

pub mod epg;

use std::collections::HashSet;

use chrono::SecondsFormat;

use crate::models::{Channel, DEFAULT_VARIANT};

pub use crate::models::channel::is_region_code;

/// Parsed playlist query filters
#[derive(Debug, Clone, Default)]
pub struct PlaylistFilters {
    /// Uppercased ISO 3166-1 alpha-2 code
    pub region: Option<String>,
    /// Lowercased group names (exact match)
    pub groups: Option<HashSet<String>>,
    pub ids: Option<HashSet<u32>>,
    /// Suppress variant entries when false
    pub include_variants: bool,
}

impl PlaylistFilters {
    pub fn new() -> Self {
        Self {
            region: None,
            groups: None,
            ids: None,
            include_variants: true,
        }
    }

    pub fn matches(&self, channel: &Channel) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&channel.id) {
                return false;
            }
        }
        if let Some(groups) = &self.groups {
            let group = channel
                .group
                .as_deref()
                .unwrap_or("")
                .trim()
                .to_lowercase();
            if !groups.contains(&group) {
                return false;
            }
        }
        channel.allowed_for_region(self.region.as_deref())
    }
}

/// Comma list of group names, lowercased; `None` when empty
pub fn parse_group_filter(raw: &str) -> Option<HashSet<String>> {
    let groups: HashSet<String> = raw
        .split(',')
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect();
    (!groups.is_empty()).then_some(groups)
}

/// Comma list of integer ids; unparsable entries are dropped
pub fn parse_id_filter(raw: &str) -> Option<HashSet<u32>> {
    let ids: HashSet<u32> = raw
        .split(',')
        .filter_map(|chunk| chunk.trim().parse().ok())
        .collect();
    (!ids.is_empty()).then_some(ids)
}

fn stream_url(
    base: &str,
    id: u32,
    token: Option<&str>,
    region: Option<&str>,
    variant: Option<&str>,
) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    if let Some(token) = token {
        query.append_pair("token", token);
    }
    if let Some(region) = region {
        query.append_pair("region", region);
    }
    if let Some(variant) = variant {
        query.append_pair("variant", variant);
    }
    let query = query.finish();
    let base = base.trim_end_matches('/');
    if query.is_empty() {
        format!("{base}/stream/{id}")
    } else {
        format!("{base}/stream/{id}?{query}")
    }
}

fn extinf_line(channel: &Channel, display: &str) -> String {
    let mut attributes = vec![format!("tvg-id=\"{}\"", channel.id)];
    let tvg_name = channel.tvg_name.as_deref().unwrap_or(&channel.name);
    attributes.push(format!("tvg-name=\"{tvg_name}\""));
    if let Some(logo) = &channel.logo {
        attributes.push(format!("tvg-logo=\"{logo}\""));
    }
    if let Some(group) = &channel.group {
        attributes.push(format!("group-title=\"{group}\""));
    }
    if let Some(number) = channel.channel_number {
        attributes.push(format!("channel-number=\"{number}\""));
    }
    format!("#EXTINF:-1 {},{display}", attributes.join(" "))
}

/// Render the playlist for an already-snapshotted channel list
pub fn render_playlist(
    channels: &[Channel],
    base_url: &str,
    token: Option<&str>,
    filters: &PlaylistFilters,
) -> String {
    let mut lines = vec!["#EXTM3U".to_string()];
    let region = filters.region.as_deref();

    for channel in channels.iter().filter(|c| filters.matches(c)) {
        lines.push(extinf_line(channel, &channel.name));

        if let Some(next) = channel.next_programs.first() {
            let start = next
                .start
                .map(|s| s.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default();
            lines.push(format!(
                "#EXTREM:AMP-NEXT {start}|{}|{}",
                next.title,
                next.description.as_deref().unwrap_or_default()
            ));
        }
        if let Some(feed) = &channel.program_feed {
            lines.push(format!("#EXTREM:AMP-PROGRAM-FEED {feed}"));
        }
        if let Some(description) = &channel.description {
            lines.push(format!("#EXTREM:AMP-DESCRIPTION {description}"));
        }
        if filters.include_variants {
            for variant in &channel.variants {
                let label = variant.label.as_deref().unwrap_or(&variant.name);
                lines.push(format!("#EXTREM:AMP-VARIANT {}|{label}", variant.name));
            }
        }
        if !channel.regions_allowed.is_empty() || !channel.regions_blocked.is_empty() {
            let mut parts = Vec::new();
            if !channel.regions_allowed.is_empty() {
                parts.push(format!("allow={}", channel.regions_allowed.join(",")));
            }
            if !channel.regions_blocked.is_empty() {
                parts.push(format!("block={}", channel.regions_blocked.join(",")));
            }
            lines.push(format!("#EXTREM:AMP-REGION {}", parts.join(" ")));
        }

        lines.push(stream_url(base_url, channel.id, token, region, None));

        if filters.include_variants {
            for variant in &channel.variants {
                let label = variant.label.as_deref().unwrap_or(&variant.name);
                let display = format!("{} ({label})", channel.name);
                lines.push(extinf_line(channel, &display));
                lines.push(stream_url(
                    base_url,
                    channel.id,
                    token,
                    region,
                    Some(variant.name.as_str()),
                ));
            }
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Normalise a raw region parameter; `None` for anything non-ISO-shaped
pub fn normalize_region(raw: &str) -> Option<String> {
    let candidate = raw.trim().to_ascii_uppercase();
    is_region_code(&candidate).then_some(candidate)
}

/// The variant query parameter, defaulted and sanity-checked later
pub fn variant_or_default(raw: Option<&str>) -> String {
    match raw {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => DEFAULT_VARIANT.to_string(),
    }
}
