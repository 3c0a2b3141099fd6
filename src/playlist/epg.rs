//! Electronic programme guide generation
//!
//! Produces XMLTV for `/epg.xml` and the JSON mirror for `/api/epg` from
//! the current channel snapshot. Programmes without a start instant are
//! skipped in the XMLTV output; XMLTV consumers require one.

use std::io::Cursor;

use anyhow::Result;
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::Serialize;

use crate::models::{Channel, Program};

/// XMLTV timestamps are `YYYYMMDDHHMMSS +0000`
fn xmltv_time(instant: DateTime<Utc>) -> String {
    instant.format("%Y%m%d%H%M%S %z").to_string()
}

fn epg_channel_id(channel: &Channel) -> String {
    channel
        .epg_id
        .clone()
        .unwrap_or_else(|| channel.id.to_string())
}

fn write_text_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// Render the full XMLTV document
pub fn build_xmltv(channels: &[Channel], base_url: Option<&str>) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

    let mut tv = BytesStart::new("tv");
    tv.push_attribute(("source-info-name", "Amps"));
    tv.push_attribute(("generator-info-name", "Amps"));
    writer.write_event(Event::Start(tv))?;

    for channel in channels {
        let id = epg_channel_id(channel);
        let mut el = BytesStart::new("channel");
        el.push_attribute(("id", id.as_str()));
        writer.write_event(Event::Start(el))?;
        write_text_element(&mut writer, "display-name", &channel.name)?;
        if let Some(tvg_name) = &channel.tvg_name {
            write_text_element(&mut writer, "display-name", tvg_name)?;
        }
        if let Some(logo) = &channel.logo {
            let mut icon = BytesStart::new("icon");
            icon.push_attribute(("src", logo.as_str()));
            writer.write_event(Event::Empty(icon))?;
        }
        if let Some(base) = base_url {
            let url = format!("{}/stream/{}", base.trim_end_matches('/'), channel.id);
            write_text_element(&mut writer, "url", &url)?;
        }
        writer.write_event(Event::End(BytesEnd::new("channel")))?;
    }

    for channel in channels {
        let id = epg_channel_id(channel);
        for program in &channel.next_programs {
            let Some(start) = program.start else {
                continue;
            };
            let start = xmltv_time(start);
            let mut el = BytesStart::new("programme");
            el.push_attribute(("start", start.as_str()));
            let stop = program.end.map(xmltv_time);
            if let Some(stop) = &stop {
                el.push_attribute(("stop", stop.as_str()));
            }
            el.push_attribute(("channel", id.as_str()));
            writer.write_event(Event::Start(el))?;
            write_text_element(&mut writer, "title", &program.title)?;
            if let Some(description) = &program.description {
                write_text_element(&mut writer, "desc", description)?;
            }
            writer.write_event(Event::End(BytesEnd::new("programme")))?;
        }
    }

    writer.write_event(Event::End(BytesEnd::new("tv")))?;
    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8(bytes)?)
}

/// One channel's guide entry in the JSON mirror
#[derive(Debug, Clone, Serialize)]
pub struct EpgEntry {
    pub id: u32,
    pub epg_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    pub programs: Vec<Program>,
}

pub fn build_epg_payload(channels: &[Channel]) -> Vec<EpgEntry> {
    channels
        .iter()
        .map(|channel| EpgEntry {
            id: channel.id,
            epg_id: epg_channel_id(channel),
            name: channel.name.clone(),
            group: channel.group.clone(),
            logo: channel.logo.clone(),
            programs: channel.next_programs.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> Vec<Channel> {
        serde_yaml::from_str(
            r#"
            - id: 1
              name: News
              source: http://up/news.ts
              ffmpeg_profile: copy
              logo: http://logo/1.png
              epg_id: news.example
              next_programs:
                - title: Evening Bulletin
                  start: 2030-05-01T18:00:00Z
                  end: 2030-05-01T19:00:00Z
                  description: Daily wrap
                - title: No start, skipped in xml
            "#,
        )
        .unwrap()
    }

    #[test]
    fn xmltv_document_shape() {
        let xml = build_xmltv(&channels(), Some("http://localhost:5000")).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(xml.contains("<channel id=\"news.example\">"));
        assert!(xml.contains("<display-name>News</display-name>"));
        assert!(xml.contains("<icon src=\"http://logo/1.png\"/>"));
        assert!(xml.contains("<url>http://localhost:5000/stream/1</url>"));
        assert!(xml.contains(
            "<programme start=\"20300501180000 +0000\" stop=\"20300501190000 +0000\" channel=\"news.example\">"
        ));
        assert!(xml.contains("<title>Evening Bulletin</title>"));
        assert!(xml.contains("<desc>Daily wrap</desc>"));
        // Startless programmes are dropped from XMLTV
        assert!(!xml.contains("skipped in xml"));
        assert!(xml.ends_with("</tv>"));
    }

    #[test]
    fn json_payload_keeps_every_program() {
        let payload = build_epg_payload(&channels());
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0].epg_id, "news.example");
        assert_eq!(payload[0].programs.len(), 2);
    }
}
