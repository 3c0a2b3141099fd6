//! FFmpeg command construction
//!
//! Turns a channel (already variant-resolved), its profile and the desired
//! output shape into a complete launch plan: program, argument vector,
//! optional shell line, environment, working directory and the per-key
//! output directory for segmented shapes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::errors::RelayError;
use crate::models::{
    Channel, CommandTemplate, CustomCommand, OutputFormat, ProfileSpec, StructuredProfile,
};
use crate::relay::resolver::ResolvedSource;
use crate::relay::StreamKey;

pub const HLS_MANIFEST: &str = "index.m3u8";
pub const DASH_MANIFEST: &str = "manifest.mpd";

/// Everything needed to spawn one transcoder child
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    /// When set the plan runs through `/bin/sh -c`
    pub shell_line: Option<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
    /// Per-key directory for segmented shapes
    pub output_dir: Option<PathBuf>,
    pub manifest: Option<&'static str>,
    pub segmented: bool,
    pub bootstrap: bool,
}

impl LaunchPlan {
    /// Human-readable argv for logs and the tuners listing
    pub fn display_args(&self) -> Vec<String> {
        match &self.shell_line {
            Some(line) => vec![self.program.clone(), "-c".into(), line.clone()],
            None => {
                let mut out = vec![self.program.clone()];
                out.extend(self.args.iter().cloned());
                out
            }
        }
    }
}

/// The pipeline shape a key resolves to: `audio` always forces the
/// audio-only pipeline; overlap keys inherit the channel's declared shape,
/// degraded to `ts` when that shape is segmented (a private byte pipe has
/// no segment directory to share).
pub fn effective_format(key: &StreamKey, channel: &Channel) -> OutputFormat {
    match key.shape {
        crate::relay::OutputShape::Ts => OutputFormat::Ts,
        crate::relay::OutputShape::Hls => OutputFormat::Hls,
        crate::relay::OutputShape::LlHls => OutputFormat::LlHls,
        crate::relay::OutputShape::Dash => OutputFormat::Dash,
        crate::relay::OutputShape::Rtsp => OutputFormat::Rtsp,
        crate::relay::OutputShape::Audio => OutputFormat::Audio,
        crate::relay::OutputShape::Overlap(_) => {
            let declared = channel.declared_format();
            if declared.is_segmented() {
                OutputFormat::Ts
            } else {
                declared
            }
        }
    }
}

/// Build the launch plan for one (channel, profile, key) combination.
///
/// An inline command always wins over the profile; the profile is kept as
/// metadata only and never merged into the argv.
pub fn build_plan(
    channel: &Channel,
    profile: Option<&ProfileSpec>,
    key: &StreamKey,
    ffmpeg_command: &str,
    media_root: &std::path::Path,
    resolved: &ResolvedSource,
) -> Result<LaunchPlan, RelayError> {
    if let Some(custom) = &channel.custom_ffmpeg {
        return build_custom_plan(channel, custom, resolved);
    }

    let profile = profile.ok_or_else(|| RelayError::NoLaunchSpec {
        channel: channel.id,
        message: "no profile resolved and no inline command".into(),
    })?;

    let format = effective_format(key, channel);
    match profile {
        ProfileSpec::Args(template) => {
            build_template_plan(channel, template, key, format, ffmpeg_command, media_root, resolved)
        }
        ProfileSpec::Structured(structured) => build_structured_plan(
            channel,
            structured,
            key,
            format,
            ffmpeg_command,
            media_root,
            resolved,
        ),
    }
}

fn substitute(template: &str, channel: &Channel, source: &str) -> String {
    template
        .replace("{source}", source)
        .replace("{id}", &channel.id.to_string())
        .replace("{name}", &channel.name)
}

fn build_custom_plan(
    channel: &Channel,
    custom: &CustomCommand,
    resolved: &ResolvedSource,
) -> Result<LaunchPlan, RelayError> {
    let (template, shell, cwd, env) = match custom {
        CustomCommand::Line(line) => (CommandTemplate::Line(line.clone()), false, None, BTreeMap::new()),
        CustomCommand::Full(spec) => (
            spec.command.clone(),
            spec.shell,
            spec.cwd.clone(),
            spec.env.clone(),
        ),
    };

    let plan = match template {
        CommandTemplate::Argv(args) => {
            let mut args: Vec<String> = args
                .iter()
                .map(|arg| substitute(arg, channel, &resolved.url))
                .collect();
            if args.is_empty() {
                return Err(RelayError::NoLaunchSpec {
                    channel: channel.id,
                    message: "custom command is empty".into(),
                });
            }
            let program = args.remove(0);
            LaunchPlan {
                program,
                args,
                shell_line: None,
                env,
                cwd,
                output_dir: None,
                manifest: None,
                segmented: false,
                bootstrap: true,
            }
        }
        CommandTemplate::Line(line) => {
            let line = substitute(&line, channel, &resolved.url);
            if shell {
                LaunchPlan {
                    program: "/bin/sh".into(),
                    args: Vec::new(),
                    shell_line: Some(line),
                    env,
                    cwd,
                    output_dir: None,
                    manifest: None,
                    segmented: false,
                    bootstrap: true,
                }
            } else {
                let mut args = split_command_line(&line);
                if args.is_empty() {
                    return Err(RelayError::NoLaunchSpec {
                        channel: channel.id,
                        message: "custom command is empty".into(),
                    });
                }
                let program = args.remove(0);
                LaunchPlan {
                    program,
                    args,
                    shell_line: None,
                    env,
                    cwd,
                    output_dir: None,
                    manifest: None,
                    segmented: false,
                    bootstrap: true,
                }
            }
        }
    };
    Ok(plan)
}

fn output_dir_for(media_root: &std::path::Path, key: &StreamKey) -> PathBuf {
    media_root
        .join(key.channel_id.to_string())
        .join(&key.variant)
}

fn build_template_plan(
    channel: &Channel,
    template: &[String],
    key: &StreamKey,
    format: OutputFormat,
    ffmpeg_command: &str,
    media_root: &std::path::Path,
    resolved: &ResolvedSource,
) -> Result<LaunchPlan, RelayError> {
    if template.is_empty() {
        return Err(RelayError::NoLaunchSpec {
            channel: channel.id,
            message: "profile argv template is empty".into(),
        });
    }

    let (output_dir, manifest) = match format {
        OutputFormat::Hls | OutputFormat::LlHls => {
            (Some(output_dir_for(media_root, key)), Some(HLS_MANIFEST))
        }
        OutputFormat::Dash => (Some(output_dir_for(media_root, key)), Some(DASH_MANIFEST)),
        _ => (None, None),
    };
    let output_target = match (&output_dir, manifest) {
        (Some(dir), Some(file)) => dir.join(file).to_string_lossy().into_owned(),
        _ => "pipe:1".to_string(),
    };

    let mut args: Vec<String> = template
        .iter()
        .map(|arg| substitute(arg, channel, &resolved.url).replace("{output}", &output_target))
        .collect();

    // The audio shape strips video even from templates that were written
    // for the full pipeline; options are legal anywhere before the output.
    if format == OutputFormat::Audio && !args.iter().any(|a| a == "-vn") {
        let at = args.len().saturating_sub(1);
        args.insert(at, "-vn".into());
    }

    Ok(LaunchPlan {
        program: ffmpeg_command.to_string(),
        args,
        shell_line: None,
        env: BTreeMap::new(),
        cwd: None,
        output_dir,
        manifest,
        segmented: format.is_segmented(),
        bootstrap: true,
    })
}

fn render_option_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(if *b { "1".into() } else { "0".into() }),
        other => Some(other.to_string()),
    }
}

fn push_option_map(args: &mut Vec<String>, options: &BTreeMap<String, serde_json::Value>) {
    for (key, value) in options {
        args.push(format!("-{key}"));
        if let Some(rendered) = render_option_value(value) {
            args.push(rendered);
        }
    }
}

fn build_structured_plan(
    channel: &Channel,
    profile: &StructuredProfile,
    key: &StreamKey,
    format: OutputFormat,
    ffmpeg_command: &str,
    media_root: &std::path::Path,
    resolved: &ResolvedSource,
) -> Result<LaunchPlan, RelayError> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "info".into()];

    // Hardware acceleration applies ahead of the input
    let hwaccel = channel.hwaccel.as_ref().or(profile.hwaccel.as_ref());
    if let Some(hw) = hwaccel {
        args.push("-hwaccel".into());
        args.push(hw.kind.ffmpeg_name().into());
        if let Some(device) = &hw.device {
            args.push("-hwaccel_device".into());
            args.push(device.clone());
        }
    }

    // Input tuning: resolver-provided options first, channel overrides last
    let mut input_options = resolved.input_options.clone();
    input_options.extend(channel.input_options.clone());
    push_option_map(&mut args, &input_options);
    if !resolved.headers.is_empty() {
        let header_block: String = resolved
            .headers
            .iter()
            .map(|(k, v)| format!("{k}: {v}\r\n"))
            .collect();
        args.push("-headers".into());
        args.push(header_block);
    }
    args.extend(channel.input_args.iter().cloned());

    args.push("-i".into());
    args.push(resolved.url.clone());

    let mut options = profile.options.clone();
    let container = options
        .remove("format")
        .and_then(|v| render_option_value(&v))
        .unwrap_or_else(|| "mpegts".to_string());

    let audio_only = format == OutputFormat::Audio || profile.audio_only;
    if audio_only {
        args.push("-vn".into());
        if !options.contains_key("acodec") {
            args.push("-acodec".into());
            args.push("aac".into());
        }
    }

    let hls_time = options
        .remove("hls_time")
        .and_then(|v| render_option_value(&v))
        .unwrap_or_else(|| "4".to_string());
    let hls_list_size = options
        .remove("hls_list_size")
        .and_then(|v| render_option_value(&v))
        .unwrap_or_else(|| "0".to_string());
    let extra_hls_flags = options
        .remove("hls_flags")
        .and_then(|v| render_option_value(&v));
    let seg_duration = options
        .remove("seg_duration")
        .and_then(|v| render_option_value(&v))
        .unwrap_or_else(|| "4".to_string());

    push_option_map(&mut args, &options);

    let mut output_dir = None;
    let mut manifest = None;
    match format {
        OutputFormat::Hls | OutputFormat::LlHls => {
            let dir = output_dir_for(media_root, key);
            let ll = format == OutputFormat::LlHls || channel.ll_hls || profile.ll_hls;
            let base_flags = if ll {
                "delete_segments+append_list+omit_endlist+program_date_time"
            } else {
                "delete_segments+omit_endlist"
            };
            let flags = match extra_hls_flags {
                Some(extra) if !extra.is_empty() => format!("{extra}+{base_flags}"),
                _ => base_flags.to_string(),
            };
            args.push("-f".into());
            args.push("hls".into());
            args.push("-hls_time".into());
            args.push(hls_time);
            args.push("-hls_list_size".into());
            args.push(hls_list_size);
            args.push("-hls_flags".into());
            args.push(flags);
            args.push(dir.join(HLS_MANIFEST).to_string_lossy().into_owned());
            manifest = Some(HLS_MANIFEST);
            output_dir = Some(dir);
        }
        OutputFormat::Dash => {
            let dir = output_dir_for(media_root, key);
            args.push("-f".into());
            args.push("dash".into());
            args.push("-seg_duration".into());
            args.push(seg_duration);
            args.push("-remove_at_exit".into());
            args.push("1".into());
            args.push(dir.join(DASH_MANIFEST).to_string_lossy().into_owned());
            manifest = Some(DASH_MANIFEST);
            output_dir = Some(dir);
        }
        OutputFormat::Rtsp => {
            args.push("-f".into());
            args.push("rtsp".into());
            args.push(format!(
                "rtsp://127.0.0.1:8554/stream_{}_{}",
                key.channel_id, key.variant
            ));
        }
        OutputFormat::Ts | OutputFormat::Audio => {
            args.push("-f".into());
            args.push(container);
            args.push("pipe:1".into());
        }
    }

    Ok(LaunchPlan {
        program: ffmpeg_command.to_string(),
        args,
        shell_line: None,
        env: BTreeMap::new(),
        cwd: None,
        output_dir,
        manifest,
        segmented: format.is_segmented(),
        bootstrap: profile.bootstrap,
    })
}

/// Minimal shell-style splitter for non-shell inline command lines.
/// Supports single/double quotes and backslash escapes outside quotes.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut has_token = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            '\\' if !in_single => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_token = true;
                }
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token {
                    out.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::OutputShape;

    fn channel(yaml: &str) -> Channel {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn plain_resolved(url: &str) -> ResolvedSource {
        ResolvedSource {
            url: url.to_string(),
            headers: Vec::new(),
            input_options: BTreeMap::new(),
        }
    }

    #[test]
    fn split_command_line_honours_quotes() {
        assert_eq!(
            split_command_line(r#"ffmpeg -i "http://host/a b.ts" -c copy"#),
            vec!["ffmpeg", "-i", "http://host/a b.ts", "-c", "copy"]
        );
        assert_eq!(split_command_line("  "), Vec::<String>::new());
        assert_eq!(split_command_line("a ''"), vec!["a", ""]);
    }

    #[test]
    fn inline_command_wins_over_profile() {
        let channel = channel(
            r#"
            id: 3
            name: Custom
            source: http://src/x.ts
            ffmpeg_profile: copy
            custom_ffmpeg: "ffmpeg -re -i {source} -c copy -f mpegts pipe:1"
            "#,
        );
        let profile = ProfileSpec::Structured(StructuredProfile::default());
        let key = StreamKey::new(3, "default", OutputShape::Ts);
        let plan = build_plan(
            &channel,
            Some(&profile),
            &key,
            "ffmpeg",
            std::path::Path::new("/tmp/amps"),
            &plain_resolved("http://src/x.ts"),
        )
        .unwrap();
        assert_eq!(plan.program, "ffmpeg");
        assert_eq!(plan.args[0], "-re");
        assert_eq!(plan.args[2], "http://src/x.ts");
        assert!(plan.shell_line.is_none());
    }

    #[test]
    fn shell_form_keeps_the_line_intact() {
        let channel = channel(
            r#"
            id: 4
            name: Shell
            source: http://src/x.ts
            custom_ffmpeg:
              command: "curl -s {source} | ffmpeg -i - -c copy -f mpegts pipe:1"
              shell: true
            "#,
        );
        let key = StreamKey::new(4, "default", OutputShape::Ts);
        let plan = build_plan(
            &channel,
            None,
            &key,
            "ffmpeg",
            std::path::Path::new("/tmp/amps"),
            &plain_resolved("http://src/x.ts"),
        )
        .unwrap();
        assert_eq!(plan.program, "/bin/sh");
        let line = plan.shell_line.unwrap();
        assert!(line.starts_with("curl -s http://src/x.ts |"));
    }

    #[test]
    fn structured_profile_renders_ts_pipeline() {
        let channel = channel(
            r#"
            id: 5
            name: Plain
            source: http://src/plain.ts
            ffmpeg_profile: copy
            "#,
        );
        let profile: ProfileSpec = serde_yaml::from_str(
            r#"
            options:
              vcodec: copy
              acodec: copy
            "#,
        )
        .unwrap();
        let key = StreamKey::new(5, "default", OutputShape::Ts);
        let plan = build_plan(
            &channel,
            Some(&profile),
            &key,
            "ffmpeg",
            std::path::Path::new("/tmp/amps"),
            &plain_resolved("http://src/plain.ts"),
        )
        .unwrap();
        let joined = plan.args.join(" ");
        assert!(joined.contains("-i http://src/plain.ts"));
        assert!(joined.ends_with("-f mpegts pipe:1"));
        assert!(!plan.segmented);
    }

    #[test]
    fn hls_shape_targets_the_per_key_directory() {
        let channel = channel(
            r#"
            id: 6
            name: Segmented
            source: http://src/seg.ts
            ffmpeg_profile: hls
            output_format: hls
            "#,
        );
        let profile: ProfileSpec = serde_yaml::from_str("options:\n  vcodec: copy\n").unwrap();
        let key = StreamKey::new(6, "default", OutputShape::Hls);
        let plan = build_plan(
            &channel,
            Some(&profile),
            &key,
            "ffmpeg",
            std::path::Path::new("/tmp/amps"),
            &plain_resolved("http://src/seg.ts"),
        )
        .unwrap();
        assert!(plan.segmented);
        assert_eq!(plan.manifest, Some(HLS_MANIFEST));
        let dir = plan.output_dir.unwrap();
        assert!(dir.ends_with("6/default"));
        let joined = plan.args.join(" ");
        assert!(joined.contains("-hls_flags delete_segments+omit_endlist"));
    }

    #[test]
    fn ll_hls_adds_low_latency_flags() {
        let channel = channel(
            r#"
            id: 7
            name: LowLatency
            source: http://src/ll.ts
            ffmpeg_profile: hls
            output_format: ll-hls
            "#,
        );
        let profile: ProfileSpec = serde_yaml::from_str("options: {}\n").unwrap();
        let key = StreamKey::new(7, "default", OutputShape::LlHls);
        let plan = build_plan(
            &channel,
            Some(&profile),
            &key,
            "ffmpeg",
            std::path::Path::new("/tmp/amps"),
            &plain_resolved("http://src/ll.ts"),
        )
        .unwrap();
        assert!(plan.args.join(" ").contains("program_date_time"));
    }

    #[test]
    fn audio_shape_strips_video() {
        let channel = channel(
            r#"
            id: 8
            name: Radio
            source: http://src/a.ts
            ffmpeg_profile: copy
            "#,
        );
        let profile: ProfileSpec = serde_yaml::from_str("options: {}\n").unwrap();
        let key = StreamKey::new(8, "default", OutputShape::Audio);
        let plan = build_plan(
            &channel,
            Some(&profile),
            &key,
            "ffmpeg",
            std::path::Path::new("/tmp/amps"),
            &plain_resolved("http://src/a.ts"),
        )
        .unwrap();
        let joined = plan.args.join(" ");
        assert!(joined.contains("-vn"));
        assert!(joined.contains("-acodec aac"));
    }

    #[test]
    fn resolver_headers_reach_the_input_side(){
        let channel = channel(
            r#"
            id: 9
            name: Indirect
            source: http://watch/page
            ffmpeg_profile: copy
            "#,
        );
        let profile: ProfileSpec = serde_yaml::from_str("options: {}\n").unwrap();
        let key = StreamKey::new(9, "default", OutputShape::Ts);
        let resolved = ResolvedSource {
            url: "https://cdn/video.m3u8".into(),
            headers: vec![("User-Agent".into(), "amps".into())],
            input_options: BTreeMap::from([(
                "protocol_whitelist".to_string(),
                serde_json::Value::String("file,http,https,tcp,tls,crypto".into()),
            )]),
        };
        let plan = build_plan(
            &channel,
            Some(&profile),
            &key,
            "ffmpeg",
            std::path::Path::new("/tmp/amps"),
            &resolved,
        )
        .unwrap();
        let joined = plan.args.join(" ");
        assert!(joined.contains("-protocol_whitelist file,http,https,tcp,tls,crypto"));
        assert!(plan.args.contains(&"-headers".to_string()));
        assert!(joined.contains("-i https://cdn/video.m3u8"));
        let i_pos = plan.args.iter().position(|a| a == "-i").unwrap();
        let h_pos = plan.args.iter().position(|a| a == "-headers").unwrap();
        assert!(h_pos < i_pos);
    }

    #[test]
    fn argv_template_substitutes_placeholders() {
        let channel = channel(
            r#"
            id: 10
            name: Templated
            source: http://src/t.ts
            ffmpeg_profile: raw
            "#,
        );
        let profile = ProfileSpec::Args(vec![
            "-i".into(),
            "{source}".into(),
            "-metadata".into(),
            "title={name}".into(),
            "-f".into(),
            "mpegts".into(),
            "pipe:1".into(),
        ]);
        let key = StreamKey::new(10, "default", OutputShape::Ts);
        let plan = build_plan(
            &channel,
            Some(&profile),
            &key,
            "ffmpeg",
            std::path::Path::new("/tmp/amps"),
            &plain_resolved("http://src/t.ts"),
        )
        .unwrap();
        assert_eq!(plan.args[1], "http://src/t.ts");
        assert_eq!(plan.args[3], "title=Templated");
    }

    #[test]
    fn overlap_key_inherits_channel_shape() {
        let channel = channel(
            r#"
            id: 11
            name: Private
            source: http://src/p.ts
            ffmpeg_profile: copy
            "#,
        );
        let key = StreamKey::new(11, "default", OutputShape::Overlap(1));
        assert_eq!(effective_format(&key, &channel), OutputFormat::Ts);
    }
}
