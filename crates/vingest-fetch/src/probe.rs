//! Parsing of downloader output: the pre-probe line, progress
//! percentages, and opportunistic quality observations.

use std::sync::OnceLock;

use regex::Regex;

use vingest_models::SelectedQuality;

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+\.\d+)%").expect("valid regex"))
}

fn resolution_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{2,5})x(\d{2,5})\b").expect("valid regex"))
}

fn fps_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{2,3})fps\b").expect("valid regex"))
}

const VIDEO_CODEC_TOKENS: [&str; 3] = ["vp09", "avc1", "av01"];
const AUDIO_CODEC_TOKENS: [&str; 3] = ["opus", "mp4a", "aac"];

/// Parse the single pre-probe line:
/// `format_id|resolution|fps|vcodec|acodec|note`.
///
/// Returns `None` when the line does not have the expected shape.
pub fn parse_probe_line(line: &str) -> Option<SelectedQuality> {
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() < 5 {
        return None;
    }

    let field = |s: &str| -> Option<String> {
        let s = s.trim();
        if s.is_empty() || s == "none" || s == "NA" || s == "N/A" {
            None
        } else {
            Some(s.to_string())
        }
    };

    Some(SelectedQuality {
        format_id: field(fields[0]),
        resolution: field(fields[1]).map(|r| normalize_resolution(&r)),
        fps: fields[2].trim().parse::<f64>().ok().map(|f| f.round() as u32),
        video_codec: field(fields[3]),
        audio_codec: field(fields[4]),
        note: fields.get(5).copied().and_then(field),
    })
}

/// Normalize `1920x1080` / `1080p` / `1080` into `1080p`.
pub fn normalize_resolution(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(caps) = resolution_re().captures(raw) {
        if let Ok(height) = caps[2].parse::<u32>() {
            return format!("{}p", height);
        }
    }
    if let Ok(height) = raw.trim_end_matches('p').parse::<u32>() {
        return format!("{}p", height);
    }
    raw.to_string()
}

/// Extract a download percentage from a progress line.
pub fn parse_progress_percent(line: &str) -> Option<f64> {
    let caps = progress_re().captures(line)?;
    caps[1].parse().ok()
}

/// Harvest quality fields from arbitrary downloader stdout.
pub fn harvest_quality(line: &str) -> SelectedQuality {
    let mut quality = SelectedQuality::default();

    if let Some(caps) = resolution_re().captures(line) {
        if let Ok(height) = caps[2].parse::<u32>() {
            quality.resolution = Some(format!("{}p", height));
        }
    }
    if let Some(caps) = fps_re().captures(line) {
        quality.fps = caps[1].parse().ok();
    }
    let lower = line.to_ascii_lowercase();
    for token in VIDEO_CODEC_TOKENS {
        if lower.contains(token) {
            quality.video_codec = Some(token.to_string());
            break;
        }
    }
    for token in AUDIO_CODEC_TOKENS {
        if lower.contains(token) {
            quality.audio_codec = Some(token.to_string());
            break;
        }
    }

    quality
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_probe_line() {
        let q = parse_probe_line("137+140|1920x1080|30.0|avc1.640028|mp4a.40.2|1080p").unwrap();
        assert_eq!(q.format_id.as_deref(), Some("137+140"));
        assert_eq!(q.resolution.as_deref(), Some("1080p"));
        assert_eq!(q.fps, Some(30));
        assert_eq!(q.video_codec.as_deref(), Some("avc1.640028"));
        assert_eq!(q.audio_codec.as_deref(), Some("mp4a.40.2"));
        assert_eq!(q.note.as_deref(), Some("1080p"));
    }

    #[test]
    fn probe_line_with_missing_fields() {
        let q = parse_probe_line("22|1280x720|none|avc1|none|").unwrap();
        assert_eq!(q.resolution.as_deref(), Some("720p"));
        assert_eq!(q.fps, None);
        assert_eq!(q.audio_codec, None);
        assert_eq!(q.note, None);
    }

    #[test]
    fn rejects_malformed_probe_line() {
        assert!(parse_probe_line("not a probe line").is_none());
        assert!(parse_probe_line("").is_none());
    }

    #[test]
    fn parses_progress_lines() {
        assert_eq!(
            parse_progress_percent("[download]  42.7% of 400.00MiB at 2.00MiB/s"),
            Some(42.7)
        );
        assert_eq!(parse_progress_percent("[download] Destination: x.mp4"), None);
    }

    #[test]
    fn harvests_quality_tokens() {
        let q = harvest_quality("[download] 1920x1080 at 60fps, vp09.00.40.08 / opus");
        assert_eq!(q.resolution.as_deref(), Some("1080p"));
        assert_eq!(q.fps, Some(60));
        assert_eq!(q.video_codec.as_deref(), Some("vp09"));
        assert_eq!(q.audio_codec.as_deref(), Some("opus"));
    }

    #[test]
    fn normalizes_resolutions() {
        assert_eq!(normalize_resolution("1920x1080"), "1080p");
        assert_eq!(normalize_resolution("720p"), "720p");
        assert_eq!(normalize_resolution("720"), "720p");
        assert_eq!(normalize_resolution("audio only"), "audio only");
    }
}
