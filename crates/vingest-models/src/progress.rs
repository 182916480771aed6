//! Progress reporting types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stage a job is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    /// Fetching from the source
    #[default]
    Downloading,
    /// Streaming to the origin
    Uploading,
    /// Removing temp files
    Cleanup,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStage::Downloading => "downloading",
            ProgressStage::Uploading => "uploading",
            ProgressStage::Cleanup => "cleanup",
        }
    }
}

/// One try through an egress identity during a platform download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressAttempt {
    /// Proxy URL of the identity
    pub identity_url: String,
    /// 1-based position in the rotation
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub succeeded: bool,
    /// Round-trip time of the attempt when it finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EgressAttempt {
    /// Open a new attempt record.
    pub fn begin(identity_url: impl Into<String>, attempt_number: u32) -> Self {
        Self {
            identity_url: identity_url.into(),
            attempt_number,
            started_at: Utc::now(),
            ended_at: None,
            succeeded: false,
            response_ms: None,
            error: None,
        }
    }

    /// Close the attempt as a success.
    pub fn succeed(mut self) -> Self {
        let now = Utc::now();
        self.response_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.ended_at = Some(now);
        self.succeeded = true;
        self
    }

    /// Close the attempt as a failure.
    pub fn fail(mut self, error: impl Into<String>) -> Self {
        let now = Utc::now();
        self.response_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.ended_at = Some(now);
        self.succeeded = false;
        self.error = Some(error.into());
        self
    }
}

/// Quality of the format the platform downloader selected.
///
/// The pre-probe line is authoritative; fields left empty by the probe
/// may be filled in from download output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectedQuality {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_id: Option<String>,
    /// e.g. "1080p"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl SelectedQuality {
    /// Fill empty fields from another observation, keeping existing
    /// values untouched.
    pub fn merge_missing(&mut self, other: &SelectedQuality) {
        if self.format_id.is_none() {
            self.format_id = other.format_id.clone();
        }
        if self.resolution.is_none() {
            self.resolution = other.resolution.clone();
        }
        if self.fps.is_none() {
            self.fps = other.fps;
        }
        if self.video_codec.is_none() {
            self.video_codec = other.video_codec.clone();
        }
        if self.audio_codec.is_none() {
            self.audio_codec = other.audio_codec.clone();
        }
        if self.note.is_none() {
            self.note = other.note.clone();
        }
    }
}

/// Structured progress snapshot for one job attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub stage: ProgressStage,
    /// 0..=100, non-decreasing within an attempt
    pub percentage: f64,
    pub message: String,
    /// One entry per egress identity attempted, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress_attempts: Vec<EgressAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_quality: Option<SelectedQuality>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            stage: ProgressStage::Downloading,
            percentage: 0.0,
            message: String::new(),
            egress_attempts: Vec::new(),
            selected_quality: None,
        }
    }
}

impl Progress {
    /// Create a snapshot for a stage.
    pub fn stage(stage: ProgressStage, percentage: f64, message: impl Into<String>) -> Self {
        Self {
            stage,
            percentage: percentage.clamp(0.0, 100.0),
            message: message.into(),
            egress_attempts: Vec::new(),
            selected_quality: None,
        }
    }

    /// Merge an update into this snapshot, enforcing that the
    /// percentage never moves backwards within an attempt.
    pub fn apply(&mut self, update: Progress) {
        let floor = if update.stage == self.stage {
            self.percentage
        } else {
            0.0
        };
        self.stage = update.stage;
        self.percentage = update.percentage.clamp(floor, 100.0);
        if !update.message.is_empty() {
            self.message = update.message;
        }
        if !update.egress_attempts.is_empty() {
            self.egress_attempts = update.egress_attempts;
        }
        match (&mut self.selected_quality, update.selected_quality) {
            (Some(current), Some(incoming)) => current.merge_missing(&incoming),
            (slot @ None, Some(incoming)) => *slot = Some(incoming),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_is_monotone_within_stage() {
        let mut p = Progress::stage(ProgressStage::Downloading, 40.0, "downloading");
        p.apply(Progress::stage(ProgressStage::Downloading, 25.0, ""));
        assert_eq!(p.percentage, 40.0);
        p.apply(Progress::stage(ProgressStage::Downloading, 60.0, ""));
        assert_eq!(p.percentage, 60.0);
    }

    #[test]
    fn stage_change_resets_floor() {
        let mut p = Progress::stage(ProgressStage::Downloading, 90.0, "downloading");
        p.apply(Progress::stage(ProgressStage::Uploading, 0.0, "uploading"));
        assert_eq!(p.stage, ProgressStage::Uploading);
        assert_eq!(p.percentage, 0.0);
    }

    #[test]
    fn egress_attempt_roundtrip() {
        let attempt = EgressAttempt::begin("http://proxy-1:8080", 1).succeed();
        assert!(attempt.succeeded);
        assert!(attempt.ended_at.is_some());
        assert!(attempt.response_ms.is_some());

        let failed = EgressAttempt::begin("http://proxy-2:8080", 2).fail("exit code 1");
        assert!(!failed.succeeded);
        assert_eq!(failed.error.as_deref(), Some("exit code 1"));
    }

    #[test]
    fn quality_merge_keeps_probe_fields() {
        let mut probe = SelectedQuality {
            format_id: Some("137+140".into()),
            resolution: Some("1080p".into()),
            fps: None,
            video_codec: None,
            audio_codec: Some("mp4a".into()),
            note: None,
        };
        let observed = SelectedQuality {
            format_id: Some("22".into()),
            resolution: Some("720p".into()),
            fps: Some(30),
            video_codec: Some("avc1".into()),
            audio_codec: Some("opus".into()),
            note: None,
        };
        probe.merge_missing(&observed);
        assert_eq!(probe.resolution.as_deref(), Some("1080p"));
        assert_eq!(probe.fps, Some(30));
        assert_eq!(probe.video_codec.as_deref(), Some("avc1"));
        assert_eq!(probe.audio_codec.as_deref(), Some("mp4a"));
    }
}
