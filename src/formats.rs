//! Format catalog parsing and classification.
//!
//! The catalog is informational: a download never depends on it, so parsing
//! is best-effort and drops anything that does not look like a format row.
//! The classifier decisions are pure functions of (format id, catalog
//! snapshot, rules, flags).

use serde::{Deserialize, Serialize};

use crate::models::FormatRecord;

/// Provider-specific format identifiers driving the classifier.
///
/// These are numeric codes from one provider's catalog and change over time,
/// so they live in configuration rather than in the decision code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRules {
    /// Streams known to carry video only (need a separate audio stream).
    #[serde(default = "default_video_only_ids")]
    pub video_only_ids: Vec<String>,

    /// Resolution substrings (case-insensitive) that imply a video-only stream.
    #[serde(default = "default_high_res_markers")]
    pub high_res_markers: Vec<String>,

    /// 1440p / 4K identifiers that fast mode tries to replace.
    #[serde(default = "default_very_high_res_ids")]
    pub very_high_res_ids: Vec<String>,

    /// Replacement for `very_high_res_ids`; must report a 1080 resolution.
    #[serde(default = "default_very_high_res_fallback_id")]
    pub very_high_res_fallback_id: String,

    /// 1080p identifiers that fast mode tries to replace.
    #[serde(default = "default_full_hd_ids")]
    pub full_hd_ids: Vec<String>,

    /// Candidates for replacing `full_hd_ids`; must report a 720 resolution.
    #[serde(default = "default_hd_fallback_ids")]
    pub hd_fallback_ids: Vec<String>,
}

impl Default for FormatRules {
    fn default() -> Self {
        Self {
            video_only_ids: default_video_only_ids(),
            high_res_markers: default_high_res_markers(),
            very_high_res_ids: default_very_high_res_ids(),
            very_high_res_fallback_id: default_very_high_res_fallback_id(),
            full_hd_ids: default_full_hd_ids(),
            hd_fallback_ids: default_hd_fallback_ids(),
        }
    }
}

fn strings(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn default_video_only_ids() -> Vec<String> {
    strings(&["137", "299", "298", "248", "271", "272", "313", "315", "308"])
}

fn default_high_res_markers() -> Vec<String> {
    strings(&["1080", "1440", "2160", "4k"])
}

fn default_very_high_res_ids() -> Vec<String> {
    strings(&["271", "272", "313", "315", "308"])
}

fn default_very_high_res_fallback_id() -> String {
    "248".to_string()
}

fn default_full_hd_ids() -> Vec<String> {
    strings(&["137", "299", "298"])
}

fn default_hd_fallback_ids() -> Vec<String> {
    strings(&["136", "135"])
}

impl FormatRules {
    /// Whether `format_id` is a video-only stream that must be paired with
    /// an audio stream and merged.
    ///
    /// Unknown ids (absent from both the allow-list and the catalog) are
    /// treated as combined streams.
    pub fn needs_merge(&self, format_id: &str, catalog: &[FormatRecord]) -> bool {
        if contains(&self.video_only_ids, format_id) {
            return true;
        }

        match catalog.iter().find(|f| f.id == format_id) {
            Some(record) => {
                let resolution = record.resolution.to_lowercase();
                self.high_res_markers
                    .iter()
                    .any(|m| resolution.contains(&m.to_lowercase()))
            }
            None => false,
        }
    }

    /// Substitute a lower-resolution id when fast mode is on.
    ///
    /// Only ids the catalog actually offers are substituted; otherwise the
    /// original id comes back unchanged.
    pub fn fast_downgrade(
        &self,
        format_id: &str,
        catalog: &[FormatRecord],
        fast_enabled: bool,
    ) -> String {
        if !fast_enabled {
            return format_id.to_string();
        }

        if contains(&self.very_high_res_ids, format_id) {
            let fallback = catalog.iter().find(|f| {
                f.id == self.very_high_res_fallback_id && f.resolution.contains("1080")
            });
            if let Some(record) = fallback {
                log::info!(
                    "Fast mode: using {} (1080p) instead of {}",
                    record.id,
                    format_id
                );
                return record.id.clone();
            }
        } else if contains(&self.full_hd_ids, format_id) {
            let fallback = catalog
                .iter()
                .find(|f| contains(&self.hd_fallback_ids, &f.id) && f.resolution.contains("720"));
            if let Some(record) = fallback {
                log::info!(
                    "Fast mode: using {} (720p) instead of {}",
                    record.id,
                    format_id
                );
                return record.id.clone();
            }
        }

        format_id.to_string()
    }
}

fn contains(list: &[String], id: &str) -> bool {
    list.iter().any(|x| x == id)
}

/// Parse the tabular `--list-formats` output into records.
///
/// Malformed rows are dropped silently.
pub fn parse_format_catalog(output: &str) -> Vec<FormatRecord> {
    let mut formats = Vec::new();

    for line in output.lines() {
        if is_header(line) || is_noise(line) {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            continue;
        }

        let id = parts[0];
        let extension = parts[1];
        if id.is_empty() || extension.is_empty() {
            continue;
        }

        let resolution = if parts[2].eq_ignore_ascii_case("audio") {
            "audio"
        } else {
            parts[2]
        };
        let size = parts.get(3).copied().unwrap_or("unknown");

        formats.push(FormatRecord::new(id, extension, resolution, size));
    }

    formats
}

fn is_header(line: &str) -> bool {
    line.contains("ID") && line.contains("EXT") && line.contains("RESOLUTION")
}

/// `[info] Available formats for ...` style diagnostics and table rulers.
fn is_noise(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with('[') {
        return true;
    }
    let ruler = trimmed.trim_end();
    !ruler.is_empty() && ruler.chars().all(|c| matches!(c, '-' | '─' | ' ' | '|' | '│'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_FORMATS: &str = "\
[youtube] Extracting URL: https://www.youtube.com/watch?v=abc
[info] Available formats for abc:
ID  EXT   RESOLUTION FPS CH │   FILESIZE   TBR PROTO │ VCODEC         VCODEC
─────────────────────────────────────────────────────────────────────────────
140 m4a   audio only      2 │    3.32MiB  129k https │ audio only        mp4a.40.2
160 mp4   256x144     30    │    2.10MiB   81k https │ avc1.4d400c    video only
136 mp4   1280x720    30    │   25.43MiB  989k https │ avc1.4d401f    video only
137 mp4   1920x1080   30    │   48.21MiB 1876k https │ avc1.640028    video only
248 webm  1920x1080   30    │   40.01MiB 1556k https │ vp9            video only
18  mp4   640x360     30  2 │ ~ 9.20MiB  358k https │ avc1.42001E    mp4a.40.2
bad
";

    fn catalog(rows: &[(&str, &str)]) -> Vec<FormatRecord> {
        rows.iter()
            .map(|(id, res)| FormatRecord::new(*id, "mp4", *res, "1MiB"))
            .collect()
    }

    #[test]
    fn parses_rows_and_skips_header_and_noise() {
        let formats = parse_format_catalog(LIST_FORMATS);
        let ids: Vec<&str> = formats.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["140", "160", "136", "137", "248", "18"]);

        assert_eq!(formats[0].resolution, "audio");
        assert_eq!(formats[2].resolution, "1280x720");
        assert_eq!(formats[3].extension, "mp4");
        assert_eq!(formats[3].display_label, "137 - mp4 - 1920x1080 - 30");
    }

    #[test]
    fn empty_output_gives_empty_catalog() {
        assert!(parse_format_catalog("").is_empty());
        assert!(parse_format_catalog("\n\n   \n").is_empty());
    }

    #[test]
    fn short_lines_are_dropped() {
        let formats = parse_format_catalog("22 mp4 1280x720\n18 mp4 640x360 10MiB\n");
        assert_eq!(formats.len(), 1);
        assert_eq!(formats[0].id, "18");
    }

    #[test]
    fn allow_listed_ids_need_merge() {
        let rules = FormatRules::default();
        for id in ["137", "299", "248", "313"] {
            assert!(rules.needs_merge(id, &[]), "{id} should need merge");
        }
    }

    #[test]
    fn unknown_ids_are_left_alone() {
        let rules = FormatRules::default();
        let catalog = catalog(&[("18", "640x360"), ("22", "1280x720")]);
        for id in ["1", "best", "best[height<=720]", "9999", ""] {
            assert!(!rules.needs_merge(id, &catalog));
            assert_eq!(rules.fast_downgrade(id, &catalog, true), id);
            assert_eq!(rules.fast_downgrade(id, &catalog, false), id);
        }
    }

    #[test]
    fn catalog_resolution_drives_merge_regardless_of_case() {
        let rules = FormatRules::default();
        let catalog = catalog(&[
            ("401", "3840x2160"),
            ("900", "4K"),
            ("901", "Ultra 4k HDR"),
            ("902", "2560x1440"),
            ("22", "1280x720"),
        ]);
        for id in ["401", "900", "901", "902"] {
            assert!(rules.needs_merge(id, &catalog), "{id} should need merge");
        }
        assert!(!rules.needs_merge("22", &catalog));
    }

    #[test]
    fn fast_mode_replaces_4k_with_1080_fallback() {
        let rules = FormatRules::default();
        let catalog = catalog(&[("248", "1920x1080"), ("313", "3840x2160")]);
        assert_eq!(rules.fast_downgrade("313", &catalog, true), "248");
        assert_eq!(rules.fast_downgrade("313", &catalog, false), "313");
    }

    #[test]
    fn fast_mode_needs_matching_resolution() {
        let rules = FormatRules::default();
        let catalog = catalog(&[("248", "2560x1440")]);
        assert_eq!(rules.fast_downgrade("313", &catalog, true), "313");
    }

    #[test]
    fn fast_mode_replaces_1080_with_first_720_candidate() {
        let rules = FormatRules::default();
        let catalog = catalog(&[
            ("18", "640x360"),
            ("135", "854x480"),
            ("136", "1280x720"),
        ]);
        assert_eq!(rules.fast_downgrade("137", &catalog, true), "136");
        assert!(!rules.needs_merge("136", &catalog));
    }

    #[test]
    fn fast_mode_without_candidates_keeps_id() {
        let rules = FormatRules::default();
        assert_eq!(rules.fast_downgrade("137", &[], true), "137");
    }

    #[test]
    fn rules_deserialize_with_partial_overrides() {
        let rules: FormatRules = serde_json::from_str(r#"{"video_only_ids": ["42"]}"#).unwrap();
        assert_eq!(rules.video_only_ids, vec!["42".to_string()]);
        assert_eq!(rules.hd_fallback_ids, default_hd_fallback_ids());
        assert!(rules.needs_merge("42", &[]));
        assert!(!rules.needs_merge("137", &[]));
    }
}
