//! Argument vectors for the download utility.
//!
//! Nothing here spawns a process; the output is a plain `Vec<String>` whose
//! first element is the program.

use std::path::Path;

use crate::models::{DownloadMode, DownloadRequest};

/// Placeholder the download utility replaces with the real extension.
const EXT_PLACEHOLDER: &str = "%(ext)s";
/// Placeholder the download utility replaces with the source title.
const TITLE_PLACEHOLDER: &str = "%(title)s";

/// Flags added when speed boost is on: parallel fragments, generous retries,
/// and no artificial sleeps.
const SPEED_BOOST_ARGS: &[&str] = &[
    "--concurrent-fragments",
    "8",
    "--fragment-retries",
    "10",
    "--retries",
    "10",
    "--socket-timeout",
    "120",
    "--buffer-size",
    "16K",
    "--http-chunk-size",
    "10M",
    "--sleep-requests",
    "0",
    "--sleep-interval",
    "0",
    "--max-sleep-interval",
    "0",
];

/// Replace characters that are invalid in file names on common platforms.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect()
}

/// `-o` template: custom (sanitized) name if given, otherwise the source title.
pub fn output_template(destination_dir: &Path, custom_filename: &str) -> String {
    let custom = custom_filename.trim();
    let file = if custom.is_empty() {
        format!("{TITLE_PLACEHOLDER}.{EXT_PLACEHOLDER}")
    } else {
        format!("{}.{EXT_PLACEHOLDER}", sanitize_filename(custom))
    };
    destination_dir.join(file).to_string_lossy().to_string()
}

/// Build the full argument vector for one download.
///
/// `format_id` is the id after any fast-mode substitution; `mode` decides
/// between the combined and the merge shape.
pub fn build_download_args(
    program: &Path,
    request: &DownloadRequest,
    format_id: &str,
    mode: DownloadMode,
) -> Vec<String> {
    let mut args = vec![
        program.to_string_lossy().to_string(),
        "-o".to_string(),
        output_template(&request.destination_dir, &request.custom_filename),
        "--progress".to_string(),
        "--newline".to_string(),
        "--no-playlist".to_string(),
        "--format".to_string(),
    ];

    match mode {
        DownloadMode::Combined => args.push(format_id.to_string()),
        DownloadMode::Merge => {
            args.push(format!("{}+{}/best", format_id, request.audio_quality));
            args.push("--merge-output-format".to_string());
            args.push("mp4".to_string());
            args.push("--embed-metadata".to_string());
        }
    }

    if request.speed_boost {
        args.extend(SPEED_BOOST_ARGS.iter().map(|s| s.to_string()));
    }

    if request.force_overwrite {
        args.push("--force-overwrites".to_string());
    }

    args.push(request.url.clone());
    args
}

/// Argument vector for the catalog call.
pub fn build_list_formats_args(url: &str) -> Vec<String> {
    vec![
        "--list-formats".to_string(),
        "--no-playlist".to_string(),
        url.to_string(),
    ]
}

/// Quote-free rendering for logs.
pub fn display_command(args: &[String]) -> String {
    args.join(" ")
}
