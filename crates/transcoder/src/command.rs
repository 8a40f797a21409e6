//! Transcoder command lines.
//!
//! A [`CommandTemplate`] is a program plus an argument list with
//! placeholders:
//!
//! - `{input}` is replaced by the source path, anywhere inside an argument;
//! - `{format}` is replaced by the format tag (`mp4`, `webm`), anywhere
//!   inside an argument;
//! - an argument that is exactly `{format_args}` expands to the encoder
//!   flags of the requested format.
//!
//! Encoded output must be written to file descriptor 3 (`pipe:3` for ffmpeg).

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use recast_core::types::OutputFormat;

pub const INPUT_PLACEHOLDER: &str = "{input}";
pub const FORMAT_PLACEHOLDER: &str = "{format}";
pub const FORMAT_ARGS_PLACEHOLDER: &str = "{format_args}";

const COMMON_OPTIONS: &[&str] = &["-hide_banner", "-loglevel", "warning"];

// Chapters and container metadata are dropped from every output.
const STRIP_OPTIONS: &[&str] = &["-map_chapters", "-1", "-map_metadata", "-1"];

const MP4_OPTIONS: &[&str] = &[
    "-c:v",
    "libx264",
    "-pix_fmt",
    "yuv420p",
    "-movflags",
    "+faststart+frag_keyframe+empty_moov",
    "-crf",
    "20",
    "-c:a",
    "aac",
    "-f",
    "mp4",
];

const WEBM_OPTIONS: &[&str] = &[
    "-c:v",
    "libvpx",
    "-b:v",
    "1M",
    "-c:a",
    "libvorbis",
    "-sn",
    "-f",
    "webm",
];

/// Encoder flags for one output container.
pub fn format_args(format: OutputFormat) -> Vec<String> {
    let specific = match format {
        OutputFormat::Mp4 => MP4_OPTIONS,
        OutputFormat::Webm => WEBM_OPTIONS,
    };
    STRIP_OPTIONS
        .iter()
        .chain(specific)
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// ffmpeg writing the encoded stream to `pipe:3`.
    pub fn ffmpeg(ffmpeg_path: impl Into<PathBuf>) -> Self {
        let mut args: Vec<String> = COMMON_OPTIONS.iter().map(|s| s.to_string()).collect();
        args.extend([
            "-i".into(),
            INPUT_PLACEHOLDER.into(),
            FORMAT_ARGS_PLACEHOLDER.into(),
            "pipe:3".into(),
        ]);
        Self {
            program: ffmpeg_path.into(),
            args,
        }
    }

    /// Concrete argument list for one source file and container.
    pub fn render(&self, input: &Path, format: OutputFormat) -> Vec<OsString> {
        let mut out = Vec::with_capacity(self.args.len() + 16);
        for arg in &self.args {
            if arg == FORMAT_ARGS_PLACEHOLDER {
                out.extend(format_args(format).into_iter().map(OsString::from));
            } else if arg == INPUT_PLACEHOLDER {
                // kept as an OsString so non-UTF-8 paths survive
                out.push(input.as_os_str().to_owned());
            } else {
                let rendered = arg
                    .replace(INPUT_PLACEHOLDER, &input.to_string_lossy())
                    .replace(FORMAT_PLACEHOLDER, format.as_str());
                out.push(OsString::from(rendered));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn ffmpeg_mp4_command_line() {
        let args = strings(
            CommandTemplate::ffmpeg("ffmpeg").render(Path::new("/m/a b.mkv"), OutputFormat::Mp4),
        );
        assert_eq!(&args[..5], ["-hide_banner", "-loglevel", "warning", "-i", "/m/a b.mkv"]);
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(args.windows(2).any(|w| w == ["-movflags", "+faststart+frag_keyframe+empty_moov"]));
        assert_eq!(args.last().map(String::as_str), Some("pipe:3"));
        assert!(!args.iter().any(|a| a.contains('{')));
    }

    #[test]
    fn ffmpeg_webm_command_line() {
        let args = strings(
            CommandTemplate::ffmpeg("ffmpeg").render(Path::new("/m/a.avi"), OutputFormat::Webm),
        );
        assert!(args.windows(2).any(|w| w == ["-c:v", "libvpx"]));
        assert!(args.windows(2).any(|w| w == ["-f", "webm"]));
        assert!(args.contains(&"-sn".to_string()));
    }

    #[test]
    fn placeholders_inside_arguments() {
        let template = CommandTemplate::new("sh", ["-c", "cat '{input}' > out.{format}"]);
        let args = strings(template.render(Path::new("/x/y.mov"), OutputFormat::Webm));
        assert_eq!(args, ["-c", "cat '/x/y.mov' > out.webm"]);
    }
}
