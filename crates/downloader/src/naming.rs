// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Destination names for downloads that arrive without one.

use jiff::civil::DateTime;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Kind of media a blob holds, used to pick a file extension.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Voice,
    Video,
    Animation,
    VideoNote,
    #[default]
    Document,
    Sticker,
    Audio,
}

impl MediaKind {
    #[must_use]
    pub const fn default_extension(self) -> &'static str {
        match self {
            Self::Photo => ".jpg",
            Self::Voice => ".ogg",
            Self::Video | Self::Animation | Self::VideoNote => ".mp4",
            Self::Sticker => ".webp",
            Self::Audio => ".mp3",
            Self::Document => ".bin",
        }
    }

    /// Extension for a blob of this kind. Photos are always `.jpg`; other
    /// kinds prefer the mime type when it is a known one.
    #[must_use]
    pub fn extension(self, mime_type: Option<&str>) -> &'static str {
        if self == Self::Photo {
            return self.default_extension();
        }
        mime_type
            .and_then(extension_for_mime)
            .unwrap_or_else(|| self.default_extension())
    }
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next()?.trim().to_ascii_lowercase();
    let ext = match essence.as_str() {
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "video/mp4" => ".mp4",
        "video/x-matroska" => ".mkv",
        "video/webm" => ".webm",
        "video/quicktime" => ".mov",
        "audio/mpeg" => ".mp3",
        "audio/ogg" => ".ogg",
        "audio/mp4" | "audio/x-m4a" => ".m4a",
        "audio/flac" | "audio/x-flac" => ".flac",
        "application/pdf" => ".pdf",
        "application/zip" => ".zip",
        "application/x-7z-compressed" => ".7z",
        "application/x-rar-compressed" | "application/vnd.rar" => ".rar",
        "application/x-tar" => ".tar",
        "application/gzip" => ".gz",
        "text/plain" => ".txt",
        "application/json" => ".json",
        _ => return None,
    };
    Some(ext)
}

/// `<kind>_<YYYY-mm-dd_HH-MM-SS>_<id><ext>`
#[must_use]
pub fn fallback_name(kind: MediaKind, mime_type: Option<&str>, at: DateTime, id: u64) -> String {
    format!(
        "{kind}_{}_{id}{}",
        at.strftime("%Y-%m-%d_%H-%M-%S"),
        kind.extension(mime_type)
    )
}

#[cfg(test)]
mod tests {
    use jiff::civil::date;

    use super::*;

    #[test]
    fn test_fallback_name_layout() {
        let at = date(2024, 3, 9).at(14, 5, 7, 0);
        assert_eq!(
            fallback_name(MediaKind::VideoNote, None, at, 42),
            "video_note_2024-03-09_14-05-07_42.mp4"
        );
        assert_eq!(
            fallback_name(MediaKind::Document, Some("application/pdf"), at, 1),
            "document_2024-03-09_14-05-07_1.pdf"
        );
    }

    #[test]
    fn test_photo_ignores_mime() {
        assert_eq!(MediaKind::Photo.extension(Some("image/png")), ".jpg");
    }

    #[test]
    fn test_unknown_mime_falls_back_to_kind() {
        assert_eq!(MediaKind::Audio.extension(Some("audio/x-unknown")), ".mp3");
        assert_eq!(MediaKind::Video.extension(Some("video/MP4; codecs=avc1")), ".mp4");
        assert_eq!(MediaKind::Sticker.extension(None), ".webp");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!("video_note".parse::<MediaKind>().unwrap(), MediaKind::VideoNote);
        assert_eq!(MediaKind::default(), MediaKind::Document);
    }
}
