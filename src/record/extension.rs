//! # Record Extension Module
//!
//! This module defines the [`Extension`] enum, which represents the file extension
//! of a media file associated with an imageboard post. It provides utilities for
//! parsing extension strings and determining file characteristics (e.g., if it's a video).

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::RecordError;

/// Represents the file extension of a downloaded media file.
///
/// This enum covers common image, video, and special formats found on imageboards.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Extension {
    AVIF,
    JXL,
    /// The `JPG` variant also encompasses the other extensions a jpeg might have, including `.jpg`, `.jpeg` and `.jfif`
    JPG,
    /// The `PNG` variant can also include the rare `.apng` whenever it's present.
    PNG,
    WEBP,
    GIF,
    WEBM,
    MP4,
    /// Pixiv Ugoira is usually downloaded as a zip file with all frames without any additional metadata.
    Ugoira,
    /// Used for any file whose extension is unknown or not currently supported by this library.
    Unknown,
}

impl Extension {
    /// Attempts to determine the `Extension` from a string slice, defaulting to
    /// [`Extension::Unknown`].
    pub fn guess_format(s: &str) -> Self {
        Self::from_str(s).unwrap_or(Self::Unknown)
    }

    /// Extracts the extension from the last path segment of an url, ignoring query strings.
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or_default();
        let segment = path.rsplit('/').next().unwrap_or_default();
        match segment.rsplit_once('.') {
            Some((_, ext)) => Self::guess_format(ext),
            None => Self::Unknown,
        }
    }

    /// Checks if the extension typically represents a video or animated format.
    pub const fn is_video(&self) -> bool {
        matches!(self, Self::GIF | Self::WEBM | Self::MP4 | Self::Ugoira)
    }
}

impl FromStr for Extension {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jpg" | "jpeg" | "jfif" => Ok(Self::JPG),
            "png" | "apng" => Ok(Self::PNG),
            "webp" => Ok(Self::WEBP),
            "webm" => Ok(Self::WEBM),
            "mp4" => Ok(Self::MP4),
            "gif" => Ok(Self::GIF),
            "zip" => Ok(Self::Ugoira),
            "jxl" => Ok(Self::JXL),
            "avif" => Ok(Self::AVIF),
            _ => Err(RecordError::UnknownExtension {
                message: s.to_string(),
            }),
        }
    }
}

impl Display for Extension {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::JPG => write!(f, "jpg"),
            Self::PNG => write!(f, "png"),
            Self::WEBP => write!(f, "webp"),
            Self::GIF => write!(f, "gif"),
            Self::WEBM => write!(f, "webm"),
            Self::MP4 => write!(f, "mp4"),
            Self::Ugoira => write!(f, "zip"),
            Self::Unknown => write!(f, "bin"),
            Self::AVIF => write!(f, "avif"),
            Self::JXL => write!(f, "jxl"),
        }
    }
}
