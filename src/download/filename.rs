//! File name sanitization and deterministic per-post naming.
//!
//! Names are planned for a whole post at once so that the same asset list
//! always maps to the same file names, whichever order tasks finish in.

use std::collections::HashSet;
use std::path::{Component, Path};

use url::Url;

use crate::model::Asset;

/// Longest file name produced, in characters (extension included).
pub const MAX_FILENAME_CHARS: usize = 200;

/// Fallback extension when neither the name nor the URL carries one.
const FALLBACK_EXTENSION: &str = "bin";

/// Coarse media class of a file, used by the asset type filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaCategory {
    /// Still or animated images.
    Image,
    /// Video files.
    Video,
    /// Audio files.
    Audio,
    /// Anything else (archives, documents, ...).
    Other,
}

/// Returns the lowercase extension of the URL's last path segment, with the
/// leading dot.
pub(crate) fn extension_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last_segment = parsed.path_segments()?.next_back()?;
    extension_of(last_segment)
}

fn extension_of(name: &str) -> Option<String> {
    let dot_index = name.rfind('.')?;
    let ext = &name[dot_index..];
    if ext.len() <= 1 || ext.len() > 12 || dot_index == 0 {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Classifies an extension such as `.png`. Unknown extensions are `Other`.
#[must_use]
pub fn category_from_extension(ext: &str) -> MediaCategory {
    match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "tif" | "tiff" | "avif" | "heic" => {
            MediaCategory::Image
        }
        "mp4" | "webm" | "mov" | "mkv" | "m4v" | "avi" => MediaCategory::Video,
        "mp3" | "wav" | "ogg" | "flac" | "m4a" | "aac" | "opus" => MediaCategory::Audio,
        _ => MediaCategory::Other,
    }
}

/// Classifies a Content-Type header value. `None` for untyped bodies
/// (`application/octet-stream`) whose class cannot be told.
#[must_use]
pub fn category_from_content_type(content_type: &str) -> Option<MediaCategory> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    match mime.split('/').next().unwrap_or("") {
        "image" => Some(MediaCategory::Image),
        "video" => Some(MediaCategory::Video),
        "audio" => Some(MediaCategory::Audio),
        _ if mime == "application/octet-stream" || mime == "binary/octet-stream" => None,
        _ => Some(MediaCategory::Other),
    }
}

/// Sanitizes a file name for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |` and control characters), rewrites dot-only names and
/// truncates to [`MAX_FILENAME_CHARS`] while keeping the extension.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    let sanitized = if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    };

    truncate_keeping_extension(&sanitized, MAX_FILENAME_CHARS)
}

fn truncate_keeping_extension(name: &str, max_chars: usize) -> String {
    if name.chars().count() <= max_chars {
        return name.to_string();
    }
    let (stem, ext) = split_extension(name);
    let ext_chars = ext.chars().count();
    if ext_chars >= max_chars {
        return name.chars().take(max_chars).collect();
    }
    let stem: String = stem.chars().take(max_chars - ext_chars).collect();
    format!("{stem}{ext}")
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !name.trim_matches('.').is_empty()
        && !Path::new(name).components().any(|component| {
            matches!(
                component,
                Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        })
}

/// Returns the sanitized suggested name, or `None` when there is no usable
/// suggestion.
fn usable_suggestion(asset: &Asset) -> Option<String> {
    let raw = asset.suggested_name.as_deref()?.trim();
    if raw.is_empty() {
        return None;
    }
    let sanitized = sanitize_filename(raw);
    (sanitized.trim_matches('_').chars().count() > 0).then_some(sanitized)
}

/// Name used when an asset offers no usable suggestion.
#[must_use]
pub fn fallback_name(asset: &Asset) -> String {
    let ext = extension_from_url(&asset.asset_url)
        .unwrap_or_else(|| format!(".{FALLBACK_EXTENSION}"));
    format!("asset_{}{ext}", asset.ordinal)
}

/// Plans a file name for every asset of one post, in the given order.
///
/// The first asset to claim a name keeps it. Later claimants get
/// `{stem}_{ordinal}{ext}`, then `{stem}_{ordinal}_2{ext}`,
/// `{stem}_{ordinal}_3{ext}` ... until the name is free. Comparison is
/// case-insensitive so the plan holds on case-folding filesystems.
#[must_use]
pub fn plan_post_file_names(assets: &[Asset]) -> Vec<String> {
    plan_post_file_names_around(assets, &[])
}

/// Like [`plan_post_file_names`], but `recorded[i]`, when present, is the
/// name asset `i` already has on disk. Recorded names are kept as they are and
/// reserved before anything else is planned, so a newly listed asset never
/// lands on a file another asset owns.
#[must_use]
pub fn plan_post_file_names_around(assets: &[Asset], recorded: &[Option<String>]) -> Vec<String> {
    let recorded_for = |i: usize| recorded.get(i).and_then(Option::as_deref);
    let mut taken: HashSet<String> = (0..assets.len())
        .filter_map(|i| recorded_for(i).map(str::to_lowercase))
        .collect();
    let mut names = Vec::with_capacity(assets.len());

    for (i, asset) in assets.iter().enumerate() {
        if let Some(name) = recorded_for(i) {
            names.push(name.to_string());
            continue;
        }
        let preferred = usable_suggestion(asset).unwrap_or_else(|| fallback_name(asset));
        let name = if taken.contains(&preferred.to_lowercase()) {
            disambiguate(&preferred, asset.ordinal, &taken)
        } else {
            preferred
        };
        taken.insert(name.to_lowercase());
        names.push(name);
    }

    names
}

fn disambiguate(name: &str, ordinal: u32, taken: &HashSet<String>) -> String {
    let (stem, ext) = split_extension(name);
    let candidate = format!("{stem}_{ordinal}{ext}");
    if !taken.contains(&candidate.to_lowercase()) {
        return candidate;
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{stem}_{ordinal}_{n}{ext}");
        if !taken.contains(&candidate.to_lowercase()) {
            return candidate;
        }
        n += 1;
    }
}

/// Appends [`PARTIAL_SUFFIX`](super::constants::PARTIAL_SUFFIX) to a final
/// path.
#[must_use]
pub fn partial_path(target: &Path) -> std::path::PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(super::constants::PARTIAL_SUFFIX);
    std::path::PathBuf::from(name)
}
