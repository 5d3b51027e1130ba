use lazy_static::lazy_static;
use rand::Rng;
use std::collections::HashSet;
use std::path::{Component, Path};

const MAX_STEM_LEN: usize = 96;
const FALLBACK_STEM: &str = "upload";

lazy_static! {
    static ref IMAGE_EXTENSIONS: HashSet<&'static str> =
        ["jpg", "jpeg", "png", "bmp", "gif"].into_iter().collect();
}

pub fn is_image_extension(ext: &str) -> bool {
    IMAGE_EXTENSIONS.contains(ext.to_ascii_lowercase().as_str())
}

pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

pub fn is_image_name(name: &str) -> bool {
    extension_of(name).is_some_and(|ext| is_image_extension(&ext))
}

pub fn mime_type_for(ext: &str) -> &'static str {
    image::ImageFormat::from_extension(ext)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream")
}

/// True when `name` is a single normal path component, i.e. something that
/// can be joined onto a directory without leaving it.
pub fn is_plain_component(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Keeps `[A-Za-z0-9._-]`, turns whitespace into underscores and drops the rest.
pub fn clean_segment(raw: &str) -> String {
    raw.chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect()
}

pub fn random_suffix() -> String {
    format!("{:06x}", rand::rng().random::<u32>() & 0x00ff_ffff)
}

/// A client-supplied file name reduced to a flat, filesystem-safe form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeName {
    pub stem: String,
    pub ext: String,
}

impl SafeName {
    pub fn from_client(raw: &str) -> Self {
        let flattened: String = raw
            .trim()
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();

        let (stem_raw, ext_raw) = match flattened.rsplit_once('.') {
            Some((stem, ext)) => (stem, ext),
            None => (flattened.as_str(), ""),
        };

        let ext = clean_segment(ext_raw).replace('.', "");
        let mut stem = clean_segment(stem_raw)
            .trim_matches(|c| matches!(c, '.' | '_' | '-'))
            .to_string();
        if stem.len() > MAX_STEM_LEN {
            stem.truncate(MAX_STEM_LEN);
        }
        if stem.is_empty() {
            stem = FALLBACK_STEM.to_string();
        }

        Self { stem, ext }
    }

    pub fn file_name(&self) -> String {
        if self.ext.is_empty() {
            self.stem.clone()
        } else {
            format!("{}.{}", self.stem, self.ext)
        }
    }

    pub fn with_suffix(&self, suffix: &str) -> String {
        if self.ext.is_empty() {
            format!("{}_{}", self.stem, suffix)
        } else {
            format!("{}_{}.{}", self.stem, suffix, self.ext)
        }
    }
}
