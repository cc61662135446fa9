use std::path::Path;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "wmv", "flv", "webm", "mkv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    Image,
    Downloadable,
}

impl FileClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileClass::Image => "image",
            FileClass::Downloadable => "downloadable",
        }
    }
}

fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Decides how a file is attached, by extension only.
pub fn classify(file_name: &str) -> FileClass {
    match extension_of(file_name) {
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => FileClass::Image,
        _ => FileClass::Downloadable,
    }
}

pub fn is_video(file_name: &str) -> bool {
    extension_of(file_name).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

pub fn mime_type_for(file_name: &str) -> &'static str {
    match extension_of(file_name).as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("txt") => "text/plain",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("wmv") => "video/x-ms-wmv",
        Some("flv") => "video/x-flv",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

/// Lowercase ASCII slug. Accented Latin letters are transliterated, other
/// non-ASCII letters are kept as `%xx` escapes of their UTF-8 bytes, and runs
/// of anything else collapse into one `-`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.chars().flat_map(char::to_lowercase) {
        let piece = if ch.is_ascii_alphanumeric() {
            Some(SlugPiece::Ascii(ch))
        } else if let Some(latin) = transliterate(ch) {
            Some(SlugPiece::Latin(latin))
        } else if !ch.is_ascii() && ch.is_alphanumeric() {
            Some(SlugPiece::Escaped(ch))
        } else {
            None
        };
        let Some(piece) = piece else {
            pending_dash = true;
            continue;
        };
        if pending_dash && !slug.is_empty() {
            slug.push('-');
        }
        pending_dash = false;
        match piece {
            SlugPiece::Ascii(ch) => slug.push(ch),
            SlugPiece::Latin(latin) => slug.push_str(latin),
            SlugPiece::Escaped(ch) => {
                let mut buf = [0u8; 4];
                for byte in ch.encode_utf8(&mut buf).bytes() {
                    slug.push_str(&format!("%{byte:02x}"));
                }
            }
        }
    }
    slug
}

enum SlugPiece {
    Ascii(char),
    Latin(&'static str),
    Escaped(char),
}

fn transliterate(ch: char) -> Option<&'static str> {
    let latin = match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'æ' => "ae",
        'ç' | 'ć' | 'č' => "c",
        'ď' | 'đ' | 'ð' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => "e",
        'ğ' => "g",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' | 'ı' => "i",
        'ł' => "l",
        'ñ' | 'ń' | 'ň' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'œ' => "oe",
        'ř' => "r",
        'ß' => "ss",
        'ś' | 'š' | 'ş' => "s",
        'ť' | 'ţ' => "t",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' | 'ų' => "u",
        'ý' | 'ÿ' => "y",
        'ź' | 'ż' | 'ž' => "z",
        'þ' => "th",
        _ => return None,
    };
    Some(latin)
}

/// Stable identity of a product: `slugify("{owner_id}-{file_name}")`.
pub fn product_key(owner_id: u64, file_name: &str) -> String {
    slugify(&format!("{owner_id}-{file_name}"))
}

pub fn file_stem(file_name: &str) -> &str {
    Path::new(file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(file_name)
}

/// Human title for a file: extension dropped, `_`/`-` become spaces,
/// first letter of every word upper-cased.
pub fn product_title(file_name: &str) -> String {
    let spaced = file_stem(file_name).replace(['_', '-'], " ");
    spaced
        .split(' ')
        .map(capitalize_first)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize_first(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Loose comparison key used when matching preview files to products.
pub fn normalized_name(name: &str) -> String {
    name.chars()
        .filter(|ch| !matches!(ch, ' ' | '-' | '_'))
        .flat_map(char::to_lowercase)
        .collect()
}
