//! File-name helpers shared across the pipeline.

use rand::Rng;

/// Split a file name into `(stem, extension)`. The extension includes
/// the leading dot; a name without one yields an empty extension.
pub fn split_file_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx < name.len() - 1 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// Strip characters that are unsafe in object names, collapsing runs
/// of replaced characters into a single dash.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Build a collision-free destination object name:
/// `basename-<8-char-nonce><ext>`.
pub fn object_name_with_nonce(file_name: &str) -> String {
    let sanitized = sanitize_file_name(file_name);
    let (stem, ext) = split_file_name(&sanitized);
    format!("{}-{}{}", stem, nonce(), ext)
}

/// 8 hex characters of randomness.
pub fn nonce() -> String {
    let mut rng = rand::rng();
    let value: u32 = rng.random();
    format!("{:08x}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_extension() {
        assert_eq!(split_file_name("video.mp4"), ("video", ".mp4"));
        assert_eq!(split_file_name("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_file_name("noext"), ("noext", ""));
        assert_eq!(split_file_name(".hidden"), (".hidden", ""));
        assert_eq!(split_file_name("trailing."), ("trailing.", ""));
    }

    #[test]
    fn sanitizes_unsafe_characters() {
        assert_eq!(sanitize_file_name("my video (1).mp4"), "my-video-1-.mp4");
        assert_eq!(sanitize_file_name("///"), "file");
        assert_eq!(sanitize_file_name("ok_name-1.mp4"), "ok_name-1.mp4");
    }

    #[test]
    fn object_name_has_nonce_and_extension() {
        let name = object_name_with_nonce("clip.mp4");
        assert!(name.starts_with("clip-"));
        assert!(name.ends_with(".mp4"));
        // stem + dash + 8 hex chars + ".mp4"
        assert_eq!(name.len(), "clip-".len() + 8 + ".mp4".len());
    }

    #[test]
    fn nonce_is_eight_hex_chars() {
        let n = nonce();
        assert_eq!(n.len(), 8);
        assert!(n.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
