use std::sync::OnceLock;

use regex::Regex;
use url::Url;

/// Watch, short-link, shorts, embed and live forms of YouTube URLs, with or
/// without scheme and `www.`/`m.`/`music.` prefixes.
fn video_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:https?://)?(?:(?:www|m|music)\.)?(?:youtube\.com/(?:watch\?(?:[^#\s]*&)?v=|shorts/|embed/|live/)|youtu\.be/)[A-Za-z0-9_-]+(?:[?&#/][^\s]*)?$",
        )
        .expect("video url regex")
    })
}

/// Returns `true` if the input looks like a single video URL we can hand to
/// the downloader.
pub fn is_supported_video_url(input: &str) -> bool {
    let t = input.trim();
    !t.is_empty() && video_url_re().is_match(t)
}

/// Canonical form passed to the downloader: scheme added when missing,
/// fragment stripped. Returns `None` for anything that is not a supported
/// video URL.
pub fn normalize_video_url(input: &str) -> Option<String> {
    let t = input.trim();
    if !is_supported_video_url(t) {
        return None;
    }

    let with_scheme = if t.contains("://") {
        t.to_string()
    } else {
        format!("https://{t}")
    };

    let mut url = Url::parse(&with_scheme).ok()?;
    match url.scheme() {
        "http" | "https" => {}
        _ => return None,
    }
    url.set_fragment(None);
    Some(url.to_string())
}

/// First http(s) URL found in pasted text, with trailing prose punctuation
/// removed.
pub fn first_url(text: &str) -> Option<&str> {
    text.split_whitespace()
        .map(trim_trailing_punct)
        .find(|w| {
            let lower = w.to_ascii_lowercase();
            lower.starts_with("http://")
                || lower.starts_with("https://")
                || is_supported_video_url(w)
        })
}

fn trim_trailing_punct(s: &str) -> &str {
    s.trim_start_matches(['(', '[', '<', '"', '\''])
        .trim_end_matches([')', ']', '}', '>', ',', '.', ';', '!', '"', '\''])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_canonical_forms() {
        for u in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtube.com/watch?v=dQw4w9WgXcQ",
            "www.youtube.com/watch?v=dQw4w9WgXcQ",
            "youtube.com/watch?v=dQw4w9WgXcQ",
            "http://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42s",
            "https://www.youtube.com/watch?feature=share&v=dQw4w9WgXcQ",
            "https://youtu.be/abc123",
            "youtu.be/abc123",
            "https://www.youtu.be/abc123?si=xyz",
            "https://m.youtube.com/watch?v=abc",
            "https://music.youtube.com/watch?v=abc",
            "https://www.youtube.com/shorts/abc_DEF-1",
            "HTTPS://WWW.YOUTUBE.COM/watch?v=abc",
        ] {
            assert!(is_supported_video_url(u), "should accept {u}");
        }
    }

    #[test]
    fn rejects_other_strings() {
        for u in [
            "",
            "   ",
            "hello world",
            "https://example.com/watch?v=abc",
            "https://vimeo.com/12345",
            "https://www.youtube.com/",
            "https://www.youtube.com/watch?list=PL123",
            "https://youtu.be/",
            "ftp://youtu.be/abc",
            "https://notyoutube.com/watch?v=abc",
            "https://youtu.be/abc def",
        ] {
            assert!(!is_supported_video_url(u), "should reject {u:?}");
        }
    }

    #[test]
    fn normalizes_missing_scheme_and_fragment() {
        assert_eq!(
            normalize_video_url("youtu.be/abc123").as_deref(),
            Some("https://youtu.be/abc123")
        );
        assert_eq!(
            normalize_video_url("https://www.youtube.com/watch?v=abc#t=10").as_deref(),
            Some("https://www.youtube.com/watch?v=abc")
        );
        assert_eq!(normalize_video_url("https://example.com/x"), None);
    }

    #[test]
    fn finds_first_url_in_prose() {
        assert_eq!(
            first_url("look at this (https://youtu.be/abc123), nice"),
            Some("https://youtu.be/abc123")
        );
        assert_eq!(
            first_url("link: youtube.com/watch?v=xyz."),
            Some("youtube.com/watch?v=xyz")
        );
        assert_eq!(first_url("nothing here"), None);
    }
}
