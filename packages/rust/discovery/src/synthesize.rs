//! Deterministic URL-to-regex generalization.
//!
//! One concrete content URL in, one candidate pattern out. The substitution
//! steps run in a fixed order because later steps assume earlier placeholders
//! are already in place: a long numeric id must be generalized before the slug
//! pass, or it would be absorbed into the generic no-slash class.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use url::Url;

/// Maximum slug-substitution passes. Each pass can only rewrite segments the
/// previous pass could not reach, so a fixpoint arrives quickly; the bound
/// guarantees termination on adversarial input.
const MAX_SLUG_PASSES: usize = 10;

fn re_timestamp() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{14}").expect("timestamp regex"))
}

fn re_date_ymd() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{4}-\d{2}-\d{2}").expect("ymd regex"))
}

fn re_date_dmy() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{2}-\d{2}-\d{4}").expect("dmy regex"))
}

fn re_date_slash() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{4}/\d{2}/\d{2}").expect("slash date regex"))
}

fn re_trailing_id() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{7,}(/?)$").expect("trailing id regex"))
}

fn re_slug_segment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // A path segment containing a hyphen or underscore and none of the
    // backslash-bearing placeholders inserted by earlier steps.
    RE.get_or_init(|| Regex::new(r"/([^/\\]*[-_][^/\\]*)(/|$)").expect("slug regex"))
}

/// Generalize one concrete URL into a candidate regex pattern.
///
/// Returns `None` for input that is not an absolute http(s) URL, or whose
/// finished pattern would not match the URL it came from. Never returns a
/// partially-substituted pattern: every emitted pattern matches its own
/// source URL (case-insensitively).
pub fn synthesize(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    parsed.host_str()?;

    let mut text = url.to_string();

    // 1. 14-digit runs are publish timestamps.
    text = re_timestamp().replace_all(&text, r"\d{14}").into_owned();

    // 2. Date-shaped substrings in either order, hyphen or slash separated.
    text = re_date_ymd()
        .replace_all(&text, r"\d{4}-\d{2}-\d{2}")
        .into_owned();
    text = re_date_dmy()
        .replace_all(&text, r"\d{2}-\d{2}-\d{4}")
        .into_owned();
    text = re_date_slash()
        .replace_all(&text, r"\d{4}/\d{2}/\d{2}")
        .into_owned();

    // 3. Trailing numeric identifier. Must precede the slug pass.
    text = re_trailing_id().replace(&text, r"\d+$1").into_owned();

    // 4. Slug segments in the path, to a fixpoint.
    text = generalize_slugs(&text);

    // 5. Escape the metacharacters that must stay literal.
    text = text
        .replace('.', r"\.")
        .replace('?', r"\?")
        .replace('(', r"\(")
        .replace(')', r"\)");

    // 6. Optional protocol and optional trailing slash.
    let rest = text
        .strip_prefix("https://")
        .or_else(|| text.strip_prefix("http://"))?;
    let mut pattern = format!("https?://{rest}");
    if pattern.ends_with('/') {
        pattern.pop();
    }
    pattern.push_str("/?");

    // 7. Anchor to the full string.
    let pattern = format!("^{pattern}$");

    // Literal characters outside the escape set can still carry regex
    // meaning (`+`, `*`, `[`). A pattern that fails to compile or to match
    // its own source URL is discarded rather than emitted.
    let compiled = RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .ok()?;
    if !compiled.is_match(url) {
        return None;
    }
    Some(pattern)
}

/// Replace hyphenated/underscored path segments with `[^/]+`, repeating until
/// a pass changes nothing. Only the path is rewritten; the host stays literal.
fn generalize_slugs(text: &str) -> String {
    let path_start = match text.find("://").and_then(|i| text[i + 3..].find('/')) {
        Some(offset) => text.find("://").unwrap_or(0) + 3 + offset,
        None => return text.to_string(),
    };

    let (prefix, mut path) = (text[..path_start].to_string(), text[path_start..].to_string());

    for _ in 0..MAX_SLUG_PASSES {
        let next = re_slug_segment()
            .replace_all(&path, "/[^/]+$2")
            .into_owned();
        if next == path {
            break;
        }
        path = next;
    }

    format!("{prefix}{path}")
}
