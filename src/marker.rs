//! Provenance markers and placeholder fragments.
//!
//! Every chapter fragment written to an archive carries a leading
//! `<!-- novelsync:chapter ... -->` comment and `data-nsync-*` attributes so a
//! later run can tell, without re-fetching, which chapter a fragment belongs to
//! and whether it holds real content.

use std::collections::HashMap;

use crate::formats::{ChapterStatus, TocChapter};

const IDX_ATTR: &str = "data-nsync-idx";
const CHAPTER_ATTR: &str = "data-nsync-chapter";
const STATUS_ATTR: &str = "data-nsync-status";
const COMMENT_PREFIX: &str = "<!-- novelsync:chapter";

const BLOCK_TAGS: &[&str] = &[
    "p",
    "div",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "blockquote",
    "pre",
    "ul",
    "ol",
    "table",
    "figure",
    "section",
];

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Tags each top-level block with its zero-based block index and the owning
/// chapter id. Blocks that already carry an index are left untouched.
pub fn add_provenance_markers(html: &str, chapter_id: &str) -> String {
    let mut out = String::with_capacity(html.len() + 64);
    let mut cursor = 0;
    let mut block_idx = 0_usize;

    for tag in scan_top_level(html) {
        let TopLevel::BlockOpen { start, end } = tag else {
            continue;
        };
        let idx = block_idx;
        block_idx += 1;

        let raw = &html[start..end];
        if attr_value_range(raw, IDX_ATTR).is_some() {
            continue;
        }

        let insert_at = start + tag_attr_insert_offset(raw);
        out.push_str(&html[cursor..insert_at]);
        out.push_str(&format!(
            " {IDX_ATTR}=\"{idx}\" {CHAPTER_ATTR}=\"{}\"",
            attr_escape(chapter_id)
        ));
        cursor = insert_at;
    }

    out.push_str(&html[cursor..]);
    out
}

/// Recovers the chapter id from a previously rendered fragment.
pub fn extract_chapter_id(html: &str) -> Option<String> {
    if let Some(comment) = marker_comment(html)
        && let Some(id) = attr_value(comment, "id")
    {
        return Some(id);
    }
    attr_value(html, CHAPTER_ATTR)
}

/// Classifies a previously rendered fragment. Failed and locked placeholders
/// both count as [`ChapterStatus::Failed`]; anything else is content.
pub fn extract_status(html: &str) -> ChapterStatus {
    let status = marker_comment(html)
        .and_then(|comment| attr_value(comment, "status"))
        .or_else(|| attr_value(html, STATUS_ATTR));
    match status.as_deref() {
        Some("failed") | Some("locked") => ChapterStatus::Failed,
        _ => ChapterStatus::Downloaded,
    }
}

pub fn wrap_chapter_content(chapter: &TocChapter, body_html: &str) -> String {
    let mut out = open_fragment(chapter, "downloaded", None);
    out.push_str(body_html.trim());
    out.push_str("\n</section>\n");
    out
}

pub fn failed_placeholder(chapter: &TocChapter, reason: Option<&str>) -> String {
    let mut out = open_fragment(chapter, "failed", reason);
    out.push_str("<p class=\"nsync-placeholder\">This chapter could not be downloaded.</p>\n");
    if let Some(reason) = reason {
        out.push_str(&format!(
            "<p class=\"nsync-reason\">{}</p>\n",
            text_escape(reason)
        ));
    }
    out.push_str("</section>\n");
    out
}

pub fn locked_placeholder(chapter: &TocChapter) -> String {
    let mut out = open_fragment(chapter, "locked", None);
    out.push_str(
        "<p class=\"nsync-placeholder\">This chapter is locked and was not downloaded.</p>\n",
    );
    out.push_str("</section>\n");
    out
}

fn open_fragment(chapter: &TocChapter, status: &str, reason: Option<&str>) -> String {
    let id = attr_escape(&chapter.id);
    let seq = chapter.sequence;
    let mut out = format!(
        "{COMMENT_PREFIX} id=\"{}\" seq=\"{seq}\" status=\"{status}\" -->\n",
        comment_escape(&chapter.id)
    );
    out.push_str(&format!(
        "<section class=\"chapter\" id=\"chapter-{seq}\" {CHAPTER_ATTR}=\"{id}\" data-nsync-seq=\"{seq}\" {STATUS_ATTR}=\"{status}\""
    ));
    if let Some(reason) = reason {
        out.push_str(&format!(" data-nsync-reason=\"{}\"", attr_escape(reason)));
    }
    out.push_str(">\n");
    out.push_str(&format!(
        "<h2 class=\"chapter-title\">{}</h2>\n",
        text_escape(&chapter.title)
    ));
    out
}

/// Lists `<img src>` values in document order, entity-decoded.
pub fn collect_image_sources(html: &str) -> Vec<String> {
    scan_tags(html)
        .into_iter()
        .filter(|tag| matches!(&tag.kind, TagKind::Open { name, .. } if name == "img"))
        .filter_map(|tag| attr_value(&html[tag.start..tag.end], "src"))
        .filter(|src| !src.trim().is_empty())
        .collect()
}

/// Replaces `<img src>` values found in `replacements` (keyed by decoded URL).
pub fn rewrite_image_sources(html: &str, replacements: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;

    for tag in scan_tags(html) {
        if !matches!(&tag.kind, TagKind::Open { name, .. } if name == "img") {
            continue;
        }
        let raw = &html[tag.start..tag.end];
        let Some((value_start, value_end)) = attr_value_range(raw, "src") else {
            continue;
        };
        let current = attr_unescape(&raw[value_start..value_end]);
        let Some(replacement) = replacements.get(&current) else {
            continue;
        };
        out.push_str(&html[cursor..tag.start + value_start]);
        out.push_str(&attr_escape(replacement));
        cursor = tag.start + value_end;
    }

    out.push_str(&html[cursor..]);
    out
}

/// Inserts image figures after the top-level block at each offset hint.
/// Offsets past the last block append at the end.
pub fn anchor_images(html: &str, images: &[(usize, String)]) -> String {
    if images.is_empty() {
        return html.to_string();
    }

    let block_ends = scan_top_level(html)
        .into_iter()
        .filter_map(|tag| match tag {
            TopLevel::BlockClose { end } => Some(end),
            TopLevel::BlockOpen { .. } => None,
        })
        .collect::<Vec<_>>();

    let mut sorted = images.iter().collect::<Vec<_>>();
    sorted.sort_by_key(|(offset, _)| *offset);

    let mut out = String::with_capacity(html.len() + images.len() * 64);
    let mut cursor = 0;
    for (offset, src) in sorted {
        let position = match offset.checked_sub(1) {
            None => 0,
            Some(block) => block_ends.get(block).copied().unwrap_or(html.len()),
        };
        let position = position.max(cursor);
        out.push_str(&html[cursor..position]);
        out.push_str(&format!(
            "\n<figure class=\"nsync-image\"><img src=\"{}\" alt=\"\" /></figure>\n",
            attr_escape(src)
        ));
        cursor = position;
    }
    out.push_str(&html[cursor..]);
    out
}

fn marker_comment(html: &str) -> Option<&str> {
    let start = html.find(COMMENT_PREFIX)?;
    let rest = &html[start..];
    let end = rest.find("-->")?;
    Some(&rest[..end])
}

#[derive(Debug)]
enum TagKind {
    Open { name: String, self_closing: bool },
    Close { name: String },
    Other,
}

#[derive(Debug)]
struct RawTag {
    start: usize,
    end: usize,
    kind: TagKind,
}

#[derive(Debug)]
enum TopLevel {
    BlockOpen { start: usize, end: usize },
    BlockClose { end: usize },
}

fn scan_top_level(html: &str) -> Vec<TopLevel> {
    let mut out = Vec::new();
    let mut depth = 0_usize;
    let mut top_is_block = false;

    for tag in scan_tags(html) {
        match tag.kind {
            TagKind::Open { name, self_closing } => {
                let is_void = self_closing || VOID_TAGS.contains(&name.as_str());
                let is_block = BLOCK_TAGS.contains(&name.as_str());
                if depth == 0 && is_block {
                    out.push(TopLevel::BlockOpen {
                        start: tag.start,
                        end: tag.end,
                    });
                    if is_void {
                        out.push(TopLevel::BlockClose { end: tag.end });
                    }
                }
                if !is_void {
                    if depth == 0 {
                        top_is_block = is_block;
                    }
                    depth += 1;
                }
            }
            TagKind::Close { name } => {
                if VOID_TAGS.contains(&name.as_str()) || depth == 0 {
                    continue;
                }
                depth -= 1;
                if depth == 0 && top_is_block {
                    out.push(TopLevel::BlockClose { end: tag.end });
                    top_is_block = false;
                }
            }
            TagKind::Other => {}
        }
    }

    out
}

fn scan_tags(html: &str) -> Vec<RawTag> {
    let bytes = html.as_bytes();
    let mut tags = Vec::new();
    let mut cursor = 0;

    while let Some(rel_lt) = html[cursor..].find('<') {
        let lt = cursor + rel_lt;

        if html[lt..].starts_with("<!--") {
            let end = html[lt..]
                .find("-->")
                .map(|rel| lt + rel + 3)
                .unwrap_or(html.len());
            tags.push(RawTag {
                start: lt,
                end,
                kind: TagKind::Other,
            });
            cursor = end;
            continue;
        }

        let mut in_quote: Option<u8> = None;
        let mut gt = lt + 1;
        while gt < bytes.len() {
            let b = bytes[gt];
            if let Some(q) = in_quote {
                if b == q {
                    in_quote = None;
                }
            } else if b == b'"' || b == b'\'' {
                in_quote = Some(b);
            } else if b == b'>' {
                break;
            }
            gt += 1;
        }
        if gt >= bytes.len() {
            break;
        }

        let end = gt + 1;
        let raw = &html[lt..end];
        let kind = classify_tag(raw);
        tags.push(RawTag {
            start: lt,
            end,
            kind,
        });
        cursor = end;
    }

    tags
}

fn classify_tag(raw: &str) -> TagKind {
    let inner = &raw[1..raw.len() - 1];
    if let Some(rest) = inner.strip_prefix('/') {
        let name = tag_name(rest);
        if name.is_empty() {
            return TagKind::Other;
        }
        return TagKind::Close { name };
    }
    if inner.starts_with('!') || inner.starts_with('?') {
        return TagKind::Other;
    }
    let name = tag_name(inner);
    if name.is_empty() {
        return TagKind::Other;
    }
    TagKind::Open {
        name,
        self_closing: inner.trim_end().ends_with('/'),
    }
}

fn tag_name(input: &str) -> String {
    input
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Byte offset inside `raw` (an opening tag) where new attributes belong.
fn tag_attr_insert_offset(raw: &str) -> usize {
    let without_gt = &raw[..raw.len() - 1];
    let trimmed = without_gt.trim_end();
    match trimmed.strip_suffix('/') {
        Some(before_slash) => before_slash.trim_end().len(),
        None => trimmed.len(),
    }
}

/// Byte range of the value of attribute `name` inside `text`.
fn attr_value_range(text: &str, name: &str) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let lower = text.to_ascii_lowercase();
    let needle = format!("{}=", name.to_ascii_lowercase());
    let mut from = 0;

    while let Some(rel) = lower[from..].find(&needle) {
        let at = from + rel;
        from = at + needle.len();
        let preceded_by_space = at > 0 && bytes[at - 1].is_ascii_whitespace();
        if !preceded_by_space {
            continue;
        }
        let value_start = at + needle.len();
        let Some(&quote) = bytes.get(value_start) else {
            return None;
        };
        if quote != b'"' && quote != b'\'' {
            continue;
        }
        let close = text[value_start + 1..].find(quote as char)?;
        return Some((value_start + 1, value_start + 1 + close));
    }
    None
}

fn attr_value(text: &str, name: &str) -> Option<String> {
    attr_value_range(text, name).map(|(start, end)| attr_unescape(&text[start..end]))
}

pub(crate) fn text_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub(crate) fn attr_escape(input: &str) -> String {
    text_escape(input)
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn comment_escape(input: &str) -> String {
    attr_escape(input).replace('-', "&#45;")
}

fn attr_unescape(input: &str) -> String {
    input
        .replace("&#45;", "-")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::ChapterAccess;

    fn chapter(id: &str, seq: u32) -> TocChapter {
        TocChapter {
            id: id.to_owned(),
            title: format!("Chapter {seq} <draft>"),
            sequence: seq,
            volume_name: None,
            access: ChapterAccess::Open,
        }
    }

    #[test]
    fn markers_index_top_level_blocks_only() {
        let html = "<p>one</p><div><p>nested</p></div><span>inline</span><h2 class=\"t\">two</h2>";
        let out = add_provenance_markers(html, "c9");
        assert_eq!(
            out,
            "<p data-nsync-idx=\"0\" data-nsync-chapter=\"c9\">one</p>\
             <div data-nsync-idx=\"1\" data-nsync-chapter=\"c9\"><p>nested</p></div>\
             <span>inline</span>\
             <h2 class=\"t\" data-nsync-idx=\"2\" data-nsync-chapter=\"c9\">two</h2>"
        );
    }

    #[test]
    fn markers_are_idempotent() {
        let html = "<p>a</p>\n<p style=\"x\">b</p>\n<blockquote><p>c</p></blockquote>";
        let once = add_provenance_markers(html, "c1");
        let twice = add_provenance_markers(&once, "c1");
        assert_eq!(once, twice);
        assert_eq!(twice.matches("data-nsync-idx=\"1\"").count(), 1);
    }

    #[test]
    fn markers_keep_existing_marks_and_fill_gaps() {
        let html = "<p data-nsync-idx=\"0\" data-nsync-chapter=\"old\">a</p><p>b</p>";
        let out = add_provenance_markers(html, "new");
        assert!(out.starts_with("<p data-nsync-idx=\"0\" data-nsync-chapter=\"old\">a</p>"));
        assert!(out.ends_with("<p data-nsync-idx=\"1\" data-nsync-chapter=\"new\">b</p>"));
    }

    #[test]
    fn markers_survive_attributes_with_angle_brackets_and_comments() {
        let html = "<!-- <p>ignored</p> --><p title=\"a > b\">x</p><hr/>";
        let out = add_provenance_markers(html, "c1");
        assert_eq!(
            out,
            "<!-- <p>ignored</p> --><p title=\"a > b\" data-nsync-idx=\"0\" data-nsync-chapter=\"c1\">x</p><hr/>"
        );
    }

    #[test]
    fn wrapped_fragment_round_trips_provenance() {
        let ch = chapter("abc-123", 7);
        let fragment = wrap_chapter_content(&ch, "<p>body</p>");
        assert!(fragment.starts_with("<!-- novelsync:chapter"));
        assert!(!fragment.contains("<html"));
        assert!(fragment.contains("Chapter 7 &lt;draft&gt;"));
        assert_eq!(extract_chapter_id(&fragment).as_deref(), Some("abc-123"));
        assert_eq!(extract_status(&fragment), ChapterStatus::Downloaded);
    }

    #[test]
    fn placeholders_are_classified_as_failed() {
        let ch = chapter("c2", 2);
        let failed = failed_placeholder(&ch, Some("timeout \"x\""));
        assert_eq!(extract_status(&failed), ChapterStatus::Failed);
        assert_eq!(extract_chapter_id(&failed).as_deref(), Some("c2"));
        assert!(failed.contains("data-nsync-reason=\"timeout &quot;x&quot;\""));

        let locked = locked_placeholder(&ch);
        assert_eq!(extract_status(&locked), ChapterStatus::Failed);
        assert!(locked.contains("status=\"locked\""));
    }

    #[test]
    fn chapter_id_falls_back_to_block_attribute() {
        let html = add_provenance_markers("<p>a</p>", "c5");
        assert_eq!(extract_chapter_id(&html).as_deref(), Some("c5"));
        assert_eq!(extract_chapter_id("<p>plain</p>"), None);
        assert_eq!(extract_status("<p>plain</p>"), ChapterStatus::Downloaded);
    }

    #[test]
    fn image_sources_are_collected_and_rewritten() {
        let html = "<p><img src=\"https://x.test/a.png?w=1&amp;h=2\"></p><img alt='b' src='/b.jpg' />";
        let sources = collect_image_sources(html);
        assert_eq!(sources, vec!["https://x.test/a.png?w=1&h=2", "/b.jpg"]);

        let mut map = HashMap::new();
        map.insert(sources[0].clone(), "images/img_1.png".to_owned());
        let out = rewrite_image_sources(html, &map);
        assert_eq!(
            out,
            "<p><img src=\"images/img_1.png\"></p><img alt='b' src='/b.jpg' />"
        );
    }

    #[test]
    fn anchored_images_follow_offset_hints() {
        let html = "<p>a</p><p>b</p>";
        let out = anchor_images(
            html,
            &[(1, "images/x.png".to_owned()), (0, "images/y.png".to_owned()), (9, "images/z.png".to_owned())],
        );
        let y = out.find("images/y.png").unwrap_or(usize::MAX);
        let a = out.find(">a<").unwrap_or(usize::MAX);
        let x = out.find("images/x.png").unwrap_or(usize::MAX);
        let b = out.find(">b<").unwrap_or(usize::MAX);
        let z = out.find("images/z.png").unwrap_or(usize::MAX);
        assert!(y < a && a < x && x < b && b < z, "{out}");
    }
}
