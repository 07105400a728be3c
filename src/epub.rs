use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read as _, Write as _};
use std::path::Path;

use anyhow::Context as _;
use chrono::Utc;
use zip::write::SimpleFileOptions;

use crate::archive::{
    ArchiveBuilder, ArchiveFragment, ArchiveHandle, ArchiveImage, ArchiveMetadata,
    ArchiveProvenance, ArchiveReader, BuildOptions,
};
use crate::formats::ChapterStatus;
use crate::marker;

const IDENTIFIER_PREFIX: &str = "novelsync:";
const CONTENT_OPF: &str = "OEBPS/content.opf";
const CHAPTER_PREFIX: &str = "OEBPS/chapter-";
const IMAGES_DIR: &str = "images";

/// Writes EPUB 3 archives from pre-rendered chapter fragments.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpubBuilder;

impl ArchiveBuilder for EpubBuilder {
    fn file_extension(&self) -> &'static str {
        "epub"
    }

    fn build(
        &self,
        metadata: &ArchiveMetadata,
        fragments: &[ArchiveFragment],
        images: &[ArchiveImage],
        out_path: &Path,
        options: &BuildOptions,
    ) -> anyhow::Result<()> {
        if fragments.is_empty() {
            anyhow::bail!("no chapters to write for {}", metadata.book.work_id);
        }
        if out_path.exists() && !options.overwrite {
            anyhow::bail!("epub output already exists: {}", out_path.display());
        }
        if let Some(parent) = out_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create epub parent dir: {}", parent.display()))?;
        }

        // Build next to the target and rename so a reader of the previous
        // archive never observes a half-written file.
        let tmp_path = out_path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let result = write_epub(metadata, fragments, images, &tmp_path);
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        fs::rename(&tmp_path, out_path).with_context(|| {
            format!(
                "rename epub into place: {} -> {}",
                tmp_path.display(),
                out_path.display()
            )
        })?;
        Ok(())
    }
}

fn write_epub(
    metadata: &ArchiveMetadata,
    fragments: &[ArchiveFragment],
    images: &[ArchiveImage],
    out_path: &Path,
) -> anyhow::Result<()> {
    let lang = metadata.language.trim();
    let lang = if lang.is_empty() { "und" } else { lang };
    let title = metadata.book.title.trim();
    let title = if title.is_empty() { "Book" } else { title };

    let chapters = fragments
        .iter()
        .enumerate()
        .map(|(idx, fragment)| ChapterEntry {
            stem: format!("chapter-{:04}", idx + 1),
            fragment,
        })
        .collect::<Vec<_>>();

    let modified = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let container_xml = render_container_xml();
    let css = default_style_css();
    let nav_xhtml = render_nav_xhtml(title, lang, &chapters);
    let toc_ncx = render_toc_ncx(title, &metadata.book.work_id, &chapters);
    let content_opf = render_content_opf(metadata, title, lang, &modified, &chapters, images);

    let out_file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(out_path)
        .with_context(|| format!("open epub output: {}", out_path.display()))?;

    let mut zip = zip::ZipWriter::new(out_file);

    // `mimetype` must be the first entry and stored uncompressed.
    let mimetype_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    zip.start_file("mimetype", mimetype_options)
        .context("epub start_file mimetype")?;
    zip.write_all(b"application/epub+zip")
        .context("epub write mimetype")?;

    let deflated_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let fixed = [
        ("META-INF/container.xml", container_xml.as_str()),
        (CONTENT_OPF, content_opf.as_str()),
        ("OEBPS/nav.xhtml", nav_xhtml.as_str()),
        ("OEBPS/toc.ncx", toc_ncx.as_str()),
        ("OEBPS/style.css", css.as_str()),
    ];
    for (name, body) in fixed {
        zip.start_file(name, deflated_options)
            .with_context(|| format!("epub start_file {name}"))?;
        zip.write_all(body.as_bytes())
            .with_context(|| format!("epub write {name}"))?;
    }

    for chapter in &chapters {
        let html = ensure_xhtml_void_tags(&chapter.fragment.html);
        let xhtml = wrap_xhtml_document(&chapter.fragment.title, lang, &html);

        zip.start_file(format!("OEBPS/{}.xhtml", chapter.stem), deflated_options)
            .with_context(|| format!("epub start_file chapter: {}", chapter.fragment.chapter_id))?;
        zip.write_all(xhtml.as_bytes())
            .with_context(|| format!("epub write chapter: {}", chapter.fragment.chapter_id))?;
    }

    for image in images {
        zip.start_file(
            format!("OEBPS/{IMAGES_DIR}/{}", image.file_name),
            deflated_options,
        )
        .with_context(|| format!("epub start_file image: {}", image.file_name))?;
        zip.write_all(&image.bytes)
            .with_context(|| format!("epub write image: {}", image.file_name))?;
    }

    zip.finish().context("epub finish zip")?;
    Ok(())
}

struct ChapterEntry<'a> {
    stem: String,
    fragment: &'a ArchiveFragment,
}

fn render_container_xml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#
    .to_string()
}

fn default_style_css() -> String {
    r#"@charset "utf-8";

html { font-family: serif; }
body { margin: 0; padding: 0 1.2em; line-height: 1.8; }
img { max-width: 100%; height: auto; }
h2.chapter-title { margin: 1.5em 0 1em; text-align: center; }
figure.nsync-image { margin: 1em 0; text-align: center; }
p.nsync-placeholder { color: #777; font-style: italic; text-align: center; }
p.nsync-reason { color: #999; font-size: 0.8em; text-align: center; }
"#
    .to_string()
}

fn render_nav_xhtml(title: &str, lang: &str, chapters: &[ChapterEntry<'_>]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"{}\" xml:lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(&format!("  <h1>{}</h1>\n", xml_escape(title)));
    out.push_str("  <nav epub:type=\"toc\" id=\"toc\">\n");
    out.push_str("    <ol>\n");

    // Chapters sharing a volume are nested under a single volume entry.
    let mut open_volume: Option<&str> = None;
    for ch in chapters {
        let volume = ch.fragment.volume_name.as_deref();
        if volume != open_volume {
            if open_volume.is_some() {
                out.push_str("        </ol>\n      </li>\n");
            }
            if let Some(name) = volume {
                out.push_str(&format!(
                    "      <li><span>{}</span>\n        <ol>\n",
                    xml_escape(name)
                ));
            }
            open_volume = volume;
        }
        let indent = if open_volume.is_some() { "          " } else { "      " };
        out.push_str(&format!(
            "{indent}<li><a href=\"{}.xhtml\">{}</a></li>\n",
            xml_escape(&ch.stem),
            xml_escape(&ch.fragment.title)
        ));
    }
    if open_volume.is_some() {
        out.push_str("        </ol>\n      </li>\n");
    }

    out.push_str("    </ol>\n");
    out.push_str("  </nav>\n");
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

fn render_toc_ncx(title: &str, work_id: &str, chapters: &[ChapterEntry<'_>]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(
        "<!DOCTYPE ncx PUBLIC \"-//NISO//DTD ncx 2005-1//EN\" \"http://www.daisy.org/z3986/2005/ncx-2005-1.dtd\">\n",
    );
    out.push_str("<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n");
    out.push_str("  <head>\n");
    out.push_str(&format!(
        "    <meta name=\"dtb:uid\" content=\"{IDENTIFIER_PREFIX}{}\" />\n",
        xml_escape(work_id)
    ));
    out.push_str("    <meta name=\"dtb:depth\" content=\"1\" />\n");
    out.push_str("    <meta name=\"dtb:totalPageCount\" content=\"0\" />\n");
    out.push_str("    <meta name=\"dtb:maxPageNumber\" content=\"0\" />\n");
    out.push_str("  </head>\n");
    out.push_str("  <docTitle><text>");
    out.push_str(&xml_escape(title));
    out.push_str("</text></docTitle>\n");
    out.push_str("  <navMap>\n");
    for (idx, ch) in chapters.iter().enumerate() {
        let play = idx + 1;
        out.push_str(&format!(
            "    <navPoint id=\"navPoint-{play}\" playOrder=\"{play}\">\n"
        ));
        out.push_str("      <navLabel><text>");
        out.push_str(&xml_escape(&ch.fragment.title));
        out.push_str("</text></navLabel>\n");
        out.push_str(&format!(
            "      <content src=\"{}.xhtml\" />\n",
            xml_escape(&ch.stem)
        ));
        out.push_str("    </navPoint>\n");
    }
    out.push_str("  </navMap>\n");
    out.push_str("</ncx>\n");
    out
}

fn render_content_opf(
    metadata: &ArchiveMetadata,
    title: &str,
    lang: &str,
    modified: &str,
    chapters: &[ChapterEntry<'_>],
    images: &[ArchiveImage],
) -> String {
    let book = &metadata.book;
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(&format!(
        "<package xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"bookid\" version=\"3.0\" xml:lang=\"{}\">\n",
        xml_escape(lang)
    ));
    out.push_str("  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n");
    out.push_str(&format!(
        "    <dc:identifier id=\"bookid\">{IDENTIFIER_PREFIX}{}</dc:identifier>\n",
        xml_escape(&book.work_id)
    ));
    out.push_str(&format!("    <dc:title>{}</dc:title>\n", xml_escape(title)));
    if let Some(author) = book.author.as_deref().filter(|a| !a.trim().is_empty()) {
        out.push_str(&format!(
            "    <dc:creator>{}</dc:creator>\n",
            xml_escape(author.trim())
        ));
    }
    if let Some(description) = book.description.as_deref().filter(|d| !d.trim().is_empty()) {
        out.push_str(&format!(
            "    <dc:description>{}</dc:description>\n",
            xml_escape(description.trim())
        ));
    }
    for tag in &book.tags {
        out.push_str(&format!("    <dc:subject>{}</dc:subject>\n", xml_escape(tag)));
    }
    out.push_str(&format!(
        "    <dc:language>{}</dc:language>\n",
        xml_escape(lang)
    ));
    out.push_str(&format!(
        "    <meta property=\"dcterms:modified\">{}</meta>\n",
        xml_escape(modified)
    ));
    if let Some((idx, _)) = images.iter().enumerate().find(|(_, img)| img.is_cover) {
        out.push_str(&format!(
            "    <meta name=\"cover\" content=\"image-{}\" />\n",
            idx + 1
        ));
    }
    out.push_str("  </metadata>\n");
    out.push_str("  <manifest>\n");
    out.push_str(
        "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\" />\n",
    );
    out.push_str(
        "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\" />\n",
    );
    out.push_str("    <item id=\"css\" href=\"style.css\" media-type=\"text/css\" />\n");

    for ch in chapters {
        out.push_str(&format!(
            "    <item id=\"{}\" href=\"{}.xhtml\" media-type=\"application/xhtml+xml\" />\n",
            xml_escape(&ch.stem),
            xml_escape(&ch.stem)
        ));
    }

    for (idx, image) in images.iter().enumerate() {
        let properties = if image.is_cover {
            " properties=\"cover-image\""
        } else {
            ""
        };
        out.push_str(&format!(
            "    <item id=\"image-{}\" href=\"{IMAGES_DIR}/{}\" media-type=\"{}\"{properties} />\n",
            idx + 1,
            xml_escape(&image.file_name),
            xml_escape(&image.media_type)
        ));
    }

    out.push_str("  </manifest>\n");
    out.push_str("  <spine toc=\"ncx\">\n");
    for ch in chapters {
        out.push_str(&format!(
            "    <itemref idref=\"{}\" />\n",
            xml_escape(&ch.stem)
        ));
    }
    out.push_str("  </spine>\n");
    out.push_str("</package>\n");
    out
}

pub fn media_type_for_path(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "avif" => "image/avif",
        _ => "application/octet-stream",
    }
}

/// Guesses an image extension from magic bytes.
pub fn sniff_image_extension(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        return Some("png");
    }
    if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        return Some("jpg");
    }
    if bytes.starts_with(b"GIF8") {
        return Some("gif");
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("webp");
    }
    if bytes.len() >= 12 && &bytes[4..12] == b"ftypavif" {
        return Some("avif");
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(256)]);
    if head.contains("<svg") {
        return Some("svg");
    }
    None
}

fn wrap_xhtml_document(title: &str, lang: &str, body_html: &str) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"{}\" xml:lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(body_html);
    if !body_html.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

/// Returns the markup between `<body>` and `</body>`.
fn body_fragment(xhtml: &str) -> Option<&str> {
    let open = xhtml.find("<body")?;
    let start = open + xhtml[open..].find('>')? + 1;
    let end = xhtml.rfind("</body>")?;
    if end < start {
        return None;
    }
    Some(xhtml[start..end].trim_start_matches('\n'))
}

fn ensure_xhtml_void_tags(html: &str) -> String {
    // Convert void tags like `<img ...>` into `<img ... />` to keep EPUB XHTML well-formed.
    const VOID_TAGS: &[&str] = &[
        "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
        "source", "track", "wbr",
    ];

    let bytes = html.as_bytes();
    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;

    while let Some(rel_lt) = html[cursor..].find('<') {
        let lt = cursor + rel_lt;
        out.push_str(&html[cursor..lt]);

        let mut in_quote: Option<u8> = None;
        let mut gt = lt + 1;
        while gt < bytes.len() {
            let b = bytes[gt];
            if let Some(q) = in_quote {
                if b == q {
                    in_quote = None;
                }
                gt += 1;
                continue;
            }
            if b == b'"' || b == b'\'' {
                in_quote = Some(b);
                gt += 1;
                continue;
            }
            if b == b'>' {
                break;
            }
            gt += 1;
        }
        if gt >= bytes.len() {
            out.push_str(&html[lt..]);
            return out;
        }

        let raw_tag = &html[lt..=gt];
        if raw_tag
            .as_bytes()
            .get(1)
            .is_some_and(|b| matches!(b, b'!' | b'?' | b'/'))
        {
            out.push_str(raw_tag);
            cursor = gt + 1;
            continue;
        }

        let name_start = lt + 1;
        let mut name_end = name_start;
        while name_end < gt && (bytes[name_end] as char).is_ascii_alphanumeric() {
            name_end += 1;
        }
        let tag_name_lower = html[name_start..name_end].to_ascii_lowercase();
        if name_end == name_start || !VOID_TAGS.contains(&tag_name_lower.as_str()) {
            out.push_str(raw_tag);
            cursor = gt + 1;
            continue;
        }

        let tag_without_gt = &html[lt..gt];
        if tag_without_gt.trim_end().ends_with('/') {
            out.push_str(raw_tag);
        } else {
            out.push_str(tag_without_gt);
            out.push_str(" />");
        }
        cursor = gt + 1;
    }

    out.push_str(&html[cursor..]);
    out
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn xml_unescape(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Opens archives written by [`EpubBuilder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EpubReader;

impl ArchiveReader for EpubReader {
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn ArchiveHandle>> {
        let handle = EpubHandle::open(path)?;
        Ok(Box::new(handle))
    }
}

#[derive(Debug, Clone)]
struct IndexedChapter {
    entry_name: String,
    status: ChapterStatus,
}

pub struct EpubHandle {
    archive: zip::ZipArchive<fs::File>,
    work_id: String,
    chapters: BTreeMap<String, IndexedChapter>,
}

impl EpubHandle {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file =
            fs::File::open(path).with_context(|| format!("open epub: {}", path.display()))?;
        let mut archive = zip::ZipArchive::new(file)
            .with_context(|| format!("read epub zip: {}", path.display()))?;

        let opf = read_entry_string(&mut archive, CONTENT_OPF)?
            .ok_or_else(|| anyhow::anyhow!("epub has no {CONTENT_OPF}: {}", path.display()))?;
        let work_id = parse_work_id(&opf).unwrap_or_default();

        let mut entry_names = archive
            .file_names()
            .filter(|name| name.starts_with(CHAPTER_PREFIX) && name.ends_with(".xhtml"))
            .map(str::to_owned)
            .collect::<Vec<_>>();
        entry_names.sort();

        let mut chapters = BTreeMap::new();
        for entry_name in entry_names {
            let Some(xhtml) = read_entry_string(&mut archive, &entry_name)? else {
                continue;
            };
            let Some(body) = body_fragment(&xhtml) else {
                tracing::debug!(entry = %entry_name, "chapter document has no body");
                continue;
            };
            let Some(chapter_id) = marker::extract_chapter_id(body) else {
                tracing::debug!(entry = %entry_name, "chapter document has no provenance marker");
                continue;
            };
            let status = marker::extract_status(body);
            chapters.insert(chapter_id, IndexedChapter { entry_name, status });
        }

        Ok(Self {
            archive,
            work_id,
            chapters,
        })
    }
}

impl ArchiveHandle for EpubHandle {
    fn provenance(&mut self) -> anyhow::Result<ArchiveProvenance> {
        let mut provenance = ArchiveProvenance {
            work_id: self.work_id.clone(),
            ..ArchiveProvenance::default()
        };
        for (chapter_id, chapter) in &self.chapters {
            match chapter.status {
                ChapterStatus::Downloaded => provenance.downloaded_ids.insert(chapter_id.clone()),
                ChapterStatus::Failed => provenance.failed_ids.insert(chapter_id.clone()),
            };
        }
        Ok(provenance)
    }

    fn read_fragment(&mut self, chapter_id: &str) -> anyhow::Result<Option<String>> {
        let Some(chapter) = self.chapters.get(chapter_id) else {
            return Ok(None);
        };
        let entry_name = chapter.entry_name.clone();
        let Some(xhtml) = read_entry_string(&mut self.archive, &entry_name)? else {
            return Ok(None);
        };
        Ok(body_fragment(&xhtml).map(str::to_owned))
    }

    fn read_resource(&mut self, href: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let href = href.trim_start_matches("./");
        if href.contains("..") {
            return Ok(None);
        }
        read_entry_bytes(&mut self.archive, &format!("OEBPS/{href}"))
    }
}

fn parse_work_id(opf: &str) -> Option<String> {
    let open = opf.find("<dc:identifier")?;
    let start = open + opf[open..].find('>')? + 1;
    let end = start + opf[start..].find("</dc:identifier>")?;
    let value = xml_unescape(opf[start..end].trim());
    value.strip_prefix(IDENTIFIER_PREFIX).map(str::to_owned)
}

fn read_entry_bytes(
    archive: &mut zip::ZipArchive<fs::File>,
    name: &str,
) -> anyhow::Result<Option<Vec<u8>>> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("open epub entry: {name}")),
    };
    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .with_context(|| format!("read epub entry: {name}"))?;
    Ok(Some(bytes))
}

fn read_entry_string(
    archive: &mut zip::ZipArchive<fs::File>,
    name: &str,
) -> anyhow::Result<Option<String>> {
    read_entry_bytes(archive, name)?
        .map(|bytes| String::from_utf8(bytes).with_context(|| format!("epub entry utf-8: {name}")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{BookInfo, ChapterAccess, TocChapter};

    fn chapter(id: &str, seq: u32) -> TocChapter {
        TocChapter {
            id: id.to_string(),
            title: format!("Chapter {seq}"),
            sequence: seq,
            volume_name: None,
            access: ChapterAccess::Open,
        }
    }

    fn fragment(chapter: &TocChapter, html: String) -> ArchiveFragment {
        ArchiveFragment {
            chapter_id: chapter.id.clone(),
            title: chapter.title.clone(),
            sequence: chapter.sequence,
            volume_name: chapter.volume_name.clone(),
            html,
        }
    }

    fn metadata(work_id: &str) -> ArchiveMetadata {
        ArchiveMetadata {
            book: BookInfo {
                work_id: work_id.to_string(),
                title: "A & B".to_string(),
                author: Some("Someone".to_string()),
                ..BookInfo::default()
            },
            language: "ja".to_string(),
        }
    }

    #[test]
    fn ensure_xhtml_void_tags_preserves_utf8_text() {
        let input = "<p>日本語のテスト</p><img src=\"x.png\"><br/>";
        let out = ensure_xhtml_void_tags(input);
        assert!(out.contains("日本語のテスト"));
        assert!(out.contains("<img src=\"x.png\" />"));
        assert!(out.contains("<br/>"));
    }

    #[test]
    fn sniffs_common_image_formats() {
        assert_eq!(sniff_image_extension(b"\x89PNG\r\n\x1a\n"), Some("png"));
        assert_eq!(sniff_image_extension(&[0xff, 0xd8, 0xff, 0xe0]), Some("jpg"));
        assert_eq!(sniff_image_extension(b"GIF89a"), Some("gif"));
        assert_eq!(sniff_image_extension(b"RIFF\0\0\0\0WEBPVP8 "), Some("webp"));
        assert_eq!(sniff_image_extension(b"plain text"), None);
        assert_eq!(media_type_for_path("images/a.JPG"), "image/jpeg");
    }

    #[test]
    fn built_archive_reads_back_provenance_fragments_and_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("out").join("book.epub");

        let ch1 = chapter("c1", 1);
        let ch2 = chapter("c2", 2);
        let ch3 = chapter("c3", 3);
        let body = marker::add_provenance_markers(
            "<p>one</p><p><img src=\"images/img_1.png\"></p>",
            "c1",
        );
        let fragments = vec![
            fragment(&ch1, marker::wrap_chapter_content(&ch1, &body)),
            fragment(&ch2, marker::failed_placeholder(&ch2, Some("timeout"))),
            fragment(&ch3, marker::locked_placeholder(&ch3)),
        ];
        let images = vec![ArchiveImage {
            file_name: "img_1.png".to_string(),
            media_type: "image/png".to_string(),
            bytes: b"\x89PNG-data".to_vec(),
            is_cover: false,
        }];

        EpubBuilder.build(
            &metadata("w-1"),
            &fragments,
            &images,
            &out,
            &BuildOptions::default(),
        )?;
        assert!(out.is_file());

        let mut handle = EpubReader.open(&out)?;
        let provenance = handle.provenance()?;
        assert_eq!(provenance.work_id, "w-1");
        assert_eq!(
            provenance.downloaded_ids.into_iter().collect::<Vec<_>>(),
            vec!["c1".to_string()]
        );
        assert_eq!(
            provenance.failed_ids.into_iter().collect::<Vec<_>>(),
            vec!["c2".to_string(), "c3".to_string()]
        );

        let restored = handle.read_fragment("c1")?.unwrap_or_default();
        assert_eq!(marker::extract_chapter_id(&restored).as_deref(), Some("c1"));
        assert!(restored.contains("<img src=\"images/img_1.png\" />"));
        assert_eq!(handle.read_fragment("missing")?, None);

        assert_eq!(
            handle.read_resource("images/img_1.png")?,
            Some(b"\x89PNG-data".to_vec())
        );
        assert_eq!(handle.read_resource("images/none.png")?, None);
        Ok(())
    }

    #[test]
    fn existing_output_requires_overwrite() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("book.epub");
        let ch = chapter("c1", 1);
        let fragments = vec![fragment(&ch, marker::wrap_chapter_content(&ch, "<p>x</p>"))];

        EpubBuilder.build(&metadata("w"), &fragments, &[], &out, &BuildOptions::default())?;
        assert!(
            EpubBuilder
                .build(&metadata("w"), &fragments, &[], &out, &BuildOptions::default())
                .is_err()
        );
        EpubBuilder.build(
            &metadata("w"),
            &fragments,
            &[],
            &out,
            &BuildOptions { overwrite: true },
        )?;

        let leftovers = fs::read_dir(temp.path())?.count();
        assert_eq!(leftovers, 1);
        Ok(())
    }

    #[test]
    fn identifier_round_trips_escaped_work_ids() {
        let opf = "<metadata><dc:identifier id=\"bookid\">novelsync:a&amp;b</dc:identifier></metadata>";
        assert_eq!(parse_work_id(opf).as_deref(), Some("a&b"));
        assert_eq!(
            parse_work_id("<dc:identifier id=\"bookid\">urn:uuid:x</dc:identifier>"),
            None
        );
    }

    #[test]
    fn nav_nests_chapters_by_volume() {
        let mut a = chapter("a", 1);
        a.volume_name = Some("Vol 1".to_string());
        let mut b = chapter("b", 2);
        b.volume_name = Some("Vol 1".to_string());
        let c = chapter("c", 3);
        let fragments = [a, b, c]
            .iter()
            .map(|ch| fragment(ch, String::new()))
            .collect::<Vec<_>>();
        let entries = fragments
            .iter()
            .enumerate()
            .map(|(idx, fragment)| ChapterEntry {
                stem: format!("chapter-{:04}", idx + 1),
                fragment,
            })
            .collect::<Vec<_>>();

        let nav = render_nav_xhtml("T", "en", &entries);
        assert_eq!(nav.matches("<span>Vol 1</span>").count(), 1);
        assert!(nav.contains("chapter-0003.xhtml"));
        assert_eq!(nav.matches("<ol>").count(), 2);
    }
}
