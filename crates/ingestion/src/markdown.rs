//! Plain text to Markdown conversion
//!
//! PDF text layers carry no structure, so headings, list items and
//! paragraphs are recovered from line shapes:
//! - short upper-case lines and numbered section titles become `##` headings
//! - lines starting with a bullet glyph become `-` list items
//! - everything else is joined into paragraphs, undoing line-break hyphens

use regex_lite::Regex;
use std::sync::OnceLock;

/// Longest line still considered a heading
const MAX_HEADING_CHARS: usize = 80;

/// Glyphs that open a list item even without a following space
const BULLET_GLYPHS: &[char] = &['•', '◦', '▪', '▫', '●', '○', '■', '□', '·', '►', '➢', '✓'];

/// Dashes and asterisks open a list item only when followed by a space
const BULLET_MARKS: &[char] = &['-', '–', '—', '*'];

fn numbered_heading() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:\d+(?:\.\d+)*\.?|[IVXLC]+\.)\s+\S").ok())
        .as_ref()
}

fn article_heading() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?i:art(?:icolo|icle)?\.?|capo|titolo|sezione|section|chapter)\s*(?:\d+|[IVXLC]+)\b")
            .ok()
    })
    .as_ref()
}

/// Replace ligatures, typographic quotes and odd spaces; collapse runs of whitespace
pub fn normalize_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for c in line.chars() {
        match c {
            'ﬀ' => out.push_str("ff"),
            'ﬁ' => out.push_str("fi"),
            'ﬂ' => out.push_str("fl"),
            'ﬃ' => out.push_str("ffi"),
            'ﬄ' => out.push_str("ffl"),
            'ﬅ' | 'ﬆ' => out.push_str("st"),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{00AB}' | '\u{00BB}' => out.push('"'),
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => out.push('\''),
            '\u{00AD}' | '\u{FEFF}' | '\u{200B}' => {}
            c => out.push(c),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_heading(line: &str) -> bool {
    let len = line.chars().count();
    if len == 0 || len > MAX_HEADING_CHARS {
        return false;
    }

    // Numbered lines that end in punctuation are list-like sentences
    let ends_like_sentence = line.ends_with(['.', ';', ',']);
    if !ends_like_sentence
        && (article_heading().is_some_and(|re| re.is_match(line))
            || numbered_heading().is_some_and(|re| re.is_match(line)))
    {
        return true;
    }

    let letters = line.chars().filter(|c| c.is_alphabetic()).count();
    letters >= 3
        && !line.chars().any(|c| c.is_lowercase())
        && line.split_whitespace().count() <= 12
}

/// The text of a list item, if the line is one
fn list_item(line: &str) -> Option<&str> {
    let mut chars = line.chars();
    let first = chars.next()?;
    let rest = chars.as_str();

    if BULLET_GLYPHS.contains(&first) {
        return Some(rest.trim_start()).filter(|r| !r.is_empty());
    }
    if BULLET_MARKS.contains(&first) && rest.starts_with(' ') {
        return Some(rest.trim_start()).filter(|r| !r.is_empty());
    }
    None
}

/// Append a wrapped line to a paragraph, undoing hyphenation at the break
fn join_line(paragraph: &mut String, line: &str) {
    if paragraph.is_empty() {
        paragraph.push_str(line);
        return;
    }

    let hyphenated = paragraph.ends_with('-')
        && paragraph
            .chars()
            .rev()
            .nth(1)
            .is_some_and(char::is_alphabetic)
        && line.chars().next().is_some_and(char::is_lowercase);

    if hyphenated {
        paragraph.pop();
    } else {
        paragraph.push(' ');
    }
    paragraph.push_str(line);
}

/// Convert one page of plain text into Markdown blocks
fn page_blocks(text: &str, blocks: &mut Vec<String>) {
    let mut paragraph = String::new();

    for raw in text.lines() {
        let line = normalize_line(raw);
        if line.is_empty() {
            flush(&mut paragraph, blocks);
            continue;
        }

        if let Some(item) = list_item(&line) {
            flush(&mut paragraph, blocks);
            blocks.push(format!("- {}", item));
        } else if is_heading(&line) {
            flush(&mut paragraph, blocks);
            blocks.push(format!("## {}", line));
        } else if blocks.last().is_some_and(|b| b.starts_with("- ")) && paragraph.is_empty() && starts_lowercase(&line) {
            // Wrapped continuation of the previous list item
            if let Some(last) = blocks.last_mut() {
                join_line(last, &line);
            }
        } else {
            join_line(&mut paragraph, &line);
        }
    }
    flush(&mut paragraph, blocks);
}

fn flush(paragraph: &mut String, blocks: &mut Vec<String>) {
    if !paragraph.is_empty() {
        blocks.push(std::mem::take(paragraph));
    }
}

fn starts_lowercase(line: &str) -> bool {
    line.chars().next().is_some_and(char::is_lowercase)
}

/// Build the Markdown document for a title and per-page text
pub fn to_markdown<S: AsRef<str>>(title: &str, pages: &[S]) -> String {
    let mut blocks = Vec::new();
    for page in pages {
        page_blocks(page.as_ref(), &mut blocks);
    }
    with_title(title, &join_blocks(&blocks))
}

/// Blank lines between blocks; consecutive list items stay in one list
fn join_blocks(blocks: &[String]) -> String {
    let mut out = String::new();
    for (i, block) in blocks.iter().enumerate() {
        if i > 0 {
            let tight = block.starts_with("- ") && blocks[i - 1].starts_with("- ");
            out.push_str(if tight { "\n" } else { "\n\n" });
        }
        out.push_str(block);
    }
    out
}

/// Prefix a Markdown body with `# title` unless it already opens with a top heading
pub fn with_title(title: &str, body: &str) -> String {
    let body = body.trim();
    let title = normalize_line(title);
    if title.is_empty() || body.starts_with("# ") {
        return format!("{}\n", body);
    }
    if body.is_empty() {
        return format!("# {}\n", title);
    }
    format!("# {}\n\n{}\n", title, body)
}
