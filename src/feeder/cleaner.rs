//! HTML sanitizing and conversion to a restricted markdown dialect.
//!
//! Only a small set of elements survives conversion: paragraphs, headings,
//! quotes, code, lists, links (http/https/mailto) and images (http/https).
//! Active content is dropped with its subtree; every other element is
//! unwrapped to its children.

use scraper::{ElementRef, Html, Node};
use url::Url;

use super::canonical::resolve_url;
use crate::{Result, TributaryError};

/// Largest HTML input accepted for conversion.
pub const MAX_HTML_BYTES: usize = 1024 * 1024;

/// Deepest element nesting accepted for conversion.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Elements removed together with their content.
const DROPPED_ELEMENTS: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "form", "head", "noscript", "template",
    "svg", "math", "button", "select", "textarea",
];

/// Placeholder for list indentation; survives line trimming.
const INDENT: char = '\u{1}';

/// Content sanitization capability.
pub trait Cleaner: Send + Sync {
    /// Strictly sanitize a short field (title, description) to plain text.
    fn clean_field(&self, text: &str) -> String;

    /// Convert untrusted HTML to restricted markdown.
    ///
    /// Relative links and images resolve against `base`.
    fn html_to_markdown(&self, html: &str, base: Option<&Url>) -> Result<String>;
}

/// Cleaner backed by an HTML5 parser.
#[derive(Debug, Clone, Default)]
pub struct HtmlCleaner;

impl HtmlCleaner {
    /// Create a new cleaner.
    pub fn new() -> Self {
        Self
    }
}

impl Cleaner for HtmlCleaner {
    fn clean_field(&self, text: &str) -> String {
        let fragment = Html::parse_fragment(text);
        let mut result = String::with_capacity(text.len());

        for node in fragment.tree.root().descendants() {
            if let Node::Text(t) = node.value() {
                let dropped = node.ancestors().any(|a| {
                    a.value()
                        .as_element()
                        .is_some_and(|e| DROPPED_ELEMENTS.contains(&e.name()))
                });
                if !dropped {
                    result.push_str(t);
                    result.push(' ');
                }
            }
        }

        result.split_whitespace().collect::<Vec<&str>>().join(" ")
    }

    fn html_to_markdown(&self, html: &str, base: Option<&Url>) -> Result<String> {
        if html.len() > MAX_HTML_BYTES {
            return Err(TributaryError::Content(format!(
                "HTML too large ({} bytes, limit {})",
                html.len(),
                MAX_HTML_BYTES
            )));
        }

        let fragment = Html::parse_fragment(html);
        let renderer = Renderer { base };
        let markdown = renderer.children(fragment.root_element(), 0)?;
        Ok(normalize(&markdown).replace(INDENT, " "))
    }
}

struct Renderer<'a> {
    base: Option<&'a Url>,
}

impl Renderer<'_> {
    fn children(&self, el: ElementRef<'_>, depth: usize) -> Result<String> {
        let mut out = String::new();
        for child in el.children() {
            match child.value() {
                Node::Text(t) => out.push_str(&escape_markdown(&collapse_whitespace(t))),
                Node::Element(_) => {
                    if let Some(child_el) = ElementRef::wrap(child) {
                        out.push_str(&self.element(child_el, depth + 1)?);
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }

    fn element(&self, el: ElementRef<'_>, depth: usize) -> Result<String> {
        if depth > MAX_NESTING_DEPTH {
            return Err(TributaryError::Content(format!(
                "HTML nesting deeper than {MAX_NESTING_DEPTH}"
            )));
        }

        let name = el.value().name();
        if DROPPED_ELEMENTS.contains(&name) {
            return Ok(String::new());
        }

        let md = match name {
            "p" | "div" | "section" | "article" | "figure" | "figcaption" => {
                block(self.children(el, depth)?.trim())
            }
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = name[1..].parse::<usize>().unwrap_or(1);
                let text = self.children(el, depth)?;
                let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if text.is_empty() {
                    String::new()
                } else {
                    block(&format!("{} {}", "#".repeat(level), text))
                }
            }
            "blockquote" => {
                let inner = normalize(&self.children(el, depth)?);
                let quoted: Vec<String> = inner
                    .lines()
                    .map(|l| {
                        if l.is_empty() {
                            ">".to_string()
                        } else {
                            format!("> {l}")
                        }
                    })
                    .collect();
                block(&quoted.join("\n"))
            }
            "pre" => {
                let code = strip_control(&el.text().collect::<String>());
                let fence = if code.contains("```") { "~~~" } else { "```" };
                block(&format!("{fence}\n{}\n{fence}", code.trim_end_matches('\n')))
            }
            "code" => inline_code(&strip_control(&el.text().collect::<String>())),
            "ul" | "ol" => self.list(el, name == "ol", depth)?,
            "br" => "\n".to_string(),
            "hr" => block("---"),
            "a" => {
                let text = self.children(el, depth)?;
                match el.value().attr("href").and_then(|h| self.safe_link(h)) {
                    Some(href) => {
                        let text = text.trim();
                        let label = if text.is_empty() {
                            escape_markdown(&href)
                        } else {
                            text.to_string()
                        };
                        format!("[{label}]({href})")
                    }
                    None => text,
                }
            }
            "img" => match el.value().attr("src").and_then(|s| self.safe_image(s)) {
                Some(src) => {
                    let alt: String = el
                        .value()
                        .attr("alt")
                        .unwrap_or_default()
                        .chars()
                        .filter(|c| !matches!(c, '[' | ']') && !c.is_control())
                        .collect();
                    format!("![{}]({src})", alt.trim())
                }
                None => String::new(),
            },
            "strong" | "b" => wrap_inline(&self.children(el, depth)?, "**"),
            "em" | "i" => wrap_inline(&self.children(el, depth)?, "*"),
            _ => self.children(el, depth)?,
        };
        Ok(md)
    }

    fn list(&self, el: ElementRef<'_>, ordered: bool, depth: usize) -> Result<String> {
        let mut lines = Vec::new();
        let mut number = 1;

        for li in el.children().filter_map(ElementRef::wrap) {
            if li.value().name() != "li" {
                continue;
            }
            let content = normalize(&self.children(li, depth + 1)?);
            let marker = if ordered {
                format!("{number}. ")
            } else {
                "- ".to_string()
            };
            number += 1;

            let indent: String = std::iter::repeat(INDENT).take(marker.len()).collect();
            let mut body = content.lines().filter(|l| !l.trim().is_empty());
            lines.push(format!("{marker}{}", body.next().unwrap_or_default()));
            lines.extend(body.map(|l| format!("{indent}{l}")));
        }

        if lines.is_empty() {
            return Ok(String::new());
        }
        Ok(block(&lines.join("\n")))
    }

    fn safe_link(&self, href: &str) -> Option<String> {
        let url = resolve_url(href, self.base)?;
        match url.scheme() {
            "http" | "https" | "mailto" => Some(encode_parens(url.as_str())),
            _ => None,
        }
    }

    fn safe_image(&self, src: &str) -> Option<String> {
        let url = resolve_url(src, self.base)?;
        match url.scheme() {
            "http" | "https" => Some(encode_parens(url.as_str())),
            _ => None,
        }
    }
}

fn block(text: &str) -> String {
    if text.is_empty() {
        String::new()
    } else {
        format!("\n\n{text}\n\n")
    }
}

fn wrap_inline(inner: &str, marker: &str) -> String {
    let trimmed = inner.trim();
    if trimmed.is_empty() {
        return inner.to_string();
    }
    // Keep surrounding spaces outside the markers
    let lead = if inner.starts_with(' ') { " " } else { "" };
    let trail = if inner.ends_with(' ') { " " } else { "" };
    format!("{lead}{marker}{trimmed}{marker}{trail}")
}

fn inline_code(code: &str) -> String {
    let code = code.split_whitespace().collect::<Vec<_>>().join(" ");
    if code.is_empty() {
        String::new()
    } else if code.contains('`') {
        format!("`` {code} ``")
    } else {
        format!("`{code}`")
    }
}

fn encode_parens(url: &str) -> String {
    url.replace('(', "%28").replace(')', "%29")
}

fn strip_control(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else if !ch.is_control() {
            out.push(ch);
            in_space = false;
        }
    }
    out
}

fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '\\' | '`' | '*' | '_' | '[' | ']' | '<' | '>' | '#') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Trim lines, drop runs of blank lines, and trim the whole text.
///
/// Lines inside code fences are kept verbatim.
fn normalize(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut in_fence = false;
    let mut blank = false;

    for line in text.lines() {
        let trimmed = line.trim_matches(|c| c == ' ' || c == '\t');
        let is_fence = trimmed.starts_with("```") || trimmed.starts_with("~~~");

        if in_fence {
            if is_fence {
                in_fence = false;
                lines.push(trimmed);
            } else {
                lines.push(line.trim_end());
            }
            continue;
        }

        if trimmed.is_empty() {
            if !blank && !lines.is_empty() {
                lines.push("");
            }
            blank = true;
            continue;
        }

        in_fence = is_fence;
        blank = false;
        lines.push(trimmed);
    }

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md(html: &str) -> String {
        let base = Url::parse("https://example.com/posts/1").unwrap();
        HtmlCleaner::new().html_to_markdown(html, Some(&base)).unwrap()
    }

    #[test]
    fn test_clean_field_strips_tags() {
        let cleaner = HtmlCleaner::new();
        assert_eq!(cleaner.clean_field("<b>Hello</b>   <i>world</i>"), "Hello world");
        assert_eq!(cleaner.clean_field("Plain title"), "Plain title");
    }

    #[test]
    fn test_clean_field_decodes_entities() {
        let cleaner = HtmlCleaner::new();
        assert_eq!(cleaner.clean_field("Tom &amp; Jerry"), "Tom & Jerry");
        assert_eq!(cleaner.clean_field("&#x3042;&#12354;"), "ああ");
    }

    #[test]
    fn test_clean_field_drops_script() {
        let cleaner = HtmlCleaner::new();
        assert_eq!(cleaner.clean_field("<script>alert(1)</script>Title"), "Title");
        assert_eq!(cleaner.clean_field("<style>p{}</style> A\n\n B "), "A B");
    }

    #[test]
    fn test_paragraphs_and_emphasis() {
        assert_eq!(md("<p>Hello <strong>world</strong></p>"), "Hello **world**");
        assert_eq!(md("<p>one</p><p>two <em>three</em></p>"), "one\n\ntwo *three*");
    }

    #[test]
    fn test_drops_active_content() {
        assert_eq!(md("<p>a</p><script>alert(1)</script><p>b</p>"), "a\n\nb");
        assert_eq!(md("<iframe src=\"https://evil.example\"></iframe><p>ok</p>"), "ok");
        assert_eq!(md("<form><input name=x>secret</form>visible"), "visible");
    }

    #[test]
    fn test_headings() {
        assert_eq!(md("<h2>Section  title</h2><p>text</p>"), "## Section title\n\ntext");
    }

    #[test]
    fn test_links_resolved_and_filtered() {
        assert_eq!(md("<a href=\"/x\">link</a>"), "[link](https://example.com/x)");
        assert_eq!(
            md("<a href=\"mailto:me@example.com\">mail</a>"),
            "[mail](mailto:me@example.com)"
        );
        assert_eq!(md("<a href=\"javascript:alert(1)\">click</a>"), "click");
    }

    #[test]
    fn test_images() {
        assert_eq!(
            md("<img src=\"/i.png\" alt=\"a [pic]\">"),
            "![a pic](https://example.com/i.png)"
        );
        assert_eq!(md("<img src=\"data:image/png;base64,AAAA\">"), "");
        assert_eq!(
            md("<img src=\"https://cdn.example/a(1).png\">"),
            "![](https://cdn.example/a%281%29.png)"
        );
    }

    #[test]
    fn test_lists() {
        assert_eq!(md("<ul><li>one</li><li>two</li></ul>"), "- one\n- two");
        assert_eq!(md("<ol><li>one</li><li>two</li></ol>"), "1. one\n2. two");
        assert_eq!(
            md("<ul><li>a<ul><li>b</li></ul></li></ul>"),
            "- a\n  - b"
        );
    }

    #[test]
    fn test_blockquote() {
        assert_eq!(md("<blockquote><p>quoted</p></blockquote>"), "> quoted");
    }

    #[test]
    fn test_preformatted_code() {
        assert_eq!(
            md("<pre>let x = 1;\n    y();</pre>"),
            "```\nlet x = 1;\n    y();\n```"
        );
        assert_eq!(md("<p>use <code>a*b</code></p>"), "use `a*b`");
    }

    #[test]
    fn test_escapes_markdown_in_text() {
        assert_eq!(md("<p>1 * 2 _ 3 [x]</p>"), "1 \\* 2 \\_ 3 \\[x\\]");
        // An escaped image reference is not an image
        assert_eq!(md("![x](https://a.example/i.png)"), "!\\[x\\](https://a.example/i.png)");
    }

    #[test]
    fn test_unknown_elements_unwrapped() {
        assert_eq!(md("<span>in <u>line</u></span>"), "in line");
    }

    #[test]
    fn test_too_large_input_is_error() {
        let html = "a".repeat(MAX_HTML_BYTES + 1);
        let result = HtmlCleaner::new().html_to_markdown(&html, None);
        assert!(matches!(result, Err(TributaryError::Content(_))));
    }

    #[test]
    fn test_too_deep_nesting_is_error() {
        let html = format!("{}x", "<div>".repeat(MAX_NESTING_DEPTH + 10));
        let result = HtmlCleaner::new().html_to_markdown(&html, None);
        assert!(matches!(result, Err(TributaryError::Content(_))));
    }
}
