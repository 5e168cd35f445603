//! Plain text out of HTML and XML document bodies.

use std::sync::LazyLock;

use quick_xml::{Reader, events::Event};
use regex::Regex;
use scraper::{ElementRef, Html, Node};

/// Elements whose content is never shown to a reader.
const HIDDEN: &[&str] = &["head", "script", "style", "noscript", "template"];

/// Elements that start and end on their own line.
const BLOCKS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl",
    "dt", "en-note", "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header",
    "hr", "li", "ol", "p", "pre", "section", "table", "tr", "ul",
];

/// XML elements closing a paragraph in Word and OpenDocument bodies.
const XML_PARAGRAPHS: &[&[u8]] = &[b"p", b"h", b"tr"];

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*(\n[ \t]*)+").expect("valid regex"));

/// Visible text of an HTML document or fragment, one block per line.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();
    collect_visible(document.root_element(), &mut out);
    tidy(&out)
}

fn collect_visible(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                let name = el.name();
                if HIDDEN.contains(&name) {
                    continue;
                }
                let Some(child) = ElementRef::wrap(child) else {
                    continue;
                };

                let block = BLOCKS.contains(&name);
                if block {
                    out.push('\n');
                }
                collect_visible(child, out);
                match name {
                    _ if block => out.push('\n'),
                    "td" | "th" => out.push(' '),
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

/// Character data of an XML body with paragraph ends as line breaks.
///
/// With `text_element`, only characters inside elements of that local name
/// count (`t` for WordprocessingML). Layout elements such as tabs and line
/// breaks are honored either way.
pub fn xml_text(
    xml: &str,
    text_element: Option<&[u8]>,
) -> quick_xml::Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut out = String::new();
    let mut open_text = 0usize;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if Some(e.local_name().as_ref()) == text_element {
                    open_text += 1;
                }
            }
            Event::End(e) => {
                let name = e.local_name();
                if Some(name.as_ref()) == text_element {
                    open_text = open_text.saturating_sub(1);
                }
                if XML_PARAGRAPHS.contains(&name.as_ref()) {
                    out.push('\n');
                }
            }
            Event::Empty(e) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" | b"cr" | b"line-break" => out.push('\n'),
                b"s" => out.push(' '),
                _ => {}
            },
            Event::Text(t) if text_element.is_none() || open_text > 0 => {
                out.push_str(&t.unescape()?);
            }
            Event::CData(c) if text_element.is_none() || open_text > 0 => {
                out.push_str(&String::from_utf8_lossy(&c));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(tidy(&out))
}

/// Trim every line and collapse runs of blank lines to one.
pub fn tidy(text: &str) -> String {
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    BLANK_RUNS
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_blocks_become_lines() {
        let html = "<html><head><title>t</title><style>p{}</style></head>\
            <body><h1>Pies</h1><p>Apple &amp; <b>cherry</b></p>\
            <script>x()</script><ul><li>one</li><li>two</li></ul></body></html>";
        assert_eq!(html_to_text(html), "Pies\n\nApple & cherry\n\none\n\ntwo");
    }

    #[test]
    fn html_fragments_and_table_cells() {
        assert_eq!(html_to_text("<en-note>garden</en-note>"), "garden");
        assert_eq!(
            html_to_text("<table><tr><td>a</td><td>b</td></tr></table>"),
            "a b"
        );
    }

    #[test]
    fn word_body_keeps_only_run_text() {
        let xml = r#"<w:document xmlns:w="urn:w"><w:body>
            <w:p><w:pPr><w:pStyle w:val="Title"/></w:pPr><w:r><w:t>Pie</w:t></w:r></w:p>
            <w:p><w:r><w:t xml:space="preserve">Apple </w:t></w:r><w:r><w:tab/><w:t>&amp; pear</w:t></w:r></w:p>
            </w:body></w:document>"#;
        assert_eq!(
            xml_text(xml, Some(b"t".as_slice())).unwrap(),
            "Pie\nApple \t& pear"
        );
    }

    #[test]
    fn opendocument_body_uses_all_text() {
        let xml = r#"<office:text xmlns:office="urn:o" xmlns:text="urn:t">
            <text:h>Notes</text:h><text:p>one<text:s/>two<text:line-break/>three</text:p>
            </office:text>"#;
        assert_eq!(xml_text(xml, None).unwrap(), "Notes\none two\nthree");
    }

    #[test]
    fn broken_xml_is_an_error() {
        assert!(xml_text("<a><b></a>", None).is_err());
    }

    #[test]
    fn tidy_collapses_blank_runs() {
        assert_eq!(tidy("  a \n\n \n\t\n b\n"), "a\n\nb");
    }
}
