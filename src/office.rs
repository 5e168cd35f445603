//! Zip-packaged formats: Word and OpenDocument text, EPUB books and Excel
//! workbooks.

use std::{
    collections::HashMap,
    io::{Cursor, Read},
    path::Path,
};

use calamine::{Reader as _, Xlsx, open_workbook_from_rs};
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use zip::ZipArchive;

use crate::{
    error::{Error, Result},
    loaders::{join_elements, labelled_rows},
    markup,
    registry::LoadMode,
};

type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

fn open_archive<'a>(path: &Path, bytes: &'a [u8]) -> Result<Archive<'a>> {
    ZipArchive::new(Cursor::new(bytes)).map_err(|e| Error::malformed(path, e))
}

fn read_entry(
    path: &Path,
    archive: &mut Archive<'_>,
    name: &str,
) -> Result<String> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| Error::malformed(path, format!("{name}: {e}")))?;
    let mut text = String::new();
    entry
        .read_to_string(&mut text)
        .map_err(|e| Error::malformed(path, format!("{name}: {e}")))?;
    Ok(text)
}

pub fn load_docx(path: &Path, bytes: &[u8]) -> Result<String> {
    let mut archive = open_archive(path, bytes)?;
    let body = read_entry(path, &mut archive, "word/document.xml")?;
    markup::xml_text(&body, Some(b"t".as_slice()))
        .map_err(|e| Error::malformed(path, e))
}

pub fn load_odt(path: &Path, bytes: &[u8]) -> Result<String> {
    let mut archive = open_archive(path, bytes)?;
    let body = read_entry(path, &mut archive, "content.xml")?;
    markup::xml_text(&body, None).map_err(|e| Error::malformed(path, e))
}

/// Sheets in workbook order. Each sheet's first row labels the rest.
pub fn load_spreadsheet(
    path: &Path,
    bytes: &[u8],
    mode: LoadMode,
) -> Result<String> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes))
        .map_err(|e| Error::malformed(path, e))?;

    let mut sheets = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| Error::malformed(path, format!("{name}: {e}")))?;
        let mut rows = range.rows().map(|row| {
            row.iter().map(|cell| cell.to_string()).collect::<Vec<_>>()
        });
        let Some(header) = rows.next() else {
            continue;
        };

        let records = labelled_rows(&header, rows);
        if !records.is_empty() {
            sheets.push(format!("{name}\n{}", join_elements(records, mode)));
        }
    }
    Ok(join_elements(sheets, mode))
}

/// Chapters in reading order, as listed by the package's spine.
pub fn load_epub(path: &Path, bytes: &[u8], mode: LoadMode) -> Result<String> {
    let mut archive = open_archive(path, bytes)?;
    let container = read_entry(path, &mut archive, "META-INF/container.xml")?;
    let package_path = first_attribute(&container, b"rootfile", "full-path")
        .map_err(|e| Error::malformed(path, e))?
        .ok_or_else(|| Error::malformed(path, "container names no rootfile"))?;

    let opf = read_entry(path, &mut archive, &package_path)?;
    let package = Package::parse(&opf).map_err(|e| Error::malformed(path, e))?;
    let base = package_path.rsplit_once('/').map_or("", |(dir, _)| dir);

    let mut chapters = Vec::new();
    for idref in &package.spine {
        let Some(href) = package.manifest.get(idref) else {
            tracing::debug!(
                path = %path.display(),
                idref,
                "spine entry not in manifest"
            );
            continue;
        };
        let entry = match base {
            "" => href.clone(),
            base => format!("{base}/{href}"),
        };
        let html = read_entry(path, &mut archive, &entry)?;
        let text = markup::html_to_text(&html);
        if !text.is_empty() {
            chapters.push(text);
        }
    }
    Ok(join_elements(chapters, mode))
}

/// The parts of an OPF package document needed to read a book in order.
#[derive(Debug, Default)]
struct Package {
    /// Manifest id -> href relative to the package document.
    manifest: HashMap<String, String>,
    spine: Vec<String>,
}

impl Package {
    fn parse(opf: &str) -> quick_xml::Result<Self> {
        let mut reader = Reader::from_str(opf);
        let mut package = Self::default();
        loop {
            match reader.read_event()? {
                Event::Start(e) | Event::Empty(e) => {
                    match e.local_name().as_ref() {
                        b"item" => {
                            if let (Some(id), Some(href)) =
                                (attribute(&e, "id")?, attribute(&e, "href")?)
                            {
                                package.manifest.insert(id, href);
                            }
                        }
                        b"itemref" => {
                            if let Some(idref) = attribute(&e, "idref")? {
                                package.spine.push(idref);
                            }
                        }
                        _ => {}
                    }
                }
                Event::Eof => return Ok(package),
                _ => {}
            }
        }
    }
}

fn first_attribute(
    xml: &str,
    element: &[u8],
    name: &str,
) -> quick_xml::Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e)
                if e.local_name().as_ref() == element =>
            {
                if let Some(value) = attribute(&e, name)? {
                    return Ok(Some(value));
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn attribute(
    element: &BytesStart<'_>,
    name: &str,
) -> quick_xml::Result<Option<String>> {
    let Some(attr) = element.try_get_attribute(name)? else {
        return Ok(None);
    };
    Ok(Some(attr.unescape_value()?.into_owned()))
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Minimal packages built in memory for tests.

    use std::io::{Cursor, Write};

    use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

    pub fn zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored);
        for (name, body) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    pub fn docx(paragraphs: &[&str]) -> Vec<u8> {
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t>{p}</w:t></w:r></w:p>"))
            .collect();
        let document = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
        );
        zip(&[("word/document.xml", document.as_str())])
    }

    pub fn odt(paragraphs: &[&str]) -> Vec<u8> {
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<text:p>{p}</text:p>"))
            .collect();
        let content = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><office:document-content xmlns:office="urn:oasis:names:tc:opendocument:xmlns:office:1.0" xmlns:text="urn:oasis:names:tc:opendocument:xmlns:text:1.0"><office:body><office:text>{body}</office:text></office:body></office:document-content>"#
        );
        zip(&[
            ("mimetype", "application/vnd.oasis.opendocument.text"),
            ("content.xml", content.as_str()),
        ])
    }

    /// One sheet named `sheet` holding `rows` as inline strings.
    pub fn xlsx(sheet: &str, rows: &[&[&str]]) -> Vec<u8> {
        let columns = ["A", "B", "C", "D"];
        let data: String = rows
            .iter()
            .enumerate()
            .map(|(r, row)| {
                let cells: String = row
                    .iter()
                    .enumerate()
                    .map(|(c, value)| {
                        format!(
                            r#"<c r="{}{}" t="inlineStr"><is><t>{value}</t></is></c>"#,
                            columns[c],
                            r + 1
                        )
                    })
                    .collect();
                format!(r#"<row r="{}">{cells}</row>"#, r + 1)
            })
            .collect();

        let workbook = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="{sheet}" sheetId="1" r:id="rId1"/></sheets></workbook>"#
        );
        let worksheet = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>{data}</sheetData></worksheet>"#
        );
        zip(&[
            (
                "[Content_Types].xml",
                r#"<?xml version="1.0" encoding="UTF-8"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#,
            ),
            (
                "_rels/.rels",
                r#"<?xml version="1.0" encoding="UTF-8"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#,
            ),
            ("xl/workbook.xml", workbook.as_str()),
            (
                "xl/_rels/workbook.xml.rels",
                r#"<?xml version="1.0" encoding="UTF-8"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#,
            ),
            ("xl/worksheets/sheet1.xml", worksheet.as_str()),
        ])
    }

    /// A book whose spine lists `chapters` in order.
    pub fn epub(chapters: &[(&str, &str)]) -> Vec<u8> {
        let manifest: String = chapters
            .iter()
            .enumerate()
            .map(|(i, _)| {
                format!(
                    r#"<item id="c{i}" href="text/c{i}.xhtml" media-type="application/xhtml+xml"/>"#
                )
            })
            .collect();
        let spine: String = (0..chapters.len())
            .map(|i| format!(r#"<itemref idref="c{i}"/>"#))
            .collect();
        let opf = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><package xmlns="http://www.idpf.org/2007/opf" version="3.0"><manifest>{manifest}</manifest><spine>{spine}</spine></package>"#
        );
        let pages: Vec<(String, String)> = chapters
            .iter()
            .enumerate()
            .map(|(i, (title, body))| {
                (
                    format!("OEBPS/text/c{i}.xhtml"),
                    format!(
                        r#"<html xmlns="http://www.w3.org/1999/xhtml"><head><title>{title}</title></head><body><h1>{title}</h1><p>{body}</p></body></html>"#
                    ),
                )
            })
            .collect();

        let mut entries = vec![
            ("mimetype", "application/epub+zip"),
            (
                "META-INF/container.xml",
                r#"<?xml version="1.0"?><container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container"><rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles></container>"#,
            ),
            ("OEBPS/content.opf", opf.as_str()),
        ];
        entries.extend(pages.iter().map(|(n, b)| (n.as_str(), b.as_str())));
        zip(&entries)
    }
}
