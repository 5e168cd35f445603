use std::{
    io::{Cursor, Write},
    path::Path,
};

use docvault::{
    CancelToken,
    ConfigDb,
    DataDir,
    FormatRegistry,
    IndexBuilder,
    LoaderPool,
    ModelManager,
    QueryEngine,
    Settings,
    loader_pool::ThreadRunner,
    query::QueryOptions,
    settings::ComputeDevice,
};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

struct Env {
    _tmp: tempfile::TempDir,
    source: std::path::PathBuf,
    data_dir: DataDir,
    config_db: ConfigDb,
}

fn env() -> Env {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    let data_dir = DataDir::resolve(Some(&tmp.path().join("data"))).unwrap();
    let config_db = ConfigDb::open(&data_dir.config_db()).unwrap();
    Env {
        _tmp: tmp,
        source,
        data_dir,
        config_db,
    }
}

fn settings() -> Settings {
    Settings {
        embedding_model: "hashed-bow".to_string(),
        outer_worker_cap: Some(2),
        inner_threads: Some(2),
        show_progress: false,
        ..Settings::default()
    }
}

fn build(env: &Env, settings: &Settings, collection: &str) {
    let pool = LoaderPool::new(settings, Box::new(ThreadRunner));
    let mut model =
        ModelManager::with_model_id(&settings.embedding_model, ComputeDevice::Cpu);
    IndexBuilder::new(&env.data_dir, &env.config_db, settings)
        .build_from_directory(
            collection,
            &env.source,
            &pool,
            &mut model,
            &CancelToken::new(),
        )
        .unwrap();
    assert!(!model.is_loaded());
}

fn write(dir: &Path, name: &str, contents: &[u8]) {
    std::fs::write(dir.join(name), contents).unwrap();
}

fn write_recipes(dir: &Path) {
    write(dir, "pie.txt", b"apple pie recipe");
    write(dir, "bread.md", b"banana bread recipe");
    write(dir, "car.txt", b"car repair manual");
}

/// A one-page PDF showing `text` in Helvetica, with a correct xref table.
fn minimal_pdf(text: &str) -> Vec<u8> {
    let stream = format!("BT /F1 24 Tf 72 700 Td ({text}) Tj ET");
    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
         /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >>"
            .to_string(),
        format!(
            "<< /Length {} >>\nstream\n{stream}\nendstream",
            stream.len()
        ),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
    ];

    let mut pdf = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::new();
    for (i, body) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.extend_from_slice(format!("{} 0 obj\n{body}\nendobj\n", i + 1).as_bytes());
    }

    let xref = pdf.len();
    pdf.extend_from_slice(
        format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).as_bytes(),
    );
    for offset in offsets {
        pdf.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    pdf.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref}\n%%EOF\n",
            objects.len() + 1
        )
        .as_bytes(),
    );
    pdf
}

/// A stored (uncompressed) zip holding `entries` in order.
fn zipped(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, body) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

const RELATIONSHIPS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

fn minimal_xlsx() -> Vec<u8> {
    let workbook = format!(
        r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="{RELATIONSHIPS}"><sheets><sheet name="Sheet1" sheetId="1" r:id="rId1"/></sheets></workbook>"#
    );
    let rels = format!(
        r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="{RELATIONSHIPS}/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#
    );
    let sheet = r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData><row r="1"><c r="A1" t="inlineStr"><is><t>fruit</t></is></c></row><row r="2"><c r="A2" t="inlineStr"><is><t>plum</t></is></c></row></sheetData></worksheet>"#;
    zipped(&[
        ("xl/workbook.xml", workbook.as_str()),
        ("xl/_rels/workbook.xml.rels", rels.as_str()),
        ("xl/worksheets/sheet1.xml", sheet),
    ])
}

fn minimal_epub() -> Vec<u8> {
    zipped(&[
        ("mimetype", "application/epub+zip"),
        (
            "META-INF/container.xml",
            r#"<container xmlns="urn:oasis:names:tc:opendocument:xmlns:container"><rootfiles><rootfile full-path="content.opf"/></rootfiles></container>"#,
        ),
        (
            "content.opf",
            r#"<package xmlns="http://www.idpf.org/2007/opf"><manifest><item id="one" href="one.xhtml"/></manifest><spine><itemref idref="one"/></spine></package>"#,
        ),
        ("one.xhtml", "<html><body><p>book chapter</p></body></html>"),
    ])
}

#[test]
fn every_registered_extension_loads() {
    let env = env();
    let dir = &env.source;

    write(dir, "a.txt", b"plain text");
    write(dir, "b.text", b"more plain text");
    write(dir, "c.log", b"INFO started");
    write(dir, "d.md", b"# Heading\n\nBody");
    write(dir, "e.markdown", b"*emphasis*");
    write(dir, "f.csv", b"name,colour\napple,red\n");
    write(dir, "g.html", b"<html><body><p>html page</p></body></html>");
    write(dir, "h.htm", b"<p>htm page</p>");
    write(
        dir,
        "i.enex",
        b"<en-export><note><title>T</title><content>note body</content></note></en-export>",
    );
    write(dir, "j.pdf", &minimal_pdf("Hello PDF"));
    write(dir, "k.eml", b"Subject: Hi\r\n\r\nmail body\r\n");
    write(dir, "l.json", br#"{"content": "spoken words"}"#);
    write(
        dir,
        "m.docx",
        &zipped(&[(
            "word/document.xml",
            r#"<w:document xmlns:w="urn:w"><w:body><w:p><w:r><w:t>word file</w:t></w:r></w:p></w:body></w:document>"#,
        )]),
    );
    write(
        dir,
        "n.odt",
        &zipped(&[(
            "content.xml",
            r#"<office:text xmlns:office="urn:o" xmlns:text="urn:t"><text:p>open file</text:p></office:text>"#,
        )]),
    );
    write(dir, "o.xlsx", &minimal_xlsx());
    write(dir, "p.xlsm", &minimal_xlsx());
    write(dir, "q.epub", &minimal_epub());
    for (i, ext) in ["png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff"]
        .iter()
        .enumerate()
    {
        let size = i as u32 + 2;
        image::RgbImage::new(size, size)
            .save(dir.join(format!("img{i}.{ext}")))
            .unwrap();
    }

    let settings = settings();
    let pool = LoaderPool::new(&settings, Box::new(ThreadRunner));
    let report = pool.load_directory(dir, &CancelToken::new()).unwrap();

    assert_eq!(report.failed_files(), 0, "{:?}", report.failures);
    let mut loaded: Vec<String> = report
        .documents
        .iter()
        .map(|d| d.metadata.file_type.clone())
        .collect();
    loaded.sort();
    let mut registered: Vec<String> = FormatRegistry::standard()
        .extensions()
        .map(str::to_string)
        .collect();
    registered.sort();
    assert_eq!(loaded, registered);

    let text_of = |file_type: &str| {
        report
            .documents
            .iter()
            .find(|d| d.metadata.file_type == file_type)
            .and_then(|d| d.content.coerce_text())
            .unwrap()
            .into_owned()
    };
    assert_eq!(text_of("docx"), "word file");
    assert_eq!(text_of("odt"), "open file");
    assert_eq!(text_of("xlsx"), "Sheet1\nfruit: plum");
    assert_eq!(text_of("epub"), "book chapter");

    for doc in &report.documents {
        assert!(doc.metadata.file_path.is_absolute());
        assert!(!doc.metadata.content_hash.is_empty());
    }
}

#[test]
fn dessert_query_finds_both_recipes() {
    let env = env();
    write_recipes(&env.source);
    let settings = settings();
    build(&env, &settings, "recipes");

    let mut engine = QueryEngine::new(&env.data_dir, &settings);
    let options = QueryOptions {
        k: 2,
        ..QueryOptions::from_settings(&settings)
    };
    let results = engine
        .query_with("recipes", "dessert recipe", &options)
        .unwrap();

    let mut texts: Vec<&str> = results.iter().map(|r| r.text.as_str()).collect();
    texts.sort();
    assert_eq!(texts, vec!["apple pie recipe", "banana bread recipe"]);
}

#[test]
fn chunk_text_round_trips_to_the_top() {
    let env = env();
    write_recipes(&env.source);
    let settings = settings();
    build(&env, &settings, "recipes");

    let mut engine = QueryEngine::new(&env.data_dir, &settings);
    let results = engine.query("recipes", "car repair manual").unwrap();
    assert_eq!(results[0].text, "car repair manual");
    assert!(results[0].score >= settings.score_threshold);
    assert_eq!(results[0].metadata.file_name, "car.txt");
    assert_eq!(results[0].metadata.chunk_index, Some(0));
}

#[test]
fn rebuilding_is_idempotent() {
    let env = env();
    write_recipes(&env.source);
    let settings = settings();

    build(&env, &settings, "recipes");
    let first = QueryEngine::new(&env.data_dir, &settings)
        .query("recipes", "recipe")
        .unwrap();

    build(&env, &settings, "recipes");
    let second = QueryEngine::new(&env.data_dir, &settings)
        .query("recipes", "recipe")
        .unwrap();

    let key = |r: &docvault::QueryResult| (r.id.numeric, r.text.clone(), r.score);
    assert_eq!(
        first.iter().map(key).collect::<Vec<_>>(),
        second.iter().map(key).collect::<Vec<_>>()
    );
    assert_eq!(
        env.config_db.get_collection("recipes").unwrap().unwrap().record_count,
        3
    );
}

#[test]
fn document_type_filter_only_returns_that_type() {
    let env = env();
    write_recipes(&env.source);
    image::RgbImage::new(4, 4)
        .save(env.source.join("recipe-card.png"))
        .unwrap();
    write(&env.source, "talk.json", br#"{"content": "recipe podcast"}"#);
    let settings = settings();
    build(&env, &settings, "mixed");

    let mut engine = QueryEngine::new(&env.data_dir, &settings);
    for kind in ["document", "image", "audio"] {
        let options = QueryOptions {
            k: 10,
            score_threshold: f32::MIN,
            document_type: Some(kind.to_string()),
            search_term: None,
        };
        let results = engine.query_with("mixed", "recipe", &options).unwrap();
        assert!(!results.is_empty(), "no {kind} results");
        assert!(results.iter().all(|r| r.metadata.document_type == kind));
    }
}

#[test]
fn large_k_returns_every_candidate() {
    let env = env();
    write_recipes(&env.source);
    let settings = settings();
    build(&env, &settings, "recipes");

    let mut engine = QueryEngine::new(&env.data_dir, &settings);
    let options = QueryOptions {
        k: 50,
        score_threshold: f32::MIN,
        document_type: None,
        search_term: None,
    };
    let results = engine.query_with("recipes", "anything", &options).unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn audit_trail_has_one_file_per_document() {
    let env = env();
    write_recipes(&env.source);
    write(&env.source, "copy.txt", b"apple pie recipe");
    let settings = settings();
    build(&env, &settings, "recipes");

    let audit: Vec<_> = std::fs::read_dir(env.data_dir.audit_dir("recipes"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(audit.len(), 3);
    assert!(audit.iter().all(|name| name.ends_with(".json")));
}

#[test]
fn long_documents_are_split_with_overlap() {
    let env = env();
    let sentence = "The quick brown fox jumps over the lazy dog. ";
    write(&env.source, "long.txt", sentence.repeat(40).as_bytes());
    let settings = Settings {
        chunk_size: 200,
        chunk_overlap: 50,
        ..settings()
    };
    build(&env, &settings, "long");

    let manifest = env.config_db.get_collection("long").unwrap().unwrap();
    assert_eq!(manifest.chunk_size, 200);
    assert!(manifest.record_count > 1800 / 200);

    let index = docvault::VectorIndex::open(
        &env.data_dir.index_file("long"),
        "long",
    )
    .unwrap();
    assert!(
        index
            .records()
            .iter()
            .all(|r| r.text.chars().count() <= 200)
    );
}
