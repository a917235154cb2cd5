//! PDF text and image extraction
//!
//! Uses lopdf to read the text layer page by page and to collect the JPEG
//! (`DCTDecode`) image XObjects that scanned documents are made of.

use crate::errors::IngestionError;
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Form XObjects nested deeper than this are not searched for images
const MAX_FORM_DEPTH: usize = 3;

/// A parsed PDF
pub struct PdfFile {
    document: Document,
    file_name: String,
}

impl PdfFile {
    /// Parse a PDF from memory; unparseable input or zero pages is an error
    pub fn load(bytes: &[u8], file_name: &str) -> Result<Self, IngestionError> {
        let document = Document::load_mem(bytes).map_err(|e| IngestionError::PdfParse {
            file_name: file_name.to_string(),
            message: e.to_string(),
        })?;

        if document.get_pages().is_empty() {
            return Err(IngestionError::EmptyDocument {
                file_name: file_name.to_string(),
            });
        }

        Ok(Self {
            document,
            file_name: file_name.to_string(),
        })
    }

    pub fn page_count(&self) -> usize {
        self.document.get_pages().len()
    }

    /// Text of every page in page order; failing pages yield empty text
    pub fn page_texts(&self) -> Vec<String> {
        let pages = self.document.get_pages();
        debug!(file = %self.file_name, page_count = pages.len(), "Extracting text from PDF");

        pages
            .keys()
            .map(|&number| match self.document.extract_text(&[number]) {
                Ok(text) => text,
                Err(e) => {
                    warn!(file = %self.file_name, page = number, error = %e, "Failed to extract text from page");
                    String::new()
                }
            })
            .collect()
    }

    /// JPEG images per page, in page order, at most `limit` in total
    pub fn page_jpegs(&self, limit: usize) -> Vec<Vec<Vec<u8>>> {
        let mut remaining = limit;
        let mut result = Vec::new();

        for (number, page_id) in self.document.get_pages() {
            let mut images = Vec::new();
            if remaining > 0 {
                if let Some(resources) = self.page_resources(page_id) {
                    let mut seen = HashSet::new();
                    self.collect_jpegs(resources, 0, &mut seen, &mut images, remaining);
                }
            }
            remaining -= images.len();
            debug!(page = number, images = images.len(), "Collected page images");
            result.push(images);
        }

        result
    }

    /// Follow a reference to the object it points at
    fn resolve<'a>(&'a self, object: &'a Object) -> Option<&'a Object> {
        match object {
            Object::Reference(id) => self.document.get_object(*id).ok(),
            other => Some(other),
        }
    }

    fn resolve_dict<'a>(&'a self, object: &'a Object) -> Option<&'a Dictionary> {
        self.resolve(object).and_then(|o| o.as_dict().ok())
    }

    /// The page's Resources, inherited from ancestor Pages nodes if absent
    fn page_resources(&self, page_id: ObjectId) -> Option<&Dictionary> {
        let mut node = self.document.get_dictionary(page_id).ok()?;
        let mut visited = HashSet::new();

        loop {
            if let Ok(resources) = node.get(b"Resources") {
                return self.resolve_dict(resources);
            }
            let parent = node.get(b"Parent").ok()?.as_reference().ok()?;
            if !visited.insert(parent) {
                return None;
            }
            node = self.document.get_dictionary(parent).ok()?;
        }
    }

    fn collect_jpegs(
        &self,
        resources: &Dictionary,
        depth: usize,
        seen: &mut HashSet<ObjectId>,
        out: &mut Vec<Vec<u8>>,
        limit: usize,
    ) {
        let Some(xobjects) = resources.get(b"XObject").ok().and_then(|o| self.resolve_dict(o)) else {
            return;
        };

        for (_, entry) in xobjects.iter() {
            if out.len() >= limit {
                return;
            }
            if let Object::Reference(id) = entry {
                if !seen.insert(*id) {
                    continue;
                }
            }
            let Some(Object::Stream(stream)) = self.resolve(entry) else {
                continue;
            };

            match subtype(&stream.dict) {
                Some(b"Image") if is_plain_jpeg(&stream.dict) => out.push(stream.content.clone()),
                Some(b"Form") if depth < MAX_FORM_DEPTH => {
                    if let Some(nested) = stream
                        .dict
                        .get(b"Resources")
                        .ok()
                        .and_then(|o| self.resolve_dict(o))
                    {
                        self.collect_jpegs(nested, depth + 1, seen, out, limit);
                    }
                }
                _ => {}
            }
        }
    }
}

fn subtype(dict: &Dictionary) -> Option<&[u8]> {
    dict.get(b"Subtype").ok()?.as_name().ok()
}

/// Whether the stream holds a JPEG as-is: DCTDecode is its only filter.
/// Chains such as `[/FlateDecode /DCTDecode]` would need decoding first, so
/// pages made of them go to OCR as a whole PDF.
fn is_plain_jpeg(dict: &Dictionary) -> bool {
    match dict.get(b"Filter") {
        Ok(Object::Name(name)) => name.as_slice() == b"DCTDecode",
        Ok(Object::Array(filters)) => matches!(
            filters.as_slice(),
            [Object::Name(name)] if name.as_slice() == b"DCTDecode"
        ),
        _ => false,
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{build, Page, FAKE_JPEG};
    use super::*;

    #[test]
    fn test_rejects_garbage() {
        let err = PdfFile::load(b"not a pdf", "x.pdf").err().unwrap();
        assert!(matches!(err, IngestionError::PdfParse { .. }));
    }

    #[test]
    fn test_extracts_text_per_page() {
        let bytes = build(&[
            Page::Text(&["REGOLAMENTO DI CONDOMINIO", "Art. 1 Oggetto"]),
            Page::Blank,
            Page::Text(&["Le spese sono ripartite per millesimi."]),
        ]);
        let pdf = PdfFile::load(&bytes, "regolamento.pdf").unwrap();
        let pages = pdf.page_texts();

        assert_eq!(pdf.page_count(), 3);
        assert_eq!(pages.len(), 3);
        assert!(pages[0].contains("REGOLAMENTO DI CONDOMINIO"));
        assert!(pages[1].trim().is_empty());
        assert!(pages[2].contains("millesimi"));
    }

    #[test]
    fn test_collects_jpegs_per_page() {
        let bytes = build(&[Page::Jpeg, Page::Text(&["testo"]), Page::Jpeg]);
        let pdf = PdfFile::load(&bytes, "scan.pdf").unwrap();
        let images = pdf.page_jpegs(10);

        assert_eq!(images.len(), 3);
        assert_eq!(images[0], vec![FAKE_JPEG.to_vec()]);
        assert!(images[1].is_empty());
        assert_eq!(images[2].len(), 1);
    }

    #[test]
    fn test_image_limit() {
        let bytes = build(&[Page::Jpeg, Page::Jpeg, Page::Jpeg]);
        let pdf = PdfFile::load(&bytes, "scan.pdf").unwrap();
        let total: usize = pdf.page_jpegs(2).iter().map(Vec::len).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_plain_jpeg_filter_detection() {
        let mut dict = Dictionary::new();
        dict.set("Filter", Object::Name(b"DCTDecode".to_vec()));
        assert!(is_plain_jpeg(&dict));

        dict.set("Filter", Object::Array(vec![Object::Name(b"DCTDecode".to_vec())]));
        assert!(is_plain_jpeg(&dict));

        dict.set(
            "Filter",
            Object::Array(vec![
                Object::Name(b"FlateDecode".to_vec()),
                Object::Name(b"DCTDecode".to_vec()),
            ]),
        );
        assert!(!is_plain_jpeg(&dict));

        dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
        assert!(!is_plain_jpeg(&dict));
    }

    #[test]
    fn test_chained_filter_images_are_skipped() {
        let bytes = build(&[Page::Jpeg, Page::FlateJpeg]);
        let pdf = PdfFile::load(&bytes, "scan.pdf").unwrap();
        let images = pdf.page_jpegs(10);

        assert_eq!(images[0], vec![FAKE_JPEG.to_vec()]);
        assert!(images[1].is_empty());
        for image in images.iter().flatten() {
            assert!(image.starts_with(&[0xFF, 0xD8]));
        }
    }
}
