//! Decides whether extracted text is good enough to skip OCR

/// Measurements of a document's text layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextQuality {
    /// Average non-whitespace characters per page
    pub chars_per_page: f64,
    /// Share of non-whitespace characters that are unreadable
    pub garbage_ratio: f64,
}

/// Thresholds the text layer must meet
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub min_chars_per_page: usize,
    pub max_garbage_ratio: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_chars_per_page: 50,
            max_garbage_ratio: 0.1,
        }
    }
}

impl TextQuality {
    /// Measure per-page text
    pub fn measure<S: AsRef<str>>(pages: &[S]) -> Self {
        let mut visible = 0usize;
        let mut garbage = 0usize;

        for page in pages {
            for c in page.as_ref().chars().filter(|c| !c.is_whitespace()) {
                visible += 1;
                if is_garbage(c) {
                    garbage += 1;
                }
            }
        }

        let page_count = pages.len().max(1);
        Self {
            chars_per_page: visible as f64 / page_count as f64,
            garbage_ratio: if visible == 0 {
                0.0
            } else {
                garbage as f64 / visible as f64
            },
        }
    }

    pub fn is_sufficient(&self, thresholds: &Thresholds) -> bool {
        self.chars_per_page >= thresholds.min_chars_per_page as f64
            && self.garbage_ratio <= thresholds.max_garbage_ratio
    }
}

/// Replacement characters, control characters and private-use code points
fn is_garbage(c: char) -> bool {
    c == '\u{FFFD}'
        || c.is_control()
        || matches!(c, '\u{E000}'..='\u{F8FF}' | '\u{F0000}'..='\u{FFFFD}' | '\u{100000}'..='\u{10FFFD}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_text_is_sufficient() {
        let page = "Art. 5 - Le spese di manutenzione ordinaria sono ripartite in base ai millesimi.";
        let quality = TextQuality::measure(&[page, page]);
        assert!(quality.chars_per_page >= 50.0);
        assert_eq!(quality.garbage_ratio, 0.0);
        assert!(quality.is_sufficient(&Thresholds::default()));
    }

    #[test]
    fn test_sparse_text_is_insufficient() {
        // A scanned document often has only a page number in its text layer
        let quality = TextQuality::measure(&["1", "2", "3"]);
        assert!(!quality.is_sufficient(&Thresholds::default()));
    }

    #[test]
    fn test_empty_document() {
        let quality = TextQuality::measure::<&str>(&[]);
        assert_eq!(quality.chars_per_page, 0.0);
        assert!(!quality.is_sufficient(&Thresholds::default()));
    }

    #[test]
    fn test_garbage_text_is_insufficient() {
        let page = format!("{}{}", "\u{FFFD}".repeat(40), "abcdefghij".repeat(4));
        let quality = TextQuality::measure(&[page]);
        assert!((quality.garbage_ratio - 0.5).abs() < 1e-9);
        assert!(!quality.is_sufficient(&Thresholds::default()));
    }

    #[test]
    fn test_private_use_counts_as_garbage() {
        assert!(is_garbage('\u{E012}'));
        assert!(is_garbage('\u{0007}'));
        assert!(!is_garbage('è'));
        assert!(!is_garbage('€'));
    }
}
