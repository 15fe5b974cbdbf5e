use lopdf::Document;

/// Text of each page, in page order.
pub(super) fn extract_pages(bytes: &[u8]) -> Result<Vec<String>, String> {
    let doc = Document::load_mem(bytes).map_err(|e| format!("invalid PDF: {e}"))?;
    doc.get_pages()
        .keys()
        .map(|&page| {
            doc.extract_text(&[page])
                .map_err(|e| format!("page {page}: {e}"))
        })
        .collect()
}
