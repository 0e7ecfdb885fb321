//! MIME type lookup by file extension

const MIME_TABLE: &[(&str, &str)] = &[
    ("html", "text/html; charset=utf-8"),
    ("htm", "text/html; charset=utf-8"),
    ("css", "text/css; charset=utf-8"),
    ("js", "application/javascript"),
    ("mjs", "application/javascript"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("txt", "text/plain; charset=utf-8"),
    ("md", "text/plain; charset=utf-8"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("ico", "image/x-icon"),
    ("wasm", "application/wasm"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("mp3", "audio/mpeg"),
    ("ogg", "audio/ogg"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
    ("otf", "font/otf"),
];

/// Content type for a file extension; `application/octet-stream` when the
/// extension is unknown or absent.
pub fn by_extension(ext: Option<&str>) -> &'static str {
    let Some(ext) = ext else {
        return "application/octet-stream";
    };
    MIME_TABLE
        .iter()
        .find(|(e, _)| e.eq_ignore_ascii_case(ext))
        .map(|(_, t)| *t)
        .unwrap_or("application/octet-stream")
}

#[cfg(test)]
mod test {
    use super::by_extension;

    #[test]
    fn known_extensions_map_case_insensitively() {
        assert_eq!("text/html; charset=utf-8", by_extension(Some("html")));
        assert_eq!("text/html; charset=utf-8", by_extension(Some("HTML")));
        assert_eq!("image/png", by_extension(Some("png")));
    }

    #[test]
    fn unknown_extension_falls_back_to_octet_stream() {
        assert_eq!("application/octet-stream", by_extension(Some("xyz")));
        assert_eq!("application/octet-stream", by_extension(None));
    }
}
