//! Minimal response encoding helper applying response defaults.

use sweb_common::config::ResponseConfig;

/// Encodes one complete response with the configured charset.
///
/// Text content types get the charset parameter appended; everything else is emitted as-is.
/// Compression is left to handler collaborators even when `config.gzip` is set.
#[must_use]
pub fn encode_response(
    status: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
    config: &ResponseConfig,
) -> Vec<u8> {
    let content_type_line = if content_type.starts_with("text/") {
        format!("{content_type}; charset={}", config.charset)
    } else {
        content_type.to_string()
    };
    let mut encoded = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type_line}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    encoded.extend_from_slice(body);
    encoded
}

#[cfg(test)]
mod tests {
    use super::encode_response;
    use googletest::prelude::*;
    use rstest::rstest;
    use sweb_common::config::ResponseConfig;

    #[rstest]
    fn encode_appends_charset_for_text_content() {
        let encoded = encode_response(200, "OK", "text/plain", b"hi", &ResponseConfig::default());
        let text = String::from_utf8(encoded).expect("response head must be UTF-8");

        assert_that!(
            text.as_str(),
            eq("HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=UTF-8\r\nContent-Length: 2\r\n\r\nhi")
        );
    }

    #[rstest]
    fn encode_leaves_binary_content_types_untouched() {
        let encoded = encode_response(
            204,
            "No Content",
            "application/octet-stream",
            b"",
            &ResponseConfig::default(),
        );
        let text = String::from_utf8(encoded).expect("response head must be UTF-8");

        assert_that!(
            text.contains("Content-Type: application/octet-stream\r\n"),
            eq(true)
        );
        assert_that!(text.contains("charset"), eq(false));
    }
}
