//! `multipart/form-data` body decomposition (RFC 7578).

use std::collections::HashMap;

use bytes::Bytes;

/// An uploaded file taken from a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub filename: String,
    pub content_type: Option<String>,
    pub content: Bytes,
}

/// The parts of a multipart body, split into file uploads (parts carrying a
/// `filename`) and plain form fields.
#[derive(Debug, Clone, Default)]
pub struct Multipart {
    pub files: HashMap<String, FilePart>,
    pub fields: HashMap<String, String>,
}

/// Returns `true` if the `Content-Type` value denotes `multipart/form-data`.
pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim_start()
        .get(..19)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("multipart/form-data"))
}

/// Extracts the `boundary` parameter from a `Content-Type` value.
///
/// Returns `None` when the parameter is absent or empty.
pub fn boundary(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then_some(value)
    })
}

/// Splits `body` into named parts using `boundary`.
///
/// Parts without a `Content-Disposition` name are skipped; a body that is
/// truncated before the closing delimiter yields whatever parts were complete.
pub fn parse(body: &[u8], boundary: &str) -> Multipart {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let mut out = Multipart::default();

    let Some(mut cursor) = find(body, delimiter, 0) else {
        return out;
    };

    loop {
        let part_start = cursor + delimiter.len();
        if body[part_start..].starts_with(b"--") {
            break; // closing delimiter
        }
        let Some(next) = find(body, delimiter, part_start) else {
            break;
        };

        let segment = &body[part_start..next];
        let segment = segment.strip_prefix(b"\r\n").unwrap_or(segment);
        let segment = segment.strip_suffix(b"\r\n").unwrap_or(segment);
        add_part(&mut out, segment);

        cursor = next;
    }

    out
}

fn add_part(out: &mut Multipart, segment: &[u8]) {
    let Some(header_end) = find(segment, b"\r\n\r\n", 0) else {
        return;
    };
    let Ok(head) = std::str::from_utf8(&segment[..header_end]) else {
        return;
    };
    let content = &segment[header_end + 4..];

    let mut name = None;
    let mut filename = None;
    let mut content_type = None;

    for line in head.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("content-disposition") {
            for param in value.split(';').skip(1) {
                if let Some((k, v)) = param.trim().split_once('=') {
                    let v = v.trim().trim_matches('"').to_owned();
                    match k.trim() {
                        "name" => name = Some(v),
                        "filename" => filename = Some(v),
                        _ => {}
                    }
                }
            }
        } else if key.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.trim().to_owned());
        }
    }

    let Some(name) = name else {
        return;
    };

    match filename {
        Some(filename) => {
            out.files.insert(
                name,
                FilePart {
                    filename,
                    content_type,
                    content: Bytes::copy_from_slice(content),
                },
            );
        }
        None => {
            out.fields
                .insert(name, String::from_utf8_lossy(content).into_owned());
        }
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}
