//! Content-based MIME detection. Client-supplied filenames and content
//! types are untrusted; the magic bytes decide, with `mime_guess` on the
//! extension only as a fallback for unrecognized payloads.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniffedType {
    pub mime_type: &'static str,
    pub extension: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

const SIGNATURES: &[(&[u8], &str, &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png", "png"),
    (b"\xff\xd8\xff", "image/jpeg", "jpg"),
    (b"GIF87a", "image/gif", "gif"),
    (b"GIF89a", "image/gif", "gif"),
    (b"BM", "image/bmp", "bmp"),
    (b"%PDF", "application/pdf", "pdf"),
    (b"PK\x03\x04", "application/zip", "zip"),
    (b"\x1f\x8b", "application/gzip", "gz"),
    (b"7z\xbc\xaf\x27\x1c", "application/x-7z-compressed", "7z"),
    (b"Rar!\x1a\x07", "application/vnd.rar", "rar"),
    (b"OggS", "audio/ogg", "ogg"),
    (b"fLaC", "audio/flac", "flac"),
    (b"ID3", "audio/mpeg", "mp3"),
];

pub fn detect(bytes: &[u8]) -> Option<SniffedType> {
    for (magic, mime_type, extension) in SIGNATURES {
        if bytes.starts_with(magic) {
            return Some(SniffedType {
                mime_type,
                extension,
            });
        }
    }
    // RIFF container: WEBP or WAV, discriminated at offset 8
    if bytes.len() >= 12 && bytes.starts_with(b"RIFF") {
        if &bytes[8..12] == b"WEBP" {
            return Some(SniffedType {
                mime_type: "image/webp",
                extension: "webp",
            });
        }
        if &bytes[8..12] == b"WAVE" {
            return Some(SniffedType {
                mime_type: "audio/wav",
                extension: "wav",
            });
        }
    }
    // ISO base media: ftyp box at offset 4
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return Some(SniffedType {
            mime_type: "video/mp4",
            extension: "mp4",
        });
    }
    None
}

/// Resolves the stored MIME type and extension for an upload. The sniffed
/// type wins; the filename is consulted only when the content is not
/// recognized.
pub fn resolve(bytes: &[u8], file_name: &str) -> (String, String) {
    if let Some(sniffed) = detect(bytes) {
        return (sniffed.mime_type.to_string(), sniffed.extension.to_string());
    }
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let mime_type = mime_guess::from_ext(&extension)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string();
    (mime_type, extension)
}

/// Pixel dimensions for the formats the thumbnail pipeline handles.
pub fn dimensions(bytes: &[u8]) -> Option<Dimensions> {
    match detect(bytes)?.mime_type {
        "image/png" => png_dimensions(bytes),
        "image/gif" => gif_dimensions(bytes),
        "image/jpeg" => jpeg_dimensions(bytes),
        _ => None,
    }
}

fn png_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    // IHDR is always the first chunk: width and height at offsets 16/20
    if bytes.len() < 24 || &bytes[12..16] != b"IHDR" {
        return None;
    }
    Some(Dimensions {
        width: u32::from_be_bytes(bytes[16..20].try_into().ok()?),
        height: u32::from_be_bytes(bytes[20..24].try_into().ok()?),
    })
}

fn gif_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    if bytes.len() < 10 {
        return None;
    }
    Some(Dimensions {
        width: u16::from_le_bytes(bytes[6..8].try_into().ok()?) as u32,
        height: u16::from_le_bytes(bytes[8..10].try_into().ok()?) as u32,
    })
}

fn jpeg_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    // walk the segment list until a start-of-frame marker
    let mut i = 2;
    while i + 9 < bytes.len() {
        if bytes[i] != 0xff {
            return None;
        }
        let marker = bytes[i + 1];
        let is_sof = (0xc0..=0xcf).contains(&marker) && ![0xc4, 0xc8, 0xcc].contains(&marker);
        let len = u16::from_be_bytes([bytes[i + 2], bytes[i + 3]]) as usize;
        if is_sof {
            return Some(Dimensions {
                height: u16::from_be_bytes([bytes[i + 5], bytes[i + 6]]) as u32,
                width: u16::from_be_bytes([bytes[i + 7], bytes[i + 8]]) as u32,
            });
        }
        i += 2 + len;
    }
    None
}
