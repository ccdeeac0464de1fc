//! MIME type detection from decrypted bytes.

/// Fallback for unrecognised payloads.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Guess the MIME type of a media payload from its leading bytes.
pub fn sniff_mime(data: &[u8]) -> &'static str {
    match data {
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => "image/png",
        [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        [0x1A, 0x45, 0xDF, 0xA3, ..] => sniff_matroska(data),
        [_, _, _, _, b'f', b't', b'y', b'p', brand @ ..] if brand.len() >= 4 => {
            iso_brand_mime(&brand[..4])
        }
        _ => OCTET_STREAM,
    }
}

fn iso_brand_mime(brand: &[u8]) -> &'static str {
    match brand {
        b"heic" | b"heix" | b"hevc" | b"heim" | b"heis" => "image/heic",
        b"mif1" | b"msf1" => "image/heif",
        b"avif" | b"avis" => "image/avif",
        b"qt  " => "video/quicktime",
        b"M4A " | b"M4B " => "audio/mp4",
        _ => "video/mp4",
    }
}

/// WebM is Matroska with a `webm` doctype in the EBML header.
fn sniff_matroska(data: &[u8]) -> &'static str {
    let head = &data[..data.len().min(64)];
    if head.windows(4).any(|w| w == b"webm") {
        "video/webm"
    } else {
        "video/x-matroska"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_images() {
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]), "image/jpeg");
        assert_eq!(
            sniff_mime(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"),
            "image/png"
        );
        assert_eq!(sniff_mime(b"GIF89a...."), "image/gif");
        assert_eq!(sniff_mime(b"RIFF\x10\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(sniff_mime(b"\0\0\0\x18ftypheic\0\0\0\0"), "image/heic");
    }

    #[test]
    fn test_video() {
        assert_eq!(sniff_mime(b"\0\0\0\x20ftypisom\0\0\x02\0"), "video/mp4");
        assert_eq!(sniff_mime(b"\0\0\0\x14ftypqt  \0\0\0\0"), "video/quicktime");
        assert_eq!(
            sniff_mime(b"\x1a\x45\xdf\xa3\x9f\x42\x86\x81\x01\x42\x82\x84webm"),
            "video/webm"
        );
        assert_eq!(
            sniff_mime(b"\x1a\x45\xdf\xa3\x9f\x42\x82\x88matroska"),
            "video/x-matroska"
        );
    }

    #[test]
    fn test_fallback() {
        assert_eq!(sniff_mime(b""), OCTET_STREAM);
        assert_eq!(sniff_mime(b"plain text"), OCTET_STREAM);
        assert_eq!(sniff_mime(b"\0\0\0\x18ftyp"), OCTET_STREAM);
    }
}
