//! Format-aware provenance embedding.
//!
//! PNG files get `iTXt` chunks right after `IHDR`, JPEG files get a `COM`
//! segment after the leading `APPn` segments and WebP files get an `EXIF`
//! chunk whose `UserComment` holds the record. Nothing else in the container
//! is touched, so the compressed pixel data stays byte-identical. Formats
//! without a supported text facility are validated and left alone; the
//! caller stores the record in a sidecar file instead.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SaveError, SaveResult};
use crate::provenance::ProvenanceRecord;

/// Keyword of the PNG chunk, prefix of the JPEG comment and of the WebP
/// `UserComment` holding the record.
pub const PROVENANCE_KEYWORD: &str = "smart-save";
/// Keyword of the human-readable PNG parameters chunk.
pub const PARAMETERS_KEYWORD: &str = "parameters";
/// Appended to the image path to name its sidecar record.
pub const SIDECAR_SUFFIX: &str = ".provenance.json";
/// Largest payload a single JPEG segment can hold.
pub const JPEG_SEGMENT_LIMIT: usize = 65533;
/// Largest PNG chunk data length allowed by the format.
pub const PNG_CHUNK_LIMIT: usize = 0x7fff_ffff;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_SOI: u8 = 0xD8;
const JPEG_EOI: u8 = 0xD9;
const JPEG_SOS: u8 = 0xDA;
const JPEG_COM: u8 = 0xFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
    Bmp,
    Tiff,
}

impl ImageFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Tiff => "tiff",
        }
    }

    /// Accepted file extensions, canonical one first.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            ImageFormat::Png => &["png"],
            ImageFormat::Jpeg => &["jpg", "jpeg"],
            ImageFormat::Webp => &["webp"],
            ImageFormat::Bmp => &["bmp"],
            ImageFormat::Tiff => &["tiff", "tif"],
        }
    }

    pub fn extension(&self) -> &'static str {
        self.extensions()[0]
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        [
            ImageFormat::Png,
            ImageFormat::Jpeg,
            ImageFormat::Webp,
            ImageFormat::Bmp,
            ImageFormat::Tiff,
        ]
        .into_iter()
        .find(|f| f.extensions().contains(&ext.as_str()))
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    /// Whether provenance can live inside the file itself.
    pub fn embeds_natively(&self) -> bool {
        matches!(self, ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::Webp)
    }
}

impl FromStr for ImageFormat {
    type Err = SaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s.trim_start_matches('.'))
            .ok_or_else(|| SaveError::codec(s, "unrecognized image format"))
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the provenance record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataPlacement {
    Embedded,
    /// The format has no supported facility; the record goes to
    /// `<file>.provenance.json`.
    Sidecar,
}

#[derive(Debug, Clone)]
pub struct Embedded {
    pub bytes: Vec<u8>,
    pub placement: MetadataPlacement,
}

/// Path of the sidecar record for an image.
pub fn sidecar_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

#[derive(Debug, Clone)]
pub struct MetadataCodec {
    parameters_text: bool,
}

impl Default for MetadataCodec {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MetadataCodec {
    /// `parameters_text` adds a human-readable PNG `parameters` chunk next to
    /// the record.
    pub fn new(parameters_text: bool) -> Self {
        Self { parameters_text }
    }

    pub fn embed(
        &self,
        bytes: &[u8],
        format: ImageFormat,
        record: &ProvenanceRecord,
    ) -> SaveResult<Embedded> {
        match format {
            ImageFormat::Png => {
                let mut chunks = vec![(PROVENANCE_KEYWORD, record.as_str().to_string())];
                if self.parameters_text {
                    // The record is our own JSON; a record that does not parse
                    // simply gets no parameters chunk.
                    if let Ok(context) = record.to_context() {
                        let text = context.parameters_text();
                        if !text.is_empty() {
                            chunks.push((PARAMETERS_KEYWORD, text));
                        }
                    }
                }
                let bytes = png::embed(bytes, &chunks)?;
                Ok(Embedded {
                    bytes,
                    placement: MetadataPlacement::Embedded,
                })
            }
            ImageFormat::Jpeg => Ok(Embedded {
                bytes: jpeg::embed(bytes, record.as_bytes())?,
                placement: MetadataPlacement::Embedded,
            }),
            ImageFormat::Webp => Ok(Embedded {
                bytes: webp::embed(bytes, record.as_str())?,
                placement: MetadataPlacement::Embedded,
            }),
            ImageFormat::Bmp | ImageFormat::Tiff => {
                check_magic(bytes, format)?;
                debug!(format = %format, "format has no embedded text support, using sidecar");
                Ok(Embedded {
                    bytes: bytes.to_vec(),
                    placement: MetadataPlacement::Sidecar,
                })
            }
        }
    }

    /// Returns the embedded record, or `None` if the file carries none. Always
    /// `None` for sidecar formats.
    pub fn extract(&self, bytes: &[u8], format: ImageFormat) -> SaveResult<Option<ProvenanceRecord>> {
        match format {
            ImageFormat::Png => png::extract(bytes, PROVENANCE_KEYWORD),
            ImageFormat::Jpeg => jpeg::extract(bytes),
            ImageFormat::Webp => webp::extract(bytes),
            ImageFormat::Bmp | ImageFormat::Tiff => {
                check_magic(bytes, format)?;
                Ok(None)
            }
        }
    }

    /// Reads the record of a saved file, from the file itself or its sidecar.
    pub fn read_provenance(&self, path: &Path) -> SaveResult<Option<ProvenanceRecord>> {
        let format = ImageFormat::from_path(path).ok_or_else(|| {
            SaveError::codec(path.display(), "cannot tell the image format from the extension")
        })?;
        if format.embeds_natively() {
            let bytes = std::fs::read(path).map_err(|e| SaveError::read(path, e))?;
            return self.extract(&bytes, format);
        }

        let sidecar = sidecar_path(path);
        match std::fs::read_to_string(&sidecar) {
            Ok(text) => Ok(Some(ProvenanceRecord::from_text(text))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SaveError::read(sidecar, e)),
        }
    }

    /// The compressed image data: PNG `IDAT` contents, JPEG scan data or the
    /// WebP bitstream chunks. Embedding never changes it.
    pub fn pixel_payload(bytes: &[u8], format: ImageFormat) -> SaveResult<Vec<u8>> {
        match format {
            ImageFormat::Png => png::pixel_payload(bytes),
            ImageFormat::Jpeg => jpeg::pixel_payload(bytes),
            ImageFormat::Webp => webp::pixel_payload(bytes),
            ImageFormat::Bmp | ImageFormat::Tiff => {
                check_magic(bytes, format)?;
                Ok(bytes.to_vec())
            }
        }
    }
}

fn check_magic(bytes: &[u8], format: ImageFormat) -> SaveResult<()> {
    let ok = match format {
        ImageFormat::Png => bytes.starts_with(&PNG_SIGNATURE),
        ImageFormat::Jpeg => bytes.starts_with(&[0xFF, JPEG_SOI]),
        ImageFormat::Webp => bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP",
        ImageFormat::Bmp => bytes.starts_with(b"BM"),
        ImageFormat::Tiff => bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*"),
    };
    if ok {
        Ok(())
    } else {
        Err(SaveError::codec(format, "payload does not start with the format signature"))
    }
}

mod png {
    use super::*;

    pub(super) struct Chunk<'a> {
        pub kind: [u8; 4],
        pub data: &'a [u8],
        /// Length, type, data and CRC exactly as in the file.
        pub raw: &'a [u8],
    }

    /// Splits a PNG into chunks, checking lengths and CRCs. Returns the chunks
    /// up to and including `IEND` and whatever trails it.
    pub(super) fn chunks(bytes: &[u8]) -> SaveResult<(Vec<Chunk<'_>>, &[u8])> {
        let fmt = ImageFormat::Png;
        check_magic(bytes, fmt)?;

        let mut chunks = Vec::new();
        let mut pos = PNG_SIGNATURE.len();
        loop {
            if bytes.len() < pos + 12 {
                return Err(SaveError::codec(fmt, "truncated chunk header"));
            }
            let len = u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
                as usize;
            if len > PNG_CHUNK_LIMIT {
                return Err(SaveError::codec(fmt, "chunk length out of range"));
            }
            let end = pos + 12 + len;
            if bytes.len() < end {
                return Err(SaveError::codec(fmt, "truncated chunk"));
            }
            let kind = [bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]];
            let crc = u32::from_be_bytes([bytes[end - 4], bytes[end - 3], bytes[end - 2], bytes[end - 1]]);
            if crc32fast::hash(&bytes[pos + 4..end - 4]) != crc {
                return Err(SaveError::codec(
                    fmt,
                    format!("CRC mismatch in {} chunk", String::from_utf8_lossy(&kind)),
                ));
            }
            chunks.push(Chunk {
                kind,
                data: &bytes[pos + 8..end - 4],
                raw: &bytes[pos..end],
            });
            pos = end;
            if &kind == b"IEND" {
                break;
            }
        }

        if &chunks[0].kind != b"IHDR" {
            return Err(SaveError::codec(fmt, "first chunk is not IHDR"));
        }
        Ok((chunks, &bytes[pos..]))
    }

    pub(super) fn text_chunk(keyword: &str, text: &str) -> SaveResult<Vec<u8>> {
        // keyword, NUL, compression flag, compression method,
        // empty language tag + NUL, empty translated keyword + NUL, text
        let mut data = Vec::with_capacity(keyword.len() + text.len() + 5);
        data.extend_from_slice(keyword.as_bytes());
        data.extend_from_slice(&[0, 0, 0, 0, 0]);
        data.extend_from_slice(text.as_bytes());
        if data.len() > PNG_CHUNK_LIMIT {
            return Err(SaveError::codec(
                ImageFormat::Png,
                format!("'{}' text exceeds the chunk size limit", keyword),
            ));
        }

        let mut chunk = Vec::with_capacity(data.len() + 12);
        chunk.extend_from_slice(&(data.len() as u32).to_be_bytes());
        chunk.extend_from_slice(b"iTXt");
        chunk.extend_from_slice(&data);
        let crc = crc32fast::hash(&chunk[4..]);
        chunk.extend_from_slice(&crc.to_be_bytes());
        Ok(chunk)
    }

    /// Keyword and text of an uncompressed `iTXt` or a `tEXt` chunk.
    fn text_of<'a>(chunk: &Chunk<'a>) -> Option<(&'a [u8], &'a [u8])> {
        let nul = chunk.data.iter().position(|b| *b == 0)?;
        let (keyword, rest) = (&chunk.data[..nul], &chunk.data[nul + 1..]);
        match &chunk.kind {
            b"tEXt" => Some((keyword, rest)),
            b"iTXt" => {
                if rest.len() < 2 || rest[0] != 0 {
                    return None;
                }
                let rest = &rest[2..];
                let lang_end = rest.iter().position(|b| *b == 0)?;
                let rest = &rest[lang_end + 1..];
                let translated_end = rest.iter().position(|b| *b == 0)?;
                Some((keyword, &rest[translated_end + 1..]))
            }
            _ => None,
        }
    }

    fn is_ours(chunk: &Chunk<'_>) -> bool {
        matches!(
            text_of(chunk),
            Some((keyword, _)) if keyword == PROVENANCE_KEYWORD.as_bytes()
                || keyword == PARAMETERS_KEYWORD.as_bytes()
        )
    }

    pub(super) fn embed(bytes: &[u8], texts: &[(&str, String)]) -> SaveResult<Vec<u8>> {
        let (chunks, trailing) = chunks(bytes)?;
        let mut new_chunks = Vec::with_capacity(texts.len());
        for (keyword, text) in texts {
            new_chunks.push(text_chunk(keyword, text)?);
        }

        let extra: usize = new_chunks.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(bytes.len() + extra);
        out.extend_from_slice(&PNG_SIGNATURE);
        for chunk in &chunks {
            if is_ours(chunk) {
                continue;
            }
            out.extend_from_slice(chunk.raw);
            if &chunk.kind == b"IHDR" {
                for new_chunk in &new_chunks {
                    out.extend_from_slice(new_chunk);
                }
            }
        }
        out.extend_from_slice(trailing);
        Ok(out)
    }

    pub(super) fn extract(bytes: &[u8], keyword: &str) -> SaveResult<Option<ProvenanceRecord>> {
        let (chunks, _) = chunks(bytes)?;
        for chunk in &chunks {
            if let Some((k, text)) = text_of(chunk) {
                if k == keyword.as_bytes() {
                    let text = std::str::from_utf8(text).map_err(|_| {
                        SaveError::codec(ImageFormat::Png, "provenance text is not valid UTF-8")
                    })?;
                    return Ok(Some(ProvenanceRecord::from_text(text)));
                }
            }
        }
        Ok(None)
    }

    pub(super) fn pixel_payload(bytes: &[u8]) -> SaveResult<Vec<u8>> {
        let (chunks, _) = chunks(bytes)?;
        Ok(chunks
            .iter()
            .filter(|c| &c.kind == b"IDAT")
            .flat_map(|c| c.data.iter().copied())
            .collect())
    }
}

mod jpeg {
    use super::*;

    pub(super) struct Segment {
        pub marker: u8,
        pub start: usize,
        pub end: usize,
    }

    pub(super) struct Layout {
        pub segments: Vec<Segment>,
        /// Offset of the SOS marker; everything from here on is scan data.
        pub scan_start: usize,
    }

    /// Walks the marker segments up to the first SOS.
    pub(super) fn layout(bytes: &[u8]) -> SaveResult<Layout> {
        let fmt = ImageFormat::Jpeg;
        check_magic(bytes, fmt)?;

        let mut segments = Vec::new();
        let mut pos = 2;
        loop {
            if pos + 1 >= bytes.len() {
                return Err(SaveError::codec(fmt, "no scan data before end of file"));
            }
            if bytes[pos] != 0xFF {
                return Err(SaveError::codec(fmt, format!("expected marker at offset {}", pos)));
            }
            // fill bytes
            if bytes[pos + 1] == 0xFF {
                pos += 1;
                continue;
            }
            let marker = bytes[pos + 1];
            match marker {
                JPEG_SOS => {
                    return Ok(Layout {
                        segments,
                        scan_start: pos,
                    })
                }
                JPEG_EOI => return Err(SaveError::codec(fmt, "image ends before any scan")),
                0x01 | 0xD0..=0xD7 => {
                    segments.push(Segment {
                        marker,
                        start: pos,
                        end: pos + 2,
                    });
                    pos += 2;
                }
                _ => {
                    if pos + 4 > bytes.len() {
                        return Err(SaveError::codec(fmt, "truncated segment header"));
                    }
                    let len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
                    if len < 2 || pos + 2 + len > bytes.len() {
                        return Err(SaveError::codec(fmt, "segment length out of range"));
                    }
                    segments.push(Segment {
                        marker,
                        start: pos,
                        end: pos + 2 + len,
                    });
                    pos += 2 + len;
                }
            }
        }
    }

    fn comment_prefix() -> Vec<u8> {
        let mut prefix = PROVENANCE_KEYWORD.as_bytes().to_vec();
        prefix.push(0);
        prefix
    }

    fn our_comment<'a>(bytes: &'a [u8], segment: &Segment) -> Option<&'a [u8]> {
        if segment.marker != JPEG_COM {
            return None;
        }
        let payload = &bytes[segment.start + 4..segment.end];
        payload.strip_prefix(comment_prefix().as_slice())
    }

    pub(super) fn embed(bytes: &[u8], record: &[u8]) -> SaveResult<Vec<u8>> {
        let layout = layout(bytes)?;

        let mut payload = comment_prefix();
        payload.extend_from_slice(record);
        if payload.len() > JPEG_SEGMENT_LIMIT {
            return Err(SaveError::codec(
                ImageFormat::Jpeg,
                format!(
                    "provenance record of {} bytes exceeds the {} byte comment limit",
                    record.len(),
                    JPEG_SEGMENT_LIMIT - comment_prefix().len()
                ),
            ));
        }
        let mut comment = vec![0xFF, JPEG_COM];
        comment.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
        comment.extend_from_slice(&payload);

        let mut out = Vec::with_capacity(bytes.len() + comment.len());
        out.extend_from_slice(&[0xFF, JPEG_SOI]);
        let mut inserted = false;
        for segment in &layout.segments {
            if our_comment(bytes, segment).is_some() {
                continue;
            }
            let is_app = (0xE0..=0xEF).contains(&segment.marker);
            if !inserted && !is_app {
                out.extend_from_slice(&comment);
                inserted = true;
            }
            out.extend_from_slice(&bytes[segment.start..segment.end]);
        }
        if !inserted {
            out.extend_from_slice(&comment);
        }
        out.extend_from_slice(&bytes[layout.scan_start..]);
        Ok(out)
    }

    pub(super) fn extract(bytes: &[u8]) -> SaveResult<Option<ProvenanceRecord>> {
        let layout = layout(bytes)?;
        for segment in &layout.segments {
            if let Some(text) = our_comment(bytes, segment) {
                let text = std::str::from_utf8(text).map_err(|_| {
                    SaveError::codec(ImageFormat::Jpeg, "provenance text is not valid UTF-8")
                })?;
                return Ok(Some(ProvenanceRecord::from_text(text)));
            }
        }
        Ok(None)
    }

    pub(super) fn pixel_payload(bytes: &[u8]) -> SaveResult<Vec<u8>> {
        let layout = layout(bytes)?;
        Ok(bytes[layout.scan_start..].to_vec())
    }
}

mod webp {
    use super::*;

    const VP8X: &[u8; 4] = b"VP8X";
    const EXIF: &[u8; 4] = b"EXIF";
    const XMP: &[u8; 4] = b"XMP ";
    const VP8X_ALPHA: u8 = 0x10;
    const VP8X_EXIF: u8 = 0x08;
    /// Chunks holding the compressed image itself.
    const BITSTREAM: [&[u8; 4]; 4] = [b"VP8 ", b"VP8L", b"ALPH", b"ANMF"];

    const EXIF_IFD_POINTER: u16 = 0x8769;
    const USER_COMMENT: u16 = 0x9286;
    const TYPE_LONG: u16 = 4;
    const TYPE_UNDEFINED: u16 = 7;
    const UNICODE: &[u8; 8] = b"UNICODE\0";
    const ASCII: &[u8; 8] = b"ASCII\0\0\0";

    pub(super) struct Chunk<'a> {
        pub fourcc: [u8; 4],
        pub data: &'a [u8],
    }

    /// Splits the RIFF body into chunks. Returns the chunks and any bytes
    /// after the RIFF payload.
    pub(super) fn chunks(bytes: &[u8]) -> SaveResult<(Vec<Chunk<'_>>, &[u8])> {
        let fmt = ImageFormat::Webp;
        check_magic(bytes, fmt)?;

        let riff_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let end = riff_len
            .checked_add(8)
            .filter(|end| riff_len >= 4 && *end <= bytes.len())
            .ok_or_else(|| SaveError::codec(fmt, "RIFF size out of range"))?;

        let mut chunks = Vec::new();
        let mut pos = 12;
        while pos < end {
            if pos + 8 > end {
                return Err(SaveError::codec(fmt, "truncated chunk header"));
            }
            let fourcc = [bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]];
            let len = u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]])
                as usize;
            let data_end = pos + 8 + len;
            if data_end > end {
                return Err(SaveError::codec(
                    fmt,
                    format!("truncated {} chunk", String::from_utf8_lossy(&fourcc)),
                ));
            }
            chunks.push(Chunk {
                fourcc,
                data: &bytes[pos + 8..data_end],
            });
            // odd-sized chunks are followed by one pad byte
            pos = data_end + (len & 1);
        }

        if !chunks.iter().any(|c| BITSTREAM.contains(&&c.fourcc)) {
            return Err(SaveError::codec(fmt, "no image data"));
        }
        Ok((chunks, &bytes[end..]))
    }

    fn push_chunk(out: &mut Vec<u8>, fourcc: &[u8; 4], data: &[u8]) {
        out.extend_from_slice(fourcc);
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(0);
        }
    }

    /// Canvas width, height and alpha hint from a simple-format bitstream.
    fn canvas(chunk: &Chunk<'_>) -> SaveResult<(u32, u32, bool)> {
        let fmt = ImageFormat::Webp;
        let data = chunk.data;
        match &chunk.fourcc {
            b"VP8 " => {
                if data.len() < 10 || data[3..6] != [0x9d, 0x01, 0x2a] {
                    return Err(SaveError::codec(fmt, "VP8 chunk without a key frame header"));
                }
                let width = u16::from_le_bytes([data[6], data[7]]) & 0x3fff;
                let height = u16::from_le_bytes([data[8], data[9]]) & 0x3fff;
                Ok((u32::from(width), u32::from(height), false))
            }
            b"VP8L" => {
                if data.len() < 5 || data[0] != 0x2f {
                    return Err(SaveError::codec(fmt, "VP8L chunk without a signature"));
                }
                let bits = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                let width = (bits & 0x3fff) + 1;
                let height = ((bits >> 14) & 0x3fff) + 1;
                Ok((width, height, (bits >> 28) & 1 == 1))
            }
            other => Err(SaveError::codec(
                fmt,
                format!("unexpected first chunk {}", String::from_utf8_lossy(other)),
            )),
        }
    }

    fn extended_header(first: &Chunk<'_>) -> SaveResult<Vec<u8>> {
        if &first.fourcc == VP8X {
            if first.data.len() < 10 {
                return Err(SaveError::codec(ImageFormat::Webp, "VP8X chunk too short"));
            }
            let mut header = first.data.to_vec();
            header[0] |= VP8X_EXIF;
            return Ok(header);
        }

        let (width, height, alpha) = canvas(first)?;
        if width == 0 || height == 0 {
            return Err(SaveError::codec(ImageFormat::Webp, "zero canvas size"));
        }
        let mut header = vec![0u8; 10];
        header[0] = VP8X_EXIF | if alpha { VP8X_ALPHA } else { 0 };
        header[4..7].copy_from_slice(&(width - 1).to_le_bytes()[..3]);
        header[7..10].copy_from_slice(&(height - 1).to_le_bytes()[..3]);
        Ok(header)
    }

    /// A big-endian TIFF structure with one `UserComment` tag in the Exif
    /// sub-IFD. The comment is `smart-save\0<record>` in UTF-16BE.
    pub(super) fn exif_block(record: &str) -> Vec<u8> {
        let text = format!("{}\0{}", PROVENANCE_KEYWORD, record);
        let mut comment = UNICODE.to_vec();
        comment.extend(text.encode_utf16().flat_map(u16::to_be_bytes));

        let mut out = Vec::with_capacity(44 + comment.len());
        out.extend_from_slice(b"MM");
        out.extend_from_slice(&42u16.to_be_bytes());
        out.extend_from_slice(&8u32.to_be_bytes());
        // IFD0: a pointer to the Exif IFD at offset 26
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&EXIF_IFD_POINTER.to_be_bytes());
        out.extend_from_slice(&TYPE_LONG.to_be_bytes());
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(&26u32.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        // Exif IFD: UserComment stored at offset 44
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&USER_COMMENT.to_be_bytes());
        out.extend_from_slice(&TYPE_UNDEFINED.to_be_bytes());
        out.extend_from_slice(&(comment.len() as u32).to_be_bytes());
        out.extend_from_slice(&44u32.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&comment);
        out
    }

    /// Reads the `UserComment` of an Exif block and returns the record if the
    /// comment is ours. Foreign or malformed blocks give `None`.
    pub(super) fn read_exif(block: &[u8]) -> Option<String> {
        let tiff = block.strip_prefix(b"Exif\0\0").unwrap_or(block);
        let big_endian = match tiff.get(..2)? {
            b"MM" => true,
            b"II" => false,
            _ => return None,
        };
        let u16_at = |at: usize| -> Option<u16> {
            let b: [u8; 2] = tiff.get(at..at + 2)?.try_into().ok()?;
            Some(if big_endian { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) })
        };
        let u32_at = |at: usize| -> Option<u32> {
            let b: [u8; 4] = tiff.get(at..at + 4)?.try_into().ok()?;
            Some(if big_endian { u32::from_be_bytes(b) } else { u32::from_le_bytes(b) })
        };
        // (type, count, value or offset) of `tag` in the IFD at `ifd`
        let find = |ifd: usize, tag: u16| -> Option<(u16, u32, usize)> {
            let count = usize::from(u16_at(ifd)?);
            (0..count).find_map(|i| {
                let entry = ifd + 2 + i * 12;
                if u16_at(entry)? != tag {
                    return None;
                }
                Some((u16_at(entry + 2)?, u32_at(entry + 4)?, entry + 8))
            })
        };

        if u16_at(2)? != 42 {
            return None;
        }
        let ifd0 = u32_at(4)? as usize;
        let (_, _, pointer) = find(ifd0, EXIF_IFD_POINTER)?;
        let exif_ifd = u32_at(pointer)? as usize;
        let (kind, count, value) = find(exif_ifd, USER_COMMENT)?;
        if kind != TYPE_UNDEFINED || count < 8 {
            return None;
        }
        let count = count as usize;
        let start = if count <= 4 { value } else { u32_at(value)? as usize };
        let comment = tiff.get(start..start.checked_add(count)?)?;
        let (code, body) = comment.split_at(8);

        let text = if code == UNICODE {
            let units: Vec<u16> = body
                .chunks_exact(2)
                .map(|b| {
                    if big_endian {
                        u16::from_be_bytes([b[0], b[1]])
                    } else {
                        u16::from_le_bytes([b[0], b[1]])
                    }
                })
                .collect();
            String::from_utf16(&units).ok()?
        } else if code == ASCII || code == [0u8; 8] {
            String::from_utf8(body.to_vec()).ok()?
        } else {
            return None;
        };
        text.strip_prefix(PROVENANCE_KEYWORD)?
            .strip_prefix('\0')
            .map(str::to_string)
    }

    pub(super) fn embed(bytes: &[u8], record: &str) -> SaveResult<Vec<u8>> {
        let (chunks, trailing) = chunks(bytes)?;
        let exif = exif_block(record);
        if exif.len() > u32::MAX as usize - 16 {
            return Err(SaveError::codec(ImageFormat::Webp, "provenance record too large"));
        }
        let header = extended_header(&chunks[0])?;

        let mut body = Vec::with_capacity(bytes.len() + exif.len() + 32);
        push_chunk(&mut body, VP8X, &header);
        let mut inserted = false;
        for chunk in &chunks {
            if &chunk.fourcc == VP8X {
                continue;
            }
            if &chunk.fourcc == EXIF {
                if read_exif(chunk.data).is_none() {
                    debug!("replacing foreign EXIF chunk");
                }
                continue;
            }
            // EXIF goes before XMP and anything unknown after it
            if !inserted && &chunk.fourcc == XMP {
                push_chunk(&mut body, EXIF, &exif);
                inserted = true;
            }
            push_chunk(&mut body, &chunk.fourcc, chunk.data);
        }
        if !inserted {
            push_chunk(&mut body, EXIF, &exif);
        }

        let riff_len = u32::try_from(body.len() + 4)
            .map_err(|_| SaveError::codec(ImageFormat::Webp, "file exceeds the RIFF size limit"))?;
        let mut out = Vec::with_capacity(body.len() + 12 + trailing.len());
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&riff_len.to_le_bytes());
        out.extend_from_slice(b"WEBP");
        out.extend_from_slice(&body);
        out.extend_from_slice(trailing);
        Ok(out)
    }

    pub(super) fn extract(bytes: &[u8]) -> SaveResult<Option<ProvenanceRecord>> {
        let (chunks, _) = chunks(bytes)?;
        Ok(chunks
            .iter()
            .filter(|c| &c.fourcc == EXIF)
            .find_map(|c| read_exif(c.data))
            .map(ProvenanceRecord::from_text))
    }

    pub(super) fn pixel_payload(bytes: &[u8]) -> SaveResult<Vec<u8>> {
        let (chunks, _) = chunks(bytes)?;
        Ok(chunks
            .iter()
            .filter(|c| BITSTREAM.contains(&&c.fourcc))
            .flat_map(|c| c.data.iter().copied())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provenance::ProvenanceContext;

    fn chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut out = (data.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(data);
        let crc = crc32fast::hash(&out[4..]);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    fn sample_png() -> Vec<u8> {
        let mut out = PNG_SIGNATURE.to_vec();
        out.extend(chunk(b"IHDR", &[0, 0, 0, 2, 0, 0, 0, 2, 8, 2, 0, 0, 0]));
        out.extend(chunk(b"IDAT", &[0x78, 0x9c, 1, 2, 3, 4]));
        out.extend(chunk(b"IDAT", &[5, 6, 7, 8]));
        out.extend(chunk(b"IEND", &[]));
        out
    }

    fn sample_jpeg() -> Vec<u8> {
        let mut out = vec![0xFF, 0xD8];
        // APP0 JFIF
        out.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x07, b'J', b'F', b'I', b'F', 0]);
        // DQT with a tiny body
        out.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x04, 0x00, 0x01]);
        // SOS header, scan data, EOI
        out.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x04, 0x01, 0x00, 0x12, 0x34, 0xFF, 0x00, 0x56]);
        out.extend_from_slice(&[0xFF, 0xD9]);
        out
    }

    fn record() -> ProvenanceRecord {
        let ctx = ProvenanceContext::new().with("prompt", "a cat").with("seed", 42);
        ProvenanceRecord::from_context(&ctx).unwrap()
    }

    #[test]
    fn test_png_round_trip_keeps_pixels() {
        let codec = MetadataCodec::default();
        let original = sample_png();
        let embedded = codec.embed(&original, ImageFormat::Png, &record()).unwrap();
        assert_eq!(embedded.placement, MetadataPlacement::Embedded);

        let extracted = codec.extract(&embedded.bytes, ImageFormat::Png).unwrap();
        assert_eq!(extracted, Some(record()));
        assert_eq!(
            MetadataCodec::pixel_payload(&embedded.bytes, ImageFormat::Png).unwrap(),
            MetadataCodec::pixel_payload(&original, ImageFormat::Png).unwrap()
        );

        let params = png::extract(&embedded.bytes, PARAMETERS_KEYWORD).unwrap().unwrap();
        assert_eq!(params.as_str(), "a cat\nSeed: 42");
    }

    #[test]
    fn test_png_reembed_replaces_record() {
        let codec = MetadataCodec::new(false);
        let first = codec.embed(&sample_png(), ImageFormat::Png, &record()).unwrap();
        let other = ProvenanceRecord::from_text(r#"{"seed":1}"#);
        let second = codec.embed(&first.bytes, ImageFormat::Png, &other).unwrap();

        assert_eq!(codec.extract(&second.bytes, ImageFormat::Png).unwrap(), Some(other.clone()));
        let (chunks, _) = png::chunks(&second.bytes).unwrap();
        assert_eq!(chunks.iter().filter(|c| &c.kind == b"iTXt").count(), 1);
        // embedding the same record twice is stable
        let third = codec.embed(&second.bytes, ImageFormat::Png, &other).unwrap();
        assert_eq!(third.bytes, second.bytes);
    }

    #[test]
    fn test_png_rejects_corruption() {
        let codec = MetadataCodec::default();
        let mut corrupt = sample_png();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        assert!(matches!(
            codec.embed(&corrupt, ImageFormat::Png, &record()),
            Err(SaveError::CodecError { .. })
        ));
        assert!(codec.embed(&sample_png()[..20], ImageFormat::Png, &record()).is_err());
        assert!(codec.embed(b"not a png", ImageFormat::Png, &record()).is_err());
    }

    #[test]
    fn test_png_without_record() {
        let codec = MetadataCodec::default();
        assert_eq!(codec.extract(&sample_png(), ImageFormat::Png).unwrap(), None);
    }

    #[test]
    fn test_jpeg_round_trip_keeps_scan() {
        let codec = MetadataCodec::default();
        let original = sample_jpeg();
        let embedded = codec.embed(&original, ImageFormat::Jpeg, &record()).unwrap();

        assert_eq!(codec.extract(&embedded.bytes, ImageFormat::Jpeg).unwrap(), Some(record()));
        assert_eq!(
            MetadataCodec::pixel_payload(&embedded.bytes, ImageFormat::Jpeg).unwrap(),
            MetadataCodec::pixel_payload(&original, ImageFormat::Jpeg).unwrap()
        );

        // APP0 must stay right after SOI
        let layout = jpeg::layout(&embedded.bytes).unwrap();
        let markers: Vec<u8> = layout.segments.iter().map(|s| s.marker).collect();
        assert_eq!(markers, vec![0xE0, JPEG_COM, 0xDB]);

        let again = codec
            .embed(&embedded.bytes, ImageFormat::Jpeg, &ProvenanceRecord::from_text("{}"))
            .unwrap();
        let layout = jpeg::layout(&again.bytes).unwrap();
        assert_eq!(layout.segments.iter().filter(|s| s.marker == JPEG_COM).count(), 1);
    }

    #[test]
    fn test_jpeg_size_ceiling() {
        let codec = MetadataCodec::default();
        let big = ProvenanceRecord::from_text("x".repeat(JPEG_SEGMENT_LIMIT));
        assert!(matches!(
            codec.embed(&sample_jpeg(), ImageFormat::Jpeg, &big),
            Err(SaveError::CodecError { .. })
        ));
    }

    fn riff(chunks: &[(&[u8; 4], &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (fourcc, data) in chunks {
            body.extend_from_slice(*fourcc);
            body.extend_from_slice(&(data.len() as u32).to_le_bytes());
            body.extend_from_slice(data);
            if data.len() % 2 == 1 {
                body.push(0);
            }
        }
        let mut out = b"RIFF".to_vec();
        out.extend_from_slice(&(body.len() as u32 + 4).to_le_bytes());
        out.extend_from_slice(b"WEBP");
        out.extend(body);
        out
    }

    /// Lossless 3x2 image with the alpha hint set.
    fn sample_webp_lossless() -> Vec<u8> {
        let bits: u32 = 2 | (1 << 14) | (1 << 28);
        let mut data = vec![0x2f];
        data.extend_from_slice(&bits.to_le_bytes());
        data.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        riff(&[(b"VP8L", &data[..])])
    }

    fn fourccs(bytes: &[u8]) -> Vec<[u8; 4]> {
        webp::chunks(bytes).unwrap().0.iter().map(|c| c.fourcc).collect()
    }

    #[test]
    fn test_webp_lossless_gains_extended_header() {
        let codec = MetadataCodec::default();
        let original = sample_webp_lossless();
        let embedded = codec.embed(&original, ImageFormat::Webp, &record()).unwrap();
        assert_eq!(embedded.placement, MetadataPlacement::Embedded);

        assert_eq!(fourccs(&embedded.bytes), vec![*b"VP8X", *b"VP8L", *b"EXIF"]);
        let (chunks, _) = webp::chunks(&embedded.bytes).unwrap();
        // EXIF and alpha flags, then a 3x2 canvas stored as size - 1
        assert_eq!(chunks[0].data, &[0x18u8, 0, 0, 0, 2, 0, 0, 1, 0, 0][..]);
        let riff_len = u32::from_le_bytes(embedded.bytes[4..8].try_into().unwrap()) as usize;
        assert_eq!(riff_len + 8, embedded.bytes.len());

        assert_eq!(codec.extract(&embedded.bytes, ImageFormat::Webp).unwrap(), Some(record()));
        assert_eq!(
            MetadataCodec::pixel_payload(&embedded.bytes, ImageFormat::Webp).unwrap(),
            MetadataCodec::pixel_payload(&original, ImageFormat::Webp).unwrap()
        );

        // embedding again replaces the chunk instead of adding one
        let again = codec.embed(&embedded.bytes, ImageFormat::Webp, &record()).unwrap();
        assert_eq!(again.bytes, embedded.bytes);
    }

    #[test]
    fn test_webp_extended_keeps_chunk_order() {
        let codec = MetadataCodec::default();
        let header = [0u8, 0, 0, 0, 4, 0, 0, 6, 0, 0];
        // odd-sized key frame, so the chunk carries a pad byte
        let frame = [0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 5, 0, 7, 0, 0x01];
        let original = riff(&[
            (b"VP8X", &header[..]),
            (b"VP8 ", &frame[..]),
            (b"XMP ", &b"<x/>"[..]),
        ]);

        let embedded = codec.embed(&original, ImageFormat::Webp, &record()).unwrap();
        assert_eq!(
            fourccs(&embedded.bytes),
            vec![*b"VP8X", *b"VP8 ", *b"EXIF", *b"XMP "]
        );
        let (chunks, _) = webp::chunks(&embedded.bytes).unwrap();
        // only the EXIF flag is added
        assert_eq!(chunks[0].data[0], 0x08);
        assert_eq!(&chunks[0].data[1..], &header[1..]);
        assert_eq!(chunks[1].data, &frame[..]);
        assert_eq!(chunks[3].data, &b"<x/>"[..]);
        assert_eq!(codec.extract(&embedded.bytes, ImageFormat::Webp).unwrap(), Some(record()));
    }

    #[test]
    fn test_webp_simple_lossy_canvas() {
        let codec = MetadataCodec::default();
        let frame = [0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 5, 0, 7, 0];
        let embedded = codec
            .embed(&riff(&[(b"VP8 ", &frame[..])]), ImageFormat::Webp, &record())
            .unwrap();
        let (chunks, _) = webp::chunks(&embedded.bytes).unwrap();
        assert_eq!(chunks[0].data, &[0x08u8, 0, 0, 0, 4, 0, 0, 6, 0, 0][..]);
    }

    #[test]
    fn test_webp_foreign_exif_is_not_a_record() {
        let codec = MetadataCodec::default();
        let mut foreign = webp::exif_block("{}");
        // the comment text starts after the 44-byte TIFF header and the
        // 8-byte character code; change its first character
        assert_eq!(&foreign[52..54], &[0, b's']);
        foreign[53] = b'S';
        let bytes = riff(&[(b"VP8L", &[0x2f, 0, 0, 0, 0][..]), (b"EXIF", &foreign[..])]);
        assert_eq!(codec.extract(&bytes, ImageFormat::Webp).unwrap(), None);
        assert_eq!(webp::read_exif(&webp::exif_block("{\"a\":1}")).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_webp_rejects_corruption() {
        let codec = MetadataCodec::default();
        let mut short = sample_webp_lossless();
        short.truncate(short.len() - 2);
        assert!(matches!(
            codec.embed(&short, ImageFormat::Webp, &record()),
            Err(SaveError::CodecError { .. })
        ));
        let no_image = riff(&[(b"XMP ", &b"<x/>"[..])]);
        assert!(codec.embed(&no_image, ImageFormat::Webp, &record()).is_err());
    }

    #[test]
    fn test_sidecar_formats() {
        let codec = MetadataCodec::default();
        let bmp = b"BM\0\0".to_vec();
        let embedded = codec.embed(&bmp, ImageFormat::Bmp, &record()).unwrap();
        assert_eq!(embedded.placement, MetadataPlacement::Sidecar);
        assert_eq!(embedded.bytes, bmp);
        assert_eq!(codec.extract(&bmp, ImageFormat::Bmp).unwrap(), None);

        assert!(codec.embed(b"II*\0rest", ImageFormat::Tiff, &record()).is_ok());
        assert!(codec.embed(b"PK\x03\x04", ImageFormat::Bmp, &record()).is_err());
    }

    #[test]
    fn test_format_names() {
        assert_eq!("PNG".parse::<ImageFormat>().unwrap(), ImageFormat::Png);
        assert_eq!(".jpg".parse::<ImageFormat>().unwrap(), ImageFormat::Jpeg);
        assert_eq!("tif".parse::<ImageFormat>().unwrap(), ImageFormat::Tiff);
        assert!(matches!("gif".parse::<ImageFormat>(), Err(SaveError::CodecError { .. })));
        assert_eq!(
            sidecar_path(Path::new("/out/a.webp")),
            PathBuf::from("/out/a.webp.provenance.json")
        );
    }
}
