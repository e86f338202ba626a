use std::fs;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use tracing::debug;

use crate::exiftool::MetadataEditor;

pub const MAX_PIXELS: u64 = 16_000_000;
pub const TARGET_PIXELS: u64 = 8_000_000;
pub const JPEG_QUALITY: u8 = 95;

/// Image input handed to the captioning call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// The original file, usable as is.
    File(PathBuf),
    /// An in-memory JPEG: an embedded preview or a re-encoded decode.
    Bytes(Vec<u8>),
}

impl ImageSource {
    pub fn read_bytes(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            Self::File(path) => Ok(fs::read(path)?),
            Self::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

/// Whether the generation service accepts this MIME type directly.
pub fn is_direct_mime(mime: &str) -> bool {
    matches!(mime, "image/jpeg" | "image/png")
}

/// MIME type from the file extension. `None` means not an image.
pub fn guess_image_mime(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    let mime = match ext.as_str() {
        "jpg" | "jpeg" | "jpe" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "heic" | "heif" => "image/heic",
        "avif" => "image/avif",
        "cr2" => "image/x-canon-cr2",
        "cr3" => "image/x-canon-cr3",
        "nef" => "image/x-nikon-nef",
        "arw" => "image/x-sony-arw",
        "orf" => "image/x-olympus-orf",
        "rw2" => "image/x-panasonic-rw2",
        "raf" => "image/x-fuji-raf",
        "dng" => "image/x-adobe-dng",
        _ => return None,
    };
    Some(mime)
}

/// Scaled dimensions for an image above [`MAX_PIXELS`], keeping the aspect
/// ratio and landing near [`TARGET_PIXELS`]. `None` when no resize is due.
pub fn downscaled_dimensions(width: u32, height: u32) -> Option<(u32, u32)> {
    let pixels = u64::from(width) * u64::from(height);
    if pixels <= MAX_PIXELS {
        return None;
    }
    let scale = (TARGET_PIXELS as f64 / pixels as f64).sqrt();
    let scaled = |side: u32| ((f64::from(side) * scale) as u32).max(1);
    Some((scaled(width), scaled(height)))
}

/// Decodes, downsamples when oversized, drops alpha and re-encodes as JPEG.
pub fn reencode_image(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes)?;
    let (width, height) = decoded.dimensions();
    let sized = match downscaled_dimensions(width, height) {
        Some((new_width, new_height)) => {
            debug!(width, height, new_width, new_height, "downsampling image");
            decoded.resize_exact(new_width, new_height, FilterType::Lanczos3)
        }
        None => decoded,
    };
    let rgb = DynamicImage::ImageRgb8(sized.to_rgb8());
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&rgb)?;
    Ok(out)
}

/// Turns a candidate file into something the captioning call can take.
pub struct ImagePreparer<'a, E: MetadataEditor + ?Sized> {
    editor: &'a E,
}

impl<'a, E: MetadataEditor + ?Sized> ImagePreparer<'a, E> {
    pub fn new(editor: &'a E) -> Self {
        Self { editor }
    }

    /// Direct formats pass through; otherwise an embedded preview is used,
    /// then a generic decode. `None` when the file cannot be turned into an
    /// image.
    pub fn prepare(&self, path: &Path, mime: &str) -> Option<ImageSource> {
        if is_direct_mime(mime) {
            return Some(ImageSource::File(path.to_path_buf()));
        }
        if let Some(preview) = self.editor.embedded_preview(path) {
            return Some(ImageSource::Bytes(preview));
        }
        let bytes = fs::read(path).ok()?;
        match reencode_image(&bytes) {
            Ok(encoded) => Some(ImageSource::Bytes(encoded)),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "image decode failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::Path;

    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use serde_json::{Map, Value};

    use super::*;
    use crate::exiftool::TagSet;

    struct PreviewEditor(Option<Vec<u8>>);

    impl MetadataEditor for PreviewEditor {
        fn read_metadata(&self, _path: &Path) -> anyhow::Result<Map<String, Value>> {
            Ok(Map::new())
        }

        fn embedded_preview(&self, _path: &Path) -> Option<Vec<u8>> {
            self.0.clone()
        }

        fn write_tags(&self, _path: &Path, _tags: &TagSet, _overwrite: bool) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn mime_guess_follows_extension() {
        assert_eq!(guess_image_mime(Path::new("a/B.JPG")), Some("image/jpeg"));
        assert_eq!(guess_image_mime(Path::new("x.nef")), Some("image/x-nikon-nef"));
        assert_eq!(guess_image_mime(Path::new("notes.txt")), None);
        assert_eq!(guess_image_mime(Path::new("README")), None);
    }

    #[test]
    fn downscale_only_above_limit() {
        assert_eq!(downscaled_dimensions(4000, 4000), None);
        let (width, height) = downscaled_dimensions(6000, 4000).unwrap_or((0, 0));
        let pixels = u64::from(width) * u64::from(height);
        assert!(pixels <= TARGET_PIXELS && pixels > TARGET_PIXELS - 20_000);
        assert!((f64::from(width) / f64::from(height) - 1.5).abs() < 0.01);
    }

    #[test]
    fn direct_formats_pass_through() {
        let editor = PreviewEditor(Some(b"preview".to_vec()));
        let preparer = ImagePreparer::new(&editor);
        let path = Path::new("/photos/a.png");
        assert_eq!(
            preparer.prepare(path, "image/png"),
            Some(ImageSource::File(path.to_path_buf()))
        );
    }

    #[test]
    fn embedded_preview_wins_over_decode() {
        let editor = PreviewEditor(Some(b"preview".to_vec()));
        let preparer = ImagePreparer::new(&editor);
        assert_eq!(
            preparer.prepare(Path::new("/photos/raw.nef"), "image/x-nikon-nef"),
            Some(ImageSource::Bytes(b"preview".to_vec()))
        );
    }

    #[test]
    fn transparent_image_is_reencoded_as_opaque_jpeg() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("sprite.webp");
        let mut rgba = RgbaImage::new(8, 6);
        for pixel in rgba.pixels_mut() {
            *pixel = Rgba([200, 10, 10, 0]);
        }
        // Saved as PNG bytes; the extension only drives the MIME guess.
        let mut png = Vec::new();
        DynamicImage::ImageRgba8(rgba)
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
        std::fs::write(&path, &png)?;

        let editor = PreviewEditor(None);
        let prepared = ImagePreparer::new(&editor).prepare(&path, "image/webp");
        let Some(ImageSource::Bytes(bytes)) = &prepared else {
            anyhow::bail!("expected re-encoded bytes, got {prepared:?}");
        };
        let decoded = image::load_from_memory(bytes)?;
        assert_eq!(image::guess_format(bytes)?, image::ImageFormat::Jpeg);
        assert_eq!(decoded.dimensions(), (8, 6));
        assert!(!decoded.color().has_alpha());
        Ok(())
    }

    #[test]
    fn oversized_image_is_downsampled_before_encoding() -> anyhow::Result<()> {
        let mut png = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4100, 4000, Rgb([30, 90, 160])))
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;

        let jpeg = reencode_image(&png)?;
        let (width, height) = image::load_from_memory(&jpeg)?.dimensions();
        assert_eq!(Some((width, height)), downscaled_dimensions(4100, 4000));
        assert!(u64::from(width) * u64::from(height) <= TARGET_PIXELS);
        assert!(width > height);
        Ok(())
    }

    #[test]
    fn undecodable_file_yields_none() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("broken.tiff");
        std::fs::write(&path, b"definitely not an image")?;
        let editor = PreviewEditor(None);
        assert_eq!(ImagePreparer::new(&editor).prepare(&path, "image/tiff"), None);
        Ok(())
    }
}
