// THEORY:
// The `Frame` is the "dumb" data container of the stitcher: one decoded photograph
// and nothing else. It knows its own dimensions and channel count and how to move
// between its two supported layouts, but it never decides anything about stitching.
//
// Only two layouts exist: single-channel luminance and three-channel colour. Decoding
// folds every other layout the `image` crate can produce into one of these two, so
// no later stage has to think about alpha, 16-bit samples or palettes.

use crate::error::StitchError;
use image::{DynamicImage, GrayImage, ImageReader, RgbImage};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// A decoded input image with 1 or 3 channels.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Gray(GrayImage),
    Rgb(RgbImage),
}

impl Frame {
    pub fn width(&self) -> u32 {
        match self {
            Frame::Gray(image) => image.width(),
            Frame::Rgb(image) => image.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Frame::Gray(image) => image.height(),
            Frame::Rgb(image) => image.height(),
        }
    }

    pub fn channels(&self) -> u8 {
        match self {
            Frame::Gray(_) => 1,
            Frame::Rgb(_) => 3,
        }
    }

    /// Expands to three channels by replicating luminance. Colour frames pass through.
    pub fn into_rgb(self) -> RgbImage {
        match self {
            Frame::Gray(image) => DynamicImage::ImageLuma8(image).to_rgb8(),
            Frame::Rgb(image) => image,
        }
    }

    /// Folds any decoded layout into one of the two supported ones.
    pub fn from_dynamic(image: DynamicImage) -> Self {
        match image {
            DynamicImage::ImageLuma8(gray) => Frame::Gray(gray),
            DynamicImage::ImageLumaA8(_)
            | DynamicImage::ImageLuma16(_)
            | DynamicImage::ImageLumaA16(_) => Frame::Gray(image.to_luma8()),
            DynamicImage::ImageRgb8(rgb) => Frame::Rgb(rgb),
            other => Frame::Rgb(other.to_rgb8()),
        }
    }
}

/// Decodes the file at `path`. `reference` names the original input in error messages.
///
/// The decoder is chosen from the file contents rather than the extension, since
/// materialized inputs carry no trustworthy extension.
pub fn decode(path: &Path, reference: &str) -> Result<Frame, StitchError> {
    let decode_error = |source| StitchError::Decode {
        reference: reference.to_string(),
        source,
    };

    let file = File::open(path)
        .map_err(|e| StitchError::workspace(format!("failed to open input {reference}"), e))?;
    let image = ImageReader::new(BufReader::new(file))
        .with_guessed_format()
        .map_err(|e| StitchError::workspace(format!("failed to read input {reference}"), e))?
        .decode()
        .map_err(decode_error)?;

    Ok(Frame::from_dynamic(image))
}

/// Encodes `image` to `location` in `format`. Any failure is a workspace failure.
pub fn encode(
    image: &RgbImage,
    location: &Path,
    format: image::ImageFormat,
) -> Result<(), StitchError> {
    image
        .save_with_format(location, format)
        .map_err(|source| StitchError::Encode {
            location: location.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use image::{Luma, Rgb, Rgba, RgbaImage};

    #[test]
    fn gray_frames_expand_by_replication() {
        let gray = GrayImage::from_fn(4, 3, |x, y| Luma([(x * 10 + y) as u8]));
        let rgb = Frame::Gray(gray.clone()).into_rgb();

        assert_eq!(rgb.dimensions(), (4, 3));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let value = gray.get_pixel(x, y)[0];
            assert_eq!(*pixel, Rgb([value, value, value]));
        }
    }

    #[test]
    fn alpha_is_dropped_on_decode() {
        let rgba = RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 128]));
        let frame = Frame::from_dynamic(DynamicImage::ImageRgba8(rgba));
        assert_eq!(frame.channels(), 3);
        assert_eq!(frame.into_rgb().get_pixel(1, 1), &Rgb([10, 20, 30]));
    }

    #[test]
    fn decodes_by_content_not_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mislabelled.jpg");
        let image = RgbImage::from_pixel(5, 7, Rgb([1, 2, 3]));
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .expect("write png");

        let frame = decode(&path, "mislabelled.jpg").expect("decode");
        assert_eq!((frame.width(), frame.height(), frame.channels()), (5, 7, 3));
    }

    #[test]
    fn corrupt_input_is_a_decode_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("garbage");
        std::fs::write(&path, b"definitely not an image").expect("write");

        let error = decode(&path, "garbage").expect_err("must fail");
        assert_eq!(error.kind(), ErrorKind::Decode);
    }

    #[test]
    fn missing_input_is_a_workspace_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = decode(&dir.path().join("absent.png"), "absent.png").expect_err("must fail");
        assert_eq!(error.kind(), ErrorKind::Workspace);
    }

    #[test]
    fn encode_into_missing_directory_fails_as_workspace_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let location = dir.path().join("missing").join("out.png");
        let image = RgbImage::new(2, 2);

        let error = encode(&image, &location, image::ImageFormat::Png).expect_err("must fail");
        assert_eq!(error.kind(), ErrorKind::Workspace);
    }
}
