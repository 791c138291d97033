//! Transport encoding: everything a viewer or the snapshot route sees is JPEG.

use image::{codecs::jpeg::JpegEncoder, RgbImage};

use crate::{CameraError, PixelFormat, RawImage, Result};

pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Encode a raw frame as JPEG. Frames that are already JPEG pass through.
pub fn to_jpeg(frame: RawImage, quality: u8) -> Result<Vec<u8>> {
    let RawImage { width, height, format, mut data } = frame;
    match format {
        PixelFormat::Jpeg => Ok(data),
        PixelFormat::Rgb8 => encode_rgb(data, width, height, quality),
        PixelFormat::Bgr8 => {
            check_len(&data, width, height)?;
            for px in data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            encode_rgb(data, width, height, quality)
        }
    }
}

fn encode_rgb(data: Vec<u8>, width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let expected = check_len(&data, width, height)?;
    let img = RgbImage::from_raw(width, height, data).ok_or(CameraError::FrameSize {
        expected,
        actual: 0,
    })?;

    let mut jpeg = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(&img)?;
    Ok(jpeg)
}

fn check_len(data: &[u8], width: u32, height: u32) -> Result<usize> {
    let expected = width as usize * height as usize * 3;
    if data.len() != expected {
        return Err(CameraError::FrameSize {
            expected,
            actual: data.len(),
        });
    }
    Ok(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;

    fn solid(width: u32, height: u32, px: [u8; 3], format: PixelFormat) -> RawImage {
        RawImage {
            width,
            height,
            format,
            data: px.repeat((width * height) as usize),
        }
    }

    #[test]
    fn rgb_frame_round_trips_dimensions() {
        let jpeg = to_jpeg(solid(64, 48, [10, 200, 30], PixelFormat::Rgb8), 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let img = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg).unwrap();
        assert_eq!((img.width(), img.height()), (64, 48));
    }

    #[test]
    fn bgr_is_swapped_to_rgb() {
        // pure blue in BGR order
        let jpeg = to_jpeg(solid(16, 16, [255, 0, 0], PixelFormat::Bgr8), 95).unwrap();
        let img = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)
            .unwrap()
            .to_rgb8();
        let px = img.get_pixel(8, 8);
        assert!(px[2] > 200 && px[0] < 50, "expected blue, got {px:?}");
    }

    #[test]
    fn jpeg_passes_through_untouched() {
        let bytes = vec![0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9];
        let frame = RawImage { width: 1280, height: 720, format: PixelFormat::Jpeg, data: bytes.clone() };
        assert_eq!(to_jpeg(frame, 85).unwrap(), bytes);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let frame = RawImage { width: 4, height: 4, format: PixelFormat::Rgb8, data: vec![0; 10] };
        match to_jpeg(frame, 85) {
            Err(CameraError::FrameSize { expected, actual }) => assert_eq!((expected, actual), (48, 10)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
