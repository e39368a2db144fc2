use anyhow::{bail, Context, Result};
use image::{GenericImageView, GrayImage, ImageFormat, RgbImage};

/// Decodes raw capture images into the two canonical pixel layouts used downstream.
///
/// No resizing or cropping happens here: the buffers keep the sensor resolution so
/// keypoint coordinates stay in the camera's pixel frame.
pub struct ImageLoader {
    supported_formats: Vec<ImageFormat>,
}

impl Default for ImageLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageLoader {
    pub fn new() -> Self {
        Self {
            supported_formats: vec![ImageFormat::Jpeg, ImageFormat::Png],
        }
    }

    /// Decode `bytes`, rejecting formats other than JPEG and PNG.
    pub fn decode(&self, name: &str, bytes: &[u8]) -> Result<DecodedImage> {
        let format = image::guess_format(bytes)
            .with_context(|| format!("Failed to decode image: {}", name))?;
        if !self.supported_formats.contains(&format) {
            bail!("Unsupported image format {:?}: {}", format, name);
        }
        let img = image::load_from_memory_with_format(bytes, format)
            .with_context(|| format!("Failed to decode image: {}", name))?;

        let (width, height) = img.dimensions();

        Ok(DecodedImage {
            width,
            height,
            color: img.to_rgb8(),
            gray: img.to_luma8(),
        })
    }
}

/// RGB (interleaved, row-major) and 8-bit luma versions of one capture image.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub color: RgbImage,
    pub gray: GrayImage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let mut img = RgbImage::new(4, 3);
        img.put_pixel(1, 2, Rgb([255, 0, 0]));
        img.put_pixel(3, 0, Rgb([255, 255, 255]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn decode_keeps_resolution_and_layouts() {
        let decoded = ImageLoader::new().decode("test.png", &png_bytes()).unwrap();
        assert_eq!((decoded.width, decoded.height), (4, 3));
        assert_eq!(decoded.color.get_pixel(1, 2), &Rgb([255, 0, 0]));
        assert_eq!(decoded.gray.get_pixel(3, 0)[0], 255);
    }

    #[test]
    fn decode_is_deterministic() {
        let loader = ImageLoader::new();
        let bytes = png_bytes();
        let a = loader.decode("a.png", &bytes).unwrap();
        let b = loader.decode("a.png", &bytes).unwrap();
        assert_eq!(a.color, b.color);
        assert_eq!(a.gray, b.gray);
    }

    #[test]
    fn garbage_bytes_fail_with_image_name() {
        let err = ImageLoader::new().decode("rig/cam/0.jpg", b"not an image").unwrap_err();
        assert!(err.to_string().contains("rig/cam/0.jpg"));
    }

    #[test]
    fn unsupported_format_is_rejected() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(2, 2));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Bmp).unwrap();
        let err = ImageLoader::new().decode("rig/cam/0.bmp", buf.get_ref()).unwrap_err();
        assert!(err.to_string().contains("Unsupported image format"));
    }
}
