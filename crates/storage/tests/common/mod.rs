//! Shared helpers for storage integration tests.

use std::io::Cursor;

use bytes::Bytes;

/// A small valid PNG, distinct per `shade`.
pub fn png_tile(shade: u8) -> Bytes {
    let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([shade, shade, 255, 200]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut out, image::ImageOutputFormat::Png)
        .unwrap();
    Bytes::from(out.into_inner())
}
