#![allow(dead_code)]

use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use panostitch::{Delivery, ImageRef, ResultStream, StitchConfig};
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

/// A deterministic textured wall. Values stay low enough that sharpening does not
/// clip most of the texture away.
pub fn wall(width: u32, height: u32, seed: u64) -> RgbImage {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    let mut next = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((state >> 33) % 256) as f32 / 255.0
    };

    let cell = 4;
    let columns = width / cell + 2;
    let rows = height / cell + 2;
    let coarse: Vec<f32> = (0..columns * rows).map(|_| next()).collect();
    let grain: Vec<f32> = (0..width * height).map(|_| next()).collect();

    RgbImage::from_fn(width, height, |x, y| {
        let (gx, gy) = (x / cell, y / cell);
        let (tx, ty) = (
            (x % cell) as f32 / cell as f32,
            (y % cell) as f32 / cell as f32,
        );
        let at = |cx: u32, cy: u32| coarse[(cy * columns + cx) as usize];
        let top = at(gx, gy) * (1.0 - tx) + at(gx + 1, gy) * tx;
        let bottom = at(gx, gy + 1) * (1.0 - tx) + at(gx + 1, gy + 1) * tx;
        let smooth = top * (1.0 - ty) + bottom * ty;
        let level = 0.7 * smooth + 0.3 * grain[(y * width + x) as usize];

        let v = 20.0 + 110.0 * level;
        Rgb([v as u8, (v * 0.9 + 8.0) as u8, (v * 0.6 + 30.0) as u8])
    })
}

pub fn crop(image: &RgbImage, x: u32, width: u32) -> RgbImage {
    image::imageops::crop_imm(image, x, 0, width, image.height()).to_image()
}

pub fn to_gray(image: &RgbImage) -> GrayImage {
    DynamicImage::ImageRgb8(image.clone()).to_luma8()
}

pub fn save_png(dir: &Path, name: &str, image: &RgbImage) -> ImageRef {
    let path = dir.join(name);
    image
        .save_with_format(&path, ImageFormat::Png)
        .expect("write input image");
    ImageRef::from(path)
}

pub fn save_gray_png(dir: &Path, name: &str, image: &GrayImage) -> ImageRef {
    let path = dir.join(name);
    image
        .save_with_format(&path, ImageFormat::Png)
        .expect("write input image");
    ImageRef::from(path)
}

pub fn png_in_memory(name: &str, image: &RgbImage) -> ImageRef {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode input image");
    ImageRef::memory(name, bytes)
}

pub fn flat_gray(width: u32, height: u32, value: u8) -> GrayImage {
    GrayImage::from_pixel(width, height, Luma([value]))
}

pub fn config(root: &Path) -> StitchConfig {
    let mut config = StitchConfig::with_workspace_root(root);
    config.preprocess_threads = 2;
    config
}

/// Next delivery, failing the test if none arrives in time.
pub async fn next_delivery(stream: &mut ResultStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(60), stream.recv())
        .await
        .expect("delivery timed out")
        .expect("stream closed")
}
