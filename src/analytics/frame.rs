use image::codecs::jpeg::JpegEncoder;
use image::error::{ParameterError, ParameterErrorKind};
use image::{ExtendedColorType, ImageError, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use super::vehicle::{BoundingBox, VehicleDetection, VehicleType};

const LIVE_JPEG_QUALITY: u8 = 80;
const BOX_THICKNESS: u32 = 2;

fn box_color(vehicle_type: VehicleType) -> Rgb<u8> {
    match vehicle_type {
        VehicleType::Bicycle => Rgb([0, 255, 255]),
        VehicleType::Car => Rgb([0, 255, 0]),
        VehicleType::Motorcycle => Rgb([255, 0, 255]),
        VehicleType::Bus => Rgb([255, 165, 0]),
        VehicleType::Truck => Rgb([255, 0, 0]),
    }
}

/// One decoded video frame, packed BGR24 rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    /// `dst = saturate(|src * alpha + beta|)` per channel.
    pub fn normalize(&mut self, alpha: f32, beta: f32) {
        let mut lut = [0u8; 256];
        for (i, slot) in lut.iter_mut().enumerate() {
            *slot = (i as f32 * alpha + beta).abs().round().min(255.0) as u8;
        }
        for px in self.data.iter_mut() {
            *px = lut[*px as usize];
        }
    }

    pub fn to_rgb_image(&self) -> Result<RgbImage, ImageError> {
        let mut image = RgbImage::from_raw(self.width, self.height, self.data.clone()).ok_or_else(|| {
            ImageError::Parameter(ParameterError::from_kind(ParameterErrorKind::DimensionMismatch))
        })?;
        for px in image.pixels_mut() {
            px.0.swap(0, 2);
        }
        Ok(image)
    }

    /// RGB copy of the frame with every detection outlined.
    pub fn annotated(&self, detections: &[VehicleDetection]) -> Result<RgbImage, ImageError> {
        let mut image = self.to_rgb_image()?;
        for det in detections {
            if let Some(rect) = clamp_rect(&det.bbox, self.width, self.height) {
                outline(&mut image, rect, box_color(det.vehicle_type));
            }
        }
        Ok(image)
    }
}

/// Box in pixel space, clipped to the frame. `None` for an empty frame.
fn clamp_rect(bbox: &BoundingBox, width: u32, height: u32) -> Option<Rect> {
    if width == 0 || height == 0 {
        return None;
    }
    let clamp = |v: f32, max: u32| (v.max(0.0) as u32).min(max - 1);
    let (x1, x2) = (clamp(bbox.x1, width), clamp(bbox.x2, width));
    let (y1, y2) = (clamp(bbox.y1, height), clamp(bbox.y2, height));
    if x2 < x1 || y2 < y1 {
        return None;
    }
    Some(Rect::at(x1 as i32, y1 as i32).of_size(x2 - x1 + 1, y2 - y1 + 1))
}

fn outline(image: &mut RgbImage, rect: Rect, color: Rgb<u8>) {
    for inset in 0..BOX_THICKNESS {
        let (w, h) = (rect.width(), rect.height());
        if w <= 2 * inset || h <= 2 * inset {
            break;
        }
        let inner = Rect::at(rect.left() + inset as i32, rect.top() + inset as i32)
            .of_size(w - 2 * inset, h - 2 * inset);
        draw_hollow_rect_mut(image, inner, color);
    }
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, ImageError> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, LIVE_JPEG_QUALITY);
    encoder.encode(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_scales_and_saturates() {
        let mut frame = Frame::new(1, 2, vec![0, 10, 100, 200, 255, 50]);
        frame.normalize(1.3, 10.0);
        assert_eq!(frame.data, vec![10, 23, 140, 255, 255, 75]);
    }

    #[test]
    fn test_normalize_identity() {
        let original = vec![1, 2, 3, 4, 5, 6];
        let mut frame = Frame::new(2, 1, original.clone());
        frame.normalize(1.0, 0.0);
        assert_eq!(frame.data, original);
    }

    #[test]
    fn test_rgb_conversion_swaps_channels() {
        let frame = Frame::new(1, 1, vec![10, 20, 30]);
        let image = frame.to_rgb_image().unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [30, 20, 10]);
    }

    #[test]
    fn test_rgb_conversion_rejects_short_buffer() {
        let frame = Frame::new(4, 4, vec![0; 10]);
        assert!(matches!(frame.to_rgb_image(), Err(ImageError::Parameter(_))));
    }

    #[test]
    fn test_annotate_draws_outline_only() {
        let frame = Frame::new(10, 10, vec![0; 300]);
        let det = VehicleDetection::new(VehicleType::Car, 0.9, BoundingBox::new(2.0, 2.0, 7.0, 7.0));
        let image = frame.annotated(&[det]).unwrap();

        let green = [0, 255, 0];
        assert_eq!(image.get_pixel(2, 2).0, green);
        assert_eq!(image.get_pixel(7, 5).0, green);
        assert_eq!(image.get_pixel(3, 4).0, green);
        assert_eq!(image.get_pixel(5, 5).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(frame.data, vec![0; 300]);
    }

    #[test]
    fn test_annotate_clamps_out_of_frame_boxes() {
        let frame = Frame::new(4, 4, vec![0; 48]);
        let det = VehicleDetection::new(VehicleType::Truck, 0.9, BoundingBox::new(-5.0, -5.0, 50.0, 50.0));
        let image = frame.annotated(&[det]).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(image.get_pixel(3, 3).0, [255, 0, 0]);
    }

    #[test]
    fn test_jpeg_encoding() {
        let frame = Frame::new(8, 8, vec![128; 8 * 8 * 3]);
        let jpeg = encode_jpeg(&frame.to_rgb_image().unwrap()).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
