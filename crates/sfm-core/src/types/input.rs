use crate::models::CameraCalibration;
use image::GrayImage;
use thiserror::Error;

/// Reasons an input image is rejected before any stage runs.
#[derive(Debug, Error, PartialEq)]
pub enum ImageError {
    #[error("image has zero width or height ({width}x{height})")]
    ZeroSize { width: u32, height: u32 },
    #[error("pixel buffer is {actual_w}x{actual_h}, declared {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        actual_w: u32,
        actual_h: u32,
    },
    #[error("known intrinsics are invalid (non-positive or non-finite focal length / principal point)")]
    InvalidIntrinsics,
}

/// One input image. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Image {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Grayscale pixels; absent when features are supplied externally.
    pub pixels: Option<GrayImage>,
    /// Known calibration, if any.
    pub calibration: Option<CameraCalibration>,
}

impl Image {
    pub fn from_pixels(name: impl Into<String>, pixels: GrayImage) -> Self {
        let (width, height) = pixels.dimensions();
        Self {
            name: name.into(),
            width,
            height,
            pixels: Some(pixels),
            calibration: None,
        }
    }

    /// An image known only by its size.
    pub fn with_size(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            pixels: None,
            calibration: None,
        }
    }

    pub fn with_calibration(mut self, calibration: CameraCalibration) -> Self {
        self.calibration = Some(calibration);
        self
    }

    pub fn validate(&self) -> Result<(), ImageError> {
        if self.width == 0 || self.height == 0 {
            return Err(ImageError::ZeroSize {
                width: self.width,
                height: self.height,
            });
        }
        if let Some(px) = &self.pixels {
            let (actual_w, actual_h) = px.dimensions();
            if actual_w != self.width || actual_h != self.height {
                return Err(ImageError::SizeMismatch {
                    width: self.width,
                    height: self.height,
                    actual_w,
                    actual_h,
                });
            }
        }
        if let Some(cal) = &self.calibration {
            if !cal.intrinsics.is_valid() {
                return Err(ImageError::InvalidIntrinsics);
            }
        }
        Ok(())
    }

    /// Known calibration or the size-based prior.
    pub fn calibration_or_default(&self) -> CameraCalibration {
        self.calibration
            .unwrap_or_else(|| CameraCalibration::default_for_image(self.width, self.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PinholeIntrinsics;

    #[test]
    fn validation_catches_malformed_images() {
        assert_eq!(
            Image::with_size("a", 0, 10).validate(),
            Err(ImageError::ZeroSize {
                width: 0,
                height: 10
            })
        );
        let mut img = Image::from_pixels("b", GrayImage::new(8, 6));
        img.width = 9;
        assert!(matches!(img.validate(), Err(ImageError::SizeMismatch { .. })));

        let bad = Image::with_size("c", 4, 4).with_calibration(CameraCalibration::pinhole(
            PinholeIntrinsics::new(-1.0, 1.0, 2.0, 2.0),
        ));
        assert_eq!(bad.validate(), Err(ImageError::InvalidIntrinsics));
        assert!(Image::with_size("d", 4, 4).validate().is_ok());
    }
}
