use crate::scope::Ds1000z;
use crate::session::SessionError;
use image::{ImageFormat, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScreenError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Overlay ratio {0} is outside the valid range 0.0..=1.0")]
    RatioOutOfRange(f64),
    #[error("Could not decode the display bitmap: {0}")]
    Bitmap(image::ImageError),
    #[error("Could not save the screenshot to {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: image::ImageError,
    },
}

/// A decoded display frame, 800x480 RGB on the DS1000Z series.
#[derive(Debug, Clone)]
pub struct ScreenCapture {
    image: RgbImage,
}

impl ScreenCapture {
    /// Fraction of the width where the soft key menu column begins.
    const MENU_COLUMN_LEFT: f64 = 0.88;

    pub(crate) fn decode(data: &[u8]) -> Result<Self, ScreenError> {
        let image = image::load_from_memory(data)
            .map_err(ScreenError::Bitmap)?
            .to_rgb8();
        log::debug!(
            "Decoded a {}x{} display bitmap",
            image.width(),
            image.height()
        );
        Ok(Self { image })
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Darken the soft key menu column on the right edge of the frame.
    ///
    /// `ratio` is the opacity of the black overlay: `0.0` leaves the
    /// column untouched, `1.0` blacks it out completely. Pixels left of
    /// the column are never modified.
    pub fn dim_controls(&mut self, ratio: f64) -> Result<(), ScreenError> {
        check_overlay_ratio(ratio)?;
        let scale = 1.0 - ratio;
        let (width, height) = self.image.dimensions();
        let left = (f64::from(width) * Self::MENU_COLUMN_LEFT) as u32;
        for x in left..width {
            for y in 0..height {
                let pixel = self.image.get_pixel_mut(x, y);
                for channel in &mut pixel.0 {
                    *channel = (f64::from(*channel) * scale).round() as u8;
                }
            }
        }
        Ok(())
    }

    /// Write the frame to `path`. The image format follows the file
    /// extension, falling back to PNG when it is missing or unknown.
    pub fn save(&self, path: &Path) -> Result<(), ScreenError> {
        let format = ImageFormat::from_path(path).unwrap_or(ImageFormat::Png);
        self.image
            .save_with_format(path, format)
            .map_err(|source| ScreenError::Write {
                path: path.to_path_buf(),
                source,
            })
    }
}

pub(crate) fn check_overlay_ratio(ratio: f64) -> Result<(), ScreenError> {
    if !(0.0..=1.0).contains(&ratio) {
        return Err(ScreenError::RatioOutOfRange(ratio));
    }
    Ok(())
}

impl Ds1000z {
    /// Grab the current display content as an RGB bitmap.
    pub fn screen_capture(&mut self) -> Result<ScreenCapture, ScreenError> {
        let block = self.query_binary(":DISPlay:DATA?")?;
        ScreenCapture::decode(block.as_bytes())
    }

    /// Capture the display and write it to `path` with the soft key
    /// menu column dimmed by `overlay_ratio`.
    ///
    /// The ratio is validated before the display transfer is started.
    pub fn save_screen(&mut self, path: &Path, overlay_ratio: f64) -> Result<(), ScreenError> {
        check_overlay_ratio(overlay_ratio)?;
        let mut capture = self.screen_capture()?;
        capture.dim_controls(overlay_ratio)?;
        capture.save(path)?;
        log::info!("Saved a screenshot to {path:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ScpiSession;
    use crate::transport::testing::{sent_lines, ScriptedTransport, Step};
    use image::Rgb;
    use std::io::Cursor;

    fn filled_capture(width: u32, height: u32, value: [u8; 3]) -> ScreenCapture {
        ScreenCapture {
            image: RgbImage::from_pixel(width, height, Rgb(value)),
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([17, 34, 51]));
        let mut data = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
            .unwrap();
        data
    }

    #[test]
    fn test_dim_ratio_zero_is_identity() {
        let mut capture = filled_capture(100, 50, [10, 200, 33]);
        let before = capture.image().clone();
        capture.dim_controls(0.0).unwrap();
        assert_eq!(capture.image().as_raw(), before.as_raw());
    }

    #[test]
    fn test_dim_ratio_one_blacks_menu_column_only() {
        let mut capture = filled_capture(100, 50, [10, 200, 33]);
        capture.dim_controls(1.0).unwrap();
        // The column starts at x = 0.88 * 100 = 88.
        assert_eq!(*capture.image().get_pixel(87, 25), Rgb([10, 200, 33]));
        assert_eq!(*capture.image().get_pixel(88, 25), Rgb([0, 0, 0]));
        assert_eq!(*capture.image().get_pixel(99, 0), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_dim_scales_channels() {
        let mut capture = filled_capture(100, 10, [200, 10, 0]);
        capture.dim_controls(0.25).unwrap();
        assert_eq!(*capture.image().get_pixel(90, 5), Rgb([150, 8, 0]));
    }

    #[test]
    fn test_dim_rejects_out_of_range_ratio() {
        let mut capture = filled_capture(10, 10, [1, 2, 3]);
        assert!(matches!(
            capture.dim_controls(-0.1),
            Err(ScreenError::RatioOutOfRange(_))
        ));
        assert!(matches!(
            capture.dim_controls(1.5),
            Err(ScreenError::RatioOutOfRange(_))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            ScreenCapture::decode(b"not an image"),
            Err(ScreenError::Bitmap(_))
        ));
    }

    #[test]
    fn test_screen_capture_decodes_display_block() {
        let payload = png_bytes(4, 2);
        let mut data = format!("#{}{}", payload.len().to_string().len(), payload.len())
            .into_bytes();
        data.extend_from_slice(&payload);
        data.push(b'\n');

        let transport = ScriptedTransport::new(vec![Step::Read(data)]);
        let written = transport.written();
        let mut scope = Ds1000z::from_session(ScpiSession::new(Box::new(transport)));
        let capture = scope.screen_capture().unwrap();
        assert_eq!(capture.image().dimensions(), (4, 2));
        assert_eq!(sent_lines(&written), vec![":DISPlay:DATA?"]);
    }

    #[test]
    fn test_save_screen_validates_ratio_before_query() {
        let transport = ScriptedTransport::new(vec![]);
        let written = transport.written();
        let mut scope = Ds1000z::from_session(ScpiSession::new(Box::new(transport)));
        let err = scope
            .save_screen(Path::new("shot.png"), 2.0)
            .unwrap_err();
        assert!(matches!(err, ScreenError::RatioOutOfRange(_)));
        assert!(written.borrow().is_empty());
    }

    #[test]
    fn test_save_defaults_to_png_for_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.unknown-ext");
        let capture = filled_capture(8, 8, [5, 5, 5]);
        capture.save(&path).unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[..4], b"\x89PNG");
    }
}
