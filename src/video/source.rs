//! Frame sources for the video streamer.
//!
//! A source captures at its native size; frames are downscaled to the
//! operator-selected [`Resolution`] before JPEG encoding, so changing the
//! resolution never has to reopen the device.

use std::time::{Duration, Instant};

use anyhow::Result;
use image::{imageops, ImageBuffer, Rgb, RgbImage};

use super::Resolution;

/// Something that yields JPEG-encoded frames.
pub trait FrameSource: Send {
    /// Capture one frame, scaled to fit `resolution`, encoded at `quality` (1-100).
    fn capture_jpeg(&mut self, resolution: Resolution, quality: u8) -> Result<Vec<u8>>;
}

/// Downscale (never upscale) and JPEG-encode an RGB image.
pub fn encode_scaled(img: &RgbImage, resolution: Resolution, quality: u8) -> Result<Vec<u8>> {
    let scaled;
    let img = if img.width() > resolution.width || img.height() > resolution.height {
        scaled = imageops::resize(
            img,
            resolution.width,
            resolution.height,
            imageops::FilterType::Triangle,
        );
        &scaled
    } else {
        img
    };

    let mut jpeg = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100));
    encoder.encode_image(img)?;
    Ok(jpeg)
}

/// Synthetic camera: a gradient with a bar sweeping across it.
///
/// Paced to `fps` so the streamer loop behaves like it does with real hardware.
pub struct TestPattern {
    width: u32,
    height: u32,
    interval: Duration,
    next_due: Instant,
    tick: u32,
}

impl TestPattern {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            interval: Duration::from_secs(1) / fps.max(1),
            next_due: Instant::now(),
            tick: 0,
        }
    }

    fn render(&self) -> RgbImage {
        let bar = (self.tick * 8) % self.width.max(1);
        ImageBuffer::from_fn(self.width, self.height, |x, y| {
            if x.abs_diff(bar) < 6 {
                Rgb([255, 255, 255])
            } else {
                Rgb([
                    (x * 255 / self.width.max(1)) as u8,
                    (y * 255 / self.height.max(1)) as u8,
                    (self.tick % 256) as u8,
                ])
            }
        })
    }
}

impl FrameSource for TestPattern {
    fn capture_jpeg(&mut self, resolution: Resolution, quality: u8) -> Result<Vec<u8>> {
        let now = Instant::now();
        if self.next_due > now {
            std::thread::sleep(self.next_due - now);
        }
        self.next_due = Instant::now() + self.interval;
        self.tick = self.tick.wrapping_add(1);
        encode_scaled(&self.render(), resolution, quality)
    }
}

#[cfg(feature = "camera")]
pub use camera::V4lCamera;

/// V4L2 camera capture.
#[cfg(feature = "camera")]
mod camera {
    use anyhow::Result;
    use image::{ImageBuffer, ImageReader, Rgb, RgbImage};
    use std::io::Cursor;
    use v4l::buffer::Type;
    use v4l::io::mmap::Stream;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;
    use v4l::{Device, FourCC};

    use super::{encode_scaled, FrameSource};
    use crate::video::Resolution;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum CaptureFormat {
        Mjpeg,
        Yuyv,
    }

    /// Camera opened once at its largest streamed resolution.
    pub struct V4lCamera {
        stream: Stream<'static>,
        width: u32,
        height: u32,
        format: CaptureFormat,
    }

    // v4l streams are plain mmap buffers plus an fd.
    unsafe impl Send for V4lCamera {}

    impl V4lCamera {
        /// Open `/dev/video<index>` asking for `width`x`height`.
        pub fn open(index: u32, width: u32, height: u32) -> Result<Self> {
            let path = format!("/dev/video{}", index);
            let device = Device::with_path(&path)?;

            let mut format = device.format()?;
            format.width = width;
            format.height = height;

            // Prefer MJPEG: the Pi's USB bandwidth rarely sustains raw YUYV at 640x480.
            let mjpg = FourCC::new(b"MJPG");
            let yuyv = FourCC::new(b"YUYV");
            format.fourcc = mjpg;
            let mut actual = device.set_format(&format)?;
            if actual.fourcc != mjpg {
                format.fourcc = yuyv;
                actual = device.set_format(&format)?;
            }
            let capture_format = if actual.fourcc == yuyv {
                CaptureFormat::Yuyv
            } else {
                CaptureFormat::Mjpeg
            };

            // The stream borrows the device for its whole life.
            let device = Box::leak(Box::new(device));
            let stream = Stream::with_buffers(device, Type::VideoCapture, 4)?;

            tracing::info!(
                "Camera {} opened at {}x{} ({:?})",
                path,
                actual.width,
                actual.height,
                capture_format
            );
            Ok(Self {
                stream,
                width: actual.width,
                height: actual.height,
                format: capture_format,
            })
        }

        fn capture_rgb(&mut self) -> Result<RgbImage> {
            let (data, _meta) = self.stream.next()?;
            let expected_yuyv = (self.width as usize) * (self.height as usize) * 2;

            match self.format {
                CaptureFormat::Yuyv if data.len() >= expected_yuyv => {
                    let rgb = yuyv_to_rgb(data, self.width, self.height);
                    ImageBuffer::from_raw(self.width, self.height, rgb)
                        .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))
                }
                _ => Ok(ImageReader::new(Cursor::new(data))
                    .with_guessed_format()?
                    .decode()?
                    .to_rgb8()),
            }
        }
    }

    impl FrameSource for V4lCamera {
        fn capture_jpeg(&mut self, resolution: Resolution, quality: u8) -> Result<Vec<u8>> {
            let img = self.capture_rgb()?;
            encode_scaled(&img, resolution, quality)
        }
    }

    /// BT.601 YUYV 4:2:2 to packed RGB.
    fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
        let width = width as usize;
        let height = height as usize;
        let mut rgb = vec![0u8; width * height * 3];

        let convert = |y: f32, d: f32, e: f32| -> Rgb<u8> {
            let c = y - 16.0;
            Rgb([
                (1.164 * c + 1.596 * e).clamp(0.0, 255.0) as u8,
                (1.164 * c - 0.392 * d - 0.813 * e).clamp(0.0, 255.0) as u8,
                (1.164 * c + 2.017 * d).clamp(0.0, 255.0) as u8,
            ])
        };

        for (pair, px) in yuyv.chunks_exact(4).zip(rgb.chunks_exact_mut(6)) {
            let d = pair[1] as f32 - 128.0;
            let e = pair[3] as f32 - 128.0;
            let Rgb(p0) = convert(pair[0] as f32, d, e);
            let Rgb(p1) = convert(pair[2] as f32, d, e);
            px[..3].copy_from_slice(&p0);
            px[3..].copy_from_slice(&p1);
        }
        rgb
    }
}
