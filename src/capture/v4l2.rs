//! Local camera capture through V4L2.
//!
//! Requests MJPG at the configured resolution and frame rate; the driver may
//! substitute another format or size, in which case the negotiated format is
//! decoded instead (MJPG, YUYV or RGB3).

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};

const BUFFER_COUNT: u32 = 4;

pub(crate) struct V4l2Camera {
    path: String,
    state: V4l2State,
    format: PixelFormat,
    width: u32,
    height: u32,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Camera {
    pub(crate) fn open(path: &str, width: u32, height: u32, target_fps: u32) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device =
            v4l::Device::with_path(path).with_context(|| format!("open v4l2 device {}", path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = width;
        format.height = height;
        format.fourcc = v4l::FourCC::new(b"MJPG");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("v4l2: failed to set format on {}: {}", path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "v4l2 device {} negotiated unsupported format {}",
                path,
                format.fourcc
            )
        })?;

        let params = v4l::video::capture::Parameters::with_fps(target_fps);
        if let Err(err) = device.set_params(&params) {
            log::warn!("v4l2: failed to set fps on {}: {}", path, err);
        }

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "v4l2: opened {} ({}x{} {})",
            path,
            format.width,
            format.height,
            format.fourcc
        );
        Ok(Self {
            path: path.to_string(),
            state,
            format: pixel_format,
            width: format.width,
            height: format.height,
        })
    }

    pub(crate) fn read_image(&mut self) -> Result<RgbImage> {
        use v4l::io::traits::CaptureStream;

        let (format, width, height) = (self.format, self.width, self.height);
        let path = &self.path;
        self.state.with_mut(|fields| {
            let (buf, meta) = fields
                .stream
                .next()
                .with_context(|| format!("capture v4l2 frame from {}", path))?;
            let used = (meta.bytesused as usize).min(buf.len());
            let data = if used > 0 { &buf[..used] } else { buf };
            normalize_to_rgb(data, width, height, format)
        })
    }
}
