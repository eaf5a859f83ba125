//! Network stream capture through GStreamer.
//!
//! `rtsp://` locations use `rtspsrc`; anything else goes through `uridecodebin`.
//! Both end in an RGB appsink that keeps only the newest buffer.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use image::RgbImage;

use super::redact;

pub(crate) struct GstreamerStream {
    location: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    target_fps: u32,
}

impl GstreamerStream {
    pub(crate) fn open(location: &str, target_fps: u32) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let source = if location.starts_with("rtsp://") {
            format!("rtspsrc location={} latency=0 ! decodebin", location)
        } else {
            format!("uridecodebin uri={}", location)
        };
        let description = format!(
            "{} ! videoconvert ! videorate ! video/x-raw,format=RGB,framerate={}/1 ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            source, target_fps
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build stream pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("stream pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;
        appsink.set_caps(Some(
            &gstreamer::Caps::builder("video/x-raw")
                .field("format", "RGB")
                .build(),
        ));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set stream pipeline to Playing")?;
        log::info!("gstreamer: opened {}", redact(location));

        Ok(Self {
            location: redact(location),
            pipeline,
            appsink,
            target_fps,
        })
    }

    pub(crate) fn read_image(&mut self) -> Result<RgbImage> {
        self.check_bus()?;
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(self.frame_timeout_ms()))
            .ok_or_else(|| anyhow!("stream {} stalled", self.location))?;
        sample_to_image(&sample)
    }

    /// Generous first-frame allowance; RTSP negotiation is slow.
    fn frame_timeout_ms(&self) -> u64 {
        let per_frame = 1000 / u64::from(self.target_fps.max(1));
        (per_frame * 4).max(5_000)
    }

    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("stream {} ended", self.location)),
                _ => {}
            }
        }
        Ok(())
    }
}

impl Drop for GstreamerStream {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("gstreamer: failed to stop {}: {}", self.location, err);
        }
    }
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage> {
    let buffer = sample.buffer().context("stream sample missing buffer")?;
    let caps = sample.caps().context("stream sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse stream caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map stream buffer")?;
    let data = map.as_slice();

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("stream buffer row is out of bounds")?,
        );
    }
    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("stream frame does not fit {}x{}", width, height))
}
