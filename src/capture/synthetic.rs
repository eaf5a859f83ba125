//! Synthetic capture for `stub://` locations.
//!
//! `stub://name[?frames=N&width=W&height=H]` opens an exclusive virtual device
//! producing a moving gradient. `frames=N` ends the stream after N reads
//! (including the validation read); `frames=0` fails immediately.

use anyhow::{anyhow, bail, Context, Result};
use image::{Rgb, RgbImage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct DeviceRecord {
    open: bool,
    opens: u64,
    releases: u64,
}

/// Shared registry of synthetic devices keyed by location without query.
///
/// Tracks which devices are open and how often each was opened and released.
#[derive(Clone, Debug, Default)]
pub struct SyntheticDevices {
    records: Arc<Mutex<HashMap<String, DeviceRecord>>>,
}

impl SyntheticDevices {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, DeviceRecord>> {
        // Records stay consistent even if a holder panicked mid-update.
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self, key: &str) -> Result<()> {
        let mut records = self.lock();
        let record = records.entry(key.to_string()).or_default();
        if record.open {
            bail!("device busy: {} is already open", key);
        }
        record.open = true;
        record.opens += 1;
        Ok(())
    }

    fn release(&self, key: &str) {
        let mut records = self.lock();
        if let Some(record) = records.get_mut(key) {
            if record.open {
                record.open = false;
                record.releases += 1;
            }
        }
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.lock().get(key).is_some_and(|r| r.open)
    }

    pub fn open_count(&self, key: &str) -> u64 {
        self.lock().get(key).map_or(0, |r| r.opens)
    }

    pub fn release_count(&self, key: &str) -> u64 {
        self.lock().get(key).map_or(0, |r| r.releases)
    }
}

/// An open synthetic device. Released on drop.
pub struct SyntheticCamera {
    key: String,
    devices: SyntheticDevices,
    width: u32,
    height: u32,
    remaining: Option<u64>,
    tick: u64,
}

impl SyntheticCamera {
    pub fn open(location: &str, width: u32, height: u32, devices: &SyntheticDevices) -> Result<Self> {
        let url = url::Url::parse(location)
            .with_context(|| format!("invalid synthetic location {}", location))?;
        let mut remaining = None;
        let mut width = width;
        let mut height = height;
        for (name, value) in url.query_pairs() {
            let parsed = || -> Result<u64> {
                value
                    .parse::<u64>()
                    .map_err(|_| anyhow!("invalid {} '{}' in {}", name, value, location))
            };
            match name.as_ref() {
                "frames" => remaining = Some(parsed()?),
                "width" => width = u32::try_from(parsed()?).context("width out of range")?,
                "height" => height = u32::try_from(parsed()?).context("height out of range")?,
                _ => {}
            }
        }
        if width == 0 || height == 0 {
            bail!("synthetic frame size must be positive");
        }

        let key = device_key(location);
        devices.acquire(&key)?;
        log::info!("synthetic device {} opened ({}x{})", key, width, height);
        Ok(Self {
            key,
            devices: devices.clone(),
            width,
            height,
            remaining,
            tick: 0,
        })
    }

    pub fn read_image(&mut self) -> Result<RgbImage> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                bail!("synthetic stream {} ended", self.key);
            }
            *remaining -= 1;
        }
        let tick = self.tick;
        self.tick += 1;

        let (w, h) = (self.width, self.height);
        let shift = ((tick * 8) % u64::from(w)) as u32;
        Ok(RgbImage::from_fn(w, h, |x, y| {
            let r = (((x + shift) % w) * 255 / w) as u8;
            let g = (y * 255 / h) as u8;
            let b = (tick % 256) as u8;
            Rgb([r, g, b])
        }))
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        self.devices.release(&self.key);
        log::debug!("synthetic device {} released", self.key);
    }
}

/// Registry key: the location without its query string.
pub fn device_key(location: &str) -> String {
    location
        .split_once('?')
        .map_or(location, |(base, _)| base)
        .to_string()
}
