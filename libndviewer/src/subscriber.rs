use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::frame::Frame;
use super::ntnda::reshape;
use super::pv::PvClient;

/// Granularity with which the poll thread notices a stop request while sleeping
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// A single-slot mailbox that only ever holds the newest frame
#[derive(Debug, Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Frame>>,
    dropped: AtomicU64,
}

impl FrameSlot {
    /// Store a frame, replacing any unread one
    pub fn put(&self, frame: Frame) {
        if self.latest.lock().replace(frame).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn take(&self) -> Option<Frame> {
        self.latest.lock().take()
    }

    pub fn clear(&self) {
        self.latest.lock().take();
    }

    /// Number of frames that were overwritten before anyone read them
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Polls an image PV on a background thread and exposes the latest frame.
#[derive(Debug)]
pub struct FrameSubscriber {
    pv_name: String,
    client: Arc<dyn PvClient>,
    interval: Duration,
    slot: Arc<FrameSlot>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameSubscriber {
    pub fn new(pv_name: &str, client: Arc<dyn PvClient>, interval: Duration) -> Self {
        Self {
            pv_name: pv_name.to_string(),
            client,
            interval,
            slot: Arc::new(FrameSlot::default()),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn pv_name(&self) -> &str {
        &self.pv_name
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        spdlog::info!("Subscribing to {}", self.pv_name);
        self.running.store(true, Ordering::SeqCst);
        let pv_name = self.pv_name.clone();
        let client = self.client.clone();
        let interval = self.interval;
        let slot = self.slot.clone();
        let running = self.running.clone();
        self.handle = Some(std::thread::spawn(move || {
            poll_loop(&pv_name, client.as_ref(), interval, &slot, &running)
        }));
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                spdlog::error!("Subscriber thread for {} panicked", self.pv_name);
            }
            spdlog::info!("Unsubscribed from {}", self.pv_name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.running.load(Ordering::SeqCst)
    }

    pub fn take_latest(&self) -> Option<Frame> {
        self.slot.take()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.slot.dropped()
    }
}

impl Drop for FrameSubscriber {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    pv_name: &str,
    client: &dyn PvClient,
    interval: Duration,
    slot: &FrameSlot,
    running: &AtomicBool,
) {
    let mut last_uid: Option<i64> = None;
    let mut last_error: Option<String> = None;
    while running.load(Ordering::SeqCst) {
        let result = client
            .get_image(pv_name)
            .map_err(|e| e.to_string())
            .and_then(|array| {
                if Some(array.unique_id) == last_uid {
                    return Ok(None);
                }
                last_uid = Some(array.unique_id);
                reshape(&array).map_err(|e| e.to_string())
            });
        match result {
            Ok(Some(frame)) => {
                slot.put(frame);
                last_error = None;
            }
            Ok(None) => last_error = None,
            Err(e) => {
                // Only report a changed error so a dead PV does not flood the log
                if last_error.as_deref() != Some(e.as_str()) {
                    spdlog::error!("Failed to read image from {pv_name}: {e}");
                }
                last_error = Some(e);
            }
        }
        sleep_while_running(interval, running);
    }
}

fn sleep_while_running(interval: Duration, running: &AtomicBool) {
    let mut remaining = interval;
    while !remaining.is_zero() && running.load(Ordering::SeqCst) {
        let step = remaining.min(STOP_CHECK_INTERVAL);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelType;
    use crate::pattern::Pattern;
    use crate::pv::SimulatedPv;
    use ndarray::Array2;
    use std::time::Instant;

    #[test]
    fn test_slot_keeps_latest() {
        let slot = FrameSlot::default();
        for uid in 0..3 {
            slot.put(Frame::new(uid, 0.0, PixelType::U8, Array2::zeros((1, 1))));
        }
        assert_eq!(slot.take().unwrap().uid, 2);
        assert!(slot.take().is_none());
        assert_eq!(slot.dropped(), 2);
    }

    #[test]
    fn test_subscriber_delivers_frames() {
        let client: Arc<dyn PvClient> =
            Arc::new(SimulatedPv::new().with_pattern_image("SIM:image", Pattern::Noise, 8, 4));
        let mut sub = FrameSubscriber::new("SIM:image", client, Duration::from_millis(2));
        sub.start();
        sub.start();
        assert!(sub.is_running());

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut frame = None;
        while frame.is_none() && Instant::now() < deadline {
            frame = sub.take_latest();
            std::thread::sleep(Duration::from_millis(2));
        }
        let frame = frame.unwrap();
        assert_eq!(frame.shape(), (4, 8));

        sub.stop();
        sub.stop();
        assert!(!sub.is_running());
    }

    #[test]
    fn test_subscriber_survives_bad_pv() {
        let client: Arc<dyn PvClient> = Arc::new(SimulatedPv::new());
        let mut sub = FrameSubscriber::new("SIM:missing", client, Duration::from_millis(1));
        sub.start();
        std::thread::sleep(Duration::from_millis(20));
        assert!(sub.is_running());
        assert!(sub.take_latest().is_none());
        sub.stop();
    }
}
