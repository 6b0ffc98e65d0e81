//! Soft beam position monitor.
//!
//! While the detector writes flat fields (the file-location PV reads the
//! trigger value) the mean image intensity, normalised by the storage ring
//! current, is compared against a reference. A drop beyond the threshold nudges
//! two motors by their configured steps in the negative direction.
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use super::error::{BpmError, ConfigError, PvError};
use super::ntnda::reshape;
use super::pv::{move_relative, PvClient};

/// Readings more than this far below the reference are treated as empty images
pub const EMPTY_IMAGE_PERCENT: f64 = -30.0;
const STOP_CHECK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorStep {
    pub pv: String,
    pub step: f64,
}

/// Beam monitor job. Serializable to YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BpmConfig {
    pub location_pv: String,
    /// Value of `location_pv` during which intensities are measured
    pub trigger_value: String,
    pub image_pv: String,
    pub beam_current_pv: String,
    pub motors: Vec<MotorStep>,
    /// Percent drop which triggers a correction
    pub threshold_percent: f64,
    /// Seconds between polls
    pub poll_interval: f64,
    /// Log corrections without moving the motors
    pub test_mode: bool,
}

impl Default for BpmConfig {
    fn default() -> Self {
        Self {
            location_pv: String::from("32id:TomoScan:HDF5Location"),
            trigger_value: String::from("/exchange/data_white"),
            image_pv: String::from("32idcPG3:image1:"),
            beam_current_pv: String::from("S:SRcurrentAI"),
            motors: vec![
                MotorStep {
                    pv: String::from("32idb:m1"),
                    step: 0.1,
                },
                MotorStep {
                    pv: String::from("32idb:m2"),
                    step: 0.1,
                },
            ],
            threshold_percent: 10.0,
            poll_interval: 1.0,
            test_mode: false,
        }
    }
}

impl BpmConfig {
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(config_path)?;
        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), BpmError> {
        if !self.threshold_percent.is_finite() || self.threshold_percent <= 0.0 {
            return Err(BpmError::InvalidConfig(String::from(
                "threshold_percent must be positive",
            )));
        }
        if Duration::try_from_secs_f64(self.poll_interval).is_err() {
            return Err(BpmError::InvalidConfig(String::from(
                "poll_interval must be a finite, non-negative number of seconds",
            )));
        }
        Ok(())
    }
}

/// A normalised intensity compared against the reference
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BpmReading {
    pub reference: f64,
    pub intensity: f64,
    pub change_percent: f64,
    pub beam_current: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BpmEvent {
    /// The location PV holds something other than the trigger value
    Waiting(String),
    InvalidCurrent,
    NoImage,
    Reference { intensity: f64, beam_current: f64 },
    /// Intensity too low to serve as a reference; the reference stays unset
    DarkReference(f64),
    Reading(BpmReading),
    SkippedLow(f64),
    /// Drop beyond the threshold; `moved` is false in test mode or when a motor failed
    Correction { reading: BpmReading, moved: bool },
    Error(String),
}

/// One soft BPM, owning the reference intensity
#[derive(Debug)]
pub struct BeamMonitor<'a> {
    config: &'a BpmConfig,
    client: &'a dyn PvClient,
    reference: Option<f64>,
}

impl<'a> BeamMonitor<'a> {
    pub fn new(config: &'a BpmConfig, client: &'a dyn PvClient) -> Self {
        Self {
            config,
            client,
            reference: None,
        }
    }

    pub fn reference(&self) -> Option<f64> {
        self.reference
    }

    pub fn reset_reference(&mut self) {
        self.reference = None;
        spdlog::info!("Reference intensity reset");
    }

    fn mean_intensity(&self) -> Option<f64> {
        let array = match self.client.get_image(&self.config.image_pv) {
            Ok(a) => a,
            Err(e) => {
                spdlog::warn!("Could not read image from {}: {e}", self.config.image_pv);
                return None;
            }
        };
        match reshape(&array) {
            Ok(frame) => frame.and_then(|f| f.stats()).map(|s| s.mean),
            Err(e) => {
                spdlog::warn!("Could not decode image from {}: {e}", self.config.image_pv);
                None
            }
        }
    }

    fn move_motors(&self) -> bool {
        let mut all_moved = true;
        for motor in self.config.motors.iter() {
            match move_relative(self.client, &motor.pv, -motor.step) {
                Ok(target) => spdlog::info!(
                    "Motor {} moved by {:+.4} to {target:.4}",
                    motor.pv,
                    -motor.step
                ),
                Err(e) => {
                    spdlog::error!("Failed to move motor {}: {e}", motor.pv);
                    all_moved = false;
                }
            }
        }
        all_moved
    }

    /// Take one measurement
    pub fn poll(&mut self) -> Result<BpmEvent, PvError> {
        let location = self.client.get_string(&self.config.location_pv)?;
        let location = location.trim();
        if location != self.config.trigger_value {
            return Ok(BpmEvent::Waiting(location.to_string()));
        }

        let beam_current = match self.client.get_f64(&self.config.beam_current_pv) {
            Ok(c) if c > 0.0 => c,
            _ => {
                spdlog::warn!("Invalid beam current, skipping measurement");
                return Ok(BpmEvent::InvalidCurrent);
            }
        };
        let raw = match self.mean_intensity() {
            Some(m) => m,
            None => return Ok(BpmEvent::NoImage),
        };
        let intensity = raw / beam_current;

        let reference = match self.reference {
            Some(r) => r,
            None if !intensity.is_finite() || intensity <= 0.0 => {
                spdlog::warn!("Intensity {intensity} cannot be used as a reference, skipping");
                return Ok(BpmEvent::DarkReference(intensity));
            }
            None => {
                self.reference = Some(intensity);
                spdlog::info!(
                    "Reference intensity established: {intensity:.2} (raw: {raw:.1}, current: {beam_current:.3} mA)"
                );
                return Ok(BpmEvent::Reference {
                    intensity,
                    beam_current,
                });
            }
        };

        let change_percent = (intensity - reference) / reference * 100.0;
        if !change_percent.is_finite() || change_percent < EMPTY_IMAGE_PERCENT {
            spdlog::info!("Skipping low intensity image: {change_percent:+.2}%");
            return Ok(BpmEvent::SkippedLow(change_percent));
        }
        let reading = BpmReading {
            reference,
            intensity,
            change_percent,
            beam_current,
        };
        if change_percent >= -self.config.threshold_percent {
            return Ok(BpmEvent::Reading(reading));
        }

        if self.config.test_mode {
            spdlog::warn!(
                "[TEST MODE] Intensity dropped {change_percent:+.2}% (threshold -{}%), motors not moved",
                self.config.threshold_percent
            );
            return Ok(BpmEvent::Correction {
                reading,
                moved: false,
            });
        }
        spdlog::warn!(
            "Intensity dropped {change_percent:+.2}% (threshold -{}%)",
            self.config.threshold_percent
        );
        let moved = self.move_motors();
        self.reference = Some(intensity);
        spdlog::info!("Adjusted motors. New reference: {intensity:.2}");
        Ok(BpmEvent::Correction { reading, moved })
    }
}

/// Sleep for `duration`, returning early once `stop` is set
fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) {
    let start = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        let elapsed = start.elapsed();
        if elapsed >= duration {
            break;
        }
        std::thread::sleep(STOP_CHECK.min(duration - elapsed));
    }
}

/// Poll until `stop` is set or `max_polls` measurements were taken.
///
/// Setting `reset` clears the reference before the next poll. PV errors are
/// reported as [`BpmEvent::Error`] and the loop continues.
pub fn run_monitor(
    config: &BpmConfig,
    client: &dyn PvClient,
    stop: &AtomicBool,
    reset: &AtomicBool,
    tx: &Sender<BpmEvent>,
    max_polls: Option<usize>,
) -> Result<(), BpmError> {
    config.validate()?;
    let mode = if config.test_mode {
        "[TEST MODE - Motors disabled]"
    } else {
        "[ACTIVE - Motors enabled]"
    };
    spdlog::info!("Starting beam monitor {mode}");
    let interval = Duration::from_secs_f64(config.poll_interval);
    let mut monitor = BeamMonitor::new(config, client);
    let mut polls = 0;
    while !stop.load(Ordering::Relaxed) {
        if max_polls.is_some_and(|max| polls >= max) {
            break;
        }
        if reset.swap(false, Ordering::Relaxed) {
            monitor.reset_reference();
        }
        let event = match monitor.poll() {
            Ok(event) => event,
            Err(e) => {
                spdlog::error!("Error in monitoring loop: {e}");
                BpmEvent::Error(e.to_string())
            }
        };
        tx.send(event)?;
        polls += 1;
        sleep_unless_stopped(interval, stop);
    }
    spdlog::info!("Beam monitor stopped after {polls} polls");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pv::{readback_name, PvValue, SimulatedPv};
    use ndarray::Array2;
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::sync::Arc;

    fn config(test_mode: bool) -> BpmConfig {
        BpmConfig {
            location_pv: String::from("loc"),
            image_pv: String::from("cam"),
            beam_current_pv: String::from("current"),
            motors: vec![
                MotorStep {
                    pv: String::from("m1"),
                    step: 0.5,
                },
                MotorStep {
                    pv: String::from("m2"),
                    step: 0.25,
                },
            ],
            poll_interval: 0.0,
            test_mode,
            ..BpmConfig::default()
        }
    }

    /// Camera whose flat intensity is read from `level`
    fn setup(level: Arc<Mutex<u16>>) -> SimulatedPv {
        SimulatedPv::new()
            .with_value("loc", PvValue::Text(String::from("/exchange/data_white")))
            .with_value("current", PvValue::Number(2.0))
            .with_value("m1", PvValue::Number(1.0))
            .with_value("m2", PvValue::Number(1.0))
            .with_image_source(
                "cam",
                Box::new(move |_, _| Array2::from_elem((4, 4), *level.lock())),
            )
    }

    #[test]
    fn test_reference_and_correction() {
        let level = Arc::new(Mutex::new(100));
        let pv = setup(level.clone());
        let config = config(false);
        let mut monitor = BeamMonitor::new(&config, &pv);

        assert_eq!(
            monitor.poll().unwrap(),
            BpmEvent::Reference {
                intensity: 50.0,
                beam_current: 2.0
            }
        );

        *level.lock() = 95;
        match monitor.poll().unwrap() {
            BpmEvent::Reading(r) => assert!((r.change_percent + 5.0).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }

        *level.lock() = 80;
        match monitor.poll().unwrap() {
            BpmEvent::Correction { reading, moved } => {
                assert!(moved);
                assert!((reading.change_percent + 20.0).abs() < 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(monitor.reference(), Some(40.0));
        assert_eq!(pv.get_f64(&readback_name("m1")).unwrap(), 0.5);
        assert_eq!(pv.get_f64(&readback_name("m2")).unwrap(), 0.75);

        *level.lock() = 10;
        assert!(matches!(monitor.poll().unwrap(), BpmEvent::SkippedLow(_)));
    }

    #[test]
    fn test_dark_reference_never_moves() {
        let level = Arc::new(Mutex::new(0));
        let pv = setup(level.clone());
        let config = config(false);
        let mut monitor = BeamMonitor::new(&config, &pv);
        for _ in 0..4 {
            assert_eq!(monitor.poll().unwrap(), BpmEvent::DarkReference(0.0));
        }
        assert_eq!(monitor.reference(), None);
        assert_eq!(pv.get_f64(&readback_name("m1")).unwrap(), 1.0);
        assert_eq!(pv.get_f64(&readback_name("m2")).unwrap(), 1.0);

        // Beam comes back
        *level.lock() = 100;
        assert!(matches!(
            monitor.poll().unwrap(),
            BpmEvent::Reference { .. }
        ));
        assert_eq!(monitor.reference(), Some(50.0));
    }

    #[test]
    fn test_failed_motor_move() {
        let level = Arc::new(Mutex::new(100));
        let pv = setup(level.clone());
        let config = config(false);
        let mut monitor = BeamMonitor::new(&config, &pv);
        monitor.poll().unwrap();

        pv.remove_value(&readback_name("m2"));
        *level.lock() = 80;
        assert!(matches!(
            monitor.poll().unwrap(),
            BpmEvent::Correction { moved: false, .. }
        ));
        assert_eq!(pv.get_f64(&readback_name("m1")).unwrap(), 0.5);
        assert_eq!(monitor.reference(), Some(40.0));
    }

    #[test]
    fn test_mode_does_not_move() {
        let level = Arc::new(Mutex::new(100));
        let pv = setup(level.clone());
        let config = config(true);
        let mut monitor = BeamMonitor::new(&config, &pv);
        monitor.poll().unwrap();
        *level.lock() = 80;
        assert!(matches!(
            monitor.poll().unwrap(),
            BpmEvent::Correction { moved: false, .. }
        ));
        assert_eq!(monitor.reference(), Some(50.0));
        assert_eq!(pv.get_f64("m1").unwrap(), 1.0);
    }

    #[test]
    fn test_waiting_and_invalid_current() {
        let pv = setup(Arc::new(Mutex::new(100)));
        let config = config(false);
        let mut monitor = BeamMonitor::new(&config, &pv);

        pv.set_value("current", PvValue::Number(0.0));
        assert_eq!(monitor.poll().unwrap(), BpmEvent::InvalidCurrent);

        pv.set_value("loc", PvValue::Text(String::from("/exchange/data")));
        assert_eq!(
            monitor.poll().unwrap(),
            BpmEvent::Waiting(String::from("/exchange/data"))
        );

        pv.remove_value("loc");
        assert!(monitor.poll().is_err());
    }

    #[test]
    fn test_run_monitor() {
        let pv = setup(Arc::new(Mutex::new(100)));
        pv.remove_value("loc");
        let (tx, rx) = mpsc::channel();
        let stop = AtomicBool::new(false);
        let reset = AtomicBool::new(false);
        run_monitor(&config(false), &pv, &stop, &reset, &tx, Some(3)).unwrap();
        drop(tx);
        let events: Vec<BpmEvent> = rx.iter().collect();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| matches!(e, BpmEvent::Error(_))));
    }

    #[test]
    fn test_run_monitor_reset() {
        let level = Arc::new(Mutex::new(100));
        let pv = setup(level.clone());
        let config = config(false);
        let (tx, rx) = mpsc::channel();
        let stop = AtomicBool::new(false);
        let reset = AtomicBool::new(false);
        std::thread::scope(|s| {
            let worker = s.spawn(|| run_monitor(&config, &pv, &stop, &reset, &tx, None));
            let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(matches!(first, BpmEvent::Reference { intensity, .. } if intensity == 50.0));

            *level.lock() = 95;
            reset.store(true, Ordering::Relaxed);
            let mut new_reference = None;
            while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
                if let BpmEvent::Reference { intensity, .. } = event {
                    new_reference = Some(intensity);
                    break;
                }
            }
            stop.store(true, Ordering::Relaxed);
            worker.join().unwrap().unwrap();
            assert_eq!(new_reference, Some(47.5));
        });
    }

    #[test]
    fn test_yaml_defaults() {
        let config: BpmConfig = serde_yaml::from_str("threshold_percent: 5.0\n").unwrap();
        assert_eq!(config.threshold_percent, 5.0);
        assert_eq!(config.trigger_value, "/exchange/data_white");
        assert_eq!(config.motors.len(), 2);
        let bad = BpmConfig {
            threshold_percent: 0.0,
            ..BpmConfig::default()
        };
        assert!(matches!(bad.validate(), Err(BpmError::InvalidConfig(_))));
        let endless = BpmConfig {
            poll_interval: f64::INFINITY,
            ..BpmConfig::default()
        };
        assert!(matches!(endless.validate(), Err(BpmError::InvalidConfig(_))));
    }
}
