//! Access to EPICS process variables.
//!
//! Everything that talks to a PV goes through the [`PvClient`] trait. Two
//! backends are provided: [`SimulatedPv`], an in-memory table with motors
//! that settle instantly and synthetic cameras, and [`CaToolsPv`], which
//! shells out to the EPICS command line tools.

use fxhash::FxHashMap;
use ndarray::Array2;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt::Debug;
use std::process::Command;
use std::time::{Duration, Instant};

use super::error::PvError;
use super::frame::{now_timestamp, PixelType};
use super::ntnda::{NdAttribute, NdValue, NtNdArray, COLOR_MODE_ATTRIBUTE};
use super::pattern::Pattern;

pub const DEFAULT_MOTOR_TOLERANCE: f64 = 0.001;
pub const DEFAULT_MOTOR_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MOTOR_POLL: Duration = Duration::from_millis(100);
const DEMO_WIDTH: usize = 640;
const DEMO_HEIGHT: usize = 480;

pub trait PvClient: Send + Sync + Debug {
    fn get_f64(&self, name: &str) -> Result<f64, PvError>;
    fn get_string(&self, name: &str) -> Result<String, PvError>;
    /// Write a value. With `wait` set, block until the record finished processing or the timeout elapsed
    fn put_f64(&self, name: &str, value: f64, wait: Option<Duration>) -> Result<(), PvError>;
    fn get_image(&self, name: &str) -> Result<NtNdArray, PvError>;
}

/// Name of the readback field of a motor record
pub fn readback_name(motor: &str) -> String {
    format!("{motor}.RBV")
}

/// Poll the readback of `motor` until it is within `tolerance` of `target`.
///
/// Returns false if the timeout elapsed first. Read errors count as "not yet there".
pub fn wait_for_motor(
    client: &dyn PvClient,
    motor: &str,
    target: f64,
    tolerance: f64,
    timeout: Duration,
    poll: Duration,
) -> bool {
    let rbv = readback_name(motor);
    let start = Instant::now();
    loop {
        match client.get_f64(&rbv) {
            Ok(position) if (position - target).abs() <= tolerance => return true,
            Ok(_) => (),
            Err(e) => spdlog::debug!("Readback of {motor} failed while waiting: {e}"),
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(poll);
    }
}

/// Move a motor by `step` relative to its current readback. Returns the new target.
pub fn move_relative(client: &dyn PvClient, motor: &str, step: f64) -> Result<f64, PvError> {
    let current = client.get_f64(&readback_name(motor))?;
    let target = current + step;
    client.put_f64(motor, target, None)?;
    Ok(target)
}

#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    Number(f64),
    Text(String),
}

impl PvValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    fn as_string(&self) -> String {
        match self {
            Self::Number(v) => v.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

/// Produces an image from the current PV table (for example from motor positions) and the frame counter
pub type ImageSource = Box<dyn Fn(&dyn Fn(&str) -> Option<f64>, u64) -> Array2<u16> + Send + Sync>;

enum SimImage {
    Pattern {
        pattern: Pattern,
        width: usize,
        height: usize,
    },
    Source(ImageSource),
}

#[derive(Debug)]
struct SimState {
    values: FxHashMap<String, PvValue>,
    frame_counter: u64,
    rng: StdRng,
}

/// In-memory PV backend used by `--sim` and by tests.
///
/// Writing a PV also writes `<pv>.RBV`, so any PV behaves like a motor which
/// reaches its target immediately.
pub struct SimulatedPv {
    state: Mutex<SimState>,
    images: FxHashMap<String, SimImage>,
}

impl Debug for SimulatedPv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedPv")
            .field("values", &self.state.lock().values.len())
            .field("images", &self.images.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for SimulatedPv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPv {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                values: FxHashMap::default(),
                frame_counter: 0,
                rng: StdRng::seed_from_u64(0x5eed),
            }),
            images: FxHashMap::default(),
        }
    }

    /// Serve a synthetic pattern on image PV `name`
    pub fn with_pattern_image(
        mut self,
        name: &str,
        pattern: Pattern,
        width: usize,
        height: usize,
    ) -> Self {
        self.images.insert(
            name.to_string(),
            SimImage::Pattern {
                pattern,
                width,
                height,
            },
        );
        self
    }

    /// Serve images produced by `source` on image PV `name`
    pub fn with_image_source(mut self, name: &str, source: ImageSource) -> Self {
        self.images
            .insert(name.to_string(), SimImage::Source(source));
        self
    }

    /// Seed a PV with a value. Seeding a number also seeds its readback.
    pub fn with_value(self, name: &str, value: PvValue) -> Self {
        self.set_value(name, value);
        self
    }

    pub fn set_value(&self, name: &str, value: PvValue) {
        let mut state = self.state.lock();
        if let PvValue::Number(v) = value {
            state
                .values
                .insert(readback_name(name), PvValue::Number(v));
        }
        state.values.insert(name.to_string(), value);
    }

    /// Simulated IOC behind `--sim`: a `pattern` camera on every image PV and the seeded values
    pub fn demo(image_pvs: &[&str], pattern: Pattern, values: Vec<(String, PvValue)>) -> Self {
        let mut sim = Self::new();
        for pv in image_pvs {
            sim = sim.with_pattern_image(pv, pattern, DEMO_WIDTH, DEMO_HEIGHT);
        }
        for (name, value) in values {
            sim.set_value(&name, value);
        }
        sim
    }

    /// Remove a PV so that further reads fail
    pub fn remove_value(&self, name: &str) {
        self.state.lock().values.remove(name);
    }

    fn lookup(&self, name: &str) -> Result<PvValue, PvError> {
        self.state
            .lock()
            .values
            .get(name)
            .cloned()
            .ok_or_else(|| PvError::NotFound(name.to_string()))
    }
}

impl PvClient for SimulatedPv {
    fn get_f64(&self, name: &str) -> Result<f64, PvError> {
        let value = self.lookup(name)?;
        value
            .as_f64()
            .ok_or_else(|| PvError::BadValue(name.to_string(), value.as_string()))
    }

    fn get_string(&self, name: &str) -> Result<String, PvError> {
        Ok(self.lookup(name)?.as_string())
    }

    fn put_f64(&self, name: &str, value: f64, _wait: Option<Duration>) -> Result<(), PvError> {
        self.set_value(name, PvValue::Number(value));
        Ok(())
    }

    fn get_image(&self, name: &str) -> Result<NtNdArray, PvError> {
        let image = self
            .images
            .get(name)
            .ok_or_else(|| PvError::NotAnImage(name.to_string()))?;
        let mut state = self.state.lock();
        state.frame_counter += 1;
        let counter = state.frame_counter;
        let data = match image {
            SimImage::Pattern {
                pattern,
                width,
                height,
            } => pattern.generate(*width, *height, counter, &mut state.rng),
            SimImage::Source(source) => {
                let values = &state.values;
                let lookup = |pv: &str| values.get(pv).and_then(|v| v.as_f64());
                source(&lookup, counter)
            }
        };
        let (height, width) = data.dim();
        let mut array = NtNdArray::mono(
            counter as i64,
            width,
            height,
            NdValue::UShort(data.iter().copied().collect()),
        );
        array.timestamp = now_timestamp();
        Ok(array)
    }
}

/// Backend which drives the EPICS `caget`/`caput` command line tools.
///
/// Image PVs are areaDetector NDStdArrays plugin prefixes such as `13SIM1:image1:`.
#[derive(Debug, Clone)]
pub struct CaToolsPv {
    timeout: Duration,
}

impl Default for CaToolsPv {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
        }
    }
}

impl CaToolsPv {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn caget(&self, name: &str) -> Result<String, PvError> {
        let output = Command::new("caget")
            .arg("-t")
            .arg("-w")
            .arg(format!("{}", self.timeout.as_secs_f64()))
            .arg(name)
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("not connect") || stderr.contains("timeout") {
                return Err(PvError::NotFound(name.to_string()));
            }
            return Err(PvError::CommandFailed(
                String::from("caget"),
                name.to_string(),
                stderr,
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn get_usize(&self, name: &str) -> Result<usize, PvError> {
        let value = self.get_f64(name)?;
        if value < 0.0 {
            return Err(PvError::BadValue(name.to_string(), value.to_string()));
        }
        Ok(value as usize)
    }
}

/// Map an areaDetector DataType enum string to a pixel type
fn data_type_from_str(value: &str) -> Option<PixelType> {
    match value {
        "Int8" => Some(PixelType::I8),
        "UInt8" => Some(PixelType::U8),
        "Int16" => Some(PixelType::I16),
        "UInt16" => Some(PixelType::U16),
        "Int32" => Some(PixelType::I32),
        "UInt32" => Some(PixelType::U32),
        "Int64" => Some(PixelType::I64),
        "UInt64" => Some(PixelType::U64),
        "Float32" => Some(PixelType::F32),
        "Float64" => Some(PixelType::F64),
        _ => None,
    }
}

/// Parse `caget -t` waveform output, which may be prefixed with the element count
fn parse_waveform(name: &str, text: &str) -> Result<Vec<f64>, PvError> {
    let mut values = text
        .split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|_| PvError::BadValue(name.to_string(), tok.to_string()))
        })
        .collect::<Result<Vec<f64>, PvError>>()?;
    if let Some(first) = values.first() {
        if *first as usize == values.len() - 1 && first.fract() == 0.0 {
            values.remove(0);
        }
    }
    Ok(values)
}

impl PvClient for CaToolsPv {
    fn get_f64(&self, name: &str) -> Result<f64, PvError> {
        let text = self.caget(name)?;
        text.parse::<f64>()
            .map_err(|_| PvError::BadValue(name.to_string(), text))
    }

    fn get_string(&self, name: &str) -> Result<String, PvError> {
        self.caget(name)
    }

    fn put_f64(&self, name: &str, value: f64, wait: Option<Duration>) -> Result<(), PvError> {
        let mut cmd = Command::new("caput");
        cmd.arg("-t");
        if let Some(timeout) = wait {
            cmd.arg("-c").arg("-w").arg(format!("{}", timeout.as_secs_f64()));
        }
        let output = cmd.arg(name).arg(format!("{value}")).output()?;
        if !output.status.success() {
            return Err(PvError::CommandFailed(
                String::from("caput"),
                name.to_string(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn get_image(&self, prefix: &str) -> Result<NtNdArray, PvError> {
        let ndims = self.get_usize(&format!("{prefix}NDimensions_RBV"))?;
        if ndims == 0 || ndims > 3 {
            return Err(PvError::NotAnImage(prefix.to_string()));
        }
        let mut dimensions = Vec::with_capacity(ndims);
        for axis in 0..ndims {
            dimensions.push(self.get_usize(&format!("{prefix}ArraySize{axis}_RBV"))?);
        }
        let color_mode = self.get_f64(&format!("{prefix}ColorMode_RBV")).unwrap_or(0.0);
        let unique_id = self.get_f64(&format!("{prefix}UniqueId_RBV"))? as i64;
        let pixel_type = self
            .get_string(&format!("{prefix}DataType_RBV"))
            .ok()
            .and_then(|s| data_type_from_str(&s))
            .unwrap_or(PixelType::F64);

        let data_pv = format!("{prefix}ArrayData");
        let mut values = parse_waveform(&data_pv, &self.caget(&data_pv)?)?;
        let expected: usize = dimensions.iter().product();
        values.truncate(expected);

        Ok(NtNdArray {
            unique_id,
            timestamp: now_timestamp(),
            dimensions,
            attributes: vec![NdAttribute {
                name: String::from(COLOR_MODE_ATTRIBUTE),
                value: color_mode,
            }],
            value: NdValue::from_f64(pixel_type, &values),
        })
    }
}
