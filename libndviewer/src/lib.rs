//! # ndviewer
//!
//! ndviewer is a live viewer for EPICS areaDetector image streams, written in Rust. It
//! polls an image PV, runs every frame through a configurable processing pipeline and
//! displays the result with histogram, region of interest and line profile tools. Beamline
//! specific tools (a motor scan with live mosaic stitching and a soft beam position
//! monitor) are available from the viewer and from the command line.
//!
//! ## Installation
//!
//! The only method of install is from source.
//!
//! ### Rust
//!
//! If you have not used Rust before, you will most likely need to install the Rust tool
//! chain. See the [Rust docs](https://www.rust-lang.org/tools/install) for installation
//! instructions.
//!
//! ### EPICS
//!
//! ndviewer talks to the control system through the EPICS command line tools `caget` and
//! `caput`, which must be in your path. Without them the viewer can still be run against
//! the built in simulated IOC using `--sim`.
//!
//! ### Building & Install
//!
//! To build and install the viewer use `cargo install --path ./ndviewer` from the top
//! level repository.
//!
//! To build and install the CLI use `cargo install --path ./ndviewer_cli` from the top
//! level repository.
//!
//! ## Processing pipeline
//!
//! Frames pass through the processors listed in a JSON file (by default
//! `pipelines/processors.json`), in order:
//!
//! ```json
//! {
//!   "hot_reload": true,
//!   "pipeline": [
//!     { "name": "flat", "module": "flat_field", "params": { "path": "flat.npy" } },
//!     { "module": "sum", "params": { "preview": true } },
//!     { "module": "invert", "enabled": false }
//!   ]
//! }
//! ```
//!
//! Available modules are `invert`, `sum` and `flat_field`. A processor which fails to
//! load or to run is logged and skipped. With `hot_reload` the file is re-read whenever it
//! changes.
//!
//! ## Configuration
//!
//! The motor scan, beam monitor and beamline selection are configured with YAML files.
//! Templates can be written using the `new-scan`, `new-bpm` and `new-beamline` commands
//! of the CLI. The viewer remembers the last PV in `~/.ndviewer/viewer_config.json`.
//!
//! ## Output
//!
//! Frames can be saved as `.npy`, `.png`, `.txt` or `.tiff`, recordings are written as
//! 16-bit TIFF stacks. The viewer writes a log file (`ndviewer.log` by default) containing
//! the detailed status of the application; if an error occurs check the log file.
pub mod accumulate;
pub mod beamline;
pub mod bpm;
pub mod config;
pub mod display;
pub mod error;
pub mod frame;
pub mod imageio;
pub mod line;
pub mod metrics;
pub mod mosaic;
pub mod ntnda;
pub mod pattern;
pub mod pipeline;
pub mod processors;
pub mod pv;
pub mod recorder;
pub mod roi;
pub mod scalebar;
pub mod scan_status;
pub mod subscriber;
