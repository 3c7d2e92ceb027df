//! # DS1000Z RS
//!
//! A Rust library for controlling Rigol DS1000Z series oscilloscopes over
//! the network and reading data out of them.
//!
//! This library speaks SCPI over the raw TCP socket the instruments expose
//! on port 5555, so no VISA stack is required. On top of the session layer
//! it provides waveform acquisition with calibrated voltages and
//! timestamps, display screenshots, measurements and mDNS discovery of
//! scopes on the local network.
//!
//! ## Features
//!
//! - **LAN control**: Plain TCP SCPI, a `\n` terminated command per line
//! - **Waveform acquisition**: Chunked readout of the screen trace or the
//!   full acquisition memory, calibrated to volts and seconds
//! - **Screenshots**: Uses `image` for decoding display captures, with
//!   optional dimming of the soft key menu column
//! - **Measurements**: One-shot and statistic `:MEASure` queries
//! - **mDNS discovery**: Uses `mdns-sd` for finding scopes on the network
//! - **Type safety**: Strong typing and error handling throughout
//!
//! ## Examples
//!
//! ### Connection and Waveform Readout
//!
//! ```rust,no_run
//! use ds1000z_rs::{Channel, Ds1000z, WaveformMode};
//!
//! // Connect to a scope by hostname or IP, port 5555 implied
//! let mut scope = Ds1000z::connect("192.168.1.23")?;
//! println!("Connected to {}", scope.idn()?);
//!
//! let waveform = scope.waveform_samples(Channel::Ch1, WaveformMode::Normal)?;
//! for (time, volts) in waveform.points() {
//!     println!("{time}\t{volts}");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Screenshot
//!
//! ```rust,no_run
//! use ds1000z_rs::Ds1000z;
//! use std::path::Path;
//!
//! let mut scope = Ds1000z::connect("192.168.1.23")?;
//! // Dim the menu column at half opacity and save as PNG
//! scope.save_screen(Path::new("scope.png"), 0.5)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Device Discovery
//!
//! ```rust,no_run
//! use ds1000z_rs::discovery::{discover, ScanWindow};
//!
//! for device in discover(&ScanWindow::default())? {
//!     println!("Found device: {} at {}", device.model, device.address);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod block;
pub mod discovery;
pub mod scope;
pub mod screen;
pub mod session;
pub mod transport;
pub mod waveform;

// Re-export the main types for convenience
pub use block::BinaryBlock;

pub use transport::{ConnectionConfig, TcpTransport, Transport, TransportError, DEFAULT_PORT};

pub use session::{ProtocolError, ScpiSession, SessionError, SessionState};

pub use scope::{Channel, Ds1000z, Identity, InvalidChannel, MeasurementType, TriggerStatus};

pub use waveform::{Preamble, Waveform, WaveformFormat, WaveformMode};

pub use screen::{ScreenCapture, ScreenError};

pub use discovery::{
    discover, select_single, DiscoveredDevice, DiscoveryError, DiscoverySession, ScanWindow,
};
