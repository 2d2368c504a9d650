//! Firmware core of a networked precision-measurement appliance.
//!
//! A single 24-bit converter is time-multiplexed across up to ten logical
//! measurement channels. Samples are averaged per channel, optionally
//! transformed by a streaming real FFT, and pushed to subscribed clients
//! over a binary protocol (ADCP) carried on raw TCP or WebSocket.
//! Configuration persists as a packed state image on disk.
//!
//! The crate splits along the data path:
//!
//! - [`adc`]: the converter port and a simulated driver
//! - [`measure`]: acquisition dispatch, channel registry, state, watchdog
//! - [`fft`]: per-channel windowed, 50 %-overlapped streaming real FFT
//! - [`stream`]: descriptor pool, marker queues and the sender fibers
//! - [`net`]: the TCP/WebSocket server and the ADCP dispatcher
//! - [`instrument`]: wiring and boot

pub mod adc;
pub mod clock;
pub mod config;
pub mod error;
pub mod fft;
pub mod instrument;
pub mod measure;
pub mod net;
pub mod pool;
pub mod queue;
pub mod sd_config;
pub mod stream;

pub use error::ResponseCode;
pub use instrument::Instrument;
