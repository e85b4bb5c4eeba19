//! NTRIP client and relay between a serial GNSS receiver and an NTRIP
//! correction caster.
//!
//! NMEA position fixes read from the receiver are submitted to the caster,
//! RTCM correction data streamed by the caster is written back to the
//! receiver.

use uuid::{uuid, Uuid};

/// UUID of the Bluetooth Serial Port Profile (SPP).
///
/// Defined as `00001101-0000-1000-8000-00805f9b34fb`.
pub const SPP_UUID: Uuid = uuid!("00001101-0000-1000-8000-00805f9b34fb");

pub mod caster;
pub mod nmea;
pub mod relay;
