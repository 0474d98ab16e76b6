// src/io/serial/mod.rs
//
// Serial session engine.
//
// Features:
// - Port registry (authorized ports, user authorization, stable ids)
// - Single active session with connect/disconnect/send/resend
// - Background read loop with immediate or delimiter framing
// - Native (serialport) and simulated transports

pub mod framer;
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub mod native;
pub mod registry;
pub mod session;
pub mod simulated;

pub use framer::{FrameAssembler, FramingPolicy, SerialFrame};
pub use registry::{PortDescriptor, PortRegistry};
pub use session::{SessionController, SessionOptions, SessionStatus};
