//! DVR protocol detection.
//!
//! A DVR record is matched against a fixed priority chain of handler kinds
//! (RTSP, ONVIF, Proprietary, Web, Analog). A kind is only constructed when
//! the record carries every key of its static descriptor, and only selected
//! when its bounded-time connection probe succeeds.

mod descriptor;
mod detector;
mod handlers;

pub use descriptor::{
    DvrCapabilityDescriptor, DvrConfig, HandlerKind, CAPABILITIES, DEFAULT_FETCH_DELAY,
    DEFAULT_PROBE_TIMEOUT,
};
pub use detector::{
    DvrHandler, HandlerFactory, ProbeOutcome, ProbeReport, ProtocolDetector, Survey,
};
pub use handlers::{
    AnalogHandler, DefaultHandlerFactory, OnvifHandler, ProprietaryHandler, RtspHandler,
    WebHandler,
};
