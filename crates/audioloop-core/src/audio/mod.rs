//! Audio loopback module
//!
//! - sample format and queue: [`spec`], [`queue`]
//! - the two real-time paths: [`input`], [`output`]
//! - rate/latency control: [`controller`], driven by [`runtime`] or [`session`]
//! - devices: [`device`] capability traits, [`virtual_device`], cpal [`engine`]

pub mod controller;
pub mod device;
pub mod engine;
pub mod input;
pub mod message;
pub mod output;
pub mod queue;
pub mod resampler;
pub mod runtime;
pub mod session;
pub mod spec;
pub mod virtual_device;
