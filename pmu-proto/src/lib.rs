//! # pmu-proto
//!
//! Wire types for the host <-> PMU firmware command/message protocol.
//!
//! This crate defines the byte layouts exchanged through the shared DMEM
//! queues:
//! - [`PmuHdr`](hdr::PmuHdr): 4-byte frame header shared by commands and messages
//! - [`pg`]: power-gating unit bodies (ELPG, statistics, buffer load, ZBC, adaptive power)
//! - [`perfmon`]: performance monitor commands and events
//! - [`event`]: thermal, perf and RC (unhandled command) messages
//! - [`init`]: the firmware's first message, reporting queue geometry
//! - [`abi`]: the [`FirmwareAbi`](abi::FirmwareAbi) trait covering layouts that
//!   change between firmware releases
//!
//! All wire structs are `#[repr(C)]` with `zerocopy` derives, so decoding is a
//! bounds-checked prefix read and encoding is `as_bytes()`.
//!
//! # no_std
//!
//! This crate is `#![no_std]` and does not allocate.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod abi;
pub mod alloc;
pub mod error;
pub mod event;
pub mod hdr;
pub mod init;
pub mod perfmon;
pub mod pg;

// Re-export commonly used types
pub use abi::{AbiVersion, FirmwareAbi, select_abi};
pub use error::AbiError;
pub use hdr::{HDR_SIZE, PmuHdr, ctrl_flags, unit};
pub use init::QueueInfo;
