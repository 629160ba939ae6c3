// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! kiwi-exec
#![deny(unsafe_code)]

pub mod http;
pub mod subprocess;

pub use http::{AuthConfig, HttpConfig, HttpOutput};
pub use subprocess::{SubprocessConfig, SubprocessOutput};
