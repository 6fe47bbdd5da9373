//! Keel Protocols
//!
//! Protocol layers built purely on `keel-core` handlers:
//! - DNS codec and asynchronous resolver (`dns`, feature `dns`)
//! - MQTT 3.1.1 codec, protocol layer and broker (`mqtt`, feature `mqtt`)

#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

#[cfg(feature = "dns")]
pub mod dns;

#[cfg(feature = "mqtt")]
pub mod mqtt;
