//! DCF MAC crate prelude
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

pub use crate::{Address, Ts, Channel};

pub use crate::mac::{Mac, LinkLayer, Transmission};
pub use crate::mac::config::MacConfig;

pub use crate::error::MacError;
pub use crate::status::{Command, SlotSelection, Status};
pub use crate::timer::{Timer as MacTimer, SystemTimer};
