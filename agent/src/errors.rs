// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The error results used by this library.

use lpm::prefix::PrefixError;
use thiserror::Error;

use crate::hw::device::DeviceError;
use crate::types::{InterfaceId, RouterId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("switch is not ready: {0}")]
    NotReady(&'static str),

    #[error("no VRF with id {0}")]
    NoSuchVrf(RouterId),

    #[error("no such interface (ifindex {0})")]
    NoSuchInterface(InterfaceId),

    #[error("no such route")]
    NoSuchRoute,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("label {0} is outside the programmable range")]
    InvalidLabel(u32),

    #[error(transparent)]
    InvalidPrefix(#[from] PrefixError),

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("hardware programming failed: {0}")]
    HwProgrammingFailed(#[from] DeviceError),

    #[error("internal error: {0}")]
    Internal(&'static str),
}
