// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration: how entities find each other.
//!
//! Every entity periodically broadcasts a [`RegistrationSample`]; each
//! context folds the samples it sees into a [`RegistrationDirectory`]
//! and drops entries that were not refreshed within the timeout. The
//! directory is eventually consistent: two contexts may briefly disagree.

mod directory;
mod expmap;
mod provider;
mod receiver;
mod sample;

pub use directory::{DirectoryEvent, RegistrationDirectory, ServiceInfo, TopicInfo};
pub use expmap::ExpiringMap;
pub use provider::RegistrationProvider;
pub use receiver::{registration_destination, RegistrationReceiver, SampleHandler};
pub use sample::{EntityKind, MethodRegistration, RegistrationCmd, RegistrationSample};
