// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_debug_implementations)]

pub mod backups;
pub mod config;
pub mod error;
pub mod gossiping;
pub mod identities;
mod machine;
pub mod rendezvous;
pub mod secret;
pub mod store;
pub mod types;
mod utilities;
pub mod verification;

pub use backups::{BackupDecision, BackupStorage, KeysBackupResolver};
pub use config::{DeviceTrustConfig, RendezvousSettings, VerificationSettings};
pub use error::{BackupError, ErrorKind, RendezvousError, TransportError, VerificationError};
pub use gossiping::{KeyGossipCoordinator, RoomKeySource};
pub use identities::{Device, LocalTrust};
pub use machine::DeviceTrustMachine;
pub use rendezvous::{PairingCode, RendezvousChannel, RendezvousId, RendezvousTransport};
pub use secret::{PairingSecret, SharedSecretGenerator};
pub use store::{TrustChange, TrustStore};
pub use types::{CancelCode, VerificationTxState};
pub use utilities::AsyncTraitDeps;
pub use verification::{VerificationMachine, VerificationTransaction};

#[cfg(all(test, not(target_arch = "wasm32")))]
#[ctor::ctor]
fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
}
