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

use serde::{Deserialize, Serialize};

/// Public information about a generation of the server side key backup.
///
/// All the fields are opaque, they are compared but never interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupVersionInfo {
    /// The version the server assigned to this backup generation.
    pub version: String,
    /// The algorithm the backup uses, for example
    /// `m.megolm_backup.v1.curve25519-aes-sha2`.
    pub algorithm: String,
    /// An integrity digest over the backup's public key, used to check a
    /// re-entered recovery key.
    pub digest: String,
}

/// What the server told us about the latest backup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeysBackupLastVersionResult {
    /// The server doesn't have any backup for us.
    NoBackupExists,
    /// The server has a backup with the given info.
    BackupExists(BackupVersionInfo),
}
