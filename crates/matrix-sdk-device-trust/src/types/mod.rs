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

//! Types shared by the components of this crate, the verification vocabulary
//! and the contents of the messages we exchange with other devices.

mod backup;
mod cancel;
mod events;

pub use backup::{BackupVersionInfo, KeysBackupLastVersionResult};
pub use cancel::{CancelCode, CancelInfo, VerificationTxState};
pub use events::{
    AcceptContent, CancelContent, ExportedRoomKey, KeyRequestAction, MacContent, ReadyContent,
    RequestContent, RequestedKeyInfo, RoomKeyRequestContent, StartContent, StartMethod,
    VerificationContent, VerificationMessage, VerificationMethod,
};
