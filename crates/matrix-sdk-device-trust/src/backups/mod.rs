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

//! Deciding which server side key backup we trust.
//!
//! The server only ever tells us which backup version is the latest one. We
//! keep a local trust anchor, the backup we decided to trust, and never
//! replace it silently. If the server has a different backup than the one we
//! trust, the user has to prove that the new backup is legitimate by entering
//! its recovery key.

use std::{
    future,
    sync::{Arc, RwLock as StdRwLock},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use futures_core::Stream;
use futures_util::{pin_mut, StreamExt};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{BackupError, BackupFetchError},
    store::TrustChange,
    types::{BackupVersionInfo, KeysBackupLastVersionResult},
    utilities::AsyncTraitDeps,
};

/// The server side storage of key backups.
#[async_trait]
pub trait BackupStorage: AsyncTraitDeps {
    /// Ask the server for the latest backup version.
    async fn fetch_latest_version(&self) -> Result<KeysBackupLastVersionResult, BackupFetchError>;
}

/// What should happen with the key backup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupDecision {
    /// There is no backup, neither locally nor on the server.
    NoBackup,
    /// We don't trust any backup yet, the one on the server can be adopted.
    AdoptRemote(BackupVersionInfo),
    /// The server has the backup we trust.
    KeepLocal,
    /// The backup we trust was deleted on the server, backups should be
    /// disabled.
    RemoteDeleted { local: BackupVersionInfo },
    /// The server has a different backup than the one we trust. The user needs
    /// to re-enter the recovery key of the remote backup to replace ours.
    Conflict { local: BackupVersionInfo, remote: BackupVersionInfo },
}

/// Decide what to do given the latest backup on the server and the backup we
/// trust locally.
///
/// Failing to fetch the remote backup is an error and is never treated as if
/// no backup existed.
pub fn resolve_latest(
    remote: Result<KeysBackupLastVersionResult, BackupFetchError>,
    local: Option<&BackupVersionInfo>,
) -> Result<BackupDecision, BackupError> {
    Ok(match (remote?, local) {
        (KeysBackupLastVersionResult::NoBackupExists, None) => BackupDecision::NoBackup,
        (KeysBackupLastVersionResult::NoBackupExists, Some(local)) => {
            BackupDecision::RemoteDeleted { local: local.clone() }
        }
        (KeysBackupLastVersionResult::BackupExists(remote), None) => {
            BackupDecision::AdoptRemote(remote)
        }
        // A backup with our version but other keys is still another backup.
        (KeysBackupLastVersionResult::BackupExists(remote), Some(local)) => {
            if remote == *local {
                BackupDecision::KeepLocal
            } else {
                BackupDecision::Conflict { local: local.clone(), remote }
            }
        }
    })
}

/// Calculate the digest of a recovery key, the recovery key is the unpadded
/// base64 encoding of the backup secret, whitespace is ignored.
pub fn recovery_key_digest(recovery_key: &str) -> Result<String, base64::DecodeError> {
    let recovery_key: String = recovery_key.split_whitespace().collect();
    let secret = zeroize::Zeroizing::new(STANDARD_NO_PAD.decode(recovery_key)?);

    Ok(STANDARD_NO_PAD.encode(Sha256::digest(&*secret)))
}

/// Keeps the local backup trust anchor and resolves it against the latest
/// backup of the server.
#[derive(Clone, Debug)]
pub struct KeysBackupResolver {
    storage: Arc<dyn BackupStorage>,
    local: Arc<StdRwLock<Option<BackupVersionInfo>>>,
    decisions: broadcast::Sender<BackupDecision>,
}

impl KeysBackupResolver {
    /// Create a new resolver, `local` is the backup we trusted previously.
    pub fn new(storage: Arc<dyn BackupStorage>, local: Option<BackupVersionInfo>) -> Self {
        let (decisions, _) = broadcast::channel(100);

        Self { storage, local: Arc::new(StdRwLock::new(local)), decisions }
    }

    /// The backup we currently trust.
    pub fn local_version(&self) -> Option<BackupVersionInfo> {
        self.local.read().unwrap().clone()
    }

    /// Fetch the latest backup and decide what to do with it.
    ///
    /// This never changes the local trust anchor.
    #[instrument(skip_all)]
    pub async fn resolve(&self) -> Result<BackupDecision, BackupError> {
        let remote = self.storage.fetch_latest_version().await;
        let local = self.local_version();

        let decision = resolve_latest(remote, local.as_ref()).inspect_err(|e| {
            warn!("Couldn't resolve the latest backup version: {e}");
        })?;

        debug!(?decision, "Resolved the latest backup version");

        // Nobody might be listening, that's fine.
        let _ = self.decisions.send(decision.clone());

        Ok(decision)
    }

    /// Like [`KeysBackupResolver::resolve()`] but adopts the remote backup if
    /// we don't trust any backup yet.
    pub async fn resolve_and_adopt(&self) -> Result<BackupDecision, BackupError> {
        let decision = self.resolve().await?;

        if let BackupDecision::AdoptRemote(remote) = &decision {
            self.adopt(remote.clone())?;
        }

        Ok(decision)
    }

    /// Trust the given backup.
    ///
    /// Fails if we already trust a different backup, even one with the same
    /// version, use [`KeysBackupResolver::trust_and_replace()`] for that.
    pub fn adopt(&self, remote: BackupVersionInfo) -> Result<(), BackupError> {
        let mut local = self.local.write().unwrap();

        match &*local {
            Some(trusted) if *trusted != remote => {
                Err(BackupError::TrustConflict {
                    local: Box::new(trusted.clone()),
                    remote: Box::new(remote),
                })
            }
            _ => {
                info!(version = remote.version.as_str(), "Trusting the backup");
                *local = Some(remote);

                Ok(())
            }
        }
    }

    /// Replace the backup we trust with the given one, the user needs to have
    /// entered the recovery key of the new backup.
    pub fn trust_and_replace(
        &self,
        remote: BackupVersionInfo,
        recovery_key: &str,
    ) -> Result<(), BackupError> {
        let matches = recovery_key_digest(recovery_key)
            .is_ok_and(|digest| digest.as_bytes().ct_eq(remote.digest.as_bytes()).into());

        if !matches {
            warn!(version = remote.version.as_str(), "The recovery key doesn't match the backup");
            return Err(BackupError::RecoveryKeyMismatch { version: remote.version });
        }

        let mut local = self.local.write().unwrap();

        info!(
            old_version = ?local.as_ref().map(|l| l.version.as_str()),
            version = remote.version.as_str(),
            "Replacing the trusted backup"
        );

        *local = Some(remote);

        Ok(())
    }

    /// Stop trusting any backup, e.g. because the backup we trusted was
    /// deleted. Returns the backup we trusted.
    pub fn disable(&self) -> Option<BackupVersionInfo> {
        let previous = self.local.write().unwrap().take();

        if let Some(previous) = &previous {
            info!(version = previous.version.as_str(), "No longer trusting the backup");
        }

        previous
    }

    /// Receive every decision [`KeysBackupResolver::resolve()`] makes.
    pub fn decisions(&self) -> impl Stream<Item = BackupDecision> + use<> {
        BroadcastStream::new(self.decisions.subscribe()).filter_map(|result| {
            future::ready(match result {
                Ok(decision) => Some(decision),
                Err(BroadcastStreamRecvError::Lagged(lag)) => {
                    warn!("The backup decision stream missed {lag} updates");
                    None
                }
            })
        })
    }

    /// Resolve the backup again every time a device gets verified, until the
    /// stream ends.
    ///
    /// A newly verified device might have created a new backup.
    pub async fn resolve_on_trust_changes(&self, changes: impl Stream<Item = TrustChange>) {
        pin_mut!(changes);

        while let Some(change) = changes.next().await {
            if change.trusted {
                // Errors are logged by resolve() and the next change retries.
                let _ = self.resolve().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex as StdMutex},
    };

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
    use futures_util::{pin_mut, stream, FutureExt, StreamExt};
    use proptest::prelude::*;
    use ruma::{device_id, user_id};
    use similar_asserts::assert_eq;

    use super::{
        recovery_key_digest, resolve_latest, BackupDecision, BackupStorage, KeysBackupResolver,
    };
    use crate::{
        error::{BackupError, BackupFetchError},
        store::TrustChange,
        types::{BackupVersionInfo, KeysBackupLastVersionResult},
    };

    const RECOVERY_KEY: &str = "cmVjb3Zlcnkga2V5IG9mIHRoZSBzZWNvbmQgYmFja3Vw";

    fn info(version: &str) -> BackupVersionInfo {
        BackupVersionInfo {
            version: version.to_owned(),
            algorithm: "m.megolm_backup.v1.curve25519-aes-sha2".to_owned(),
            digest: recovery_key_digest(RECOVERY_KEY).unwrap(),
        }
    }

    #[derive(Debug, Default)]
    struct MockStorage {
        responses: StdMutex<VecDeque<Result<KeysBackupLastVersionResult, BackupFetchError>>>,
    }

    impl MockStorage {
        fn respond(&self, response: Result<KeysBackupLastVersionResult, BackupFetchError>) {
            self.responses.lock().unwrap().push_back(response);
        }
    }

    #[async_trait]
    impl BackupStorage for MockStorage {
        async fn fetch_latest_version(
            &self,
        ) -> Result<KeysBackupLastVersionResult, BackupFetchError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackupFetchError::Network("no response".to_owned())))
        }
    }

    #[test]
    fn resolution_table() {
        use KeysBackupLastVersionResult::*;

        assert_eq!(resolve_latest(Ok(NoBackupExists), None).unwrap(), BackupDecision::NoBackup);
        assert_eq!(
            resolve_latest(Ok(BackupExists(info("1"))), None).unwrap(),
            BackupDecision::AdoptRemote(info("1"))
        );
        assert_eq!(
            resolve_latest(Ok(BackupExists(info("1"))), Some(&info("1"))).unwrap(),
            BackupDecision::KeepLocal
        );
        assert_eq!(
            resolve_latest(Ok(BackupExists(info("2"))), Some(&info("1"))).unwrap(),
            BackupDecision::Conflict { local: info("1"), remote: info("2") }
        );
        assert_eq!(
            resolve_latest(Ok(NoBackupExists), Some(&info("1"))).unwrap(),
            BackupDecision::RemoteDeleted { local: info("1") }
        );

        // A failure is never the same as no backup.
        assert_matches!(
            resolve_latest(Err(BackupFetchError::Network("timeout".to_owned())), Some(&info("1"))),
            Err(BackupError::Fetch(BackupFetchError::Network(_)))
        );
    }

    #[tokio::test]
    async fn conflicts_need_the_recovery_key() {
        let storage = Arc::new(MockStorage::default());
        let resolver = KeysBackupResolver::new(storage.clone(), Some(info("1")));

        storage.respond(Ok(KeysBackupLastVersionResult::BackupExists(info("2"))));
        let decision = resolver.resolve_and_adopt().await.unwrap();
        let remote = assert_matches!(decision, BackupDecision::Conflict { remote, .. } => remote);

        // The conflict is never resolved silently.
        assert_eq!(resolver.local_version(), Some(info("1")));
        assert_matches!(resolver.adopt(remote.clone()), Err(BackupError::TrustConflict { .. }));

        let wrong_key = STANDARD_NO_PAD.encode(b"some other key");
        let version = assert_matches!(
            resolver.trust_and_replace(remote.clone(), &wrong_key),
            Err(BackupError::RecoveryKeyMismatch { version }) => version
        );
        assert_eq!(version, "2");
        assert_matches!(
            resolver.trust_and_replace(remote.clone(), "not base64!"),
            Err(BackupError::RecoveryKeyMismatch { .. })
        );

        resolver.trust_and_replace(remote, RECOVERY_KEY).unwrap();
        assert_eq!(resolver.local_version(), Some(info("2")));
    }

    #[tokio::test]
    async fn same_version_with_other_keys_is_a_conflict() {
        let storage = Arc::new(MockStorage::default());
        let resolver = KeysBackupResolver::new(storage.clone(), Some(info("1")));

        let mut impostor = info("1");
        impostor.digest = recovery_key_digest(&STANDARD_NO_PAD.encode(b"other key")).unwrap();

        storage.respond(Ok(KeysBackupLastVersionResult::BackupExists(impostor.clone())));
        assert_eq!(
            resolver.resolve_and_adopt().await.unwrap(),
            BackupDecision::Conflict { local: info("1"), remote: impostor.clone() }
        );

        assert_matches!(resolver.adopt(impostor.clone()), Err(BackupError::TrustConflict { .. }));

        let mut other_algorithm = info("1");
        other_algorithm.algorithm = "org.example.backup.v2".to_owned();
        assert_matches!(resolver.adopt(other_algorithm), Err(BackupError::TrustConflict { .. }));
        assert_eq!(resolver.local_version(), Some(info("1")));

        // Adopting the backup we already trust is fine.
        resolver.adopt(info("1")).unwrap();
        assert_eq!(resolver.local_version(), Some(info("1")));
    }

    #[tokio::test]
    async fn adopting_and_disabling() {
        let storage = Arc::new(MockStorage::default());
        let resolver = KeysBackupResolver::new(storage.clone(), None);

        storage.respond(Ok(KeysBackupLastVersionResult::BackupExists(info("1"))));
        assert_eq!(resolver.resolve().await.unwrap(), BackupDecision::AdoptRemote(info("1")));
        // Resolving alone doesn't adopt anything.
        assert_eq!(resolver.local_version(), None);

        storage.respond(Ok(KeysBackupLastVersionResult::BackupExists(info("1"))));
        resolver.resolve_and_adopt().await.unwrap();
        assert_eq!(resolver.local_version(), Some(info("1")));

        storage.respond(Ok(KeysBackupLastVersionResult::NoBackupExists));
        let local = assert_matches!(
            resolver.resolve().await.unwrap(),
            BackupDecision::RemoteDeleted { local } => local
        );
        assert_eq!(resolver.disable(), Some(local));
        assert_eq!(resolver.local_version(), None);

        assert_matches!(resolver.resolve().await, Err(BackupError::Fetch(_)));
    }

    #[tokio::test]
    async fn decisions_are_published() {
        let storage = Arc::new(MockStorage::default());
        let resolver = KeysBackupResolver::new(storage.clone(), Some(info("1")));

        let decisions = resolver.decisions();
        pin_mut!(decisions);

        let change = |trusted| TrustChange {
            user_id: user_id!("@alice:localhost").to_owned(),
            device_id: device_id!("ALICEDEVICE").to_owned(),
            trusted,
        };

        storage.respond(Ok(KeysBackupLastVersionResult::BackupExists(info("1"))));
        storage.respond(Ok(KeysBackupLastVersionResult::BackupExists(info("2"))));

        resolver
            .resolve_on_trust_changes(stream::iter([change(true), change(false), change(true)]))
            .await;

        assert_eq!(decisions.next().await, Some(BackupDecision::KeepLocal));
        assert_matches!(decisions.next().await, Some(BackupDecision::Conflict { .. }));
        assert!(decisions.next().now_or_never().is_none());
    }

    fn backup_strategy() -> impl Strategy<Value = Option<BackupVersionInfo>> {
        proptest::option::of(("[0-9]{1,2}", "[a-c]").prop_map(|(version, digest)| {
            BackupVersionInfo { digest, ..info(&version) }
        }))
    }

    proptest! {
        #[test]
        fn resolution_never_replaces_a_different_local_backup(
            remote in backup_strategy(),
            local in backup_strategy(),
        ) {
            let result = match remote.clone() {
                Some(remote) => KeysBackupLastVersionResult::BackupExists(remote),
                None => KeysBackupLastVersionResult::NoBackupExists,
            };

            let first = resolve_latest(Ok(result.clone()), local.as_ref()).unwrap();
            let second = resolve_latest(Ok(result), local.as_ref()).unwrap();
            prop_assert_eq!(&first, &second);

            match (&first, &local, &remote) {
                (BackupDecision::AdoptRemote(_), Some(_), _) => {
                    prop_assert!(false, "Adopted a backup while trusting another one");
                }
                (BackupDecision::KeepLocal, Some(local), Some(remote)) => {
                    prop_assert_eq!(local, remote);
                }
                (BackupDecision::Conflict { .. }, Some(local), Some(remote)) => {
                    prop_assert_ne!(local, remote);
                }
                _ => {}
            }
        }
    }
}
