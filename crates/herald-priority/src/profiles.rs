//! In-memory sender profile table.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, RwLock};

use herald_core::types::{SenderProfile, Timestamp};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug)]
struct Slot {
    profile: SenderProfile,
    /// Set once the entry has left the table. Waiters that acquire a retired
    /// slot start over with a fresh lookup.
    retired: bool,
}

type Entry = Arc<Mutex<Slot>>;

/// Exclusive access to one live profile. The lock is owned, so it can be
/// held across awaits such as a write to persistence.
#[derive(Debug)]
pub struct ProfileGuard(OwnedMutexGuard<Slot>);

impl Deref for ProfileGuard {
    type Target = SenderProfile;

    fn deref(&self) -> &SenderProfile {
        &self.0.profile
    }
}

impl DerefMut for ProfileGuard {
    fn deref_mut(&mut self) -> &mut SenderProfile {
        &mut self.0.profile
    }
}

/// Sender profiles keyed by sender identifier.
///
/// The map lock is only held to find or create an entry; updates then lock
/// that sender's own mutex. Writes for one sender are serialized while
/// different senders never contend.
#[derive(Debug, Default)]
pub struct ProfileStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, sender: &str) -> Option<Entry> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(sender)
            .cloned()
    }

    fn entry(&self, sender: &str, now: Timestamp) -> Entry {
        if let Some(entry) = self.lookup(sender) {
            return entry;
        }
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(entries.entry(sender.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Slot {
                profile: SenderProfile::new(sender, now),
                retired: false,
            }))
        }))
    }

    /// Lock the sender's profile, creating it on first use.
    pub async fn lock(&self, sender: &str, now: Timestamp) -> ProfileGuard {
        loop {
            let slot = self.entry(sender, now).lock_owned().await;
            if !slot.retired {
                return ProfileGuard(slot);
            }
        }
    }

    /// Lock the sender's profile only if one exists.
    pub async fn lock_existing(&self, sender: &str) -> Option<ProfileGuard> {
        loop {
            let slot = self.lookup(sender)?.lock_owned().await;
            if !slot.retired {
                return Some(ProfileGuard(slot));
            }
        }
    }

    /// Take a locked profile out of the table. Anyone queued on the same
    /// entry sees it retired once the guard drops.
    pub fn retire(&self, mut guard: ProfileGuard) {
        guard.0.retired = true;
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let current = entries
            .get(&guard.0.profile.sender)
            .is_some_and(|e| Arc::ptr_eq(e, OwnedMutexGuard::mutex(&guard.0)));
        if current {
            entries.remove(&guard.0.profile.sender);
        }
    }

    /// Snapshot of one profile.
    pub async fn get(&self, sender: &str) -> Option<SenderProfile> {
        let guard = self.lock_existing(sender).await?;
        Some((*guard).clone())
    }

    /// Apply `f` to the sender's profile under its lock, creating the
    /// profile on first use.
    pub async fn update<F, R>(&self, sender: &str, now: Timestamp, f: F) -> R
    where
        F: FnOnce(&mut SenderProfile) -> R,
    {
        let mut guard = self.lock(sender, now).await;
        f(&mut *guard)
    }

    /// Insert or replace a profile, e.g. when hydrating from persistence.
    pub async fn insert(&self, profile: SenderProfile) {
        let mut guard = self.lock(&profile.sender, profile.first_seen).await;
        *guard = profile;
    }

    /// Remove a profile once its current holder, if any, is done with it.
    pub async fn remove(&self, sender: &str) -> bool {
        match self.lock_existing(sender).await {
            Some(guard) => {
                self.retire(guard);
                true
            }
            None => false,
        }
    }

    pub async fn all(&self) -> Vec<SenderProfile> {
        let entries: Vec<Entry> = self
            .entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        let mut profiles = Vec::with_capacity(entries.len());
        for entry in entries {
            let slot = entry.lock().await;
            if !slot.retired {
                profiles.push(slot.profile.clone());
            }
        }
        profiles
    }

    /// Highest-weighted senders first, ties broken by sender name.
    pub async fn top_senders(&self, limit: usize) -> Vec<SenderProfile> {
        let mut profiles = self.all().await;
        profiles.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.sender.cmp(&b.sender))
        });
        profiles.truncate(limit);
        profiles
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
