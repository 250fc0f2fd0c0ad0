//! In-memory notification list.
//!
//! Newest entries sit at the head. `unread_count()` always equals the number of
//! entries with `is_read == false`, and ids are unique. Entries are never removed
//! by the client.

use std::collections::{HashSet, VecDeque};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use super::model::{Notification, NotificationId};
use crate::error::Result;
use crate::http::{RequestGateway, RequestSpec};

const LIST_PATH: &str = "notifications/";
const MARK_ALL_PATH: &str = "notifications/mark_all_as_read/";

fn mark_one_path(id: NotificationId) -> String {
    format!("notifications/{id}/mark_as_read/")
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<Notification>,
    unread: usize,
    /// Pushes received so far; lets a bulk fetch tell which entries arrived during it.
    pushes: u64,
}

impl Inner {
    fn recount(&mut self) {
        self.unread = self.items.iter().filter(|n| !n.is_read).count();
    }

    fn set_read(&mut self, id: NotificationId, is_read: bool) -> bool {
        let Some(entry) = self.items.iter_mut().find(|n| n.id == id) else {
            return false;
        };
        if entry.is_read == is_read {
            return false;
        }
        entry.is_read = is_read;
        if is_read {
            self.unread -= 1;
        } else {
            self.unread += 1;
        }
        true
    }
}

pub struct NotificationStore {
    gateway: RequestGateway,
    inner: RwLock<Inner>,
    unread_tx: watch::Sender<usize>,
}

impl NotificationStore {
    pub fn new(gateway: RequestGateway) -> Self {
        let (unread_tx, _) = watch::channel(0);
        Self {
            gateway,
            inner: RwLock::new(Inner::default()),
            unread_tx,
        }
    }

    /// Fetch the list and replace the local copy.
    ///
    /// Pushes that arrived while the fetch was in flight and are missing from the
    /// response stay at the head. On failure the local list is untouched.
    #[instrument(skip(self))]
    pub async fn load_initial(&self) -> Result<Vec<Notification>> {
        let pushes_before = self.inner.read().pushes;
        let fetched: Vec<Notification> =
            self.gateway.call_json(&RequestSpec::get(LIST_PATH)).await?;

        let snapshot = {
            let mut inner = self.inner.write();
            let arrived = usize::try_from(inner.pushes - pushes_before).unwrap_or(usize::MAX);
            let fetched_ids: HashSet<NotificationId> = fetched.iter().map(|n| n.id).collect();

            let mut seen = HashSet::with_capacity(fetched.len() + arrived);
            let mut items: VecDeque<Notification> = inner
                .items
                .iter()
                .take(arrived)
                .filter(|n| !fetched_ids.contains(&n.id))
                .filter(|n| seen.insert(n.id))
                .cloned()
                .collect();
            items.extend(fetched.into_iter().filter(|n| seen.insert(n.id)));

            inner.items = items;
            inner.recount();
            debug!(count = inner.items.len(), unread = inner.unread, "Notifications loaded");
            self.publish(&inner);
            inner.items.iter().cloned().collect()
        };
        Ok(snapshot)
    }

    /// Place a pushed notification at the head.
    ///
    /// An entry with the same id is replaced rather than duplicated.
    pub fn receive_push(&self, notification: Notification) {
        let mut inner = self.inner.write();
        if let Some(pos) = inner.items.iter().position(|n| n.id == notification.id)
            && let Some(old) = inner.items.remove(pos)
            && !old.is_read
        {
            inner.unread -= 1;
        }
        if !notification.is_read {
            inner.unread += 1;
        }
        inner.items.push_front(notification);
        inner.pushes += 1;
        self.publish(&inner);
    }

    /// Mark one entry read and acknowledge it to the server.
    ///
    /// Returns `Ok(false)` without a network call if the entry is unknown or
    /// already read. The local flip is undone if the acknowledgment fails.
    #[instrument(skip(self))]
    pub async fn mark_as_read(&self, id: NotificationId) -> Result<bool> {
        if !self.mark_as_read_local(id) {
            return Ok(false);
        }

        if let Err(e) = self.gateway.call_empty(&RequestSpec::post(mark_one_path(id))).await {
            warn!(id, error = %e, "Acknowledgment failed; restoring unread state");
            let mut inner = self.inner.write();
            inner.set_read(id, false);
            self.publish(&inner);
            return Err(e);
        }
        Ok(true)
    }

    /// Mark every entry read and acknowledge it to the server.
    ///
    /// On failure only the entries this call flipped are restored.
    #[instrument(skip(self))]
    pub async fn mark_all_as_read(&self) -> Result<usize> {
        let flipped = self.flip_all();

        if let Err(e) = self.gateway.call_empty(&RequestSpec::post(MARK_ALL_PATH)).await {
            warn!(
                count = flipped.len(),
                error = %e,
                "Acknowledgment failed; restoring unread state"
            );
            let mut inner = self.inner.write();
            for id in &flipped {
                inner.set_read(*id, false);
            }
            self.publish(&inner);
            return Err(e);
        }
        Ok(flipped.len())
    }

    /// Local-only variant of [`mark_as_read`](Self::mark_as_read).
    pub fn mark_as_read_local(&self, id: NotificationId) -> bool {
        let mut inner = self.inner.write();
        let changed = inner.set_read(id, true);
        if changed {
            self.publish(&inner);
        }
        changed
    }

    /// Local-only variant of [`mark_all_as_read`](Self::mark_all_as_read).
    pub fn mark_all_as_read_local(&self) -> usize {
        self.flip_all().len()
    }

    fn flip_all(&self) -> Vec<NotificationId> {
        let mut inner = self.inner.write();
        let flipped: Vec<NotificationId> = inner
            .items
            .iter_mut()
            .filter(|n| !n.is_read)
            .map(|n| {
                n.is_read = true;
                n.id
            })
            .collect();
        inner.unread = 0;
        self.publish(&inner);
        flipped
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.read().items.iter().cloned().collect()
    }

    pub fn unread_count(&self) -> usize {
        self.inner.read().unread
    }

    pub fn get(&self, id: NotificationId) -> Option<Notification> {
        self.inner.read().items.iter().find(|n| n.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().items.is_empty()
    }

    /// Watch the unread count.
    pub fn subscribe_unread(&self) -> watch::Receiver<usize> {
        self.unread_tx.subscribe()
    }

    fn publish(&self, inner: &Inner) {
        self.unread_tx.send_replace(inner.unread);
    }
}
