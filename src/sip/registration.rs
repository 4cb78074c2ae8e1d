use std::net::IpAddr;
use std::time::Instant;

use rsip::Uri;

use crate::error::{Error, Result};
use crate::net::HostResolver;
use crate::sip::compare::{compare_url_pinned, compare_url_strict};

#[derive(Debug, Clone)]
pub struct RegistrationEntry {
    /// Contact URI the UA is really reachable at.
    pub true_uri: Uri,
    /// To URI of the REGISTER.
    pub registered_uri: Uri,
    /// URI presented to the public side in place of `true_uri`.
    pub masqueraded_uri: Uri,
    pub true_ip: Option<IpAddr>,
    /// Addresses the registered and masqueraded hosts resolved to at the
    /// last REGISTER.
    pub registered_ip: Option<IpAddr>,
    pub masqueraded_ip: Option<IpAddr>,
    /// Top Via of the last REGISTER; answers that carry no further Via go
    /// back along it.
    pub last_via: Option<String>,
    pub expires_at: Instant,
}

impl RegistrationEntry {
    pub fn is_active(&self, now: Instant) -> bool {
        self.expires_at >= now
    }

    pub fn matches_registered(&self, uri: &Uri, resolver: &HostResolver) -> bool {
        compare_url_pinned(&self.registered_uri, self.registered_ip, uri, resolver)
    }

    pub fn matches_masqueraded(&self, uri: &Uri, resolver: &HostResolver) -> bool {
        compare_url_pinned(&self.masqueraded_uri, self.masqueraded_ip, uri, resolver)
    }

    pub fn matches_contact(&self, uri: &Uri, resolver: &HostResolver) -> bool {
        compare_url_pinned(&self.true_uri, self.true_ip, uri, resolver)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationHandle(usize);

impl RegistrationHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Fixed-capacity arena of registrations; `None` slots are free.
#[derive(Debug)]
pub struct RegistrationTable {
    slots: Vec<Option<RegistrationEntry>>,
    free: Vec<usize>,
}

impl RegistrationTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            // popped from the back, so slot 0 is handed out first
            free: (0..capacity).rev().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry whose `(registered_uri, true_uri)` pair matches.
    pub fn find(
        &self,
        registered: &Uri,
        contact: &Uri,
        resolver: &HostResolver,
    ) -> Option<RegistrationHandle> {
        self.active().find_map(|(handle, entry)| {
            (compare_url_strict(&entry.registered_uri, registered, resolver)
                && compare_url_strict(&entry.true_uri, contact, resolver))
            .then_some(handle)
        })
    }

    /// Refreshes the matching entry or claims a free slot for a new one.
    pub fn upsert(
        &mut self,
        entry: RegistrationEntry,
        resolver: &HostResolver,
    ) -> Result<RegistrationHandle> {
        if let Some(handle) = self.find(&entry.registered_uri, &entry.true_uri, resolver) {
            self.slots[handle.0] = Some(entry);
            return Ok(handle);
        }
        let index = self.free.pop().ok_or(Error::TableFull("registration"))?;
        self.slots[index] = Some(entry);
        Ok(RegistrationHandle(index))
    }

    pub fn get(&self, handle: RegistrationHandle) -> Option<&RegistrationEntry> {
        self.slots.get(handle.0).and_then(Option::as_ref)
    }

    pub fn remove(&mut self, handle: RegistrationHandle) -> Option<RegistrationEntry> {
        let removed = self.slots.get_mut(handle.0)?.take();
        if removed.is_some() {
            self.free.push(handle.0);
        }
        removed
    }

    /// Removes every entry registered under `registered`; with `contact`
    /// only the entry bound to that contact.
    pub fn unregister(
        &mut self,
        registered: &Uri,
        contact: Option<&Uri>,
        resolver: &HostResolver,
    ) -> usize {
        let matching: Vec<_> = self
            .active()
            .filter(|(_, entry)| {
                compare_url_strict(&entry.registered_uri, registered, resolver)
                    && contact.is_none_or(|contact| {
                        compare_url_strict(&entry.true_uri, contact, resolver)
                    })
            })
            .map(|(handle, _)| handle)
            .collect();
        for handle in &matching {
            self.remove(*handle);
        }
        matching.len()
    }

    /// Releases entries whose expiry has passed; returns them for logging.
    pub fn age(&mut self, now: Instant) -> Vec<RegistrationEntry> {
        let expired: Vec<_> = self
            .active()
            .filter(|(_, entry)| !entry.is_active(now))
            .map(|(handle, _)| handle)
            .collect();
        expired
            .into_iter()
            .filter_map(|handle| self.remove(handle))
            .collect()
    }

    pub fn active(&self) -> impl Iterator<Item = (RegistrationHandle, &RegistrationEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|entry| (RegistrationHandle(index), entry)))
    }
}
