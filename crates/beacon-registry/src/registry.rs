//! Client and channel registry.
//!
//! Owns both maps (clients, channel memberships) behind one mutation surface.
//! A client's `subscriptions` set is a back-reference kept in step with the
//! channel map by every method here; nothing else writes either side.

use std::collections::{HashMap, HashSet};

use beacon_ws::encode_text;
use tracing::{debug, warn};

use crate::client::{Client, ClientId, FrameBytes, Transport, TransportError};
use crate::error::{RegistryError, RegistryResult};

/// Outcome of one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Clients the frame was queued for.
    pub delivered: Vec<ClientId>,
    /// Clients whose transport failed; they have been unregistered.
    pub failed: Vec<ClientId>,
}

impl PublishReport {
    /// Number of subscribers the publish was attempted for.
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

/// Registry of connected clients and their channel subscriptions.
pub struct Registry<T: Transport> {
    clients: HashMap<ClientId, Client<T>>,
    channels: HashMap<String, HashSet<ClientId>>,
}

impl<T: Transport> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> Registry<T> {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    /// Add a client. Identities must be unique among active clients.
    pub fn register(&mut self, client: Client<T>) -> RegistryResult<()> {
        let id = client.id();
        if self.clients.contains_key(&id) {
            return Err(RegistryError::DuplicateClient(id));
        }
        debug!(client_id = %id, peer = %client.peer(), "Client registered");
        self.clients.insert(id, client);
        Ok(())
    }

    /// Remove a client, purge it from every channel and close its transport.
    ///
    /// Returns `None` if the client was not registered, so the transport of a
    /// given client is closed at most once.
    pub fn unregister(&mut self, id: &ClientId) -> Option<Client<T>> {
        let client = self.clients.remove(id)?;

        for channel in &client.subscriptions {
            if let Some(subscribers) = self.channels.get_mut(channel) {
                subscribers.remove(id);
            }
        }
        client.transport.close();

        debug!(
            client_id = %id,
            channels = client.subscriptions.len(),
            messages = client.counters().messages_received,
            "Client unregistered"
        );
        Some(client)
    }

    /// Subscribe a client to a channel, creating the channel if needed.
    ///
    /// Returns `true` if this is a new subscription.
    pub fn subscribe(&mut self, id: &ClientId, channel: &str) -> RegistryResult<bool> {
        let channel = channel.trim();
        if channel.is_empty() {
            return Err(RegistryError::EmptyChannel);
        }
        let client = self
            .clients
            .get_mut(id)
            .ok_or(RegistryError::UnknownClient(*id))?;

        let added = client.subscriptions.insert(channel.to_string());
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(*id);
        Ok(added)
    }

    /// Drop one subscription. Returns `true` if the client was subscribed.
    pub fn unsubscribe(&mut self, id: &ClientId, channel: &str) -> RegistryResult<bool> {
        let channel = channel.trim();
        if channel.is_empty() {
            return Err(RegistryError::EmptyChannel);
        }
        let client = self
            .clients
            .get_mut(id)
            .ok_or(RegistryError::UnknownClient(*id))?;

        let removed = client.subscriptions.remove(channel);
        if let Some(subscribers) = self.channels.get_mut(channel) {
            subscribers.remove(id);
        }
        Ok(removed)
    }

    /// Fan a text payload out to every subscriber of `channel`.
    ///
    /// The frame is encoded once. A subscriber whose transport fails is
    /// unregistered; the remaining subscribers still receive the frame.
    pub fn publish(&mut self, channel: &str, payload: &str) -> PublishReport {
        let mut report = PublishReport::default();
        let targets: Vec<ClientId> = match self.channels.get(channel) {
            Some(subscribers) => subscribers.iter().copied().collect(),
            None => return report,
        };
        if targets.is_empty() {
            return report;
        }

        let frame: FrameBytes = encode_text(payload.as_bytes()).into();
        for id in targets {
            match self.deliver(&id, frame.clone()) {
                Ok(()) => report.delivered.push(id),
                Err(e) => {
                    warn!(client_id = %id, channel, error = %e, "Publish failed, dropping client");
                    self.unregister(&id);
                    report.failed.push(id);
                }
            }
        }
        report
    }

    /// Send a text payload to one client.
    ///
    /// On transport failure the client is unregistered.
    pub fn send_to(&mut self, id: &ClientId, payload: &str) -> RegistryResult<()> {
        if !self.clients.contains_key(id) {
            return Err(RegistryError::UnknownClient(*id));
        }
        let frame: FrameBytes = encode_text(payload.as_bytes()).into();
        match self.deliver(id, frame) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(client_id = %id, error = %e, "Send failed, dropping client");
                self.unregister(id);
                Err(RegistryError::SendFailed {
                    client: *id,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn deliver(&mut self, id: &ClientId, frame: FrameBytes) -> Result<(), TransportError> {
        let client = self.clients.get_mut(id).ok_or(TransportError::Closed)?;
        client.transport.send(frame)?;
        client.counters_mut().frames_sent += 1;
        Ok(())
    }

    /// Unregister every client (shutdown). Each transport is closed once.
    pub fn drain(&mut self) -> Vec<Client<T>> {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        ids.iter().filter_map(|id| self.unregister(id)).collect()
    }

    /// Forget channels with no subscribers. Returns how many were removed.
    pub fn prune_empty_channels(&mut self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, subscribers| !subscribers.is_empty());
        before - self.channels.len()
    }

    pub fn get(&self, id: &ClientId) -> Option<&Client<T>> {
        self.clients.get(id)
    }

    pub fn get_mut(&mut self, id: &ClientId) -> Option<&mut Client<T>> {
        self.clients.get_mut(id)
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// Current subscribers of a channel (empty if unknown).
    pub fn subscribers(&self, channel: &str) -> Vec<ClientId> {
        self.channels
            .get(channel)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of known channels, including empty ones not yet pruned.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Channel names with their subscriber counts.
    pub fn channel_sizes(&self) -> Vec<(String, usize)> {
        let mut sizes: Vec<(String, usize)> = self
            .channels
            .iter()
            .map(|(name, subscribers)| (name.clone(), subscribers.len()))
            .collect();
        sizes.sort();
        sizes
    }
}
