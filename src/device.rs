//! The output device playback is sent to.
//!
//! [`DeviceTarget`] owns the device id shared by the scan loop, the retry
//! tasks and the transport controller. It starts out unresolved and is
//! resolved by looking up configured device names in the device lists of the
//! accounts. Once resolved it only becomes unresolved again when the device
//! disappeared or a re-resolve was requested.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::{config::DeviceSelection, protocol::player::Device, remote::Account};

#[derive(Clone, Debug, Default)]
pub struct DeviceTarget {
    id: Arc<RwLock<Option<String>>>,
    fixed: Option<String>,
    names: Arc<[String]>,
}

impl DeviceTarget {
    #[must_use]
    pub fn new(selection: &DeviceSelection) -> Self {
        Self {
            id: Arc::new(RwLock::new(selection.id.clone())),
            fixed: selection.id.clone(),
            names: selection.names.clone().into(),
        }
    }

    /// The resolved device id, or `None` if not yet found.
    pub async fn get(&self) -> Option<String> {
        self.id.read().await.clone()
    }

    pub async fn set(&self, id: impl Into<String>) {
        let id = id.into();
        let mut current = self.id.write().await;
        if current.as_deref() != Some(id.as_str()) {
            info!("output device: {id}");
            *current = Some(id);
        }
    }

    /// Marks the device as gone, so that the next access resolves it again.
    pub async fn forget(&self) {
        if let Some(id) = self.id.write().await.take() {
            debug!("forgetting output device {id}");
        }
    }

    /// Returns the current device id, resolving it first if unresolved.
    pub async fn get_or_resolve(&self, accounts: &[Account]) -> Option<String> {
        if let Some(id) = self.get().await {
            return Some(id);
        }
        self.resolve(accounts).await
    }

    /// Looks up the device and stores the result.
    ///
    /// A fixed device id always wins. Otherwise configured names are tried
    /// in order of preference, each against the device lists of all accounts
    /// in order. Without an id or names the device stays unresolved.
    /// Accounts whose device list cannot be fetched are skipped.
    pub async fn resolve(&self, accounts: &[Account]) -> Option<String> {
        if let Some(ref id) = self.fixed {
            self.set(id.clone()).await;
            return Some(id.clone());
        }
        if self.names.is_empty() {
            warn!("no output device configured");
            return None;
        }

        let mut listings: Vec<Vec<Device>> = Vec::with_capacity(accounts.len());
        for account in accounts {
            match account.remote().devices().await {
                Ok(devices) => {
                    trace!("{account}: {} device(s) available", devices.len());
                    listings.push(devices);
                }
                Err(e) => {
                    warn!("{account}: cannot list devices: {e}");
                    listings.push(Vec::new());
                }
            }
        }

        let found = self.names.iter().find_map(|name| {
            listings
                .iter()
                .flatten()
                .find(|device| device.id.is_some() && device.name.eq_ignore_ascii_case(name))
        });

        match found.and_then(|device| device.id.clone()) {
            Some(id) => {
                self.set(id.clone()).await;
                Some(id)
            }
            None => {
                warn!("output device not found");
                None
            }
        }
    }
}
