//! Resolution of external identities to persisted account mappings.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use tokio::sync::{Mutex, RwLock};

use super::naming::{derive_account_name, with_suffix};
use super::{IdentityError, IdentityMapping, IdentityRepository};
use crate::accounts::{UserDirectory, home_for, is_owned_by};

/// Highest numeric suffix tried before giving up.
const MAX_SUFFIX: u32 = 99;

/// Maps external identities to OS account names.
///
/// Lookups hit an in-memory cache first, then the store. New mappings are
/// allocated under a single lock so two concurrent first requests cannot
/// claim the same name.
pub struct IdentityMapper {
    repo: IdentityRepository,
    prefix: String,
    home_base: PathBuf,
    /// OS account database consulted for name collisions outside the store.
    directory: Option<Arc<dyn UserDirectory>>,
    cache: RwLock<HashMap<String, IdentityMapping>>,
    allocate: Mutex<()>,
}

impl IdentityMapper {
    pub fn new(repo: IdentityRepository, prefix: impl Into<String>, home_base: PathBuf) -> Self {
        Self {
            repo,
            prefix: prefix.into(),
            home_base,
            directory: None,
            cache: RwLock::new(HashMap::new()),
            allocate: Mutex::new(()),
        }
    }

    /// Also treat existing OS accounts owned by someone else as taken.
    pub fn with_directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Fill the cache from the store. Returns the number of mappings loaded.
    pub async fn load(&self) -> Result<usize, IdentityError> {
        let mappings = self.repo.list().await?;
        let mut cache = self.cache.write().await;
        for mapping in mappings {
            cache.insert(mapping.external_id.clone(), mapping);
        }
        info!("Loaded {} identity mappings", cache.len());
        Ok(cache.len())
    }

    /// Return the mapping for `external_id`, creating and persisting one on
    /// first use. Repeated calls return the same mapping.
    pub async fn resolve(&self, external_id: &str) -> Result<IdentityMapping, IdentityError> {
        if external_id.trim().is_empty() {
            return Err(IdentityError::InvalidIdentity);
        }

        if let Some(mapping) = self.cached(external_id).await {
            return Ok(mapping);
        }

        let _guard = self.allocate.lock().await;

        if let Some(mapping) = self.cached(external_id).await {
            return Ok(mapping);
        }

        if let Some(mapping) = self.repo.get(external_id).await? {
            self.remember(&mapping).await;
            return Ok(mapping);
        }

        let base = derive_account_name(&self.prefix, external_id);
        let mut attempts = 0;
        for n in 1..=MAX_SUFFIX {
            let candidate = if n == 1 {
                base.clone()
            } else {
                with_suffix(&base, n)
            };
            attempts += 1;

            if !self.is_available(&candidate, external_id).await? {
                debug!("Account name '{}' is taken", candidate);
                continue;
            }

            let mapping = IdentityMapping {
                external_id: external_id.to_string(),
                home_dir: home_for(&self.home_base, &candidate),
                account_name: candidate,
                created_at: Utc::now(),
            };
            self.repo.insert(&mapping).await?;
            self.remember(&mapping).await;
            info!(
                "Mapped identity '{}' to account '{}'",
                mapping.external_id, mapping.account_name
            );
            return Ok(mapping);
        }

        Err(IdentityError::Exhausted {
            external_id: external_id.to_string(),
            base,
            attempts,
        })
    }

    /// Existing mapping, without creating one.
    pub async fn get(&self, external_id: &str) -> Result<Option<IdentityMapping>, IdentityError> {
        if let Some(mapping) = self.cached(external_id).await {
            return Ok(Some(mapping));
        }
        let mapping = self.repo.get(external_id).await?;
        if let Some(ref mapping) = mapping {
            self.remember(mapping).await;
        }
        Ok(mapping)
    }

    /// Every persisted mapping.
    pub async fn mappings(&self) -> Result<Vec<IdentityMapping>, IdentityError> {
        Ok(self.repo.list().await?)
    }

    async fn cached(&self, external_id: &str) -> Option<IdentityMapping> {
        self.cache.read().await.get(external_id).cloned()
    }

    async fn remember(&self, mapping: &IdentityMapping) {
        self.cache
            .write()
            .await
            .insert(mapping.external_id.clone(), mapping.clone());
    }

    async fn is_available(&self, candidate: &str, external_id: &str) -> Result<bool, IdentityError> {
        if let Some(existing) = self.repo.get_by_account(candidate).await?
            && existing.external_id != external_id
        {
            return Ok(false);
        }

        let Some(directory) = self.directory.clone() else {
            return Ok(true);
        };
        let name = candidate.to_string();
        let entry = tokio::task::spawn_blocking(move || directory.lookup(&name))
            .await
            .map_err(anyhow::Error::from)??;

        Ok(match entry {
            Some(entry) => is_owned_by(&entry, external_id),
            None => true,
        })
    }
}
