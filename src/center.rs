//! The daemon's shared runtime state.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::config::Config;
use crate::store::{Store, StoreError};
use crate::whitelist::{self, Whitelists};

//----------- Center -----------------------------------------------------------

/// Everything the workers, the sweeper and the signal handlers share.
///
/// The configuration is immutable; the whitelist set is the only value
/// that changes at runtime, and it is only ever replaced wholesale via
/// [`whitelists`](Self::whitelists).
#[derive(Debug)]
pub struct Center {
    /// The configuration.
    pub config: Config,

    /// The live whitelist set.
    pub whitelists: ArcSwap<Whitelists>,

    /// The greylist store.
    pub greylist: Store,

    /// The auto-whitelist store, if configured.
    pub awl: Option<Store>,
}

impl Center {
    /// Build the runtime state from parts.
    pub fn new(config: Config, greylist: Store, awl: Option<Store>, whitelists: Whitelists) -> Self {
        Self {
            config,
            whitelists: ArcSwap::from_pointee(whitelists),
            greylist,
            awl,
        }
    }

    /// Open the stores and perform the initial whitelist load.
    ///
    /// A store that cannot be opened is fatal; a whitelist source that
    /// cannot be loaded is not.
    pub async fn connect(config: Config) -> Result<Arc<Self>, StoreError> {
        let greylist = Store::open(&config.greylist.store).await?;
        info!("Opened the greylist store at '{}'", config.greylist.store);

        let awl = match &config.auto_whitelist {
            Some(awl) => {
                let store = Store::open(&awl.store).await?;
                info!("Opened the auto-whitelist store at '{}'", awl.store);
                Some(store)
            }
            None => None,
        };

        let whitelists = whitelist::load(&config).await;
        info!("Loaded whitelists ({} entries)", whitelists.len());

        Ok(Arc::new(Self::new(config, greylist, awl, whitelists)))
    }

    /// Flush both stores to durable storage.
    pub async fn save_stores(&self) -> Result<(), StoreError> {
        self.greylist.save().await?;
        if let Some(awl) = &self.awl {
            awl.save().await?;
        }
        Ok(())
    }
}
