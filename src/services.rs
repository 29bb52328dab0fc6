//! Service wiring
//!
//! Builds the store, gateway client, lifecycle controller, sync engine and
//! webhook ingest from a [`Config`], and hands them out as one shared context
//! to the HTTP server and the CLI.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::Config;
use crate::gateway::{EvolutionClient, Gateway, WebhookRegistration};
use crate::lifecycle::LifecycleController;
use crate::store::Store;
use crate::sync::SyncEngine;
use crate::webhook::{WebhookAuth, WebhookIngest};

pub struct ServiceContext {
    pub config: Config,
    pub store: Store,
    pub gateway: Arc<dyn Gateway>,
    pub lifecycle: Arc<LifecycleController>,
    pub sync: Arc<SyncEngine>,
    pub ingest: WebhookIngest,
    pub auth: WebhookAuth,
}

impl ServiceContext {
    /// Open the configured database and connect to the configured gateway.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = Store::open(&config.database.path)
            .await
            .with_context(|| format!("Failed to open database: {:?}", config.database.path))?;
        let client = EvolutionClient::new(&config.gateway).context("Failed to build gateway client")?;
        Ok(Self::new(config, store, Arc::new(client)))
    }

    /// Wire services over an existing store and gateway.
    pub fn new(config: Config, store: Store, gateway: Arc<dyn Gateway>) -> Self {
        let server = &config.server;
        let webhook = server.webhook_secret.as_deref().map(|secret| {
            WebhookRegistration::new(server.webhook_url(), &server.webhook_header, secret)
        });
        if webhook.is_none() {
            tracing::debug!("No webhook secret configured; webhook registration is skipped");
        }

        let lifecycle = Arc::new(LifecycleController::new(
            store.clone(),
            Arc::clone(&gateway),
            webhook,
        ));
        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            Arc::clone(&gateway),
            Arc::clone(&lifecycle),
            config.sync.clone(),
        ));
        let ingest = WebhookIngest::new(store.clone(), Arc::clone(&lifecycle));
        let auth = WebhookAuth::new(
            server.webhook_secret.clone(),
            server.webhook_header.clone(),
        );

        Self {
            config,
            store,
            gateway,
            lifecycle,
            sync,
            ingest,
            auth,
        }
    }
}
