use std::sync::{Arc, LazyLock};

use courier_api::{ApiConfig, ApiServer, AppState};
use courier_common::{Signal, internal, logging};
use courier_dispatch::{
    DispatchConfig, Dispatcher, Route, StaticContactDirectory, Tenant, TenantRegistry,
};
use courier_smtp::{
    RecipientPolicy, RelayConfig, RelayServer, RelayTransport, SenderPolicy, SmtpRelay,
    UpstreamConfig,
};
use courier_store::StoreConfig;
use courier_validator::{
    AddressValidator, DnsConfig, HickoryMxResolver, MxResolver, SelfSendShield, StaticMxResolver,
};
use ron::extensions::Extensions;
use serde::Deserialize;
use tokio::{sync::broadcast, task::JoinSet};

/// Where MX answers come from.
#[derive(Debug, Clone, Default, Deserialize)]
pub enum Resolver {
    /// The system resolver configuration.
    #[default]
    System,
    /// A fixed list of domains that accept mail; everything else does not.
    /// For offline deployments and tests.
    Static(Vec<String>),
}

/// The whole process, as configured in `courier.config.ron`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Courier {
    /// The loopback submission listener; omitted means no listener.
    #[serde(default)]
    relay: Option<RelayConfig>,
    #[serde(default)]
    upstream: UpstreamConfig,
    /// The operator's own mailbox. Nothing is ever relayed to it.
    #[serde(default)]
    operator_mailbox: String,
    #[serde(default, alias = "tenant")]
    tenants: Vec<Tenant>,
    #[serde(default)]
    contacts: StaticContactDirectory,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    dns: DnsConfig,
    #[serde(default)]
    resolver: Resolver,
    #[serde(default)]
    dispatch: DispatchConfig,
    #[serde(default)]
    api: ApiConfig,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Everything bound and wired, not yet serving.
#[derive(Debug)]
pub struct Services {
    pub relay: Option<RelayServer>,
    pub api: Option<ApiServer>,
    pub state: AppState,
    /// The route dispatch actually uses, after any fallback.
    pub route: Route,
}

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    Ok(())
}

impl Courier {
    /// Parse a configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid RON for this structure.
    pub fn from_ron(config: &str) -> anyhow::Result<Self> {
        Ok(ron::Options::default()
            .with_default_extension(Extensions::IMPLICIT_SOME | Extensions::UNWRAP_VARIANT_NEWTYPES)
            .from_str(config)?)
    }

    /// Builds and binds every service.
    ///
    /// A relay listener that cannot bind is logged and left out; the rest of
    /// the process carries on without it, and a `Submission` route falls
    /// back to sending upstream directly.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or resolver cannot be initialised, or
    /// the API listener cannot bind.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn build(self) -> anyhow::Result<Services> {
        let store = self.store.into_store()?;

        let resolver: Arc<dyn MxResolver> = match &self.resolver {
            Resolver::System => Arc::new(HickoryMxResolver::new(&self.dns)?),
            Resolver::Static(domains) => Arc::new(
                domains
                    .iter()
                    .fold(StaticMxResolver::new(), |resolver, domain| {
                        resolver.with_domain(domain)
                    }),
            ),
        };
        let validator = Arc::new(AddressValidator::new(resolver, self.dns));

        let tenants = TenantRegistry::new(self.tenants);
        if tenants.is_empty() {
            tracing::warn!("No tenants configured; every API request will be refused");
        }

        if self.operator_mailbox.trim().is_empty() {
            tracing::warn!("No operator mailbox configured");
        }
        let shield = Arc::new(SelfSendShield::new(
            std::iter::once(self.operator_mailbox.as_str()).chain(tenants.from_addresses()),
        ));

        let upstream_timeout = self.upstream.timeout();
        let upstream: Arc<dyn RelayTransport> = Arc::new(SmtpRelay::new(self.upstream));

        let relay = match &self.relay {
            Some(config) => {
                let senders =
                    SenderPolicy::new(self.operator_mailbox.clone(), tenants.from_addresses());
                let recipients = RecipientPolicy::new(Arc::clone(&validator), Arc::clone(&shield));

                match RelayServer::bind(config, recipients, senders, Arc::clone(&upstream)).await {
                    Ok(server) => Some(server),
                    Err(err) => {
                        tracing::error!(
                            error = %err,
                            "Relay listener disabled; the API keeps running without it"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let (route, transport) = match (self.dispatch.route, &relay) {
            (Route::Submission, Some(server)) => (
                Route::Submission,
                Arc::new(server.submission_client(upstream_timeout)) as Arc<dyn RelayTransport>,
            ),
            (Route::Submission, None) => {
                tracing::warn!("Relay listener unavailable, dispatching directly upstream");
                (Route::Direct, upstream)
            }
            (Route::Direct, _) => (Route::Direct, upstream),
        };

        let dispatcher = Dispatcher::new(
            validator,
            shield,
            store,
            transport,
            Arc::new(self.contacts),
            &self.dispatch,
        );
        let state = AppState::new(dispatcher, tenants);

        let api = if self.api.enabled {
            Some(ApiServer::new(&self.api, state.clone()).await?)
        } else {
            internal!(level = INFO, "API server disabled");
            None
        };

        Ok(Services {
            relay,
            api,
            state,
            route,
        })
    }

    /// Run this controller, and everything it controls
    ///
    /// # Errors
    ///
    /// This function will return an error if any service fails to
    /// initialise.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        internal!("Controller running");

        let services = self.build().await?;
        let mut running = JoinSet::new();

        if let Some(relay) = services.relay {
            let signal = SHUTDOWN_BROADCAST.subscribe();
            running.spawn(async move { relay.serve(signal).await.map_err(anyhow::Error::from) });
        }

        if let Some(api) = services.api {
            let signal = SHUTDOWN_BROADCAST.subscribe();
            running.spawn(async move { api.serve(signal).await.map_err(anyhow::Error::from) });
        }

        let ret = tokio::select! {
            r = shutdown() => r,
            Some(joined) = running.join_next() => {
                internal!(level = ERROR, "A service stopped unexpectedly");
                joined.map_err(anyhow::Error::from).and_then(|r| r)
            }
        };

        internal!("Shutting down...");
        let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);

        while let Some(joined) = running.join_next().await {
            if let Err(err) = joined.map_err(anyhow::Error::from).and_then(|r| r) {
                internal!(level = ERROR, "{err}");
            }
        }

        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);
        ret
    }
}
