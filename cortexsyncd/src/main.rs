mod config;
mod dispatcher;
mod errors;
mod filter;
mod http;
mod normalize;
mod reconcile;
mod remote;
mod retry;
mod store;
mod tenant;
mod watch;

use config::Config;
use dispatcher::Dispatcher;
use errors::Error;
use http::HttpTransport;
use reconcile::Reconciler;
use remote::RemoteSyncClient;
use store::ReconciliationStore;
use tenant::{KubeNamespaces, TenantResolver};
use watch::ScopeWatcher;

use clap::Parser;
use futures::future::Either;
use kube::Client as KubeClient;
use log;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

const EVENT_BUFFER: usize = 1024;

/*
 * Resolves on SIGINT or SIGTERM (what the kubelet sends when the pod
 * stops).
 */
async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
	Ok(terminate) => terminate,
	Err(err) => {
	    log::warn!("unable to listen for SIGTERM, only CTRL^C will stop me: {}", err);
	    let _ = tokio::signal::ctrl_c().await;
	    return;
	}
    };

    tokio::select! {
	_ = tokio::signal::ctrl_c() => {},
	_ = terminate.recv() => {},
    }
}

/*
 * Program design:
 *
 *  1. Validate the configuration, bail out early when it is unusable
 *  2. Start one watcher per namespace scope, feeding a single dispatcher
 *  3. The dispatcher reconciles every object on its own ordered worker
 *  4. On shutdown, stop watching and give in-flight requests a grace period
 */
#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let settings = match Config::parse().validate() {
	Ok(settings) => settings,
	Err(err) => {
	    log::error!("{}", err);
	    return Err(err);
	}
    };

    log::info!("starting cortexsyncd for {} in scope(s) {:?}, orphan cleanup: {}", settings.function, settings.scopes, settings.prune);
    let kube_client = KubeClient::try_default().await?;

    let tenants = TenantResolver::new(KubeNamespaces::new(kube_client.clone()), settings.tenant.clone());
    let remote = RemoteSyncClient::new(HttpTransport::new(&settings.remote)?, settings.remote.clone());
    let reconciler = Arc::new(Reconciler::new(&settings, tenants, ReconciliationStore::new(), remote));

    let (events, events_rx) = mpsc::channel(EVENT_BUFFER);
    let dispatching = tokio::spawn(Dispatcher::new(reconciler.clone()).run(events_rx, settings.shutdown_grace));

    let selector = settings.filter.label_selector();
    let scopes = futures::future::join_all(settings.scopes.iter().map(|scope| {
	ScopeWatcher::new(kube_client.clone(), scope.clone(), selector.clone(), settings.watch.clone(), events.clone()).run()
    }));
    drop(events);

    let namespaces = match reconciler.tenants().caching() {
	true => Either::Left(watch::namespace_watcher(kube_client.clone(), reconciler.clone())),
	false => Either::Right(futures::future::pending::<()>()),
    };

    tokio::select! {
	_ = scopes => {
	    log::error!("every scope watcher stopped");
	},
	_ = namespaces => {
	    log::error!("namespace watcher stopped");
	},

	// handle CTRL^C/SIGTERM as gracefully as we can.
	_ = shutdown_signal() => {
	    log::info!("shutting down");
	},
    }

    // the scope watchers are gone now, which closes the dispatcher's input
    if let Err(err) = dispatching.await {
	log::error!("dispatcher failed: {}", err);
    }

    log::info!("bye");
    Ok(())
}
