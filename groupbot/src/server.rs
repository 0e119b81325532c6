//! HTTP side of the bot: health checks and the Telegram webhook.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use axum::{extract::State, http::StatusCode, routing::get, Router};
use teloxide::{
    dispatching::{update_listeners::webhooks, DefaultKey},
    error_handlers::LoggingErrorHandler,
    prelude::Dispatcher,
};
use tracing::info;

use crate::{service::BotService, Error};

/// Outcome of the last database keep-alive ping.
#[derive(Debug, Clone)]
pub struct HealthState(Arc<AtomicBool>);

impl Default for HealthState {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, healthy: bool) {
        self.0.store(healthy, Ordering::Relaxed);
    }
}

async fn health(State(health): State<HealthState>) -> (StatusCode, &'static str) {
    if health.is_healthy() {
        (StatusCode::OK, "Healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Unhealthy")
    }
}

/// `/` and `/health`
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .with_state(state)
}

type BotDispatcher = Dispatcher<teloxide::Bot, Error, DefaultKey>;

/// Receive updates on `/webhook/{token}` next to the health routes.
pub async fn serve_webhook(
    service: &BotService,
    mut dispatcher: BotDispatcher,
    addr: SocketAddr,
    domain: &str,
) -> Result<(), Error> {
    let url = service.config.webhook_url(domain)?;
    info!("Listening on {addr}, webhook at {}/webhook/***", url.origin().ascii_serialization());

    let (listener, stop_flag, webhook) =
        webhooks::axum_to_router(service.bot.clone(), webhooks::Options::new(addr, url)).await?;
    let app = health_router(service.health.clone()).merge(webhook);

    let (server, ()) = tokio::join!(
        axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .with_graceful_shutdown(stop_flag),
        dispatcher.dispatch_with_listener(
            listener,
            LoggingErrorHandler::with_custom_text("An error from the webhook listener"),
        )
    );
    server?;
    Ok(())
}

/// Long polling, with the health routes still served on `addr`.
pub async fn serve_polling(
    service: &BotService,
    mut dispatcher: BotDispatcher,
    addr: SocketAddr,
) -> Result<(), Error> {
    info!("Listening on {addr}, receiving updates by long polling");
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

    let (server, ()) = tokio::join!(
        axum::Server::bind(&addr)
            .serve(health_router(service.health.clone()).into_make_service())
            .with_graceful_shutdown(async {
                stopped.await.ok();
            }),
        async move {
            dispatcher.dispatch().await;
            stop.send(()).ok();
        }
    );
    server?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_reflects_ping() {
        let state = HealthState::default();
        assert_eq!(health(State(state.clone())).await, (StatusCode::OK, "Healthy"));

        state.set(false);
        let (status, _) = health(State(state.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
