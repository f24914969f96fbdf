// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Bot startup — assembles all subsystems and runs them.
//!
//! # Startup sequence
//!
//! [`Bot::start`] performs these steps in order:
//!
//! 1. Build the shared counters and the relay supervisor.
//! 2. Wire the outbox (signer + relay fan-out) and the accounting engine.
//! 3. Build the AI client: provider, circuit breaker, chat-context cache.
//! 4. Start the work queue drain loop with the processor as handler.
//! 5. Start the per-relay subscription loops (filters scoped to the bot,
//!    `since = now`).
//! 6. Start the dispatcher on the supervisor's event channel.
//! 7. Start the background sweepers (rate-limit buckets, fingerprints).
//! 8. Start the status/health HTTP surface.
//!
//! # Shutdown sequence
//!
//! [`RunningBot::shutdown`] reverses it: cancel subscriptions, let the
//! dispatcher drain, wait for the queue to reach zero in-flight tasks, stop
//! the sweepers, flush the store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use zapai_crypto::{BotKeys, LocalSigner, Signer};
use zapai_model::{AiClient, AiClientConfig, BreakerConfig, CompletionProvider, GoogleProvider};
use zapai_proto::Principal;
use zapai_relay::{RelaySupervisor, RelayTransport, SupervisorConfig, WsTransport};
use zapai_store::SessionStore;

use crate::accounting::Accounting;
use crate::config::Config;
use crate::dedup::FingerprintCache;
use crate::dispatcher::{startup_filters, Dispatcher};
use crate::limiter::{RateLimiter, RateLimiterConfig};
use crate::outbox::Outbox;
use crate::processor::{Processor, ProcessorConfig};
use crate::profiles::{ProfileCache, ProfileCacheConfig};
use crate::queue::{QueueConfig, TaskHandler, WorkQueue};
use crate::stats::BotCounters;
use crate::status::{self, StatusSources, StatusState};

/// TTL of the content-fingerprint dedup layer.
const FINGERPRINT_TTL: Duration = Duration::from_secs(300);
const FINGERPRINT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// An assembled but not yet started bot.
pub struct Bot {
    config: Config,
    signer: Arc<dyn Signer>,
    store: Arc<SessionStore>,
    provider: Arc<dyn CompletionProvider>,
    transport: Arc<dyn RelayTransport>,
}

impl Bot {
    /// Production wiring from configuration alone: local signer, sled store
    /// on disk, Gemini backend, WebSocket relays.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let keys = BotKeys::parse(&config.private_key).context("parsing BOT_PRIVATE_KEY")?;
        let signer: Arc<dyn Signer> = Arc::new(LocalSigner::new(keys));
        let store = Arc::new(
            SessionStore::open(&config.data_dir)
                .with_context(|| format!("opening store at {}", config.data_dir.display()))?,
        );
        let provider: Arc<dyn CompletionProvider> = Arc::new(GoogleProvider::new(
            config.gemini_model.clone(),
            config.gemini_api_key.clone(),
            config.gemini_base_url.clone(),
            None,
            None,
        ));
        Ok(Self::with_parts(config, signer, store, provider, Arc::new(WsTransport)))
    }

    /// Explicit wiring.  Tests inject the plaintext signer, a temporary
    /// store, the scripted provider and the in-process relay network here.
    pub fn with_parts(
        config: Config,
        signer: Arc<dyn Signer>,
        store: Arc<SessionStore>,
        provider: Arc<dyn CompletionProvider>,
        transport: Arc<dyn RelayTransport>,
    ) -> Self {
        Self { config, signer, store, provider, transport }
    }

    pub async fn start(self) -> anyhow::Result<RunningBot> {
        let Self { config, signer, store, provider, transport } = self;
        let bot_pubkey = signer.public_key();
        info!(name = %config.bot_name, pubkey = %bot_pubkey, "starting bot");

        let counters = Arc::new(BotCounters::default());

        let supervisor = RelaySupervisor::new(
            transport,
            config.relays.clone(),
            SupervisorConfig {
                publish_timeout: config.relay_publish_timeout,
                ..SupervisorConfig::default()
            },
        );

        let outbox = Arc::new(Outbox::new(signer.clone(), supervisor.clone(), counters.clone()));
        let accounting = Arc::new(Accounting::new(store.clone(), outbox.clone()));

        let ai = Arc::new(AiClient::new(
            provider,
            BreakerConfig::default(),
            AiClientConfig {
                bot_name: config.bot_name.clone(),
                session_reuse: config.chat_session_reuse,
                chat_ttl: config.chat_session_ttl,
                max_chat_sessions: config.max_chat_sessions,
                enable_memory_summary: config.enable_memory_summary,
                memory_summary_min_messages: config.memory_summary_min_messages,
            },
        ));

        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            max_tokens: config.rate_limit_max_tokens,
            refill_rate: config.rate_limit_refill_rate,
            ..RateLimiterConfig::default()
        }));

        let fingerprints = Arc::new(FingerprintCache::new(FINGERPRINT_TTL));

        let profiles = ProfileCache::new(
            supervisor.clone(),
            ProfileCacheConfig {
                ttl: config.metadata_cache_ttl,
                fast_timeout: config.metadata_fast_timeout,
                ..ProfileCacheConfig::default()
            },
        );

        let queue_cfg = QueueConfig {
            max_queue_size: config.max_queue_size,
            max_concurrent: config.max_concurrent,
            task_timeout: config.queue_timeout,
            ..QueueConfig::default()
        };
        let queue = WorkQueue::new(queue_cfg.clone());

        let processor = Arc::new(Processor::new(
            signer.clone(),
            store.clone(),
            ai.clone(),
            profiles,
            fingerprints.clone(),
            outbox.clone(),
            counters.clone(),
            ProcessorConfig {
                response_delay: config.response_delay,
                max_attempts: queue_cfg.max_attempts,
            },
        ));
        let handler: TaskHandler = Arc::new(move |task| {
            let processor = processor.clone();
            Box::pin(async move { processor.process(task).await })
        });
        let queue_handle = queue.run(handler);

        let event_rx = supervisor.start(startup_filters(bot_pubkey));
        let dispatcher = Dispatcher::new(
            bot_pubkey,
            limiter.clone(),
            queue.clone(),
            accounting,
            outbox,
            counters.clone(),
        );
        let dispatcher_handle = dispatcher.run(event_rx);

        let (sweep_shutdown, sweep_rx) = watch::channel(false);
        let sweeper_handles = vec![
            limiter.spawn_sweeper(sweep_rx.clone()),
            fingerprints.spawn_sweeper(FINGERPRINT_SWEEP_INTERVAL, sweep_rx),
        ];

        let status_state = StatusState::new(
            Arc::new(StatusSources {
                started_at: std::time::Instant::now(),
                bot_name: config.bot_name.clone(),
                bot_pubkey: bot_pubkey.to_hex(),
                counters: counters.clone(),
                queue: queue.clone(),
                limiter,
                ai: ai.clone(),
                relays: supervisor.clone(),
            }),
            config.dashboard_password.clone(),
        );
        let (status_addr, status_handle) = status::serve(config.web_port, status_state).await?;

        Ok(RunningBot {
            bot_pubkey,
            store,
            supervisor,
            queue,
            counters,
            ai,
            status_addr,
            queue_handle,
            dispatcher_handle,
            status_handle,
            sweeper_handles,
            sweep_shutdown,
        })
    }
}

/// Handles to a started bot; dropping it does NOT stop the tasks — call
/// [`RunningBot::shutdown`].
pub struct RunningBot {
    pub bot_pubkey: Principal,
    pub store: Arc<SessionStore>,
    pub supervisor: Arc<RelaySupervisor>,
    pub queue: Arc<WorkQueue>,
    pub counters: Arc<BotCounters>,
    pub ai: Arc<AiClient>,
    pub status_addr: SocketAddr,
    queue_handle: JoinHandle<()>,
    dispatcher_handle: JoinHandle<()>,
    status_handle: JoinHandle<()>,
    sweeper_handles: Vec<JoinHandle<()>>,
    sweep_shutdown: watch::Sender<bool>,
}

impl RunningBot {
    /// Graceful shutdown: subscriptions first, then the dispatcher drains,
    /// then the queue runs dry, then the housekeeping stops.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.supervisor.shutdown().await;
        let _ = self.dispatcher_handle.await;

        self.queue.shutdown().await;
        let _ = self.queue_handle.await;

        let _ = self.sweep_shutdown.send(true);
        for handle in self.sweeper_handles {
            let _ = handle.await;
        }
        self.status_handle.abort();

        if let Err(e) = self.store.flush() {
            tracing::warn!(error = %e, "store flush on shutdown failed");
        }
        info!("shutdown complete");
    }
}
