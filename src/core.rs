use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bookmarks::BookmarkRelay;
use crate::channels::{Channel, ChannelHub, SignalChannel, SlackChannel};
use crate::config::AppConfig;
use crate::intake::{spawn_reminder_refresh, MailPoller};
use crate::ipc::IpcServer;
use crate::pool::{PoolSettings, WorkerPool};
use crate::reminders::RemindersBridge;
use crate::router::{AutoRegisterPolicy, Router};
use crate::scheduler::Scheduler;
use crate::snapshots::Snapshots;
use crate::store::Store;
use crate::types::{Capabilities, ChatId, Conversation};
use crate::voice::{self, VoiceState};

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    // 1. State store
    let store = Arc::new(Store::open(&config.state.db_path).await?);
    info!("State store initialized ({})", config.state.db_path);

    // 2. Bootstrap the main conversation if configured and absent
    if let Some(chat_id) = &config.main.chat_id {
        let chat_id = ChatId::new(chat_id.clone());
        if store.get(&chat_id).await?.is_none() {
            let now = Utc::now();
            store
                .put(&Conversation {
                    chat_id: chat_id.clone(),
                    display_name: config
                        .main
                        .name
                        .clone()
                        .unwrap_or_else(|| config.identity.name.clone()),
                    folder: config.main.folder.clone(),
                    trigger: String::new(),
                    requires_trigger: false,
                    caps: Capabilities {
                        reminders: true,
                        bookmarks: true,
                        outbound_email: true,
                    },
                    container_config: None,
                    created_at: now,
                    last_active: now,
                })
                .await?;
            info!(folder = %config.main.folder, "Bootstrapped main conversation");
        }
    }

    // 3. Channel intake bus
    let (event_tx, event_rx) = mpsc::channel(256);

    // 4. Channels, in registration order: Signal first, then Slack instances
    let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
    let mut policies: HashMap<String, AutoRegisterPolicy> = HashMap::new();

    let signal = config.signal.clone().map(|cfg| {
        policies.insert(
            "sig".to_string(),
            AutoRegisterPolicy {
                enabled: cfg.auto_register,
                group_requires_trigger: cfg.group_requires_trigger,
            },
        );
        Arc::new(SignalChannel::new(cfg, event_tx.clone()))
    });
    if let Some(ch) = &signal {
        channels.push(ch.clone());
    }

    let mut slack_instances = Vec::new();
    for cfg in &config.slack {
        let ch = Arc::new(SlackChannel::new(cfg.clone(), event_tx.clone()));
        policies.insert(
            Channel::name(ch.as_ref()),
            AutoRegisterPolicy {
                enabled: cfg.auto_register,
                group_requires_trigger: true,
            },
        );
        channels.push(ch.clone());
        slack_instances.push(ch);
    }
    drop(event_tx);

    let hub = Arc::new(ChannelHub::new(channels));
    info!(
        signal = signal.is_some(),
        slack_instances = slack_instances.len(),
        "Channel hub configured"
    );

    // 5. Worker pool
    let ipc_root = PathBuf::from(&config.ipc.root);
    let workers = Arc::new(WorkerPool::new(
        PoolSettings {
            max_workers: config.pool.max_workers,
            idle: std::time::Duration::from_secs(config.pool.idle_secs),
            turn_timeout: config.turn_timeout(),
            apology: config.pool.apology.clone(),
            command: config.worker.command.clone(),
            args: config.worker.args.clone(),
            data_dir: PathBuf::from(&config.state.data_dir),
            ipc_root: ipc_root.clone(),
            main_folder: config.main.folder.clone(),
        },
        store.clone(),
        hub.clone(),
    ));

    // 6. Scheduler
    let scheduler = Arc::new(Scheduler::new(
        store.pool(),
        workers.clone(),
        store.clone(),
        config.scheduler.tick_secs,
        config.main.folder.clone(),
    ));
    scheduler.clone().spawn();

    // 7. Snapshots
    let snapshots = Arc::new(Snapshots::new(
        ipc_root.clone(),
        store.clone(),
        scheduler.clone(),
        config.main.folder.clone(),
    ));
    if let Err(e) = snapshots.refresh_all().await {
        warn!("Initial snapshot refresh failed: {}", e);
    }
    snapshots.clone().spawn_periodic(config.snapshots.refresh_secs);

    // 8. Router draining the intake bus
    let router = Arc::new(Router::new(
        store.clone(),
        workers.clone(),
        config.main.folder.clone(),
        policies,
        config.identity.name.clone(),
    ));
    tokio::spawn(router.run(event_rx));

    // 9. Bridges + tool IPC server
    let reminders = config
        .reminders
        .as_ref()
        .map(|cfg| Arc::new(RemindersBridge::new(&cfg.command, &cfg.args)));
    let bookmarks = config
        .bookmarks
        .as_ref()
        .map(|cfg| Arc::new(BookmarkRelay::new(&cfg.base_url)));

    let ipc = Arc::new(IpcServer::new(
        ipc_root,
        config.ipc.sweep_ms,
        store.clone(),
        scheduler.clone(),
        hub.clone(),
        snapshots.clone(),
        reminders.clone(),
        bookmarks.clone(),
        config.main.folder.clone(),
    ));
    ipc.spawn();

    // 10. Intake pollers
    match (&config.mail, &bookmarks) {
        (Some(mail_cfg), Some(relay)) => {
            Arc::new(MailPoller::new(mail_cfg.clone(), relay.clone())).spawn();
        }
        (Some(_), None) => {
            warn!("Mail intake configured without a bookmark relay; poller disabled");
        }
        _ => {}
    }
    if let (Some(bridge), Some(cfg)) = (&reminders, &config.reminders) {
        spawn_reminder_refresh(
            bridge.clone(),
            snapshots.clone(),
            store.clone(),
            cfg.refresh_secs,
        );
    }

    // 11. Voice endpoint
    if let Some(voice_cfg) = &config.voice {
        let state = VoiceState {
            pool: workers.clone(),
            token: voice_cfg.token.clone(),
            default_timeout: config.turn_timeout(),
        };
        let port = voice_cfg.port;
        tokio::spawn(async move {
            if let Err(e) = voice::serve(state, port).await {
                tracing::error!("Voice endpoint error: {}", e);
            }
        });
    }

    // 12. Transports, each with its own retry loop
    if let Some(ch) = signal {
        tokio::spawn(ch.start_with_retry());
    }
    for ch in slack_instances {
        tokio::spawn(ch.start_with_retry());
    }

    info!("courierd v{} running", env!("CARGO_PKG_VERSION"));
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    Ok(())
}
