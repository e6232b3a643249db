use anyhow::Result;
use clap::{Parser, Subcommand};

use mailwatch::config::ConfigArgs;

#[derive(Debug, Parser)]
#[command(
    name = "mailwatch",
    version,
    about = "Watch a Microsoft 365 inbox through Graph change notifications"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the webhook, keep the subscription alive and report new mail
    Run,
    /// List recent inbox messages
    Inbox {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Show full message bodies
        #[arg(long, default_value_t = false)]
        details: bool,
    },
    /// Show one message by ID
    Show { id: String },
    /// List links found in recent inbox messages
    Links {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Inspect or change the tracked subscription
    Subscription {
        #[command(subcommand)]
        command: SubscriptionCommands,
    },
    /// Check that an access token can be acquired
    Token {
        #[arg(long, default_value_t = false)]
        force_refresh: bool,
    },
}

#[derive(Debug, Subcommand)]
enum SubscriptionCommands {
    /// Show the tracked subscription if it is still active
    Show,
    /// Create a new subscription and track it
    Create,
    /// Extend a subscription (defaults to the tracked one)
    Renew { id: Option<String> },
    /// Delete a subscription (defaults to the tracked one)
    Delete { id: Option<String> },
    /// Run a single renewal check
    Tick,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::{mpsc, oneshot};
    use tracing::{info, warn};

    use mailwatch::auth::{GraphCredentials, TokenCacheSettings, TokenProvider};
    use mailwatch::config::{ConfigArgs, MonitorConfig};
    use mailwatch::graph::GraphClient;
    use mailwatch::output::{self, OutputFormat};
    use mailwatch::processor::{
        links_for_message, EmailProcessor, GraphMailbox, Mailbox, MessageSummary,
    };
    use mailwatch::subscription::{
        RenewalWorker, Subscription, SubscriptionManager, SubscriptionStore, SystemClock,
    };
    use mailwatch::webhook::{self, WebhookState};

    use super::{Cli, Commands, SubscriptionCommands};

    const DISPATCH_QUEUE_CAPACITY: usize = 256;
    const PROCESSOR_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let format = OutputFormat::from_json_flag(cli.json);
        match cli.command {
            Commands::Run => handle_run(&cli.config, format).await,
            Commands::Inbox { limit, details } => {
                handle_inbox(&cli.config, limit, details, format).await
            }
            Commands::Show { id } => handle_show(&cli.config, &id, format).await,
            Commands::Links { limit } => handle_links(&cli.config, limit, format).await,
            Commands::Subscription { command } => {
                handle_subscription(&cli.config, command, format).await
            }
            Commands::Token { force_refresh } => {
                handle_token(&cli.config, force_refresh, cli.json).await
            }
        }
    }

    async fn handle_run(config: &ConfigArgs, format: OutputFormat) -> Result<()> {
        let settings = config.monitor_config()?;
        let (graph, _) = connect(
            settings.credentials.clone(),
            settings.token_url.clone(),
            settings.api_base.clone(),
            settings.http_timeout,
            settings.token_cache.clone(),
        )?;
        let manager = Arc::new(monitor_manager(&settings, graph.clone()));

        // The listener must be up before the first create: Graph validates
        // the notification URL while creating the subscription.
        let listener = webhook::bind(&settings.webhook_addr).await?;
        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut server = tokio::spawn(webhook::serve(
            listener,
            WebhookState::new(settings.target.client_state.clone(), dispatch_tx),
            async move {
                let _ = stop_rx.await;
            },
        ));

        let processor = EmailProcessor::new(
            Arc::new(GraphMailbox::new(graph, settings.user_email.clone())),
            format,
        );
        let processor_task = tokio::spawn(processor.run(dispatch_rx));

        let renewal =
            RenewalWorker::new(manager, settings.target.clone(), settings.policy).spawn();

        let server_result = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for ctrl-c")?;
                info!("shutdown requested");
                let _ = stop_tx.send(());
                (&mut server).await
            }
            finished = &mut server => finished,
        };

        renewal.shutdown().await;
        if tokio::time::timeout(PROCESSOR_DRAIN_TIMEOUT, processor_task)
            .await
            .is_err()
        {
            warn!("email processor did not drain before shutdown");
        }

        server_result.context("join webhook server task")??;
        info!("mailwatch stopped");
        Ok(())
    }

    async fn handle_inbox(
        config: &ConfigArgs,
        limit: usize,
        details: bool,
        format: OutputFormat,
    ) -> Result<()> {
        let mailbox = mailbox(config)?;
        let messages = mailbox
            .recent_messages(limit)
            .await?
            .iter()
            .map(MessageSummary::from_graph)
            .collect::<Vec<_>>();
        let formatted = output::format_messages(format, &messages, details)?;
        println!("{formatted}");
        Ok(())
    }

    async fn handle_show(config: &ConfigArgs, id: &str, format: OutputFormat) -> Result<()> {
        let processor = EmailProcessor::new(Arc::new(mailbox(config)?), format);
        let summary = processor
            .process(id)
            .await
            .with_context(|| format!("fetch message '{id}'"))?;
        let formatted = output::format_message(format, &summary)?;
        println!("{formatted}");
        Ok(())
    }

    async fn handle_links(config: &ConfigArgs, limit: usize, format: OutputFormat) -> Result<()> {
        let mailbox = mailbox(config)?;
        let links = mailbox
            .recent_messages(limit)
            .await?
            .iter()
            .map(|message| links_for_message(&MessageSummary::from_graph(message)))
            .collect::<Vec<_>>();
        let formatted = output::format_links(format, &links)?;
        println!("{formatted}");
        Ok(())
    }

    async fn handle_subscription(
        config: &ConfigArgs,
        command: SubscriptionCommands,
        format: OutputFormat,
    ) -> Result<()> {
        match command {
            SubscriptionCommands::Show => {
                let store = SubscriptionStore::new(config.subscription_path()?);
                let now = Utc::now();
                let current = store
                    .load()
                    .with_context(|| {
                        format!("read subscription record {}", store.path().display())
                    })?
                    .filter(|subscription| subscription.is_active_at(now));
                let formatted = output::format_subscription(format, current.as_ref(), now)?;
                println!("{formatted}");
                Ok(())
            }
            SubscriptionCommands::Create => {
                let (settings, manager) = subscription_manager(config)?;
                let created = manager.create(&settings.target, settings.policy.ttl).await?;
                print_subscription(format, &created)
            }
            SubscriptionCommands::Renew { id } => {
                let (settings, manager) = subscription_manager(config)?;
                let id = match id {
                    Some(id) => id,
                    None => manager
                        .load_current()?
                        .map(|subscription| subscription.id)
                        .ok_or_else(|| {
                            anyhow!(
                                "no active subscription to renew; use 'mailwatch subscription create'"
                            )
                        })?,
                };
                let renewed = manager.renew(&id, settings.policy.ttl).await?;
                print_subscription(format, &renewed)
            }
            SubscriptionCommands::Delete { id } => {
                let (_, manager) = subscription_manager(config)?;
                let id = match id {
                    Some(id) => id,
                    None => manager
                        .store()
                        .load()?
                        .map(|subscription| subscription.id)
                        .ok_or_else(|| anyhow!("no subscription recorded; pass an id to delete"))?,
                };
                manager.delete(&id).await?;
                if format == OutputFormat::Json {
                    println!("{}", json!({ "deleted": id }));
                } else {
                    println!("Deleted subscription: {id}");
                }
                Ok(())
            }
            SubscriptionCommands::Tick => {
                let (settings, manager) = subscription_manager(config)?;
                let worker = RenewalWorker::new(Arc::new(manager), settings.target, settings.policy);
                let outcome = worker.tick().await;
                let formatted = output::format_tick(format, &outcome, Utc::now())?;
                println!("{formatted}");
                Ok(())
            }
        }
    }

    async fn handle_token(config: &ConfigArgs, force_refresh: bool, json: bool) -> Result<()> {
        let credentials = config.credentials()?;
        let token_url = config.token_url(&credentials.tenant_id);
        let (_, tokens) = connect(
            credentials,
            token_url,
            config.api_base(),
            config.http_timeout(),
            config.token_cache_settings()?,
        )?;
        let token = tokens.access_token(force_refresh).await?;

        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "acquired": true,
                    "force_refresh": force_refresh,
                    "token_length": token.len(),
                }))?
            );
        } else {
            println!("Access token acquired ({} characters).", token.len());
        }
        Ok(())
    }

    fn connect(
        credentials: GraphCredentials,
        token_url: String,
        api_base: String,
        http_timeout: Duration,
        token_cache: TokenCacheSettings,
    ) -> Result<(Arc<GraphClient>, Arc<TokenProvider>)> {
        let http = GraphClient::http_client(http_timeout)?;
        let tokens = Arc::new(TokenProvider::new(
            http.clone(),
            credentials,
            token_url,
            token_cache,
        ));
        let graph = Arc::new(GraphClient::new(http, tokens.clone(), api_base));
        Ok((graph, tokens))
    }

    fn mailbox(config: &ConfigArgs) -> Result<GraphMailbox> {
        let credentials = config.credentials()?;
        let token_url = config.token_url(&credentials.tenant_id);
        let (graph, _) = connect(
            credentials,
            token_url,
            config.api_base(),
            config.http_timeout(),
            config.token_cache_settings()?,
        )?;
        Ok(GraphMailbox::new(graph, config.user_email()?))
    }

    fn subscription_manager(config: &ConfigArgs) -> Result<(MonitorConfig, SubscriptionManager)> {
        let settings = config.monitor_config()?;
        let (graph, _) = connect(
            settings.credentials.clone(),
            settings.token_url.clone(),
            settings.api_base.clone(),
            settings.http_timeout,
            settings.token_cache.clone(),
        )?;
        let manager = monitor_manager(&settings, graph);
        Ok((settings, manager))
    }

    fn monitor_manager(settings: &MonitorConfig, graph: Arc<GraphClient>) -> SubscriptionManager {
        SubscriptionManager::new(
            graph,
            SubscriptionStore::new(settings.subscription_path.clone()),
            Arc::new(SystemClock),
        )
    }

    fn print_subscription(
        format: OutputFormat,
        subscription: &Subscription,
    ) -> Result<()> {
        let formatted = output::format_subscription(format, Some(subscription), Utc::now())?;
        println!("{formatted}");
        Ok(())
    }
}
