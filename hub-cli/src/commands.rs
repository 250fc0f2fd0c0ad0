use anyhow::{Context, Result, bail};
use hub_client::{
    ChannelEvent, ChannelState, ClientError, HubClient, Notification, Session, UserProfile,
};
use serde::Serialize;
use std::io::BufRead;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::cli::{NotificationAction, OutputFormat};

pub struct CommandExecutor {
    client: HubClient,
    output: OutputFormat,
}

impl CommandExecutor {
    pub fn new(client: HubClient, output: OutputFormat) -> Self {
        Self { client, output }
    }

    pub async fn login(&self, identifier: &str, secret: Option<String>) -> Result<()> {
        let secret = match secret {
            Some(secret) => secret,
            None => read_secret()?,
        };
        let session = self.client.login(identifier, &secret).await.map_err(explain)?;
        self.print_session(session)
    }

    pub async fn login_federated(&self, token: &str) -> Result<()> {
        let session = self
            .client
            .login_with_federated_token(token)
            .await
            .map_err(explain)?;
        self.print_session(session)
    }

    pub async fn logout(&self) -> Result<()> {
        self.client.logout().await?;
        info!("Logged out");
        Ok(())
    }

    pub async fn whoami(&self) -> Result<()> {
        let profile = self.require_session().await?;
        self.print_profile(&profile)
    }

    pub async fn notifications(&self, action: NotificationAction) -> Result<()> {
        let store = self.client.notifications();
        match action {
            NotificationAction::List { unread } => {
                let items = store.load_initial().await.map_err(explain)?;
                let items: Vec<Notification> =
                    items.into_iter().filter(|n| !unread || !n.is_read).collect();
                match self.output {
                    OutputFormat::Json => print_json(&items)?,
                    OutputFormat::Pretty => {
                        for n in &items {
                            println!("{}", format_notification(n));
                        }
                        println!("{} unread", store.unread_count());
                    }
                }
            }
            NotificationAction::Read { id } => {
                store.load_initial().await.map_err(explain)?;
                if store.get(id).is_none() {
                    bail!("Notification {id} not found");
                }
                let changed = store.mark_as_read(id).await.map_err(explain)?;
                if !changed {
                    debug!(id, "Already read");
                }
                self.print_unread(store.unread_count())?;
            }
            NotificationAction::ReadAll => {
                store.load_initial().await.map_err(explain)?;
                let count = store.mark_all_as_read().await.map_err(explain)?;
                info!(count, "Marked as read");
                self.print_unread(store.unread_count())?;
            }
        }
        Ok(())
    }

    /// Follow the push channel until Ctrl+C or until it gives up.
    pub async fn watch(&self, initial: bool) -> Result<()> {
        let profile = self.require_session().await?;
        info!(user = profile.id, "Watching notifications");

        if initial {
            let store = self.client.notifications();
            let items = store.load_initial().await.map_err(explain)?;
            info!(count = items.len(), unread = store.unread_count(), "Loaded");
        }

        let channel = self.client.channel();
        let mut events = channel.subscribe();
        channel.connect()?;

        let outcome = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break Ok(());
                }
                event = events.recv() => match event {
                    Ok(ChannelEvent::Notification(n)) => match self.output {
                        OutputFormat::Json => print_json(&n)?,
                        OutputFormat::Pretty => println!("{}", format_notification(&n)),
                    },
                    Ok(ChannelEvent::StateChanged(state)) => log_state(&state),
                    Ok(ChannelEvent::Offline { attempts }) => {
                        break Err(anyhow::anyhow!(
                            "Push channel offline after {attempts} reconnection attempts"
                        ));
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped channel events"),
                    Err(RecvError::Closed) => break Ok(()),
                },
            }
        };

        channel.disconnect().await;
        outcome
    }

    async fn require_session(&self) -> Result<UserProfile> {
        self.client
            .restore_session()
            .await?
            .context("Not logged in; run `hubctl login` first")
    }

    fn print_session(&self, session: Session) -> Result<()> {
        match session.profile {
            Some(profile) => self.print_profile(&profile),
            None => {
                println!("Logged in as user {}", session.user_id);
                Ok(())
            }
        }
    }

    fn print_profile(&self, profile: &UserProfile) -> Result<()> {
        match self.output {
            OutputFormat::Json => print_json(profile),
            OutputFormat::Pretty => {
                let name = profile.username.as_deref().unwrap_or("-");
                let email = profile.email.as_deref().unwrap_or("-");
                println!("{name} <{email}> (id {})", profile.id);
                Ok(())
            }
        }
    }

    fn print_unread(&self, unread: usize) -> Result<()> {
        match self.output {
            OutputFormat::Json => print_json(&serde_json::json!({ "unread": unread })),
            OutputFormat::Pretty => {
                println!("{unread} unread");
                Ok(())
            }
        }
    }
}

fn log_state(state: &ChannelState) {
    match state {
        ChannelState::Backoff { attempt, delay } => {
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting")
        }
        ChannelState::Open => info!("Connected"),
        other => debug!(state = ?other, "Channel state"),
    }
}

fn format_notification(n: &Notification) -> String {
    let marker = if n.is_read { ' ' } else { '*' };
    let sender = n.sender.as_deref().unwrap_or("");
    format!(
        "{marker} [{:>6}] {} {:<12} {sender} {}",
        n.id,
        n.created_at.format("%Y-%m-%d %H:%M"),
        n.source_type,
        n.message
    )
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_secret() -> Result<String> {
    eprint!("Secret: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read secret from stdin")?;
    let secret = line.trim_end_matches(['\r', '\n']).to_string();
    if secret.is_empty() {
        bail!("Empty secret");
    }
    Ok(secret)
}

fn explain(err: ClientError) -> anyhow::Error {
    match err {
        ClientError::NotAuthenticated => anyhow::anyhow!("Not logged in; run `hubctl login` first"),
        ClientError::RenewalFailed(_) | ClientError::AuthExpired => {
            anyhow::anyhow!("Session expired; log in again ({err})")
        }
        other => other.into(),
    }
}
