//! otagon - gaming companion state manager
//!
//! Command-line front end for users, quotas, trials and conversations.

mod output;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use otagon_core::{
    Companion, Config, Database, Insight, InsightStatus, Message, MessageRole, QueryKind, Tier,
};

#[derive(Parser)]
#[command(name = "otagon")]
#[command(about = "Manage gaming companion users, quotas, trials and conversations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override the current time (RFC 3339), e.g. to replay past events
    #[arg(long, global = true)]
    now: Option<String>,

    /// Output format: text (default) or json
    #[arg(short, long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum TierArg {
    Free,
    Pro,
    Vanguard,
}

impl From<TierArg> for Tier {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::Free => Tier::Free,
            TierArg::Pro => Tier::Pro,
            TierArg::Vanguard => Tier::Vanguard,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Text,
    Image,
}

impl From<KindArg> for QueryKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Text => QueryKind::Text,
            KindArg::Image => QueryKind::Image,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    User,
    Assistant,
}

impl From<RoleArg> for MessageRole {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::User => MessageRole::User,
            RoleArg::Assistant => MessageRole::Assistant,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Pending,
    Loaded,
    Error,
}

impl From<StatusArg> for InsightStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => InsightStatus::Pending,
            StatusArg::Loaded => InsightStatus::Loaded,
            StatusArg::Error => InsightStatus::Error,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// User accounts and tiers
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Start a session: trial expiry check and general tab setup
    Session {
        /// User id or auth id
        user: String,
    },

    /// Pro trials
    Trial {
        #[command(subcommand)]
        command: TrialCommands,
    },

    /// Monthly query quotas
    Quota {
        #[command(subcommand)]
        command: QuotaCommands,
    },

    /// Conversations (tabs)
    Conv {
        #[command(subcommand)]
        command: ConvCommands,
    },

    /// Append a message to a conversation
    Message {
        user: String,
        conversation: String,
        text: String,

        /// Author of the message
        #[arg(long, value_enum, default_value_t = RoleArg::User)]
        role: RoleArg,

        /// Reference to an attached screenshot
        #[arg(long)]
        image: Option<String>,
    },

    /// Move messages between conversations
    Migrate {
        user: String,
        from: String,
        to: String,
        /// Message ids to move
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Move messages into the tab for a detected game
    Route {
        user: String,
        game: String,
        /// Message ids to move
        #[arg(required = true)]
        ids: Vec<String>,

        /// Source conversation
        #[arg(long, default_value = otagon_core::GENERAL_CONVERSATION_ID)]
        from: String,
    },

    /// Insight sub-tabs
    Insight {
        #[command(subcommand)]
        command: InsightCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Register a user
    Create {
        auth_id: String,
        email: String,
        #[arg(long, value_enum, default_value_t = TierArg::Free)]
        tier: TierArg,
    },
    /// Show a user
    Show { user: String },
    /// List users
    List,
    /// Change a user's tier
    Tier {
        user: String,
        #[arg(value_enum)]
        tier: TierArg,
    },
}

#[derive(Subcommand)]
enum TrialCommands {
    /// Start a Pro trial
    Start { user: String },
}

#[derive(Subcommand)]
enum QuotaCommands {
    /// Check whether one more query is allowed
    Check {
        user: String,
        #[arg(long, value_enum, default_value_t = KindArg::Text)]
        kind: KindArg,
    },
    /// Consume one query
    Record {
        user: String,
        #[arg(long, value_enum, default_value_t = KindArg::Text)]
        kind: KindArg,
    },
    /// Show both quota windows
    Usage { user: String },
}

#[derive(Subcommand)]
enum ConvCommands {
    /// List conversations
    List {
        user: String,
        /// Include archived conversations
        #[arg(long)]
        archived: bool,
    },
    /// Show a conversation with its messages
    Show { user: String, conversation: String },
    /// Create a conversation
    Create {
        user: String,
        title: String,
        /// Dedicate the conversation to a game
        #[arg(long)]
        game: Option<String>,
    },
    /// Pin to the top of the list
    Pin { user: String, conversation: String },
    Unpin { user: String, conversation: String },
    /// Hide from the default list
    Archive { user: String, conversation: String },
    Unarchive { user: String, conversation: String },
    Rename {
        user: String,
        conversation: String,
        title: String,
    },
    /// Delete a conversation with its messages and insights
    Delete { user: String, conversation: String },
}

#[derive(Subcommand)]
enum InsightCommands {
    /// Add or replace an insight
    Set {
        user: String,
        conversation: String,
        id: String,
        title: String,
        content: String,
        #[arg(long, value_enum, default_value_t = StatusArg::Loaded)]
        status: StatusArg,
    },
    /// Remove an insight
    Remove {
        user: String,
        conversation: String,
        id: String,
    },
}

fn parse_now(now: Option<&str>) -> Result<DateTime<Utc>> {
    match now {
        Some(raw) => Ok(DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("invalid --now timestamp: {}", raw))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        otagon_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let db_path = Config::database_path();
    tracing::debug!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    let companion = Companion::new(Arc::new(db), &config);
    let now = parse_now(cli.now.as_deref())?;
    let json = cli.format == Format::Json;

    let result = run(&companion, cli.command, now, json);
    if let Err(ref e) = result {
        tracing::error!(error = %e, "Command failed");
    }
    result
}

fn run(companion: &Companion, command: Commands, now: DateTime<Utc>, json: bool) -> Result<()> {
    match command {
        Commands::User { command } => match command {
            UserCommands::Create {
                auth_id,
                email,
                tier,
            } => {
                let user = companion.register_user(&auth_id, &email, tier.into(), now)?;
                output::user(&user, json)
            }
            UserCommands::Show { user } => output::user(&companion.user(&user)?, json),
            UserCommands::List => output::users(&companion.database().list_users()?, json),
            UserCommands::Tier { user, tier } => {
                let id = companion.user(&user)?.id;
                let user = companion.trials().set_tier(&id, tier.into(), now)?;
                output::user(&user, json)
            }
        },

        Commands::Session { user } => {
            let id = companion.user(&user)?.id;
            let start = companion.start_session(&id, now)?;
            output::trial_check(&start.trial, json)
        }

        Commands::Trial {
            command: TrialCommands::Start { user },
        } => {
            let id = companion.user(&user)?.id;
            let user = companion.trials().start_trial(&id, now)?;
            output::user(&user, json)
        }

        Commands::Quota { command } => match command {
            QuotaCommands::Check { user, kind } => {
                let id = companion.user(&user)?.id;
                let decision = companion.quota().can_send_query(&id, kind.into(), now)?;
                output::decision(&decision, json)
            }
            QuotaCommands::Record { user, kind } => {
                let id = companion.user(&user)?.id;
                let decision = companion.quota().record_query(&id, kind.into(), now)?;
                output::decision(&decision, json)
            }
            QuotaCommands::Usage { user } => {
                let id = companion.user(&user)?.id;
                output::usage(&companion.quota().usage(&id, now)?, json)
            }
        },

        Commands::Conv { command } => run_conv(companion, command, now, json),

        Commands::Message {
            user,
            conversation,
            text,
            role,
            image,
        } => {
            let id = companion.user(&user)?.id;
            let mut message = Message::new(role.into(), text, now);
            if let Some(image) = image {
                message = message.with_image(image);
            }
            companion
                .store()
                .append_message(&id, &conversation, &message, now)?;
            output::message_id(&message, json)
        }

        Commands::Migrate {
            user,
            from,
            to,
            ids,
        } => {
            let id = companion.user(&user)?.id;
            let report = companion.router().migrate(&id, &ids, &from, &to, now)?;
            output::migration(&report, json)
        }

        Commands::Route {
            user,
            game,
            ids,
            from,
        } => {
            let id = companion.user(&user)?.id;
            let (conversation, report) = companion
                .router()
                .route_to_game(&id, &from, &game, &ids, now)?;
            if !json {
                println!("Routed to {}", conversation.id);
            }
            output::migration(&report, json)
        }

        Commands::Insight { command } => match command {
            InsightCommands::Set {
                user,
                conversation,
                id,
                title,
                content,
                status,
            } => {
                let user_id = companion.user(&user)?.id;
                let created_at = companion
                    .store()
                    .require(&user_id, &conversation)?
                    .insights
                    .get(&id)
                    .map(|existing| existing.created_at)
                    .unwrap_or(now);
                let insight = Insight {
                    id,
                    title,
                    content,
                    status: status.into(),
                    created_at,
                    updated_at: now,
                };
                let conv = companion
                    .store()
                    .upsert_insight(&user_id, &conversation, &insight, now)?;
                output::conversation(&conv, json)
            }
            InsightCommands::Remove {
                user,
                conversation,
                id,
            } => {
                let user_id = companion.user(&user)?.id;
                if !companion
                    .store()
                    .remove_insight(&user_id, &conversation, &id, now)?
                {
                    anyhow::bail!("No insight '{}' in {}", id, conversation);
                }
                output::removed("insight", &id, json)
            }
        },
    }
}

fn run_conv(
    companion: &Companion,
    command: ConvCommands,
    now: DateTime<Utc>,
    json: bool,
) -> Result<()> {
    let store = companion.store();
    match command {
        ConvCommands::List { user, archived } => {
            let id = companion.user(&user)?.id;
            output::conversations(&store.list(&id, archived)?, json)
        }
        ConvCommands::Show { user, conversation } => {
            let id = companion.user(&user)?.id;
            output::conversation(&store.require(&id, &conversation)?, json)
        }
        ConvCommands::Create { user, title, game } => {
            let id = companion.user(&user)?.id;
            let conversation_id = match game.as_deref() {
                Some(game) => otagon_core::game_conversation_id(game),
                None => uuid::Uuid::new_v4().to_string(),
            };
            let conv = store.create(&id, &conversation_id, &title, game.as_deref(), now)?;
            output::conversation(&conv, json)
        }
        ConvCommands::Pin { user, conversation } => {
            let id = companion.user(&user)?.id;
            output::conversation(&store.set_pinned(&id, &conversation, true, now)?, json)
        }
        ConvCommands::Unpin { user, conversation } => {
            let id = companion.user(&user)?.id;
            output::conversation(&store.set_pinned(&id, &conversation, false, now)?, json)
        }
        ConvCommands::Archive { user, conversation } => {
            let id = companion.user(&user)?.id;
            output::conversation(&store.set_archived(&id, &conversation, true, now)?, json)
        }
        ConvCommands::Unarchive { user, conversation } => {
            let id = companion.user(&user)?.id;
            output::conversation(&store.set_archived(&id, &conversation, false, now)?, json)
        }
        ConvCommands::Rename {
            user,
            conversation,
            title,
        } => {
            let id = companion.user(&user)?.id;
            output::conversation(&store.rename(&id, &conversation, &title, now)?, json)
        }
        ConvCommands::Delete { user, conversation } => {
            let id = companion.user(&user)?.id;
            if !store.delete(&id, &conversation)? {
                anyhow::bail!("No conversation '{}'", conversation);
            }
            output::removed("conversation", &conversation, json)
        }
    }
}
