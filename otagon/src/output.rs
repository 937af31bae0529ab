//! Text and JSON rendering for CLI results

use anyhow::Result;
use chrono::{DateTime, Utc};
use otagon_core::{
    Conversation, ConversationSummary, Message, MigrationReport, QuotaDecision, TrialCheck,
    UsageSummary, User,
};
use serde::Serialize;

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn short_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}

pub fn user(user: &User, json: bool) -> Result<()> {
    if json {
        return print_json(user);
    }

    println!("User: {} ({})", user.id, user.auth_user_id);
    println!("  Email: {}", user.email);
    println!("  Tier:  {}", user.tier.display_name());
    println!("  Text:  {}/{}", user.text_count, user.text_limit);
    println!("  Image: {}/{}", user.image_count, user.image_limit);
    if user.is_on_trial {
        if let Some(expires) = user.trial_expires_at {
            println!("  Trial: active until {}", short_time(expires));
        }
    } else if user.has_used_trial {
        println!("  Trial: used");
    }
    Ok(())
}

pub fn users(users: &[User], json: bool) -> Result<()> {
    if json {
        return print_json(users);
    }
    if users.is_empty() {
        println!("No users.");
        return Ok(());
    }
    for user in users {
        println!(
            "{}  {:<24} {:<8} text {}/{}  image {}/{}",
            user.id,
            user.auth_user_id,
            user.tier.as_str(),
            user.text_count,
            user.text_limit,
            user.image_count,
            user.image_limit
        );
    }
    Ok(())
}

pub fn trial_check(check: &TrialCheck, json: bool) -> Result<()> {
    let (status, detail) = match check {
        TrialCheck::NotOnTrial { .. } => ("not_on_trial", None),
        TrialCheck::Active { expires_at, .. } => ("active", Some(short_time(*expires_at))),
        TrialCheck::ExpiringSoon { hours_left, .. } => {
            ("expiring_soon", Some(format!("{}h", hours_left)))
        }
        TrialCheck::Expired { .. } => ("expired", None),
    };

    if json {
        return print_json(&serde_json::json!({
            "trial": status,
            "detail": detail,
            "user": check.user(),
        }));
    }

    match check {
        TrialCheck::NotOnTrial { user } => {
            println!("Session started ({})", user.tier.display_name())
        }
        TrialCheck::Active { expires_at, .. } => {
            println!("Pro trial active until {}", short_time(*expires_at))
        }
        TrialCheck::ExpiringSoon { hours_left, .. } => {
            println!("Pro trial expires in {} hours", hours_left)
        }
        TrialCheck::Expired { .. } => println!("Pro trial expired; now on the Free tier"),
    }
    Ok(())
}

pub fn decision(decision: &QuotaDecision, json: bool) -> Result<()> {
    if json {
        return print_json(decision);
    }
    if decision.allowed {
        println!(
            "Allowed: {} {}/{}",
            decision.kind, decision.used, decision.limit
        );
    } else {
        println!(
            "Denied: {}",
            decision.reason.as_deref().unwrap_or("limit reached")
        );
    }
    Ok(())
}

pub fn usage(usage: &UsageSummary, json: bool) -> Result<()> {
    if json {
        return print_json(usage);
    }
    let trial = if usage.is_on_trial { " (trial)" } else { "" };
    println!("Tier: {}{}", usage.tier.display_name(), trial);
    println!(
        "  Text:  {}/{} ({} left)",
        usage.text.used,
        usage.text.limit,
        usage.text.remaining()
    );
    println!(
        "  Image: {}/{} ({} left)",
        usage.image.used,
        usage.image.limit,
        usage.image.remaining()
    );
    println!("  Resets: {}", short_time(usage.next_reset_at));
    Ok(())
}

pub fn conversations(list: &[ConversationSummary], json: bool) -> Result<()> {
    if json {
        return print_json(list);
    }
    if list.is_empty() {
        println!("No conversations.");
        return Ok(());
    }
    for conv in list {
        let mut flags = String::new();
        if conv.is_pinned {
            flags.push_str(" [pinned]");
        }
        if conv.is_archived {
            flags.push_str(" [archived]");
        }
        println!(
            "{:<24} {}{}  ({} messages, {} insights, {})",
            conv.id,
            conv.title,
            flags,
            conv.message_count,
            conv.insight_count,
            short_time(conv.updated_at)
        );
    }
    Ok(())
}

pub fn conversation(conv: &Conversation, json: bool) -> Result<()> {
    if json {
        return print_json(conv);
    }

    println!("{} ({}) v{}", conv.title, conv.id, conv.version);
    if let Some(game) = &conv.game_title {
        println!("  Game: {}", game);
    }
    for message in &conv.messages {
        let image = message
            .image_ref
            .as_deref()
            .map(|r| format!(" [image: {}]", r))
            .unwrap_or_default();
        println!(
            "  [{}] {}: {}{}",
            short_time(message.created_at),
            message.role.as_str(),
            message.content,
            image
        );
    }
    for insight in conv.insights.values() {
        println!(
            "  Insight {} ({}): {}",
            insight.id,
            insight.status.as_str(),
            insight.title
        );
    }
    Ok(())
}

pub fn message_id(message: &Message, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({ "id": message.id }));
    }
    println!("{}", message.id);
    Ok(())
}

pub fn migration(report: &MigrationReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    println!(
        "Moved {}, deduplicated {}, missing {}",
        report.moved.len(),
        report.deduplicated.len(),
        report.missing.len()
    );
    Ok(())
}

pub fn removed(what: &str, id: &str, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({ "removed": what, "id": id }));
    }
    println!("Removed {} {}", what, id);
    Ok(())
}
