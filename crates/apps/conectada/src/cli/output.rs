use anyhow::Result;
use conectada_core::command::CommandOutput;
use conectada_core::queue::DrainOutcome;
use conectada_core::{AppEvent, Notification, NotificationLevel, Notifier, Submission};
use serde_json::{json, Value as JsonValue};

#[derive(Debug, Clone, Copy)]
pub struct Output {
    json: bool,
    quiet: bool,
}

impl Output {
    pub fn new(json: bool, quiet: bool) -> Self {
        Self { json, quiet }
    }

    pub fn render(&self, output: &CommandOutput) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(&to_json(output)?)?);
            return Ok(());
        }
        if self.quiet {
            return Ok(());
        }
        for line in to_lines(output) {
            println!("{line}");
        }
        Ok(())
    }

    pub fn event(&self, event: &AppEvent) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(event)?);
        } else if !self.quiet {
            println!("{}", describe_event(event));
        }
        Ok(())
    }
}

fn to_json(output: &CommandOutput) -> Result<JsonValue> {
    let value = match output {
        CommandOutput::LoggedIn { user } => json!({ "logged_in": true, "user": user }),
        CommandOutput::LoggedOut => json!({ "logged_in": false }),
        CommandOutput::User(user) => json!({ "user": user }),
        CommandOutput::Registered(created) => json!({ "registered": created }),
        CommandOutput::Reports(reports) => serde_json::to_value(reports)?,
        CommandOutput::Report(report) => serde_json::to_value(report)?,
        CommandOutput::Evidence(urls) => json!({ "evidencias": urls }),
        CommandOutput::Submission(Submission::Sent(body)) => json!({ "sent": true, "body": body }),
        CommandOutput::Submission(Submission::Queued(action)) => {
            json!({ "sent": false, "queued": action })
        }
        CommandOutput::Drained(DrainOutcome::AlreadyRunning) => json!({ "already_running": true }),
        CommandOutput::Drained(DrainOutcome::Completed(report)) => serde_json::to_value(report)?,
        CommandOutput::Queue(actions) => serde_json::to_value(actions)?,
        CommandOutput::Dropped { id, found } => json!({ "id": id, "dropped": found }),
        CommandOutput::DeadLetters(letters) => serde_json::to_value(letters)?,
        CommandOutput::Cleared => json!({ "cleared": true }),
    };
    Ok(value)
}

fn to_lines(output: &CommandOutput) -> Vec<String> {
    match output {
        CommandOutput::LoggedIn { user } => vec![format!("signed in as {}", user_label(user))],
        CommandOutput::LoggedOut => vec!["signed out".to_string()],
        CommandOutput::User(Some(user)) => vec![user_label(user)],
        CommandOutput::User(None) => vec!["not signed in".to_string()],
        CommandOutput::Registered(_) => vec!["user registered".to_string()],
        CommandOutput::Reports(reports) if reports.is_empty() => vec!["no reports".to_string()],
        CommandOutput::Reports(reports) => reports
            .iter()
            .map(|report| {
                format!(
                    "{:>6}  {:<12} {:<10} {}",
                    report.id,
                    report.estado.as_deref().unwrap_or("-"),
                    report.service_kind(),
                    report.location.as_deref().unwrap_or("")
                )
            })
            .collect(),
        CommandOutput::Report(report) => vec![
            format!("id:        {}", report.id),
            format!("estado:    {}", report.estado.as_deref().unwrap_or("-")),
            format!("service:   {}", report.service_kind()),
            format!("location:  {}", report.location.as_deref().unwrap_or("-")),
            format!("created:   {}", report.created_at.as_deref().unwrap_or("-")),
        ],
        CommandOutput::Evidence(urls) if urls.is_empty() => vec!["no evidence".to_string()],
        CommandOutput::Evidence(urls) => urls.clone(),
        CommandOutput::Submission(Submission::Sent(_)) => vec!["status updated".to_string()],
        CommandOutput::Submission(Submission::Queued(action)) => {
            vec![format!("offline: queued as action {}", action.id)]
        }
        CommandOutput::Drained(DrainOutcome::AlreadyRunning) => {
            vec!["a sync is already running".to_string()]
        }
        CommandOutput::Drained(DrainOutcome::Completed(report)) => vec![format!(
            "synced {} of {} ({} kept for retry, {} rejected)",
            report.succeeded, report.attempted, report.retained, report.dead_lettered
        )],
        CommandOutput::Queue(actions) if actions.is_empty() => vec!["queue is empty".to_string()],
        CommandOutput::Queue(actions) => actions
            .iter()
            .map(|action| format!("{:>14}  {} {}", action.id, action.method, action.url))
            .collect(),
        CommandOutput::Dropped { id, found: true } => vec![format!("dropped action {id}")],
        CommandOutput::Dropped { id, found: false } => vec![format!("no queued action {id}")],
        CommandOutput::DeadLetters(letters) if letters.is_empty() => {
            vec!["no rejected actions".to_string()]
        }
        CommandOutput::DeadLetters(letters) => letters
            .iter()
            .map(|letter| {
                format!(
                    "{:>14}  {} {} -> {} {}",
                    letter.action.id,
                    letter.action.method,
                    letter.action.url,
                    letter.status,
                    letter.body.trim()
                )
            })
            .collect(),
        CommandOutput::Cleared => vec!["cleared".to_string()],
    }
}

fn user_label(user: &JsonValue) -> String {
    let name = user.get("name").and_then(JsonValue::as_str);
    let email = user.get("email").and_then(JsonValue::as_str);
    match (name, email) {
        (Some(name), Some(email)) => format!("{name} <{email}>"),
        (Some(name), None) => name.to_string(),
        (None, Some(email)) => email.to_string(),
        (None, None) => user.to_string(),
    }
}

fn describe_event(event: &AppEvent) -> String {
    match event {
        AppEvent::SessionExpired => "session expired; sign in again".to_string(),
        AppEvent::ActionQueued { id } => format!("queued action {id}"),
        AppEvent::DrainFinished {
            succeeded,
            retained,
            dead_lettered,
        } => format!("sync: {succeeded} delivered, {retained} kept, {dead_lettered} rejected"),
        AppEvent::ConnectivityChanged { connectivity } => format!("connectivity: {connectivity:?}"),
        other => format!("{other:?}"),
    }
}

/// Prints notifications to stderr. `--quiet` keeps only errors.
pub struct TerminalNotifier {
    quiet: bool,
}

impl TerminalNotifier {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl Notifier for TerminalNotifier {
    fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Error => eprintln!("error: {}", notification.message),
            _ if self.quiet => {}
            NotificationLevel::Info => eprintln!("{}", notification.message),
            NotificationLevel::Success => eprintln!("ok: {}", notification.message),
        }
    }
}
