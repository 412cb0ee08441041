//! Terminal generation
//!
//! Subscribes to the project topic, starts a session through an in-process
//! relay and prints fragments as they arrive. Ctrl-C sends a cancellation
//! for the session and the command then waits for its terminal event like
//! any other subscriber would.

use std::future::Future;
use std::io::Write;
use std::time::Duration;

use colored::Colorize;

use crate::audit::{AuditLog, SessionRecord};
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::events::Topic;
use crate::relay::Relay;
use crate::request::{CallerIdentity, GenerationRequest};
use crate::session::SessionState;
use crate::subscriber::{StreamSubscriber, SubscriberUpdate};

/// How long to wait for the session record after the terminal event
const RECORD_WAIT: Duration = Duration::from_secs(5);
const RECORD_POLL: Duration = Duration::from_millis(20);

/// Arguments of the `generate` command
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub workspace: String,
    pub project: String,
    pub chapter: u32,
    pub user: String,
    pub prompt: String,
    pub model: Option<String>,
    pub instruction: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub genre: Option<String>,
    pub tone: Option<String>,
    pub pov: Option<String>,
}

impl GenerateOptions {
    /// Build the generation request these options describe
    pub fn into_request(self) -> GenerationRequest {
        let mut request = GenerationRequest::new(
            CallerIdentity {
                user_id: self.user,
                workspace_id: self.workspace,
                project_id: self.project,
                chapter_order: self.chapter,
            },
            self.prompt,
        );
        request.model = self.model;
        request.instruction = self.instruction;
        if let Some(temperature) = self.temperature {
            request.sampling.temperature = temperature;
        }
        if let Some(max_tokens) = self.max_tokens {
            request.sampling.max_output_tokens = max_tokens;
        }
        request.context.genre = self.genre.unwrap_or_default();
        request.context.tone = self.tone.unwrap_or_default();
        request.context.pov = self.pov.unwrap_or_default();
        request
    }
}

/// Result of one terminal generation
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    pub session_id: String,
    pub success: bool,
    pub text: Option<String>,
    pub error: Option<String>,
    /// Audit record, once the session's merge has run
    pub record: Option<SessionRecord>,
}

impl GenerationReport {
    fn state(&self) -> Option<SessionState> {
        self.record.as_ref().map(|r| r.state)
    }
}

/// Run the `generate` command
///
/// Generated text goes to stdout; the summary goes to stderr.
pub async fn run_generate(config: Config, options: GenerateOptions) -> Result<()> {
    let relay = Relay::open(&config)?;
    let request = options.into_request();

    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    let mut stdout = std::io::stdout();
    let report = stream_generation(&relay, request, &mut stdout, interrupt).await?;
    writeln!(stdout)?;

    print_summary(&report);

    if report.success {
        Ok(())
    } else if report.state() == Some(SessionState::Cancelled) {
        Err(RelayError::Cancelled.into())
    } else {
        Err(anyhow::anyhow!(
            "generation {} failed: {}",
            report.session_id,
            report.error.as_deref().unwrap_or("unknown error")
        ))
    }
}

/// Start a session and write its fragments to `out` until it ends
///
/// `interrupt` resolving requests cancellation of the session.
pub async fn stream_generation<W, F>(
    relay: &Relay,
    request: GenerationRequest,
    out: &mut W,
    interrupt: F,
) -> Result<GenerationReport>
where
    W: Write,
    F: Future<Output = ()>,
{
    let topic = Topic::new(&request.caller.workspace_id, &request.caller.project_id);
    let mut events = relay.bus.subscribe(&topic);
    let mut subscriber = StreamSubscriber::new(topic, request.caller.chapter_order);

    let session_id = relay.coordinator.start(request)?;
    subscriber.track(session_id.clone());

    tokio::pin!(interrupt);
    let mut interrupted = false;

    let (success, text, error) = loop {
        tokio::select! {
            update = subscriber.next_update(&mut events) => match update {
                Some(SubscriberUpdate::Partial { session_id: id, fragment, .. }) if id == session_id => {
                    write!(out, "{}", fragment)?;
                    out.flush()?;
                }
                Some(SubscriberUpdate::Finished { session_id: id, success, text, error }) if id == session_id => {
                    break (success, text, error);
                }
                Some(_) => {}
                None => {
                    return Err(RelayError::Connection("event stream closed".to_string()).into());
                }
            },
            _ = &mut interrupt, if !interrupted => {
                interrupted = true;
                tracing::info!(session_id = %session_id, "Interrupted, cancelling");
                subscriber.request_cancel(&relay.coordinator).await?;
            }
        }
    };

    let record = wait_for_record(&relay.audit, &session_id).await?;

    Ok(GenerationReport {
        session_id,
        success,
        text,
        error,
        record,
    })
}

async fn wait_for_record(audit: &AuditLog, session_id: &str) -> Result<Option<SessionRecord>> {
    let deadline = tokio::time::Instant::now() + RECORD_WAIT;
    loop {
        if let Some(record) = audit.get(session_id)? {
            return Ok(Some(record));
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(session_id, "Session record not written in time");
            return Ok(None);
        }
        tokio::time::sleep(RECORD_POLL).await;
    }
}

fn print_summary(report: &GenerationReport) {
    let state = report
        .state()
        .map(SessionState::label)
        .unwrap_or("UNKNOWN");

    if report.success {
        eprintln!("{} {} {}", "✓".green(), state.green(), report.session_id.cyan());
    } else {
        eprintln!("{} {} {}", "✗".red(), state.red(), report.session_id.cyan());
        if let Some(error) = &report.error {
            eprintln!("  {}", error.red());
        }
    }

    if let Some(record) = &report.record {
        match (record.merged_version, &record.merge_error) {
            (Some(version), _) => eprintln!("  merged at version {}", version),
            (None, Some(merge_error)) => {
                eprintln!("  {} {}", "merge failed:".yellow(), merge_error)
            }
            (None, None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Chapter;
    use crate::upstream::fake::{FakeOpen, FakeUpstream};
    use std::sync::Arc;

    fn relay_with(upstream: Arc<FakeUpstream>) -> Relay {
        let mut config = Config::default();
        config.storage.temporary = true;
        let relay = Relay::with_upstream(&config, upstream).unwrap();
        relay
            .store
            .create("p", vec![Chapter::new(0, "One", "Once")], "author")
            .unwrap();
        relay
    }

    fn options() -> GenerateOptions {
        GenerateOptions {
            workspace: "w".to_string(),
            project: "p".to_string(),
            chapter: 0,
            user: "cli".to_string(),
            prompt: "Go on".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_into_request_applies_overrides() {
        let request = GenerateOptions {
            model: Some("gemini-1.5-flash".to_string()),
            temperature: Some(0.4),
            max_tokens: Some(64),
            genre: Some("noir".to_string()),
            ..options()
        }
        .into_request();

        assert_eq!(request.caller.project_id, "p");
        assert_eq!(request.model.as_deref(), Some("gemini-1.5-flash"));
        assert_eq!(request.sampling.temperature, 0.4);
        assert_eq!(request.sampling.max_output_tokens, 64);
        assert_eq!(request.context.genre, "noir");
        assert!(request.context.prior_text.is_none());
    }

    #[tokio::test]
    async fn test_stream_generation_prints_fragments_and_merges() {
        let upstream = Arc::new(FakeUpstream::new());
        let handle = upstream.push_stream();
        handle.send_delta(" upon");
        handle.send_delta(" a time");
        drop(handle);

        let relay = relay_with(upstream);
        let mut out = Vec::new();
        let report = stream_generation(
            &relay,
            options().into_request(),
            &mut out,
            std::future::pending::<()>(),
        )
        .await
        .unwrap();

        assert!(report.success);
        assert_eq!(String::from_utf8(out).unwrap(), " upon a time");
        assert_eq!(report.text.as_deref(), Some(" upon a time"));

        let record = report.record.unwrap();
        assert_eq!(record.state, SessionState::Completed);
        assert_eq!(record.merged_version, Some(1));

        let doc = relay.store.require("p").unwrap();
        assert_eq!(doc.chapter(0).unwrap().content, "Once upon a time");
    }

    #[tokio::test]
    async fn test_stream_generation_reports_failure() {
        let upstream = Arc::new(FakeUpstream::new());
        upstream.push(FakeOpen::Fail(RelayError::Connection("refused".to_string())));

        let relay = relay_with(upstream);
        let mut out = Vec::new();
        let report = stream_generation(
            &relay,
            options().into_request(),
            &mut out,
            std::future::pending::<()>(),
        )
        .await
        .unwrap();

        assert!(!report.success);
        assert!(out.is_empty());
        assert!(report.error.as_deref().unwrap().contains("refused"));
        assert_eq!(report.state(), Some(SessionState::Failed));
    }

    #[tokio::test]
    async fn test_interrupt_cancels_session() {
        let upstream = Arc::new(FakeUpstream::new());
        let handle = upstream.push_stream();
        handle.send_delta("partial");

        let relay = relay_with(upstream);
        let mut out = Vec::new();
        let interrupt = tokio::time::sleep(Duration::from_millis(50));
        let report = stream_generation(&relay, options().into_request(), &mut out, interrupt)
            .await
            .unwrap();

        assert!(!report.success);
        assert!(report.text.is_none());
        assert_eq!(report.state(), Some(SessionState::Cancelled));

        let doc = relay.store.require("p").unwrap();
        assert_eq!(doc.chapter(0).unwrap().content, "Once");
        drop(handle);
    }
}
