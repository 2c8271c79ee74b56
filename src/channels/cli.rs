//! CLI simulator: stdin REPL that drives the coordinator directly.

use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::pipeline::types::{Decision, HandleOutcome, Intent, MediaPlan, ReplySource};

/// One line of simulator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimInput {
    Message(String),
    Reset,
    Reload,
    Exit,
}

impl SimInput {
    /// Parse a raw line; blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        Some(match line {
            "/exit" | "exit" | "quit" => Self::Exit,
            "/reset" => Self::Reset,
            "/reload" => Self::Reload,
            _ => Self::Message(line.to_string()),
        })
    }
}

/// Reads stdin lines and prints one JSON object per turn.
pub struct CliSimulator;

impl CliSimulator {
    pub fn new() -> Self {
        Self
    }

    /// Stream of parsed stdin lines. Ends on EOF or a read error.
    pub fn inputs(&self) -> impl Stream<Item = SimInput> + Send + Unpin + 'static {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(input) = SimInput::parse(&line) else {
                            eprint!("> ");
                            continue;
                        };
                        if tx.send(input).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|input| (input, rx))
        }))
    }

    /// Print the result of one turn to stdout.
    pub fn print_outcome(&self, outcome: &HandleOutcome) {
        println!("{}", render_outcome(outcome));
        if let Some(decision) = outcome.decision() {
            println!("{}", trigger_summary(&decision.media_plan));
        }
    }

    pub fn prompt(&self) {
        eprint!("> ");
    }
}

impl Default for CliSimulator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct Triggered {
    delayed_video: bool,
    address_image: bool,
    contact_image: bool,
}

#[derive(Debug, Serialize)]
struct TurnOutput<'a> {
    reply_source: ReplySource,
    intent: Intent,
    route_reason: &'a str,
    rule_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_store: Option<&'a str>,
    media_plan: MediaPlan,
    reply_text: &'a str,
    triggered: Triggered,
}

impl<'a> From<&'a Decision> for TurnOutput<'a> {
    fn from(decision: &'a Decision) -> Self {
        let plan = decision.media_plan;
        Self {
            reply_source: decision.reply_source,
            intent: decision.intent,
            route_reason: &decision.route_reason,
            rule_id: decision.rule_id.as_deref(),
            target_store: decision.target_store.as_deref(),
            media_plan: plan,
            reply_text: &decision.reply_text,
            triggered: Triggered {
                delayed_video: plan.delayed_video.is_some(),
                address_image: plan.address_image,
                contact_image: plan.contact_image,
            },
        }
    }
}

/// Pretty JSON for a turn; non-reply outcomes print `{"outcome": ...}`.
pub fn render_outcome(outcome: &HandleOutcome) -> String {
    let value = match outcome.decision() {
        Some(decision) => serde_json::to_value(TurnOutput::from(decision)),
        None => Ok(serde_json::json!({ "outcome": outcome.label() })),
    };
    value
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
}

/// One-line trigger summary.
pub fn trigger_summary(plan: &MediaPlan) -> String {
    let yes_no = |b: bool| if b { "是" } else { "否" };
    format!(
        "本轮触发: 视频={} | 地址图片={} | 联系方式图片={}",
        yes_no(plan.delayed_video.is_some()),
        yes_no(plan.address_image),
        yes_no(plan.contact_image)
    )
}
