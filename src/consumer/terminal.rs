//! Interactive terminal front end for the concierge.

use std::collections::HashSet;
use std::error::Error;
use std::future::Future;
use std::io::Write;

use log::debug;
use tokio::io::{ AsyncBufRead, AsyncBufReadExt, BufReader, Lines };

use super::session::ChatSession;
use super::state::{ ChatSnapshot, ChatStatus };
use super::transport::HttpTransport;
use crate::cli::ChatArgs;
use crate::models::chat::Role;

const PROMPT: &str = "you> ";
const ASSISTANT_PREFIX: &str = "concierge> ";

/// Turns successive snapshots into terminal output, printing each reply
/// incrementally as its text grows.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    printed: HashSet<String>,
    current: Option<(String, usize)>,
    last_status: Option<ChatStatus>,
}

impl TranscriptPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders the visible transcript in full and remembers it as printed.
    pub fn intro(&mut self, snapshot: &ChatSnapshot) -> String {
        let mut out = String::new();
        for message in snapshot.visible_messages() {
            let prefix = match message.role {
                Role::Assistant => ASSISTANT_PREFIX,
                Role::User => PROMPT,
            };
            out.push_str(prefix);
            out.push_str(&message.text());
            out.push('\n');
        }
        self.printed.extend(snapshot.messages.iter().map(|m| m.id.clone()));
        self.last_status = Some(snapshot.status);
        out
    }

    pub fn render(&mut self, snapshot: &ChatSnapshot) -> String {
        let mut out = String::new();
        let status_changed = self.last_status != Some(snapshot.status);
        self.last_status = Some(snapshot.status);

        // User turns are typed at the prompt, so they are never echoed.
        for message in &snapshot.messages {
            if message.role == Role::User {
                self.printed.insert(message.id.clone());
            }
        }

        if status_changed && snapshot.status == ChatStatus::Submitted {
            out.push_str("  (thinking...)\n");
        }

        if let Some(reply) = snapshot.messages.last().filter(|m| m.role == Role::Assistant) {
            let text = reply.text();
            let is_current = self.current.as_ref().is_some_and(|(id, _)| *id == reply.id);
            if !is_current && !self.printed.contains(&reply.id) && !text.is_empty() {
                out.push_str(ASSISTANT_PREFIX);
                self.current = Some((reply.id.clone(), 0));
            }
            if let Some((id, shown)) = self.current.as_mut() {
                if *id == reply.id {
                    if let Some(fresh) = text.get(*shown..) {
                        out.push_str(fresh);
                        *shown = text.len();
                    }
                }
            }
        }

        if status_changed && !snapshot.status.is_busy() {
            if let Some((id, _)) = self.current.take() {
                out.push('\n');
                self.printed.insert(id);
            }
            if snapshot.status == ChatStatus::Error {
                let reason = snapshot.error.as_deref().unwrap_or("unknown error");
                out.push_str(&format!("  [the connection to the concierge failed: {}]\n", reason));
            }
        }
        out
    }
}

fn quick_reply_menu(replies: &[&str]) -> String {
    let mut out = String::new();
    for (idx, reply) in replies.iter().enumerate() {
        out.push_str(&format!("  [{}] {}\n", idx + 1, reply));
    }
    out
}

/// What the user asked for at the idle prompt.
#[derive(Debug, PartialEq, Eq)]
enum PromptAction {
    Quit,
    QuickReply(usize),
    Send(String),
}

fn parse_input(line: &str, quick_replies: usize) -> PromptAction {
    let line = line.trim();
    if line == "/quit" {
        return PromptAction::Quit;
    }
    match line.parse::<usize>() {
        Ok(n) if n >= 1 && n <= quick_replies => PromptAction::QuickReply(n - 1),
        _ => PromptAction::Send(line.to_string()),
    }
}

/// Waits for the next input line. End of input or an interrupt at the
/// prompt both quit.
async fn next_action<R, I>(
    lines: &mut Lines<R>,
    interrupt: I,
    quick_replies: usize
) -> std::io::Result<PromptAction>
    where R: AsyncBufRead + Unpin, I: Future<Output = std::io::Result<()>>
{
    tokio::select! {
        line = lines.next_line() => {
            Ok(match line? {
                Some(line) => parse_input(&line, quick_replies),
                None => PromptAction::Quit,
            })
        }
        _ = interrupt => Ok(PromptAction::Quit),
    }
}

fn print_flush(text: &str) {
    if text.is_empty() {
        return;
    }
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
}

pub async fn run(args: ChatArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let session = ChatSession::new(HttpTransport::new(args.url.clone()));
    let mut printer = TranscriptPrinter::new();

    print_flush(&printer.intro(&session.snapshot()));
    print_flush(&quick_reply_menu(session.quick_replies().await));
    print_flush("Type a question, a quick reply number, or /quit. Ctrl-C stops a reply, or quits at the prompt.\n");

    let mut updates = session.subscribe();
    let renderer = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            print_flush(&printer.render(&snapshot));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print_flush(PROMPT);
        let quick_count = session.quick_replies().await.len();
        let handle = match next_action(&mut lines, tokio::signal::ctrl_c(), quick_count).await? {
            PromptAction::Quit => break,
            PromptAction::QuickReply(idx) => session.send_quick_reply(idx).await,
            PromptAction::Send(text) => session.send(&text).await,
        };
        let Some(mut handle) = handle else {
            debug!("Input ignored");
            continue;
        };

        tokio::select! {
            _ = &mut handle => {}
            _ = tokio::signal::ctrl_c() => {
                session.stop().await;
                let _ = handle.await;
            }
        }
    }

    drop(session);
    renderer.abort();
    Ok(())
}
