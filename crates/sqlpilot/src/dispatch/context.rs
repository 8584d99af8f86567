//! Context-augmented chat prompt: owner context, recent history, new turn.

use std::fmt::Write as _;

use crate::memory::{Message, OwnerContext, Role};

const PREAMBLE: &str = "You are a helpful assistant for a database application. \
                        Answer the user's latest message using the conversation so far.";

/// Build the prompt for one queued turn.
///
/// At most `window` prior messages are included. When ingress already
/// appended the new turn to history, that trailing copy is not repeated.
pub fn build_context_prompt(
    owner: Option<&OwnerContext>,
    history: &[Message],
    window: usize,
    new_turn: &str,
) -> String {
    let prior = match history.last() {
        Some(last) if last.role == Role::User && last.content.trim() == new_turn.trim() => {
            &history[..history.len() - 1]
        }
        _ => history,
    };
    let recent = &prior[prior.len().saturating_sub(window)..];

    let mut prompt = String::from(PREAMBLE);
    prompt.push_str("\n\n");

    if let Some(owner) = owner {
        let rendered = owner.render();
        if !rendered.is_empty() {
            let _ = write!(prompt, "About the user:\n{}\n\n", rendered);
        }
    }

    if !recent.is_empty() {
        prompt.push_str("Conversation so far:\n");
        for message in recent {
            let _ = writeln!(prompt, "{}: {}", speaker(message.role), message.content.trim());
        }
        prompt.push('\n');
    }

    let _ = write!(prompt, "User: {}\nAssistant:", new_turn.trim());
    prompt
}

fn speaker(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::System => "System",
    }
}
