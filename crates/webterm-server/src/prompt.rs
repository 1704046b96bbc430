//! Timed login-prompt matcher used for auto-login.
//!
//! Reads backend output one byte at a time until the accumulated text ends
//! with one of the prompts (case-insensitive), then submits the credential.
//! The bytes consumed while scanning are not forwarded to the browser.

use crate::connection::io::{InputSender, OutputStream};
use std::time::Duration;
use tracing::{debug, trace};
use webterm_core::{GatewayError, GatewayResult};

/// Prompts that ask for a user name.
pub const LOGIN_PROMPTS: &[&str] = &["login: ", "user: ", "name: ", "id: "];

/// Prompts that ask for a password.
pub const PASSWORD_PROMPTS: &[&str] = &["password: "];

/// Wait up to `bound` for a prompt on `output`, then send `credential`.
pub async fn match_prompt_and_submit(
    bound: Duration,
    output: &mut OutputStream,
    prompts: &[&str],
    credential: &str,
    input: &InputSender,
) -> GatewayResult<()> {
    debug!(?prompts, "waiting for prompt");
    let seen = tokio::time::timeout(bound, scan(output, prompts))
        .await
        .map_err(|_| GatewayError::PromptTimeout)?
        .ok_or(GatewayError::PromptEof)?;
    debug!(len = seen.len(), "prompt matched, submitting");
    input.submit_line(credential)
}

/// Scan until a prompt matches; `None` at end of stream.
async fn scan(output: &mut OutputStream, prompts: &[&str]) -> Option<String> {
    // every prompt ends in the same character, only test when it shows up
    let last_chars: Vec<u8> = prompts
        .iter()
        .filter_map(|p| p.as_bytes().last().copied())
        .collect();
    let mut seen = String::new();

    loop {
        let byte = output.next_byte().await?;
        seen.push(char::from(byte));
        trace!(byte, "prompt scan");
        if last_chars.contains(&byte) {
            let lower = seen.to_ascii_lowercase();
            if prompts.iter().any(|p| lower.ends_with(p)) {
                return Some(seen);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::io::{BackendCommand, BackendIo};

    #[tokio::test]
    async fn submits_after_prompt() {
        let (mut io, mut peer) = BackendIo::pair();
        peer.output
            .send(b"Welcome\r\nLogin: rest".to_vec())
            .await
            .unwrap();

        match_prompt_and_submit(
            Duration::from_secs(1),
            &mut io.output,
            LOGIN_PROMPTS,
            "alice",
            &io.input,
        )
        .await
        .unwrap();

        assert_eq!(
            peer.commands.recv().await,
            Some(BackendCommand::Data(b"alice\n".to_vec()))
        );
        // output after the prompt is still available to the read loop
        assert_eq!(io.output.next_chunk().await, Some(b"rest".to_vec()));
    }

    #[tokio::test]
    async fn times_out_without_prompt() {
        let (mut io, peer) = BackendIo::pair();
        peer.output.send(b"banner only".to_vec()).await.unwrap();

        let err = match_prompt_and_submit(
            Duration::from_millis(50),
            &mut io.output,
            PASSWORD_PROMPTS,
            "pw",
            &io.input,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::PromptTimeout));
        assert_eq!(err.to_string(), "Timeout");
        drop(peer);
    }

    #[tokio::test]
    async fn eof_before_prompt() {
        let (mut io, peer) = BackendIo::pair();
        peer.output.send(b"bye".to_vec()).await.unwrap();
        drop(peer.output);

        let err = match_prompt_and_submit(
            Duration::from_secs(1),
            &mut io.output,
            PASSWORD_PROMPTS,
            "pw",
            &io.input,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::PromptEof));
    }
}
