use super::{ctrl_c_token, report};
use crate::app::Runtime;
use recall_core::TurnResponse;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

fn print_reply(response: &TurnResponse) {
    if response.is_failed() {
        println!("⚠️  {}", response.text);
    } else {
        println!("{}", response.text);
    }
}

pub async fn run_once(
    runtime: &Runtime,
    session: &str,
    message: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let response = runtime
        .turns
        .handle_turn_with_cancel(session, message, cancel)
        .await
        .map_err(report)?;
    print_reply(&response);

    if response.is_failed() {
        anyhow::bail!("turn failed for session '{}'", session);
    }
    Ok(())
}

pub async fn run_repl(runtime: &Runtime, session: &str) -> anyhow::Result<()> {
    println!("Talking as '{}'. Empty line or Ctrl-D to quit.\n", session);

    let cancel = ctrl_c_token();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let message = line.trim();
        if message.is_empty() {
            break;
        }

        match runtime
            .turns
            .handle_turn_with_cancel(session, message, &cancel)
            .await
        {
            Ok(response) => print_reply(&response),
            Err(recall_core::Error::Cancelled { .. }) => break,
            Err(e) => eprintln!("{}", report(e)),
        }
    }

    println!("Bye.");
    Ok(())
}
