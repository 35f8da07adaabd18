use super::report;
use crate::app::Runtime;
use recall_core::{Error, StoreError};
use serde_json::json;

pub async fn show(runtime: &Runtime, session: &str) -> anyhow::Result<()> {
    let record = runtime.manager.record(session).await.map_err(report)?;
    let bookkeeping = runtime.manager.session(session).await.map_err(report)?;

    if record.is_none() && bookkeeping.is_none() {
        println!("No state for session '{}'.", session);
        return Ok(());
    }

    let output = json!({
        "session": bookkeeping,
        "record": record,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

pub async fn forget(runtime: &Runtime, session: &str) -> anyhow::Result<()> {
    match runtime.manager.forget(session).await {
        Ok(()) => println!("✅ Forgot everything stored for '{}'.", session),
        Err(Error::Store(StoreError::NotFound(_))) => {
            println!("Nothing stored for '{}'.", session)
        }
        Err(e) => return Err(report(e)),
    }
    Ok(())
}

pub async fn list(runtime: &Runtime) -> anyhow::Result<()> {
    let sessions = runtime.manager.list_sessions().await.map_err(report)?;
    if sessions.is_empty() {
        println!("No sessions with stored state.");
    }
    for session in sessions {
        println!("{}", session);
    }
    Ok(())
}
