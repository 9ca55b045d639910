//! Close the engine when the process is asked to stop.

use tao_shared::TaoResult;

use crate::engine::Engine;

/// Wait for SIGINT, SIGQUIT or SIGTERM (Ctrl-C elsewhere). Returns the
/// signal name.
#[cfg(unix)]
pub async fn wait_for_signal() -> TaoResult<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = quit.recv() => "SIGQUIT",
        _ = terminate.recv() => "SIGTERM",
    };
    Ok(name)
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> TaoResult<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Block until a stop signal arrives, then close `engine`.
///
/// Returns the process exit status: 0 when close succeeded, 1 otherwise.
pub async fn close_on_signal(engine: &Engine) -> i32 {
    match wait_for_signal().await {
        Ok(name) => tracing::info!(signal = name, "Received stop signal, closing"),
        Err(e) => tracing::error!("Failed to listen for signals, closing now: {}", e),
    }
    exit_code(engine.close())
}

/// Exit status for the result of `Engine::close`.
pub fn exit_code(closed: TaoResult<()>) -> i32 {
    match closed {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("Close failed: {}", e);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tao_shared::{ErrorCode, TaoError};

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(Ok(())), 0);
        assert_eq!(
            exit_code(Err(TaoError::new(ErrorCode::TaskRunning, "busy"))),
            1
        );
    }
}
