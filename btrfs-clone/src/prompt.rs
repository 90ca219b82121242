//! Interactive countdown window.
//!
//! A run reads its terminal through one [`Console`]. Reading stdin blocks a
//! runtime thread until a line arrives, so a single reader task feeds every
//! countdown of the run instead of each window starting its own read.

use crate::utils::{CloneError, Result};
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The countdown line for `remaining` seconds.
pub fn countdown_line(remaining: u64) -> String {
    format!(
        "{:02}:{:02} -- Press [Enter] to continue, or [Ctrl-C] to abort --",
        remaining / 60,
        remaining % 60
    )
}

/// Lines typed by the operator, one reader for the whole run.
pub struct Console {
    lines: Mutex<mpsc::Receiver<()>>,
}

impl Console {
    /// Read from the process's stdin. Must be called inside the runtime.
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }

    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(read_lines(reader, tx));
        Self {
            lines: Mutex::new(rx),
        }
    }

    /// Count down on stderr, giving the operator a chance to abort.
    ///
    /// Enter ends the window early; an interrupt ends the run. A closed stdin
    /// just lets the countdown run out.
    pub async fn countdown(&self, seconds: u64, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CloneError::Interrupted);
        }
        if seconds == 0 {
            return Ok(());
        }

        let mut lines = self.lines.lock().await;
        let mut stdin_closed = false;

        let mut remaining = seconds;
        while remaining > 0 {
            draw(&countdown_line(remaining));
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => remaining -= 1,
                line = lines.recv(), if !stdin_closed => match line {
                    Some(()) => break,
                    None => stdin_closed = true,
                },
                _ = cancel.cancelled() => {
                    eprintln!();
                    return Err(CloneError::Interrupted);
                }
            }
        }
        draw(&countdown_line(remaining));
        eprintln!();
        Ok(())
    }
}

async fn read_lines<R>(mut reader: R, tx: mpsc::Sender<()>)
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Stopped reading stdin: {}", e);
                break;
            }
        }
    }
}

fn draw(line: &str) {
    let mut stderr = std::io::stderr().lock();
    let _ = write!(stderr, "\r{}", line);
    let _ = stderr.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn console(input: &'static str) -> Console {
        Console::new(BufReader::new(input.as_bytes()))
    }

    async fn within_a_second(console: &Console, seconds: u64) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(1), console.countdown(seconds, &CancellationToken::new()))
            .await
            .map_err(|_| CloneError::Config("countdown did not end on Enter".into()))?
    }

    #[test]
    fn test_countdown_line() {
        assert_eq!(
            countdown_line(75),
            "01:15 -- Press [Enter] to continue, or [Ctrl-C] to abort --"
        );
        assert!(countdown_line(0).starts_with("00:00"));
    }

    #[tokio::test]
    async fn test_zero_seconds_returns_immediately() -> Result<()> {
        console("").countdown(0, &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_cancelled_countdown_is_interrupted() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = console("\n").countdown(30, &cancel).await;
        assert!(matches!(result, Err(CloneError::Interrupted)));
    }

    #[tokio::test]
    async fn test_enter_ends_the_window() -> Result<()> {
        within_a_second(&console("\n"), 30).await
    }

    #[tokio::test]
    async fn test_each_window_gets_its_own_enter() -> Result<()> {
        let console = console("\n\n");
        within_a_second(&console, 30).await?;
        within_a_second(&console, 30).await
    }

    #[tokio::test]
    async fn test_enter_after_an_expired_window_reaches_the_next() -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let (mut terminal, input) = tokio::io::duplex(64);
        let console = Console::new(BufReader::new(input));

        console.countdown(1, &CancellationToken::new()).await?;
        terminal.write_all(b"\n").await?;
        within_a_second(&console, 30).await
    }

    #[tokio::test]
    async fn test_closed_stdin_lets_the_countdown_run_out() -> Result<()> {
        let started = std::time::Instant::now();
        console("").countdown(1, &CancellationToken::new()).await?;
        assert!(started.elapsed() >= Duration::from_millis(900));
        Ok(())
    }
}
