use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};

/// The two callbacks a run is handed: emit a line of progress, and block
/// until the caller supplies a value for a named prompt.
#[async_trait]
pub trait RunConsole: Send {
    fn write_line(&mut self, line: &str);

    /// `None` means no more input will ever arrive.
    async fn read_value(&mut self, prompt: &str) -> Option<String>;
}

/// Terminal console: progress on stdout, answers from stdin
pub struct StdioConsole {
    lines: Lines<BufReader<Stdin>>,
}

impl Default for StdioConsole {
    fn default() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

#[async_trait]
impl RunConsole for StdioConsole {
    fn write_line(&mut self, line: &str) {
        println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), line);
    }

    async fn read_value(&mut self, prompt: &str) -> Option<String> {
        let mut stdout = tokio::io::stdout();
        let _ = stdout.write_all(format!("{prompt}: ").as_bytes()).await;
        let _ = stdout.flush().await;

        match self.lines.next_line().await {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to read from stdin: {}", e);
                None
            }
        }
    }
}
