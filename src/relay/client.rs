//! Unix socket client for the backend relay.

use std::path::Path;

use color_eyre::eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::warn;

use super::protocol::{RelayCommand, RelayEvent};

pub struct RelayLink {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RelayLink {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .wrap_err_with(|| format!("Failed to connect to relay at {}", path.display()))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    pub async fn send(&mut self, command: &RelayCommand) -> Result<()> {
        let mut json = serde_json::to_string(command)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next well-formed event; `None` once the backend closes the socket.
    /// Blank and malformed lines are skipped.
    pub async fn next_event(&mut self) -> Result<Option<RelayEvent>> {
        loop {
            let Some(line) = self
                .lines
                .next_line()
                .await
                .wrap_err("Failed to read from relay")?
            else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RelayEvent>(line) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => warn!("skipping malformed relay line: {}", e),
            }
        }
    }
}
