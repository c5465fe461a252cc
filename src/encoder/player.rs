use anyhow::{Context, Result, anyhow};
use log::info;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};

use crate::pipeline::sink::PipeSink;

/// Low-latency player fed with a raw H.264 stream on its stdin
pub struct Player {
    child: Child,
}

impl Player {
    /// Starts the player and returns it with a sink bound to its stdin.
    pub fn spawn(program: &str, title: &str) -> Result<(Player, PipeSink)> {
        let mut child = Command::new(program)
            .args([
                "-loglevel",
                "error",
                "-fflags",
                "nobuffer",
                "-flags",
                "low_delay",
                "-framedrop",
                "-window_title",
                title,
                "-f",
                "h264",
                "-i",
                "-",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("starting {} (is it installed?)", program))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("{} has no stdin", program))?;
        info!("Playing in {}", program);

        Ok((Player { child }, PipeSink::pipe(stdin, program)))
    }

    /// Resolves when the user closes the player window.
    pub async fn exited(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }
}
