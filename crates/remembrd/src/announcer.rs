//! Announcement outputs: spoken via an external TTS program, or log-only.

use remembr_core::Announcer;
use std::process::Stdio;

/// Speaks announcements by spawning a text-to-speech command per phrase.
///
/// The phrase is passed as the final argument. The child is reaped in the
/// background; the loop never waits on speech.
pub struct SpeechAnnouncer {
    program: String,
    args: Vec<String>,
}

impl SpeechAnnouncer {
    /// Parse a whitespace-separated command line such as `espeak-ng -s 150`.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Announcer for SpeechAnnouncer {
    fn announce(&self, text: &str) {
        let spawned = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(mut child) => {
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) if !status.success() => {
                            tracing::warn!(%status, "speech command exited with failure")
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "failed to wait for speech command"),
                    }
                });
            }
            Err(e) => {
                tracing::warn!(program = %self.program, error = %e, "failed to start speech command");
            }
        }
    }
}

/// Writes announcements to the log only.
pub struct LogAnnouncer;

impl Announcer for LogAnnouncer {
    fn announce(&self, text: &str) {
        tracing::info!(text, "announcement (speech disabled)");
    }
}
