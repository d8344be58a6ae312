use crate::core::message::{Message, Role};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `verbose` selects `debug` for this
/// crate and `warn` for everything else.
pub fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "warn,palaver=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Plain-text transcript of a chat session.
pub struct TranscriptLog {
    file_path: Option<String>,
}

impl TranscriptLog {
    pub fn new(log_file: Option<String>) -> Result<Self, Box<dyn std::error::Error>> {
        if let Some(path) = &log_file {
            // Fail early if the file cannot be created or appended to.
            OpenOptions::new().create(true).append(true).open(path)?;
        }
        Ok(TranscriptLog {
            file_path: log_file,
        })
    }

    pub fn is_active(&self) -> bool {
        self.file_path.is_some()
    }

    pub fn log_message(&self, message: &Message) -> Result<(), Box<dyn std::error::Error>> {
        let Some(file_path) = self.file_path.as_ref() else {
            return Ok(());
        };
        let Some(content) = message.content.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Ok(());
        };

        let prefix = match message.role {
            Role::User => "You: ",
            Role::Assistant => "",
            Role::Tool => "Tool: ",
            Role::System => return Ok(()),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);

        for line in format!("{prefix}{content}").lines() {
            writeln!(writer, "{line}")?;
        }
        // Blank line between messages, matching the on-screen layout.
        writeln!(writer)?;

        writer.flush()?;
        Ok(())
    }

    pub fn status(&self) -> String {
        match &self.file_path {
            None => "disabled".to_string(),
            Some(path) => format!(
                "active ({})",
                Path::new(path)
                    .file_name()
                    .unwrap_or_default()
                    .to_string_lossy()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn transcript_writes_user_and_assistant_lines() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("chat.log");
        let log = TranscriptLog::new(Some(path.to_string_lossy().to_string())).expect("log");

        log.log_message(&Message::system("hidden")).expect("system");
        log.log_message(&Message::user("hello")).expect("user");
        log.log_message(&Message::assistant("hi there")).expect("assistant");

        let written = std::fs::read_to_string(&path).expect("read");
        assert_eq!(written, "You: hello\n\nhi there\n\n");
        assert!(log.status().starts_with("active (chat.log"));
    }

    #[test]
    fn unwritable_transcript_path_fails_up_front() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("chat.log");
        assert!(TranscriptLog::new(Some(path.to_string_lossy().to_string())).is_err());
    }

    #[test]
    fn inactive_transcript_is_a_no_op() {
        let log = TranscriptLog::new(None).expect("log");
        assert!(!log.is_active());
        log.log_message(&Message::user("ignored")).expect("noop");
        assert_eq!(log.status(), "disabled");
    }
}
