use std::time::Duration;

use async_trait::async_trait;

/// Fire-and-forget completion announcements. Implementations swallow their own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn announce(&self, title: &str, body: &str);
}

/// Does nothing. Used when notifications are off.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn announce(&self, _title: &str, _body: &str) {}
}

/// Desktop notification via `osascript` on macOS and `notify-send` elsewhere.
pub struct DesktopNotifier {
    timeout: Duration,
}

impl Default for DesktopNotifier {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
        }
    }
}

impl DesktopNotifier {
    fn command(title: &str, body: &str) -> tokio::process::Command {
        if cfg!(target_os = "macos") {
            let script = format!(
                "display notification \"{}\" with title \"{}\"",
                body.replace('"', "'"),
                title.replace('"', "'")
            );
            let mut cmd = tokio::process::Command::new("osascript");
            cmd.arg("-e").arg(script);
            cmd
        } else {
            let mut cmd = tokio::process::Command::new("notify-send");
            cmd.arg(title).arg(body);
            cmd
        }
    }
}

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn announce(&self, title: &str, body: &str) {
        let mut cmd = Self::command(title, body);
        cmd.stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.status()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => tracing::debug!(?status, "notifier exited unsuccessfully"),
            Ok(Err(e)) => tracing::debug!("notifier unavailable: {e}"),
            Err(_) => tracing::debug!("notifier timed out"),
        }
    }
}
