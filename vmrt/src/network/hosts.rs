//! `/etc/hosts` editor (spec §1: "assumed available as an external collaborator
//! with atomic save"; implemented here as a thin, self-contained adapter so the
//! rest of the crate has something concrete to drive in tests).

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Mutex;

use tokio::fs;

const TAG_PREFIX: &str = "# sandbox:";

/// Shared, mutex-guarded editor over a hosts file, rewritten atomically
/// (write to a temp file in the same directory, then rename).
pub struct HostsWriter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HostsWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn tag(sandbox_id: &str) -> String {
        format!("{TAG_PREFIX}{sandbox_id}")
    }

    pub async fn upsert(&self, sandbox_id: &str, ip: Ipv4Addr) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut lines = self.read_lines().await?;
        let tag = Self::tag(sandbox_id);
        lines.retain(|l| !l.ends_with(&tag));
        lines.push(format!("{ip} {sandbox_id} {tag}"));
        self.atomic_write(&lines).await
    }

    pub async fn remove(&self, sandbox_id: &str) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let tag = Self::tag(sandbox_id);
        let mut lines = self.read_lines().await?;
        let before = lines.len();
        lines.retain(|l| !l.ends_with(&tag));
        if lines.len() == before {
            return Ok(());
        }
        self.atomic_write(&lines).await
    }

    async fn read_lines(&self) -> std::io::Result<Vec<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn atomic_write(&self, lines: &[String]) -> std::io::Result<()> {
        let parent = self
            .path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let tmp = parent.join(format!(".hosts.{}.tmp", std::process::id()));
        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_remove_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        let writer = HostsWriter::new(path.clone());

        writer
            .upsert("sbx-1", Ipv4Addr::new(192, 168, 168, 1))
            .await
            .unwrap();
        let content = fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("192.168.168.1 sbx-1"));

        writer.remove("sbx-1").await.unwrap();
        let content = fs::read_to_string(&path).await.unwrap();
        assert!(!content.contains("sbx-1"));
    }

    #[tokio::test]
    async fn upsert_replaces_prior_entry_for_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        let writer = HostsWriter::new(path.clone());

        writer
            .upsert("sbx-1", Ipv4Addr::new(192, 168, 168, 1))
            .await
            .unwrap();
        writer
            .upsert("sbx-1", Ipv4Addr::new(192, 168, 168, 2))
            .await
            .unwrap();

        let content = fs::read_to_string(&path).await.unwrap();
        assert!(!content.contains("168.1 sbx-1"));
        assert!(content.contains("168.2 sbx-1"));
    }

    #[tokio::test]
    async fn remove_missing_entry_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        let writer = HostsWriter::new(path);
        writer.remove("never-existed").await.unwrap();
    }
}
