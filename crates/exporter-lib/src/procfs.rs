//! Container resolution from the proc filesystem
//!
//! Maps OS processes to container runtime identifiers by inspecting
//! control-group paths. Recognized runtimes, checked in order with the
//! first match winning:
//! - containerd (`cri-containerd-<id>.scope`)
//! - CRI-O (`crio-<id>.scope`)
//! - Docker (`/docker/<id>` with an ID of at least 12 characters)
//! - Podman (`libpod-<id>.scope`)

use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;

/// Error reading process state. Only raised for real I/O failures, for
/// example when the process disappears mid-read; a host process simply
/// resolves to no container.
#[derive(Debug, Error)]
pub enum ProcError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Read access to `/proc`, with a configurable root for tests.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcFs {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }

    /// Create a resolver rooted at a custom path (for testing).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Container ID of a process, or `None` when the process runs on the
    /// host.
    pub async fn container_id_of(&self, pid: u32) -> Result<Option<String>, ProcError> {
        let content = self.read(pid, "cgroup").await?;
        Ok(content.lines().find_map(extract_container_id))
    }

    /// Pod UID of a process, parsed from the `-pod<uid>.slice` cgroup
    /// component. The kernel writes underscores where the UID has
    /// hyphens; the returned value is normalized back.
    pub async fn pod_uid_of(&self, pid: u32) -> Result<Option<String>, ProcError> {
        let content = self.read(pid, "cgroup").await?;
        Ok(content.lines().find_map(extract_pod_uid))
    }

    /// Process name from `/proc/<pid>/comm`. Synchronous so the
    /// telemetry sampler thread can call it when it opens a window.
    pub fn process_name(&self, pid: u32) -> Result<String, ProcError> {
        let path = self.root.join(pid.to_string()).join("comm");
        std::fs::read_to_string(&path)
            .map(|content| content.trim().to_string())
            .map_err(|source| ProcError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    async fn read(&self, pid: u32, file: &str) -> Result<String, ProcError> {
        let path = self.root.join(pid.to_string()).join(file);
        fs::read_to_string(&path).await.map_err(|source| ProcError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Extract a container ID from one cgroup line.
///
/// Lines look like `hierarchy:controllers:path` on cgroup v1 and
/// `0::path` on v2; only the path part is inspected.
pub fn extract_container_id(line: &str) -> Option<String> {
    let path = cgroup_path(line)?;

    if let Some(id) = scoped_id(path, "cri-containerd-") {
        return Some(id);
    }
    if let Some(id) = scoped_id(path, "crio-") {
        return Some(id);
    }
    if let Some(idx) = path.find("/docker/") {
        let id = path[idx + "/docker/".len()..]
            .split('/')
            .next()
            .unwrap_or_default();
        if id.len() >= 12 {
            return Some(id.to_string());
        }
    }
    if let Some(id) = scoped_id(path, "libpod-") {
        return Some(id);
    }

    None
}

/// Extract a pod UID from one cgroup line, normalizing underscores to
/// hyphens.
pub fn extract_pod_uid(line: &str) -> Option<String> {
    let path = cgroup_path(line)?;
    let idx = path.find("-pod")?;
    let start = idx + "-pod".len();
    let end = path[start..].find(".slice")?;
    Some(path[start..start + end].replace('_', "-"))
}

fn cgroup_path(line: &str) -> Option<&str> {
    line.splitn(3, ':').nth(2)
}

fn scoped_id(path: &str, prefix: &str) -> Option<String> {
    let start = path.find(prefix)? + prefix.len();
    let end = path[start..].find(".scope")?;
    Some(path[start..start + end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTAINERD_LINE: &str = "12:memory:/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-podd916368a_42f4_4dd8_a211_80caf2a7532a.slice/cri-containerd-a1b2c3d4e5f6a7b8.scope";

    #[test]
    fn test_extract_container_id_containerd() {
        assert_eq!(
            extract_container_id(CONTAINERD_LINE),
            Some("a1b2c3d4e5f6a7b8".to_string())
        );
    }

    #[test]
    fn test_extract_container_id_crio() {
        let line = "0::/kubepods.slice/kubepods-besteffort.slice/crio-deadbeef1234.scope";
        assert_eq!(
            extract_container_id(line),
            Some("deadbeef1234".to_string())
        );
    }

    #[test]
    fn test_extract_container_id_docker() {
        let line = "12:memory:/docker/a1b2c3d4e5f6789012345678";
        assert_eq!(
            extract_container_id(line),
            Some("a1b2c3d4e5f6789012345678".to_string())
        );
    }

    #[test]
    fn test_extract_container_id_docker_too_short() {
        let line = "12:memory:/docker/short";
        assert_eq!(extract_container_id(line), None);
    }

    #[test]
    fn test_extract_container_id_libpod() {
        let line = "0::/machine.slice/libpod-feedface0123.scope";
        assert_eq!(extract_container_id(line), Some("feedface0123".to_string()));
    }

    #[test]
    fn test_extract_container_id_host_process() {
        assert_eq!(extract_container_id("0::/user.slice/user-1000.slice"), None);
        assert_eq!(extract_container_id("not a cgroup line"), None);
    }

    #[test]
    fn test_extract_pod_uid_normalizes_underscores() {
        assert_eq!(
            extract_pod_uid(CONTAINERD_LINE),
            Some("d916368a-42f4-4dd8-a211-80caf2a7532a".to_string())
        );
    }

    #[test]
    fn test_extract_pod_uid_absent() {
        assert_eq!(extract_pod_uid("0::/system.slice/sshd.service"), None);
    }

    #[tokio::test]
    async fn test_container_id_of_reads_proc() {
        let dir = tempfile::tempdir().unwrap();
        let pid_dir = dir.path().join("4242");
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::write(pid_dir.join("cgroup"), format!("{CONTAINERD_LINE}\n")).unwrap();

        let procfs = ProcFs::with_root(dir.path());
        let id = procfs.container_id_of(4242).await.unwrap();
        assert_eq!(id, Some("a1b2c3d4e5f6a7b8".to_string()));
    }

    #[tokio::test]
    async fn test_container_id_of_missing_process_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let procfs = ProcFs::with_root(dir.path());
        assert!(procfs.container_id_of(1).await.is_err());
    }

    #[test]
    fn test_process_name_trims_newline() {
        let dir = tempfile::tempdir().unwrap();
        let pid_dir = dir.path().join("100");
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::write(pid_dir.join("comm"), "python\n").unwrap();

        let procfs = ProcFs::with_root(dir.path());
        assert_eq!(procfs.process_name(100).unwrap(), "python");
    }

    #[test]
    fn test_process_name_missing_process_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let procfs = ProcFs::with_root(dir.path());
        assert!(procfs.process_name(100).is_err());
    }
}
