//! Template model & path derivation (spec §4.1).
//!
//! A template is an immutable, validated description of a VM image plus the
//! path derivations needed to locate its on-disk artifacts. Loading performs
//! I/O (reading the YAML record); everything else here is a pure function of
//! the template and a data root.

use std::path::{Path, PathBuf};

use sandbox::VmmKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("invalid vcpu count: {0}")]
    InvalidVcpu(u32),
    #[error("invalid memory size: {0}")]
    InvalidMem(u32),
    #[error("invalid disk size: {0}")]
    InvalidDisk(u32),
    #[error("invalid kernel version: empty")]
    InvalidKernel,
    #[error("invalid vmm type: {0}")]
    InvalidVmmType(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(#[from] serde_yaml_ng::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateFlags {
    #[serde(default)]
    pub overlay: bool,
    #[serde(default)]
    pub huge_pages: bool,
    #[serde(default)]
    pub no_pull: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub vmm_type: VmmKind,
    pub vcpu: u32,
    pub memory_mb: u32,
    pub disk_mb: u32,
    pub kernel_version: String,
    pub start_command: Option<String>,
    #[serde(default)]
    pub flags: TemplateFlags,
    pub base_image: String,
    #[serde(default = "chrono::Utc::now")]
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Template {
    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.vcpu == 0 {
            return Err(TemplateError::InvalidVcpu(self.vcpu));
        }
        if self.memory_mb == 0 {
            return Err(TemplateError::InvalidMem(self.memory_mb));
        }
        if self.disk_mb == 0 {
            return Err(TemplateError::InvalidDisk(self.disk_mb));
        }
        if self.kernel_version.trim().is_empty() {
            return Err(TemplateError::InvalidKernel);
        }
        Ok(())
    }

    /// Load and validate a template record from `<data_root>/templates/<id>/template.yaml`.
    pub async fn load(data_root: &Path, id: &str) -> Result<Self, TemplateError> {
        let path = TemplatePaths::new(data_root, id).record();
        let content = tokio::fs::read_to_string(&path).await?;
        let template: Template = serde_yaml_ng::from_str(&content)?;
        template.validate()?;
        Ok(template)
    }

    pub async fn save(&self, data_root: &Path) -> Result<(), TemplateError> {
        self.validate()?;
        let paths = TemplatePaths::new(data_root, &self.id);
        tokio::fs::create_dir_all(paths.dir()).await?;
        let content = serde_yaml_ng::to_string(self)?;
        tokio::fs::write(paths.record(), content).await?;
        Ok(())
    }
}

/// Pure path derivations for one template, rooted at `<data_root>/templates/<id>/`.
pub struct TemplatePaths {
    dir: PathBuf,
}

impl TemplatePaths {
    pub fn new(data_root: &Path, id: &str) -> Self {
        Self {
            dir: data_root.join("templates").join(id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record(&self) -> PathBuf {
        self.dir.join("template.yaml")
    }

    /// Staging/final image directory (rootfs + memfile + snapfile).
    pub fn image_dir(&self) -> PathBuf {
        self.dir.clone()
    }

    pub fn rootfs(&self) -> PathBuf {
        self.dir.join("rootfs")
    }

    pub fn rootfs_writable(&self) -> PathBuf {
        self.dir.join("rootfs-writable")
    }

    pub fn memfile(&self) -> PathBuf {
        self.dir.join("memfile")
    }

    pub fn snapfile(&self) -> PathBuf {
        self.dir.join("snapfile")
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.dir.join("instances")
    }

    pub fn instance_dir(&self, sandbox_id: &str) -> PathBuf {
        self.instances_dir().join(sandbox_id)
    }

    pub fn instances_snapshot_dir(&self) -> PathBuf {
        self.dir.join("instances-snapshot")
    }

    pub fn instance_snapshot_dir(&self, sandbox_id: &str) -> PathBuf {
        self.instances_snapshot_dir().join(sandbox_id)
    }

    pub fn host_kernel_dir(data_root: &Path, kernel_version: &str) -> PathBuf {
        data_root.join("kernels").join(kernel_version)
    }

    pub fn host_kernel_file(data_root: &Path, kernel_version: &str) -> PathBuf {
        Self::host_kernel_dir(data_root, kernel_version).join("vmlinux")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_template() -> Template {
        Template {
            id: "default".into(),
            vmm_type: VmmKind::Firecracker,
            vcpu: 2,
            memory_mb: 512,
            disk_mb: 1024,
            kernel_version: "5.10".into(),
            start_command: None,
            flags: TemplateFlags::default(),
            base_image: "alpine:latest".into(),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn valid_template_passes() {
        assert!(valid_template().validate().is_ok());
    }

    #[test]
    fn zero_vcpu_rejected() {
        let mut t = valid_template();
        t.vcpu = 0;
        assert!(matches!(t.validate(), Err(TemplateError::InvalidVcpu(0))));
    }

    #[test]
    fn zero_memory_rejected() {
        let mut t = valid_template();
        t.memory_mb = 0;
        assert!(matches!(t.validate(), Err(TemplateError::InvalidMem(0))));
    }

    #[test]
    fn zero_disk_rejected() {
        let mut t = valid_template();
        t.disk_mb = 0;
        assert!(matches!(t.validate(), Err(TemplateError::InvalidDisk(0))));
    }

    #[test]
    fn empty_kernel_version_rejected() {
        let mut t = valid_template();
        t.kernel_version = "  ".into();
        assert!(matches!(t.validate(), Err(TemplateError::InvalidKernel)));
    }

    #[test]
    fn paths_are_rooted_under_data_root() {
        let root = PathBuf::from("/data");
        let paths = TemplatePaths::new(&root, "env-1");
        assert_eq!(paths.rootfs(), PathBuf::from("/data/templates/env-1/rootfs"));
        assert_eq!(
            paths.instance_dir("sbx-1"),
            PathBuf::from("/data/templates/env-1/instances/sbx-1")
        );
    }
}
