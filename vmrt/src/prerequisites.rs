//! Startup prerequisite checks (spec §1.2/§7 "Initialization fatal").

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use sandbox::SandboxError;

use crate::command::{Privilege, exec};
use crate::config::Config;
use crate::template::Template;

/// Verify system prerequisites before the server starts accepting requests.
///
/// Checks the VMM binary, kernel, KVM, required network/cgroup tooling, and
/// sudo access for every template known at startup. Collects all failures
/// and returns them in a single `BackendNotAvailable` error.
pub async fn check_prerequisites(config: &Config, templates: &[Template]) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    for template in templates {
        let binary = which::which(template.vmm_type.binary_name());
        match binary {
            Ok(path) => check_executable(&path, template.vmm_type.binary_name(), &mut errors),
            Err(_) => errors.push(format!(
                "{} binary not found on PATH",
                template.vmm_type.binary_name()
            )),
        }
        let kernel = crate::template::TemplatePaths::host_kernel_file(&config.data_root, &template.kernel_version);
        check_file_exists(&kernel, "kernel", &mut errors);
    }

    check_kvm(&mut errors);
    check_required_commands(&mut errors);
    check_sudo(&mut errors).await;
    ensure_parent_cgroup(config, &mut errors).await;
    check_default_gateway(&mut errors).await;

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::BackendNotAvailable(errors.join("; ")))
    }
}

fn check_file_exists(path: &Path, label: &str, errors: &mut Vec<String>) {
    if !path.exists() {
        errors.push(format!("{label} not found: {}", path.display()));
    }
}

fn check_executable(path: &Path, label: &str, errors: &mut Vec<String>) {
    if let Ok(meta) = path.metadata()
        && meta.permissions().mode() & 0o111 == 0
    {
        errors.push(format!("{label} is not executable: {}", path.display()));
    }
}

fn check_kvm(errors: &mut Vec<String>) {
    let kvm = Path::new("/dev/kvm");
    if !kvm.exists() {
        errors.push("/dev/kvm not found (KVM not available)".to_string());
    } else if let Err(e) = std::fs::File::options().read(true).write(true).open(kvm) {
        errors.push(format!("/dev/kvm not accessible: {e}"));
    }
}

fn check_required_commands(errors: &mut Vec<String>) {
    for cmd in ["ip", "iptables", "iptables-save", "unshare", "mkfs.ext4"] {
        if which::which(cmd).is_err() {
            errors.push(format!("required command not found: {cmd}"));
        }
    }
}

async fn check_sudo(errors: &mut Vec<String>) {
    if exec("sudo", &["-n", "true"], Privilege::User)
        .await
        .is_err()
    {
        errors.push(
            "root/sudo access required for network and cgroup configuration; \
             please run with sudo or configure sudoers"
                .to_string(),
        );
    }
}

async fn ensure_parent_cgroup(config: &Config, errors: &mut Vec<String>) {
    if let Err(e) = crate::files::init_parent_cgroup(&config.parent_cgroup).await {
        errors.push(format!("parent cgroup init failed: {e}"));
    }
}

/// Discover the host's default gateway device, used to derive the veth/NAT
/// rules each sandbox network attaches to.
async fn check_default_gateway(errors: &mut Vec<String>) {
    match exec("ip", &["route", "show", "default"], Privilege::User).await {
        Ok(out) if out.contains("default") => {}
        Ok(_) => errors.push("no default route found on host".to_string()),
        Err(e) => errors.push(format!("failed to read default route: {}", e.detail)),
    }
}
