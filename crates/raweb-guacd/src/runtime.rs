//! Virtualized runtime hosting guacd.
//!
//! [`RuntimeHost`] is the seam between the supervisor and the platform.
//! [`WslRuntime`] drives `wsl.exe`: the guacd image is a root filesystem
//! tarball imported as a named distribution. The distribution name embeds
//! an identity tag derived from the tarball's size and modification time,
//! so replacing the tarball yields a new name and the old one can be pruned.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::UNIX_EPOCH;

use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use tokio::process::{Child, Command};

use crate::error::RuntimeError;

/// HRESULT returned when the Windows Subsystem for Linux feature is off.
const HRESULT_WSL_DISABLED: u32 = 0x8007_019e;
/// HRESULT returned when Virtual Machine Platform is off.
const HRESULT_VMP_DISABLED: u32 = 0x8037_0102;

// ---------------------------------------------------------------------------
// Image identity
// ---------------------------------------------------------------------------

/// Identity of the runtime image currently on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageIdentity {
    pub image_path: PathBuf,
    /// Short hex tag derived from size + mtime.
    pub tag: String,
    /// Name the image is registered under: `<prefix>-<tag>`.
    pub instance: String,
}

impl ImageIdentity {
    pub fn new(image_path: PathBuf, prefix: &str, size: u64, modified_nanos: u128) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(size.to_le_bytes());
        hasher.update(modified_nanos.to_le_bytes());
        let digest = hasher.finalize();
        let tag: String = digest[..6].iter().map(|b| format!("{b:02x}")).collect();
        let instance = format!("{prefix}-{tag}");
        Self {
            image_path,
            tag,
            instance,
        }
    }

    /// Compute the identity of the image file at `path`.
    pub async fn of_file(path: &Path, prefix: &str) -> Result<Self, RuntimeError> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RuntimeError::ImageMissing(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let modified = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Ok(Self::new(path.to_path_buf(), prefix, meta.len(), modified))
    }
}

// ---------------------------------------------------------------------------
// RuntimeHost
// ---------------------------------------------------------------------------

/// Platform operations the supervisor needs.
pub trait RuntimeHost: Send + Sync + 'static {
    /// Prefix shared by every instance name this host registers.
    fn instance_prefix(&self) -> &str;

    /// Fails with [`RuntimeError::PlatformMissing`] if the platform is absent.
    fn check_platform(&self) -> BoxFuture<'_, Result<(), RuntimeError>>;

    /// Fails with [`RuntimeError::ComponentMissing`] naming the first
    /// disabled optional component.
    fn check_components(&self) -> BoxFuture<'_, Result<(), RuntimeError>>;

    fn image_identity(&self) -> BoxFuture<'_, Result<ImageIdentity, RuntimeError>>;

    /// Names of every registered instance (not only ours).
    fn installed_instances(&self) -> BoxFuture<'_, Result<Vec<String>, RuntimeError>>;

    fn install<'a>(&'a self, identity: &'a ImageIdentity) -> BoxFuture<'a, Result<(), RuntimeError>>;

    fn uninstall<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, Result<(), RuntimeError>>;

    /// Stop a running instance.
    fn terminate<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, Result<(), RuntimeError>>;

    /// Launch guacd inside `instance`, stdout/stderr piped.
    fn launch_daemon<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, Result<Child, RuntimeError>>;
}

// ---------------------------------------------------------------------------
// WslRuntime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WslConfig {
    /// Path to `wsl.exe`.
    pub wsl_bin: String,
    /// Root filesystem tarball containing guacd.
    pub image_path: PathBuf,
    /// Directory holding one virtual disk per imported instance.
    pub install_root: PathBuf,
    pub instance_prefix: String,
    /// guacd command line inside the instance.
    pub daemon_command: Vec<String>,
}

impl Default for WslConfig {
    fn default() -> Self {
        Self {
            wsl_bin: "wsl.exe".into(),
            image_path: PathBuf::from("guacd-rootfs.tar"),
            install_root: PathBuf::from("runtime"),
            instance_prefix: "raweb-guacd".into(),
            daemon_command: vec![
                "/usr/local/sbin/guacd".into(),
                "-f".into(),
                "-b".into(),
                "0.0.0.0".into(),
                "-l".into(),
                "4822".into(),
                "-L".into(),
                "info".into(),
            ],
        }
    }
}

/// [`RuntimeHost`] backed by `wsl.exe` subprocess calls.
pub struct WslRuntime {
    config: WslConfig,
}

impl WslRuntime {
    pub fn new(config: WslConfig) -> Self {
        Self { config }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.config.wsl_bin);
        cmd.args(args)
            // Without this wsl.exe writes its own messages as UTF-16.
            .env("WSL_UTF8", "1")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Run a wsl command and return stdout. Non-zero exit is classified.
    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let output = self.command(args).output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RuntimeError::PlatformMissing(format!("{} not found", self.config.wsl_bin))
            } else {
                RuntimeError::Io(e)
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let text = format!("{} {}", stdout.trim(), stderr.trim());
        Err(classify_failure(output.status.code(), text.trim()))
    }
}

impl RuntimeHost for WslRuntime {
    fn instance_prefix(&self) -> &str {
        &self.config.instance_prefix
    }

    fn check_platform(&self) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.run(&["--version"]).await.map(|_| ()).map_err(|e| match e {
                RuntimeError::Command { detail, .. } => RuntimeError::PlatformMissing(detail),
                other => other,
            })
        })
    }

    fn check_components(&self) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move { self.run(&["--status"]).await.map(|_| ()) })
    }

    fn image_identity(&self) -> BoxFuture<'_, Result<ImageIdentity, RuntimeError>> {
        Box::pin(ImageIdentity::of_file(
            &self.config.image_path,
            &self.config.instance_prefix,
        ))
    }

    fn installed_instances(&self) -> BoxFuture<'_, Result<Vec<String>, RuntimeError>> {
        Box::pin(async move {
            match self.run(&["--list", "--quiet"]).await {
                Ok(out) => Ok(parse_instance_list(&out)),
                // wsl exits non-zero when no distribution is registered at all.
                Err(RuntimeError::Command { .. }) => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        })
    }

    fn install<'a>(&'a self, identity: &'a ImageIdentity) -> BoxFuture<'a, Result<(), RuntimeError>> {
        Box::pin(async move {
            let target = self.config.install_root.join(&identity.instance);
            tokio::fs::create_dir_all(&target).await?;
            let target = target.to_string_lossy().into_owned();
            let image = identity.image_path.to_string_lossy().into_owned();
            tracing::info!(instance = %identity.instance, image = %image, "importing guacd runtime");
            self.run(&["--import", &identity.instance, &target, &image, "--version", "2"])
                .await?;
            Ok(())
        })
    }

    fn uninstall<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.run(&["--unregister", instance]).await?;
            let dir = self.config.install_root.join(instance);
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %dir.display(), error = %e, "failed to remove instance directory");
                }
            }
            Ok(())
        })
    }

    fn terminate<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, Result<(), RuntimeError>> {
        Box::pin(async move { self.run(&["--terminate", instance]).await.map(|_| ()) })
    }

    fn launch_daemon<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, Result<Child, RuntimeError>> {
        Box::pin(async move {
            let mut args: Vec<&str> = vec!["-d", instance, "--exec"];
            args.extend(self.config.daemon_command.iter().map(String::as_str));
            let child = self
                .command(&args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        RuntimeError::PlatformMissing(format!("{} not found", self.config.wsl_bin))
                    } else {
                        RuntimeError::Io(e)
                    }
                })?;
            Ok(child)
        })
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

fn parse_instance_list(output: &str) -> Vec<String> {
    output
        .lines()
        // Strip stray NULs in case WSL_UTF8 was ignored by an older wsl.exe.
        .map(|l| l.replace('\0', "").trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Map a failed wsl invocation to a [`RuntimeError`].
fn classify_failure(exit_code: Option<i32>, text: &str) -> RuntimeError {
    match extract_hresult(text) {
        Some(HRESULT_WSL_DISABLED) => {
            RuntimeError::ComponentMissing("Microsoft-Windows-Subsystem-Linux".into())
        }
        Some(HRESULT_VMP_DISABLED) => RuntimeError::ComponentMissing("VirtualMachinePlatform".into()),
        Some(code) => RuntimeError::Command {
            code: i64::from(code),
            detail: text.to_string(),
        },
        None => RuntimeError::Command {
            code: exit_code.map(i64::from).unwrap_or(-1),
            detail: text.to_string(),
        },
    }
}

/// First `0x` followed by eight hex digits, e.g. `Wsl/Service/0x8007019e`.
fn extract_hresult(text: &str) -> Option<u32> {
    let lower = text.to_ascii_lowercase();
    let mut rest = lower.as_str();
    while let Some(pos) = rest.find("0x") {
        let candidate = &rest[pos + 2..];
        let hex: String = candidate
            .chars()
            .take_while(char::is_ascii_hexdigit)
            .collect();
        if hex.len() == 8 {
            return u32::from_str_radix(&hex, 16).ok();
        }
        rest = candidate;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_and_prefixed() {
        let a = ImageIdentity::new("img.tar".into(), "raweb-guacd", 1024, 42);
        let b = ImageIdentity::new("img.tar".into(), "raweb-guacd", 1024, 42);
        assert_eq!(a, b);
        assert_eq!(a.tag.len(), 12);
        assert!(a.instance.starts_with("raweb-guacd-"));
    }

    #[test]
    fn identity_changes_with_mtime() {
        let a = ImageIdentity::new("img.tar".into(), "p", 1024, 42);
        let b = ImageIdentity::new("img.tar".into(), "p", 1024, 43);
        assert_ne!(a.instance, b.instance);
    }

    #[tokio::test]
    async fn identity_of_missing_file() {
        let err = ImageIdentity::of_file(Path::new("/nonexistent/guacd.tar"), "p")
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ImageMissing(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn identity_of_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guacd.tar");
        std::fs::write(&path, b"rootfs").unwrap();
        let id = ImageIdentity::of_file(&path, "raweb-guacd").await.unwrap();
        assert_eq!(id.image_path, path);
    }

    #[test]
    fn hresult_extraction() {
        assert_eq!(
            extract_hresult("Error code: Wsl/Service/RegisterDistro/0x8007019e"),
            Some(0x8007_019e)
        );
        assert_eq!(extract_hresult("Error: 0x80370102 something"), Some(0x8037_0102));
        assert_eq!(extract_hresult("0x12 short then 0xDEADBEEF"), Some(0xdead_beef));
        assert_eq!(extract_hresult("no code here"), None);
    }

    #[test]
    fn classify_known_components() {
        assert!(matches!(
            classify_failure(Some(1), "Wsl/0x8007019e"),
            RuntimeError::ComponentMissing(c) if c.contains("Subsystem-Linux")
        ));
        assert!(matches!(
            classify_failure(Some(1), "0x80370102"),
            RuntimeError::ComponentMissing(c) if c == "VirtualMachinePlatform"
        ));
    }

    #[test]
    fn classify_unknown_keeps_raw_code() {
        match classify_failure(Some(1), "boom 0x80004005") {
            RuntimeError::Command { code, .. } => assert_eq!(code, 0x8000_4005),
            other => panic!("unexpected: {other:?}"),
        }
        match classify_failure(Some(3), "plain failure") {
            RuntimeError::Command { code, .. } => assert_eq!(code, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn instance_list_parsing() {
        let out = "Ubuntu\r\nraweb-guacd-0011aabbccdd\r\n\r\n";
        assert_eq!(
            parse_instance_list(out),
            vec!["Ubuntu".to_string(), "raweb-guacd-0011aabbccdd".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_binary_is_platform_missing() {
        let rt = WslRuntime::new(WslConfig {
            wsl_bin: "/nonexistent/wsl.exe".into(),
            ..WslConfig::default()
        });
        let err = rt.check_platform().await.unwrap_err();
        assert!(matches!(err, RuntimeError::PlatformMissing(_)), "got {err:?}");
    }
}
