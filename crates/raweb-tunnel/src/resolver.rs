//! Resource path + origin → descriptor text.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use futures_util::future::BoxFuture;

use crate::auth::Principal;

/// Where the browser found the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOrigin {
    /// A `.rdp` file published on disk.
    Rdp,
    /// A RemoteApp registered on the host.
    Registry,
    /// A managed resource.
    ManagedResource,
    /// The host's own desktop.
    RegistryDesktop,
}

impl FromStr for ResourceOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rdp" => Ok(Self::Rdp),
            "registry" => Ok(Self::Registry),
            "mr" => Ok(Self::ManagedResource),
            "registrydesktop" => Ok(Self::RegistryDesktop),
            other => Err(format!("unknown resource origin {other:?}")),
        }
    }
}

impl fmt::Display for ResourceOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rdp => "rdp",
            Self::Registry => "registry",
            Self::ManagedResource => "mr",
            Self::RegistryDesktop => "registrydesktop",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub path: String,
    pub origin: ResourceOrigin,
    pub principal: Principal,
}

/// Why a resource could not be served. `status` is HTTP-like and is sent
/// to the browser as the error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveFailure {
    pub status: u16,
    pub message: String,
}

impl ResolveFailure {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(404, format!("resource not found: {path}"))
    }
}

pub trait ResourceResolver: Send + Sync + 'static {
    fn resolve<'a>(&'a self, request: &'a ResourceRequest)
    -> BoxFuture<'a, Result<String, ResolveFailure>>;
}

// ---------------------------------------------------------------------------
// DirectoryResolver
// ---------------------------------------------------------------------------

/// Serves `rdp`-origin resources from `<root>/<path>.rdp`.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    root: PathBuf,
}

impl DirectoryResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// File backing `path`, or a 403 if it would leave the root.
    fn file_for(&self, path: &str) -> Result<PathBuf, ResolveFailure> {
        let normalized = path.replace('\\', "/");
        let relative = Path::new(normalized.trim_start_matches('/'));
        let mut file = self.root.clone();
        let mut depth = 0usize;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    file.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                _ => return Err(ResolveFailure::new(403, format!("forbidden path: {path}"))),
            }
        }
        if depth == 0 {
            return Err(ResolveFailure::not_found(path));
        }
        if file.extension().is_none_or(|e| !e.eq_ignore_ascii_case("rdp")) {
            file.as_mut_os_string().push(".rdp");
        }
        Ok(file)
    }
}

impl ResourceResolver for DirectoryResolver {
    fn resolve<'a>(
        &'a self,
        request: &'a ResourceRequest,
    ) -> BoxFuture<'a, Result<String, ResolveFailure>> {
        Box::pin(async move {
            if request.origin != ResourceOrigin::Rdp {
                return Err(ResolveFailure::new(
                    404,
                    format!("origin {} is not served here", request.origin),
                ));
            }
            let file = self.file_for(&request.path)?;
            match tokio::fs::read(&file).await {
                Ok(bytes) => {
                    tracing::debug!(file = %file.display(), user = %request.principal.name, "descriptor resolved");
                    Ok(decode_text(&bytes))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(ResolveFailure::not_found(&request.path))
                }
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %e, "failed to read descriptor");
                    Err(ResolveFailure::new(500, "failed to read resource"))
                }
            }
        })
    }
}

/// `.rdp` files saved by Windows tools are usually UTF-16LE with a BOM.
fn decode_text(bytes: &[u8]) -> String {
    match bytes {
        [0xff, 0xfe, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, origin: ResourceOrigin) -> ResourceRequest {
        ResourceRequest {
            path: path.into(),
            origin,
            principal: Principal {
                name: "alice".into(),
            },
        }
    }

    #[test]
    fn origin_parsing() {
        assert_eq!("rdp".parse::<ResourceOrigin>(), Ok(ResourceOrigin::Rdp));
        assert_eq!("MR".parse::<ResourceOrigin>(), Ok(ResourceOrigin::ManagedResource));
        assert_eq!(
            "registrydesktop".parse::<ResourceOrigin>(),
            Ok(ResourceOrigin::RegistryDesktop)
        );
        assert!("ftp".parse::<ResourceOrigin>().is_err());
    }

    #[tokio::test]
    async fn resolves_utf8_and_utf16_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("apps")).unwrap();
        std::fs::write(dir.path().join("apps/calc.rdp"), "full address:s:pc01\n").unwrap();

        let mut utf16 = vec![0xff, 0xfe];
        for unit in "full address:s:pc02\r\n".encode_utf16() {
            utf16.extend_from_slice(&unit.to_le_bytes());
        }
        std::fs::write(dir.path().join("desk.rdp"), utf16).unwrap();

        let r = DirectoryResolver::new(dir.path());
        let text = r.resolve(&request("apps/calc", ResourceOrigin::Rdp)).await.unwrap();
        assert!(text.contains("pc01"));
        let text = r.resolve(&request("desk.rdp", ResourceOrigin::Rdp)).await.unwrap();
        assert!(text.contains("pc02"));
    }

    #[tokio::test]
    async fn traversal_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let r = DirectoryResolver::new(dir.path());
        let err = r
            .resolve(&request("../secret", ResourceOrigin::Rdp))
            .await
            .unwrap_err();
        assert_eq!(err.status, 403);
        let err = r
            .resolve(&request("apps\\..\\..\\secret", ResourceOrigin::Rdp))
            .await
            .unwrap_err();
        assert_eq!(err.status, 403);
    }

    #[tokio::test]
    async fn missing_file_and_foreign_origin_are_404() {
        let dir = tempfile::tempdir().unwrap();
        let r = DirectoryResolver::new(dir.path());
        let err = r.resolve(&request("nope", ResourceOrigin::Rdp)).await.unwrap_err();
        assert_eq!(err.status, 404);
        let err = r
            .resolve(&request("calc", ResourceOrigin::Registry))
            .await
            .unwrap_err();
        assert_eq!(err.status, 404);
    }
}
