//! Platform capability layer.
//!
//! Per-OS variation lives behind one trait implemented per platform and
//! chosen at startup; the dispatcher's logic stays platform-agnostic.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use veil_config::path::is_safe_relative;
use veil_config::{CaseSensitivity, VeilContext};
use veil_journal::ContentId;

/// On-disk placeholder and content operations.
pub trait PlatformLayer: Send + Sync {
    fn case_sensitivity(&self) -> CaseSensitivity;

    /// Create an empty placeholder file. The content identifier is owned
    /// by the ledger; the on-disk placeholder carries no payload.
    fn write_placeholder_file(&self, relative: &str, content_id: &ContentId) -> io::Result<()>;

    fn write_placeholder_folder(&self, relative: &str) -> io::Result<()>;

    /// Write real content over a placeholder (hydration).
    fn write_file_contents(&self, relative: &str, bytes: &[u8]) -> io::Result<()>;

    /// Remove a placeholder file or folder. Absent targets are fine.
    fn delete_entry(&self, relative: &str) -> io::Result<()>;
}

/// Select the platform layer for this process.
pub fn platform_layer(ctx: &VeilContext) -> Arc<dyn PlatformLayer> {
    Arc::new(DiskPlatformLayer::new(ctx.clone()))
}

/// Plain-filesystem implementation used on every Unix-like platform; the
/// case policy comes from the context.
pub struct DiskPlatformLayer {
    ctx: VeilContext,
}

impl DiskPlatformLayer {
    pub fn new(ctx: VeilContext) -> Self {
        Self { ctx }
    }

    fn target(&self, relative: &str) -> io::Result<PathBuf> {
        if !is_safe_relative(relative) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("relative path escapes the working tree: {relative}"),
            ));
        }
        Ok(self.ctx.absolute(relative))
    }

    fn ensure_parent(target: &PathBuf) -> io::Result<()> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl PlatformLayer for DiskPlatformLayer {
    fn case_sensitivity(&self) -> CaseSensitivity {
        self.ctx.case()
    }

    fn write_placeholder_file(&self, relative: &str, content_id: &ContentId) -> io::Result<()> {
        let target = self.target(relative)?;
        Self::ensure_parent(&target)?;
        std::fs::File::create(&target)?;
        debug!(path = relative, content_id = %content_id, "placeholder file written");
        Ok(())
    }

    fn write_placeholder_folder(&self, relative: &str) -> io::Result<()> {
        let target = self.target(relative)?;
        std::fs::create_dir_all(&target)?;
        debug!(path = relative, "placeholder folder written");
        Ok(())
    }

    fn write_file_contents(&self, relative: &str, bytes: &[u8]) -> io::Result<()> {
        let target = self.target(relative)?;
        Self::ensure_parent(&target)?;
        std::fs::write(&target, bytes)
    }

    fn delete_entry(&self, relative: &str) -> io::Result<()> {
        let target = self.target(relative)?;
        let result = match std::fs::metadata(&target) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&target),
            Ok(_) => std::fs::remove_file(&target),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
