//! Install command: atomic replace of one file by another.

use std::path::Path;

use anyhow::{Context, Result};

pub(crate) fn cmd_install(src: &Path, dst: &Path) -> Result<()> {
    phoenix::install::overwrite(dst, src)
        .with_context(|| format!("failed to install {} over {}", src.display(), dst.display()))?;
    println!("Installed {}", dst.display());
    Ok(())
}
