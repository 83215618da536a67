//! Keygen command implementation.
//!
//! Writes `private.pem` and `public.pem` for body encryption.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tracing::info;

use crate::codec;

pub const PRIVATE_KEY_FILE: &str = "private.pem";
pub const PUBLIC_KEY_FILE: &str = "public.pem";

/// Smallest modulus accepted; each chunk must fit PKCS#1 v1.5 padding.
const MIN_BITS: usize = 512;

fn write_new(path: &Path, content: &str, mode: u32) -> anyhow::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Generates a key pair into `dir`. Existing key files are never replaced.
pub fn command_keygen(dir: &Path, bits: usize) -> anyhow::Result<(PathBuf, PathBuf)> {
    if bits < MIN_BITS {
        bail!("key size must be at least {MIN_BITS} bits, got {bits}");
    }
    let private_path = dir.join(PRIVATE_KEY_FILE);
    let public_path = dir.join(PUBLIC_KEY_FILE);
    for path in [&private_path, &public_path] {
        if path.exists() {
            bail!("{} already exists, refusing to overwrite", path.display());
        }
    }

    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let (private_pem, public_pem) = codec::generate_key_pair(bits)?;
    write_new(&private_path, &private_pem, 0o600)?;
    write_new(&public_path, &public_pem, 0o644)?;

    info!(
        bits,
        private = %private_path.display(),
        public = %public_path.display(),
        "Key pair written"
    );
    Ok((private_path, public_path))
}
