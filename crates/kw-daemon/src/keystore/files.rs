//! On-disk key material
//!
//! The private key is written owner-read/write only and overwritten with
//! zeros before it is unlinked.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// File name of the private half inside the key directory
pub const PRIVATE_KEY_FILE: &str = "system_key";

/// File name of the public half inside the key directory
pub const PUBLIC_KEY_FILE: &str = "system_key.pub";

/// Write the private key with restrictive permissions
pub fn write_private(path: &Path, pem: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
        }
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(pem.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Write the public key next to the private one
pub fn write_public(path: &Path, line: &str) -> io::Result<()> {
    let mut contents = line.trim_end().to_string();
    contents.push('\n');
    fs::write(path, contents)
}

/// Overwrite a file with zeros and remove it
///
/// Returns `Ok(())` if the file does not exist.
pub fn secure_erase(path: &Path) -> io::Result<()> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    {
        let mut file = OpenOptions::new().write(true).open(path)?;
        let zeros = vec![0u8; len as usize];
        file.write_all(&zeros)?;
        file.sync_all()?;
    }

    fs::remove_file(path)
}

/// Remove a file, ignoring a missing one
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_key_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join(PRIVATE_KEY_FILE);
        write_private(&path, "secret").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "secret");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_secure_erase_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PRIVATE_KEY_FILE);
        write_private(&path, "secret material").unwrap();

        secure_erase(&path).unwrap();
        assert!(!path.exists());

        // Second erase is a no-op
        secure_erase(&path).unwrap();
    }
}
