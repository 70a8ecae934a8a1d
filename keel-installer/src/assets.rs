//! Single-file placement for kernels, initramfs images, configs and extras.

use crate::errors::{InstallError, InstallResult};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;
use url::Url;

const HTTP_TIMEOUT_SECS: u64 = 120;
const HTTP_ATTEMPTS: usize = 3;

/// One file to copy from a local path or an `http(s)://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub source: String,
    pub destination: PathBuf,
}

impl Asset {
    pub fn new(source: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// The same asset with its destination re-rooted under `root`.
    ///
    /// Destinations are absolute paths in the installed system; the executor
    /// re-roots them onto the temporary mounts it controls.
    pub fn rebased(&self, root: &Path) -> Self {
        Self {
            source: self.source.clone(),
            destination: rebase(root, &self.destination),
        }
    }

    pub fn is_remote(&self) -> bool {
        remote_url(&self.source).is_some()
    }

    /// Copy the source to the destination, creating parent directories.
    ///
    /// The file is written next to its destination and renamed into place, so a
    /// failed fetch never leaves a truncated file behind.
    pub fn save(&self) -> InstallResult<()> {
        let parent = self
            .destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| self.error("destination has no parent directory"))?;
        fs::create_dir_all(parent).map_err(|e| self.error(e))?;

        let mut staged = tempfile::NamedTempFile::new_in(parent).map_err(|e| self.error(e))?;
        let bytes = match remote_url(&self.source) {
            Some(url) => self.fetch(url, staged.as_file_mut())?,
            None => {
                let mut src = File::open(&self.source).map_err(|e| self.error(e))?;
                io::copy(&mut src, staged.as_file_mut()).map_err(|e| self.error(e))?
            }
        };
        staged.as_file().sync_all().map_err(|e| self.error(e))?;
        staged
            .persist(&self.destination)
            .map_err(|e| self.error(e.error))?;

        log::info!(
            "placed {} -> {} ({} bytes)",
            self.source,
            self.destination.display(),
            bytes
        );
        Ok(())
    }

    fn fetch(&self, url: Url, dest: &mut File) -> InstallResult<u64> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(concat!("keel/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| self.error(e))?;

        let mut last_err = None;
        for attempt in 1..=HTTP_ATTEMPTS {
            log::info!("fetching {} (attempt {}/{})", url, attempt, HTTP_ATTEMPTS);
            match client.get(url.clone()).send() {
                Ok(response) if response.status().is_server_error() => {
                    last_err = Some(format!("{} returned {}", url, response.status()));
                }
                Ok(response) => {
                    let mut response = response.error_for_status().map_err(|e| self.error(e))?;
                    return response.copy_to(dest).map_err(|e| self.error(e));
                }
                Err(err) => last_err = Some(format!("{} request failed: {}", url, err)),
            }
            if attempt < HTTP_ATTEMPTS {
                sleep(Duration::from_secs(1 << attempt));
            }
        }
        Err(self.error(last_err.unwrap_or_else(|| "download failed".to_string())))
    }

    fn error(&self, reason: impl std::fmt::Display) -> InstallError {
        InstallError::asset(self.source.clone(), self.destination.clone(), reason)
    }
}

/// `path` with its root and any `..` dropped, joined onto `root`.
pub fn rebase(root: &Path, path: &Path) -> PathBuf {
    let relative: PathBuf = path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    root.join(relative)
}

fn remote_url(source: &str) -> Option<Url> {
    Url::parse(source)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}

/// Save every asset in order, stopping at the first failure.
pub fn save_all(assets: &[Asset]) -> InstallResult<usize> {
    for asset in assets {
        asset.save()?;
    }
    Ok(assets.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use tempfile::tempdir;

    #[test]
    fn local_file_is_copied_with_parents() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("vmlinuz");
        fs::write(&src, b"kernel").unwrap();
        let dest = dir.path().join("boot/A/vmlinuz");

        Asset::new(src.to_string_lossy(), &dest).save().unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"kernel");
    }

    #[test]
    fn missing_source_fails_without_leaving_a_file() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out/config.yaml");
        let err = Asset::new("/definitely/not/here", &dest).save().unwrap_err();
        assert!(matches!(err, InstallError::Asset { .. }));
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(dir.path().join("out")).unwrap().count(), 0);
    }

    #[test]
    fn url_source_is_fetched() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/initramfs.xz");
            then.status(200).body(b"initrd");
        });
        let dir = tempdir().unwrap();
        let dest = dir.path().join("A/initramfs.xz");

        let asset = Asset::new(server.url("/initramfs.xz"), &dest);
        assert!(asset.is_remote());
        asset.save().unwrap();

        mock.assert();
        assert_eq!(fs::read(&dest).unwrap(), b"initrd");
    }

    #[test]
    fn url_not_found_is_an_asset_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/missing");
            then.status(404);
        });
        let dir = tempdir().unwrap();
        let dest = dir.path().join("missing");
        assert!(Asset::new(server.url("/missing"), &dest).save().is_err());
        assert!(!dest.exists());
    }

    #[test]
    fn rebased_keeps_the_relative_destination() {
        let asset = Asset::new("k", "/boot/A/vmlinuz");
        assert_eq!(
            asset.rebased(Path::new("/tmp/root")).destination,
            PathBuf::from("/tmp/root/boot/A/vmlinuz")
        );
        assert!(!asset.is_remote());
        assert!(!Asset::new("file:///etc/hosts", "/x").is_remote());
    }

    #[test]
    fn save_all_stops_at_first_failure() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good");
        fs::write(&good, b"ok").unwrap();
        let assets = vec![
            Asset::new(good.to_string_lossy(), dir.path().join("a/1")),
            Asset::new("/no/such/file", dir.path().join("a/2")),
            Asset::new(good.to_string_lossy(), dir.path().join("a/3")),
        ];
        assert!(save_all(&assets).is_err());
        assert!(dir.path().join("a/1").exists());
        assert!(!dir.path().join("a/3").exists());
    }
}
