//! Server installation: download the release archive, unpack it, and expose
//! its `bin` directory under a fixed path.

use anyhow::{Context, Result, bail};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

const DOWNLOAD_ATTEMPTS: u32 = 5;
const DOWNLOAD_BACKOFF: Duration = Duration::from_secs(5);

/// Install the server under `root_dir` unless `root_dir/bin` already holds
/// `server_binary`. Returns the bin directory.
pub async fn install_server(root_dir: &Path, url: &str, server_binary: &str) -> Result<PathBuf> {
    let bin_dir = root_dir.join("bin");
    if bin_dir.join(server_binary).exists() {
        info!(bin_dir = %bin_dir.display(), "Server already installed");
        return Ok(bin_dir);
    }

    std::fs::create_dir_all(root_dir)
        .with_context(|| format!("Failed to create {}", root_dir.display()))?;
    let file_name = url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .context("Download URL has no file name")?;
    let archive = root_dir.join(file_name);

    download(url, &archive).await?;
    let unpack_root = root_dir.to_path_buf();
    let archive_path = archive.clone();
    tokio::task::spawn_blocking(move || extract(&archive_path, &unpack_root))
        .await
        .context("Extraction task panicked")??;

    let unpacked = find_bin_dir(root_dir, server_binary)?;
    make_executable(&unpacked)?;
    link_bin_dir(&unpacked, &bin_dir)?;
    if let Err(err) = std::fs::remove_file(&archive) {
        warn!(archive = %archive.display(), error = %err, "Failed to remove archive");
    }
    info!(bin_dir = %bin_dir.display(), "Server installed");
    Ok(bin_dir)
}

/// Download `url` into `dest`, retrying when the transfer fails or comes
/// up short of the advertised length.
pub async fn download(url: &str, dest: &Path) -> Result<()> {
    let client = reqwest::Client::new();
    let mut last_error = None;
    for attempt in 1..=DOWNLOAD_ATTEMPTS {
        match download_once(&client, url, dest).await {
            Ok(bytes) => {
                info!(url, bytes, attempt, "Downloaded");
                return Ok(());
            }
            Err(err) => {
                warn!(url, attempt, error = %err, "Download failed");
                last_error = Some(err);
                if attempt < DOWNLOAD_ATTEMPTS {
                    tokio::time::sleep(DOWNLOAD_BACKOFF).await;
                }
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| anyhow::anyhow!("no download attempts"))
        .context(format!("Failed to download {url}")))
}

async fn download_once(client: &reqwest::Client, url: &str, dest: &Path) -> Result<u64> {
    let mut response = client.get(url).send().await?.error_for_status()?;
    let expected = response.content_length();
    let mut file =
        File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk)?;
        written += chunk.len() as u64;
    }
    file.flush()?;
    match expected {
        Some(expected) if expected != written => bail!("Downloaded {written} of {expected} bytes"),
        _ => Ok(written),
    }
}

/// Unpack a `.tgz`/`.tar.gz` or `.zip` archive into `dest`.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let file = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    if name.ends_with(".tgz") || name.ends_with(".tar.gz") {
        let decoder = flate2::read::GzDecoder::new(file);
        tar::Archive::new(decoder)
            .unpack(dest)
            .with_context(|| format!("Failed to unpack {}", archive.display()))?;
    } else if name.ends_with(".zip") {
        zip::ZipArchive::new(file)
            .and_then(|mut zip| zip.extract(dest))
            .with_context(|| format!("Failed to unpack {}", archive.display()))?;
    } else {
        bail!("Unsupported archive format: {name}");
    }
    Ok(())
}

/// The first directory named `bin` under `root` holding `server_binary`.
fn find_bin_dir(root: &Path, server_binary: &str) -> Result<PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir() && entry.file_name() == "bin")
        .map(|entry| entry.into_path())
        .find(|dir| dir.join(server_binary).is_file())
        .with_context(|| format!("No bin directory with {server_binary} under {}", root.display()))
}

#[cfg(unix)]
fn make_executable(bin_dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    for entry in std::fs::read_dir(bin_dir)? {
        let path = entry?.path();
        if path.is_file() {
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(perms.mode() | 0o755);
            std::fs::set_permissions(&path, perms)?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_bin_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn link_bin_dir(unpacked: &Path, bin_dir: &Path) -> Result<()> {
    if unpacked == bin_dir {
        return Ok(());
    }
    std::os::unix::fs::symlink(unpacked, bin_dir)
        .with_context(|| format!("Failed to link {}", bin_dir.display()))
}

#[cfg(not(unix))]
fn link_bin_dir(unpacked: &Path, bin_dir: &Path) -> Result<()> {
    if unpacked == bin_dir {
        return Ok(());
    }
    std::fs::create_dir_all(bin_dir)?;
    for entry in std::fs::read_dir(unpacked)? {
        let entry = entry?;
        std::fs::copy(entry.path(), bin_dir.join(entry.file_name()))?;
    }
    Ok(())
}

/// Create the data and log directories. The data directory is made
/// writable for everyone, which the Windows service account needs.
pub fn prepare_dirs(db_path: &Path, log_path: &Path) -> Result<()> {
    std::fs::create_dir_all(db_path)
        .with_context(|| format!("Failed to create {}", db_path.display()))?;
    if let Some(log_dir) = log_path.parent() {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create {}", log_dir.display()))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o777))?;
    }
    #[cfg(not(unix))]
    {
        let mut perms = std::fs::metadata(db_path)?.permissions();
        perms.set_readonly(false);
        std::fs::set_permissions(db_path, perms)?;
    }
    Ok(())
}
