//! Image transports: where images are read from and written to.
//!
//! - `docker://REF`: a registry
//! - `dir:PATH`: a plain directory of blobs
//! - `oci:PATH[:TAG]`: an OCI image layout

pub mod dir;
pub mod docker;
pub mod layout;

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use imgcopy_oci::{BlobInfo, Digest, DigestAlgorithm};

use crate::error::{Error, Result};
use crate::types::{ImageReference, UploadedBlob};

/// Parse `transport:reference`.
pub fn parse_image_name(name: &str) -> Result<Box<dyn ImageReference>> {
    let Some((transport, rest)) = name.split_once(':') else {
        return Err(Error::Config(format!(
            "Invalid image name {:?}, expected colon-separated transport:reference",
            name
        )));
    };
    match transport {
        docker::TRANSPORT_NAME => Ok(Box::new(docker::DockerReference::parse(rest)?)),
        dir::TRANSPORT_NAME => Ok(Box::new(dir::DirReference::new(rest)?)),
        layout::TRANSPORT_NAME => Ok(Box::new(layout::LayoutReference::parse(rest)?)),
        other => Err(Error::Config(format!(
            "Invalid image name {:?}, unknown transport {:?}",
            name, other
        ))),
    }
}

/// Make `path` absolute without requiring it to exist.
pub(crate) fn resolve_path(path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(Error::Config("path must not be empty".into()));
    }
    let p = Path::new(path);
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()?.join(p)
    };
    // Resolve symlinks for the parts that already exist.
    Ok(std::fs::canonicalize(&abs).unwrap_or(abs))
}

/// Policy namespaces of a filesystem path: every parent directory, most
/// specific first, ending with "/".
pub(crate) fn path_namespaces(path: &Path) -> Vec<String> {
    path.ancestors()
        .skip(1)
        .map(|p| p.display().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// The file name a blob is stored under: the hex for sha256, otherwise
/// `<algorithm>-<hex>`.
pub(crate) fn blob_file_name(digest: &Digest) -> String {
    if digest.algorithm_name() == DigestAlgorithm::CANONICAL.name() {
        digest.encoded().to_string()
    } else {
        format!("{}-{}", digest.algorithm_name(), digest.encoded())
    }
}

/// Write `stream` into a temporary file in `dir`, hashing it on the way.
/// Returns the blob's digest and size, and the temporary file to persist.
pub(crate) async fn write_temp_blob(
    dir: &Path,
    stream: &mut (dyn AsyncRead + Send + Unpin),
    info: &BlobInfo,
) -> Result<(UploadedBlob, tempfile::NamedTempFile)> {
    let algorithm = match &info.digest {
        Some(d) => d.algorithm()?,
        None => DigestAlgorithm::CANONICAL,
    };
    let tmp = tempfile::Builder::new()
        .prefix(".blob-")
        .tempfile_in(dir)?;
    let mut file = tokio::fs::File::from_std(tmp.as_file().try_clone()?);

    let mut digester = algorithm.digester();
    let mut size = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        size += n as u64;
    }
    file.flush().await?;
    file.sync_all().await?;

    if let Some(expected) = info.size {
        if expected != size {
            return Err(Error::Transport(format!(
                "Size mismatch when copying {}, expected {}, got {}",
                info.digest_label(),
                expected,
                size
            )));
        }
    }
    Ok((
        UploadedBlob {
            digest: digester.finish(),
            size,
        },
        tmp,
    ))
}

/// Move a finished temporary blob to `path`.
pub(crate) fn persist_blob(tmp: tempfile::NamedTempFile, path: &Path) -> Result<()> {
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_transports() {
        let r = parse_image_name("docker://busybox").unwrap();
        assert_eq!(r.transport_name(), "docker");
        assert_eq!(r.string_within_transport(), "//docker.io/library/busybox:latest");

        let r = parse_image_name("dir:/tmp/img").unwrap();
        assert_eq!(r.transport_name(), "dir");

        let r = parse_image_name("oci:/tmp/layout:v1").unwrap();
        assert_eq!(r.transport_name(), "oci");
        assert!(r.string_within_transport().ends_with(":v1"));
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!(parse_image_name("busybox").is_err());
        assert!(parse_image_name("ftp:/x").is_err());
        assert!(parse_image_name("docker:busybox").is_err());
    }

    #[test]
    fn namespaces_walk_parents() {
        let ns = path_namespaces(Path::new("/a/b/c"));
        assert_eq!(ns, vec!["/a/b", "/a", "/"]);
    }

    #[test]
    fn blob_names() {
        let d = Digest::from_bytes(b"x");
        assert_eq!(blob_file_name(&d), d.encoded());
    }

    #[tokio::test]
    async fn temp_blob_checks_size() {
        let dir = tempfile::TempDir::new().unwrap();
        let data = b"hello".to_vec();
        let info = BlobInfo::new(Digest::from_bytes(&data), Some(5), "");
        let (uploaded, tmp) = write_temp_blob(dir.path(), &mut &data[..], &info)
            .await
            .unwrap();
        assert_eq!(uploaded.size, 5);
        assert_eq!(Some(&uploaded.digest), info.digest.as_ref());
        persist_blob(tmp, &dir.path().join("blob")).unwrap();
        assert_eq!(std::fs::read(dir.path().join("blob")).unwrap(), data);

        let wrong = BlobInfo::new(Digest::from_bytes(&data), Some(6), "");
        assert!(write_temp_blob(dir.path(), &mut &data[..], &wrong).await.is_err());
    }
}
