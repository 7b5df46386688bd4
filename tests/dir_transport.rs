//! Copies through the on-disk transports.

mod common;

use std::fs;
use std::path::Path;

use serde_json::Value;
use tempfile::TempDir;

use imgcopy::copy::{copy_image, Options};
use imgcopy::policy::{Policy, PolicyContext};
use imgcopy::signature::Signature;
use imgcopy::transport::layout::REF_NAME_ANNOTATION;
use imgcopy::transport::parse_image_name;
use imgcopy_oci::manifest::{OCI_LAYER, OCI_MANIFEST};
use imgcopy_oci::Digest;

use common::{oci_image, Store};

fn accept_all() -> PolicyContext {
    PolicyContext::new(Policy::insecure_accept_anything())
}

/// Write a `dir:` image with `seeds.len()` gzip layers. Returns the manifest.
async fn write_dir_image(path: &Path, seeds: &[u8]) -> Vec<u8> {
    let store = Store::new();
    let (manifest, layers) = oci_image(&store, "amd64", seeds).await;
    fs::create_dir_all(path).unwrap();
    fs::write(path.join("version"), "Directory Transport Version: 1.1\n").unwrap();
    fs::write(path.join("manifest.json"), &manifest).unwrap();

    let v: Value = serde_json::from_slice(&manifest).unwrap();
    let config = Digest::parse(v["config"]["digest"].as_str().unwrap()).unwrap();
    for digest in layers.iter().map(|l| &l.digest).chain(std::iter::once(&config)) {
        fs::write(path.join(digest.encoded()), store.blob(digest).unwrap()).unwrap();
    }
    manifest
}

fn layer_field(manifest: &[u8], field: &str) -> Vec<String> {
    let v: Value = serde_json::from_slice(manifest).unwrap();
    v["layers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l[field].as_str().unwrap().to_string())
        .collect()
}

async fn copy(src: &str, dest: &str, options: Options) -> imgcopy::Result<Vec<u8>> {
    let src = parse_image_name(src)?;
    let dest = parse_image_name(dest)?;
    copy_image(&accept_all(), dest.as_ref(), src.as_ref(), options).await
}

#[tokio::test]
async fn dir_to_layout_and_back() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    let layout = tmp.path().join("layout");
    let out = tmp.path().join("out");
    let original = write_dir_image(&src, &[1, 2]).await;

    copy(
        &format!("dir:{}", src.display()),
        &format!("oci:{}:v1", layout.display()),
        Options::default(),
    )
    .await
    .unwrap();

    assert_eq!(
        fs::read_to_string(layout.join("oci-layout")).unwrap(),
        r#"{"imageLayoutVersion":"1.0.0"}"#
    );
    let index: Value =
        serde_json::from_slice(&fs::read(layout.join("index.json")).unwrap()).unwrap();
    let entry = &index["manifests"][0];
    assert_eq!(entry["mediaType"], OCI_MANIFEST);
    assert_eq!(entry["annotations"][REF_NAME_ANNOTATION], "v1");
    for digest in layer_field(&original, "digest") {
        let digest = Digest::parse(&digest).unwrap();
        assert!(layout
            .join("blobs")
            .join(digest.algorithm_name())
            .join(digest.encoded())
            .is_file());
    }

    copy(
        &format!("oci:{}:v1", layout.display()),
        &format!("dir:{}", out.display()),
        Options::default(),
    )
    .await
    .unwrap();

    assert_eq!(fs::read(out.join("manifest.json")).unwrap(), original);
    for digest in layer_field(&original, "digest") {
        let digest = Digest::parse(&digest).unwrap();
        assert_eq!(
            fs::read(out.join(digest.encoded())).unwrap(),
            fs::read(src.join(digest.encoded())).unwrap()
        );
    }
    assert_eq!(
        fs::read_to_string(out.join("version")).unwrap(),
        "Directory Transport Version: 1.1\n"
    );
}

#[tokio::test]
async fn decompressing_dir_destination() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    let out = tmp.path().join("out");
    let original = write_dir_image(&src, &[3]).await;

    let mut options = Options::default();
    options.destination_ctx.dir_force_decompress = true;
    let written = copy(
        &format!("dir:{}", src.display()),
        &format!("dir:{}", out.display()),
        options,
    )
    .await
    .unwrap();

    assert_ne!(written, original);
    assert_eq!(layer_field(&written, "mediaType"), vec![OCI_LAYER.to_string()]);
    let digest = Digest::parse(&layer_field(&written, "digest")[0]).unwrap();
    let blob = fs::read(out.join(digest.encoded())).unwrap();
    assert_eq!(blob, common::layer_content(3, 4096 + 3));
    assert!(digest.matches(&blob).unwrap());
}

#[tokio::test]
async fn signatures_are_stored_as_files() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    let out = tmp.path().join("out");
    write_dir_image(&src, &[5]).await;
    let sig = Signature {
        payload: "cGF5bG9hZA==".into(),
        signature: "c2ln".into(),
        key_id: "fedcba9876543210".into(),
    };
    fs::write(src.join("signature-1"), sig.to_bytes().unwrap()).unwrap();

    copy(
        &format!("dir:{}", src.display()),
        &format!("dir:{}", out.display()),
        Options::default(),
    )
    .await
    .unwrap();

    let copied = Signature::from_bytes(&fs::read(out.join("signature-1")).unwrap()).unwrap();
    assert_eq!(copied, sig);
    assert!(!out.join("signature-2").exists());
}

#[tokio::test]
async fn layouts_cannot_store_signatures() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    let layout = tmp.path().join("layout");
    write_dir_image(&src, &[5]).await;
    let sig = Signature {
        payload: String::new(),
        signature: String::new(),
        key_id: String::new(),
    };
    fs::write(src.join("signature-1"), sig.to_bytes().unwrap()).unwrap();

    let err = copy(
        &format!("dir:{}", src.display()),
        &format!("oci:{}:v1", layout.display()),
        Options::default(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("can not copy signatures to"), "{}", err);
}

#[tokio::test]
async fn foreign_directories_are_not_overwritten() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    let out = tmp.path().join("out");
    write_dir_image(&src, &[1]).await;
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("notes.txt"), "keep me").unwrap();

    let err = copy(
        &format!("dir:{}", src.display()),
        &format!("dir:{}", out.display()),
        Options::default(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("is not an image destination"), "{}", err);
    assert_eq!(fs::read_to_string(out.join("notes.txt")).unwrap(), "keep me");
}

#[tokio::test]
async fn unknown_transports_are_rejected() {
    let err = parse_image_name("ftp://example.com/image").unwrap_err();
    assert!(err.to_string().contains("unknown transport"));
    assert!(parse_image_name("no-transport").is_err());
}
