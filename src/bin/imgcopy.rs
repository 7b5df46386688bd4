use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use imgcopy::config::{load_config, CopyConfig, EndpointConfig, ListSelection};
use imgcopy::copy::copy_image;
use imgcopy::encryption::Kek;
use imgcopy::policy::{Policy, PolicyContext};
use imgcopy::signature::generate_signing_key;
use imgcopy::transport::parse_image_name;
use imgcopy_oci::manifest::{self, Manifest, ManifestList};

#[derive(Parser)]
#[command(name = "imgcopy", version, about = "Copy container images between registries, OCI layouts and directories")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy SOURCE-IMAGE to DESTINATION-IMAGE
    Copy(CopyArgs),
    /// Print the manifest of IMAGE
    Inspect(InspectArgs),
    /// Generate a signing key pair or a layer key-encryption key
    Keygen(KeygenArgs),
}

#[derive(Args)]
struct CopyArgs {
    /// e.g. docker://quay.io/org/app:1.0, dir:/tmp/app, oci:/tmp/layout:1.0
    source: String,
    destination: String,

    /// YAML or JSON copy options; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
    /// Signature admission policy (JSON); everything is accepted without one
    #[arg(long, env = "IMGCOPY_POLICY")]
    policy: Option<PathBuf>,

    #[arg(long)]
    remove_signatures: bool,
    /// Ed25519 key file to sign the copied image with
    #[arg(long)]
    sign_by: Option<PathBuf>,
    #[arg(long)]
    sign_passphrase_file: Option<PathBuf>,
    #[arg(long)]
    sign_identity: Option<String>,

    /// Manifest type to write: oci, v2s2 or v2s1
    #[arg(short = 'f', long)]
    format: Option<String>,
    /// gzip, zstd or zstd:chunked
    #[arg(long)]
    dest_compress_format: Option<String>,
    #[arg(long)]
    dest_compress_level: Option<i32>,
    /// Only reuse blobs compressed with --dest-compress-format
    #[arg(long)]
    force_compression: bool,

    /// Copy every image of a list, not just the one for this system
    #[arg(short = 'a', long, conflicts_with = "multi_arch")]
    all: bool,
    /// system, all or specific
    #[arg(long)]
    multi_arch: Option<String>,
    /// Instance digest to copy with --multi-arch specific (repeatable)
    #[arg(long = "instance")]
    instances: Vec<String>,
    #[arg(long)]
    preserve_digests: bool,
    /// Add list instances compressed with this algorithm (repeatable)
    #[arg(long = "ensure-compression-variant")]
    ensure_compression_variants: Vec<String>,

    /// Layer index to encrypt, negative counts from the end (repeatable);
    /// all layers when only --encryption-key is given
    #[arg(long = "encrypt-layer", allow_hyphen_values = true)]
    encrypt_layers: Vec<i64>,
    #[arg(long = "encryption-key")]
    encryption_keys: Vec<PathBuf>,
    #[arg(long = "decryption-key")]
    decryption_keys: Vec<PathBuf>,

    /// USERNAME[:PASSWORD] for the source registry
    #[arg(long, env = "IMGCOPY_SRC_CREDS", hide_env_values = true)]
    src_creds: Option<String>,
    #[arg(long, env = "IMGCOPY_DEST_CREDS", hide_env_values = true)]
    dest_creds: Option<String>,
    /// Use plain HTTP for the source registry
    #[arg(long)]
    src_insecure: bool,
    #[arg(long)]
    dest_insecure: bool,
    #[arg(long)]
    dest_compress: bool,
    #[arg(long)]
    dest_decompress: bool,

    #[arg(long)]
    override_arch: Option<String>,
    #[arg(long)]
    override_os: Option<String>,
    #[arg(long)]
    override_variant: Option<String>,

    /// Maximum concurrent blob copies
    #[arg(short = 'j', long)]
    jobs: Option<usize>,
    /// Skip the copy when the destination already has the same manifest
    #[arg(long)]
    optimize_existing: bool,
    #[arg(long)]
    download_foreign_layers: bool,

    /// Write the digest of the copied manifest to this file
    #[arg(long)]
    digestfile: Option<PathBuf>,
    /// Do not print progress reports
    #[arg(short = 'q', long)]
    quiet: bool,
    /// Draw per-blob progress bars
    #[arg(long)]
    progress: bool,
}

#[derive(Args)]
struct InspectArgs {
    image: String,
    /// Print the manifest bytes unchanged
    #[arg(long)]
    raw: bool,
    #[arg(long, env = "IMGCOPY_CREDS", hide_env_values = true)]
    creds: Option<String>,
    #[arg(long)]
    insecure: bool,
}

#[derive(Args)]
struct KeygenArgs {
    /// Path prefix; writes PREFIX.key and PREFIX.pub, or PREFIX.kek
    #[arg(short = 'o', long, default_value = "imgcopy")]
    output: PathBuf,
    /// Generate an AES-256 key-encryption key for layer encryption
    #[arg(long)]
    kek: bool,
    /// Protect the signing key with the passphrase in this file
    #[arg(long, conflicts_with = "kek")]
    passphrase_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Copy(args) => cmd_copy(args).await?,
        Command::Inspect(args) => cmd_inspect(args).await?,
        Command::Keygen(args) => cmd_keygen(args)?,
    }
    Ok(())
}

async fn cmd_copy(args: CopyArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => CopyConfig::default(),
    };
    apply_copy_flags(&mut config, &args)?;

    let src = parse_image_name(&args.source)?;
    let dest = parse_image_name(&args.destination)?;
    let policy = match args.policy.as_ref().or(config.policy.as_ref()) {
        Some(path) => Policy::from_file(path)?,
        None => {
            debug!("no policy given, accepting any source image");
            Policy::insecure_accept_anything()
        }
    };
    let policy = PolicyContext::new(policy);

    let mut options = config.to_options()?;
    if !args.quiet {
        options.report_writer = Some(Box::new(std::io::stdout()));
    }

    let cancel = CancellationToken::new();
    options.cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling copy");
            cancel.cancel();
        }
    });

    let manifest = copy_image(&policy, dest.as_ref(), src.as_ref(), options).await?;

    if let Some(path) = &args.digestfile {
        let digest = manifest::manifest_digest(&manifest)?;
        fs::write(path, digest.to_string())?;
    }
    Ok(())
}

/// Overlay command-line flags on a loaded config.
fn apply_copy_flags(config: &mut CopyConfig, args: &CopyArgs) -> Result<(), Box<dyn std::error::Error>> {
    config.remove_signatures |= args.remove_signatures;
    if args.sign_by.is_some() {
        config.sign_by_key = args.sign_by.clone();
    }
    if args.sign_passphrase_file.is_some() {
        config.sign_passphrase_file = args.sign_passphrase_file.clone();
    }
    if args.sign_identity.is_some() {
        config.sign_identity = args.sign_identity.clone();
    }
    if args.format.is_some() {
        config.force_manifest_mime_type = args.format.clone();
    }
    if args.dest_compress_format.is_some() {
        config.compression_format = args.dest_compress_format.clone();
    }
    if args.dest_compress_level.is_some() {
        config.compression_level = args.dest_compress_level;
    }
    config.force_compression_format |= args.force_compression;

    if args.all {
        config.image_list_selection = ListSelection::All;
    } else if let Some(selection) = &args.multi_arch {
        config.image_list_selection = match selection.as_str() {
            "system" => ListSelection::System,
            "all" => ListSelection::All,
            "specific" => ListSelection::Specific,
            other => return Err(format!("unknown --multi-arch value {:?}", other).into()),
        };
    }
    config.instances.extend(args.instances.iter().cloned());
    config.preserve_digests |= args.preserve_digests;
    config
        .ensure_compression_variants_exist
        .extend(args.ensure_compression_variants.iter().cloned());

    config.encryption_keys.extend(args.encryption_keys.iter().cloned());
    config.decryption_keys.extend(args.decryption_keys.iter().cloned());
    if !args.encrypt_layers.is_empty() {
        config.encrypt_layers = Some(args.encrypt_layers.clone());
    } else if !args.encryption_keys.is_empty() && config.encrypt_layers.is_none() {
        config.encrypt_layers = Some(Vec::new());
    }

    apply_endpoint_flags(
        &mut config.source,
        args.src_creds.as_deref(),
        args.src_insecure,
        false,
        false,
    );
    apply_endpoint_flags(
        &mut config.destination,
        args.dest_creds.as_deref(),
        args.dest_insecure,
        args.dest_compress,
        args.dest_decompress,
    );
    if args.override_arch.is_some() {
        config.source.override_arch = args.override_arch.clone();
    }
    if args.override_os.is_some() {
        config.source.override_os = args.override_os.clone();
    }
    if args.override_variant.is_some() {
        config.source.override_variant = args.override_variant.clone();
    }

    if let Some(jobs) = args.jobs {
        config.max_parallel_downloads = jobs;
    }
    config.optimize_destination_image_already_exists |= args.optimize_existing;
    config.download_foreign_layers |= args.download_foreign_layers;
    config.progress_bars |= args.progress;
    Ok(())
}

fn apply_endpoint_flags(
    endpoint: &mut EndpointConfig,
    creds: Option<&str>,
    insecure: bool,
    compress: bool,
    decompress: bool,
) {
    if let Some(creds) = creds {
        let (username, password) = split_creds(creds);
        endpoint.username = Some(username);
        endpoint.password = password;
    }
    endpoint.insecure |= insecure;
    endpoint.dir_force_compress |= compress;
    endpoint.dir_force_decompress |= decompress;
}

/// `USERNAME[:PASSWORD]`
fn split_creds(creds: &str) -> (String, Option<SecretString>) {
    match creds.split_once(':') {
        Some((user, pass)) => (user.to_string(), Some(SecretString::from(pass.to_string()))),
        None => (creds.to_string(), None),
    }
}

async fn cmd_inspect(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let reference = parse_image_name(&args.image)?;
    let mut endpoint = EndpointConfig::default();
    apply_endpoint_flags(&mut endpoint, args.creds.as_deref(), args.insecure, false, false);
    let source = reference
        .new_image_source(&endpoint.system_context())
        .await?;
    let fetched = source.get_manifest(None).await;
    if let Err(e) = source.close().await {
        debug!(error = %e, "closing source");
    }
    let (blob, mime_type) = fetched?;

    if args.raw {
        println!("{}", String::from_utf8_lossy(&blob));
        return Ok(());
    }

    let digest = manifest::manifest_digest(&blob)?;
    let summary = if manifest::is_multi_image(&mime_type) {
        let list = ManifestList::from_blob(&blob, &mime_type)?;
        let mut instances = Vec::new();
        for d in list.instances() {
            let instance = list.instance(&d)?;
            let platform = instance
                .platform
                .map(|p| platform_string(&p.os, &p.architecture, &p.variant));
            instances.push(json!({
                "Digest": instance.digest.to_string(),
                "MediaType": instance.media_type,
                "Size": instance.size,
                "Platform": platform,
                "Compression": instance.compression_algorithm_names,
            }));
        }
        json!({
            "Name": reference.to_string(),
            "Digest": digest.to_string(),
            "MediaType": mime_type,
            "Instances": instances,
        })
    } else {
        let parsed = Manifest::from_blob(&blob, &mime_type)?;
        let layers: Vec<_> = parsed
            .layer_infos()
            .into_iter()
            .map(|l| {
                json!({
                    "Digest": l.info.digest_label(),
                    "Size": l.info.size,
                    "MediaType": l.info.media_type,
                    "URLs": l.info.urls,
                })
            })
            .collect();
        json!({
            "Name": reference.to_string(),
            "Digest": digest.to_string(),
            "MediaType": mime_type,
            "Config": parsed.config_info().map(|c| c.digest_label()),
            "Layers": layers,
        })
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn platform_string(os: &str, arch: &str, variant: &str) -> String {
    if variant.is_empty() {
        format!("{}/{}", os, arch)
    } else {
        format!("{}/{}/{}", os, arch, variant)
    }
}

fn cmd_keygen(args: KeygenArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.kek {
        let kek = Kek::generate()?;
        let path = with_suffix(&args.output, "kek");
        write_private(&path, &kek.to_base64())?;
        println!("key-encryption key: {} (id {})", path.display(), kek.id());
        return Ok(());
    }

    let passphrase = match &args.passphrase_file {
        Some(path) => Some(
            fs::read_to_string(path)?
                .trim_end_matches(['\r', '\n'])
                .to_string(),
        ),
        None => None,
    };
    let (private, public) = generate_signing_key(passphrase.as_deref())?;
    let key_path = with_suffix(&args.output, "key");
    let pub_path = with_suffix(&args.output, "pub");
    write_private(&key_path, &private)?;
    fs::write(&pub_path, format!("{}\n", public))?;
    println!("private key: {}", key_path.display());
    println!("public key: {}", pub_path.display());
    Ok(())
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Write key material readable only by the owner.
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    writeln!(file, "{}", contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn creds_split_on_first_colon() {
        let (user, pass) = split_creds("robot:pa:ss");
        assert_eq!(user, "robot");
        assert_eq!(pass.unwrap().expose_secret(), "pa:ss");
        assert!(split_creds("anon").1.is_none());
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "imgcopy",
            "copy",
            "--all",
            "--encryption-key",
            "k.kek",
            "--encrypt-layer=-1",
            "-j",
            "3",
            "dir:/a",
            "oci:/b",
        ]);
        let Command::Copy(args) = cli.command else {
            panic!("expected copy");
        };
        let mut config = CopyConfig::default();
        apply_copy_flags(&mut config, &args).unwrap();
        assert_eq!(config.image_list_selection, ListSelection::All);
        assert_eq!(config.encrypt_layers, Some(vec![-1]));
        assert_eq!(config.max_parallel_downloads, 3);
    }

    #[test]
    fn key_paths() {
        assert_eq!(
            with_suffix(Path::new("/tmp/signer"), "pub"),
            PathBuf::from("/tmp/signer.pub")
        );
    }
}
