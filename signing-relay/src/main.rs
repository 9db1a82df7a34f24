// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    binary_patch::PatchSet,
    clap::{Arg, ArgMatches, Command},
    container_transform::{extract, ContainerTransform, ContentKind},
    log::{info, warn, LevelFilter},
    remote_signing_key::{CertificateBundle, HashAlgorithm, RemoteSigningKey, SignOptions},
    signing_relay::{
        open_transform, same_file, ArtifactFormat, AuxiliaryFiles, CommandSigner, Pipeline,
        RelayError, SigningConfig, TransformOptions,
    },
    std::{
        fs::{File, OpenOptions},
        io::Write,
        path::{Path, PathBuf},
        str::FromStr,
    },
};

const SIGN_ABOUT: &str = "\
Sign an artifact through an external signer program.

The artifact format, input and output come from the configuration unless
given as arguments. The signable payload of the artifact is written to the
signer's stdin. Its stdout is the response, which is folded back into the
artifact.

The signer sees these environment variables:

SIGRELAY_FORMAT             the artifact format
SIGRELAY_FILE_NAME          file name of the artifact
SIGRELAY_CERTIFICATE_CHAIN  path to the PEM certificate chain, leaf first
SIGRELAY_TIMESTAMP_URL      RFC 3161 time-stamp authority
SIGRELAY_MS_TIMESTAMP_URL   Authenticode time-stamp authority

Signers obtain signatures over digests with `sigrelay sign-digest`.
";

const SUPPORTED_HASHES: &[&str; 4] = &["SHA-1", "SHA-256", "SHA-384", "SHA-512"];

const RESPONSE_TYPE_HELP: &str =
    "Media type of the signer response. Anything other than a binary patch is a full replacement or signature blob";

fn add_config_arg(command: Command) -> Command {
    command.arg(
        Arg::new("config")
            .long("config")
            .short('c')
            .takes_value(true)
            .help("Configuration file (default ~/.sigrelay/config.yaml)"),
    )
}

fn add_transform_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("format")
                .long("format")
                .short('f')
                .takes_value(true)
                .required(true)
                .possible_values(ArtifactFormat::ALL.iter().map(|f| f.as_str()))
                .help("Format of the artifact"),
        )
        .arg(
            Arg::new("requirements")
                .long("requirements")
                .takes_value(true)
                .help("Code requirements blob for code objects and disk images"),
        )
        .arg(
            Arg::new("entitlements")
                .long("entitlements")
                .takes_value(true)
                .help("Entitlements blob for code objects"),
        )
        .arg(
            Arg::new("resources")
                .long("resources")
                .takes_value(true)
                .help("Resource manifest blob for code objects"),
        )
        .arg(
            Arg::new("info_plist")
                .long("info-plist")
                .takes_value(true)
                .help("Info.plist content for code objects"),
        )
        .arg(
            Arg::new("msi_extended_signature")
                .long("msi-extended-signature")
                .help("Compute and write the extended signature of installers"),
        )
}

fn transform_args(args: &ArgMatches) -> Result<(ArtifactFormat, TransformOptions), RelayError> {
    let format = ArtifactFormat::from_str(
        args.value_of("format")
            .ok_or_else(|| RelayError::CliBadArgument("format is required".into()))?,
    )?;

    let files = AuxiliaryFiles {
        requirements: args.value_of("requirements").map(PathBuf::from),
        entitlements: args.value_of("entitlements").map(PathBuf::from),
        resources: args.value_of("resources").map(PathBuf::from),
        info_plist: args.value_of("info_plist").map(PathBuf::from),
    };

    Ok((
        format,
        TransformOptions::from_files(&files, args.is_present("msi_extended_signature"))?,
    ))
}

fn load_config(args: &ArgMatches) -> Result<SigningConfig, RelayError> {
    SigningConfig::load(args.value_of("config").map(Path::new))
}

fn required_path<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a Path, RelayError> {
    args.value_of(name)
        .map(Path::new)
        .ok_or_else(|| RelayError::CliBadArgument(format!("{} is required", name)))
}

fn open_source(path: &Path, writable: bool) -> Result<File, RelayError> {
    OpenOptions::new()
        .read(true)
        .write(writable)
        .open(path)
        .map_err(|e| RelayError::FileRead(path.to_path_buf(), e))
}

fn create_output(path: &Path) -> Result<File, RelayError> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?)
}

fn command_apply_patch(args: &ArgMatches) -> Result<(), RelayError> {
    let patch_path = required_path(args, "patch")?;
    let input = required_path(args, "input")?;
    let output = required_path(args, "output")?;

    let data = std::fs::read(patch_path)
        .map_err(|e| RelayError::FileRead(patch_path.to_path_buf(), e))?;
    let patch = PatchSet::from_bytes(&data)?;

    let mode = if same_file(input, output) {
        let mut source = open_source(input, true)?;
        patch.apply_in_place(&mut source)?
    } else {
        let mut source = open_source(input, false)?;
        let mut dest = create_output(output)?;
        patch.apply(&mut source, &mut dest)?
    };

    info!(
        "applied {} patch ops to {} ({:?})",
        patch.len(),
        output.display(),
        mode
    );

    Ok(())
}

fn command_extract(args: &ArgMatches) -> Result<(), RelayError> {
    let input = required_path(args, "input")?;
    let output = required_path(args, "output")?;
    let (format, options) = transform_args(args)?;

    let mut source = open_source(input, false)?;
    let mut transform = open_transform(format, &mut source, &options)?;

    if !transform.has_payload() {
        warn!("{} artifacts have no payload", format);
        return Ok(());
    }

    let mut sink: Box<dyn Write> = if output == Path::new("-") {
        Box::new(std::io::stdout())
    } else {
        Box::new(create_output(output)?)
    };

    let written = extract(&mut transform, |reader| -> Result<u64, RelayError> {
        Ok(std::io::copy(reader, &mut sink)?)
    })?;
    sink.flush()?;

    info!("wrote {} byte {} payload", written, transform.name());

    Ok(())
}

fn command_print_certificate_chain(args: &ArgMatches) -> Result<(), RelayError> {
    let config = load_config(args)?;
    let key = config.remote_key()?;

    for (i, cert) in key.certificate_chain()?.iter().enumerate() {
        let subject = cert
            .subject_name()
            .user_friendly_str()
            .unwrap_or_else(|_| "<unknown>".into());

        println!("# {}: {}", i, subject);
        print!("{}", cert.encode_pem());
    }

    Ok(())
}

fn command_print_patch(args: &ArgMatches) -> Result<(), RelayError> {
    let path = required_path(args, "patch")?;
    let data = std::fs::read(path).map_err(|e| RelayError::FileRead(path.to_path_buf(), e))?;
    let patch = PatchSet::from_bytes(&data)?;

    println!("{} ops", patch.len());
    for op in patch.ops() {
        println!(
            "offset {:#x}: replace {} bytes with {} bytes",
            op.offset(),
            op.old_size(),
            op.new_size()
        );

        if args.is_present("blobs") && op.new_size() > 0 {
            println!("  {}", hex::encode(op.blob()));
        }
    }

    Ok(())
}

fn command_reintegrate(args: &ArgMatches) -> Result<(), RelayError> {
    let input = required_path(args, "input")?;
    let output = required_path(args, "output")?;
    let response_path = required_path(args, "response")?;
    let (format, options) = transform_args(args)?;

    let content = ContentKind::from_mime(
        args.value_of("response_type")
            .unwrap_or(binary_patch::MIME_TYPE),
    );
    let response = std::fs::read(response_path)
        .map_err(|e| RelayError::FileRead(response_path.to_path_buf(), e))?;

    if same_file(input, output) {
        let mut source = open_source(input, true)?;
        let mut transform = open_transform(format, &mut source, &options)?;
        transform.reintegrate_in_place(&content, &mut response.as_slice())?;
    } else {
        let mut source = open_source(input, false)?;
        let mut transform = open_transform(format, &mut source, &options)?;
        let mut dest = create_output(output)?;
        transform.reintegrate(&mut dest, &content, &mut response.as_slice())?;
    }

    info!("wrote {}", output.display());

    Ok(())
}

fn command_sign(args: &ArgMatches) -> Result<(), RelayError> {
    let mut config = load_config(args)?;

    if let Some(input) = args.value_of("input") {
        config.input_file = Some(input.into());
        config.output_file = None;
    }
    if let Some(output) = args.value_of("output") {
        config.output_file = Some(output.into());
    }
    if let Some(format) = args.value_of("format") {
        config.signature_type = Some(ArtifactFormat::from_str(format)?);
    }

    config.validate()?;

    let input = config
        .input_file
        .clone()
        .ok_or(RelayError::MissingConfig("inputFile"))?;
    let output = config
        .output_file
        .clone()
        .ok_or(RelayError::MissingConfig("outputFile"))?;

    // Fail on an undeclared format before talking to the custodian.
    let pipeline = Pipeline::from_config(&config)?;
    if pipeline.format() == ArtifactFormat::Auto {
        return Err(RelayError::AutoFormat);
    }

    let key = config.remote_key()?;
    let bundle = CertificateBundle::from_key(&key, config.timestamp_url.clone())?;
    info!(
        "signing with certificate {} ({} intermediates)",
        bundle
            .leaf
            .subject_name()
            .user_friendly_str()
            .unwrap_or_else(|_| "<unknown>".into()),
        bundle.intermediates().len()
    );

    let mut chain = tempfile::NamedTempFile::new()?;
    for cert in &bundle.chain {
        chain.write_all(cert.encode_pem().as_bytes())?;
    }
    chain.flush()?;

    let mut values = args
        .values_of("command")
        .ok_or_else(|| RelayError::CliBadArgument("signer command is required".into()))?;
    let program = values
        .next()
        .ok_or_else(|| RelayError::CliBadArgument("signer command is required".into()))?;

    let mut signer = CommandSigner::new(program, values.map(|v| v.to_string()))
        .with_content(ContentKind::from_mime(
            args.value_of("response_type")
                .unwrap_or(binary_patch::MIME_TYPE),
        ))
        .env("SIGRELAY_CERTIFICATE_CHAIN", chain.path().display());

    if let Some(url) = &bundle.timestamp_url {
        signer = signer.env("SIGRELAY_TIMESTAMP_URL", url);
    }
    if let Some(url) = &config.ms_timestamp_url {
        signer = signer.env("SIGRELAY_MS_TIMESTAMP_URL", url);
    }

    pipeline.run(&mut signer, &input, &output)
}

fn command_sign_digest(args: &ArgMatches) -> Result<(), RelayError> {
    let config = load_config(args)?;

    let hash = HashAlgorithm::from_str(args.value_of("hash").unwrap_or("SHA-256"))
        .map_err(RelayError::CliBadArgument)?;
    let digest = hex::decode(
        args.value_of("digest")
            .ok_or_else(|| RelayError::CliBadArgument("digest is required".into()))?,
    )?;

    if digest.len() != hash.digest_len() {
        return Err(RelayError::CliBadArgument(format!(
            "{} digests are {} bytes; got {}",
            hash,
            hash.digest_len(),
            digest.len()
        )));
    }

    let options = if args.is_present("pss") {
        SignOptions::pss(hash)
    } else {
        SignOptions::new(hash)
    };

    let key = config.remote_key()?;
    info!("signing {} digest with key {}", hash, key.key_id()?);
    let signature = key.sign(&digest, &options)?;

    println!("{}", base64::encode(signature));

    Ok(())
}

fn main_impl() -> Result<(), RelayError> {
    let app = Command::new("Relay artifacts through remote code signing")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Extract signable payloads, reintegrate signatures and sign with remote keys")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(
        Command::new("apply-patch")
            .about("Apply a binary patch to a file")
            .arg(
                Arg::new("patch")
                    .required(true)
                    .help("Path to the binary patch"),
            )
            .arg(
                Arg::new("input")
                    .required(true)
                    .help("File to apply the patch to"),
            )
            .arg(
                Arg::new("output")
                    .required(true)
                    .help("Where to write the patched file. May equal the input"),
            ),
    );

    let app = app.subcommand(add_transform_args(
        Command::new("extract")
            .about("Write the signable payload of an artifact")
            .arg(
                Arg::new("input")
                    .required(true)
                    .help("Artifact to extract from"),
            )
            .arg(
                Arg::new("output")
                    .required(true)
                    .help("Where to write the payload, or - for stdout"),
            ),
    ));

    let app = app.subcommand(add_config_arg(
        Command::new("print-certificate-chain")
            .about("Print the certificate chain of the configured remote key as PEM"),
    ));

    let app = app.subcommand(
        Command::new("print-patch")
            .about("Print the operations in a binary patch")
            .arg(
                Arg::new("patch")
                    .required(true)
                    .help("Path to the binary patch"),
            )
            .arg(
                Arg::new("blobs")
                    .long("blobs")
                    .help("Print replacement bytes as hex"),
            ),
    );

    let app = app.subcommand(add_transform_args(
        Command::new("reintegrate")
            .about("Fold a signer response into an artifact")
            .arg(
                Arg::new("response")
                    .long("response")
                    .short('r')
                    .takes_value(true)
                    .required(true)
                    .help("Path to the signer response"),
            )
            .arg(
                Arg::new("response_type")
                    .long("response-type")
                    .takes_value(true)
                    .default_value(binary_patch::MIME_TYPE)
                    .help(RESPONSE_TYPE_HELP),
            )
            .arg(
                Arg::new("input")
                    .required(true)
                    .help("The unsigned artifact"),
            )
            .arg(
                Arg::new("output")
                    .required(true)
                    .help("Where to write the signed artifact. May equal the input"),
            ),
    ));

    let app = app.subcommand(add_config_arg(
        Command::new("sign")
            .about("Sign an artifact through an external signer program")
            .long_about(SIGN_ABOUT)
            .arg(
                Arg::new("input")
                    .long("input")
                    .short('i')
                    .takes_value(true)
                    .help("Artifact to sign, overriding the configuration"),
            )
            .arg(
                Arg::new("output")
                    .long("output")
                    .short('o')
                    .takes_value(true)
                    .help("Where to write the signed artifact, overriding the configuration"),
            )
            .arg(
                Arg::new("format")
                    .long("format")
                    .short('f')
                    .takes_value(true)
                    .possible_values(ArtifactFormat::ALL.iter().map(|f| f.as_str()))
                    .help("Format of the artifact, overriding the configuration"),
            )
            .arg(
                Arg::new("response_type")
                    .long("response-type")
                    .takes_value(true)
                    .default_value(binary_patch::MIME_TYPE)
                    .help(RESPONSE_TYPE_HELP),
            )
            .arg(
                Arg::new("command")
                    .required(true)
                    .multiple_values(true)
                    .last(true)
                    .help("Signer program and its arguments, after --"),
            ),
    ));

    let app = app.subcommand(add_config_arg(
        Command::new("sign-digest")
            .about("Sign a digest with the configured remote key and print it as base64")
            .arg(
                Arg::new("hash")
                    .long("hash")
                    .takes_value(true)
                    .possible_values(SUPPORTED_HASHES)
                    .default_value("SHA-256")
                    .help("Hash function the digest was computed with"),
            )
            .arg(
                Arg::new("pss")
                    .long("pss")
                    .help("Use RSA-PSS padding instead of PKCS#1 v1.5"),
            )
            .arg(
                Arg::new("digest")
                    .required(true)
                    .help("Hex encoded digest"),
            ),
    ));

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    if log_level == LevelFilter::Info {
        builder.filter_module("rustls", LevelFilter::Error);
        builder.filter_module("reqwest", LevelFilter::Warn);
    }

    builder.init();

    match matches.subcommand() {
        Some(("apply-patch", args)) => command_apply_patch(args),
        Some(("extract", args)) => command_extract(args),
        Some(("print-certificate-chain", args)) => command_print_certificate_chain(args),
        Some(("print-patch", args)) => command_print_patch(args),
        Some(("reintegrate", args)) => command_reintegrate(args),
        Some(("sign", args)) => command_sign(args),
        Some(("sign-digest", args)) => command_sign_digest(args),
        _ => Err(RelayError::CliUnknownCommand),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}
