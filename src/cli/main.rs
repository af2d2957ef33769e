use seid::audit::{self, AuditConfig, LogDestination};
use seid::config::DeviceConfig;
use seid::device::SecureDevice;
use seid::license::License;
use seid::platform::software::SoftwareSecureElement;
use seid::platform::MAX_OBJECT_VERSION;
use seid::protected_update::{ManifestBuilder, PayloadType, UpdatePackage, UpdateWorkflow};
use seid::slots::{CounterId, KeySlot};
use seid::transport::LoopbackTransport;
use seid::DeviceIdentity;

use seid::reexports::log;

use anyhow::{anyhow, bail, Context, Result};
use base64::prelude::*;
use clap::{crate_description, crate_name, crate_version, value_parser, Arg, ArgAction, ArgMatches, Command};
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::OsRng;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use std::fs::File;
use std::io::prelude::*;
use std::path::Path;

const DEFAULT_STATE_FILE: &str = "seid-emulator.json";

/// Helper function to create a file with parent directories
fn create_file_with_dirs(path: impl AsRef<Path>) -> Result<File> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory for '{}'", path.display()))?;
    }
    File::create(path).with_context(|| format!("Failed to create file '{}'", path.display()))
}

fn read_input(path: &str) -> Result<Vec<u8>> {
    if path == "-" {
        let mut data = Vec::new();
        std::io::stdin().read_to_end(&mut data)?;
        return Ok(data);
    }
    std::fs::read(path).with_context(|| format!("Failed to open file '{}'", path))
}

fn write_output(path: Option<&String>, data: &[u8]) -> Result<()> {
    match path {
        Some(path) => {
            create_file_with_dirs(path)?.write_all(data)?;
            println!("Output written to [{path}]");
        }
        None => println!("{}", hex::encode(data)),
    }
    Ok(())
}

fn slot_arg() -> Arg {
    Arg::new("slot")
        .long("slot")
        .short('s')
        .required(true)
        .value_parser(value_parser!(u8))
        .help("Logical slot number")
}

fn counter_arg() -> Arg {
    Arg::new("counter")
        .long("counter")
        .short('c')
        .required(true)
        .value_parser(value_parser!(u8))
        .help("Counter id (0-3)")
}

fn cli() -> Command {
    Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("debug")
                .short('d')
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Prints debugging information"),
        )
        .arg(
            Arg::new("audit")
                .long("audit")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Enable structured audit logging (JSON to stderr)"),
        )
        .arg(
            Arg::new("audit-file")
                .long("audit-file")
                .value_name("FILE")
                .global(true)
                .help("Write audit logs to FILE instead of stderr"),
        )
        .arg(
            Arg::new("state")
                .long("state")
                .value_name("FILE")
                .global(true)
                .default_value(DEFAULT_STATE_FILE)
                .help("Emulated secure element state"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Device configuration (TOML)"),
        )
        .subcommand_required(true)
        .subcommand(Command::new("init").about("Create or open the emulated element and verify the license"))
        .subcommand(Command::new("uid").about("Print the device identity"))
        .subcommand(
            Command::new("license")
                .about("Issue and check licenses")
                .subcommand_required(true)
                .subcommand(
                    Command::new("keygen")
                        .about("Generate a license issuer key")
                        .arg(
                            Arg::new("out")
                                .value_name("issuer_key_file")
                                .long("output-file")
                                .short('o')
                                .required(true)
                                .help("PKCS#8 PEM output file"),
                        ),
                )
                .subcommand(
                    Command::new("issue")
                        .about("Sign a license for a UID")
                        .arg(
                            Arg::new("issuer_key")
                                .value_name("issuer_key_file")
                                .long("issuer-key")
                                .short('k')
                                .required(true)
                                .help("Issuer PKCS#8 PEM key"),
                        )
                        .arg(
                            Arg::new("uid")
                                .long("uid")
                                .help("UID in hex (defaults to the emulated element's)"),
                        ),
                )
                .subcommand(Command::new("check").about("Verify the configured license")),
        )
        .subcommand(Command::new("health").about("Print a health report"))
        .subcommand(
            Command::new("random").about("Draw random bytes").arg(
                Arg::new("len")
                    .long("len")
                    .short('n')
                    .default_value("32")
                    .value_parser(value_parser!(usize))
                    .help("Number of bytes (8-256)"),
            ),
        )
        .subcommand(
            Command::new("hash").about("SHA-256 in the element").arg(
                Arg::new("in")
                    .value_name("input_file")
                    .long("input-file")
                    .short('i')
                    .required(true)
                    .help("Input file, - for stdin"),
            ),
        )
        .subcommand(
            Command::new("store")
                .about("Secure data store")
                .subcommand_required(true)
                .subcommand(
                    Command::new("write").arg(slot_arg()).arg(
                        Arg::new("in")
                            .value_name("input_file")
                            .long("input-file")
                            .short('i')
                            .required(true)
                            .help("Input file, - for stdin"),
                    ),
                )
                .subcommand(
                    Command::new("read").arg(slot_arg()).arg(
                        Arg::new("out")
                            .value_name("output_file")
                            .long("output-file")
                            .short('o')
                            .help("Output file (hex to stdout if omitted)"),
                    ),
                ),
        )
        .subcommand(
            Command::new("counter")
                .about("Monotonic counters")
                .subcommand_required(true)
                .subcommand(Command::new("read").arg(counter_arg()))
                .subcommand(
                    Command::new("increment").arg(counter_arg()).arg(
                        Arg::new("step")
                            .long("step")
                            .default_value("1")
                            .value_parser(value_parser!(u8))
                            .help("Increment (1-255)"),
                    ),
                ),
        )
        .subcommand(
            Command::new("attest").about("Generate an attestation token").arg(
                Arg::new("nonce")
                    .long("nonce")
                    .required(true)
                    .help("Verifier nonce in hex (8-64 bytes)"),
            ),
        )
        .subcommand(
            Command::new("jwt").about("Sign a JWT with the device key").arg(
                Arg::new("claims")
                    .long("claims")
                    .required(true)
                    .help("Claims as a JSON object"),
            ),
        )
        .subcommand(
            Command::new("update")
                .about("Build and apply protected updates")
                .subcommand_required(true)
                .subcommand(
                    Command::new("build")
                        .about("Sign a payload into an update package")
                        .arg(
                            Arg::new("signer_key")
                                .long("signer-key")
                                .short('k')
                                .required(true)
                                .help("Trust anchor PKCS#8 PEM key"),
                        )
                        .arg(slot_arg())
                        .arg(
                            Arg::new("update_version")
                                .long("version")
                                .required(true)
                                .help("Version recorded on the target (0-32767)")
                                .value_parser(value_parser!(u32).range(0..=MAX_OBJECT_VERSION as i64)),
                        )
                        .arg(
                            Arg::new("type")
                                .long("type")
                                .default_value("data")
                                .value_parser(["data", "key", "cert"]),
                        )
                        .arg(
                            Arg::new("encrypt_with")
                                .long("encrypt-with")
                                .help("Update secret in hex; encrypts the payload"),
                        )
                        .arg(
                            Arg::new("in")
                                .value_name("input_file")
                                .long("input-file")
                                .short('i')
                                .required(true),
                        )
                        .arg(
                            Arg::new("out")
                                .value_name("output_file")
                                .long("output-file")
                                .short('o')
                                .required(true),
                        ),
                )
                .subcommand(
                    Command::new("apply")
                        .about("Verify and apply an update package")
                        .arg(
                            Arg::new("in")
                                .value_name("input_file")
                                .long("input-file")
                                .short('i')
                                .required(true),
                        ),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> Result<DeviceConfig> {
    match matches.get_one::<String>("config") {
        Some(path) => DeviceConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration '{}'", path)),
        None => Ok(DeviceConfig::default()),
    }
}

fn open_element(matches: &ArgMatches) -> Result<SoftwareSecureElement> {
    let state = matches
        .get_one::<String>("state")
        .ok_or_else(|| anyhow!("Missing state file"))?;
    Ok(SoftwareSecureElement::open_state_file(state)?)
}

fn open_device(matches: &ArgMatches) -> Result<SecureDevice> {
    let device = SecureDevice::new(Box::new(open_element(matches)?), load_config(matches)?)?;
    let status = device.init();
    log::debug!("license status: {}", status);
    Ok(device)
}

fn read_signing_key(path: &str) -> Result<SigningKey> {
    let pem = std::fs::read_to_string(path).with_context(|| format!("Failed to open file '{}'", path))?;
    SigningKey::from_pkcs8_pem(&pem).map_err(|e| anyhow!("Invalid key in '{}': {}", path, e))
}

fn license_command(root: &ArgMatches, matches: &ArgMatches) -> Result<()> {
    if let Some(matches) = matches.subcommand_matches("keygen") {
        let key = SigningKey::random(&mut OsRng);
        let out = matches
            .get_one::<String>("out")
            .ok_or_else(|| anyhow!("Missing output file"))?;
        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| anyhow!("Failed to encode key: {}", e))?;
        create_file_with_dirs(out)?.write_all(pem.as_bytes())?;
        println!("Issuer key saved to [{out}]");
        println!(
            "issuer_public_key = \"{}\"",
            hex::encode(key.verifying_key().to_encoded_point(false).as_bytes())
        );
    } else if let Some(matches) = matches.subcommand_matches("issue") {
        let issuer = read_signing_key(
            matches
                .get_one::<String>("issuer_key")
                .ok_or_else(|| anyhow!("Missing issuer key"))?,
        )?;
        let identity = match matches.get_one::<String>("uid") {
            Some(uid) => DeviceIdentity::from_hex(uid)?,
            None => {
                use seid::platform::SecureElement;
                let mut element = open_element(root)?;
                DeviceIdentity::from_uid(&element.read_object(seid::slots::ObjectId::UID)?)?
            }
        };
        let license = License::issue(&issuer, &identity)?;
        println!("[license]");
        println!("uid = \"{}\"", identity.to_hex());
        println!("key = \"{}\"", license.key_base64());
        println!(
            "issuer_public_key = \"{}\"",
            hex::encode(issuer.verifying_key().to_encoded_point(false).as_bytes())
        );
    } else if matches.subcommand_matches("check").is_some() {
        let device = open_device(root)?;
        let status = device.license_status();
        println!("License: {}", status);
        if !status.is_valid() {
            bail!("License is not valid");
        }
    }
    Ok(())
}

fn update_command(root: &ArgMatches, matches: &ArgMatches) -> Result<()> {
    if let Some(matches) = matches.subcommand_matches("build") {
        let signer = read_signing_key(
            matches
                .get_one::<String>("signer_key")
                .ok_or_else(|| anyhow!("Missing signer key"))?,
        )?;
        let slot = *matches.get_one::<u8>("slot").ok_or_else(|| anyhow!("Missing slot"))?;
        let version = *matches
            .get_one::<u32>("update_version")
            .ok_or_else(|| anyhow!("Missing version"))?;
        let payload_type = match matches.get_one::<String>("type").map(|s| s.as_str()) {
            Some("key") => PayloadType::Key,
            Some("cert") => PayloadType::Cert,
            _ => PayloadType::Data,
        };
        let input = matches.get_one::<String>("in").ok_or_else(|| anyhow!("Missing input file"))?;
        let out = matches
            .get_one::<String>("out")
            .ok_or_else(|| anyhow!("Missing output file"))?;

        let mut builder = ManifestBuilder::new(KeySlot(slot), version, payload_type, read_input(input)?);
        if let Some(secret) = matches.get_one::<String>("encrypt_with") {
            builder = builder.encrypt_with(&hex::decode(secret).context("Invalid update secret")?);
        }
        let package = builder.build(&signer)?;
        create_file_with_dirs(out)?.write_all(&package.to_cbor()?)?;
        println!(
            "Package with {} fragment(s) saved to [{out}]",
            package.fragments.len()
        );
    } else if let Some(matches) = matches.subcommand_matches("apply") {
        let input = matches.get_one::<String>("in").ok_or_else(|| anyhow!("Missing input file"))?;
        let package = UpdatePackage::from_cbor(&read_input(input)?)?;
        let device = open_device(root)?;

        let transport = LoopbackTransport::new();
        let mut workflow = UpdateWorkflow::new(&device, transport.clone())?;
        transport.push(&workflow.channels().protected_update, package.to_cbor()?)?;
        let (slot, version) = workflow.run(false)?;
        println!("Applied version {version} to slot {slot}");
    }
    Ok(())
}

fn start() -> Result<()> {
    let matches = cli().get_matches();

    let debug = matches.get_flag("debug");
    let audit_enabled = matches.get_flag("audit");
    let audit_file = matches.get_one::<String>("audit-file").map(|s| s.as_str());

    env_logger::builder()
        .format_timestamp(None)
        .format_level(false)
        .format_module_path(false)
        .format_target(false)
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    if audit_enabled || audit_file.is_some() {
        let destination = match audit_file {
            Some(path) => LogDestination::File(path.to_string()),
            None => LogDestination::Stderr,
        };
        audit::init(AuditConfig {
            destination,
            ..AuditConfig::default()
        })?;
    }

    match matches.subcommand() {
        Some(("init", _)) => {
            let device = open_device(&matches)?;
            println!("Element:  {}", device.element_name());
            println!("Identity: {}", device.identity()?);
            println!("License:  {}", device.license_status());
        }
        Some(("uid", _)) => {
            let device = open_device(&matches)?;
            println!("{}", device.identity()?.to_hex());
        }
        Some(("license", sub)) => license_command(&matches, sub)?,
        Some(("health", _)) => {
            let device = open_device(&matches)?;
            let report = device.health_check(None)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_healthy() {
                bail!("Device is not healthy");
            }
        }
        Some(("random", sub)) => {
            let len = *sub.get_one::<usize>("len").ok_or_else(|| anyhow!("Missing length"))?;
            let device = open_device(&matches)?;
            println!("{}", hex::encode(device.random(len)?));
        }
        Some(("hash", sub)) => {
            let input = sub.get_one::<String>("in").ok_or_else(|| anyhow!("Missing input file"))?;
            let data = read_input(input)?;
            let device = open_device(&matches)?;
            println!("{}", hex::encode(device.hash(&data)?));
        }
        Some(("store", sub)) => {
            let device = open_device(&matches)?;
            if let Some(sub) = sub.subcommand_matches("write") {
                let slot = *sub.get_one::<u8>("slot").ok_or_else(|| anyhow!("Missing slot"))?;
                let input = sub.get_one::<String>("in").ok_or_else(|| anyhow!("Missing input file"))?;
                let data = read_input(input)?;
                device.secure_store_write(KeySlot(slot), &data)?;
                println!("Stored {} bytes in slot {}", data.len(), slot);
            } else if let Some(sub) = sub.subcommand_matches("read") {
                let slot = *sub.get_one::<u8>("slot").ok_or_else(|| anyhow!("Missing slot"))?;
                let data = device.secure_store_read(KeySlot(slot))?;
                write_output(sub.get_one::<String>("out"), &data)?;
            }
        }
        Some(("counter", sub)) => {
            let device = open_device(&matches)?;
            if let Some(sub) = sub.subcommand_matches("read") {
                let id = *sub.get_one::<u8>("counter").ok_or_else(|| anyhow!("Missing counter"))?;
                let value = device.counter_read(CounterId::new(id)?)?;
                println!("{} (threshold {})", value.value, value.threshold);
            } else if let Some(sub) = sub.subcommand_matches("increment") {
                let id = *sub.get_one::<u8>("counter").ok_or_else(|| anyhow!("Missing counter"))?;
                let step = *sub.get_one::<u8>("step").ok_or_else(|| anyhow!("Missing step"))?;
                let value = device.counter_increment(CounterId::new(id)?, step)?;
                println!("{}", value.value);
            }
        }
        Some(("attest", sub)) => {
            let nonce = sub.get_one::<String>("nonce").ok_or_else(|| anyhow!("Missing nonce"))?;
            let nonce = hex::decode(nonce).context("Nonce must be hex")?;
            let device = open_device(&matches)?;
            let token = device.attestation_generate(&nonce)?;
            println!("{}", BASE64_URL_SAFE_NO_PAD.encode(token.as_bytes()));
        }
        Some(("jwt", sub)) => {
            let claims = sub.get_one::<String>("claims").ok_or_else(|| anyhow!("Missing claims"))?;
            let claims: serde_json::Value = serde_json::from_str(claims).context("Claims must be JSON")?;
            let device = open_device(&matches)?;
            println!("{}", device.jwt_sign(&claims)?);
        }
        Some(("update", sub)) => update_command(&matches, sub)?,
        _ => bail!("No command given"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let res = start();
    match res {
        Ok(_) => {}
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
    Ok(())
}
