// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    process,
    sync::Arc,
};

use clap::{Arg, ArgAction, ArgMatches, Command};
use env_logger::Builder;
use log::{error, warn, LevelFilter};
use tokio::{runtime, signal};

use volguard::{
    engine::{
        configure_binding, crypt::ImageSpec, crypt::DEFAULT_SECRET_KEY,
        crypt::OPTION_ENCRYPTED, crypt::OPTION_KMS_ID, expand_cidr_within, verify_binaries,
        AddressFence, CommandGateway, Context, CryptsetupLuks, GuardConfig, KeyRotation,
        KmsRegistry, NetworkFence, ProcessGateway, RadosLock, RbdDeviceLocator, RbdImage,
        VolumeId,
    },
    guard::{GuardError, GuardResult, VERSION},
};

/// Configure and initialize the logger.
/// Read log configuration parameters from the environment if RUST_LOG
/// is set. Otherwise, use the level given on the command line.
fn initialize_log(log_level: Option<&String>) {
    let mut builder = Builder::new();

    if let Ok(s) = env::var("RUST_LOG") {
        builder.parse_filters(&s);
    } else if let Some(level) = log_level {
        builder.filter(
            Some("volguard"),
            level.parse::<LevelFilter>().unwrap_or(LevelFilter::Warn),
        );
    } else {
        builder.filter(Some("volguard"), LevelFilter::Warn);
    }

    builder.init()
}

fn ranges_arg() -> Arg {
    Arg::new("ranges")
        .value_name("CIDR")
        .required(true)
        .num_args(1..)
        .help("Address ranges in CIDR notation")
}

fn add_remove(name: &'static str, about: &'static str) -> Command {
    Command::new(name)
        .about(about)
        .subcommand_required(true)
        .subcommand(Command::new("add").arg(ranges_arg()))
        .subcommand(Command::new("remove").arg(ranges_arg()))
}

fn cmd() -> Command {
    Command::new("volguard")
        .version(VERSION)
        .about("Fence clients out of a Ceph cluster and rotate volume encryption keys")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .global(true)
                .action(ArgAction::Set)
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Log level, unless RUST_LOG is set"),
        )
        .arg(
            Arg::new("monitors")
                .long("monitors")
                .short('m')
                .global(true)
                .help("Comma separated monitor addresses"),
        )
        .arg(
            Arg::new("id")
                .long("id")
                .global(true)
                .help("Ceph client id"),
        )
        .arg(
            Arg::new("keyfile")
                .long("keyfile")
                .global(true)
                .help("File holding the key of the client"),
        )
        .subcommand(
            Command::new("expand")
                .about("List every address of a CIDR block")
                .arg(Arg::new("cidr").required(true).value_name("CIDR")),
        )
        .subcommand(add_remove(
            "fence",
            "Block or unblock address ranges in the cluster blocklist",
        ))
        .subcommand(add_remove(
            "evict",
            "Evict the sessions of address ranges and block them, or undo that",
        ))
        .subcommand(
            Command::new("rotate")
                .about("Replace the LUKS passphrase of an encrypted volume")
                .arg(Arg::new("volume").required(true).value_name("VOLUME_ID"))
                .arg(
                    Arg::new("image")
                        .long("image")
                        .required(true)
                        .value_name("POOL[/NAMESPACE]/IMAGE"),
                )
                .arg(
                    Arg::new("kms_id")
                        .long("kms-id")
                        .value_name("KMS_ID")
                        .help("KMS holding the passphrase of the volume"),
                )
                .arg(
                    Arg::new("passphrase_file")
                        .long("passphrase-file")
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("File holding the passphrase of the metadata KMS"),
                ),
        )
}

/// The configuration file, if any, with command line overrides applied.
fn load_config(matches: &ArgMatches) -> GuardResult<GuardConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => GuardConfig::from_file(path)?,
        None => GuardConfig::default(),
    };
    if let Some(monitors) = matches.get_one::<String>("monitors") {
        config.cluster.monitors.clone_from(monitors);
    }
    if let Some(id) = matches.get_one::<String>("id") {
        config.cluster.client_id.clone_from(id);
    }
    if let Some(keyfile) = matches.get_one::<String>("keyfile") {
        config.cluster.key_file.clone_from(keyfile);
    }
    Ok(config)
}

fn ranges(matches: &ArgMatches) -> Vec<String> {
    matches
        .get_many::<String>("ranges")
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

async fn fence(
    ctx: &Context,
    config: &GuardConfig,
    evict: bool,
    matches: &ArgMatches,
) -> GuardResult<()> {
    let (action, sub) = matches
        .subcommand()
        .ok_or_else(|| GuardError::Msg("Missing add or remove".to_string()))?;
    let gateway: Arc<dyn CommandGateway> = Arc::new(ProcessGateway);
    let fence = NetworkFence::new(
        AddressFence::new(ranges(sub), config.cluster.clone())?,
        gateway,
        config.fence.clone(),
    );
    match (evict, action) {
        (false, "add") => {
            let mode = fence.add_fence(ctx).await?;
            println!("Fenced using {mode} entries");
        }
        (false, _) => {
            let mode = fence.remove_fence(ctx).await?;
            println!("Unfenced using {mode} entries");
        }
        (true, "add") => {
            for address in fence.evict_and_fence(ctx).await? {
                println!("Evicted {address}");
            }
        }
        (true, _) => fence.remove_eviction(ctx).await?,
    }
    Ok(())
}

fn read_passphrase(path: &Path) -> GuardResult<String> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        GuardError::Chained(
            format!("Failed to read passphrase file {}", path.display()),
            Box::new(e.into()),
        )
    })?;
    Ok(contents.trim_end_matches('\n').to_string())
}

async fn rotate(ctx: &Context, config: &GuardConfig, matches: &ArgMatches) -> GuardResult<()> {
    verify_binaries()?;
    let volume_id = VolumeId::new(
        matches
            .get_one::<String>("volume")
            .cloned()
            .unwrap_or_default(),
    );
    let image = ImageSpec::parse(
        matches
            .get_one::<String>("image")
            .map(String::as_str)
            .unwrap_or_default(),
    )?;

    let mut credentials = HashMap::new();
    if let Some(path) = matches.get_one::<PathBuf>("passphrase_file") {
        credentials.insert(DEFAULT_SECRET_KEY.to_string(), read_passphrase(path)?);
    }
    let mut options = HashMap::from([(OPTION_ENCRYPTED.to_string(), "true".to_string())]);
    if let Some(kms_id) = matches.get_one::<String>("kms_id") {
        options.insert(OPTION_KMS_ID.to_string(), kms_id.clone());
    }

    let gateway: Arc<dyn CommandGateway> = Arc::new(ProcessGateway);
    let timeout = config.fence.command_timeout();
    let volume = Arc::new(RbdImage::new(
        volume_id,
        image,
        Arc::clone(&gateway),
        config.cluster.clone(),
        timeout,
    ));
    let encrypted = configure_binding(
        volume,
        &options,
        &credentials,
        &KmsRegistry::new(config.kms.clone()),
        &config.crypt,
    )?;
    let rotation = KeyRotation::new(
        Arc::new(CryptsetupLuks::new(
            Arc::clone(&gateway),
            config.crypt.luks_timeout(),
        )),
        Arc::new(RadosLock::new(
            Arc::clone(&gateway),
            config.cluster.clone(),
            timeout,
        )),
        Arc::new(RbdDeviceLocator::new(
            gateway,
            config.cluster.clone(),
            &config.crypt.device_type,
            timeout,
        )),
        &config.crypt,
    );
    rotation.rotate(ctx, &encrypted).await?;
    println!("Rotated passphrase of volume {}", encrypted.volume_id());
    Ok(())
}

fn run(matches: &ArgMatches) -> GuardResult<()> {
    let config = load_config(matches)?;
    if let Some(("expand", sub)) = matches.subcommand() {
        let cidr = sub
            .get_one::<String>("cidr")
            .map(String::as_str)
            .unwrap_or_default();
        for address in expand_cidr_within(cidr, config.fence.max_expanded_host_bits)? {
            println!("{address}");
        }
        return Ok(());
    }

    let runtime = runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async {
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Interrupted; cancelling");
                    canceller.cancel();
                }
                Err(e) => error!("Failure while listening for signals: {e}"),
            }
        });

        match matches.subcommand() {
            Some(("fence", sub)) => fence(&ctx, &config, false, sub).await,
            Some(("evict", sub)) => fence(&ctx, &config, true, sub).await,
            Some(("rotate", sub)) => rotate(&ctx, &config, sub).await,
            _ => Err(GuardError::Msg("Unknown subcommand".to_string())),
        }
    })
}

fn main() {
    let matches = cmd().get_matches();
    initialize_log(matches.get_one::<String>("log_level"));

    if let Err(e) = run(&matches) {
        eprintln!("Error encountered: {e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::cmd;

    #[test]
    fn test_volguard_parse_args() {
        cmd().debug_assert();
    }
}
