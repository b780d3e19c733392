use tufroot::api::FactoryApi;
use tufroot::audit;
use tufroot::config::Config;
use tufroot::creds::OfflineCreds;
use tufroot::legacy::{self, SingleShotError};
use tufroot::sync;
use tufroot::transaction::Transaction;
use tufroot::tuf::{ManifestFilter, Role};
use tufroot::updates::{self, RotationSummary};
use tufroot::{KeyType, TufError};

use tufroot::reexports::log;

use clap::{crate_description, crate_name, crate_version, Arg, ArgAction, ArgMatches, Command};
use std::path::Path;

fn txid_arg() -> Arg {
    Arg::new("txid")
        .short('x')
        .long("txid")
        .value_name("TXID")
        .required(true)
        .help("Transaction id returned by `init`")
}

fn creds_arg(required: bool) -> Arg {
    Arg::new("keys")
        .short('k')
        .long("keys")
        .value_name("ARCHIVE")
        .required(required)
        .help("Offline credentials archive (tar.gz)")
}

fn role_arg() -> Arg {
    Arg::new("role")
        .short('r')
        .long("role")
        .value_name("ROLE")
        .required(true)
        .help("root or targets")
}

fn key_type_arg() -> Arg {
    Arg::new("key-type")
        .short('y')
        .long("key-type")
        .value_name("TYPE")
        .help("Type of the generated key: ed25519 or rsa (default from configuration)")
}

fn sign_arg() -> Arg {
    Arg::new("sign")
        .short('s')
        .long("sign")
        .action(ArgAction::SetTrue)
        .help("Sign the staged root with the root keys held in the archive")
}

fn message_arg(default: &'static str) -> Arg {
    Arg::new("message")
        .short('m')
        .long("message")
        .value_name("REASON")
        .default_value(default)
        .help("Change reason recorded in the new root")
}

fn cli() -> Command {
    Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Print the staged changes after each update"),
        )
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
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Configuration file (default: $TUFROOT_CONFIG or ~/.config/tufroot.toml)"),
        )
        .arg(
            Arg::new("factory")
                .long("factory")
                .value_name("NAME")
                .global(true)
                .help("Factory to operate on"),
        )
        .arg(
            Arg::new("server")
                .long("server")
                .value_name("URL")
                .global(true)
                .help("API server URL"),
        )
        .arg(
            Arg::new("token")
                .long("token")
                .value_name("TOKEN")
                .global(true)
                .help("API token"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("keys")
                .about("Manage the keys of the Factory's TUF roles")
                .subcommand_required(true)
                .subcommand(
                    Command::new("tuf")
                        .about("TUF root metadata")
                        .subcommand_required(true)
                        .subcommand(updates_command())
                        .subcommand(
                            Command::new("sync-prod-root")
                                .about("Re-derive and publish the production root from the CI root")
                                .arg(creds_arg(true)),
                        ),
                )
                .subcommand(
                    Command::new("rotate-root")
                        .about("Rotate the offline root key and apply immediately")
                        .arg(creds_arg(true))
                        .arg(key_type_arg())
                        .arg(message_arg("Rotate root key")),
                )
                .subcommand(
                    Command::new("rotate-targets")
                        .about("Rotate the offline targets key and apply immediately")
                        .arg(creds_arg(true))
                        .arg(
                            Arg::new("targets-keys")
                                .short('K')
                                .long("targets-keys")
                                .value_name("ARCHIVE")
                                .help("Archive holding the targets keys, if not the root archive"),
                        )
                        .arg(key_type_arg())
                        .arg(message_arg("Rotate targets key")),
                )
                .subcommand(
                    Command::new("resign-root")
                        .about("Publish a new root version with a fresh expiry")
                        .arg(creds_arg(true))
                        .arg(message_arg("Re-sign root")),
                ),
        )
}

fn updates_command() -> Command {
    Command::new("updates")
        .about("Staged changes to the TUF root, applied as one transaction")
        .subcommand_required(true)
        .subcommand(
            Command::new("init")
                .about("Open a transaction")
                .arg(
                    Arg::new("message")
                        .short('m')
                        .long("message")
                        .value_name("REASON")
                        .required(true)
                        .help("Reason for the change"),
                ),
        )
        .subcommand(
            Command::new("add-offline-key")
                .about("Generate a new offline key and add it to a role")
                .arg(txid_arg())
                .arg(role_arg())
                .arg(creds_arg(true))
                .arg(key_type_arg())
                .arg(sign_arg()),
        )
        .subcommand(
            Command::new("delete-offline-key")
                .about("Remove an offline key from a role")
                .arg(txid_arg())
                .arg(role_arg())
                .arg(creds_arg(false))
                .arg(
                    Arg::new("key-id")
                        .short('i')
                        .long("key-id")
                        .value_name("KEYID")
                        .help("Id of the key to remove, instead of looking it up in the archive"),
                )
                .arg(sign_arg()),
        )
        .subcommand(
            Command::new("rotate-offline-key")
                .about("Replace the offline key of a role held in the archive")
                .arg(txid_arg())
                .arg(role_arg())
                .arg(creds_arg(true))
                .arg(
                    Arg::new("targets-keys")
                        .short('K')
                        .long("targets-keys")
                        .value_name("ARCHIVE")
                        .help("Archive holding the targets keys, if not the root archive"),
                )
                .arg(key_type_arg())
                .arg(sign_arg()),
        )
        .subcommand(
            Command::new("rotate-online-key")
                .about("Have the server generate new online keys")
                .arg(txid_arg())
                .arg(
                    Arg::new("role")
                        .short('r')
                        .long("role")
                        .value_name("ROLES")
                        .required(true)
                        .help("Comma-separated roles: targets, snapshot, timestamp"),
                )
                .arg(creds_arg(false))
                .arg(key_type_arg())
                .arg(sign_arg()),
        )
        .subcommand(
            Command::new("set-threshold")
                .about("Set the root threshold or the production targets threshold")
                .arg(txid_arg())
                .arg(role_arg())
                .arg(
                    Arg::new("threshold")
                        .value_name("N")
                        .required(true)
                        .value_parser(clap::value_parser!(u32)),
                )
                .arg(creds_arg(false))
                .arg(sign_arg()),
        )
        .subcommand(
            Command::new("sign")
                .about("Sign the staged root with the root keys held in the archive")
                .arg(txid_arg())
                .arg(creds_arg(true)),
        )
        .subcommand(
            Command::new("sign-prod-targets")
                .about("Sign production and wave manifests with the offline targets keys held in the archive")
                .arg(txid_arg())
                .arg(creds_arg(true))
                .arg(
                    Arg::new("tags")
                        .long("tags")
                        .value_name("TAGS")
                        .help("Comma-separated production tags (default: all)"),
                )
                .arg(
                    Arg::new("waves")
                        .long("waves")
                        .value_name("WAVES")
                        .help("Comma-separated wave names (default: all)"),
                ),
        )
        .subcommand(
            Command::new("apply")
                .about("Publish the staged changes")
                .arg(txid_arg()),
        )
        .subcommand(
            Command::new("cancel")
                .about("Discard the staged changes")
                .arg(txid_arg()),
        )
        .subcommand(
            Command::new("review")
                .about("Show the staged changes")
                .arg(txid_arg())
                .arg(
                    Arg::new("prod")
                        .long("prod")
                        .action(ArgAction::SetTrue)
                        .help("Show the production root instead of the CI root"),
                ),
        )
}

fn path_of<'a>(matches: &'a ArgMatches, name: &str) -> Option<&'a Path> {
    matches.get_one::<String>(name).map(Path::new)
}

fn required_path<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a Path, TufError> {
    path_of(matches, name).ok_or(TufError::UsageError("Missing credentials archive"))
}

fn key_type(matches: &ArgMatches, config: &Config) -> Result<KeyType, TufError> {
    match matches.get_one::<String>("key-type") {
        Some(name) => name.parse(),
        None => Ok(config.default_key_type),
    }
}

fn transaction(matches: &ArgMatches) -> Result<Transaction, TufError> {
    let txid = matches
        .get_one::<String>("txid")
        .ok_or(TufError::UsageError("Missing transaction id"))?;
    Transaction::resume(txid.as_str())
}

fn start() -> Result<(), TufError> {
    let matches = cli().get_matches();

    let verbose = matches.get_flag("verbose");
    let debug = matches.get_flag("debug");
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

    let config = Config::load(path_of(&matches, "config"))?.with_overrides(
        matches.get_one::<String>("factory").map(String::as_str),
        matches.get_one::<String>("server").map(String::as_str),
        matches.get_one::<String>("token").map(String::as_str),
    );
    log::debug!("{:?}", config);

    let mut audit_config = config.audit_config();
    if matches.get_flag("audit") {
        audit_config.enabled = true;
    }
    if let Some(path) = matches.get_one::<String>("audit-file") {
        audit_config.enabled = true;
        audit_config.destination = audit::LogDestination::File(path.to_string());
    }
    audit::init(audit_config)?;

    let api = config.api()?;

    let keys = matches
        .subcommand_matches("keys")
        .ok_or(TufError::UsageError("Missing command"))?;
    match keys.subcommand() {
        Some(("tuf", tuf)) => match tuf.subcommand() {
            Some(("updates", m)) => run_updates(m, &api, &config, verbose),
            Some(("sync-prod-root", m)) => {
                let creds = OfflineCreds::open(required_path(m, "keys")?)?;
                let prod = sync::sync_prod_root(&api, &creds)?;
                println!("Production root synced at version {}", prod.signed.version);
                Ok(())
            }
            _ => Err(TufError::UsageError("Unknown tuf command")),
        },
        Some(("rotate-root", m)) => {
            let summary = legacy::rotate_root(
                &api,
                required_path(m, "keys")?,
                key_type(m, &config)?,
                message(m),
            )
            .map_err(report_single_shot)?;
            print_rotation(&summary);
            Ok(())
        }
        Some(("rotate-targets", m)) => {
            let summary = legacy::rotate_targets(
                &api,
                required_path(m, "keys")?,
                path_of(m, "targets-keys"),
                key_type(m, &config)?,
                message(m),
            )
            .map_err(report_single_shot)?;
            print_rotation(&summary);
            Ok(())
        }
        Some(("resign-root", m)) => {
            legacy::resign_root(&api, required_path(m, "keys")?, message(m))
                .map_err(report_single_shot)?;
            println!("Root re-signed");
            Ok(())
        }
        _ => Err(TufError::UsageError("Unknown keys command")),
    }
}

fn message(matches: &ArgMatches) -> &str {
    matches
        .get_one::<String>("message")
        .map(String::as_str)
        .unwrap_or_default()
}

fn report_single_shot(e: SingleShotError) -> TufError {
    if let Some(guidance) = e.guidance() {
        log::error!("{}", guidance);
    }
    e.into()
}

fn print_rotation(summary: &RotationSummary) {
    println!("Replaced key {}", summary.old_key_id);
    println!("New key:     {}", summary.new_key_id);
    for tag in &summary.resigned.prod {
        println!("Re-signed production targets '{}'", tag);
    }
    for wave in &summary.resigned.waves {
        println!("Re-signed wave '{}'", wave);
    }
}

fn run_updates(
    matches: &ArgMatches,
    api: &dyn FactoryApi,
    config: &Config,
    verbose: bool,
) -> Result<(), TufError> {
    if let Some(m) = matches.subcommand_matches("init") {
        let message = m
            .get_one::<String>("message")
            .ok_or(TufError::UsageError("Missing change reason"))?;
        let tx = Transaction::init(api, message)?;
        println!("{}", tx.txid());
        return Ok(());
    }

    let (name, m) = matches
        .subcommand()
        .ok_or(TufError::UsageError("Missing updates command"))?;
    let tx = transaction(m)?;
    let sign = m.try_get_one::<bool>("sign").ok().flatten().copied().unwrap_or(false);

    match name {
        "add-offline-key" => {
            let role = Role::parse_offline(m.get_one::<String>("role").map_or("", String::as_str))?;
            let id = updates::add_offline_key(
                api,
                &tx,
                required_path(m, "keys")?,
                role,
                key_type(m, config)?,
                sign,
            )?;
            println!("Added {} key {}", role, id);
        }
        "delete-offline-key" => {
            let role = Role::parse_offline(m.get_one::<String>("role").map_or("", String::as_str))?;
            let key_id = m.get_one::<String>("key-id").map(String::as_str);
            if key_id.is_none() && path_of(m, "keys").is_none() {
                return Err(TufError::UsageError(
                    "Either --keys or --key-id is required",
                ));
            }
            let id =
                updates::delete_offline_key(api, &tx, path_of(m, "keys"), role, key_id, sign)?;
            println!("Removed {} key {}", role, id);
        }
        "rotate-offline-key" => {
            let role = Role::parse_offline(m.get_one::<String>("role").map_or("", String::as_str))?;
            let summary = updates::rotate_offline_key(
                api,
                &tx,
                required_path(m, "keys")?,
                path_of(m, "targets-keys"),
                role,
                key_type(m, config)?,
                sign,
            )?;
            print_rotation(&summary);
        }
        "rotate-online-key" => {
            let roles = m
                .get_one::<String>("role")
                .map_or("", String::as_str)
                .split(',')
                .filter(|r| !r.trim().is_empty())
                .map(str::parse)
                .collect::<Result<Vec<Role>, _>>()?;
            let pending = updates::rotate_online_key(
                api,
                &tx,
                &roles,
                key_type(m, config)?,
                path_of(m, "keys"),
                sign,
            )?;
            for name in pending {
                println!("Pending server re-sign: {}", name);
            }
        }
        "set-threshold" => {
            let role: Role = m.get_one::<String>("role").map_or("", String::as_str).parse()?;
            let threshold = *m
                .get_one::<u32>("threshold")
                .ok_or(TufError::UsageError("Missing threshold"))?;
            updates::set_threshold(api, &tx, role, threshold, path_of(m, "keys"), sign)?;
            println!("Staged {} threshold {}", role, threshold);
        }
        "sign" => {
            let ids = updates::sign(api, &tx, required_path(m, "keys")?)?;
            for id in ids {
                println!("Signed with {}", id);
            }
        }
        "sign-prod-targets" => {
            let filter = ManifestFilter::from_csv(
                m.get_one::<String>("tags").map(String::as_str),
                m.get_one::<String>("waves").map(String::as_str),
            );
            let report = updates::sign_prod_targets(api, &tx, required_path(m, "keys")?, &filter)?;
            for tag in &report.prod {
                println!("Signed production targets '{}'", tag);
            }
            for wave in &report.waves {
                println!("Signed wave '{}'", wave);
            }
        }
        "apply" => {
            if let Err(failure) = tx.apply(api) {
                log::error!("{}", failure.guidance());
                return Err(failure.into());
            }
            println!("Applied");
            return Ok(());
        }
        "cancel" => {
            tx.cancel(api)?;
            println!("Canceled");
            return Ok(());
        }
        "review" => {
            let review = updates::review(api, &tx, m.get_flag("prod"))?;
            print!("{}", review);
            return Ok(());
        }
        _ => return Err(TufError::UsageError("Unknown updates command")),
    }

    if verbose {
        print!("{}", updates::review(api, &tx, false)?);
    }
    Ok(())
}

fn main() -> Result<(), TufError> {
    let res = start();
    match res {
        Ok(_) => {}
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        cli().debug_assert();
    }

    #[test]
    fn test_parse_updates_command() {
        let m = cli()
            .try_get_matches_from([
                "tufroot",
                "keys",
                "tuf",
                "updates",
                "rotate-offline-key",
                "-x",
                "tx1",
                "-r",
                "targets",
                "-k",
                "creds.tgz",
                "-K",
                "targets.tgz",
                "-y",
                "rsa",
                "-s",
            ])
            .unwrap();
        let updates = m
            .subcommand_matches("keys")
            .and_then(|m| m.subcommand_matches("tuf"))
            .and_then(|m| m.subcommand_matches("updates"))
            .and_then(|m| m.subcommand_matches("rotate-offline-key"))
            .unwrap();
        assert_eq!(updates.get_one::<String>("txid").unwrap(), "tx1");
        assert_eq!(updates.get_one::<String>("targets-keys").unwrap(), "targets.tgz");
        assert!(updates.get_flag("sign"));
        assert_eq!(key_type(updates, &Config::default()).unwrap(), KeyType::Rsa);
    }

    #[test]
    fn test_txid_is_required() {
        assert!(cli()
            .try_get_matches_from(["tufroot", "keys", "tuf", "updates", "apply"])
            .is_err());
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let m = cli()
            .try_get_matches_from([
                "tufroot", "keys", "tuf", "updates", "review", "-x", "t", "--prod", "--factory",
                "acme", "-d",
            ])
            .unwrap();
        assert!(m.get_flag("debug"));
        assert_eq!(m.get_one::<String>("factory").unwrap(), "acme");
    }
}
