use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clientforge::{
    color_enabled_stderr, color_enabled_stdout, exit_code_for_sandbox_error, format_fingerprint,
    hash_executable, log_error_stderr, log_warn_stderr, paint, Account, AccountRegistry, ClientFamily,
    Config, JsonFileRegistry, PatchCatalog, Pipeline, SandboxError, TargetOutcome,
};

mod cli;
use cli::{Cli, Command};

fn registry_for(cfg: &Config) -> Arc<JsonFileRegistry> {
    Arc::new(JsonFileRegistry::new(cfg.data_root.join("accounts.json")))
}

fn family(mobile: bool) -> ClientFamily {
    if mobile {
        ClientFamily::Mobile
    } else {
        ClientFamily::Desktop
    }
}

fn run_hash(exe: &Path) -> Result<ExitCode> {
    let fp = hash_executable(exe)?;
    println!("{}", format_fingerprint(fp));
    Ok(ExitCode::SUCCESS)
}

fn run_patch(cfg: &Config, exe: &Path, catalog: Option<&Path>, dry_run: bool) -> Result<ExitCode> {
    let catalog = match catalog {
        Some(p) => PatchCatalog::load(p)?,
        None => clientforge::load_catalog(cfg)?,
    };
    if !dry_run {
        // Base clients are only ever read; patch a clone or a copy instead.
        clientforge::util::fs::refuse_inside(exe, &cfg.clients_root)?;
    }
    let mut bytes = clientforge::read_bytes(exe)?;
    clientforge::macho::parse(&bytes)?;
    let report = catalog.apply(&mut bytes);
    let use_color = color_enabled_stdout();
    println!("catalog {}", report.catalog_version);
    for (name, outcome) in &report.entries {
        let code = match outcome {
            TargetOutcome::Applied { .. } => "\x1b[32m",
            TargetOutcome::AlreadyApplied { .. } => "\x1b[36m",
            TargetOutcome::NotFound | TargetOutcome::OutOfRange { .. } => "\x1b[33m",
        };
        println!("  {name}: {}", paint(use_color, code, &outcome.to_string()));
    }
    if dry_run {
        eprintln!("clientforge: dry-run requested; {} left unchanged.", exe.display());
    } else if report.changed() {
        clientforge::write_atomic(exe, &bytes)?;
    }
    Ok(ExitCode::SUCCESS)
}

fn run_clients(pipeline: &Pipeline, refresh: bool) -> Result<ExitCode> {
    let clients = pipeline.clients(refresh)?;
    if clients.is_empty() {
        eprintln!(
            "clientforge: no base clients under {}",
            pipeline.config().clients_root.display()
        );
    }
    for c in clients {
        println!("{}\t{}", c.name, c.path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn print_warnings(user: &str, warnings: &[String]) {
    let use_err = color_enabled_stderr();
    for w in warnings {
        log_warn_stderr(use_err, &format!("clientforge: {user}: warning: {w}"));
    }
}

fn build_pipeline(cfg: Config) -> Result<(Arc<JsonFileRegistry>, Pipeline)> {
    let registry = registry_for(&cfg);
    let pipeline = Pipeline::from_config(cfg, registry.clone())?;
    Ok((registry, pipeline))
}

fn run_provision(cfg: Config, account: Account) -> Result<ExitCode> {
    let (registry, pipeline) = build_pipeline(cfg)?;
    registry.upsert(account.clone())?;
    let prepared = pipeline.prepare(&account)?;
    print_warnings(&account.username, &prepared.warnings);
    println!(
        "{}\t{}\t{}\t{}",
        account.username,
        prepared.clone.synthetic_name,
        format_fingerprint(prepared.provision.fingerprint()),
        prepared.clone.path.display()
    );
    Ok(ExitCode::SUCCESS)
}

fn run_launch(cfg: Config, account: Account, deep_link: Option<&str>) -> Result<ExitCode> {
    let (registry, pipeline) = build_pipeline(cfg)?;
    registry.upsert(account.clone())?;
    let report = pipeline.launch(&account, deep_link)?;
    print_warnings(&account.username, &report.prepared.warnings);
    println!("{}\t{}", account.username, report.instance.pid);
    Ok(ExitCode::SUCCESS)
}

fn run_many(cfg: Config, accounts: Vec<Account>, deep_link: Option<&str>) -> Result<ExitCode> {
    let (registry, pipeline) = build_pipeline(cfg)?;
    let accounts = if accounts.is_empty() {
        registry.accounts()?
    } else {
        for a in &accounts {
            registry.upsert(a.clone())?;
        }
        accounts
    };
    if accounts.is_empty() {
        anyhow::bail!("no accounts given and none registered");
    }
    let use_err = color_enabled_stderr();
    let mut failed = 0usize;
    for (user, res) in pipeline.run_many(&accounts, deep_link) {
        match res {
            Ok(report) => {
                print_warnings(&user, &report.prepared.warnings);
                println!("{user}\t{}", report.instance.pid);
            }
            Err(e) => {
                failed += 1;
                log_error_stderr(use_err, &format!("clientforge: {user}: {e}"));
            }
        }
    }
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn run_command(cli: Cli) -> Result<ExitCode> {
    let cfg = Config::load().context("failed to load configuration")?;

    match cli.command {
        Command::Hash { executable } => run_hash(&executable),
        Command::Patch {
            executable,
            catalog,
            dry_run,
        } => run_patch(&cfg, &executable, catalog.as_deref(), dry_run),
        Command::Clients { refresh } => {
            let (_, pipeline) = build_pipeline(cfg)?;
            run_clients(&pipeline, refresh)
        }
        Command::Provision {
            user,
            client,
            mobile,
        } => run_provision(cfg, Account::new(user, client).with_family(family(mobile))),
        Command::Launch {
            user,
            client,
            deep_link,
            mobile,
        } => run_launch(
            cfg,
            Account::new(user, client).with_family(family(mobile)),
            deep_link.as_deref(),
        ),
        Command::Run {
            accounts,
            deep_link,
        } => run_many(cfg, accounts, deep_link.as_deref()),
        Command::Stop { user, grace } => {
            let (_, pipeline) = build_pipeline(cfg)?;
            let grace = grace.unwrap_or(pipeline.config().terminate_grace);
            match pipeline.stop(&user, grace)? {
                Some(outcome) => println!("{user}\t{outcome:?}"),
                None => eprintln!("clientforge: {user}: no launched client recorded"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset { user, client } => {
            let (_, pipeline) = build_pipeline(cfg)?;
            pipeline.reset(&Account::new(user, client))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Error chain as one line, skipping causes already spelled out by their parent.
fn render_error(e: &anyhow::Error) -> String {
    let mut msg = e.to_string();
    for cause in e.chain().skip(1) {
        let s = cause.to_string();
        if !msg.contains(&s) {
            msg.push_str(": ");
            msg.push_str(&s);
        }
    }
    msg
}

fn exit_code_for(e: &anyhow::Error) -> ExitCode {
    for cause in e.chain() {
        if let Some(se) = cause.downcast_ref::<SandboxError>() {
            return ExitCode::from(exit_code_for_sandbox_error(se));
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return ExitCode::from(clientforge::exit_code_for_io_error(io));
        }
    }
    ExitCode::from(1)
}

fn main() -> ExitCode {
    // Load environment variables from .env if present (no error if missing)
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Some(mode) = cli.color {
        clientforge::set_color_mode(mode);
    }
    if cli.verbose {
        std::env::set_var("CLIENTFORGE_VERBOSE", "1");
    }
    if let Some(dir) = &cli.data_dir {
        std::env::set_var(clientforge::ENV_DATA_DIR, dir);
    }

    #[cfg(feature = "otel")]
    let _telemetry = clientforge::telemetry_init();

    match run_command(cli) {
        Ok(code) => code,
        Err(e) => {
            log_error_stderr(color_enabled_stderr(), &format!("clientforge: {}", render_error(&e)));
            exit_code_for(&e)
        }
    }
}
