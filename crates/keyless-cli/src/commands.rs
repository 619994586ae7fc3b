//! CLI command implementations

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use keyless_client::{
    restore_wallet, ClientConfig, CommitRevealFlow, FlowEvent, FlowObserver, FlowSettings,
    FlowState, HttpRelayer, OperationIntent, Registry, Relayer, WalletStore,
};
use keyless_core::{
    bind_built_inner_trees, otp, parse_amount, Address, CoreSelection, HashFunction,
    InnerTreeSpec, Operation, SecurityParameters, Seed, TreeParams, TreeRequest, TreeTarget,
    WalletRecord, DEFAULT_DURATION, DEFAULT_INTERVAL, DEFAULT_SLOT_SIZE,
};
use keyless_worker::{TreeWorker, WorkerMessage};

/// Keyless - OTP-authorized smart-contract wallets
#[derive(Parser)]
#[command(name = "keyless")]
#[command(about = "Client for OTP-authorized smart-contract wallets")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to $KEYLESS_CONFIG or the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the current OTP code of a seed
    Otp {
        /// Seed (hex)
        #[arg(long)]
        seed: String,

        /// Unix time (defaults to now)
        #[arg(long)]
        at: Option<u64>,

        /// OTP interval in seconds
        #[arg(
            long,
            default_value_t = DEFAULT_INTERVAL,
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        interval: u64,
    },

    /// Build a wallet tree and store the wallet
    Build(BuildArgs),

    /// Prepare a transfer proof without submitting it
    Proof(TransferArgs),

    /// Transfer native funds
    Transfer(TransferArgs),

    /// Send all funds to the last-resort address
    Recover(AuthArgs),

    /// Rebuild a wallet generation from its seed
    Restore {
        /// Wallet address
        #[arg(long)]
        address: Address,

        /// Seed (hex)
        #[arg(long)]
        seed: String,

        /// Second seed for double-OTP wallets (hex)
        #[arg(long)]
        seed2: Option<String>,

        /// Do not rebuild every core when no identification key matches
        #[arg(long)]
        no_fallback: bool,
    },

    /// Replace a wallet's tree with one built from a new seed
    Renew {
        /// Wallet address
        #[arg(long)]
        address: Address,

        /// New seed (hex, generated if omitted)
        #[arg(long)]
        seed: Option<String>,

        /// New second seed for double-OTP wallets (hex)
        #[arg(long)]
        seed2: Option<String>,

        /// Lifespan of the new tree in seconds
        #[arg(long, default_value_t = DEFAULT_DURATION)]
        duration: u64,
    },

    /// List stored wallets
    Wallets,

    /// Forget a wallet and its unused layers
    Evict {
        /// Wallet address
        #[arg(long)]
        address: Address,
    },

    /// Check the relayer is reachable
    Health,
}

#[derive(Args)]
pub struct BuildArgs {
    /// Address of the deployed wallet contract
    #[arg(long)]
    pub address: Address,

    /// Address receiving funds on recovery
    #[arg(long)]
    pub last_resort: Address,

    /// Seed (hex, generated if omitted)
    #[arg(long)]
    pub seed: Option<String>,

    /// Second seed (hex); implies double OTP
    #[arg(long)]
    pub seed2: Option<String>,

    /// Generate a second seed for double OTP
    #[arg(long)]
    pub double_otp: bool,

    /// Display name
    #[arg(long, default_value = "")]
    pub name: String,

    /// Largest native amount per transfer (unlimited if omitted)
    #[arg(long, value_parser = parse_amount)]
    pub daily_limit: Option<u128>,

    /// OTP interval in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_INTERVAL,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub interval: u64,

    /// Lifespan in seconds
    #[arg(long, default_value_t = DEFAULT_DURATION)]
    pub duration: u64,

    /// Operations per interval
    #[arg(long, default_value_t = DEFAULT_SLOT_SIZE)]
    pub slot_size: u16,

    /// Randomness bits mixed into each leaf
    #[arg(long, default_value_t = 0)]
    pub randomness: u8,

    /// Leaf hash function: sha256, sha256-truncated or argon2
    #[arg(long, default_value = "sha256-truncated")]
    pub hasher: HashFunction,

    /// Start of the lifespan (defaults to the current interval)
    #[arg(long)]
    pub effective_time: Option<u64>,

    /// Inner tree as LIMIT:INTERVAL_SECS (repeatable)
    #[arg(long = "inner", value_parser = parse_inner)]
    pub inner: Vec<InnerTreeSpec>,
}

#[derive(Args)]
pub struct AuthArgs {
    /// Wallet address
    #[arg(long)]
    pub address: Address,

    /// Current OTP code
    #[arg(long)]
    pub otp: String,

    /// Current code of the second seed
    #[arg(long)]
    pub otp2: Option<String>,

    /// Operation index within the interval
    #[arg(long, default_value_t = 0)]
    pub nonce: u16,

    /// Prove with this inner core instead of the main tree
    #[arg(long)]
    pub inner: Option<u8>,

    /// Prove with old generation N, as reported by `restore`
    #[arg(long, conflicts_with = "inner")]
    pub old: Option<usize>,
}

#[derive(Args)]
pub struct TransferArgs {
    #[command(flatten)]
    pub auth: AuthArgs,

    /// Recipient
    #[arg(long)]
    pub dest: Address,

    /// Amount in the chain's smallest unit
    #[arg(long, value_parser = parse_amount)]
    pub amount: u128,
}

impl AuthArgs {
    fn intent(&self, operation: Operation) -> OperationIntent {
        let mut intent = OperationIntent::new(operation, self.otp.clone()).with_nonce(self.nonce);
        if let Some(otp2) = &self.otp2 {
            intent = intent.with_second_otp(otp2.clone());
        }
        if let Some(index) = self.inner {
            intent = intent.with_target(TreeTarget::Inner(index));
        }
        if let Some(generation) = self.old {
            intent = intent.with_generation(CoreSelection::Old(generation));
        }
        intent
    }
}

fn parse_inner(s: &str) -> std::result::Result<InnerTreeSpec, String> {
    let (limit, interval) = s
        .split_once(':')
        .ok_or_else(|| "expected LIMIT:INTERVAL_SECS".to_string())?;
    Ok(InnerTreeSpec {
        spending_limit: parse_amount(limit).map_err(|e| e.to_string())?,
        spending_interval: interval
            .parse()
            .map_err(|_| format!("invalid interval: {}", interval))?,
    })
}

/// Current unix time
fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn format_time(unix: u64) -> String {
    chrono::DateTime::from_timestamp(unix as i64, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| unix.to_string())
}

fn seed_or_generate(hex: Option<&str>, label: &str) -> Result<Seed> {
    match hex {
        Some(hex) => Ok(Seed::from_hex(hex).with_context(|| format!("invalid {}", label))?),
        None => {
            let seed = Seed::generate();
            println!("Generated {}: {}", label, seed.to_hex());
            println!("  Add it to your authenticator; it is not stored anywhere.");
            Ok(seed)
        }
    }
}

/// Print build progress until aborted
fn spawn_progress(mut rx: broadcast::Receiver<WorkerMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_percent = u64::MAX;
        loop {
            match rx.recv().await {
                Ok(WorkerMessage::Working {
                    current,
                    total,
                    stage,
                    ..
                }) => {
                    let percent = if total == 0 { 100 } else { current * 100 / total };
                    if percent / 10 != last_percent / 10 {
                        eprintln!("  {:?}: {}%", stage, percent);
                        last_percent = percent;
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Prints flow events as they happen
struct ConsoleObserver;

impl FlowObserver for ConsoleObserver {
    fn on_state(&mut self, state: &FlowState) {
        println!("  -> {}", state);
    }

    fn on_event(&mut self, event: &FlowEvent) {
        match event {
            FlowEvent::RevealAttemptFailed { remaining, message } => {
                println!("  Reveal failed ({}), {} attempt(s) left", message, remaining)
            }
            FlowEvent::CommitError { message }
            | FlowEvent::CommitFailure { message }
            | FlowEvent::RevealFailure { message }
            | FlowEvent::RevealError { message } => println!("  Error: {}", message),
            FlowEvent::Success { tx } => {
                println!("✓ Operation executed (tx {})", tx.as_deref().unwrap_or("unknown"))
            }
            FlowEvent::Invalidate { addresses } => {
                let list: Vec<String> = addresses.iter().map(|a| a.to_hex()).collect();
                println!("  Balances changed: {}", list.join(", "));
            }
        }
    }
}

/// Shared state of commands that touch wallets
struct Session {
    config: ClientConfig,
    registry: Registry,
    worker: Arc<TreeWorker>,
}

impl Session {
    fn open(config: ClientConfig) -> Result<Self> {
        config.ensure_directories()?;
        let store = WalletStore::new(config.store_path.clone())?;
        let registry = Registry::new(store, config.commit_timeout_secs);
        Ok(Self {
            config,
            registry,
            worker: Arc::new(TreeWorker::new()),
        })
    }

    fn relayer(&self) -> Result<Arc<HttpRelayer>> {
        let relayer = HttpRelayer::new(&self.config.relayer_url, self.config.request_timeout())?
            .with_secret(self.config.relayer_secret.clone())
            .with_network(&self.config.network);
        Ok(Arc::new(relayer))
    }

    fn flow(&self, address: Address) -> Result<CommitRevealFlow> {
        Ok(CommitRevealFlow::new(address, self.relayer()?, self.worker.clone())
            .with_observer(Box::new(ConsoleObserver))
            .with_settings(FlowSettings::from(&self.config)))
    }

    async fn execute(&mut self, auth: &AuthArgs, operation: Operation) -> Result<()> {
        println!("{} from {}", operation.name(), auth.address);
        let intent = auth.intent(operation);
        let mut flow = self.flow(auth.address)?;
        flow.run(&mut self.registry, &intent, now()).await?;
        Ok(())
    }
}

/// Run the CLI
pub async fn run(cli: Cli, config: ClientConfig) -> Result<()> {
    match cli.command {
        Commands::Otp { seed, at, interval } => {
            let seed = Seed::from_hex(&seed).context("invalid seed")?;
            let at = at.unwrap_or_else(now);
            let code = otp::generate_at(&seed, at, interval)?;
            println!("{}", code);
            println!("  valid for {}s", interval - at % interval);
            Ok(())
        }

        Commands::Build(args) => build(Session::open(config)?, args).await,

        Commands::Proof(args) => {
            let mut ctx = Session::open(config)?;
            let operation = Operation::Transfer {
                dest: args.dest,
                amount: args.amount,
            };
            let intent = args.auth.intent(operation);
            let mut flow = ctx.flow(args.auth.address)?;
            flow.prepare(&mut ctx.registry, &intent, now()).await?;
            let (authorization, extended) = flow
                .prepared()
                .context("no proof was prepared")?;
            let output = serde_json::json!({
                "authorization": authorization,
                "paramsHash": extended.params_hash,
                "verificationHash": extended.verification_hash,
                "commitHash": authorization.commit_hash()?,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }

        Commands::Transfer(args) => {
            let mut ctx = Session::open(config)?;
            let operation = Operation::Transfer {
                dest: args.dest,
                amount: args.amount,
            };
            ctx.execute(&args.auth, operation).await
        }

        Commands::Recover(auth) => {
            let mut ctx = Session::open(config)?;
            ctx.execute(&auth, Operation::Recover).await
        }

        Commands::Restore {
            address,
            seed,
            seed2,
            no_fallback,
        } => {
            let mut ctx = Session::open(config)?;
            let seed = Seed::from_hex(&seed).context("invalid seed")?;
            let seed2 = seed2
                .as_deref()
                .map(Seed::from_hex)
                .transpose()
                .context("invalid second seed")?;
            let fallback = ctx.config.ident_fallback && !no_fallback;
            let progress = spawn_progress(ctx.worker.subscribe());
            let outcome = restore_wallet(
                &ctx.worker,
                &mut ctx.registry,
                &address,
                &seed,
                seed2.as_ref(),
                fallback,
            )
            .await;
            progress.abort();
            let outcome = outcome?;
            println!("✓ Restored {:?} core of {}", outcome.selection, address);
            println!("  Root: {}", outcome.core.root);
            println!("  Matched by: {:?}", outcome.matched_by);
            println!("  Expires: {}", format_time(outcome.core.expires_at()));
            if let CoreSelection::Old(generation) = outcome.selection {
                println!("  Prove with --old {}", generation);
            }
            Ok(())
        }

        Commands::Renew {
            address,
            seed,
            seed2,
            duration,
        } => {
            let mut ctx = Session::open(config)?;
            let record = ctx.registry.load(&address)?.clone();
            let seed = seed_or_generate(seed.as_deref(), "seed")?;
            let seed2 = if record.double_otp {
                Some(seed_or_generate(seed2.as_deref(), "second seed")?)
            } else {
                None
            };
            let interval = record.core.interval;
            let start = now();
            let params = TreeParams {
                effective_time: start - start % interval,
                duration,
                interval,
                slot_size: record.core.slot_size,
                security: SecurityParameters {
                    randomness: record.security.randomness,
                    hasher: record.security.hasher,
                    ..Default::default()
                },
            };
            let mut request = TreeRequest::new(seed, params);
            if let Some(seed2) = seed2 {
                request = request.with_second_seed(seed2);
            }
            let progress = spawn_progress(ctx.worker.subscribe());
            let tree = ctx.worker.build(request).await;
            progress.abort();
            let tree = tree?;
            ctx.registry.renew(&address, &tree)?;
            println!("✓ Renewed {}", address);
            println!("  Root: {}", tree.root);
            println!("  Previous cores: {}", record.old_infos.len() + 1);
            Ok(())
        }

        Commands::Wallets => {
            let mut ctx = Session::open(config)?;
            let addresses = ctx.registry.load_all()?;
            if addresses.is_empty() {
                println!("No wallets stored in {}", ctx.config.store_path.display());
                return Ok(());
            }
            for record in ctx.registry.wallets() {
                print_wallet(record);
            }
            Ok(())
        }

        Commands::Evict { address } => {
            let mut ctx = Session::open(config)?;
            ctx.registry.evict(&address)?;
            println!("✓ Evicted {}", address);
            Ok(())
        }

        Commands::Health => {
            let ctx = Session::open(config)?;
            let relayer = ctx.relayer()?;
            relayer.health().await?;
            println!("✓ Relayer at {} is healthy", relayer.base_url());
            Ok(())
        }
    }
}

async fn build(mut ctx: Session, args: BuildArgs) -> Result<()> {
    let seed = seed_or_generate(args.seed.as_deref(), "seed")?;
    let seed2 = match (&args.seed2, args.double_otp) {
        (Some(hex), _) => Some(Seed::from_hex(hex).context("invalid second seed")?),
        (None, true) => Some(seed_or_generate(None, "second seed")?),
        (None, false) => None,
    };

    let start = now();
    let params = TreeParams {
        effective_time: args
            .effective_time
            .unwrap_or(start - start % args.interval),
        duration: args.duration,
        interval: args.interval,
        slot_size: args.slot_size,
        security: SecurityParameters {
            randomness: args.randomness,
            hasher: args.hasher,
            ..Default::default()
        },
    };
    params.validate()?;

    let mut request = TreeRequest::new(seed, params).with_inner_trees(args.inner);
    if let Some(seed2) = seed2 {
        request = request.with_second_seed(seed2);
    }

    println!("Building {} slots...", params.slot_count());
    let progress = spawn_progress(ctx.worker.subscribe());
    let tree = ctx.worker.build(request.clone()).await;
    progress.abort();
    let tree = tree?;

    let mut record = WalletRecord::from_built(
        args.address,
        &tree,
        args.last_resort,
        args.daily_limit.unwrap_or(0),
        request.seed2.is_some(),
    );
    record.name = args.name;
    for inner in bind_built_inner_trees(&request, &tree)? {
        record.add_inner_core(inner)?;
    }
    drop(request);
    ctx.registry.persist_built(record, &tree)?;

    println!("✓ Wallet stored");
    println!("  Address: {}", args.address);
    println!("  Root: {}", tree.root);
    println!("  Height: {}", tree.layers.height());
    println!("  Operations per interval: {}", tree.max_operations_per_interval);
    println!("  Effective: {}", format_time(params.effective_time));
    println!("  Expires: {}", format_time(params.effective_time + params.duration));
    for inner in &tree.inner_trees {
        println!(
            "  Inner {}: {} (limit {} per {}s)",
            inner.index, inner.root, inner.spec.spending_limit, inner.spec.spending_interval
        );
    }
    Ok(())
}

fn print_wallet(record: &WalletRecord) {
    let label = if record.name.is_empty() { "-" } else { &record.name };
    println!("{} ({})", record.address, label);
    println!("  Root: {}", record.core.root.short());
    println!("  Expires: {}", format_time(record.core.expires_at()));
    println!(
        "  Daily limit: {}",
        if record.daily_limit == 0 {
            "unlimited".to_string()
        } else {
            record.daily_limit.to_string()
        }
    );
    println!("  Double OTP: {}", record.double_otp);
    println!("  Old cores: {}", record.old_infos.len());
    println!("  Inner cores: {}", record.inner_cores.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_inner() {
        let spec = parse_inner("5000:86400").unwrap();
        assert_eq!(spec.spending_limit, 5000);
        assert_eq!(spec.spending_interval, 86400);
        assert!(parse_inner("5000").is_err());
        assert!(parse_inner("0:86400").is_err());
    }

    #[test]
    fn test_transfer_arguments() {
        let cli = Cli::try_parse_from([
            "keyless",
            "transfer",
            "--address",
            "0x1111111111111111111111111111111111111111",
            "--otp",
            "123456",
            "--dest",
            "0x2222222222222222222222222222222222222222",
            "--amount",
            "1000",
            "--inner",
            "1",
        ])
        .unwrap();
        match cli.command {
            Commands::Transfer(args) => {
                assert_eq!(args.amount, 1000);
                let intent = args.auth.intent(Operation::Recover);
                assert_eq!(intent.target, TreeTarget::Inner(1));
                assert_eq!(intent.nonce, 0);
            }
            _ => panic!("expected transfer"),
        }
        assert!(Cli::try_parse_from(["keyless", "build", "--address", "0x12"]).is_err());
    }

    #[test]
    fn test_old_generation_argument() {
        let cli = Cli::try_parse_from([
            "keyless",
            "recover",
            "--address",
            "0x1111111111111111111111111111111111111111",
            "--otp",
            "123456",
            "--old",
            "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Recover(auth) => {
                let intent = auth.intent(Operation::Recover);
                assert_eq!(intent.generation, CoreSelection::Old(2));
                assert_eq!(intent.target, TreeTarget::Main);
            }
            _ => panic!("expected recover"),
        }
    }

    #[test]
    fn test_zero_interval_rejected() {
        let seed = "00".repeat(keyless_core::SEED_LEN);
        let otp = |interval: &str| {
            Cli::try_parse_from(["keyless", "otp", "--seed", seed.as_str(), "--interval", interval])
        };
        assert!(otp("0").is_err());
        assert!(otp("30").is_ok());
    }

    #[test]
    fn test_hasher_argument() {
        let base = [
            "keyless",
            "build",
            "--address",
            "0x1111111111111111111111111111111111111111",
            "--last-resort",
            "0x2222222222222222222222222222222222222222",
        ];
        let parse = |extra: &[&str]| {
            let args: Vec<&str> = base.iter().chain(extra).copied().collect();
            Cli::try_parse_from(args)
        };
        match parse(&["--hasher", "argon2"]).unwrap().command {
            Commands::Build(args) => assert_eq!(args.hasher, HashFunction::Argon2),
            _ => panic!("expected build"),
        }
        match parse(&[]).unwrap().command {
            Commands::Build(args) => assert_eq!(args.hasher, HashFunction::Sha256Truncated),
            _ => panic!("expected build"),
        }
        assert!(parse(&["--hasher", "md5"]).is_err());
    }
}
