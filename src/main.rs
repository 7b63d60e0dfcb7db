//! `vault` — drive a lesson reward vault stored in a JSON file.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use log::{debug, LevelFilter};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;

use lingo_vault::{
    ledger::Amount,
    policy::{format_tokens, parse_tokens, DEFAULT_UNIT, DEFAULT_XP_DIVISOR},
    store, Address, CallOutcome, ProofId, RewardPolicy, SignedCall, Vault, VaultCall,
};

#[derive(Parser, Debug)]
#[command(name = "vault", version, about = "Lesson reward vault")]
struct Cli {
    /// Vault file
    #[arg(long, global = true, env = "VAULT_STATE", default_value = "vault.json")]
    state: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty vault file
    Init {
        /// Address allowed to mint reserve deposits
        #[arg(long)]
        operator: Address,
        #[arg(long, default_value_t = DEFAULT_XP_DIVISOR)]
        xp_divisor: u128,
        /// Lesson reward ceiling, in tokens
        #[arg(long, default_value = "1")]
        lesson_cap: String,
        /// Module completion bonus, in tokens
        #[arg(long, default_value = "10")]
        module_bonus: String,
        /// Base units per token (10^18 for an 18-decimal token)
        #[arg(long, default_value_t = DEFAULT_UNIT)]
        unit: Amount,
        /// Overwrite an existing vault file
        #[arg(long)]
        force: bool,
    },

    /// Generate an Ed25519 key pair (sk.hex, pk.hex)
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },

    /// Print the address owned by a secret key
    Address {
        #[arg(long)]
        sk_hex: String,
    },

    /// Derive a fresh proof id
    ProofId {
        #[arg(long, default_value = "lesson")]
        label: String,
    },

    /// Deposit into the reserve (operator mints, others pay from their wallet)
    Fund {
        #[arg(long)]
        sk_hex: String,
        /// Tokens, e.g. 100 or 2.5
        #[arg(long)]
        amount: String,
    },

    /// Record a completed lesson
    SubmitLesson {
        #[arg(long)]
        sk_hex: String,
        #[arg(long)]
        xp: u128,
        /// Proof id (random when omitted)
        #[arg(long)]
        proof: Option<ProofId>,
    },

    /// Record a completed module
    SubmitModule {
        #[arg(long)]
        sk_hex: String,
        #[arg(long)]
        proof: Option<ProofId>,
    },

    /// Withdraw part of the claimable balance
    Claim {
        #[arg(long)]
        sk_hex: String,
        /// Tokens, e.g. 1 or 0.25
        #[arg(long)]
        amount: String,
    },

    /// Withdraw the whole claimable balance, or nothing
    ClaimAll {
        #[arg(long)]
        sk_hex: String,
    },

    /// Show a learner's xp and claimable balance
    Learner { address: Address },

    /// List ledger events
    Events {
        #[arg(long)]
        learner: Option<Address>,
    },

    /// Show reserve, height and state root
    Status,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn parse_sk_hex(sk_hex: &str) -> Result<SigningKey> {
    let sk_bytes = hex::decode(sk_hex.trim()).context("invalid sk-hex")?;
    let arr: [u8; 32] = sk_bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("sk-hex must be 32 bytes (64 hex chars)"))?;
    Ok(SigningKey::from_bytes(&arr))
}

fn signer_address(sk: &SigningKey) -> Address {
    Address::from_public_key(&sk.verifying_key().to_bytes())
}

fn load_vault(path: &Path) -> Result<Vault> {
    store::load(path).with_context(|| format!("loading vault {}", path.display()))
}

fn cmd_init(
    path: &Path,
    operator: Address,
    policy: RewardPolicy,
    force: bool,
) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let vault = Vault::new(policy, operator)?;
    store::save(path, &vault)?;
    println!("vault created → {}", path.display());
    println!("operator: {operator}");
    Ok(())
}

fn cmd_keygen(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let mut sk_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut sk_bytes);
    let sk = SigningKey::from_bytes(&sk_bytes);
    let pk = sk.verifying_key();

    fs::write(out_dir.join("sk.hex"), hex::encode(sk_bytes))?;
    fs::write(out_dir.join("pk.hex"), hex::encode(pk.as_bytes()))?;
    println!("keypair written → {}", out_dir.display());
    println!("address: {}", signer_address(&sk));
    Ok(())
}

fn parse_amount(text: &str, unit: Amount) -> Result<Amount> {
    parse_tokens(text, unit).with_context(|| format!("invalid amount {text:?}"))
}

fn cmd_call(
    path: &Path,
    sk_hex: &str,
    call: impl FnOnce(&RewardPolicy) -> Result<VaultCall>,
) -> Result<()> {
    let sk = parse_sk_hex(sk_hex)?;
    let mut vault = load_vault(path)?;
    let unit = vault.ledger().policy().unit;
    let call = call(vault.ledger().policy())?;
    let sender = signer_address(&sk);
    let nonce = vault.next_nonce(&sender);
    let signed = SignedCall::sign(&sk, call, nonce)?;
    debug!("{}", serde_json::to_string(&signed)?);

    let outcome = vault
        .execute(&signed, now_ms())
        .with_context(|| format!("call from {sender} rejected"))?;
    store::save(path, &vault)?;

    let tokens = |amount| format_tokens(amount, unit);
    match outcome {
        CallOutcome::LessonRecorded { reward } => {
            println!("lesson recorded, reward {}", tokens(reward))
        }
        CallOutcome::ModuleRecorded { reward } => {
            println!("module recorded, reward {}", tokens(reward))
        }
        CallOutcome::Claimed { amount } => println!("claimed {} → {sender}", tokens(amount)),
        CallOutcome::Deposited { reserve } => println!("reserve now {}", tokens(reserve)),
    }
    let view = vault.learners(&sender);
    println!(
        "{sender}: xp={} claimable={}",
        view.xp,
        tokens(view.claimable)
    );
    Ok(())
}

#[derive(Serialize)]
struct LearnerOut {
    xp: u128,
    claimable: Amount,
    claimable_tokens: String,
}

fn cmd_learner(path: &Path, address: &Address) -> Result<()> {
    let vault = load_vault(path)?;
    let view = vault.learners(address);
    let out = LearnerOut {
        xp: view.xp,
        claimable: view.claimable,
        claimable_tokens: format_tokens(view.claimable, vault.ledger().policy().unit),
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn cmd_events(path: &Path, learner: Option<Address>) -> Result<()> {
    let vault = load_vault(path)?;
    for entry in vault
        .ledger()
        .events()
        .iter()
        .filter(|e| learner.map_or(true, |l| e.event.concerns(&l)))
    {
        println!("{}", serde_json::to_string(entry)?);
    }
    Ok(())
}

fn cmd_status(path: &Path) -> Result<()> {
    let vault = load_vault(path)?;
    let ledger = vault.ledger();
    let policy = ledger.policy();
    let tokens = |amount| format_tokens(amount, policy.unit);
    println!("operator:   {}", ledger.operator());
    println!(
        "reserve:    {} ({} base units)",
        tokens(ledger.reserve()),
        ledger.reserve()
    );
    println!("height:     {}", ledger.meta().height);
    println!("state root: {}", hex::encode(ledger.state_root()));
    println!(
        "policy:     divisor={} cap={} module={} unit={}",
        policy.xp_divisor,
        tokens(policy.lesson_cap),
        tokens(policy.module_bonus),
        policy.unit
    );
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let state = cli.state.as_path();
    match cli.command {
        Commands::Init {
            operator,
            xp_divisor,
            lesson_cap,
            module_bonus,
            unit,
            force,
        } => {
            let policy = RewardPolicy {
                xp_divisor,
                lesson_cap: parse_amount(&lesson_cap, unit).context("--lesson-cap")?,
                module_bonus: parse_amount(&module_bonus, unit).context("--module-bonus")?,
                unit,
            };
            cmd_init(state, operator, policy, force)
        }
        Commands::Keygen { out_dir } => cmd_keygen(&out_dir),
        Commands::Address { sk_hex } => {
            println!("{}", signer_address(&parse_sk_hex(&sk_hex)?));
            Ok(())
        }
        Commands::ProofId { label } => {
            println!("{}", ProofId::random(&label));
            Ok(())
        }
        Commands::Fund { sk_hex, amount } => cmd_call(state, &sk_hex, |policy| {
            Ok(VaultCall::Deposit {
                amount: parse_amount(&amount, policy.unit)?,
            })
        }),
        Commands::SubmitLesson { sk_hex, xp, proof } => {
            let proof_id = proof.unwrap_or_else(|| ProofId::random("lesson"));
            cmd_call(state, &sk_hex, |_| {
                Ok(VaultCall::SubmitLesson {
                    xp_gained: xp,
                    proof_id,
                })
            })
        }
        Commands::SubmitModule { sk_hex, proof } => {
            let proof_id = proof.unwrap_or_else(|| ProofId::random("module"));
            cmd_call(state, &sk_hex, |_| Ok(VaultCall::SubmitModule { proof_id }))
        }
        Commands::Claim { sk_hex, amount } => cmd_call(state, &sk_hex, |policy| {
            Ok(VaultCall::Claim {
                amount: parse_amount(&amount, policy.unit)?,
            })
        }),
        Commands::ClaimAll { sk_hex } => cmd_call(state, &sk_hex, |_| Ok(VaultCall::ClaimAll)),
        Commands::Learner { address } => cmd_learner(state, &address),
        Commands::Events { learner } => cmd_events(state, learner),
        Commands::Status => cmd_status(state),
    }
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(2);
    }
}
