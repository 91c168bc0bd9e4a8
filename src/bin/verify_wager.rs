//! Offline wager audit
//!
//! Recomputes a settled wager from its record and the revealed server secret
//! of its fair-play period, and reports every field that does not match.

use clap::Parser;
use fairstake::{
    fairness::CommitmentRegistry,
    games::outcome::verify_wager,
    storage::{KvStore, OptimizedStorage},
    wager_store::WagerStore,
};
use std::{process::ExitCode, sync::Arc};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "verify-wager")]
#[command(about = "Verify a settled wager against its revealed server secret", long_about = None)]
struct Args {
    /// Wager id (or session id for multi-step games)
    wager_id: Uuid,

    /// Database directory
    #[arg(long, default_value = "./DB/fairstake")]
    db_path: String,

    /// Verify against this secret instead of the stored one
    #[arg(long)]
    secret: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> Result<bool, Box<dyn std::error::Error>> {
    let store: Arc<dyn KvStore> = Arc::new(OptimizedStorage::new(&args.db_path)?);
    let wagers = WagerStore::new(store.clone());

    let record = wagers
        .load_record(&args.wager_id)?
        .ok_or_else(|| format!("wager {} not found", args.wager_id))?;

    let secret = match &args.secret {
        Some(secret) => secret.clone(),
        None => {
            let period = CommitmentRegistry::load_period_from(store.as_ref(), record.period_number)?
                .ok_or_else(|| format!("period {} not found", record.period_number))?;
            period
                .revealed_secret()
                .map(str::to_string)
                .ok_or_else(|| {
                    format!(
                        "period {} is still active until {}; its secret is not public yet",
                        period.number, period.end_time
                    )
                })?
        }
    };

    println!("Wager {}", record.id);
    println!("   Game:     {}", record.game_type);
    println!("   User:     {}", record.user_id);
    println!("   Stake:    {}", record.stake);
    println!("   Payout:   {} ({})", record.payout, record.multiplier);
    println!("   Period:   {}", record.period_number);
    println!("   Nonce:    {}", record.nonce);
    println!("   Seed:     {}", record.client_seed);

    let report = verify_wager(&record, &secret);
    println!();
    println!("   Commitment hash: {}", verdict(report.hash_matches));
    println!("   Result digest:   {}", verdict(report.digest_matches));
    println!("   Outcome:         {}", verdict(report.outcome_matches));
    println!("   Payout:          {}", verdict(report.payout_matches));
    for mismatch in &report.mismatches {
        println!("      - {}", mismatch);
    }

    if report.is_valid() {
        println!("\nWager verified");
    } else {
        println!("\nWager verification FAILED");
    }
    Ok(report.is_valid())
}

fn verdict(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "MISMATCH"
    }
}
