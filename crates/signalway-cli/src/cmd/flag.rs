use crate::cmd::{parse_at, read_file};
use crate::output::print_json;
use clap::Subcommand;
use signalway_core::flag::{self, FlagContext};
use signalway_core::store::db::StoreDb;
use signalway_core::store::FlagStore;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum FlagSubcommand {
    /// Evaluate a flag for a context
    Check {
        /// Flag rows (YAML file); falls back to the store when omitted
        #[arg(long)]
        flags: Option<PathBuf>,
        #[arg(long, env = "SIGNALWAY_DB")]
        db: Option<PathBuf>,
        #[arg(long)]
        code: String,
        #[arg(long)]
        org: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        role: Vec<String>,
        /// Evaluation time (RFC 3339, default: now)
        #[arg(long)]
        at: Option<String>,
    },
    /// Load flag rows from a YAML file into the store
    Load {
        #[arg(long, env = "SIGNALWAY_DB")]
        db: PathBuf,
        #[arg(long)]
        file: PathBuf,
    },
}

pub fn run(subcmd: FlagSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        FlagSubcommand::Check {
            flags,
            db,
            code,
            org,
            user,
            role,
            at,
        } => {
            let now = parse_at(at.as_deref())?;
            let rows = match (&flags, &db) {
                (Some(path), _) => flag::from_yaml_str(&read_file(path)?)?,
                (None, Some(db_path)) => StoreDb::open(db_path)?.flags()?,
                (None, None) => anyhow::bail!("pass --flags or --db"),
            };
            let ctx = FlagContext {
                organization_id: org.clone(),
                user_id: user,
                roles: role,
            };
            let enabled =
                flag::is_enabled(flag::effective(&rows, &code, org.as_deref()), &ctx, now);

            if json {
                print_json(&serde_json::json!({ "code": code, "enabled": enabled }))?;
            } else {
                println!("{code}: {}", if enabled { "enabled" } else { "disabled" });
            }
            Ok(())
        }
        FlagSubcommand::Load { db, file } => {
            let store = StoreDb::open(&db)?;
            let rows = flag::from_yaml_str(&read_file(&file)?)?;
            for row in &rows {
                store.put_flag(row)?;
            }
            if json {
                print_json(&serde_json::json!({ "loaded": rows.len() }))?;
            } else {
                println!("loaded {} flag row(s)", rows.len());
            }
            Ok(())
        }
    }
}
