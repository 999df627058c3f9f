//! rowgate: inspect and edit a database from the terminal.
//!
//! # Usage
//!
//! ```bash
//! rowgate --database ./stocks.db tables
//! rowgate --database ./stocks.db get stocks 3
//! rowgate --database ./stocks.db set settings theme '"dark"'
//! ```
//!
//! Every connection, cache and logging option can also be set through
//! `ROWGATE_*` environment variables.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rowgate::observability::tracing::init_tracing;
use rowgate::{Config, Database, Item, Row, Select, Value, Where};
use serde_json::json;

#[derive(Parser)]
#[command(name = "rowgate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List tables
    Tables,
    /// Show the columns and foreign keys of a table
    Describe { table: String },
    /// Print rows, optionally filtered by `column=value` pairs
    Select {
        table: String,
        /// Filter as column=value (repeatable)
        #[arg(short, long = "where")]
        filter: Vec<String>,
    },
    /// Look up one row by primary key
    Get { table: String, key: String },
    /// Store a value (two-column tables) or a JSON object row by key
    Set {
        table: String,
        key: String,
        value: String,
    },
    /// Delete one row by primary key
    Remove { table: String, key: String },
    /// Run raw SQL that returns rows
    Query { sql: String },
    /// Run raw SQL that modifies data
    Run { sql: String },
}

/// Interpret a command-line argument as JSON, falling back to plain text.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(raw).map_or_else(|_| Value::from(raw), from_json)
}

fn from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_f64().map(Value::Float))
            .unwrap_or(Value::Null),
        serde_json::Value::String(s) => Value::Text(s),
        other => Value::Json(other),
    }
}

fn parse_filter(pairs: &[String]) -> Result<Option<Where>> {
    let mut filter: Option<Where> = None;
    for pair in pairs {
        let Some((column, value)) = pair.split_once('=') else {
            bail!("filter `{pair}` is not column=value");
        };
        let (column, value) = (column.trim(), parse_value(value.trim()));
        filter = Some(match filter {
            Some(existing) => existing.and(column, value),
            None => Where::eq(column, value),
        });
    }
    Ok(filter)
}

fn print_rows(rows: &[Row]) -> Result<()> {
    for row in rows {
        println!("{}", serde_json::to_string(row)?);
    }
    Ok(())
}

async fn dispatch(db: &Database, command: Commands) -> Result<()> {
    let table = |name: &str| db.table(name).with_context(|| format!("no table named `{name}`"));

    match command {
        Commands::Tables => {
            for table in db.tables() {
                println!("{}", table.name());
            }
        }
        Commands::Describe { table: name } => {
            let table = table(&name)?;
            let schema = table.schema();
            for column in schema.columns() {
                let out = json!({
                    "name": column.name,
                    "type": column.column_type.as_str(),
                    "modifiers": column.modifiers,
                    "primary_key": column.name == schema.primary_key(),
                });
                println!("{out}");
            }
            for fk in schema.foreign_keys() {
                let out = json!({
                    "foreign_key": fk.column,
                    "references": format!("{}.{}", fk.table, fk.reference),
                    "modifiers": fk.modifiers,
                });
                println!("{out}");
            }
        }
        Commands::Select { table: name, filter } => {
            let mut request = Select::all();
            if let Some(filter) = parse_filter(&filter)? {
                request = request.filter(filter);
            }
            print_rows(&table(&name)?.select(request).await?)?;
        }
        Commands::Get { table: name, key } => match table(&name)?.get(parse_value(&key)).await? {
            Some(Item::Value(value)) => println!("{}", serde_json::to_string(&value)?),
            Some(Item::Row(row)) => print_rows(&[row])?,
            None => bail!("no row with key `{key}`"),
        },
        Commands::Set { table: name, key, value } => {
            let item = match serde_json::from_str::<serde_json::Value>(&value) {
                Ok(serde_json::Value::Object(fields)) if table(&name)?.schema().value_column().is_none() => {
                    Item::Row(fields.into_iter().map(|(k, v)| (k, from_json(v))).collect())
                }
                _ => Item::Value(parse_value(&value)),
            };
            table(&name)?.set(parse_value(&key), item).await?;
        }
        Commands::Remove { table: name, key } => {
            if !table(&name)?.remove(parse_value(&key)).await? {
                bail!("no row with key `{key}`");
            }
        }
        Commands::Query { sql } => {
            for row in db.query(&sql).await? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Commands::Run { sql } => {
            let affected = db.run(&sql).await?;
            println!("{}", json!({ "affected": affected }));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.config).context("failed to initialize tracing")?;

    let db = Database::open(cli.config)
        .await
        .context("failed to open database")?;
    let result = dispatch(&db, cli.command).await;
    db.close().await;
    result
}
