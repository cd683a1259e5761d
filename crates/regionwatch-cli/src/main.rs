//! Regionwatch Command-Line Watcher
//!
//! Watches a query on a SQLite database and prints its result again after
//! every committed write that touches the tables and columns it reads.

mod formatter;

use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use formatter::{create_formatter, Formatter, OutputFormat, ResultSet};
use regionwatch::{ObserveOptions, RegionObservation, ValueStream, Writer, WriterConfig};

/// Regionwatch Command-Line Watcher
#[derive(Parser, Debug)]
#[command(name = "regionwatch")]
#[command(version, about = "Watch a SQLite query for committed changes")]
pub struct Args {
    /// Database file
    pub database: PathBuf,

    /// Read-only query to watch
    #[arg(short = 'w', long)]
    pub watch: String,

    /// Write statement to execute in its own transaction (repeatable)
    #[arg(short = 'e', long = "exec")]
    pub exec: Vec<String>,

    /// Read write statements from standard input, one per line
    #[arg(long)]
    pub stdin: bool,

    /// Only print results after changes, not the initial result
    #[arg(long)]
    pub changes_only: bool,

    /// Output format
    #[arg(long, default_value = "table", value_enum)]
    pub format: OutputFormat,

    /// Busy timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub busy_timeout_ms: u64,
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = WriterConfig::new(&args.database)
        .with_busy_timeout(Duration::from_millis(args.busy_timeout_ms))
        .with_label("cli");
    let writer = Writer::open(config)?;
    let formatter = create_formatter(args.format);

    let options = ObserveOptions::default().with_start_immediately(!args.changes_only);
    let sql = args.watch.clone();
    let mut watcher = Watcher {
        results: RegionObservation::new()
            .tracking_sql(args.watch.as_str())
            .values(&writer, options, move |db| ResultSet::query(db, &sql)),
        emissions: 0,
        formatter,
    };
    watcher.print_pending()?;

    for statement in &args.exec {
        watcher.execute(&writer, statement)?;
    }

    if args.stdin {
        for line in std::io::stdin().lock().lines() {
            let line = line?;
            let statement = line.trim();
            if statement.is_empty() || statement.starts_with("--") {
                continue;
            }
            // Keep going on bad statements: the watched query still stands.
            if let Err(e) = watcher.execute(&writer, statement) {
                println!("{}", watcher.formatter.format_error(&e.to_string()));
            }
        }
    }

    watcher.results.cancel();
    writer.close()?;
    Ok(())
}

struct Watcher {
    results: ValueStream<ResultSet>,
    emissions: usize,
    formatter: Box<dyn Formatter>,
}

impl Watcher {
    fn execute(&mut self, writer: &Writer, statement: &str) -> regionwatch::Result<()> {
        tracing::debug!(statement, "executing");
        let affected = writer.write(|db| Ok(db.execute(statement, [])?))?;
        println!("{}", self.formatter.format_write(statement, affected));
        self.print_pending()
    }

    /// Print every result produced since the last call.
    fn print_pending(&mut self) -> regionwatch::Result<()> {
        while let Some(result) = self.results.try_next() {
            let result = result?;
            self.emissions += 1;
            println!("{}", self.formatter.format_result(self.emissions, &result));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args() {
        Args::command().debug_assert();

        let args = Args::parse_from([
            "regionwatch",
            "game.sqlite",
            "--watch",
            "SELECT name FROM player",
            "-e",
            "INSERT INTO player (name) VALUES ('ann')",
            "-e",
            "DELETE FROM player",
            "--format",
            "csv",
        ]);
        assert_eq!(args.database, PathBuf::from("game.sqlite"));
        assert_eq!(args.exec.len(), 2);
        assert_eq!(args.format, OutputFormat::Csv);
        assert!(!args.changes_only);
        assert_eq!(args.busy_timeout_ms, 5000);
    }

    #[test]
    fn test_watcher_prints_each_emission() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(WriterConfig::new(dir.path().join("game.sqlite"))).unwrap();
        writer
            .write(|db| {
                db.execute_batch("CREATE TABLE player (name TEXT)")?;
                Ok(())
            })
            .unwrap();

        let mut watcher = Watcher {
            results: RegionObservation::new()
                .tracking_sql("SELECT name FROM player")
                .values(&writer, ObserveOptions::default(), |db| {
                    ResultSet::query(db, "SELECT name FROM player")
                }),
            emissions: 0,
            formatter: create_formatter(OutputFormat::Json),
        };
        watcher.print_pending().unwrap();
        assert_eq!(watcher.emissions, 1);

        watcher
            .execute(&writer, "INSERT INTO player (name) VALUES ('ann')")
            .unwrap();
        assert_eq!(watcher.emissions, 2);

        assert!(watcher.execute(&writer, "INSERT INTO missing VALUES (1)").is_err());
        assert_eq!(watcher.emissions, 2);
    }
}
