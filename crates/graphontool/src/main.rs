//! Index builder and maintenance CLI: turns N-Triples/Turtle into the
//! on-disk index the server loads, prints statistics, and materialises
//! chain views.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hexad::index::builder::{build_chain_view, IndexBuilder, InputTerm};
use hexad::value_id::DateValue;
use hexad::{EngineConfig, Error, Index};
use oxrdf::{Subject, Term};
use oxrdfio::{RdfFormat, RdfParser};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Builds an index from N-Triples or Turtle.
    BuildIndex {
        /// Input file; `-` or absent reads from stdin (N-Triples).
        #[arg(long)]
        input: Option<PathBuf>,
        /// Directory the index files are written to.
        #[arg(long)]
        index_dir: PathBuf,
        /// Engine configuration file (JSON); defaults apply when absent.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Use the plain vocabulary layout instead of the front-coded one.
        #[arg(long)]
        uncompressed_vocabulary: bool,
    },
    /// Prints the statistics recorded in an index's meta.json.
    Stats {
        #[arg(long)]
        index_dir: PathBuf,
    },
    /// Materialises the chain view `?s <p1> ?m . ?m <p2> ?o`.
    BuildView {
        #[arg(long)]
        index_dir: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        first_predicate: String,
        #[arg(long)]
        second_predicate: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(exit_code(&error))
        }
    }
}

/// 2 usage, 3 I/O, 4 corrupt index, 5 query error.
fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<Error>() {
        Some(Error::IoError(_)) => 3,
        Some(Error::InternalError(_)) => 4,
        Some(Error::UserError(_)) => 5,
        None if error.downcast_ref::<io::Error>().is_some() => 3,
        None => 2,
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::BuildIndex { input, index_dir, config, uncompressed_vocabulary } => {
            let config = load_config(config)?;
            let mut builder = IndexBuilder::new(&index_dir, config);
            if uncompressed_vocabulary {
                builder = builder.uncompressed_vocabulary();
            }
            let (reader, format): (Box<dyn Read>, RdfFormat) = match &input {
                None => (Box::new(io::stdin().lock()), RdfFormat::NTriples),
                Some(path) if path.as_os_str() == "-" => {
                    (Box::new(io::stdin().lock()), RdfFormat::NTriples)
                }
                Some(path) => {
                    let format = match path.extension().and_then(|e| e.to_str()) {
                        Some("ttl") => RdfFormat::Turtle,
                        _ => RdfFormat::NTriples,
                    };
                    let file = File::open(path)
                        .with_context(|| format!("opening {}", path.display()))?;
                    (Box::new(BufReader::new(file)), format)
                }
            };
            for quad in RdfParser::from_format(format).for_reader(reader) {
                let quad = quad.context("parsing the input triples")?;
                builder.push_triple([
                    subject_term(&quad.subject),
                    InputTerm::Iri(format!("<{}>", quad.predicate.as_str())),
                    object_term(&quad.object),
                ]);
            }
            tracing::info!(triples = builder.triple_count(), "input parsed, writing the index");
            let meta = builder.finish()?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
            Ok(())
        }
        Command::Stats { index_dir } => {
            let index = Index::open(&index_dir)?;
            println!("{}", serde_json::to_string_pretty(index.meta())?);
            Ok(())
        }
        Command::BuildView { index_dir, name, first_predicate, second_predicate } => {
            let index = Index::open(&index_dir)?;
            let rows = build_chain_view(&index, &name, &first_predicate, &second_predicate)?;
            println!("materialised view `{name}` with {rows} rows");
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        None => Ok(EngineConfig::default()),
        Some(path) => {
            let file = File::open(&path)
                .with_context(|| format!("opening the configuration file {}", path.display()))?;
            serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("parsing the configuration file {}", path.display()))
        }
    }
}

fn subject_term(subject: &Subject) -> InputTerm {
    #[allow(unreachable_patterns)]
    match subject {
        Subject::NamedNode(node) => InputTerm::Iri(format!("<{}>", node.as_str())),
        Subject::BlankNode(node) => InputTerm::BlankNode(node.as_str().to_owned()),
        other => InputTerm::Literal(other.to_string()),
    }
}

fn object_term(term: &Term) -> InputTerm {
    match term {
        Term::NamedNode(node) => InputTerm::Iri(format!("<{}>", node.as_str())),
        Term::BlankNode(node) => InputTerm::BlankNode(node.as_str().to_owned()),
        Term::Literal(literal) => {
            let value = literal.value();
            match literal.datatype().as_str() {
                "http://www.w3.org/2001/XMLSchema#integer"
                | "http://www.w3.org/2001/XMLSchema#int"
                | "http://www.w3.org/2001/XMLSchema#long" => value
                    .parse::<i64>()
                    .map(InputTerm::Int)
                    .unwrap_or_else(|_| InputTerm::Literal(value.to_owned())),
                "http://www.w3.org/2001/XMLSchema#double"
                | "http://www.w3.org/2001/XMLSchema#decimal"
                | "http://www.w3.org/2001/XMLSchema#float" => value
                    .parse::<f64>()
                    .map(InputTerm::Double)
                    .unwrap_or_else(|_| InputTerm::Literal(value.to_owned())),
                "http://www.w3.org/2001/XMLSchema#boolean" => match value {
                    "true" => InputTerm::Bool(true),
                    "false" => InputTerm::Bool(false),
                    _ => InputTerm::Literal(value.to_owned()),
                },
                "http://www.w3.org/2001/XMLSchema#date"
                | "http://www.w3.org/2001/XMLSchema#dateTime" => parse_date(value)
                    .map(InputTerm::Date)
                    .unwrap_or_else(|| InputTerm::Literal(value.to_owned())),
                _ => InputTerm::Literal(value.to_owned()),
            }
        }
        #[allow(unreachable_patterns)]
        other => InputTerm::Literal(other.to_string()),
    }
}

/// `YYYY-MM-DD` with an optional `THH:MM:SS` tail; anything fancier stays
/// a plain literal.
fn parse_date(value: &str) -> Option<DateValue> {
    let (date, time) = match value.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (value, None),
    };
    let mut parts = date.splitn(3, '-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u8 = parts.next()?.parse().ok()?;
    let day: u8 = parts.next()?.parse().ok()?;
    let (hour, minute, second) = match time {
        None => (0, 0, 0),
        Some(time) => {
            let time = time.trim_end_matches('Z');
            let mut parts = time.splitn(3, ':');
            let hour: u8 = parts.next()?.parse().ok()?;
            let minute: u8 = parts.next()?.parse().ok()?;
            let second: u8 =
                parts.next()?.split('.').next()?.parse().ok()?;
            (hour, minute, second)
        }
    };
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(DateValue { year, month, day, hour, minute, second })
}
