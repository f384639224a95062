/*!
  `opir` loads the functions of an assembly file into a runtime, decodes each one, shows the op
  array next to its canonical form, encodes it again and prints the result as assembly.

  ```text
  RUST_LOG=opir=debug opir greet.opa
  ```
*/

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use opir::display::{function_table, raw_table};
use opir::raw::{parse_assembly, print_assembly};
use opir::{encode, EncoderOptions, Runtime};

#[derive(Parser, Debug)]
#[command(name = "opir", version, about = "Decode op arrays to canonical form and encode them back")]
struct Args {
  /// Assembly file to load.
  path: PathBuf,

  /// Print only the re-encoded assembly.
  #[arg(short, long)]
  quiet: bool,

  /// Keep concatenation chains as separate concatenations.
  #[arg(long)]
  no_ropes: bool,

  /// Keep calls of builtins as calls.
  #[arg(long)]
  no_fusion: bool,
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
  let text = std::fs::read_to_string(&args.path)?;
  let functions = parse_assembly(&text)?;
  let options = EncoderOptions { rope_concat: !args.no_ropes, fuse_intrinsics: !args.no_fusion };

  let mut runtime = Runtime::with_builtins();
  runtime.load_assembly(&text)?;
  info!(count = functions.len(), path = %args.path.display(), "loaded");

  for raw in &functions {
    let scope = raw.scope.as_deref();
    let function = match runtime.lookup_and_decode(&raw.name, scope)? {
      Some(function) => function,
      None => continue,
    };
    let encoded = encode(&function, &runtime, options)?;

    if !args.quiet {
      println!("{}\n{}", raw.qualified_name(), raw_table(raw));
      println!("canonical\n{}", function_table(&function));
      println!("encoded\n{}", raw_table(&encoded));
    }
    println!("{}", print_assembly(&encoded));
    runtime.replace(&raw.name, scope, encoded);
  }
  Ok(())
}

fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();
  match run(&args) {
    Ok(()) => ExitCode::SUCCESS,
    Err(cause) => {
      error!(%cause, "failed");
      eprintln!("opir: {}", cause);
      ExitCode::FAILURE
    }
  }
}
