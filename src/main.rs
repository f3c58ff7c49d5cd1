use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use klp_convert::driver::{self, Options};

/// Converts a livepatch module's relocations into the kernel's
/// cross-object `.klp.rela` form, using a catalog of known symbol
/// positions to disambiguate repeated names.
#[derive(Parser)]
#[command(name = "klp-convert")]
struct Cli {
    /// Kernel-wide `symbols.klp`-style catalog file.
    catalog: PathBuf,
    /// Freshly linked livepatch module object.
    input: PathBuf,
    /// Where to write the converted object.
    output: PathBuf,
    /// Fail instead of warn on an annotation with no matching relocation.
    #[arg(long)]
    strict_orphans: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let options = Options {
        strict_orphans: cli.strict_orphans,
    };

    match driver::run(&cli.catalog, &cli.input, &cli.output, &options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(errors) => {
            for e in &errors {
                eprintln!("klp-convert: {e}");
            }
            ExitCode::FAILURE
        }
    }
}
